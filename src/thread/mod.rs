//! Ordered dialogue model: alternating IN/OUT messages plus an optional
//! system instruction held separately, with a provider-neutral wire form.

pub mod image;
mod msg;

pub use msg::{
    join_text, ChatContent, ChatMessage, ContentPart, ImageRef, ImageUrlPart, Msg, MsgKind,
};

use serde::{Deserialize, Serialize};

use crate::core::error::AugurError;

/// A sequence of messages alternating between IN ("user") and OUT
/// ("assistant") kinds, with a separately-held INST ("system") message.
///
/// Strict alternation is enforced on add: appending a message of the same
/// kind as the last one merges it into the last (texts joined with
/// `join_sep`, images concatenated).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    msgs: Vec<Msg>,
    /// System instructions, kind INST, empty text when unset
    pub inst: Msg,
    /// Separator used when message text needs to be joined
    #[serde(default = "default_join_sep")]
    pub join_sep: String,
}

fn default_join_sep() -> String {
    "\n".to_string()
}

impl Default for Thread {
    fn default() -> Self {
        Thread::new()
    }
}

impl Thread {
    pub fn new() -> Self {
        Thread {
            msgs: Vec::new(),
            inst: Msg::instruction(""),
            join_sep: default_join_sep(),
        }
    }

    pub fn with_inst(inst_text: impl Into<String>) -> Self {
        let mut thread = Thread::new();
        thread.inst.text = inst_text.into();
        thread
    }

    /// A thread holding a single IN message. An empty text is tolerated
    /// here; the message invariants are re-checked at dispatch time.
    pub fn make_in(in_text: impl Into<String>) -> Self {
        let mut thread = Thread::new();
        thread.msgs.push(Msg::input(in_text));
        thread
    }

    /// A thread with instructions and an IN message.
    pub fn make_inst_in(inst_text: impl Into<String>, in_text: impl Into<String>) -> Self {
        let mut thread = Thread::make_in(in_text);
        thread.inst.text = inst_text.into();
        thread
    }

    /// Build a thread from a plain query string, optionally overriding the
    /// instruction text.
    pub fn ensure(query: impl Into<Thread>, inst: Option<&str>) -> Thread {
        let mut thread = query.into();
        if let Some(inst_text) = inst {
            thread.inst.text = inst_text.to_string();
        }
        thread
    }

    /// Add a message, enforcing alternation. INST messages merge into the
    /// separately-held instruction. Consecutive same-kind messages merge.
    pub fn add(&mut self, msg: Msg) -> Result<(), AugurError> {
        msg.check_valid()?;

        if msg.kind == MsgKind::Inst {
            let sep = self.join_sep.clone();
            self.inst.join_same_kind(msg, &sep);
            return Ok(());
        }

        match self.msgs.last_mut() {
            Some(last) if last.kind == msg.kind => {
                let sep = self.join_sep.clone();
                last.join_same_kind(msg, &sep);
            }
            _ => self.msgs.push(msg),
        }
        Ok(())
    }

    pub fn add_in(&mut self, text: impl Into<String>) -> Result<(), AugurError> {
        self.add(Msg::input(text))
    }

    pub fn add_in_with_images(
        &mut self,
        text: impl Into<String>,
        images: &[&str],
    ) -> Result<(), AugurError> {
        self.add(Msg::input(text).with_images(images)?)
    }

    pub fn add_out(&mut self, text: impl Into<String>) -> Result<(), AugurError> {
        self.add(Msg::output(text))
    }

    /// Append an OUT message followed by an IN message.
    pub fn add_out_in(
        &mut self,
        out_text: impl Into<String>,
        in_text: impl Into<String>,
    ) -> Result<(), AugurError> {
        self.add(Msg::output(out_text))?;
        self.add(Msg::input(in_text))
    }

    /// Append all of another thread's messages into this one.
    pub fn concat(&mut self, other: &Thread) -> Result<(), AugurError> {
        if !other.inst.text.is_empty() {
            self.add(other.inst.clone())?;
        }
        for msg in &other.msgs {
            self.add(msg.clone())?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn msgs(&self) -> &[Msg] {
        &self.msgs
    }

    pub fn get(&self, index: usize) -> Option<&Msg> {
        self.msgs.get(index)
    }

    pub(crate) fn first_mut(&mut self) -> Option<&mut Msg> {
        self.msgs.first_mut()
    }

    pub fn last_kind(&self) -> Option<MsgKind> {
        self.msgs.last().map(|m| m.kind)
    }

    /// Kind of the next message that can be added while alternating.
    pub fn next_kind(&self) -> MsgKind {
        match self.msgs.last() {
            None => MsgKind::In,
            Some(last) => last.kind.flip(),
        }
    }

    /// Can the lowercase text be found in one of the messages?
    /// The instruction message is not scanned.
    pub fn has_text_lower(&self, text_lower: &str) -> bool {
        self.msgs
            .iter()
            .any(|m| m.text.to_lowercase().contains(text_lower))
    }

    pub fn has_images(&self) -> bool {
        self.inst.has_images() || self.msgs.iter().any(|m| m.has_images())
    }

    /// Download any remote image URLs into base64 data: URLs.
    pub fn download_images_as_data(&mut self) -> Result<(), AugurError> {
        self.inst.download_images_as_data()?;
        for msg in &mut self.msgs {
            msg.download_images_as_data()?;
        }
        Ok(())
    }

    pub async fn download_images_as_data_async(&mut self) -> Result<(), AugurError> {
        self.inst.download_images_as_data_async().await?;
        for msg in &mut self.msgs {
            msg.download_images_as_data_async().await?;
        }
        Ok(())
    }

    /// Serialise to the provider-neutral wire form. The instruction message
    /// is included first when set and `include_inst` is true.
    pub fn as_chat_messages(&self, include_inst: bool) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.msgs.len() + 1);
        if include_inst && !self.inst.text.is_empty() {
            out.push(self.inst.as_chat_message());
        }
        for msg in &self.msgs {
            out.push(msg.as_chat_message());
        }
        out
    }

    /// Rebuild a thread from wire-form messages, merging as needed.
    pub fn from_chat_messages(msgs: &[ChatMessage]) -> Result<Thread, AugurError> {
        let mut thread = Thread::new();
        for wire in msgs {
            thread.add(Msg::from_chat_message(wire)?)?;
        }
        Ok(thread)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Msg> {
        self.msgs.iter()
    }
}

impl From<&str> for Thread {
    fn from(query: &str) -> Self {
        Thread::make_in(query)
    }
}

impl From<String> for Thread {
    fn from(query: String) -> Self {
        Thread::make_in(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consecutive_inputs_merge() {
        let mut t = Thread::new();
        t.add_in("first").unwrap();
        t.add_in("second").unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(0).unwrap().text, "first\nsecond");
    }

    #[test]
    fn test_alternation_preserved() {
        let mut t = Thread::make_inst_in("be terse", "question");
        t.add_out("answer").unwrap();
        t.add_in("followup").unwrap();
        assert_eq!(t.len(), 3);
        assert_eq!(t.last_kind(), Some(MsgKind::In));
        assert_eq!(t.next_kind(), MsgKind::Out);
    }

    #[test]
    fn test_inst_merges_separately() {
        let mut t = Thread::with_inst("one");
        t.add(Msg::instruction("two")).unwrap();
        assert_eq!(t.inst.text, "one\ntwo");
        assert!(t.is_empty());
    }

    #[test]
    fn test_wire_round_trip() {
        let mut t = Thread::make_inst_in("sys", "hi");
        t.add_out("hello").unwrap();
        t.add_in("bye").unwrap();

        let wire = t.as_chat_messages(true);
        assert_eq!(wire.len(), 4);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
        assert_eq!(wire[2].role, "assistant");

        let back = Thread::from_chat_messages(&wire).unwrap();
        assert_eq!(back.inst.text, "sys");
        assert_eq!(back.len(), 3);
    }

    #[test]
    fn test_has_text_lower() {
        let t = Thread::make_in("Please output JSON now");
        assert!(t.has_text_lower("json"));
        assert!(!t.has_text_lower("schema"));

        // instruction text is not scanned
        let t = Thread::make_inst_in("output json", "hello");
        assert!(!t.has_text_lower("json"));
    }

    #[test]
    fn test_ensure_from_str() {
        let t = Thread::ensure("what is 2+2?", Some("you are a calculator"));
        assert_eq!(t.len(), 1);
        assert_eq!(t.inst.text, "you are a calculator");
        assert_eq!(t.last_kind(), Some(MsgKind::In));
    }
}
