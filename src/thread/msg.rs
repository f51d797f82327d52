use serde::{Deserialize, Serialize};

use crate::core::error::AugurError;
use crate::thread::image;

/// Kinds of messages in a Thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MsgKind {
    /// Input message, from user
    In,
    /// Model output message
    Out,
    /// Initial model instructions
    Inst,
}

impl MsgKind {
    /// Role name used in the provider-neutral wire form
    pub fn as_chat_role(self) -> &'static str {
        match self {
            MsgKind::In => "user",
            MsgKind::Out => "assistant",
            MsgKind::Inst => "system",
        }
    }

    pub fn from_chat_role(role: &str) -> Result<Self, AugurError> {
        match role {
            "user" => Ok(MsgKind::In),
            "assistant" => Ok(MsgKind::Out),
            "system" => Ok(MsgKind::Inst),
            _ => Err(AugurError::Thread(format!("Unknown chat role '{}'", role))),
        }
    }

    /// The kind that alternation expects after this one
    pub fn flip(self) -> Self {
        match self {
            MsgKind::In => MsgKind::Out,
            _ => MsgKind::In,
        }
    }
}

/// An image attached to a message. The url is either a remote http(s) URL or
/// a self-contained base64 data: URL - local file paths are materialised into
/// data: URLs when attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
}

impl ImageRef {
    /// Build from a remote URL, a data: URL or a local file path.
    /// Local paths are eagerly loaded and encoded as data: URLs.
    pub fn from_spec(spec: &str) -> Result<Self, AugurError> {
        let url = if image::is_url(spec) {
            spec.to_string()
        } else {
            image::load_image_as_data_url(spec)?
        };
        Ok(ImageRef { url })
    }

    pub fn is_data_url(&self) -> bool {
        self.url.starts_with("data:")
    }

    /// Replace a remote URL with a downloaded base64 data: URL.
    pub fn download_as_data(&mut self) -> Result<(), AugurError> {
        if !self.is_data_url() {
            self.url = image::download_as_data_url(&self.url)?;
        }
        Ok(())
    }

    pub async fn download_as_data_async(&mut self) -> Result<(), AugurError> {
        if !self.is_data_url() {
            self.url = image::download_as_data_url_async(&self.url).await?;
        }
        Ok(())
    }
}

/// A single dialogue message: kind, text and optional ordered images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Msg {
    pub kind: MsgKind,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,
}

impl Msg {
    pub fn new(kind: MsgKind, text: impl Into<String>) -> Self {
        Msg {
            kind,
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn input(text: impl Into<String>) -> Self {
        Msg::new(MsgKind::In, text)
    }

    pub fn output(text: impl Into<String>) -> Self {
        Msg::new(MsgKind::Out, text)
    }

    pub fn instruction(text: impl Into<String>) -> Self {
        Msg::new(MsgKind::Inst, text)
    }

    /// Attach images given as remote URLs, data: URLs or local file paths.
    pub fn with_images(mut self, specs: &[&str]) -> Result<Self, AugurError> {
        for spec in specs {
            self.images.push(ImageRef::from_spec(spec)?);
        }
        Ok(self)
    }

    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }

    /// A message's text may be empty only if it carries at least one image.
    pub fn check_valid(&self) -> Result<(), AugurError> {
        if self.text.is_empty() && self.images.is_empty() && self.kind != MsgKind::Inst {
            return Err(AugurError::Thread(
                "Message text can only be empty when it carries at least one image".to_string(),
            ));
        }
        Ok(())
    }

    /// Merge another message of the same kind into this one: texts joined
    /// with join_sep, images concatenated.
    pub fn join_same_kind(&mut self, other: Msg, join_sep: &str) {
        debug_assert_eq!(self.kind, other.kind);
        self.text = join_text(&self.text, &other.text, join_sep);
        self.images.extend(other.images);
    }

    pub fn download_images_as_data(&mut self) -> Result<(), AugurError> {
        for image in &mut self.images {
            image.download_as_data()?;
        }
        Ok(())
    }

    pub async fn download_images_as_data_async(&mut self) -> Result<(), AugurError> {
        for image in &mut self.images {
            image.download_as_data_async().await?;
        }
        Ok(())
    }

    /// Serialise to the provider-neutral role-tagged wire form.
    pub fn as_chat_message(&self) -> ChatMessage {
        let content = if self.images.is_empty() {
            ChatContent::Text(self.text.clone())
        } else {
            let mut parts = Vec::new();
            if !self.text.is_empty() {
                parts.push(ContentPart::Text {
                    text: self.text.clone(),
                });
            }
            for image in &self.images {
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrlPart {
                        url: image.url.clone(),
                    },
                });
            }
            ChatContent::Parts(parts)
        };
        ChatMessage {
            role: self.kind.as_chat_role().to_string(),
            content,
        }
    }

    pub fn from_chat_message(msg: &ChatMessage) -> Result<Self, AugurError> {
        let kind = MsgKind::from_chat_role(&msg.role)?;
        match &msg.content {
            ChatContent::Text(text) => Ok(Msg::new(kind, text.clone())),
            ChatContent::Parts(parts) => {
                let mut out = Msg::new(kind, "");
                for part in parts {
                    match part {
                        ContentPart::Text { text } => {
                            out.text = join_text(&out.text, text, "\n");
                        }
                        ContentPart::ImageUrl { image_url } => out.images.push(ImageRef {
                            url: image_url.url.clone(),
                        }),
                    }
                }
                Ok(out)
            }
        }
    }
}

/// Join two text fragments with a separator, skipping empty sides.
pub fn join_text(a: &str, b: &str, sep: &str) -> String {
    if a.is_empty() {
        b.to_string()
    } else if b.is_empty() {
        a.to_string()
    } else {
        format!("{}{}{}", a, sep, b)
    }
}

// ============================================ provider-neutral wire form

/// Role-tagged message as sent on the wire: role in {system,user,assistant},
/// content either a plain string or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: ChatContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrlPart },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrlPart {
    pub url: String,
}
