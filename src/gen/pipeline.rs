//! Shared generation pipeline steps: thread preparation before dispatch and
//! response cleanup/parse/validate after dispatch. Used by every adapter.

use log::debug;
use serde_json::Value as JsonValue;

use crate::core::error::AugurError;
use crate::gen::{GenConf, GenOut, GenRes, OutFormat};
use crate::thread::{join_text, MsgKind, Thread};

/// Instruction appended to the first message when the thread doesn't already
/// ask for JSON output.
struct JsonInstructor {
    /// Skip appending when all of these lowercase tokens appear in the thread
    bypass_if: &'static [&'static str],
    append_text: &'static str,
    /// Number of thread separators joining the appended text
    sep_count: usize,
}

const JSON_INSTRUCTOR: JsonInstructor = JsonInstructor {
    bypass_if: &["json"],
    append_text: "Output JSON.",
    sep_count: 2,
};

const JSON_SCHEMA_INSTRUCTOR: JsonInstructor = JsonInstructor {
    bypass_if: &["json", "schema"],
    append_text: "Output JSON matching the following schema:\n{{json_schema}}",
    sep_count: 2,
};

/// Validate and prepare a thread for generation. Returns a clone: when JSON
/// output is requested and the thread doesn't already mention it, the
/// applicable instruction is appended to the first message.
pub fn prepare_gen_thread(thread: &Thread, genconf: &GenConf) -> Result<Thread, AugurError> {
    if thread.is_empty() {
        return Err(AugurError::Thread(
            "Cannot generate from an empty thread".to_string(),
        ));
    }
    if thread.last_kind() != Some(MsgKind::In) {
        return Err(AugurError::Thread(
            "Thread must end with an IN message to generate".to_string(),
        ));
    }
    for msg in thread.iter() {
        msg.check_valid()?;
    }

    let mut thread = thread.clone();

    if genconf.format == OutFormat::Json {
        let inst = if genconf.json_schema.is_none() {
            &JSON_INSTRUCTOR
        } else {
            &JSON_SCHEMA_INSTRUCTOR
        };

        let bypass = inst.bypass_if.iter().all(|t| thread.has_text_lower(t));
        if !bypass {
            let mut text = inst.append_text.to_string();
            if let Some(schema) = &genconf.json_schema {
                // tight serialisation, non-ASCII kept as-is
                let sc = serde_json::to_string(schema)
                    .map_err(|e| AugurError::Serialization(e.to_string()))?;
                text = text.replace("{{json_schema}}", &sc);
            }

            let sep = thread.join_sep.repeat(inst.sep_count);
            if let Some(first) = thread.first_mut() {
                first.text = join_text(&first.text, &text, &sep);
            }
            debug!(
                "Appended {} instruction to first message",
                if genconf.json_schema.is_none() {
                    "json"
                } else {
                    "json_schema"
                }
            );
        }
    }

    Ok(thread)
}

/// Raw model response as received from a provider: either a text channel or
/// an already-structured JSON value (tool-call arguments).
#[derive(Debug, Clone)]
pub enum RawResponse {
    Text(String),
    Json(JsonValue),
}

/// Common post-generation steps: cleanup, JSON parse, schema validation.
/// Never fails - problems are reported in the returned GenOut's res kind.
pub fn prepare_gen_out(response: RawResponse, finish: &str, genconf: &GenConf) -> GenOut {
    debug!("Response finish='{}'", finish);

    if genconf.format != OutFormat::Json {
        let text = match response {
            RawResponse::Text(s) => s.trim().to_string(),
            RawResponse::Json(v) => v.to_string(),
        };
        return GenOut::new(GenRes::from_finish_reason(finish), text);
    }

    // JSON mode
    let (text, parsed) = match response {
        RawResponse::Json(v) => (v.to_string(), Ok(v)),
        RawResponse::Text(s) => {
            let cleaned = cleanup_json_text(&s);
            let parsed = serde_json::from_str::<JsonValue>(&cleaned);
            (cleaned, parsed)
        }
    };

    let dic = match parsed {
        Ok(dic) => dic,
        Err(err) => {
            return GenOut::new(
                GenRes::from_finish_reason("!json"),
                format!("'{}' {}", err, text),
            );
        }
    };

    if let Some(schema) = &genconf.json_schema {
        let compiled = match jsonschema::JSONSchema::compile(schema) {
            Ok(compiled) => compiled,
            Err(err) => {
                return GenOut::new(
                    GenRes::from_finish_reason("!json_schema_error"),
                    format!("'{}' {}", err, text),
                )
                .with_dic(dic);
            }
        };
        let failure = match compiled.validate(&dic) {
            Ok(()) => None,
            Err(mut errors) => Some(
                errors
                    .next()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "validation failed".to_string()),
            ),
        };
        if let Some(message) = failure {
            return GenOut::new(
                GenRes::from_finish_reason("!json_schema_val"),
                format!("'{}' {}", message, text),
            )
            .with_dic(dic);
        }
    }

    GenOut::new(GenRes::from_finish_reason(finish), text).with_dic(dic)
}

/// Strip whitespace, decode unicode escapes if present, and trim any
/// chit-chat before the first '{' and after the last '}'.
fn cleanup_json_text(text: &str) -> String {
    let mut out = text.trim().to_string();

    if out.contains("\\u") {
        out = decode_unicode_escapes(&out);
    }

    if let Some(begin) = out.find('{') {
        if begin > 0 {
            out = out[begin..].to_string();
        }
    }
    if let Some(end) = out.rfind('}') {
        if end > 0 {
            out.truncate(end + 1);
        }
    }
    out
}

/// Decode \uXXXX escape sequences (including surrogate pairs) that some
/// models emit in the raw text channel. Malformed sequences are kept as-is.
fn decode_unicode_escapes(text: &str) -> String {
    fn hex4(chars: &[char]) -> Option<u32> {
        if chars.len() < 4 {
            return None;
        }
        let s: String = chars[..4].iter().collect();
        u32::from_str_radix(&s, 16).ok()
    }

    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' && i + 1 < chars.len() && chars[i + 1] == 'u' {
            if let Some(code) = hex4(&chars[i + 2..]) {
                // high surrogate followed by \uDC00..\uDFFF low surrogate
                if (0xD800..0xDC00).contains(&code)
                    && i + 11 < chars.len()
                    && chars[i + 6] == '\\'
                    && chars[i + 7] == 'u'
                {
                    if let Some(low) = hex4(&chars[i + 8..]) {
                        if (0xDC00..0xE000).contains(&low) {
                            let combined =
                                0x10000 + ((code - 0xD800) << 10) + (low - 0xDC00);
                            if let Some(c) = char::from_u32(combined) {
                                out.push(c);
                                i += 12;
                                continue;
                            }
                        }
                    }
                } else if let Some(c) = char::from_u32(code) {
                    out.push(c);
                    i += 6;
                    continue;
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}
