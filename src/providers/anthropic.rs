// File: src/providers/anthropic.rs
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{json, Value as JsonValue};
use std::sync::OnceLock;
use std::time::Duration;

use crate::core::error::{AugurError, TransportError};
use crate::gen::pipeline::{prepare_gen_out, prepare_gen_thread, RawResponse};
use crate::gen::{GenConf, GenOut, OutFormat};
use crate::providers::openai::{
    RemoteArgs, DEFAULT_OVERHEAD_PER_MSG, DEFAULT_TOKEN_ESTIMATION_FACTOR,
};
use crate::providers::{estimate_token_len, Model};
use crate::registry::{ModelEntry, PROVIDER_NAMES};
use crate::thread::{image, Thread};

const PROVIDER_NAME: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_CTX_LEN: usize = 200000;

/// Anthropic Messages API adapter. A schema-constrained request is sent as a
/// forced tool use; free JSON uses an assistant '{' prefill which is
/// re-prepended to the completion before parsing. Safe for concurrent use
/// from multiple tasks.
pub struct AnthropicModel {
    model_name: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    blocking: OnceLock<reqwest::blocking::Client>,
    genconf: GenConf,
    ctx_len: usize,
    max_tokens_limit: usize,
    overhead_per_msg: usize,
    token_estimation_factor: f64,
}

impl AnthropicModel {
    pub fn new(model_name: &str, args: RemoteArgs) -> Result<Self, AugurError> {
        let api_key = match args.api_key {
            Some(key) => key,
            None => std::env::var("ANTHROPIC_API_KEY").map_err(|_| TransportError::Auth {
                message: "Missing ANTHROPIC_API_KEY".to_string(),
                status: None,
                details: None,
            })?,
        };

        let base_url = args
            .base_url
            .or_else(|| std::env::var("ANTHROPIC_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| TransportError::Network {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let ctx_len = args.ctx_len.unwrap_or(DEFAULT_CTX_LEN);

        Ok(AnthropicModel {
            model_name: model_name.to_string(),
            api_key,
            base_url,
            client,
            blocking: OnceLock::new(),
            genconf: args.genconf.unwrap_or_default(),
            ctx_len,
            max_tokens_limit: args.max_tokens_limit.unwrap_or(ctx_len).min(ctx_len),
            overhead_per_msg: args.overhead_per_msg.unwrap_or(DEFAULT_OVERHEAD_PER_MSG),
            token_estimation_factor: args
                .token_estimation_factor
                .unwrap_or(DEFAULT_TOKEN_ESTIMATION_FACTOR),
        })
    }

    pub fn from_entry(entry: &ModelEntry) -> Result<Self, AugurError> {
        let model_name = entry
            .name
            .clone()
            .ok_or_else(|| AugurError::Config("Missing model name for anthropic entry".to_string()))?;
        Self::new(&model_name, RemoteArgs::from_entry(entry))
    }

    /// Messages in Anthropic's wire shape. Images must already be inlined
    /// base64 data: URLs; they are rewritten into source blocks.
    fn build_messages(&self, thread: &Thread) -> Result<Vec<JsonValue>, AugurError> {
        let mut out = Vec::new();
        for msg in thread.iter() {
            let mut content: Vec<JsonValue> = Vec::new();
            if !msg.text.is_empty() {
                content.push(json!({"type": "text", "text": msg.text}));
            }
            for img in &msg.images {
                let (media_type, data) = image::split_data_url(&img.url)?;
                content.push(json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": media_type,
                        "data": data,
                    }
                }));
            }
            if content.is_empty() {
                content.push(json!({"type": "text", "text": ""}));
            }
            out.push(json!({"role": msg.kind.as_chat_role(), "content": content}));
        }
        Ok(out)
    }

    /// Shape the wire request. The thread must be prepared and its images
    /// already downloaded. Returns (payload, whether a forced tool was
    /// used).
    fn build_request(
        &self,
        thread: &Thread,
        genconf: &GenConf,
    ) -> Result<(JsonValue, bool), AugurError> {
        // this endpoint requires max_tokens but doesn't error on excess, and
        // token length is only an estimate here: allow all available output
        let resolved_max_tokens = self.resolve_genconf_max_tokens(0, genconf)?;

        let mut messages = self.build_messages(thread)?;

        let mut used_tools = false;
        let mut tools_kwargs: Vec<(String, JsonValue)> = Vec::new();
        if genconf.format == OutFormat::Json {
            if let Some(schema) = &genconf.json_schema {
                tools_kwargs.push((
                    "tools".to_string(),
                    json!([{
                        "name": self.output_fn_name(),
                        "input_schema": schema,
                    }]),
                ));
                tools_kwargs.push((
                    "tool_choice".to_string(),
                    json!({"type": "tool", "name": self.output_fn_name()}),
                ));
                used_tools = true;
            } else {
                // free-JSON request: prefill with a partial assistant message
                messages.push(json!({"role": "assistant", "content": "{"}));
            }
        }

        let mut payload = json!({
            "model": self.model_name,
            "messages": messages,
            "max_tokens": resolved_max_tokens,
            "temperature": genconf.temperature,
            "top_p": genconf.top_p,
        });
        let obj = payload.as_object_mut().expect("payload is an object");

        if !genconf.stop.is_empty() {
            obj.insert("stop_sequences".to_string(), json!(genconf.stop));
        }
        if !thread.inst.text.is_empty() {
            obj.insert("system".to_string(), json!(thread.inst.text));
        }
        for (k, v) in tools_kwargs {
            obj.insert(k, v);
        }

        // inject model-specific args, if any
        for (k, v) in genconf.resolve_special(PROVIDER_NAME, PROVIDER_NAMES) {
            obj.insert(k, v);
        }

        debug!("{} gen args: {}", self.desc(), payload);
        Ok((payload, used_tools))
    }

    fn parse_response(&self, body: &JsonValue, used_tools: bool, genconf: &GenConf) -> GenOut {
        let finish = if body["stop_reason"].as_str() == Some("max_tokens") {
            "length"
        } else {
            "stop"
        };

        let mut raw = RawResponse::Text(String::new());
        if let Some(blocks) = body["content"].as_array() {
            for block in blocks {
                match block["type"].as_str() {
                    Some("tool_use") if used_tools => {
                        if block["name"].as_str() != Some(self.output_fn_name()) {
                            warn!(
                                "Expecting '{}' tool name, received '{}'",
                                self.output_fn_name(),
                                block["name"]
                            );
                        }
                        raw = RawResponse::Json(block["input"].clone());
                        break;
                    }
                    Some("text") => {
                        let text = block["text"].as_str().unwrap_or("").to_string();
                        raw = if genconf.format == OutFormat::Json && !used_tools {
                            // re-prepend the prefill
                            RawResponse::Text(format!("{{{}", text))
                        } else {
                            RawResponse::Text(text)
                        };
                        break;
                    }
                    _ => {}
                }
            }
        }

        prepare_gen_out(raw, finish, genconf)
    }

    fn url(&self) -> String {
        format!("{}/messages", self.base_url.trim_end_matches('/'))
    }

    async fn post_async(&self, payload: &JsonValue) -> Result<JsonValue, AugurError> {
        let resp = self
            .client
            .post(self.url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| TransportError::Network {
                message: format!("Anthropic network error: {}", e),
            })?;

        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| TransportError::Network {
            message: format!("Failed reading Anthropic response: {}", e),
        })?;
        decode_body(status, text)
    }

    fn post_blocking(&self, payload: &JsonValue) -> Result<JsonValue, AugurError> {
        let client = self.blocking_client()?;
        let resp = client
            .post(self.url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .map_err(|e| TransportError::Network {
                message: format!("Anthropic network error: {}", e),
            })?;

        let status = resp.status().as_u16();
        let text = resp.text().map_err(|e| TransportError::Network {
            message: format!("Failed reading Anthropic response: {}", e),
        })?;
        decode_body(status, text)
    }

    fn blocking_client(&self) -> Result<&reqwest::blocking::Client, AugurError> {
        if self.blocking.get().is_none() {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .map_err(|e| TransportError::Network {
                    message: format!("Failed to create HTTP client: {}", e),
                })?;
            let _ = self.blocking.set(client);
        }
        Ok(self.blocking.get().expect("just initialised"))
    }
}

fn decode_body(status: u16, text: String) -> Result<JsonValue, AugurError> {
    if !(200..300).contains(&status) {
        return Err(TransportError::from_status(PROVIDER_NAME, status, text).into());
    }
    serde_json::from_str(&text).map_err(|e| {
        TransportError::Network {
            message: format!("Invalid JSON from Anthropic: {}", e),
        }
        .into()
    })
}

#[async_trait]
impl Model for AnthropicModel {
    fn gen(&self, thread: &Thread, genconf: Option<&GenConf>) -> Result<GenOut, AugurError> {
        let genconf = self.base_genconf(genconf);
        let mut prepared = prepare_gen_thread(thread, &genconf)?;
        if prepared.has_images() {
            prepared.download_images_as_data()?;
        }
        let (payload, used_tools) = self.build_request(&prepared, &genconf)?;
        let body = self.post_blocking(&payload)?;
        Ok(self.parse_response(&body, used_tools, &genconf))
    }

    async fn gen_async(
        &self,
        thread: &Thread,
        genconf: Option<&GenConf>,
    ) -> Result<GenOut, AugurError> {
        let genconf = self.base_genconf(genconf);
        let mut prepared = prepare_gen_thread(thread, &genconf)?;
        if prepared.has_images() {
            prepared.download_images_as_data_async().await?;
        }
        let (payload, used_tools) = self.build_request(&prepared, &genconf)?;
        let body = self.post_async(&payload).await?;
        Ok(self.parse_response(&body, used_tools, &genconf))
    }

    /// Upper-bound estimate: no public tokenizer is installed for these
    /// models.
    fn token_len(&self, thread: &Thread, genconf: Option<&GenConf>) -> Result<usize, AugurError> {
        Ok(estimate_token_len(
            thread,
            genconf,
            self.token_estimation_factor,
            self.overhead_per_msg,
        ))
    }

    fn ctx_len(&self) -> usize {
        self.ctx_len
    }

    fn max_tokens_limit(&self) -> usize {
        self.max_tokens_limit
    }

    fn name(&self) -> String {
        self.model_name.clone()
    }

    fn desc(&self) -> String {
        format!("AnthropicModel model='{}'", self.model_name)
    }

    fn default_genconf(&self) -> &GenConf {
        &self.genconf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gen::GenRes;
    use serde_json::json;

    fn model() -> AnthropicModel {
        AnthropicModel::new(
            "claude-test",
            RemoteArgs {
                api_key: Some("test-key".to_string()),
                ctx_len: Some(8192),
                max_tokens_limit: Some(4096),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_free_json_prefill() {
        let m = model();
        let thread = prepare_gen_thread(
            &Thread::make_in("count to 3"),
            &GenConf::new().with_format(OutFormat::Json),
        )
        .unwrap();
        let genconf = GenConf::new().with_format(OutFormat::Json);
        let (payload, used_tools) = m.build_request(&thread, &genconf).unwrap();
        assert!(!used_tools);
        let messages = payload["messages"].as_array().unwrap();
        let last = messages.last().unwrap();
        assert_eq!(last["role"], json!("assistant"));
        assert_eq!(last["content"], json!("{"));
    }

    #[test]
    fn test_schema_uses_forced_tool() {
        let m = model();
        let schema = json!({"type": "object", "properties": {"a": {"type": "integer"}}});
        let genconf = GenConf::new()
            .with_format(OutFormat::Json)
            .with_json_schema(Some(schema.clone()));
        let thread = prepare_gen_thread(&Thread::make_in("extract"), &genconf).unwrap();
        let (payload, used_tools) = m.build_request(&thread, &genconf).unwrap();
        assert!(used_tools);
        assert_eq!(payload["tools"][0]["name"], json!("json_out"));
        assert_eq!(payload["tools"][0]["input_schema"], schema);
        assert_eq!(payload["tool_choice"]["type"], json!("tool"));
        // no prefill message added
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.last().unwrap()["role"], json!("user"));
    }

    #[test]
    fn test_max_tokens_always_sent() {
        let m = model();
        let thread = Thread::make_in("hi");
        let (payload, _) = m.build_request(&thread, &GenConf::new()).unwrap();
        // all available output, clamped to the output cap
        assert_eq!(payload["max_tokens"], json!(4096));
    }

    #[test]
    fn test_system_from_inst() {
        let m = model();
        let thread = Thread::make_inst_in("be brief", "hi");
        let (payload, _) = m.build_request(&thread, &GenConf::new()).unwrap();
        assert_eq!(payload["system"], json!("be brief"));
        // system not duplicated in messages
        assert_eq!(payload["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_prefill_response() {
        let m = model();
        let genconf = GenConf::new().with_format(OutFormat::Json);
        let body = json!({
            "stop_reason": "end_turn",
            "content": [{"type": "text", "text": "\"a\": 1}"}]
        });
        let out = m.parse_response(&body, false, &genconf);
        assert_eq!(out.res, GenRes::OkStop);
        assert_eq!(out.dic, Some(json!({"a": 1})));
    }

    #[test]
    fn test_parse_tool_use_response() {
        let m = model();
        let genconf = GenConf::new()
            .with_format(OutFormat::Json)
            .with_json_schema(Some(json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}},
                "required": ["a"]
            })));
        let body = json!({
            "stop_reason": "tool_use",
            "content": [{"type": "tool_use", "name": "json_out", "input": {"a": 7}}]
        });
        let out = m.parse_response(&body, true, &genconf);
        assert_eq!(out.res, GenRes::OkStop);
        assert_eq!(out.dic, Some(json!({"a": 7})));
    }

    #[test]
    fn test_parse_length_stop() {
        let m = model();
        let body = json!({
            "stop_reason": "max_tokens",
            "content": [{"type": "text", "text": "partial"}]
        });
        let out = m.parse_response(&body, false, &GenConf::new());
        assert_eq!(out.res, GenRes::OkLength);
    }

    #[test]
    fn test_image_rewritten_to_source_block() {
        let m = model();
        let mut thread = Thread::new();
        thread
            .add_in_with_images("look", &["data:image/png;base64,QUJD"])
            .unwrap();
        let messages = m.build_messages(&thread).unwrap();
        let content = messages[0]["content"].as_array().unwrap();
        assert_eq!(content[1]["type"], json!("image"));
        assert_eq!(content[1]["source"]["type"], json!("base64"));
        assert_eq!(content[1]["source"]["media_type"], json!("image/png"));
        assert_eq!(content[1]["source"]["data"], json!("QUJD"));
    }
}
