// File: src/providers/openai.rs
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{json, Value as JsonValue};
use std::sync::OnceLock;
use std::time::Duration;

use crate::core::error::{AugurError, TransportError};
use crate::gen::pipeline::{prepare_gen_out, prepare_gen_thread, RawResponse};
use crate::gen::{GenConf, GenOut, OutFormat};
use crate::providers::{estimate_token_len, Model};
use crate::registry::{ModelEntry, PROVIDER_NAMES};
use crate::thread::Thread;

/// Default char-to-token multiplication factor used when no tokenizer is
/// installed for the model
pub const DEFAULT_TOKEN_ESTIMATION_FACTOR: f64 = 0.4;

/// Default overhead tokens accounted per message
pub const DEFAULT_OVERHEAD_PER_MSG: usize = 3;

const DEFAULT_CTX_LEN: usize = 4096;

/// How a schema-constrained JSON request is shaped for the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonStrategy {
    /// Send the schema as a synthetic forced function via the tools API;
    /// the returned arguments object is the JSON output
    ToolCall,
    /// Pass the schema verbatim inside the response_format field
    SchemaFormat,
}

/// Static description of an OpenAI-compatible provider endpoint.
#[derive(Debug, Clone, Copy)]
pub struct Profile {
    pub provider: &'static str,
    pub default_base_url: &'static str,
    pub env_key: &'static str,
    pub env_base_url: &'static str,
    pub strategy: JsonStrategy,
}

/// Known OpenAI-compatible providers: each is a small factory choosing the
/// request-shaping strategy and endpoint defaults.
pub mod profiles {
    use super::{JsonStrategy, Profile};

    pub const OPENAI: Profile = Profile {
        provider: "openai",
        default_base_url: "https://api.openai.com/v1",
        env_key: "OPENAI_API_KEY",
        env_base_url: "OPENAI_BASE_URL",
        strategy: JsonStrategy::ToolCall,
    };

    pub const MISTRAL: Profile = Profile {
        provider: "mistral",
        default_base_url: "https://api.mistral.ai/v1",
        env_key: "MISTRAL_API_KEY",
        env_base_url: "MISTRAL_BASE_URL",
        strategy: JsonStrategy::ToolCall,
    };

    pub const GROQ: Profile = Profile {
        provider: "groq",
        default_base_url: "https://api.groq.com/openai/v1",
        env_key: "GROQ_API_KEY",
        env_base_url: "GROQ_BASE_URL",
        strategy: JsonStrategy::SchemaFormat,
    };

    pub const FIREWORKS: Profile = Profile {
        provider: "fireworks",
        default_base_url: "https://api.fireworks.ai/inference/v1",
        env_key: "FIREWORKS_API_KEY",
        env_base_url: "FIREWORKS_BASE_URL",
        strategy: JsonStrategy::SchemaFormat,
    };

    pub const TOGETHER: Profile = Profile {
        provider: "together",
        default_base_url: "https://api.together.xyz/v1",
        env_key: "TOGETHER_API_KEY",
        env_base_url: "TOGETHER_BASE_URL",
        strategy: JsonStrategy::SchemaFormat,
    };
}

/// Creation arguments shared by the remote adapters. Unset values fall back
/// to env variables and provider defaults.
#[derive(Debug, Clone, Default)]
pub struct RemoteArgs {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub genconf: Option<GenConf>,
    pub ctx_len: Option<usize>,
    pub max_tokens_limit: Option<usize>,
    pub overhead_per_msg: Option<usize>,
    pub token_estimation_factor: Option<f64>,
}

impl RemoteArgs {
    /// Read the creation args out of a fused registry entry.
    pub fn from_entry(entry: &ModelEntry) -> Self {
        RemoteArgs {
            api_key: entry
                .other
                .get("api_key")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            base_url: entry
                .other
                .get("base_url")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            genconf: entry.genconf.clone(),
            ctx_len: entry.ctx_len,
            max_tokens_limit: entry.max_tokens_limit,
            overhead_per_msg: entry.overhead_per_msg,
            token_estimation_factor: entry.token_estimation_factor,
        }
    }
}

/// Chat-completions adapter for OpenAI-compatible endpoints. The JSON
/// constraint strategy is selected by the provider Profile: tool-calling
/// (openai, mistral) or an inline schema in response_format (fireworks,
/// groq, together). Safe for concurrent use from multiple tasks.
pub struct OpenAiCompatModel {
    profile: Profile,
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
    tokenizer: Option<tiktoken_rs::CoreBPE>,
}

impl OpenAiCompatModel {
    pub fn new(profile: Profile, model_name: &str, args: RemoteArgs) -> Result<Self, AugurError> {
        let api_key = match args.api_key {
            Some(key) => key,
            None => std::env::var(profile.env_key).map_err(|_| TransportError::Auth {
                message: format!("Missing {}", profile.env_key),
                status: None,
                details: None,
            })?,
        };

        let base_url = args
            .base_url
            .or_else(|| std::env::var(profile.env_base_url).ok())
            .unwrap_or_else(|| profile.default_base_url.to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| TransportError::Network {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let ctx_len = args.ctx_len.unwrap_or_else(|| {
            warn!(
                "Model '{}': unknown ctx_len, assuming {}",
                model_name, DEFAULT_CTX_LEN
            );
            DEFAULT_CTX_LEN
        });

        Ok(OpenAiCompatModel {
            profile,
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
            tokenizer: tiktoken_rs::get_bpe_from_model(model_name).ok(),
        })
    }

    pub fn from_entry(profile: Profile, entry: &ModelEntry) -> Result<Self, AugurError> {
        let model_name = entry.name.clone().ok_or_else(|| {
            AugurError::Config(format!("Missing model name for {} entry", profile.provider))
        })?;
        Self::new(profile, &model_name, RemoteArgs::from_entry(entry))
    }

    pub fn openai(model_name: &str, args: RemoteArgs) -> Result<Self, AugurError> {
        Self::new(profiles::OPENAI, model_name, args)
    }

    pub fn mistral(model_name: &str, args: RemoteArgs) -> Result<Self, AugurError> {
        Self::new(profiles::MISTRAL, model_name, args)
    }

    pub fn groq(model_name: &str, args: RemoteArgs) -> Result<Self, AugurError> {
        Self::new(profiles::GROQ, model_name, args)
    }

    pub fn fireworks(model_name: &str, args: RemoteArgs) -> Result<Self, AugurError> {
        Self::new(profiles::FIREWORKS, model_name, args)
    }

    pub fn together(model_name: &str, args: RemoteArgs) -> Result<Self, AugurError> {
        Self::new(profiles::TOGETHER, model_name, args)
    }

    /// Shape the wire request. Pure: both the sync and async surfaces send
    /// the same payload. Returns (payload, whether a forced tool was used).
    fn build_request(
        &self,
        thread: &Thread,
        genconf: &GenConf,
    ) -> Result<(JsonValue, bool), AugurError> {
        let thread = prepare_gen_thread(thread, genconf)?;

        // this endpoint family doesn't require max_tokens but errors on
        // excess, so only resolve and send it when explicitly configured
        let resolved_max_tokens = if genconf.max_tokens != 0 {
            let token_len = self.token_len(&thread, Some(genconf))?;
            self.resolve_genconf_max_tokens(token_len, genconf)?
        } else {
            0
        };

        let messages = serde_json::to_value(thread.as_chat_messages(true))
            .map_err(|e| AugurError::Serialization(e.to_string()))?;

        let mut payload = json!({
            "model": self.model_name,
            "messages": messages,
            "temperature": genconf.temperature,
            "top_p": genconf.top_p,
            "n": 1,
        });
        let obj = payload.as_object_mut().expect("payload is an object");

        // empty stop errors on some endpoints when generating from images
        if !genconf.stop.is_empty() {
            obj.insert("stop".to_string(), json!(genconf.stop));
        }

        let mut used_tools = false;
        if genconf.format == OutFormat::Json {
            match (&genconf.json_schema, self.profile.strategy) {
                (Some(schema), JsonStrategy::ToolCall) => {
                    obj.insert(
                        "tools".to_string(),
                        json!([{
                            "type": "function",
                            "function": {
                                "name": self.output_fn_name(),
                                "parameters": schema,
                            }
                        }]),
                    );
                    obj.insert(
                        "tool_choice".to_string(),
                        json!({
                            "type": "function",
                            "function": {"name": self.output_fn_name()},
                        }),
                    );
                    used_tools = true;
                }
                (Some(schema), JsonStrategy::SchemaFormat) => {
                    obj.insert(
                        "response_format".to_string(),
                        json!({"type": "json_object", "schema": schema}),
                    );
                }
                (None, _) => {
                    obj.insert(
                        "response_format".to_string(),
                        json!({"type": "json_object"}),
                    );
                }
            }
        }

        if resolved_max_tokens > 0 {
            obj.insert("max_tokens".to_string(), json!(resolved_max_tokens));
        }

        // inject model-specific args, if any
        for (k, v) in genconf.resolve_special(self.profile.provider, PROVIDER_NAMES) {
            obj.insert(k, v);
        }

        debug!("{} gen args: {}", self.desc(), payload);
        Ok((payload, used_tools))
    }

    /// Extract the output channel from a chat-completions response body.
    fn parse_response(&self, body: &JsonValue, used_tools: bool, genconf: &GenConf) -> GenOut {
        let choice = &body["choices"][0];
        let finish = choice["finish_reason"].as_str().unwrap_or("");
        let message = &choice["message"];

        let raw = if used_tools {
            match message["tool_calls"].as_array().filter(|c| !c.is_empty()) {
                Some(calls) => {
                    if calls.len() != 1 {
                        warn!(
                            "Expecting a single tool call, received {} - using first",
                            calls.len()
                        );
                    }
                    let function = &calls[0]["function"];
                    if function["name"].as_str() != Some(self.output_fn_name()) {
                        warn!(
                            "Expecting '{}' function name, received '{}'",
                            self.output_fn_name(),
                            function["name"]
                        );
                    }
                    // arguments arrive as a JSON-encoded string
                    RawResponse::Text(function["arguments"].as_str().unwrap_or("").to_string())
                }
                None => {
                    warn!("Expecting tool_calls, none received - using text content");
                    RawResponse::Text(message["content"].as_str().unwrap_or("").to_string())
                }
            }
        } else {
            RawResponse::Text(message["content"].as_str().unwrap_or("").to_string())
        };

        prepare_gen_out(raw, finish, genconf)
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn post_async(&self, payload: &JsonValue) -> Result<JsonValue, AugurError> {
        let resp = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| TransportError::Network {
                message: format!("{} network error: {}", self.profile.provider, e),
            })?;

        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| TransportError::Network {
            message: format!("Failed reading {} response: {}", self.profile.provider, e),
        })?;
        self.decode_body(status, text)
    }

    fn post_blocking(&self, payload: &JsonValue) -> Result<JsonValue, AugurError> {
        let client = self.blocking_client()?;
        let resp = client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .map_err(|e| TransportError::Network {
                message: format!("{} network error: {}", self.profile.provider, e),
            })?;

        let status = resp.status().as_u16();
        let text = resp.text().map_err(|e| TransportError::Network {
            message: format!("Failed reading {} response: {}", self.profile.provider, e),
        })?;
        self.decode_body(status, text)
    }

    fn decode_body(&self, status: u16, text: String) -> Result<JsonValue, AugurError> {
        if !(200..300).contains(&status) {
            return Err(TransportError::from_status(self.profile.provider, status, text).into());
        }
        serde_json::from_str(&text).map_err(|e| {
            TransportError::Network {
                message: format!("Invalid JSON from {}: {}", self.profile.provider, e),
            }
            .into()
        })
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

#[async_trait]
impl Model for OpenAiCompatModel {
    fn gen(&self, thread: &Thread, genconf: Option<&GenConf>) -> Result<GenOut, AugurError> {
        let genconf = self.base_genconf(genconf);
        let (payload, used_tools) = self.build_request(thread, &genconf)?;
        let body = self.post_blocking(&payload)?;
        Ok(self.parse_response(&body, used_tools, &genconf))
    }

    async fn gen_async(
        &self,
        thread: &Thread,
        genconf: Option<&GenConf>,
    ) -> Result<GenOut, AugurError> {
        let genconf = self.base_genconf(genconf);
        let (payload, used_tools) = self.build_request(thread, &genconf)?;
        let body = self.post_async(&payload).await?;
        Ok(self.parse_response(&body, used_tools, &genconf))
    }

    /// Exact when a matching tokenizer is installed for the model name,
    /// otherwise a char-factor upper-bound estimate.
    fn token_len(&self, thread: &Thread, genconf: Option<&GenConf>) -> Result<usize, AugurError> {
        Ok(match &self.tokenizer {
            Some(bpe) => {
                let mut num_tokens = 0;
                if !thread.inst.text.is_empty() {
                    num_tokens += bpe.encode_with_special_tokens(&thread.inst.text).len()
                        + self.overhead_per_msg;
                }
                for msg in thread.iter() {
                    num_tokens +=
                        bpe.encode_with_special_tokens(&msg.text).len() + self.overhead_per_msg;
                    for image in &msg.images {
                        // count the url as payload, an upper bound for url parts
                        num_tokens += bpe.encode_with_special_tokens(&image.url).len();
                    }
                }
                if let Some(schema) = genconf.and_then(|g| g.json_schema.as_ref()) {
                    num_tokens += bpe
                        .encode_with_special_tokens(&schema.to_string())
                        .len();
                }
                num_tokens
            }
            None => estimate_token_len(
                thread,
                genconf,
                self.token_estimation_factor,
                self.overhead_per_msg,
            ),
        })
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
        format!(
            "OpenAiCompatModel[{}] model='{}'",
            self.profile.provider, self.model_name
        )
    }

    fn default_genconf(&self) -> &GenConf {
        &self.genconf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gen::OutFormat;
    use serde_json::json;

    fn model(strategy: JsonStrategy) -> OpenAiCompatModel {
        let profile = Profile {
            provider: "openai",
            default_base_url: "http://localhost:9",
            env_key: "OPENAI_API_KEY",
            env_base_url: "OPENAI_BASE_URL",
            strategy,
        };
        OpenAiCompatModel::new(
            profile,
            "test-model",
            RemoteArgs {
                api_key: Some("test-key".to_string()),
                ctx_len: Some(2048),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_tool_call_request_shape() {
        let m = model(JsonStrategy::ToolCall);
        let thread = Thread::make_in("extract please");
        let schema = json!({"type": "object", "properties": {"a": {"type": "integer"}}});
        let genconf = GenConf::new()
            .with_format(OutFormat::Json)
            .with_json_schema(Some(schema.clone()));

        let (payload, used_tools) = m.build_request(&thread, &genconf).unwrap();
        assert!(used_tools);
        assert_eq!(payload["tools"][0]["function"]["name"], json!("json_out"));
        assert_eq!(payload["tools"][0]["function"]["parameters"], schema);
        assert_eq!(
            payload["tool_choice"]["function"]["name"],
            json!("json_out")
        );
        assert!(payload.get("response_format").is_none());
    }

    #[test]
    fn test_schema_format_request_shape() {
        let m = model(JsonStrategy::SchemaFormat);
        let thread = Thread::make_in("extract please");
        let schema = json!({"type": "object", "properties": {"a": {"type": "integer"}}});
        let genconf = GenConf::new()
            .with_format(OutFormat::Json)
            .with_json_schema(Some(schema.clone()));

        let (payload, used_tools) = m.build_request(&thread, &genconf).unwrap();
        assert!(!used_tools);
        assert_eq!(payload["response_format"]["type"], json!("json_object"));
        assert_eq!(payload["response_format"]["schema"], schema);
        assert!(payload.get("tools").is_none());
    }

    #[test]
    fn test_free_json_request_shape() {
        let m = model(JsonStrategy::ToolCall);
        let thread = Thread::make_in("free json please");
        let genconf = GenConf::new().with_format(OutFormat::Json);

        let (payload, used_tools) = m.build_request(&thread, &genconf).unwrap();
        assert!(!used_tools);
        assert_eq!(payload["response_format"], json!({"type": "json_object"}));
        // prompt instruction appended
        let content = payload["messages"][0]["content"].as_str().unwrap();
        assert!(content.contains("Output JSON."));
    }

    #[test]
    fn test_max_tokens_sent_only_when_configured() {
        let m = model(JsonStrategy::ToolCall);
        let thread = Thread::make_in("hi");

        let (payload, _) = m.build_request(&thread, &GenConf::new()).unwrap();
        assert!(payload.get("max_tokens").is_none());

        let genconf = GenConf::new().with_max_tokens(123);
        let (payload, _) = m.build_request(&thread, &genconf).unwrap();
        assert_eq!(payload["max_tokens"], json!(123));
    }

    #[test]
    fn test_special_args_injected() {
        let m = model(JsonStrategy::ToolCall);
        let thread = Thread::make_in("hi");
        let genconf = GenConf::new()
            .with_special("seed", json!(7))
            .with_special("anthropic", json!({"x": 1}));

        let (payload, _) = m.build_request(&thread, &genconf).unwrap();
        assert_eq!(payload["seed"], json!(7));
        assert!(payload.get("x").is_none());
    }

    #[test]
    fn test_parse_tool_response() {
        let m = model(JsonStrategy::ToolCall);
        let genconf = GenConf::new()
            .with_format(OutFormat::Json)
            .with_json_schema(Some(json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}},
                "required": ["a"]
            })));
        let body = json!({
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "tool_calls": [{
                        "function": {
                            "name": "json_out",
                            "arguments": "{\"a\": 3}"
                        }
                    }]
                }
            }]
        });
        let out = m.parse_response(&body, true, &genconf);
        assert_eq!(out.res, crate::gen::GenRes::OkStop);
        assert_eq!(out.dic, Some(json!({"a": 3})));
    }

    #[test]
    fn test_token_len_estimation_is_positive() {
        let m = model(JsonStrategy::ToolCall);
        let thread = Thread::make_inst_in("sys", "a question");
        let n = m.token_len(&thread, None).unwrap();
        assert!(n > 0);
    }
}
