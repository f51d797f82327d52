// File: src/providers/llamacpp.rs
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{json, Value as JsonValue};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use crate::core::error::{AugurError, TransportError};
use crate::gen::pipeline::{prepare_gen_out, prepare_gen_thread, RawResponse};
use crate::gen::{GenConf, GenOut, OutFormat};
use crate::grammar::{gbnf_from_json_schema, JSON_GBNF};
use crate::providers::Model;
use crate::registry::{ModelEntry, Registry, PROVIDER_NAMES};
use crate::thread::{ChatContent, ContentPart, Thread};

const PROVIDER_NAME: &str = "llamacpp";
const DEFAULT_BASE_URL: &str = "http://localhost:8080";
const DEFAULT_CTX_LEN: usize = 2048;

/// Creation arguments for a local llama.cpp server model.
#[derive(Debug, Clone, Default)]
pub struct LocalArgs {
    /// llama.cpp server location, default http://localhost:8080
    pub base_url: Option<String>,
    /// Chat-template format name; when unset the format is searched in
    /// files co-located with the model, then pattern-matched in the registry
    pub format: Option<String>,
    pub genconf: Option<GenConf>,
    pub ctx_len: Option<usize>,
    /// Special-token substitutions available to the chat template
    pub bos_token: Option<String>,
    pub eos_token: Option<String>,
}

/// Local llama.cpp server adapter with grammar-constrained JSON decoding:
/// the thread is rendered through the model's chat template and sent to
/// /completion with a GBNF grammar compiled from the schema. Token length is
/// measured exactly via the server's /tokenize.
///
/// NOT safe for concurrent use: a single in-flight generation holds the
/// engine's KV cache, so callers must serialise.
pub struct LlamaCppModel {
    model_path: PathBuf,
    base_url: String,
    format_name: String,
    template_src: String,
    bos_token: String,
    eos_token: String,
    client: reqwest::Client,
    blocking: OnceLock<reqwest::blocking::Client>,
    genconf: GenConf,
    ctx_len: usize,
}

impl LlamaCppModel {
    pub fn new(registry: &Registry, path: &str, args: LocalArgs) -> Result<Self, AugurError> {
        let model_path = registry
            .locate_file(path)
            .unwrap_or_else(|| PathBuf::from(path));

        let (format_name, entry) = match &args.format {
            Some(name) => registry.get_format_entry(name).ok_or_else(|| {
                AugurError::Registry(format!("Unknown chat template format '{}'", name))
            })?,
            None => registry
                .find_format_for_model_file(&model_path)
                .ok_or_else(|| {
                    AugurError::Config(format!(
                        "Cannot find a chat template format for model '{}': \
                         pass a format name or add a matching formats.json entry",
                        model_path.display()
                    ))
                })?,
        };

        // surface template syntax errors at construction
        let mut env = minijinja::Environment::new();
        env.add_template("chat", &entry.template)
            .map_err(|e| AugurError::Template(format!("Bad chat template: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300)) // local servers can be slow on first load
            .build()
            .map_err(|e| TransportError::Network {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let ctx_len = args
            .ctx_len
            .or_else(|| registry.provider_defaults(PROVIDER_NAME).ctx_len)
            .unwrap_or(DEFAULT_CTX_LEN);

        Ok(LlamaCppModel {
            model_path,
            base_url: args
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            format_name,
            template_src: entry.template,
            bos_token: args.bos_token.unwrap_or_default(),
            eos_token: args.eos_token.unwrap_or_default(),
            client,
            blocking: OnceLock::new(),
            genconf: args.genconf.unwrap_or_default(),
            ctx_len,
        })
    }

    pub fn from_entry(registry: &Registry, entry: &ModelEntry) -> Result<Self, AugurError> {
        let path = entry
            .name
            .clone()
            .ok_or_else(|| AugurError::Config("Missing model name for llamacpp entry".to_string()))?;
        let str_arg = |key: &str| {
            entry
                .other
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        let args = LocalArgs {
            base_url: str_arg("base_url"),
            format: entry.format.clone(),
            genconf: entry.genconf.clone(),
            ctx_len: entry.ctx_len,
            bos_token: str_arg("bos_token"),
            eos_token: str_arg("eos_token"),
        };
        Self::new(registry, &path, args)
    }

    pub fn format_name(&self) -> &str {
        &self.format_name
    }

    /// Render the thread through the chat template into the raw prompt.
    fn render_prompt(&self, thread: &Thread) -> Result<String, AugurError> {
        let messages: Vec<JsonValue> = thread
            .as_chat_messages(true)
            .into_iter()
            .map(|m| {
                let content = match m.content {
                    ChatContent::Text(text) => text,
                    ChatContent::Parts(parts) => {
                        let mut text = String::new();
                        for part in parts {
                            match part {
                                ContentPart::Text { text: t } => {
                                    if !text.is_empty() {
                                        text.push('\n');
                                    }
                                    text.push_str(&t);
                                }
                                ContentPart::ImageUrl { .. } => {
                                    warn!("Image input not supported by this model, skipping");
                                }
                            }
                        }
                        text
                    }
                };
                json!({"role": m.role, "content": content})
            })
            .collect();

        let mut env = minijinja::Environment::new();
        env.add_template("chat", &self.template_src)
            .map_err(|e| AugurError::Template(format!("Bad chat template: {}", e)))?;
        let template = env
            .get_template("chat")
            .map_err(|e| AugurError::Template(e.to_string()))?;

        template
            .render(minijinja::context! {
                messages => minijinja::Value::from_serialize(&messages),
                add_generation_prompt => true,
                bos_token => self.bos_token,
                eos_token => self.eos_token,
            })
            .map_err(|e| AugurError::Template(format!("Chat template render error: {}", e)))
    }

    /// Shape the /completion payload. Pure: both surfaces send the same
    /// payload.
    fn shape_payload(
        &self,
        prompt: &str,
        input_len: usize,
        genconf: &GenConf,
    ) -> Result<JsonValue, AugurError> {
        let resolved_max_tokens = self.resolve_genconf_max_tokens(input_len, genconf)?;

        let mut payload = json!({
            "prompt": prompt,
            "n_predict": resolved_max_tokens,
            "temperature": genconf.temperature,
            "top_p": genconf.top_p,
        });
        let obj = payload.as_object_mut().expect("payload is an object");

        if !genconf.stop.is_empty() {
            obj.insert("stop".to_string(), json!(genconf.stop));
        }

        if genconf.format == OutFormat::Json {
            let grammar = match &genconf.json_schema {
                Some(schema) => {
                    let g = gbnf_from_json_schema(schema)?;
                    debug!("JSON schema GBNF grammar:\n\u{2588}{}\u{2588}", g);
                    g
                }
                None => JSON_GBNF.to_string(),
            };
            obj.insert("grammar".to_string(), json!(grammar));
        }

        // inject model-specific args, if any
        for (k, v) in genconf.resolve_special(PROVIDER_NAME, PROVIDER_NAMES) {
            obj.insert(k, v);
        }

        debug!("{} gen args: {}", self.desc(), payload);
        Ok(payload)
    }

    fn parse_response(&self, body: &JsonValue, genconf: &GenConf) -> GenOut {
        let content = body["content"].as_str().unwrap_or("").to_string();
        let finish = if body["stopped_limit"].as_bool() == Some(true) {
            "length"
        } else {
            "stop"
        };
        prepare_gen_out(RawResponse::Text(content), finish, genconf)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn tokenize_blocking(&self, text: &str) -> Result<usize, AugurError> {
        let client = self.blocking_client()?;
        let resp = client
            .post(self.endpoint("tokenize"))
            .json(&json!({"content": text}))
            .send()
            .map_err(|e| TransportError::Network {
                message: format!("llama.cpp server tokenize error: {}", e),
            })?;
        let status = resp.status().as_u16();
        let text = resp.text().map_err(|e| TransportError::Network {
            message: format!("Failed reading tokenize response: {}", e),
        })?;
        decode_tokens(status, text)
    }

    async fn tokenize_async(&self, text: &str) -> Result<usize, AugurError> {
        let resp = self
            .client
            .post(self.endpoint("tokenize"))
            .json(&json!({"content": text}))
            .send()
            .await
            .map_err(|e| TransportError::Network {
                message: format!("llama.cpp server tokenize error: {}", e),
            })?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| TransportError::Network {
            message: format!("Failed reading tokenize response: {}", e),
        })?;
        decode_tokens(status, text)
    }

    fn post_blocking(&self, payload: &JsonValue) -> Result<JsonValue, AugurError> {
        let client = self.blocking_client()?;
        let resp = client
            .post(self.endpoint("completion"))
            .json(payload)
            .send()
            .map_err(|e| TransportError::Network {
                message: format!("llama.cpp server network error: {}", e),
            })?;
        let status = resp.status().as_u16();
        let text = resp.text().map_err(|e| TransportError::Network {
            message: format!("Failed reading llama.cpp server response: {}", e),
        })?;
        decode_body(status, text)
    }

    async fn post_async(&self, payload: &JsonValue) -> Result<JsonValue, AugurError> {
        let resp = self
            .client
            .post(self.endpoint("completion"))
            .json(payload)
            .send()
            .await
            .map_err(|e| TransportError::Network {
                message: format!("llama.cpp server network error: {}", e),
            })?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| TransportError::Network {
            message: format!("Failed reading llama.cpp server response: {}", e),
        })?;
        decode_body(status, text)
    }

    fn blocking_client(&self) -> Result<&reqwest::blocking::Client, AugurError> {
        if self.blocking.get().is_none() {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(300))
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
            message: format!("Invalid JSON from llama.cpp server: {}", e),
        }
        .into()
    })
}

fn decode_tokens(status: u16, text: String) -> Result<usize, AugurError> {
    let body = decode_body(status, text)?;
    body["tokens"]
        .as_array()
        .map(|t| t.len())
        .ok_or_else(|| {
            TransportError::Network {
                message: "Missing 'tokens' in tokenize response".to_string(),
            }
            .into()
        })
}

#[async_trait]
impl Model for LlamaCppModel {
    fn gen(&self, thread: &Thread, genconf: Option<&GenConf>) -> Result<GenOut, AugurError> {
        let genconf = self.base_genconf(genconf);
        let prepared = prepare_gen_thread(thread, &genconf)?;
        let prompt = self.render_prompt(&prepared)?;
        let input_len = self.tokenize_blocking(&prompt)?;
        let payload = self.shape_payload(&prompt, input_len, &genconf)?;
        let body = self.post_blocking(&payload)?;
        Ok(self.parse_response(&body, &genconf))
    }

    async fn gen_async(
        &self,
        thread: &Thread,
        genconf: Option<&GenConf>,
    ) -> Result<GenOut, AugurError> {
        let genconf = self.base_genconf(genconf);
        let prepared = prepare_gen_thread(thread, &genconf)?;
        let prompt = self.render_prompt(&prepared)?;
        let input_len = self.tokenize_async(&prompt).await?;
        let payload = self.shape_payload(&prompt, input_len, &genconf)?;
        let body = self.post_async(&payload).await?;
        Ok(self.parse_response(&body, &genconf))
    }

    /// Exact: the rendered prompt is tokenized by the server's tokenizer.
    fn token_len(&self, thread: &Thread, _genconf: Option<&GenConf>) -> Result<usize, AugurError> {
        let prompt = self.render_prompt(thread)?;
        self.tokenize_blocking(&prompt)
    }

    async fn token_len_async(
        &self,
        thread: &Thread,
        _genconf: Option<&GenConf>,
    ) -> Result<usize, AugurError> {
        let prompt = self.render_prompt(thread)?;
        self.tokenize_async(&prompt).await
    }

    fn ctx_len(&self) -> usize {
        self.ctx_len
    }

    fn max_tokens_limit(&self) -> usize {
        self.ctx_len
    }

    fn name(&self) -> String {
        self.model_path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| self.model_path.display().to_string())
    }

    fn desc(&self) -> String {
        format!(
            "LlamaCppModel model='{}' format='{}'",
            self.model_path.display(),
            self.format_name
        )
    }

    fn default_genconf(&self) -> &GenConf {
        &self.genconf
    }
}
