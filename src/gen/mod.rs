//! Generation configuration and results: GenConf, GenRes, GenOut, GenError.

pub mod pipeline;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::schema::TargetValue;

/// Output format requested from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutFormat {
    /// Plain text output
    #[default]
    Text,
    /// JSON output, optionally constrained by GenConf::json_schema
    Json,
}

/// Model generation configuration, used in gen() and variants.
/// A value object: the with_* methods return an updated copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenConf {
    /// Maximum output token length. 0 means all available context length;
    /// values in [-100,-1] mean a percentage of ctx_len, so -20 allows
    /// output up to 20% of ctx_len.
    #[serde(default)]
    pub max_tokens: i32,

    /// Generation stop text sequences
    #[serde(default)]
    pub stop: Vec<String>,

    /// Generation temperature. 0 always picks the most probable output.
    #[serde(default)]
    pub temperature: f32,

    /// Nucleus sampling top_p value. Only applies if temperature > 0.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Output format. For JSON output, text is validated by JSON decoding.
    #[serde(default)]
    pub format: OutFormat,

    /// A JSON schema to validate the JSON output. Requires format == Json.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<JsonValue>,

    /// Special model or provider-specific generation arguments. Base keys are
    /// included unconditionally; keys named after a provider only apply to
    /// models of that provider.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub special: Map<String, JsonValue>,
}

fn default_top_p() -> f32 {
    0.9
}

impl Default for GenConf {
    fn default() -> Self {
        GenConf {
            max_tokens: 0,
            stop: Vec::new(),
            temperature: 0.0,
            top_p: default_top_p(),
            format: OutFormat::Text,
            json_schema: None,
            special: Map::new(),
        }
    }
}

impl GenConf {
    pub fn new() -> Self {
        GenConf::default()
    }

    pub fn with_max_tokens(mut self, max_tokens: i32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_format(mut self, format: OutFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_json_schema(mut self, json_schema: Option<JsonValue>) -> Self {
        self.json_schema = json_schema;
        self
    }

    /// Add or replace a key in the special args map. Keys named after a
    /// provider hold per-provider sub-maps.
    pub fn with_special(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.special.insert(key.into(), value);
        self
    }

    /// Resolve max_tokens against a context length: 0 expands to ctx_len,
    /// -k (k in [1,100]) to ceil(k% of ctx_len), at least 1. The result is
    /// clamped to max_tokens_limit when given.
    pub fn resolve_max_tokens(&self, ctx_len: usize, max_tokens_limit: Option<usize>) -> usize {
        let mut max_tokens = if self.max_tokens > 0 {
            self.max_tokens as usize
        } else if self.max_tokens == 0 {
            ctx_len
        } else {
            let pct = (-self.max_tokens).min(100) as usize;
            ((ctx_len * pct).div_ceil(100)).max(1)
        };

        if let Some(limit) = max_tokens_limit {
            max_tokens = max_tokens.min(limit);
        }
        max_tokens
    }

    /// Compile the special args for a model of the given provider: base keys
    /// unconditionally, the provider's own sub-map overlaid, other providers'
    /// sub-maps skipped.
    pub fn resolve_special(
        &self,
        provider: &str,
        known_providers: &[&str],
    ) -> Map<String, JsonValue> {
        let mut out = Map::new();
        for (k, v) in &self.special {
            if k == provider {
                if let JsonValue::Object(sub) = v {
                    for (sk, sv) in sub {
                        out.insert(sk.clone(), sv.clone());
                    }
                }
            } else if v.is_object() && known_providers.contains(&k.as_str()) {
                // another provider's entry
                continue;
            } else {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }
}

/// Model generation result kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenRes {
    /// Generation complete without errors
    OkStop,
    /// Generation stopped due to reaching max_tokens
    OkLength,
    /// Output was not valid JSON - often co-occurs with a length stop that
    /// cut off the JSON text
    ErrorJson,
    /// Parsed JSON failed schema validation or instantiation
    ErrorJsonSchemaVal,
    /// The JSON schema itself is not valid
    ErrorJsonSchemaError,
    /// Other model internal error
    ErrorModel,
}

impl GenRes {
    /// Map a provider finish reason into a GenRes.
    pub fn from_finish_reason(finish: &str) -> GenRes {
        match finish {
            "stop" | "eos" | "tool_calls" => GenRes::OkStop,
            "length" | "max_tokens" => GenRes::OkLength,
            "!json" => GenRes::ErrorJson,
            "!json_schema_val" => GenRes::ErrorJsonSchemaVal,
            "!json_schema_error" => GenRes::ErrorJsonSchemaError,
            _ => GenRes::ErrorModel,
        }
    }

    /// A friendlier description of the result.
    pub fn as_text(&self) -> &'static str {
        match self {
            GenRes::OkStop => "Stop",
            GenRes::OkLength => "Length (output cut)",
            GenRes::ErrorJson => "JSON decoding error",
            GenRes::ErrorJsonSchemaVal => "JSON schema validation error",
            GenRes::ErrorJsonSchemaError => "Error in JSON schema",
            GenRes::ErrorModel => "Model internal error",
        }
    }
}

/// Model output, returned by the gen_* calls that don't raise.
#[derive(Debug, Clone, PartialEq)]
pub struct GenOut {
    /// Result of model generation
    pub res: GenRes,
    /// Text generated by model
    pub text: String,
    /// Parsed JSON output from the structured calls
    pub dic: Option<JsonValue>,
    /// Instantiated target value, as returned by extract() and friends
    pub value: Option<TargetValue>,
}

impl GenOut {
    pub fn new(res: GenRes, text: impl Into<String>) -> Self {
        GenOut {
            res,
            text: text.into(),
            dic: None,
            value: None,
        }
    }

    pub fn with_dic(mut self, dic: JsonValue) -> Self {
        self.dic = Some(dic);
        self
    }
}

impl std::fmt::Display for GenOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "res={} text=\u{2588}{}\u{2588}", self.res.as_text(), self.text)?;
        if let Some(dic) = &self.dic {
            write!(f, " dic={}", dic)?;
        }
        if let Some(value) = &self.value {
            write!(f, " value={}", value)?;
        }
        Ok(())
    }
}

/// Model generation error, raised by the exception-raising call forms when
/// the model was unable to return a usable response.
#[derive(Error, Debug)]
#[error("{}", .out)]
pub struct GenError {
    pub out: GenOut,
}

impl GenError {
    /// Convert a non-OkStop result into an error. A result of OkLength is
    /// only an error when ok_length_is_error is set.
    pub fn raise_if_error(out: GenOut, ok_length_is_error: bool) -> Result<GenOut, GenError> {
        match out.res {
            GenRes::OkStop => Ok(out),
            GenRes::OkLength if !ok_length_is_error => Ok(out),
            _ => Err(GenError { out }),
        }
    }
}
