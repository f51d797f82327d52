use thiserror::Error;

use crate::gen::GenError;

/// Custom error types for the augur toolkit
#[derive(Error, Debug)]
pub enum AugurError {
    /// Target type could not be compiled into a JSON schema
    #[error("Schema compile error: {0}")]
    SchemaCompile(String),

    /// The JSON schema itself was rejected by the validator
    #[error("Schema error: {0}")]
    Schema(String),

    /// A validated JSON value could not be coerced into the target type
    #[error("Schema value error: {0}")]
    SchemaValue(String),

    /// Thread construction or preparation errors
    #[error("Thread error: {0}")]
    Thread(String),

    /// Input does not fit the model's context window
    #[error("Input token length ({input_len}) doesn't fit available ctx_len ({ctx_len}) or max_tokens_limit ({max_tokens_limit})")]
    ContextOverflow {
        input_len: usize,
        ctx_len: usize,
        max_tokens_limit: usize,
    },

    /// Model or format registry errors
    #[error("Registry error: {0}")]
    Registry(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Chat template rendering errors
    #[error("Template error: {0}")]
    Template(String),

    /// Image loading or decoding errors
    #[error("Image error: {0}")]
    Image(String),

    /// Transport-level failure talking to a provider
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Generation returned a non-OK result and the caller asked to raise
    #[error("Generation error: {0}")]
    Generation(#[from] GenError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Transport-level errors returned while talking to a provider endpoint.
/// Provider-returned generation outcomes (length stops, schema failures) are
/// never reported here - those are carried in GenOut.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Authentication failures (401/403 or missing API key)
    #[error("{message}")]
    Auth {
        message: String,
        status: Option<u16>,
        details: Option<String>,
    },

    /// Network-level failures (DNS, connect, read)
    #[error("{message}")]
    Network { message: String },

    /// Rate limited by the provider (429)
    #[error("{message}")]
    RateLimited {
        message: String,
        status: Option<u16>,
        details: Option<String>,
    },

    /// Provider-side server errors (5xx)
    #[error("{message}")]
    Server {
        message: String,
        status: Option<u16>,
        details: Option<String>,
    },

    /// Request rejected as invalid by the provider
    #[error("{message}")]
    InvalidParams {
        message: String,
        status: Option<u16>,
        details: Option<String>,
    },

    /// Anything else the provider returned that we can't classify
    #[error("{message}")]
    Service {
        message: String,
        status: Option<u16>,
        details: Option<String>,
    },
}

impl TransportError {
    /// Classify an HTTP error status + body into a TransportError.
    pub fn from_status(provider: &str, status: u16, body: String) -> Self {
        let lower = body.to_lowercase();
        if status == 401 || status == 403 {
            TransportError::Auth {
                message: format!("Authentication failed for {}", provider),
                status: Some(status),
                details: Some(body),
            }
        } else if status == 429 {
            TransportError::RateLimited {
                message: format!("Rate limited by {}", provider),
                status: Some(status),
                details: Some(body),
            }
        } else if status >= 500 {
            TransportError::Server {
                message: format!("{} server error", provider),
                status: Some(status),
                details: Some(body),
            }
        } else if lower.contains("unsupported parameter") || lower.contains("invalid") {
            TransportError::InvalidParams {
                message: format!("Invalid parameters for {}", provider),
                status: Some(status),
                details: Some(body),
            }
        } else {
            TransportError::Service {
                message: format!("{} error", provider),
                status: Some(status),
                details: Some(body),
            }
        }
    }
}
