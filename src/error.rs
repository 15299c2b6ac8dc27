//! Gateway Error Types
//!
//! Error handling for routing, key selection and relaying.

use thiserror::Error;

/// Main error type for gateway operations
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Configuration errors (invalid JSON, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested model has no configuration
    #[error("Model '{0}' is not configured")]
    ModelNotFound(String),

    /// Provider referenced by an association does not exist
    #[error("Provider '{0}' not found")]
    ProviderNotFound(String),

    /// The provider has no enabled key outside its cooldown window
    #[error("No available key for provider '{0}'")]
    NoAvailableKey(String),

    /// No eligible association left for the model
    #[error("All providers exhausted for model '{model}'{}", last_error_suffix(.last_error))]
    Exhausted {
        model: String,
        last_error: Option<String>,
    },

    /// Upstream rejected the request as malformed; never retried
    #[error("Client error (status {status}): {body}")]
    ClientError { status: u16, body: String },

    /// The persistence layer failed
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A row addressed by id does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// HTTP request failed before a status was received
    #[error("Request failed: {0}")]
    Request(String),

    /// Timeout
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Streaming error
    #[error("Streaming error: {0}")]
    Stream(String),

    /// The caller went away while the response was being relayed
    #[error("Caller disconnected")]
    CallerDisconnected,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(err) => format!(", last error: {}", err),
        None => String::new(),
    }
}

impl GatewayError {
    /// Whether the orchestrator absorbs this error and moves on to another candidate
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::NoAvailableKey(_)
                | GatewayError::Request(_)
                | GatewayError::Timeout(_)
                | GatewayError::Stream(_)
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(err.to_string())
        } else if err.is_connect() {
            GatewayError::Request(format!("Connection failed: {}", err))
        } else if err.is_decode() || err.is_body() {
            GatewayError::Stream(format!("Failed to read response body: {}", err))
        } else {
            GatewayError::Request(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Config(format!("JSON parsing error: {}", err))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Stream(format!("IO error: {}", err))
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
