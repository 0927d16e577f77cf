//! Error types for the gateway client.

use thiserror::Error;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Gateway client errors.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Configuration error (missing API key, empty target list)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error (connection failed, timeout)
    #[error("Network error: {0}")]
    Network(String),

    /// API error (non-2xx response)
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Parse error (invalid JSON, unexpected response format)
    #[error("Parse error: {0}")]
    Parse(String),
}

impl LlmError {
    /// Whether a retry against the same target may succeed.
    ///
    /// Conservative policy: connect failures and timeouts, plus the status
    /// codes that signal transient server-side conditions.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Network(_) => true,
            LlmError::Api { status, .. } => {
                matches!(status, 408 | 409 | 425 | 429) || *status >= 500
            }
            LlmError::Config(_) | LlmError::Parse(_) => false,
        }
    }
}
