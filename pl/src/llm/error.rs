//! Completion call failures

use std::time::Duration;
use thiserror::Error;

/// Why a completion call produced no usable text
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP 429 once retries are spent; carries the server's wait hint
    #[error("Rate limited by provider, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Provider returned HTTP {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Request to provider failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unexpected provider response: {0}")]
    InvalidResponse(String),

    /// The model answered without any text to parse
    #[error("Empty response (finish reason: {finish_reason})")]
    EmptyResponse { finish_reason: String },

    #[error("No response within {0:?}")]
    Timeout(Duration),

    /// Plan context could not be encoded, or the body could not be decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether resending the same request could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::Timeout(_) => true,
            LlmError::ApiError { status, .. } => *status >= 500 || *status == 408,
            LlmError::Network(e) => !e.is_builder(),
            LlmError::InvalidResponse(_) | LlmError::EmptyResponse { .. } | LlmError::Json(_) => false,
        }
    }

    /// Server-suggested wait, present only for rate limits
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
