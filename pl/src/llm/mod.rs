//! LLM client layer
//!
//! A provider-agnostic `LlmClient` trait, the OpenAI implementation, and the
//! adapter that turns a chat model into a repair-loop suggestion source.

pub mod client;
mod error;
mod openai;
mod suggestion;
mod types;

use std::sync::Arc;

use tracing::debug;

pub use client::LlmClient;
pub use error::LlmError;
pub use openai::OpenAIClient;
pub use suggestion::{LlmSuggestionSource, PATCH_PROMPT};
pub use types::{CompletionRequest, CompletionResponse, Message, Role, StopReason, TokenUsage};

use crate::config::LlmConfig;

/// Create an LLM client for the configured provider
pub fn create_client(config: &LlmConfig, api_key: String) -> Result<Arc<dyn LlmClient>, LlmError> {
    debug!(provider = %config.provider, model = %config.model, "create_client: called");
    match config.provider.as_str() {
        "openai" => {
            debug!("create_client: creating OpenAI client");
            Ok(Arc::new(OpenAIClient::from_config(config, api_key)?))
        }
        other => Err(LlmError::InvalidResponse(format!(
            "Unknown LLM provider: {} (supported: openai)",
            other
        ))),
    }
}
