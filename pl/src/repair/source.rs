//! Suggestion source seam
//!
//! Anything that can propose patches for a document: an LLM, a scripted
//! sequence in tests, a human-in-the-loop adapter.

use async_trait::async_trait;
use thiserror::Error;

use super::RepairContext;
use crate::domain::RawPlan;
use crate::error::PlanError;
use crate::llm::LlmError;
use crate::patch::Patch;

/// Per-request failure; the loop treats it as "no candidate from this worker"
#[derive(Debug, Error)]
pub enum SuggestionError {
    #[error("LLM request failed: {0}")]
    Llm(#[from] LlmError),

    #[error("unusable patch: {0}")]
    Patch(PlanError),

    #[error("suggestion source failed: {0}")]
    Other(String),
}

/// Proposes candidate patches; calls may run concurrently
#[async_trait]
pub trait SuggestionSource: Send + Sync {
    /// Zero or more candidate patches for `document`
    async fn propose(
        &self,
        document: &RawPlan,
        intent: &str,
        context: &RepairContext,
    ) -> Result<Vec<Patch>, SuggestionError>;
}
