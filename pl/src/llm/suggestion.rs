//! LLM-backed suggestion source for the repair loop

use std::sync::Arc;

use async_trait::async_trait;
use handlebars::Handlebars;
use serde::Serialize;
use tracing::{debug, info};

use super::{CompletionRequest, LlmClient, LlmError, Message};
use crate::domain::RawPlan;
use crate::patch::Patch;
use crate::repair::{RepairContext, SuggestionError, SuggestionSource};

/// System prompt template for patch proposals
pub const PATCH_PROMPT: &str = include_str!("../../prompts/patch.pmt");

#[derive(Debug, Serialize)]
struct PromptContext<'a> {
    intent: &'a str,
    template: &'a str,
    template_steps: &'a [String],
    min_changes: usize,
    gate_errors: Vec<String>,
    round: usize,
    max_rounds: usize,
}

/// Asks a chat model for one patch per request
pub struct LlmSuggestionSource {
    client: Arc<dyn LlmClient>,
    max_tokens: u32,
    hbs: Handlebars<'static>,
}

impl LlmSuggestionSource {
    pub fn new(client: Arc<dyn LlmClient>, max_tokens: u32) -> Self {
        debug!(%max_tokens, "LlmSuggestionSource::new: called");
        let mut hbs = Handlebars::new();
        hbs.register_escape_fn(handlebars::no_escape);
        Self {
            client,
            max_tokens,
            hbs,
        }
    }

    fn system_prompt(&self, intent: &str, context: &RepairContext) -> Result<String, SuggestionError> {
        debug!(round = context.round, "LlmSuggestionSource::system_prompt: called");
        let prompt_context = PromptContext {
            intent,
            template: &context.template,
            template_steps: &context.template_steps,
            min_changes: context.min_changes,
            gate_errors: context.gate_errors.iter().map(ToString::to_string).collect(),
            round: context.round,
            max_rounds: context.max_rounds,
        };
        self.hbs
            .render_template(PATCH_PROMPT, &prompt_context)
            .map_err(|e| SuggestionError::Other(format!("Failed to render patch prompt: {}", e)))
    }

    fn user_message(document: &RawPlan, context: &RepairContext) -> Result<String, SuggestionError> {
        let summary = serde_json::to_string_pretty(&context.plan_summary).map_err(LlmError::from)?;
        let nodes = serde_json::to_string_pretty(document.node_values()).map_err(LlmError::from)?;
        let mut text = format!("Plan summary:\n{}\n\nCurrent nodes:\n{}\n", summary, nodes);
        if !context.notes.is_empty() {
            text.push_str("\nNotes from earlier edits:\n");
            for note in &context.notes {
                text.push_str(&format!("- {}\n", note));
            }
        }
        Ok(text)
    }
}

#[async_trait]
impl SuggestionSource for LlmSuggestionSource {
    async fn propose(
        &self,
        document: &RawPlan,
        intent: &str,
        context: &RepairContext,
    ) -> Result<Vec<Patch>, SuggestionError> {
        debug!(round = context.round, error_count = context.gate_errors.len(), "propose: called");
        let request = CompletionRequest {
            system_prompt: self.system_prompt(intent, context)?,
            messages: vec![Message::user(Self::user_message(document, context)?)],
            max_tokens: self.max_tokens,
            json_response: true,
        };

        let response = self.client.complete(request).await?;
        info!(
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "propose: model replied"
        );

        let content = match response.content {
            Some(text) if !text.trim().is_empty() => text,
            _ => {
                return Err(LlmError::EmptyResponse {
                    finish_reason: response.stop_reason.as_str().to_string(),
                }
                .into());
            }
        };

        let patch = Patch::parse(&content).map_err(SuggestionError::Patch)?;
        debug!(changes = patch.change_count(), "propose: parsed patch");
        Ok(vec![patch])
    }
}
