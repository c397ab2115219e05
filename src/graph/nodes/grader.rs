//! Relevance grading node: scores each retrieved chunk against the query
//! with the chat provider and drops the irrelevant ones.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::graph::node::{Node, NodeContext, NodeError};
use crate::message::ChatMessage;
use crate::providers::{ChatParams, ChatProvider};
use crate::state::{StateUpdate, WorkflowState};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GraderConfig {
    pub temperature: Option<f32>,
}

pub struct RelevanceGraderNode {
    config: GraderConfig,
}

impl RelevanceGraderNode {
    #[must_use]
    pub fn new(config: GraderConfig) -> Self {
        Self { config }
    }
}

/// Verdict parsing: IRRELEVANT is checked first because it contains the
/// substring RELEVANT. An unparseable verdict keeps the chunk.
fn is_relevant(verdict: &str) -> bool {
    let upper = verdict.to_uppercase();
    !upper.contains("IRRELEVANT")
}

#[async_trait]
impl Node for RelevanceGraderNode {
    async fn run(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<StateUpdate, NodeError> {
        let query = state
            .effective_query()
            .ok_or(NodeError::MissingInput {
                what: "query or user message",
            })?
            .to_string();

        if state.chunks.is_empty() {
            return Ok(StateUpdate::new()
                .with_chunks(Vec::new())
                .with_route("no_context"));
        }

        let chat = ctx.chat_selection()?.clone();
        let provider = ctx
            .services
            .providers
            .chat_for(ctx.tenant.tenant_id, &chat)
            .await?;
        let params = ChatParams {
            model: chat.model.clone(),
            temperature: self.config.temperature,
            max_tokens: Some(8),
            json_mode: false,
        };

        let mut kept = Vec::with_capacity(state.chunks.len());
        let mut dropped = 0usize;
        for chunk in &state.chunks {
            let messages = vec![
                ChatMessage::system(
                    "You grade retrieval results. Reply with exactly one word: \
                     RELEVANT or IRRELEVANT.",
                ),
                ChatMessage::user(format!(
                    "Question: {query}\n\nPassage:\n{}",
                    chunk.content
                )),
            ];
            let outcome = provider.complete(&messages, &params).await?;
            if is_relevant(&outcome.text) {
                kept.push(chunk.clone());
            } else {
                dropped += 1;
            }
        }

        let mut update = StateUpdate::new().with_extra("graded_out", json!(dropped));
        if kept.is_empty() {
            update = update.with_chunks(Vec::new()).with_route("no_context");
        } else {
            update = update.with_chunks(kept);
        }
        Ok(update)
    }
}
