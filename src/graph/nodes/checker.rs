//! Hallucination check node: verifies the generated answer's claims against
//! the retrieved chunks; an unsupported answer requests one regeneration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::graph::node::{Node, NodeContext, NodeError};
use crate::message::{ChatMessage, Role};
use crate::providers::{ChatParams, ChatProvider};
use crate::state::{StateUpdate, WorkflowState};

const RETRY_FLAG: &str = "hallucination_retried";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CheckerConfig {
    pub temperature: Option<f32>,
}

pub struct HallucinationCheckerNode {
    config: CheckerConfig,
}

impl HallucinationCheckerNode {
    #[must_use]
    pub fn new(config: CheckerConfig) -> Self {
        Self { config }
    }
}

fn is_supported(verdict: &str) -> bool {
    !verdict.to_uppercase().contains("UNSUPPORTED")
}

#[async_trait]
impl Node for HallucinationCheckerNode {
    async fn run(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<StateUpdate, NodeError> {
        let answer = state
            .messages
            .iter()
            .rev()
            .find(|m| m.has_role(Role::Assistant))
            .ok_or(NodeError::MissingInput {
                what: "generated answer",
            })?
            .content
            .clone();

        // Nothing to check against; pass the answer through.
        if state.chunks.is_empty() {
            return Ok(StateUpdate::new().with_retry(false));
        }

        let context = state
            .chunks
            .iter()
            .map(|chunk| chunk.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let messages = vec![
            ChatMessage::system(
                "You verify answers against source passages. Reply with exactly \
                 one word: SUPPORTED if every claim in the answer is backed by \
                 the passages, otherwise UNSUPPORTED.",
            ),
            ChatMessage::user(format!("Passages:\n{context}\n\nAnswer:\n{answer}")),
        ];

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
        let outcome = provider.complete(&messages, &params).await?;

        if is_supported(&outcome.text) {
            return Ok(StateUpdate::new().with_retry(false));
        }

        // Only one regeneration round: a second unsupported verdict passes
        // the answer through rather than looping.
        let already_retried = state.extra.get(RETRY_FLAG).is_some();
        if already_retried {
            tracing::warn!(node = %ctx.node_id, "answer still unsupported after retry");
            return Ok(StateUpdate::new().with_retry(false));
        }
        Ok(StateUpdate::new()
            .with_retry(true)
            .with_extra(RETRY_FLAG, json!(true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_parsing() {
        assert!(is_supported("SUPPORTED"));
        assert!(!is_supported("UNSUPPORTED"));
        assert!(!is_supported("the answer is unsupported"));
        assert!(is_supported("fine"));
    }
}
