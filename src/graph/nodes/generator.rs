//! RAG generation node: answers grounded in the retrieved chunks, with
//! optional source citations appended.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::graph::node::{Node, NodeContext, NodeError};
use crate::message::ChatMessage;
use crate::providers::{ChatParams, ChatProvider};
use crate::state::{StateUpdate, WorkflowState};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RagGeneratorConfig {
    pub include_sources: bool,
    pub temperature: Option<f32>,
}

pub struct RagGeneratorNode {
    config: RagGeneratorConfig,
}

impl RagGeneratorNode {
    #[must_use]
    pub fn new(config: RagGeneratorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Node for RagGeneratorNode {
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
            return Err(NodeError::MissingInput {
                what: "retrieved chunks",
            });
        }

        let context = state
            .chunks
            .iter()
            .map(|chunk| format!("[{}] {}", chunk.chunk_index, chunk.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let messages = vec![
            ChatMessage::system(
                "Answer using only the provided context passages. If the context \
                 is insufficient, say what is missing instead of guessing.",
            ),
            ChatMessage::user(format!("Context:\n{context}\n\nQuestion: {query}")),
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
            max_tokens: None,
            json_mode: false,
        };
        let outcome = provider.complete(&messages, &params).await?;

        let mut answer = outcome.text;
        if self.config.include_sources {
            let citations = state
                .chunks
                .iter()
                .map(|chunk| format!("[{}] chunk {}", chunk.chunk_index, chunk.chunk_id))
                .collect::<Vec<_>>()
                .join("\n");
            answer.push_str("\n\nSources:\n");
            answer.push_str(&citations);
        }

        Ok(StateUpdate::new()
            .with_messages(vec![ChatMessage::assistant(answer)])
            .with_retry(false))
    }
}
