//! Plain chat node: sends the conversation to the tenant's chat provider
//! and appends the assistant reply.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::graph::node::{Node, NodeContext, NodeError};
use crate::message::ChatMessage;
use crate::providers::{ChatParams, ChatProvider};
use crate::state::{StateUpdate, WorkflowState};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LlmConfig {
    /// Optional system prompt prepended to the conversation.
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

pub struct LlmNode {
    config: LlmConfig,
}

impl LlmNode {
    #[must_use]
    pub fn new(config: LlmConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Node for LlmNode {
    async fn run(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<StateUpdate, NodeError> {
        if state.messages.is_empty() {
            return Err(NodeError::MissingInput {
                what: "conversation messages",
            });
        }

        let chat = ctx.chat_selection()?.clone();
        let mut messages = Vec::with_capacity(state.messages.len() + 1);
        if let Some(system) = &self.config.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.extend(state.messages.iter().cloned());

        let params = ChatParams {
            model: chat.model.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            json_mode: false,
        };
        let provider = ctx
            .services
            .providers
            .chat_for(ctx.tenant.tenant_id, &chat)
            .await?;
        let outcome = provider.complete(&messages, &params).await?;

        Ok(StateUpdate::new().with_messages(vec![ChatMessage::assistant(outcome.text)]))
    }
}
