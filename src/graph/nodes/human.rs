//! Human-in-the-loop node: parks the execution behind a pending approval.
//!
//! The node itself only raises the interrupt; creating the approval row,
//! flipping the execution to `interrupted`, and resuming afterwards is the
//! executor's protocol.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::graph::node::{Node, NodeContext, NodeError};
use crate::state::{InterruptRequest, StateUpdate, WorkflowState};

/// What happens when the human rejects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum RejectPolicy {
    /// Terminate the workflow at the rejection (default).
    #[default]
    End,
    /// Continue at the named node instead.
    Route { node: String },
}

fn default_prompt() -> String {
    "Approval required to continue".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HumanConfig {
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default)]
    pub on_reject: RejectPolicy,
}

impl Default for HumanConfig {
    fn default() -> Self {
        Self {
            prompt: default_prompt(),
            on_reject: RejectPolicy::End,
        }
    }
}

pub struct HumanInLoopNode {
    config: HumanConfig,
}

impl HumanInLoopNode {
    #[must_use]
    pub fn new(config: HumanConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Node for HumanInLoopNode {
    async fn run(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<StateUpdate, NodeError> {
        let last_message = state.messages.last().map(|m| m.content.clone());
        Ok(StateUpdate::new().with_interrupt(InterruptRequest {
            prompt: self.config.prompt.clone(),
            context: json!({
                "node_id": ctx.node_id,
                "step": ctx.step,
                "last_message": last_message,
            }),
        }))
    }
}
