//! The node capability: one unit of work over a state snapshot.

use async_trait::async_trait;
use miette::Diagnostic;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;

use crate::ingest::{DocumentPipeline, PipelineError};
use crate::models::ChatSelection;
use crate::providers::{ProviderError, ProviderRegistry};
use crate::state::{StateUpdate, WorkflowState};
use crate::store::StoreError;
use crate::tenant::TenantContext;

/// Services a node may reach during execution, shared by reference.
#[derive(Clone)]
pub struct NodeServices {
    pub pool: SqlitePool,
    pub providers: Arc<ProviderRegistry>,
    pub pipeline: Arc<DocumentPipeline>,
}

/// Execution context handed to each node invocation.
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: String,
    pub step: u64,
    pub tenant: TenantContext,
    /// Resolved once per execution from the tenant's configuration; `None`
    /// when the tenant has no chat provider configured.
    pub chat: Option<ChatSelection>,
    pub services: NodeServices,
}

impl NodeContext {
    /// The tenant's chat selection, required by model-calling nodes.
    pub fn chat_selection(&self) -> Result<&ChatSelection, NodeError> {
        self.chat.as_ref().ok_or(NodeError::MissingInput {
            what: "tenant chat provider configuration",
        })
    }
}

/// Errors that halt the current execution at the failing node.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(ragloom::node::missing_input),
        help("Check that an earlier node produced the required data: {what}.")
    )]
    MissingInput { what: &'static str },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(ragloom::node::serde))]
    Serde(#[from] serde_json::Error),
}

/// One executable workflow node.
///
/// Nodes are stateless: they read the snapshot, do their work (any provider
/// or storage call is a suspension point), and return the partial update the
/// executor merges and checkpoints. Fatal problems return `Err` and fail the
/// execution at this step.
#[async_trait]
pub trait Node: Send + Sync {
    async fn run(&self, state: &WorkflowState, ctx: &NodeContext)
        -> Result<StateUpdate, NodeError>;
}
