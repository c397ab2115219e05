//! Workflow executor: steps a compiled graph over checkpointed state.
//!
//! One turn = load (or initialise) the thread state, append the user
//! message, route to a workflow, then step nodes one at a time. After every
//! node the merged state is checkpointed and an `update` event is emitted;
//! the checkpoint's `(thread_id, step)` uniqueness is what serialises
//! executors on a thread. Human-in-the-loop nodes park the run behind a
//! pending approval; `resume` picks it up from the latest checkpoint.

pub mod routing;

use chrono::Utc;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::events::{WorkflowEmitter, WorkflowEvent};
use crate::graph::{
    compile, BuildError, NodeContext, NodeError, NodeServices, Workflow, WorkflowDefinition, END,
};
use crate::graph::nodes::RejectPolicy;
use crate::ingest::DocumentPipeline;
use crate::message::{ChatMessage, Role};
use crate::models::{
    ApprovalStatus, ConversationSession, ExecutionStatus, HitlApproval, SessionMode,
    StoredMessage, WorkflowExecution,
};
use crate::providers::ProviderRegistry;
use crate::state::WorkflowState;
use crate::store::{self, StoreError};
use crate::tenant::TenantContext;

use routing::{classify, routing_metadata, unified_definition, Route};

/// Encoding version of [`ExecutionSnapshot`] blobs.
const SCHEMA_VERSION: u32 = 1;
/// Upper bound on nodes stepped in one turn; bounds conditional loops.
const MAX_STEPS_PER_TURN: u32 = 32;

#[derive(Debug, Error, Diagnostic)]
pub enum ExecutorError {
    #[error("session not found")]
    #[diagnostic(code(ragloom::executor::session_not_found))]
    SessionNotFound,

    #[error("workflow not found")]
    #[diagnostic(code(ragloom::executor::workflow_not_found))]
    WorkflowNotFound,

    #[error("rag_only session has no active documents")]
    #[diagnostic(
        code(ragloom::executor::no_documents),
        help("Attach a completed document to the session or switch its mode.")
    )]
    NoDocuments,

    #[error("execution is awaiting a human approval")]
    #[diagnostic(
        code(ragloom::executor::awaiting_approval),
        help("Respond to the pending approval, then resume.")
    )]
    AwaitingApproval,

    #[error("no interrupted execution to resume")]
    #[diagnostic(code(ragloom::executor::not_interrupted))]
    NotInterrupted,

    #[error("{0}")]
    #[diagnostic(code(ragloom::executor::validation))]
    Validation(String),

    #[error("node `{node}` failed: {source}")]
    #[diagnostic(code(ragloom::executor::node))]
    Node {
        node: String,
        #[source]
        source: NodeError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("snapshot encoding error: {0}")]
    #[diagnostic(code(ragloom::executor::snapshot))]
    Snapshot(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Where a thread's execution stands, as persisted in its latest
/// checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Position {
    /// The named node runs next.
    AtNode { node: String },
    /// Parked on the named interrupt node until its approval is answered.
    AwaitingApproval { node: String },
    /// The turn ran to `__end__`.
    Finished,
}

/// The checkpoint blob: state plus enough context to resume without any
/// in-process memory — including the definition the turn was routed to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub schema_version: u32,
    pub execution_id: Uuid,
    pub definition: WorkflowDefinition,
    pub state: WorkflowState,
    pub position: Position,
}

impl ExecutionSnapshot {
    fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    fn decode(blob: &str) -> serde_json::Result<Self> {
        serde_json::from_str(blob)
    }
}

/// Result of one `execute`/`resume` turn.
#[derive(Clone, Debug, Serialize)]
pub struct TurnOutcome {
    pub execution_id: Uuid,
    pub session_id: Uuid,
    pub status: ExecutionStatus,
    pub output: Option<Value>,
    pub approval_id: Option<Uuid>,
}

/// Decision from the human, applied to state on resume.
#[derive(Clone, Debug, Deserialize)]
pub struct ResumeInput {
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub user_response: Option<Value>,
}

#[derive(Clone)]
pub struct WorkflowExecutor {
    pool: SqlitePool,
    services: NodeServices,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl WorkflowExecutor {
    #[must_use]
    pub fn new(
        pool: SqlitePool,
        providers: Arc<ProviderRegistry>,
        pipeline: Arc<DocumentPipeline>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            services: NodeServices {
                pool: pool.clone(),
                providers,
                pipeline,
            },
            pool,
            checkpoints,
        }
    }

    /// Run one turn to completion (or interrupt) without streaming.
    #[instrument(skip(self, ctx, user_input), fields(tenant = %ctx.tenant_id, session = %session_id))]
    pub async fn execute(
        &self,
        ctx: &TenantContext,
        session_id: Uuid,
        user_input: &str,
        workflow_id: Option<Uuid>,
    ) -> Result<TurnOutcome> {
        self.run_turn(ctx, session_id, user_input, workflow_id, &WorkflowEmitter::disconnected())
            .await
    }

    /// Run one turn on a background task, returning the event stream.
    /// Errors surface as an `error` event; durable state is the database.
    pub fn stream(
        &self,
        ctx: TenantContext,
        session_id: Uuid,
        user_input: String,
        workflow_id: Option<Uuid>,
    ) -> flume::Receiver<WorkflowEvent> {
        let (emitter, rx) = WorkflowEmitter::channel();
        let executor = self.clone();
        tokio::spawn(async move {
            if let Err(e) = executor
                .run_turn(&ctx, session_id, &user_input, workflow_id, &emitter)
                .await
            {
                tracing::warn!(session = %session_id, error = %e, "streamed turn failed");
                emitter.emit(WorkflowEvent::Error {
                    message: e.to_string(),
                    step: None,
                });
            }
        });
        rx
    }

    /// Continue an interrupted execution after a human decision.
    #[instrument(skip(self, ctx, input), fields(tenant = %ctx.tenant_id, session = %session_id))]
    pub async fn resume(
        &self,
        ctx: &TenantContext,
        session_id: Uuid,
        input: ResumeInput,
    ) -> Result<TurnOutcome> {
        let session = self.load_session(ctx, session_id).await?;
        let checkpoint = self
            .checkpoints
            .load_latest(&session.thread_id)
            .await?
            .ok_or(ExecutorError::NotInterrupted)?;
        let snapshot = ExecutionSnapshot::decode(&checkpoint.state_blob)?;
        let Position::AwaitingApproval { node } = snapshot.position.clone() else {
            return Err(ExecutorError::NotInterrupted);
        };

        let execution = store::executions::get(&self.pool, ctx.tenant_id, snapshot.execution_id)
            .await?
            .ok_or(ExecutorError::NotInterrupted)?;
        if execution.status != ExecutionStatus::Interrupted {
            return Err(ExecutorError::NotInterrupted);
        }
        store::executions::mark_running(&self.pool, execution.id).await?;

        let workflow = compile(&snapshot.definition)?;
        let mut state = snapshot.state;
        state
            .extra
            .insert("approved".into(), json!(input.approved));
        if let Some(feedback) = &input.feedback {
            state.extra.insert("feedback".into(), json!(feedback));
        }
        if let Some(response) = &input.user_response {
            state.extra.insert("user_response".into(), response.clone());
        }

        let next = if input.approved {
            workflow
                .next_after(&node, &state)
                .unwrap_or_else(|| END.to_string())
        } else {
            match workflow.human_config(&node).map(|c| c.on_reject.clone()) {
                Some(RejectPolicy::Route { node: target }) => target,
                _ => END.to_string(),
            }
        };

        let loop_ctx = StepLoop {
            ctx,
            session: &session,
            workflow: &workflow,
            definition: &snapshot.definition,
            execution_id: execution.id,
            state,
            current: next.clone(),
            step: checkpoint.step + 1,
            routing_meta: None,
            emitter: &WorkflowEmitter::disconnected(),
        };
        // The decision itself is checkpointed before stepping continues, so
        // the thread can never be observed as still awaiting the approval,
        // and a racing second resume collides here.
        let position = if next == END {
            Position::Finished
        } else {
            Position::AtNode { node: next }
        };
        self.save_snapshot(&loop_ctx, position).await?;

        self.step_loop(loop_ctx).await
    }

    /// Checkpoint history for a thread, oldest first.
    pub async fn history(&self, ctx: &TenantContext, session_id: Uuid) -> Result<Vec<Checkpoint>> {
        let session = self.load_session(ctx, session_id).await?;
        Ok(self.checkpoints.list(&session.thread_id).await?)
    }

    // -----------------------------------------------------------------------
    // Turn setup
    // -----------------------------------------------------------------------

    async fn load_session(
        &self,
        ctx: &TenantContext,
        session_id: Uuid,
    ) -> Result<ConversationSession> {
        store::sessions::get(&self.pool, ctx.tenant_id, session_id)
            .await?
            .ok_or(ExecutorError::SessionNotFound)
    }

    async fn run_turn(
        &self,
        ctx: &TenantContext,
        session_id: Uuid,
        user_input: &str,
        workflow_id: Option<Uuid>,
        emitter: &WorkflowEmitter,
    ) -> Result<TurnOutcome> {
        if user_input.trim().is_empty() {
            return Err(ExecutorError::Validation("user_input must not be empty".into()));
        }
        let session = self.load_session(ctx, session_id).await?;

        // Restore thread state from the latest checkpoint, or initialise it
        // from the persisted session history.
        let latest = self.checkpoints.load_latest(&session.thread_id).await?;
        let (mut state, base_step) = match &latest {
            Some(checkpoint) => {
                let snapshot = ExecutionSnapshot::decode(&checkpoint.state_blob)?;
                if matches!(snapshot.position, Position::AwaitingApproval { .. }) {
                    return Err(ExecutorError::AwaitingApproval);
                }
                (snapshot.state, checkpoint.step)
            }
            None => {
                let mut state = WorkflowState::new(session.mode);
                let history =
                    store::sessions::list_messages(&self.pool, session.id, 1000).await?;
                state.messages = history
                    .iter()
                    .map(|m| ChatMessage::new(m.role, m.content.clone()))
                    .collect();
                (state, -1)
            }
        };

        // Per-turn context refresh: documents and mode may have changed
        // since the last checkpoint, and turn-scoped scratch is reset.
        let bridges = store::sessions::list_session_documents(&self.pool, session.id).await?;
        state.active_documents = bridges.iter().map(|b| b.document_id).collect();
        state.mode = session.mode;
        state.query = None;
        state.chunks.clear();
        state.route = None;
        state.retry = false;
        state.extra.clear();

        // The user message is persisted before any step runs.
        let user_message = StoredMessage {
            id: Uuid::new_v4(),
            session_id: session.id,
            role: Role::User,
            content: user_input.to_string(),
            metadata: json!({}),
            created_at: Utc::now(),
        };
        store::sessions::insert_message(&self.pool, &user_message).await?;
        state.messages.push(ChatMessage::user(user_input));

        let (definition, routing_meta) = self
            .select_workflow(ctx, &session, workflow_id, user_input, state.active_documents.len())
            .await?;
        let workflow = compile(&definition)?;

        let execution = WorkflowExecution {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            user_id: ctx.user_id,
            workflow_id: workflow_id.or(session.workflow_id),
            session_id: session.id,
            thread_id: session.thread_id.clone(),
            status: ExecutionStatus::Running,
            input_data: json!({ "user_input": user_input }),
            output_data: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        store::executions::insert(&self.pool, &execution).await?;
        emitter.emit(WorkflowEvent::Start {
            execution_id: execution.id,
            session_id: session.id,
            thread_id: session.thread_id.clone(),
        });

        self.step_loop(StepLoop {
            ctx,
            session: &session,
            workflow: &workflow,
            definition: &definition,
            execution_id: execution.id,
            state,
            current: workflow.entry().to_string(),
            step: base_step,
            routing_meta,
            emitter,
        })
        .await
    }

    /// Effective workflow for the turn: an explicit id, the session's own
    /// workflow, or the unified workflow chosen by mode routing.
    async fn select_workflow(
        &self,
        ctx: &TenantContext,
        session: &ConversationSession,
        workflow_id: Option<Uuid>,
        user_input: &str,
        active_documents: usize,
    ) -> Result<(WorkflowDefinition, Option<Value>)> {
        if let Some(id) = workflow_id.or(session.workflow_id) {
            let row = store::executions::get_definition(&self.pool, ctx.tenant_id, id)
                .await?
                .ok_or(ExecutorError::WorkflowNotFound)?;
            let definition = WorkflowDefinition {
                name: row.name,
                nodes: serde_json::from_value(row.nodes)?,
                edges: serde_json::from_value(row.edges)?,
            };
            return Ok((definition, None));
        }

        match session.mode {
            SessionMode::ChatOnly => Ok((unified_definition(Route::DirectChat), None)),
            SessionMode::RagOnly => {
                if active_documents == 0 {
                    return Err(ExecutorError::NoDocuments);
                }
                Ok((unified_definition(Route::RagNeeded), None))
            }
            SessionMode::Auto => {
                let (route, reason) = classify(user_input, active_documents);
                let meta = routing_metadata(route, reason, active_documents);
                Ok((unified_definition(route), Some(meta)))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    async fn step_loop(&self, mut loop_ctx: StepLoop<'_>) -> Result<TurnOutcome> {
        let chat = store::tenant_config::get(&self.pool, loop_ctx.ctx.tenant_id)
            .await?
            .and_then(|c| c.chat);
        let mut steps_this_turn = 0u32;
        let mut routing_meta = loop_ctx.routing_meta.take();

        loop {
            if loop_ctx.current == END {
                return self.finish_completed(&mut loop_ctx).await;
            }
            steps_this_turn += 1;
            if steps_this_turn > MAX_STEPS_PER_TURN {
                return self
                    .finish_failed(&mut loop_ctx, "step budget exceeded".to_string())
                    .await;
            }
            loop_ctx.step += 1;

            let node_id = loop_ctx.current.clone();
            let Some(node) = loop_ctx.workflow.node(&node_id) else {
                return self
                    .finish_failed(&mut loop_ctx, format!("unknown node `{node_id}`"))
                    .await;
            };
            let node_ctx = NodeContext {
                node_id: node_id.clone(),
                step: loop_ctx.step as u64,
                tenant: loop_ctx.ctx.clone(),
                chat: chat.clone(),
                services: self.services.clone(),
            };

            let update = match node.run(&loop_ctx.state, &node_ctx).await {
                Ok(update) => update,
                Err(source) => {
                    let message = source.to_string();
                    // A final checkpoint keeps the failed step resumable.
                    self.save_snapshot(&loop_ctx, Position::AtNode { node: node_id.clone() })
                        .await?;
                    store::executions::finish(
                        &self.pool,
                        loop_ctx.execution_id,
                        ExecutionStatus::Failed,
                        None,
                        Some(&message),
                    )
                    .await?;
                    loop_ctx.emitter.emit(WorkflowEvent::Error {
                        message,
                        step: Some(loop_ctx.step as u64),
                    });
                    return Err(ExecutorError::Node {
                        node: node_id,
                        source,
                    });
                }
            };

            if let Some(interrupt) = update.interrupt.clone() {
                return self
                    .park_on_approval(&mut loop_ctx, &node_id, interrupt, routing_meta.take())
                    .await;
            }

            let delta = update.visible_delta();
            loop_ctx.state.apply(update);
            let next = loop_ctx
                .workflow
                .next_after(&node_id, &loop_ctx.state)
                .unwrap_or_else(|| END.to_string());

            let position = if next == END {
                Position::Finished
            } else {
                Position::AtNode { node: next.clone() }
            };
            self.save_snapshot(&loop_ctx, position).await?;

            loop_ctx.emitter.emit(WorkflowEvent::Update {
                node_id,
                step: loop_ctx.step as u64,
                delta,
                routing_metadata: routing_meta.take(),
                approval_id: None,
            });
            loop_ctx.current = next;
        }
    }

    async fn park_on_approval(
        &self,
        loop_ctx: &mut StepLoop<'_>,
        node_id: &str,
        interrupt: crate::state::InterruptRequest,
        routing_meta: Option<Value>,
    ) -> Result<TurnOutcome> {
        let approval = HitlApproval {
            id: Uuid::new_v4(),
            execution_id: loop_ctx.execution_id,
            tenant_id: loop_ctx.ctx.tenant_id,
            user_id: loop_ctx.ctx.user_id,
            prompt: interrupt.prompt.clone(),
            context_data: interrupt.context.clone(),
            status: ApprovalStatus::Pending,
            user_response: None,
            created_at: Utc::now(),
            responded_at: None,
        };
        store::hitl::insert(&self.pool, &approval).await?;
        store::executions::mark_interrupted(&self.pool, loop_ctx.execution_id).await?;
        self.save_snapshot(
            loop_ctx,
            Position::AwaitingApproval {
                node: node_id.to_string(),
            },
        )
        .await?;

        loop_ctx.emitter.emit(WorkflowEvent::Update {
            node_id: node_id.to_string(),
            step: loop_ctx.step as u64,
            delta: json!({ "prompt": interrupt.prompt }),
            routing_metadata: routing_meta,
            approval_id: Some(approval.id),
        });
        loop_ctx.emitter.emit(WorkflowEvent::Done {
            execution_id: loop_ctx.execution_id,
            status: ExecutionStatus::Interrupted.as_str().to_string(),
            output: None,
        });

        Ok(TurnOutcome {
            execution_id: loop_ctx.execution_id,
            session_id: loop_ctx.session.id,
            status: ExecutionStatus::Interrupted,
            output: None,
            approval_id: Some(approval.id),
        })
    }

    async fn finish_completed(&self, loop_ctx: &mut StepLoop<'_>) -> Result<TurnOutcome> {
        // The assistant message persists only on __end__.
        let answer = loop_ctx
            .state
            .messages
            .iter()
            .rev()
            .find(|m| m.has_role(Role::Assistant))
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if !answer.is_empty() {
            let message = StoredMessage {
                id: Uuid::new_v4(),
                session_id: loop_ctx.session.id,
                role: Role::Assistant,
                content: answer.clone(),
                metadata: json!({ "execution_id": loop_ctx.execution_id }),
                created_at: Utc::now(),
            };
            store::sessions::insert_message(&self.pool, &message).await?;
        }
        store::sessions::touch(&self.pool, loop_ctx.session.id).await?;

        let output = json!({ "message": answer, "workflow": loop_ctx.definition.name });
        store::executions::finish(
            &self.pool,
            loop_ctx.execution_id,
            ExecutionStatus::Completed,
            Some(&output),
            None,
        )
        .await?;
        loop_ctx.emitter.emit(WorkflowEvent::Done {
            execution_id: loop_ctx.execution_id,
            status: ExecutionStatus::Completed.as_str().to_string(),
            output: Some(output.clone()),
        });

        Ok(TurnOutcome {
            execution_id: loop_ctx.execution_id,
            session_id: loop_ctx.session.id,
            status: ExecutionStatus::Completed,
            output: Some(output),
            approval_id: None,
        })
    }

    async fn finish_failed(
        &self,
        loop_ctx: &mut StepLoop<'_>,
        message: String,
    ) -> Result<TurnOutcome> {
        store::executions::finish(
            &self.pool,
            loop_ctx.execution_id,
            ExecutionStatus::Failed,
            None,
            Some(&message),
        )
        .await?;
        loop_ctx.emitter.emit(WorkflowEvent::Error {
            message: message.clone(),
            step: Some(loop_ctx.step as u64),
        });
        Err(ExecutorError::Validation(message))
    }

    async fn save_snapshot(&self, loop_ctx: &StepLoop<'_>, position: Position) -> Result<()> {
        let snapshot = ExecutionSnapshot {
            schema_version: SCHEMA_VERSION,
            execution_id: loop_ctx.execution_id,
            definition: loop_ctx.definition.clone(),
            state: loop_ctx.state.clone(),
            position,
        };
        self.checkpoints
            .save(Checkpoint::new(
                loop_ctx.session.thread_id.clone(),
                loop_ctx.step,
                snapshot.encode()?,
            ))
            .await?;
        Ok(())
    }
}

/// Mutable context threaded through one turn's step loop.
struct StepLoop<'a> {
    ctx: &'a TenantContext,
    session: &'a ConversationSession,
    workflow: &'a Workflow,
    definition: &'a WorkflowDefinition,
    execution_id: Uuid,
    state: WorkflowState,
    current: String,
    step: i64,
    routing_meta: Option<Value>,
    emitter: &'a WorkflowEmitter,
}
