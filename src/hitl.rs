//! Human-in-the-loop coordinator.
//!
//! Executions park behind a pending approval row; responding records the
//! decision atomically and hands the thread back to the executor's
//! `resume`. A second response to the same approval is rejected.

use miette::Diagnostic;
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::executor::{ExecutorError, ResumeInput, TurnOutcome, WorkflowExecutor};
use crate::models::{ApprovalStatus, HitlApproval};
use crate::store::{self, StoreError};
use crate::tenant::TenantContext;

#[derive(Debug, Error, Diagnostic)]
pub enum HitlError {
    #[error("approval not found")]
    #[diagnostic(code(ragloom::hitl::not_found))]
    NotFound,

    #[error("approval already responded")]
    #[diagnostic(
        code(ragloom::hitl::already_responded),
        help("Each approval accepts exactly one response.")
    )]
    AlreadyResponded,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Executor(#[from] ExecutorError),
}

pub type Result<T> = std::result::Result<T, HitlError>;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApprovalResponse {
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

pub struct HitlCoordinator {
    pool: SqlitePool,
    executor: Arc<WorkflowExecutor>,
}

impl HitlCoordinator {
    #[must_use]
    pub fn new(pool: SqlitePool, executor: Arc<WorkflowExecutor>) -> Self {
        Self { pool, executor }
    }

    pub async fn get(&self, ctx: &TenantContext, id: Uuid) -> Result<HitlApproval> {
        store::hitl::get(&self.pool, ctx.tenant_id, id)
            .await?
            .ok_or(HitlError::NotFound)
    }

    pub async fn list_pending(&self, ctx: &TenantContext) -> Result<Vec<HitlApproval>> {
        Ok(store::hitl::list(
            &self.pool,
            ctx.tenant_id,
            ctx.user_id,
            Some(ApprovalStatus::Pending),
            100,
            0,
        )
        .await?)
    }

    pub async fn list(
        &self,
        ctx: &TenantContext,
        status_filter: Option<ApprovalStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<HitlApproval>> {
        Ok(store::hitl::list(&self.pool, ctx.tenant_id, ctx.user_id, status_filter, limit, offset)
            .await?)
    }

    /// Record the decision and resume the parked execution.
    ///
    /// The row update is atomic and only applies to a pending approval, so
    /// a replayed response fails with [`HitlError::AlreadyResponded`]
    /// before the executor is touched.
    #[instrument(skip(self, ctx, response), fields(tenant = %ctx.tenant_id, approval = %id))]
    pub async fn respond(
        &self,
        ctx: &TenantContext,
        id: Uuid,
        response: ApprovalResponse,
    ) -> Result<TurnOutcome> {
        let approval = self.get(ctx, id).await?;
        let status = if response.approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        let user_response = json!({
            "approved": response.approved,
            "feedback": response.feedback,
        });
        if !store::hitl::respond(&self.pool, ctx.tenant_id, id, status, &user_response).await? {
            return Err(HitlError::AlreadyResponded);
        }

        let execution = store::executions::get(&self.pool, ctx.tenant_id, approval.execution_id)
            .await?
            .ok_or(HitlError::NotFound)?;
        let outcome = self
            .executor
            .resume(
                ctx,
                execution.session_id,
                ResumeInput {
                    approved: response.approved,
                    feedback: response.feedback,
                    user_response: Some(user_response),
                },
            )
            .await?;
        Ok(outcome)
    }
}
