//! The `{detail}` error envelope and mappings from service errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::checkpoint::CheckpointError;
use crate::engine::EngineError;
use crate::executor::ExecutorError;
use crate::graph::BuildError;
use crate::hitl::HitlError;
use crate::ingest::PipelineError;
use crate::providers::ProviderError;
use crate::secrets::SecretError;
use crate::session::SessionError;
use crate::store::StoreError;
use crate::vector::VectorError;

/// An HTTP-mapped error. Every non-2xx body is `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    #[must_use]
    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing or invalid bearer token")
    }

    #[must_use]
    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, detail)
    }

    #[must_use]
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    #[must_use]
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, detail)
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, detail = %self.detail, "request failed");
        }
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        let status = match &e {
            ProviderError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProviderError::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProviderError::Auth { .. }
            | ProviderError::ModelNotFound { .. }
            | ProviderError::Permanent { .. } => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::Conflict(_) => Self::conflict(e.to_string()),
            _ => Self::internal(e.to_string()),
        }
    }
}

impl From<VectorError> for ApiError {
    fn from(e: VectorError) -> Self {
        match &e {
            VectorError::DimensionMismatch { .. } => Self::conflict(e.to_string()),
            VectorError::NoCollection => Self::bad_request(e.to_string()),
            VectorError::Backend { .. } => Self::internal(e.to_string()),
        }
    }
}

impl From<SecretError> for ApiError {
    fn from(e: SecretError) -> Self {
        match &e {
            SecretError::NotFound { .. } => Self::not_found(e.to_string()),
            SecretError::Backend { .. } => Self::internal(e.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::NotFound => Self::not_found("document not found"),
            PipelineError::Validation(detail) => Self::bad_request(detail),
            PipelineError::Parse(parse) => Self::bad_request(parse.to_string()),
            PipelineError::Provider(provider) => provider.into(),
            PipelineError::Vector(vector) => vector.into(),
            PipelineError::Store(store) => store.into(),
            PipelineError::Io(io) => Self::internal(io.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound => Self::not_found("operation not found"),
            EngineError::Validation(detail) => Self::bad_request(detail),
            EngineError::Conflict(detail) => Self::conflict(detail),
            EngineError::Store(store) => store.into(),
            EngineError::Provider(provider) => provider.into(),
            EngineError::Pipeline(pipeline) => pipeline.into(),
        }
    }
}

impl From<BuildError> for ApiError {
    fn from(e: BuildError) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl From<CheckpointError> for ApiError {
    fn from(e: CheckpointError) -> Self {
        match &e {
            CheckpointError::ConcurrentUpdate { .. } => Self::conflict(e.to_string()),
            CheckpointError::Backend { .. } => Self::internal(e.to_string()),
        }
    }
}

impl From<ExecutorError> for ApiError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::SessionNotFound => Self::not_found("session not found"),
            ExecutorError::WorkflowNotFound => Self::not_found("workflow not found"),
            ExecutorError::NoDocuments => Self::bad_request(e.to_string()),
            ExecutorError::AwaitingApproval | ExecutorError::NotInterrupted => {
                Self::conflict(e.to_string())
            }
            ExecutorError::Validation(detail) => Self::bad_request(detail),
            ExecutorError::Build(build) => build.into(),
            ExecutorError::Checkpoint(checkpoint) => checkpoint.into(),
            ExecutorError::Store(store) => store.into(),
            ExecutorError::Node { .. } => Self::internal(e.to_string()),
            ExecutorError::Snapshot(err) => Self::internal(err.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound => Self::not_found("session not found"),
            SessionError::DocumentNotFound => Self::not_found("document not found"),
            SessionError::Validation(detail) => Self::bad_request(detail),
            SessionError::Store(store) => store.into(),
        }
    }
}

impl From<HitlError> for ApiError {
    fn from(e: HitlError) -> Self {
        match e {
            HitlError::NotFound => Self::not_found("approval not found"),
            HitlError::AlreadyResponded => Self::conflict("approval already responded"),
            HitlError::Store(store) => store.into(),
            HitlError::Executor(executor) => executor.into(),
        }
    }
}
