//! HTTP boundary: bearer-token auth, the `/api/v1` router, and the SSE
//! adapter over the executor's event stream.
//!
//! Request framing and token issuance live outside this backend; the
//! [`AuthVerifier`] seam turns an opaque bearer token into a tenant
//! principal, and everything downstream takes the resulting
//! [`TenantContext`] explicitly.

pub mod documents;
pub mod error;
pub mod hitl;
pub mod llm;
pub mod sessions;
pub mod settings;
pub mod workflows;

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::routing::get;
use axum::{Json, Router};
use rustc_hash::FxHashMap;
use sqlx::SqlitePool;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::engine::OperationEngine;
use crate::executor::WorkflowExecutor;
use crate::hitl::HitlCoordinator;
use crate::ingest::DocumentPipeline;
use crate::providers::ProviderRegistry;
use crate::secrets::SecretStore;
use crate::session::SessionService;
use crate::tenant::{TenantContext, UserRole};
use crate::vector::VectorIndex;

pub use error::ApiError;

/// Principal resolved from a bearer token.
#[derive(Clone, Debug)]
pub struct Principal {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub role: UserRole,
}

/// Token validation seam. Issuance and user management are external; this
/// backend only maps a presented token to its principal.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<Principal>;
}

/// Static token table for development and tests.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: RwLock<FxHashMap<String, Principal>>,
}

impl StaticTokenVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, principal: Principal) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(token.into(), principal);
        }
    }
}

#[async_trait]
impl AuthVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<Principal> {
        self.tokens.read().ok()?.get(token).cloned()
    }
}

/// Shared service handles behind every route.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub pipeline: Arc<DocumentPipeline>,
    pub engine: Arc<OperationEngine>,
    pub executor: Arc<WorkflowExecutor>,
    pub sessions: Arc<SessionService>,
    pub hitl: Arc<HitlCoordinator>,
    pub providers: Arc<ProviderRegistry>,
    pub secrets: Arc<dyn SecretStore>,
    pub vector: Arc<dyn VectorIndex>,
    pub auth: Arc<dyn AuthVerifier>,
}

/// Authenticated tenant principal, extracted from the `Authorization`
/// header. A fresh correlation id is minted per request.
pub struct Authed(pub TenantContext);

impl FromRequestParts<AppState> for Authed {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(ApiError::unauthorized)?;
        let principal = state
            .auth
            .verify(token)
            .await
            .ok_or_else(ApiError::unauthorized)?;
        Ok(Authed(TenantContext::new(
            principal.tenant_id,
            principal.user_id,
            principal.role,
        )))
    }
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .merge(documents::routes())
        .merge(llm::routes())
        .merge(settings::routes())
        .merge(workflows::routes())
        .merge(sessions::routes())
        .merge(hitl::routes());

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", v1)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
