//! Human-in-the-loop approval endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::hitl::ApprovalResponse;
use crate::models::ApprovalStatus;

use super::{ApiError, AppState, Authed};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/hitl/approvals/pending", get(pending))
        .route("/hitl/approvals", get(list))
        .route("/hitl/approvals/{id}", get(get_approval))
        .route("/hitl/approvals/{id}/respond", post(respond))
}

async fn pending(
    State(state): State<AppState>,
    Authed(ctx): Authed,
) -> Result<Json<Value>, ApiError> {
    let approvals = state.hitl.list_pending(&ctx).await?;
    Ok(Json(json!({ "approvals": approvals })))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    status_filter: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = query
        .status_filter
        .as_deref()
        .map(|raw| {
            ApprovalStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status `{raw}`")))
        })
        .transpose()?;
    let approvals = state
        .hitl
        .list(&ctx, status, query.limit.clamp(1, 200), query.offset.max(0))
        .await?;
    Ok(Json(json!({ "approvals": approvals })))
}

async fn get_approval(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.hitl.get(&ctx, id).await?)))
}

async fn respond(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(id): Path<Uuid>,
    Json(response): Json<ApprovalResponse>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.hitl.respond(&ctx, id, response).await?;
    Ok(Json(json!(outcome)))
}
