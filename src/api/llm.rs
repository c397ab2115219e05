//! Async LLM operation endpoints. Submission returns `{operation_id,
//! status}` immediately; clients poll the operation until it is terminal.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::engine::{AskRequest, SummarizeRequest, TransformRequest};
use crate::models::LlmOperation;

use super::{ApiError, AppState, Authed};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/llm/documents/summarize", post(summarize))
        .route("/llm/documents/ask", post(ask))
        .route("/llm/documents/transform", post(transform))
        .route("/llm/operations", get(list))
        .route("/llm/operations/{id}", get(get_operation).delete(cancel))
        .route("/llm/documents/{id}/summarize/latest", get(latest_summary))
}

fn submission_response(operation: &LlmOperation) -> Json<Value> {
    Json(json!({
        "operation_id": operation.id,
        "status": operation.status,
        "message": "operation accepted; poll /llm/operations/{id} for the result",
    }))
}

async fn summarize(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Json(request): Json<SummarizeRequest>,
) -> Result<Json<Value>, ApiError> {
    let operation = state.engine.summarize(&ctx, request).await?;
    Ok(submission_response(&operation))
}

async fn ask(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Json(request): Json<AskRequest>,
) -> Result<Json<Value>, ApiError> {
    let operation = state.engine.ask(&ctx, request).await?;
    Ok(submission_response(&operation))
}

async fn transform(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Json(request): Json<TransformRequest>,
) -> Result<Json<Value>, ApiError> {
    let operation = state.engine.transform(&ctx, request).await?;
    Ok(submission_response(&operation))
}

async fn get_operation(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(id): Path<Uuid>,
) -> Result<Json<LlmOperation>, ApiError> {
    Ok(Json(state.engine.get(&ctx, id).await?))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let operations = state
        .engine
        .list(&ctx, query.skip.max(0), query.limit.clamp(1, 200))
        .await?;
    Ok(Json(json!({ "operations": operations })))
}

async fn cancel(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let operation = state.engine.cancel(&ctx, id).await?;
    Ok(Json(json!({
        "operation_id": operation.id,
        "status": operation.status,
        "cancelled": true,
    })))
}

async fn latest_summary(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(id): Path<Uuid>,
) -> Result<Json<LlmOperation>, ApiError> {
    state
        .engine
        .latest_summary(&ctx, id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no completed summary for this document"))
}
