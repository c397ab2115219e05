//! Session context endpoints: document bridges, mode, and the aggregate
//! context view.

use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::SessionMode;

use super::{ApiError, AppState, Authed};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/sessions/{id}/documents",
            get(list_documents).post(add_document),
        )
        .route(
            "/sessions/{id}/documents/{document_id}",
            axum::routing::delete(remove_document),
        )
        .route("/sessions/{id}/mode", put(update_mode))
        .route("/sessions/{id}/context", get(context))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AddDocument {
    document_id: Uuid,
}

async fn add_document(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(id): Path<Uuid>,
    Json(request): Json<AddDocument>,
) -> Result<Json<Value>, ApiError> {
    state
        .sessions
        .add_document(&ctx, id, request.document_id)
        .await?;
    Ok(Json(json!({ "message": "document added to session" })))
}

async fn remove_document(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path((id, document_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Value>, ApiError> {
    state.sessions.remove_document(&ctx, id, document_id).await?;
    Ok(Json(json!({ "message": "document removed from session" })))
}

async fn list_documents(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let documents = state.sessions.list_documents(&ctx, id).await?;
    Ok(Json(json!({ "documents": documents })))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateMode {
    mode: SessionMode,
}

async fn update_mode(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateMode>,
) -> Result<Json<Value>, ApiError> {
    let session = state.sessions.update_mode(&ctx, id, request.mode).await?;
    Ok(Json(json!({ "session_id": session.id, "mode": session.mode })))
}

async fn context(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let view = state.sessions.context(&ctx, id).await?;
    Ok(Json(json!(view)))
}
