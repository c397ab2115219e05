//! Workflow execution endpoints, including the SSE stream.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::executor::ResumeInput;
use crate::message::Role;
use crate::session::CreateSession;
use crate::tenant::TenantContext;

use super::{ApiError, AppState, Authed};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/workflows/execute", post(execute))
        .route("/workflows/execute/stream", get(execute_stream))
        .route("/workflows/resume", post(resume))
        .route("/workflows/sessions", post(create_session).get(list_sessions))
        .route("/workflows/sessions/{id}", get(get_session))
        .route(
            "/workflows/sessions/{id}/messages",
            get(list_messages).post(post_message),
        )
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecuteRequest {
    user_input: String,
    #[serde(default)]
    session_id: Option<Uuid>,
    #[serde(default)]
    workflow_id: Option<Uuid>,
}

async fn resolve_session(
    state: &AppState,
    ctx: &TenantContext,
    session_id: Option<Uuid>,
    workflow_id: Option<Uuid>,
) -> Result<Uuid, ApiError> {
    match session_id {
        Some(id) => Ok(state.sessions.get(ctx, id).await?.id),
        None => {
            let session = state
                .sessions
                .create(
                    ctx,
                    CreateSession {
                        workflow_id,
                        ..Default::default()
                    },
                )
                .await?;
            Ok(session.id)
        }
    }
}

async fn execute(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<Value>, ApiError> {
    let session_id =
        resolve_session(&state, &ctx, request.session_id, request.workflow_id).await?;
    let outcome = state
        .executor
        .execute(&ctx, session_id, &request.user_input, request.workflow_id)
        .await?;
    Ok(Json(json!(outcome)))
}

#[derive(Deserialize)]
struct StreamQuery {
    user_input: String,
    #[serde(default)]
    session_id: Option<Uuid>,
    #[serde(default)]
    workflow_id: Option<Uuid>,
}

/// Server-Sent Events stream of one turn: `start`, `update`s, then `done`
/// (or `error`). Events are informational; clients re-read persisted state
/// after reconnecting.
async fn execute_stream(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let session_id = resolve_session(&state, &ctx, query.session_id, query.workflow_id).await?;
    let rx = state
        .executor
        .stream(ctx, session_id, query.user_input, query.workflow_id);

    let sse_stream = async_stream::stream! {
        while let Ok(event) = rx.recv_async().await {
            let name = event.name();
            let sse = SseEvent::default().event(name).json_data(event.payload());
            match sse {
                Ok(sse) => yield Ok::<SseEvent, Infallible>(sse),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialise SSE payload");
                    continue;
                }
            }
            if matches!(name, "done" | "error") {
                break;
            }
        }
    };
    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ResumeRequest {
    session_id: Uuid,
    user_response: ResumeInput,
}

async fn resume(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Json(request): Json<ResumeRequest>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state
        .executor
        .resume(&ctx, request.session_id, request.user_response)
        .await?;
    Ok(Json(json!(outcome)))
}

async fn create_session(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Json(request): Json<CreateSession>,
) -> Result<Json<Value>, ApiError> {
    let session = state.sessions.create(&ctx, request).await?;
    Ok(Json(json!(session)))
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_sessions(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Query(query): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let sessions = state
        .sessions
        .list(&ctx, query.limit.clamp(1, 200), query.offset.max(0))
        .await?;
    Ok(Json(json!({ "sessions": sessions })))
}

async fn get_session(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.sessions.get(&ctx, id).await?)))
}

#[derive(Deserialize)]
struct MessagesQuery {
    #[serde(default = "default_message_limit")]
    limit: i64,
}

fn default_message_limit() -> i64 {
    100
}

async fn list_messages(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Value>, ApiError> {
    let messages = state
        .sessions
        .messages(&ctx, id, query.limit.clamp(1, 1000))
        .await?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PostMessage {
    role: Role,
    content: String,
}

async fn post_message(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(id): Path<Uuid>,
    Json(request): Json<PostMessage>,
) -> Result<Json<Value>, ApiError> {
    let message = state
        .sessions
        .add_message(&ctx, id, request.role, &request.content)
        .await?;
    Ok(Json(json!(message)))
}
