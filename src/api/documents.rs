//! Document endpoints: upload, listing, chunks, deletion, and search.

use axum::extract::{Multipart, Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::DocumentStatus;
use crate::store;

use super::{ApiError, AppState, Authed};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/documents/upload", post(upload))
        .route("/documents", get(list))
        .route("/documents/{id}", get(get_document).delete(delete_document))
        .route("/documents/{id}/chunks", get(chunks))
        .route("/documents/search", post(search))
}

async fn upload(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {e}")))?
    {
        if field.name() == Some("file") || upload.is_none() {
            let filename = field
                .file_name()
                .map(str::to_string)
                .ok_or_else(|| ApiError::bad_request("file part must carry a filename"))?;
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(format!("failed reading upload: {e}")))?;
            upload = Some((filename, bytes.to_vec()));
        }
    }
    let (filename, bytes) =
        upload.ok_or_else(|| ApiError::bad_request("multipart body must contain a file part"))?;
    if bytes.is_empty() {
        return Err(ApiError::bad_request("uploaded file is empty"));
    }

    let document = state.pipeline.ingest(&ctx, &filename, bytes).await?;
    Ok(Json(json!({
        "document_id": document.id,
        "filename": document.filename,
        "file_size": document.file_size,
        "status": document.status,
        "message": "document accepted for processing",
    })))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    status_filter: Option<String>,
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
            DocumentStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status `{raw}`")))
        })
        .transpose()?;
    let documents = store::documents::list(
        &state.pool,
        ctx.tenant_id,
        query.skip.max(0),
        query.limit.clamp(1, 200),
        status,
    )
    .await?;
    Ok(Json(json!({ "documents": documents, "skip": query.skip, "limit": query.limit })))
}

async fn get_document(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let document = store::documents::get(&state.pool, ctx.tenant_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("document not found"))?;
    Ok(Json(serde_json::to_value(document).unwrap_or(Value::Null)))
}

async fn delete_document(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    state.pipeline.delete(&ctx, id).await?;
    Ok(Json(json!({ "message": "document deleted" })))
}

async fn chunks(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    store::documents::get(&state.pool, ctx.tenant_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("document not found"))?;
    let chunks = store::documents::list_chunks(&state.pool, ctx.tenant_id, id).await?;
    Ok(Json(json!({ "document_id": id, "chunks": chunks })))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchRequest {
    query: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
    #[serde(default)]
    score_threshold: f32,
    #[serde(default)]
    filter_metadata: Option<SearchFilterBody>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchFilterBody {
    #[serde(default)]
    document_ids: Option<Vec<Uuid>>,
}

fn default_search_limit() -> usize {
    10
}

async fn search(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Json(request): Json<SearchRequest>,
) -> Result<Json<Value>, ApiError> {
    let document_ids = request.filter_metadata.and_then(|f| f.document_ids);
    let results = state
        .pipeline
        .search(
            &ctx,
            &request.query,
            request.limit.min(100),
            request.score_threshold,
            document_ids,
        )
        .await?;
    Ok(Json(json!({ "query": request.query, "results": results })))
}
