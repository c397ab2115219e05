//! Provider settings endpoints. Selection rows live in the relational
//! tier; credentials go straight to the secret store and never appear in
//! responses.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::models::{ChatSelection, EmbeddingSelection};
use crate::providers::EmbeddingProvider;
use crate::secrets::{chat_provider_path, embedding_provider_path, SecretStore};
use crate::vector::VectorIndex;
use crate::store;
use crate::tenant::TenantContext;

use super::{ApiError, AppState, Authed};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/settings/embedding-provider",
            get(get_embedding).put(put_embedding),
        )
        .route("/settings/embedding-provider/test", post(test_embedding))
        .route("/settings/llm-provider", get(get_chat).put(put_chat))
}

fn require_settings_role(ctx: &TenantContext) -> Result<(), ApiError> {
    if !ctx.role.can_manage_settings() {
        return Err(ApiError::forbidden(
            "only tenant administrators may change provider settings",
        ));
    }
    Ok(())
}

async fn get_embedding(
    State(state): State<AppState>,
    Authed(ctx): Authed,
) -> Result<Json<EmbeddingSelection>, ApiError> {
    store::tenant_config::get(&state.pool, ctx.tenant_id)
        .await?
        .and_then(|c| c.embedding)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no embedding provider configured"))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EmbeddingUpdate {
    provider: String,
    model: String,
    dimensions: u32,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
}

async fn put_embedding(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Json(update): Json<EmbeddingUpdate>,
) -> Result<Json<Value>, ApiError> {
    require_settings_role(&ctx)?;
    if update.dimensions == 0 {
        return Err(ApiError::bad_request("dimensions must be positive"));
    }

    // A dimension change against an existing collection is a conflict;
    // reindexing is an explicit operation, not a side effect of settings.
    state
        .vector
        .ensure_collection(ctx.tenant_id, update.dimensions)
        .await?;

    if let Some(api_key) = &update.api_key {
        state
            .secrets
            .put(
                ctx.tenant_id,
                &embedding_provider_path(&update.provider),
                json!({ "api_key": api_key }).to_string().as_bytes(),
            )
            .await?;
    }

    let selection = EmbeddingSelection {
        provider: update.provider,
        model: update.model,
        dimensions: update.dimensions,
        base_url: update.base_url,
    };
    store::tenant_config::put_embedding(&state.pool, ctx.tenant_id, &selection).await?;
    Ok(Json(json!({ "message": "embedding provider updated", "provider": selection.provider })))
}

async fn test_embedding(
    State(state): State<AppState>,
    Authed(ctx): Authed,
) -> Result<Json<Value>, ApiError> {
    let selection = store::tenant_config::get(&state.pool, ctx.tenant_id)
        .await?
        .and_then(|c| c.embedding)
        .ok_or_else(|| ApiError::not_found("no embedding provider configured"))?;
    let provider = state
        .providers
        .embedding_for(ctx.tenant_id, &selection)
        .await?;
    provider.probe().await?;
    Ok(Json(json!({
        "status": "ok",
        "provider": selection.provider,
        "model": selection.model,
        "dimensions": selection.dimensions,
    })))
}

async fn get_chat(
    State(state): State<AppState>,
    Authed(ctx): Authed,
) -> Result<Json<ChatSelection>, ApiError> {
    store::tenant_config::get(&state.pool, ctx.tenant_id)
        .await?
        .and_then(|c| c.chat)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no chat provider configured"))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ChatUpdate {
    provider: String,
    model: String,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
}

async fn put_chat(
    State(state): State<AppState>,
    Authed(ctx): Authed,
    Json(update): Json<ChatUpdate>,
) -> Result<Json<Value>, ApiError> {
    require_settings_role(&ctx)?;

    if let Some(api_key) = &update.api_key {
        state
            .secrets
            .put(
                ctx.tenant_id,
                &chat_provider_path(&update.provider),
                json!({ "api_key": api_key }).to_string().as_bytes(),
            )
            .await?;
    }

    let selection = ChatSelection {
        provider: update.provider,
        model: update.model,
        base_url: update.base_url,
    };
    store::tenant_config::put_chat(&state.pool, ctx.tenant_id, &selection).await?;
    Ok(Json(json!({ "message": "chat provider updated", "provider": selection.provider })))
}
