//! Per-tenant provider selection. The embedding and chat halves are
//! upserted independently by the settings endpoints.

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::models::{ChatSelection, EmbeddingSelection, TenantConfig};

use super::{get_datetime, get_uuid, Result};

fn map_config(row: &SqliteRow) -> Result<TenantConfig> {
    let embedding = match (
        row.try_get::<Option<String>, _>("embedding_provider")?,
        row.try_get::<Option<String>, _>("embedding_model")?,
        row.try_get::<Option<i64>, _>("embedding_dimensions")?,
    ) {
        (Some(provider), Some(model), Some(dimensions)) => Some(EmbeddingSelection {
            provider,
            model,
            dimensions: dimensions as u32,
            base_url: row.try_get("embedding_base_url")?,
        }),
        _ => None,
    };
    let chat = match (
        row.try_get::<Option<String>, _>("chat_provider")?,
        row.try_get::<Option<String>, _>("chat_model")?,
    ) {
        (Some(provider), Some(model)) => Some(ChatSelection {
            provider,
            model,
            base_url: row.try_get("chat_base_url")?,
        }),
        _ => None,
    };
    Ok(TenantConfig {
        tenant_id: get_uuid(row, "tenant_id")?,
        embedding,
        chat,
        updated_at: get_datetime(row, "updated_at")?,
    })
}

pub async fn get(pool: &SqlitePool, tenant_id: Uuid) -> Result<Option<TenantConfig>> {
    let row = sqlx::query("SELECT * FROM tenant_configs WHERE tenant_id = ?1")
        .bind(tenant_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_config).transpose()
}

pub async fn put_embedding(
    pool: &SqlitePool,
    tenant_id: Uuid,
    selection: &EmbeddingSelection,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tenant_configs (
            tenant_id, embedding_provider, embedding_model, embedding_dimensions,
            embedding_base_url, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT (tenant_id) DO UPDATE SET
            embedding_provider = excluded.embedding_provider,
            embedding_model = excluded.embedding_model,
            embedding_dimensions = excluded.embedding_dimensions,
            embedding_base_url = excluded.embedding_base_url,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(tenant_id.to_string())
    .bind(&selection.provider)
    .bind(&selection.model)
    .bind(selection.dimensions as i64)
    .bind(&selection.base_url)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn put_chat(pool: &SqlitePool, tenant_id: Uuid, selection: &ChatSelection) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tenant_configs (tenant_id, chat_provider, chat_model, chat_base_url, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (tenant_id) DO UPDATE SET
            chat_provider = excluded.chat_provider,
            chat_model = excluded.chat_model,
            chat_base_url = excluded.chat_base_url,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(tenant_id.to_string())
    .bind(&selection.provider)
    .bind(&selection.model)
    .bind(&selection.base_url)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}
