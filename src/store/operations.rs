//! LLM operation rows and their guarded status transitions.
//!
//! Terminal writes are guarded on the current status so the first
//! `processing -> {completed | failed}` wins; a late writer (timed-out task,
//! discarded provider response) affects zero rows and its result is dropped.

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::models::{LlmOperation, OperationStatus, OperationType};

use super::{
    get_datetime, get_datetime_opt, get_enum, get_json, get_json_opt, get_uuid, get_uuid_opt,
    Result,
};

fn map_operation(row: &SqliteRow) -> Result<LlmOperation> {
    Ok(LlmOperation {
        id: get_uuid(row, "id")?,
        tenant_id: get_uuid(row, "tenant_id")?,
        user_id: get_uuid(row, "user_id")?,
        document_id: get_uuid_opt(row, "document_id")?,
        operation_type: get_enum(row, "operation_type", OperationType::parse)?,
        input_data: get_json(row, "input_data")?,
        output_data: get_json_opt(row, "output_data")?,
        model_used: row.try_get("model_used")?,
        tokens_used: row.try_get("tokens_used")?,
        cost_estimate: row.try_get("cost_estimate")?,
        status: get_enum(row, "status", OperationStatus::parse)?,
        error_message: row.try_get("error_message")?,
        created_at: get_datetime(row, "created_at")?,
        completed_at: get_datetime_opt(row, "completed_at")?,
    })
}

pub async fn insert(pool: &SqlitePool, op: &LlmOperation) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO llm_operations (
            id, tenant_id, user_id, document_id, operation_type, input_data,
            output_data, model_used, tokens_used, cost_estimate, status,
            error_message, created_at, completed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
    )
    .bind(op.id.to_string())
    .bind(op.tenant_id.to_string())
    .bind(op.user_id.to_string())
    .bind(op.document_id.map(|id| id.to_string()))
    .bind(op.operation_type.as_str())
    .bind(op.input_data.to_string())
    .bind(op.output_data.as_ref().map(|v| v.to_string()))
    .bind(&op.model_used)
    .bind(op.tokens_used)
    .bind(op.cost_estimate)
    .bind(op.status.as_str())
    .bind(&op.error_message)
    .bind(op.created_at.to_rfc3339())
    .bind(op.completed_at.map(|dt| dt.to_rfc3339()))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, tenant_id: Uuid, id: Uuid) -> Result<Option<LlmOperation>> {
    let row = sqlx::query("SELECT * FROM llm_operations WHERE id = ?1 AND tenant_id = ?2")
        .bind(id.to_string())
        .bind(tenant_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_operation).transpose()
}

pub async fn list(
    pool: &SqlitePool,
    tenant_id: Uuid,
    skip: i64,
    limit: i64,
) -> Result<Vec<LlmOperation>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM llm_operations WHERE tenant_id = ?1
        ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3
        "#,
    )
    .bind(tenant_id.to_string())
    .bind(limit)
    .bind(skip)
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_operation).collect()
}

/// `pending -> processing`. Returns false if the row was already past
/// pending (cancelled before the task started).
pub async fn mark_processing(pool: &SqlitePool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE llm_operations SET status = 'processing' WHERE id = ?1 AND status = 'pending'",
    )
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Atomic terminal transition to `completed`, setting output and timestamps
/// in one statement. Only succeeds from `processing`.
pub async fn complete(
    pool: &SqlitePool,
    id: Uuid,
    output_data: &serde_json::Value,
    model_used: Option<&str>,
    tokens_used: Option<i64>,
    cost_estimate: Option<f64>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE llm_operations
        SET status = 'completed', output_data = ?1, model_used = ?2,
            tokens_used = ?3, cost_estimate = ?4, completed_at = ?5
        WHERE id = ?6 AND status = 'processing'
        "#,
    )
    .bind(output_data.to_string())
    .bind(model_used)
    .bind(tokens_used)
    .bind(cost_estimate)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Atomic terminal transition to `failed` from any non-terminal status.
pub async fn fail(pool: &SqlitePool, id: Uuid, error_message: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE llm_operations
        SET status = 'failed', error_message = ?1, completed_at = ?2
        WHERE id = ?3 AND status IN ('pending', 'processing')
        "#,
    )
    .bind(error_message)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Most recent completed summarize operation for a document. Ties on
/// `created_at` break by id, lexicographically descending, so the pick is
/// deterministic.
pub async fn latest_completed_summarize(
    pool: &SqlitePool,
    tenant_id: Uuid,
    document_id: Uuid,
) -> Result<Option<LlmOperation>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM llm_operations
        WHERE tenant_id = ?1 AND document_id = ?2
          AND operation_type = 'summarize' AND status = 'completed'
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(tenant_id.to_string())
    .bind(document_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(map_operation).transpose()
}
