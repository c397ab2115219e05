//! Human-in-the-loop approval rows.
//!
//! The `idx_hitl_one_pending` partial unique index keeps at most one pending
//! approval per execution; inserting a second surfaces as a conflict.

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::models::{ApprovalStatus, HitlApproval};

use super::{get_datetime, get_datetime_opt, get_enum, get_json, get_json_opt, get_uuid, Result, StoreError};

fn map_approval(row: &SqliteRow) -> Result<HitlApproval> {
    Ok(HitlApproval {
        id: get_uuid(row, "id")?,
        execution_id: get_uuid(row, "execution_id")?,
        tenant_id: get_uuid(row, "tenant_id")?,
        user_id: get_uuid(row, "user_id")?,
        prompt: row.try_get("prompt")?,
        context_data: get_json(row, "context_data")?,
        status: get_enum(row, "status", ApprovalStatus::parse)?,
        user_response: get_json_opt(row, "user_response")?,
        created_at: get_datetime(row, "created_at")?,
        responded_at: get_datetime_opt(row, "responded_at")?,
    })
}

pub async fn insert(pool: &SqlitePool, approval: &HitlApproval) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO hitl_approvals (
            id, execution_id, tenant_id, user_id, prompt, context_data,
            status, user_response, created_at, responded_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(approval.id.to_string())
    .bind(approval.execution_id.to_string())
    .bind(approval.tenant_id.to_string())
    .bind(approval.user_id.to_string())
    .bind(&approval.prompt)
    .bind(approval.context_data.to_string())
    .bind(approval.status.as_str())
    .bind(approval.user_response.as_ref().map(|v| v.to_string()))
    .bind(approval.created_at.to_rfc3339())
    .bind(approval.responded_at.map(|dt| dt.to_rfc3339()))
    .execute(pool)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict("an approval is already pending for this execution")
        }
        _ => StoreError::Database(e),
    })?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, tenant_id: Uuid, id: Uuid) -> Result<Option<HitlApproval>> {
    let row = sqlx::query("SELECT * FROM hitl_approvals WHERE id = ?1 AND tenant_id = ?2")
        .bind(id.to_string())
        .bind(tenant_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_approval).transpose()
}

pub async fn list(
    pool: &SqlitePool,
    tenant_id: Uuid,
    user_id: Uuid,
    status_filter: Option<ApprovalStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<HitlApproval>> {
    let rows = match status_filter {
        Some(status) => {
            sqlx::query(
                r#"
                SELECT * FROM hitl_approvals
                WHERE tenant_id = ?1 AND user_id = ?2 AND status = ?3
                ORDER BY created_at DESC LIMIT ?4 OFFSET ?5
                "#,
            )
            .bind(tenant_id.to_string())
            .bind(user_id.to_string())
            .bind(status.as_str())
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                SELECT * FROM hitl_approvals
                WHERE tenant_id = ?1 AND user_id = ?2
                ORDER BY created_at DESC LIMIT ?3 OFFSET ?4
                "#,
            )
            .bind(tenant_id.to_string())
            .bind(user_id.to_string())
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await?
        }
    };
    rows.iter().map(map_approval).collect()
}

/// Record the user's decision. Only a pending row can transition; a replay
/// affects zero rows and the coordinator reports `AlreadyResponded`.
pub async fn respond(
    pool: &SqlitePool,
    tenant_id: Uuid,
    id: Uuid,
    status: ApprovalStatus,
    user_response: &serde_json::Value,
) -> Result<bool> {
    debug_assert!(matches!(
        status,
        ApprovalStatus::Approved | ApprovalStatus::Rejected
    ));
    let result = sqlx::query(
        r#"
        UPDATE hitl_approvals
        SET status = ?1, user_response = ?2, responded_at = ?3
        WHERE id = ?4 AND tenant_id = ?5 AND status = 'pending'
        "#,
    )
    .bind(status.as_str())
    .bind(user_response.to_string())
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .bind(tenant_id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
