//! Workflow execution rows and workflow definitions.

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::models::{ExecutionStatus, WorkflowDefinitionRow, WorkflowExecution};

use super::{
    get_datetime, get_datetime_opt, get_enum, get_json, get_json_opt, get_uuid, get_uuid_opt,
    Result,
};

fn map_execution(row: &SqliteRow) -> Result<WorkflowExecution> {
    Ok(WorkflowExecution {
        id: get_uuid(row, "id")?,
        tenant_id: get_uuid(row, "tenant_id")?,
        user_id: get_uuid(row, "user_id")?,
        workflow_id: get_uuid_opt(row, "workflow_id")?,
        session_id: get_uuid(row, "session_id")?,
        thread_id: row.try_get("thread_id")?,
        status: get_enum(row, "status", ExecutionStatus::parse)?,
        input_data: get_json(row, "input_data")?,
        output_data: get_json_opt(row, "output_data")?,
        error_message: row.try_get("error_message")?,
        started_at: get_datetime(row, "started_at")?,
        completed_at: get_datetime_opt(row, "completed_at")?,
    })
}

fn map_definition(row: &SqliteRow) -> Result<WorkflowDefinitionRow> {
    Ok(WorkflowDefinitionRow {
        id: get_uuid(row, "id")?,
        tenant_id: get_uuid(row, "tenant_id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        description: row.try_get("description")?,
        nodes: get_json(row, "nodes_json")?,
        edges: get_json(row, "edges_json")?,
        is_active: {
            let active: i64 = row.try_get("is_active")?;
            active != 0
        },
    })
}

pub async fn insert(pool: &SqlitePool, execution: &WorkflowExecution) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO workflow_executions (
            id, tenant_id, user_id, workflow_id, session_id, thread_id, status,
            input_data, output_data, error_message, started_at, completed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
    )
    .bind(execution.id.to_string())
    .bind(execution.tenant_id.to_string())
    .bind(execution.user_id.to_string())
    .bind(execution.workflow_id.map(|id| id.to_string()))
    .bind(execution.session_id.to_string())
    .bind(&execution.thread_id)
    .bind(execution.status.as_str())
    .bind(execution.input_data.to_string())
    .bind(execution.output_data.as_ref().map(|v| v.to_string()))
    .bind(&execution.error_message)
    .bind(execution.started_at.to_rfc3339())
    .bind(execution.completed_at.map(|dt| dt.to_rfc3339()))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(
    pool: &SqlitePool,
    tenant_id: Uuid,
    id: Uuid,
) -> Result<Option<WorkflowExecution>> {
    let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = ?1 AND tenant_id = ?2")
        .bind(id.to_string())
        .bind(tenant_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_execution).transpose()
}

/// Move a running execution into `interrupted`.
pub async fn mark_interrupted(pool: &SqlitePool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE workflow_executions SET status = 'interrupted' WHERE id = ?1 AND status = 'running'",
    )
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Move an interrupted execution back into `running` for resume.
pub async fn mark_running(pool: &SqlitePool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE workflow_executions SET status = 'running' WHERE id = ?1 AND status = 'interrupted'",
    )
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Terminal transition; writes output or error together with `completed_at`.
pub async fn finish(
    pool: &SqlitePool,
    id: Uuid,
    status: ExecutionStatus,
    output_data: Option<&serde_json::Value>,
    error_message: Option<&str>,
) -> Result<bool> {
    debug_assert!(matches!(
        status,
        ExecutionStatus::Completed | ExecutionStatus::Failed
    ));
    let result = sqlx::query(
        r#"
        UPDATE workflow_executions
        SET status = ?1, output_data = ?2, error_message = ?3, completed_at = ?4
        WHERE id = ?5 AND status IN ('running', 'interrupted')
        "#,
    )
    .bind(status.as_str())
    .bind(output_data.map(|v| v.to_string()))
    .bind(error_message)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn insert_definition(pool: &SqlitePool, def: &WorkflowDefinitionRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO workflow_definitions (
            id, tenant_id, name, version, description, nodes_json, edges_json, is_active
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(def.id.to_string())
    .bind(def.tenant_id.to_string())
    .bind(&def.name)
    .bind(def.version)
    .bind(&def.description)
    .bind(def.nodes.to_string())
    .bind(def.edges.to_string())
    .bind(if def.is_active { 1i64 } else { 0i64 })
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_definition(
    pool: &SqlitePool,
    tenant_id: Uuid,
    id: Uuid,
) -> Result<Option<WorkflowDefinitionRow>> {
    let row = sqlx::query(
        "SELECT * FROM workflow_definitions WHERE id = ?1 AND tenant_id = ?2 AND is_active = 1",
    )
    .bind(id.to_string())
    .bind(tenant_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(map_definition).transpose()
}
