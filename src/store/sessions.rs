//! Conversation sessions, their messages, and document bridges.

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::message::Role;
use crate::models::{ConversationSession, SessionDocument, SessionMode, StoredMessage};

use super::{get_datetime, get_enum, get_json, get_uuid, get_uuid_opt, Result};

fn map_session(row: &SqliteRow) -> Result<ConversationSession> {
    Ok(ConversationSession {
        id: get_uuid(row, "id")?,
        tenant_id: get_uuid(row, "tenant_id")?,
        user_id: get_uuid(row, "user_id")?,
        workflow_id: get_uuid_opt(row, "workflow_id")?,
        thread_id: row.try_get("thread_id")?,
        title: row.try_get("title")?,
        mode: get_enum(row, "mode", SessionMode::parse)?,
        metadata: get_json(row, "metadata")?,
        created_at: get_datetime(row, "created_at")?,
        updated_at: get_datetime(row, "updated_at")?,
    })
}

fn map_message(row: &SqliteRow) -> Result<StoredMessage> {
    Ok(StoredMessage {
        id: get_uuid(row, "id")?,
        session_id: get_uuid(row, "session_id")?,
        role: get_enum(row, "role", Role::parse)?,
        content: row.try_get("content")?,
        metadata: get_json(row, "metadata")?,
        created_at: get_datetime(row, "created_at")?,
    })
}

pub async fn insert(pool: &SqlitePool, session: &ConversationSession) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO conversation_sessions (
            id, tenant_id, user_id, workflow_id, thread_id, title, mode,
            metadata, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(session.id.to_string())
    .bind(session.tenant_id.to_string())
    .bind(session.user_id.to_string())
    .bind(session.workflow_id.map(|id| id.to_string()))
    .bind(&session.thread_id)
    .bind(&session.title)
    .bind(session.mode.as_str())
    .bind(session.metadata.to_string())
    .bind(session.created_at.to_rfc3339())
    .bind(session.updated_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(
    pool: &SqlitePool,
    tenant_id: Uuid,
    id: Uuid,
) -> Result<Option<ConversationSession>> {
    let row = sqlx::query("SELECT * FROM conversation_sessions WHERE id = ?1 AND tenant_id = ?2")
        .bind(id.to_string())
        .bind(tenant_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_session).transpose()
}

pub async fn list(
    pool: &SqlitePool,
    tenant_id: Uuid,
    user_id: Uuid,
    limit: i64,
    offset: i64,
) -> Result<Vec<ConversationSession>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM conversation_sessions
        WHERE tenant_id = ?1 AND user_id = ?2
        ORDER BY updated_at DESC LIMIT ?3 OFFSET ?4
        "#,
    )
    .bind(tenant_id.to_string())
    .bind(user_id.to_string())
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_session).collect()
}

pub async fn set_mode(pool: &SqlitePool, tenant_id: Uuid, id: Uuid, mode: SessionMode) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE conversation_sessions SET mode = ?1, updated_at = ?2
        WHERE id = ?3 AND tenant_id = ?4
        "#,
    )
    .bind(mode.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .bind(tenant_id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn touch(pool: &SqlitePool, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE conversation_sessions SET updated_at = ?1 WHERE id = ?2")
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn insert_message(pool: &SqlitePool, message: &StoredMessage) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO messages (id, session_id, role, content, metadata, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(message.id.to_string())
    .bind(message.session_id.to_string())
    .bind(message.role.as_str())
    .bind(&message.content)
    .bind(message.metadata.to_string())
    .bind(message.created_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Messages in creation order, oldest first.
pub async fn list_messages(
    pool: &SqlitePool,
    session_id: Uuid,
    limit: i64,
) -> Result<Vec<StoredMessage>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM messages WHERE session_id = ?1
        ORDER BY created_at ASC, id ASC LIMIT ?2
        "#,
    )
    .bind(session_id.to_string())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_message).collect()
}

/// Insert or reactivate a session-document bridge (idempotent).
pub async fn upsert_session_document(
    pool: &SqlitePool,
    session_id: Uuid,
    document_id: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO session_documents (session_id, document_id, added_at, is_active)
        VALUES (?1, ?2, ?3, 1)
        ON CONFLICT (session_id, document_id)
        DO UPDATE SET is_active = 1, added_at = excluded.added_at
        "#,
    )
    .bind(session_id.to_string())
    .bind(document_id.to_string())
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Soft-remove the bridge by flipping `is_active`.
pub async fn deactivate_session_document(
    pool: &SqlitePool,
    session_id: Uuid,
    document_id: Uuid,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE session_documents SET is_active = 0
        WHERE session_id = ?1 AND document_id = ?2 AND is_active = 1
        "#,
    )
    .bind(session_id.to_string())
    .bind(document_id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Active bridges only, in the order documents were added.
pub async fn list_session_documents(
    pool: &SqlitePool,
    session_id: Uuid,
) -> Result<Vec<SessionDocument>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM session_documents
        WHERE session_id = ?1 AND is_active = 1
        ORDER BY added_at ASC
        "#,
    )
    .bind(session_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(SessionDocument {
                session_id: get_uuid(row, "session_id")?,
                document_id: get_uuid(row, "document_id")?,
                added_at: get_datetime(row, "added_at")?,
                is_active: {
                    let active: i64 = row.try_get("is_active")?;
                    active != 0
                },
            })
        })
        .collect()
}
