//! Document and chunk persistence.

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use crate::models::{Chunk, Document, DocumentStatus};

use super::{get_datetime, get_enum, get_json, get_uuid, Result, StoreError};

fn map_document(row: &SqliteRow) -> Result<Document> {
    Ok(Document {
        id: get_uuid(row, "id")?,
        tenant_id: get_uuid(row, "tenant_id")?,
        user_id: get_uuid(row, "user_id")?,
        filename: row.try_get("filename")?,
        file_path: row.try_get("file_path")?,
        file_size: row.try_get("file_size")?,
        file_type: row.try_get("file_type")?,
        status: get_enum(row, "status", DocumentStatus::parse)?,
        chunk_count: row.try_get("chunk_count")?,
        error_message: row.try_get("error_message")?,
        created_at: get_datetime(row, "created_at")?,
        updated_at: get_datetime(row, "updated_at")?,
    })
}

fn map_chunk(row: &SqliteRow) -> Result<Chunk> {
    Ok(Chunk {
        id: get_uuid(row, "id")?,
        document_id: get_uuid(row, "document_id")?,
        tenant_id: get_uuid(row, "tenant_id")?,
        chunk_index: row.try_get("chunk_index")?,
        content: row.try_get("content")?,
        token_count: row.try_get("token_count")?,
        start_char: row.try_get("start_char")?,
        end_char: row.try_get("end_char")?,
        metadata: get_json(row, "metadata")?,
    })
}

pub async fn insert(pool: &SqlitePool, document: &Document) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (
            id, tenant_id, user_id, filename, file_path, file_size, file_type,
            status, chunk_count, error_message, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
    )
    .bind(document.id.to_string())
    .bind(document.tenant_id.to_string())
    .bind(document.user_id.to_string())
    .bind(&document.filename)
    .bind(&document.file_path)
    .bind(document.file_size)
    .bind(&document.file_type)
    .bind(document.status.as_str())
    .bind(document.chunk_count)
    .bind(&document.error_message)
    .bind(document.created_at.to_rfc3339())
    .bind(document.updated_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, tenant_id: Uuid, id: Uuid) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?1 AND tenant_id = ?2")
        .bind(id.to_string())
        .bind(tenant_id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_document).transpose()
}

pub async fn list(
    pool: &SqlitePool,
    tenant_id: Uuid,
    skip: i64,
    limit: i64,
    status_filter: Option<DocumentStatus>,
) -> Result<Vec<Document>> {
    let rows = match status_filter {
        Some(status) => {
            sqlx::query(
                r#"
                SELECT * FROM documents
                WHERE tenant_id = ?1 AND status = ?2
                ORDER BY created_at DESC LIMIT ?3 OFFSET ?4
                "#,
            )
            .bind(tenant_id.to_string())
            .bind(status.as_str())
            .bind(limit)
            .bind(skip)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                SELECT * FROM documents
                WHERE tenant_id = ?1 AND status != 'deleted'
                ORDER BY created_at DESC LIMIT ?2 OFFSET ?3
                "#,
            )
            .bind(tenant_id.to_string())
            .bind(limit)
            .bind(skip)
            .fetch_all(pool)
            .await?
        }
    };
    rows.iter().map(map_document).collect()
}

/// Transition a document's status. Lifecycle checks live in the pipeline;
/// this only stamps `updated_at`.
pub async fn set_status(
    pool: &SqlitePool,
    tenant_id: Uuid,
    id: Uuid,
    status: DocumentStatus,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE documents SET status = ?1, error_message = ?2, updated_at = ?3
        WHERE id = ?4 AND tenant_id = ?5
        "#,
    )
    .bind(status.as_str())
    .bind(error_message)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .bind(tenant_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark ingestion complete, recording the final chunk count.
pub async fn mark_completed(
    pool: &SqlitePool,
    tenant_id: Uuid,
    id: Uuid,
    chunk_count: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE documents
        SET status = 'completed', chunk_count = ?1, error_message = NULL, updated_at = ?2
        WHERE id = ?3 AND tenant_id = ?4
        "#,
    )
    .bind(chunk_count)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .bind(tenant_id.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn insert_chunks(pool: &SqlitePool, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (
                id, document_id, tenant_id, chunk_index, content, token_count,
                start_char, end_char, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(chunk.id.to_string())
        .bind(chunk.document_id.to_string())
        .bind(chunk.tenant_id.to_string())
        .bind(chunk.chunk_index)
        .bind(&chunk.content)
        .bind(chunk.token_count)
        .bind(chunk.start_char)
        .bind(chunk.end_char)
        .bind(chunk.metadata.to_string())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// All chunks of a document in index order.
pub async fn list_chunks(
    pool: &SqlitePool,
    tenant_id: Uuid,
    document_id: Uuid,
) -> Result<Vec<Chunk>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM chunks
        WHERE document_id = ?1 AND tenant_id = ?2
        ORDER BY chunk_index ASC
        "#,
    )
    .bind(document_id.to_string())
    .bind(tenant_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_chunk).collect()
}

pub async fn get_chunks_by_ids(
    pool: &SqlitePool,
    tenant_id: Uuid,
    ids: &[Uuid],
) -> Result<Vec<Chunk>> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?1 AND tenant_id = ?2")
            .bind(id.to_string())
            .bind(tenant_id.to_string())
            .fetch_optional(pool)
            .await?;
        if let Some(row) = row {
            out.push(map_chunk(&row)?);
        }
    }
    Ok(out)
}

pub async fn delete_chunks(pool: &SqlitePool, tenant_id: Uuid, document_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?1 AND tenant_id = ?2")
        .bind(document_id.to_string())
        .bind(tenant_id.to_string())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Soft-delete the document row. Chunk and vector purging is the pipeline's
/// responsibility; this must only be called after those succeed.
pub async fn soft_delete(pool: &SqlitePool, tenant_id: Uuid, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE documents SET status = 'deleted', chunk_count = 0, updated_at = ?1
        WHERE id = ?2 AND tenant_id = ?3 AND status != 'deleted'
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .bind(tenant_id.to_string())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Sum of chunk counts across a set of documents, for session context stats.
pub async fn total_chunks(pool: &SqlitePool, tenant_id: Uuid, ids: &[Uuid]) -> Result<i64> {
    let mut total = 0i64;
    for id in ids {
        let row =
            sqlx::query("SELECT chunk_count FROM documents WHERE id = ?1 AND tenant_id = ?2")
                .bind(id.to_string())
                .bind(tenant_id.to_string())
                .fetch_optional(pool)
                .await?;
        if let Some(row) = row {
            let count: i64 = row.try_get("chunk_count").map_err(StoreError::from)?;
            total += count;
        }
    }
    Ok(total)
}
