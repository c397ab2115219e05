//! SQLite-backed vector index.
//!
//! Embeddings are stored as little-endian f32 bytes; similarity is computed
//! in-process over the tenant's candidate rows. This keeps the vector tier
//! on the same storage stack as the rest of the data plane while preserving
//! the adapter contract.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use uuid::Uuid;

use super::{
    collection_name, cosine_score, Result, SearchFilter, SearchHit, VectorError, VectorIndex,
    VectorRecord,
};

pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn collection_dimensions(&self, tenant_id: Uuid) -> Result<Option<u32>> {
        let row = sqlx::query("SELECT dimensions FROM vector_collections WHERE tenant_id = ?1")
            .bind(tenant_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("dimensions") as u32))
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn ensure_collection(&self, tenant_id: Uuid, dimensions: u32) -> Result<()> {
        if let Some(existing) = self.collection_dimensions(tenant_id).await? {
            if existing != dimensions {
                return Err(VectorError::DimensionMismatch {
                    existing,
                    requested: dimensions,
                });
            }
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO vector_collections (tenant_id, name, dimensions, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(tenant_id.to_string())
        .bind(collection_name(tenant_id))
        .bind(dimensions as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert(&self, tenant_id: Uuid, records: Vec<VectorRecord>) -> Result<()> {
        let dimensions = self
            .collection_dimensions(tenant_id)
            .await?
            .ok_or(VectorError::NoCollection)?;

        let mut tx = self.pool.begin().await?;
        for record in &records {
            if record.embedding.len() != dimensions as usize {
                return Err(VectorError::DimensionMismatch {
                    existing: dimensions,
                    requested: record.embedding.len() as u32,
                });
            }
            sqlx::query(
                r#"
                INSERT INTO vector_records (
                    chunk_id, tenant_id, document_id, chunk_index, embedding, payload
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT (chunk_id) DO UPDATE SET
                    tenant_id = excluded.tenant_id,
                    document_id = excluded.document_id,
                    chunk_index = excluded.chunk_index,
                    embedding = excluded.embedding,
                    payload = excluded.payload
                "#,
            )
            .bind(record.chunk_id.to_string())
            .bind(record.tenant_id.to_string())
            .bind(record.document_id.to_string())
            .bind(record.chunk_index)
            .bind(encode_embedding(&record.embedding))
            .bind(record.payload.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn search(
        &self,
        tenant_id: Uuid,
        query: &[f32],
        k: usize,
        min_score: f32,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT chunk_id, document_id, chunk_index, embedding, payload
            FROM vector_records WHERE tenant_id = ?1
            "#,
        )
        .bind(tenant_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let allowed: Option<Vec<String>> = filter
            .document_ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| id.to_string()).collect());

        let mut hits = Vec::new();
        for row in rows {
            let document_id: String = row.get("document_id");
            if let Some(allowed) = &allowed
                && !allowed.contains(&document_id)
            {
                continue;
            }
            let embedding = decode_embedding(row.get::<Vec<u8>, _>("embedding").as_slice());
            let score = cosine_score(query, &embedding);
            if score < min_score {
                continue;
            }
            let chunk_id: String = row.get("chunk_id");
            let payload: String = row.get("payload");
            hits.push(SearchHit {
                chunk_id: Uuid::parse_str(&chunk_id).map_err(|e| VectorError::Backend {
                    message: format!("corrupt chunk_id: {e}"),
                })?,
                document_id: Uuid::parse_str(&document_id).map_err(|e| VectorError::Backend {
                    message: format!("corrupt document_id: {e}"),
                })?,
                chunk_index: row.get("chunk_index"),
                score,
                payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            });
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete_by_document(&self, tenant_id: Uuid, document_id: Uuid) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM vector_records WHERE tenant_id = ?1 AND document_id = ?2")
                .bind(tenant_id.to_string())
                .bind(document_id.to_string())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_bytes_round_trip() {
        let embedding = vec![0.25f32, -1.5, 3.75, 0.0];
        assert_eq!(decode_embedding(&encode_embedding(&embedding)), embedding);
    }
}
