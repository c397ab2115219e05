//! Document pipeline: upload → parse → chunk → embed → index.
//!
//! `ingest` returns the document row in `uploading` status synchronously and
//! schedules a background task that drives the rest of the lifecycle.
//! Failure at any step rolls back the document's chunks and vectors and
//! marks it `failed`; a retry wipes prior output and starts from scratch.

pub mod chunker;
pub mod parser;

use chrono::Utc;
use miette::Diagnostic;
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::models::{Chunk, Document, DocumentStatus};
use crate::providers::{EmbeddingProvider, ProviderError, ProviderRegistry};
use crate::store::{self, StoreError};
use crate::tenant::TenantContext;
use crate::vector::{SearchFilter, VectorError, VectorIndex, VectorRecord};

use chunker::{chunk_text, ChunkerConfig};
use parser::{ParseError, ParserRegistry};

/// Texts embedded per provider call during ingestion.
const EMBED_BATCH: usize = 32;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("document not found")]
    #[diagnostic(code(ragloom::ingest::not_found))]
    NotFound,

    #[error("{0}")]
    #[diagnostic(code(ragloom::ingest::validation))]
    Validation(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error("file i/o error: {0}")]
    #[diagnostic(code(ragloom::ingest::io))]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// One hit from [`DocumentPipeline::search`].
#[derive(Clone, Debug, Serialize)]
pub struct SearchResult {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub document_filename: String,
    pub content: String,
    pub score: f32,
    pub chunk_index: i64,
}

#[derive(Clone)]
pub struct DocumentPipeline {
    pool: SqlitePool,
    providers: Arc<ProviderRegistry>,
    index: Arc<dyn VectorIndex>,
    parsers: ParserRegistry,
    chunker: ChunkerConfig,
    uploads_dir: PathBuf,
}

impl DocumentPipeline {
    #[must_use]
    pub fn new(
        pool: SqlitePool,
        providers: Arc<ProviderRegistry>,
        index: Arc<dyn VectorIndex>,
        parsers: ParserRegistry,
        chunker: ChunkerConfig,
        uploads_dir: PathBuf,
    ) -> Self {
        Self {
            pool,
            providers,
            index,
            parsers,
            chunker,
            uploads_dir,
        }
    }

    /// Accept an upload: persist the file, insert the `uploading` row, and
    /// schedule the background ingestion task. Returns immediately.
    #[instrument(skip(self, ctx, bytes), fields(tenant = %ctx.tenant_id, filename))]
    pub async fn ingest(
        &self,
        ctx: &TenantContext,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<Document> {
        let file_type = file_type_of(filename);
        if !self.parsers.supports(&file_type) {
            return Err(PipelineError::Validation(format!(
                "unsupported file type `{file_type}`"
            )));
        }

        let id = Uuid::new_v4();
        let file_path = self
            .uploads_dir
            .join(ctx.tenant_id.to_string())
            .join(format!("{id}_{}", sanitize_filename(filename)));
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&file_path, &bytes).await?;

        let now = Utc::now();
        let document = Document {
            id,
            tenant_id: ctx.tenant_id,
            user_id: ctx.user_id,
            filename: filename.to_string(),
            file_path: file_path.to_string_lossy().into_owned(),
            file_size: bytes.len() as i64,
            file_type,
            status: DocumentStatus::Uploading,
            chunk_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        store::documents::insert(&self.pool, &document).await?;

        let pipeline = self.clone();
        let task_ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.run_ingestion(&task_ctx, id).await {
                tracing::warn!(document = %id, error = %e, "ingestion failed");
            }
        });

        Ok(document)
    }

    /// Re-run ingestion for a `failed` document from scratch.
    pub async fn retry(&self, ctx: &TenantContext, document_id: Uuid) -> Result<Document> {
        let document = store::documents::get(&self.pool, ctx.tenant_id, document_id)
            .await?
            .ok_or(PipelineError::NotFound)?;
        if document.status != DocumentStatus::Failed {
            return Err(PipelineError::Validation(
                "only failed documents can be retried".to_string(),
            ));
        }

        let pipeline = self.clone();
        let task_ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.run_ingestion(&task_ctx, document_id).await {
                tracing::warn!(document = %document_id, error = %e, "retry ingestion failed");
            }
        });
        Ok(document)
    }

    /// The full background lifecycle for one document. Public so retries and
    /// tests can drive it to completion inline.
    #[instrument(skip(self, ctx), fields(tenant = %ctx.tenant_id, document = %document_id))]
    pub async fn run_ingestion(&self, ctx: &TenantContext, document_id: Uuid) -> Result<()> {
        let document = store::documents::get(&self.pool, ctx.tenant_id, document_id)
            .await?
            .ok_or(PipelineError::NotFound)?;

        store::documents::set_status(
            &self.pool,
            ctx.tenant_id,
            document_id,
            DocumentStatus::Processing,
            None,
        )
        .await?;

        match self.process(ctx, &document).await {
            Ok(chunk_count) => {
                store::documents::mark_completed(&self.pool, ctx.tenant_id, document_id, chunk_count)
                    .await?;
                tracing::info!(document = %document_id, chunk_count, "document indexed");
                Ok(())
            }
            Err(e) => {
                // Roll back partial output so a failed document never holds
                // chunks or vectors.
                let _ = self.purge(ctx.tenant_id, document_id).await;
                store::documents::set_status(
                    &self.pool,
                    ctx.tenant_id,
                    document_id,
                    DocumentStatus::Failed,
                    Some(&e.to_string()),
                )
                .await?;
                Err(e)
            }
        }
    }

    async fn process(&self, ctx: &TenantContext, document: &Document) -> Result<i64> {
        // Retries start from scratch: wipe anything a prior attempt wrote.
        self.purge(ctx.tenant_id, document.id).await?;

        let bytes = tokio::fs::read(&document.file_path).await?;
        let text = self.parsers.parse(&document.file_type, &bytes)?;

        let pieces = chunk_text(&text, &self.chunker);
        if pieces.is_empty() {
            return Err(PipelineError::Parse(ParseError::Empty));
        }

        let embedding = store::tenant_config::get(&self.pool, ctx.tenant_id)
            .await?
            .and_then(|c| c.embedding)
            .ok_or_else(|| {
                PipelineError::Validation("no embedding provider configured for tenant".into())
            })?;
        let embedder = self
            .providers
            .embedding_for(ctx.tenant_id, &embedding)
            .await?;
        self.index
            .ensure_collection(ctx.tenant_id, embedder.dimensions())
            .await?;

        let mut chunks = Vec::with_capacity(pieces.len());
        let mut records = Vec::with_capacity(pieces.len());
        for batch in pieces.chunks(EMBED_BATCH) {
            let texts: Vec<String> = batch.iter().map(|p| p.content.clone()).collect();
            let vectors = embedder.embed(&texts).await?;
            for (piece, embedding) in batch.iter().zip(vectors) {
                let chunk_id = Uuid::new_v4();
                chunks.push(Chunk {
                    id: chunk_id,
                    document_id: document.id,
                    tenant_id: ctx.tenant_id,
                    chunk_index: piece.index as i64,
                    content: piece.content.clone(),
                    token_count: piece.token_count as i64,
                    start_char: Some(piece.start_char as i64),
                    end_char: Some(piece.end_char as i64),
                    metadata: serde_json::json!({}),
                });
                records.push(VectorRecord {
                    chunk_id,
                    tenant_id: ctx.tenant_id,
                    document_id: document.id,
                    chunk_index: piece.index as i64,
                    embedding,
                    payload: serde_json::json!({
                        "tenant_id": ctx.tenant_id,
                        "document_id": document.id,
                        "chunk_index": piece.index,
                    }),
                });
            }
        }

        self.index.upsert(ctx.tenant_id, records).await?;
        store::documents::insert_chunks(&self.pool, &chunks).await?;
        Ok(chunks.len() as i64)
    }

    async fn purge(&self, tenant_id: Uuid, document_id: Uuid) -> Result<()> {
        self.index.delete_by_document(tenant_id, document_id).await?;
        store::documents::delete_chunks(&self.pool, tenant_id, document_id).await?;
        Ok(())
    }

    /// Soft-delete a document, purging its chunks and vectors.
    #[instrument(skip(self, ctx), fields(tenant = %ctx.tenant_id))]
    pub async fn delete(&self, ctx: &TenantContext, document_id: Uuid) -> Result<()> {
        let document = store::documents::get(&self.pool, ctx.tenant_id, document_id)
            .await?
            .ok_or(PipelineError::NotFound)?;
        self.purge(ctx.tenant_id, document_id).await?;
        store::documents::soft_delete(&self.pool, ctx.tenant_id, document_id).await?;
        if tokio::fs::remove_file(Path::new(&document.file_path)).await.is_err() {
            tracing::debug!(document = %document_id, "uploaded file already absent");
        }
        Ok(())
    }

    /// Embed the query with the tenant's configured model and search the
    /// vector index, hydrating chunk content for each hit.
    #[instrument(skip(self, ctx, query), fields(tenant = %ctx.tenant_id, k, min_score))]
    pub async fn search(
        &self,
        ctx: &TenantContext,
        query: &str,
        k: usize,
        min_score: f32,
        document_ids: Option<Vec<Uuid>>,
    ) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Err(PipelineError::Validation("query must not be empty".into()));
        }
        let embedding = store::tenant_config::get(&self.pool, ctx.tenant_id)
            .await?
            .and_then(|c| c.embedding)
            .ok_or_else(|| {
                PipelineError::Validation("no embedding provider configured for tenant".into())
            })?;
        let embedder = self
            .providers
            .embedding_for(ctx.tenant_id, &embedding)
            .await?;
        let query_vec = embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Provider(ProviderError::Permanent {
                message: "embedding provider returned no vector".into(),
            }))?;

        let filter = match document_ids {
            Some(ids) => SearchFilter::for_documents(ids),
            None => SearchFilter::default(),
        };
        let hits = self
            .index
            .search(ctx.tenant_id, &query_vec, k, min_score, &filter)
            .await?;

        let chunk_ids: Vec<Uuid> = hits.iter().map(|h| h.chunk_id).collect();
        let chunks = store::documents::get_chunks_by_ids(&self.pool, ctx.tenant_id, &chunk_ids).await?;

        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(chunk) = chunks.iter().find(|c| c.id == hit.chunk_id) else {
                continue;
            };
            let document = store::documents::get(&self.pool, ctx.tenant_id, hit.document_id).await?;
            results.push(SearchResult {
                chunk_id: hit.chunk_id,
                document_id: hit.document_id,
                document_filename: document.map(|d| d.filename).unwrap_or_default(),
                content: chunk.content.clone(),
                score: hit.score,
                chunk_index: hit.chunk_index,
            });
        }
        Ok(results)
    }
}

fn file_type_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("txt")
        .to_ascii_lowercase()
}

fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_from_extension() {
        assert_eq!(file_type_of("report.MD"), "md");
        assert_eq!(file_type_of("notes.txt"), "txt");
        assert_eq!(file_type_of("no_extension"), "txt");
    }

    #[test]
    fn filenames_are_sanitized_for_disk() {
        assert_eq!(sanitize_filename("a b/../c.txt"), "a_b_.._c.txt");
    }
}
