//! Vector index adapter: tenant-scoped storage and similarity search of
//! chunk embeddings.
//!
//! Isolation is enforced at query time: every operation narrows by the
//! caller's tenant id inside the query itself, never by collection naming
//! alone.

pub mod sqlite;

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use sqlite::SqliteVectorIndex;

#[derive(Debug, Error, Diagnostic)]
pub enum VectorError {
    /// The tenant's collection exists with a different dimension. The
    /// operation leaves stored state untouched.
    #[error("dimension mismatch: collection has {existing}, requested {requested}")]
    #[diagnostic(
        code(ragloom::vector::dimension_mismatch),
        help("Changing embedding dimensions requires an explicit reindex of the tenant's documents.")
    )]
    DimensionMismatch { existing: u32, requested: u32 },

    #[error("no collection provisioned for tenant")]
    #[diagnostic(code(ragloom::vector::no_collection))]
    NoCollection,

    #[error("vector backend error: {message}")]
    #[diagnostic(code(ragloom::vector::backend))]
    Backend { message: String },
}

impl From<sqlx::Error> for VectorError {
    fn from(e: sqlx::Error) -> Self {
        VectorError::Backend {
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VectorError>;

/// One stored embedding with its routing payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VectorRecord {
    pub chunk_id: Uuid,
    pub tenant_id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i64,
    pub embedding: Vec<f32>,
    pub payload: serde_json::Value,
}

/// A similarity search result, scored in `[0, 1]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i64,
    pub score: f32,
    pub payload: serde_json::Value,
}

/// Narrowing applied on top of the mandatory tenant filter.
#[derive(Clone, Debug, Default)]
pub struct SearchFilter {
    /// Restrict hits to these documents when set.
    pub document_ids: Option<Vec<Uuid>>,
}

impl SearchFilter {
    #[must_use]
    pub fn for_documents(ids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            document_ids: Some(ids.into_iter().collect()),
        }
    }
}

/// Tenant-scoped vector storage and cosine-similarity search.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Idempotently provision the tenant's collection at `dimensions`.
    /// Fails with [`VectorError::DimensionMismatch`] when a collection
    /// already exists at a different dimension, without mutating anything.
    async fn ensure_collection(&self, tenant_id: Uuid, dimensions: u32) -> Result<()>;

    /// Bulk write; the same `chunk_id` overwrites (idempotent).
    async fn upsert(&self, tenant_id: Uuid, records: Vec<VectorRecord>) -> Result<()>;

    /// Top-`k` hits by cosine similarity, scored in `[0, 1]`, at or above
    /// `min_score`. Results never include another tenant's records.
    async fn search(
        &self,
        tenant_id: Uuid,
        query: &[f32],
        k: usize,
        min_score: f32,
        filter: &SearchFilter,
    ) -> Result<Vec<SearchHit>>;

    /// Remove every record belonging to the document.
    async fn delete_by_document(&self, tenant_id: Uuid, document_id: Uuid) -> Result<u64>;
}

/// Deterministic collection name for a tenant.
#[must_use]
pub fn collection_name(tenant_id: Uuid) -> String {
    format!("tenant_{}", tenant_id.simple())
}

/// Cosine similarity mapped into `[0, 1]`: negative similarity clamps to 0
/// so thresholds compose with the score contract.
#[must_use]
pub fn cosine_score(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}
