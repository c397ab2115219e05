//! Checkpoint store: durable, append-only snapshots of workflow state
//! keyed by `(thread_id, step)`.
//!
//! Steps strictly increase within a thread and resume always reads the
//! max-step row. The uniqueness of `(thread_id, step)` is load-bearing:
//! two executors racing on the same thread collide on the step write and
//! the loser surfaces [`CheckpointError::ConcurrentUpdate`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::sync::RwLock;
use thiserror::Error;
use tracing::instrument;

/// One persisted snapshot. The blob is opaque to the store; the executor
/// owns its encoding and keeps it round-trippable under a schema version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub thread_id: String,
    pub step: i64,
    pub state_blob: String,
    pub parent_step: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    #[must_use]
    pub fn new(thread_id: impl Into<String>, step: i64, state_blob: String) -> Self {
        Self {
            thread_id: thread_id.into(),
            step,
            state_blob,
            parent_step: if step > 0 { Some(step - 1) } else { None },
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    /// Another writer already persisted this step for the thread.
    #[error("concurrent update on thread `{thread_id}` at step {step}")]
    #[diagnostic(
        code(ragloom::checkpoint::concurrent_update),
        help("Only one executor may make progress per thread; retry after it finishes.")
    )]
    ConcurrentUpdate { thread_id: String, step: i64 },

    #[error("checkpoint backend error: {message}")]
    #[diagnostic(code(ragloom::checkpoint::backend))]
    Backend { message: String },
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append one checkpoint. Never overwrites: a step collision is a
    /// [`CheckpointError::ConcurrentUpdate`].
    async fn save(&self, checkpoint: Checkpoint) -> Result<()>;

    /// The highest-step snapshot for a thread, if any.
    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// Full history for a thread, ordered by step ascending.
    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>>;

    /// Drop every checkpoint with `step > after`, for branching and retry.
    async fn truncate_after(&self, thread_id: &str, after: i64) -> Result<u64>;
}

/// Volatile store for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<FxHashMap<String, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut map = self.inner.write().map_err(|e| CheckpointError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        let history = map.entry(checkpoint.thread_id.clone()).or_default();
        if history.iter().any(|c| c.step == checkpoint.step) {
            return Err(CheckpointError::ConcurrentUpdate {
                thread_id: checkpoint.thread_id,
                step: checkpoint.step,
            });
        }
        history.push(checkpoint);
        history.sort_by_key(|c| c.step);
        Ok(())
    }

    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let map = self.inner.read().map_err(|e| CheckpointError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        Ok(map.get(thread_id).and_then(|h| h.last().cloned()))
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let map = self.inner.read().map_err(|e| CheckpointError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        Ok(map.get(thread_id).cloned().unwrap_or_default())
    }

    async fn truncate_after(&self, thread_id: &str, after: i64) -> Result<u64> {
        let mut map = self.inner.write().map_err(|e| CheckpointError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        let Some(history) = map.get_mut(thread_id) else {
            return Ok(0);
        };
        let before = history.len();
        history.retain(|c| c.step <= after);
        Ok((before - history.len()) as u64)
    }
}

/// Durable store over the shared SQLite pool.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn map_row(row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint> {
    let created_at: String = row.try_get("created_at").map_err(backend)?;
    Ok(Checkpoint {
        thread_id: row.try_get("thread_id").map_err(backend)?,
        step: row.try_get("step").map_err(backend)?,
        state_blob: row.try_get("state_blob").map_err(backend)?,
        parent_step: row.try_get("parent_step").map_err(backend)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| CheckpointError::Backend {
                message: format!("corrupt created_at: {e}"),
            })?,
    })
}

fn backend(e: sqlx::Error) -> CheckpointError {
    CheckpointError::Backend {
        message: e.to_string(),
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    #[instrument(skip(self, checkpoint), fields(thread = %checkpoint.thread_id, step = checkpoint.step))]
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO checkpoints (thread_id, step, state_blob, parent_step, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&checkpoint.thread_id)
        .bind(checkpoint.step)
        .bind(&checkpoint.state_blob)
        .bind(checkpoint.parent_step)
        .bind(checkpoint.created_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(CheckpointError::ConcurrentUpdate {
                    thread_id: checkpoint.thread_id,
                    step: checkpoint.step,
                })
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM checkpoints WHERE thread_id = ?1
            ORDER BY step DESC LIMIT 1
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(map_row).transpose()
    }

    async fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query("SELECT * FROM checkpoints WHERE thread_id = ?1 ORDER BY step ASC")
            .bind(thread_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(map_row).collect()
    }

    async fn truncate_after(&self, thread_id: &str, after: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?1 AND step > ?2")
            .bind(thread_id)
            .bind(after)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_save_load_is_a_fixed_point() {
        let store = InMemoryCheckpointStore::new();
        let checkpoint = Checkpoint::new("thread-1", 0, "{\"k\":1}".to_string());
        store.save(checkpoint.clone()).await.unwrap();

        let loaded = store.load_latest("thread-1").await.unwrap().unwrap();
        assert_eq!(loaded.state_blob, checkpoint.state_blob);

        store.save(loaded.clone()).await.unwrap_err();
        let again = store.load_latest("thread-1").await.unwrap().unwrap();
        assert_eq!(again.state_blob, checkpoint.state_blob);
    }

    #[tokio::test]
    async fn duplicate_step_is_a_concurrent_update() {
        let store = InMemoryCheckpointStore::new();
        store
            .save(Checkpoint::new("t", 3, "{}".into()))
            .await
            .unwrap();
        let err = store
            .save(Checkpoint::new("t", 3, "{}".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::ConcurrentUpdate { step: 3, .. }));
    }

    #[tokio::test]
    async fn truncate_supports_branching() {
        let store = InMemoryCheckpointStore::new();
        for step in 0..5 {
            store
                .save(Checkpoint::new("t", step, "{}".into()))
                .await
                .unwrap();
        }
        let removed = store.truncate_after("t", 2).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.load_latest("t").await.unwrap().unwrap().step, 2);
    }
}
