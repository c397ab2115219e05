//! Relational data plane over SQLite.
//!
//! The database is the authority for all state. Every function here takes
//! the caller's tenant id and narrows its query by it; nothing in this
//! module trusts an id alone. Queries are runtime-bound (`sqlx::query` +
//! `bind`) with manual row mapping, and timestamps/uuids are persisted in
//! their canonical text forms.

pub mod documents;
pub mod executions;
pub mod hitl;
pub mod operations;
pub mod sessions;
pub mod tenant_config;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("database error: {0}")]
    #[diagnostic(
        code(ragloom::store::database),
        help("Check the SQLite database URL and file permissions.")
    )]
    Database(#[from] sqlx::Error),

    #[error("corrupt persisted value in {what}: {message}")]
    #[diagnostic(code(ragloom::store::corrupt))]
    Corrupt { what: &'static str, message: String },

    #[error("conflicting update: {0}")]
    #[diagnostic(code(ragloom::store::conflict))]
    Conflict(&'static str),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Embedded schema migrations, shared by [`connect`] and the test harness.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Connect to the database and run embedded migrations (idempotent).
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let pool = SqlitePool::connect(database_url).await?;
    MIGRATOR
        .run(&pool)
        .await
        .map_err(|e| StoreError::Corrupt {
            what: "migrations",
            message: e.to_string(),
        })?;
    Ok(pool)
}

pub(crate) fn get_uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw).map_err(|e| StoreError::Corrupt {
        what: "uuid",
        message: format!("{column}: {e}"),
    })
}

pub(crate) fn get_uuid_opt(row: &SqliteRow, column: &str) -> Result<Option<Uuid>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| {
        Uuid::parse_str(&s).map_err(|e| StoreError::Corrupt {
            what: "uuid",
            message: format!("{column}: {e}"),
        })
    })
    .transpose()
}

pub(crate) fn get_datetime(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(column)?;
    parse_datetime(&raw, column)
}

pub(crate) fn get_datetime_opt(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| parse_datetime(&s, column)).transpose()
}

fn parse_datetime(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            what: "timestamp",
            message: format!("{column}: {e}"),
        })
}

pub(crate) fn get_json(row: &SqliteRow, column: &str) -> Result<serde_json::Value> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
        what: "json",
        message: format!("{column}: {e}"),
    })
}

pub(crate) fn get_json_opt(row: &SqliteRow, column: &str) -> Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| {
        serde_json::from_str(&s).map_err(|e| StoreError::Corrupt {
            what: "json",
            message: format!("{column}: {e}"),
        })
    })
    .transpose()
}

/// Parse a persisted enum string via the enum's `parse`.
pub(crate) fn get_enum<T>(
    row: &SqliteRow,
    column: &str,
    parse: fn(&str) -> Option<T>,
) -> Result<T> {
    let raw: String = row.try_get(column)?;
    parse(&raw).ok_or_else(|| StoreError::Corrupt {
        what: "enum",
        message: format!("{column}: unrecognised value `{raw}`"),
    })
}
