//! Process configuration, resolved from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Backend configuration. Every field has a workable default so the server
/// starts with nothing but `RAGLOOM_DATABASE_URL` (and even that falls back
/// to a local file database).
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// SQLite database URL, e.g. `sqlite://ragloom.db?mode=rwc`.
    pub database_url: String,
    /// HTTP bind address.
    pub bind_addr: SocketAddr,
    /// Root directory for the file-backed secret store.
    pub secrets_dir: PathBuf,
    /// Directory where uploaded document files are kept.
    pub uploads_dir: PathBuf,
    /// Wall-clock limit for a single background operation.
    pub operation_deadline: Duration,
    /// Maximum concurrently running background tasks per tenant.
    pub tenant_parallelism: usize,
    /// Target chunk size in tokens.
    pub chunk_target_tokens: usize,
    /// Overlap between consecutive chunks in tokens.
    pub chunk_overlap_tokens: usize,
    /// Provider input budget (tokens) for transform windowing.
    pub transform_input_budget: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl AppConfig {
    /// Resolve configuration from the environment, loading `.env` first.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            database_url: std::env::var("RAGLOOM_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://ragloom.db?mode=rwc".to_string()),
            bind_addr: std::env::var("RAGLOOM_BIND_ADDR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| "127.0.0.1:8080".parse().expect("static addr")),
            secrets_dir: std::env::var("RAGLOOM_SECRETS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./secrets")),
            uploads_dir: std::env::var("RAGLOOM_UPLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./uploads")),
            operation_deadline: Duration::from_secs(
                env_u64("RAGLOOM_OPERATION_DEADLINE_SECS", 600),
            ),
            tenant_parallelism: env_u64("RAGLOOM_TENANT_PARALLELISM", 4) as usize,
            chunk_target_tokens: env_u64("RAGLOOM_CHUNK_TARGET_TOKENS", 400) as usize,
            chunk_overlap_tokens: env_u64("RAGLOOM_CHUNK_OVERLAP_TOKENS", 40) as usize,
            transform_input_budget: env_u64("RAGLOOM_TRANSFORM_INPUT_BUDGET", 6000) as usize,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
