//! Secret store adapter.
//!
//! Provider credentials live here and only here; the relational tier stores
//! provider *selection*, never keys. Paths are namespaced per capability
//! (`embedding-providers/<name>`, `chat-providers/<name>`) and every call is
//! scoped by tenant id, so one tenant's context can never address another
//! tenant's keys.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// How long a read may be served from the in-process memo.
pub const SECRET_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error, Diagnostic)]
pub enum SecretError {
    #[error("secret not found: {path}")]
    #[diagnostic(
        code(ragloom::secrets::not_found),
        help("Store the credential via the settings endpoints before using the provider.")
    )]
    NotFound { path: String },

    #[error("secret backend error: {message}")]
    #[diagnostic(code(ragloom::secrets::backend))]
    Backend { message: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Per-tenant encrypted key/value lookup for provider credentials.
///
/// Values are opaque bytes; by convention they hold JSON `{"api_key": ...}`
/// or `{"base_url": ...}` documents.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, tenant_id: Uuid, path: &str) -> Result<Vec<u8>>;
    async fn put(&self, tenant_id: Uuid, path: &str, value: &[u8]) -> Result<()>;
    async fn delete(&self, tenant_id: Uuid, path: &str) -> Result<()>;
}

/// Volatile in-process store for tests and single-node development.
#[derive(Default)]
pub struct MemorySecretStore {
    inner: RwLock<FxHashMap<(Uuid, String), Vec<u8>>>,
}

impl MemorySecretStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, tenant_id: Uuid, path: &str) -> Result<Vec<u8>> {
        let map = self.inner.read().map_err(|e| SecretError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        map.get(&(tenant_id, path.to_string()))
            .cloned()
            .ok_or_else(|| SecretError::NotFound {
                path: path.to_string(),
            })
    }

    async fn put(&self, tenant_id: Uuid, path: &str, value: &[u8]) -> Result<()> {
        let mut map = self.inner.write().map_err(|e| SecretError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        map.insert((tenant_id, path.to_string()), value.to_vec());
        Ok(())
    }

    async fn delete(&self, tenant_id: Uuid, path: &str) -> Result<()> {
        let mut map = self.inner.write().map_err(|e| SecretError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        map.remove(&(tenant_id, path.to_string()));
        Ok(())
    }
}

/// File-backed store: one file per secret under
/// `<root>/tenants/<tenant_id>/<sanitised path>`.
#[derive(Clone, Debug)]
pub struct FileSecretStore {
    root: PathBuf,
}

impl FileSecretStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn secret_path(&self, tenant_id: Uuid, path: &str) -> PathBuf {
        let mut file = self.root.join("tenants").join(tenant_id.to_string());
        for component in path.split('/').filter(|c| !c.is_empty()) {
            file.push(sanitize_component(component));
        }
        file
    }
}

fn sanitize_component(input: &str) -> String {
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

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, tenant_id: Uuid, path: &str) -> Result<Vec<u8>> {
        let file = self.secret_path(tenant_id, path);
        match tokio::fs::read(&file).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SecretError::NotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(SecretError::Backend {
                message: e.to_string(),
            }),
        }
    }

    async fn put(&self, tenant_id: Uuid, path: &str, value: &[u8]) -> Result<()> {
        let file = self.secret_path(tenant_id, path);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SecretError::Backend {
                    message: e.to_string(),
                })?;
        }
        tokio::fs::write(&file, value)
            .await
            .map_err(|e| SecretError::Backend {
                message: e.to_string(),
            })
    }

    async fn delete(&self, tenant_id: Uuid, path: &str) -> Result<()> {
        let file = self.secret_path(tenant_id, path);
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SecretError::Backend {
                message: e.to_string(),
            }),
        }
    }
}

/// Read-memoizing decorator. Reads are served from the memo for at most
/// [`SECRET_CACHE_TTL`]; writes and deletes invalidate the entry so a
/// rotated key is never served stale past the window.
pub struct CachingSecretStore<S> {
    inner: S,
    cache: RwLock<FxHashMap<(Uuid, String), (Instant, Vec<u8>)>>,
}

impl<S: SecretStore> CachingSecretStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cache: RwLock::new(FxHashMap::default()),
        }
    }
}

#[async_trait]
impl<S: SecretStore> SecretStore for CachingSecretStore<S> {
    async fn get(&self, tenant_id: Uuid, path: &str) -> Result<Vec<u8>> {
        let key = (tenant_id, path.to_string());
        if let Ok(cache) = self.cache.read()
            && let Some((stored_at, value)) = cache.get(&key)
            && stored_at.elapsed() < SECRET_CACHE_TTL
        {
            return Ok(value.clone());
        }

        let value = self.inner.get(tenant_id, path).await?;
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(key, (Instant::now(), value.clone()));
        }
        Ok(value)
    }

    async fn put(&self, tenant_id: Uuid, path: &str, value: &[u8]) -> Result<()> {
        self.inner.put(tenant_id, path, value).await?;
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&(tenant_id, path.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, tenant_id: Uuid, path: &str) -> Result<()> {
        self.inner.delete(tenant_id, path).await?;
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&(tenant_id, path.to_string()));
        }
        Ok(())
    }
}

/// Canonical secret path for an embedding provider credential.
#[must_use]
pub fn embedding_provider_path(name: &str) -> String {
    format!("embedding-providers/{name}")
}

/// Canonical secret path for a chat provider credential.
#[must_use]
pub fn chat_provider_path(name: &str) -> String {
    format!("chat-providers/{name}")
}
