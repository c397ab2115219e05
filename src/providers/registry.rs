//! Capability-based provider dispatch.
//!
//! Backends register a factory under a string identifier; the registry
//! resolves a tenant's selection plus its secret-store credential into an
//! instance, wraps it with the transient-retry policy, and memoizes it per
//! tenant for [`PROVIDER_CACHE_TTL`]. The factory map is also the seam test
//! suites use to install deterministic providers.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::message::ChatMessage;
use crate::models::{ChatSelection, EmbeddingSelection};
use crate::secrets::{chat_provider_path, embedding_provider_path, SecretError, SecretStore};

use super::{
    ollama::{OllamaChatProvider, OllamaEmbeddingProvider},
    openai::{OpenAiChatProvider, OpenAiEmbeddingProvider},
    with_retry, ChatOutcome, ChatParams, ChatProvider, ChatStream, EmbeddingProvider,
    ProviderError, Result,
};

/// How long a resolved provider instance may be reused before credentials
/// are re-read.
pub const PROVIDER_CACHE_TTL: Duration = Duration::from_secs(60);

/// Credential material decoded from the secret store value.
#[derive(Clone, Debug, Default)]
pub struct ProviderCredentials {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl ProviderCredentials {
    fn from_secret(bytes: &[u8]) -> Self {
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) else {
            return Self::default();
        };
        Self {
            api_key: value["api_key"].as_str().map(str::to_string),
            base_url: value["base_url"].as_str().map(str::to_string),
        }
    }
}

pub type EmbeddingFactory = Arc<
    dyn Fn(&EmbeddingSelection, &ProviderCredentials) -> Result<Arc<dyn EmbeddingProvider>>
        + Send
        + Sync,
>;
pub type ChatFactory = Arc<
    dyn Fn(&ChatSelection, &ProviderCredentials) -> Result<Arc<dyn ChatProvider>> + Send + Sync,
>;

type EmbeddingCacheKey = (Uuid, String, String);
type ChatCacheKey = (Uuid, String, String);

pub struct ProviderRegistry {
    secrets: Arc<dyn SecretStore>,
    embedding_factories: RwLock<FxHashMap<String, EmbeddingFactory>>,
    chat_factories: RwLock<FxHashMap<String, ChatFactory>>,
    embedding_cache: RwLock<FxHashMap<EmbeddingCacheKey, (Instant, Arc<dyn EmbeddingProvider>)>>,
    chat_cache: RwLock<FxHashMap<ChatCacheKey, (Instant, Arc<dyn ChatProvider>)>>,
}

impl ProviderRegistry {
    /// Build a registry with the built-in `openai` and `ollama` backends.
    #[must_use]
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        let registry = Self {
            secrets,
            embedding_factories: RwLock::new(FxHashMap::default()),
            chat_factories: RwLock::new(FxHashMap::default()),
            embedding_cache: RwLock::new(FxHashMap::default()),
            chat_cache: RwLock::new(FxHashMap::default()),
        };

        registry.register_embedding("openai", Arc::new(|selection, credentials| {
            let api_key = credentials
                .api_key
                .clone()
                .ok_or_else(|| ProviderError::Auth {
                    provider: "openai".into(),
                    message: "no API key stored for this tenant".into(),
                })?;
            let base_url = selection
                .base_url
                .clone()
                .or_else(|| credentials.base_url.clone());
            Ok(Arc::new(OpenAiEmbeddingProvider::new(
                api_key,
                selection.model.clone(),
                selection.dimensions,
                base_url,
            )) as Arc<dyn EmbeddingProvider>)
        }));
        registry.register_embedding("ollama", Arc::new(|selection, credentials| {
            let base_url = selection
                .base_url
                .clone()
                .or_else(|| credentials.base_url.clone());
            Ok(Arc::new(OllamaEmbeddingProvider::new(
                selection.model.clone(),
                selection.dimensions,
                base_url,
            )) as Arc<dyn EmbeddingProvider>)
        }));

        registry.register_chat("openai", Arc::new(|selection, credentials| {
            let api_key = credentials
                .api_key
                .clone()
                .ok_or_else(|| ProviderError::Auth {
                    provider: "openai".into(),
                    message: "no API key stored for this tenant".into(),
                })?;
            let base_url = selection
                .base_url
                .clone()
                .or_else(|| credentials.base_url.clone());
            Ok(Arc::new(OpenAiChatProvider::new(api_key, base_url)) as Arc<dyn ChatProvider>)
        }));
        registry.register_chat("ollama", Arc::new(|selection, credentials| {
            let base_url = selection
                .base_url
                .clone()
                .or_else(|| credentials.base_url.clone());
            Ok(Arc::new(OllamaChatProvider::new(base_url)) as Arc<dyn ChatProvider>)
        }));

        registry
    }

    /// Register (or replace) an embedding backend under `name`.
    pub fn register_embedding(&self, name: &str, factory: EmbeddingFactory) {
        if let Ok(mut map) = self.embedding_factories.write() {
            map.insert(name.to_string(), factory);
        }
    }

    /// Register (or replace) a chat backend under `name`.
    pub fn register_chat(&self, name: &str, factory: ChatFactory) {
        if let Ok(mut map) = self.chat_factories.write() {
            map.insert(name.to_string(), factory);
        }
    }

    async fn credentials(&self, tenant_id: Uuid, path: &str) -> Result<ProviderCredentials> {
        match self.secrets.get(tenant_id, path).await {
            Ok(bytes) => Ok(ProviderCredentials::from_secret(&bytes)),
            // Local providers run without a stored credential; cloud
            // factories reject the empty credential themselves.
            Err(SecretError::NotFound { .. }) => Ok(ProviderCredentials::default()),
            Err(e) => Err(ProviderError::Transient {
                message: format!("secret store: {e}"),
            }),
        }
    }

    /// Resolve the tenant's embedding provider, retry-wrapped and memoized.
    pub async fn embedding_for(
        &self,
        tenant_id: Uuid,
        selection: &EmbeddingSelection,
    ) -> Result<Arc<dyn EmbeddingProvider>> {
        let key = (tenant_id, selection.provider.clone(), selection.model.clone());
        if let Ok(cache) = self.embedding_cache.read()
            && let Some((created, provider)) = cache.get(&key)
            && created.elapsed() < PROVIDER_CACHE_TTL
        {
            return Ok(provider.clone());
        }

        let factory = self
            .embedding_factories
            .read()
            .ok()
            .and_then(|map| map.get(&selection.provider).cloned())
            .ok_or_else(|| ProviderError::Permanent {
                message: format!("unknown embedding provider `{}`", selection.provider),
            })?;
        let credentials = self
            .credentials(tenant_id, &embedding_provider_path(&selection.provider))
            .await?;
        let provider: Arc<dyn EmbeddingProvider> =
            Arc::new(RetryingEmbedding(factory(selection, &credentials)?));

        if let Ok(mut cache) = self.embedding_cache.write() {
            cache.insert(key, (Instant::now(), provider.clone()));
        }
        Ok(provider)
    }

    /// Resolve the tenant's chat provider, retry-wrapped and memoized.
    pub async fn chat_for(
        &self,
        tenant_id: Uuid,
        selection: &ChatSelection,
    ) -> Result<Arc<dyn ChatProvider>> {
        let key = (tenant_id, selection.provider.clone(), selection.model.clone());
        if let Ok(cache) = self.chat_cache.read()
            && let Some((created, provider)) = cache.get(&key)
            && created.elapsed() < PROVIDER_CACHE_TTL
        {
            return Ok(provider.clone());
        }

        let factory = self
            .chat_factories
            .read()
            .ok()
            .and_then(|map| map.get(&selection.provider).cloned())
            .ok_or_else(|| ProviderError::Permanent {
                message: format!("unknown chat provider `{}`", selection.provider),
            })?;
        let credentials = self
            .credentials(tenant_id, &chat_provider_path(&selection.provider))
            .await?;
        let provider: Arc<dyn ChatProvider> =
            Arc::new(RetryingChat(factory(selection, &credentials)?));

        if let Ok(mut cache) = self.chat_cache.write() {
            cache.insert(key, (Instant::now(), provider.clone()));
        }
        Ok(provider)
    }
}

/// Decorator applying the transient-retry policy to embedding calls.
struct RetryingEmbedding(Arc<dyn EmbeddingProvider>);

#[async_trait]
impl EmbeddingProvider for RetryingEmbedding {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        with_retry("embed", || self.0.embed(texts)).await
    }

    fn dimensions(&self) -> u32 {
        self.0.dimensions()
    }

    async fn probe(&self) -> Result<()> {
        // A probe is a health check; retrying would mask the signal.
        self.0.probe().await
    }
}

/// Decorator applying the transient-retry policy to chat calls.
struct RetryingChat(Arc<dyn ChatProvider>);

#[async_trait]
impl ChatProvider for RetryingChat {
    async fn complete(&self, messages: &[ChatMessage], params: &ChatParams) -> Result<ChatOutcome> {
        with_retry("complete", || self.0.complete(messages, params)).await
    }

    async fn stream(&self, messages: &[ChatMessage], params: &ChatParams) -> Result<ChatStream> {
        // Only establishing the stream is retried; once deltas flow the
        // consumer owns error handling.
        with_retry("stream", || self.0.stream(messages, params)).await
    }
}
