//! Shared test harness: in-memory database, deterministic mock providers,
//! and the same service wiring the server uses.
//!
//! Each integration suite compiles this module independently and uses a
//! different slice of it.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use ragloom::api::{AppState, Principal, StaticTokenVerifier};
use ragloom::checkpoint::SqliteCheckpointStore;
use ragloom::engine::{EngineConfig, OperationEngine};
use ragloom::executor::WorkflowExecutor;
use ragloom::hitl::HitlCoordinator;
use ragloom::ingest::{chunker::ChunkerConfig, parser::ParserRegistry, DocumentPipeline};
use ragloom::message::ChatMessage;
use ragloom::models::{ChatSelection, Document, DocumentStatus, EmbeddingSelection, LlmOperation};
use ragloom::providers::{
    ChatDelta, ChatOutcome, ChatParams, ChatProvider, ChatStream, EmbeddingProvider,
    ProviderRegistry, Result as ProviderResult,
};
use ragloom::secrets::MemorySecretStore;
use ragloom::session::SessionService;
use ragloom::store;
use ragloom::tenant::{TenantContext, UserRole};
use ragloom::vector::SqliteVectorIndex;

pub const EMBED_DIMS: u32 = 64;

/// Deterministic bag-of-words embedder: FNV-hash each word into a bucket,
/// then L2-normalise. Overlapping vocabularies yield high cosine scores.
pub struct MockEmbedding {
    dims: u32,
}

impl MockEmbedding {
    pub fn embed_text(text: &str, dims: u32) -> Vec<f32> {
        let mut vector = vec![0f32; dims as usize];
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hash: u64 = 0xcbf29ce484222325;
            for byte in word.as_bytes() {
                hash ^= u64::from(*byte);
                hash = hash.wrapping_mul(0x100000001b3);
            }
            vector[(hash % u64::from(dims)) as usize] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedding {
    async fn embed(&self, texts: &[String]) -> ProviderResult<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| Self::embed_text(t, self.dims))
            .collect())
    }

    fn dimensions(&self) -> u32 {
        self.dims
    }

    async fn probe(&self) -> ProviderResult<()> {
        Ok(())
    }
}

pub type ChatBehavior = Arc<dyn Fn(&[ChatMessage]) -> String + Send + Sync>;

/// Scriptable chat provider; the default behaviour echoes the last user
/// message, which carries any assembled context into the answer.
pub struct MockChat {
    behavior: ChatBehavior,
}

impl MockChat {
    pub fn echo() -> ChatBehavior {
        Arc::new(|messages: &[ChatMessage]| {
            let last = messages
                .iter()
                .rev()
                .find(|m| m.has_role(ragloom::message::Role::User))
                .map(|m| m.content.clone())
                .unwrap_or_default();
            format!("Echo: {last}")
        })
    }
}

#[async_trait]
impl ChatProvider for MockChat {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _params: &ChatParams,
    ) -> ProviderResult<ChatOutcome> {
        let text = (self.behavior)(messages);
        Ok(ChatOutcome {
            tokens_in: 10,
            tokens_out: text.split_whitespace().count() as u32,
            cost_estimate: 0.0,
            text,
        })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> ProviderResult<ChatStream> {
        use futures_util::StreamExt;
        let outcome = self.complete(messages, params).await?;
        let token = ChatDelta::Token(outcome.text.clone());
        Ok(futures_util::stream::iter(vec![Ok(token), Ok(ChatDelta::Final(outcome))]).boxed())
    }
}

/// Chat provider that waits before answering, for deadline and
/// cancellation tests. The wait is async so timers still fire.
pub struct SlowChat {
    pub delay: Duration,
}

#[async_trait]
impl ChatProvider for SlowChat {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _params: &ChatParams,
    ) -> ProviderResult<ChatOutcome> {
        tokio::time::sleep(self.delay).await;
        Ok(ChatOutcome {
            text: "slow answer".into(),
            tokens_in: 1,
            tokens_out: 2,
            cost_estimate: 0.0,
        })
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> ProviderResult<ChatStream> {
        use futures_util::StreamExt;
        let outcome = self.complete(messages, params).await?;
        Ok(futures_util::stream::iter(vec![Ok(ChatDelta::Final(outcome))]).boxed())
    }
}

pub struct Harness {
    pub pool: SqlitePool,
    pub state: AppState,
}

impl Harness {
    /// Deterministic principal for a tenant; the same tenant always maps to
    /// the same user id so ownership checks line up across calls.
    pub fn ctx(&self, tenant_id: Uuid) -> TenantContext {
        let user_id = Uuid::new_v5(&Uuid::NAMESPACE_OID, tenant_id.as_bytes());
        TenantContext::new(tenant_id, user_id, UserRole::TenantAdmin)
    }

    /// Install mock embedding + chat configuration for a tenant.
    pub async fn configure_tenant(&self, tenant_id: Uuid) {
        store::tenant_config::put_embedding(
            &self.pool,
            tenant_id,
            &EmbeddingSelection {
                provider: "mock".into(),
                model: "mock-embed".into(),
                dimensions: EMBED_DIMS,
                base_url: None,
            },
        )
        .await
        .expect("store embedding selection");
        store::tenant_config::put_chat(
            &self.pool,
            tenant_id,
            &ChatSelection {
                provider: "mock".into(),
                model: "mock-chat".into(),
                base_url: None,
            },
        )
        .await
        .expect("store chat selection");
    }

    /// Swap the mock chat behaviour (new provider instances only; the
    /// registry's 60s instance cache is keyed per tenant+model, so use a
    /// distinct model name or tenant per behaviour).
    pub fn set_chat_behavior(&self, behavior: ChatBehavior) {
        self.state.providers.register_chat(
            "mock",
            Arc::new(move |_, _| {
                Ok(Arc::new(MockChat {
                    behavior: behavior.clone(),
                }) as Arc<dyn ChatProvider>)
            }),
        );
    }

    /// Replace the mock chat backend with one that stalls before replying.
    pub fn set_slow_chat(&self, delay: Duration) {
        self.state.providers.register_chat(
            "mock",
            Arc::new(move |_, _| Ok(Arc::new(SlowChat { delay }) as Arc<dyn ChatProvider>)),
        );
    }

    /// Upload a text document and drive ingestion to a terminal status.
    pub async fn ingest_text(&self, ctx: &TenantContext, filename: &str, text: &str) -> Document {
        let document = self
            .state
            .pipeline
            .ingest(ctx, filename, text.as_bytes().to_vec())
            .await
            .expect("ingest accepted");
        self.wait_document(ctx, document.id).await
    }

    pub async fn wait_document(&self, ctx: &TenantContext, id: Uuid) -> Document {
        wait_for(Duration::from_secs(5), move || async move {
            let document = store::documents::get(&self.pool, ctx.tenant_id, id)
                .await
                .expect("load document")
                .expect("document exists");
            document.status.is_terminal().then_some(document)
        })
        .await
        .expect("ingestion reached a terminal status")
    }

    pub async fn wait_operation(&self, ctx: &TenantContext, id: Uuid) -> LlmOperation {
        wait_for(Duration::from_secs(5), move || async move {
            let operation = self
                .state
                .engine
                .get(ctx, id)
                .await
                .expect("load operation");
            operation.status.is_terminal().then_some(operation)
        })
        .await
        .expect("operation reached a terminal status")
    }
}

/// Poll `check` until it yields a value or the timeout elapses.
pub async fn wait_for<T, F, Fut>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Build the full service stack over a fresh in-memory database with the
/// mock providers registered.
pub async fn harness() -> Harness {
    harness_with_engine_config(EngineConfig {
        deadline: Duration::from_secs(30),
        tenant_parallelism: 4,
        transform_input_budget: 6000,
    })
    .await
}

pub async fn harness_with_engine_config(engine_config: EngineConfig) -> Harness {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory database");
    store::MIGRATOR.run(&pool).await.expect("run migrations");

    let secrets = Arc::new(MemorySecretStore::new());
    let providers = Arc::new(ProviderRegistry::new(secrets.clone()));
    providers.register_embedding(
        "mock",
        Arc::new(|selection, _| {
            Ok(Arc::new(MockEmbedding {
                dims: selection.dimensions,
            }) as Arc<dyn EmbeddingProvider>)
        }),
    );
    providers.register_chat(
        "mock",
        Arc::new(|_, _| {
            Ok(Arc::new(MockChat {
                behavior: MockChat::echo(),
            }) as Arc<dyn ChatProvider>)
        }),
    );

    let uploads = tempfile::tempdir().expect("uploads dir");
    let vector = Arc::new(SqliteVectorIndex::new(pool.clone()));
    let pipeline = Arc::new(DocumentPipeline::new(
        pool.clone(),
        providers.clone(),
        vector.clone(),
        ParserRegistry::with_builtins(),
        ChunkerConfig {
            target_tokens: 64,
            overlap_tokens: 8,
        },
        uploads.keep(),
    ));
    let engine = Arc::new(OperationEngine::new(
        pool.clone(),
        providers.clone(),
        pipeline.clone(),
        engine_config,
    ));
    let checkpoints = Arc::new(SqliteCheckpointStore::new(pool.clone()));
    let executor = Arc::new(WorkflowExecutor::new(
        pool.clone(),
        providers.clone(),
        pipeline.clone(),
        checkpoints,
    ));
    let sessions = Arc::new(SessionService::new(pool.clone()));
    let hitl = Arc::new(HitlCoordinator::new(pool.clone(), executor.clone()));

    let auth = Arc::new(StaticTokenVerifier::new());
    auth.insert(
        "test-token",
        Principal {
            tenant_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            role: UserRole::TenantAdmin,
        },
    );

    let state = AppState {
        pool: pool.clone(),
        pipeline,
        engine,
        executor,
        sessions,
        hitl,
        providers,
        secrets,
        vector,
        auth,
    };
    Harness { pool, state }
}

/// A short plain-text document used across scenarios.
pub const FRANCE_DOC: &str = "Travel notes. The capital of France is Paris. \
    The city sits on the Seine and hosts the Louvre museum. \
    French cuisine is known for bread, cheese, and wine.";

pub fn assert_completed(document: &Document) {
    assert_eq!(
        document.status,
        DocumentStatus::Completed,
        "expected completed document, got {:?} ({:?})",
        document.status,
        document.error_message
    );
}
