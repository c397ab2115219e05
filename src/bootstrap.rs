//! Service wiring: build the full [`AppState`] from configuration.
//!
//! The server binary and the integration tests share this assembly so they
//! exercise the same object graph; tests swap in memory-backed secret
//! stores, static token tables, and mock provider factories through the
//! same seams.

use std::sync::Arc;

use crate::api::{AppState, AuthVerifier};
use crate::checkpoint::SqliteCheckpointStore;
use crate::config::AppConfig;
use crate::engine::{EngineConfig, OperationEngine};
use crate::executor::WorkflowExecutor;
use crate::hitl::HitlCoordinator;
use crate::ingest::{chunker::ChunkerConfig, parser::ParserRegistry, DocumentPipeline};
use crate::providers::ProviderRegistry;
use crate::secrets::SecretStore;
use crate::session::SessionService;
use crate::store::{self, StoreError};
use crate::vector::SqliteVectorIndex;

/// Connect storage and wire every service into an [`AppState`].
pub async fn build_state(
    config: &AppConfig,
    secrets: Arc<dyn SecretStore>,
    auth: Arc<dyn AuthVerifier>,
) -> Result<AppState, StoreError> {
    let pool = store::connect(&config.database_url).await?;

    let providers = Arc::new(ProviderRegistry::new(secrets.clone()));
    let vector = Arc::new(SqliteVectorIndex::new(pool.clone()));
    let pipeline = Arc::new(DocumentPipeline::new(
        pool.clone(),
        providers.clone(),
        vector.clone(),
        ParserRegistry::with_builtins(),
        ChunkerConfig {
            target_tokens: config.chunk_target_tokens,
            overlap_tokens: config.chunk_overlap_tokens,
        },
        config.uploads_dir.clone(),
    ));
    let engine = Arc::new(OperationEngine::new(
        pool.clone(),
        providers.clone(),
        pipeline.clone(),
        EngineConfig {
            deadline: config.operation_deadline,
            tenant_parallelism: config.tenant_parallelism,
            transform_input_budget: config.transform_input_budget,
        },
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

    Ok(AppState {
        pool,
        pipeline,
        engine,
        executor,
        sessions,
        hitl,
        providers,
        secrets,
        vector,
        auth,
    })
}
