//! Server binary: configuration, tracing, service wiring, and the HTTP
//! serve loop with graceful shutdown.

use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use ragloom::api::{router, StaticTokenVerifier};
use ragloom::bootstrap::build_state;
use ragloom::config::AppConfig;
use ragloom::secrets::{CachingSecretStore, FileSecretStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env();
    tracing::info!(
        database = %config.database_url,
        addr = %config.bind_addr,
        "starting ragloom"
    );

    let secrets = Arc::new(CachingSecretStore::new(FileSecretStore::new(
        config.secrets_dir.clone(),
    )));
    // Token issuance is external; the static verifier seeds from
    // RAGLOOM_DEV_TOKEN for local development.
    let auth = Arc::new(StaticTokenVerifier::new());
    if let Ok(spec) = std::env::var("RAGLOOM_DEV_TOKEN") {
        if let Some(principal) = parse_dev_token(&spec) {
            auth.insert(spec.split(':').next().unwrap_or_default(), principal);
            tracing::info!("registered development bearer token");
        } else {
            tracing::warn!("RAGLOOM_DEV_TOKEN must be `token:tenant_uuid:user_uuid`");
        }
    }

    let state = build_state(&config, secrets, auth).await?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

fn parse_dev_token(spec: &str) -> Option<ragloom::api::Principal> {
    let mut parts = spec.split(':');
    let _token = parts.next()?;
    let tenant_id = parts.next()?.parse().ok()?;
    let user_id = parts.next()?.parse().ok()?;
    Some(ragloom::api::Principal {
        tenant_id,
        user_id,
        role: ragloom::tenant::UserRole::TenantAdmin,
    })
}
