//! Provider abstraction: embeddings and chat completion behind capability
//! traits, with concrete backends selected at runtime by string identifier.
//!
//! Two capability sets exist:
//! - [`EmbeddingProvider`]: batch text embedding with a fixed dimension.
//! - [`ChatProvider`]: chat completion, blocking or streamed.
//!
//! The [`registry::ProviderRegistry`] resolves a tenant's configuration and
//! credentials into provider instances and applies the retry policy:
//! transient errors retry up to [`MAX_RETRIES`] times with exponential
//! backoff (250 ms doubling, jittered); everything else propagates.

pub mod ollama;
pub mod openai;
pub mod registry;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::message::ChatMessage;

pub use registry::{ProviderCredentials, ProviderRegistry};

/// Maximum retry attempts for transient provider errors.
pub const MAX_RETRIES: u32 = 3;
/// Base backoff before the first retry.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Error, Diagnostic)]
pub enum ProviderError {
    #[error("provider auth error ({provider}): {message}")]
    #[diagnostic(
        code(ragloom::provider::auth),
        help("Verify the stored API key for `{provider}` in the secret store.")
    )]
    Auth { provider: String, message: String },

    #[error("provider rate limited")]
    #[diagnostic(code(ragloom::provider::rate_limited))]
    RateLimited { retry_after: Option<Duration> },

    #[error("model not found: {model}")]
    #[diagnostic(
        code(ragloom::provider::model_not_found),
        help("Check the tenant's configured model name against the provider's catalogue.")
    )]
    ModelNotFound { model: String },

    #[error("transient provider error: {message}")]
    #[diagnostic(code(ragloom::provider::transient))]
    Transient { message: String },

    #[error("provider error: {message}")]
    #[diagnostic(code(ragloom::provider::permanent))]
    Permanent { message: String },
}

impl ProviderError {
    /// Only transient failures are retried; auth, rate-limit, unknown-model,
    /// and permanent errors propagate to the caller after the current
    /// attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        // Connection and body errors are worth retrying; the status-code
        // classification happens where the response is inspected.
        ProviderError::Transient {
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Completion parameters forwarded to a chat backend.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatParams {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Ask the backend for a JSON-object response where supported.
    #[serde(default)]
    pub json_mode: bool,
}

impl ChatParams {
    #[must_use]
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

/// Result of a completed (non-streamed) chat call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatOutcome {
    pub text: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost_estimate: f64,
}

/// One element of a streamed chat response.
#[derive(Clone, Debug)]
pub enum ChatDelta {
    /// An incremental text fragment.
    Token(String),
    /// Terminal element carrying the assembled outcome.
    Final(ChatOutcome),
}

pub type ChatStream = BoxStream<'static, Result<ChatDelta>>;

/// Batch text embedding with a fixed output dimension.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed each input text into a `dimensions()`-sized vector, preserving
    /// input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimensions(&self) -> u32;

    /// Cheap reachability/credential check.
    async fn probe(&self) -> Result<()>;
}

/// Chat completion, blocking or streamed.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage], params: &ChatParams) -> Result<ChatOutcome>;

    /// Stream deltas; the final element is always [`ChatDelta::Final`].
    async fn stream(&self, messages: &[ChatMessage], params: &ChatParams) -> Result<ChatStream>;
}

impl std::fmt::Debug for dyn EmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn EmbeddingProvider")
    }
}

impl std::fmt::Debug for dyn ChatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ChatProvider")
    }
}

/// Run `f`, retrying transient failures with exponential backoff and jitter.
pub async fn with_retry<T, F, Fut>(operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;
    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let delay = backoff_delay(attempt - 1);
            tracing::warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after transient provider error"
            );
            tokio::time::sleep(delay).await;
        }
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => last_error = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or(ProviderError::Transient {
        message: format!("{operation}: retries exhausted"),
    }))
}

/// 250 ms × 2ⁿ with up to 25% additive jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY.as_millis() as u64 * (1u64 << attempt.min(16));
    let jitter = (base as f64 * 0.25 * rand::random::<f64>()) as u64;
    Duration::from_millis(base + jitter)
}

/// Classify an HTTP error response from a provider backend.
pub(crate) fn classify_status(
    provider: &str,
    model: &str,
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: String,
) -> ProviderError {
    match status.as_u16() {
        401 | 403 => ProviderError::Auth {
            provider: provider.to_string(),
            message: body,
        },
        404 => ProviderError::ModelNotFound {
            model: model.to_string(),
        },
        429 => ProviderError::RateLimited { retry_after },
        500..=599 => ProviderError::Transient { message: body },
        _ => ProviderError::Permanent { message: body },
    }
}

/// Rough whitespace token estimate for backends that omit usage counts.
pub(crate) fn approx_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::Transient {
                        message: "flaky".into(),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_auth_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ProviderError::Auth {
                    provider: "openai".into(),
                    message: "bad key".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(ProviderError::Auth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_classification() {
        let err = classify_status(
            "openai",
            "gpt-x",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(2)),
            String::new(),
        );
        assert!(matches!(err, ProviderError::RateLimited { .. }));
        assert!(!err.is_retryable());

        let err = classify_status(
            "openai",
            "gpt-x",
            reqwest::StatusCode::BAD_GATEWAY,
            None,
            "upstream".into(),
        );
        assert!(err.is_retryable());
    }
}
