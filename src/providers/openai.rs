//! OpenAI-compatible backend (cloud, API-key authenticated).
//!
//! Speaks the `/chat/completions` and `/embeddings` JSON shapes, which a
//! number of hosted gateways also expose; the base URL is configurable so
//! the same adapter covers them.

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::message::{ChatMessage, Role};

use super::{
    approx_tokens, classify_status, ChatDelta, ChatOutcome, ChatParams, ChatProvider, ChatStream,
    EmbeddingProvider, ProviderError, Result,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Blended per-1k-token rate used for the advisory cost estimate.
const COST_PER_1K_TOKENS: f64 = 0.002;

fn http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .unwrap_or_default()
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

fn wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage<'_>> {
    messages
        .iter()
        .map(|m| WireMessage {
            role: wire_role(m.role),
            content: &m.content,
        })
        .collect()
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn check_response(
    provider: &str,
    model: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let after = retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(provider, model, status, after, body))
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

pub struct OpenAiChatProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiChatProvider {
    #[must_use]
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
        }
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": params.model,
            "messages": wire_messages(messages),
            "stream": stream,
        });
        if let Some(t) = params.temperature {
            body["temperature"] = t.into();
        }
        if let Some(max) = params.max_tokens {
            body["max_tokens"] = max.into();
        }
        if params.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        body
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn cost_estimate(tokens_in: u32, tokens_out: u32) -> f64 {
    f64::from(tokens_in + tokens_out) / 1000.0 * COST_PER_1K_TOKENS
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    async fn complete(&self, messages: &[ChatMessage], params: &ChatParams) -> Result<ChatOutcome> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(messages, params, false))
            .send()
            .await?;
        let response = check_response("openai", &params.model, response).await?;
        let parsed: CompletionResponse =
            response.json().await.map_err(|e| ProviderError::Permanent {
                message: format!("malformed completion response: {e}"),
            })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Permanent {
                message: "completion response carried no choices".to_string(),
            })?;
        let (tokens_in, tokens_out) = match parsed.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (0, approx_tokens(&text)),
        };
        Ok(ChatOutcome {
            cost_estimate: cost_estimate(tokens_in, tokens_out),
            text,
            tokens_in,
            tokens_out,
        })
    }

    async fn stream(&self, messages: &[ChatMessage], params: &ChatParams) -> Result<ChatStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(messages, params, true))
            .send()
            .await?;
        let response = check_response("openai", &params.model, response).await?;

        let stream = try_stream! {
            let mut body = response.bytes_stream();
            let mut buffer = String::new();
            let mut assembled = String::new();

            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        let tokens_out = approx_tokens(&assembled);
                        yield ChatDelta::Final(ChatOutcome {
                            text: assembled.clone(),
                            tokens_in: 0,
                            tokens_out,
                            cost_estimate: cost_estimate(0, tokens_out),
                        });
                        return;
                    }
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(data)
                        && let Some(delta) = value["choices"][0]["delta"]["content"].as_str()
                        && !delta.is_empty()
                    {
                        assembled.push_str(delta);
                        yield ChatDelta::Token(delta.to_string());
                    }
                }
            }

            // Stream ended without a [DONE] marker; still emit the terminal
            // outcome so consumers observe completion.
            let tokens_out = approx_tokens(&assembled);
            yield ChatDelta::Final(ChatOutcome {
                text: assembled.clone(),
                tokens_in: 0,
                tokens_out,
                cost_estimate: cost_estimate(0, tokens_out),
            });
        };
        Ok(stream.boxed())
    }
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

pub struct OpenAiEmbeddingProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: u32,
}

impl OpenAiEmbeddingProvider {
    #[must_use]
    pub fn new(api_key: String, model: String, dimensions: u32, base_url: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            model,
            dimensions,
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .send()
            .await?;
        let response = check_response("openai", &self.model, response).await?;
        let parsed: EmbeddingResponse =
            response.json().await.map_err(|e| ProviderError::Permanent {
                message: format!("malformed embedding response: {e}"),
            })?;

        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        if vectors.len() != texts.len() {
            return Err(ProviderError::Permanent {
                message: format!(
                    "embedding count mismatch: sent {}, received {}",
                    texts.len(),
                    vectors.len()
                ),
            });
        }
        for vector in &vectors {
            if vector.len() != self.dimensions as usize {
                return Err(ProviderError::Permanent {
                    message: format!(
                        "embedding dimension mismatch: expected {}, received {}",
                        self.dimensions,
                        vector.len()
                    ),
                });
            }
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> u32 {
        self.dimensions
    }

    async fn probe(&self) -> Result<()> {
        self.embed(&["probe".to_string()]).await.map(|_| ())
    }
}
