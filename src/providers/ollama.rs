//! Ollama backend (local, base-URL addressed, no credential).

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::message::{ChatMessage, Role};

use super::{
    approx_tokens, classify_status, ChatDelta, ChatOutcome, ChatParams, ChatProvider, ChatStream,
    EmbeddingProvider, ProviderError, Result,
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

fn http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .unwrap_or_default()
}

fn wire_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                },
                "content": m.content,
            })
        })
        .collect()
}

async fn check_response(model: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(classify_status("ollama", model, status, None, body))
}

pub struct OllamaChatProvider {
    client: Client,
    base_url: String,
}

impl OllamaChatProvider {
    #[must_use]
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
        stream: bool,
    ) -> serde_json::Value {
        let mut options = serde_json::Map::new();
        if let Some(t) = params.temperature {
            options.insert("temperature".into(), t.into());
        }
        if let Some(max) = params.max_tokens {
            options.insert("num_predict".into(), max.into());
        }
        let mut body = serde_json::json!({
            "model": params.model,
            "messages": wire_messages(messages),
            "stream": stream,
            "options": options,
        });
        if params.json_mode {
            body["format"] = "json".into();
        }
        body
    }
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct OllamaStreamLine {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[async_trait]
impl ChatProvider for OllamaChatProvider {
    async fn complete(&self, messages: &[ChatMessage], params: &ChatParams) -> Result<ChatOutcome> {
        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&self.request_body(messages, params, false))
            .send()
            .await?;
        let response = check_response(&params.model, response).await?;
        let parsed: OllamaChatResponse =
            response.json().await.map_err(|e| ProviderError::Permanent {
                message: format!("malformed chat response: {e}"),
            })?;

        let tokens_in = parsed.prompt_eval_count.unwrap_or(0);
        let tokens_out = parsed
            .eval_count
            .unwrap_or_else(|| approx_tokens(&parsed.message.content));
        Ok(ChatOutcome {
            text: parsed.message.content,
            tokens_in,
            tokens_out,
            // Local inference carries no metered cost.
            cost_estimate: 0.0,
        })
    }

    async fn stream(&self, messages: &[ChatMessage], params: &ChatParams) -> Result<ChatStream> {
        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&self.request_body(messages, params, true))
            .send()
            .await?;
        let response = check_response(&params.model, response).await?;

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
                    if line.is_empty() {
                        continue;
                    }
                    let Ok(parsed) = serde_json::from_str::<OllamaStreamLine>(&line) else {
                        continue;
                    };
                    if let Some(message) = &parsed.message
                        && !message.content.is_empty()
                    {
                        assembled.push_str(&message.content);
                        yield ChatDelta::Token(message.content.clone());
                    }
                    if parsed.done {
                        let tokens_in = parsed.prompt_eval_count.unwrap_or(0);
                        let tokens_out = parsed
                            .eval_count
                            .unwrap_or_else(|| approx_tokens(&assembled));
                        yield ChatDelta::Final(ChatOutcome {
                            text: assembled.clone(),
                            tokens_in,
                            tokens_out,
                            cost_estimate: 0.0,
                        });
                        return;
                    }
                }
            }

            let tokens_out = approx_tokens(&assembled);
            yield ChatDelta::Final(ChatOutcome {
                text: assembled.clone(),
                tokens_in: 0,
                tokens_out,
                cost_estimate: 0.0,
            });
        };
        Ok(stream.boxed())
    }
}

pub struct OllamaEmbeddingProvider {
    client: Client,
    base_url: String,
    model: String,
    dimensions: u32,
}

impl OllamaEmbeddingProvider {
    #[must_use]
    pub fn new(model: String, dimensions: u32, base_url: Option<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model,
            dimensions,
        }
    }
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .send()
            .await?;
        let response = check_response(&self.model, response).await?;
        let parsed: OllamaEmbedResponse =
            response.json().await.map_err(|e| ProviderError::Permanent {
                message: format!("malformed embed response: {e}"),
            })?;

        if parsed.embeddings.len() != texts.len() {
            return Err(ProviderError::Permanent {
                message: format!(
                    "embedding count mismatch: sent {}, received {}",
                    texts.len(),
                    parsed.embeddings.len()
                ),
            });
        }
        Ok(parsed.embeddings)
    }

    fn dimensions(&self) -> u32 {
        self.dimensions
    }

    async fn probe(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().await?;
        check_response(&self.model, response).await.map(|_| ())
    }
}
