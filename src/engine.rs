//! Asynchronous LLM operation engine.
//!
//! Submission returns the operation row in `pending` status immediately;
//! a background task owns the rest of the lifecycle and always terminates by
//! writing a terminal row. Each row has a single writer: terminal updates
//! are guarded on the current status, so the first
//! `processing -> {completed | failed}` wins and late results are discarded.
//!
//! Per-tenant concurrency is capped with a semaphore, every task runs under
//! a wall-clock deadline (exceeding it cancels in-flight provider calls and
//! fails the row with `timeout`), and explicit cancellation aborts the task
//! before failing the row.

use chrono::Utc;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::instrument;
use uuid::Uuid;

use crate::ingest::{DocumentPipeline, PipelineError};
use crate::message::ChatMessage;
use crate::models::{
    ChatSelection, DocumentStatus, LlmOperation, OperationStatus, OperationType, OutputFormat,
};
use crate::providers::{ChatParams, ChatProvider, ProviderError, ProviderRegistry};
use crate::store::{self, StoreError};
use crate::tenant::TenantContext;

/// Similarity floor for `ask` retrieval.
const ASK_MIN_SCORE: f32 = 0.5;
/// Characters of chunk content quoted in a source preview.
const PREVIEW_CHARS: usize = 160;

fn default_max_chunks() -> usize {
    5
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SummarizeRequest {
    pub document_id: Uuid,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AskRequest {
    pub document_id: Uuid,
    pub question: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformRequest {
    pub document_id: Uuid,
    pub instruction: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "OutputFormat::default_text")]
    pub output_format: OutputFormat,
}

impl OutputFormat {
    fn default_text() -> Self {
        OutputFormat::Text
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("operation not found")]
    #[diagnostic(code(ragloom::engine::not_found))]
    NotFound,

    #[error("{0}")]
    #[diagnostic(code(ragloom::engine::validation))]
    Validation(String),

    #[error("{0}")]
    #[diagnostic(code(ragloom::engine::conflict))]
    Conflict(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Pipeline(#[from] PipelineError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Wall-clock limit for one background task.
    pub deadline: Duration,
    /// Concurrent background tasks allowed per tenant.
    pub tenant_parallelism: usize,
    /// Token budget per transform window.
    pub transform_input_budget: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(600),
            tenant_parallelism: 4,
            transform_input_budget: 6000,
        }
    }
}

/// Successful output of a background task, written in one terminal update.
struct TaskOutput {
    output: Value,
    model: String,
    tokens: i64,
    cost: f64,
}

#[derive(Clone)]
pub struct OperationEngine {
    pool: SqlitePool,
    providers: Arc<ProviderRegistry>,
    pipeline: Arc<DocumentPipeline>,
    config: EngineConfig,
    running: Arc<Mutex<FxHashMap<Uuid, AbortHandle>>>,
    tenant_slots: Arc<Mutex<FxHashMap<Uuid, Arc<Semaphore>>>>,
}

impl OperationEngine {
    #[must_use]
    pub fn new(
        pool: SqlitePool,
        providers: Arc<ProviderRegistry>,
        pipeline: Arc<DocumentPipeline>,
        config: EngineConfig,
    ) -> Self {
        Self {
            pool,
            providers,
            pipeline,
            config,
            running: Arc::new(Mutex::new(FxHashMap::default())),
            tenant_slots: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    pub async fn get(&self, ctx: &TenantContext, id: Uuid) -> Result<LlmOperation> {
        store::operations::get(&self.pool, ctx.tenant_id, id)
            .await?
            .ok_or(EngineError::NotFound)
    }

    pub async fn list(&self, ctx: &TenantContext, skip: i64, limit: i64) -> Result<Vec<LlmOperation>> {
        Ok(store::operations::list(&self.pool, ctx.tenant_id, skip, limit).await?)
    }

    /// Most recent completed summary for a document, if any.
    pub async fn latest_summary(
        &self,
        ctx: &TenantContext,
        document_id: Uuid,
    ) -> Result<Option<LlmOperation>> {
        Ok(store::operations::latest_completed_summarize(&self.pool, ctx.tenant_id, document_id)
            .await?)
    }

    /// Cancel a non-terminal operation: abort its task and fail the row.
    /// Any provider response still in flight is discarded by the status
    /// guard on terminal writes.
    #[instrument(skip(self, ctx), fields(tenant = %ctx.tenant_id))]
    pub async fn cancel(&self, ctx: &TenantContext, id: Uuid) -> Result<LlmOperation> {
        let operation = self.get(ctx, id).await?;
        if operation.status.is_terminal() {
            return Err(EngineError::Conflict("operation already terminal".into()));
        }
        if let Ok(mut running) = self.running.lock()
            && let Some(handle) = running.remove(&id)
        {
            handle.abort();
        }
        store::operations::fail(&self.pool, id, "cancelled").await?;
        self.get(ctx, id).await
    }

    #[instrument(skip(self, ctx, request), fields(tenant = %ctx.tenant_id, document = %request.document_id))]
    pub async fn summarize(
        &self,
        ctx: &TenantContext,
        request: SummarizeRequest,
    ) -> Result<LlmOperation> {
        let chat = self.require_chat_config(ctx).await?;
        self.require_completed_document(ctx, request.document_id).await?;

        if !request.force
            && let Some(cached) = store::operations::latest_completed_summarize(
                &self.pool,
                ctx.tenant_id,
                request.document_id,
            )
            .await?
        {
            // Serve the cache as a fresh completed row so the caller's
            // polling contract is identical either way.
            let mut output = cached.output_data.clone().unwrap_or_else(|| json!({}));
            output["cached"] = json!(true);
            let now = Utc::now();
            let operation = LlmOperation {
                id: Uuid::new_v4(),
                tenant_id: ctx.tenant_id,
                user_id: ctx.user_id,
                document_id: Some(request.document_id),
                operation_type: OperationType::Summarize,
                input_data: json!({
                    "document_id": request.document_id,
                    "model": request.model,
                    "max_length": request.max_length,
                    "force": false,
                }),
                output_data: Some(output),
                model_used: cached.model_used.clone(),
                tokens_used: Some(0),
                cost_estimate: Some(0.0),
                status: OperationStatus::Completed,
                error_message: None,
                created_at: now,
                completed_at: Some(now),
            };
            store::operations::insert(&self.pool, &operation).await?;
            return Ok(operation);
        }

        let operation = self
            .insert_pending(
                ctx,
                OperationType::Summarize,
                Some(request.document_id),
                json!({
                    "document_id": request.document_id,
                    "model": request.model.clone(),
                    "max_length": request.max_length,
                    "force": request.force,
                }),
            )
            .await?;

        let engine = self.clone();
        let task_ctx = ctx.clone();
        let id = operation.id;
        self.spawn(ctx.tenant_id, id, async move {
            engine.run_summarize(&task_ctx, id, chat, request).await
        });
        Ok(operation)
    }

    #[instrument(skip(self, ctx, request), fields(tenant = %ctx.tenant_id, document = %request.document_id))]
    pub async fn ask(&self, ctx: &TenantContext, request: AskRequest) -> Result<LlmOperation> {
        if request.question.trim().is_empty() {
            return Err(EngineError::Validation("question must not be empty".into()));
        }
        let chat = self.require_chat_config(ctx).await?;
        self.require_completed_document(ctx, request.document_id).await?;

        let operation = self
            .insert_pending(
                ctx,
                OperationType::Ask,
                Some(request.document_id),
                json!({
                    "document_id": request.document_id,
                    "question": request.question.clone(),
                    "model": request.model.clone(),
                    "max_chunks": request.max_chunks,
                }),
            )
            .await?;

        let engine = self.clone();
        let task_ctx = ctx.clone();
        let id = operation.id;
        self.spawn(ctx.tenant_id, id, async move {
            engine.run_ask(&task_ctx, chat, request).await
        });
        Ok(operation)
    }

    #[instrument(skip(self, ctx, request), fields(tenant = %ctx.tenant_id, document = %request.document_id))]
    pub async fn transform(
        &self,
        ctx: &TenantContext,
        request: TransformRequest,
    ) -> Result<LlmOperation> {
        if request.instruction.trim().is_empty() {
            return Err(EngineError::Validation("instruction must not be empty".into()));
        }
        let chat = self.require_chat_config(ctx).await?;
        self.require_completed_document(ctx, request.document_id).await?;

        let operation = self
            .insert_pending(
                ctx,
                OperationType::Transform,
                Some(request.document_id),
                json!({
                    "document_id": request.document_id,
                    "instruction": request.instruction.clone(),
                    "model": request.model.clone(),
                    "output_format": request.output_format,
                }),
            )
            .await?;

        let engine = self.clone();
        let task_ctx = ctx.clone();
        let id = operation.id;
        self.spawn(ctx.tenant_id, id, async move {
            engine.run_transform(&task_ctx, chat, request).await
        });
        Ok(operation)
    }

    // -----------------------------------------------------------------------
    // Background harness
    // -----------------------------------------------------------------------

    fn tenant_slot(&self, tenant_id: Uuid) -> Arc<Semaphore> {
        let mut slots = self
            .tenant_slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.tenant_parallelism)))
            .clone()
    }

    /// Run `work` as the operation's single background writer: acquire the
    /// tenant slot, move the row to `processing`, enforce the deadline, and
    /// finish with exactly one guarded terminal write.
    fn spawn(
        &self,
        tenant_id: Uuid,
        operation_id: Uuid,
        work: impl Future<Output = Result<TaskOutput>> + Send + 'static,
    ) {
        let engine = self.clone();
        let slot = self.tenant_slot(tenant_id);
        let deadline = self.config.deadline;

        let handle = tokio::spawn(async move {
            let _permit = slot.acquire_owned().await;

            if !matches!(
                store::operations::mark_processing(&engine.pool, operation_id).await,
                Ok(true)
            ) {
                // Cancelled (or lost) before the task started.
                return;
            }

            let outcome = tokio::time::timeout(deadline, work).await;
            let result = match outcome {
                Ok(Ok(output)) => {
                    store::operations::complete(
                        &engine.pool,
                        operation_id,
                        &output.output,
                        Some(&output.model),
                        Some(output.tokens),
                        Some(output.cost),
                    )
                    .await
                }
                Ok(Err(e)) => {
                    tracing::warn!(operation = %operation_id, error = %e, "operation failed");
                    store::operations::fail(&engine.pool, operation_id, &e.to_string()).await
                }
                Err(_) => store::operations::fail(&engine.pool, operation_id, "timeout").await,
            };
            if let Err(e) = result {
                tracing::error!(operation = %operation_id, error = %e, "terminal write failed");
            }

            if let Ok(mut running) = engine.running.lock() {
                running.remove(&operation_id);
            }
        });

        if !handle.is_finished()
            && let Ok(mut running) = self.running.lock()
        {
            running.insert(operation_id, handle.abort_handle());
        }
    }

    // -----------------------------------------------------------------------
    // Task bodies
    // -----------------------------------------------------------------------

    async fn run_summarize(
        &self,
        ctx: &TenantContext,
        _operation_id: Uuid,
        chat: ChatSelection,
        request: SummarizeRequest,
    ) -> Result<TaskOutput> {
        let chunks =
            store::documents::list_chunks(&self.pool, ctx.tenant_id, request.document_id).await?;
        if chunks.is_empty() {
            return Err(EngineError::Validation("document has no chunks".into()));
        }
        let body: String = chunks
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let length_hint = match request.max_length {
            Some(words) => format!(" Keep the summary under {words} words."),
            None => String::new(),
        };
        let messages = vec![
            ChatMessage::system(format!(
                "You summarize documents faithfully, without adding information.{length_hint}"
            )),
            ChatMessage::user(format!("Summarize the following document:\n\n{body}")),
        ];

        let params = self.chat_params(&chat, request.model.as_deref());
        let provider = self.providers.chat_for(ctx.tenant_id, &chat).await?;
        let outcome = provider.complete(&messages, &params).await?;

        Ok(TaskOutput {
            output: json!({
                "summary": outcome.text,
                "cached": false,
                "chunk_count": chunks.len(),
            }),
            model: params.model,
            tokens: i64::from(outcome.tokens_in + outcome.tokens_out),
            cost: outcome.cost_estimate,
        })
    }

    async fn run_ask(
        &self,
        ctx: &TenantContext,
        chat: ChatSelection,
        request: AskRequest,
    ) -> Result<TaskOutput> {
        let hits = self
            .pipeline
            .search(
                ctx,
                &request.question,
                request.max_chunks,
                ASK_MIN_SCORE,
                Some(vec![request.document_id]),
            )
            .await?;

        let params = self.chat_params(&chat, request.model.as_deref());
        if hits.is_empty() {
            return Ok(TaskOutput {
                output: json!({
                    "answer": "No relevant information found",
                    "sources": [],
                }),
                model: params.model,
                tokens: 0,
                cost: 0.0,
            });
        }

        let context = hits
            .iter()
            .map(|hit| format!("[{}] {}", hit.chunk_index, hit.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let messages = vec![
            ChatMessage::system(
                "Answer strictly from the provided context passages. Cite passage \
                 numbers in square brackets. If the context does not contain the \
                 answer, say so.",
            ),
            ChatMessage::user(format!(
                "Context:\n{context}\n\nQuestion: {}",
                request.question
            )),
        ];
        let provider = self.providers.chat_for(ctx.tenant_id, &chat).await?;
        let outcome = provider.complete(&messages, &params).await?;

        let sources: Vec<Value> = hits
            .iter()
            .map(|hit| {
                json!({
                    "chunk_index": hit.chunk_index,
                    "score": hit.score,
                    "content_preview": preview(&hit.content),
                })
            })
            .collect();

        Ok(TaskOutput {
            output: json!({ "answer": outcome.text, "sources": sources }),
            model: params.model,
            tokens: i64::from(outcome.tokens_in + outcome.tokens_out),
            cost: outcome.cost_estimate,
        })
    }

    async fn run_transform(
        &self,
        ctx: &TenantContext,
        chat: ChatSelection,
        request: TransformRequest,
    ) -> Result<TaskOutput> {
        let chunks =
            store::documents::list_chunks(&self.pool, ctx.tenant_id, request.document_id).await?;
        if chunks.is_empty() {
            return Err(EngineError::Validation("document has no chunks".into()));
        }

        // Ordered windows under the provider input budget.
        let mut windows: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0usize;
        for chunk in &chunks {
            let tokens = chunk.token_count.max(1) as usize;
            if !current.is_empty()
                && current_tokens + tokens > self.config.transform_input_budget
            {
                windows.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(&chunk.content);
            current_tokens += tokens;
        }
        if !current.is_empty() {
            windows.push(current);
        }

        let params = {
            let mut p = self.chat_params(&chat, request.model.as_deref());
            p.json_mode = request.output_format == OutputFormat::Json;
            p
        };
        let provider = self.providers.chat_for(ctx.tenant_id, &chat).await?;

        let format_note = match request.output_format {
            OutputFormat::Text => "Respond in plain text.",
            OutputFormat::Markdown => "Respond in well-formed Markdown.",
            OutputFormat::Json => "Respond with a single well-formed JSON object and nothing else.",
        };

        let mut outputs: Vec<String> = Vec::new();
        let mut total_tokens = 0i64;
        let mut total_cost = 0.0f64;
        for window in &windows {
            let messages = vec![
                ChatMessage::system(format!(
                    "Apply the user's instruction to the supplied text. {format_note}"
                )),
                ChatMessage::user(format!(
                    "Instruction: {}\n\nText:\n{window}",
                    request.instruction
                )),
            ];
            let outcome = provider.complete(&messages, &params).await?;
            total_tokens += i64::from(outcome.tokens_in + outcome.tokens_out);
            total_cost += outcome.cost_estimate;

            let text = if request.output_format == OutputFormat::Json {
                match validated_json(&outcome.text) {
                    Some(valid) => valid,
                    None => {
                        // One corrective retry, then the operation fails.
                        let mut retry_messages = messages.clone();
                        retry_messages.insert(
                            1,
                            ChatMessage::system(
                                "Your previous reply was not valid JSON. Respond with \
                                 only a syntactically valid JSON object.",
                            ),
                        );
                        let retried = provider.complete(&retry_messages, &params).await?;
                        total_tokens += i64::from(retried.tokens_in + retried.tokens_out);
                        total_cost += retried.cost_estimate;
                        validated_json(&retried.text).ok_or_else(|| {
                            EngineError::Validation(
                                "provider output was not valid JSON after one retry".into(),
                            )
                        })?
                    }
                }
            } else {
                outcome.text
            };
            outputs.push(text);
        }

        let result = match request.output_format {
            OutputFormat::Json if outputs.len() > 1 => {
                let parts: Vec<Value> = outputs
                    .iter()
                    .map(|o| serde_json::from_str(o).unwrap_or(Value::Null))
                    .collect();
                Value::Array(parts).to_string()
            }
            _ => outputs.join("\n\n"),
        };

        Ok(TaskOutput {
            output: json!({
                "result": result,
                "output_format": request.output_format,
                "windows": windows.len(),
            }),
            model: params.model,
            tokens: total_tokens,
            cost: total_cost,
        })
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    async fn insert_pending(
        &self,
        ctx: &TenantContext,
        operation_type: OperationType,
        document_id: Option<Uuid>,
        input_data: Value,
    ) -> Result<LlmOperation> {
        let operation = LlmOperation {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            user_id: ctx.user_id,
            document_id,
            operation_type,
            input_data,
            output_data: None,
            model_used: None,
            tokens_used: None,
            cost_estimate: None,
            status: OperationStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        store::operations::insert(&self.pool, &operation).await?;
        Ok(operation)
    }

    async fn require_chat_config(&self, ctx: &TenantContext) -> Result<ChatSelection> {
        store::tenant_config::get(&self.pool, ctx.tenant_id)
            .await?
            .and_then(|config| config.chat)
            .ok_or_else(|| EngineError::Validation("no chat provider configured for tenant".into()))
    }

    async fn require_completed_document(&self, ctx: &TenantContext, id: Uuid) -> Result<()> {
        let document = store::documents::get(&self.pool, ctx.tenant_id, id)
            .await?
            .ok_or(EngineError::NotFound)?;
        if document.status != DocumentStatus::Completed {
            return Err(EngineError::Validation(format!(
                "document is {}, expected completed",
                document.status
            )));
        }
        Ok(())
    }

    fn chat_params(&self, chat: &ChatSelection, model_override: Option<&str>) -> ChatParams {
        ChatParams::for_model(model_override.unwrap_or(&chat.model))
    }
}

fn preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_CHARS {
        return content.to_string();
    }
    content.chars().take(PREVIEW_CHARS).collect()
}

/// Accept a JSON object/array possibly wrapped in a markdown code fence;
/// return the canonical serialisation, or `None` if unparseable.
fn validated_json(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let candidate = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);
    serde_json::from_str::<Value>(candidate)
        .ok()
        .map(|v| v.to_string())
}
