//! Operation engine integration: polling lifecycle, the summarize cache,
//! ask citations, transform formats, cancellation, and timeouts.

mod support;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use ragloom::engine::{AskRequest, EngineConfig, EngineError, SummarizeRequest, TransformRequest};
use ragloom::models::{OperationStatus, OutputFormat};

use support::{assert_completed, harness, harness_with_engine_config, FRANCE_DOC};

fn summarize_request(document_id: Uuid, force: bool) -> SummarizeRequest {
    serde_json::from_value(serde_json::json!({
        "document_id": document_id,
        "force": force,
    }))
    .unwrap()
}

#[tokio::test]
async fn summarize_cache_returns_identical_output() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    let document = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;
    assert_completed(&document);

    // First summarize runs the provider.
    let first = h
        .state
        .engine
        .summarize(&ctx, summarize_request(document.id, false))
        .await
        .unwrap();
    assert_eq!(first.status, OperationStatus::Pending);
    let first = h.wait_operation(&ctx, first.id).await;
    assert_eq!(first.status, OperationStatus::Completed);
    let first_summary = first.output_data.as_ref().unwrap()["summary"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(!first_summary.is_empty());
    assert_eq!(first.output_data.as_ref().unwrap()["cached"], false);

    // Second call without force serves the cache as a fresh completed row.
    let cached = h
        .state
        .engine
        .summarize(&ctx, summarize_request(document.id, false))
        .await
        .unwrap();
    assert_ne!(cached.id, first.id);
    assert_eq!(cached.status, OperationStatus::Completed);
    let cached_output = cached.output_data.as_ref().unwrap();
    assert_eq!(cached_output["cached"], true);
    assert_eq!(cached_output["summary"].as_str().unwrap(), first_summary);

    // Forcing runs a new operation with a non-empty summary.
    let forced = h
        .state
        .engine
        .summarize(&ctx, summarize_request(document.id, true))
        .await
        .unwrap();
    assert_ne!(forced.id, cached.id);
    let forced = h.wait_operation(&ctx, forced.id).await;
    assert_eq!(forced.status, OperationStatus::Completed);
    assert!(!forced.output_data.as_ref().unwrap()["summary"]
        .as_str()
        .unwrap()
        .is_empty());
    assert!(forced.created_at >= first.created_at);
}

#[tokio::test]
async fn operation_rows_are_monotonic() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    let document = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;

    let submitted = h
        .state
        .engine
        .summarize(&ctx, summarize_request(document.id, true))
        .await
        .unwrap();
    assert_eq!(submitted.status, OperationStatus::Pending);
    assert!(submitted.completed_at.is_none());
    assert!(submitted.output_data.is_none());

    let terminal = h.wait_operation(&ctx, submitted.id).await;
    assert!(terminal.status.is_terminal());
    assert!(terminal.completed_at.is_some(), "terminal rows carry completed_at");
    match terminal.status {
        OperationStatus::Completed => assert!(terminal.output_data.is_some()),
        _ => assert!(terminal.output_data.is_none()),
    }
}

#[tokio::test]
async fn ask_answers_with_citations() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    let document = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;
    assert_completed(&document);

    let request: AskRequest = serde_json::from_value(serde_json::json!({
        "document_id": document.id,
        "question": "What is the capital of France?",
    }))
    .unwrap();
    let operation = h.state.engine.ask(&ctx, request).await.unwrap();
    let operation = h.wait_operation(&ctx, operation.id).await;
    assert_eq!(operation.status, OperationStatus::Completed);

    let output = operation.output_data.unwrap();
    let answer = output["answer"].as_str().unwrap();
    assert!(answer.contains("Paris"), "answer was: {answer}");

    let sources = output["sources"].as_array().unwrap();
    assert!(!sources.is_empty());
    assert!(sources.iter().any(|s| {
        s["content_preview"]
            .as_str()
            .is_some_and(|p| p.contains("capital of France"))
    }));
    for source in sources {
        assert!(source["score"].as_f64().unwrap() >= 0.5);
    }
}

#[tokio::test]
async fn ask_with_no_matching_context_completes_with_fallback() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    let document = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;

    let request: AskRequest = serde_json::from_value(serde_json::json!({
        "document_id": document.id,
        "question": "zorblax quuxification metrics",
    }))
    .unwrap();
    let operation = h.state.engine.ask(&ctx, request).await.unwrap();
    let operation = h.wait_operation(&ctx, operation.id).await;

    assert_eq!(operation.status, OperationStatus::Completed);
    let output = operation.output_data.unwrap();
    assert_eq!(output["answer"], "No relevant information found");
    assert_eq!(output["sources"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn ask_with_zero_max_chunks_yields_no_sources() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    let document = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;

    let request: AskRequest = serde_json::from_value(serde_json::json!({
        "document_id": document.id,
        "question": "What is the capital of France?",
        "max_chunks": 0,
    }))
    .unwrap();
    let operation = h.state.engine.ask(&ctx, request).await.unwrap();
    let operation = h.wait_operation(&ctx, operation.id).await;
    let output = operation.output_data.unwrap();
    assert_eq!(output["sources"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn transform_validates_json_with_one_corrective_retry() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;

    // First reply malformed, second valid: the corrective retry recovers.
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_behavior = calls.clone();
    h.set_chat_behavior(Arc::new(move |_messages| {
        if calls_in_behavior.fetch_add(1, Ordering::SeqCst) == 0 {
            "not { json".to_string()
        } else {
            "{\"status\": \"done\"}".to_string()
        }
    }));

    let document = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;
    let request: TransformRequest = serde_json::from_value(serde_json::json!({
        "document_id": document.id,
        "instruction": "Convert to a status object",
        "output_format": "json",
    }))
    .unwrap();
    let operation = h.state.engine.transform(&ctx, request).await.unwrap();
    let operation = h.wait_operation(&ctx, operation.id).await;

    assert_eq!(operation.status, OperationStatus::Completed);
    let output = operation.output_data.unwrap();
    assert_eq!(output["output_format"], serde_json::json!(OutputFormat::Json));
    let result: serde_json::Value =
        serde_json::from_str(output["result"].as_str().unwrap()).unwrap();
    assert_eq!(result["status"], "done");
}

#[tokio::test]
async fn transform_fails_when_json_stays_invalid_after_retry() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    h.set_chat_behavior(Arc::new(|_| "still not json {".to_string()));

    let document = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;
    let request: TransformRequest = serde_json::from_value(serde_json::json!({
        "document_id": document.id,
        "instruction": "Convert to JSON",
        "output_format": "json",
    }))
    .unwrap();
    let operation = h.state.engine.transform(&ctx, request).await.unwrap();
    let operation = h.wait_operation(&ctx, operation.id).await;

    assert_eq!(operation.status, OperationStatus::Failed);
    assert!(operation
        .error_message
        .unwrap_or_default()
        .contains("not valid JSON"));
}

#[tokio::test]
async fn slow_operations_time_out_and_fail() {
    let h = harness_with_engine_config(EngineConfig {
        deadline: Duration::from_millis(100),
        tenant_parallelism: 4,
        transform_input_budget: 6000,
    })
    .await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    let document = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;

    h.set_slow_chat(Duration::from_millis(500));

    let operation = h
        .state
        .engine
        .summarize(&ctx, summarize_request(document.id, true))
        .await
        .unwrap();
    let operation = h.wait_operation(&ctx, operation.id).await;
    assert_eq!(operation.status, OperationStatus::Failed);
    assert_eq!(operation.error_message.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn cancel_is_terminal_and_rejects_repeat() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    let document = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;

    // Stall the provider so the operation is still in flight when the
    // cancel lands.
    h.set_slow_chat(Duration::from_millis(500));

    let operation = h
        .state
        .engine
        .summarize(&ctx, summarize_request(document.id, true))
        .await
        .unwrap();
    let cancelled = h.state.engine.cancel(&ctx, operation.id).await.unwrap();
    assert_eq!(cancelled.status, OperationStatus::Failed);
    assert_eq!(cancelled.error_message.as_deref(), Some("cancelled"));
    assert!(cancelled.completed_at.is_some());

    let err = h.state.engine.cancel(&ctx, operation.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn operations_are_tenant_scoped() {
    let h = harness().await;
    let ctx_a = h.ctx(Uuid::new_v4());
    let ctx_b = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx_a.tenant_id).await;
    h.configure_tenant(ctx_b.tenant_id).await;
    let document = h.ingest_text(&ctx_a, "notes.txt", FRANCE_DOC).await;

    let operation = h
        .state
        .engine
        .summarize(&ctx_a, summarize_request(document.id, true))
        .await
        .unwrap();
    let err = h.state.engine.get(&ctx_b, operation.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound));
}
