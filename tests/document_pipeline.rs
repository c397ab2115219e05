//! Document pipeline integration: ingestion lifecycle, chunk/vector
//! consistency, retrieval, deletion, and tenant isolation.

mod support;

use uuid::Uuid;

use ragloom::ingest::PipelineError;
use ragloom::models::DocumentStatus;
use ragloom::store;
use ragloom::vector::{SearchFilter, VectorError, VectorIndex};

use support::{assert_completed, harness, FRANCE_DOC};

#[tokio::test]
async fn ingestion_reaches_completed_with_consistent_chunks() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;

    let document = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;
    assert_completed(&document);
    assert!(document.chunk_count > 0);

    let chunks = store::documents::list_chunks(&h.pool, ctx.tenant_id, document.id)
        .await
        .unwrap();
    assert_eq!(chunks.len() as i64, document.chunk_count);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i as i64, "contiguous 0-based indices");
        assert!(!chunk.content.trim().is_empty());
        assert!(chunk.token_count > 0);
    }

    // Exactly one vector per chunk: searching with each chunk's own content
    // returns that chunk first with a near-perfect score.
    let results = h
        .state
        .pipeline
        .search(&ctx, &chunks[0].content, 1, 0.0, None)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk_id, chunks[0].id);
    assert!(results[0].score >= 0.8, "round-trip score {}", results[0].score);
    assert_eq!(results[0].document_filename, "notes.txt");
}

#[tokio::test]
async fn empty_documents_fail_with_parse_error() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;

    let document = h.ingest_text(&ctx, "empty.txt", "   \n\t  ").await;
    assert_eq!(document.status, DocumentStatus::Failed);
    let message = document.error_message.unwrap_or_default();
    assert!(message.contains("empty"), "unexpected error: {message}");

    let chunks = store::documents::list_chunks(&h.pool, ctx.tenant_id, document.id)
        .await
        .unwrap();
    assert!(chunks.is_empty(), "failed documents hold no chunks");
}

#[tokio::test]
async fn unsupported_file_types_are_rejected_upfront() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;

    let err = h
        .state
        .pipeline
        .ingest(&ctx, "scan.pdf", b"%PDF-1.7".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
}

#[tokio::test]
async fn delete_purges_chunks_and_vectors() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;

    let document = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;
    assert_completed(&document);

    h.state.pipeline.delete(&ctx, document.id).await.unwrap();

    let reloaded = store::documents::get(&h.pool, ctx.tenant_id, document.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.status, DocumentStatus::Deleted);
    assert_eq!(reloaded.chunk_count, 0);

    let chunks = store::documents::list_chunks(&h.pool, ctx.tenant_id, document.id)
        .await
        .unwrap();
    assert!(chunks.is_empty());

    let query = support::MockEmbedding::embed_text("capital of France", support::EMBED_DIMS);
    let hits = h
        .state
        .vector
        .search(ctx.tenant_id, &query, 10, 0.0, &SearchFilter::default())
        .await
        .unwrap();
    assert!(hits.is_empty(), "vectors must be purged on delete");
}

#[tokio::test]
async fn uploading_the_same_file_twice_yields_independent_documents() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;

    let first = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;
    let second = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;
    assert_ne!(first.id, second.id);
    assert_completed(&first);
    assert_completed(&second);

    let first_chunks = store::documents::list_chunks(&h.pool, ctx.tenant_id, first.id)
        .await
        .unwrap();
    let second_chunks = store::documents::list_chunks(&h.pool, ctx.tenant_id, second.id)
        .await
        .unwrap();
    assert_eq!(first_chunks.len(), second_chunks.len());
    assert!(first_chunks
        .iter()
        .all(|a| second_chunks.iter().all(|b| a.id != b.id)));

    // Deleting one leaves the other searchable.
    h.state.pipeline.delete(&ctx, first.id).await.unwrap();
    let results = h
        .state
        .pipeline
        .search(&ctx, "capital of France", 5, 0.3, None)
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.document_id == second.id));
    assert!(!results.is_empty());
}

#[tokio::test]
async fn tenants_cannot_observe_each_others_documents() {
    let h = harness().await;
    let ctx_a = h.ctx(Uuid::new_v4());
    let ctx_b = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx_a.tenant_id).await;
    h.configure_tenant(ctx_b.tenant_id).await;

    let document = h.ingest_text(&ctx_a, "secret.txt", FRANCE_DOC).await;
    assert_completed(&document);

    // Direct read with a known id from the wrong tenant: not found.
    let cross_read = store::documents::get(&h.pool, ctx_b.tenant_id, document.id)
        .await
        .unwrap();
    assert!(cross_read.is_none());

    // Search that would match tenant A's content: zero hits for tenant B.
    let results = h
        .state
        .pipeline
        .search(&ctx_b, "capital of France", 10, 0.0, None)
        .await
        .unwrap();
    assert!(results.is_empty());

    let chunks = store::documents::list_chunks(&h.pool, ctx_b.tenant_id, document.id)
        .await
        .unwrap();
    assert!(chunks.is_empty());
}

#[tokio::test]
async fn retry_restarts_a_failed_document_from_scratch() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    // No provider configuration yet: ingestion fails after parsing.
    let document = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;
    assert_eq!(document.status, DocumentStatus::Failed);

    // Retrying is only valid from `failed`, and a completed document
    // refuses it.
    let err = h
        .state
        .pipeline
        .retry(&ctx, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound));

    h.configure_tenant(ctx.tenant_id).await;
    h.state.pipeline.retry(&ctx, document.id).await.unwrap();
    let document = h.wait_document(&ctx, document.id).await;
    assert_completed(&document);
    assert!(document.chunk_count > 0);
    assert!(document.error_message.is_none());

    let err = h
        .state
        .pipeline
        .retry(&ctx, document.id)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
}

#[tokio::test]
async fn collection_dimension_change_is_a_conflict() {
    let h = harness().await;
    let tenant = Uuid::new_v4();

    h.state.vector.ensure_collection(tenant, 768).await.unwrap();
    // Idempotent at the same dimension.
    h.state.vector.ensure_collection(tenant, 768).await.unwrap();

    let err = h
        .state
        .vector
        .ensure_collection(tenant, 1024)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VectorError::DimensionMismatch {
            existing: 768,
            requested: 1024
        }
    ));

    // The failed call mutated nothing.
    h.state.vector.ensure_collection(tenant, 768).await.unwrap();
}
