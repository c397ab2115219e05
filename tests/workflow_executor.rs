//! Workflow executor integration: streaming turns, mode routing, HITL
//! interrupts, checkpoint monotonicity, and stream/database convergence.

mod support;

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use ragloom::events::WorkflowEvent;
use ragloom::executor::ExecutorError;
use ragloom::graph::{EdgeSpec, NodeType, WorkflowDefinition, END, START};
use ragloom::hitl::{ApprovalResponse, HitlError};
use ragloom::message::Role;
use ragloom::models::{ExecutionStatus, SessionMode, WorkflowDefinitionRow};
use ragloom::session::CreateSession;
use ragloom::store;
use ragloom::tenant::TenantContext;

use support::{harness, Harness, FRANCE_DOC};

async fn create_session(h: &Harness, ctx: &TenantContext, mode: SessionMode) -> Uuid {
    h.state
        .sessions
        .create(
            ctx,
            CreateSession {
                workflow_id: None,
                title: None,
                mode: Some(mode),
            },
        )
        .await
        .unwrap()
        .id
}

async fn insert_definition(h: &Harness, ctx: &TenantContext, def: &WorkflowDefinition) -> Uuid {
    let row = WorkflowDefinitionRow {
        id: Uuid::new_v4(),
        tenant_id: ctx.tenant_id,
        name: def.name.clone(),
        version: 1,
        description: String::new(),
        nodes: serde_json::to_value(&def.nodes).unwrap(),
        edges: serde_json::to_value(&def.edges).unwrap(),
        is_active: true,
    };
    store::executions::insert_definition(&h.pool, &row).await.unwrap();
    row.id
}

async fn collect_events(rx: flume::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
            .await
            .expect("event stream stalled")
            .expect("event stream closed early");
        let terminal = matches!(event, WorkflowEvent::Done { .. } | WorkflowEvent::Error { .. });
        events.push(event);
        if terminal {
            return events;
        }
    }
}

fn approval_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("approval-gate")
        .node("draft", NodeType::Llm, json!({}))
        .node("gate", NodeType::HumanInLoop, json!({ "prompt": "Proceed?" }))
        .node("finalize", NodeType::Llm, json!({}))
        .edge(EdgeSpec::direct(START, "draft"))
        .edge(EdgeSpec::direct("draft", "gate"))
        .edge(EdgeSpec::direct("gate", "finalize"))
        .edge(EdgeSpec::direct("finalize", END))
}

#[tokio::test]
async fn hitl_interrupt_and_resume_completes_the_workflow() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    let session_id = create_session(&h, &ctx, SessionMode::Auto).await;
    let workflow_id = insert_definition(&h, &ctx, &approval_workflow()).await;

    let rx = h.state.executor.stream(
        ctx.clone(),
        session_id,
        "Proceed?".to_string(),
        Some(workflow_id),
    );
    let events = collect_events(rx).await;

    assert!(matches!(events.first(), Some(WorkflowEvent::Start { .. })));
    let approval_id = events
        .iter()
        .find_map(|e| match e {
            WorkflowEvent::Update { approval_id, .. } => *approval_id,
            _ => None,
        })
        .expect("an update carries the approval id");
    match events.last() {
        Some(WorkflowEvent::Done { status, .. }) => assert_eq!(status, "interrupted"),
        other => panic!("expected done(interrupted), got {other:?}"),
    }

    // Exactly one pending approval is listed.
    let pending = h.state.hitl.list_pending(&ctx).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, approval_id);
    assert_eq!(pending[0].prompt, "Proceed?");

    // A second turn on the interrupted thread is refused.
    let err = h
        .state
        .executor
        .execute(&ctx, session_id, "another turn", Some(workflow_id))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::AwaitingApproval));

    // Approving resumes and completes the workflow.
    let outcome = h
        .state
        .hitl
        .respond(
            &ctx,
            approval_id,
            ApprovalResponse {
                approved: true,
                feedback: Some("ok".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);

    let execution = store::executions::get(&h.pool, ctx.tenant_id, outcome.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let messages = h.state.sessions.messages(&ctx, session_id, 100).await.unwrap();
    let assistant = messages.iter().filter(|m| m.role == Role::Assistant).count();
    assert!(assistant >= 1, "a new assistant message exists");

    // Replayed responses are rejected.
    let err = h
        .state
        .hitl
        .respond(
            &ctx,
            approval_id,
            ApprovalResponse {
                approved: true,
                feedback: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HitlError::AlreadyResponded));
}

#[tokio::test]
async fn hitl_rejection_ends_the_workflow() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    let session_id = create_session(&h, &ctx, SessionMode::Auto).await;
    let workflow_id = insert_definition(&h, &ctx, &approval_workflow()).await;

    let outcome = h
        .state
        .executor
        .execute(&ctx, session_id, "Ship it?", Some(workflow_id))
        .await
        .unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Interrupted);
    let approval_id = outcome.approval_id.unwrap();

    let outcome = h
        .state
        .hitl
        .respond(
            &ctx,
            approval_id,
            ApprovalResponse {
                approved: false,
                feedback: Some("not yet".into()),
            },
        )
        .await
        .unwrap();
    // Default reject policy terminates rather than failing.
    assert_eq!(outcome.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn auto_mode_routes_hello_to_direct_chat() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    let session_id = create_session(&h, &ctx, SessionMode::Auto).await;

    let rx = h
        .state
        .executor
        .stream(ctx.clone(), session_id, "Hello".to_string(), None);
    let events = collect_events(rx).await;

    let routing = events
        .iter()
        .find_map(|e| match e {
            WorkflowEvent::Update {
                routing_metadata: Some(meta),
                ..
            } => Some(meta.clone()),
            _ => None,
        })
        .expect("first update carries routing metadata");
    assert_eq!(routing["route"], "direct_chat");
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::Done { status, .. }) if status == "completed"
    ));
}

#[tokio::test]
async fn auto_mode_routes_document_questions_through_the_retriever() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    let session_id = create_session(&h, &ctx, SessionMode::Auto).await;

    let document = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;
    support::assert_completed(&document);
    h.state
        .sessions
        .add_document(&ctx, session_id, document.id)
        .await
        .unwrap();

    let rx = h.state.executor.stream(
        ctx.clone(),
        session_id,
        "What does the doc say about the capital of France?".to_string(),
        None,
    );
    let events = collect_events(rx).await;

    let routing = events
        .iter()
        .find_map(|e| match e {
            WorkflowEvent::Update {
                routing_metadata: Some(meta),
                ..
            } => Some(meta.clone()),
            _ => None,
        })
        .expect("routing metadata present");
    assert_eq!(routing["route"], "rag_needed");

    let retriever_updates = events
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::Update { node_id, .. } if node_id == "retrieve"))
        .count();
    assert!(retriever_updates >= 1, "retriever emitted an update");

    // The grounded answer flows back into the session history.
    let messages = h.state.sessions.messages(&ctx, session_id, 100).await.unwrap();
    let last = messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.content.contains("Paris"), "answer was: {}", last.content);
}

#[tokio::test]
async fn rag_only_without_documents_is_refused() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    let session_id = create_session(&h, &ctx, SessionMode::RagOnly).await;

    let err = h
        .state
        .executor
        .execute(&ctx, session_id, "What does the doc say?", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::NoDocuments));
}

#[tokio::test]
async fn chat_only_mode_skips_retrieval_even_with_documents() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    let session_id = create_session(&h, &ctx, SessionMode::ChatOnly).await;

    let document = h.ingest_text(&ctx, "notes.txt", FRANCE_DOC).await;
    h.state
        .sessions
        .add_document(&ctx, session_id, document.id)
        .await
        .unwrap();

    let rx = h.state.executor.stream(
        ctx.clone(),
        session_id,
        "What does the doc say about France?".to_string(),
        None,
    );
    let events = collect_events(rx).await;

    assert!(
        events
            .iter()
            .all(|e| !matches!(e, WorkflowEvent::Update { node_id, .. } if node_id == "retrieve")),
        "chat_only must not retrieve"
    );
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::Done { status, .. }) if status == "completed"
    ));
}

#[tokio::test]
async fn checkpoints_increase_strictly_without_gaps() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    let session_id = create_session(&h, &ctx, SessionMode::ChatOnly).await;

    for input in ["first turn", "second turn", "third turn"] {
        h.state
            .executor
            .execute(&ctx, session_id, input, None)
            .await
            .unwrap();
    }

    let history = h.state.executor.history(&ctx, session_id).await.unwrap();
    assert!(!history.is_empty());
    for (i, checkpoint) in history.iter().enumerate() {
        assert_eq!(checkpoint.step, i as i64, "strictly increasing, no gaps");
    }
    for window in history.windows(2) {
        assert_eq!(window[1].parent_step, Some(window[1].step - 1));
    }
}

#[tokio::test]
async fn stream_events_converge_with_persisted_state() {
    let h = harness().await;
    let ctx = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx.tenant_id).await;
    let session_id = create_session(&h, &ctx, SessionMode::ChatOnly).await;

    let rx = h.state.executor.stream(
        ctx.clone(),
        session_id,
        "Tell me something.".to_string(),
        None,
    );
    let events = collect_events(rx).await;

    let (execution_id, output) = match events.last() {
        Some(WorkflowEvent::Done {
            execution_id,
            status,
            output,
        }) => {
            assert_eq!(status, "completed");
            (*execution_id, output.clone().unwrap())
        }
        other => panic!("expected done event, got {other:?}"),
    };

    let execution = store::executions::get(&h.pool, ctx.tenant_id, execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output_data.unwrap(), output);

    let messages = h.state.sessions.messages(&ctx, session_id, 100).await.unwrap();
    let last = messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(json!(last.content), output["message"]);
}

#[tokio::test]
async fn tenant_isolation_covers_sessions_and_approvals() {
    let h = harness().await;
    let ctx_a = h.ctx(Uuid::new_v4());
    let ctx_b = h.ctx(Uuid::new_v4());
    h.configure_tenant(ctx_a.tenant_id).await;
    h.configure_tenant(ctx_b.tenant_id).await;

    let session_id = create_session(&h, &ctx_a, SessionMode::Auto).await;
    let workflow_id = insert_definition(&h, &ctx_a, &approval_workflow()).await;
    let outcome = h
        .state
        .executor
        .execute(&ctx_a, session_id, "Proceed?", Some(workflow_id))
        .await
        .unwrap();
    let approval_id = outcome.approval_id.unwrap();

    let err = h.state.sessions.get(&ctx_b, session_id).await.unwrap_err();
    assert!(matches!(err, ragloom::session::SessionError::NotFound));

    let err = h.state.hitl.get(&ctx_b, approval_id).await.unwrap_err();
    assert!(matches!(err, HitlError::NotFound));
    assert!(h.state.hitl.list_pending(&ctx_b).await.unwrap().is_empty());
}
