//! Workflow event stream.
//!
//! Executions emit a best-effort sequence of `start`, `update`, `done`, and
//! `error` events over a bounded channel; the HTTP boundary adapts them to
//! Server-Sent Events. Events are informational: durable state is always
//! the database, and clients re-read it on reconnect.

use serde_json::{json, Value};
use uuid::Uuid;

/// Buffered events before the producer starts dropping.
pub const EVENT_BUFFER_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub enum WorkflowEvent {
    Start {
        execution_id: Uuid,
        session_id: Uuid,
        thread_id: String,
    },
    Update {
        node_id: String,
        step: u64,
        delta: Value,
        routing_metadata: Option<Value>,
        approval_id: Option<Uuid>,
    },
    Done {
        execution_id: Uuid,
        status: String,
        output: Option<Value>,
    },
    Error {
        message: String,
        step: Option<u64>,
    },
}

impl WorkflowEvent {
    /// SSE event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::Start { .. } => "start",
            WorkflowEvent::Update { .. } => "update",
            WorkflowEvent::Done { .. } => "done",
            WorkflowEvent::Error { .. } => "error",
        }
    }

    /// JSON payload carried in the SSE `data:` field.
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            WorkflowEvent::Start {
                execution_id,
                session_id,
                thread_id,
            } => json!({
                "execution_id": execution_id,
                "session_id": session_id,
                "thread_id": thread_id,
            }),
            WorkflowEvent::Update {
                node_id,
                step,
                delta,
                routing_metadata,
                approval_id,
            } => {
                let mut payload = json!({
                    "node_id": node_id,
                    "step": step,
                    "delta": delta,
                });
                if let Some(routing) = routing_metadata {
                    payload["routing_metadata"] = routing.clone();
                }
                if let Some(approval) = approval_id {
                    payload["approval_id"] = json!(approval);
                }
                payload
            }
            WorkflowEvent::Done {
                execution_id,
                status,
                output,
            } => json!({
                "execution_id": execution_id,
                "status": status,
                "output": output,
            }),
            WorkflowEvent::Error { message, step } => json!({
                "message": message,
                "step": step,
            }),
        }
    }
}

/// Sending half of a workflow event stream. A disconnected or absent
/// receiver never fails the workflow; events are best-effort.
#[derive(Clone, Debug, Default)]
pub struct WorkflowEmitter {
    tx: Option<flume::Sender<WorkflowEvent>>,
}

impl WorkflowEmitter {
    /// An emitter that drops every event, for non-streamed execution.
    #[must_use]
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    /// A connected emitter plus the receiving end for the stream adapter.
    #[must_use]
    pub fn channel() -> (Self, flume::Receiver<WorkflowEvent>) {
        let (tx, rx) = flume::bounded(EVENT_BUFFER_CAPACITY);
        (Self { tx: Some(tx) }, rx)
    }

    pub fn emit(&self, event: WorkflowEvent) {
        if let Some(tx) = &self.tx
            && let Err(e) = tx.try_send(event)
        {
            tracing::debug!(error = %e, "workflow event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_match_sse_contract() {
        let done = WorkflowEvent::Done {
            execution_id: Uuid::new_v4(),
            status: "completed".into(),
            output: None,
        };
        assert_eq!(done.name(), "done");
        assert_eq!(done.payload()["status"], "completed");
    }

    #[test]
    fn channel_delivers_and_disconnected_drops() {
        let (emitter, rx) = WorkflowEmitter::channel();
        emitter.emit(WorkflowEvent::Error {
            message: "x".into(),
            step: None,
        });
        assert_eq!(rx.len(), 1);

        // Dropping events must be silent.
        WorkflowEmitter::disconnected().emit(WorkflowEvent::Error {
            message: "y".into(),
            step: Some(1),
        });
    }

    #[test]
    fn update_payload_carries_routing_and_approval() {
        let approval = Uuid::new_v4();
        let event = WorkflowEvent::Update {
            node_id: "retriever".into(),
            step: 2,
            delta: json!({"chunk_count": 3}),
            routing_metadata: Some(json!({"route": "rag_needed"})),
            approval_id: Some(approval),
        };
        let payload = event.payload();
        assert_eq!(payload["routing_metadata"]["route"], "rag_needed");
        assert_eq!(payload["approval_id"], json!(approval));
    }
}
