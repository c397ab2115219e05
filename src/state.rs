//! Workflow state and partial updates.
//!
//! A [`WorkflowState`] is the full conversational context a graph step sees:
//! message history, the current query, retrieved chunks, the session's
//! active documents and mode, plus free-form extras. Nodes never mutate it
//! directly; they return a [`StateUpdate`] that the executor merges before
//! checkpointing. The whole state serialises, so a checkpoint blob is a
//! faithful snapshot.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::message::{ChatMessage, Role};
use crate::models::SessionMode;

/// A chunk pulled from the vector index during a retrieval step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i64,
    pub content: String,
    pub score: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub messages: Vec<ChatMessage>,
    /// The query retrieval should use; falls back to the last user message.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub chunks: Vec<RetrievedChunk>,
    #[serde(default)]
    pub active_documents: Vec<Uuid>,
    pub mode: SessionMode,
    /// Routing marker set by nodes (e.g. `no_context`) and consumed by
    /// conditional edges.
    #[serde(default)]
    pub route: Option<String>,
    /// Set by verification nodes that want the generation step re-run.
    #[serde(default)]
    pub retry: bool,
    #[serde(default)]
    pub extra: FxHashMap<String, Value>,
}

impl WorkflowState {
    #[must_use]
    pub fn new(mode: SessionMode) -> Self {
        Self {
            messages: Vec::new(),
            query: None,
            chunks: Vec::new(),
            active_documents: Vec::new(),
            mode,
            route: None,
            retry: false,
            extra: FxHashMap::default(),
        }
    }

    /// The text retrieval operates on: the explicit query if set, otherwise
    /// the most recent user message.
    #[must_use]
    pub fn effective_query(&self) -> Option<&str> {
        if let Some(query) = &self.query {
            return Some(query);
        }
        self.messages
            .iter()
            .rev()
            .find(|m| m.has_role(Role::User))
            .map(|m| m.content.as_str())
    }

    /// Merge a node's partial update into this state.
    pub fn apply(&mut self, update: StateUpdate) {
        if let Some(messages) = update.messages {
            self.messages.extend(messages);
        }
        if let Some(query) = update.query {
            self.query = Some(query);
        }
        if let Some(chunks) = update.chunks {
            self.chunks = chunks;
        }
        if let Some(route) = update.route {
            self.route = Some(route);
        }
        if let Some(retry) = update.retry {
            self.retry = retry;
        }
        if let Some(extra) = update.extra {
            self.extra.extend(extra);
        }
    }
}

/// The partial state change a node wants applied.
///
/// Every field is optional; messages append, chunks replace, extras merge
/// key-wise. An [`InterruptRequest`] parks the execution for a human
/// decision instead of continuing to the next node.
#[derive(Clone, Debug, Default)]
pub struct StateUpdate {
    pub messages: Option<Vec<ChatMessage>>,
    pub query: Option<String>,
    pub chunks: Option<Vec<RetrievedChunk>>,
    pub route: Option<String>,
    pub retry: Option<bool>,
    pub extra: Option<FxHashMap<String, Value>>,
    pub interrupt: Option<InterruptRequest>,
}

impl StateUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = Some(messages);
        self
    }

    #[must_use]
    pub fn with_chunks(mut self, chunks: Vec<RetrievedChunk>) -> Self {
        self.chunks = Some(chunks);
        self
    }

    #[must_use]
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra
            .get_or_insert_with(FxHashMap::default)
            .insert(key.to_string(), value);
        self
    }

    #[must_use]
    pub fn with_interrupt(mut self, interrupt: InterruptRequest) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    /// Client-visible delta of this update, emitted on stream events.
    #[must_use]
    pub fn visible_delta(&self) -> Value {
        let mut delta = serde_json::Map::new();
        if let Some(messages) = &self.messages {
            delta.insert(
                "messages".into(),
                serde_json::to_value(messages).unwrap_or(Value::Null),
            );
        }
        if let Some(chunks) = &self.chunks {
            delta.insert("chunk_count".into(), Value::from(chunks.len()));
        }
        if let Some(route) = &self.route {
            delta.insert("route".into(), Value::from(route.clone()));
        }
        if let Some(extra) = &self.extra {
            for (key, value) in extra {
                delta.insert(key.clone(), value.clone());
            }
        }
        Value::Object(delta)
    }
}

/// A request to pause execution for a human decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterruptRequest {
    pub prompt: String,
    pub context: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_query_prefers_explicit_query() {
        let mut state = WorkflowState::new(SessionMode::Auto);
        state.messages.push(ChatMessage::user("last user message"));
        assert_eq!(state.effective_query(), Some("last user message"));

        state.query = Some("explicit".into());
        assert_eq!(state.effective_query(), Some("explicit"));
    }

    #[test]
    fn apply_appends_messages_and_replaces_chunks() {
        let mut state = WorkflowState::new(SessionMode::Auto);
        state.messages.push(ChatMessage::user("hi"));
        state.chunks.push(RetrievedChunk {
            chunk_id: Uuid::new_v4(),
            document_id: Uuid::new_v4(),
            chunk_index: 0,
            content: "old".into(),
            score: 0.9,
        });

        state.apply(
            StateUpdate::new()
                .with_messages(vec![ChatMessage::assistant("hello")])
                .with_chunks(vec![])
                .with_route("no_context"),
        );

        assert_eq!(state.messages.len(), 2);
        assert!(state.chunks.is_empty());
        assert_eq!(state.route.as_deref(), Some("no_context"));
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = WorkflowState::new(SessionMode::RagOnly);
        state.messages.push(ChatMessage::user("q"));
        state.active_documents.push(Uuid::new_v4());
        state.extra.insert("k".into(), serde_json::json!(1));

        let blob = serde_json::to_string(&state).unwrap();
        let restored: WorkflowState = serde_json::from_str(&blob).unwrap();
        assert_eq!(restored, state);
    }
}
