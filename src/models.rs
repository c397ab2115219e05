//! Persistent domain entities and their status vocabularies.
//!
//! Rows map 1:1 onto the tables in `migrations/0001_init.sql`. Status enums
//! carry their persisted string form (`as_str`/`parse`) so the store layer
//! can bind and decode them without a serde round-trip.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

macro_rules! persisted_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            #[must_use]
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

persisted_enum! {
    /// Document ingestion lifecycle. Transitions are monotonic except
    /// `Deleted`, which may follow any terminal state.
    DocumentStatus {
        Uploading => "uploading",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        Deleted => "deleted",
    }
}

impl DocumentStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Deleted)
    }
}

persisted_enum! {
    /// Async LLM operation lifecycle; a prefix of
    /// `pending -> processing -> {completed | failed}`.
    OperationStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

impl OperationStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

persisted_enum! {
    OperationType {
        Summarize => "summarize",
        Ask => "ask",
        Transform => "transform",
    }
}

persisted_enum! {
    /// Controls whether a conversation turn consults retrieval.
    SessionMode {
        Auto => "auto",
        ChatOnly => "chat_only",
        RagOnly => "rag_only",
    }
}

persisted_enum! {
    ExecutionStatus {
        Running => "running",
        Interrupted => "interrupted",
        Completed => "completed",
        Failed => "failed",
    }
}

persisted_enum! {
    ApprovalStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
}

persisted_enum! {
    /// Requested rendering of a transform result.
    OutputFormat {
        Text => "text",
        Markdown => "markdown",
        Json => "json",
    }
}

/// An uploaded document and its ingestion state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub filename: String,
    pub file_path: String,
    pub file_size: i64,
    pub file_type: String,
    pub status: DocumentStatus,
    pub chunk_count: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A contiguous token-bounded slice of a document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    pub chunk_index: i64,
    pub content: String,
    pub token_count: i64,
    pub start_char: Option<i64>,
    pub end_char: Option<i64>,
    pub metadata: Value,
}

/// An asynchronous LLM operation row.
///
/// `output_data` is populated iff `status == Completed`; `completed_at` is
/// set iff the status is terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmOperation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub document_id: Option<Uuid>,
    pub operation_type: OperationType,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub model_used: Option<String>,
    pub tokens_used: Option<i64>,
    pub cost_estimate: Option<f64>,
    pub status: OperationStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A durable conversation thread; `thread_id` keys checkpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub thread_id: String,
    pub title: String,
    pub mode: SessionMode,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted conversation message, append-only within its session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: crate::message::Role,
    pub content: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Bridge between a session and a document it may consult.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionDocument {
    pub session_id: Uuid,
    pub document_id: Uuid,
    pub added_at: DateTime<Utc>,
    pub is_active: bool,
}

/// A stored declarative workflow graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDefinitionRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub version: i64,
    pub description: String,
    pub nodes: Value,
    pub edges: Value,
    pub is_active: bool,
}

/// One run of a workflow over a session thread.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub session_id: Uuid,
    pub thread_id: String,
    pub status: ExecutionStatus,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A parked human-in-the-loop decision. At most one `Pending` row may exist
/// per execution (enforced by a partial unique index).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HitlApproval {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub prompt: String,
    pub context_data: Value,
    pub status: ApprovalStatus,
    pub user_response: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

/// Per-tenant provider selection. API keys never live here; they are looked
/// up in the secret store under the provider's path. The halves are set
/// independently through the settings endpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: Uuid,
    pub embedding: Option<EmbeddingSelection>,
    pub chat: Option<ChatSelection>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingSelection {
    pub provider: String,
    pub model: String,
    pub dimensions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatSelection {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        assert_eq!(
            DocumentStatus::parse(DocumentStatus::Processing.as_str()),
            Some(DocumentStatus::Processing)
        );
        assert_eq!(OperationStatus::parse("completed"), Some(OperationStatus::Completed));
        assert_eq!(SessionMode::parse("rag_only"), Some(SessionMode::RagOnly));
        assert_eq!(ExecutionStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(OperationStatus::Failed.is_terminal());
        assert!(!OperationStatus::Processing.is_terminal());
        assert!(DocumentStatus::Deleted.is_terminal());
    }

    #[test]
    fn selection_rejects_unknown_fields() {
        let err = serde_json::from_value::<ChatSelection>(serde_json::json!({
            "provider": "ollama",
            "model": "llama3",
            "api_key": "sk-nope"
        }));
        assert!(err.is_err());
    }
}
