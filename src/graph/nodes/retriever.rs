//! Retrieval node: vector search restricted to the session's active
//! documents, writing the hits into `state.chunks`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::graph::node::{Node, NodeContext, NodeError};
use crate::state::{RetrievedChunk, StateUpdate, WorkflowState};

fn default_max_chunks() -> usize {
    5
}

// Conversational queries carry more filler than the ask operation's
// focused questions, so the workflow retriever admits weaker matches and
// leaves pruning to the relevance grader.
fn default_min_score() -> f32 {
    0.25
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrieverConfig {
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            max_chunks: default_max_chunks(),
            min_score: default_min_score(),
        }
    }
}

pub struct RetrieverNode {
    config: RetrieverConfig,
}

impl RetrieverNode {
    #[must_use]
    pub fn new(config: RetrieverConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Node for RetrieverNode {
    async fn run(
        &self,
        state: &WorkflowState,
        ctx: &NodeContext,
    ) -> Result<StateUpdate, NodeError> {
        let query = state
            .effective_query()
            .ok_or(NodeError::MissingInput {
                what: "query or user message",
            })?
            .to_string();

        if state.active_documents.is_empty() {
            return Ok(StateUpdate::new()
                .with_chunks(Vec::new())
                .with_route("no_context"));
        }

        let hits = ctx
            .services
            .pipeline
            .search(
                &ctx.tenant,
                &query,
                self.config.max_chunks,
                self.config.min_score,
                Some(state.active_documents.clone()),
            )
            .await?;

        let chunks: Vec<RetrievedChunk> = hits
            .into_iter()
            .map(|hit| RetrievedChunk {
                chunk_id: hit.chunk_id,
                document_id: hit.document_id,
                chunk_index: hit.chunk_index,
                content: hit.content,
                score: hit.score,
            })
            .collect();

        let count = chunks.len();
        Ok(StateUpdate::new()
            .with_chunks(chunks)
            .with_extra("retrieved_count", json!(count)))
    }
}
