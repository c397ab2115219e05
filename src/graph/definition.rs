//! Declarative workflow definitions.
//!
//! A definition is plain data: a set of typed nodes and the edges between
//! them, bracketed by the virtual `__start__` and `__end__` ids. Unknown
//! fields are rejected everywhere so a typo in a stored definition surfaces
//! at compile time rather than silently changing behaviour.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::WorkflowState;

/// Virtual entry node id.
pub const START: &str = "__start__";
/// Virtual terminal node id.
pub const END: &str = "__end__";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Llm,
    Retriever,
    RelevanceGrader,
    RagGenerator,
    HallucinationChecker,
    HumanInLoop,
}

impl NodeType {
    #[must_use]
    pub fn is_interrupt(&self) -> bool {
        matches!(self, NodeType::HumanInLoop)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default = "empty_config")]
    pub config: Value,
}

fn empty_config() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Declarative predicate evaluated over the current state when an edge is
/// considered for routing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum EdgeCondition {
    /// Matches when `state.route` equals `value`.
    RouteEquals { value: String },
    /// Matches when no route marker is set.
    RouteMissing,
    /// Matches when a verification node has requested a retry.
    RetrySet,
    /// Matches when `state.extra[key]` equals `value`.
    ExtraEquals { key: String, value: Value },
}

impl EdgeCondition {
    #[must_use]
    pub fn evaluate(&self, state: &WorkflowState) -> bool {
        match self {
            EdgeCondition::RouteEquals { value } => state.route.as_deref() == Some(value.as_str()),
            EdgeCondition::RouteMissing => state.route.is_none(),
            EdgeCondition::RetrySet => state.retry,
            EdgeCondition::ExtraEquals { key, value } => state.extra.get(key) == Some(value),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<EdgeCondition>,
    /// Reserved per-edge state mapping; accepted for forward compatibility
    /// with stored definitions, not interpreted by this executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Value>,
}

impl EdgeSpec {
    #[must_use]
    pub fn direct(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
            mapping: None,
        }
    }

    #[must_use]
    pub fn conditional(
        source: impl Into<String>,
        target: impl Into<String>,
        condition: EdgeCondition,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: Some(condition),
            mapping: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

impl WorkflowDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    #[must_use]
    pub fn node(mut self, id: impl Into<String>, node_type: NodeType, config: Value) -> Self {
        self.nodes.push(NodeSpec {
            id: id.into(),
            node_type,
            config,
        });
        self
    }

    #[must_use]
    pub fn edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionMode;

    #[test]
    fn definition_deserializes_from_stored_json() {
        let definition: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "name": "qa",
            "nodes": [
                {"id": "retrieve", "type": "retriever", "config": {"max_chunks": 3}},
                {"id": "answer", "type": "rag_generator"},
            ],
            "edges": [
                {"source": "__start__", "target": "retrieve"},
                {"source": "retrieve", "target": "answer"},
                {"source": "answer", "target": "__end__"},
            ],
        }))
        .unwrap();
        assert_eq!(definition.nodes.len(), 2);
        assert_eq!(definition.nodes[0].node_type, NodeType::Retriever);
    }

    #[test]
    fn unknown_node_fields_are_rejected() {
        let result = serde_json::from_value::<NodeSpec>(serde_json::json!({
            "id": "x", "type": "llm", "config": {}, "extra_field": true
        }));
        assert!(result.is_err());
    }

    #[test]
    fn conditions_evaluate_against_state() {
        let mut state = WorkflowState::new(SessionMode::Auto);
        assert!(EdgeCondition::RouteMissing.evaluate(&state));

        state.route = Some("no_context".into());
        assert!(EdgeCondition::RouteEquals {
            value: "no_context".into()
        }
        .evaluate(&state));
        assert!(!EdgeCondition::RouteMissing.evaluate(&state));

        state.retry = true;
        assert!(EdgeCondition::RetrySet.evaluate(&state));
    }
}
