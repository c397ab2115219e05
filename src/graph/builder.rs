//! Compilation of a [`WorkflowDefinition`] into an executable [`Workflow`].
//!
//! Compilation validates the structural invariants before any node is
//! instantiated:
//! - exactly one unconditional edge leaves `__start__`;
//! - every edge endpoint names a defined node (or a virtual endpoint);
//! - every defined node is reachable from `__start__`;
//! - every node either has an outgoing edge or is an interrupt node;
//! - any cycle contains at least one conditional edge.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::state::WorkflowState;

use super::definition::{EdgeCondition, NodeType, WorkflowDefinition, END, START};
use super::node::Node;
use super::nodes::{
    HallucinationCheckerNode, HumanConfig, HumanInLoopNode, LlmNode, RagGeneratorNode,
    RelevanceGraderNode, RetrieverNode,
};

#[derive(Debug, Error, Diagnostic)]
pub enum BuildError {
    #[error("duplicate node id `{0}`")]
    #[diagnostic(code(ragloom::graph::duplicate_node))]
    DuplicateNode(String),

    #[error("`{0}` is a reserved virtual endpoint and cannot be defined as a node")]
    #[diagnostic(code(ragloom::graph::reserved_id))]
    ReservedId(String),

    #[error("edge references unknown node `{0}`")]
    #[diagnostic(code(ragloom::graph::unknown_endpoint))]
    UnknownEndpoint(String),

    #[error("`__start__` must have exactly one outgoing edge, found {0}")]
    #[diagnostic(
        code(ragloom::graph::start_edges),
        help("The entry edge is static; route after the entry node instead.")
    )]
    StartEdges(usize),

    #[error("the `__start__` edge cannot be conditional")]
    #[diagnostic(code(ragloom::graph::start_conditional))]
    StartConditional,

    #[error("node `{0}` is not reachable from `__start__`")]
    #[diagnostic(code(ragloom::graph::unreachable))]
    Unreachable(String),

    #[error("node `{0}` has no outgoing edge and is not an interrupt node")]
    #[diagnostic(
        code(ragloom::graph::dead_end),
        help("Add an edge to `__end__` or another node.")
    )]
    DeadEnd(String),

    #[error("uncontrolled cycle through `{0}`: cycles must contain a conditional edge")]
    #[diagnostic(code(ragloom::graph::uncontrolled_cycle))]
    UncontrolledCycle(String),

    #[error("invalid config for node `{node}`: {source}")]
    #[diagnostic(code(ragloom::graph::bad_config))]
    BadConfig {
        node: String,
        source: serde_json::Error,
    },
}

/// One compiled routing edge, kept in definition order.
#[derive(Clone, Debug)]
pub struct CompiledEdge {
    pub target: String,
    pub condition: Option<EdgeCondition>,
}

/// An executable workflow graph.
pub struct Workflow {
    name: String,
    nodes: FxHashMap<String, Arc<dyn Node>>,
    node_types: FxHashMap<String, NodeType>,
    edges: FxHashMap<String, Vec<CompiledEdge>>,
    human_configs: FxHashMap<String, HumanConfig>,
    entry: String,
}

impl Workflow {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.get(id)
    }

    #[must_use]
    pub fn node_type(&self, id: &str) -> Option<NodeType> {
        self.node_types.get(id).copied()
    }

    #[must_use]
    pub fn is_interrupt(&self, id: &str) -> bool {
        self.node_type(id).is_some_and(|t| t.is_interrupt())
    }

    /// Reject-policy config for a human node.
    #[must_use]
    pub fn human_config(&self, id: &str) -> Option<&HumanConfig> {
        self.human_configs.get(id)
    }

    /// Routing: edges are evaluated in definition order; the first
    /// conditional edge whose predicate matches wins, an unconditional edge
    /// always matches. `None` means the path terminates.
    #[must_use]
    pub fn next_after(&self, id: &str, state: &WorkflowState) -> Option<String> {
        for edge in self.edges.get(id)? {
            match &edge.condition {
                Some(condition) if !condition.evaluate(state) => continue,
                _ => return Some(edge.target.clone()),
            }
        }
        None
    }
}

/// Compile a definition, enforcing the structural invariants.
pub fn compile(definition: &WorkflowDefinition) -> Result<Workflow, BuildError> {
    let mut node_types: FxHashMap<String, NodeType> = FxHashMap::default();
    for spec in &definition.nodes {
        if spec.id == START || spec.id == END {
            return Err(BuildError::ReservedId(spec.id.clone()));
        }
        if node_types.insert(spec.id.clone(), spec.node_type).is_some() {
            return Err(BuildError::DuplicateNode(spec.id.clone()));
        }
    }

    let mut edges: FxHashMap<String, Vec<CompiledEdge>> = FxHashMap::default();
    let mut start_edges = Vec::new();
    for edge in &definition.edges {
        if edge.source != START && !node_types.contains_key(&edge.source) {
            return Err(BuildError::UnknownEndpoint(edge.source.clone()));
        }
        if edge.target != END && !node_types.contains_key(&edge.target) {
            return Err(BuildError::UnknownEndpoint(edge.target.clone()));
        }
        if edge.source == START {
            start_edges.push(edge);
        }
        edges.entry(edge.source.clone()).or_default().push(CompiledEdge {
            target: edge.target.clone(),
            condition: edge.condition.clone(),
        });
    }

    if start_edges.len() != 1 {
        return Err(BuildError::StartEdges(start_edges.len()));
    }
    if start_edges[0].condition.is_some() {
        return Err(BuildError::StartConditional);
    }
    let entry = start_edges[0].target.clone();

    // Reachability from the entry over all edges.
    let mut reachable: FxHashSet<&str> = FxHashSet::default();
    let mut stack: Vec<&str> = vec![entry.as_str()];
    while let Some(current) = stack.pop() {
        if current == END || !reachable.insert(current) {
            continue;
        }
        if let Some(outgoing) = edges.get(current) {
            for edge in outgoing {
                stack.push(edge.target.as_str());
            }
        }
    }
    for id in node_types.keys() {
        if !reachable.contains(id.as_str()) {
            return Err(BuildError::Unreachable(id.clone()));
        }
    }

    // Termination: a node with no outgoing edge must be an interrupt node.
    for (id, node_type) in &node_types {
        let has_outgoing = edges.get(id).is_some_and(|e| !e.is_empty());
        if !has_outgoing && !node_type.is_interrupt() {
            return Err(BuildError::DeadEnd(id.clone()));
        }
    }

    // Cycle check over unconditional edges only: a cycle with no
    // conditional edge can never break out.
    detect_unconditional_cycle(&node_types, &edges)?;

    let mut nodes: FxHashMap<String, Arc<dyn Node>> = FxHashMap::default();
    let mut human_configs: FxHashMap<String, HumanConfig> = FxHashMap::default();
    for spec in &definition.nodes {
        let bad_config = |source| BuildError::BadConfig {
            node: spec.id.clone(),
            source,
        };
        let node: Arc<dyn Node> = match spec.node_type {
            NodeType::Llm => Arc::new(LlmNode::new(
                serde_json::from_value(spec.config.clone()).map_err(bad_config)?,
            )),
            NodeType::Retriever => Arc::new(RetrieverNode::new(
                serde_json::from_value(spec.config.clone()).map_err(bad_config)?,
            )),
            NodeType::RelevanceGrader => Arc::new(RelevanceGraderNode::new(
                serde_json::from_value(spec.config.clone()).map_err(bad_config)?,
            )),
            NodeType::RagGenerator => Arc::new(RagGeneratorNode::new(
                serde_json::from_value(spec.config.clone()).map_err(bad_config)?,
            )),
            NodeType::HallucinationChecker => Arc::new(HallucinationCheckerNode::new(
                serde_json::from_value(spec.config.clone()).map_err(bad_config)?,
            )),
            NodeType::HumanInLoop => {
                let config: HumanConfig =
                    serde_json::from_value(spec.config.clone()).map_err(bad_config)?;
                human_configs.insert(spec.id.clone(), config.clone());
                Arc::new(HumanInLoopNode::new(config))
            }
        };
        nodes.insert(spec.id.clone(), node);
    }

    Ok(Workflow {
        name: definition.name.clone(),
        nodes,
        node_types,
        edges,
        human_configs,
        entry,
    })
}

fn detect_unconditional_cycle(
    node_types: &FxHashMap<String, NodeType>,
    edges: &FxHashMap<String, Vec<CompiledEdge>>,
) -> Result<(), BuildError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        id: &str,
        edges: &FxHashMap<String, Vec<CompiledEdge>>,
        marks: &mut FxHashMap<String, Mark>,
    ) -> Result<(), BuildError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(BuildError::UncontrolledCycle(id.to_string())),
            None => {}
        }
        marks.insert(id.to_string(), Mark::Visiting);
        if let Some(outgoing) = edges.get(id) {
            for edge in outgoing {
                if edge.condition.is_none() && edge.target != END {
                    visit(&edge.target, edges, marks)?;
                }
            }
        }
        marks.insert(id.to_string(), Mark::Done);
        Ok(())
    }

    let mut marks = FxHashMap::default();
    for id in node_types.keys() {
        visit(id, edges, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::definition::{EdgeSpec, NodeType};
    use crate::models::SessionMode;
    use serde_json::json;

    fn linear_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("linear")
            .node("chat", NodeType::Llm, json!({}))
            .edge(EdgeSpec::direct(START, "chat"))
            .edge(EdgeSpec::direct("chat", END))
    }

    #[test]
    fn compiles_a_linear_graph() {
        let workflow = compile(&linear_definition()).unwrap();
        assert_eq!(workflow.entry(), "chat");
        let state = WorkflowState::new(SessionMode::Auto);
        assert_eq!(workflow.next_after("chat", &state), Some(END.to_string()));
    }

    #[test]
    fn rejects_multiple_start_edges() {
        let definition = WorkflowDefinition::new("bad")
            .node("a", NodeType::Llm, json!({}))
            .node("b", NodeType::Llm, json!({}))
            .edge(EdgeSpec::direct(START, "a"))
            .edge(EdgeSpec::direct(START, "b"))
            .edge(EdgeSpec::direct("a", END))
            .edge(EdgeSpec::direct("b", END));
        assert!(matches!(
            compile(&definition),
            Err(BuildError::StartEdges(2))
        ));
    }

    #[test]
    fn rejects_unreachable_nodes() {
        let definition = linear_definition()
            .node("orphan", NodeType::Llm, json!({}))
            .edge(EdgeSpec::direct("orphan", END));
        assert!(matches!(
            compile(&definition),
            Err(BuildError::Unreachable(id)) if id == "orphan"
        ));
    }

    #[test]
    fn rejects_dead_ends_except_interrupt_nodes() {
        let definition = WorkflowDefinition::new("dead")
            .node("chat", NodeType::Llm, json!({}))
            .edge(EdgeSpec::direct(START, "chat"));
        assert!(matches!(compile(&definition), Err(BuildError::DeadEnd(_))));

        let with_interrupt = WorkflowDefinition::new("hitl")
            .node("gate", NodeType::HumanInLoop, json!({}))
            .edge(EdgeSpec::direct(START, "gate"));
        assert!(compile(&with_interrupt).is_ok());
    }

    #[test]
    fn rejects_cycles_without_a_conditional_edge() {
        let definition = WorkflowDefinition::new("loop")
            .node("a", NodeType::Llm, json!({}))
            .node("b", NodeType::Llm, json!({}))
            .edge(EdgeSpec::direct(START, "a"))
            .edge(EdgeSpec::direct("a", "b"))
            .edge(EdgeSpec::direct("b", "a"));
        assert!(matches!(
            compile(&definition),
            Err(BuildError::UncontrolledCycle(_))
        ));
    }

    #[test]
    fn accepts_cycles_guarded_by_a_condition() {
        let definition = WorkflowDefinition::new("retry-loop")
            .node("generate", NodeType::Llm, json!({}))
            .node("check", NodeType::HallucinationChecker, json!({}))
            .edge(EdgeSpec::direct(START, "generate"))
            .edge(EdgeSpec::direct("generate", "check"))
            .edge(EdgeSpec::conditional(
                "check",
                "generate",
                EdgeCondition::RetrySet,
            ))
            .edge(EdgeSpec::direct("check", END));
        assert!(compile(&definition).is_ok());
    }

    #[test]
    fn conditional_edges_route_in_declaration_order() {
        let definition = WorkflowDefinition::new("routed")
            .node("grade", NodeType::RelevanceGrader, json!({}))
            .node("fallback", NodeType::Llm, json!({}))
            .node("answer", NodeType::RagGenerator, json!({}))
            .edge(EdgeSpec::direct(START, "grade"))
            .edge(EdgeSpec::conditional(
                "grade",
                "fallback",
                EdgeCondition::RouteEquals {
                    value: "no_context".into(),
                },
            ))
            .edge(EdgeSpec::direct("grade", "answer"))
            .edge(EdgeSpec::direct("fallback", END))
            .edge(EdgeSpec::direct("answer", END));
        let workflow = compile(&definition).unwrap();

        let mut state = WorkflowState::new(SessionMode::Auto);
        assert_eq!(
            workflow.next_after("grade", &state),
            Some("answer".to_string())
        );
        state.route = Some("no_context".into());
        assert_eq!(
            workflow.next_after("grade", &state),
            Some("fallback".to_string())
        );
    }

    #[test]
    fn rejects_bad_node_config() {
        let definition = WorkflowDefinition::new("bad-config")
            .node("chat", NodeType::Llm, json!({"not_a_field": 1}))
            .edge(EdgeSpec::direct(START, "chat"))
            .edge(EdgeSpec::direct("chat", END));
        assert!(matches!(
            compile(&definition),
            Err(BuildError::BadConfig { .. })
        ));
    }
}
