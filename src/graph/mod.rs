//! Workflow graphs: declarative definitions, structural validation, node
//! implementations, and compilation into an executable form.

pub mod builder;
pub mod definition;
pub mod node;
pub mod nodes;

pub use builder::{compile, BuildError, CompiledEdge, Workflow};
pub use definition::{EdgeCondition, EdgeSpec, NodeSpec, NodeType, WorkflowDefinition, END, START};
pub use node::{Node, NodeContext, NodeError, NodeServices};
