//! Built-in node implementations.
//!
//! Each node type carries its own config struct, deserialized from the
//! definition's `config` object with unknown fields rejected.

mod checker;
mod generator;
mod grader;
mod human;
mod llm;
mod retriever;

pub use checker::{CheckerConfig, HallucinationCheckerNode};
pub use generator::{RagGeneratorConfig, RagGeneratorNode};
pub use grader::{GraderConfig, RelevanceGraderNode};
pub use human::{HumanConfig, HumanInLoopNode, RejectPolicy};
pub use llm::{LlmConfig, LlmNode};
pub use retriever::{RetrieverConfig, RetrieverNode};
