//! # Ragloom: Multi-tenant RAG Orchestration Backend
//!
//! Ragloom is the execution substrate for a document-grounded assistant:
//! tenants upload documents that are parsed, chunked, embedded, and indexed;
//! users then run asynchronous LLM operations (summarize, ask, transform)
//! and checkpointed graph workflows over them, with streaming updates and
//! human-in-the-loop interrupts.
//!
//! ## Core pieces
//!
//! - [`ingest`] — the document pipeline (parse → chunk → embed → index)
//! - [`engine`] — async LLM operations with polling, caching, deadlines
//! - [`graph`] — declarative workflow graphs compiled into executable form
//! - [`executor`] — the step loop: checkpoints, events, mode routing, HITL
//! - [`checkpoint`] — append-only `(thread_id, step)` state snapshots
//! - [`providers`] — embedding/chat capability traits and backends
//! - [`vector`] — tenant-scoped similarity search
//! - [`secrets`] — per-tenant credential storage
//! - [`session`] / [`hitl`] — conversation context and approvals
//! - [`store`] — the relational data plane (authoritative state)
//! - [`api`] — the HTTP contract (`/api/v1`, SSE streaming)
//!
//! ## Isolation
//!
//! Every persistent entity carries its tenant id and every read/write
//! narrows by the caller's [`tenant::TenantContext`]. Vector search
//! enforces tenancy inside the query; secrets are addressed per tenant;
//! nothing relies on naming for isolation.
//!
//! ## Example: compiling and validating a workflow
//!
//! ```
//! use ragloom::graph::{compile, EdgeSpec, NodeType, WorkflowDefinition, END, START};
//! use serde_json::json;
//!
//! let definition = WorkflowDefinition::new("answer")
//!     .node("retrieve", NodeType::Retriever, json!({ "max_chunks": 3 }))
//!     .node("generate", NodeType::RagGenerator, json!({ "include_sources": true }))
//!     .edge(EdgeSpec::direct(START, "retrieve"))
//!     .edge(EdgeSpec::direct("retrieve", "generate"))
//!     .edge(EdgeSpec::direct("generate", END));
//!
//! let workflow = compile(&definition).expect("structurally valid graph");
//! assert_eq!(workflow.entry(), "retrieve");
//! ```

pub mod api;
pub mod bootstrap;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod events;
pub mod executor;
pub mod graph;
pub mod hitl;
pub mod ingest;
pub mod message;
pub mod models;
pub mod providers;
pub mod secrets;
pub mod session;
pub mod state;
pub mod store;
pub mod tenant;
pub mod vector;
