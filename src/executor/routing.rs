//! Session-mode routing and the built-in unified workflows.
//!
//! In `auto` mode a lightweight deterministic classifier decides whether a
//! turn needs retrieval. The decision (and its inputs) is recorded in the
//! `routing_metadata` of the first emitted update so clients can see why a
//! path was taken.

use serde_json::{json, Value};

use crate::graph::{EdgeCondition, EdgeSpec, NodeType, WorkflowDefinition, END, START};

/// Route chosen for one `auto`-mode turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    DirectChat,
    RagNeeded,
    Hybrid,
}

impl Route {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::DirectChat => "direct_chat",
            Route::RagNeeded => "rag_needed",
            Route::Hybrid => "hybrid",
        }
    }
}

const GREETINGS: &[&str] = &[
    "hello", "hi", "hey", "good morning", "good afternoon", "good evening", "thanks", "thank you",
];

const DOCUMENT_CUES: &[&str] = &[
    "doc", "document", "file", "report", "text", "pdf", "page", "section", "chapter", "according",
    "say", "says", "said", "mention", "summar", "explain", "content", "uploaded",
];

/// Deterministic `auto`-mode classifier.
///
/// Without active documents the answer is always [`Route::DirectChat`].
/// With documents, a greeting stays conversational, anything that reads as
/// a question about the material retrieves, and the rest runs the hybrid
/// path.
#[must_use]
pub fn classify(input: &str, active_documents: usize) -> (Route, &'static str) {
    if active_documents == 0 {
        return (Route::DirectChat, "no_active_documents");
    }

    let lowered = input.trim().to_lowercase();
    if GREETINGS
        .iter()
        .any(|g| lowered == *g || lowered.starts_with(&format!("{g} ")) || lowered.starts_with(&format!("{g},")))
        || (lowered.split_whitespace().count() <= 2 && !lowered.contains('?'))
    {
        return (Route::DirectChat, "conversational_input");
    }

    let references_documents = DOCUMENT_CUES.iter().any(|cue| lowered.contains(cue));
    if references_documents || lowered.contains('?') {
        return (Route::RagNeeded, "document_query");
    }

    (Route::Hybrid, "general_with_documents")
}

/// Metadata recorded on the first `update` event of a routed turn.
#[must_use]
pub fn routing_metadata(route: Route, reason: &str, active_documents: usize) -> Value {
    json!({
        "route": route.as_str(),
        "reason": reason,
        "active_documents": active_documents,
    })
}

/// The tenant-default ("unified") workflow for a routed turn.
#[must_use]
pub fn unified_definition(route: Route) -> WorkflowDefinition {
    match route {
        Route::DirectChat => chat_definition(),
        Route::RagNeeded => rag_definition(false),
        Route::Hybrid => rag_definition(true),
    }
}

fn chat_definition() -> WorkflowDefinition {
    WorkflowDefinition::new("unified_chat")
        .node("chat", NodeType::Llm, json!({}))
        .edge(EdgeSpec::direct(START, "chat"))
        .edge(EdgeSpec::direct("chat", END))
}

/// Retrieval graph: retrieve → grade → generate → verify, with a chat
/// fallback when grading leaves no usable context and a single guarded
/// regeneration loop on a failed verification.
fn rag_definition(include_sources: bool) -> WorkflowDefinition {
    WorkflowDefinition::new(if include_sources {
        "unified_hybrid"
    } else {
        "unified_rag"
    })
    .node("retrieve", NodeType::Retriever, json!({}))
    .node("grade", NodeType::RelevanceGrader, json!({}))
    .node(
        "generate",
        NodeType::RagGenerator,
        json!({ "include_sources": include_sources }),
    )
    .node("verify", NodeType::HallucinationChecker, json!({}))
    .node("fallback_chat", NodeType::Llm, json!({}))
    .edge(EdgeSpec::direct(START, "retrieve"))
    .edge(EdgeSpec::conditional(
        "retrieve",
        "fallback_chat",
        EdgeCondition::RouteEquals {
            value: "no_context".into(),
        },
    ))
    .edge(EdgeSpec::direct("retrieve", "grade"))
    .edge(EdgeSpec::conditional(
        "grade",
        "fallback_chat",
        EdgeCondition::RouteEquals {
            value: "no_context".into(),
        },
    ))
    .edge(EdgeSpec::direct("grade", "generate"))
    .edge(EdgeSpec::direct("generate", "verify"))
    .edge(EdgeSpec::conditional(
        "verify",
        "generate",
        EdgeCondition::RetrySet,
    ))
    .edge(EdgeSpec::direct("verify", END))
    .edge(EdgeSpec::direct("fallback_chat", END))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::compile;

    #[test]
    fn no_documents_always_chats() {
        let (route, reason) = classify("What does the doc say about X?", 0);
        assert_eq!(route, Route::DirectChat);
        assert_eq!(reason, "no_active_documents");
    }

    #[test]
    fn greetings_stay_conversational_even_with_documents() {
        assert_eq!(classify("Hello", 2).0, Route::DirectChat);
        assert_eq!(classify("hey there", 1).0, Route::DirectChat);
    }

    #[test]
    fn document_questions_retrieve() {
        let (route, _) = classify("What does the doc say about X?", 1);
        assert_eq!(route, Route::RagNeeded);
        assert_eq!(classify("Summarize the report findings", 1).0, Route::RagNeeded);
    }

    #[test]
    fn other_inputs_with_documents_go_hybrid() {
        assert_eq!(
            classify("Draft an email introducing our team", 1).0,
            Route::Hybrid
        );
    }

    #[test]
    fn unified_definitions_compile() {
        for route in [Route::DirectChat, Route::RagNeeded, Route::Hybrid] {
            compile(&unified_definition(route)).expect("unified workflow must compile");
        }
    }
}
