//! Conversation message primitives shared by the data plane and the
//! workflow state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a message sender within a conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Canonical lowercase form, matching the persisted column values.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Parse the persisted form back into a role.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single conversation message: role plus text content.
///
/// This is the in-flight representation used by workflow state and provider
/// requests; the persisted `messages` table row (see [`crate::models`])
/// additionally carries ids and timestamps.
///
/// # Examples
///
/// ```
/// use ragloom::message::{ChatMessage, Role};
///
/// let question = ChatMessage::user("What does the report conclude?");
/// assert!(question.has_role(Role::User));
/// assert_eq!(question.content, "What does the report conclude?");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.role == role
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_persisted_form() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("function"), None);
    }

    #[test]
    fn constructors_set_roles() {
        assert!(ChatMessage::user("hi").has_role(Role::User));
        assert!(ChatMessage::assistant("hello").has_role(Role::Assistant));
        assert!(ChatMessage::system("be terse").has_role(Role::System));
    }

    #[test]
    fn serializes_with_lowercase_role() {
        let json = serde_json::to_value(ChatMessage::assistant("ok")).unwrap();
        assert_eq!(json["role"], "assistant");
    }
}
