//! Session State
//!
//! Everything produced so far for one streaming session: plain text, reasoning
//! text, the ordered block list, thinking steps, citations and timing.
//!
//! # Ownership
//!
//! A `SessionState` is owned by exactly one `StreamOrchestrator` for its entire
//! lifetime. There are no concurrent writers, so nothing in here is synchronized.
//! The state is never persisted as an object; only [`ResultSnapshot`]s derived
//! from it are written out.

mod blocks;
mod state;

pub use blocks::{Block, BlockList, BlockStatus, TextBlock, ToolBlock, ToolStatus};
pub use state::{
    ResultSnapshot, SessionIdentity, SessionState, SourceEntry, ThinkingDetail, ThinkingStep,
};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a streaming session (one generation turn)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a new random session ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("sess_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Borrow the raw string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of the conversation a session belongs to
///
/// Push rooms are keyed by this ID so every client watching a conversation
/// observes the same events.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Borrow the raw string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_unique() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("sess_"));
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let id = SessionId::from("42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"42\"");

        let conv: ConversationId = serde_json::from_str("\"conv-7\"").unwrap();
        assert_eq!(conv.as_str(), "conv-7");
    }
}
