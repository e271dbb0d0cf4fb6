//! Stream Events
//!
//! Wire-level events produced by the orchestrator and serialized by emitters.
//! Every transport sends the same JSON object:
//!
//! ```json
//! { "kind": "chunk", "content": "Hello", "offset": 0, "sessionId": "42",
//!   "conversationId": "7" }
//! ```
//!
//! Optional fields are omitted when absent. `result` carries either a full
//! [`ResultSnapshot`] (terminal events), a reasoning fragment, or the thinking
//! log, depending on the event kind.

use serde::{Deserialize, Serialize};

use crate::session::{ConversationId, ResultSnapshot, SessionId, ThinkingStep};

/// Kind of stream event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    /// Session entered streaming
    Start,
    /// Incremental content
    Chunk,
    /// Session finished (successfully, or carrying an error after `Error`)
    Done,
    /// Session failed
    Error,
    /// Session was cancelled
    Cancelled,
    /// Thinking log updated
    Thinking,
}

impl StreamEventKind {
    /// Whether no further events follow this one for the session
    ///
    /// `Error` is not terminal on its own: a `Done` carrying the error follows it.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

/// Payload carried in the `result` field
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventResult {
    /// Full result snapshot (terminal events)
    Snapshot(Box<ResultSnapshot>),
    /// Reasoning fragment on a chunk event
    Reasoning {
        /// Unwrapped reasoning text
        #[serde(rename = "reasoningChunk")]
        reasoning_chunk: String,
    },
    /// Thinking log on a thinking event
    Thinking {
        /// Steps so far
        #[serde(rename = "thinkingSteps")]
        thinking_steps: Vec<ThinkingStep>,
    },
}

/// Which session and conversation an event belongs to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    /// Session ID
    pub session_id: SessionId,
    /// Conversation ID
    pub conversation_id: ConversationId,
}

impl EventContext {
    /// Create a context
    pub fn new(
        session_id: impl Into<SessionId>,
        conversation_id: impl Into<ConversationId>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

/// A single wire event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    /// Event kind
    pub kind: StreamEventKind,
    /// Token text (chunk events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Offset before this chunk was applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    /// Session ID
    pub session_id: SessionId,
    /// Conversation ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Agent kind label (start events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_kind: Option<String>,
    /// Result payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<EventResult>,
    /// Error text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Ordering ID for sequencing messages within a conversation (terminal events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_id: Option<u64>,
}

impl StreamEvent {
    fn bare(kind: StreamEventKind, ctx: &EventContext) -> Self {
        Self {
            kind,
            content: None,
            offset: None,
            session_id: ctx.session_id.clone(),
            conversation_id: Some(ctx.conversation_id.clone()),
            agent_kind: None,
            result: None,
            error: None,
            ordering_id: None,
        }
    }

    /// Start event
    #[must_use]
    pub fn start(ctx: &EventContext, agent_kind: &str) -> Self {
        Self {
            agent_kind: Some(agent_kind.to_string()),
            ..Self::bare(StreamEventKind::Start, ctx)
        }
    }

    /// Displayable text chunk
    #[must_use]
    pub fn chunk(ctx: &EventContext, content: &str, offset: usize) -> Self {
        Self {
            content: Some(content.to_string()),
            offset: Some(offset),
            ..Self::bare(StreamEventKind::Chunk, ctx)
        }
    }

    /// Reasoning chunk; carries no displayable content
    #[must_use]
    pub fn reasoning(ctx: &EventContext, text: &str, offset: usize) -> Self {
        Self {
            content: Some(String::new()),
            offset: Some(offset),
            result: Some(EventResult::Reasoning {
                reasoning_chunk: text.to_string(),
            }),
            ..Self::bare(StreamEventKind::Chunk, ctx)
        }
    }

    /// Terminal done event, optionally carrying the error of a failed session
    #[must_use]
    pub fn done(
        ctx: &EventContext,
        result: &ResultSnapshot,
        ordering_id: Option<u64>,
        error: Option<&str>,
    ) -> Self {
        Self {
            offset: Some(result.value.chars().count()),
            result: Some(EventResult::Snapshot(Box::new(result.clone()))),
            error: error.map(str::to_string),
            ordering_id,
            ..Self::bare(StreamEventKind::Done, ctx)
        }
    }

    /// Error event
    #[must_use]
    pub fn error(ctx: &EventContext, error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::bare(StreamEventKind::Error, ctx)
        }
    }

    /// Terminal cancellation event
    #[must_use]
    pub fn cancelled(
        ctx: &EventContext,
        partial: Option<&ResultSnapshot>,
        ordering_id: Option<u64>,
    ) -> Self {
        Self {
            result: partial.map(|r| EventResult::Snapshot(Box::new(r.clone()))),
            ordering_id,
            ..Self::bare(StreamEventKind::Cancelled, ctx)
        }
    }

    /// Thinking log update
    #[must_use]
    pub fn thinking(ctx: &EventContext, steps: &[ThinkingStep]) -> Self {
        Self {
            result: Some(EventResult::Thinking {
                thinking_steps: steps.to_vec(),
            }),
            ..Self::bare(StreamEventKind::Thinking, ctx)
        }
    }

    /// Snapshot carried by this event, if any
    #[must_use]
    pub fn snapshot(&self) -> Option<&ResultSnapshot> {
        match &self.result {
            Some(EventResult::Snapshot(snapshot)) => Some(snapshot),
            _ => None,
        }
    }

    /// Reasoning fragment carried by this event, if any
    #[must_use]
    pub fn reasoning_chunk(&self) -> Option<&str> {
        match &self.result {
            Some(EventResult::Reasoning { reasoning_chunk }) => Some(reasoning_chunk),
            _ => None,
        }
    }
}
