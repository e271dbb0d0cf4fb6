//! Per-session mutable record and the snapshots derived from it

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::blocks::{Block, BlockList, ToolStatus};
use super::{ConversationId, SessionId};

/// Who and what a session belongs to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Session (generation turn) ID
    pub session_id: SessionId,
    /// Parent conversation ID
    pub conversation_id: ConversationId,
    /// Originating user
    pub user_id: String,
    /// Human-facing agent kind label (e.g. "Chat", "Code")
    pub agent_kind: String,
}

impl SessionIdentity {
    /// Create a new identity
    pub fn new(
        session_id: impl Into<SessionId>,
        conversation_id: impl Into<ConversationId>,
        user_id: impl Into<String>,
        agent_kind: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            agent_kind: agent_kind.into(),
        }
    }
}

/// One entry of the tool/thinking step log
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingStep {
    /// Short title shown to the user
    pub title: String,
    /// What the agent intends to do next
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
    /// Full step payload (tool arguments, intermediate output)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ThinkingStep {
    /// Create a step with only a title
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            next_action: None,
            details: None,
        }
    }

    /// Attach details
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach a next action
    #[must_use]
    pub fn with_next_action(mut self, next_action: impl Into<String>) -> Self {
        self.next_action = Some(next_action.into());
        self
    }

    fn slimmed(&self) -> Self {
        Self {
            title: self.title.clone(),
            next_action: self.next_action.clone(),
            details: None,
        }
    }
}

/// How much of the thinking log goes into snapshots and events
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThinkingDetail {
    /// Steps with their details
    Full,
    /// Titles and next actions only
    Slim,
}

impl ThinkingDetail {
    /// Pick the detail level for an agent kind label
    #[must_use]
    pub fn for_agent_kind(agent_kind: &str, slim_kinds: &[String]) -> Self {
        if slim_kinds.iter().any(|k| k.eq_ignore_ascii_case(agent_kind)) {
            Self::Slim
        } else {
            Self::Full
        }
    }
}

/// A citation/source entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceEntry {
    /// 1-based citation index
    pub index: usize,
    /// Source identifier (document, knowledge base entry, URL hash...)
    pub source_id: String,
    /// Display title
    pub title: String,
    /// Link, if the source has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Full result snapshot written to storage and carried on terminal events
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSnapshot {
    /// Concatenated plain text
    pub value: String,
    /// Reasoning text, if any was produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Ordered blocks
    pub blocks: Vec<Block>,
    /// Citation list
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    /// Thinking log, slimmed or full depending on the agent kind
    #[serde(default)]
    pub thinking: Vec<ThinkingStep>,
    /// Agent kind label of the session
    pub agent_kind: String,
    /// Whether the result should not be surfaced to the end user
    #[serde(default)]
    pub silent: bool,
    /// Why the turn is silent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silent_reason: Option<String>,
    /// Error text for failed sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the session started streaming
    pub started_at: DateTime<Utc>,
}

/// Mutable record of everything produced so far for one stream
#[derive(Debug)]
pub struct SessionState {
    identity: SessionIdentity,
    text: String,
    /// Characters of plain text applied so far
    offset: usize,
    reasoning: String,
    blocks: BlockList,
    thinking: Vec<ThinkingStep>,
    sources: Vec<SourceEntry>,
    source_keys: HashSet<(String, String)>,
    started_at: DateTime<Utc>,
    started: Instant,
    first_token_latency: Option<Duration>,
    silent_reason: Option<String>,
    silent: bool,
    finalized: bool,
}

impl SessionState {
    /// Create an empty state for a session
    #[must_use]
    pub fn new(identity: SessionIdentity) -> Self {
        Self {
            identity,
            text: String::new(),
            offset: 0,
            reasoning: String::new(),
            blocks: BlockList::new(),
            thinking: Vec::new(),
            sources: Vec::new(),
            source_keys: HashSet::new(),
            started_at: Utc::now(),
            started: Instant::now(),
            first_token_latency: None,
            silent_reason: None,
            silent: false,
            finalized: false,
        }
    }

    /// Session identity
    #[must_use]
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Session ID
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.identity.session_id
    }

    /// Plain text accumulated so far
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Current offset (characters of plain text applied)
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Reasoning text accumulated so far
    #[must_use]
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Ordered blocks
    #[must_use]
    pub fn blocks(&self) -> &BlockList {
        &self.blocks
    }

    /// Thinking step log
    #[must_use]
    pub fn thinking_steps(&self) -> &[ThinkingStep] {
        &self.thinking
    }

    /// Citation list
    #[must_use]
    pub fn sources(&self) -> &[SourceEntry] {
        &self.sources
    }

    /// Time from stream start to the first token, once seen
    #[must_use]
    pub fn first_token_latency(&self) -> Option<Duration> {
        self.first_token_latency
    }

    /// Whether `finalize` has been called
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Whether the turn is silent
    #[must_use]
    pub fn is_silent(&self) -> bool {
        self.silent
    }

    /// Reset the start timestamps (called on entering streaming)
    pub fn mark_started(&mut self) {
        self.started_at = Utc::now();
        self.started = Instant::now();
    }

    /// Record the first token; returns the latency only the first time
    pub fn record_first_token(&mut self) -> Option<Duration> {
        if self.first_token_latency.is_some() {
            return None;
        }
        let latency = self.started.elapsed();
        self.first_token_latency = Some(latency);
        Some(latency)
    }

    /// Apply a plain-text token
    ///
    /// Returns the offset before the token was applied, or `None` once finalized.
    pub fn push_text(&mut self, token: &str) -> Option<usize> {
        if self.finalized {
            return None;
        }
        let before = self.offset;
        self.text.push_str(token);
        self.offset += token.chars().count();
        self.blocks.append_text(token);
        Some(before)
    }

    /// Append reasoning text; never touches text blocks or the plain-text accumulator
    pub fn push_reasoning(&mut self, text: &str) -> bool {
        if self.finalized {
            return false;
        }
        self.reasoning.push_str(text);
        true
    }

    /// Open a tool block (closes the current text block first)
    pub fn open_tool(&mut self, id: &str, tool_name: &str, input: Value) -> bool {
        !self.finalized && self.blocks.open_tool(id, tool_name, input)
    }

    /// Close a tool block by invocation ID
    pub fn close_tool(&mut self, id: &str, output: Value, status: ToolStatus) -> bool {
        !self.finalized && self.blocks.close_tool(id, output, status)
    }

    /// Add a citation; duplicates by (source ID, title) are ignored
    ///
    /// Returns the citation index of a newly added entry.
    pub fn add_source(
        &mut self,
        source_id: &str,
        title: &str,
        url: Option<String>,
    ) -> Option<usize> {
        if self.finalized {
            return None;
        }
        let key = (source_id.to_string(), title.to_string());
        if !self.source_keys.insert(key) {
            return None;
        }
        let index = self.sources.len() + 1;
        self.sources.push(SourceEntry {
            index,
            source_id: source_id.to_string(),
            title: title.to_string(),
            url,
        });
        Some(index)
    }

    /// Append a thinking step
    pub fn push_thinking_step(&mut self, step: ThinkingStep) -> bool {
        if self.finalized {
            return false;
        }
        self.thinking.push(step);
        true
    }

    /// Mark the turn as silent
    pub fn mark_silent(&mut self, reason: Option<String>) {
        if self.finalized {
            return;
        }
        self.silent = true;
        self.silent_reason = reason;
    }

    /// Close the open text block and freeze the state
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.blocks.close_text();
        self.finalized = true;
    }

    /// Thinking log at the given detail level
    #[must_use]
    pub fn thinking_view(&self, detail: ThinkingDetail) -> Vec<ThinkingStep> {
        match detail {
            ThinkingDetail::Full => self.thinking.clone(),
            ThinkingDetail::Slim => self.thinking.iter().map(ThinkingStep::slimmed).collect(),
        }
    }

    /// Build a full result snapshot
    #[must_use]
    pub fn snapshot(&self, detail: ThinkingDetail) -> ResultSnapshot {
        ResultSnapshot {
            value: self.text.clone(),
            reasoning_content: (!self.reasoning.is_empty()).then(|| self.reasoning.clone()),
            blocks: self.blocks.as_slice().to_vec(),
            sources: self.sources.clone(),
            thinking: self.thinking_view(detail),
            agent_kind: self.identity.agent_kind.clone(),
            silent: self.silent,
            silent_reason: self.silent_reason.clone(),
            error: None,
            started_at: self.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::BlockStatus;
    use serde_json::json;

    fn state() -> SessionState {
        SessionState::new(SessionIdentity::new("s-1", "c-1", "u-1", "Chat"))
    }

    #[test]
    fn test_offset_counts_characters() {
        let mut s = state();
        assert_eq!(s.push_text("héllo"), Some(0));
        assert_eq!(s.push_text(" wörld"), Some(5));
        assert_eq!(s.offset(), 11);
        assert_eq!(s.text(), "héllo wörld");
    }

    #[test]
    fn test_reasoning_kept_out_of_text() {
        let mut s = state();
        s.push_text("a");
        s.push_reasoning("note");

        assert_eq!(s.text(), "a");
        assert_eq!(s.reasoning(), "note");
        assert_eq!(s.blocks().len(), 1);
        assert_eq!(s.snapshot(ThinkingDetail::Full).reasoning_content.as_deref(), Some("note"));
    }

    #[test]
    fn test_sources_deduplicated() {
        let mut s = state();
        assert_eq!(s.add_source("doc-1", "Intro", None), Some(1));
        assert_eq!(s.add_source("doc-1", "Intro", None), None);
        assert_eq!(s.add_source("doc-1", "Appendix", None), Some(2));
        assert_eq!(s.sources().len(), 2);
    }

    #[test]
    fn test_finalize_closes_text_and_freezes() {
        let mut s = state();
        s.push_text("x");
        s.finalize();

        assert!(s.is_finalized());
        assert_eq!(s.push_text("y"), None);
        assert!(!s.open_tool("t", "tool", json!({})));
        assert_eq!(s.text(), "x");
        match &s.blocks().as_slice()[0] {
            Block::Text(b) => assert_eq!(b.status, BlockStatus::Done),
            Block::Tool(_) => panic!("Expected text block"),
        }
    }

    #[test]
    fn test_first_token_recorded_once() {
        let mut s = state();
        assert!(s.record_first_token().is_some());
        assert!(s.record_first_token().is_none());
        assert!(s.first_token_latency().is_some());
    }

    #[test]
    fn test_slim_thinking_drops_details() {
        let mut s = state();
        s.push_thinking_step(
            ThinkingStep::new("Searching").with_details(json!({"query": "rust"})),
        );

        let slim = s.snapshot(ThinkingDetail::Slim);
        let full = s.snapshot(ThinkingDetail::Full);
        assert!(slim.thinking[0].details.is_none());
        assert_eq!(full.thinking[0].details, Some(json!({"query": "rust"})));
    }

    #[test]
    fn test_detail_for_agent_kind() {
        let slim = vec!["Chat".to_string()];
        assert_eq!(ThinkingDetail::for_agent_kind("chat", &slim), ThinkingDetail::Slim);
        assert_eq!(ThinkingDetail::for_agent_kind("Code", &slim), ThinkingDetail::Full);
    }

    #[test]
    fn test_silent_flag_in_snapshot() {
        let mut s = state();
        s.mark_silent(Some("no reply needed".to_string()));
        let snap = s.snapshot(ThinkingDetail::Full);
        assert!(snap.silent);
        assert_eq!(snap.silent_reason.as_deref(), Some("no reply needed"));
    }

    #[test]
    fn test_snapshot_json_is_camel_case() {
        let mut s = state();
        s.push_reasoning("r");
        let value = serde_json::to_value(s.snapshot(ThinkingDetail::Full)).unwrap();
        assert_eq!(value["reasoningContent"], "r");
        assert_eq!(value["agentKind"], "Chat");
        assert!(value.get("startedAt").is_some());
    }
}
