//! Streaming Orchestrator
//!
//! Drives one streaming session from admission to release.
//!
//! # Lifecycle
//!
//! ```text
//! Init ──begin──► Acquired ──start──► Streaming ──┬─ finalize ──► Completed ─┐
//!   │                                             ├─ cancelled ─► Cancelled ─┼─ release ─► Released
//!   └─ admission/registration failure ─► Failed   └─ error ─────► Failed ────┘
//! ```
//!
//! The orchestrator exclusively owns its [`SessionState`]. Every session sees
//! exactly one terminal signal: `done`, `error` followed by `done`, or
//! `cancelled`. A session rejected at admission sees a single `error`.
//!
//! # Cancellation
//!
//! Cooperative: the token handed out at registration is checked before each
//! text token is interpreted, and [`StreamOrchestrator::run`] also wakes on it
//! while waiting for the generation source.
//!
//! # Persistence
//!
//! While streaming, a full snapshot is written to the fast cache every
//! `cache_interval` and to the authoritative store every `store_interval`.
//! Write failures are logged and streaming continues.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::admission::{AdmissionController, AdmissionError, AdmissionPermit};
use crate::config::OrchestratorConfig;
use crate::emitter::Emitter;
use crate::events::EventContext;
use crate::session::{
    ResultSnapshot, SessionId, SessionState, ThinkingDetail, ThinkingStep, ToolStatus,
};
use crate::storage::{SessionStatus, SessionStore, StoreError};

/// Marker opening a reasoning-wrapped token
pub const REASONING_START: &str = "__REASONING__";

/// Marker closing a reasoning-wrapped token
pub const REASONING_END: &str = "__END_REASONING__";

/// Inner text of a reasoning-wrapped token
#[must_use]
pub fn strip_reasoning(token: &str) -> Option<&str> {
    token
        .strip_prefix(REASONING_START)?
        .strip_suffix(REASONING_END)
}

/// Lifecycle phase of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    /// Constructed, nothing acquired
    Init,
    /// Admission slot and cancellation token held
    Acquired,
    /// Processing generation output
    Streaming,
    /// Finalized successfully
    Completed,
    /// Stopped by cancellation
    Cancelled,
    /// Rejected or failed
    Failed,
    /// All resources returned
    Released,
}

impl SessionPhase {
    /// Whether the session reached an outcome
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Errors that prevent a session from streaming
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// No admission slot
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    /// Cancellation registration failed
    #[error("Failed to register session: {0}")]
    Registration(#[source] StoreError),
    /// Operation not valid in the current phase
    #[error("Session is {actual:?}, expected {expected:?}")]
    InvalidPhase {
        /// Required phase
        expected: SessionPhase,
        /// Current phase
        actual: SessionPhase,
    },
}

/// One item from a generation source
#[derive(Clone, Debug, PartialEq)]
pub enum GenerationEvent {
    /// Text token, possibly reasoning-wrapped
    Token(String),
    /// A tool invocation started
    ToolStart {
        /// Invocation ID
        id: String,
        /// Tool name
        name: String,
        /// Input parameters
        input: Value,
    },
    /// A tool invocation finished
    ToolEnd {
        /// Invocation ID
        id: String,
        /// Tool output
        output: Value,
        /// `Done` or `Error`
        status: ToolStatus,
    },
    /// A citation
    Source {
        /// Source identifier
        source_id: String,
        /// Display title
        title: String,
        /// Link, if any
        url: Option<String>,
    },
    /// A coarse-grained thinking step
    ThinkingStep(ThinkingStep),
    /// The turn should not be surfaced to the end user
    Silent {
        /// Why
        reason: Option<String>,
    },
}

impl GenerationEvent {
    /// Plain or reasoning-wrapped token
    pub fn token(text: impl Into<String>) -> Self {
        Self::Token(text.into())
    }
}

/// A sub-resource opened by a session (e.g. a tool-execution client)
///
/// Disconnected when the session releases its resources.
#[async_trait]
pub trait SessionResource: Send + Sync {
    /// Resource name for logs
    fn name(&self) -> &str;

    /// Close the resource
    async fn disconnect(&self) -> anyhow::Result<()>;
}

/// How a session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// Source ended normally
    Completed(ResultSnapshot),
    /// Cancelled; carries the partial result
    Cancelled(ResultSnapshot),
    /// Source failed; carries the partial result
    Failed {
        /// Error text reported to clients
        error: String,
        /// Partial result
        partial: ResultSnapshot,
    },
    /// Never started streaming
    Rejected(OrchestratorError),
}

impl SessionOutcome {
    /// Final or partial result, if the session streamed
    #[must_use]
    pub fn snapshot(&self) -> Option<&ResultSnapshot> {
        match self {
            Self::Completed(s) | Self::Cancelled(s) => Some(s),
            Self::Failed { partial, .. } => Some(partial),
            Self::Rejected(_) => None,
        }
    }
}

enum Step {
    Cancelled,
    Next(Option<anyhow::Result<GenerationEvent>>),
}

/// Orchestrates one streaming session
pub struct StreamOrchestrator<E: Emitter> {
    state: SessionState,
    ctx: EventContext,
    emitter: E,
    store: Arc<dyn SessionStore>,
    admission: Arc<AdmissionController>,
    config: OrchestratorConfig,
    detail: ThinkingDetail,
    phase: SessionPhase,
    permit: Option<AdmissionPermit>,
    cancel: Option<CancellationToken>,
    ordering_id: Option<u64>,
    final_snapshot: Option<ResultSnapshot>,
    resources: Vec<Box<dyn SessionResource>>,
    last_cache_write: Instant,
    last_store_write: Instant,
}

impl<E: Emitter> StreamOrchestrator<E> {
    /// Create an orchestrator for a fresh session state
    pub fn new(
        state: SessionState,
        emitter: E,
        store: Arc<dyn SessionStore>,
        admission: Arc<AdmissionController>,
        config: OrchestratorConfig,
    ) -> Self {
        let identity = state.identity();
        let ctx = EventContext::new(
            identity.session_id.clone(),
            identity.conversation_id.clone(),
        );
        let detail =
            ThinkingDetail::for_agent_kind(&identity.agent_kind, &config.slim_thinking_kinds);
        let now = Instant::now();

        Self {
            state,
            ctx,
            emitter,
            store,
            admission,
            config,
            detail,
            phase: SessionPhase::Init,
            permit: None,
            cancel: None,
            ordering_id: None,
            final_snapshot: None,
            resources: Vec::new(),
            last_cache_write: now,
            last_store_write: now,
        }
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Session state (read-only)
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Session ID
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        self.state.session_id()
    }

    /// The emitter
    #[must_use]
    pub fn emitter(&self) -> &E {
        &self.emitter
    }

    /// Whether cancellation has been signaled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Whether an admission slot is held
    #[must_use]
    pub fn holds_admission(&self) -> bool {
        self.permit.is_some()
    }

    /// Attach a sub-resource to disconnect on release
    pub fn attach_resource(&mut self, resource: impl SessionResource + 'static) {
        tracing::debug!(
            session_id = %self.ctx.session_id,
            resource = resource.name(),
            "Resource attached"
        );
        self.resources.push(Box::new(resource));
    }

    fn transition(&mut self, next: SessionPhase) {
        tracing::debug!(
            session_id = %self.ctx.session_id,
            from = ?self.phase,
            to = ?next,
            "Session phase"
        );
        self.phase = next;
    }

    // =========================================================================
    // Entry
    // =========================================================================

    /// Acquire admission and a cancellation token, then emit `start`
    ///
    /// On failure an `error` event has been emitted and nothing is held.
    pub async fn begin(&mut self) -> Result<(), OrchestratorError> {
        if self.phase != SessionPhase::Init {
            return Err(OrchestratorError::InvalidPhase {
                expected: SessionPhase::Init,
                actual: self.phase,
            });
        }

        let acquired = self.admission.acquire(self.config.acquire_timeout).await;
        let permit = match acquired {
            Ok(permit) => permit,
            Err(e) => return Err(self.reject(e.into()).await),
        };

        let registered = self.store.register_session(&self.ctx.session_id).await;
        let token = match registered {
            Ok(token) => token,
            Err(e) => {
                // The slot was ours; hand it back before reporting
                permit.release();
                return Err(self.reject(OrchestratorError::Registration(e)).await);
            }
        };

        self.permit = Some(permit);
        self.cancel = Some(token);
        self.transition(SessionPhase::Acquired);

        self.state.mark_started();
        let now = Instant::now();
        self.last_cache_write = now;
        self.last_store_write = now;

        let agent_kind = self.state.identity().agent_kind.clone();
        self.emitter.emit_start(&self.ctx, &agent_kind).await;
        self.transition(SessionPhase::Streaming);

        tracing::info!(
            session_id = %self.ctx.session_id,
            conversation_id = %self.ctx.conversation_id,
            agent_kind = %agent_kind,
            emitter = self.emitter.name(),
            "Session streaming"
        );
        Ok(())
    }

    async fn reject(&mut self, error: OrchestratorError) -> OrchestratorError {
        tracing::warn!(session_id = %self.ctx.session_id, error = %error, "Session rejected");
        self.emitter.emit_error(&self.ctx, &error.to_string()).await;
        self.transition(SessionPhase::Failed);
        error
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    /// Apply one token
    ///
    /// Returns `false` when streaming must stop: cancellation was observed (and
    /// `cancelled` emitted) or the session is not streaming.
    pub async fn process_token(&mut self, token: &str) -> bool {
        if self.phase != SessionPhase::Streaming {
            return false;
        }
        if self.is_cancelled() {
            self.finish_cancelled().await;
            return false;
        }
        if token.is_empty() {
            return true;
        }

        if let Some(inner) = strip_reasoning(token) {
            self.state.push_reasoning(inner);
            self.emitter
                .emit_reasoning(&self.ctx, inner, self.state.offset())
                .await;
        } else if let Some(before) = self.state.push_text(token) {
            self.emitter.emit_chunk(&self.ctx, token, before).await;
        }

        if let Some(latency) = self.state.record_first_token() {
            tracing::info!(
                session_id = %self.ctx.session_id,
                first_token_ms = latency.as_millis() as u64,
                "First token"
            );
        }

        self.persist_if_due().await;
        true
    }

    /// Open a tool block; the current text block is closed first
    pub async fn open_tool(&mut self, id: &str, tool_name: &str, input: Value) -> bool {
        if self.phase != SessionPhase::Streaming {
            return false;
        }
        let opened = self.state.open_tool(id, tool_name, input);
        if opened {
            tracing::debug!(
                session_id = %self.ctx.session_id,
                tool_id = id,
                tool_name,
                "Tool opened"
            );
            self.persist_if_due().await;
        } else {
            tracing::warn!(
                session_id = %self.ctx.session_id,
                tool_id = id,
                "Duplicate tool invocation ignored"
            );
        }
        opened
    }

    /// Close a tool block by invocation ID
    pub async fn close_tool(&mut self, id: &str, output: Value, status: ToolStatus) -> bool {
        if self.phase != SessionPhase::Streaming {
            return false;
        }
        let closed = self.state.close_tool(id, output, status);
        if closed {
            tracing::debug!(
                session_id = %self.ctx.session_id,
                tool_id = id,
                ?status,
                "Tool closed"
            );
            self.persist_if_due().await;
        } else {
            tracing::warn!(
                session_id = %self.ctx.session_id,
                tool_id = id,
                "Close for unknown tool ignored"
            );
        }
        closed
    }

    /// Add a citation; returns its index when new
    pub fn add_source(
        &mut self,
        source_id: &str,
        title: &str,
        url: Option<String>,
    ) -> Option<usize> {
        if self.phase != SessionPhase::Streaming {
            return None;
        }
        self.state.add_source(source_id, title, url)
    }

    /// Append a thinking step and emit the updated log
    pub async fn push_thinking_step(&mut self, step: ThinkingStep) {
        if self.phase != SessionPhase::Streaming || !self.state.push_thinking_step(step) {
            return;
        }
        let steps = self.state.thinking_view(self.detail);
        self.emitter.emit_thinking(&self.ctx, &steps).await;
    }

    /// Mark the turn as silent
    pub fn mark_silent(&mut self, reason: Option<String>) {
        if self.phase == SessionPhase::Streaming {
            tracing::debug!(
                session_id = %self.ctx.session_id,
                reason = ?reason,
                "Turn marked silent"
            );
            self.state.mark_silent(reason);
        }
    }

    async fn apply(&mut self, event: GenerationEvent) -> bool {
        match event {
            GenerationEvent::Token(token) => return self.process_token(&token).await,
            GenerationEvent::ToolStart { id, name, input } => {
                self.open_tool(&id, &name, input).await;
            }
            GenerationEvent::ToolEnd { id, output, status } => {
                self.close_tool(&id, output, status).await;
            }
            GenerationEvent::Source {
                source_id,
                title,
                url,
            } => {
                self.add_source(&source_id, &title, url);
            }
            GenerationEvent::ThinkingStep(step) => self.push_thinking_step(step).await,
            GenerationEvent::Silent { reason } => self.mark_silent(reason),
        }
        self.phase == SessionPhase::Streaming
    }

    async fn persist_if_due(&mut self) {
        let now = Instant::now();
        let cache_due = now.duration_since(self.last_cache_write) >= self.config.cache_interval;
        let store_due = now.duration_since(self.last_store_write) >= self.config.store_interval;
        if !cache_due && !store_due {
            return;
        }

        let snapshot = self.state.snapshot(self.detail);
        if cache_due {
            self.last_cache_write = now;
            if let Err(e) = self.store.save_snapshot(&self.ctx.session_id, &snapshot).await {
                tracing::warn!(
                    session_id = %self.ctx.session_id,
                    error = %e,
                    "Snapshot cache write failed"
                );
            }
        }
        if store_due {
            self.last_store_write = now;
            if let Err(e) = self
                .store
                .update_authoritative_status(
                    &self.ctx.session_id,
                    SessionStatus::Streaming,
                    Some(&snapshot),
                    None,
                )
                .await
            {
                tracing::warn!(
                    session_id = %self.ctx.session_id,
                    error = %e,
                    "Authoritative progress write failed"
                );
            }
        }
    }

    // =========================================================================
    // Terminal outcomes
    // =========================================================================

    async fn ordering_id(&mut self) -> Option<u64> {
        if self.ordering_id.is_none() {
            match self.store.get_ordering_id(&self.ctx.session_id).await {
                Ok(id) => self.ordering_id = Some(id),
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.ctx.session_id,
                        error = %e,
                        "Ordering ID unavailable"
                    );
                }
            }
        }
        self.ordering_id
    }

    /// Persist the terminal record and notify waiters; failures are logged
    async fn persist_terminal(
        &mut self,
        status: SessionStatus,
        snapshot: &ResultSnapshot,
        error: Option<&str>,
    ) {
        let id = &self.ctx.session_id;
        if let Err(e) = self
            .store
            .update_authoritative_status(id, status, Some(snapshot), error)
            .await
        {
            tracing::warn!(session_id = %id, ?status, error = %e, "Final status write failed");
        }
        if let Err(e) = self.store.publish_done(id, snapshot).await {
            tracing::warn!(session_id = %id, error = %e, "Done notification failed");
        }
        if let Err(e) = self.store.delete_snapshot(id).await {
            tracing::warn!(session_id = %id, error = %e, "Snapshot cleanup failed");
        }
    }

    fn settled_snapshot(&self) -> ResultSnapshot {
        self.final_snapshot
            .clone()
            .unwrap_or_else(|| self.state.snapshot(self.detail))
    }

    /// Close the session successfully and emit `done`
    ///
    /// Only the first terminal call has effect; later calls return the settled
    /// result without emitting anything.
    pub async fn finalize(&mut self) -> ResultSnapshot {
        if self.phase != SessionPhase::Streaming {
            tracing::debug!(
                session_id = %self.ctx.session_id,
                phase = ?self.phase,
                "Finalize skipped"
            );
            return self.settled_snapshot();
        }

        self.state.finalize();
        let snapshot = self.state.snapshot(self.detail);
        let ordering_id = self.ordering_id().await;

        self.persist_terminal(SessionStatus::Completed, &snapshot, None).await;
        self.emitter
            .emit_done(&self.ctx, &snapshot, ordering_id, None)
            .await;
        self.transition(SessionPhase::Completed);

        tracing::info!(
            session_id = %self.ctx.session_id,
            chars = self.state.offset(),
            blocks = self.state.blocks().len(),
            sources = self.state.sources().len(),
            silent = self.state.is_silent(),
            ordering_id = ?ordering_id,
            "Session completed"
        );
        self.final_snapshot = Some(snapshot.clone());
        snapshot
    }

    async fn finish_cancelled(&mut self) -> ResultSnapshot {
        if self.phase != SessionPhase::Streaming {
            return self.settled_snapshot();
        }

        self.state.finalize();
        let snapshot = self.state.snapshot(self.detail);
        let ordering_id = self.ordering_id().await;

        self.persist_terminal(SessionStatus::Cancelled, &snapshot, None).await;
        self.emitter
            .emit_cancelled(&self.ctx, Some(&snapshot), ordering_id)
            .await;
        self.transition(SessionPhase::Cancelled);

        tracing::info!(
            session_id = %self.ctx.session_id,
            chars = self.state.offset(),
            "Session cancelled"
        );
        self.final_snapshot = Some(snapshot.clone());
        snapshot
    }

    /// Report a generation failure
    ///
    /// Emits `error`, then a `done` carrying the partial result and the error
    /// text, and records the failure. Never propagates.
    pub async fn handle_error(&mut self, error: &anyhow::Error) -> ResultSnapshot {
        let message = format!("{error:#}");
        if self.phase != SessionPhase::Streaming {
            tracing::warn!(
                session_id = %self.ctx.session_id,
                phase = ?self.phase,
                error = %message,
                "Error after session settled"
            );
            return self.settled_snapshot();
        }

        tracing::error!(session_id = %self.ctx.session_id, error = %message, "Generation failed");
        self.emitter.emit_error(&self.ctx, &message).await;

        self.state.finalize();
        let mut snapshot = self.state.snapshot(self.detail);
        snapshot.error = Some(message.clone());
        let ordering_id = self.ordering_id().await;

        self.persist_terminal(SessionStatus::Failed, &snapshot, Some(&message))
            .await;
        self.emitter
            .emit_done(&self.ctx, &snapshot, ordering_id, Some(&message))
            .await;
        self.transition(SessionPhase::Failed);

        self.final_snapshot = Some(snapshot.clone());
        snapshot
    }

    /// Unregister, disconnect sub-resources and return the admission slot
    ///
    /// Cleanup failures are logged only. The slot is returned exactly once; a
    /// dropped orchestrator returns it too.
    pub async fn release_resources(&mut self) {
        if self.phase == SessionPhase::Released {
            return;
        }
        let session_id = self.ctx.session_id.clone();

        if self.cancel.take().is_some() {
            if let Err(e) = self.store.unregister_session(&session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "Unregister failed");
            }
        }

        for resource in self.resources.drain(..) {
            if let Err(e) = resource.disconnect().await {
                tracing::warn!(
                    session_id = %session_id,
                    resource = resource.name(),
                    error = %e,
                    "Resource disconnect failed"
                );
            }
        }

        if let Some(permit) = self.permit.take() {
            permit.release();
        }
        self.transition(SessionPhase::Released);
    }

    // =========================================================================
    // Driver
    // =========================================================================

    /// Run the full lifecycle over a generation source
    pub async fn run<S>(mut self, mut source: S) -> SessionOutcome
    where
        S: Stream<Item = anyhow::Result<GenerationEvent>> + Unpin + Send,
    {
        if let Err(e) = self.begin().await {
            self.release_resources().await;
            return SessionOutcome::Rejected(e);
        }
        let token = self.cancel.clone().unwrap_or_default();

        let outcome = loop {
            let step = tokio::select! {
                biased;
                () = token.cancelled() => Step::Cancelled,
                next = source.next() => Step::Next(next),
            };

            match step {
                Step::Cancelled => break SessionOutcome::Cancelled(self.finish_cancelled().await),
                Step::Next(None) => break SessionOutcome::Completed(self.finalize().await),
                Step::Next(Some(Err(e))) => {
                    let partial = self.handle_error(&e).await;
                    break SessionOutcome::Failed {
                        error: format!("{e:#}"),
                        partial,
                    };
                }
                Step::Next(Some(Ok(event))) => {
                    if !self.apply(event).await {
                        break SessionOutcome::Cancelled(self.settled_snapshot());
                    }
                }
            }
        };

        self.release_resources().await;
        outcome
    }
}

impl<E: Emitter> Drop for StreamOrchestrator<E> {
    fn drop(&mut self) {
        if self.permit.is_some() {
            tracing::warn!(
                session_id = %self.ctx.session_id,
                phase = ?self.phase,
                "Orchestrator dropped without release; returning admission slot"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{StreamEvent, StreamEventKind};
    use crate::session::{Block, BlockStatus, SessionIdentity};
    use crate::storage::InMemoryStore;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<StreamEvent>>,
    }

    impl Recorder {
        fn kinds(&self) -> Vec<StreamEventKind> {
            self.events.lock().iter().map(|e| e.kind).collect()
        }

        fn last(&self) -> StreamEvent {
            self.events.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Emitter for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn emit(&self, event: StreamEvent) {
            self.events.lock().push(event);
        }
    }

    /// Store whose every call fails, optionally including registration
    struct BrokenStore {
        reject_registration: bool,
    }

    #[async_trait]
    impl SessionStore for BrokenStore {
        async fn register_session(&self, id: &SessionId) -> Result<CancellationToken, StoreError> {
            if self.reject_registration {
                Err(StoreError::Backend(format!("cannot register {id}")))
            } else {
                Ok(CancellationToken::new())
            }
        }
        async fn unregister_session(&self, _: &SessionId) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn save_snapshot(&self, _: &SessionId, _: &ResultSnapshot) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn delete_snapshot(&self, _: &SessionId) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn get_ordering_id(&self, _: &SessionId) -> Result<u64, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn publish_done(&self, _: &SessionId, _: &ResultSnapshot) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn update_authoritative_status(
            &self,
            _: &SessionId,
            _: SessionStatus,
            _: Option<&ResultSnapshot>,
            _: Option<&str>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
    }

    struct CountingResource {
        disconnects: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl SessionResource for CountingResource {
        fn name(&self) -> &str {
            "tool-client"
        }

        async fn disconnect(&self) -> anyhow::Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("socket already closed");
            }
            Ok(())
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        admission: Arc<AdmissionController>,
        recorder: Arc<Recorder>,
    }

    impl Harness {
        fn new(capacity: usize) -> Self {
            Self {
                store: Arc::new(InMemoryStore::new()),
                admission: Arc::new(AdmissionController::new(capacity)),
                recorder: Arc::new(Recorder::default()),
            }
        }

        fn orchestrator(
            &self,
            session: &str,
            agent_kind: &str,
        ) -> StreamOrchestrator<Arc<Recorder>> {
            let state =
                SessionState::new(SessionIdentity::new(session, "conv-1", "user-1", agent_kind));
            StreamOrchestrator::new(
                state,
                Arc::clone(&self.recorder),
                self.store.clone(),
                Arc::clone(&self.admission),
                OrchestratorConfig {
                    acquire_timeout: Duration::from_millis(20),
                    ..OrchestratorConfig::default()
                },
            )
        }
    }

    #[tokio::test]
    async fn test_plain_tokens_complete() {
        let h = Harness::new(1);
        let mut orch = h.orchestrator("s-1", "Code");

        orch.begin().await.unwrap();
        assert!(orch.process_token("Hello").await);
        assert!(orch.process_token(" world").await);
        let snapshot = orch.finalize().await;
        orch.release_resources().await;

        assert_eq!(snapshot.value, "Hello world");
        assert_eq!(orch.state().offset(), 11);
        match snapshot.blocks.as_slice() {
            [Block::Text(text)] => {
                assert_eq!(text.content, "Hello world");
                assert_eq!(text.status, BlockStatus::Done);
            }
            other => panic!("unexpected blocks: {other:?}"),
        }

        assert_eq!(
            h.recorder.kinds(),
            vec![
                StreamEventKind::Start,
                StreamEventKind::Chunk,
                StreamEventKind::Chunk,
                StreamEventKind::Done
            ]
        );
        let events = h.recorder.events.lock().clone();
        assert_eq!(events[1].offset, Some(0));
        assert_eq!(events[2].offset, Some(5));
        assert!(events[3].ordering_id.is_some());

        let record = h.store.record(&SessionId::from("s-1")).unwrap();
        assert_eq!(record.status, SessionStatus::Completed);
        assert_eq!(h.store.done_notices().len(), 1);
        assert!(h.store.snapshot(&SessionId::from("s-1")).is_none());
    }

    #[tokio::test]
    async fn test_cancel_after_first_token() {
        let h = Harness::new(1);
        let mut orch = h.orchestrator("s-1", "Chat");
        orch.begin().await.unwrap();

        assert!(orch.process_token("Hello").await);
        assert!(h.store.cancel(&SessionId::from("s-1")));
        assert!(!orch.process_token(" world").await);
        orch.release_resources().await;

        assert_eq!(orch.phase(), SessionPhase::Released);
        assert_eq!(
            h.recorder.kinds(),
            vec![StreamEventKind::Start, StreamEventKind::Chunk, StreamEventKind::Cancelled]
        );
        let cancelled = h.recorder.last();
        assert_eq!(cancelled.snapshot().unwrap().value, "Hello");

        let record = h.store.record(&SessionId::from("s-1")).unwrap();
        assert_eq!(record.status, SessionStatus::Cancelled);
        assert_eq!(record.result.unwrap().value, "Hello");
        assert!(!h.store.is_registered(&SessionId::from("s-1")));
    }

    #[tokio::test]
    async fn test_tool_closes_text_block() {
        let h = Harness::new(1);
        let mut orch = h.orchestrator("s-1", "Code");
        orch.begin().await.unwrap();

        orch.process_token("Thinking...").await;
        assert!(orch.open_tool("call-1", "query_db", json!({"sql": "select 1"})).await);
        assert!(orch.close_tool("call-1", json!({"rows": 3}), ToolStatus::Done).await);
        let snapshot = orch.finalize().await;

        match snapshot.blocks.as_slice() {
            [Block::Text(text), Block::Tool(tool)] => {
                assert_eq!(text.content, "Thinking...");
                assert_eq!(text.status, BlockStatus::Done);
                assert_eq!(tool.tool_name, "query_db");
                assert_eq!(tool.output, Some(json!({"rows": 3})));
                assert_eq!(tool.status, ToolStatus::Done);
            }
            other => panic!("unexpected blocks: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unclosed_tool_left_pending() {
        let h = Harness::new(1);
        let mut orch = h.orchestrator("s-1", "Code");
        orch.begin().await.unwrap();

        orch.open_tool("call-1", "search", json!({})).await;
        assert!(!orch.close_tool("call-2", json!(null), ToolStatus::Error).await);
        let snapshot = orch.finalize().await;

        match snapshot.blocks.as_slice() {
            [Block::Tool(tool)] => assert_eq!(tool.status, ToolStatus::Pending),
            other => panic!("unexpected blocks: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_admission_timeout_emits_overload_error() {
        let h = Harness::new(1);
        let _held = h.admission.try_acquire().unwrap();

        let mut orch = h.orchestrator("s-1", "Chat");
        let err = orch.begin().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Admission(AdmissionError::Timeout(_))));

        assert_eq!(h.recorder.kinds(), vec![StreamEventKind::Error]);
        assert!(h.recorder.last().error.unwrap().contains("overloaded"));
        assert!(!h.store.is_registered(&SessionId::from("s-1")));

        orch.release_resources().await;
        // The held slot is the only one ever acquired and nothing was released
        assert_eq!(h.admission.stats().released, 0);
        assert_eq!(h.admission.stats().acquired, 1);
    }

    #[tokio::test]
    async fn test_reasoning_token_never_reaches_text() {
        let h = Harness::new(1);
        let mut orch = h.orchestrator("s-1", "Chat");
        orch.begin().await.unwrap();

        let token = format!("{REASONING_START}note{REASONING_END}");
        assert!(orch.process_token(&token).await);

        assert_eq!(orch.state().reasoning(), "note");
        assert_eq!(orch.state().text(), "");
        assert!(orch.state().blocks().is_empty());

        let event = h.recorder.last();
        assert_eq!(event.kind, StreamEventKind::Chunk);
        assert_eq!(event.reasoning_chunk(), Some("note"));
        assert_eq!(event.content.as_deref(), Some(""));

        let snapshot = orch.finalize().await;
        assert_eq!(snapshot.reasoning_content.as_deref(), Some("note"));
        assert_eq!(snapshot.value, "");
    }

    #[test]
    fn test_strip_reasoning_requires_both_markers() {
        assert_eq!(strip_reasoning("__REASONING__a__END_REASONING__"), Some("a"));
        assert_eq!(strip_reasoning("__REASONING__a"), None);
        assert_eq!(strip_reasoning("a__END_REASONING__"), None);
    }

    #[tokio::test]
    async fn test_registration_failure_returns_slot() {
        let admission = Arc::new(AdmissionController::new(1));
        let recorder = Arc::new(Recorder::default());
        let state = SessionState::new(SessionIdentity::new("s-1", "c", "u", "Chat"));
        let mut orch = StreamOrchestrator::new(
            state,
            Arc::clone(&recorder),
            Arc::new(BrokenStore { reject_registration: true }),
            Arc::clone(&admission),
            OrchestratorConfig::default(),
        );

        let err = orch.begin().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Registration(_)));
        assert_eq!(recorder.kinds(), vec![StreamEventKind::Error]);
        assert!(!orch.holds_admission());
        assert_eq!(admission.available(), 1);
        assert_eq!(admission.stats().released, 1);
    }

    #[tokio::test]
    async fn test_storage_failures_do_not_stop_streaming() {
        let admission = Arc::new(AdmissionController::new(1));
        let recorder = Arc::new(Recorder::default());
        let state = SessionState::new(SessionIdentity::new("s-1", "c", "u", "Chat"));
        let mut orch = StreamOrchestrator::new(
            state,
            Arc::clone(&recorder),
            Arc::new(BrokenStore { reject_registration: false }),
            Arc::clone(&admission),
            OrchestratorConfig {
                cache_interval: Duration::ZERO,
                store_interval: Duration::ZERO,
                ..OrchestratorConfig::default()
            },
        );

        orch.begin().await.unwrap();
        assert!(orch.process_token("still ").await);
        assert!(orch.process_token("here").await);
        let snapshot = orch.finalize().await;
        orch.release_resources().await;

        assert_eq!(snapshot.value, "still here");
        let done = recorder.last();
        assert_eq!(done.kind, StreamEventKind::Done);
        assert_eq!(done.ordering_id, None);
        assert_eq!(admission.stats().released, 1);
    }

    #[tokio::test]
    async fn test_interval_persistence_overwrites_snapshot() {
        let h = Harness::new(1);
        let state = SessionState::new(SessionIdentity::new("s-1", "c", "u", "Chat"));
        let mut orch = StreamOrchestrator::new(
            state,
            Arc::clone(&h.recorder),
            h.store.clone(),
            Arc::clone(&h.admission),
            OrchestratorConfig {
                cache_interval: Duration::ZERO,
                store_interval: Duration::from_secs(3600),
                ..OrchestratorConfig::default()
            },
        );
        orch.begin().await.unwrap();

        orch.process_token("a").await;
        orch.process_token("b").await;
        let id = SessionId::from("s-1");
        assert_eq!(h.store.snapshot(&id).unwrap().value, "ab");
        // Store interval not reached yet
        assert!(h.store.record(&id).is_none());
    }

    #[tokio::test]
    async fn test_error_emits_error_then_done() {
        let h = Harness::new(1);
        let mut orch = h.orchestrator("s-1", "Chat");
        orch.begin().await.unwrap();
        orch.process_token("partial").await;

        let partial = orch
            .handle_error(&anyhow::anyhow!("upstream reset").context("generation failed"))
            .await;
        // A second terminal attempt changes nothing
        orch.finalize().await;
        orch.release_resources().await;

        assert_eq!(partial.value, "partial");
        assert_eq!(
            h.recorder.kinds(),
            vec![
                StreamEventKind::Start,
                StreamEventKind::Chunk,
                StreamEventKind::Error,
                StreamEventKind::Done
            ]
        );
        let done = h.recorder.last();
        assert_eq!(done.error.as_deref(), Some("generation failed: upstream reset"));
        assert_eq!(done.snapshot().unwrap().value, "partial");

        let record = h.store.record(&SessionId::from("s-1")).unwrap();
        assert_eq!(record.status, SessionStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("generation failed: upstream reset"));
    }

    #[tokio::test]
    async fn test_thinking_steps_slimmed_for_chat() {
        let h = Harness::new(1);
        let mut orch = h.orchestrator("s-1", "chat");
        orch.begin().await.unwrap();

        orch.push_thinking_step(ThinkingStep::new("Searching").with_details(json!({"q": "rust"})))
            .await;
        let event = h.recorder.last();
        assert_eq!(event.kind, StreamEventKind::Thinking);

        let snapshot = orch.finalize().await;
        assert_eq!(snapshot.thinking.len(), 1);
        assert_eq!(snapshot.thinking[0].details, None);
        assert_eq!(orch.state().thinking_steps()[0].details, Some(json!({"q": "rust"})));
    }

    #[tokio::test]
    async fn test_sources_silent_and_resources() {
        let h = Harness::new(1);
        let mut orch = h.orchestrator("s-1", "Code");
        let disconnects = Arc::new(AtomicUsize::new(0));
        orch.attach_resource(CountingResource {
            disconnects: Arc::clone(&disconnects),
            fail: true,
        });
        orch.attach_resource(CountingResource {
            disconnects: Arc::clone(&disconnects),
            fail: false,
        });
        orch.begin().await.unwrap();

        assert_eq!(orch.add_source("doc-1", "Guide", None), Some(1));
        assert_eq!(orch.add_source("doc-1", "Guide", None), None);
        assert_eq!(orch.add_source("doc-2", "FAQ", Some("https://example.test".into())), Some(2));
        orch.mark_silent(Some("handled by bot".into()));

        let snapshot = orch.finalize().await;
        orch.release_resources().await;
        orch.release_resources().await;

        assert_eq!(snapshot.sources.len(), 2);
        assert!(snapshot.silent);
        assert_eq!(snapshot.silent_reason.as_deref(), Some("handled by bot"));
        // Both disconnected once, despite the first failing
        assert_eq!(disconnects.load(Ordering::SeqCst), 2);
        assert_eq!(h.admission.stats().released, 1);
    }

    #[tokio::test]
    async fn test_run_drives_full_lifecycle() {
        let h = Harness::new(1);
        let orch = h.orchestrator("s-1", "Code");

        let source = futures::stream::iter(vec![
            Ok(GenerationEvent::token("Hi")),
            Ok(GenerationEvent::ToolStart {
                id: "t1".into(),
                name: "calc".into(),
                input: json!({"expr": "1+1"}),
            }),
            Ok(GenerationEvent::ToolEnd {
                id: "t1".into(),
                output: json!(2),
                status: ToolStatus::Done,
            }),
            Ok(GenerationEvent::token(" done")),
        ]);

        let outcome = orch.run(source).await;
        let SessionOutcome::Completed(snapshot) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(snapshot.value, "Hi done");
        assert_eq!(snapshot.blocks.len(), 3);
        assert_eq!(h.admission.stats().released, 1);
        assert_eq!(h.recorder.kinds().last(), Some(&StreamEventKind::Done));
    }

    #[tokio::test]
    async fn test_run_source_error_fails_session() {
        let h = Harness::new(1);
        let orch = h.orchestrator("s-1", "Code");
        let source = futures::stream::iter(vec![
            Ok(GenerationEvent::token("x")),
            Err(anyhow::anyhow!("model crashed")),
            Ok(GenerationEvent::token("never")),
        ]);

        match orch.run(source).await {
            SessionOutcome::Failed { error, partial } => {
                assert_eq!(error, "model crashed");
                assert_eq!(partial.value, "x");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(h.admission.stats().released, 1);
    }

    #[tokio::test]
    async fn test_run_cancelled_while_waiting_for_source() {
        let h = Harness::new(1);
        let orch = h.orchestrator("s-1", "Code");
        let (tx, rx) = tokio::sync::mpsc::channel::<anyhow::Result<GenerationEvent>>(4);
        let source = tokio_stream::wrappers::ReceiverStream::new(rx);

        let store = h.store.clone();
        let running = tokio::spawn(orch.run(source));

        tx.send(Ok(GenerationEvent::token("Hello"))).await.unwrap();
        let id = SessionId::from("s-1");
        tokio::time::timeout(Duration::from_secs(1), async {
            while !store.is_registered(&id) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.cancel(&id));

        let outcome = running.await.unwrap();
        let SessionOutcome::Cancelled(partial) = outcome else {
            panic!("expected cancellation, got {outcome:?}");
        };
        assert_eq!(partial.value, "Hello");
        assert_eq!(h.recorder.kinds().last(), Some(&StreamEventKind::Cancelled));
        assert_eq!(h.admission.stats().released, 1);
        drop(tx);
    }

    #[tokio::test]
    async fn test_run_rejected_at_capacity() {
        let h = Harness::new(1);
        let _held = h.admission.try_acquire().unwrap();
        let orch = h.orchestrator("s-1", "Code");

        let outcome = orch.run(futures::stream::empty()).await;
        assert!(matches!(outcome, SessionOutcome::Rejected(OrchestratorError::Admission(_))));
        assert!(outcome.snapshot().is_none());
        assert_eq!(h.recorder.kinds(), vec![StreamEventKind::Error]);
    }
}
