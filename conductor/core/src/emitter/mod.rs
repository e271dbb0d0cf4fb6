//! Emitters
//!
//! Transport-specific sinks that turn [`StreamEvent`]s into bytes or messages.
//!
//! | Emitter | Destination |
//! |---------|-------------|
//! | [`SseEmitter`] | Line-delimited `data:` frames on an in-memory queue drained by an HTTP stream |
//! | [`RoomEmitter`] | A push room keyed by conversation, observed by every subscriber |
//! | [`RelayEmitter`] | A per-session relay channel, re-emitted by a bridge in another process |
//! | [`NoopEmitter`] | Nothing (delivery handled elsewhere) |
//!
//! # Contract
//!
//! Emit calls never fail into the orchestrator. A destination without an active
//! listener drops the event silently; serialization or send failures are logged.
//! Implementors provide [`Emitter::emit`]; the per-kind methods build the event
//! and forward to it, and may be overridden where a wire format differs.

mod noop;
mod relay;
mod room;
mod sse;

pub use noop::NoopEmitter;
pub use relay::RelayEmitter;
pub use room::{RoomEmitter, RoomHub};
pub use sse::{format_sse_frame, parse_sse_frame, SseEmitter, SseStream, SSE_DATA_PREFIX};

use std::sync::Arc;

use async_trait::async_trait;

use crate::events::{EventContext, StreamEvent};
use crate::session::{ResultSnapshot, ThinkingStep};

/// A destination for stream events
#[async_trait]
pub trait Emitter: Send + Sync {
    /// Emitter name for logs
    fn name(&self) -> &str;

    /// Deliver one event
    async fn emit(&self, event: StreamEvent);

    /// Session entered streaming
    async fn emit_start(&self, ctx: &EventContext, agent_kind: &str) {
        self.emit(StreamEvent::start(ctx, agent_kind)).await;
    }

    /// Text chunk; `offset` is the offset before this chunk
    async fn emit_chunk(&self, ctx: &EventContext, content: &str, offset: usize) {
        self.emit(StreamEvent::chunk(ctx, content, offset)).await;
    }

    /// Reasoning chunk
    async fn emit_reasoning(&self, ctx: &EventContext, text: &str, offset: usize) {
        self.emit(StreamEvent::reasoning(ctx, text, offset)).await;
    }

    /// Terminal done event
    async fn emit_done(
        &self,
        ctx: &EventContext,
        result: &ResultSnapshot,
        ordering_id: Option<u64>,
        error: Option<&str>,
    ) {
        self.emit(StreamEvent::done(ctx, result, ordering_id, error)).await;
    }

    /// Error event
    async fn emit_error(&self, ctx: &EventContext, error: &str) {
        self.emit(StreamEvent::error(ctx, error)).await;
    }

    /// Terminal cancellation event
    async fn emit_cancelled(
        &self,
        ctx: &EventContext,
        partial: Option<&ResultSnapshot>,
        ordering_id: Option<u64>,
    ) {
        self.emit(StreamEvent::cancelled(ctx, partial, ordering_id)).await;
    }

    /// Thinking log update
    async fn emit_thinking(&self, ctx: &EventContext, steps: &[ThinkingStep]) {
        self.emit(StreamEvent::thinking(ctx, steps)).await;
    }
}

#[async_trait]
impl<E: Emitter + ?Sized> Emitter for Arc<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn emit(&self, event: StreamEvent) {
        (**self).emit(event).await;
    }

    async fn emit_start(&self, ctx: &EventContext, agent_kind: &str) {
        (**self).emit_start(ctx, agent_kind).await;
    }

    async fn emit_chunk(&self, ctx: &EventContext, content: &str, offset: usize) {
        (**self).emit_chunk(ctx, content, offset).await;
    }

    async fn emit_reasoning(&self, ctx: &EventContext, text: &str, offset: usize) {
        (**self).emit_reasoning(ctx, text, offset).await;
    }

    async fn emit_done(
        &self,
        ctx: &EventContext,
        result: &ResultSnapshot,
        ordering_id: Option<u64>,
        error: Option<&str>,
    ) {
        (**self).emit_done(ctx, result, ordering_id, error).await;
    }

    async fn emit_error(&self, ctx: &EventContext, error: &str) {
        (**self).emit_error(ctx, error).await;
    }

    async fn emit_cancelled(
        &self,
        ctx: &EventContext,
        partial: Option<&ResultSnapshot>,
        ordering_id: Option<u64>,
    ) {
        (**self).emit_cancelled(ctx, partial, ordering_id).await;
    }

    async fn emit_thinking(&self, ctx: &EventContext, steps: &[ThinkingStep]) {
        (**self).emit_thinking(ctx, steps).await;
    }
}

/// Sends every event to several emitters, in order
#[derive(Default)]
pub struct FanoutEmitter {
    targets: Vec<Box<dyn Emitter>>,
}

impl FanoutEmitter {
    /// Create an empty fan-out
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a target
    #[must_use]
    pub fn with(mut self, emitter: impl Emitter + 'static) -> Self {
        self.targets.push(Box::new(emitter));
        self
    }

    /// Number of targets
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether there are no targets
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[async_trait]
impl Emitter for FanoutEmitter {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn emit(&self, event: StreamEvent) {
        for target in &self.targets {
            target.emit(event.clone()).await;
        }
    }

    async fn emit_start(&self, ctx: &EventContext, agent_kind: &str) {
        for target in &self.targets {
            target.emit_start(ctx, agent_kind).await;
        }
    }
}
