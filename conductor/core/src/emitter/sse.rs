//! Unidirectional stream emitter
//!
//! Each event becomes one `data: {json}\n\n` frame pushed onto a bounded queue.
//! The HTTP layer drains the queue (as a `Stream` of frames) into the response
//! body. A full queue applies backpressure to the orchestrator; a dropped
//! receiver means the client went away and frames are discarded.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::Emitter;
use crate::events::{EventContext, StreamEvent};

/// Prefix of every frame
pub const SSE_DATA_PREFIX: &str = "data: ";

/// Frames as drained by the transport layer
pub type SseStream = ReceiverStream<String>;

/// Format an event as a single frame
pub fn format_sse_frame(event: &StreamEvent) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(event)?;
    Ok(format!("{SSE_DATA_PREFIX}{json}\n\n"))
}

/// Parse a frame produced by [`format_sse_frame`]
#[must_use]
pub fn parse_sse_frame(frame: &str) -> Option<StreamEvent> {
    let payload = frame.trim_end().strip_prefix(SSE_DATA_PREFIX)?;
    serde_json::from_str(payload).ok()
}

/// Emitter writing frames to an in-memory queue
#[derive(Clone)]
pub struct SseEmitter {
    tx: mpsc::Sender<String>,
}

impl SseEmitter {
    /// Create an emitter and the stream its frames come out of
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, SseStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, ReceiverStream::new(rx))
    }

    /// Whether the receiving side is gone
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl Emitter for SseEmitter {
    fn name(&self) -> &str {
        "sse"
    }

    async fn emit(&self, event: StreamEvent) {
        let frame = match format_sse_frame(&event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, kind = ?event.kind, "Failed to serialize stream event");
                return;
            }
        };

        if self.tx.send(frame).await.is_err() {
            tracing::debug!(
                session_id = %event.session_id,
                kind = ?event.kind,
                "SSE receiver gone, dropping frame"
            );
        }
    }

    // The wire format needs no explicit start framing
    async fn emit_start(&self, _ctx: &EventContext, _agent_kind: &str) {}
}
