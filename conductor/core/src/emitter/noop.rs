//! No-op emitter
//!
//! For sessions whose delivery is handled entirely by other means (e.g. an
//! external bridge already wired to the same source).

use async_trait::async_trait;

use super::Emitter;
use crate::events::StreamEvent;

/// Emitter that drops every event
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEmitter;

#[async_trait]
impl Emitter for NoopEmitter {
    fn name(&self) -> &str {
        "noop"
    }

    async fn emit(&self, _event: StreamEvent) {}
}
