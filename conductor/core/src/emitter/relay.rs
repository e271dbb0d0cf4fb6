//! Relay-publish emitter
//!
//! Publishes each event onto the session's relay channel. A bridge in the
//! process terminating client connections subscribes to the channel and
//! re-emits to live push rooms.

use std::sync::Arc;

use async_trait::async_trait;

use super::Emitter;
use crate::events::StreamEvent;
use crate::relay::{relay_channel, Relay};
use crate::session::SessionId;

/// Emitter publishing to a relay channel
pub struct RelayEmitter {
    relay: Arc<dyn Relay>,
    channel: String,
}

impl RelayEmitter {
    /// Publish to an explicit channel
    pub fn new(relay: Arc<dyn Relay>, channel: impl Into<String>) -> Self {
        Self {
            relay,
            channel: channel.into(),
        }
    }

    /// Publish to the channel of a session
    pub fn for_session(relay: Arc<dyn Relay>, prefix: &str, session_id: &SessionId) -> Self {
        Self::new(relay, relay_channel(prefix, session_id))
    }

    /// Channel name
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl Emitter for RelayEmitter {
    fn name(&self) -> &str {
        "relay"
    }

    async fn emit(&self, event: StreamEvent) {
        if let Err(e) = self.relay.publish(&self.channel, &event).await {
            tracing::warn!(
                channel = %self.channel,
                kind = ?event.kind,
                error = %e,
                "Relay publish failed"
            );
        }
    }
}
