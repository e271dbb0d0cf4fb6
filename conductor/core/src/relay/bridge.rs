//! Relay Bridge
//!
//! Runs in the process that terminates client connections. For each session it
//! subscribes to the session's relay channel and re-emits every event to the
//! push room of the session's conversation, stopping after the terminal event.
//! An `error` before any `start` is a rejection at admission and is terminal
//! too: nothing else follows it on the channel.

use std::sync::Arc;

use tokio::task::JoinHandle;

use super::{relay_channel, Relay, RelayError};
use crate::emitter::RoomHub;
use crate::events::StreamEventKind;
use crate::session::{ConversationId, SessionId};

/// Forwards relay channels into push rooms
pub struct RelayBridge {
    relay: Arc<dyn Relay>,
    hub: Arc<RoomHub>,
    prefix: String,
}

impl RelayBridge {
    /// Create a bridge
    pub fn new(relay: Arc<dyn Relay>, hub: Arc<RoomHub>, prefix: impl Into<String>) -> Self {
        Self {
            relay,
            hub,
            prefix: prefix.into(),
        }
    }

    /// Start forwarding one session
    ///
    /// The subscription is in place when this returns, so the session may start
    /// publishing immediately. The task yields the number of forwarded events.
    pub async fn bridge_session(
        &self,
        session_id: &SessionId,
        room: ConversationId,
    ) -> Result<JoinHandle<usize>, RelayError> {
        let channel = relay_channel(&self.prefix, session_id);
        let mut subscription = self.relay.subscribe(&channel).await?;
        let hub = Arc::clone(&self.hub);
        let session_id = session_id.clone();

        tracing::debug!(session_id = %session_id, room = %room, channel, "Bridging session");

        Ok(tokio::spawn(async move {
            let mut forwarded = 0;
            let mut started = false;
            while let Some(event) = subscription.recv().await {
                started |= event.kind == StreamEventKind::Start;
                let terminal = event.kind.is_terminal()
                    || (!started && event.kind == StreamEventKind::Error);
                hub.publish(&room, event);
                forwarded += 1;
                if terminal {
                    break;
                }
            }
            tracing::debug!(session_id = %session_id, forwarded, "Bridge finished");
            forwarded
        }))
    }
}
