//! Message Relay
//!
//! Per-session pub/sub channels that carry [`StreamEvent`]s between the process
//! running an orchestrator and the process terminating client connections.
//!
//! ```text
//! Orchestrator ──RelayEmitter──► relay channel "stream:{session}" ──► RelayBridge ──► RoomHub
//! ```
//!
//! Two implementations:
//! - [`InMemoryRelay`]: both sides in one process (embedding, tests)
//! - `UnixSocketRelay` (see [`crate::transport`]): a client of the `stream-relayd` hub
//!
//! Events published on one channel reach every subscriber of that channel in
//! publish order. Publishing to a channel nobody subscribes to is not an error.

mod bridge;

pub use bridge::RelayBridge;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::events::StreamEvent;
use crate::session::SessionId;
use crate::transport::TransportError;

/// Default per-subscription buffer
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 256;

/// Errors from relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// Underlying transport failed
    #[error("Relay transport error: {0}")]
    Transport(#[from] TransportError),
    /// The relay connection is gone
    #[error("Relay is closed")]
    Closed,
    /// The hub did not answer in time
    #[error("Relay timed out: {0}")]
    Timeout(String),
}

/// Channel name for a session
#[must_use]
pub fn relay_channel(prefix: &str, session_id: &SessionId) -> String {
    format!("{prefix}{session_id}")
}

/// A cross-process message relay
#[async_trait]
pub trait Relay: Send + Sync {
    /// Publish an event on a channel
    async fn publish(&self, channel: &str, event: &StreamEvent) -> Result<(), RelayError>;

    /// Subscribe to a channel
    ///
    /// Once this returns, every event published afterwards on the channel is
    /// delivered to the subscription.
    async fn subscribe(&self, channel: &str) -> Result<RelaySubscription, RelayError>;
}

/// Receiving end of a channel subscription
///
/// Dropping it unsubscribes.
#[derive(Debug)]
pub struct RelaySubscription {
    channel: String,
    rx: mpsc::Receiver<StreamEvent>,
}

impl RelaySubscription {
    pub(crate) fn new(channel: impl Into<String>, rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    /// Channel this subscription listens on
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next event, or `None` once the relay side is gone
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

/// In-process relay
pub struct InMemoryRelay {
    channels: DashMap<String, Vec<mpsc::Sender<StreamEvent>>>,
    capacity: usize,
}

impl Default for InMemoryRelay {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIPTION_CAPACITY)
    }
}

impl InMemoryRelay {
    /// Create a relay whose subscriptions buffer up to `capacity` events
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Live subscriptions on a channel
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }
}

#[async_trait]
impl Relay for InMemoryRelay {
    async fn publish(&self, channel: &str, event: &StreamEvent) -> Result<(), RelayError> {
        // Clone senders out so no map guard is held across an await
        let Some(senders) = self.channels.get(channel).map(|subs| subs.clone()) else {
            return Ok(());
        };

        let mut dropped = false;
        for tx in &senders {
            if tx.send(event.clone()).await.is_err() {
                dropped = true;
            }
        }

        if dropped {
            self.channels.remove_if_mut(channel, |_, subs| {
                subs.retain(|tx| !tx.is_closed());
                subs.is_empty()
            });
            tracing::debug!(channel, "Pruned closed relay subscriptions");
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<RelaySubscription, RelayError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.channels.entry(channel.to_string()).or_default().push(tx);
        tracing::debug!(channel, "Relay subscription added");
        Ok(RelaySubscription::new(channel, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventContext;

    #[test]
    fn test_channel_naming() {
        assert_eq!(relay_channel("stream:", &SessionId::from("abc")), "stream:abc");
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_in_order() {
        let relay = InMemoryRelay::new(8);
        let mut a = relay.subscribe("stream:1").await.unwrap();
        let mut b = relay.subscribe("stream:1").await.unwrap();
        assert_eq!(relay.subscriber_count("stream:1"), 2);

        let ctx = EventContext::new("1", "c");
        for (i, token) in ["a", "b", "c"].iter().enumerate() {
            relay
                .publish("stream:1", &StreamEvent::chunk(&ctx, token, i))
                .await
                .unwrap();
        }

        for sub in [&mut a, &mut b] {
            for expected in ["a", "b", "c"] {
                let event = sub.recv().await.unwrap();
                assert_eq!(event.content.as_deref(), Some(expected));
            }
        }
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let relay = InMemoryRelay::new(8);
        let mut other = relay.subscribe("stream:2").await.unwrap();

        let ctx = EventContext::new("1", "c");
        relay
            .publish("stream:1", &StreamEvent::error(&ctx, "x"))
            .await
            .unwrap();

        assert!(other.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let relay = InMemoryRelay::new(8);
        let sub = relay.subscribe("stream:1").await.unwrap();
        drop(sub);

        let ctx = EventContext::new("1", "c");
        relay
            .publish("stream:1", &StreamEvent::error(&ctx, "x"))
            .await
            .unwrap();
        assert_eq!(relay.subscriber_count("stream:1"), 0);
        assert!(relay.channels.get("stream:1").is_none());
    }
}
