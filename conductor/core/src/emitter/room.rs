//! Push-to-room emitter
//!
//! Rooms are keyed by conversation ID. Every subscriber of a room (several tabs,
//! a reconnecting client, a relay bridge) observes the same events in the same
//! order. Sending never blocks; a subscriber that falls more than the room
//! capacity behind observes a lag error on its receiver instead of stalling
//! the stream.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::Emitter;
use crate::events::StreamEvent;
use crate::session::ConversationId;

/// Shared fan-out of events to conversation rooms
pub struct RoomHub {
    rooms: DashMap<ConversationId, broadcast::Sender<StreamEvent>>,
    capacity: usize,
}

impl RoomHub {
    /// Create a hub whose rooms buffer up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Join a room
    #[must_use]
    pub fn subscribe(&self, room: &ConversationId) -> broadcast::Receiver<StreamEvent> {
        self.rooms
            .entry(room.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to a room
    ///
    /// Returns how many subscribers received the event (0 when nobody listens).
    /// A room whose last subscriber has left is removed here.
    pub fn publish(&self, room: &ConversationId, event: StreamEvent) -> usize {
        let Some(tx) = self.rooms.get(room).map(|tx| tx.clone()) else {
            return 0;
        };
        match tx.send(event) {
            Ok(delivered) => delivered,
            Err(_) => {
                // Checked under the shard lock so a concurrent subscribe keeps the room
                if self
                    .rooms
                    .remove_if(room, |_, tx| tx.receiver_count() == 0)
                    .is_some()
                {
                    tracing::debug!(room = %room, "Removed empty room");
                }
                0
            }
        }
    }

    /// Number of subscribers in a room
    #[must_use]
    pub fn subscriber_count(&self, room: &ConversationId) -> usize {
        self.rooms.get(room).map_or(0, |tx| tx.receiver_count())
    }

    /// Number of rooms
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Drop every room nobody listens to anymore
    ///
    /// Rooms are also removed lazily by `publish`; this sweeps rooms that
    /// never see another event.
    pub fn prune(&self) -> usize {
        let before = self.rooms.len();
        self.rooms.retain(|_, tx| tx.receiver_count() > 0);
        let removed = before - self.rooms.len();
        if removed > 0 {
            tracing::debug!(removed, "Pruned empty rooms");
        }
        removed
    }
}

/// Emitter publishing to one conversation room
pub struct RoomEmitter {
    hub: Arc<RoomHub>,
    room: ConversationId,
}

impl RoomEmitter {
    /// Create an emitter for a room
    #[must_use]
    pub fn new(hub: Arc<RoomHub>, room: ConversationId) -> Self {
        Self { hub, room }
    }

    /// The room this emitter publishes to
    #[must_use]
    pub fn room(&self) -> &ConversationId {
        &self.room
    }
}

#[async_trait]
impl Emitter for RoomEmitter {
    fn name(&self) -> &str {
        "room"
    }

    async fn emit(&self, event: StreamEvent) {
        let kind = event.kind;
        let delivered = self.hub.publish(&self.room, event);
        tracing::trace!(room = %self.room, ?kind, delivered, "Room event published");
    }
}
