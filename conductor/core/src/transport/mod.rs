//! Relay Transport
//!
//! Wire plumbing between relay clients and the `stream-relayd` hub.
//!
//! # Protocol
//!
//! Each message is a [`RelayFrame`] serialized as JSON inside a length-prefixed,
//! CRC32-checked frame (see [`frame`]). Clients send `publish`, `subscribe` and
//! `unsubscribe`; the hub answers a subscribe with `subscribed` once the
//! subscription is live, and pushes `event` frames for subscribed channels.
//!
//! # Security
//!
//! - Unix sockets use `SO_PEERCRED` to validate peer UID
//! - Socket files are created with 0600 permissions
//! - No network exposure

pub mod frame;
#[cfg(unix)]
pub mod unix_socket;

pub use frame::{encode, FrameDecoder, MAX_FRAME_SIZE};

#[cfg(unix)]
pub use unix_socket::{RelayServer, UnixSocketRelay};

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::StreamEvent;

/// Default hub socket path
///
/// `$XDG_RUNTIME_DIR/stream-conductor/relay.sock` when the runtime dir is set,
/// otherwise `/tmp/stream-conductor-$UID/relay.sock`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(runtime_dir) => PathBuf::from(runtime_dir)
            .join("stream-conductor")
            .join("relay.sock"),
        None => {
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/tmp/stream-conductor-{uid}/relay.sock"))
        }
    }
}

/// Unique identifier for a hub connection
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a new unique connection ID from a random 128-bit value
    #[must_use]
    pub fn new() -> Self {
        use rand::Rng;
        let bytes: [u8; 16] = rand::thread_rng().gen();
        Self(format!("conn_{}", hex::encode(bytes)))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection to peer failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// Connection was closed
    #[error("Connection closed")]
    ConnectionClosed,
    /// Failed to send message
    #[error("Send failed: {0}")]
    SendFailed(String),
    /// Message serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
    /// Peer is not allowed to connect
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    /// IO error from underlying socket
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    /// Transport not in expected state
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Frame checksum mismatch, data corruption detected
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum value
        expected: u32,
        /// Actual checksum value received
        actual: u32,
    },
}

/// Messages exchanged with the relay hub
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Client → hub: deliver an event to every subscriber of a channel
    Publish {
        /// Target channel
        channel: String,
        /// Event to deliver
        event: StreamEvent,
    },
    /// Client → hub: start receiving a channel
    Subscribe {
        /// Channel to receive
        channel: String,
    },
    /// Hub → client: the subscription is live
    Subscribed {
        /// Channel now being received
        channel: String,
    },
    /// Client → hub: stop receiving a channel
    Unsubscribe {
        /// Channel to stop receiving
        channel: String,
    },
    /// Hub → client: an event published on a subscribed channel
    Event {
        /// Source channel
        channel: String,
        /// Published event
        event: StreamEvent,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventContext;

    #[test]
    fn test_connection_ids_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert!(a.0.starts_with("conn_"));
        assert_eq!(a.0.len(), "conn_".len() + 32);
    }

    #[test]
    fn test_default_socket_path_file_name() {
        let path = default_socket_path();
        assert_eq!(path.file_name().unwrap(), "relay.sock");
    }

    #[test]
    fn test_frame_op_tag() {
        let frame = RelayFrame::Publish {
            channel: "stream:s".into(),
            event: StreamEvent::chunk(&EventContext::new("s", "c"), "x", 0),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["op"], "publish");
        assert_eq!(json["event"]["kind"], "chunk");

        let json = serde_json::to_value(RelayFrame::Subscribed { channel: "a".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"op": "subscribed", "channel": "a"}));
    }
}
