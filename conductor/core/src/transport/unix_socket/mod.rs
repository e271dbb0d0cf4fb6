//! Unix Socket Relay
//!
//! The relay hub and its client over Unix domain sockets.
//!
//! ```text
//! ┌──────────────────┐                      ┌──────────────────┐
//! │ orchestrator     │                      │ connection       │
//! │ process          │      relay.sock      │ process          │
//! │ UnixSocketRelay ─┼──► RelayServer ────► ┼─ UnixSocketRelay │
//! │   publish        │   (stream-relayd)    │   subscribe      │
//! └──────────────────┘                      └──────────────────┘
//! ```
//!
//! # Security
//!
//! - Socket created with mode 0600 (owner-only access)
//! - Peer UID validated via `SO_PEERCRED` (Linux)

mod client;
mod server;

pub use client::UnixSocketRelay;
pub use server::RelayServer;

/// Outbound frame queue per connection
const OUTBOUND_CAPACITY: usize = 256;

/// Socket read buffer
const READ_BUFFER_SIZE: usize = 4096;
