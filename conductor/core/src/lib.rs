//! Stream Conductor - Cancellable, admission-controlled generation streaming
//!
//! This crate drives one streaming "session" (a single generation turn) from
//! admission to release, accumulating its output into a structured result and
//! pushing incremental events to whichever destination the client is attached
//! to. It has no opinion about HTTP frameworks or model backends: generation
//! output arrives as a [`futures::Stream`] and leaves through an [`Emitter`].
//!
//! # Architecture
//!
//! ```text
//!                    ┌────────────────────────────────────────────┐
//!  generation ─────► │            StreamOrchestrator              │
//!  source (Stream)   │  ┌────────────┐ ┌──────────┐ ┌──────────┐  │
//!                    │  │ Admission  │ │ Session  │ │ Session  │  │
//!                    │  │ Controller │ │ State    │ │ Store    │  │
//!                    │  └────────────┘ └──────────┘ └──────────┘  │
//!                    └──────────────────────┬─────────────────────┘
//!                                           │ StreamEvent
//!            ┌──────────────┬───────────────┼───────────────┐
//!            ▼              ▼               ▼               ▼
//!       SseEmitter     RoomEmitter     RelayEmitter     NoopEmitter
//!       (data: ...)    (RoomHub)       (Relay channel)
//!                                           │
//!                               stream-relayd / InMemoryRelay
//!                                           │
//!                                      RelayBridge ──► RoomHub
//! ```
//!
//! # Guarantees
//!
//! - At most `capacity` sessions stream concurrently; each admitted session
//!   returns its slot exactly once
//! - Every streaming session ends with exactly one terminal signal (`done`,
//!   `error` then `done`, or `cancelled`)
//! - Offsets are monotonic: each chunk carries the text length before it
//! - Emit and persistence failures are logged and never abort a session
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use stream_conductor::{
//!     AdmissionController, GenerationEvent, InMemoryStore, OrchestratorConfig,
//!     SessionIdentity, SessionState, SseEmitter, StreamOrchestrator,
//! };
//!
//! let admission = Arc::new(AdmissionController::new(5));
//! let store = Arc::new(InMemoryStore::new());
//! let (emitter, frames) = SseEmitter::channel(256);
//!
//! let state = SessionState::new(SessionIdentity::new("s-1", "c-1", "u-1", "Chat"));
//! let orchestrator =
//!     StreamOrchestrator::new(state, emitter, store, admission, OrchestratorConfig::default());
//!
//! let source = futures::stream::iter([Ok(GenerationEvent::token("Hello"))]);
//! let outcome = orchestrator.run(source).await;
//! ```
//!
//! # Module Overview
//!
//! - [`admission`]: Bounded concurrency gate with timed acquisition
//! - [`session`]: Session identity, accumulated state and the block model
//! - [`events`]: Client-facing stream events
//! - [`emitter`]: SSE, room, relay and no-op event destinations
//! - [`storage`]: Cancellation registry and snapshot persistence collaborator
//! - [`orchestrator`]: The session lifecycle
//! - [`relay`]: Cross-process pub/sub of events and the room bridge
//! - [`transport`]: Framed Unix-socket wire protocol for the relay hub
//! - [`config`]: TOML/env configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod admission;
pub mod config;
pub mod emitter;
pub mod events;
pub mod orchestrator;
pub mod relay;
pub mod session;
pub mod storage;
pub mod transport;

// Admission exports
pub use admission::{AdmissionController, AdmissionError, AdmissionPermit, AdmissionStats};

// Session exports
pub use session::{
    Block, BlockStatus, ConversationId, ResultSnapshot, SessionId, SessionIdentity, SessionState,
    SourceEntry, TextBlock, ThinkingDetail, ThinkingStep, ToolBlock, ToolStatus,
};

// Event exports
pub use events::{EventContext, EventResult, StreamEvent, StreamEventKind};

// Emitter exports
pub use emitter::{
    Emitter, FanoutEmitter, NoopEmitter, RelayEmitter, RoomEmitter, RoomHub, SseEmitter, SseStream,
};

// Storage exports
pub use storage::{InMemoryStore, SessionRecord, SessionStatus, SessionStore, StoreError};

// Orchestrator exports
pub use orchestrator::{
    GenerationEvent, OrchestratorError, SessionOutcome, SessionPhase, SessionResource,
    StreamOrchestrator,
};

// Relay exports
pub use relay::{relay_channel, InMemoryRelay, Relay, RelayBridge, RelayError, RelaySubscription};

// Transport exports
pub use transport::{ConnectionId, RelayFrame, TransportError};
#[cfg(unix)]
pub use transport::{RelayServer, UnixSocketRelay};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConductorConfig, ConductorToml,
    ConfigError, ConfigOverrides, ConfigSource, OrchestratorConfig, RelayConfig,
};
