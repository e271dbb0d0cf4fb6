//! Storage Collaborator
//!
//! The orchestrator's view of durable state and cancellation. Implementations
//! back this with whatever stores they have (a fast cache for in-flight
//! snapshots, a slower authoritative database, a pub/sub for completions);
//! [`InMemoryStore`] keeps everything in process for embedding and tests.
//!
//! # Cancellation
//!
//! `register_session` hands out a [`CancellationToken`]. A separate control path
//! cancels it: in-process via [`InMemoryStore::cancel`], or, for a remote store,
//! by a watcher task that cancels the token when the remote flag flips. The
//! orchestrator only ever reads the token.
//!
//! # Failure Policy
//!
//! Every method is fallible. The orchestrator treats all of them as non-fatal
//! except `register_session`, which must succeed before streaming starts.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::session::{ResultSnapshot, SessionId};

/// Authoritative status of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Generation in progress
    Streaming,
    /// Finished successfully
    Completed,
    /// Cancelled; the recorded result is partial
    Cancelled,
    /// Failed; the recorded result is partial and an error is attached
    Failed,
}

/// Errors from the storage collaborator
#[derive(Debug, Error)]
pub enum StoreError {
    /// Session is already registered
    #[error("Session {0} is already registered")]
    AlreadyRegistered(SessionId),
    /// Session is unknown
    #[error("Session {0} not found")]
    NotFound(SessionId),
    /// Backend failure
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Durable state and cancellation for streaming sessions
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Register a session and obtain its cancellation token
    async fn register_session(&self, id: &SessionId) -> Result<CancellationToken, StoreError>;

    /// Forget a session's cancellation token
    async fn unregister_session(&self, id: &SessionId) -> Result<(), StoreError>;

    /// Overwrite the in-flight snapshot (fast cache write)
    async fn save_snapshot(&self, id: &SessionId, snapshot: &ResultSnapshot)
        -> Result<(), StoreError>;

    /// Remove the in-flight snapshot
    async fn delete_snapshot(&self, id: &SessionId) -> Result<(), StoreError>;

    /// Ordering ID used by clients to sequence messages in a conversation
    async fn get_ordering_id(&self, id: &SessionId) -> Result<u64, StoreError>;

    /// Notify waiters that a session finished
    async fn publish_done(&self, id: &SessionId, snapshot: &ResultSnapshot)
        -> Result<(), StoreError>;

    /// Write the authoritative record (slow store write)
    async fn update_authoritative_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        result: Option<&ResultSnapshot>,
        error: Option<&str>,
    ) -> Result<(), StoreError>;
}

/// Authoritative record kept by [`InMemoryStore`]
#[derive(Clone, Debug, PartialEq)]
pub struct SessionRecord {
    /// Last written status
    pub status: SessionStatus,
    /// Last written result
    pub result: Option<ResultSnapshot>,
    /// Error text, for failed sessions
    pub error: Option<String>,
    /// Number of authoritative writes
    pub writes: u32,
}

/// Completion notice published by [`InMemoryStore::publish_done`]
#[derive(Clone, Debug, PartialEq)]
pub struct DoneNotice {
    /// Session that finished
    pub session_id: SessionId,
    /// Final snapshot
    pub snapshot: ResultSnapshot,
}

/// In-process storage collaborator
pub struct InMemoryStore {
    tokens: DashMap<SessionId, CancellationToken>,
    snapshots: DashMap<SessionId, ResultSnapshot>,
    records: DashMap<SessionId, SessionRecord>,
    ordering_ids: DashMap<SessionId, u64>,
    next_ordering_id: AtomicU64,
    done_log: Mutex<Vec<DoneNotice>>,
    done_tx: broadcast::Sender<DoneNotice>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        let (done_tx, _) = broadcast::channel(64);
        Self {
            tokens: DashMap::new(),
            snapshots: DashMap::new(),
            records: DashMap::new(),
            ordering_ids: DashMap::new(),
            next_ordering_id: AtomicU64::new(1),
            done_log: Mutex::new(Vec::new()),
            done_tx,
        }
    }

    /// Signal cancellation for a registered session
    ///
    /// Returns false if the session is not registered.
    pub fn cancel(&self, id: &SessionId) -> bool {
        match self.tokens.get(id) {
            Some(token) => {
                token.cancel();
                tracing::info!(session_id = %id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Whether a session currently holds a cancellation registration
    #[must_use]
    pub fn is_registered(&self, id: &SessionId) -> bool {
        self.tokens.contains_key(id)
    }

    /// Latest in-flight snapshot
    #[must_use]
    pub fn snapshot(&self, id: &SessionId) -> Option<ResultSnapshot> {
        self.snapshots.get(id).map(|s| s.clone())
    }

    /// Latest authoritative record
    #[must_use]
    pub fn record(&self, id: &SessionId) -> Option<SessionRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// Completion notices published so far
    #[must_use]
    pub fn done_notices(&self) -> Vec<DoneNotice> {
        self.done_log.lock().clone()
    }

    /// Subscribe to future completion notices
    #[must_use]
    pub fn subscribe_done(&self) -> broadcast::Receiver<DoneNotice> {
        self.done_tx.subscribe()
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn register_session(&self, id: &SessionId) -> Result<CancellationToken, StoreError> {
        use dashmap::mapref::entry::Entry;

        match self.tokens.entry(id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyRegistered(id.clone())),
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Ok(token)
            }
        }
    }

    async fn unregister_session(&self, id: &SessionId) -> Result<(), StoreError> {
        self.tokens
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn save_snapshot(
        &self,
        id: &SessionId,
        snapshot: &ResultSnapshot,
    ) -> Result<(), StoreError> {
        self.snapshots.insert(id.clone(), snapshot.clone());
        Ok(())
    }

    async fn delete_snapshot(&self, id: &SessionId) -> Result<(), StoreError> {
        self.snapshots.remove(id);
        Ok(())
    }

    async fn get_ordering_id(&self, id: &SessionId) -> Result<u64, StoreError> {
        let ordering_id = *self
            .ordering_ids
            .entry(id.clone())
            .or_insert_with(|| self.next_ordering_id.fetch_add(1, Ordering::SeqCst));
        Ok(ordering_id)
    }

    async fn publish_done(
        &self,
        id: &SessionId,
        snapshot: &ResultSnapshot,
    ) -> Result<(), StoreError> {
        let notice = DoneNotice {
            session_id: id.clone(),
            snapshot: snapshot.clone(),
        };
        self.done_log.lock().push(notice.clone());
        // No subscribers is fine
        let _ = self.done_tx.send(notice);
        Ok(())
    }

    async fn update_authoritative_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        result: Option<&ResultSnapshot>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut record = self.records.entry(id.clone()).or_insert_with(|| SessionRecord {
            status,
            result: None,
            error: None,
            writes: 0,
        });
        record.status = status;
        if let Some(result) = result {
            record.result = Some(result.clone());
        }
        record.error = error.map(str::to_string);
        record.writes += 1;
        Ok(())
    }
}
