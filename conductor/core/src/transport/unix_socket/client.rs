//! Relay Hub Client
//!
//! [`UnixSocketRelay`] implements [`Relay`] over a connection to the hub. A
//! writer task drains outbound frames onto the socket; a reader task dispatches
//! `event` frames to local subscriptions and completes pending subscribe acks.
//! Dropping the relay closes the connection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

use super::{OUTBOUND_CAPACITY, READ_BUFFER_SIZE};
use crate::events::StreamEvent;
use crate::relay::{Relay, RelayError, RelaySubscription, DEFAULT_SUBSCRIPTION_CAPACITY};
use crate::transport::frame::{encode, FrameDecoder};
use crate::transport::{RelayFrame, TransportError};

/// How long to wait for the hub to confirm a subscription
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared with the reader task
struct ClientShared {
    subscriptions: DashMap<String, Vec<mpsc::Sender<StreamEvent>>>,
    pending_acks: Mutex<HashMap<String, Vec<oneshot::Sender<()>>>>,
    connected: AtomicBool,
}

/// Relay client connected to a `stream-relayd` hub
pub struct UnixSocketRelay {
    socket_path: PathBuf,
    outbound: mpsc::Sender<RelayFrame>,
    shared: Arc<ClientShared>,
    capacity: usize,
    ack_timeout: Duration,
}

impl UnixSocketRelay {
    /// Connect to the hub
    pub async fn connect(socket_path: impl Into<PathBuf>) -> Result<Self, RelayError> {
        let socket_path = socket_path.into();
        let stream = UnixStream::connect(&socket_path).await.map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to connect to {}: {e}",
                socket_path.display()
            ))
        })?;

        let (read_half, mut write_half) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::channel::<RelayFrame>(OUTBOUND_CAPACITY);
        let shared = Arc::new(ClientShared {
            subscriptions: DashMap::new(),
            pending_acks: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        });

        let shared_write = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match encode(&frame) {
                    Ok(data) => {
                        if let Err(e) = write_half.write_all(&data).await {
                            tracing::warn!(error = %e, "Relay write error");
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Relay encode error"),
                }
            }
            shared_write.connected.store(false, Ordering::SeqCst);
        });

        tokio::spawn(read_loop(read_half, Arc::clone(&shared), outbound.downgrade()));

        tracing::info!(path = %socket_path.display(), "Connected to relay hub");
        Ok(Self {
            socket_path,
            outbound,
            shared,
            capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        })
    }

    /// Connect to the hub on the default socket path
    pub async fn connect_default() -> Result<Self, RelayError> {
        Self::connect(crate::transport::default_socket_path()).await
    }

    /// Override the per-subscription buffer
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Override the subscribe acknowledgement timeout
    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Hub socket path
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether the hub connection is still up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn send_frame(&self, frame: RelayFrame) -> Result<(), RelayError> {
        if !self.is_connected() {
            return Err(RelayError::Closed);
        }
        self.outbound.send(frame).await.map_err(|_| RelayError::Closed)
    }
}

#[async_trait]
impl Relay for UnixSocketRelay {
    async fn publish(&self, channel: &str, event: &StreamEvent) -> Result<(), RelayError> {
        self.send_frame(RelayFrame::Publish {
            channel: channel.to_string(),
            event: event.clone(),
        })
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<RelaySubscription, RelayError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let (ack_tx, ack_rx) = oneshot::channel();

        // Registered before the hub can deliver anything for the channel
        self.shared
            .subscriptions
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        self.shared
            .pending_acks
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(ack_tx);

        let sent = self
            .send_frame(RelayFrame::Subscribe {
                channel: channel.to_string(),
            })
            .await;

        let result = match sent {
            Err(e) => {
                drop(ack_rx);
                Err(e)
            }
            Ok(()) => match tokio::time::timeout(self.ack_timeout, ack_rx).await {
                Ok(Ok(())) => return Ok(RelaySubscription::new(channel, rx)),
                Ok(Err(_)) => Err(RelayError::Closed),
                Err(_) => Err(RelayError::Timeout(format!(
                    "No subscribe acknowledgement for {channel} within {:?}",
                    self.ack_timeout
                ))),
            },
        };

        // Our sender and ack are closed now that both receivers are gone
        drop(rx);
        if self.shared.forget_closed(channel) {
            let _ = self.outbound.try_send(RelayFrame::Unsubscribe {
                channel: channel.to_string(),
            });
        }
        result
    }
}

impl ClientShared {
    /// Drop closed senders and acks for a channel
    ///
    /// Returns true when no local subscription to the channel remains.
    fn forget_closed(&self, channel: &str) -> bool {
        {
            let mut acks = self.pending_acks.lock();
            if let Some(pending) = acks.get_mut(channel) {
                pending.retain(|ack| !ack.is_closed());
                if pending.is_empty() {
                    acks.remove(channel);
                }
            }
        }

        match self.subscriptions.remove_if_mut(channel, |_, subs| {
            subs.retain(|tx| !tx.is_closed());
            subs.is_empty()
        }) {
            Some(_) => true,
            None => !self.subscriptions.contains_key(channel),
        }
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    shared: Arc<ClientShared>,
    outbound: mpsc::WeakSender<RelayFrame>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    'conn: loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("Relay hub closed the connection");
                break;
            }
            Ok(n) => {
                decoder.push(&buf[..n]);
                loop {
                    match decoder.decode::<RelayFrame>() {
                        Ok(Some(frame)) => dispatch(&shared, &outbound, frame).await,
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "Relay frame decode error");
                            break 'conn;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Relay read error");
                break;
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    // Ends every local subscription and fails pending subscribes
    shared.subscriptions.clear();
    shared.pending_acks.lock().clear();
    tracing::info!("Disconnected from relay hub");
}

async fn dispatch(
    shared: &ClientShared,
    outbound: &mpsc::WeakSender<RelayFrame>,
    frame: RelayFrame,
) {
    match frame {
        RelayFrame::Subscribed { channel } => {
            let acks = shared.pending_acks.lock().remove(&channel).unwrap_or_default();
            for ack in acks {
                let _ = ack.send(());
            }
        }
        RelayFrame::Event { channel, event } => {
            let Some(senders) = shared.subscriptions.get(&channel).map(|s| s.clone()) else {
                return;
            };

            let mut dropped = false;
            for tx in &senders {
                if tx.send(event.clone()).await.is_err() {
                    dropped = true;
                }
            }
            if !dropped {
                return;
            }

            let emptied = shared
                .subscriptions
                .remove_if_mut(&channel, |_, subs| {
                    subs.retain(|tx| !tx.is_closed());
                    subs.is_empty()
                })
                .is_some();
            if emptied {
                if let Some(outbound) = outbound.upgrade() {
                    let _ = outbound.send(RelayFrame::Unsubscribe { channel }).await;
                }
            }
        }
        RelayFrame::Publish { .. }
        | RelayFrame::Subscribe { .. }
        | RelayFrame::Unsubscribe { .. } => {
            tracing::warn!("Ignoring client-only frame from hub");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventContext, StreamEventKind};
    use crate::transport::RelayServer;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    async fn start_hub(dir: &TempDir) -> (PathBuf, CancellationToken) {
        let socket_path = dir.path().join("relay.sock");
        let mut server = RelayServer::new(socket_path.clone());
        server.listen().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let _ = server.serve(token).await;
            server.shutdown().await;
        });
        (socket_path, shutdown)
    }

    #[tokio::test]
    async fn test_connect_without_hub_fails() {
        let temp_dir = TempDir::new().unwrap();
        let result = UnixSocketRelay::connect(temp_dir.path().join("missing.sock")).await;
        assert!(matches!(
            result,
            Err(RelayError::Transport(TransportError::ConnectionFailed(_)))
        ));
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_on_other_connection() {
        let temp_dir = TempDir::new().unwrap();
        let (socket_path, shutdown) = start_hub(&temp_dir).await;

        let publisher = UnixSocketRelay::connect(&socket_path).await.unwrap();
        let subscriber = UnixSocketRelay::connect(&socket_path).await.unwrap();
        let mut sub = subscriber.subscribe("stream:s-1").await.unwrap();
        assert_eq!(sub.channel(), "stream:s-1");

        let ctx = EventContext::new("s-1", "c-1");
        publisher
            .publish("stream:s-1", &StreamEvent::chunk(&ctx, "hi", 0))
            .await
            .unwrap();
        publisher
            .publish("stream:other", &StreamEvent::error(&ctx, "not for us"))
            .await
            .unwrap();
        publisher
            .publish("stream:s-1", &StreamEvent::error(&ctx, "boom"))
            .await
            .unwrap();

        let first = tokio::time::timeout(DEFAULT_ACK_TIMEOUT, sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.content.as_deref(), Some("hi"));
        let second = tokio::time::timeout(DEFAULT_ACK_TIMEOUT, sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.kind, StreamEventKind::Error);
        assert_eq!(second.error.as_deref(), Some("boom"));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_publish_after_hub_gone_fails() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("relay.sock");
        let mut server = RelayServer::new(socket_path.clone());
        server.listen().unwrap();

        let shutdown = CancellationToken::new();
        let hub = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _ = server.serve(shutdown).await;
                server.shutdown().await;
            })
        };

        let relay = UnixSocketRelay::connect(&socket_path).await.unwrap();
        // Stopping the hub closes every open connection
        shutdown.cancel();
        hub.await.unwrap();

        let ctx = EventContext::new("s", "c");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        let mut failed = false;
        while tokio::time::Instant::now() < deadline {
            if relay.publish("stream:s", &StreamEvent::error(&ctx, "x")).await.is_err() {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(failed);
        assert!(!relay.is_connected());
    }

    #[tokio::test]
    async fn test_unacknowledged_subscribe_leaves_nothing_behind() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("silent.sock");
        // Accepts connections but never answers
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();
        let silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let relay = UnixSocketRelay::connect(&socket_path)
            .await
            .unwrap()
            .with_ack_timeout(Duration::from_millis(50));
        let result = relay.subscribe("stream:s-1").await;
        assert!(matches!(result, Err(RelayError::Timeout(_))));

        assert!(relay.shared.subscriptions.is_empty());
        assert!(relay.shared.pending_acks.lock().is_empty());
        silent.abort();
    }

    #[tokio::test]
    async fn test_failed_subscribe_keeps_other_subscribers() {
        let temp_dir = TempDir::new().unwrap();
        let (socket_path, shutdown) = start_hub(&temp_dir).await;
        let relay = UnixSocketRelay::connect(&socket_path).await.unwrap();
        let _first = relay.subscribe("stream:s-1").await.unwrap();

        // A second subscriber that gave up waiting leaves the first in place
        let (tx, rx) = mpsc::channel(1);
        relay
            .shared
            .subscriptions
            .entry("stream:s-1".to_string())
            .or_default()
            .push(tx);
        drop(rx);
        assert!(!relay.shared.forget_closed("stream:s-1"));
        assert_eq!(relay.shared.subscriptions.get("stream:s-1").unwrap().len(), 1);

        shutdown.cancel();
    }
}
