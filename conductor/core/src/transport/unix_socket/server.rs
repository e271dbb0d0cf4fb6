//! Relay Hub Server
//!
//! Accepts publisher and subscriber connections and routes `publish` frames to
//! every connection subscribed to the channel. Each connection has a reader
//! task (frames in) and a writer task draining a bounded outbound queue, so a
//! slow subscriber applies backpressure to publishers on its channels instead
//! of losing events.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use super::{OUTBOUND_CAPACITY, READ_BUFFER_SIZE};
use crate::transport::frame::{encode, FrameDecoder};
use crate::transport::{ConnectionId, RelayFrame, TransportError};

type Outbound = mpsc::Sender<RelayFrame>;

/// Routing state shared by all connection tasks
#[derive(Default)]
struct HubState {
    connections: RwLock<HashMap<ConnectionId, Outbound>>,
    channels: DashMap<String, Vec<(ConnectionId, Outbound)>>,
}

impl HubState {
    async fn handle_frame(&self, conn_id: &ConnectionId, outbound: &Outbound, frame: RelayFrame) {
        match frame {
            RelayFrame::Publish { channel, event } => {
                let Some(subscribers) = self.channels.get(&channel).map(|subs| subs.clone()) else {
                    tracing::trace!(channel, "Publish without subscribers");
                    return;
                };
                for (sub_id, tx) in subscribers {
                    let frame = RelayFrame::Event {
                        channel: channel.clone(),
                        event: event.clone(),
                    };
                    if tx.send(frame).await.is_err() {
                        tracing::debug!(conn_id = %sub_id, channel, "Subscriber gone");
                    }
                }
            }
            RelayFrame::Subscribe { channel } => {
                {
                    let mut subs = self.channels.entry(channel.clone()).or_default();
                    if !subs.iter().any(|(id, _)| id == conn_id) {
                        subs.push((conn_id.clone(), outbound.clone()));
                    }
                }
                tracing::debug!(conn_id = %conn_id, channel, "Subscribed");
                let _ = outbound.send(RelayFrame::Subscribed { channel }).await;
            }
            RelayFrame::Unsubscribe { channel } => {
                self.channels.remove_if_mut(&channel, |_, subs| {
                    subs.retain(|(id, _)| id != conn_id);
                    subs.is_empty()
                });
                tracing::debug!(conn_id = %conn_id, channel, "Unsubscribed");
            }
            RelayFrame::Subscribed { .. } | RelayFrame::Event { .. } => {
                tracing::warn!(conn_id = %conn_id, "Ignoring hub-only frame from client");
            }
        }
    }

    async fn drop_connection(&self, conn_id: &ConnectionId) {
        self.connections.write().await.remove(conn_id);
        self.channels.retain(|_, subs| {
            subs.retain(|(id, _)| id != conn_id);
            !subs.is_empty()
        });
        tracing::info!(conn_id = %conn_id, "Connection ended");
    }
}

/// Relay hub listening on a Unix socket
pub struct RelayServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    hub: Arc<HubState>,
}

impl RelayServer {
    /// Create a server for a socket path
    #[must_use]
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            listener: None,
            hub: Arc::new(HubState::default()),
        }
    }

    /// Create a server on the default socket path
    #[must_use]
    pub fn with_default_path() -> Self {
        Self::new(crate::transport::default_socket_path())
    }

    /// Socket path
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket (replacing a stale one) with owner-only permissions
    pub fn listen(&mut self) -> Result<(), TransportError> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransportError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create directory {}: {e}", parent.display()),
                ))
            })?;
        }

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                TransportError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to remove old socket {}: {e}", self.socket_path.display()),
                ))
            })?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        self.listener = Some(listener);

        tracing::info!(path = %self.socket_path.display(), "Relay hub listening");
        Ok(())
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<(), TransportError> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| TransportError::InvalidState("Not listening".to_string()))?;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        if let Err(e) = validate_peer(&stream) {
                            tracing::warn!(error = %e, "Rejected relay connection");
                            continue;
                        }
                        self.spawn_connection(stream, shutdown.child_token()).await;
                    }
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
            }
        }

        tracing::info!("Relay hub stopped accepting");
        Ok(())
    }

    /// Number of open connections
    pub async fn connection_count(&self) -> usize {
        self.hub.connections.read().await.len()
    }

    /// Number of channels with at least one subscriber
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.hub.channels.len()
    }

    /// Drop all connections and remove the socket file
    pub async fn shutdown(&mut self) {
        self.listener = None;
        self.hub.connections.write().await.clear();
        self.hub.channels.clear();
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).ok();
        }
        tracing::info!("Relay hub shut down");
    }

    async fn spawn_connection(&self, stream: UnixStream, shutdown: CancellationToken) {
        let conn_id = ConnectionId::new();
        let (outbound, mut outbound_rx) = mpsc::channel::<RelayFrame>(OUTBOUND_CAPACITY);
        let (mut read_half, mut write_half) = stream.into_split();

        self.hub
            .connections
            .write()
            .await
            .insert(conn_id.clone(), outbound.clone());

        let conn_id_write = conn_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match encode(&frame) {
                    Ok(data) => {
                        if let Err(e) = write_half.write_all(&data).await {
                            tracing::warn!(conn_id = %conn_id_write, error = %e, "Write error");
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(conn_id = %conn_id_write, error = %e, "Encode error"),
                }
            }
        });

        tracing::info!(conn_id = %conn_id, "Relay client connected");

        let hub = Arc::clone(&self.hub);
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; READ_BUFFER_SIZE];

            'conn: loop {
                let read = tokio::select! {
                    () = shutdown.cancelled() => break,
                    read = read_half.read(&mut buf) => read,
                };
                match read {
                    Ok(0) => {
                        tracing::debug!(conn_id = %conn_id, "Connection closed by peer");
                        break;
                    }
                    Ok(n) => {
                        decoder.push(&buf[..n]);
                        loop {
                            match decoder.decode::<RelayFrame>() {
                                Ok(Some(frame)) => {
                                    hub.handle_frame(&conn_id, &outbound, frame).await;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::warn!(
                                        conn_id = %conn_id,
                                        error = %e,
                                        "Frame decode error"
                                    );
                                    break 'conn;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(conn_id = %conn_id, error = %e, "Read error");
                        break;
                    }
                }
            }

            hub.drop_connection(&conn_id).await;
        });
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        if self.listener.is_some() && self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).ok();
        }
    }
}

/// Validate peer credentials
///
/// On Linux, uses `SO_PEERCRED` to require the connecting process to run as the
/// same user as the hub.
#[cfg(target_os = "linux")]
fn validate_peer(stream: &UnixStream) -> Result<(), TransportError> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();

    let cred = unsafe {
        let mut cred: libc::ucred = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        );

        if result < 0 {
            return Err(TransportError::AuthenticationFailed(
                "Failed to get peer credentials".to_string(),
            ));
        }
        cred
    };

    let my_uid = unsafe { libc::getuid() };
    if cred.uid != my_uid {
        return Err(TransportError::AuthenticationFailed(format!(
            "Peer UID {} does not match hub UID {my_uid}",
            cred.uid
        )));
    }

    tracing::debug!(peer_uid = cred.uid, peer_pid = cred.pid, "Peer validated");
    Ok(())
}

/// Validate peer credentials (non-Linux fallback relies on socket permissions)
#[cfg(not(target_os = "linux"))]
fn validate_peer(_stream: &UnixStream) -> Result<(), TransportError> {
    tracing::debug!("Peer validation skipped (non-Linux platform)");
    Ok(())
}
