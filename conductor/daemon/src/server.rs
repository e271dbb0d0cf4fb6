//! Relay Daemon Lifecycle
//!
//! Owns the hub socket and the PID file:
//! - `start` refuses to run beside a live daemon, writes the PID file and
//!   binds the socket (0600)
//! - `run` accepts connections until the shutdown token fires
//! - `shutdown` drops every connection and removes both files

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stream_conductor::RelayServer;

/// PID file next to the hub socket
#[must_use]
pub fn pid_path_for(socket_path: &Path) -> PathBuf {
    socket_path.with_file_name("stream-relayd.pid")
}

/// Fail if the PID file names a running process; clear it if stale
fn check_existing_daemon(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read PID file: {path:?}"))?;

    match contents.trim().parse::<libc::pid_t>() {
        Ok(pid) if pid > 0 => {
            // Signal 0 only checks that the process exists
            let result = unsafe { libc::kill(pid, 0) };
            if result == 0 {
                anyhow::bail!(
                    "Another stream-relayd is already running (PID: {pid}). \
                     Stop it first or remove {path:?} if it's stale."
                );
            }
            warn!(pid, path = ?path, "Removing stale PID file");
        }
        _ => warn!(path = ?path, "Removing unreadable PID file"),
    }

    fs::remove_file(path).with_context(|| format!("Failed to remove PID file: {path:?}"))?;
    Ok(())
}

fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid, path = ?path, "PID file created");
    Ok(())
}

fn remove_pid_file(path: &Path) {
    if !path.exists() {
        return;
    }
    match fs::remove_file(path) {
        Ok(()) => info!(path = ?path, "PID file removed"),
        Err(e) => warn!(error = %e, path = ?path, "Failed to remove PID file"),
    }
}

/// The relay hub process
pub struct RelayDaemon {
    server: RelayServer,
    pid_path: PathBuf,
}

impl RelayDaemon {
    /// Create a daemon for a socket and PID file
    #[must_use]
    pub fn new(socket_path: PathBuf, pid_path: PathBuf) -> Self {
        Self {
            server: RelayServer::new(socket_path),
            pid_path,
        }
    }

    /// Hub socket path
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        self.server.socket_path()
    }

    /// PID file path
    #[must_use]
    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    /// Write the PID file and bind the socket
    pub fn start(&mut self) -> Result<()> {
        check_existing_daemon(&self.pid_path)?;
        write_pid_file(&self.pid_path)?;

        if let Err(e) = self.server.listen() {
            remove_pid_file(&self.pid_path);
            return Err(e).with_context(|| {
                format!(
                    "Failed to listen on {:?}. Check if another daemon is running.",
                    self.server.socket_path()
                )
            });
        }
        Ok(())
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.server
            .serve(shutdown)
            .await
            .context("Relay hub failed")?;
        Ok(())
    }

    /// Close the hub and remove the PID file
    pub async fn shutdown(mut self) {
        info!(
            connections = self.server.connection_count().await,
            channels = self.server.channel_count(),
            "Shutting down relay hub"
        );
        self.server.shutdown().await;
        remove_pid_file(&self.pid_path);
    }
}
