//! Stream Relay Daemon
//!
//! Hub process for the cross-process relay. Orchestrator processes publish
//! session events to it; connection-terminating processes subscribe and bridge
//! them into their push rooms.
//!
//! # Usage
//!
//! ```bash
//! # Default socket ($XDG_RUNTIME_DIR/stream-conductor/relay.sock)
//! stream-relayd
//!
//! # Custom socket
//! stream-relayd --socket /tmp/relay.sock
//!
//! # Verbose logging
//! RUST_LOG=debug stream-relayd
//! ```
//!
//! # Environment Variables
//!
//! - `STREAM_CONDUCTOR_RELAY_SOCKET`: Hub socket path
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown (removes PID file and socket)

mod server;

use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stream_conductor::{load_config_from_path, ConfigOverrides};

use server::{pid_path_for, RelayDaemon};

/// Relay hub for stream-conductor sessions
#[derive(Debug, Parser)]
#[command(name = "stream-relayd", version, about)]
struct Args {
    /// Hub socket path (overrides config and environment)
    #[arg(long, short)]
    socket: Option<PathBuf>,

    /// Config file path
    #[arg(long, short, env = "STREAM_CONDUCTOR_CONFIG")]
    config: Option<PathBuf>,

    /// PID file path (default: next to the socket)
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stream_relayd=info".parse()?)
                .add_directive("stream_conductor=info".parse()?),
        )
        .with_target(true)
        .init();

    let args = Args::parse();

    let mut config = load_config_from_path(args.config.as_deref())?;
    if let Some(socket) = args.socket {
        ConfigOverrides::new()
            .with_socket_path(socket)
            .apply(&mut config)?;
    }

    let socket_path = config.relay.socket_path.clone();
    let pid_path = args
        .pid_file
        .unwrap_or_else(|| pid_path_for(&socket_path));

    if let Some(path) = &config.config_file_path {
        info!(path = ?path, "Loaded config file");
    }

    let mut daemon = RelayDaemon::new(socket_path, pid_path);
    info!(
        pid = std::process::id(),
        socket = ?daemon.socket_path(),
        pid_file = ?daemon.pid_path(),
        "Starting stream-relayd"
    );
    daemon.start()?;

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_shutdown.cancel();
    });

    let served = daemon.run(shutdown).await;
    daemon.shutdown().await;
    served?;

    info!("stream-relayd stopped cleanly");
    Ok(())
}
