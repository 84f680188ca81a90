//! Unix socket server for the iosdev daemon.
//!
//! The server:
//! - Listens on a Unix socket for client connections
//! - Spawns a ConnectionHandler for each client, up to a fixed limit
//! - Shares one `DeviceWatcher` between all connections
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │                 │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│  DeviceWatcher  │
//! │   (per client)  │     │                 │
//! └────────┬────────┘     └────────┬────────┘
//!          ▲                       │ listeners
//!          └────── outbound ◀──────┘ (device list, relay lines)
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{send_message, ConnectionError, ConnectionHandler};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::BufWriter;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use iosdev_protocol::DaemonMessage;

use crate::watcher::DeviceWatcher;

pub use crate::config::DEFAULT_SOCKET_PATH;

/// Maximum number of concurrent clients
pub const MAX_CLIENTS: usize = 32;

/// Unix socket server for the iosdev daemon.
pub struct DaemonServer {
    socket_path: PathBuf,

    watcher: Arc<DeviceWatcher>,

    cancel_token: CancellationToken,

    /// Connection counter for generating client IDs
    connection_counter: AtomicU64,

    active_clients: Arc<AtomicUsize>,
}

impl DaemonServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        watcher: Arc<DeviceWatcher>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            watcher,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            active_clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Creates a server with the default socket path.
    pub fn with_default_path(watcher: Arc<DeviceWatcher>, cancel_token: CancellationToken) -> Self {
        Self::new(DEFAULT_SOCKET_PATH, watcher, cancel_token)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn active_clients(&self) -> usize {
        self.active_clients.load(Ordering::SeqCst)
    }

    /// Runs the server until the cancellation token is triggered.
    pub async fn run(&self) -> Result<(), ServerError> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| ServerError::SocketSetup {
                path: self.socket_path.clone(),
                error: e.to_string(),
            })?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| ServerError::SocketSetup {
                    path: self.socket_path.clone(),
                    error: e.to_string(),
                })?;
            }
        }

        let listener =
            UnixListener::bind(&self.socket_path).map_err(|e| ServerError::SocketSetup {
                path: self.socket_path.clone(),
                error: e.to_string(),
            })?;

        info!(socket = %self.socket_path.display(), "Daemon server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    /// Spawns a handler for the connection, or turns it away when full.
    fn handle_connection(&self, stream: UnixStream, connection_number: u64) {
        let active = self.active_clients.fetch_add(1, Ordering::SeqCst);
        if active >= MAX_CLIENTS {
            self.active_clients.fetch_sub(1, Ordering::SeqCst);
            warn!(max = MAX_CLIENTS, "Too many clients, rejecting connection");
            tokio::spawn(reject(stream, ServerError::TooManyClients { max: MAX_CLIENTS }));
            return;
        }

        let (reader, writer) = stream.into_split();
        let watcher = Arc::clone(&self.watcher);
        let active_clients = Arc::clone(&self.active_clients);

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(reader, writer, watcher, connection_number);
            let client_id = handler.run().await;
            active_clients.fetch_sub(1, Ordering::SeqCst);
            if let Some(id) = client_id {
                debug!(client_id = %id, "Connection handler finished");
            }
        });
    }

    fn cleanup(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }

        info!("Server cleanup complete");
    }
}

async fn reject(stream: UnixStream, reason: ServerError) {
    let (_reader, writer) = stream.into_split();
    let mut writer = BufWriter::new(writer);
    if let Err(e) = send_message(&mut writer, &DaemonMessage::rejected(&reason.to_string())).await {
        debug!(error = %e, "Failed to send rejection");
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Too many clients (max: {max})")]
    TooManyClients { max: usize },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}
