//! Client side of the daemon socket.
//!
//! `DaemonClient` handles:
//! - Connection to the daemon with exponential backoff
//! - The protocol handshake
//! - Request/reply exchanges, keeping events that arrive in between for
//!   later `recv` calls
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::sleep;
use tracing::{debug, info};

use iosdev_protocol::{ClientMessage, DaemonMessage, ProtocolVersion};

use crate::config::DEFAULT_SOCKET_PATH;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: PathBuf,

    /// Optional client name sent in the handshake.
    pub client_id: Option<String>,

    /// Connection attempts before giving up (at least one is made).
    pub max_attempts: u32,

    pub retry_initial_delay: Duration,

    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff (2.0 doubles the delay each retry).
    pub retry_multiplier: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            client_id: None,
            max_attempts: 1,
            retry_initial_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            retry_multiplier: 2.0,
        }
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to connect to daemon at {path}: {error}")]
    Connect { path: PathBuf, error: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid message from daemon: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Daemon rejected connection: {reason}")]
    Rejected { reason: String },

    #[error("Protocol version mismatch: client {client}, daemon {daemon}")]
    VersionMismatch {
        client: ProtocolVersion,
        daemon: ProtocolVersion,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{message}")]
    Daemon {
        message: String,
        code: Option<String>,
    },

    #[error("Daemon closed the connection")]
    Closed,
}

// ============================================================================
// Daemon Client
// ============================================================================

/// An established, handshaken connection to the daemon.
pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: String,
    /// Events read while waiting for a reply.
    pending: VecDeque<DaemonMessage>,
}

impl DaemonClient {
    /// Connects and performs the handshake.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let stream = connect_with_retry(config).await?;
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            client_id: String::new(),
            pending: VecDeque::new(),
        };

        client
            .send(&ClientMessage::connect(config.client_id.clone()))
            .await?;

        match client.read().await? {
            DaemonMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client: ProtocolVersion::CURRENT,
                        daemon: protocol_version,
                    });
                }
                info!(client_id = %client_id, protocol_version = %protocol_version, "Handshake complete");
                client.client_id = client_id;
                Ok(client)
            }
            DaemonMessage::Rejected { reason, .. } => Err(ClientError::Rejected { reason }),
            other => Err(ClientError::Protocol(format!(
                "Unexpected response to connect: {other:?}"
            ))),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        let json = serde_json::to_string(message)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        debug!(message_type = ?message.message, "Sent message to daemon");
        Ok(())
    }

    async fn read(&mut self) -> Result<DaemonMessage, ClientError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(ClientError::Closed);
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Next message from the daemon, events first. `None` once it hung up.
    pub async fn recv(&mut self) -> Result<Option<DaemonMessage>, ClientError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }
        match self.read().await {
            Ok(message) => Ok(Some(message)),
            Err(ClientError::Closed) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sends a request and waits for its reply.
    ///
    /// Events that arrive first are kept for `recv`. An `error` reply is
    /// returned as [`ClientError::Daemon`].
    pub async fn request(&mut self, message: &ClientMessage) -> Result<DaemonMessage, ClientError> {
        self.send(message).await?;
        loop {
            let reply = self.read().await?;
            match reply {
                DaemonMessage::DevicesChanged { .. }
                | DaemonMessage::RelayData { .. }
                | DaemonMessage::RelayEnd { .. } => self.pending.push_back(reply),
                DaemonMessage::Error { message, code } => {
                    return Err(ClientError::Daemon { message, code })
                }
                other => return Ok(other),
            }
        }
    }

    /// Sends a request whose only successful reply is `ok`.
    pub async fn expect_ok(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        match self.request(message).await? {
            DaemonMessage::Ok => Ok(()),
            other => Err(ClientError::Protocol(format!("Expected ok, got {other:?}"))),
        }
    }

    /// Says goodbye. The daemon releases this client's subscriptions.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        self.send(&ClientMessage::disconnect()).await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Attempts to connect with exponential backoff, up to `max_attempts`.
async fn connect_with_retry(config: &ClientConfig) -> Result<UnixStream, ClientError> {
    let mut delay = config.retry_initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);
        debug!(attempt, socket_path = %config.socket_path.display(), "Attempting to connect to daemon");

        match UnixStream::connect(&config.socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt >= config.max_attempts.max(1) => {
                return Err(ClientError::Connect {
                    path: config.socket_path.clone(),
                    error: e.to_string(),
                });
            }
            Err(e) => {
                debug!(attempt, error = %e, "Connection attempt failed");
            }
        }

        sleep(delay).await;
        let next_delay_ms = (delay.as_millis() as f64 * config.retry_multiplier) as u64;
        delay = Duration::from_millis(next_delay_ms).min(config.retry_max_delay);
    }
}
