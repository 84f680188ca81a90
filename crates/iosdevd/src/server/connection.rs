//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages and runs them against the device watcher
//! - Owns the client's watch and relay subscriptions, releasing them when
//!   the client goes away
//!
//! Replies and events share one bounded outbound queue drained by a writer
//! task, so the client sees them in the order they were produced. Replies
//! wait for room; device events are dropped while a slow client's queue is
//! full.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Device failures become `error` replies; the connection stays up
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use iosdev_core::{DeviceError, DeviceId, DeviceResult};
use iosdev_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion, RelaySource};

use crate::relay::{RelayListener, RelayMessage};
use crate::watcher::{DeviceWatcher, WatchEvent, WatchListener};

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages buffered per client before events are dropped
const OUTBOUND_CAPACITY: usize = 1024;

type ClientId = String;

type Outbound = mpsc::Sender<DaemonMessage>;

/// Connection handler for a single client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,

    /// Writer until the handshake completes; then owned by the writer task
    writer: Option<BufWriter<OwnedWriteHalf>>,

    watcher: Arc<DeviceWatcher>,

    client_id: Option<ClientId>,

    connection_number: u64,

    outbound: Option<Outbound>,

    writer_task: Option<JoinHandle<()>>,

    writer_done: Option<CancellationToken>,

    watch: Option<WatchListener>,

    forwards: HashMap<(DeviceId, u16), RelayListener>,

    syslogs: HashMap<DeviceId, RelayListener>,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        watcher: Arc<DeviceWatcher>,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Some(BufWriter::new(writer)),
            watcher,
            client_id: None,
            connection_number,
            outbound: None,
            writer_task: None,
            writer_done: None,
            watch: None,
            forwards: HashMap::new(),
            syslogs: HashMap::new(),
        }
    }

    /// Runs the handshake and message loop. Returns the client id once the
    /// connection has closed and its subscriptions are released.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(()) => {
                info!(client_id = ?self.client_id, "Client handshake completed");
            }
            Err(e) => {
                warn!(connection = self.connection_number, error = %e, "Handshake failed");
                return None;
            }
        }

        self.start_writer();

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        self.release_subscriptions();
        self.stop_writer().await;

        info!(client_id = ?self.client_id, "Client disconnected");
        self.client_id.take()
    }

    /// Expects `connect` with a compatible version.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout),
        };

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );

            self.write_direct(DaemonMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;

            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.write_direct(DaemonMessage::connected(assigned_id)).await
            }
            other => {
                self.write_direct(DaemonMessage::error("Expected Connect message for handshake"))
                    .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    async fn write_direct(&mut self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        let writer = self.writer.as_mut().ok_or(ConnectionError::Closed)?;
        send_message(writer, &msg).await
    }

    /// Moves the writer into a task draining the outbound queue.
    fn start_writer(&mut self) {
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        let (tx, mut rx) = mpsc::channel::<DaemonMessage>(OUTBOUND_CAPACITY);
        let done = CancellationToken::new();
        let finished = done.clone();
        let client_id = self.client_id.clone();

        self.outbound = Some(tx);
        self.writer_done = Some(done);
        self.writer_task = Some(tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    biased;
                    msg = rx.recv() => msg,
                    _ = finished.cancelled() => rx.try_recv().ok(),
                };
                let Some(msg) = msg else {
                    break;
                };
                if let Err(e) = send_message(&mut writer, &msg).await {
                    debug!(client_id = ?client_id, error = %e, "Failed to write to client");
                    break;
                }
            }
        }));
    }

    /// Flushes what is queued, then ends the writer task.
    ///
    /// Listener clones may outlive the connection, so the queue is not
    /// waited on to close.
    async fn stop_writer(&mut self) {
        self.outbound = None;
        if let Some(done) = self.writer_done.take() {
            done.cancel();
        }
        if let Some(mut task) = self.writer_task.take() {
            if timeout(WRITE_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }
    }

    async fn queue(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        self.outbound
            .as_ref()
            .ok_or(ConnectionError::Closed)?
            .send(msg)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::ParseError(e))) => {
                    // Malformed line; the stream itself is still usable
                    self.queue(DaemonMessage::error(&format!("Parse error: {e}"))).await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            if let Err(e) = self.handle_message(msg).await {
                match e {
                    ConnectionError::Eof => return Ok(()),
                    ConnectionError::Closed => return Err(e),
                    other => {
                        warn!(client_id = ?self.client_id, error = %other, "Error handling message");
                        self.queue(DaemonMessage::error(&other.to_string())).await?;
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        match msg.message {
            MessageType::Connect { .. } => {
                self.queue(DaemonMessage::error("Already connected")).await?;
            }

            MessageType::ListDevices => {
                self.queue(DaemonMessage::device_list(self.watcher.list())).await?;
            }

            MessageType::Watch => {
                let result = self.handle_watch();
                self.reply(result).await?;
            }

            MessageType::Unwatch => {
                if let Some(listener) = self.watch.take() {
                    self.watcher.unwatch(&listener);
                    debug!(client_id = ?self.client_id, "Client stopped watching");
                }
                self.queue(DaemonMessage::Ok).await?;
            }

            MessageType::StartForward { udid, port } => {
                let result = match forward_port(port) {
                    Ok(port) => self.handle_start_forward(udid, port).await?,
                    Err(e) => Err(e),
                };
                self.reply(result).await?;
            }

            MessageType::StopForward { udid, port } => {
                let result = forward_port(port).and_then(|port| {
                    match self.forwards.remove(&(udid.clone(), port)) {
                        Some(listener) => self.watcher.stop_forward(&udid, port, &listener),
                        None => Ok(()),
                    }
                });
                self.reply(result).await?;
            }

            MessageType::StartSyslog { udid } => {
                let result = self.handle_start_syslog(udid).await?;
                self.reply(result).await?;
            }

            MessageType::StopSyslog { udid } => {
                let result = match self.syslogs.remove(&udid) {
                    Some(listener) => self.watcher.stop_syslog(&udid, &listener),
                    None => Ok(()),
                };
                self.reply(result).await?;
            }

            MessageType::Install { udid, app_path } => {
                info!(client_id = ?self.client_id, udid = %udid, app = %app_path.display(), "Install requested");
                let watcher = Arc::clone(&self.watcher);
                let result = tokio::task::spawn_blocking(move || watcher.install(&udid, &app_path))
                    .await
                    .map_err(|e| ConnectionError::Blocking(e.to_string()))?;
                self.reply(result).await?;
            }

            MessageType::Ping { seq } => {
                self.queue(DaemonMessage::pong(seq)).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    async fn reply(&self, result: DeviceResult<()>) -> Result<(), ConnectionError> {
        match result {
            Ok(()) => self.queue(DaemonMessage::Ok).await,
            Err(e) => {
                debug!(client_id = ?self.client_id, error = %e, code = e.code(), "Device operation failed");
                self.queue(DaemonMessage::device_error(&e)).await
            }
        }
    }

    fn handle_watch(&mut self) -> DeviceResult<()> {
        if self.watch.is_some() {
            return Ok(());
        }

        let outbound = self.outbound.clone().ok_or(DeviceError::WatcherStopped)?;
        let client_id = self.client_id.clone();
        let listener = WatchListener::new(move |event| match event {
            WatchEvent::Change { devices } => {
                let msg = DaemonMessage::devices_changed(devices);
                offer_event(&outbound, client_id.as_deref(), msg);
            }
        });

        self.watcher.watch(listener.clone())?;
        self.watch = Some(listener);
        debug!(client_id = ?self.client_id, "Client watching devices");
        Ok(())
    }

    /// Starts a forward. A previous forward of the same port by this client
    /// is replaced.
    async fn handle_start_forward(
        &mut self,
        udid: DeviceId,
        port: u16,
    ) -> Result<DeviceResult<()>, ConnectionError> {
        if let Some(previous) = self.forwards.remove(&(udid.clone(), port)) {
            let _ = self.watcher.stop_forward(&udid, port, &previous);
        }

        let listener = self.relay_listener(udid.clone(), RelaySource::Port { port })?;
        let watcher = Arc::clone(&self.watcher);
        let started = listener.clone();
        let target = udid.clone();
        let result =
            tokio::task::spawn_blocking(move || watcher.start_forward(&target, port, started))
                .await
                .map_err(|e| ConnectionError::Blocking(e.to_string()))?;

        if result.is_ok() {
            info!(client_id = ?self.client_id, udid = %udid, port, "Forward started");
            self.forwards.insert((udid, port), listener);
        }
        Ok(result)
    }

    async fn handle_start_syslog(
        &mut self,
        udid: DeviceId,
    ) -> Result<DeviceResult<()>, ConnectionError> {
        if let Some(previous) = self.syslogs.remove(&udid) {
            let _ = self.watcher.stop_syslog(&udid, &previous);
        }

        let listener = self.relay_listener(udid.clone(), RelaySource::Syslog)?;
        let watcher = Arc::clone(&self.watcher);
        let started = listener.clone();
        let target = udid.clone();
        let result = tokio::task::spawn_blocking(move || watcher.start_syslog(&target, started))
            .await
            .map_err(|e| ConnectionError::Blocking(e.to_string()))?;

        if result.is_ok() {
            info!(client_id = ?self.client_id, udid = %udid, "Syslog started");
            self.syslogs.insert(udid, listener);
        }
        Ok(result)
    }

    /// A listener that turns relay messages into protocol events.
    fn relay_listener(
        &self,
        udid: DeviceId,
        source: RelaySource,
    ) -> Result<RelayListener, ConnectionError> {
        let outbound = self.outbound.clone().ok_or(ConnectionError::Closed)?;
        let client_id = self.client_id.clone();
        Ok(RelayListener::new(move |message| {
            let msg = match message {
                RelayMessage::Data(line) => DaemonMessage::relay_data(udid.clone(), source, line),
                RelayMessage::End => DaemonMessage::relay_end(udid.clone(), source),
            };
            offer_event(&outbound, client_id.as_deref(), msg);
        }))
    }

    /// Drops every subscription this client holds.
    fn release_subscriptions(&mut self) {
        if let Some(listener) = self.watch.take() {
            self.watcher.unwatch(&listener);
        }
        for ((udid, port), listener) in self.forwards.drain() {
            let _ = self.watcher.stop_forward(&udid, port, &listener);
        }
        for (udid, listener) in self.syslogs.drain() {
            let _ = self.watcher.stop_syslog(&udid, &listener);
        }
    }

    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage =
            serde_json::from_str(&line).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );

        Ok(msg)
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

/// Queues a device event without waiting. Returns false if it was dropped.
///
/// Listeners run on the dispatcher, which must not block on one slow client.
fn offer_event(outbound: &Outbound, client_id: Option<&str>, msg: DaemonMessage) -> bool {
    match outbound.try_send(msg) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(msg)) => {
            warn!(
                client_id = ?client_id,
                message = ?std::mem::discriminant(&msg),
                capacity = OUTBOUND_CAPACITY,
                "Client outbound queue full, dropping event"
            );
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Narrows a wire port to a TCP port number.
fn forward_port(port: i64) -> DeviceResult<u16> {
    u16::try_from(port)
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| {
            DeviceError::InvalidArgument(
                "Expected port to be a number between 1 and 65535".to_string(),
            )
        })
}

/// Writes one JSON line to the client.
pub async fn send_message(
    writer: &mut BufWriter<OwnedWriteHalf>,
    msg: &DaemonMessage,
) -> Result<(), ConnectionError> {
    let json = serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Outbound queue closed")]
    Closed,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Device task failed: {0}")]
    Blocking(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_forward_port_range() {
        assert_eq!(forward_port(8080), Ok(8080));
        assert_eq!(forward_port(65535), Ok(65535));
        for bad in [0, -1, 65536, 70000] {
            match forward_port(bad) {
                Err(e) => assert_eq!(e.code(), "invalid_argument"),
                Ok(port) => panic!("{bad} accepted as {port}"),
            }
        }
    }

    #[tokio::test]
    async fn test_full_outbound_drops_events() {
        let (tx, mut rx) = mpsc::channel(OUTBOUND_CAPACITY);
        for seq in 0..OUTBOUND_CAPACITY {
            assert!(offer_event(&tx, Some("slow"), DaemonMessage::pong(seq as u64)));
        }
        assert!(!offer_event(&tx, Some("slow"), DaemonMessage::pong(u64::MAX)));

        // Room again once the writer catches up
        assert!(matches!(rx.recv().await, Some(DaemonMessage::Pong { seq: 0 })));
        assert!(offer_event(&tx, Some("slow"), DaemonMessage::Ok));

        drop(rx);
        assert!(!offer_event(&tx, None, DaemonMessage::Ok));
    }

    #[test]
    fn test_message_size_error() {
        let err = ConnectionError::MessageTooLarge {
            size: 2_000_000,
            max: MAX_MESSAGE_SIZE,
        };
        assert!(err.to_string().contains("2000000"));
    }
}
