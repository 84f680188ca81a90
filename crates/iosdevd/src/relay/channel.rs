//! A single relayed device socket.
//!
//! The channel opens its socket lazily when the first listener arrives and
//! closes it as soon as the last one leaves. Bytes are read on the run loop,
//! split into lines and queued; the wake source runs the dispatcher on the
//! foreground runtime, which hands each message to a snapshot of the
//! listeners taken outside the lock.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()` or direct indexing
//! - Socket failures end the stream; they never surface as errors to
//!   listeners

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use iosdev_core::{DeviceError, DeviceResult};

use super::{LineSplitter, MessageQueue, RelayListener, RelayMessage};
use crate::backend::DeviceSocket;
use crate::listener::ListenerSet;
use crate::runloop::Runtimes;
use crate::wake::WakeSource;

/// Read buffer size per socket read
const READ_BUFFER_SIZE: usize = 8192;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a channel, used by owners to avoid removing a successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type CloseHook = Box<dyn FnOnce(ChannelId) + Send>;

struct ChannelInner {
    id: ChannelId,
    label: String,
    runtimes: Runtimes,

    /// Socket waiting for the first listener.
    pending_socket: Mutex<Option<DeviceSocket>>,

    /// Cancels the reader task.
    reader: Mutex<Option<CancellationToken>>,

    listeners: Mutex<ListenerSet<RelayMessage>>,
    queue: MessageQueue,
    wake: WakeSource,

    connected: AtomicBool,
    /// End has been queued; nothing else may be.
    ended: AtomicBool,
    /// The socket was released; the channel cannot be reused.
    closed: AtomicBool,

    on_closed: Mutex<Option<CloseHook>>,
}

impl ChannelInner {
    /// Opens the socket on the run loop and spawns its reader.
    fn open(self: &Arc<Self>) -> DeviceResult<()> {
        let socket = self
            .pending_socket
            .lock()
            .take()
            .ok_or_else(|| DeviceError::Socket(format!("relay {} is closed", self.label)))?;

        socket
            .set_nonblocking(true)
            .map_err(|e| DeviceError::Socket(e.to_string()))?;

        let stream = {
            let _enter = self.runtimes.background.enter();
            UnixStream::from_std(socket).map_err(|e| DeviceError::Socket(e.to_string()))?
        };

        let token = CancellationToken::new();
        *self.reader.lock() = Some(token.clone());
        self.connected.store(true, Ordering::SeqCst);

        self.runtimes
            .background
            .spawn(read_loop(Arc::clone(self), stream, token));

        debug!(channel = %self.label, id = %self.id, "Relay socket opened");
        Ok(())
    }

    /// Stops the reader and releases the socket. Idempotent.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.pending_socket.lock().take();
        if let Some(token) = self.reader.lock().take() {
            token.cancel();
            debug!(channel = %self.label, id = %self.id, "Relay socket closed");
        }
    }

    /// Queues End unless already ended, then wakes the dispatcher.
    fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.push(RelayMessage::End);
        self.wake.signal();
    }

    /// Delivers queued messages to a snapshot of the listeners.
    fn dispatch(&self) {
        let listeners = self.listeners.lock().snapshot();
        if listeners.is_empty() {
            return;
        }

        let messages = self.queue.drain();
        let mut ended = false;

        for message in messages {
            let is_end = message.is_end();
            for listener in &listeners {
                listener.deliver(message.clone());
            }
            if is_end {
                ended = true;
                break;
            }
        }

        if ended {
            self.finish();
        }
    }

    /// Tears the channel down after End reached every listener.
    fn finish(&self) {
        self.listeners.lock().clear();
        self.wake.disarm();
        self.close();

        let hook = self.on_closed.lock().take();
        if let Some(hook) = hook {
            hook(self.id);
        }
        trace!(channel = %self.label, id = %self.id, "Relay channel finished");
    }
}

async fn read_loop(inner: Arc<ChannelInner>, mut stream: UnixStream, token: CancellationToken) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut splitter = LineSplitter::new();

    loop {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            read = stream.read(&mut buf) => read,
        };

        let chunk = match read {
            Ok(0) => None,
            Ok(n) => buf.get(..n),
            Err(e) => {
                warn!(channel = %inner.label, error = %e, "Relay socket read failed");
                None
            }
        };

        let Some(chunk) = chunk else {
            if let Some(tail) = splitter.finish() {
                inner.queue.push(RelayMessage::Data(tail));
            }
            inner.connected.store(false, Ordering::SeqCst);
            inner.end();
            debug!(channel = %inner.label, "Relay socket reached end of stream");
            return;
        };

        let lines = splitter.feed(chunk);
        if !lines.is_empty() {
            trace!(channel = %inner.label, lines = lines.len(), "Relay lines queued");
            inner.queue.extend(lines.into_iter().map(RelayMessage::Data));
            inner.wake.signal();
        }
    }
}

/// One relayed socket with its listeners.
pub struct RelayChannel {
    inner: Arc<ChannelInner>,
}

impl RelayChannel {
    /// Wraps a socket. Nothing is read until the first listener is added.
    pub fn new(label: impl Into<String>, socket: DeviceSocket, runtimes: Runtimes) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id: ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)),
                label: label.into(),
                runtimes,
                pending_socket: Mutex::new(Some(socket)),
                reader: Mutex::new(None),
                listeners: Mutex::new(ListenerSet::new()),
                queue: MessageQueue::new(),
                wake: WakeSource::new(),
                connected: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                on_closed: Mutex::new(None),
            }),
        }
    }

    /// Installs the callback run once the channel ends by itself.
    pub fn with_close_hook(self, hook: impl FnOnce(ChannelId) + Send + 'static) -> Self {
        *self.inner.on_closed.lock() = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Registers a listener, opening the socket for the first one.
    pub fn add_listener(&self, listener: RelayListener) -> DeviceResult<()> {
        if self.is_closed() || self.is_ended() {
            return Err(DeviceError::Socket(format!("relay {} is closed", self.inner.label)));
        }

        let first = self.inner.listeners.lock().add(listener.clone());
        if !first {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        self.inner
            .wake
            .arm(&self.inner.runtimes.foreground, move || inner.dispatch());

        if let Err(e) = self.inner.open() {
            self.inner.listeners.lock().remove(&listener);
            self.inner.wake.disarm();
            self.inner.close();
            return Err(e);
        }

        Ok(())
    }

    /// Unregisters a listener. Returns true if that left the channel empty,
    /// in which case it has been closed.
    pub fn remove_listener(&self, listener: &RelayListener) -> bool {
        let emptied = self.inner.listeners.lock().remove(listener);
        if emptied {
            self.inner.wake.disarm();
            self.inner.close();
        }
        emptied
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Ends the stream as if the device closed it.
    ///
    /// Listeners still receive End through the dispatcher; a channel without
    /// listeners is simply closed.
    pub fn terminate(&self) {
        if self.inner.listeners.lock().is_empty() {
            self.inner.wake.disarm();
            self.inner.close();
            return;
        }

        if let Some(token) = self.inner.reader.lock().take() {
            token.cancel();
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.end();
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl fmt::Debug for RelayChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayChannel")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("listeners", &self.listener_count())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tokio::runtime::Handle;
    use tokio::time::timeout;

    use crate::runloop::RunLoop;

    #[tokio::test]
    async fn test_socket_opens_with_first_listener() {
        let run_loop = RunLoop::spawn("channel-test-loop").unwrap();
        let (ours, _peer) = DeviceSocket::pair().unwrap();
        let channel = RelayChannel::new("lazy", ours, run_loop.runtimes(Handle::current()));

        assert!(!channel.is_connected());
        let (listener, _rx) = RelayListener::channel();
        channel.add_listener(listener).unwrap();
        assert!(channel.is_connected());
        assert_eq!(channel.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_terminate_without_listeners_closes() {
        let run_loop = RunLoop::spawn("channel-test-loop").unwrap();
        let (ours, _peer) = DeviceSocket::pair().unwrap();
        let channel = RelayChannel::new("idle", ours, run_loop.runtimes(Handle::current()));

        channel.terminate();
        assert!(channel.is_closed());
        assert!(!channel.is_ended());

        let (listener, _rx) = RelayListener::channel();
        assert!(matches!(
            channel.add_listener(listener),
            Err(DeviceError::Socket(_))
        ));
    }

    #[tokio::test]
    async fn test_ended_channel_rejects_listeners() {
        let run_loop = RunLoop::spawn("channel-test-loop").unwrap();
        let (ours, mut peer) = DeviceSocket::pair().unwrap();
        let channel = RelayChannel::new("ended", ours, run_loop.runtimes(Handle::current()));

        let (listener, mut rx) = RelayListener::channel();
        channel.add_listener(listener).unwrap();
        peer.write_all(b"last\n").unwrap();
        drop(peer);

        let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(first, Some(RelayMessage::Data("last".into())));
        let end = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(end, Some(RelayMessage::End));

        assert!(channel.is_ended());
        let (late, _late_rx) = RelayListener::channel();
        assert!(channel.add_listener(late).is_err());
    }
}
