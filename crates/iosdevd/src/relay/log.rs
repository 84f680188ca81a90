//! Device log relay.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use iosdev_core::DeviceResult;

use super::{ChannelId, Relay, RelayChannel, RelayListener, SYSLOG_SERVICE};
use crate::runloop::Runtimes;
use crate::session::DeviceSession;

type ChannelSlot = Mutex<Option<Arc<RelayChannel>>>;

/// The single syslog channel of a device.
pub struct LogRelay {
    session: Arc<DeviceSession>,
    runtimes: Runtimes,
    channel: Arc<ChannelSlot>,
}

impl LogRelay {
    pub fn new(session: Arc<DeviceSession>, runtimes: Runtimes) -> Self {
        Self {
            session,
            runtimes,
            channel: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.channel.lock().is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.channel
            .lock()
            .as_ref()
            .map(|c| c.listener_count())
            .unwrap_or(0)
    }

    /// Ends the channel. Listeners receive End.
    pub fn shutdown(&self) {
        if let Some(channel) = self.channel.lock().take() {
            channel.terminate();
        }
    }

    fn open_channel(&self) -> DeviceResult<Arc<RelayChannel>> {
        let socket = self.session.start_service(SYSLOG_SERVICE)?;

        let slot: Weak<ChannelSlot> = Arc::downgrade(&self.channel);
        let label = format!("{}:syslog", self.session.udid());
        let channel = RelayChannel::new(label, socket, self.runtimes.clone()).with_close_hook(
            move |id| {
                if let Some(slot) = slot.upgrade() {
                    forget(&slot, id);
                }
            },
        );

        Ok(Arc::new(channel))
    }

    fn attach(
        &self,
        listener: &RelayListener,
        fresh: &mut Option<Arc<RelayChannel>>,
    ) -> Option<DeviceResult<()>> {
        let mut slot = self.channel.lock();

        let channel = match slot.as_ref().filter(|c| !c.is_closed() && !c.is_ended()) {
            Some(live) => Arc::clone(live),
            None => {
                let channel = fresh.take()?;
                *slot = Some(Arc::clone(&channel));
                channel
            }
        };

        let result = channel.add_listener(listener.clone());
        if result.is_err() && channel.listener_count() == 0 {
            *slot = None;
        }
        Some(result)
    }
}

fn forget(slot: &ChannelSlot, id: ChannelId) {
    let mut slot = slot.lock();
    if slot.as_ref().map(|c| c.id()) == Some(id) {
        *slot = None;
        debug!("Ended syslog relay removed");
    }
}

impl Relay for LogRelay {
    type Key = ();

    fn start(&self, _key: (), listener: RelayListener) -> DeviceResult<()> {
        let mut fresh = None;
        loop {
            if let Some(result) = self.attach(&listener, &mut fresh) {
                return result;
            }
            fresh = Some(self.open_channel()?);
            debug!(udid = %self.session.udid(), "Syslog relay connected");
        }
    }

    /// Only removes the listener; the slot follows the channel's lifetime.
    fn stop(&self, _key: (), listener: &RelayListener) {
        let mut slot = self.channel.lock();
        let Some(channel) = slot.as_ref() else {
            return;
        };
        if channel.remove_listener(listener) {
            *slot = None;
        }
    }
}

impl Drop for LogRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    use iosdev_core::{DeviceError, NativeCode, TransportKind};
    use tokio::runtime::Handle;
    use tokio::time::timeout;

    use crate::backend::sim::{SimBackend, SimDeviceSpec, SimEndpoint, SimFailures};
    use crate::backend::NativeDevice;
    use crate::relay::RelayMessage;
    use crate::runloop::RunLoop;

    fn relay(backend: &SimBackend, spec: SimDeviceSpec, run_loop: &RunLoop) -> LogRelay {
        let device = backend.attach(spec, TransportKind::Local);
        let session = Arc::new(DeviceSession::new(device as Arc<dyn NativeDevice>));
        LogRelay::new(session, run_loop.runtimes(Handle::current()))
    }

    #[tokio::test]
    async fn test_syslog_lines_reach_listener() {
        let backend = SimBackend::new();
        let run_loop = RunLoop::spawn("log-test-loop").unwrap();
        let relay = relay(&backend, SimDeviceSpec::new("dev"), &run_loop);
        let (listener, mut rx) = RelayListener::channel();

        relay.start((), listener.clone()).unwrap();
        assert!(relay.is_active());

        let mut peer = backend
            .take_peer(&"dev".into(), SimEndpoint::Service(SYSLOG_SERVICE.into()))
            .unwrap();
        peer.write_all(b"Oct 16 kernel[0]: boot\0").unwrap();

        let message = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(message, Some(RelayMessage::Data("Oct 16 kernel[0]: boot".into())));

        relay.stop((), &listener);
        assert!(!relay.is_active());
    }

    #[tokio::test]
    async fn test_second_listener_reuses_channel() {
        let backend = SimBackend::new();
        let run_loop = RunLoop::spawn("log-test-loop").unwrap();
        let relay = relay(&backend, SimDeviceSpec::new("dev"), &run_loop);
        let (first, _first_rx) = RelayListener::channel();
        let (second, _second_rx) = RelayListener::channel();

        relay.start((), first.clone()).unwrap();
        relay.start((), second).unwrap();
        assert_eq!(relay.listener_count(), 2);

        let endpoint = SimEndpoint::Service(SYSLOG_SERVICE.into());
        assert!(backend.take_peer(&"dev".into(), endpoint.clone()).is_some());
        assert!(backend.take_peer(&"dev".into(), endpoint).is_none());

        relay.stop((), &first);
        assert!(relay.is_active());
    }

    #[tokio::test]
    async fn test_service_failure_is_reported() {
        let backend = SimBackend::new();
        let run_loop = RunLoop::spawn("log-test-loop").unwrap();
        let spec = SimDeviceSpec::new("dev").failures(SimFailures {
            start_service: Some(NativeCode::SYSCALL.0),
            ..Default::default()
        });
        let relay = relay(&backend, spec, &run_loop);
        let (listener, _rx) = RelayListener::channel();

        let err = relay.start((), listener).unwrap_err();
        assert!(matches!(err, DeviceError::ServiceStartFailed { .. }));
        assert!(!relay.is_active());
    }
}
