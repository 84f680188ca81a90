//! Port forwarding relays.
//!
//! One [`RelayChannel`] per device port, shared by every listener of that
//! port. The map never holds an empty channel: the last `stop` removes it,
//! and a channel that ends by itself removes itself through its close hook.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use iosdev_core::{DeviceError, DeviceResult};

use super::{ChannelId, Relay, RelayChannel, RelayListener};
use crate::backend::DeviceBackend;
use crate::runloop::Runtimes;
use crate::session::DeviceSession;

type ChannelMap = Mutex<BTreeMap<u16, Arc<RelayChannel>>>;

pub struct PortRelayManager {
    backend: Arc<dyn DeviceBackend>,
    session: Arc<DeviceSession>,
    runtimes: Runtimes,
    channels: Arc<ChannelMap>,
}

impl PortRelayManager {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        session: Arc<DeviceSession>,
        runtimes: Runtimes,
    ) -> Self {
        Self {
            backend,
            session,
            runtimes,
            channels: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Ports with a live channel.
    pub fn active_ports(&self) -> Vec<u16> {
        self.channels.lock().keys().copied().collect()
    }

    pub fn listener_count(&self, port: u16) -> usize {
        self.channels
            .lock()
            .get(&port)
            .map(|c| c.listener_count())
            .unwrap_or(0)
    }

    /// Ends every channel. Listeners receive End.
    pub fn shutdown(&self) {
        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in channels.values() {
            channel.terminate();
        }
    }

    /// Connects the port and wraps it in a channel that forgets itself on End.
    fn open_channel(&self, port: u16) -> DeviceResult<Arc<RelayChannel>> {
        let socket = self
            .backend
            .connect_port(self.session.connection_id(), port)
            .map_err(|code| {
                warn!(udid = %self.session.udid(), port, code = %code, "Port connect failed");
                DeviceError::PortConnectFailed { port }
            })?;

        let channels: Weak<ChannelMap> = Arc::downgrade(&self.channels);
        let label = format!("{}:{port}", self.session.udid());
        let channel = RelayChannel::new(label, socket, self.runtimes.clone()).with_close_hook(
            move |id| {
                if let Some(channels) = channels.upgrade() {
                    forget(&channels, port, id);
                }
            },
        );

        debug!(udid = %self.session.udid(), port, "Port relay connected");
        Ok(Arc::new(channel))
    }

    /// Adds the listener to the live channel for `port`, installing `fresh`
    /// when there is none. Returns `None` if a fresh channel is needed first.
    fn attach(
        &self,
        port: u16,
        listener: &RelayListener,
        fresh: &mut Option<Arc<RelayChannel>>,
    ) -> Option<DeviceResult<()>> {
        let mut channels = self.channels.lock();

        let channel = match channels.get(&port).filter(|c| !c.is_closed() && !c.is_ended()) {
            Some(live) => Arc::clone(live),
            None => {
                let channel = fresh.take()?;
                channels.insert(port, Arc::clone(&channel));
                channel
            }
        };

        let result = channel.add_listener(listener.clone());
        if result.is_err() && channel.listener_count() == 0 {
            channels.remove(&port);
        }
        Some(result)
    }
}

fn forget(channels: &ChannelMap, port: u16, id: ChannelId) {
    let mut channels = channels.lock();
    if channels.get(&port).map(|c| c.id()) == Some(id) {
        channels.remove(&port);
        debug!(port, "Ended port relay removed");
    }
}

impl Relay for PortRelayManager {
    type Key = u16;

    fn start(&self, port: u16, listener: RelayListener) -> DeviceResult<()> {
        if port == 0 {
            return Err(DeviceError::InvalidArgument(
                "Expected port to be a number between 1 and 65535".to_string(),
            ));
        }

        // The port is connected outside the map lock
        let mut fresh = None;
        loop {
            if let Some(result) = self.attach(port, &listener, &mut fresh) {
                return result;
            }
            fresh = Some(self.open_channel(port)?);
        }
    }

    fn stop(&self, port: u16, listener: &RelayListener) {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get(&port) else {
            return;
        };
        if channel.remove_listener(listener) {
            channels.remove(&port);
            debug!(udid = %self.session.udid(), port, "Port relay stopped");
        }
    }
}

impl Drop for PortRelayManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
