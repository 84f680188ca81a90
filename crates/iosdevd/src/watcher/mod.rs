//! Device watcher: the library's entry point.
//!
//! The watcher subscribes to backend notifications on its own run loop,
//! keeps the registry of visible devices, and tells foreground listeners
//! whenever the device list changes. Device operations (install, port
//! forwarding, syslog) are resolved through the registry and delegated to
//! the device's record.
//!
//! # Threads
//!
//! ```text
//!  backend ──sink──▶ mpsc ──▶ run loop task ──▶ Registry (probe, attach, detach)
//!                                   │
//!                                   ├──▶ SettleTimer::rearm
//!                                   └──▶ WakeSource::signal
//!                                              │
//!                        foreground dispatcher ◀┘ ──▶ WatchEvent::Change
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` outside tests
//! - Probe failures are logged and the device is skipped
//! - The registry lock is never held across a native call

mod registry;
mod settle;

pub use registry::{handle_attach, handle_detach, AttachOutcome, Registry};
pub use settle::SettleTimer;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info};

use iosdev_core::{DeviceError, DeviceId, DeviceResult, DeviceView};

use crate::backend::{DeviceBackend, DeviceNotification, NotificationSink, Subscription};
use crate::config::WatcherConfig;
use crate::device::CableRelays;
use crate::listener::{Listener, ListenerSet};
use crate::relay::{Relay, RelayListener};
use crate::runloop::{RunLoop, Runtimes};
use crate::wake::WakeSource;

/// Name of the watcher's run loop thread
const RUN_LOOP_NAME: &str = "device-runloop";

/// Event delivered to watch listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// The full device list after a change.
    Change { devices: Vec<DeviceView> },
}

pub type WatchListener = Listener<WatchEvent>;

struct WatcherShared {
    backend: Arc<dyn DeviceBackend>,
    runtimes: Runtimes,
    registry: Mutex<Registry>,
    listeners: Mutex<ListenerSet<WatchEvent>>,
    wake: WakeSource,
    /// Set on the run loop when the list changed; cleared by the dispatcher.
    changed: AtomicBool,
    settle: Arc<SettleTimer>,
}

impl WatcherShared {
    /// Runs on the run loop for every backend notification.
    fn handle(&self, notification: DeviceNotification) {
        let changed = match notification {
            DeviceNotification::Attached(device) => {
                handle_attach(&self.registry, device, &self.backend, &self.runtimes).changed()
            }
            DeviceNotification::Detached { udid, transport } => {
                handle_detach(&self.registry, &udid, transport)
            }
        };

        self.settle.rearm(&self.runtimes.background);

        if changed {
            self.changed.store(true, Ordering::SeqCst);
            self.wake.signal();
        }
    }

    /// Runs on the foreground when woken.
    fn dispatch(&self) {
        if !self.changed.swap(false, Ordering::SeqCst) {
            return;
        }

        let listeners = self.listeners.lock().snapshot();
        if listeners.is_empty() {
            return;
        }

        let devices = self.registry.lock().views();
        debug!(devices = devices.len(), listeners = listeners.len(), "Dispatching device change");
        for listener in listeners {
            listener.deliver(WatchEvent::Change {
                devices: devices.clone(),
            });
        }
    }

    fn views(&self) -> Vec<DeviceView> {
        self.registry.lock().views()
    }
}

/// Watches for attached devices and serves device operations.
pub struct DeviceWatcher {
    shared: Arc<WatcherShared>,
    subscription: Mutex<Option<Subscription>>,
    run_loop: Mutex<Option<RunLoop>>,
    stopped: AtomicBool,
}

impl DeviceWatcher {
    /// Starts watching.
    ///
    /// Must be called from inside a tokio runtime; that runtime becomes the
    /// foreground where listeners run. Blocks for at most
    /// `config.settle_timeout` while the initial devices are reported.
    /// Devices that show up later arrive as change events.
    pub fn start(backend: Arc<dyn DeviceBackend>, config: WatcherConfig) -> DeviceResult<Self> {
        let foreground = Handle::try_current().map_err(|e| DeviceError::RunLoop(e.to_string()))?;
        let run_loop = RunLoop::spawn(RUN_LOOP_NAME)?;

        let shared = Arc::new(WatcherShared {
            backend: Arc::clone(&backend),
            runtimes: run_loop.runtimes(foreground),
            registry: Mutex::new(Registry::new()),
            listeners: Mutex::new(ListenerSet::new()),
            wake: WakeSource::new(),
            changed: AtomicBool::new(false),
            settle: Arc::new(SettleTimer::new(config.settle_window)),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<DeviceNotification>();
        let worker = Arc::clone(&shared);
        run_loop.handle().spawn(async move {
            while let Some(notification) = rx.recv().await {
                worker.handle(notification);
            }
        });

        let sink: NotificationSink = Arc::new(move |notification| {
            let _ = tx.send(notification);
        });
        let subscription = backend
            .subscribe(sink)
            .map_err(|code| DeviceError::SubscribeFailed { code })?;

        shared.settle.rearm(&shared.runtimes.background);
        if shared.settle.wait(config.settle_timeout) {
            debug!("Device watcher settled before start returned");
        } else {
            debug!(timeout = ?config.settle_timeout, "Device watcher still busy after settle timeout");
        }

        info!(devices = shared.registry.lock().len(), "Device watcher started");

        Ok(Self {
            shared,
            subscription: Mutex::new(Some(subscription)),
            run_loop: Mutex::new(Some(run_loop)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_settled(&self) -> bool {
        self.shared.settle.is_settled()
    }

    fn ensure_running(&self) -> DeviceResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(DeviceError::WatcherStopped)
        }
    }

    /// Registers a listener for device list changes and immediately
    /// delivers the current list to it.
    pub fn watch(&self, listener: WatchListener) -> DeviceResult<()> {
        self.ensure_running()?;

        let first = self.shared.listeners.lock().add(listener.clone());
        if first {
            // A change signalled while nobody listened is covered by the
            // snapshot below
            self.shared.changed.store(false, Ordering::SeqCst);
            let shared = Arc::downgrade(&self.shared);
            self.shared.wake.arm(&self.shared.runtimes.foreground, move || {
                if let Some(shared) = shared.upgrade() {
                    shared.dispatch();
                }
            });
        }

        listener.deliver(WatchEvent::Change {
            devices: self.shared.views(),
        });
        Ok(())
    }

    pub fn unwatch(&self, listener: &WatchListener) {
        if self.shared.listeners.lock().remove(listener) {
            self.shared.wake.disarm();
        }
    }

    /// Snapshot of the visible devices.
    pub fn list(&self) -> Vec<DeviceView> {
        self.shared.views()
    }

    /// Copies and installs an app bundle over the cable, or over the network
    /// when there is no cable.
    pub fn install(&self, udid: &DeviceId, app_path: &Path) -> DeviceResult<()> {
        self.ensure_running()?;
        validate_app(udid, app_path)?;

        let session = self.shared.registry.lock().get(udid)?.install_session()?;
        info!(udid = %udid, transport = %session.transport(), app = %app_path.display(), "Installing");
        session.install(app_path)
    }

    pub fn start_forward(
        &self,
        udid: &DeviceId,
        port: u16,
        listener: RelayListener,
    ) -> DeviceResult<()> {
        let relays = self.cable_relays(udid, "forward")?;
        relays.ports.start(port, listener)
    }

    pub fn stop_forward(
        &self,
        udid: &DeviceId,
        port: u16,
        listener: &RelayListener,
    ) -> DeviceResult<()> {
        if let Some(relays) = self.existing_relays(udid)? {
            relays.ports.stop(port, listener);
        }
        Ok(())
    }

    pub fn start_syslog(&self, udid: &DeviceId, listener: RelayListener) -> DeviceResult<()> {
        let relays = self.cable_relays(udid, "syslog")?;
        relays.log.start((), listener)
    }

    pub fn stop_syslog(&self, udid: &DeviceId, listener: &RelayListener) -> DeviceResult<()> {
        if let Some(relays) = self.existing_relays(udid)? {
            relays.log.stop((), listener);
        }
        Ok(())
    }

    fn cable_relays(
        &self,
        udid: &DeviceId,
        operation: &'static str,
    ) -> DeviceResult<Arc<CableRelays>> {
        self.ensure_running()?;
        self.shared.registry.lock().get(udid)?.cable_relays(operation)
    }

    fn existing_relays(&self, udid: &DeviceId) -> DeviceResult<Option<Arc<CableRelays>>> {
        self.ensure_running()?;
        Ok(self.shared.registry.lock().get(udid)?.relays())
    }

    /// Stops watching and tears every device down. Idempotent.
    ///
    /// Relay listeners receive End; watch listeners are dropped.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
        if let Some(mut run_loop) = self.run_loop.lock().take() {
            run_loop.stop();
        }

        self.shared.wake.disarm();
        self.shared.listeners.lock().clear();

        let detached = self.shared.registry.lock().drain();
        for transport in detached {
            transport.teardown();
        }

        info!("Device watcher stopped");
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn validate_app(udid: &DeviceId, app_path: &Path) -> DeviceResult<()> {
    if udid.is_empty() {
        return Err(DeviceError::InvalidArgument(
            "Expected a device identifier".to_string(),
        ));
    }
    if app_path.as_os_str().is_empty() {
        return Err(DeviceError::InvalidArgument(
            "Expected a path to an app bundle".to_string(),
        ));
    }
    if !app_path.exists() {
        return Err(DeviceError::AppNotFound(app_path.to_path_buf()));
    }
    if !app_path.join("PkgInfo").is_file() {
        return Err(DeviceError::InvalidApp(app_path.to_path_buf()));
    }
    Ok(())
}
