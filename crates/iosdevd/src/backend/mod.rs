//! Seam to the device communication library.
//!
//! Everything that talks to real hardware sits behind two traits:
//! - [`DeviceBackend`] - notification subscription and port connects
//! - [`NativeDevice`] - one transport of one device (connect, pairing,
//!   session, property reads, services, app install)
//!
//! All calls are synchronous and may block the caller. Failures carry the
//! library's [`NativeCode`]; mapping to [`iosdev_core::DeviceError`] happens
//! in the session layer.
//!
//! [`sim::SimBackend`] is an in-process implementation used by the tests and
//! by `iosdevd start --simulate`.

pub mod sim;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use iosdev_core::{DeviceId, NativeCode, PropertyValue, TransportKind};

/// A bidirectional byte stream to a service or port on the device.
pub type DeviceSocket = std::os::unix::net::UnixStream;

/// Result of a native library call.
pub type NativeResult<T> = Result<T, NativeCode>;

/// One transport (cable or Wi-Fi) of one attached device.
pub trait NativeDevice: Send + Sync {
    fn udid(&self) -> &DeviceId;

    fn transport(&self) -> TransportKind;

    /// Opens the library connection to the device.
    fn connect(&self) -> NativeResult<()>;

    fn disconnect(&self) -> NativeResult<()>;

    fn is_paired(&self) -> bool;

    fn pair(&self) -> NativeResult<()>;

    fn validate_pairing(&self) -> NativeResult<()>;

    fn start_session(&self) -> NativeResult<()>;

    fn stop_session(&self) -> NativeResult<()>;

    /// Reads a property by its native key. `None` when the device has no value.
    fn copy_value(&self, key: &str) -> Option<PropertyValue>;

    /// Starts a named remote service and returns its socket.
    fn start_service(&self, name: &str) -> NativeResult<DeviceSocket>;

    /// Identifier the backend uses to address port connects.
    fn connection_id(&self) -> u32;

    /// Copies an app bundle to the device's staging area.
    fn transfer_app(&self, path: &Path) -> NativeResult<()>;

    /// Installs a previously transferred app bundle.
    fn install_app(&self, path: &Path) -> NativeResult<()>;
}

/// Attach/detach events delivered by the backend.
#[derive(Clone)]
pub enum DeviceNotification {
    Attached(Arc<dyn NativeDevice>),
    Detached {
        udid: DeviceId,
        transport: TransportKind,
    },
}

impl fmt::Debug for DeviceNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attached(device) => f
                .debug_struct("Attached")
                .field("udid", device.udid())
                .field("transport", &device.transport())
                .finish(),
            Self::Detached { udid, transport } => f
                .debug_struct("Detached")
                .field("udid", udid)
                .field("transport", transport)
                .finish(),
        }
    }
}

/// Callback the backend invokes for every notification.
///
/// May be called from any thread.
pub type NotificationSink = Arc<dyn Fn(DeviceNotification) + Send + Sync>;

/// Active notification subscription. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Entry point to the device communication library.
pub trait DeviceBackend: Send + Sync {
    /// Subscribes to attach/detach notifications.
    ///
    /// Devices already attached are reported through `sink` right away.
    fn subscribe(&self, sink: NotificationSink) -> NativeResult<Subscription>;

    /// Connects to a TCP port on the device over the given connection.
    fn connect_port(&self, connection_id: u32, port: u16) -> NativeResult<DeviceSocket>;
}
