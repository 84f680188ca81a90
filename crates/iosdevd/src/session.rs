//! Reference-counted device session.
//!
//! A `DeviceSession` guards one transport of one device. The first
//! `connect()` runs the full handshake (library connect, pair if needed,
//! validate pairing, start session); later calls only bump the count.
//! `disconnect()` tears everything down when the count returns to zero, or
//! right away when forced.
//!
//! Scoped work goes through [`DeviceSession::open`], whose guard releases
//! its reference on drop, so increments and decrements always balance.
//!
//! # Locking
//!
//! The count lives behind the session's own mutex, held across the
//! handshake so concurrent `connect` calls on one session serialize. The
//! registry lock is never held while any of this runs.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use iosdev_core::{
    DeviceError, DeviceId, DeviceProperties, DeviceProperty, DeviceResult, PropertyKind,
    PropertyValue, TransportKind,
};

use crate::backend::{DeviceSocket, NativeDevice};

pub struct DeviceSession {
    device: Arc<dyn NativeDevice>,
    open_count: Mutex<usize>,
}

impl DeviceSession {
    pub fn new(device: Arc<dyn NativeDevice>) -> Self {
        Self {
            device,
            open_count: Mutex::new(0),
        }
    }

    pub fn udid(&self) -> &DeviceId {
        self.device.udid()
    }

    pub fn transport(&self) -> TransportKind {
        self.device.transport()
    }

    pub fn connection_id(&self) -> u32 {
        self.device.connection_id()
    }

    pub fn open_count(&self) -> usize {
        *self.open_count.lock()
    }

    /// True while at least one reference holds the session open.
    pub fn is_open(&self) -> bool {
        self.open_count() > 0
    }

    /// Takes a reference, running the handshake on the 0 -> 1 transition.
    ///
    /// On failure the session is fully closed and the count reset to 0.
    pub fn connect(&self) -> DeviceResult<()> {
        let mut count = self.open_count.lock();
        *count += 1;
        if *count > 1 {
            return Ok(());
        }

        if let Err(e) = self.handshake() {
            warn!(
                udid = %self.udid(),
                transport = %self.transport(),
                error = %e,
                "Session handshake failed"
            );
            self.teardown();
            *count = 0;
            return Err(e);
        }

        debug!(udid = %self.udid(), transport = %self.transport(), "Session started");
        Ok(())
    }

    /// Releases a reference.
    ///
    /// A no-op when nothing is open. Tears down when `force` is set or the
    /// last reference goes.
    pub fn disconnect(&self, force: bool) {
        let mut count = self.open_count.lock();
        if *count == 0 {
            return;
        }

        if force || *count == 1 {
            self.teardown();
            *count = 0;
            debug!(
                udid = %self.udid(),
                transport = %self.transport(),
                force,
                "Session closed"
            );
        } else {
            *count -= 1;
        }
    }

    /// Connects and returns a guard that disconnects on drop.
    pub fn open(&self) -> DeviceResult<SessionGuard<'_>> {
        self.connect()?;
        Ok(SessionGuard { session: self })
    }

    /// Starts a named remote service on the device.
    pub fn start_service(&self, name: &str) -> DeviceResult<DeviceSocket> {
        let _guard = self.open()?;
        let socket = self
            .device
            .start_service(name)
            .map_err(|code| DeviceError::service_start(name, code))?;

        debug!(udid = %self.udid(), service = name, "Service started");
        Ok(socket)
    }

    /// Copies and installs an app bundle.
    pub fn install(&self, app_path: &Path) -> DeviceResult<()> {
        let _guard = self.open()?;

        info!(udid = %self.udid(), app = %app_path.display(), "Transferring app");
        self.device
            .transfer_app(app_path)
            .map_err(|code| DeviceError::TransferFailed { code })?;

        info!(udid = %self.udid(), app = %app_path.display(), "Installing app");
        self.device
            .install_app(app_path)
            .map_err(|code| DeviceError::InstallFailed { code })?;

        Ok(())
    }

    fn handshake(&self) -> DeviceResult<()> {
        self.device
            .connect()
            .map_err(|code| DeviceError::ConnectFailed { code })?;

        if !self.device.is_paired() {
            debug!(udid = %self.udid(), "Device not paired, pairing");
            self.device
                .pair()
                .map_err(|code| DeviceError::PairingFailed { code })?;
        }

        self.device
            .validate_pairing()
            .map_err(|code| DeviceError::PairingInvalid { code })?;

        self.device
            .start_session()
            .map_err(|code| DeviceError::SessionStartFailed { code })?;

        Ok(())
    }

    fn teardown(&self) {
        if let Err(code) = self.device.stop_session() {
            debug!(udid = %self.udid(), code = %code, "stop_session failed during teardown");
        }
        if let Err(code) = self.device.disconnect() {
            debug!(udid = %self.udid(), code = %code, "disconnect failed during teardown");
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.disconnect(true);
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("udid", self.udid())
            .field("transport", &self.transport())
            .field("open_count", &self.open_count())
            .finish()
    }
}

/// Proof that the session is open. Releases its reference on drop.
pub struct SessionGuard<'a> {
    session: &'a DeviceSession,
}

impl SessionGuard<'_> {
    pub fn session(&self) -> &DeviceSession {
        self.session
    }

    /// Reads a property, or the empty value of `kind` when absent or of
    /// another type.
    pub fn property(&self, key: &str, kind: PropertyKind) -> PropertyValue {
        self.session
            .device
            .copy_value(key)
            .filter(|value| value.kind() == kind)
            .unwrap_or_else(|| PropertyValue::empty(kind))
    }

    pub fn string_property(&self, key: &str) -> String {
        match self.property(key, PropertyKind::Text) {
            PropertyValue::Text(s) => s,
            PropertyValue::Flag(_) => String::new(),
        }
    }

    pub fn bool_property(&self, key: &str) -> bool {
        self.property(key, PropertyKind::Flag)
            .as_flag()
            .unwrap_or(false)
    }

    /// Reads the full canonical property set.
    pub fn read_properties(&self) -> DeviceProperties {
        let mut properties = DeviceProperties::default();
        for property in DeviceProperty::ALL {
            properties.set(property, self.property(property.native_key(), property.kind()));
        }
        properties
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.session.disconnect(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimBackend, SimDevice, SimDeviceSpec, SimFailures};
    use iosdev_core::NativeCode;

    fn session_with(spec: SimDeviceSpec) -> (DeviceSession, Arc<SimDevice>) {
        let backend = SimBackend::new();
        let device = backend.attach(spec, TransportKind::Local);
        let session = DeviceSession::new(Arc::clone(&device) as Arc<dyn NativeDevice>);
        (session, device)
    }

    #[test]
    fn test_only_first_connect_runs_handshake() {
        let (session, device) = session_with(SimDeviceSpec::new("a"));

        session.connect().unwrap();
        session.connect().unwrap();
        assert_eq!(session.open_count(), 2);
        assert_eq!(device.connect_calls(), 1);
        assert!(device.is_session_active());

        session.disconnect(false);
        assert!(device.is_session_active());
        session.disconnect(false);
        assert!(!device.is_session_active());
        assert!(!device.is_connected());
    }

    #[test]
    fn test_disconnect_at_zero_is_noop() {
        let (session, device) = session_with(SimDeviceSpec::new("a"));

        session.disconnect(false);
        session.disconnect(true);
        assert_eq!(session.open_count(), 0);

        session.connect().unwrap();
        assert_eq!(session.open_count(), 1);
        assert_eq!(device.connect_calls(), 1);
    }

    #[test]
    fn test_force_disconnect_ignores_count() {
        let (session, device) = session_with(SimDeviceSpec::new("a"));

        session.connect().unwrap();
        session.connect().unwrap();
        session.connect().unwrap();
        session.disconnect(true);

        assert_eq!(session.open_count(), 0);
        assert!(!device.is_connected());
    }

    #[test]
    fn test_unpaired_device_gets_paired() {
        let (session, device) = session_with(SimDeviceSpec::new("a").unpaired());
        session.connect().unwrap();
        assert!(NativeDevice::is_paired(device.as_ref()));
    }

    #[test]
    fn test_handshake_failures_map_per_step_and_reset() {
        let cases = [
            (
                SimFailures { connect: Some(0x04), ..Default::default() },
                DeviceError::ConnectFailed { code: NativeCode::QUERY_FAILED },
            ),
            (
                SimFailures { validate_pairing: Some(0x25), ..Default::default() },
                DeviceError::PairingInvalid { code: NativeCode::DICT_NOT_LOADED },
            ),
            (
                SimFailures { start_session: Some(0x0b), ..Default::default() },
                DeviceError::SessionStartFailed { code: NativeCode::INVALID_ARGUMENT },
            ),
        ];

        for (failures, expected) in cases {
            let (session, device) = session_with(SimDeviceSpec::new("a").failures(failures));
            assert_eq!(session.connect().unwrap_err(), expected);
            assert_eq!(session.open_count(), 0);
            assert!(!device.is_connected());
        }
    }

    #[test]
    fn test_pair_failure() {
        let spec = SimDeviceSpec::new("a").unpaired().failures(SimFailures {
            pair: Some(0x33),
            ..Default::default()
        });
        let (session, _device) = session_with(spec);
        assert!(matches!(session.connect(), Err(DeviceError::PairingFailed { .. })));
    }

    #[test]
    fn test_guard_balances_count() {
        let (session, _device) = session_with(SimDeviceSpec::new("a"));

        session.connect().unwrap();
        {
            let _guard = session.open().unwrap();
            assert_eq!(session.open_count(), 2);
        }
        assert_eq!(session.open_count(), 1);
    }

    #[test]
    fn test_properties_typed_and_defaulted() {
        let spec = SimDeviceSpec::new("a")
            .property("DeviceName", "Phone")
            .property("DeviceColor", "5")
            .property("TrustedHostAttached", true);
        let (session, _device) = session_with(spec);

        let guard = session.open().unwrap();
        assert_eq!(guard.string_property("DeviceName"), "Phone");
        assert_eq!(guard.string_property("SerialNumber"), "");
        assert!(guard.bool_property("TrustedHostAttached"));
        assert!(!guard.bool_property("DeviceName"));

        let props = guard.read_properties();
        assert_eq!(props.name, "Phone");
        assert_eq!(props.device_color, "Jet Black");
        assert!(props.trusted_host_attached);
    }

    #[test]
    fn test_service_failure_kinds() {
        let spec = SimDeviceSpec::new("a").failures(SimFailures {
            start_service: Some(0x01),
            ..Default::default()
        });
        let (session, _device) = session_with(spec);

        let err = session.start_service("com.example.svc").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to start \"com.example.svc\" service due to system call error (0x1)"
        );
        assert_eq!(session.open_count(), 0);
    }

    #[test]
    fn test_install_maps_known_codes() {
        let spec = SimDeviceSpec::new("a").failures(SimFailures {
            transfer: Some(NativeCode::APP_CONTAINS_SYMLINKS.0),
            ..Default::default()
        });
        let (session, _device) = session_with(spec);
        let err = session.install(Path::new("/tmp/App.app")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to copy app to device: can't install app that contains symlinks"
        );

        let spec = SimDeviceSpec::new("b").failures(SimFailures {
            install: Some(NativeCode::PROVISIONING_FAILED.0),
            ..Default::default()
        });
        let (session, _device) = session_with(spec);
        assert!(session
            .install(Path::new("/tmp/App.app"))
            .unwrap_err()
            .to_string()
            .contains("provisioning profile"));
    }

    #[test]
    fn test_drop_force_closes() {
        let (session, device) = session_with(SimDeviceSpec::new("a"));
        session.connect().unwrap();
        session.connect().unwrap();
        drop(session);
        assert!(!device.is_connected());
    }
}
