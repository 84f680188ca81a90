//! In-process simulated device backend.
//!
//! Devices are attached and detached programmatically (tests) or loaded
//! from a TOML file (`iosdevd start --simulate devices.toml`). Every socket
//! the backend hands out is one end of a `UnixStream` pair; the other end
//! (the "peer") plays the device side.
//!
//! Peers are either kept for the caller to drive ([`PeerMode::Manual`]) or
//! served by a helper thread ([`PeerMode::Serve`]): port peers echo what
//! they receive and the syslog peer writes the device's scripted lines.
//!
//! # Example file
//!
//! ```toml
//! [[device]]
//! udid = "00008030-001A2B3C4D5E6F70"
//! transports = ["USB", "Wi-Fi"]
//! syslog = ["kernel[0] <Notice>: booted"]
//!
//! [device.properties]
//! DeviceName = "Test iPhone"
//! ProductVersion = "17.4"
//! DeviceColor = "1"
//! TrustedHostAttached = true
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use iosdev_core::{DeviceId, NativeCode, PropertyValue, TransportKind};

use super::{
    DeviceBackend, DeviceNotification, DeviceSocket, NativeDevice, NativeResult, NotificationSink,
    Subscription,
};
use crate::config::ConfigError;
use crate::relay::SYSLOG_SERVICE;

/// Code returned when a simulated port refuses connections.
pub const PORT_REFUSED: NativeCode = NativeCode(0x03);

// ============================================================================
// Device Scripts
// ============================================================================

/// Native codes a simulated device fails individual steps with.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimFailures {
    pub connect: Option<i32>,
    pub pair: Option<i32>,
    pub validate_pairing: Option<i32>,
    pub start_session: Option<i32>,
    pub start_service: Option<i32>,
    pub transfer: Option<i32>,
    pub install: Option<i32>,
}

/// Description of a simulated device.
#[derive(Debug, Clone, Deserialize)]
pub struct SimDeviceSpec {
    pub udid: DeviceId,

    /// Transports attached when loaded from a file.
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportKind>,

    /// Property values keyed by native key (`DeviceName`, `ProductVersion`, ...).
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,

    #[serde(default = "default_paired")]
    pub paired: bool,

    /// Lines the syslog service emits when served.
    #[serde(default)]
    pub syslog: Vec<String>,

    #[serde(default)]
    pub failures: SimFailures,
}

fn default_transports() -> Vec<TransportKind> {
    vec![TransportKind::Local]
}

fn default_paired() -> bool {
    true
}

impl SimDeviceSpec {
    pub fn new(udid: impl Into<DeviceId>) -> Self {
        Self {
            udid: udid.into(),
            transports: default_transports(),
            properties: BTreeMap::new(),
            paired: true,
            syslog: Vec::new(),
            failures: SimFailures::default(),
        }
    }

    pub fn property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn unpaired(mut self) -> Self {
        self.paired = false;
        self
    }

    pub fn failures(mut self, failures: SimFailures) -> Self {
        self.failures = failures;
        self
    }
}

/// Devices to attach at startup, as read from a `--simulate` file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimConfig {
    #[serde(rename = "device", default)]
    pub devices: Vec<SimDeviceSpec>,
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }
}

// ============================================================================
// Simulated Device
// ============================================================================

#[derive(Debug, Default)]
struct SimDeviceState {
    connected: bool,
    session_active: bool,
    paired: bool,
    connect_calls: u32,
    installed: Vec<PathBuf>,
}

/// One transport of a simulated device.
pub struct SimDevice {
    udid: DeviceId,
    transport: TransportKind,
    connection_id: u32,
    spec: SimDeviceSpec,
    state: Mutex<SimDeviceState>,
    backend: Weak<SimInner>,
}

impl SimDevice {
    fn fail(code: Option<i32>) -> NativeResult<()> {
        match code {
            Some(code) => Err(NativeCode(code)),
            None => Ok(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn is_session_active(&self) -> bool {
        self.state.lock().session_active
    }

    /// Number of times the library connection was opened.
    pub fn connect_calls(&self) -> u32 {
        self.state.lock().connect_calls
    }

    pub fn installed(&self) -> Vec<PathBuf> {
        self.state.lock().installed.clone()
    }

    fn socket(&self, endpoint: SimEndpoint) -> NativeResult<DeviceSocket> {
        let backend = self.backend.upgrade().ok_or(NativeCode::SYSCALL)?;
        backend.open_socket(&self.spec, endpoint)
    }
}

impl NativeDevice for SimDevice {
    fn udid(&self) -> &DeviceId {
        &self.udid
    }

    fn transport(&self) -> TransportKind {
        self.transport
    }

    fn connect(&self) -> NativeResult<()> {
        Self::fail(self.spec.failures.connect)?;
        let mut state = self.state.lock();
        state.connected = true;
        state.connect_calls += 1;
        Ok(())
    }

    fn disconnect(&self) -> NativeResult<()> {
        self.state.lock().connected = false;
        Ok(())
    }

    fn is_paired(&self) -> bool {
        self.state.lock().paired
    }

    fn pair(&self) -> NativeResult<()> {
        Self::fail(self.spec.failures.pair)?;
        self.state.lock().paired = true;
        Ok(())
    }

    fn validate_pairing(&self) -> NativeResult<()> {
        Self::fail(self.spec.failures.validate_pairing)?;
        if self.state.lock().paired {
            Ok(())
        } else {
            Err(NativeCode::DICT_NOT_LOADED)
        }
    }

    fn start_session(&self) -> NativeResult<()> {
        Self::fail(self.spec.failures.start_session)?;
        let mut state = self.state.lock();
        if !state.connected {
            return Err(NativeCode::INVALID_ARGUMENT);
        }
        state.session_active = true;
        Ok(())
    }

    fn stop_session(&self) -> NativeResult<()> {
        self.state.lock().session_active = false;
        Ok(())
    }

    fn copy_value(&self, key: &str) -> Option<PropertyValue> {
        self.spec.properties.get(key).cloned()
    }

    fn start_service(&self, name: &str) -> NativeResult<DeviceSocket> {
        Self::fail(self.spec.failures.start_service)?;
        if !self.state.lock().session_active {
            return Err(NativeCode::INVALID_ARGUMENT);
        }
        self.socket(SimEndpoint::Service(name.to_string()))
    }

    fn connection_id(&self) -> u32 {
        self.connection_id
    }

    fn transfer_app(&self, _path: &Path) -> NativeResult<()> {
        Self::fail(self.spec.failures.transfer)
    }

    fn install_app(&self, path: &Path) -> NativeResult<()> {
        Self::fail(self.spec.failures.install)?;
        self.state.lock().installed.push(path.to_path_buf());
        Ok(())
    }
}

// ============================================================================
// Simulated Backend
// ============================================================================

/// Device-side endpoint a socket was opened to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SimEndpoint {
    Port(u16),
    Service(String),
}

/// What happens to the device side of each socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    /// Peers are parked for [`SimBackend::take_peer`].
    Manual,
    /// Peers are served by helper threads.
    Serve,
}

struct SimInner {
    mode: PeerMode,
    devices: Mutex<BTreeMap<(DeviceId, TransportKind), Arc<SimDevice>>>,
    sinks: Mutex<HashMap<u64, NotificationSink>>,
    next_sink: AtomicU64,
    next_connection: AtomicU32,
    subscribe_error: Mutex<Option<NativeCode>>,
    refused_ports: Mutex<HashSet<u16>>,
    peers: Mutex<HashMap<(DeviceId, SimEndpoint), Vec<DeviceSocket>>>,
}

impl SimInner {
    fn open_socket(&self, spec: &SimDeviceSpec, endpoint: SimEndpoint) -> NativeResult<DeviceSocket> {
        let (ours, peer) = DeviceSocket::pair().map_err(|e| {
            warn!(error = %e, "Failed to create simulated socket pair");
            NativeCode::SYSCALL
        })?;

        debug!(udid = %spec.udid, endpoint = ?endpoint, "Simulated socket opened");

        match self.mode {
            PeerMode::Manual => {
                self.peers
                    .lock()
                    .entry((spec.udid.clone(), endpoint))
                    .or_default()
                    .push(peer);
            }
            PeerMode::Serve => serve_peer(peer, spec, endpoint),
        }

        Ok(ours)
    }

    fn sinks(&self) -> Vec<NotificationSink> {
        self.sinks.lock().values().cloned().collect()
    }

    fn notify(&self, notification: DeviceNotification) {
        for sink in self.sinks() {
            sink(notification.clone());
        }
    }
}

/// Simulated device communication library.
#[derive(Clone)]
pub struct SimBackend {
    inner: Arc<SimInner>,
}

impl SimBackend {
    /// Creates a backend whose peers are parked for the caller.
    pub fn new() -> Self {
        Self::with_mode(PeerMode::Manual)
    }

    pub fn with_mode(mode: PeerMode) -> Self {
        Self {
            inner: Arc::new(SimInner {
                mode,
                devices: Mutex::new(BTreeMap::new()),
                sinks: Mutex::new(HashMap::new()),
                next_sink: AtomicU64::new(0),
                next_connection: AtomicU32::new(1),
                subscribe_error: Mutex::new(None),
                refused_ports: Mutex::new(HashSet::new()),
                peers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a serving backend with the configured devices attached.
    pub fn from_config(config: SimConfig) -> Self {
        let backend = Self::with_mode(PeerMode::Serve);
        for spec in config.devices {
            for transport in spec.transports.clone() {
                backend.attach(spec.clone(), transport);
            }
        }
        backend
    }

    /// Attaches a transport of a device and notifies subscribers.
    pub fn attach(&self, spec: SimDeviceSpec, transport: TransportKind) -> Arc<SimDevice> {
        let device = Arc::new(SimDevice {
            udid: spec.udid.clone(),
            transport,
            connection_id: self.inner.next_connection.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(SimDeviceState {
                paired: spec.paired,
                ..Default::default()
            }),
            spec,
            backend: Arc::downgrade(&self.inner),
        });

        self.inner
            .devices
            .lock()
            .insert((device.udid.clone(), transport), Arc::clone(&device));

        trace!(udid = %device.udid, transport = %transport, "Simulated attach");
        self.inner
            .notify(DeviceNotification::Attached(Arc::clone(&device) as Arc<dyn NativeDevice>));

        device
    }

    /// Detaches a transport of a device and notifies subscribers.
    pub fn detach(&self, udid: &DeviceId, transport: TransportKind) {
        let removed = self
            .inner
            .devices
            .lock()
            .remove(&(udid.clone(), transport))
            .is_some();

        if removed {
            trace!(udid = %udid, transport = %transport, "Simulated detach");
            self.inner.notify(DeviceNotification::Detached {
                udid: udid.clone(),
                transport,
            });
        }
    }

    pub fn device(&self, udid: &DeviceId, transport: TransportKind) -> Option<Arc<SimDevice>> {
        self.inner.devices.lock().get(&(udid.clone(), transport)).cloned()
    }

    /// Takes the oldest parked peer for an endpoint.
    pub fn take_peer(&self, udid: &DeviceId, endpoint: SimEndpoint) -> Option<DeviceSocket> {
        let mut peers = self.inner.peers.lock();
        let queue = peers.get_mut(&(udid.clone(), endpoint))?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    /// Makes the next `subscribe` call fail.
    pub fn fail_subscribe(&self, code: NativeCode) {
        *self.inner.subscribe_error.lock() = Some(code);
    }

    pub fn refuse_port(&self, port: u16) {
        self.inner.refused_ports.lock().insert(port);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sinks.lock().len()
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for SimBackend {
    fn subscribe(&self, sink: NotificationSink) -> NativeResult<Subscription> {
        if let Some(code) = self.inner.subscribe_error.lock().take() {
            return Err(code);
        }

        let id = self.inner.next_sink.fetch_add(1, Ordering::Relaxed);
        self.inner.sinks.lock().insert(id, Arc::clone(&sink));

        let attached: Vec<Arc<SimDevice>> = self.inner.devices.lock().values().cloned().collect();
        for device in attached {
            sink(DeviceNotification::Attached(device as Arc<dyn NativeDevice>));
        }

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.sinks.lock().remove(&id);
            }
        }))
    }

    fn connect_port(&self, connection_id: u32, port: u16) -> NativeResult<DeviceSocket> {
        if self.inner.refused_ports.lock().contains(&port) {
            return Err(PORT_REFUSED);
        }

        let device = self
            .inner
            .devices
            .lock()
            .values()
            .find(|d| d.connection_id == connection_id)
            .cloned()
            .ok_or(NativeCode::INVALID_ARGUMENT)?;

        self.inner.open_socket(&device.spec, SimEndpoint::Port(port))
    }
}

// ============================================================================
// Peer Service
// ============================================================================

fn serve_peer(peer: DeviceSocket, spec: &SimDeviceSpec, endpoint: SimEndpoint) {
    let name = format!("sim-peer-{}", spec.udid);
    let lines = spec.syslog.clone();

    let result = std::thread::Builder::new().name(name).spawn(move || match endpoint {
        SimEndpoint::Port(_) => echo(peer),
        SimEndpoint::Service(ref svc) if svc.as_str() == SYSLOG_SERVICE => replay(peer, &lines),
        SimEndpoint::Service(_) => drain(peer),
    });

    if let Err(e) = result {
        warn!(error = %e, "Failed to spawn simulated peer thread");
    }
}

fn echo(mut peer: DeviceSocket) {
    let mut buf = [0u8; 4096];
    loop {
        match peer.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let Some(chunk) = buf.get(..n) else { return };
                if peer.write_all(chunk).is_err() {
                    return;
                }
            }
        }
    }
}

fn replay(mut peer: DeviceSocket, lines: &[String]) {
    for line in lines {
        if peer.write_all(line.as_bytes()).is_err() || peer.write_all(b"\n").is_err() {
            return;
        }
    }
    drain(peer);
}

/// Holds the peer open until the host side closes.
fn drain(mut peer: DeviceSocket) {
    let mut buf = [0u8; 512];
    while matches!(peer.read(&mut buf), Ok(n) if n > 0) {}
}
