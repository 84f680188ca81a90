//! Device registry owned by the watcher.
//!
//! Mutations happen under one lock, held only for the map change. Everything
//! that calls into the device (property probe, session teardown) runs
//! outside it on values cloned or moved out.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use iosdev_core::{DeviceError, DeviceId, DeviceResult, DeviceView, TransportKind};

use crate::backend::{DeviceBackend, NativeDevice};
use crate::device::{DetachedTransport, DeviceRecord};
use crate::runloop::Runtimes;
use crate::session::DeviceSession;

#[derive(Default)]
pub struct Registry {
    records: BTreeMap<DeviceId, DeviceRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, udid: &DeviceId) -> DeviceResult<&DeviceRecord> {
        self.records
            .get(udid)
            .ok_or_else(|| DeviceError::DeviceNotFound(udid.clone()))
    }

    pub fn contains(&self, udid: &DeviceId, transport: TransportKind) -> bool {
        self.records
            .get(udid)
            .map(|r| r.has_transport(transport))
            .unwrap_or(false)
    }

    /// Snapshot of every visible device, ordered by udid.
    pub fn views(&self) -> Vec<DeviceView> {
        self.records.values().map(DeviceRecord::view).collect()
    }

    /// Adds a transport to a known device. Returns false for an unknown device
    /// or a transport that is already present.
    pub fn add_transport(
        &mut self,
        session: Arc<DeviceSession>,
        backend: &Arc<dyn DeviceBackend>,
        runtimes: &Runtimes,
    ) -> bool {
        match self.records.get_mut(session.udid()) {
            Some(record) => record.attach(session, backend, runtimes),
            None => false,
        }
    }

    pub fn insert(&mut self, record: DeviceRecord) {
        self.records.insert(record.udid().clone(), record);
    }

    /// Removes a transport, and the record with it once it was the last one.
    pub fn detach(
        &mut self,
        udid: &DeviceId,
        transport: TransportKind,
    ) -> Option<DetachedTransport> {
        let record = self.records.get_mut(udid)?;
        let detached = record.detach(transport)?;
        if record.is_empty() {
            self.records.remove(udid);
            info!(udid = %udid, "Device removed");
        }
        Some(detached)
    }

    /// Empties the registry.
    pub fn drain(&mut self) -> Vec<DetachedTransport> {
        std::mem::take(&mut self.records)
            .into_values()
            .flat_map(|mut record| record.detach_all())
            .collect()
    }
}

/// Outcome of handling one attach notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// A new device became visible.
    Added,
    /// A known device gained a transport.
    TransportAdded,
    /// The transport was already known.
    Duplicate,
    /// The property probe failed; the device stays invisible.
    ProbeFailed,
}

impl AttachOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Added | Self::TransportAdded)
    }
}

/// Handles an attach: probes a new device once, or adds a transport.
pub fn handle_attach(
    registry: &parking_lot::Mutex<Registry>,
    device: Arc<dyn NativeDevice>,
    backend: &Arc<dyn DeviceBackend>,
    runtimes: &Runtimes,
) -> AttachOutcome {
    let udid = device.udid().clone();
    let transport = device.transport();
    let session = Arc::new(DeviceSession::new(device));

    {
        let mut records = registry.lock();
        if records.contains(&udid, transport) {
            debug!(udid = %udid, transport = %transport, "Duplicate attach ignored");
            return AttachOutcome::Duplicate;
        }
        if records.add_transport(Arc::clone(&session), backend, runtimes) {
            info!(udid = %udid, transport = %transport, "Device transport added");
            return AttachOutcome::TransportAdded;
        }
    }

    let properties = match session.open().map(|guard| guard.read_properties()) {
        Ok(properties) => properties,
        Err(e) => {
            warn!(udid = %udid, transport = %transport, error = %e, "Device probe failed, ignoring device");
            return AttachOutcome::ProbeFailed;
        }
    };

    let mut records = registry.lock();
    if records.add_transport(Arc::clone(&session), backend, runtimes) {
        return AttachOutcome::TransportAdded;
    }
    records.insert(DeviceRecord::new(session, properties, backend, runtimes));
    info!(udid = %udid, transport = %transport, "Device added");
    AttachOutcome::Added
}

/// Handles a detach. Returns true if the device list changed.
pub fn handle_detach(
    registry: &parking_lot::Mutex<Registry>,
    udid: &DeviceId,
    transport: TransportKind,
) -> bool {
    let detached = registry.lock().detach(udid, transport);
    match detached {
        Some(detached) => {
            info!(udid = %udid, transport = %transport, "Device transport removed");
            detached.teardown();
            true
        }
        None => {
            debug!(udid = %udid, transport = %transport, "Detach for unknown transport ignored");
            false
        }
    }
}
