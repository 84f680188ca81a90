//! Per-device registry entries.
//!
//! A [`DeviceRecord`] groups the live transports of one physical device. The
//! cable transport also carries the device's relays, which are bound to that
//! session and dropped with it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use iosdev_core::{DeviceError, DeviceId, DeviceProperties, DeviceResult, DeviceView, TransportKind};

use crate::backend::DeviceBackend;
use crate::relay::{LogRelay, PortRelayManager};
use crate::runloop::Runtimes;
use crate::session::DeviceSession;

/// Relays that need the cable connection.
pub struct CableRelays {
    pub ports: PortRelayManager,
    pub log: LogRelay,
}

impl CableRelays {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        session: Arc<DeviceSession>,
        runtimes: Runtimes,
    ) -> Self {
        Self {
            ports: PortRelayManager::new(backend, Arc::clone(&session), runtimes.clone()),
            log: LogRelay::new(session, runtimes),
        }
    }

    /// Ends every relay. Listeners receive End.
    pub fn shutdown(&self) {
        self.ports.shutdown();
        self.log.shutdown();
    }
}

/// What a detach removed from a record. Torn down outside the registry lock.
pub struct DetachedTransport {
    pub session: Arc<DeviceSession>,
    pub relays: Option<Arc<CableRelays>>,
}

impl DetachedTransport {
    /// Force-closes the session and ends its relays.
    pub fn teardown(self) {
        if let Some(relays) = &self.relays {
            relays.shutdown();
        }
        self.session.disconnect(true);
    }
}

pub struct DeviceRecord {
    udid: DeviceId,
    sessions: BTreeMap<TransportKind, Arc<DeviceSession>>,
    properties: DeviceProperties,
    first_seen: DateTime<Utc>,
    relays: Option<Arc<CableRelays>>,
}

impl DeviceRecord {
    /// Creates a record from its first transport and the probed properties.
    pub fn new(
        session: Arc<DeviceSession>,
        properties: DeviceProperties,
        backend: &Arc<dyn DeviceBackend>,
        runtimes: &Runtimes,
    ) -> Self {
        let mut record = Self {
            udid: session.udid().clone(),
            sessions: BTreeMap::new(),
            properties,
            first_seen: Utc::now(),
            relays: None,
        };
        record.attach(session, backend, runtimes);
        record
    }

    pub fn udid(&self) -> &DeviceId {
        &self.udid
    }

    pub fn has_transport(&self, transport: TransportKind) -> bool {
        self.sessions.contains_key(&transport)
    }

    /// Adds a transport. Returns false if it was already present.
    pub fn attach(
        &mut self,
        session: Arc<DeviceSession>,
        backend: &Arc<dyn DeviceBackend>,
        runtimes: &Runtimes,
    ) -> bool {
        let transport = session.transport();
        if self.sessions.contains_key(&transport) {
            return false;
        }

        if transport == TransportKind::Local {
            self.relays = Some(Arc::new(CableRelays::new(
                Arc::clone(backend),
                Arc::clone(&session),
                runtimes.clone(),
            )));
        }
        self.sessions.insert(transport, session);
        true
    }

    /// Removes a transport, handing back what must be torn down.
    pub fn detach(&mut self, transport: TransportKind) -> Option<DetachedTransport> {
        let session = self.sessions.remove(&transport)?;
        let relays = match transport {
            TransportKind::Local => self.relays.take(),
            TransportKind::Network => None,
        };
        Some(DetachedTransport { session, relays })
    }

    /// Removes every transport.
    pub fn detach_all(&mut self) -> Vec<DetachedTransport> {
        let transports: Vec<TransportKind> = self.sessions.keys().copied().collect();
        transports
            .into_iter()
            .filter_map(|transport| self.detach(transport))
            .collect()
    }

    /// True once no transport is left; such a record must leave the registry.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Live transports, cable first.
    pub fn interfaces(&self) -> Vec<TransportKind> {
        self.sessions.keys().copied().collect()
    }

    pub fn view(&self) -> DeviceView {
        DeviceView {
            udid: self.udid.clone(),
            interfaces: self.interfaces(),
            properties: self.properties.clone(),
            first_seen: self.first_seen,
        }
    }

    /// The session to install over: the cable if present, else the network.
    pub fn install_session(&self) -> DeviceResult<Arc<DeviceSession>> {
        self.sessions
            .get(&TransportKind::Local)
            .or_else(|| self.sessions.get(&TransportKind::Network))
            .cloned()
            .ok_or_else(|| DeviceError::NoTransportAvailable(self.udid.clone()))
    }

    /// The cable relays, or `CableRequired` naming the operation.
    pub fn cable_relays(&self, operation: &'static str) -> DeviceResult<Arc<CableRelays>> {
        self.relays
            .clone()
            .ok_or(DeviceError::CableRequired { operation })
    }

    /// Cable relays if present, for stop operations that tolerate absence.
    pub fn relays(&self) -> Option<Arc<CableRelays>> {
        self.relays.clone()
    }
}
