//! Protocol message types for daemon communication.

use std::path::PathBuf;

use crate::version::ProtocolVersion;
use iosdev_core::{DeviceError, DeviceId, DeviceView};
use serde::{Deserialize, Serialize};

/// Message types that can be sent by clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake/connection request
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Request the current device list
    ListDevices,

    /// Subscribe to device list changes
    Watch,

    /// Stop receiving device list changes
    Unwatch,

    /// Start relaying a device port. The port is range-checked by the
    /// daemon so an out-of-range value gets a proper error reply.
    StartForward { udid: DeviceId, port: i64 },

    StopForward { udid: DeviceId, port: i64 },

    /// Start relaying the device log
    StartSyslog { udid: DeviceId },

    StopSyslog { udid: DeviceId },

    /// Install an app bundle on a device
    Install { udid: DeviceId, app_path: PathBuf },

    /// Ping to check connection
    Ping { seq: u64 },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn list_devices() -> Self {
        Self::new(MessageType::ListDevices)
    }

    pub fn watch() -> Self {
        Self::new(MessageType::Watch)
    }

    pub fn unwatch() -> Self {
        Self::new(MessageType::Unwatch)
    }

    pub fn start_forward(udid: impl Into<DeviceId>, port: u16) -> Self {
        Self::new(MessageType::StartForward {
            udid: udid.into(),
            port: i64::from(port),
        })
    }

    pub fn stop_forward(udid: impl Into<DeviceId>, port: u16) -> Self {
        Self::new(MessageType::StopForward {
            udid: udid.into(),
            port: i64::from(port),
        })
    }

    pub fn start_syslog(udid: impl Into<DeviceId>) -> Self {
        Self::new(MessageType::StartSyslog { udid: udid.into() })
    }

    pub fn stop_syslog(udid: impl Into<DeviceId>) -> Self {
        Self::new(MessageType::StopSyslog { udid: udid.into() })
    }

    pub fn install(udid: impl Into<DeviceId>, app_path: impl Into<PathBuf>) -> Self {
        Self::new(MessageType::Install {
            udid: udid.into(),
            app_path: app_path.into(),
        })
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Where relayed lines come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelaySource {
    Port { port: u16 },
    Syslog,
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// Full device list response
    DeviceList { devices: Vec<DeviceView> },

    /// Device list after a visibility or interface change
    DevicesChanged { devices: Vec<DeviceView> },

    /// One line from a relay
    RelayData {
        udid: DeviceId,
        source: RelaySource,
        line: String,
    },

    /// The relay closed; no more lines follow for this source
    RelayEnd { udid: DeviceId, source: RelaySource },

    /// Request succeeded with nothing to return
    Ok,

    Pong { seq: u64 },

    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn device_list(devices: Vec<DeviceView>) -> Self {
        Self::DeviceList { devices }
    }

    pub fn devices_changed(devices: Vec<DeviceView>) -> Self {
        Self::DevicesChanged { devices }
    }

    pub fn relay_data(udid: DeviceId, source: RelaySource, line: String) -> Self {
        Self::RelayData { udid, source, line }
    }

    pub fn relay_end(udid: DeviceId, source: RelaySource) -> Self {
        Self::RelayEnd { udid, source }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }

    /// Creates an error response carrying the device error's code.
    pub fn device_error(err: &DeviceError) -> Self {
        Self::error_with_code(&err.to_string(), err.code())
    }
}
