//! Device error types following panic-free policy.
//!
//! Native library calls fail with a numeric code. Each operation maps those
//! codes to its own error variant so callers see which step failed.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::DeviceId;

// ============================================================================
// Native Codes
// ============================================================================

/// Status code returned by the device communication library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeCode(pub i32);

impl NativeCode {
    pub const OK: NativeCode = NativeCode(0);
    /// A system call inside the library failed.
    pub const SYSCALL: NativeCode = NativeCode(0x01);
    /// The device multiplexing daemon did not answer a query.
    pub const QUERY_FAILED: NativeCode = NativeCode(0x04);
    pub const INVALID_ARGUMENT: NativeCode = NativeCode(0x0b);
    /// The pairing record dictionary could not be loaded.
    pub const DICT_NOT_LOADED: NativeCode = NativeCode(0x25);
    /// The app bundle contains symlinks (0xe8000007).
    pub const APP_CONTAINS_SYMLINKS: NativeCode = NativeCode(-402_653_177);
    /// The provisioning profile does not allow the install (0xe8008015).
    pub const PROVISIONING_FAILED: NativeCode = NativeCode(-402_620_395);

    pub fn is_ok(&self) -> bool {
        *self == Self::OK
    }
}

impl fmt::Display for NativeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0 as u32)
    }
}

/// Why a remote service failed to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceFailure {
    SystemCall,
    InvalidArgument,
    Other,
}

impl ServiceFailure {
    pub fn from_code(code: NativeCode) -> Self {
        match code {
            NativeCode::SYSCALL => Self::SystemCall,
            NativeCode::INVALID_ARGUMENT => Self::InvalidArgument,
            _ => Self::Other,
        }
    }
}

// ============================================================================
// Device Errors
// ============================================================================

/// Errors that can occur in device operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Failed to connect to device{}", connect_detail(.code))]
    ConnectFailed { code: NativeCode },

    #[error("Failed to pair device")]
    PairingFailed { code: NativeCode },

    #[error("Device is not paired{}", pairing_detail(.code))]
    PairingInvalid { code: NativeCode },

    #[error("Failed to start session{}", session_detail(.code))]
    SessionStartFailed { code: NativeCode },

    #[error("Failed to start \"{service}\" service{} ({code})", service_detail(.kind))]
    ServiceStartFailed {
        service: String,
        kind: ServiceFailure,
        code: NativeCode,
    },

    #[error("Failed to connect to port {port}")]
    PortConnectFailed { port: u16 },

    #[error("Device \"{0}\" not found")]
    DeviceNotFound(DeviceId),

    #[error("No interfaces found for device {0}")]
    NoTransportAvailable(DeviceId),

    #[error("{operation} requires a USB connected iOS device")]
    CableRequired { operation: &'static str },

    #[error("{0}")]
    InvalidArgument(String),

    #[error("App not found: {}", .0.display())]
    AppNotFound(PathBuf),

    #[error("Invalid app: {}", .0.display())]
    InvalidApp(PathBuf),

    #[error("{}", transfer_detail(.code))]
    TransferFailed { code: NativeCode },

    #[error("{}", install_detail(.code))]
    InstallFailed { code: NativeCode },

    #[error("Failed to subscribe to device notifications ({code})")]
    SubscribeFailed { code: NativeCode },

    #[error("Device socket error: {0}")]
    Socket(String),

    #[error("Failed to start device run loop: {0}")]
    RunLoop(String),

    #[error("Device watcher is not running")]
    WatcherStopped,
}

impl DeviceError {
    /// Builds a service start error, classifying the native code.
    pub fn service_start(service: impl Into<String>, code: NativeCode) -> Self {
        Self::ServiceStartFailed {
            service: service.into(),
            kind: ServiceFailure::from_code(code),
            code,
        }
    }

    /// Stable machine-readable code for the wire protocol.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectFailed { .. } => "connect_failed",
            Self::PairingFailed { .. } => "pairing_failed",
            Self::PairingInvalid { .. } => "pairing_invalid",
            Self::SessionStartFailed { .. } => "session_start_failed",
            Self::ServiceStartFailed { .. } => "service_start_failed",
            Self::PortConnectFailed { .. } => "port_connect_failed",
            Self::DeviceNotFound(_) => "device_not_found",
            Self::NoTransportAvailable(_) => "no_transport_available",
            Self::CableRequired { .. } => "cable_required",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::AppNotFound(_) => "app_not_found",
            Self::InvalidApp(_) => "invalid_app",
            Self::TransferFailed { .. } => "transfer_failed",
            Self::InstallFailed { .. } => "install_failed",
            Self::SubscribeFailed { .. } => "subscribe_failed",
            Self::Socket(_) => "socket_error",
            Self::RunLoop(_) => "run_loop_failed",
            Self::WatcherStopped => "watcher_stopped",
        }
    }
}

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

fn connect_detail(code: &NativeCode) -> String {
    match *code {
        NativeCode::SYSCALL => ": setsockopt() failed".to_string(),
        NativeCode::QUERY_FAILED => ": the daemon query failed".to_string(),
        NativeCode::INVALID_ARGUMENT => {
            ": invalid argument, USBMuxConnectByPort returned 0xffffffff".to_string()
        }
        other => format!(" ({other})"),
    }
}

fn pairing_detail(code: &NativeCode) -> String {
    match *code {
        NativeCode::INVALID_ARGUMENT => ": the device is null".to_string(),
        NativeCode::DICT_NOT_LOADED => ": load_dict() failed".to_string(),
        other => format!(" ({other})"),
    }
}

fn session_detail(code: &NativeCode) -> String {
    match *code {
        NativeCode::INVALID_ARGUMENT => {
            ": the lockdown connection has not been established".to_string()
        }
        NativeCode::DICT_NOT_LOADED => ": load_dict() failed".to_string(),
        other => format!(" ({other})"),
    }
}

fn service_detail(kind: &ServiceFailure) -> &'static str {
    match *kind {
        ServiceFailure::SystemCall => " due to system call error",
        ServiceFailure::InvalidArgument => " due to invalid argument",
        ServiceFailure::Other => "",
    }
}

fn transfer_detail(code: &NativeCode) -> String {
    match *code {
        NativeCode::APP_CONTAINS_SYMLINKS => {
            "Failed to copy app to device: can't install app that contains symlinks".to_string()
        }
        other => format!("Failed to transfer app to device ({other})"),
    }
}

fn install_detail(code: &NativeCode) -> String {
    match *code {
        NativeCode::PROVISIONING_FAILED => {
            "Failed to install app on device: most likely a provisioning profile issue".to_string()
        }
        other => format!("Failed to install app on device ({other})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_code_display_is_unsigned_hex() {
        assert_eq!(NativeCode(0x25).to_string(), "0x25");
        assert_eq!(NativeCode::APP_CONTAINS_SYMLINKS.to_string(), "0xe8000007");
        assert_eq!(NativeCode::PROVISIONING_FAILED.to_string(), "0xe8008015");
    }

    #[test]
    fn test_connect_messages() {
        let msg = |c| DeviceError::ConnectFailed { code: c }.to_string();
        assert_eq!(msg(NativeCode::SYSCALL), "Failed to connect to device: setsockopt() failed");
        assert_eq!(msg(NativeCode::QUERY_FAILED), "Failed to connect to device: the daemon query failed");
        assert_eq!(
            msg(NativeCode::INVALID_ARGUMENT),
            "Failed to connect to device: invalid argument, USBMuxConnectByPort returned 0xffffffff"
        );
        assert_eq!(msg(NativeCode(0x99)), "Failed to connect to device (0x99)");
    }

    #[test]
    fn test_pairing_and_session_messages() {
        assert_eq!(
            DeviceError::PairingInvalid { code: NativeCode::INVALID_ARGUMENT }.to_string(),
            "Device is not paired: the device is null"
        );
        assert_eq!(
            DeviceError::PairingInvalid { code: NativeCode(0x7) }.to_string(),
            "Device is not paired (0x7)"
        );
        assert_eq!(
            DeviceError::SessionStartFailed { code: NativeCode::DICT_NOT_LOADED }.to_string(),
            "Failed to start session: load_dict() failed"
        );
        assert_eq!(
            DeviceError::PairingFailed { code: NativeCode(3) }.to_string(),
            "Failed to pair device"
        );
    }

    #[test]
    fn test_service_messages_by_kind() {
        let err = DeviceError::service_start("com.apple.syslog_relay", NativeCode::SYSCALL);
        assert_eq!(
            err.to_string(),
            "Failed to start \"com.apple.syslog_relay\" service due to system call error (0x1)"
        );

        let err = DeviceError::service_start("svc", NativeCode::INVALID_ARGUMENT);
        assert_eq!(err.to_string(), "Failed to start \"svc\" service due to invalid argument (0xb)");

        let err = DeviceError::service_start("svc", NativeCode(0x42));
        assert_eq!(err.to_string(), "Failed to start \"svc\" service (0x42)");
    }

    #[test]
    fn test_install_messages() {
        assert_eq!(
            DeviceError::TransferFailed { code: NativeCode::APP_CONTAINS_SYMLINKS }.to_string(),
            "Failed to copy app to device: can't install app that contains symlinks"
        );
        assert_eq!(
            DeviceError::InstallFailed { code: NativeCode::PROVISIONING_FAILED }.to_string(),
            "Failed to install app on device: most likely a provisioning profile issue"
        );
        assert_eq!(
            DeviceError::InstallFailed { code: NativeCode(0x2) }.to_string(),
            "Failed to install app on device (0x2)"
        );
    }

    #[test]
    fn test_cable_required_and_lookup_messages() {
        assert_eq!(
            DeviceError::CableRequired { operation: "syslog" }.to_string(),
            "syslog requires a USB connected iOS device"
        );
        assert_eq!(
            DeviceError::DeviceNotFound(DeviceId::new("abc")).to_string(),
            "Device \"abc\" not found"
        );
        assert_eq!(DeviceError::WatcherStopped.code(), "watcher_stopped");
    }
}
