//! iosdev Core - Shared types for iOS device watching
//!
//! This crate provides the core domain types shared between
//! the daemon (iosdevd), its wire protocol and the CLI client.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod device;
pub mod error;

// Re-exports for convenience
pub use device::{
    normalize_device_color, DeviceColor, DeviceId, DeviceProperties, DeviceProperty, DeviceView,
    PropertyKind, PropertyValue, TransportKind,
};
pub use error::{DeviceError, DeviceResult, NativeCode, ServiceFailure};
