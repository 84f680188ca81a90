//! iosdev Protocol - Wire protocol for daemon communication
//!
//! This crate provides the newline-delimited JSON messages exchanged
//! between the iosdev daemon and its clients.

pub mod message;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, MessageType, RelaySource};
pub use version::{ProtocolVersion, VersionError};
