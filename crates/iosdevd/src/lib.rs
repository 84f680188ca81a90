//! iosdev daemon - device watcher, sessions and relays
//!
//! This crate provides the core infrastructure for the iosdev daemon:
//! - `watcher` - Tracks attached devices and serves device operations
//! - `session` - Ref-counted device sessions with scoped guards
//! - `relay` - Port forwarding and syslog streams as line events
//! - `server` - Unix socket server for client connections
//! - `client` - Client side of the daemon socket
//! - `backend` - Seam to the device communication library, plus a simulator
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       iosdevd daemon                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  DaemonServer   │────▶│       DeviceWatcher         │   │
//! │  │ (Unix Socket)   │     │  (registry of DeviceRecord) │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ connections                 │ per device        │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ConnectionHandler│◀────│ DeviceSession, PortRelay-   │   │
//! │  │  (per client)   │     │ Manager, LogRelay           │   │
//! │  └─────────────────┘     └──────────────┬──────────────┘   │
//! │                                         │                   │
//! │                          ┌──────────────▼──────────────┐   │
//! │                          │ RunLoop thread (backend     │   │
//! │                          │ notifications, socket reads)│   │
//! │                          └─────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod backend;
pub mod client;
pub mod config;
pub mod device;
pub mod listener;
pub mod relay;
pub mod runloop;
pub mod server;
pub mod session;
pub mod wake;
pub mod watcher;

pub use config::{DaemonConfig, WatcherConfig};
pub use listener::{Listener, ListenerId};
pub use relay::{RelayListener, RelayMessage};
pub use watcher::{DeviceWatcher, WatchEvent, WatchListener};
