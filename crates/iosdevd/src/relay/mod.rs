//! Relays: device sockets turned into line streams for foreground listeners.
//!
//! # Architecture
//!
//! ```text
//!  run loop thread                          foreground runtime
//! ┌──────────────────┐   MessageQueue    ┌────────────────────┐
//! │ reader task      │ ── push + wake ─▶ │ dispatcher task    │
//! │ (socket bytes →  │                   │ (drain → listeners)│
//! │  LineSplitter)   │                   └─────────┬──────────┘
//! └──────────────────┘                             │ End
//!                                                  ▼
//!                                        close hook: owner forgets
//!                                        the channel
//! ```
//!
//! - [`RelayChannel`] - one socket, one listener set, one queue
//! - [`PortRelayManager`] - channels keyed by device port
//! - [`LogRelay`] - the single channel bound to the device syslog service

mod channel;
mod lines;
mod log;
mod port;

pub use channel::{ChannelId, RelayChannel};
pub use lines::LineSplitter;
pub use log::LogRelay;
pub use port::PortRelayManager;

use std::collections::VecDeque;

use parking_lot::Mutex;

use iosdev_core::DeviceResult;

use crate::listener::Listener;

/// Remote service that streams the device log.
pub const SYSLOG_SERVICE: &str = "com.apple.syslog_relay";

/// One event from a relay stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// One line, separators stripped.
    Data(String),
    /// The stream closed. Nothing follows.
    End,
}

impl RelayMessage {
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }
}

pub type RelayListener = Listener<RelayMessage>;

/// FIFO of messages between the reader and the dispatcher.
#[derive(Debug, Default)]
pub struct MessageQueue {
    messages: Mutex<VecDeque<RelayMessage>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: RelayMessage) {
        self.messages.lock().push_back(message);
    }

    pub fn extend(&self, messages: impl IntoIterator<Item = RelayMessage>) {
        self.messages.lock().extend(messages);
    }

    /// Takes everything queued, in order.
    pub fn drain(&self) -> Vec<RelayMessage> {
        self.messages.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

/// Start/stop capability shared by relay owners.
pub trait Relay {
    /// What a stream is selected by (a port, or nothing for the log).
    type Key;

    fn start(&self, key: Self::Key, listener: RelayListener) -> DeviceResult<()>;

    fn stop(&self, key: Self::Key, listener: &RelayListener);
}
