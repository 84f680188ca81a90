//! Foreground listener handles.
//!
//! A listener is a callback with a process-unique identity. Sets of
//! listeners compare by identity only, so the same closure registered twice
//! through two `Listener::new` calls counts as two listeners.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Callback invoked on the foreground runtime.
pub struct Listener<E> {
    id: ListenerId,
    callback: Arc<dyn Fn(E) + Send + Sync>,
}

impl<E> Listener<E> {
    pub fn new(callback: impl Fn(E) + Send + Sync + 'static) -> Self {
        Self {
            id: ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed)),
            callback: Arc::new(callback),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn deliver(&self, event: E) {
        (self.callback)(event);
    }
}

impl<E: Send + 'static> Listener<E> {
    /// Creates a listener that forwards every event into a channel.
    ///
    /// Events sent after the receiver is dropped are discarded.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Self::new(move |event| {
            let _ = tx.send(event);
        });
        (listener, rx)
    }
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<E> PartialEq for Listener<E> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<E> Eq for Listener<E> {}

impl<E> fmt::Debug for Listener<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener").field(&self.id).finish()
    }
}

/// Ordered set of listeners, unique by identity.
pub struct ListenerSet<E> {
    listeners: Vec<Listener<E>>,
}

impl<E> ListenerSet<E> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Adds a listener. Returns true if the set was empty before.
    pub fn add(&mut self, listener: Listener<E>) -> bool {
        let was_empty = self.listeners.is_empty();
        if !self.listeners.contains(&listener) {
            self.listeners.push(listener);
        }
        was_empty
    }

    /// Removes a listener. Returns true if this emptied the set.
    pub fn remove(&mut self, listener: &Listener<E>) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l != listener);
        before > 0 && self.listeners.is_empty()
    }

    pub fn contains(&self, listener: &Listener<E>) -> bool {
        self.listeners.contains(listener)
    }

    pub fn snapshot(&self) -> Vec<Listener<E>> {
        self.listeners.clone()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl<E> Default for ListenerSet<E> {
    fn default() -> Self {
        Self::new()
    }
}
