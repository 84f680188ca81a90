//! Startup settle debounce.
//!
//! Every notification re-arms a deferred timer on the run loop. The watcher
//! counts as settled once a full window passes with no new notification.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;
use tracing::trace;

pub struct SettleTimer {
    window: Duration,
    generation: AtomicU64,
    settled: Mutex<bool>,
    cond: Condvar,
}

impl SettleTimer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            generation: AtomicU64::new(0),
            settled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Restarts the window. A timer armed earlier no longer counts.
    pub fn rearm(self: &Arc<Self>, background: &Handle) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let timer = Arc::clone(self);

        background.spawn(async move {
            tokio::time::sleep(timer.window).await;
            if timer.generation.load(Ordering::SeqCst) == generation {
                timer.mark_settled();
            }
        });
    }

    fn mark_settled(&self) {
        let mut settled = self.settled.lock();
        if !*settled {
            *settled = true;
            trace!("Device watcher settled");
        }
        self.cond.notify_all();
    }

    pub fn is_settled(&self) -> bool {
        *self.settled.lock()
    }

    /// Blocks the calling thread until settled or `timeout` passes.
    /// Returns whether the watcher settled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut settled = self.settled.lock();
        while !*settled {
            if self.cond.wait_until(&mut settled, deadline).timed_out() {
                break;
            }
        }
        *settled
    }
}
