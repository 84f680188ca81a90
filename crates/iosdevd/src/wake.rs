//! Cross-thread wake primitive.
//!
//! The background side queues data under a lock and calls
//! [`WakeSource::signal`]. A dispatcher task on the foreground runtime wakes
//! and drains. Signals raised before the dispatcher runs coalesce into a
//! single dispatch, so the dispatch callback must drain everything queued.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

pub struct WakeSource {
    notify: Arc<Notify>,
    armed: Mutex<Option<CancellationToken>>,
}

impl WakeSource {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            armed: Mutex::new(None),
        }
    }

    /// Starts the dispatcher task on `foreground`. No-op if already armed.
    pub fn arm<F>(&self, foreground: &Handle, dispatch: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut armed = self.armed.lock();
        if armed.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let notify = Arc::clone(&self.notify);

        foreground.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = notify.notified() => {
                        if cancelled.is_cancelled() {
                            break;
                        }
                        dispatch();
                    }
                }
            }
            trace!("Wake dispatcher exited");
        });

        *armed = Some(token);
    }

    /// Stops the dispatcher. A dispatch already running completes.
    pub fn disarm(&self) {
        if let Some(token) = self.armed.lock().take() {
            token.cancel();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }

    /// Wakes the dispatcher. Callable from any thread.
    pub fn signal(&self) {
        self.notify.notify_one();
    }
}

impl Default for WakeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WakeSource {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_runs_dispatch_on_foreground() {
        let wake = WakeSource::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);

        wake.arm(&Handle::current(), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::scope(|s| {
            s.spawn(|| wake.signal());
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_signals_coalesce() {
        let wake = WakeSource::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);

        // Signals raised before the dispatcher gets to run
        wake.signal();
        wake.signal();
        wake.signal();

        wake.arm(&Handle::current(), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disarm_stops_dispatch() {
        let wake = WakeSource::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);

        wake.arm(&Handle::current(), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wake.is_armed());

        wake.disarm();
        wake.signal();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!wake.is_armed());
    }
}
