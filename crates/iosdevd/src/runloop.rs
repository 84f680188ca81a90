//! Background run loop thread.
//!
//! Device notifications, relay socket reads and the settle timer all run on
//! one dedicated OS thread driving a current-thread tokio runtime. Work is
//! handed to it through [`RunLoop::handle`]; results travel back to the
//! foreground through [`crate::wake::WakeSource`].
//!
//! # Panic-Free Guarantees
//!
//! - Runtime construction and thread spawn failures are returned as errors
//! - `stop()` never joins from inside the loop thread itself

use std::thread::{self, JoinHandle};

use tokio::runtime::{Builder, Handle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use iosdev_core::DeviceError;

/// Spawners for both sides of the wake bridge.
#[derive(Clone, Debug)]
pub struct Runtimes {
    /// The run loop, where socket readers and notification handling run.
    pub background: Handle,
    /// The caller's runtime, where listeners are invoked.
    pub foreground: Handle,
}

/// Owner of the background thread.
pub struct RunLoop {
    handle: Handle,
    cancel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl RunLoop {
    /// Spawns the named run loop thread.
    pub fn spawn(name: &str) -> Result<Self, DeviceError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DeviceError::RunLoop(e.to_string()))?;
        let handle = runtime.handle().clone();
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!(thread = %thread_name, "Run loop started");
                runtime.block_on(token.cancelled());
                // Dropping the runtime here cancels reader tasks and closes their sockets
                drop(runtime);
                debug!(thread = %thread_name, "Run loop stopped");
            })
            .map_err(|e| DeviceError::RunLoop(e.to_string()))?;

        Ok(Self {
            handle,
            cancel,
            thread: Some(thread),
        })
    }

    /// Spawner for tasks that must run on the loop.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Pairs the loop with the caller's runtime.
    pub fn runtimes(&self, foreground: Handle) -> Runtimes {
        Runtimes {
            background: self.handle.clone(),
            foreground,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stops the loop and waits for the thread to exit. Idempotent.
    pub fn stop(&mut self) {
        self.cancel.cancel();

        let Some(thread) = self.thread.take() else {
            return;
        };

        if thread.thread().id() == thread::current().id() {
            return;
        }

        if thread.join().is_err() {
            warn!("Run loop thread panicked");
        }
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_tasks_run_on_named_thread() {
        let mut run_loop = RunLoop::spawn("test-loop").unwrap();
        let (tx, rx) = mpsc::channel();

        run_loop.handle().spawn(async move {
            let name = thread::current().name().map(str::to_string);
            let _ = tx.send(name);
        });

        let name = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert_eq!(name.as_deref(), Some("test-loop"));

        run_loop.stop();
        assert!(!run_loop.is_running());
        run_loop.stop();
    }

    #[test]
    fn test_stop_drops_pending_tasks() {
        let mut run_loop = RunLoop::spawn("drop-loop").unwrap();
        let (tx, rx) = mpsc::channel::<()>();

        run_loop.handle().spawn(async move {
            let _held = tx;
            std::future::pending::<()>().await;
        });

        run_loop.stop();
        // Sender dropped with the task, so the channel is disconnected
        assert!(rx.recv_timeout(std::time::Duration::from_secs(2)).is_err());
    }
}
