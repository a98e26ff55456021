//! Named background threads that can be joined with a bound.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use tracing::{debug, warn};

/// A spawned OS thread plus an exit signal.
///
/// The signal is a channel whose only sender lives inside the thread; it
/// disconnects when the thread's closure returns or unwinds.
#[derive(Debug)]
pub(crate) struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
    exited: Receiver<()>,
}

impl Worker {
    pub(crate) fn spawn(name: &'static str, body: impl FnOnce() + Send + 'static) -> io::Result<Self> {
        let (exit_tx, exited) = bounded::<()>(0);
        let handle = thread::Builder::new().name(name.into()).spawn(move || {
            let _exit = exit_tx;
            body();
        })?;
        debug!(worker = name, "Worker started");
        Ok(Self {
            name,
            handle,
            exited,
        })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait up to `timeout` for the thread to exit. A thread still running
    /// after that is left detached and `false` is returned.
    pub(crate) fn join(self, timeout: Duration) -> bool {
        match self.exited.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    warn!(worker = self.name, "Worker panicked");
                }
                debug!(worker = self.name, "Worker stopped");
                true
            }
            Ok(()) | Err(RecvTimeoutError::Timeout) => {
                warn!(
                    worker = self.name,
                    timeout_ms = timeout.as_millis(),
                    "Worker failed to terminate cleanly"
                );
                false
            }
        }
    }
}
