//! Periodic maintenance threads (evictor, cleaner, checkpointer)

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

/// Shared stop signal for periodic threads
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    /// Sleep for `period` or until stopped; true once stopped
    fn wait(&self, period: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cond.wait_for(&mut stopped, period);
        }
        *stopped
    }
}

/// Run `task` every `period` on a named thread until `signal` stops
pub(crate) fn spawn_periodic<F>(
    name: &str,
    period: Duration,
    signal: Arc<StopSignal>,
    mut task: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnMut() + Send + 'static,
{
    let thread_name = name.to_string();
    std::thread::Builder::new().name(thread_name.clone()).spawn(move || {
        while !signal.wait(period) {
            trace!("{} wake-up", thread_name);
            task();
        }
    })
}

/// Stop and join a set of periodic threads
pub(crate) fn join_all(signal: &StopSignal, handles: Vec<JoinHandle<()>>) {
    signal.stop();
    for handle in handles {
        let name = handle.thread().name().unwrap_or("background").to_string();
        if handle.join().is_err() {
            warn!("{} thread panicked", name);
        }
    }
}
