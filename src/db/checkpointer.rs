use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::db::Db;
use crate::error::{IoContext, Result};

/// Counters of a [`BackgroundCheckpointer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointerState {
    pub runs: u64,
    /// Ticks skipped because the log was below `checkpoint_min_log_bytes`.
    pub skipped: u64,
    pub failures: u64,
    /// Error of the most recent run, cleared by a successful one.
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Shared {
    stopped: Mutex<bool>,
    wake: Condvar,
    state: Mutex<CheckpointerState>,
}

/// Runs [`Db::checkpoint`] periodically on a dedicated thread until stopped
/// or dropped.
pub struct BackgroundCheckpointer {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Db {
    pub fn spawn_background_checkpointer(&self, interval: Duration) -> Result<BackgroundCheckpointer> {
        let shared = Arc::new(Shared::default());
        let worker = shared.clone();
        let db = self.clone();
        let handle = std::thread::Builder::new()
            .name("layerkv-checkpoint".to_string())
            .spawn(move || run(db, &worker, interval))
            .io_context(|| "spawn checkpoint thread")?;
        Ok(BackgroundCheckpointer {
            shared,
            handle: Some(handle),
        })
    }
}

fn run(db: Db, shared: &Shared, interval: Duration) {
    loop {
        {
            let mut stopped = shared.stopped.lock();
            if !*stopped {
                shared.wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                break;
            }
        }

        if db.log_bytes() < db.options().checkpoint_min_log_bytes {
            shared.state.lock().skipped += 1;
            continue;
        }
        let result = db.checkpoint();
        let mut state = shared.state.lock();
        state.runs += 1;
        match result {
            Ok(()) => state.last_error = None,
            Err(err) => {
                tracing::warn!(error = %err, "background checkpoint failed");
                state.failures += 1;
                state.last_error = Some(err.to_string());
            }
        }
    }
    tracing::debug!(dir = %db.dir().display(), "background checkpointer stopped");
}

impl BackgroundCheckpointer {
    pub fn snapshot(&self) -> CheckpointerState {
        self.shared.state.lock().clone()
    }

    /// Stops the thread, waiting for a running checkpoint to finish.
    pub fn stop(mut self) -> CheckpointerState {
        self.shutdown();
        self.snapshot()
    }

    fn shutdown(&mut self) {
        *self.shared.stopped.lock() = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("background checkpointer panicked");
            }
        }
    }
}

impl Drop for BackgroundCheckpointer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
