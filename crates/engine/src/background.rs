//! Background workers
//!
//! Two periodic threads run against the environment:
//!
//! - `keel-checkpointer` calls `Environment::checkpoint` every
//!   `checkpointing_period`
//! - `keel-log-flusher` calls `Environment::log_sync_pending` every
//!   `fsync_log_period`, so commits that skipped the sync reach disk within
//!   one period even when no further records are appended
//!
//! Each thread holds only a weak reference to the environment so a dropped
//! engine releases its data directory even if the thread has not been
//! joined yet. Stopping wakes the thread immediately instead of waiting out
//! the period.

use keel_core::{EnvError, EnvResult, Environment, KeelError, KeelResult};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct WorkerStats {
    completed: AtomicU64,
    failed: AtomicU64,
}

// ============================================================================
// Periodic worker
// ============================================================================

/// One step of a worker. `Ok(true)` counts as completed work.
type Job = fn(&dyn Environment) -> EnvResult<bool>;

#[derive(Debug)]
struct Worker {
    name: &'static str,
    signal: Arc<StopSignal>,
    stats: Arc<WorkerStats>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        name: &'static str,
        env: &Arc<dyn Environment>,
        period: Duration,
        job: Job,
    ) -> KeelResult<Self> {
        let signal = Arc::new(StopSignal::default());
        let stats = Arc::new(WorkerStats::default());
        let env = Arc::downgrade(env);

        let thread_signal = Arc::clone(&signal);
        let thread_stats = Arc::clone(&stats);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(name, env, period, job, &thread_signal, &thread_stats))
            .map_err(|e| KeelError::Environment(EnvError::Io(e)))?;

        debug!(target: "keel::lifecycle", worker = name, period_ms = period.as_millis() as u64, "Background worker started");
        Ok(Self {
            name,
            signal,
            stats,
            handle: Some(handle),
        })
    }

    fn completed(&self) -> u64 {
        self.stats.completed.load(Ordering::Relaxed)
    }

    fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    fn stop(&mut self) {
        {
            let mut stopped = self.signal.stopped.lock();
            *stopped = true;
            self.signal.cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(target: "keel::lifecycle", worker = self.name, "Background worker panicked");
            }
            debug!(target: "keel::lifecycle", worker = self.name, "Background worker stopped");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    name: &'static str,
    env: Weak<dyn Environment>,
    period: Duration,
    job: Job,
    signal: &StopSignal,
    stats: &WorkerStats,
) {
    loop {
        {
            let mut stopped = signal.stopped.lock();
            if !*stopped {
                signal.cond.wait_for(&mut stopped, period);
            }
            if *stopped {
                return;
            }
        }
        let Some(env) = env.upgrade() else {
            return;
        };
        match job(env.as_ref()) {
            Ok(true) => {
                stats.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {}
            Err(EnvError::Closed) => return,
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(target: "keel::lifecycle", worker = name, error = %e, "Background run failed");
            }
        }
    }
}

// ============================================================================
// Checkpointer
// ============================================================================

/// Handle on the running checkpointer thread
#[derive(Debug)]
pub struct Checkpointer {
    worker: Worker,
}

impl Checkpointer {
    /// Start checkpointing `env` every `period`.
    pub fn spawn(env: &Arc<dyn Environment>, period: Duration) -> KeelResult<Self> {
        let worker = Worker::spawn("keel-checkpointer", env, period, |env| {
            env.checkpoint().map(|()| true)
        })?;
        Ok(Self { worker })
    }

    /// Checkpoints completed so far
    pub fn completed(&self) -> u64 {
        self.worker.completed()
    }

    /// Checkpoints that failed so far
    pub fn failed(&self) -> u64 {
        self.worker.failed()
    }

    /// Signal the thread to stop and join it.
    pub fn stop(&mut self) {
        self.worker.stop();
    }
}

// ============================================================================
// LogFlusher
// ============================================================================

/// Handle on the running log flusher thread
#[derive(Debug)]
pub struct LogFlusher {
    worker: Worker,
}

impl LogFlusher {
    /// Sync unsynced log data of `env` every `period`.
    pub fn spawn(env: &Arc<dyn Environment>, period: Duration) -> KeelResult<Self> {
        let worker = Worker::spawn("keel-log-flusher", env, period, |env| {
            env.log_sync_pending()
        })?;
        Ok(Self { worker })
    }

    /// Syncs issued so far
    pub fn synced(&self) -> u64 {
        self.worker.completed()
    }

    /// Syncs that failed so far
    pub fn failed(&self) -> u64 {
        self.worker.failed()
    }

    /// Signal the thread to stop and join it.
    pub fn stop(&mut self) {
        self.worker.stop();
    }
}
