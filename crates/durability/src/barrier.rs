//! Checkpoint barrier
//!
//! Connections postpone checkpoints around work that must not straddle one
//! (for example a backup copy). The barrier is a counter plus a running
//! flag behind one mutex:
//!
//! - `postpone` waits out a running checkpoint, then bumps the counter.
//! - `begin` waits until the counter is zero and no other checkpoint runs.
//! - `close` wakes every waiter with `EnvError::Closed`.

use keel_core::{EnvError, EnvResult};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct BarrierState {
    postponed: u64,
    running: bool,
    closed: bool,
}

/// Counter-based checkpoint barrier
#[derive(Debug, Default)]
pub struct CheckpointBarrier {
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl CheckpointBarrier {
    /// Create an open barrier
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold off checkpoints until a matching [`resume`](Self::resume).
    pub fn postpone(&self) -> EnvResult<()> {
        let mut state = self.state.lock();
        while state.running && !state.closed {
            self.cond.wait(&mut state);
        }
        if state.closed {
            return Err(EnvError::Closed);
        }
        state.postponed += 1;
        Ok(())
    }

    /// Release one postponement.
    pub fn resume(&self) -> EnvResult<()> {
        let mut state = self.state.lock();
        if state.postponed == 0 {
            return Err(EnvError::invalid_argument(
                "checkpoint resume without matching postpone",
            ));
        }
        state.postponed -= 1;
        if state.postponed == 0 {
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Wait for exclusive checkpoint access.
    ///
    /// The returned guard marks the checkpoint as running until dropped.
    pub fn begin(&self) -> EnvResult<CheckpointGuard<'_>> {
        let mut state = self.state.lock();
        while (state.postponed > 0 || state.running) && !state.closed {
            self.cond.wait(&mut state);
        }
        if state.closed {
            return Err(EnvError::Closed);
        }
        state.running = true;
        Ok(CheckpointGuard { barrier: self })
    }

    /// Wake every waiter; subsequent calls fail with `Closed`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.cond.notify_all();
    }

    /// Outstanding postponements
    pub fn postponed(&self) -> u64 {
        self.state.lock().postponed
    }

    /// True while a checkpoint holds the barrier
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }
}

/// Marks a checkpoint as running; releases the barrier on drop
pub struct CheckpointGuard<'a> {
    barrier: &'a CheckpointBarrier,
}

impl Drop for CheckpointGuard<'_> {
    fn drop(&mut self) {
        self.barrier.state.lock().running = false;
        self.barrier.cond.notify_all();
    }
}
