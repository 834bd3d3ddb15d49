//! Statement progress and connection status text

use keel_core::TxnProgress;
use parking_lot::Mutex;
use std::sync::Arc;

/// Prefix reported while a commit or abort waits behind a checkpoint
pub const STALLED_PREFIX: &str = "Writing committed changes to disk, ";

/// Status shown while waiting for the checkpoint lock
pub const PROC_INFO_ACQUIRE_CHECKPOINT_LOCK: &str = "Trying to grab checkpointing lock.";

/// Status shown while releasing the checkpoint lock
pub const PROC_INFO_RELEASE_CHECKPOINT_LOCK: &str = "Trying to release checkpointing lock.";

/// Render a commit/abort progress report as connection status text.
pub fn format_progress(progress: &TxnProgress) -> String {
    format!(
        "{}processing {} of transaction, {} out of {}",
        if progress.stalled_on_checkpoint {
            STALLED_PREFIX
        } else {
            ""
        },
        if progress.is_commit { "commit" } else { "abort" },
        progress.entries_processed,
        progress.entries_total
    )
}

/// Row counters for the statement in flight.
///
/// Reset whenever a statement or transaction is committed or rolled back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementProgress {
    /// Rows read
    pub queried: u64,
    /// Rows inserted
    pub inserted: u64,
    /// Rows updated
    pub updated: u64,
    /// Rows deleted
    pub deleted: u64,
}

impl StatementProgress {
    /// Zero every counter
    pub fn reset(&mut self) {
        *self = StatementProgress::default();
    }

    /// True if every counter is zero
    pub fn is_empty(&self) -> bool {
        *self == StatementProgress::default()
    }
}

/// Shared, externally readable status line of one connection.
///
/// Cloning yields another handle on the same line, so an observer thread
/// can watch what a connection is doing while it blocks.
#[derive(Debug, Clone, Default)]
pub struct ProcInfo(Arc<Mutex<Option<String>>>);

impl ProcInfo {
    /// Create an empty status line
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status
    pub fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }

    /// Replace the status, returning the previous one
    pub fn set(&self, status: impl Into<String>) -> Option<String> {
        self.0.lock().replace(status.into())
    }

    /// Put back a status returned by [`set`](Self::set)
    pub fn restore(&self, previous: Option<String>) {
        *self.0.lock() = previous;
    }
}
