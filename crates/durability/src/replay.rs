//! Log replay
//!
//! Replay folds the scanned records into the state the environment needs at
//! open time: which prepared transactions are still in doubt, the first
//! handle value that is safe to allocate, and how the previous session ended.
//!
//! Records are applied in file order. A `Prepare` puts its transaction in
//! doubt; a later `Commit` or `Abort` of the same handle resolves it.

use crate::log::{LogRecord, LogScan, ReadStopReason};
use keel_core::{TxnHandle, Xid};
use std::collections::BTreeMap;

/// How the previous session of the environment ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviousShutdown {
    /// No log existed; this is a fresh environment
    Fresh,
    /// Closed with no in-doubt transactions
    Clean,
    /// Closed after discarding prepared transactions
    Dirty {
        /// Prepared transactions discarded at close
        prepared: u32,
    },
    /// The log ends without a shutdown record
    Crashed,
}

impl PreviousShutdown {
    /// True unless the previous session closed cleanly (or never ran)
    pub fn is_unclean(&self) -> bool {
        matches!(self, PreviousShutdown::Dirty { .. } | PreviousShutdown::Crashed)
    }
}

/// Counters describing a replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records applied
    pub records: usize,
    /// Prepare records seen
    pub prepared: usize,
    /// Prepared transactions resolved later in the log
    pub resolved: usize,
    /// Checkpoint records seen
    pub checkpoints: usize,
}

/// State recovered from the log
#[derive(Debug, Clone)]
pub struct RecoveredState {
    /// Prepared transactions with no resolution, ordered by handle
    pub in_doubt: BTreeMap<TxnHandle, Xid>,
    /// First handle value that is safe to allocate
    pub next_txn: u64,
    /// Last checkpoint sequence number (zero if none)
    pub checkpoint_sequence: u64,
    /// How the previous session ended
    pub previous_shutdown: PreviousShutdown,
    /// True if forced recovery skipped damaged records
    pub damaged: bool,
    /// Replay counters
    pub stats: ReplayStats,
}

/// Replay a scanned log.
pub fn replay(scan: &LogScan) -> RecoveredState {
    let mut in_doubt = BTreeMap::new();
    let mut next_txn = 1u64;
    let mut checkpoint_sequence = 0;
    let mut stats = ReplayStats::default();

    for record in &scan.records {
        stats.records += 1;
        if let Some(txn) = record.txn() {
            next_txn = next_txn.max(txn.as_u64() + 1);
        }
        match record {
            LogRecord::Prepare { txn, xid } => {
                stats.prepared += 1;
                in_doubt.insert(*txn, xid.clone());
            }
            LogRecord::Commit { txn } | LogRecord::Abort { txn } => {
                if in_doubt.remove(txn).is_some() {
                    stats.resolved += 1;
                }
            }
            LogRecord::Checkpoint {
                sequence,
                next_txn: floor,
            } => {
                stats.checkpoints += 1;
                checkpoint_sequence = checkpoint_sequence.max(*sequence);
                next_txn = next_txn.max(*floor);
            }
            LogRecord::Shutdown { .. } => {}
        }
    }

    let previous_shutdown = if !scan.existed || scan.records.is_empty() {
        if scan.existed && scan.stop != ReadStopReason::EndOfLog {
            PreviousShutdown::Crashed
        } else {
            PreviousShutdown::Fresh
        }
    } else {
        match scan.records.last() {
            Some(LogRecord::Shutdown { dirty: false, .. }) => PreviousShutdown::Clean,
            Some(LogRecord::Shutdown {
                dirty: true,
                prepared,
            }) => PreviousShutdown::Dirty {
                prepared: *prepared,
            },
            _ => PreviousShutdown::Crashed,
        }
    };

    RecoveredState {
        in_doubt,
        next_txn,
        checkpoint_sequence,
        previous_shutdown,
        damaged: matches!(scan.stop, ReadStopReason::Corruption(_)),
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(records: Vec<LogRecord>) -> LogScan {
        LogScan {
            records,
            valid_len: 0,
            stop: ReadStopReason::EndOfLog,
            existed: true,
        }
    }

    fn xid(tag: &[u8]) -> Xid {
        Xid::new(1, tag, b"").unwrap()
    }

    fn t(n: u64) -> TxnHandle {
        TxnHandle::new(n)
    }

    #[test]
    fn resolved_prepares_are_not_in_doubt() {
        let state = replay(&scan(vec![
            LogRecord::Prepare {
                txn: t(1),
                xid: xid(b"a"),
            },
            LogRecord::Prepare {
                txn: t(2),
                xid: xid(b"b"),
            },
            LogRecord::Commit { txn: t(1) },
            LogRecord::Commit { txn: t(3) },
        ]));
        assert_eq!(state.in_doubt.len(), 1);
        assert_eq!(state.in_doubt.get(&t(2)), Some(&xid(b"b")));
        assert_eq!(state.next_txn, 4);
        assert_eq!(state.stats.resolved, 1);
        assert_eq!(state.previous_shutdown, PreviousShutdown::Crashed);
    }

    #[test]
    fn shutdown_record_classifies_previous_session() {
        let clean = replay(&scan(vec![LogRecord::Shutdown {
            dirty: false,
            prepared: 0,
        }]));
        assert_eq!(clean.previous_shutdown, PreviousShutdown::Clean);

        let dirty = replay(&scan(vec![
            LogRecord::Prepare {
                txn: t(5),
                xid: xid(b"x"),
            },
            LogRecord::Shutdown {
                dirty: true,
                prepared: 1,
            },
        ]));
        assert_eq!(
            dirty.previous_shutdown,
            PreviousShutdown::Dirty { prepared: 1 }
        );
        assert!(dirty.previous_shutdown.is_unclean());
        assert_eq!(dirty.in_doubt.len(), 1);
    }

    #[test]
    fn checkpoint_raises_handle_floor() {
        let state = replay(&scan(vec![LogRecord::Checkpoint {
            sequence: 4,
            next_txn: 100,
        }]));
        assert_eq!(state.next_txn, 100);
        assert_eq!(state.checkpoint_sequence, 4);
    }

    #[test]
    fn missing_log_is_fresh() {
        let state = replay(&LogScan {
            records: Vec::new(),
            valid_len: 0,
            stop: ReadStopReason::EndOfLog,
            existed: false,
        });
        assert_eq!(state.previous_shutdown, PreviousShutdown::Fresh);
        assert!(state.in_doubt.is_empty());
        assert_eq!(state.next_txn, 1);
    }
}
