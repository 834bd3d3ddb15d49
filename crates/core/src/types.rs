//! Identifier and value types shared by the coordinator and the environment

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of one engine-level transaction.
///
/// Handles are allocated by the environment and never reused after the
/// transaction they name has been committed, aborted or discarded. Prepared
/// transactions keep their handle value across a restart because the value is
/// recorded next to the XA id in the durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnHandle(u64);

impl TxnHandle {
    /// Wrap a raw engine transaction id
    pub const fn new(raw: u64) -> Self {
        TxnHandle(raw)
    }

    /// Raw engine transaction id
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// Identifier of a frontend connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw connection id
    pub const fn new(raw: u64) -> Self {
        ConnectionId(raw)
    }

    /// Raw connection id
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Isolation directive passed to `Environment::begin`
///
/// `Inherit` is only valid for nested transactions: the child runs at its
/// parent's isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Isolation {
    /// Use the parent's isolation level
    Inherit,
    /// Dirty reads allowed
    ReadUncommitted,
    /// Statement-level snapshot
    ReadCommitted,
    /// Transaction-level snapshot (the default)
    #[default]
    RepeatableRead,
    /// Snapshot reads plus range locking
    Serializable,
}

/// Per-connection durability override consulted when deciding fsync policy.
///
/// Replication coordinators that perform their own group commit set `Ignore`
/// so the storage log is not synced a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityProperty {
    /// Follow the engine's configured sync policy
    #[default]
    Default,
    /// Never fsync on behalf of this connection
    Ignore,
}

/// Progress report emitted by the environment while committing or aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnProgress {
    /// True for commit, false for abort
    pub is_commit: bool,
    /// True when the operation is waiting behind a running checkpoint
    pub stalled_on_checkpoint: bool,
    /// Units processed so far
    pub entries_processed: u64,
    /// Total units to process
    pub entries_total: u64,
}

/// How the environment should record its own close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// No in-doubt work remains
    Clean,
    /// Prepared transactions were discarded; the next open must expect them
    Dirty,
}

/// Details of a lock wait that timed out, handed to the lock-timeout callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTimeoutEvent {
    /// Connection that owns the waiting transaction, if known
    pub owner: Option<ConnectionId>,
    /// Transaction that was waiting
    pub requesting: TxnHandle,
    /// Transaction holding the conflicting lock
    pub blocking: TxnHandle,
    /// Left end of the conflicting key range
    pub left_key: Vec<u8>,
    /// Right end of the conflicting key range
    pub right_key: Vec<u8>,
}

impl LockTimeoutEvent {
    /// True when the conflict was on a single key rather than a range
    pub fn is_point(&self) -> bool {
        !self.left_key.is_empty() && self.left_key == self.right_key
    }
}
