//! The storage environment abstraction
//!
//! The coordinator never touches the storage core directly. Everything it
//! needs is expressed as primitives on [`Environment`]: nested transaction
//! begin/commit/abort, XA prepare and recovery, the checkpoint barrier, and
//! the few callbacks installed at startup.
//!
//! Thread safety: implementations are shared by every connection thread and
//! the background checkpointer, so all methods take `&self`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::EnvResult;
use crate::types::{CloseMode, ConnectionId, Isolation, LockTimeoutEvent, TxnHandle, TxnProgress};
use crate::xid::Xid;

/// Progress callback handed to commit and abort
pub type ProgressFn<'a> = &'a mut dyn FnMut(&TxnProgress);

/// Callback invoked by the environment when a lock wait times out
pub type LockTimeoutCallback = Arc<dyn Fn(&LockTimeoutEvent) + Send + Sync>;

/// Transactional storage environment driven by the coordinator
pub trait Environment: Send + Sync {
    /// Begin a transaction, nested under `parent` when given.
    ///
    /// `owner` identifies the connection on whose behalf blocking waits run,
    /// so `kill_waiter` can interrupt them.
    ///
    /// # Errors
    ///
    /// Fails if the parent is not live and active, or `Isolation::Inherit`
    /// is requested without a parent.
    fn begin(
        &self,
        parent: Option<TxnHandle>,
        isolation: Isolation,
        owner: ConnectionId,
    ) -> EnvResult<TxnHandle>;

    /// Commit a transaction. Nested transactions commit into their parent.
    ///
    /// `durable` requests an fsync of the log before returning. The handle
    /// must not have open children.
    fn commit(&self, txn: TxnHandle, durable: bool, progress: ProgressFn<'_>) -> EnvResult<()>;

    /// Abort a transaction. Takes effect immediately.
    fn abort(&self, txn: TxnHandle, progress: ProgressFn<'_>) -> EnvResult<()>;

    /// Parent of a live transaction
    fn parent(&self, txn: TxnHandle) -> EnvResult<Option<TxnHandle>>;

    /// Check that `txn` can be prepared under `xid` and reserve the id.
    ///
    /// Fails without effect unless `txn` is a live, unprepared, top-level
    /// transaction, the environment accepts writes and `xid` is neither
    /// prepared nor reserved by another transaction. The reservation is
    /// consumed by `prepare` and dropped by `release_xid` or when `txn` ends.
    fn reserve_xid(&self, txn: TxnHandle, xid: &Xid) -> EnvResult<()>;

    /// Drop a reservation taken by `reserve_xid`
    fn release_xid(&self, xid: &Xid);

    /// Durably record `txn` as prepared under `xid`.
    fn prepare(&self, txn: TxnHandle, xid: &Xid, durable: bool) -> EnvResult<()>;

    /// Every transaction currently in the prepared state, including those
    /// re-materialized from the log when the environment was opened.
    fn recover(&self) -> EnvResult<Vec<(Xid, TxnHandle)>>;

    /// Look up a prepared transaction by XA id
    fn txn_from_xid(&self, xid: &Xid) -> EnvResult<TxnHandle>;

    /// Forget a prepared transaction without resolving it.
    ///
    /// The prepared record stays in the log, so the transaction is reported
    /// in doubt again on the next open.
    fn discard(&self, txn: TxnHandle) -> EnvResult<()>;

    /// Commit a prepared transaction by XA id
    fn commit_by_xid(&self, xid: &Xid) -> EnvResult<()> {
        let txn = self.txn_from_xid(xid)?;
        self.commit(txn, true, &mut |_| {})
    }

    /// Abort a prepared transaction by XA id
    fn rollback_by_xid(&self, xid: &Xid) -> EnvResult<()> {
        let txn = self.txn_from_xid(xid)?;
        self.abort(txn, &mut |_| {})
    }

    /// Postpone checkpoints. Blocks while a checkpoint is running, then
    /// increments the postpone counter.
    fn checkpoint_postpone(&self) -> EnvResult<()>;

    /// Undo one `checkpoint_postpone`, possibly unblocking a checkpoint.
    fn checkpoint_resume(&self) -> EnvResult<()>;

    /// Run a checkpoint. Blocks while the postpone counter is non-zero.
    fn checkpoint(&self) -> EnvResult<()>;

    /// Flush and fsync the log
    fn log_flush(&self) -> EnvResult<()>;

    /// fsync the log if records were appended since the last sync.
    ///
    /// Driven periodically when commits skip the sync. Returns true if a
    /// sync was issued.
    fn log_sync_pending(&self) -> EnvResult<bool>;

    /// Interrupt any blocking wait owned by `owner`
    fn kill_waiter(&self, owner: ConnectionId);

    /// Wait for `blocking` to release a lock on `[left_key, right_key]`.
    ///
    /// Returns `EnvError::Killed` or `EnvError::LockTimeout` with `txn`
    /// still alive.
    fn lock_wait(
        &self,
        txn: TxnHandle,
        blocking: TxnHandle,
        left_key: &[u8],
        right_key: &[u8],
    ) -> EnvResult<()>;

    /// Install the lock-timeout reporting callback
    fn set_lock_timeout_callback(&self, callback: LockTimeoutCallback);

    /// Set how long lock waits may block
    fn set_lock_timeout(&self, timeout: Duration);

    /// Set the background log fsync period (zero disables)
    fn set_fsync_log_period(&self, period: Duration);

    /// Close the environment
    fn close(&self, mode: CloseMode) -> EnvResult<()>;
}
