//! Transaction manager
//!
//! Drives every state transition of a [`ConnectionContext`] against the
//! shared [`Environment`]:
//!
//! - begin / commit / rollback of the outer and statement transactions
//! - savepoint set / rollback-to / release
//! - XA prepare, recovery listing, commit and rollback by XA id
//! - the per-connection checkpoint lock
//! - connection close
//!
//! ## Resolution order
//!
//! Resolving a handle first resolves everything nested under it, deepest
//! first: commit folds descendants into their parents non-durably, rollback
//! aborts them. Savepoint entries and the statement pointer of resolved
//! descendants are dropped along the way.
//!
//! ## Failure policy
//!
//! A failure of the environment to commit or abort a handle it handed out
//! leaves the engine in an unknown state. It is logged and the process is
//! aborted. Everything else is returned to the caller with the context
//! unchanged.

use crate::arena::SlotId;
use crate::context::{ConnectionContext, ConnectionRole, Scope};
use crate::fault::{FaultAction, FaultInjector, FaultPoint};
use crate::progress::{
    format_progress, PROC_INFO_ACQUIRE_CHECKPOINT_LOCK, PROC_INFO_RELEASE_CHECKPOINT_LOCK,
};
use crate::savepoint::SavepointEntry;
use keel_core::{
    ConnectionId, DurabilityProperty, EnvError, Environment, Isolation, KeelError, KeelResult,
    TxnHandle, TxnProgress, Xid,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ============================================================================
// Policies
// ============================================================================

/// When a successful full prepare detaches the connection from its handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrepareDetach {
    /// Keep the prepared handle on the connection
    Never,
    /// Detach only on replica connections
    #[default]
    Replica,
    /// Always detach
    Always,
}

/// Log sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Background fsync period; when non-zero, commits and prepares never sync
    pub fsync_log_period: Duration,
    /// Sync the log on durable commits
    pub commit_sync: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy {
            fsync_log_period: Duration::ZERO,
            commit_sync: true,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
struct Counters {
    begins: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    prepares: AtomicU64,
    savepoints_set: AtomicU64,
    savepoint_rollbacks: AtomicU64,
    savepoint_releases: AtomicU64,
    xa_commits: AtomicU64,
    xa_rollbacks: AtomicU64,
    xa_failures: AtomicU64,
    checkpoint_lock_acquires: AtomicU64,
    leaked_handles: AtomicU64,
    detached_prepared: AtomicU64,
}

/// Snapshot of transaction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TxnStats {
    /// Outer and statement transactions begun
    pub begins: u64,
    /// Scope commits that resolved a handle
    pub commits: u64,
    /// Scope rollbacks that resolved a handle
    pub rollbacks: u64,
    /// Successful prepares
    pub prepares: u64,
    /// Savepoints set
    pub savepoints_set: u64,
    /// Rollbacks to a savepoint
    pub savepoint_rollbacks: u64,
    /// Savepoint releases
    pub savepoint_releases: u64,
    /// Prepared transactions committed by XA id
    pub xa_commits: u64,
    /// Prepared transactions rolled back by XA id
    pub xa_rollbacks: u64,
    /// Failed resolutions by XA id
    pub xa_failures: u64,
    /// Checkpoint lock acquisitions
    pub checkpoint_lock_acquires: u64,
    /// Handles still open when their connection closed
    pub leaked_handles: u64,
    /// Prepared handles left in doubt by a closing connection
    pub detached_prepared: u64,
}

/// What closing a connection had to clean up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseReport {
    /// Non-prepared handles aborted
    pub aborted: usize,
    /// Prepared handles left in doubt
    pub detached: usize,
    /// True if a residual checkpoint lock was released
    pub released_checkpoint_lock: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Commit { durable: bool },
    Abort,
}

impl Outcome {
    fn verb(&self) -> &'static str {
        match self {
            Outcome::Commit { .. } => "committing",
            Outcome::Abort => "aborting",
        }
    }

    // Descendants resolve the same way as their ancestor, but never sync.
    fn nested(&self) -> Outcome {
        match self {
            Outcome::Commit { .. } => Outcome::Commit { durable: false },
            Outcome::Abort => Outcome::Abort,
        }
    }
}

fn fatal(action: &str, handle: TxnHandle, err: EnvError) -> ! {
    error!(
        target: "keel::txn",
        %handle,
        error = %err,
        "Tried {} transaction and got an error; aborting process",
        action
    );
    std::process::abort()
}

// ============================================================================
// TransactionManager
// ============================================================================

/// Coordinates transaction lifecycles of every connection
pub struct TransactionManager {
    env: Arc<dyn Environment>,
    sync: RwLock<SyncPolicy>,
    detach: PrepareDetach,
    fault: RwLock<Option<FaultInjector>>,
    crashed: AtomicBool,
    counters: Counters,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("sync", &*self.sync.read())
            .field("detach", &self.detach)
            .field("crashed", &self.is_crashed())
            .finish()
    }
}

impl TransactionManager {
    /// Create a manager over `env`
    pub fn new(env: Arc<dyn Environment>, sync: SyncPolicy, detach: PrepareDetach) -> Self {
        TransactionManager {
            env,
            sync: RwLock::new(sync),
            detach,
            fault: RwLock::new(None),
            crashed: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Install a crash injector
    pub fn with_fault_injector(self, injector: FaultInjector) -> Self {
        *self.fault.write() = Some(injector);
        self
    }

    /// Replace (or remove) the crash injector
    pub fn set_fault_injector(&self, injector: Option<FaultInjector>) {
        *self.fault.write() = injector;
    }

    /// The environment being driven
    pub fn env(&self) -> &Arc<dyn Environment> {
        &self.env
    }

    /// Current sync policy
    pub fn sync_policy(&self) -> SyncPolicy {
        *self.sync.read()
    }

    /// Replace the sync policy
    pub fn set_sync_policy(&self, policy: SyncPolicy) {
        *self.sync.write() = policy;
    }

    /// Prepare detach policy
    pub fn prepare_detach(&self) -> PrepareDetach {
        self.detach
    }

    /// True after a simulated crash
    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    /// Whether a durable commit on this connection syncs the log
    pub fn sync_on_commit(&self, ctx: &ConnectionContext) -> bool {
        if ctx.durability() == DurabilityProperty::Ignore {
            return false;
        }
        let policy = self.sync_policy();
        if !policy.fsync_log_period.is_zero() {
            return false;
        }
        ctx.commit_sync().unwrap_or(policy.commit_sync)
    }

    /// Whether a prepare on this connection syncs the log
    pub fn sync_on_prepare(&self, ctx: &ConnectionContext) -> bool {
        ctx.durability() != DurabilityProperty::Ignore
            && self.sync_policy().fsync_log_period.is_zero()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> TxnStats {
        let c = &self.counters;
        TxnStats {
            begins: c.begins.load(Ordering::Relaxed),
            commits: c.commits.load(Ordering::Relaxed),
            rollbacks: c.rollbacks.load(Ordering::Relaxed),
            prepares: c.prepares.load(Ordering::Relaxed),
            savepoints_set: c.savepoints_set.load(Ordering::Relaxed),
            savepoint_rollbacks: c.savepoint_rollbacks.load(Ordering::Relaxed),
            savepoint_releases: c.savepoint_releases.load(Ordering::Relaxed),
            xa_commits: c.xa_commits.load(Ordering::Relaxed),
            xa_rollbacks: c.xa_rollbacks.load(Ordering::Relaxed),
            xa_failures: c.xa_failures.load(Ordering::Relaxed),
            checkpoint_lock_acquires: c.checkpoint_lock_acquires.load(Ordering::Relaxed),
            leaked_handles: c.leaked_handles.load(Ordering::Relaxed),
            detached_prepared: c.detached_prepared.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Begin
    // ========================================================================

    /// Begin the outer transaction. No-op if one is open.
    pub fn begin_transaction(&self, ctx: &mut ConnectionContext) -> KeelResult<TxnHandle> {
        self.ensure_usable(ctx)?;
        if let Some(handle) = ctx.outer_handle() {
            return Ok(handle);
        }
        let handle = self.env.begin(None, ctx.isolation(), ctx.id())?;
        ctx.outer = Some(ctx.arena.insert(handle, None));
        self.counters.begins.fetch_add(1, Ordering::Relaxed);
        debug!(target: "keel::txn", conn = %ctx.id(), %handle, "Began outer transaction");
        Ok(handle)
    }

    /// Begin the statement transaction. No-op if one is open.
    ///
    /// The statement nests under the innermost savepoint, else the outer
    /// transaction; without either it is top-level.
    pub fn begin_statement(&self, ctx: &mut ConnectionContext) -> KeelResult<TxnHandle> {
        self.ensure_usable(ctx)?;
        if let Some(handle) = ctx.statement_handle() {
            return Ok(handle);
        }
        let parent = ctx.savepoint_top_slot().or(ctx.outer);
        let parent_handle = parent.and_then(|p| ctx.arena.handle(p));
        let isolation = match parent_handle {
            Some(_) => Isolation::Inherit,
            None => ctx.isolation(),
        };
        let handle = self.env.begin(parent_handle, isolation, ctx.id())?;
        ctx.statement = Some(ctx.arena.insert(handle, parent));
        self.counters.begins.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "keel::txn",
            conn = %ctx.id(),
            %handle,
            parent = ?parent_handle,
            "Began statement transaction"
        );
        Ok(handle)
    }

    // ========================================================================
    // Commit / rollback
    // ========================================================================

    /// Commit the handle selected by `scope`.
    ///
    /// Succeeds without effect when there is nothing to commit. The log is
    /// synced only if `durable` is set and the sync policy allows it.
    pub fn commit(&self, ctx: &mut ConnectionContext, scope: Scope, durable: bool) -> KeelResult<()> {
        self.ensure_usable(ctx)?;
        let Some(slot) = ctx.scope_slot(scope) else {
            ctx.progress.reset();
            return Ok(());
        };
        let durable = durable && self.sync_on_commit(ctx);
        let outcome = Outcome::Commit { durable };

        self.run_resource_handlers(ctx, slot);
        self.resolve_descendants(ctx, slot, outcome)?;
        self.check_fault(ctx, FaultPoint::CommitBefore)?;
        let handle = self.resolve(ctx, slot, outcome)?;
        self.check_fault(ctx, FaultPoint::CommitAfter)?;
        ctx.arena.remove(slot);
        ctx.forget(slot);
        ctx.progress.reset();

        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        debug!(target: "keel::txn", conn = %ctx.id(), %handle, ?scope, durable, "Committed");
        Ok(())
    }

    /// Roll back the handle selected by `scope`.
    ///
    /// Succeeds without effect when there is nothing to roll back.
    pub fn rollback(&self, ctx: &mut ConnectionContext, scope: Scope) -> KeelResult<()> {
        self.ensure_usable(ctx)?;
        let Some(slot) = ctx.scope_slot(scope) else {
            ctx.progress.reset();
            return Ok(());
        };

        self.run_resource_handlers(ctx, slot);
        self.resolve_descendants(ctx, slot, Outcome::Abort)?;
        let handle = self.resolve(ctx, slot, Outcome::Abort)?;
        ctx.arena.remove(slot);
        ctx.forget(slot);
        ctx.progress.reset();

        self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
        debug!(target: "keel::txn", conn = %ctx.id(), %handle, ?scope, "Rolled back");
        Ok(())
    }

    // ========================================================================
    // Savepoints
    // ========================================================================

    /// Set savepoint `name`.
    ///
    /// Inside a sub-statement the savepoint nests under the innermost
    /// sub-statement savepoint, else the statement. Otherwise it nests under
    /// the innermost savepoint, else the outer transaction, else the
    /// statement.
    pub fn set_savepoint(&self, ctx: &mut ConnectionContext, name: &str) -> KeelResult<()> {
        self.ensure_usable(ctx)?;
        if ctx.savepoints.contains(name) {
            return Err(KeelError::DuplicateSavepoint {
                name: name.to_string(),
            });
        }
        let sub = ctx.in_sub_statement();
        let parent = if sub {
            ctx.sub_statement_top_slot()
                .or(ctx.statement)
                .ok_or(KeelError::NoActiveStatement)?
        } else {
            ctx.savepoint_top_slot()
                .or(ctx.outer)
                .or(ctx.statement)
                .ok_or(KeelError::NoActiveTransaction)?
        };
        let parent_handle = ctx
            .arena
            .handle(parent)
            .ok_or(KeelError::NoActiveTransaction)?;

        let handle = self
            .env
            .begin(Some(parent_handle), Isolation::Inherit, ctx.id())?;
        let slot = ctx.arena.insert(handle, Some(parent));
        ctx.savepoints.push(SavepointEntry {
            name: name.to_string(),
            slot,
            opened_in_sub_statement: sub,
            owner: ctx.id(),
        });

        self.counters.savepoints_set.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "keel::txn",
            conn = %ctx.id(),
            savepoint = name,
            %handle,
            parent = %parent_handle,
            sub_statement = sub,
            "Set savepoint"
        );
        Ok(())
    }

    /// Roll back to savepoint `name`.
    ///
    /// Aborts the savepoint's handle and everything nested under it, then
    /// reopens a fresh handle under the same parent. The entry keeps its
    /// position, so the name still resolves; later savepoints are gone.
    pub fn rollback_to_savepoint(&self, ctx: &mut ConnectionContext, name: &str) -> KeelResult<()> {
        self.ensure_usable(ctx)?;
        let entry = self.lookup_savepoint(ctx, name)?;
        let parent = ctx
            .arena
            .get(entry.slot)
            .and_then(|n| n.parent)
            .ok_or(KeelError::NoActiveTransaction)?;

        self.resolve_descendants(ctx, entry.slot, Outcome::Abort)?;
        let aborted = self.resolve(ctx, entry.slot, Outcome::Abort)?;
        ctx.arena.remove(entry.slot);

        let parent_handle = ctx
            .arena
            .handle(parent)
            .ok_or(KeelError::NoActiveTransaction)?;
        let handle = match self
            .env
            .begin(Some(parent_handle), Isolation::Inherit, ctx.id())
        {
            Ok(handle) => handle,
            Err(e) => {
                ctx.savepoints.remove(name);
                return Err(e.into());
            }
        };
        let slot = ctx.arena.insert(handle, Some(parent));
        if let Some(entry) = ctx.savepoints.get_mut(name) {
            entry.slot = slot;
        }

        self.counters
            .savepoint_rollbacks
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "keel::txn",
            conn = %ctx.id(),
            savepoint = name,
            %aborted,
            reopened = %handle,
            "Rolled back to savepoint"
        );
        Ok(())
    }

    /// Release savepoint `name`, committing it into its parent.
    ///
    /// Fails without effect if anything is still nested under it.
    pub fn release_savepoint(&self, ctx: &mut ConnectionContext, name: &str) -> KeelResult<()> {
        self.ensure_usable(ctx)?;
        let entry = self.lookup_savepoint(ctx, name)?;
        if ctx.arena.has_open_child(entry.slot) {
            return Err(KeelError::SavepointHasOpenChild {
                name: name.to_string(),
            });
        }

        let handle = self.resolve(ctx, entry.slot, Outcome::Commit { durable: false })?;
        ctx.arena.remove(entry.slot);
        ctx.forget(entry.slot);

        self.counters
            .savepoint_releases
            .fetch_add(1, Ordering::Relaxed);
        debug!(target: "keel::txn", conn = %ctx.id(), savepoint = name, %handle, "Released savepoint");
        Ok(())
    }

    // ========================================================================
    // XA
    // ========================================================================

    /// Prepare the handle selected by `all` under the connection's XA id.
    ///
    /// Every check that can fail runs before open descendants are folded
    /// into the handle, so an error leaves the connection untouched. The XA
    /// id is reserved in the environment across the fold. On success the
    /// connection is detached from the handle according to the
    /// [`PrepareDetach`] policy.
    pub fn prepare(&self, ctx: &mut ConnectionContext, all: bool) -> KeelResult<()> {
        self.ensure_usable(ctx)?;
        let slot = if all {
            ctx.scope_slot(Scope::All)
        } else {
            ctx.scope_slot(Scope::Statement)
        };
        let Some(slot) = slot else {
            return Ok(());
        };
        let xid = ctx.xid().cloned().ok_or(KeelError::MissingXid)?;
        let handle = ctx
            .arena
            .handle(slot)
            .ok_or(KeelError::NoActiveTransaction)?;
        match self.env.reserve_xid(handle, &xid) {
            Ok(()) => {}
            Err(EnvError::DuplicateXid(xid)) => return Err(KeelError::DuplicateXid { xid }),
            Err(e) => return Err(e.into()),
        }

        self.check_fault(ctx, FaultPoint::PrepareBefore)?;
        if let Err(e) = self.resolve_descendants(ctx, slot, Outcome::Commit { durable: false }) {
            self.env.release_xid(&xid);
            return Err(e);
        }
        let sync = self.sync_on_prepare(ctx);
        if let Err(e) = self.env.prepare(handle, &xid, sync) {
            // Descendants are already folded; the old state cannot be restored.
            fatal("preparing", handle, e);
        }
        if let Some(node) = ctx.arena.get_mut(slot) {
            node.prepared = true;
        }
        self.check_fault(ctx, FaultPoint::PrepareAfter)?;

        let detach = all
            && match self.detach {
                PrepareDetach::Never => false,
                PrepareDetach::Replica => ctx.role() == ConnectionRole::Replica,
                PrepareDetach::Always => true,
            };
        if detach {
            ctx.arena.remove(slot);
            ctx.forget(slot);
        }

        self.counters.prepares.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "keel::xa",
            conn = %ctx.id(),
            %handle,
            %xid,
            sync,
            detached = detach,
            "Prepared transaction"
        );
        Ok(())
    }

    /// XA ids of every prepared transaction in the environment
    pub fn recover(&self) -> KeelResult<Vec<Xid>> {
        self.ensure_running()?;
        let prepared = self.env.recover()?;
        info!(target: "keel::xa", count = prepared.len(), "Recovered prepared transactions");
        Ok(prepared.into_iter().map(|(xid, _)| xid).collect())
    }

    /// Commit a prepared transaction by XA id
    pub fn commit_by_xid(&self, xid: &Xid) -> KeelResult<()> {
        self.ensure_running()?;
        match self.env.commit_by_xid(xid) {
            Ok(()) => {
                self.counters.xa_commits.fetch_add(1, Ordering::Relaxed);
                info!(target: "keel::xa", %xid, "Committed prepared transaction");
                Ok(())
            }
            Err(e) => {
                self.counters.xa_failures.fetch_add(1, Ordering::Relaxed);
                warn!(target: "keel::xa", %xid, error = %e, "Commit by XA id failed");
                Err(KeelError::xa_resolution(xid.clone(), e.to_string()))
            }
        }
    }

    /// Roll back a prepared transaction by XA id
    pub fn rollback_by_xid(&self, xid: &Xid) -> KeelResult<()> {
        self.ensure_running()?;
        match self.env.rollback_by_xid(xid) {
            Ok(()) => {
                self.counters.xa_rollbacks.fetch_add(1, Ordering::Relaxed);
                info!(target: "keel::xa", %xid, "Rolled back prepared transaction");
                Ok(())
            }
            Err(e) => {
                self.counters.xa_failures.fetch_add(1, Ordering::Relaxed);
                warn!(target: "keel::xa", %xid, error = %e, "Rollback by XA id failed");
                Err(KeelError::xa_resolution(xid.clone(), e.to_string()))
            }
        }
    }

    // ========================================================================
    // Checkpoint lock
    // ========================================================================

    /// Hold off checkpoints on behalf of this connection. Idempotent.
    ///
    /// Blocks while a checkpoint is running.
    pub fn checkpoint_lock_acquire(&self, ctx: &mut ConnectionContext) -> KeelResult<()> {
        self.ensure_usable(ctx)?;
        if ctx.checkpoint_lock_held {
            return Ok(());
        }
        let previous = ctx.proc_info.set(PROC_INFO_ACQUIRE_CHECKPOINT_LOCK);
        let result = self.env.checkpoint_postpone();
        ctx.proc_info.restore(previous);
        result?;
        ctx.checkpoint_lock_held = true;
        self.counters
            .checkpoint_lock_acquires
            .fetch_add(1, Ordering::Relaxed);
        debug!(target: "keel::checkpoint", conn = %ctx.id(), "Checkpoint lock acquired");
        Ok(())
    }

    /// Let checkpoints run again. Idempotent.
    pub fn checkpoint_lock_release(&self, ctx: &mut ConnectionContext) -> KeelResult<()> {
        self.ensure_usable(ctx)?;
        if !ctx.checkpoint_lock_held {
            return Ok(());
        }
        let previous = ctx.proc_info.set(PROC_INFO_RELEASE_CHECKPOINT_LOCK);
        let result = self.env.checkpoint_resume();
        ctx.proc_info.restore(previous);
        result?;
        ctx.checkpoint_lock_held = false;
        debug!(target: "keel::checkpoint", conn = %ctx.id(), "Checkpoint lock released");
        Ok(())
    }

    // ========================================================================
    // Lock waits and kill
    // ========================================================================

    /// Wait for `blocking` to release a lock needed by the connection's
    /// innermost handle.
    ///
    /// A kill or timeout leaves the handle alive so the caller can roll back.
    pub fn lock_wait(
        &self,
        ctx: &mut ConnectionContext,
        blocking: TxnHandle,
        left_key: &[u8],
        right_key: &[u8],
    ) -> KeelResult<()> {
        self.ensure_usable(ctx)?;
        let handle = ctx
            .current_handle()
            .ok_or(KeelError::NoActiveTransaction)?;
        match self.env.lock_wait(handle, blocking, left_key, right_key) {
            Ok(()) => Ok(()),
            Err(EnvError::Killed) => {
                debug!(target: "keel::txn", conn = %ctx.id(), %handle, "Lock wait killed");
                Err(KeelError::Killed)
            }
            Err(EnvError::LockTimeout) => Err(KeelError::LockTimeout),
            Err(e) => Err(e.into()),
        }
    }

    /// Interrupt any blocking wait of connection `id`
    pub fn kill(&self, id: ConnectionId) {
        self.env.kill_waiter(id);
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Release everything a closing connection still holds.
    ///
    /// Prepared handles are left in doubt for the transaction manager;
    /// anything else still open is a leak and is aborted. A poisoned
    /// context is dropped without touching the environment.
    pub fn close_connection(&self, ctx: &mut ConnectionContext) -> CloseReport {
        let mut report = CloseReport::default();
        if ctx.poisoned {
            warn!(target: "keel::txn", conn = %ctx.id(), "Dropping crashed connection without cleanup");
            ctx.clear();
            return report;
        }

        if ctx.checkpoint_lock_held {
            if let Err(e) = self.env.checkpoint_resume() {
                warn!(target: "keel::checkpoint", conn = %ctx.id(), error = %e, "Failed to release checkpoint lock on close");
            }
            ctx.checkpoint_lock_held = false;
            report.released_checkpoint_lock = true;
        }

        let mut slots: Vec<(usize, SlotId)> = ctx
            .arena
            .iter()
            .map(|(slot, _)| (ctx.arena.depth(slot), slot))
            .collect();
        slots.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, slot) in slots {
            let Some(node) = ctx.arena.get(slot).cloned() else {
                continue;
            };
            if node.prepared {
                report.detached += 1;
                info!(target: "keel::xa", conn = %ctx.id(), handle = %node.handle, "Leaving prepared transaction in doubt");
            } else {
                report.aborted += 1;
                warn!(target: "keel::txn", conn = %ctx.id(), handle = %node.handle, "Aborting transaction leaked by closing connection");
                if let Err(e) = self.env.abort(node.handle, &mut |_: &TxnProgress| {}) {
                    warn!(target: "keel::txn", handle = %node.handle, error = %e, "Abort of leaked transaction failed");
                }
            }
            ctx.arena.remove(slot);
        }
        ctx.clear();

        self.counters
            .leaked_handles
            .fetch_add(report.aborted as u64, Ordering::Relaxed);
        self.counters
            .detached_prepared
            .fetch_add(report.detached as u64, Ordering::Relaxed);
        report
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn ensure_running(&self) -> KeelResult<()> {
        if self.is_crashed() {
            return Err(KeelError::EngineUnavailable {
                state: "crashed".to_string(),
            });
        }
        Ok(())
    }

    fn ensure_usable(&self, ctx: &ConnectionContext) -> KeelResult<()> {
        if ctx.poisoned {
            return Err(KeelError::EngineUnavailable {
                state: "crashed".to_string(),
            });
        }
        self.ensure_running()
    }

    fn check_fault(&self, ctx: &mut ConnectionContext, point: FaultPoint) -> KeelResult<()> {
        let injector = self.fault.read().clone();
        let Some(injector) = injector else {
            return Ok(());
        };
        if injector(point) == FaultAction::Crash {
            ctx.poisoned = true;
            self.crashed.store(true, Ordering::Release);
            error!(target: "keel::txn", conn = %ctx.id(), %point, "Simulated crash");
            return Err(KeelError::InjectedCrash { point: point.name() });
        }
        Ok(())
    }

    fn lookup_savepoint(&self, ctx: &ConnectionContext, name: &str) -> KeelResult<SavepointEntry> {
        let entry = ctx
            .savepoints
            .get(name)
            .cloned()
            .ok_or_else(|| KeelError::SavepointNotFound {
                name: name.to_string(),
            })?;
        if entry.owner != ctx.id() {
            return Err(KeelError::ForeignSavepoint {
                name: name.to_string(),
            });
        }
        Ok(entry)
    }

    fn run_resource_handlers(&self, ctx: &mut ConnectionContext, slot: SlotId) {
        let Some(handle) = ctx.arena.handle(slot) else {
            return;
        };
        for handler in std::mem::take(&mut ctx.resource_handlers) {
            handler(handle);
        }
    }

    fn resolve_descendants(
        &self,
        ctx: &mut ConnectionContext,
        slot: SlotId,
        outcome: Outcome,
    ) -> KeelResult<()> {
        for child in ctx.arena.descendants_deepest_first(slot) {
            self.resolve(ctx, child, outcome.nested())?;
            ctx.arena.remove(child);
            ctx.forget(child);
        }
        Ok(())
    }

    /// Commit or abort the handle in `slot`, reporting progress on the
    /// connection's status line. The slot itself is left in place.
    fn resolve(
        &self,
        ctx: &mut ConnectionContext,
        slot: SlotId,
        outcome: Outcome,
    ) -> KeelResult<TxnHandle> {
        let node = ctx
            .arena
            .get(slot)
            .cloned()
            .ok_or(KeelError::NoActiveTransaction)?;
        let info = ctx.proc_info.clone();
        let previous = info.get();
        let mut last = None;
        let result = {
            let mut report = |p: &TxnProgress| {
                let text = format_progress(p);
                info.set(text.clone());
                last = Some(text);
            };
            match outcome {
                Outcome::Commit { durable } => self.env.commit(node.handle, durable, &mut report),
                Outcome::Abort => self.env.abort(node.handle, &mut report),
            }
        };
        info.restore(previous);
        if last.is_some() {
            ctx.last_progress = last;
        }

        match result {
            Ok(()) => Ok(node.handle),
            Err(EnvError::UnknownTxn(_)) if node.prepared => {
                warn!(
                    target: "keel::xa",
                    handle = %node.handle,
                    "Prepared transaction was already resolved by XA id"
                );
                Ok(node.handle)
            }
            Err(e) => fatal(outcome.verb(), node.handle, e),
        }
    }
}
