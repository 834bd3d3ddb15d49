//! Log-backed environment
//!
//! `LogEnvironment` is the reference implementation of
//! [`keel_core::Environment`]. It keeps the transaction table in memory and
//! records only what must survive a crash in `keel.log`: top-level commits,
//! prepares, resolutions of prepared transactions, checkpoints, and the
//! shutdown marker.
//!
//! # Locking
//!
//! Lock order is `table` then `log`. Lock waits park on `wakeup`, which is
//! signalled whenever a transaction ends, a waiter is killed, or the
//! environment closes.

use crate::barrier::CheckpointBarrier;
use crate::log::{scan_log, LogCounters, LogRecord, LogWriter, LOG_FILE_NAME};
use crate::replay::{replay, PreviousShutdown, ReplayStats};
use keel_core::{
    CloseMode, ConnectionId, EnvError, EnvResult, Environment, Isolation, LockTimeoutCallback,
    LockTimeoutEvent, ProgressFn, TxnHandle, TxnProgress, Xid,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// File name of the directory lock
pub const LOCK_FILE_NAME: &str = "keel.lock";

/// Default lock wait timeout
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(4000);

/// Options for [`LogEnvironment::open`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogEnvOptions {
    /// Refuse every write to the log
    pub read_only: bool,
    /// Open past a damaged log, keeping its valid prefix
    pub force_recovery: bool,
}

#[derive(Debug)]
struct TxnEntry {
    parent: Option<TxnHandle>,
    open_children: usize,
    isolation: Isolation,
    owner: Option<ConnectionId>,
    xid: Option<Xid>,
    entries: u64,
}

impl TxnEntry {
    fn is_prepared(&self) -> bool {
        self.xid.is_some()
    }
}

#[derive(Debug, Default)]
struct TxnTable {
    live: HashMap<TxnHandle, TxnEntry>,
    by_xid: HashMap<Xid, TxnHandle>,
    // Prepared transactions forgotten by `discard`. Their Prepare records
    // must survive checkpoints so the next open still sees them in doubt.
    discarded: BTreeMap<TxnHandle, Xid>,
    // XA ids claimed by `reserve_xid` but not prepared yet.
    reserved: HashMap<Xid, TxnHandle>,
    waiting: HashMap<ConnectionId, usize>,
    killed: HashSet<ConnectionId>,
}

impl TxnTable {
    fn xid_taken(&self, xid: &Xid, txn: TxnHandle) -> bool {
        self.by_xid.contains_key(xid)
            || self.discarded.values().any(|x| x == xid)
            || self.reserved.get(xid).is_some_and(|owner| *owner != txn)
    }

    fn drop_reservations(&mut self, txn: TxnHandle) {
        self.reserved.retain(|_, owner| *owner != txn);
    }
}

/// Reference environment backed by a single append-only log
pub struct LogEnvironment {
    dir: PathBuf,
    options: LogEnvOptions,
    table: Mutex<TxnTable>,
    wakeup: Condvar,
    log: Mutex<Option<LogWriter>>,
    barrier: CheckpointBarrier,
    next_txn: AtomicU64,
    checkpoint_sequence: AtomicU64,
    lock_timeout: Mutex<Duration>,
    lock_timeout_callback: RwLock<Option<LockTimeoutCallback>>,
    closed: AtomicBool,
    previous_shutdown: PreviousShutdown,
    replay_stats: ReplayStats,
    recovered_in_doubt: usize,
    damaged: bool,
    _lock_file: File,
}

impl std::fmt::Debug for LogEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEnvironment")
            .field("dir", &self.dir)
            .field("options", &self.options)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl LogEnvironment {
    /// Open (or create) the environment in `dir`.
    ///
    /// Takes an exclusive lock on the directory, scans and replays the log,
    /// and re-materializes every prepared transaction that was never
    /// resolved.
    ///
    /// # Errors
    ///
    /// - `EnvError::Locked` if another environment holds the directory.
    /// - `EnvError::Corruption` if the log is damaged and `force_recovery`
    ///   is off.
    pub fn open(dir: impl AsRef<Path>, options: LogEnvOptions) -> EnvResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        if options.read_only {
            if !dir.is_dir() {
                return Err(EnvError::invalid_argument(format!(
                    "read-only environment directory '{}' does not exist",
                    dir.display()
                )));
            }
        } else {
            fs::create_dir_all(&dir)?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(dir.join(LOCK_FILE_NAME))?;
        fs2::FileExt::try_lock_exclusive(&lock_file)
            .map_err(|_| EnvError::Locked(dir.display().to_string()))?;

        let log_path = dir.join(LOG_FILE_NAME);
        let scan = scan_log(&log_path, options.force_recovery)?;
        let recovered = replay(&scan);
        let writer = if options.read_only {
            None
        } else {
            Some(LogWriter::open(&log_path, scan.valid_len)?)
        };

        let mut table = TxnTable::default();
        for (txn, xid) in &recovered.in_doubt {
            if let Some(previous) = table.by_xid.insert(xid.clone(), *txn) {
                warn!(
                    target: "keel::log",
                    %xid,
                    %previous,
                    replacement = %txn,
                    "XA id prepared twice in log; keeping the later transaction"
                );
                table.live.remove(&previous);
            }
            table.live.insert(
                *txn,
                TxnEntry {
                    parent: None,
                    open_children: 0,
                    isolation: Isolation::default(),
                    owner: None,
                    xid: Some(xid.clone()),
                    entries: 0,
                },
            );
        }
        let recovered_in_doubt = table.by_xid.len();

        info!(
            target: "keel::log",
            dir = %dir.display(),
            previous_shutdown = ?recovered.previous_shutdown,
            in_doubt = recovered_in_doubt,
            records = recovered.stats.records,
            read_only = options.read_only,
            "Environment opened"
        );
        if recovered.damaged {
            warn!(target: "keel::log", "Log was damaged; records after the damage were dropped");
        }

        Ok(LogEnvironment {
            dir,
            options,
            table: Mutex::new(table),
            wakeup: Condvar::new(),
            log: Mutex::new(writer),
            barrier: CheckpointBarrier::new(),
            next_txn: AtomicU64::new(recovered.next_txn),
            checkpoint_sequence: AtomicU64::new(recovered.checkpoint_sequence),
            lock_timeout: Mutex::new(DEFAULT_LOCK_TIMEOUT),
            lock_timeout_callback: RwLock::new(None),
            closed: AtomicBool::new(false),
            previous_shutdown: recovered.previous_shutdown,
            replay_stats: recovered.stats,
            recovered_in_doubt,
            damaged: recovered.damaged,
            _lock_file: lock_file,
        })
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Directory the environment lives in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Options the environment was opened with
    pub fn options(&self) -> LogEnvOptions {
        self.options
    }

    /// How the previous session ended
    pub fn previous_shutdown(&self) -> PreviousShutdown {
        self.previous_shutdown
    }

    /// Prepared transactions found in doubt at open
    pub fn recovered_in_doubt(&self) -> usize {
        self.recovered_in_doubt
    }

    /// Counters from the replay at open
    pub fn replay_stats(&self) -> ReplayStats {
        self.replay_stats
    }

    /// True if forced recovery dropped damaged records at open
    pub fn was_damaged(&self) -> bool {
        self.damaged
    }

    /// Outstanding checkpoint postponements
    pub fn postpone_count(&self) -> u64 {
        self.barrier.postponed()
    }

    /// Live transactions, prepared ones included
    pub fn live_count(&self) -> usize {
        self.table.lock().live.len()
    }

    /// True if `txn` is live
    pub fn is_live(&self, txn: TxnHandle) -> bool {
        self.table.lock().live.contains_key(&txn)
    }

    /// Effective isolation level of a live transaction
    pub fn isolation_of(&self, txn: TxnHandle) -> Option<Isolation> {
        self.table.lock().live.get(&txn).map(|e| e.isolation)
    }

    /// Number of completed checkpoints (across sessions)
    pub fn checkpoint_sequence(&self) -> u64 {
        self.checkpoint_sequence.load(Ordering::Acquire)
    }

    /// Log writer counters, `None` when read-only or closed
    pub fn log_counters(&self) -> Option<LogCounters> {
        self.log.lock().as_ref().map(|w| w.counters())
    }

    /// True once `close` has succeeded
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn ensure_open(&self) -> EnvResult<()> {
        if self.is_closed() {
            return Err(EnvError::Closed);
        }
        Ok(())
    }

    fn append(&self, record: &LogRecord, sync: bool) -> EnvResult<()> {
        let mut log = self.log.lock();
        match log.as_mut() {
            Some(writer) => writer.append(record, sync),
            None => Err(EnvError::ReadOnly),
        }
    }

    fn report_lock_timeout(&self, event: LockTimeoutEvent) {
        let callback = self.lock_timeout_callback.read().clone();
        if let Some(callback) = callback {
            callback(&event);
        }
    }
}

impl Environment for LogEnvironment {
    fn begin(
        &self,
        parent: Option<TxnHandle>,
        isolation: Isolation,
        owner: ConnectionId,
    ) -> EnvResult<TxnHandle> {
        self.ensure_open()?;
        let mut table = self.table.lock();

        let effective = match parent {
            Some(p) => {
                let parent_entry = table.live.get_mut(&p).ok_or(EnvError::UnknownTxn(p))?;
                if parent_entry.is_prepared() {
                    return Err(EnvError::invalid_state(
                        p,
                        "cannot nest under a prepared transaction",
                    ));
                }
                parent_entry.open_children += 1;
                match isolation {
                    Isolation::Inherit => parent_entry.isolation,
                    other => other,
                }
            }
            None if isolation == Isolation::Inherit => {
                return Err(EnvError::invalid_argument(
                    "inherited isolation requires a parent transaction",
                ));
            }
            None => isolation,
        };

        let txn = TxnHandle::new(self.next_txn.fetch_add(1, Ordering::AcqRel));
        table.live.insert(
            txn,
            TxnEntry {
                parent,
                open_children: 0,
                isolation: effective,
                owner: Some(owner),
                xid: None,
                entries: 0,
            },
        );
        debug!(target: "keel::log", %txn, parent = ?parent, isolation = ?effective, %owner, "begin");
        Ok(txn)
    }

    fn commit(&self, txn: TxnHandle, durable: bool, progress: ProgressFn<'_>) -> EnvResult<()> {
        self.ensure_open()?;
        let mut table = self.table.lock();
        let (parent, xid, entries) = {
            let entry = table.live.get(&txn).ok_or(EnvError::UnknownTxn(txn))?;
            if entry.open_children > 0 {
                return Err(EnvError::OpenChildren {
                    txn,
                    count: entry.open_children,
                });
            }
            (entry.parent, entry.xid.clone(), entry.entries)
        };

        let total = entries + 1;
        progress(&TxnProgress {
            is_commit: true,
            stalled_on_checkpoint: self.barrier.is_running(),
            entries_processed: 0,
            entries_total: total,
        });

        if parent.is_none() && (xid.is_some() || !self.options.read_only) {
            self.append(&LogRecord::Commit { txn }, durable || xid.is_some())?;
        }

        table.live.remove(&txn);
        table.drop_reservations(txn);
        if let Some(p) = parent {
            if let Some(parent_entry) = table.live.get_mut(&p) {
                parent_entry.open_children -= 1;
                parent_entry.entries += total;
            }
        }
        if let Some(xid) = &xid {
            table.by_xid.remove(xid);
        }
        drop(table);
        self.wakeup.notify_all();

        progress(&TxnProgress {
            is_commit: true,
            stalled_on_checkpoint: false,
            entries_processed: total,
            entries_total: total,
        });
        debug!(target: "keel::log", %txn, durable, "commit");
        Ok(())
    }

    fn abort(&self, txn: TxnHandle, progress: ProgressFn<'_>) -> EnvResult<()> {
        self.ensure_open()?;
        let mut table = self.table.lock();
        let (parent, xid, entries) = {
            let entry = table.live.get(&txn).ok_or(EnvError::UnknownTxn(txn))?;
            if entry.open_children > 0 {
                return Err(EnvError::OpenChildren {
                    txn,
                    count: entry.open_children,
                });
            }
            (entry.parent, entry.xid.clone(), entry.entries)
        };

        let total = entries + 1;
        progress(&TxnProgress {
            is_commit: false,
            stalled_on_checkpoint: self.barrier.is_running(),
            entries_processed: 0,
            entries_total: total,
        });

        if xid.is_some() {
            self.append(&LogRecord::Abort { txn }, true)?;
        }

        table.live.remove(&txn);
        table.drop_reservations(txn);
        if let Some(p) = parent {
            if let Some(parent_entry) = table.live.get_mut(&p) {
                parent_entry.open_children -= 1;
            }
        }
        if let Some(xid) = &xid {
            table.by_xid.remove(xid);
        }
        drop(table);
        self.wakeup.notify_all();

        progress(&TxnProgress {
            is_commit: false,
            stalled_on_checkpoint: false,
            entries_processed: total,
            entries_total: total,
        });
        debug!(target: "keel::log", %txn, "abort");
        Ok(())
    }

    fn parent(&self, txn: TxnHandle) -> EnvResult<Option<TxnHandle>> {
        self.table
            .lock()
            .live
            .get(&txn)
            .map(|e| e.parent)
            .ok_or(EnvError::UnknownTxn(txn))
    }

    fn reserve_xid(&self, txn: TxnHandle, xid: &Xid) -> EnvResult<()> {
        self.ensure_open()?;
        if self.options.read_only {
            return Err(EnvError::ReadOnly);
        }
        let mut table = self.table.lock();
        let entry = table.live.get(&txn).ok_or(EnvError::UnknownTxn(txn))?;
        if entry.parent.is_some() {
            return Err(EnvError::invalid_state(
                txn,
                "only top-level transactions can be prepared",
            ));
        }
        if entry.is_prepared() {
            return Err(EnvError::invalid_state(txn, "already prepared"));
        }
        if table.xid_taken(xid, txn) {
            return Err(EnvError::DuplicateXid(xid.clone()));
        }
        table.reserved.insert(xid.clone(), txn);
        debug!(target: "keel::xa", %txn, %xid, "XA id reserved");
        Ok(())
    }

    fn release_xid(&self, xid: &Xid) {
        if self.table.lock().reserved.remove(xid).is_some() {
            debug!(target: "keel::xa", %xid, "XA id reservation released");
        }
    }

    fn prepare(&self, txn: TxnHandle, xid: &Xid, durable: bool) -> EnvResult<()> {
        self.ensure_open()?;
        if self.options.read_only {
            return Err(EnvError::ReadOnly);
        }
        let mut table = self.table.lock();
        {
            let entry = table.live.get(&txn).ok_or(EnvError::UnknownTxn(txn))?;
            if entry.parent.is_some() {
                return Err(EnvError::invalid_state(
                    txn,
                    "only top-level transactions can be prepared",
                ));
            }
            if entry.is_prepared() {
                return Err(EnvError::invalid_state(txn, "already prepared"));
            }
            if entry.open_children > 0 {
                return Err(EnvError::OpenChildren {
                    txn,
                    count: entry.open_children,
                });
            }
        }
        if table.xid_taken(xid, txn) {
            return Err(EnvError::DuplicateXid(xid.clone()));
        }

        self.append(
            &LogRecord::Prepare {
                txn,
                xid: xid.clone(),
            },
            durable,
        )?;

        if let Some(entry) = table.live.get_mut(&txn) {
            entry.xid = Some(xid.clone());
        }
        table.reserved.remove(xid);
        table.by_xid.insert(xid.clone(), txn);
        info!(target: "keel::xa", %txn, %xid, durable, "Transaction prepared");
        Ok(())
    }

    fn recover(&self) -> EnvResult<Vec<(Xid, TxnHandle)>> {
        self.ensure_open()?;
        let table = self.table.lock();
        let mut prepared: Vec<(Xid, TxnHandle)> = table
            .by_xid
            .iter()
            .map(|(xid, txn)| (xid.clone(), *txn))
            .collect();
        prepared.sort_by_key(|(_, txn)| *txn);
        Ok(prepared)
    }

    fn txn_from_xid(&self, xid: &Xid) -> EnvResult<TxnHandle> {
        self.ensure_open()?;
        self.table
            .lock()
            .by_xid
            .get(xid)
            .copied()
            .ok_or_else(|| EnvError::XidNotFound(xid.clone()))
    }

    fn discard(&self, txn: TxnHandle) -> EnvResult<()> {
        self.ensure_open()?;
        let mut table = self.table.lock();
        let xid = match table.live.get(&txn) {
            Some(entry) => entry
                .xid
                .clone()
                .ok_or_else(|| EnvError::invalid_state(txn, "only prepared transactions can be discarded"))?,
            None => return Err(EnvError::UnknownTxn(txn)),
        };
        table.live.remove(&txn);
        table.by_xid.remove(&xid);
        debug!(target: "keel::xa", %txn, %xid, "Prepared transaction discarded");
        table.discarded.insert(txn, xid);
        Ok(())
    }

    fn checkpoint_postpone(&self) -> EnvResult<()> {
        self.ensure_open()?;
        self.barrier.postpone()
    }

    fn checkpoint_resume(&self) -> EnvResult<()> {
        self.barrier.resume()
    }

    fn checkpoint(&self) -> EnvResult<()> {
        self.ensure_open()?;
        let _running = self.barrier.begin()?;
        if self.options.read_only {
            return Ok(());
        }

        let table = self.table.lock();
        let sequence = self.checkpoint_sequence.load(Ordering::Acquire) + 1;
        let mut prepared: BTreeMap<TxnHandle, Xid> = table
            .live
            .iter()
            .filter_map(|(txn, e)| e.xid.clone().map(|xid| (*txn, xid)))
            .collect();
        prepared.extend(table.discarded.iter().map(|(t, x)| (*t, x.clone())));

        let mut records: Vec<LogRecord> = prepared
            .into_iter()
            .map(|(txn, xid)| LogRecord::Prepare { txn, xid })
            .collect();
        let kept = records.len();
        records.push(LogRecord::Checkpoint {
            sequence,
            next_txn: self.next_txn.load(Ordering::Acquire),
        });

        {
            let mut log = self.log.lock();
            if let Some(writer) = log.as_mut() {
                writer.rewrite(&records)?;
            }
        }
        drop(table);

        self.checkpoint_sequence.store(sequence, Ordering::Release);
        info!(target: "keel::checkpoint", sequence, prepared_kept = kept, "Checkpoint complete");
        Ok(())
    }

    fn log_flush(&self) -> EnvResult<()> {
        self.ensure_open()?;
        let mut log = self.log.lock();
        if let Some(writer) = log.as_mut() {
            writer.sync()?;
        }
        Ok(())
    }

    fn log_sync_pending(&self) -> EnvResult<bool> {
        self.ensure_open()?;
        match self.log.lock().as_mut() {
            Some(writer) => writer.sync_pending(),
            None => Ok(false),
        }
    }

    fn kill_waiter(&self, owner: ConnectionId) {
        let mut table = self.table.lock();
        if table.waiting.get(&owner).copied().unwrap_or(0) == 0 {
            return;
        }
        table.killed.insert(owner);
        drop(table);
        self.wakeup.notify_all();
        debug!(target: "keel::log", %owner, "Killed lock waiter");
    }

    fn lock_wait(
        &self,
        txn: TxnHandle,
        blocking: TxnHandle,
        left_key: &[u8],
        right_key: &[u8],
    ) -> EnvResult<()> {
        self.ensure_open()?;
        let deadline = Instant::now() + *self.lock_timeout.lock();
        let mut table = self.table.lock();
        let owner = table
            .live
            .get(&txn)
            .ok_or(EnvError::UnknownTxn(txn))?
            .owner;
        if !table.live.contains_key(&blocking) {
            return Ok(());
        }

        if let Some(o) = owner {
            *table.waiting.entry(o).or_insert(0) += 1;
        }
        let outcome = loop {
            if let Some(o) = owner {
                if table.killed.remove(&o) {
                    break Err(EnvError::Killed);
                }
            }
            if !table.live.contains_key(&blocking) {
                break Ok(());
            }
            if self.is_closed() {
                break Err(EnvError::Closed);
            }
            if self.wakeup.wait_until(&mut table, deadline).timed_out()
                && table.live.contains_key(&blocking)
            {
                break Err(EnvError::LockTimeout);
            }
        };
        if let Some(o) = owner {
            let remaining = table.waiting.get_mut(&o).map(|n| {
                *n -= 1;
                *n
            });
            if remaining == Some(0) {
                table.waiting.remove(&o);
                table.killed.remove(&o);
            }
        }
        drop(table);

        if matches!(outcome, Err(EnvError::LockTimeout)) {
            self.report_lock_timeout(LockTimeoutEvent {
                owner,
                requesting: txn,
                blocking,
                left_key: left_key.to_vec(),
                right_key: right_key.to_vec(),
            });
        }
        outcome
    }

    fn set_lock_timeout_callback(&self, callback: LockTimeoutCallback) {
        *self.lock_timeout_callback.write() = Some(callback);
    }

    fn set_lock_timeout(&self, timeout: Duration) {
        *self.lock_timeout.lock() = timeout;
    }

    fn set_fsync_log_period(&self, period: Duration) {
        if let Some(writer) = self.log.lock().as_mut() {
            writer.set_fsync_period(period);
        }
    }

    fn close(&self, mode: CloseMode) -> EnvResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let table = self.table.lock();
        let prepared_live = table.by_xid.len();
        if mode == CloseMode::Clean && prepared_live > 0 {
            return Err(EnvError::PreparedLive(prepared_live));
        }
        let leaked = table.live.len() - prepared_live;
        if leaked > 0 {
            warn!(target: "keel::lifecycle", leaked, "Closing environment with live transactions");
        }

        let dirty = mode == CloseMode::Dirty;
        if !self.options.read_only {
            let prepared = (table.discarded.len() + prepared_live) as u32;
            if let Err(e) = self.append(&LogRecord::Shutdown { dirty, prepared }, true) {
                error!(target: "keel::log", error = %e, "Failed to write shutdown record");
                return Err(e);
            }
        }
        self.closed.store(true, Ordering::Release);
        drop(table);

        self.barrier.close();
        self.wakeup.notify_all();
        *self.log.lock() = None;
        info!(target: "keel::lifecycle", dirty, dir = %self.dir.display(), "Environment closed");
        Ok(())
    }
}
