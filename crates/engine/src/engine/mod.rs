//! Engine: lifecycle, environment ownership and engine-level operations
//!
//! ## Startup
//!
//! 1. `Uninitialized → Initializing` under the exclusive gate
//! 2. Validate configuration, open the environment under an [`EnvGuard`]
//! 3. Install the lock-timeout reporter, lock timeout and fsync period
//! 4. Build the [`TransactionManager`], start the checkpointer and the log
//!    flusher
//! 5. Disarm the guard, `Initializing → Ready`
//!
//! Any failure closes whatever was opened and returns to `Uninitialized`.
//!
//! ## Shutdown
//!
//! 1. `Ready → ShuttingDown` under the exclusive gate, which waits out every
//!    operation holding the shared side
//! 2. Discard every prepared transaction still in the environment
//! 3. Close the environment, dirty iff anything was discarded
//! 4. Stop the checkpointer and the log flusher
//! 5. `ShuttingDown → Closed`, whatever happened in between

mod builder;
mod connection;

pub use builder::{log_env_opener, EngineBuilder};
pub use connection::Connection;

use crate::background::{Checkpointer, LogFlusher};
use crate::config::EngineConfig;
use crate::lifecycle::LifecycleState;
use crate::lock_timeout::LockTimeoutReporter;
use dashmap::DashMap;
use keel_concurrency::{FaultInjector, ProcInfo, TransactionManager, TxnStats};
use keel_core::{
    CloseMode, ConnectionId, EnvError, EnvResult, Environment, KeelError, KeelResult, Xid,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Opens the environment an engine drives
pub type EnvOpener =
    Arc<dyn Fn(&Path, &EngineConfig) -> EnvResult<Arc<dyn Environment>> + Send + Sync>;

// ============================================================================
// Running state
// ============================================================================

/// Everything that exists only while the engine is `Ready`
pub(crate) struct Running {
    pub(crate) env: Arc<dyn Environment>,
    pub(crate) manager: Arc<TransactionManager>,
    pub(crate) reporter: Arc<LockTimeoutReporter>,
    checkpointer: Option<Checkpointer>,
    flusher: Option<LogFlusher>,
}

pub(crate) struct EngineState {
    pub(crate) lifecycle: LifecycleState,
    pub(crate) running: Option<Running>,
}

impl EngineState {
    /// Running components, or `EngineUnavailable` unless `Ready`
    pub(crate) fn ready(&self) -> KeelResult<&Running> {
        match (&self.lifecycle, &self.running) {
            (LifecycleState::Ready, Some(running)) => Ok(running),
            (state, _) => Err(unavailable(*state)),
        }
    }
}

fn unavailable(state: LifecycleState) -> KeelError {
    KeelError::EngineUnavailable {
        state: state.to_string(),
    }
}

/// Closes the environment on drop unless disarmed
struct EnvGuard {
    env: Arc<dyn Environment>,
    armed: bool,
}

impl EnvGuard {
    fn new(env: Arc<dyn Environment>) -> Self {
        Self { env, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = close_env(self.env.as_ref(), CloseMode::Clean) {
                warn!(target: "keel::lifecycle", error = %e, "Failed to close environment after failed startup");
            }
        }
    }
}

/// Close `env`, falling back to a dirty close if prepared work is still live.
/// Returns the mode actually used.
fn close_env(env: &dyn Environment, mode: CloseMode) -> EnvResult<CloseMode> {
    match env.close(mode) {
        Ok(()) => Ok(mode),
        Err(EnvError::PreparedLive(count)) if mode == CloseMode::Clean => {
            warn!(target: "keel::lifecycle", count, "Prepared transactions still live; closing dirty");
            env.close(CloseMode::Dirty).map(|()| CloseMode::Dirty)
        }
        Err(e) => Err(e),
    }
}

/// What shutdown had to do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Prepared transactions discarded
    pub discarded: usize,
    /// True if the environment was closed dirty
    pub dirty: bool,
    /// Background checkpoints completed over the engine's life
    pub checkpoints: u64,
    /// Background log syncs issued over the engine's life
    pub log_syncs: u64,
    /// Environment close failure, if any
    pub close_error: Option<String>,
}

fn tear_down(mut running: Running) -> ShutdownReport {
    let mut report = ShutdownReport::default();

    if running.manager.is_crashed() {
        warn!(target: "keel::lifecycle", "Engine crashed; leaving environment unclosed");
        stop_workers(&mut running, &mut report);
        return report;
    }

    match running.env.recover() {
        Ok(prepared) => {
            for (xid, txn) in prepared {
                match running.env.discard(txn) {
                    Ok(()) => {
                        report.discarded += 1;
                        info!(target: "keel::xa", %xid, %txn, "Discarded prepared transaction at shutdown");
                    }
                    Err(e) => {
                        warn!(target: "keel::xa", %xid, %txn, error = %e, "Failed to discard prepared transaction")
                    }
                }
            }
        }
        Err(e) => warn!(target: "keel::xa", error = %e, "Failed to list prepared transactions at shutdown"),
    }

    // Close syncs the log itself.
    if let Some(mut flusher) = running.flusher.take() {
        flusher.stop();
        report.log_syncs = flusher.synced();
    }

    let mode = if report.discarded > 0 {
        CloseMode::Dirty
    } else {
        CloseMode::Clean
    };
    match close_env(running.env.as_ref(), mode) {
        Ok(used) => report.dirty = used == CloseMode::Dirty,
        Err(e) => {
            error!(target: "keel::lifecycle", error = %e, "Failed to close environment");
            report.close_error = Some(e.to_string());
        }
    }

    stop_workers(&mut running, &mut report);
    report
}

fn stop_workers(running: &mut Running, report: &mut ShutdownReport) {
    if let Some(mut flusher) = running.flusher.take() {
        flusher.stop();
        report.log_syncs = flusher.synced();
    }
    if let Some(mut checkpointer) = running.checkpointer.take() {
        checkpointer.stop();
        report.checkpoints = checkpointer.completed();
    }
}

// ============================================================================
// Engine
// ============================================================================

pub(crate) struct EngineInner {
    dir: PathBuf,
    config: EngineConfig,
    opener: EnvOpener,
    fault: Option<FaultInjector>,
    pub(crate) gate: RwLock<EngineState>,
    next_connection: AtomicU64,
    pub(crate) connections: DashMap<ConnectionId, ProcInfo>,
}

impl EngineInner {
    fn start_components(&self) -> KeelResult<Running> {
        self.config.validate()?;
        std::fs::create_dir_all(&self.dir).map_err(EnvError::from)?;

        let env = (self.opener)(&self.dir, &self.config)?;
        let mut guard = EnvGuard::new(Arc::clone(&env));

        let reporter = Arc::new(LockTimeoutReporter::new(self.config.lock_timeout_debug));
        env.set_lock_timeout_callback(reporter.callback());
        env.set_lock_timeout(self.config.lock_timeout());
        env.set_fsync_log_period(self.config.fsync_log_period());

        let mut manager = TransactionManager::new(
            Arc::clone(&env),
            self.config.sync_policy(),
            self.config.prepare_detach,
        );
        if let Some(injector) = &self.fault {
            manager = manager.with_fault_injector(Arc::clone(injector));
        }

        let in_doubt = env.recover()?.len();
        if in_doubt > 0 {
            warn!(target: "keel::xa", in_doubt, "Prepared transactions awaiting resolution");
        }

        let checkpointer = match self.config.checkpointing_period() {
            Some(period) => Some(Checkpointer::spawn(&env, period)?),
            None => None,
        };
        let fsync_period = self.config.fsync_log_period();
        let flusher = if fsync_period.is_zero() {
            None
        } else {
            Some(LogFlusher::spawn(&env, fsync_period)?)
        };

        guard.disarm();
        Ok(Running {
            env,
            manager: Arc::new(manager),
            reporter,
            checkpointer,
            flusher,
        })
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let state = self.gate.get_mut();
        if let Some(running) = state.running.take() {
            warn!(target: "keel::lifecycle", dir = %self.dir.display(), "Engine dropped without shutdown");
            tear_down(running);
            state.lifecycle = LifecycleState::Closed;
        }
    }
}

/// Engine-level statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Lifecycle state
    pub state: LifecycleState,
    /// Open connections
    pub connections: usize,
    /// Transaction counters (zero unless `Ready`)
    pub txn: TxnStats,
    /// Background checkpoints completed
    pub checkpoints: u64,
    /// Background checkpoints failed
    pub checkpoint_failures: u64,
    /// Log syncs issued by the background flusher
    pub log_syncs: u64,
}

/// Transaction-lifecycle coordinator for one data directory
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dir", &self.inner.dir)
            .field("state", &self.state())
            .finish()
    }
}

impl Engine {
    pub(crate) fn new(
        dir: PathBuf,
        config: EngineConfig,
        opener: EnvOpener,
        fault: Option<FaultInjector>,
    ) -> Self {
        Engine {
            inner: Arc::new(EngineInner {
                dir,
                config,
                opener,
                fault,
                gate: RwLock::new(EngineState {
                    lifecycle: LifecycleState::Uninitialized,
                    running: None,
                }),
                next_connection: AtomicU64::new(1),
                connections: DashMap::new(),
            }),
        }
    }

    /// Builder for custom configuration
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Open and start an engine on `path`, configured by its `keel.toml`
    pub fn open<P: Into<PathBuf>>(path: P) -> KeelResult<Self> {
        Self::builder().path(path).open()
    }

    /// Data directory
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Configuration in effect
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.inner.gate.read().lifecycle
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the engine.
    ///
    /// # Errors
    ///
    /// - `EngineUnavailable` unless the engine is `Uninitialized`
    /// - `Config` for invalid option combinations
    /// - `Environment` if the environment cannot be opened
    pub fn startup(&self) -> KeelResult<()> {
        {
            let mut state = self.inner.gate.write();
            if !state
                .lifecycle
                .can_transition_to(LifecycleState::Initializing)
            {
                return Err(unavailable(state.lifecycle));
            }
            state.lifecycle = LifecycleState::Initializing;
        }
        info!(target: "keel::lifecycle", dir = %self.inner.dir.display(), "Starting engine");

        match self.inner.start_components() {
            Ok(running) => {
                let mut state = self.inner.gate.write();
                state.running = Some(running);
                state.lifecycle = LifecycleState::Ready;
                info!(target: "keel::lifecycle", "Engine ready");
                Ok(())
            }
            Err(e) => {
                self.inner.gate.write().lifecycle = LifecycleState::Uninitialized;
                error!(target: "keel::lifecycle", error = %e, "Engine startup failed");
                Err(e)
            }
        }
    }

    /// Shut the engine down. Always ends `Closed` once started.
    ///
    /// # Errors
    ///
    /// `EngineUnavailable` unless the engine is `Ready`.
    pub fn shutdown(&self) -> KeelResult<ShutdownReport> {
        let running = {
            let mut state = self.inner.gate.write();
            if !state
                .lifecycle
                .can_transition_to(LifecycleState::ShuttingDown)
            {
                return Err(unavailable(state.lifecycle));
            }
            state.lifecycle = LifecycleState::ShuttingDown;
            state.running.take()
        };
        info!(target: "keel::lifecycle", "Shutting down engine");

        let report = running.map(tear_down).unwrap_or_default();
        self.inner.gate.write().lifecycle = LifecycleState::Closed;
        info!(
            target: "keel::lifecycle",
            discarded = report.discarded,
            dirty = report.dirty,
            "Engine closed"
        );
        Ok(report)
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Open a client connection
    pub fn connect(&self) -> KeelResult<Connection> {
        self.inner.gate.read().ready()?;
        let id = ConnectionId::new(self.inner.next_connection.fetch_add(1, Ordering::Relaxed));
        let connection = Connection::new(self.clone(), id);
        self.inner.connections.insert(id, connection.proc_info());
        Ok(connection)
    }

    /// Open a connection acting as a replication applier
    pub fn connect_replica(&self) -> KeelResult<Connection> {
        let mut connection = self.connect()?;
        connection.set_role(keel_concurrency::ConnectionRole::Replica);
        Ok(connection)
    }

    /// Status line of connection `id`
    pub fn proc_info(&self, id: ConnectionId) -> Option<String> {
        self.inner.connections.get(&id).and_then(|info| info.get())
    }

    /// Interrupt any blocking wait of connection `id`
    pub fn kill_connection(&self, id: ConnectionId) -> KeelResult<()> {
        let state = self.inner.gate.read();
        state.ready()?.manager.kill(id);
        Ok(())
    }

    /// Last lock timeout report stored for connection `id`
    pub fn last_lock_timeout(&self, id: ConnectionId) -> Option<String> {
        let state = self.inner.gate.read();
        state.running.as_ref().and_then(|r| r.reporter.last(id))
    }

    // ========================================================================
    // XA
    // ========================================================================

    /// XA ids of every prepared transaction
    pub fn recover(&self) -> KeelResult<Vec<Xid>> {
        let state = self.inner.gate.read();
        state.ready()?.manager.recover()
    }

    /// Commit a prepared transaction by XA id
    pub fn commit_by_xid(&self, xid: &Xid) -> KeelResult<()> {
        let state = self.inner.gate.read();
        state.ready()?.manager.commit_by_xid(xid)
    }

    /// Roll back a prepared transaction by XA id
    pub fn rollback_by_xid(&self, xid: &Xid) -> KeelResult<()> {
        let state = self.inner.gate.read();
        state.ready()?.manager.rollback_by_xid(xid)
    }

    // ========================================================================
    // Logs and checkpoints
    // ========================================================================

    fn ready_env(&self) -> KeelResult<Arc<dyn Environment>> {
        let state = self.inner.gate.read();
        Ok(Arc::clone(&state.ready()?.env))
    }

    /// Run a checkpoint now. Blocks while any connection holds the
    /// checkpoint lock.
    pub fn checkpoint(&self) -> KeelResult<()> {
        // Gate is released before waiting on the barrier.
        let env = self.ready_env()?;
        env.checkpoint()?;
        Ok(())
    }

    /// Flush logs.
    ///
    /// Outside binlog group commit this checkpoints when
    /// `checkpoint_on_flush_logs` is set and syncs the log otherwise. Inside
    /// group commit the log is synced only under high durability.
    pub fn flush_logs(&self, binlog_group_commit: bool) -> KeelResult<()> {
        let env = self.ready_env()?;
        let config = &self.inner.config;
        if !binlog_group_commit && config.checkpoint_on_flush_logs {
            env.checkpoint()?;
        } else if !binlog_group_commit || config.is_high_durability() {
            env.log_flush()?;
        }
        Ok(())
    }

    /// Engine statistics
    pub fn stats(&self) -> EngineStats {
        let state = self.inner.gate.read();
        let running = state.running.as_ref();
        let checkpointer = running.and_then(|r| r.checkpointer.as_ref());
        EngineStats {
            state: state.lifecycle,
            connections: self.inner.connections.len(),
            txn: running.map(|r| r.manager.stats()).unwrap_or_default(),
            checkpoints: checkpointer.map(|c| c.completed()).unwrap_or(0),
            checkpoint_failures: checkpointer.map(|c| c.failed()).unwrap_or(0),
            log_syncs: running
                .and_then(|r| r.flusher.as_ref())
                .map(|f| f.synced())
                .unwrap_or(0),
        }
    }
}
