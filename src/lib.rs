//! Keel - transaction-lifecycle coordinator for pluggable storage engines
//!
//! Keel sits between a query-execution frontend and a transactional storage
//! core reachable only through the [`Environment`] trait. It owns
//! per-connection transaction state, nested statement and savepoint
//! transactions, XA two-phase commit and the checkpoint lock.
//!
//! # Quick Start
//!
//! ```ignore
//! use keel::{Engine, Scope};
//!
//! let engine = Engine::open("/data/keel")?;
//! let mut conn = engine.connect()?;
//!
//! conn.begin()?;
//! conn.set_savepoint("before_update")?;
//! conn.begin_statement()?;
//! conn.commit(Scope::Statement, false)?;
//! conn.rollback_to_savepoint("before_update")?;
//! conn.commit(Scope::All, true)?;
//!
//! drop(conn);
//! engine.shutdown()?;
//! ```
//!
//! # Layers
//!
//! - `keel-core`: handles, XA ids, errors, the [`Environment`] trait
//! - `keel-durability`: log-backed reference environment
//! - `keel-concurrency`: connection contexts and the transaction manager
//! - `keel-engine`: lifecycle, connections, configuration, background workers

pub use keel_concurrency::{
    crash_at, CloseReport, ConnectionContext, ConnectionRole, FaultAction, FaultInjector,
    FaultPoint, PrepareDetach, ProcInfo, Scope, StatementProgress, SyncPolicy, TransactionManager,
    TxnStats,
};
pub use keel_core::{
    CloseMode, ConnectionId, DurabilityProperty, EnvError, EnvResult, Environment, ErrorKind,
    Isolation, KeelError, KeelResult, LockTimeoutEvent, TxnHandle, TxnProgress, Xid, XAER_RMERR,
};
pub use keel_durability::{LogEnvOptions, LogEnvironment, PreviousShutdown};
pub use keel_engine::{
    Connection, Engine, EngineBuilder, EngineConfig, EngineStats, LifecycleState, ShutdownReport,
    CONFIG_FILE_NAME, LOCK_TIMEOUT_DEBUG_LOG, LOCK_TIMEOUT_DEBUG_STORE,
};
