//! Transaction coordination for Keel
//!
//! This crate owns everything a connection needs to drive engine
//! transactions:
//! - [`ConnectionContext`]: outer and statement handles, savepoints, XA id
//! - [`TransactionManager`]: begin / commit / rollback / prepare with
//!   nested resolution, savepoints, checkpoint lock, connection close
//! - [`HandleArena`]: parent/child bookkeeping of open handles
//! - Crash injection points for recovery testing
//!
//! The storage itself sits behind [`keel_core::Environment`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod context;
pub mod fault;
pub mod manager;
pub mod progress;
pub mod savepoint;

pub use arena::{HandleArena, SlotId, TxnNode};
pub use context::{ConnectionContext, ConnectionRole, ResourceHandler, Scope};
pub use fault::{crash_at, FaultAction, FaultInjector, FaultPoint};
pub use manager::{CloseReport, PrepareDetach, SyncPolicy, TransactionManager, TxnStats};
pub use progress::{
    format_progress, ProcInfo, StatementProgress, PROC_INFO_ACQUIRE_CHECKPOINT_LOCK,
    PROC_INFO_RELEASE_CHECKPOINT_LOCK, STALLED_PREFIX,
};
pub use savepoint::{SavepointEntry, SavepointStack};
