//! Error types for Keel
//!
//! Two layers, both built on `thiserror`:
//!
//! - [`EnvError`]: failures reported by an [`Environment`](crate::Environment)
//!   implementation.
//! - [`KeelError`]: failures reported by the coordinator to the frontend.
//!
//! Coordinator errors fall into the classes returned by [`KeelError::kind`].
//! Usage errors have no effect on connection state, resolution errors carry an
//! XA resource-manager code, environment errors abort only the operation (or
//! startup) that hit them. Failures of commit/abort on an already-begun handle
//! are not represented here: they abort the process.

use crate::types::TxnHandle;
use crate::xid::Xid;
use std::io;
use thiserror::Error;

/// XA resource-manager error code (`XAER_RMERR`)
pub const XAER_RMERR: i32 = -3;

/// Result type alias for environment operations
pub type EnvResult<T> = std::result::Result<T, EnvError>;

/// Result type alias for coordinator operations
pub type KeelResult<T> = std::result::Result<T, KeelError>;

/// Errors raised by the storage environment
#[derive(Debug, Error)]
pub enum EnvError {
    /// I/O error on the environment's files
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Durable log could not be decoded
    #[error("Log corruption: {0}")]
    Corruption(String),

    /// Record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Handle does not name a live transaction
    #[error("Unknown transaction {0}")]
    UnknownTxn(TxnHandle),

    /// Transaction is in the wrong state for the requested primitive
    #[error("Transaction {txn} in invalid state: {reason}")]
    InvalidState {
        /// Offending transaction
        txn: TxnHandle,
        /// What was wrong
        reason: String,
    },

    /// Parent was resolved while children were still open
    #[error("Transaction {txn} still has {count} open child transaction(s)")]
    OpenChildren {
        /// Parent transaction
        txn: TxnHandle,
        /// Number of open children
        count: usize,
    },

    /// No prepared transaction carries this XA id
    #[error("No prepared transaction for XA id {0}")]
    XidNotFound(Xid),

    /// A prepared transaction already carries this XA id
    #[error("XA id {0} is already prepared")]
    DuplicateXid(Xid),

    /// Data directory is locked by another environment
    #[error("Environment directory is locked: {0}")]
    Locked(String),

    /// Write attempted on a read-only environment
    #[error("Environment is read-only")]
    ReadOnly,

    /// Environment has been closed
    #[error("Environment is closed")]
    Closed,

    /// A blocking wait was interrupted by a kill request
    #[error("Wait interrupted by kill")]
    Killed,

    /// A lock wait exceeded the configured timeout
    #[error("Lock wait timeout exceeded")]
    LockTimeout,

    /// Clean close requested while prepared transactions were still live
    #[error("{0} prepared transaction(s) still live")]
    PreparedLive(usize),

    /// Caller passed an argument the environment cannot honour
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl EnvError {
    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        EnvError::Corruption(msg.into())
    }

    /// Create an invalid-state error
    pub fn invalid_state(txn: TxnHandle, reason: impl Into<String>) -> Self {
        EnvError::InvalidState {
            txn,
            reason: reason.into(),
        }
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        EnvError::InvalidArgument(msg.into())
    }
}

/// Classification of coordinator errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller misuse; operation had no effect
    Usage,
    /// XA id could not be resolved; retry or operator intervention
    Resolution,
    /// Environment failure (startup, prepare, I/O)
    Environment,
    /// Engine is not in the `Ready` state
    Unavailable,
    /// A blocking wait was killed or timed out; the handle is still alive
    Interrupted,
    /// A fault point simulated a crash
    Crash,
}

/// Errors returned by the coordinator
#[derive(Debug, Error)]
pub enum KeelError {
    /// Savepoint name is unknown on this connection
    #[error("Savepoint '{name}' does not exist")]
    SavepointNotFound {
        /// Savepoint name
        name: String,
    },

    /// Savepoint name is already in use on this connection
    #[error("Savepoint '{name}' already exists")]
    DuplicateSavepoint {
        /// Savepoint name
        name: String,
    },

    /// Release of a savepoint whose transaction still has an open child
    #[error("Savepoint '{name}' still has an open nested transaction")]
    SavepointHasOpenChild {
        /// Savepoint name
        name: String,
    },

    /// Savepoint entry belongs to a different connection
    #[error("Savepoint '{name}' is not owned by this connection")]
    ForeignSavepoint {
        /// Savepoint name
        name: String,
    },

    /// Operation needs an outer or statement transaction
    #[error("No active transaction")]
    NoActiveTransaction,

    /// Operation needs a statement transaction
    #[error("No active statement transaction")]
    NoActiveStatement,

    /// Prepare requested without an XA id on the connection
    #[error("No XA transaction id set on this connection")]
    MissingXid,

    /// XA id is malformed
    #[error("Invalid XA id: {reason}")]
    InvalidXid {
        /// What was wrong
        reason: String,
    },

    /// XA id is already prepared in the environment
    #[error("XA id {xid} is already prepared")]
    DuplicateXid {
        /// Offending id
        xid: Xid,
    },

    /// XA id could not be committed or rolled back
    #[error("XA resolution failed for {xid} (code {code}): {reason}")]
    XaResolution {
        /// XA id being resolved
        xid: Xid,
        /// XA error code
        code: i32,
        /// Underlying failure
        reason: String,
    },

    /// Engine is not ready for transactional work
    #[error("Engine not available (state: {state})")]
    EngineUnavailable {
        /// Lifecycle state observed
        state: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A blocking wait was interrupted by a kill; the handle is still alive
    #[error("Connection was killed while waiting")]
    Killed,

    /// A lock wait timed out; the handle is still alive
    #[error("Lock wait timeout exceeded")]
    LockTimeout,

    /// A fault point simulated a process crash
    #[error("Simulated crash at {point}")]
    InjectedCrash {
        /// Fault point name
        point: &'static str,
    },

    /// Environment failure
    #[error("Environment error: {0}")]
    Environment(#[from] EnvError),
}

impl KeelError {
    /// Create an invalid-XA-id error
    pub fn invalid_xid(reason: impl Into<String>) -> Self {
        KeelError::InvalidXid {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        KeelError::Config(msg.into())
    }

    /// Create an XA resolution error with `XAER_RMERR`
    pub fn xa_resolution(xid: Xid, reason: impl Into<String>) -> Self {
        KeelError::XaResolution {
            xid,
            code: XAER_RMERR,
            reason: reason.into(),
        }
    }

    /// Error class
    pub fn kind(&self) -> ErrorKind {
        match self {
            KeelError::SavepointNotFound { .. }
            | KeelError::DuplicateSavepoint { .. }
            | KeelError::SavepointHasOpenChild { .. }
            | KeelError::ForeignSavepoint { .. }
            | KeelError::NoActiveTransaction
            | KeelError::NoActiveStatement
            | KeelError::MissingXid
            | KeelError::InvalidXid { .. }
            | KeelError::DuplicateXid { .. } => ErrorKind::Usage,
            KeelError::XaResolution { .. } => ErrorKind::Resolution,
            KeelError::EngineUnavailable { .. } => ErrorKind::Unavailable,
            KeelError::Killed | KeelError::LockTimeout => ErrorKind::Interrupted,
            KeelError::InjectedCrash { .. } => ErrorKind::Crash,
            KeelError::Config(_) | KeelError::Environment(_) => ErrorKind::Environment,
        }
    }

    /// True for caller misuse that left state untouched
    pub fn is_usage(&self) -> bool {
        self.kind() == ErrorKind::Usage
    }

    /// XA error code, for resolution errors
    pub fn xa_code(&self) -> Option<i32> {
        match self {
            KeelError::XaResolution { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Stable error code string
    pub fn error_code(&self) -> &'static str {
        match self {
            KeelError::SavepointNotFound { .. } => "SavepointNotFound",
            KeelError::DuplicateSavepoint { .. } => "DuplicateSavepoint",
            KeelError::SavepointHasOpenChild { .. } => "SavepointHasOpenChild",
            KeelError::ForeignSavepoint { .. } => "ForeignSavepoint",
            KeelError::NoActiveTransaction => "NoActiveTransaction",
            KeelError::NoActiveStatement => "NoActiveStatement",
            KeelError::MissingXid => "MissingXid",
            KeelError::InvalidXid { .. } => "InvalidXid",
            KeelError::DuplicateXid { .. } => "DuplicateXid",
            KeelError::XaResolution { .. } => "XaResolution",
            KeelError::EngineUnavailable { .. } => "EngineUnavailable",
            KeelError::Config(_) => "Config",
            KeelError::Killed => "Killed",
            KeelError::LockTimeout => "LockTimeout",
            KeelError::InjectedCrash { .. } => "InjectedCrash",
            KeelError::Environment(_) => "Environment",
        }
    }
}
