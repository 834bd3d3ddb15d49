//! Core types and traits for Keel
//!
//! This crate defines the foundational types used throughout the system:
//! - TxnHandle / ConnectionId: opaque identifiers for engine transactions and
//!   frontend connections
//! - Xid: the XA global transaction identifier persisted across crashes
//! - Isolation, TxnProgress, LockTimeoutEvent: values exchanged with the
//!   storage environment
//! - Error: `EnvError` for the environment layer, `KeelError` for the coordinator
//! - Traits: the `Environment` abstraction the coordinator drives

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;
pub mod xid;

pub use error::{EnvError, EnvResult, ErrorKind, KeelError, KeelResult, XAER_RMERR};
pub use traits::{Environment, LockTimeoutCallback, ProgressFn};
pub use types::{
    CloseMode, ConnectionId, DurabilityProperty, Isolation, LockTimeoutEvent, TxnHandle,
    TxnProgress,
};
pub use xid::{Hex, Xid, MAX_BQUAL_SIZE, MAX_GTRID_SIZE, XID_DATA_SIZE};
