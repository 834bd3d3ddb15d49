//! Durability layer for Keel
//!
//! This crate provides the log-backed reference [`Environment`]:
//!
//! - Log: `keel.log`, CRC-framed MessagePack records
//! - Replay: re-materializes prepared transactions left in doubt
//! - Checkpoint barrier: postpone/resume counter gating checkpoints
//! - Log cleanup: checkpoints rewrite the log down to unresolved prepares
//!
//! [`Environment`]: keel_core::Environment

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod barrier;
pub mod env;
pub mod log;
pub mod replay;

pub use barrier::{CheckpointBarrier, CheckpointGuard};
pub use env::{LogEnvOptions, LogEnvironment, DEFAULT_LOCK_TIMEOUT, LOCK_FILE_NAME};
pub use log::{
    scan_log, FrameError, LogCounters, LogRecord, LogScan, LogWriter, ReadStopReason,
    LOG_FILE_NAME,
};
pub use replay::{replay, PreviousShutdown, RecoveredState, ReplayStats};
