//! Engine layer for Keel
//!
//! This crate ties the lower layers together:
//! - Engine: lifecycle state machine, environment ownership, shutdown
//! - Connection: per-connection transactional entry points
//! - Configuration: `keel.toml` in the data directory
//! - Background checkpointer and log flusher
//! - Lock timeout reporting
//!
//! The engine is the only component that knows about:
//! - Which environment is plugged in and how it is opened
//! - The lifecycle gate every transactional call passes through

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod lock_timeout;

pub use background::{Checkpointer, LogFlusher};
pub use config::{EngineConfig, CONFIG_FILE_NAME, LOCK_TIMEOUT_DEBUG_LOG, LOCK_TIMEOUT_DEBUG_STORE};
pub use engine::{
    log_env_opener, Connection, Engine, EngineBuilder, EngineStats, EnvOpener, ShutdownReport,
};
pub use lifecycle::LifecycleState;
pub use lock_timeout::{render_report, LockTimeoutReporter};
