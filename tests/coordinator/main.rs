//! Integration tests for the transaction-lifecycle coordinator.
//!
//! Each module drives a real engine over the log-backed environment in a
//! temporary directory.

#[path = "../common/mod.rs"]
mod common;

mod checkpoint;
mod crash;
mod kill;
mod lifecycle;
mod lock_timeout;
mod savepoints;
mod xa_recovery;
