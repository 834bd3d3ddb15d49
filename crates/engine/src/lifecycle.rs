//! Engine lifecycle state machine
//!
//! ```text
//! Uninitialized ──startup──▶ Initializing ──ok──▶ Ready ──shutdown──▶ ShuttingDown ──▶ Closed
//!       ▲                         │
//!       └──────────failure────────┘
//! ```
//!
//! The state lives behind the engine's gate (`parking_lot::RwLock`).
//! Transactional entry points hold the shared side for their whole duration;
//! startup and shutdown take the exclusive side only to move between states.

use serde::Serialize;
use std::fmt;

/// Lifecycle state of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Built but not started, or startup failed
    #[default]
    Uninitialized,
    /// Startup in progress
    Initializing,
    /// Accepting transactional work
    Ready,
    /// Shutdown in progress
    ShuttingDown,
    /// Shut down; terminal
    Closed,
}

impl LifecycleState {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::Closed => "closed",
        }
    }

    /// True if `self → next` is a legal transition
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Initializing, Ready)
                | (Initializing, Uninitialized)
                | (Ready, ShuttingDown)
                | (ShuttingDown, Closed)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
