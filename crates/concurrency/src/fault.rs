//! Crash injection points
//!
//! A [`FaultInjector`] is consulted at fixed points of commit and prepare.
//! Returning [`FaultAction::Crash`] simulates the process dying at that
//! point: the connection is poisoned, nothing is cleaned up, and the
//! operation reports `KeelError::InjectedCrash`.

use std::fmt;
use std::sync::Arc;

/// Where in the commit/prepare path the injector is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// Before the environment commit of a handle
    CommitBefore,
    /// After the environment commit, before pointers are cleared
    CommitAfter,
    /// Before the environment prepare
    PrepareBefore,
    /// After the environment prepare, before pointers are detached
    PrepareAfter,
}

impl FaultPoint {
    /// Stable name of the point
    pub fn name(&self) -> &'static str {
        match self {
            FaultPoint::CommitBefore => "commit-before",
            FaultPoint::CommitAfter => "commit-after",
            FaultPoint::PrepareBefore => "prepare-before",
            FaultPoint::PrepareAfter => "prepare-after",
        }
    }
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the injector wants to happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultAction {
    /// Carry on normally
    #[default]
    Continue,
    /// Simulate a process crash
    Crash,
}

/// Callback consulted at every [`FaultPoint`]
pub type FaultInjector = Arc<dyn Fn(FaultPoint) -> FaultAction + Send + Sync>;

/// Injector that crashes at exactly one point
pub fn crash_at(point: FaultPoint) -> FaultInjector {
    Arc::new(move |p| {
        if p == point {
            FaultAction::Crash
        } else {
            FaultAction::Continue
        }
    })
}
