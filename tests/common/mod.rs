//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]

use keel::{Engine, EngineConfig, FaultInjector, Xid};
use std::path::Path;
use std::sync::Once;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Route `tracing` output through the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Config with the background checkpointer off and a short lock timeout.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        checkpointing_period_secs: 0,
        lock_timeout_ms: 200,
        ..EngineConfig::default()
    }
}

/// XA id with format 1 and the given global transaction id.
pub fn xid(gtrid: &str) -> Xid {
    Xid::new(1, gtrid.as_bytes(), b"branch").expect("valid xid")
}

// ============================================================================
// TestEngine
// ============================================================================

/// Engine on a temporary data directory that can be restarted in place.
pub struct TestEngine {
    pub engine: Engine,
    pub config: EngineConfig,
    pub dir: TempDir,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = open(dir.path(), &config, None);
        TestEngine {
            engine,
            config,
            dir,
        }
    }

    pub fn with_fault(config: EngineConfig, injector: FaultInjector) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let engine = open(dir.path(), &config, Some(injector));
        TestEngine {
            engine,
            config,
            dir,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Orderly shutdown followed by a fresh engine on the same directory.
    pub fn restart(&mut self) {
        self.engine.shutdown().expect("shutdown");
        self.reopen();
    }

    /// Drop the engine without shutdown and reopen the directory.
    ///
    /// Callers drop their connections first; the engine only releases the
    /// directory once the last connection is gone.
    pub fn reopen(&mut self) {
        let placeholder = Engine::builder()
            .path(self.dir.path())
            .config(self.config.clone())
            .build()
            .expect("build placeholder");
        drop(std::mem::replace(&mut self.engine, placeholder));
        self.engine = open(self.dir.path(), &self.config, None);
    }
}

fn open(path: &Path, config: &EngineConfig, injector: Option<FaultInjector>) -> Engine {
    let mut builder = Engine::builder().path(path).config(config.clone());
    if let Some(injector) = injector {
        builder = builder.fault_injector(injector);
    }
    builder.open().expect("Failed to open test engine")
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
