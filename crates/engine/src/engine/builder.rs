//! Engine builder
//!
//! ```ignore
//! use keel_engine::Engine;
//!
//! // keel.toml in the data directory, log-backed environment
//! let engine = Engine::open("/data/keel")?;
//!
//! // Explicit configuration, custom environment, crash injection
//! let engine = Engine::builder()
//!     .path("/data/keel")
//!     .config(EngineConfig { checkpointing_period_secs: 0, ..Default::default() })
//!     .env_opener(|dir, cfg| Ok(Arc::new(MyEnv::open(dir, cfg)?) as Arc<dyn Environment>))
//!     .fault_injector(crash_at(FaultPoint::CommitAfter))
//!     .open()?;
//! ```

use super::{Engine, EnvOpener};
use crate::config::{EngineConfig, CONFIG_FILE_NAME};
use keel_concurrency::FaultInjector;
use keel_core::{EnvResult, Environment, KeelError, KeelResult};
use keel_durability::LogEnvironment;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Opener for the log-backed reference environment
pub fn log_env_opener() -> EnvOpener {
    Arc::new(|dir: &Path, config: &EngineConfig| -> EnvResult<Arc<dyn Environment>> {
        let env = LogEnvironment::open(dir, config.env_options())?;
        Ok(Arc::new(env) as Arc<dyn Environment>)
    })
}

/// Builder for [`Engine`]
#[derive(Default)]
pub struct EngineBuilder {
    path: Option<PathBuf>,
    config: Option<EngineConfig>,
    opener: Option<EnvOpener>,
    fault: Option<FaultInjector>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("path", &self.path)
            .field("config", &self.config)
            .field("custom_env", &self.opener.is_some())
            .field("fault_injector", &self.fault.is_some())
            .finish()
    }
}

impl EngineBuilder {
    /// Create a builder with nothing set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the data directory. Required.
    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Use this configuration instead of reading `keel.toml`
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Open a custom environment instead of the log-backed one
    pub fn env_opener<F>(mut self, opener: F) -> Self
    where
        F: Fn(&Path, &EngineConfig) -> EnvResult<Arc<dyn Environment>> + Send + Sync + 'static,
    {
        self.opener = Some(Arc::new(opener));
        self
    }

    /// Consult `injector` at the commit and prepare fault points
    pub fn fault_injector(mut self, injector: FaultInjector) -> Self {
        self.fault = Some(injector);
        self
    }

    /// Build the engine without starting it.
    ///
    /// Without an explicit configuration, `keel.toml` is read from the data
    /// directory, created with defaults if missing.
    ///
    /// # Errors
    ///
    /// Returns `KeelError::Config` if no path was set or the config file
    /// cannot be read.
    pub fn build(self) -> KeelResult<Engine> {
        let path = self
            .path
            .ok_or_else(|| KeelError::config("EngineBuilder requires a path"))?;
        let config = match self.config {
            Some(config) => config,
            None => {
                std::fs::create_dir_all(&path).map_err(|e| {
                    KeelError::config(format!(
                        "Failed to create data directory '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                let file = path.join(CONFIG_FILE_NAME);
                EngineConfig::write_default_if_missing(&file)?;
                EngineConfig::from_file(&file)?
            }
        };
        let opener = self.opener.unwrap_or_else(log_env_opener);
        Ok(Engine::new(path, config, opener, self.fault))
    }

    /// Build and start the engine
    pub fn open(self) -> KeelResult<Engine> {
        let engine = self.build()?;
        engine.startup()?;
        Ok(engine)
    }
}
