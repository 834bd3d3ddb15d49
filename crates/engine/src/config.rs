//! Engine configuration via `keel.toml`
//!
//! On first open a default `keel.toml` with comments is created in the data
//! directory. To change settings, edit the file and restart.

use keel_concurrency::{PrepareDetach, SyncPolicy};
use keel_core::{KeelError, KeelResult};
use keel_durability::LogEnvOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the data directory.
pub const CONFIG_FILE_NAME: &str = "keel.toml";

/// `lock_timeout_debug` bit: keep the last timeout report per connection
pub const LOCK_TIMEOUT_DEBUG_STORE: u32 = 1;

/// `lock_timeout_debug` bit: write timeout reports to the error log
pub const LOCK_TIMEOUT_DEBUG_LOG: u32 = 2;

/// Engine configuration loaded from `keel.toml`.
///
/// # Example
///
/// ```toml
/// commit_sync = true
/// fsync_log_period_ms = 0
/// checkpointing_period_secs = 60
/// prepare_detach = "replica"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sync the log on durable commits.
    pub commit_sync: bool,
    /// Background log fsync period in milliseconds; 0 syncs at commit.
    pub fsync_log_period_ms: u64,
    /// Seconds between background checkpoints; 0 disables the checkpointer.
    pub checkpointing_period_secs: u64,
    /// Run a checkpoint on `flush_logs` outside binlog group commit.
    pub checkpoint_on_flush_logs: bool,
    /// Lock wait timeout in milliseconds.
    pub lock_timeout_ms: u64,
    /// Lock timeout reporting bits (1 = store per connection, 2 = log).
    pub lock_timeout_debug: u32,
    /// When a successful full prepare detaches the connection from its handle.
    pub prepare_detach: PrepareDetach,
    /// Open the environment read-only.
    pub read_only: bool,
    /// Open past a damaged log. Requires `read_only`.
    pub force_recovery: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            commit_sync: true,
            fsync_log_period_ms: 0,
            checkpointing_period_secs: 60,
            checkpoint_on_flush_logs: false,
            lock_timeout_ms: 4000,
            lock_timeout_debug: LOCK_TIMEOUT_DEBUG_STORE,
            prepare_detach: PrepareDetach::Replica,
            read_only: false,
            force_recovery: false,
        }
    }
}

impl EngineConfig {
    /// Check option combinations.
    ///
    /// # Errors
    ///
    /// Returns `KeelError::Config` if `force_recovery` is set without
    /// `read_only`.
    pub fn validate(&self) -> KeelResult<()> {
        if self.force_recovery && !self.read_only {
            return Err(KeelError::config(
                "force_recovery requires read_only = true",
            ));
        }
        Ok(())
    }

    /// Background fsync period
    pub fn fsync_log_period(&self) -> Duration {
        Duration::from_millis(self.fsync_log_period_ms)
    }

    /// Checkpointer period, or `None` when disabled
    pub fn checkpointing_period(&self) -> Option<Duration> {
        (self.checkpointing_period_secs > 0)
            .then(|| Duration::from_secs(self.checkpointing_period_secs))
    }

    /// Lock wait timeout
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Sync policy handed to the transaction manager
    pub fn sync_policy(&self) -> SyncPolicy {
        SyncPolicy {
            fsync_log_period: self.fsync_log_period(),
            commit_sync: self.commit_sync,
        }
    }

    /// Options for the log-backed environment
    pub fn env_options(&self) -> LogEnvOptions {
        LogEnvOptions {
            read_only: self.read_only,
            force_recovery: self.force_recovery,
        }
    }

    /// True when every commit reaches disk before returning
    pub fn is_high_durability(&self) -> bool {
        self.fsync_log_period_ms == 0 && self.commit_sync
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Keel engine configuration

# Sync the log when a transaction commits durably (default: true)
commit_sync = true

# Background log fsync period in milliseconds (default: 0).
# When non-zero, commits and prepares never sync; a crash may lose up to
# one period of committed work.
fsync_log_period_ms = 0

# Seconds between background checkpoints (default: 60, 0 disables)
checkpointing_period_secs = 60

# Run a checkpoint on FLUSH LOGS outside binlog group commit (default: false)
checkpoint_on_flush_logs = false

# Lock wait timeout in milliseconds (default: 4000)
lock_timeout_ms = 4000

# Lock timeout reporting (default: 1)
#   1 = keep the last report per connection
#   2 = write reports to the error log
lock_timeout_debug = 1

# Detach the connection from its handle after a full prepare:
# "never", "replica" (default) or "always"
prepare_detach = "replica"

# Open the environment read-only (default: false)
read_only = false

# Open past a damaged log, keeping its valid prefix (default: false).
# Requires read_only = true.
force_recovery = false
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> KeelResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KeelError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: EngineConfig = toml::from_str(&content).map_err(|e| {
            KeelError::config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> KeelResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                KeelError::config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> KeelResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| KeelError::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            KeelError::config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
