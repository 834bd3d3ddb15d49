//! Append-only log writer.
//!
//! Every record is written straight to the file. Whether it is also fsynced
//! depends on the caller: durable appends sync immediately, the rest are
//! synced by [`LogWriter::sync_if_overdue`] on a later append once the fsync
//! period elapses, or by [`LogWriter::sync_pending`] from a periodic flusher.

use super::record::LogRecord;
use keel_core::EnvResult;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Cumulative writer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogCounters {
    /// Records appended
    pub appends: u64,
    /// fsync calls issued
    pub syncs: u64,
    /// Log rewrites performed by checkpoints
    pub rewrites: u64,
}

/// Writer for the environment log
pub struct LogWriter {
    file: File,
    path: PathBuf,
    fsync_period: Duration,
    last_sync: Instant,
    has_unsynced_data: bool,
    counters: LogCounters,
}

impl LogWriter {
    /// Open the log for appending, truncating it to `valid_len`.
    ///
    /// Truncation discards a torn or damaged tail found by the scan so new
    /// frames are never written after garbage.
    pub fn open(path: &Path, valid_len: u64) -> EnvResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() != valid_len {
            debug!(target: "keel::log", valid_len, "Truncating log to valid prefix");
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        drop(file);
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(LogWriter {
            file,
            path: path.to_path_buf(),
            fsync_period: Duration::ZERO,
            last_sync: Instant::now(),
            has_unsynced_data: false,
            counters: LogCounters::default(),
        })
    }

    /// Set the background fsync period. Zero disables periodic syncing.
    pub fn set_fsync_period(&mut self, period: Duration) {
        self.fsync_period = period;
    }

    /// Append one record, fsyncing when `sync` is set.
    pub fn append(&mut self, record: &LogRecord, sync: bool) -> EnvResult<()> {
        let frame = record.to_frame()?;
        self.file.write_all(&frame)?;
        self.counters.appends += 1;
        self.has_unsynced_data = true;
        if sync {
            self.sync()?;
        } else {
            self.sync_if_overdue()?;
        }
        Ok(())
    }

    /// fsync everything written so far
    pub fn sync(&mut self) -> EnvResult<()> {
        self.file.sync_data()?;
        self.counters.syncs += 1;
        self.last_sync = Instant::now();
        self.has_unsynced_data = false;
        Ok(())
    }

    /// fsync if unsynced data is older than the fsync period.
    ///
    /// Returns true if a sync was performed.
    pub fn sync_if_overdue(&mut self) -> EnvResult<bool> {
        if !self.has_unsynced_data || self.fsync_period.is_zero() {
            return Ok(false);
        }
        if self.last_sync.elapsed() < self.fsync_period {
            return Ok(false);
        }
        self.sync()?;
        Ok(true)
    }

    /// fsync if anything was appended since the last sync.
    ///
    /// Returns true if a sync was performed.
    pub fn sync_pending(&mut self) -> EnvResult<bool> {
        if !self.has_unsynced_data {
            return Ok(false);
        }
        self.sync()?;
        Ok(true)
    }

    /// Replace the whole log with `records`.
    ///
    /// The new content is written to a temporary file, synced, and renamed
    /// over the log, so a crash leaves either the old or the new log.
    pub fn rewrite(&mut self, records: &[LogRecord]) -> EnvResult<()> {
        let tmp = self.path.with_extension("log.tmp");
        {
            let mut out = File::create(&tmp)?;
            for record in records {
                out.write_all(&record.to_frame()?)?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.counters.rewrites += 1;
        self.last_sync = Instant::now();
        self.has_unsynced_data = false;
        Ok(())
    }

    /// True if appended records have not been synced yet
    pub fn has_unsynced_data(&self) -> bool {
        self.has_unsynced_data
    }

    /// Lifetime counters
    pub fn counters(&self) -> LogCounters {
        self.counters
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
