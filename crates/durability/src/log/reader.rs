//! Log scanning for recovery.

use super::record::{FrameError, LogRecord};
use keel_core::{EnvError, EnvResult};
use std::fs;
use std::io;
use std::path::Path;
use tracing::warn;

/// Why a scan stopped before the end of the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStopReason {
    /// Every byte decoded
    EndOfLog,
    /// Last frame was only partially written
    TornTail,
    /// A damaged frame was skipped along with everything after it
    Corruption(String),
}

/// Result of scanning a log file
#[derive(Debug, Clone)]
pub struct LogScan {
    /// Records in file order
    pub records: Vec<LogRecord>,
    /// Byte length of the valid prefix
    pub valid_len: u64,
    /// Why the scan stopped
    pub stop: ReadStopReason,
    /// False when the log did not exist
    pub existed: bool,
}

/// Scan every record in the log at `path`.
///
/// A torn final frame is dropped silently. Any other damage is an error
/// unless `force_recovery` is set, in which case the scan keeps the valid
/// prefix and reports the damage in [`LogScan::stop`].
pub fn scan_log(path: &Path, force_recovery: bool) -> EnvResult<LogScan> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(LogScan {
                records: Vec::new(),
                valid_len: 0,
                stop: ReadStopReason::EndOfLog,
                existed: false,
            })
        }
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    let mut offset = 0usize;
    let stop = loop {
        if offset == bytes.len() {
            break ReadStopReason::EndOfLog;
        }
        match LogRecord::from_frame(&bytes[offset..]) {
            Ok((record, used)) => {
                records.push(record);
                offset += used;
            }
            Err(FrameError::Incomplete) => {
                warn!(
                    target: "keel::log",
                    offset,
                    trailing = bytes.len() - offset,
                    "Ignoring torn record at end of log"
                );
                break ReadStopReason::TornTail;
            }
            Err(e) => {
                let msg = format!("{} at offset {} of {}", e, offset, path.display());
                if !force_recovery {
                    return Err(EnvError::corruption(msg));
                }
                warn!(target: "keel::log", error = %msg, "Forced recovery past damaged log");
                break ReadStopReason::Corruption(msg);
            }
        }
    };

    Ok(LogScan {
        records,
        valid_len: offset as u64,
        stop,
        existed: true,
    })
}
