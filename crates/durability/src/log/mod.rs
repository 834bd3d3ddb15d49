//! Durable log: record format, scanning, and appending.

pub mod reader;
pub mod record;
pub mod writer;

pub use reader::{scan_log, LogScan, ReadStopReason};
pub use record::{FrameError, LogRecord, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use writer::{LogCounters, LogWriter};

/// File name of the log inside the environment directory
pub const LOG_FILE_NAME: &str = "keel.log";
