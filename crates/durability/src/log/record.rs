//! Log record types and frame format.
//!
//! The log is a single file, `keel.log`, holding a sequence of frames:
//!
//! ```text
//! ┌──────────────────┬──────────────────┬──────────────────────────────┐
//! │ Length (u32 LE)  │ CRC32 (u32 LE)   │ Payload (MessagePack record) │
//! └──────────────────┴──────────────────┴──────────────────────────────┘
//! ```
//!
//! The CRC covers the payload only. Length is the payload length.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use keel_core::{EnvError, EnvResult, TxnHandle, Xid};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Size of the frame header (length + checksum)
pub const FRAME_HEADER_SIZE: usize = 8;

/// Upper bound on a single payload; anything larger is treated as damage
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;

/// One durable log record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Top-level transaction committed
    Commit {
        /// Committed transaction
        txn: TxnHandle,
    },
    /// Prepared transaction rolled back
    Abort {
        /// Aborted transaction
        txn: TxnHandle,
    },
    /// Transaction prepared under an XA id
    Prepare {
        /// Prepared transaction
        txn: TxnHandle,
        /// XA id recorded with it
        xid: Xid,
    },
    /// Checkpoint completed; earlier resolved records were dropped
    Checkpoint {
        /// Checkpoint sequence number
        sequence: u64,
        /// First handle value the next open may allocate
        next_txn: u64,
    },
    /// Environment closed
    Shutdown {
        /// Closed with prepared transactions discarded
        dirty: bool,
        /// Number of discarded prepared transactions
        prepared: u32,
    },
}

impl LogRecord {
    /// Transaction named by the record, if any
    pub fn txn(&self) -> Option<TxnHandle> {
        match self {
            LogRecord::Commit { txn } | LogRecord::Abort { txn } | LogRecord::Prepare { txn, .. } => {
                Some(*txn)
            }
            LogRecord::Checkpoint { .. } | LogRecord::Shutdown { .. } => None,
        }
    }

    /// Encode the record as one framed byte sequence.
    pub fn to_frame(&self) -> EnvResult<Vec<u8>> {
        let payload =
            rmp_serde::to_vec(self).map_err(|e| EnvError::Serialization(e.to_string()))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.write_u32::<LittleEndian>(payload.len() as u32)?;
        frame.write_u32::<LittleEndian>(crc32fast::hash(&payload))?;
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode one frame from the front of `bytes`.
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn from_frame(bytes: &[u8]) -> Result<(LogRecord, usize), FrameError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::Incomplete);
        }
        let mut cursor = Cursor::new(bytes);
        let len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| FrameError::Incomplete)? as usize;
        let expected = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| FrameError::Incomplete)?;
        if len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::Oversized(len));
        }
        let end = FRAME_HEADER_SIZE + len;
        if bytes.len() < end {
            return Err(FrameError::Incomplete);
        }
        let payload = &bytes[FRAME_HEADER_SIZE..end];
        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }
        let record: LogRecord =
            rmp_serde::from_slice(payload).map_err(|e| FrameError::Decode(e.to_string()))?;
        if let LogRecord::Prepare { xid, .. } = &record {
            if !xid.is_well_formed() {
                return Err(FrameError::Decode(format!("malformed XA id {}", xid)));
            }
        }
        Ok((record, end))
    }
}

/// Why a frame could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Fewer bytes than the frame claims (torn write at the tail)
    #[error("incomplete frame")]
    Incomplete,

    /// Length field beyond any record we write
    #[error("frame length {0} exceeds maximum")]
    Oversized(usize),

    /// Payload does not match its checksum
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Stored checksum
        expected: u32,
        /// Computed checksum
        actual: u32,
    },

    /// Payload is not a valid record
    #[error("undecodable record: {0}")]
    Decode(String),
}
