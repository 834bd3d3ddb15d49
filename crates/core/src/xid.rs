//! XA global transaction identifier
//!
//! The identifier is the fixed-format tuple used by X/Open XA:
//!
//! ```text
//! ┌───────────────┬──────────────┬──────────────┬──────────────────────────┐
//! │ format_id i32 │ gtrid_length │ bqual_length │ data: gtrid ++ bqual     │
//! └───────────────┴──────────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! It is the only piece of coordinator state that must survive a crash
//! outside the environment's own log.

use crate::error::{KeelError, KeelResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum size of the data section
pub const XID_DATA_SIZE: usize = 128;
/// Maximum size of the global transaction id
pub const MAX_GTRID_SIZE: usize = 64;
/// Maximum size of the branch qualifier
pub const MAX_BQUAL_SIZE: usize = 64;

/// XA transaction identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    format_id: i32,
    gtrid_length: u32,
    bqual_length: u32,
    data: Vec<u8>,
}

impl Xid {
    /// Build an identifier from its components.
    ///
    /// # Errors
    ///
    /// Returns `KeelError::InvalidXid` if either part exceeds its maximum
    /// size or the global transaction id is empty.
    pub fn new(format_id: i32, gtrid: &[u8], bqual: &[u8]) -> KeelResult<Self> {
        if gtrid.is_empty() {
            return Err(KeelError::invalid_xid("gtrid must not be empty"));
        }
        if gtrid.len() > MAX_GTRID_SIZE {
            return Err(KeelError::invalid_xid(format!(
                "gtrid is {} bytes, maximum is {}",
                gtrid.len(),
                MAX_GTRID_SIZE
            )));
        }
        if bqual.len() > MAX_BQUAL_SIZE {
            return Err(KeelError::invalid_xid(format!(
                "bqual is {} bytes, maximum is {}",
                bqual.len(),
                MAX_BQUAL_SIZE
            )));
        }
        let mut data = Vec::with_capacity(gtrid.len() + bqual.len());
        data.extend_from_slice(gtrid);
        data.extend_from_slice(bqual);
        Ok(Xid {
            format_id,
            gtrid_length: gtrid.len() as u32,
            bqual_length: bqual.len() as u32,
            data,
        })
    }

    /// Format identifier chosen by the transaction manager
    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Global transaction id bytes
    pub fn gtrid(&self) -> &[u8] {
        &self.data[..self.gtrid_length as usize]
    }

    /// Branch qualifier bytes
    pub fn bqual(&self) -> &[u8] {
        let start = self.gtrid_length as usize;
        &self.data[start..start + self.bqual_length as usize]
    }

    /// Raw data section (gtrid followed by bqual)
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Check the length fields against the data section.
    ///
    /// Identifiers decoded from disk go through this before use.
    pub fn is_well_formed(&self) -> bool {
        let g = self.gtrid_length as usize;
        let b = self.bqual_length as usize;
        g > 0
            && g <= MAX_GTRID_SIZE
            && b <= MAX_BQUAL_SIZE
            && g + b == self.data.len()
            && self.data.len() <= XID_DATA_SIZE
    }
}

/// Lowercase hex rendering of a byte string
///
/// ```
/// use keel_core::xid::Hex;
/// assert_eq!(Hex(b"k1").to_string(), "6b31");
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Hex<'a>(pub &'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "X'{}',X'{}',{}",
            Hex(self.gtrid()),
            Hex(self.bqual()),
            self.format_id
        )
    }
}
