//! Record Disk Module
//!
//! Disk tier that stores each element as one variable-length record.
//!
//! ## Responsibilities
//! - Allocate byte ranges best-fit from a bounded recycle bin, else append
//! - Coalesce adjacent free ranges
//! - Persist key → (offset, length) and reload it on restart
//! - Optimize: compact live records to the front of the file
//!
//! ## File Format
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ Record                                     │
//! │ ┌─────────┬─────────┬────────────────────┐ │
//! │ │ Len (4) │ CRC (4) │ Serialized element │ │
//! │ └─────────┴─────────┴────────────────────┘ │
//! ├────────────────────────────────────────────┤
//! │ Free range (reusable, not referenced)      │
//! ├────────────────────────────────────────────┤
//! │ Record ...                                 │
//! └────────────────────────────────────────────┘
//! ```
//! Offsets are absolute byte positions. Live records never overlap; live
//! ranges, recycle bin ranges and leaked ranges partition the file.

mod cache;
mod key_index;
mod recycle;
mod store;

use serde::{Deserialize, Serialize};

pub use cache::RecordDiskCache;
pub use key_index::RecordKeyIndex;
pub use recycle::{FreeRange, RecycleBin};
pub use store::{Compaction, RecordStore, RecordStoreStats};

use crate::index::Location;

/// Per-record header: Len (4) + CRC (4) = 8 bytes
pub const RECORD_HEADER_SIZE: u64 = 8;

/// Where one element's record lives in the data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDescriptor {
    /// Absolute offset of the record header
    pub pos: u64,

    /// Serialized payload length (without header)
    pub len: u32,
}

impl RecordDescriptor {
    /// Bytes the record occupies including its header
    pub fn span(&self) -> u64 {
        RECORD_HEADER_SIZE + self.len as u64
    }

    /// Offset one past the last byte of the record
    pub fn end(&self) -> u64 {
        self.pos + self.span()
    }
}

impl Location for RecordDescriptor {
    fn footprint(&self) -> u64 {
        self.span()
    }
}
