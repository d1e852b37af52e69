//! Block Disk Module
//!
//! Disk tier that stores each element in a chain of fixed-size blocks.
//!
//! ## Responsibilities
//! - Split serialized elements across N blocks, reuse freed blocks
//! - Track key → block chain in a persisted, optionally bounded index
//! - Rebuild the free-block pool from the index on restart
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Block 0 (block_size bytes)               │
//! │   PayloadLen: u32 (4) | Payload ...      │
//! ├──────────────────────────────────────────┤
//! │ Block 1 (block_size bytes)               │
//! │   ... payload continues ...              │
//! ├──────────────────────────────────────────┤
//! │ Block N (block_size bytes)               │
//! │   ... payload end | zero padding         │
//! └──────────────────────────────────────────┘
//! ```
//! Only the first block of a chain carries the length header. Chains need
//! not be contiguous; their order is the order of the block number list.
//! Block offsets are always computed as `u64`.

mod cache;
mod key_index;
mod store;

use serde::{Deserialize, Serialize};

pub use cache::BlockDiskCache;
pub use key_index::BlockKeyIndex;
pub use store::{BlockStore, BlockStoreStats};

use crate::index::Location;

/// Header at the start of a chain's first block: payload length (u32)
pub const BLOCK_HEADER_SIZE: usize = 4;

/// Number of blocks needed to hold `payload_len` bytes plus the header
///
/// A zero-length payload still takes one block.
pub fn blocks_needed(payload_len: usize, block_size: usize) -> usize {
    (payload_len + BLOCK_HEADER_SIZE).div_ceil(block_size)
}

/// Where one element's bytes live in a block file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockChain {
    /// Block numbers in payload order
    pub blocks: Vec<u32>,

    /// Serialized payload length (without header)
    pub len: u32,
}

impl Location for BlockChain {
    fn footprint(&self) -> u64 {
        self.len as u64 + BLOCK_HEADER_SIZE as u64
    }
}
