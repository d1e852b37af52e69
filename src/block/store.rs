//! Block Store
//!
//! Fixed-size block file I/O: allocate a chain, write a payload across it,
//! read it back, and return blocks to a FIFO free pool.

use std::collections::{HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Result, TierError};

use super::{blocks_needed, BlockChain, BLOCK_HEADER_SIZE};

/// Snapshot of block store counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStoreStats {
    pub block_size: usize,
    pub block_count: u64,
    pub empty_blocks: usize,
    pub file_len: u64,
}

/// Mutable file state, guarded by one mutex
struct BlockFile {
    file: File,
    /// Number of blocks the file extends to
    block_count: u64,
    /// Freed blocks, reused oldest first
    empty_blocks: VecDeque<u32>,
    /// Membership mirror of `empty_blocks` (rejects double frees)
    empty_set: HashSet<u32>,
}

impl BlockFile {
    fn allocate(&mut self, count: usize) -> Result<Vec<u32>> {
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(block) = self.empty_blocks.pop_front() {
                self.empty_set.remove(&block);
                blocks.push(block);
                continue;
            }

            if self.block_count > u32::MAX as u64 {
                self.release(&blocks);
                return Err(TierError::Storage("Block file is full".to_string()));
            }
            blocks.push(self.block_count as u32);
            self.block_count += 1;
        }
        Ok(blocks)
    }

    fn release(&mut self, blocks: &[u32]) {
        for &block in blocks {
            if (block as u64) < self.block_count && self.empty_set.insert(block) {
                self.empty_blocks.push_back(block);
            }
        }
    }
}

/// Fixed-size block file
///
/// ## Concurrency:
/// - Allocation, free-pool mutation and file I/O share a single mutex, so a
///   chain is always freed or allocated as a whole
pub struct BlockStore {
    path: PathBuf,
    block_size: usize,
    state: Mutex<BlockFile>,
}

impl BlockStore {
    /// Open or create a block file
    ///
    /// A trailing partial block (torn write) counts as a whole block.
    pub fn open(path: &Path, block_size: usize) -> Result<Self> {
        if block_size <= BLOCK_HEADER_SIZE {
            return Err(TierError::Config(format!(
                "Block size {} must exceed the {} byte header",
                block_size, BLOCK_HEADER_SIZE
            )));
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let block_count = file_len.div_ceil(block_size as u64);

        tracing::debug!(
            "Opened block file {} ({} blocks of {} bytes)",
            path.display(),
            block_count,
            block_size
        );

        Ok(Self {
            path: path.to_path_buf(),
            block_size,
            state: Mutex::new(BlockFile {
                file,
                block_count,
                empty_blocks: VecDeque::new(),
                empty_set: HashSet::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks a payload of `payload_len` bytes occupies in this store
    pub fn blocks_needed(&self, payload_len: usize) -> usize {
        blocks_needed(payload_len, self.block_size)
    }

    /// Byte offset of `block` in the file
    pub fn block_offset(&self, block: u32) -> u64 {
        block as u64 * self.block_size as u64
    }

    /// Allocate a chain and write `payload` across it
    pub fn write(&self, payload: &[u8]) -> Result<BlockChain> {
        if payload.len() > u32::MAX as usize - BLOCK_HEADER_SIZE {
            return Err(TierError::ElementTooLarge {
                size: payload.len(),
                max: u32::MAX as usize - BLOCK_HEADER_SIZE,
            });
        }

        let needed = self.blocks_needed(payload.len());

        // Header + payload, zero-padded to whole blocks
        let mut buffer = vec![0u8; needed * self.block_size];
        buffer[..BLOCK_HEADER_SIZE].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        buffer[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + payload.len()].copy_from_slice(payload);

        let mut state = self.state.lock();
        let blocks = state.allocate(needed)?;

        if let Err(e) = self.write_chain(&mut state.file, &blocks, &buffer) {
            state.release(&blocks);
            return Err(e);
        }

        Ok(BlockChain {
            blocks,
            len: payload.len() as u32,
        })
    }

    /// Read the payload stored in `blocks`
    ///
    /// Fails with `Corruption` when a block lies past the end of the file or
    /// the header length does not fit the chain.
    pub fn read(&self, blocks: &[u32]) -> Result<Vec<u8>> {
        let first = *blocks
            .first()
            .ok_or_else(|| TierError::Corruption("Empty block chain".to_string()))?;

        let mut state = self.state.lock();

        if let Some(&past_end) = blocks.iter().find(|&&b| b as u64 >= state.block_count) {
            return Err(TierError::Corruption(format!(
                "Block {} is past the end of {} ({} blocks)",
                past_end,
                self.path.display(),
                state.block_count
            )));
        }

        let mut buffer = vec![0u8; blocks.len() * self.block_size];
        state.file.seek(SeekFrom::Start(self.block_offset(first)))?;
        state.file.read_exact(&mut buffer[..self.block_size])?;

        let len = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if self.blocks_needed(len) != blocks.len() {
            return Err(TierError::Corruption(format!(
                "Block {} declares {} bytes, which does not fit a chain of {} blocks",
                first,
                len,
                blocks.len()
            )));
        }

        for (i, &block) in blocks.iter().enumerate().skip(1) {
            let start = i * self.block_size;
            state.file.seek(SeekFrom::Start(self.block_offset(block)))?;
            state
                .file
                .read_exact(&mut buffer[start..start + self.block_size])?;
        }

        buffer.truncate(BLOCK_HEADER_SIZE + len);
        buffer.drain(..BLOCK_HEADER_SIZE);
        Ok(buffer)
    }

    /// Return a chain's blocks to the free pool
    pub fn free(&self, blocks: &[u32]) {
        self.state.lock().release(blocks);
    }

    /// Check that `chain` fits inside the file and matches its recorded length
    pub fn chain_is_consistent(&self, chain: &BlockChain) -> bool {
        let block_count = self.state.lock().block_count;
        !chain.blocks.is_empty()
            && chain.blocks.iter().all(|&b| (b as u64) < block_count)
            && self.blocks_needed(chain.len as usize) == chain.blocks.len()
    }

    /// Rebuild the free pool as every block not referenced by `used`
    pub fn rebuild_free_list<'a, I>(&self, used: I)
    where
        I: IntoIterator<Item = &'a BlockChain>,
    {
        let used: HashSet<u32> = used
            .into_iter()
            .flat_map(|chain| chain.blocks.iter().copied())
            .collect();

        let mut state = self.state.lock();
        let free: Vec<u32> = (0..state.block_count)
            .map(|b| b as u32)
            .filter(|b| !used.contains(b))
            .collect();

        state.empty_blocks.clear();
        state.empty_set.clear();
        state.release(&free);

        tracing::debug!(
            "Block file {}: {} of {} blocks free after reload",
            self.path.display(),
            state.empty_blocks.len(),
            state.block_count
        );
    }

    /// Truncate the file and forget every block
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.file.set_len(0)?;
        state.file.sync_all()?;
        state.block_count = 0;
        state.empty_blocks.clear();
        state.empty_set.clear();
        tracing::info!("Reset block file {}", self.path.display());
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.state.lock().file.sync_all()?;
        Ok(())
    }

    pub fn block_count(&self) -> u64 {
        self.state.lock().block_count
    }

    pub fn empty_block_count(&self) -> usize {
        self.state.lock().empty_blocks.len()
    }

    pub fn stats(&self) -> BlockStoreStats {
        let state = self.state.lock();
        BlockStoreStats {
            block_size: self.block_size,
            block_count: state.block_count,
            empty_blocks: state.empty_blocks.len(),
            file_len: state.block_count * self.block_size as u64,
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn write_chain(&self, file: &mut File, blocks: &[u32], buffer: &[u8]) -> Result<()> {
        for (chunk, &block) in buffer.chunks(self.block_size).zip(blocks) {
            file.seek(SeekFrom::Start(self.block_offset(block)))?;
            file.write_all(chunk)?;
        }
        Ok(())
    }
}
