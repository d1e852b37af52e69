//! Record Store
//!
//! Variable-length record file I/O with best-fit reuse of freed ranges.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::element::CacheKey;
use crate::error::{Result, TierError};

use super::{FreeRange, RecordDescriptor, RecycleBin, RECORD_HEADER_SIZE};

/// Snapshot of record store counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordStoreStats {
    pub file_len: u64,
    pub recycle_bin_len: usize,
    pub recycle_bin_bytes: u64,
    pub leaked_bytes: u64,
    pub frees_since_optimize: u64,
    pub reused_allocations: u64,
}

/// Mutable file state, guarded by one mutex
struct RecordFile {
    file: File,
    /// Append position (= logical file length)
    end: u64,
    bin: RecycleBin,
    frees_since_optimize: u64,
    reused_allocations: u64,
}

impl RecordFile {
    fn allocate(&mut self, len: u32) -> RecordDescriptor {
        let span = RECORD_HEADER_SIZE + len as u64;

        if let Some(range) = self.bin.take_best_fit(span) {
            self.reused_allocations += 1;
            self.bin.insert(FreeRange {
                pos: range.pos + span,
                size: range.size - span,
            });
            return RecordDescriptor {
                pos: range.pos,
                len,
            };
        }

        let pos = self.end;
        self.end += span;
        RecordDescriptor { pos, len }
    }

    fn release(&mut self, desc: RecordDescriptor) {
        self.bin.insert(FreeRange {
            pos: desc.pos,
            size: desc.span(),
        });
        self.frees_since_optimize += 1;
    }

    fn read_raw(&mut self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn write_raw(&mut self, pos: u64, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    fn move_record(&mut self, desc: RecordDescriptor, to: u64) -> Result<()> {
        let record = self.read_raw(desc.pos, desc.span() as usize)?;
        self.write_raw(to, &record)
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.file.sync_all()?;
        self.end = len;
        self.bin.clear();
        self.frees_since_optimize = 0;
        Ok(())
    }
}

/// Result of [`RecordStore::compact`]
///
/// `moved` holds the new descriptor of every record compacted before
/// `error` stopped the pass (all of them when `error` is `None`). The file
/// is only truncated after a complete pass; after an error the recycle bin
/// no longer matches the file and must be rebuilt from the live set.
#[derive(Debug)]
pub struct Compaction {
    pub moved: Vec<(CacheKey, RecordDescriptor)>,
    pub error: Option<TierError>,
}

/// Variable-length record file
///
/// ## Concurrency:
/// - Allocation, recycle bin mutation and file I/O share a single mutex
pub struct RecordStore {
    path: PathBuf,
    state: Mutex<RecordFile>,
}

impl RecordStore {
    /// Open or create a record file
    pub fn open(path: &Path, max_recycle_bin_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let end = file.metadata()?.len();

        tracing::debug!("Opened record file {} ({} bytes)", path.display(), end);

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(RecordFile {
                file,
                end,
                bin: RecycleBin::new(max_recycle_bin_size),
                frees_since_optimize: 0,
                reused_allocations: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reserve space for a payload of `len` bytes
    ///
    /// Takes the smallest recycled range that fits, else appends.
    pub fn allocate(&self, len: u32) -> RecordDescriptor {
        self.state.lock().allocate(len)
    }

    /// Write `bytes` into the space reserved by `desc`
    pub fn write(&self, desc: RecordDescriptor, bytes: &[u8]) -> Result<()> {
        if bytes.len() != desc.len as usize {
            return Err(TierError::Storage(format!(
                "Record at {} reserved {} bytes, got {}",
                desc.pos,
                desc.len,
                bytes.len()
            )));
        }

        let mut record = Vec::with_capacity(desc.span() as usize);
        record.extend_from_slice(&desc.len.to_le_bytes());
        record.extend_from_slice(&crc32fast::hash(bytes).to_le_bytes());
        record.extend_from_slice(bytes);

        self.state.lock().write_raw(desc.pos, &record)
    }

    /// Allocate and write in one step
    ///
    /// The reserved range goes back to the recycle bin if the write fails.
    pub fn append(&self, bytes: &[u8]) -> Result<RecordDescriptor> {
        let len = u32::try_from(bytes.len()).map_err(|_| TierError::ElementTooLarge {
            size: bytes.len(),
            max: u32::MAX as usize,
        })?;

        let desc = self.allocate(len);
        if let Err(e) = self.write(desc, bytes) {
            self.state.lock().bin.insert(FreeRange {
                pos: desc.pos,
                size: desc.span(),
            });
            return Err(e);
        }
        Ok(desc)
    }

    /// Read the payload of the record at `desc`
    ///
    /// Fails with `Corruption` when the record lies past the end of the
    /// file, its header disagrees with `desc`, or its checksum fails.
    pub fn read(&self, desc: RecordDescriptor) -> Result<Vec<u8>> {
        let mut state = self.state.lock();

        if desc.end() > state.end {
            return Err(TierError::Corruption(format!(
                "Record at {} (+{}) is past the end of {} ({} bytes)",
                desc.pos,
                desc.span(),
                self.path.display(),
                state.end
            )));
        }

        let record = state.read_raw(desc.pos, desc.span() as usize)?;
        drop(state);

        let len = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        let crc = u32::from_le_bytes([record[4], record[5], record[6], record[7]]);
        if len != desc.len {
            return Err(TierError::Corruption(format!(
                "Record at {} declares {} bytes, index says {}",
                desc.pos, len, desc.len
            )));
        }

        let payload = &record[RECORD_HEADER_SIZE as usize..];
        if crc32fast::hash(payload) != crc {
            return Err(TierError::Corruption(format!(
                "Record at {} failed checksum",
                desc.pos
            )));
        }

        Ok(payload.to_vec())
    }

    /// Return a record's range to the recycle bin
    ///
    /// Returns the number of frees since the last optimize.
    pub fn free(&self, desc: RecordDescriptor) -> u64 {
        let mut state = self.state.lock();
        state.release(desc);
        state.frees_since_optimize
    }

    /// Refill the recycle bin with the gaps between `live` records
    pub fn rebuild_recycle_bin(&self, live: &[RecordDescriptor]) {
        let mut sorted: Vec<RecordDescriptor> = live.to_vec();
        sorted.sort_by_key(|desc| desc.pos);

        let mut state = self.state.lock();
        state.bin.clear();

        let mut cursor = 0u64;
        for desc in &sorted {
            if desc.pos > cursor {
                state.bin.insert(FreeRange {
                    pos: cursor,
                    size: desc.pos - cursor,
                });
            }
            cursor = cursor.max(desc.end());
        }
        if state.end > cursor {
            let size = state.end - cursor;
            state.bin.insert(FreeRange { pos: cursor, size });
        }

        tracing::debug!(
            "Record file {}: {} free ranges after reload",
            self.path.display(),
            state.bin.len()
        );
    }

    /// Move `live` records to the front of the file in ascending offset order
    ///
    /// Truncates the file after the last record and empties the recycle bin.
    /// Records are only ever moved towards the start, so a record is read in
    /// full before anything is written over its old position.
    pub fn compact(&self, mut live: Vec<(CacheKey, RecordDescriptor)>) -> Compaction {
        live.sort_by_key(|(_, desc)| desc.pos);

        let mut state = self.state.lock();
        let mut moved = Vec::with_capacity(live.len());
        let mut cursor = 0u64;

        for (key, desc) in live {
            if desc.end() > state.end {
                tracing::warn!(
                    "Skipping record for {} past end of {} during compaction",
                    key,
                    self.path.display()
                );
                continue;
            }

            if desc.pos != cursor {
                if let Err(e) = state.move_record(desc, cursor) {
                    tracing::error!(
                        "Compaction of {} stopped at {} after {} records: {}",
                        self.path.display(),
                        key,
                        moved.len(),
                        e
                    );
                    return Compaction {
                        moved,
                        error: Some(e),
                    };
                }
            }

            moved.push((
                key,
                RecordDescriptor {
                    pos: cursor,
                    len: desc.len,
                },
            ));
            cursor += desc.span();
        }

        let error = state.truncate(cursor).err();
        Compaction { moved, error }
    }

    /// Truncate the file and empty the recycle bin
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.file.set_len(0)?;
        state.file.sync_all()?;
        state.end = 0;
        state.bin.clear();
        state.frees_since_optimize = 0;
        tracing::info!("Reset record file {}", self.path.display());
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.state.lock().file.sync_all()?;
        Ok(())
    }

    pub fn file_len(&self) -> u64 {
        self.state.lock().end
    }

    pub fn recycle_bin_len(&self) -> usize {
        self.state.lock().bin.len()
    }

    /// Free ranges currently held, in file order
    pub fn recycle_bin_ranges(&self) -> Vec<FreeRange> {
        self.state.lock().bin.ranges()
    }

    pub fn stats(&self) -> RecordStoreStats {
        let state = self.state.lock();
        RecordStoreStats {
            file_len: state.end,
            recycle_bin_len: state.bin.len(),
            recycle_bin_bytes: state.bin.total_bytes(),
            leaked_bytes: state.bin.leaked_bytes(),
            frees_since_optimize: state.frees_since_optimize,
            reused_allocations: state.reused_allocations,
        }
    }
}
