//! Key Index
//!
//! In-memory map of logical key → on-disk location, shared by the block and
//! record stores.
//!
//! ## Responsibilities
//! - Track where each key's bytes live
//! - Remember insertion order so the oldest entries can be evicted when the
//!   index is bounded by count or by on-disk footprint
//! - Persist itself to a key file and reload it on restart
//!
//! ## Key File Format
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────────┬──────────────────────┐
//! │Magic (4) │Version (2)│ CRC (4)  │ BodyLen (8)  │ Body (bincode)       │
//! └──────────┴───────────┴──────────┴──────────────┴──────────────────────┘
//! ```
//! The body is `Vec<(CacheKey, L)>` in insertion order. The file is written
//! to a temporary sibling and renamed into place.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::DiskLimit;
use crate::element::CacheKey;
use crate::error::{Result, TierError};

/// Magic bytes identifying a TierKV key file
pub(crate) const MAGIC: &[u8; 4] = b"TKIX";

/// Current key file format version
pub(crate) const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + CRC (4) + BodyLen (8) = 18 bytes
pub(crate) const HEADER_SIZE: usize = 18;

/// A location value stored in a [`KeyIndex`]
pub trait Location: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Bytes this location occupies on disk
    fn footprint(&self) -> u64;
}

/// Result of inserting into a bounded index
#[derive(Debug)]
pub struct PutOutcome<L> {
    /// Location previously stored under the same key
    pub replaced: Option<L>,

    /// Oldest entries pushed out to respect the index bound
    pub evicted: Vec<(CacheKey, L)>,
}

/// What `load_keys` found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No key file (fresh store)
    Missing,

    /// Key file read; this many entries loaded
    Loaded(usize),

    /// Key file unreadable; the index was left empty
    Corrupt(String),
}

struct Slot<L> {
    seq: u64,
    location: L,
}

struct IndexState<L> {
    entries: HashMap<CacheKey, Slot<L>>,
    order: BTreeMap<u64, CacheKey>,
    next_seq: u64,
    footprint: u64,
}

impl<L: Location> IndexState<L> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            footprint: 0,
        }
    }

    fn insert(&mut self, key: CacheKey, location: L) -> Option<L> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.footprint += location.footprint();
        self.order.insert(seq, key.clone());

        let previous = self.entries.insert(key, Slot { seq, location })?;
        self.order.remove(&previous.seq);
        self.footprint -= previous.location.footprint();
        Some(previous.location)
    }

    fn remove(&mut self, key: &CacheKey) -> Option<L> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.seq);
        self.footprint -= slot.location.footprint();
        Some(slot.location)
    }

    fn over_limit(&self, limit: Option<DiskLimit>) -> bool {
        match limit {
            None => false,
            Some(DiskLimit::Count(max)) => self.entries.len() > max,
            Some(DiskLimit::Bytes(max)) => self.footprint > max,
        }
    }

    fn pop_oldest(&mut self) -> Option<(CacheKey, L)> {
        let (_, key) = self.order.pop_first()?;
        let slot = self.entries.remove(&key)?;
        self.footprint -= slot.location.footprint();
        Some((key, slot.location))
    }

    fn ordered(&self) -> Vec<(CacheKey, L)> {
        self.order
            .values()
            .filter_map(|key| {
                self.entries
                    .get(key)
                    .map(|slot| (key.clone(), slot.location.clone()))
            })
            .collect()
    }
}

/// Insertion-ordered key → location map with optional bound and key file
///
/// ## Concurrency:
/// - `state`: Protected by RwLock (concurrent lookups, exclusive mutation)
/// - Location swaps during optimize happen under one write lock, so readers
///   see either all old or all new locations
pub struct KeyIndex<L> {
    /// Key file path
    path: PathBuf,

    /// Optional bound enforced on every put
    limit: Option<DiskLimit>,

    state: RwLock<IndexState<L>>,
}

impl<L: Location> KeyIndex<L> {
    /// Create an empty index persisted at `path`
    pub fn new(path: impl Into<PathBuf>, limit: Option<DiskLimit>) -> Self {
        Self {
            path: path.into(),
            limit,
            state: RwLock::new(IndexState::new()),
        }
    }

    /// Insert or replace `key`, evicting the oldest entries beyond the bound
    ///
    /// The entry just inserted is never evicted by its own insertion.
    pub fn put(&self, key: CacheKey, location: L) -> PutOutcome<L> {
        let mut state = self.state.write();
        let replaced = state.insert(key, location);

        let mut evicted = Vec::new();
        while state.entries.len() > 1 && state.over_limit(self.limit) {
            match state.pop_oldest() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }

        if !evicted.is_empty() {
            tracing::debug!(
                "Key index {} evicted {} oldest entries",
                self.path.display(),
                evicted.len()
            );
        }

        PutOutcome { replaced, evicted }
    }

    pub fn get(&self, key: &CacheKey) -> Option<L> {
        self.state
            .read()
            .entries
            .get(key)
            .map(|slot| slot.location.clone())
    }

    pub fn remove(&self, key: &CacheKey) -> Option<L> {
        self.state.write().remove(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.read().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Sum of the footprints of every tracked location
    pub fn footprint(&self) -> u64 {
        self.state.read().footprint
    }

    /// All keys, oldest first
    pub fn keys(&self) -> Vec<CacheKey> {
        self.state.read().order.values().cloned().collect()
    }

    /// All entries, oldest first
    pub fn entries(&self) -> Vec<(CacheKey, L)> {
        self.state.read().ordered()
    }

    /// Remove every entry and return what was tracked
    pub fn take_all(&self) -> Vec<(CacheKey, L)> {
        let mut state = self.state.write();
        let entries = state.ordered();
        *state = IndexState::new();
        entries
    }

    /// Drop the in-memory map without touching the key file
    pub fn clear_memory_map(&self) {
        *self.state.write() = IndexState::new();
    }

    /// Keep only the entries for which `keep` returns true; return the rest
    pub fn retain<F>(&self, mut keep: F) -> Vec<(CacheKey, L)>
    where
        F: FnMut(&CacheKey, &L) -> bool,
    {
        let mut state = self.state.write();
        let doomed: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(key, slot)| !keep(key, &slot.location))
            .map(|(key, _)| key.clone())
            .collect();

        doomed
            .into_iter()
            .filter_map(|key| state.remove(&key).map(|location| (key, location)))
            .collect()
    }

    /// Replace the locations of existing keys in one step
    ///
    /// Keys no longer present are skipped; insertion order is preserved.
    pub fn relocate(&self, moves: &[(CacheKey, L)]) {
        let mut state = self.state.write();
        for (key, location) in moves {
            let old_footprint = match state.entries.get_mut(key) {
                Some(slot) => {
                    let old = slot.location.footprint();
                    slot.location = location.clone();
                    old
                }
                None => continue,
            };
            state.footprint = state.footprint - old_footprint + location.footprint();
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Key file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the whole map to the key file, replacing it atomically
    pub fn save_keys(&self) -> Result<usize> {
        let entries = self.entries();
        let body = bincode::serialize(&entries)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let tmp_path = self.path.with_extension("key.tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;

            let mut header = Vec::with_capacity(HEADER_SIZE);
            header.extend_from_slice(MAGIC);
            header.extend_from_slice(&VERSION.to_le_bytes());
            header.extend_from_slice(&crc.to_le_bytes());
            header.extend_from_slice(&(body.len() as u64).to_le_bytes());

            file.write_all(&header)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        tracing::debug!(
            "Saved {} keys to {}",
            entries.len(),
            self.path.display()
        );
        Ok(entries.len())
    }

    /// Replace the in-memory map with the key file contents
    ///
    /// A missing or unreadable key file leaves the index empty; it never
    /// fails the caller.
    pub fn load_keys(&self) -> LoadOutcome {
        let entries = match Self::read_key_file(&self.path) {
            Ok(Some(entries)) => entries,
            Ok(None) => {
                self.clear_memory_map();
                return LoadOutcome::Missing;
            }
            Err(e) => {
                tracing::warn!(
                    "Key file {} unreadable, starting empty: {}",
                    self.path.display(),
                    e
                );
                self.clear_memory_map();
                return LoadOutcome::Corrupt(e.to_string());
            }
        };

        let mut state = IndexState::new();
        for (key, location) in entries {
            state.insert(key, location);
        }
        let count = state.entries.len();
        *self.state.write() = state;

        tracing::debug!("Loaded {} keys from {}", count, self.path.display());
        LoadOutcome::Loaded(count)
    }

    /// Remove the key file from disk
    pub fn delete_key_file(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_key_file(path: &Path) -> Result<Option<Vec<(CacheKey, L)>>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        if bytes.len() < HEADER_SIZE {
            return Err(TierError::Corruption(format!(
                "Key file truncated: {} bytes",
                bytes.len()
            )));
        }

        if &bytes[0..4] != MAGIC {
            return Err(TierError::Corruption(format!(
                "Invalid key file magic: {:?}",
                &bytes[0..4]
            )));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(TierError::Corruption(format!(
                "Unsupported key file version: {}",
                version
            )));
        }

        let crc = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&bytes[10..18]);
        let body_len = u64::from_le_bytes(len_bytes);

        let body = &bytes[HEADER_SIZE..];
        if body.len() as u64 != body_len {
            return Err(TierError::Corruption(format!(
                "Key file body is {} bytes, header says {}",
                body.len(),
                body_len
            )));
        }

        if crc32fast::hash(body) != crc {
            return Err(TierError::Corruption("Key file checksum mismatch".to_string()));
        }

        Ok(Some(bincode::deserialize(body)?))
    }
}
