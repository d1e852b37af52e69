//! Recycle Bin
//!
//! Bounded set of reclaimed byte ranges, searched best-fit.

use std::collections::{BTreeMap, BTreeSet};

/// A reclaimed byte range in a record file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRange {
    pub pos: u64,
    pub size: u64,
}

impl FreeRange {
    pub fn end(&self) -> u64 {
        self.pos + self.size
    }
}

/// Free list of a record store
///
/// Adjacent ranges are merged on insert. Once `capacity` ranges are held, a
/// range that cannot merge with a neighbour is dropped ("leaked") and only
/// comes back through a full optimize.
#[derive(Debug)]
pub struct RecycleBin {
    capacity: usize,
    /// pos → size, for neighbour lookup
    by_pos: BTreeMap<u64, u64>,
    /// (size, pos), for best-fit lookup
    by_size: BTreeSet<(u64, u64)>,
    leaked_bytes: u64,
}

impl RecycleBin {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            by_pos: BTreeMap::new(),
            by_size: BTreeSet::new(),
            leaked_bytes: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.by_pos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pos.is_empty()
    }

    /// Total bytes held in the bin
    pub fn total_bytes(&self) -> u64 {
        self.by_pos.values().sum()
    }

    /// Bytes dropped because the bin was full
    pub fn leaked_bytes(&self) -> u64 {
        self.leaked_bytes
    }

    /// Ranges in file order
    pub fn ranges(&self) -> Vec<FreeRange> {
        self.by_pos
            .iter()
            .map(|(&pos, &size)| FreeRange { pos, size })
            .collect()
    }

    /// Add a freed range, merging it with adjacent free ranges
    ///
    /// Returns false when the range was leaked because the bin is full.
    pub fn insert(&mut self, range: FreeRange) -> bool {
        if range.size == 0 {
            return true;
        }

        let before = self
            .by_pos
            .range(..range.pos)
            .next_back()
            .map(|(&pos, &size)| FreeRange { pos, size })
            .filter(|prev| prev.end() == range.pos);
        let after = self
            .by_pos
            .get(&range.end())
            .map(|&size| FreeRange {
                pos: range.end(),
                size,
            });

        if before.is_none() && after.is_none() && self.by_pos.len() >= self.capacity {
            self.leaked_bytes += range.size;
            tracing::trace!(
                "Recycle bin full ({} ranges), leaking {} bytes at {}",
                self.capacity,
                range.size,
                range.pos
            );
            return false;
        }

        let mut merged = range;
        if let Some(prev) = before {
            self.remove(prev);
            merged = FreeRange {
                pos: prev.pos,
                size: prev.size + merged.size,
            };
        }
        if let Some(next) = after {
            self.remove(next);
            merged.size += next.size;
        }

        self.by_pos.insert(merged.pos, merged.size);
        self.by_size.insert((merged.size, merged.pos));
        true
    }

    /// Remove and return the smallest range of at least `needed` bytes
    pub fn take_best_fit(&mut self, needed: u64) -> Option<FreeRange> {
        let &(size, pos) = self.by_size.range((needed, 0)..).next()?;
        let range = FreeRange { pos, size };
        self.remove(range);
        Some(range)
    }

    /// Forget every range (after optimize or reset)
    pub fn clear(&mut self) {
        self.by_pos.clear();
        self.by_size.clear();
        self.leaked_bytes = 0;
    }

    fn remove(&mut self, range: FreeRange) {
        self.by_pos.remove(&range.pos);
        self.by_size.remove(&(range.size, range.pos));
    }
}
