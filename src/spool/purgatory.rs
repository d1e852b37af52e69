//! Purgatory
//!
//! Per-region map of elements handed to the disk tier but not yet (or no
//! longer) reflected by it.
//!
//! ## Per-key states
//! ```text
//!            stage_update              begin_write            finish_write
//!   absent ───────────────▶ Queued ─────────────────▶ Writing ─────────────▶ absent
//!                            ▲  │ stage_update                 │ stage_update
//!                            │  └─(payload replaced in place)  │ (new event)
//!                            └─────────────────────────────────┘
//!   any ── stage_remove ──▶ Removed ── finish_remove ──▶ absent
//! ```
//! Each staged event carries a sequence number; an event only acts on the
//! entry it created, so stale events for a key are skipped.

use std::collections::{HashMap, HashSet};

use crate::element::{CacheElement, CacheKey};

/// State of one key in purgatory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgatoryState {
    /// Waiting in the event queue
    Queued(CacheElement),

    /// Being written by the worker
    Writing(CacheElement),

    /// Removed logically; the physical delete is still queued
    Removed,
}

#[derive(Debug, Clone)]
struct PurgatoryEntry {
    state: PurgatoryState,
    spoolable: bool,
    seq: u64,
}

/// Outcome of a purgatory lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// In-flight value (read-your-writes)
    Hit(CacheElement),

    /// Logically gone; the disk copy must not be read
    Removed,

    /// Purgatory knows nothing; consult the disk store
    Miss,
}

/// Purgatory for one region
#[derive(Debug, Default)]
pub struct Purgatory {
    entries: HashMap<CacheKey, PurgatoryEntry>,
    next_seq: u64,
    /// Sequence of a queued remove-all; disk reads are masked until it runs
    clearing: Option<u64>,
}

impl Purgatory {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Stage a put
    ///
    /// Returns the sequence number of a new put event to enqueue, or `None`
    /// when a queued event for the key already exists and now carries the
    /// new payload.
    pub fn stage_update(&mut self, element: CacheElement) -> Option<u64> {
        let spoolable = element.attributes.is_spool;

        if let Some(entry) = self.entries.get_mut(&element.key) {
            if let PurgatoryState::Queued(ref mut queued) = entry.state {
                *queued = element;
                entry.spoolable = spoolable;
                return None;
            }
        }

        let seq = self.next_seq();
        self.entries.insert(
            element.key.clone(),
            PurgatoryEntry {
                state: PurgatoryState::Queued(element),
                spoolable,
                seq,
            },
        );
        Some(seq)
    }

    /// Stage a remove; returns the sequence number of the remove event
    pub fn stage_remove(&mut self, key: &CacheKey) -> u64 {
        let seq = self.next_seq();
        self.entries.insert(
            key.clone(),
            PurgatoryEntry {
                state: PurgatoryState::Removed,
                spoolable: false,
                seq,
            },
        );
        seq
    }

    /// Stage a remove-all; returns the sequence number of the event
    pub fn stage_remove_all(&mut self) -> u64 {
        let seq = self.next_seq();
        self.entries.clear();
        self.clearing = Some(seq);
        seq
    }

    /// Move the entry created by put event `seq` to `Writing`
    ///
    /// Returns the element to write, or `None` when the event is stale or
    /// the element must not be spooled (the entry is then dropped).
    pub fn begin_write(&mut self, key: &CacheKey, seq: u64) -> Option<CacheElement> {
        let entry = self.entries.get_mut(key)?;
        if entry.seq != seq {
            return None;
        }

        let element = match &entry.state {
            PurgatoryState::Queued(element) => element.clone(),
            _ => return None,
        };

        if !entry.spoolable {
            self.entries.remove(key);
            return None;
        }

        entry.state = PurgatoryState::Writing(element.clone());
        Some(element)
    }

    /// Drop the entry written by put event `seq` unless it was superseded
    pub fn finish_write(&mut self, key: &CacheKey, seq: u64) -> bool {
        let done = matches!(
            self.entries.get(key),
            Some(entry) if entry.seq == seq && matches!(entry.state, PurgatoryState::Writing(_))
        );
        if done {
            self.entries.remove(key);
        }
        done
    }

    /// Drop the tombstone left by remove event `seq` unless superseded
    pub fn finish_remove(&mut self, key: &CacheKey, seq: u64) {
        let done = matches!(
            self.entries.get(key),
            Some(entry) if entry.seq == seq && entry.state == PurgatoryState::Removed
        );
        if done {
            self.entries.remove(key);
        }
    }

    /// Unmask disk reads once remove-all event `seq` has run
    pub fn finish_remove_all(&mut self, seq: u64) {
        if self.clearing == Some(seq) {
            self.clearing = None;
        }
    }

    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        match self.entries.get(key).map(|entry| &entry.state) {
            Some(PurgatoryState::Queued(element)) | Some(PurgatoryState::Writing(element)) => {
                Lookup::Hit(element.clone())
            }
            Some(PurgatoryState::Removed) => Lookup::Removed,
            None if self.clearing.is_some() => Lookup::Removed,
            None => Lookup::Miss,
        }
    }

    pub fn state(&self, key: &CacheKey) -> Option<&PurgatoryState> {
        self.entries.get(key).map(|entry| &entry.state)
    }

    /// True while a remove-all is queued
    pub fn is_clearing(&self) -> bool {
        self.clearing.is_some()
    }

    /// Keys holding an in-flight value
    pub fn pending_keys(&self) -> Vec<CacheKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state != PurgatoryState::Removed)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Keys logically removed but possibly still on disk
    pub fn removed_keys(&self) -> HashSet<CacheKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state == PurgatoryState::Removed)
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of entries, tombstones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
