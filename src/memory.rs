//! Memory Tier
//!
//! Bounded LRU map of elements for one region.
//!
//! ## Data Structure Choice
//! HashMap for lookups plus a BTreeMap keyed by access tick for recency:
//! - `get`/`update` are O(log n)
//! - The least recently used element is the first entry of the BTreeMap

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::element::{now_millis, CacheElement, CacheKey};

struct Slot {
    element: CacheElement,
    tick: u64,
}

#[derive(Default)]
struct LruState {
    entries: HashMap<CacheKey, Slot>,
    order: BTreeMap<u64, CacheKey>,
    next_tick: u64,
}

impl LruState {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn pop_oldest(&mut self) -> Option<CacheElement> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key).map(|slot| slot.element)
    }
}

/// In-memory LRU tier
pub struct MemoryCache {
    capacity: usize,
    state: Mutex<LruState>,
}

impl MemoryCache {
    /// Create a tier holding at most `capacity` elements
    ///
    /// A capacity of zero keeps nothing: every update is handed straight
    /// back as evicted.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LruState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert or replace an element; returns the elements pushed out
    pub fn update(&self, element: CacheElement) -> Vec<CacheElement> {
        if self.capacity == 0 {
            return vec![element];
        }

        let mut state = self.state.lock();
        let tick = state.bump();
        let key = element.key.clone();

        if let Some(previous) = state.entries.insert(key.clone(), Slot { element, tick }) {
            state.order.remove(&previous.tick);
        }
        state.order.insert(tick, key);

        let mut evicted = Vec::new();
        while state.entries.len() > self.capacity {
            match state.pop_oldest() {
                Some(element) => evicted.push(element),
                None => break,
            }
        }
        evicted
    }

    /// Look up an element, marking it most recently used
    pub fn get(&self, key: &CacheKey) -> Option<CacheElement> {
        let mut state = self.state.lock();
        let tick = state.bump();
        let slot = state.entries.get_mut(key)?;

        let old_tick = std::mem::replace(&mut slot.tick, tick);
        slot.element.attributes.touch(now_millis());
        let element = slot.element.clone();

        state.order.remove(&old_tick);
        state.order.insert(tick, key.clone());
        Some(element)
    }

    /// Look up without touching recency
    pub fn peek(&self, key: &CacheKey) -> Option<CacheElement> {
        self.state.lock().entries.get(key).map(|slot| slot.element.clone())
    }

    pub fn remove(&self, key: &CacheKey) -> Option<CacheElement> {
        let mut state = self.state.lock();
        let slot = state.entries.remove(key)?;
        state.order.remove(&slot.tick);
        Some(slot.element)
    }

    pub fn remove_all(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
    }

    /// Keys from least to most recently used
    pub fn key_set(&self) -> Vec<CacheKey> {
        self.state.lock().order.values().cloned().collect()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every element, least recently used first
    pub fn drain(&self) -> Vec<CacheElement> {
        let mut state = self.state.lock();
        let mut drained = Vec::with_capacity(state.entries.len());
        while let Some(element) = state.pop_oldest() {
            drained.push(element);
        }
        drained
    }
}
