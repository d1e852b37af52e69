//! Tiered Cache
//!
//! One region: a memory tier in front of zero or more auxiliary tiers.
//!
//! ## Routing
//! - `Swap`: a put reaches a disk tier only when memory evicts it
//! - `Update`: every spoolable put is also handed to the disk tiers
//! - Non-disk tiers (lateral, remote) receive every put in both patterns
//!
//! Auxiliary failures are logged and otherwise behave like misses.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::auxiliary::{AuxiliaryCache, AuxiliaryKind};
use crate::config::{DiskUsagePattern, RegionConfig};
use crate::element::{now_millis, CacheElement, CacheKey, ElementAttributes, GroupId};
use crate::error::{Result, TierError};
use crate::group::GroupLocks;
use crate::memory::MemoryCache;

/// Snapshot of region counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub puts: u64,
    pub memory_hits: u64,
    pub auxiliary_hits: u64,
    pub misses: u64,
    pub removes: u64,
    /// Elements found expired during `get`
    pub expired: u64,
    /// Elements handed to disk tiers after memory eviction
    pub spooled: u64,
}

#[derive(Default)]
struct CacheCounters {
    puts: AtomicU64,
    memory_hits: AtomicU64,
    auxiliary_hits: AtomicU64,
    misses: AtomicU64,
    removes: AtomicU64,
    expired: AtomicU64,
    spooled: AtomicU64,
}

/// Composite cache for one region
pub struct TieredCache {
    region: String,
    config: RegionConfig,
    memory: MemoryCache,
    auxiliaries: Vec<Arc<dyn AuxiliaryCache>>,
    group_locks: GroupLocks,
    alive: AtomicBool,
    counters: CacheCounters,
}

impl TieredCache {
    /// Build a region cache over already constructed auxiliaries
    pub fn new(
        region: impl Into<String>,
        config: RegionConfig,
        auxiliaries: Vec<Arc<dyn AuxiliaryCache>>,
    ) -> Self {
        let memory = MemoryCache::new(config.max_memory_objects);
        Self {
            region: region.into(),
            config,
            memory,
            auxiliaries,
            group_locks: GroupLocks::default(),
            alive: AtomicBool::new(true),
            counters: CacheCounters::default(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }

    pub fn auxiliaries(&self) -> &[Arc<dyn AuxiliaryCache>] {
        &self.auxiliaries
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(TierError::NotAlive(self.region.clone()))
        }
    }

    // =========================================================================
    // Put
    // =========================================================================

    /// Store `value` under `key` with the region's default attributes
    pub fn put(&self, key: impl Into<CacheKey>, value: impl Into<Bytes>) -> Result<()> {
        let element = CacheElement::with_attributes(
            self.region.clone(),
            key,
            value,
            &self.config.default_element,
        );
        self.put_element(element)
    }

    /// Store `value` under `key` with explicit attributes
    pub fn put_with_attributes(
        &self,
        key: impl Into<CacheKey>,
        value: impl Into<Bytes>,
        attributes: &ElementAttributes,
    ) -> Result<()> {
        let element = CacheElement::with_attributes(self.region.clone(), key, value, attributes);
        self.put_element(element)
    }

    /// Store a fully built element
    pub fn put_element(&self, element: CacheElement) -> Result<()> {
        self.ensure_alive()?;
        self.counters.puts.fetch_add(1, Ordering::Relaxed);

        let evicted = self.memory.update(element.clone());
        if self.config.disk_usage_pattern == DiskUsagePattern::Swap {
            for victim in evicted {
                self.spool_to_disk(victim);
            }
        }

        self.update_auxiliaries(element);
        Ok(())
    }

    /// Hand an element evicted from memory to the disk tiers
    fn spool_to_disk(&self, element: CacheElement) {
        if !element.attributes.is_spool {
            tracing::trace!("Region {}: {} is not spoolable, dropping", self.region, element.key);
            return;
        }
        if element.is_expired(now_millis()) {
            return;
        }

        let mut disks = self
            .auxiliaries
            .iter()
            .filter(|aux| aux.kind() == AuxiliaryKind::Disk)
            .peekable();
        if disks.peek().is_none() {
            return;
        }

        self.counters.spooled.fetch_add(1, Ordering::Relaxed);
        for aux in disks {
            if let Err(e) = aux.update(element.clone()) {
                tracing::error!("Region {}: spool of {} failed: {}", self.region, element.key, e);
            }
        }
    }

    /// Forward a put to the tiers that see every put
    fn update_auxiliaries(&self, element: CacheElement) {
        let mirror_to_disk = self.config.disk_usage_pattern == DiskUsagePattern::Update
            && element.attributes.is_spool;

        for aux in &self.auxiliaries {
            if aux.kind() == AuxiliaryKind::Disk && !mirror_to_disk {
                continue;
            }
            if let Err(e) = aux.update(element.clone()) {
                tracing::error!(
                    "Region {}: {:?} tier rejected {}: {}",
                    self.region,
                    aux.kind(),
                    element.key,
                    e
                );
            }
        }
    }

    // =========================================================================
    // Get
    // =========================================================================

    /// Look up `key` in memory, then each auxiliary in order
    ///
    /// Auxiliary hits are promoted into memory. Expired elements are removed
    /// from every tier and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CacheElement>> {
        self.ensure_alive()?;
        let now = now_millis();

        // Idle expiry is judged before the access refreshes the element
        if let Some(element) = self.memory.peek(key) {
            if element.is_expired(now) {
                self.expire(key);
                return Ok(None);
            }
            if let Some(element) = self.memory.get(key) {
                self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(element));
            }
        }

        for aux in &self.auxiliaries {
            let found = match aux.get(key) {
                Ok(found) => found,
                Err(e) => {
                    tracing::error!("Region {}: {:?} tier get failed: {}", self.region, aux.kind(), e);
                    continue;
                }
            };

            if let Some(mut element) = found {
                if element.is_expired(now) {
                    self.expire(key);
                    return Ok(None);
                }

                self.counters.auxiliary_hits.fetch_add(1, Ordering::Relaxed);
                element.attributes.touch(now);
                let evicted = self.memory.update(element.clone());
                if self.config.disk_usage_pattern == DiskUsagePattern::Swap {
                    for victim in evicted {
                        self.spool_to_disk(victim);
                    }
                }
                return Ok(Some(element));
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    /// Convenience wrapper returning only the payload
    pub fn get_value(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        Ok(self.get(key)?.map(|element| element.value))
    }

    fn expire(&self, key: &CacheKey) {
        self.counters.expired.fetch_add(1, Ordering::Relaxed);
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Region {}: {} expired", self.region, key);
        self.remove_single(key);
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Remove `key` from every tier
    ///
    /// A name ending with `:` removes every name key it prefixes, one key at
    /// a time through the same path. Returns whether anything was removed.
    pub fn remove(&self, key: &CacheKey) -> Result<bool> {
        self.ensure_alive()?;

        if !key.is_prefix() {
            return Ok(self.remove_single(key));
        }

        let matches: Vec<CacheKey> = self
            .collect_keys()
            .into_iter()
            .filter(|candidate| candidate.matched_by(key))
            .collect();

        tracing::debug!(
            "Region {}: prefix {} matched {} keys",
            self.region,
            key,
            matches.len()
        );

        let mut removed = false;
        for candidate in &matches {
            removed |= self.remove_single(candidate);
        }
        Ok(removed)
    }

    fn remove_single(&self, key: &CacheKey) -> bool {
        self.counters.removes.fetch_add(1, Ordering::Relaxed);
        let mut removed = self.memory.remove(key).is_some();

        for aux in &self.auxiliaries {
            match aux.remove(key) {
                Ok(known) => removed |= known,
                Err(e) => {
                    tracing::error!("Region {}: {:?} tier remove failed: {}", self.region, aux.kind(), e)
                }
            }
        }
        removed
    }

    /// Drop every element of the region from every tier
    pub fn remove_all(&self) -> Result<()> {
        self.ensure_alive()?;
        self.memory.remove_all();

        for aux in &self.auxiliaries {
            if let Err(e) = aux.remove_all() {
                tracing::error!("Region {}: {:?} tier remove_all failed: {}", self.region, aux.kind(), e);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Keys
    // =========================================================================

    fn collect_keys(&self) -> Vec<CacheKey> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();

        for key in self.memory.key_set() {
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }

        for aux in &self.auxiliaries {
            match aux.key_set() {
                Ok(aux_keys) => {
                    for key in aux_keys {
                        if seen.insert(key.clone()) {
                            keys.push(key);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Region {}: {:?} tier key_set failed: {}", self.region, aux.kind(), e)
                }
            }
        }
        keys
    }

    /// Every key visible in any tier
    pub fn key_set(&self) -> Result<Vec<CacheKey>> {
        self.ensure_alive()?;
        Ok(self.collect_keys())
    }

    /// Elements held by the memory tier
    pub fn memory_size(&self) -> usize {
        self.memory.len()
    }

    // =========================================================================
    // Groups
    // =========================================================================

    fn group_id(&self, group: &str) -> GroupId {
        GroupId::new(self.region.clone(), group)
    }

    /// Store `value` as attribute `attr` of `group`
    pub fn put_in_group(&self, group: &str, attr: &str, value: impl Into<Bytes>) -> Result<()> {
        let id = self.group_id(group);
        let _guard = self.group_locks.write(&id);
        self.put(CacheKey::group(id.clone(), attr), value)
    }

    pub fn get_from_group(&self, group: &str, attr: &str) -> Result<Option<CacheElement>> {
        let id = self.group_id(group);
        let _guard = self.group_locks.read(&id);
        self.get(&CacheKey::group(id.clone(), attr))
    }

    /// Attribute names currently stored under `group`
    pub fn group_keys(&self, group: &str) -> Result<Vec<String>> {
        self.ensure_alive()?;
        let id = self.group_id(group);
        let _guard = self.group_locks.read(&id);

        let mut attrs: Vec<String> = self
            .collect_keys()
            .into_iter()
            .filter_map(|key| match key {
                CacheKey::Group(member) if member.group == id => Some(member.attr),
                _ => None,
            })
            .collect();
        attrs.sort();
        Ok(attrs)
    }

    /// Remove one attribute of `group`
    pub fn remove_from_group(&self, group: &str, attr: &str) -> Result<bool> {
        let id = self.group_id(group);
        let _guard = self.group_locks.write(&id);
        self.remove(&CacheKey::group(id.clone(), attr))
    }

    /// Remove every attribute of `group`; returns how many keys were removed
    pub fn remove_group(&self, group: &str) -> Result<usize> {
        self.ensure_alive()?;
        let id = self.group_id(group);
        let _guard = self.group_locks.write(&id);

        let members: Vec<CacheKey> = self
            .collect_keys()
            .into_iter()
            .filter(|key| key.group_id() == Some(&id))
            .collect();

        for key in &members {
            self.remove_single(key);
        }

        tracing::debug!("Region {}: removed group {} ({} keys)", self.region, id, members.len());
        Ok(members.len())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            puts: c.puts.load(Ordering::Relaxed),
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            auxiliary_hits: c.auxiliary_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            removes: c.removes.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            spooled: c.spooled.load(Ordering::Relaxed),
        }
    }

    /// Shut the region down
    ///
    /// Under `Swap`, spoolable memory contents are written to the disk tiers
    /// first so they survive a restart. Every auxiliary is then disposed.
    /// Later calls fail with [`TierError::NotAlive`].
    pub fn dispose(&self) -> Result<()> {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let drained = self.memory.drain();
        if self.config.disk_usage_pattern == DiskUsagePattern::Swap {
            tracing::info!(
                "Region {}: spooling {} memory elements before shutdown",
                self.region,
                drained.len()
            );
            for element in drained {
                self.spool_to_disk(element);
            }
        }

        let mut first_error = None;
        for aux in &self.auxiliaries {
            if let Err(e) = aux.dispose() {
                tracing::error!("Region {}: {:?} tier dispose failed: {}", self.region, aux.kind(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
