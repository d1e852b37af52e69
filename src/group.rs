//! Group locks
//!
//! Serialises group-list mutation. Groups hash onto a fixed set of
//! reader/writer shards; the guards release on drop.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::element::GroupId;

/// Sharded reader/writer locks keyed by [`GroupId`]
pub struct GroupLocks {
    shards: Vec<RwLock<()>>,
}

/// Shared access to one group
pub struct GroupReadGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Exclusive access to one group
pub struct GroupWriteGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl GroupLocks {
    pub const DEFAULT_SHARDS: usize = 16;

    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| RwLock::new(())).collect(),
        }
    }

    fn shard(&self, group: &GroupId) -> &RwLock<()> {
        let mut hasher = DefaultHasher::new();
        group.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }

    /// Lock `group` for reading (several readers may hold it)
    pub fn read(&self, group: &GroupId) -> GroupReadGuard<'_> {
        GroupReadGuard {
            _guard: self.shard(group).read(),
        }
    }

    /// Lock `group` for mutation
    pub fn write(&self, group: &GroupId) -> GroupWriteGuard<'_> {
        GroupWriteGuard {
            _guard: self.shard(group).write(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl Default for GroupLocks {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SHARDS)
    }
}
