//! Auxiliary tier contracts
//!
//! A [`crate::TieredCache`] talks to every non-memory tier through
//! [`AuxiliaryCache`]. Disk tiers are built from a [`DiskStore`] (the
//! physical allocator + index) wrapped by a [`crate::spool::SpoolCoordinator`]
//! that makes writes asynchronous.

use crate::element::{CacheElement, CacheKey};
use crate::error::Result;

/// What kind of tier an auxiliary is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxiliaryKind {
    /// Local disk overflow
    Disk,

    /// Peer replication
    Lateral,

    /// Remote cache server
    Remote,
}

/// Lifecycle status of a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Alive,
    Disposed,
    Error,
}

/// A tier behind the memory cache
///
/// Failures of an auxiliary must never reach the application: callers log
/// errors returned here and carry on as if the tier had missed.
pub trait AuxiliaryCache: Send + Sync {
    /// Region this tier serves
    fn region(&self) -> &str;

    fn kind(&self) -> AuxiliaryKind;

    fn status(&self) -> CacheStatus;

    /// Store or replace an element
    fn update(&self, element: CacheElement) -> Result<()>;

    fn get(&self, key: &CacheKey) -> Result<Option<CacheElement>>;

    /// Remove one key; returns whether the tier knew it
    fn remove(&self, key: &CacheKey) -> Result<bool>;

    fn remove_all(&self) -> Result<()>;

    /// Every key currently visible through this tier
    fn key_set(&self) -> Result<Vec<CacheKey>>;

    fn size(&self) -> usize;

    /// Flush what can be flushed and stop accepting work
    fn dispose(&self) -> Result<()>;
}

/// Physical disk store driven by a spool worker
pub trait DiskStore: Send + Sync {
    /// Serialize and write an element, replacing any previous version
    fn write(&self, element: &CacheElement) -> Result<()>;

    /// Read an element; inconsistent index entries read as `None`
    fn read(&self, key: &CacheKey) -> Result<Option<CacheElement>>;

    fn delete(&self, key: &CacheKey) -> Result<bool>;

    /// True when the index tracks `key`
    fn contains(&self, key: &CacheKey) -> bool;

    fn delete_all(&self) -> Result<()>;

    fn keys(&self) -> Vec<CacheKey>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the key index and release resources
    fn shutdown(&self) -> Result<()>;
}
