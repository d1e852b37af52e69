//! # TierKV
//!
//! A multi-tier object cache with disk overflow:
//! - Bounded in-memory tier per region
//! - Block-file or record-file disk tier that survives restarts
//! - Asynchronous, strictly ordered spooling to disk through a purgatory
//! - Background defragmentation of record files
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CacheContext                            │
//! │                  (region registry)                           │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                    TieredCache                               │
//! │          (memory tier + auxiliaries, Swap/Update)            │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌──────────────────┐
//!   │ MemoryCache │          │ SpoolCoordinator │
//!   │    (LRU)    │          │ purgatory+queue  │
//!   └─────────────┘          └────────┬─────────┘
//!                                     │
//!                      ┌──────────────┴──────────────┐
//!                      ▼                             ▼
//!              ┌───────────────┐             ┌────────────────┐
//!              │BlockDiskCache │             │RecordDiskCache │
//!              │ blocks + index│             │records + index │
//!              └───────────────┘             └────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod element;
pub mod serializer;

pub mod index;
pub mod block;
pub mod record;
pub mod spool;

pub mod auxiliary;
pub mod memory;
pub mod group;
pub mod tiered;
pub mod context;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, TierError};
pub use config::{Config, DiskConfig, DiskLimit, DiskStoreKind, DiskUsagePattern, RegionConfig};
pub use element::{CacheElement, CacheKey, ElementAttributes, GroupId};
pub use auxiliary::{AuxiliaryCache, AuxiliaryKind, CacheStatus, DiskStore};
pub use context::CacheContext;
pub use tiered::{CacheStats, TieredCache};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of TierKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
