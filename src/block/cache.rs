//! Block Disk Cache
//!
//! Joins a [`BlockStore`] and a [`BlockKeyIndex`] into a [`DiskStore`].

use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::auxiliary::DiskStore;
use crate::config::{DiskConfig, DiskStoreKind};
use crate::element::{CacheElement, CacheKey};
use crate::error::{Result, TierError};
use crate::index::LoadOutcome;
use crate::serializer::ElementSerializer;

use super::{BlockChain, BlockKeyIndex, BlockStore, BlockStoreStats};

/// Block-backed disk store for one region
///
/// ## Concurrency:
/// - `io_lock` read side: index lookup + block read (many readers)
/// - `io_lock` write side: write/delete, which free and reuse blocks, so a
///   reader never follows a chain whose blocks were handed to another key
pub struct BlockDiskCache {
    region: String,
    store: BlockStore,
    index: BlockKeyIndex,
    serializer: Arc<dyn ElementSerializer>,
    max_element_bytes: usize,
    io_lock: RwLock<()>,
}

impl BlockDiskCache {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const DATA_EXTENSION: &'static str = "data";
    const KEY_EXTENSION: &'static str = "key";

    /// Open or create the block files for `region` under `dir`
    ///
    /// On startup:
    /// 1. Open/create the block file
    /// 2. Load the key file; drop entries the block file cannot back
    /// 3. Rebuild the free pool from unreferenced blocks
    /// 4. Without a usable key file, reset the block file (its data is unreachable)
    pub fn open(
        dir: &Path,
        region: &str,
        config: &DiskConfig,
        serializer: Arc<dyn ElementSerializer>,
    ) -> Result<Self> {
        let block_size = match config.store {
            DiskStoreKind::Block { block_size_bytes } => block_size_bytes,
            DiskStoreKind::Record { .. } => {
                return Err(TierError::Config(format!(
                    "Region {} is not configured for a block store",
                    region
                )))
            }
        };

        fs::create_dir_all(dir)?;
        let data_path = dir.join(format!("{}.{}", region, Self::DATA_EXTENSION));
        let key_path = dir.join(format!("{}.{}", region, Self::KEY_EXTENSION));

        let store = BlockStore::open(&data_path, block_size)?;
        let index = BlockKeyIndex::new(key_path, config.max_key_size);

        match index.load_keys() {
            LoadOutcome::Loaded(count) => {
                let dropped = index.drop_inconsistent(&store);
                let entries = index.entries();
                store.rebuild_free_list(entries.iter().map(|(_, chain)| chain));
                tracing::info!(
                    "Block disk cache {}: recovered {} keys ({} dropped)",
                    region,
                    count - dropped,
                    dropped
                );
            }
            LoadOutcome::Missing | LoadOutcome::Corrupt(_) => {
                if store.block_count() > 0 {
                    tracing::warn!(
                        "Block disk cache {}: no usable key file, resetting data file",
                        region
                    );
                    store.reset()?;
                }
            }
        }

        Ok(Self {
            region: region.to_string(),
            store,
            index,
            serializer,
            max_element_bytes: config.max_element_bytes,
            io_lock: RwLock::new(()),
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn index(&self) -> &BlockKeyIndex {
        &self.index
    }

    pub fn stats(&self) -> BlockStoreStats {
        self.store.stats()
    }

    /// Persist the key index now
    pub fn save_keys(&self) -> Result<usize> {
        let _guard = self.io_lock.read();
        self.index.save_keys()
    }

    fn release(&self, chain: &BlockChain) {
        self.store.free(&chain.blocks);
    }
}

impl DiskStore for BlockDiskCache {
    fn write(&self, element: &CacheElement) -> Result<()> {
        let bytes = self.serializer.serialize(element)?;
        if bytes.len() > self.max_element_bytes {
            return Err(TierError::ElementTooLarge {
                size: bytes.len(),
                max: self.max_element_bytes,
            });
        }

        let _guard = self.io_lock.write();
        let chain = self.store.write(&bytes)?;
        let outcome = self.index.put(element.key.clone(), chain);

        if let Some(old) = outcome.replaced {
            self.release(&old);
        }
        for (key, chain) in outcome.evicted {
            tracing::debug!("Block disk cache {}: evicted {} from index", self.region, key);
            self.release(&chain);
        }
        Ok(())
    }

    fn read(&self, key: &CacheKey) -> Result<Option<CacheElement>> {
        let _guard = self.io_lock.read();
        let chain = match self.index.get(key) {
            Some(chain) => chain,
            None => return Ok(None),
        };

        let bytes = match self.store.read(&chain.blocks) {
            Ok(bytes) => bytes,
            Err(TierError::Corruption(reason)) => {
                tracing::warn!("Block disk cache {}: treating {} as missing: {}", self.region, key, reason);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match self.serializer.deserialize(&bytes) {
            Ok(element) if element.key == *key => Ok(Some(element)),
            Ok(element) => {
                // The chain was reused by another key after the key file was saved
                tracing::warn!(
                    "Block disk cache {}: {} points at the chain of {}, dropping stale entry",
                    self.region,
                    key,
                    element.key
                );
                self.index.remove(key);
                Ok(None)
            }
            Err(e) => {
                tracing::warn!("Block disk cache {}: undecodable element {}: {}", self.region, key, e);
                Ok(None)
            }
        }
    }

    fn delete(&self, key: &CacheKey) -> Result<bool> {
        let _guard = self.io_lock.write();
        match self.index.remove(key) {
            Some(chain) => {
                self.release(&chain);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.index.contains(key)
    }

    fn delete_all(&self) -> Result<()> {
        let _guard = self.io_lock.write();
        self.index.clear_memory_map();
        self.index.delete_key_file()?;
        self.store.reset()
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.index.keys()
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn shutdown(&self) -> Result<()> {
        let _guard = self.io_lock.write();
        let saved = self.index.save_keys()?;
        self.store.sync()?;
        tracing::info!("Block disk cache {} shut down with {} keys", self.region, saved);
        Ok(())
    }
}
