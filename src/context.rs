//! Cache Context
//!
//! Owns every region of one process. Regions are built bottom-up on first
//! use: disk store, spool coordinator, then the tiered cache that holds them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::auxiliary::AuxiliaryCache;
use crate::block::BlockDiskCache;
use crate::config::{validate_region_name, Config, DiskConfig, DiskStoreKind};
use crate::error::{Result, TierError};
use crate::record::RecordDiskCache;
use crate::serializer::{BincodeSerializer, ElementSerializer};
use crate::spool::SpoolCoordinator;
use crate::tiered::TieredCache;

/// Region registry
///
/// Tests create one context per temporary directory; nothing is global.
pub struct CacheContext {
    config: Config,
    serializer: Arc<dyn ElementSerializer>,
    regions: Mutex<HashMap<String, Arc<TieredCache>>>,
    shut_down: Mutex<bool>,
}

impl CacheContext {
    /// Create a context with the default bincode serializer
    pub fn new(config: Config) -> Result<Self> {
        Self::with_serializer(config, Arc::new(BincodeSerializer))
    }

    /// Create a context whose disk tiers use `serializer`
    pub fn with_serializer(config: Config, serializer: Arc<dyn ElementSerializer>) -> Result<Self> {
        config.validate()?;
        tracing::info!("Cache context rooted at {:?}", config.data_dir);
        Ok(Self {
            config,
            serializer,
            regions: Mutex::new(HashMap::new()),
            shut_down: Mutex::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Directory holding the disk files of `region`
    pub fn region_dir(&self, region: &str) -> PathBuf {
        self.config.data_dir.join(region)
    }

    /// Get or create `region` with its configured disk tier
    pub fn region(&self, name: &str) -> Result<Arc<TieredCache>> {
        self.region_with_auxiliaries(name, Vec::new())
    }

    /// Get or create `region`, appending `extra` tiers after its disk tier
    ///
    /// `extra` is ignored when the region already exists.
    pub fn region_with_auxiliaries(
        &self,
        name: &str,
        extra: Vec<Arc<dyn AuxiliaryCache>>,
    ) -> Result<Arc<TieredCache>> {
        validate_region_name(name)?;

        let mut regions = self.regions.lock();
        if *self.shut_down.lock() {
            return Err(TierError::NotAlive(format!("context (region {})", name)));
        }
        if let Some(cache) = regions.get(name) {
            return Ok(Arc::clone(cache));
        }

        let region_config = self.config.region_config(name).clone();
        let mut auxiliaries = Vec::new();
        if let Some(disk) = &region_config.disk {
            auxiliaries.push(self.build_disk_tier(name, disk)?);
        }
        auxiliaries.extend(extra);

        tracing::info!(
            "Created region {} with {} auxiliary tiers",
            name,
            auxiliaries.len()
        );

        let cache = Arc::new(TieredCache::new(name, region_config, auxiliaries));
        regions.insert(name.to_string(), Arc::clone(&cache));
        Ok(cache)
    }

    fn build_disk_tier(&self, name: &str, disk: &DiskConfig) -> Result<Arc<dyn AuxiliaryCache>> {
        let dir = self.region_dir(name);
        let serializer = Arc::clone(&self.serializer);

        let tier: Arc<dyn AuxiliaryCache> = match disk.store {
            DiskStoreKind::Block { .. } => {
                let store = Arc::new(BlockDiskCache::open(&dir, name, disk, serializer)?);
                Arc::new(SpoolCoordinator::new(name, store, disk.shutdown_spool_time_limit)?)
            }
            DiskStoreKind::Record { .. } => {
                let store = Arc::new(RecordDiskCache::open(&dir, name, disk, serializer)?);
                Arc::new(SpoolCoordinator::new(name, store, disk.shutdown_spool_time_limit)?)
            }
        };
        Ok(tier)
    }

    /// Names of the regions created so far
    pub fn region_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.regions.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispose every region; later `region` calls fail
    ///
    /// Every region is disposed even when one fails; the first error is
    /// returned.
    pub fn shutdown(&self) -> Result<()> {
        let regions: Vec<Arc<TieredCache>> = {
            let mut regions = self.regions.lock();
            let mut shut_down = self.shut_down.lock();
            if *shut_down {
                return Ok(());
            }
            *shut_down = true;
            regions.drain().map(|(_, cache)| cache).collect()
        };

        let mut first_error = None;
        for cache in regions {
            if let Err(e) = cache.dispose() {
                tracing::error!("Region {} failed to shut down: {}", cache.region(), e);
                first_error.get_or_insert(e);
            }
        }

        tracing::info!("Cache context shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for CacheContext {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Cache context shutdown on drop failed: {}", e);
        }
    }
}
