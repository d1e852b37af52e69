//! Configuration for TierKV
//!
//! Centralized configuration with sensible defaults. A [`Config`] carries a
//! default [`RegionConfig`] plus per-region overrides; each region that
//! uses disk also carries a [`DiskConfig`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::block::BLOCK_HEADER_SIZE;
use crate::element::ElementAttributes;
use crate::error::{Result, TierError};

/// Main configuration for a [`crate::CacheContext`]
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for all disk tiers
    /// Internal structure:
    ///   {data_dir}/
    ///     └── {region}/
    ///         ├── {region}.data   (block or record file)
    ///         └── {region}.key    (key index snapshot)
    pub data_dir: PathBuf,

    /// Settings for regions without an explicit entry in `regions`
    pub default_region: RegionConfig,

    /// Per-region overrides
    pub regions: HashMap<String, RegionConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./tierkv_data"),
            default_region: RegionConfig::default(),
            regions: HashMap::new(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Settings for `region`, falling back to the default region settings
    pub fn region_config(&self, region: &str) -> &RegionConfig {
        self.regions.get(region).unwrap_or(&self.default_region)
    }

    /// Check every region for values the stores cannot work with
    pub fn validate(&self) -> Result<()> {
        self.default_region.validate()?;
        for (name, region) in &self.regions {
            validate_region_name(name)?;
            region.validate()?;
        }
        Ok(())
    }
}

/// Region names become directory and file names
pub(crate) fn validate_region_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(TierError::Config(format!("Invalid region name: {:?}", name)));
    }
    Ok(())
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all disk tiers)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the settings used by regions without an override
    pub fn default_region(mut self, region: RegionConfig) -> Self {
        self.config.default_region = region;
        self
    }

    /// Override the settings of one region
    pub fn region(mut self, name: impl Into<String>, region: RegionConfig) -> Self {
        self.config.regions.insert(name.into(), region);
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

// =============================================================================
// Region Configuration
// =============================================================================

/// When a put reaches the disk tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskUsagePattern {
    /// Elements reach disk only when evicted from memory
    #[default]
    Swap,

    /// Every put is mirrored to disk immediately
    Update,
}

/// Settings for one region
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Maximum number of elements held by the memory tier
    pub max_memory_objects: usize,

    /// When puts are written to the disk tier
    pub disk_usage_pattern: DiskUsagePattern,

    /// Attributes applied to elements put without explicit attributes
    pub default_element: ElementAttributes,

    /// Disk tier settings (None = memory only)
    pub disk: Option<DiskConfig>,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            max_memory_objects: 1000,
            disk_usage_pattern: DiskUsagePattern::Swap,
            default_element: ElementAttributes::default(),
            disk: None,
        }
    }
}

impl RegionConfig {
    /// Create a new region config builder
    pub fn builder() -> RegionConfigBuilder {
        RegionConfigBuilder::default()
    }

    fn validate(&self) -> Result<()> {
        match &self.disk {
            Some(disk) => disk.validate(),
            None => Ok(()),
        }
    }
}

/// Builder for RegionConfig
#[derive(Default)]
pub struct RegionConfigBuilder {
    config: RegionConfig,
}

impl RegionConfigBuilder {
    /// Set the memory tier capacity (in elements)
    pub fn max_memory_objects(mut self, count: usize) -> Self {
        self.config.max_memory_objects = count;
        self
    }

    /// Set the disk usage pattern
    pub fn disk_usage_pattern(mut self, pattern: DiskUsagePattern) -> Self {
        self.config.disk_usage_pattern = pattern;
        self
    }

    /// Set the attributes applied to new elements
    pub fn default_element(mut self, attributes: ElementAttributes) -> Self {
        self.config.default_element = attributes;
        self
    }

    /// Attach a disk tier
    pub fn disk(mut self, disk: DiskConfig) -> Self {
        self.config.disk = Some(disk);
        self
    }

    pub fn build(self) -> RegionConfig {
        self.config
    }
}

// =============================================================================
// Disk Configuration
// =============================================================================

/// Which allocator backs a disk tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStoreKind {
    /// Fixed-size blocks chained per element
    Block { block_size_bytes: usize },

    /// Variable-length records with a recycle bin
    Record {
        /// Maximum number of free ranges remembered for reuse
        max_recycle_bin_size: usize,

        /// Run optimize after this many removals (None = never automatically)
        optimize_at_remove_count: Option<u64>,

        /// Run optimize during shutdown when free ranges exist
        optimize_on_shutdown: bool,
    },
}

/// Bound on the number of keys a disk index tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskLimit {
    /// At most this many keys
    Count(usize),

    /// At most this many bytes of on-disk footprint
    Bytes(u64),
}

/// Settings for a region's disk tier
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Allocator and its tuning
    pub store: DiskStoreKind,

    /// Key index bound (None = unbounded)
    pub max_key_size: Option<DiskLimit>,

    /// Serialized elements above this size are not written
    pub max_element_bytes: usize,

    /// How long shutdown waits for queued writes
    pub shutdown_spool_time_limit: Duration,
}

impl DiskConfig {
    /// Default block size for block stores
    pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

    /// Disk tier backed by fixed-size blocks
    pub fn block(block_size_bytes: usize) -> Self {
        Self {
            store: DiskStoreKind::Block { block_size_bytes },
            ..Self::record()
        }
    }

    /// Disk tier backed by variable-length records
    pub fn record() -> Self {
        Self {
            store: DiskStoreKind::Record {
                max_recycle_bin_size: 5000,
                optimize_at_remove_count: None,
                optimize_on_shutdown: true,
            },
            max_key_size: None,
            max_element_bytes: 16 * 1024 * 1024, // 16 MB
            shutdown_spool_time_limit: Duration::from_secs(60),
        }
    }

    /// Set the recycle bin capacity (record stores only)
    pub fn max_recycle_bin_size(mut self, size: usize) -> Self {
        if let DiskStoreKind::Record {
            ref mut max_recycle_bin_size,
            ..
        } = self.store
        {
            *max_recycle_bin_size = size;
        }
        self
    }

    /// Set the automatic optimize threshold (record stores only)
    pub fn optimize_at_remove_count(mut self, count: Option<u64>) -> Self {
        if let DiskStoreKind::Record {
            ref mut optimize_at_remove_count,
            ..
        } = self.store
        {
            *optimize_at_remove_count = count;
        }
        self
    }

    /// Enable or disable optimize during shutdown (record stores only)
    pub fn optimize_on_shutdown(mut self, enabled: bool) -> Self {
        if let DiskStoreKind::Record {
            ref mut optimize_on_shutdown,
            ..
        } = self.store
        {
            *optimize_on_shutdown = enabled;
        }
        self
    }

    /// Bound the key index
    pub fn max_key_size(mut self, limit: DiskLimit) -> Self {
        self.max_key_size = Some(limit);
        self
    }

    /// Set the largest serialized element accepted
    pub fn max_element_bytes(mut self, bytes: usize) -> Self {
        self.max_element_bytes = bytes;
        self
    }

    /// Set how long shutdown waits for queued writes
    pub fn shutdown_spool_time_limit(mut self, limit: Duration) -> Self {
        self.shutdown_spool_time_limit = limit;
        self
    }

    fn validate(&self) -> Result<()> {
        if let DiskStoreKind::Block { block_size_bytes } = self.store {
            if block_size_bytes <= BLOCK_HEADER_SIZE {
                return Err(TierError::Config(format!(
                    "Block size {} must exceed the {} byte block header",
                    block_size_bytes, BLOCK_HEADER_SIZE
                )));
            }
        }

        if self.max_element_bytes == 0 {
            return Err(TierError::Config(
                "max_element_bytes must be greater than zero".to_string(),
            ));
        }

        if let Some(DiskLimit::Count(0)) | Some(DiskLimit::Bytes(0)) = self.max_key_size {
            return Err(TierError::Config(
                "max_key_size must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
