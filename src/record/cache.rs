//! Record Disk Cache
//!
//! Joins a [`RecordStore`] and a [`RecordKeyIndex`] into a [`DiskStore`]
//! and runs optimize (defragmentation).

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};

use crate::auxiliary::DiskStore;
use crate::config::{DiskConfig, DiskStoreKind};
use crate::element::{CacheElement, CacheKey};
use crate::error::{Result, TierError};
use crate::index::LoadOutcome;
use crate::serializer::ElementSerializer;

use super::{RecordDescriptor, RecordKeyIndex, RecordStore, RecordStoreStats};

/// State shared with the background optimize thread
struct RecordInner {
    region: String,
    store: RecordStore,
    index: RecordKeyIndex,
    serializer: Arc<dyn ElementSerializer>,
    max_element_bytes: usize,
    optimize_at_remove_count: Option<u64>,
    optimize_on_shutdown: bool,
    /// Read side: lookups. Write side: writes, deletes and optimize.
    io_lock: RwLock<()>,
    optimizing: AtomicBool,
    optimize_count: AtomicU64,
}

impl RecordInner {
    fn release(&self, desc: RecordDescriptor) -> u64 {
        self.store.free(desc)
    }

    fn optimize(&self) -> Result<()> {
        let _guard = self.io_lock.write();

        let before = self.store.file_len();
        let live = self.index.entries();
        let count = live.len();

        let compaction = self.store.compact(live);
        self.index.relocate(&compaction.moved);
        if let Some(e) = compaction.error {
            self.store.rebuild_recycle_bin(&self.index.descriptors());
            tracing::error!("Record disk cache {}: optimize failed: {}", self.region, e);
            return Err(e);
        }

        if let Err(e) = self.index.save_keys() {
            tracing::warn!("Record disk cache {}: key save after optimize failed: {}", self.region, e);
        }

        self.optimize_count.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            "Record disk cache {}: optimized {} records, {} -> {} bytes",
            self.region,
            count,
            before,
            self.store.file_len()
        );
        Ok(())
    }
}

/// Record-backed disk store for one region
///
/// ## Concurrency:
/// - Lookups hold `io_lock` shared; writes, deletes and optimize hold it
///   exclusively, so a reader never observes a half-relocated offset
/// - Automatic optimize runs on its own thread and takes the same lock
pub struct RecordDiskCache {
    inner: Arc<RecordInner>,
    optimizer: Mutex<Option<JoinHandle<()>>>,
}

impl RecordDiskCache {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const DATA_EXTENSION: &'static str = "data";
    const KEY_EXTENSION: &'static str = "key";

    /// Open or create the record files for `region` under `dir`
    ///
    /// On startup:
    /// 1. Open/create the data file
    /// 2. Load the key file; drop entries past the end of the data file
    /// 3. If surviving records overlap, reset both files
    /// 4. Rebuild the recycle bin from the gaps between live records
    /// 5. Without a usable key file, reset the data file (its data is unreachable)
    pub fn open(
        dir: &Path,
        region: &str,
        config: &DiskConfig,
        serializer: Arc<dyn ElementSerializer>,
    ) -> Result<Self> {
        let (max_recycle_bin_size, optimize_at_remove_count, optimize_on_shutdown) =
            match config.store {
                DiskStoreKind::Record {
                    max_recycle_bin_size,
                    optimize_at_remove_count,
                    optimize_on_shutdown,
                } => (
                    max_recycle_bin_size,
                    optimize_at_remove_count,
                    optimize_on_shutdown,
                ),
                DiskStoreKind::Block { .. } => {
                    return Err(TierError::Config(format!(
                        "Region {} is not configured for a record store",
                        region
                    )))
                }
            };

        fs::create_dir_all(dir)?;
        let data_path = dir.join(format!("{}.{}", region, Self::DATA_EXTENSION));
        let key_path = dir.join(format!("{}.{}", region, Self::KEY_EXTENSION));

        let store = RecordStore::open(&data_path, max_recycle_bin_size)?;
        let index = RecordKeyIndex::new(key_path, config.max_key_size);

        match index.load_keys() {
            LoadOutcome::Loaded(count) => {
                let dropped = index.drop_past_end(store.file_len());
                if index.has_overlaps() {
                    tracing::error!(
                        "Record disk cache {}: overlapping records in key file, resetting store",
                        region
                    );
                    index.clear_memory_map();
                    index.delete_key_file()?;
                    store.reset()?;
                } else {
                    store.rebuild_recycle_bin(&index.descriptors());
                    tracing::info!(
                        "Record disk cache {}: recovered {} keys ({} dropped)",
                        region,
                        count - dropped,
                        dropped
                    );
                }
            }
            LoadOutcome::Missing | LoadOutcome::Corrupt(_) => {
                if store.file_len() > 0 {
                    tracing::warn!(
                        "Record disk cache {}: no usable key file, resetting data file",
                        region
                    );
                    store.reset()?;
                }
            }
        }

        Ok(Self {
            inner: Arc::new(RecordInner {
                region: region.to_string(),
                store,
                index,
                serializer,
                max_element_bytes: config.max_element_bytes,
                optimize_at_remove_count,
                optimize_on_shutdown,
                io_lock: RwLock::new(()),
                optimizing: AtomicBool::new(false),
                optimize_count: AtomicU64::new(0),
            }),
            optimizer: Mutex::new(None),
        })
    }

    pub fn region(&self) -> &str {
        &self.inner.region
    }

    pub fn store(&self) -> &RecordStore {
        &self.inner.store
    }

    pub fn index(&self) -> &RecordKeyIndex {
        &self.inner.index
    }

    pub fn stats(&self) -> RecordStoreStats {
        self.inner.store.stats()
    }

    /// Number of completed optimize runs
    pub fn optimize_count(&self) -> u64 {
        self.inner.optimize_count.load(Ordering::SeqCst)
    }

    /// Persist the key index now
    pub fn save_keys(&self) -> Result<usize> {
        let _guard = self.inner.io_lock.read();
        self.inner.index.save_keys()
    }

    /// Compact the data file now, blocking until done
    pub fn optimize(&self) -> Result<()> {
        self.inner.optimize()
    }

    /// Block until a background optimize (if any) finishes
    pub fn wait_for_optimize(&self) {
        let handle = self.optimizer.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Record disk cache {}: optimize thread panicked", self.inner.region);
            }
        }
    }

    /// Start a background optimize once enough records were freed
    fn maybe_schedule_optimize(&self, frees: u64) {
        let threshold = match self.inner.optimize_at_remove_count {
            Some(threshold) if frees >= threshold => threshold,
            _ => return,
        };

        if self.inner.optimizing.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!(
            "Record disk cache {}: {} frees reached threshold {}, optimizing",
            self.inner.region,
            frees,
            threshold
        );

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("optimize-{}", self.inner.region))
            .spawn(move || {
                if let Err(e) = inner.optimize() {
                    tracing::error!("Record disk cache {}: optimize failed: {}", inner.region, e);
                }
                inner.optimizing.store(false, Ordering::SeqCst);
            });

        match spawned {
            Ok(handle) => {
                let previous = self.optimizer.lock().replace(handle);
                if let Some(previous) = previous {
                    let _ = previous.join();
                }
            }
            Err(e) => {
                tracing::error!("Record disk cache {}: cannot spawn optimizer: {}", self.inner.region, e);
                self.inner.optimizing.store(false, Ordering::SeqCst);
            }
        }
    }
}

impl DiskStore for RecordDiskCache {
    fn write(&self, element: &CacheElement) -> Result<()> {
        let bytes = self.inner.serializer.serialize(element)?;
        if bytes.len() > self.inner.max_element_bytes {
            return Err(TierError::ElementTooLarge {
                size: bytes.len(),
                max: self.inner.max_element_bytes,
            });
        }

        let mut frees = 0;
        {
            let _guard = self.inner.io_lock.write();
            let desc = self.inner.store.append(&bytes)?;
            let outcome = self.inner.index.put(element.key.clone(), desc);

            if let Some(old) = outcome.replaced {
                frees = self.inner.release(old);
            }
            for (key, old) in outcome.evicted {
                tracing::debug!("Record disk cache {}: evicted {} from index", self.inner.region, key);
                frees = self.inner.release(old);
            }
        }

        self.maybe_schedule_optimize(frees);
        Ok(())
    }

    fn read(&self, key: &CacheKey) -> Result<Option<CacheElement>> {
        let _guard = self.inner.io_lock.read();
        let desc = match self.inner.index.get(key) {
            Some(desc) => desc,
            None => return Ok(None),
        };

        let bytes = match self.inner.store.read(desc) {
            Ok(bytes) => bytes,
            Err(TierError::Corruption(reason)) => {
                tracing::warn!(
                    "Record disk cache {}: treating {} as missing: {}",
                    self.inner.region,
                    key,
                    reason
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match self.inner.serializer.deserialize(&bytes) {
            Ok(element) if element.key == *key => Ok(Some(element)),
            Ok(element) => {
                // The space was reused by another key after the key file was saved
                tracing::warn!(
                    "Record disk cache {}: {} points at the record of {}, dropping stale entry",
                    self.inner.region,
                    key,
                    element.key
                );
                self.inner.index.remove(key);
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(
                    "Record disk cache {}: undecodable element {}: {}",
                    self.inner.region,
                    key,
                    e
                );
                Ok(None)
            }
        }
    }

    fn delete(&self, key: &CacheKey) -> Result<bool> {
        let frees = {
            let _guard = self.inner.io_lock.write();
            match self.inner.index.remove(key) {
                Some(desc) => self.inner.release(desc),
                None => return Ok(false),
            }
        };

        self.maybe_schedule_optimize(frees);
        Ok(true)
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.inner.index.contains(key)
    }

    fn delete_all(&self) -> Result<()> {
        self.wait_for_optimize();
        let _guard = self.inner.io_lock.write();
        self.inner.index.clear_memory_map();
        self.inner.index.delete_key_file()?;
        self.inner.store.reset()
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.inner.index.keys()
    }

    fn len(&self) -> usize {
        self.inner.index.len()
    }

    fn shutdown(&self) -> Result<()> {
        self.wait_for_optimize();

        let stats = self.inner.store.stats();
        if self.inner.optimize_on_shutdown && (stats.recycle_bin_len > 0 || stats.leaked_bytes > 0) {
            self.inner.optimize()?;
        }

        let _guard = self.inner.io_lock.write();
        let saved = self.inner.index.save_keys()?;
        self.inner.store.sync()?;
        tracing::info!(
            "Record disk cache {} shut down with {} keys",
            self.inner.region,
            saved
        );
        Ok(())
    }
}
