//! Spool Coordinator
//!
//! Makes a [`DiskStore`] asynchronous: callers stage work in purgatory and
//! return immediately; the region worker applies it in order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::auxiliary::{AuxiliaryCache, AuxiliaryKind, CacheStatus, DiskStore};
use crate::element::{CacheElement, CacheKey};
use crate::error::Result;

use super::event_queue::{EventQueue, QueueStatus, SpoolEvent, SpoolListener};
use super::purgatory::{Lookup, Purgatory, PurgatoryState};

/// Snapshot of spool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpoolStats {
    /// Put events enqueued
    pub puts: u64,
    /// Puts folded into an already queued event
    pub deduplicated: u64,
    /// Successful physical writes
    pub writes: u64,
    /// Physical writes that failed (element dropped from this tier)
    pub write_failures: u64,
    /// Gets answered from purgatory
    pub purgatory_hits: u64,
    /// Remove events enqueued
    pub removes: u64,
    /// Events dropped because shutdown gave up waiting for them
    pub abandoned: u64,
}

#[derive(Default)]
struct SpoolCounters {
    puts: AtomicU64,
    deduplicated: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
    purgatory_hits: AtomicU64,
    removes: AtomicU64,
    abandoned: AtomicU64,
}

/// State shared with the worker thread
struct SpoolInner<S> {
    region: String,
    store: Arc<S>,
    purgatory: Mutex<Purgatory>,
    counters: SpoolCounters,
    /// Set once shutdown stopped waiting; the store is already saved
    abandoned: AtomicBool,
}

impl<S: DiskStore + 'static> SpoolListener for SpoolInner<S> {
    fn handle(&self, event: SpoolEvent) {
        if self.abandoned.load(Ordering::SeqCst) {
            match event {
                SpoolEvent::Barrier(ack) => {
                    let _ = ack.send(());
                }
                _ => {
                    self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                }
            }
            return;
        }

        if !self.apply(event) {
            return;
        }

        // Shutdown saved the store while this event was in flight
        if self.abandoned.load(Ordering::SeqCst) {
            tracing::info!("Spool {}: re-saving store after late event", self.region);
            if let Err(e) = self.store.shutdown() {
                tracing::error!("Spool {}: re-save after late event failed: {}", self.region, e);
            }
        }
    }
}

impl<S: DiskStore + 'static> SpoolInner<S> {
    /// Apply one event; returns whether the store was touched
    fn apply(&self, event: SpoolEvent) -> bool {
        match event {
            SpoolEvent::Put { key, seq } => {
                let element = match self.purgatory.lock().begin_write(&key, seq) {
                    Some(element) => element,
                    None => return false,
                };

                match self.store.write(&element) {
                    Ok(()) => {
                        self.counters.writes.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!("Spool {}: failed to write {}: {}", self.region, key, e);
                    }
                }

                self.purgatory.lock().finish_write(&key, seq);
                true
            }
            SpoolEvent::Remove { key, seq } => {
                if let Err(e) = self.store.delete(&key) {
                    tracing::error!("Spool {}: failed to remove {}: {}", self.region, key, e);
                }
                self.purgatory.lock().finish_remove(&key, seq);
                true
            }
            SpoolEvent::RemoveAll { seq } => {
                if let Err(e) = self.store.delete_all() {
                    tracing::error!("Spool {}: failed to remove all: {}", self.region, e);
                }
                self.purgatory.lock().finish_remove_all(seq);
                true
            }
            SpoolEvent::Barrier(ack) => {
                let _ = ack.send(());
                false
            }
        }
    }
}

/// Purgatory + ordered event queue in front of a disk store
///
/// ## Guarantees
/// - At most one queued write per key; later puts replace its payload
/// - Writes and removes for a region are applied in submission order
/// - `get` sees staged values before they reach disk and never sees a
///   value removed after it was written
/// - Disk failures are logged and read as misses; they never reach callers
pub struct SpoolCoordinator<S> {
    inner: Arc<SpoolInner<S>>,
    queue: EventQueue,
    alive: AtomicBool,
    shutdown_spool_time_limit: Duration,
}

impl<S: DiskStore + 'static> SpoolCoordinator<S> {
    /// Start the worker for `region` over `store`
    pub fn new(region: &str, store: Arc<S>, shutdown_spool_time_limit: Duration) -> Result<Self> {
        let inner = Arc::new(SpoolInner {
            region: region.to_string(),
            store,
            purgatory: Mutex::new(Purgatory::new()),
            counters: SpoolCounters::default(),
            abandoned: AtomicBool::new(false),
        });

        let listener: Arc<dyn SpoolListener> = inner.clone();
        let queue = EventQueue::start(region, listener)?;

        Ok(Self {
            inner,
            queue,
            alive: AtomicBool::new(true),
            shutdown_spool_time_limit,
        })
    }

    /// The wrapped physical store
    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// Wait until everything staged so far has reached the store
    pub fn flush(&self, timeout: Duration) -> bool {
        self.queue.flush(timeout)
    }

    /// Events accepted but not yet applied
    pub fn pending_events(&self) -> usize {
        self.queue.pending()
    }

    /// Number of purgatory entries (tombstones included)
    pub fn purgatory_len(&self) -> usize {
        self.inner.purgatory.lock().len()
    }

    /// Current purgatory state of `key`
    pub fn purgatory_state(&self, key: &CacheKey) -> Option<PurgatoryState> {
        self.inner.purgatory.lock().state(key).cloned()
    }

    pub fn stats(&self) -> SpoolStats {
        let c = &self.inner.counters;
        SpoolStats {
            puts: c.puts.load(Ordering::Relaxed),
            deduplicated: c.deduplicated.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            write_failures: c.write_failures.load(Ordering::Relaxed),
            purgatory_hits: c.purgatory_hits.load(Ordering::Relaxed),
            removes: c.removes.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Enqueue while the purgatory lock is held so event order matches
    /// staging order
    fn enqueue(&self, event: SpoolEvent) {
        if self.queue.enqueue(event) == QueueStatus::Destroyed {
            tracing::debug!("Spool {}: queue destroyed, event dropped", self.inner.region);
        }
    }
}

impl<S: DiskStore + 'static> AuxiliaryCache for SpoolCoordinator<S> {
    fn region(&self) -> &str {
        &self.inner.region
    }

    fn kind(&self) -> AuxiliaryKind {
        AuxiliaryKind::Disk
    }

    fn status(&self) -> CacheStatus {
        if self.is_alive() {
            CacheStatus::Alive
        } else {
            CacheStatus::Disposed
        }
    }

    fn update(&self, element: CacheElement) -> Result<()> {
        let key = element.key.clone();
        let mut purgatory = self.inner.purgatory.lock();
        if !self.is_alive() {
            tracing::debug!("Spool {}: disposed, not spooling {}", self.inner.region, key);
            return Ok(());
        }

        match purgatory.stage_update(element) {
            Some(seq) => {
                self.inner.counters.puts.fetch_add(1, Ordering::Relaxed);
                self.enqueue(SpoolEvent::Put { key, seq });
            }
            None => {
                self.inner.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CacheElement>> {
        if !self.is_alive() {
            return Ok(None);
        }

        match self.inner.purgatory.lock().lookup(key) {
            Lookup::Hit(element) => {
                self.inner.counters.purgatory_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(element));
            }
            Lookup::Removed => return Ok(None),
            Lookup::Miss => {}
        }

        match self.inner.store.read(key) {
            Ok(found) => Ok(found),
            Err(e) => {
                tracing::error!("Spool {}: read of {} failed: {}", self.inner.region, key, e);
                Ok(None)
            }
        }
    }

    fn remove(&self, key: &CacheKey) -> Result<bool> {
        let mut purgatory = self.inner.purgatory.lock();
        if !self.is_alive() {
            return Ok(false);
        }

        let known = match purgatory.lookup(key) {
            Lookup::Hit(_) => true,
            Lookup::Removed => false,
            Lookup::Miss => self.inner.store.contains(key),
        };

        let seq = purgatory.stage_remove(key);
        self.inner.counters.removes.fetch_add(1, Ordering::Relaxed);
        self.enqueue(SpoolEvent::Remove {
            key: key.clone(),
            seq,
        });
        Ok(known)
    }

    fn remove_all(&self) -> Result<()> {
        let mut purgatory = self.inner.purgatory.lock();
        if !self.is_alive() {
            return Ok(());
        }

        let seq = purgatory.stage_remove_all();
        self.enqueue(SpoolEvent::RemoveAll { seq });
        Ok(())
    }

    fn key_set(&self) -> Result<Vec<CacheKey>> {
        let purgatory = self.inner.purgatory.lock();
        let mut keys = purgatory.pending_keys();
        if purgatory.is_clearing() {
            return Ok(keys);
        }

        let removed = purgatory.removed_keys();
        let mut seen: HashSet<CacheKey> = keys.iter().cloned().collect();
        for key in self.inner.store.keys() {
            if !removed.contains(&key) && seen.insert(key.clone()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn size(&self) -> usize {
        self.key_set().map(|keys| keys.len()).unwrap_or(0)
    }

    fn dispose(&self) -> Result<()> {
        {
            let _purgatory = self.inner.purgatory.lock();
            if !self.alive.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
        }

        tracing::info!(
            "Spool {}: disposing with {} queued events",
            self.inner.region,
            self.queue.pending()
        );

        if !self.queue.destroy(self.shutdown_spool_time_limit) {
            // Flag before saving so the worker re-saves after an in-flight event
            self.inner.abandoned.store(true, Ordering::SeqCst);
            tracing::warn!(
                "Spool {}: shutdown time limit reached, dropping {} queued events",
                self.inner.region,
                self.queue.pending()
            );
        }

        self.inner.store.shutdown()
    }
}
