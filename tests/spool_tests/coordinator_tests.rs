//! Tests for SpoolCoordinator
//!
//! These tests verify:
//! - Read-your-writes from purgatory before the disk write lands
//! - Queued puts are deduplicated; a put during a write queues a new event
//! - Puts and removes reach the store in submission order
//! - Remove and remove_all mask stale disk copies
//! - Disk failures never reach the caller
//! - Dispose drains, honours its time limit and rejects further work
//! - A timed-out dispose drops queued events and re-saves after a late write

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;
use tierkv::record::RecordDiskCache;
use tierkv::serializer::BincodeSerializer;
use tierkv::spool::{PurgatoryState, SpoolCoordinator};
use tierkv::{
    AuxiliaryCache, CacheElement, CacheKey, CacheStatus, DiskConfig, DiskStore, ElementAttributes,
    Result, TierError,
};

// =============================================================================
// Test Store
// =============================================================================

/// Map-backed store whose writes and deletes can be held back by `gate`
#[derive(Default)]
struct GatedStore {
    data: Mutex<HashMap<CacheKey, CacheElement>>,
    gate: Mutex<()>,
    log: Mutex<Vec<String>>,
    shutdowns: AtomicUsize,
}

impl DiskStore for GatedStore {
    fn write(&self, element: &CacheElement) -> Result<()> {
        let _gate = self.gate.lock();
        if element.key.has_prefix("fail") {
            return Err(TierError::Storage("disk on fire".to_string()));
        }
        self.log.lock().push(format!(
            "put {}={}",
            element.key,
            String::from_utf8_lossy(&element.value)
        ));
        self.data.lock().insert(element.key.clone(), element.clone());
        Ok(())
    }

    fn read(&self, key: &CacheKey) -> Result<Option<CacheElement>> {
        Ok(self.data.lock().get(key).cloned())
    }

    fn delete(&self, key: &CacheKey) -> Result<bool> {
        let _gate = self.gate.lock();
        self.log.lock().push(format!("remove {}", key));
        Ok(self.data.lock().remove(key).is_some())
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.data.lock().contains_key(key)
    }

    fn delete_all(&self) -> Result<()> {
        let _gate = self.gate.lock();
        self.log.lock().push("remove_all".to_string());
        self.data.lock().clear();
        Ok(())
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.data.lock().keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

const FLUSH: Duration = Duration::from_secs(5);

fn setup() -> (Arc<GatedStore>, SpoolCoordinator<GatedStore>) {
    let store = Arc::new(GatedStore::default());
    let spool = SpoolCoordinator::new("spool", Arc::clone(&store), Duration::from_secs(5)).unwrap();
    (store, spool)
}

fn element(key: &str, value: &str) -> CacheElement {
    CacheElement::new("spool", key, value.as_bytes().to_vec())
}

fn value_of(found: Option<CacheElement>) -> Option<String> {
    found.map(|el| String::from_utf8(el.value.to_vec()).unwrap())
}

fn key(name: &str) -> CacheKey {
    CacheKey::name(name)
}

/// Poll until the worker has moved `key` into the writing state
fn wait_until_writing(spool: &SpoolCoordinator<GatedStore>, key: &CacheKey) {
    let deadline = Instant::now() + FLUSH;
    while Instant::now() < deadline {
        if let Some(PurgatoryState::Writing(_)) = spool.purgatory_state(key) {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("{} never reached the writing state", key);
}

// =============================================================================
// Purgatory Tests
// =============================================================================

#[test]
fn test_get_returns_in_flight_value() {
    let (store, spool) = setup();
    let gate = store.gate.lock();

    spool.update(element("k", "v1")).unwrap();
    assert_eq!(value_of(spool.get(&key("k")).unwrap()), Some("v1".to_string()));
    assert!(store.data.lock().is_empty());

    drop(gate);
    assert!(spool.flush(FLUSH));
    assert_eq!(value_of(store.read(&key("k")).unwrap()), Some("v1".to_string()));
    assert!(spool.purgatory_state(&key("k")).is_none());
    assert_eq!(spool.stats().purgatory_hits, 1);
}

#[test]
fn test_queued_puts_are_deduplicated() {
    let (store, spool) = setup();
    let gate = store.gate.lock();

    // Occupy the worker so "k" stays queued
    spool.update(element("blocker", "x")).unwrap();
    wait_until_writing(&spool, &key("blocker"));

    spool.update(element("k", "v1")).unwrap();
    spool.update(element("k", "v2")).unwrap();
    spool.update(element("k", "v3")).unwrap();
    assert!(matches!(spool.purgatory_state(&key("k")), Some(PurgatoryState::Queued(_))));

    drop(gate);
    assert!(spool.flush(FLUSH));

    let log = store.log.lock().clone();
    assert_eq!(log, vec!["put blocker=x".to_string(), "put k=v3".to_string()]);
    assert_eq!(spool.stats().deduplicated, 2);
}

#[test]
fn test_put_during_write_queues_new_event() {
    let (store, spool) = setup();
    let gate = store.gate.lock();

    spool.update(element("k", "v1")).unwrap();
    wait_until_writing(&spool, &key("k"));

    spool.update(element("k", "v2")).unwrap();
    assert_eq!(value_of(spool.get(&key("k")).unwrap()), Some("v2".to_string()));

    drop(gate);
    assert!(spool.flush(FLUSH));

    let log = store.log.lock().clone();
    assert_eq!(log, vec!["put k=v1".to_string(), "put k=v2".to_string()]);
    assert_eq!(value_of(spool.get(&key("k")).unwrap()), Some("v2".to_string()));
    assert!(spool.purgatory_state(&key("k")).is_none());
}

#[test]
fn test_non_spoolable_element_is_not_written() {
    let (store, spool) = setup();

    let attrs = ElementAttributes::default().with_spool(false);
    let el = CacheElement::with_attributes("spool", "local", b"only".to_vec(), &attrs);
    spool.update(el).unwrap();
    assert!(spool.flush(FLUSH));

    assert!(store.data.lock().is_empty());
    assert_eq!(spool.get(&key("local")).unwrap(), None);
}

// =============================================================================
// Ordering Tests
// =============================================================================

#[test]
fn test_two_rapid_puts_leave_latest_value() {
    let temp_dir = TempDir::new().unwrap();
    let disk = Arc::new(
        RecordDiskCache::open(temp_dir.path(), "ordered", &DiskConfig::record(), Arc::new(BincodeSerializer))
            .unwrap(),
    );
    let spool = SpoolCoordinator::new("ordered", Arc::clone(&disk), Duration::from_secs(5)).unwrap();

    for round in 0..200 {
        let k = key(&format!("k{}", round % 7));
        spool.update(CacheElement::new("ordered", k.clone(), format!("v1-{}", round))).unwrap();
        spool.update(CacheElement::new("ordered", k.clone(), format!("v2-{}", round))).unwrap();
        assert_eq!(value_of(spool.get(&k).unwrap()), Some(format!("v2-{}", round)));
    }
    assert!(spool.flush(FLUSH));

    for i in 0..7 {
        let last_round = (0..200).filter(|r| r % 7 == i).max().unwrap();
        let on_disk = disk.read(&key(&format!("k{}", i))).unwrap();
        assert_eq!(value_of(on_disk), Some(format!("v2-{}", last_round)));
    }
}

#[test]
fn test_events_apply_in_submission_order() {
    let (store, spool) = setup();
    let gate = store.gate.lock();

    // Hold the worker so every event below is queued before any runs
    spool.update(element("blocker", "x")).unwrap();
    wait_until_writing(&spool, &key("blocker"));

    spool.update(element("a", "1")).unwrap();
    spool.remove(&key("a")).unwrap();
    spool.update(element("a", "2")).unwrap();
    spool.update(element("b", "1")).unwrap();
    spool.remove_all().unwrap();
    spool.update(element("c", "1")).unwrap();

    drop(gate);
    assert!(spool.flush(FLUSH));

    // Superseded puts are skipped; removes always reach the store
    let log = store.log.lock().clone();
    assert_eq!(
        log,
        vec![
            "put blocker=x".to_string(),
            "remove a".to_string(),
            "remove_all".to_string(),
            "put c=1".to_string(),
        ]
    );
    assert_eq!(store.keys(), vec![key("c")]);
}

#[test]
fn test_sequential_put_remove_put() {
    let (store, spool) = setup();

    spool.update(element("a", "1")).unwrap();
    assert!(spool.flush(FLUSH));
    spool.remove(&key("a")).unwrap();
    assert!(spool.flush(FLUSH));
    spool.update(element("a", "2")).unwrap();
    assert!(spool.flush(FLUSH));

    let log = store.log.lock().clone();
    assert_eq!(
        log,
        vec!["put a=1".to_string(), "remove a".to_string(), "put a=2".to_string()]
    );
    assert_eq!(value_of(spool.get(&key("a")).unwrap()), Some("2".to_string()));
}

#[test]
fn test_concurrent_updates_all_land() {
    let (store, spool) = setup();
    let spool = Arc::new(spool);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let spool = Arc::clone(&spool);
            thread::spawn(move || {
                for i in 0..100 {
                    spool.update(element(&format!("t{}-{}", t, i), "v")).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(spool.flush(FLUSH));
    assert_eq!(store.len(), 400);
    assert_eq!(spool.purgatory_len(), 0);
}

// =============================================================================
// Remove Tests
// =============================================================================

#[test]
fn test_remove_masks_disk_copy_until_applied() {
    let (store, spool) = setup();

    spool.update(element("k", "on-disk")).unwrap();
    assert!(spool.flush(FLUSH));

    let gate = store.gate.lock();
    assert!(spool.remove(&key("k")).unwrap());

    // The store still holds it, but readers must not see it
    assert!(store.contains(&key("k")));
    assert_eq!(spool.get(&key("k")).unwrap(), None);
    assert!(!spool.key_set().unwrap().contains(&key("k")));
    assert_eq!(spool.purgatory_state(&key("k")), Some(PurgatoryState::Removed));

    drop(gate);
    assert!(spool.flush(FLUSH));
    assert!(!store.contains(&key("k")));
    assert!(spool.purgatory_state(&key("k")).is_none());
}

#[test]
fn test_remove_unknown_key() {
    let (_store, spool) = setup();
    assert!(!spool.remove(&key("never")).unwrap());
}

#[test]
fn test_remove_all_masks_disk_until_applied() {
    let (store, spool) = setup();

    spool.update(element("a", "1")).unwrap();
    spool.update(element("b", "2")).unwrap();
    assert!(spool.flush(FLUSH));

    let gate = store.gate.lock();
    spool.update(element("blocker", "x")).unwrap();
    wait_until_writing(&spool, &key("blocker"));

    spool.remove_all().unwrap();
    spool.update(element("c", "3")).unwrap();

    assert_eq!(spool.get(&key("a")).unwrap(), None);
    assert_eq!(value_of(spool.get(&key("c")).unwrap()), Some("3".to_string()));
    assert_eq!(spool.key_set().unwrap(), vec![key("c")]);

    drop(gate);
    assert!(spool.flush(FLUSH));
    assert_eq!(store.keys(), vec![key("c")]);
    assert_eq!(spool.get(&key("a")).unwrap(), None);
}

#[test]
fn test_key_set_merges_pending_and_disk() {
    let (store, spool) = setup();

    spool.update(element("disk", "1")).unwrap();
    assert!(spool.flush(FLUSH));

    let gate = store.gate.lock();
    spool.update(element("pending", "2")).unwrap();

    let mut keys = spool.key_set().unwrap();
    keys.sort();
    assert_eq!(keys, vec![key("disk"), key("pending")]);
    assert_eq!(spool.size(), 2);
    drop(gate);
}

// =============================================================================
// Failure Tests
// =============================================================================

#[test]
fn test_write_failure_is_swallowed() {
    let (store, spool) = setup();

    spool.update(element("fail-k", "v")).unwrap();
    spool.update(element("ok", "v")).unwrap();
    assert!(spool.flush(FLUSH));

    assert_eq!(spool.get(&key("fail-k")).unwrap(), None);
    assert!(store.contains(&key("ok")));

    let stats = spool.stats();
    assert_eq!(stats.write_failures, 1);
    assert_eq!(stats.writes, 1);
}

// =============================================================================
// Dispose Tests
// =============================================================================

#[test]
fn test_dispose_drains_queue_and_shuts_store() {
    let (store, spool) = setup();

    for i in 0..50 {
        spool.update(element(&format!("k{}", i), "v")).unwrap();
    }
    spool.dispose().unwrap();

    assert_eq!(store.len(), 50);
    assert_eq!(store.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(spool.status(), CacheStatus::Disposed);
}

#[test]
fn test_disposed_spool_rejects_work() {
    let (store, spool) = setup();
    spool.dispose().unwrap();

    spool.update(element("late", "v")).unwrap();
    assert!(!spool.remove(&key("late")).unwrap());
    assert_eq!(spool.get(&key("late")).unwrap(), None);
    assert!(!spool.flush(Duration::from_millis(50)));
    assert!(store.data.lock().is_empty());

    // Second dispose is a no-op
    spool.dispose().unwrap();
    assert_eq!(store.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dispose_respects_time_limit() {
    let store = Arc::new(GatedStore::default());
    let spool = SpoolCoordinator::new("slow", Arc::clone(&store), Duration::from_millis(100)).unwrap();

    let gate = store.gate.lock();
    spool.update(element("stuck", "v")).unwrap();
    wait_until_writing(&spool, &key("stuck"));

    let started = Instant::now();
    spool.dispose().unwrap();
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(store.shutdowns.load(Ordering::SeqCst), 1);

    drop(gate);
}

#[test]
fn test_timed_out_dispose_drops_queued_and_resaves_late_write() {
    let store = Arc::new(GatedStore::default());
    let spool = SpoolCoordinator::new("slow", Arc::clone(&store), Duration::from_millis(100)).unwrap();

    let gate = store.gate.lock();
    spool.update(element("stuck", "v")).unwrap();
    wait_until_writing(&spool, &key("stuck"));
    spool.update(element("queued", "v")).unwrap();

    spool.dispose().unwrap();
    assert_eq!(store.shutdowns.load(Ordering::SeqCst), 1);

    // The in-flight write lands after the save, so the store is saved again
    drop(gate);
    let deadline = Instant::now() + FLUSH;
    while Instant::now() < deadline
        && (store.shutdowns.load(Ordering::SeqCst) < 2 || spool.stats().abandoned < 1)
    {
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(store.shutdowns.load(Ordering::SeqCst), 2);
    assert_eq!(spool.stats().abandoned, 1);
    assert!(store.data.lock().contains_key(&key("stuck")));
    assert!(!store.data.lock().contains_key(&key("queued")));
}
