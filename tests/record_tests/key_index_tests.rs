//! Tests for RecordKeyIndex
//!
//! These tests verify:
//! - save_keys / clear_memory_map / load_keys restart recovery
//! - Entries past the end of the data file are dropped
//! - Overlap detection
//! - Relocation keeps insertion order

use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;
use tierkv::index::LoadOutcome;
use tierkv::record::{RecordDescriptor, RecordKeyIndex, RecordStore};
use tierkv::{CacheKey, DiskLimit};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_dir() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().to_path_buf();
    (temp_dir, path)
}

fn desc(pos: u64, len: u32) -> RecordDescriptor {
    RecordDescriptor { pos, len }
}

// =============================================================================
// Restart Recovery
// =============================================================================

#[test]
fn test_restart_recovery_with_many_keys() {
    let (_temp, dir) = setup_temp_dir();
    let store = RecordStore::open(&dir.join("r.data"), 100).unwrap();
    let index = RecordKeyIndex::new(dir.join("r.key"), None);

    for i in 0..1500usize {
        let bytes = vec![(i % 256) as u8; (i * 37) % 900];
        let d = store.append(&bytes).unwrap();
        index.put(CacheKey::name(format!("{}:key", i)), d);
    }

    let before = index.entries();
    let size_before = index.len();

    index.save_keys().unwrap();
    index.clear_memory_map();
    assert_eq!(index.len(), 0);

    assert_eq!(index.load_keys(), LoadOutcome::Loaded(size_before));
    assert_eq!(index.len(), size_before);
    for (key, d) in &before {
        assert_eq!(index.get(key), Some(*d));
        let bytes = store.read(*d).unwrap();
        assert_eq!(bytes.len(), d.len as usize);
    }
}

#[test]
fn test_clear_memory_map_keeps_key_file() {
    let (_temp, dir) = setup_temp_dir();
    let path = dir.join("r.key");
    let index = RecordKeyIndex::new(&path, None);
    index.put(CacheKey::name("a"), desc(0, 4));
    index.save_keys().unwrap();

    index.clear_memory_map();
    assert!(path.exists());
}

#[test]
fn test_truncated_key_file_loads_empty() {
    let (_temp, dir) = setup_temp_dir();
    let path = dir.join("r.key");
    let index = RecordKeyIndex::new(&path, None);
    for i in 0..50u64 {
        index.put(CacheKey::name(format!("k{}", i)), desc(i * 20, 12));
    }
    index.save_keys().unwrap();

    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 7]).unwrap();

    assert!(matches!(index.load_keys(), LoadOutcome::Corrupt(_)));
    assert!(index.is_empty());
}

#[test]
fn test_delete_key_file() {
    let (_temp, dir) = setup_temp_dir();
    let path = dir.join("r.key");
    let index = RecordKeyIndex::new(&path, None);
    index.save_keys().unwrap();
    assert!(path.exists());

    index.delete_key_file().unwrap();
    assert!(!path.exists());
    // Deleting twice is fine
    index.delete_key_file().unwrap();
}

// =============================================================================
// Consistency Checks
// =============================================================================

#[test]
fn test_drop_past_end() {
    let (_temp, dir) = setup_temp_dir();
    let index = RecordKeyIndex::new(dir.join("r.key"), None);

    index.put(CacheKey::name("inside"), desc(0, 10)); // ends at 18
    index.put(CacheKey::name("edge"), desc(18, 2)); // ends at 28
    index.put(CacheKey::name("outside"), desc(28, 10)); // ends at 46

    assert_eq!(index.drop_past_end(30), 1);
    assert!(index.contains(&CacheKey::name("edge")));
    assert!(!index.contains(&CacheKey::name("outside")));
}

#[test]
fn test_has_overlaps() {
    let (_temp, dir) = setup_temp_dir();
    let index = RecordKeyIndex::new(dir.join("r.key"), None);

    index.put(CacheKey::name("a"), desc(0, 10));
    index.put(CacheKey::name("b"), desc(18, 10));
    assert!(!index.has_overlaps());

    index.put(CacheKey::name("c"), desc(20, 4));
    assert!(index.has_overlaps());
}

#[test]
fn test_relocate_preserves_order_and_footprint() {
    let (_temp, dir) = setup_temp_dir();
    let index = RecordKeyIndex::new(dir.join("r.key"), Some(DiskLimit::Count(10)));

    index.put(CacheKey::name("a"), desc(100, 10));
    index.put(CacheKey::name("b"), desc(200, 10));
    let footprint = index.footprint();

    index.relocate(&[
        (CacheKey::name("b"), desc(18, 10)),
        (CacheKey::name("a"), desc(0, 10)),
        (CacheKey::name("gone"), desc(36, 1)),
    ]);

    assert_eq!(index.keys(), vec![CacheKey::name("a"), CacheKey::name("b")]);
    assert_eq!(index.get(&CacheKey::name("a")), Some(desc(0, 10)));
    assert_eq!(index.get(&CacheKey::name("b")), Some(desc(18, 10)));
    assert_eq!(index.footprint(), footprint);
}
