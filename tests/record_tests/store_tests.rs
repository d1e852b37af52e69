//! Tests for RecordStore
//!
//! These tests verify:
//! - Append/read round-trip (empty, large, UTF-8)
//! - Best-fit reuse of freed ranges without clobbering neighbours
//! - Checksum and bounds failures read as corruption
//! - Compaction leaves exactly the live records
//! - A failed compaction still reports the records it moved
//! - Recycle bin rebuild from gaps

use std::fs::OpenOptions;
use std::path::PathBuf;

use tempfile::TempDir;
use tierkv::record::{FreeRange, RecordDescriptor, RecordStore, RECORD_HEADER_SIZE};
use tierkv::{CacheKey, TierError};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_store(max_recycle_bin_size: usize) -> (TempDir, PathBuf, RecordStore) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("records.data");
    let store = RecordStore::open(&path, max_recycle_bin_size).unwrap();
    (temp_dir, path, store)
}

fn payload(len: usize, fill: u8) -> Vec<u8> {
    vec![fill; len]
}

// =============================================================================
// Round-trip Tests
// =============================================================================

#[test]
fn test_append_and_read() {
    let (_temp, _path, store) = setup_temp_store(10);

    let desc = store.append(b"record one").unwrap();
    assert_eq!(desc.pos, 0);
    assert_eq!(desc.len, 10);
    assert_eq!(store.read(desc).unwrap(), b"record one");
    assert_eq!(store.file_len(), RECORD_HEADER_SIZE + 10);
}

#[test]
fn test_empty_record() {
    let (_temp, _path, store) = setup_temp_store(10);

    let desc = store.append(b"").unwrap();
    assert_eq!(desc.span(), RECORD_HEADER_SIZE);
    assert!(store.read(desc).unwrap().is_empty());
}

#[test]
fn test_large_and_utf8_records() {
    let (_temp, _path, store) = setup_temp_store(10);

    let big: Vec<u8> = (0..1_000_000u32).map(|i| (i % 253) as u8).collect();
    let text = "κόσμε — 日本語 — 𝄞";

    let big_desc = store.append(&big).unwrap();
    let text_desc = store.append(text.as_bytes()).unwrap();

    assert_eq!(store.read(big_desc).unwrap(), big);
    assert_eq!(String::from_utf8(store.read(text_desc).unwrap()).unwrap(), text);
}

#[test]
fn test_write_length_mismatch_is_rejected() {
    let (_temp, _path, store) = setup_temp_store(10);

    let desc = store.allocate(5);
    let result = store.write(desc, b"too many bytes");
    assert!(matches!(result, Err(TierError::Storage(_))));
}

// =============================================================================
// Reuse Tests
// =============================================================================

#[test]
fn test_best_fit_picks_smallest_sufficient_range() {
    let (_temp, _path, store) = setup_temp_store(10);

    let small = store.append(&payload(10, 1)).unwrap();
    let _keep1 = store.append(&payload(1, 0)).unwrap();
    let large = store.append(&payload(100, 2)).unwrap();
    let _keep2 = store.append(&payload(1, 0)).unwrap();
    let medium = store.append(&payload(40, 3)).unwrap();
    let _keep3 = store.append(&payload(1, 0)).unwrap();

    store.free(small);
    store.free(large);
    store.free(medium);

    let reused = store.append(&payload(30, 9)).unwrap();
    assert_eq!(reused.pos, medium.pos);
}

#[test]
fn test_no_fit_appends_at_end() {
    let (_temp, _path, store) = setup_temp_store(10);

    let small = store.append(&payload(10, 1)).unwrap();
    let _tail = store.append(&payload(5, 0)).unwrap();
    let end = store.file_len();

    store.free(small);
    let big = store.append(&payload(50, 2)).unwrap();
    assert_eq!(big.pos, end);
}

#[test]
fn test_split_remainder_returns_to_bin() {
    let (_temp, _path, store) = setup_temp_store(10);

    let big = store.append(&payload(100, 1)).unwrap();
    let _tail = store.append(&payload(1, 0)).unwrap();
    store.free(big);

    let small = store.append(&payload(20, 2)).unwrap();
    assert_eq!(small.pos, big.pos);

    let ranges = store.recycle_bin_ranges();
    assert_eq!(
        ranges,
        vec![FreeRange {
            pos: small.end(),
            size: big.span() - small.span(),
        }]
    );
}

#[test]
fn test_reuse_never_clobbers_larger_neighbours() {
    let (_temp, _path, store) = setup_temp_store(100);

    // Strictly increasing sizes
    let mut live: Vec<(RecordDescriptor, Vec<u8>)> = (1..=8)
        .map(|i| {
            let bytes = payload(i * 25, i as u8);
            (store.append(&bytes).unwrap(), bytes)
        })
        .collect();

    // Remove a middle one, then insert something the same size and smaller
    let (middle, _) = live.remove(3);
    store.free(middle);

    let same = payload(middle.len as usize, 0xEE);
    let smaller = payload(10, 0xDD);
    live.push((store.append(&same).unwrap(), same));
    live.push((store.append(&smaller).unwrap(), smaller));

    for (desc, bytes) in &live {
        assert_eq!(&store.read(*desc).unwrap(), bytes);
    }
}

#[test]
fn test_adjacent_frees_coalesce() {
    let (_temp, _path, store) = setup_temp_store(10);

    let a = store.append(&payload(10, 1)).unwrap();
    let b = store.append(&payload(10, 2)).unwrap();
    let c = store.append(&payload(10, 3)).unwrap();
    let _d = store.append(&payload(10, 4)).unwrap();

    store.free(a);
    store.free(c);
    store.free(b);

    assert_eq!(
        store.recycle_bin_ranges(),
        vec![FreeRange {
            pos: a.pos,
            size: a.span() + b.span() + c.span(),
        }]
    );
}

// =============================================================================
// Recycle Bin Bound Tests
// =============================================================================

#[test]
fn test_recycle_bin_never_exceeds_capacity() {
    let (_temp, _path, store) = setup_temp_store(3);

    // Alternate live/freed so ranges cannot coalesce
    let descs: Vec<RecordDescriptor> = (0..20).map(|_| store.append(&payload(16, 7)).unwrap()).collect();
    for desc in descs.iter().step_by(2) {
        store.free(*desc);
        assert!(store.recycle_bin_len() <= 3);
    }

    let stats = store.stats();
    assert_eq!(stats.recycle_bin_len, 3);
    assert_eq!(stats.leaked_bytes, 7 * descs[0].span());
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_read_past_end_is_corruption() {
    let (_temp, _path, store) = setup_temp_store(10);
    store.append(b"abc").unwrap();

    let bogus = RecordDescriptor { pos: 1000, len: 3 };
    assert!(matches!(store.read(bogus), Err(TierError::Corruption(_))));
}

#[test]
fn test_read_wrong_length_is_corruption() {
    let (_temp, _path, store) = setup_temp_store(10);
    let desc = store.append(b"abcdef").unwrap();

    let shorter = RecordDescriptor { pos: desc.pos, len: 3 };
    assert!(matches!(store.read(shorter), Err(TierError::Corruption(_))));
}

#[test]
fn test_overwritten_bytes_fail_checksum() {
    let (_temp, path, store) = setup_temp_store(10);
    let desc = store.append(b"checksummed payload").unwrap();
    store.sync().unwrap();

    let mut bytes = std::fs::read(&path).unwrap();
    bytes[(RECORD_HEADER_SIZE + 2) as usize] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();

    assert!(matches!(store.read(desc), Err(TierError::Corruption(_))));
}

// =============================================================================
// Compaction Tests
// =============================================================================

#[test]
fn test_compact_packs_live_records() {
    let (_temp, path, store) = setup_temp_store(100);

    let mut live = Vec::new();
    for i in 0..30u32 {
        let bytes = payload(10 + i as usize * 3, i as u8);
        let desc = store.append(&bytes).unwrap();
        if i % 3 == 0 {
            store.free(desc);
        } else {
            live.push((CacheKey::name(format!("k{}", i)), desc, bytes));
        }
    }

    let compaction = store.compact(live.iter().map(|(k, d, _)| (k.clone(), *d)).collect());
    assert!(compaction.error.is_none());
    let moved = compaction.moved;

    let expected: u64 = live.iter().map(|(_, d, _)| d.span()).sum();
    assert_eq!(store.file_len(), expected);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);
    assert_eq!(store.recycle_bin_len(), 0);

    for ((key, _, bytes), (moved_key, desc)) in live.iter().zip(&moved) {
        assert_eq!(key, moved_key);
        assert_eq!(&store.read(*desc).unwrap(), bytes);
    }
}

#[test]
fn test_failed_compaction_reports_completed_moves() {
    let (_temp, path, store) = setup_temp_store(10);

    let a = store.append(&payload(10, 1)).unwrap();
    let b = store.append(&payload(10, 2)).unwrap();
    let c = store.append(&payload(10, 3)).unwrap();
    let d = store.append(&payload(10, 4)).unwrap();
    store.free(b);
    store.sync().unwrap();
    let len_before = store.file_len();

    // Cut the file inside "d" so moving it fails after "c" has moved
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(d.pos + 4).unwrap();
    drop(file);

    let compaction = store.compact(vec![
        (CacheKey::name("a"), a),
        (CacheKey::name("c"), c),
        (CacheKey::name("d"), d),
    ]);
    assert!(compaction.error.is_some());

    let c_moved = RecordDescriptor { pos: b.pos, len: c.len };
    assert_eq!(
        compaction.moved,
        vec![(CacheKey::name("a"), a), (CacheKey::name("c"), c_moved)]
    );
    assert_eq!(store.read(a).unwrap(), payload(10, 1));
    assert_eq!(store.read(c_moved).unwrap(), payload(10, 3));

    // Nothing is truncated after a failed pass
    assert_eq!(store.file_len(), len_before);
}

#[test]
fn test_rebuild_recycle_bin_from_gaps() {
    let (_temp, _path, store) = setup_temp_store(10);

    let a = store.append(&payload(10, 1)).unwrap();
    let b = store.append(&payload(10, 2)).unwrap();
    let c = store.append(&payload(10, 3)).unwrap();
    let d = store.append(&payload(10, 4)).unwrap();

    store.rebuild_recycle_bin(&[a, c]);

    assert_eq!(
        store.recycle_bin_ranges(),
        vec![
            FreeRange { pos: b.pos, size: b.span() },
            FreeRange { pos: d.pos, size: d.span() },
        ]
    );
}

#[test]
fn test_reset_empties_store() {
    let (_temp, _path, store) = setup_temp_store(10);
    let a = store.append(&payload(10, 1)).unwrap();
    store.append(&payload(10, 1)).unwrap();
    store.free(a);

    store.reset().unwrap();
    assert_eq!(store.file_len(), 0);
    assert_eq!(store.recycle_bin_len(), 0);
}
