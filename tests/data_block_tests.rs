//! Tests for DataBlock
//!
//! These tests verify:
//! - Sorted insertion and point lookups
//! - In-place overwrite versus replacement
//! - Version retention under active snapshots
//! - Tombstones and physical removal
//! - Compaction (including idempotence)
//! - Split and merge at key boundaries
//! - External value and key+value allocations

use std::collections::BTreeSet;

use sortedkv::block::{DataBlock, DeleteStatus, PutStatus};
use sortedkv::record::{AllocClass, RECORD_OVERHEAD};
use sortedkv::{Config, EngineContext, LATEST};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_context() -> EngineContext {
    EngineContext::new(Config::default()).unwrap()
}

fn key(i: usize) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

fn put(ctx: &EngineContext, block: &mut DataBlock, key: &[u8], value: &[u8]) -> PutStatus {
    block
        .put(ctx, key, value, ctx.versions().current(), 0)
        .unwrap()
}

fn delete(ctx: &EngineContext, block: &mut DataBlock, key: &[u8]) -> DeleteStatus {
    block.delete(ctx, key, ctx.versions().current()).unwrap()
}

fn block_with_keys(ctx: &EngineContext, count: usize) -> DataBlock {
    let mut block = DataBlock::new(ctx).unwrap();
    for i in 0..count {
        assert_eq!(put(ctx, &mut block, &key(i), &[b'v'; 32]), PutStatus::Inserted);
    }
    block
}

fn keys_of(block: &DataBlock) -> Vec<Vec<u8>> {
    block.records().map(|r| r.key().to_vec()).collect()
}

/// (key, seq, is_delete, value) of every record version
fn snapshot_of(block: &DataBlock) -> Vec<(Vec<u8>, u64, bool, Vec<u8>)> {
    block
        .records()
        .map(|r| (r.key().to_vec(), r.seq_id(), r.is_delete(), r.value().to_vec()))
        .collect()
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_new_block_is_empty() {
    let ctx = setup_context();
    let block = DataBlock::new(&ctx).unwrap();

    assert!(block.is_empty());
    assert_eq!(block.record_count(), 0);
    assert_eq!(block.data_size(), 0);
    assert_eq!(block.capacity(), ctx.data_ladder().smallest());
    assert_eq!(block.first_key(), None);
    assert_eq!(block.last_key(), None);
}

#[test]
fn test_put_and_get() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    assert_eq!(put(&ctx, &mut block, b"apple", b"red"), PutStatus::Inserted);

    let record = block.get(b"apple", LATEST).unwrap();
    assert_eq!(record.value(), b"red");
    assert_eq!(record.class(), AllocClass::Embedded);
    assert!(block.get(b"pear", LATEST).is_none());
}

#[test]
fn test_records_kept_in_key_order() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    for k in [&b"m"[..], b"c", b"x", b"a", b"q"] {
        put(&ctx, &mut block, k, b"v");
    }

    let keys = keys_of(&block);
    assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec(), b"m".to_vec(), b"q".to_vec(), b"x".to_vec()]);
    assert_eq!(block.first_key(), Some(&b"a"[..]));
    assert_eq!(block.last_key(), Some(&b"x"[..]));
}

#[test]
fn test_same_size_update_overwrites_in_place() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    put(&ctx, &mut block, b"k", b"one");
    let size = block.data_size();
    assert_eq!(put(&ctx, &mut block, b"k", b"two"), PutStatus::Updated);

    assert_eq!(block.record_count(), 1);
    assert_eq!(block.data_size(), size);
    assert_eq!(block.get(b"k", LATEST).unwrap().value(), b"two");
}

#[test]
fn test_resized_update_replaces_record() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    put(&ctx, &mut block, b"k", b"short");
    assert_eq!(put(&ctx, &mut block, b"k", b"a much longer value"), PutStatus::Updated);

    assert_eq!(block.record_count(), 1);
    assert_eq!(block.data_size(), RECORD_OVERHEAD + 1 + 19);
    assert_eq!(block.get(b"k", LATEST).unwrap().value(), b"a much longer value");
}

#[test]
fn test_block_grows_until_no_room() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();
    let record_len = RECORD_OVERHEAD + 8 + 32;

    let mut inserted = 0;
    loop {
        match put(&ctx, &mut block, &format!("key{:05}", inserted).into_bytes(), &[7u8; 32]) {
            PutStatus::Inserted => inserted += 1,
            PutStatus::NoRoom => break,
            PutStatus::Updated => panic!("distinct keys never update"),
        }
    }

    assert_eq!(inserted, ctx.config().max_data_block_size / record_len);
    assert_eq!(block.capacity(), ctx.config().max_data_block_size);
    assert_eq!(block.record_count(), inserted);
}

#[test]
fn test_expire_get_and_set() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    block.put(&ctx, b"k", b"v", ctx.versions().current(), 1234).unwrap();
    assert_eq!(block.get_expire(b"k"), Some(1234));

    assert!(block.set_expire(b"k", 99));
    assert_eq!(block.get_expire(b"k"), Some(99));
    assert!(!block.set_expire(b"missing", 5));
    assert_eq!(block.get_expire(b"missing"), None);
}

// =============================================================================
// Delete Tests
// =============================================================================

#[test]
fn test_delete_without_snapshot_removes_run() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    put(&ctx, &mut block, b"a", b"1");
    put(&ctx, &mut block, b"b", b"2");
    assert_eq!(delete(&ctx, &mut block, b"a"), DeleteStatus::Removed);

    assert_eq!(block.record_count(), 1);
    assert!(block.get(b"a", LATEST).is_none());
    assert_eq!(block.get(b"b", LATEST).unwrap().value(), b"2");
}

#[test]
fn test_delete_missing_key() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    assert_eq!(delete(&ctx, &mut block, b"nope"), DeleteStatus::NotFound);
}

#[test]
fn test_delete_under_snapshot_writes_tombstone() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    put(&ctx, &mut block, b"x", b"1");
    let snap = ctx.versions().create_snapshot();
    assert_eq!(delete(&ctx, &mut block, b"x"), DeleteStatus::Tombstoned);

    assert_eq!(block.record_count(), 2);
    assert!(block.get(b"x", LATEST).is_none());
    assert_eq!(block.get(b"x", snap).unwrap().value(), b"1");
    assert_eq!(block.get_expire(b"x"), None);

    // a tombstoned key is no longer live
    assert_eq!(delete(&ctx, &mut block, b"x"), DeleteStatus::NotFound);
    ctx.versions().release_snapshot(snap);
}

#[test]
fn test_delete_keys_in_range() {
    let ctx = setup_context();
    let mut block = block_with_keys(&ctx, 10);

    let (deleted, stuck) = block
        .delete_keys_in(&ctx, &key(2), &key(6), ctx.versions().current())
        .unwrap();

    assert_eq!(deleted, 4);
    assert!(stuck.is_none());
    assert_eq!(block.record_count(), 6);
    assert!(block.get(&key(2), LATEST).is_none());
    assert!(block.get(&key(5), LATEST).is_none());
    assert!(block.get(&key(6), LATEST).is_some());
}

// =============================================================================
// Version Retention Tests
// =============================================================================

#[test]
fn test_update_under_snapshot_keeps_old_version() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    put(&ctx, &mut block, b"k", b"v1");
    let snap = ctx.versions().create_snapshot();
    assert_eq!(put(&ctx, &mut block, b"k", b"v2"), PutStatus::Updated);

    assert_eq!(block.record_count(), 2);
    assert_eq!(block.stale_count(), 1);
    assert_eq!(block.get(b"k", snap).unwrap().value(), b"v1");
    assert_eq!(block.get(b"k", LATEST).unwrap().value(), b"v2");

    // newest version comes first within the run
    let seqs: Vec<u64> = block.records().map(|r| r.seq_id()).collect();
    assert!(seqs[0] > seqs[1]);
    ctx.versions().release_snapshot(snap);
}

#[test]
fn test_update_without_snapshot_keeps_single_version() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    for i in 0..20 {
        put(&ctx, &mut block, b"k", format!("value-{}", i).as_bytes());
    }

    assert_eq!(block.record_count(), 1);
    assert_eq!(block.get(b"k", LATEST).unwrap().value(), b"value-19");
}

#[test]
fn test_version_older_than_snapshot_is_invisible() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    let early = ctx.versions().create_snapshot();
    put(&ctx, &mut block, b"k", b"later");

    assert!(block.get(b"k", early).is_none());
    assert_eq!(block.get(b"k", LATEST).unwrap().value(), b"later");
    ctx.versions().release_snapshot(early);
}

#[test]
fn test_late_sequence_never_lands_under_newer_version() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    let early = ctx.versions().current();
    block.put(&ctx, b"k", b"v0", early, 0).unwrap();
    let snap = ctx.versions().create_snapshot();
    put(&ctx, &mut block, b"k", b"vB");

    // a writer still holding the sequence number it read before the snapshot
    assert_eq!(block.put(&ctx, b"k", b"vA", early, 0).unwrap(), PutStatus::Updated);
    assert_eq!(block.get(b"k", snap).unwrap().value(), b"v0");
    assert_eq!(block.get(b"k", LATEST).unwrap().value(), b"vA");
    let seqs: Vec<u64> = block.records().map(|r| r.seq_id()).collect();
    assert!(seqs.windows(2).all(|w| w[0] > w[1]));

    assert_eq!(block.delete(&ctx, b"k", early).unwrap(), DeleteStatus::Tombstoned);
    assert_eq!(block.get(b"k", snap).unwrap().value(), b"v0");
    assert!(block.get(b"k", LATEST).is_none());
    ctx.versions().release_snapshot(snap);
}

// =============================================================================
// Compaction Tests
// =============================================================================

#[test]
fn test_compact_drops_versions_after_snapshot_release() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    put(&ctx, &mut block, b"x", b"1");
    put(&ctx, &mut block, b"y", b"2");
    let snap = ctx.versions().create_snapshot();
    delete(&ctx, &mut block, b"x");
    put(&ctx, &mut block, b"y", b"3");
    assert_eq!(block.record_count(), 4);

    ctx.versions().release_snapshot(snap);
    assert!(block.compact(&ctx, true).unwrap());

    // the tombstone for x hides nothing any more and goes with its put
    assert_eq!(snapshot_of(&block).len(), 1);
    assert_eq!(block.get(b"y", LATEST).unwrap().value(), b"3");
    assert!(block.get(b"x", LATEST).is_none());
    assert_eq!(block.stale_count(), 0);
}

#[test]
fn test_compact_keeps_versions_visible_to_snapshots() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    put(&ctx, &mut block, b"k", b"v1");
    let s1 = ctx.versions().create_snapshot();
    put(&ctx, &mut block, b"k", b"v2");
    let s2 = ctx.versions().create_snapshot();
    put(&ctx, &mut block, b"k", b"v3");
    assert_eq!(block.record_count(), 3);

    block.compact(&ctx, true).unwrap();
    assert_eq!(block.record_count(), 3);

    ctx.versions().release_snapshot(s1);
    assert!(block.compact(&ctx, true).unwrap());
    assert_eq!(block.record_count(), 2);
    assert_eq!(block.get(b"k", s2).unwrap().value(), b"v2");
    assert_eq!(block.get(b"k", LATEST).unwrap().value(), b"v3");
    ctx.versions().release_snapshot(s2);
}

#[test]
fn test_compaction_is_idempotent() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    for i in 0..8 {
        put(&ctx, &mut block, &key(i), b"first");
    }
    let s1 = ctx.versions().create_snapshot();
    for i in 0..8 {
        if i % 2 == 0 {
            put(&ctx, &mut block, &key(i), b"second");
        } else {
            delete(&ctx, &mut block, &key(i));
        }
    }
    let s2 = ctx.versions().create_snapshot();
    for i in 0..4 {
        put(&ctx, &mut block, &key(i), b"third!");
    }
    ctx.versions().release_snapshot(s1);

    block.compact(&ctx, true).unwrap();
    let after_first = snapshot_of(&block);
    let size_after_first = block.data_size();

    assert!(!block.compact(&ctx, true).unwrap());
    assert_eq!(snapshot_of(&block), after_first);
    assert_eq!(block.data_size(), size_after_first);
    ctx.versions().release_snapshot(s2);
}

#[test]
fn test_versions_held_by_snapshot_are_reclaimed_after_release() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();
    for i in 0..10 {
        put(&ctx, &mut block, &key(i), b"value");
    }
    let snap = ctx.versions().create_snapshot();
    for i in 0..10 {
        assert_eq!(delete(&ctx, &mut block, &key(i)), DeleteStatus::Tombstoned);
    }

    // nothing can go while the snapshot reads the puts
    assert!(!block.compact(&ctx, true).unwrap());
    assert_eq!(block.record_count(), 20);
    assert_eq!(block.stale_count(), 20);

    ctx.versions().release_snapshot(snap);
    assert!(block.needs_compaction(&ctx));
    put(&ctx, &mut block, b"fresh", b"x");

    assert_eq!(block.record_count(), 1);
    assert_eq!(block.stale_count(), 0);
    assert_eq!(keys_of(&block), vec![b"fresh".to_vec()]);
}

#[test]
fn test_stale_versions_trigger_compaction_on_write() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    put(&ctx, &mut block, b"k", b"v0");
    for i in 1..6 {
        let snap = ctx.versions().create_snapshot();
        put(&ctx, &mut block, b"k", format!("v{}", i).as_bytes());
        ctx.versions().release_snapshot(snap);
    }
    assert!(block.needs_compaction(&ctx));

    put(&ctx, &mut block, b"other", b"x");

    assert!(!block.needs_compaction(&ctx));
    assert_eq!(block.record_count(), 2);
    assert_eq!(block.get(b"k", LATEST).unwrap().value(), b"v5");
}

// =============================================================================
// Split / Merge Tests
// =============================================================================

#[test]
fn test_split_partitions_records() {
    let ctx = setup_context();
    let mut left = block_with_keys(&ctx, 40);
    let before: BTreeSet<Vec<u8>> = keys_of(&left).into_iter().collect();

    let right = left.split(&ctx, false).unwrap().unwrap();

    assert_eq!(left.record_count() + right.record_count(), 40);
    assert!(left.last_key().unwrap() < right.first_key().unwrap());

    let left_keys: BTreeSet<Vec<u8>> = keys_of(&left).into_iter().collect();
    let right_keys: BTreeSet<Vec<u8>> = keys_of(&right).into_iter().collect();
    assert!(left_keys.is_disjoint(&right_keys));
    let union: BTreeSet<Vec<u8>> = left_keys.union(&right_keys).cloned().collect();
    assert_eq!(union, before);

    for i in 0..40 {
        let in_left = left.get(&key(i), LATEST).is_some();
        let in_right = right.get(&key(i), LATEST).is_some();
        assert!(in_left ^ in_right, "key {} must live in exactly one half", i);
    }
}

#[test]
fn test_split_never_cuts_a_version_run() {
    let ctx = setup_context();
    let mut block = block_with_keys(&ctx, 6);

    // stack versions of the median key
    let mut snaps = Vec::new();
    for i in 0..6 {
        snaps.push(ctx.versions().create_snapshot());
        put(&ctx, &mut block, &key(3), format!("version-{}", i).as_bytes());
    }
    assert_eq!(block.record_count(), 12);

    let mut right = block.split(&ctx, false).unwrap().unwrap();
    let left_has = block.records().any(|r| r.key() == key(3).as_slice());
    let right_has = right.records().any(|r| r.key() == key(3).as_slice());
    assert!(left_has ^ right_has);
    assert!(block.last_key().unwrap() < right.first_key().unwrap());

    // the shadowed versions stay counted on whichever side holds them
    let (holder, other) = if left_has { (&block, &right) } else { (&right, &block) };
    assert_eq!(holder.stale_count(), 6);
    assert_eq!(other.stale_count(), 0);
    assert!(block.merge(&ctx, &mut right).unwrap());
    assert_eq!(block.stale_count(), 6);

    for snap in snaps {
        ctx.versions().release_snapshot(snap);
    }
}

#[test]
fn test_split_single_key_block_is_refused() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();
    put(&ctx, &mut block, b"only", b"v");

    assert!(block.split(&ctx, false).unwrap().is_none());
    assert_eq!(block.record_count(), 1);
}

#[test]
fn test_merge_after_split_restores_block() {
    let ctx = setup_context();
    let mut left = block_with_keys(&ctx, 30);
    let before = snapshot_of(&left);
    let mut right = left.split(&ctx, false).unwrap().unwrap();

    assert!(left.merge(&ctx, &mut right).unwrap());

    assert!(right.is_empty());
    assert_eq!(snapshot_of(&left), before);
}

#[test]
fn test_merge_refused_when_combined_size_too_large() {
    let ctx = setup_context();
    let mut left = block_with_keys(&ctx, 40);
    let mut right = DataBlock::new(&ctx).unwrap();
    for i in 100..140 {
        put(&ctx, &mut right, &key(i), &[b'v'; 32]);
    }

    assert!(!left.merge(&ctx, &mut right).unwrap());
    assert_eq!(left.record_count(), 40);
    assert_eq!(right.record_count(), 40);
}

// =============================================================================
// External Allocation Tests
// =============================================================================

#[test]
fn test_allocation_class_boundary() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();
    let threshold = ctx.config().external_threshold();
    let largest_embedded = threshold - RECORD_OVERHEAD - 1 - 1;

    put(&ctx, &mut block, b"e", &vec![1u8; largest_embedded]);
    put(&ctx, &mut block, b"x", &vec![2u8; largest_embedded + 1]);

    assert_eq!(block.get(b"e", LATEST).unwrap().class(), AllocClass::Embedded);
    assert_eq!(block.get(b"x", LATEST).unwrap().class(), AllocClass::ExternalValue);
    assert_eq!(block.external_count(), 1);
}

#[test]
fn test_external_value_round_trip_and_free() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();
    let baseline = ctx.memory().external_count();
    let value: Vec<u8> = (0..ctx.config().max_data_block_size).map(|i| i as u8).collect();

    put(&ctx, &mut block, b"big", &value);
    assert_eq!(ctx.memory().external_count(), baseline + 1);
    let record = block.get(b"big", LATEST).unwrap();
    assert_eq!(record.class(), AllocClass::ExternalValue);
    assert_eq!(record.value(), value.as_slice());
    assert_eq!(record.value_size(), value.len());

    assert_eq!(delete(&ctx, &mut block, b"big"), DeleteStatus::Removed);
    assert_eq!(ctx.memory().external_count(), baseline);
    assert_eq!(block.external_count(), 0);
}

#[test]
fn test_external_value_overwritten_in_place() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();

    put(&ctx, &mut block, b"big", &vec![1u8; 3000]);
    put(&ctx, &mut block, b"big", &vec![2u8; 3000]);

    assert_eq!(block.external_count(), 1);
    assert_eq!(block.get(b"big", LATEST).unwrap().value(), vec![2u8; 3000].as_slice());
}

#[test]
fn test_external_key_value_round_trip() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();
    let long_key = vec![b'k'; ctx.config().external_threshold() + 50];

    put(&ctx, &mut block, b"a", b"small");
    put(&ctx, &mut block, &long_key, b"payload");
    put(&ctx, &mut block, b"z", b"small");

    let record = block.get(&long_key, LATEST).unwrap();
    assert_eq!(record.class(), AllocClass::ExternalKeyValue);
    assert_eq!(record.key(), long_key.as_slice());
    assert_eq!(record.value(), b"payload");
    assert_eq!(keys_of(&block)[1], long_key);

    assert_eq!(delete(&ctx, &mut block, &long_key), DeleteStatus::Removed);
    assert_eq!(block.external_count(), 0);
}

#[test]
fn test_split_moves_external_allocations() {
    let ctx = setup_context();
    let mut block = DataBlock::new(&ctx).unwrap();
    for i in 0..10 {
        put(&ctx, &mut block, &key(i), &vec![i as u8; 3000]);
    }
    assert_eq!(block.external_count(), 10);

    let right = block.split(&ctx, false).unwrap().unwrap();

    assert_eq!(block.external_count() + right.external_count(), 10);
    assert_eq!(right.external_count(), right.record_count());
    for i in 0..10 {
        let record = block
            .get(&key(i), LATEST)
            .or_else(|| right.get(&key(i), LATEST))
            .unwrap();
        assert_eq!(record.value(), vec![i as u8; 3000].as_slice());
    }
}
