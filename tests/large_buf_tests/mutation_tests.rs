//! Tests for LargeBuf allocation and resizing
//!
//! These tests verify:
//! - Segment geometry after allocate/append/prepend/unappend/unprepend
//! - Content preservation across resizes and segment boundaries
//! - Capacity and block store exhaustion leave the buffer untouched
//! - Every block is released exactly once

use std::sync::Arc;

use largebuf::buffer_cache::{CompletionMode, MemoryCache, MemoryTransaction};
use largebuf::large_buf::{IndexRecord, INDEX_MAGIC, SEGMENT_MAGIC};
use largebuf::{Access, Config, LargeBuf, LargeBufError, LargeBufState};
use quickcheck::{Arbitrary, Gen, QuickCheck};

// =============================================================================
// Helper Functions
// =============================================================================

type Buf = LargeBuf<MemoryTransaction>;

fn setup(config: Config) -> (Config, Arc<MemoryCache>, Arc<MemoryTransaction>) {
    let cache = MemoryCache::new(&config).unwrap();
    let txn = cache.begin(CompletionMode::Immediate);
    (config, cache, txn)
}

/// 1024 byte blocks: 1020 bytes of payload per segment
fn setup_1k() -> (Config, Arc<MemoryCache>, Arc<MemoryTransaction>) {
    setup(Config::builder().block_size(1024).build())
}

fn allocate(txn: &Arc<MemoryTransaction>, config: &Config, size: u32) -> Buf {
    let mut buf = LargeBuf::new(txn, config);
    buf.allocate(size).unwrap();
    buf
}

fn pattern(len: usize, seed: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + seed * 7) % 251) as u8).collect()
}

fn contents(buf: &Buf) -> Vec<u8> {
    let mut out = vec![0u8; buf.size() as usize];
    buf.read_at(0, &mut out);
    out
}

fn lengths(buf: &Buf) -> Vec<u32> {
    let geometry = buf.geometry();
    (0..buf.num_segments()).map(|ix| geometry.segment_byte_length(ix)).collect()
}

fn assert_well_formed(buf: &Buf) {
    let geometry = buf.geometry();
    assert!(geometry.is_consistent(), "{:?}", geometry);
    let total: u64 = lengths(buf).iter().map(|l| *l as u64).sum();
    assert_eq!(total, buf.size() as u64);
    for ix in 0..buf.num_segments() {
        assert_eq!(buf.segment(ix).len() as u32, geometry.segment_byte_length(ix));
    }
}

// =============================================================================
// Allocation Tests
// =============================================================================

#[test]
fn test_allocate_scenario_then_prepend() {
    let (config, cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);

    assert_eq!(buf.state(), LargeBufState::Loaded);
    assert_eq!(buf.access(), Access::Write);
    assert_eq!(buf.num_segments(), 3);
    assert_eq!(buf.first_block_offset(), 0);
    assert_eq!(lengths(&buf), vec![1020, 1020, 460]);

    buf.prepend(50).unwrap();

    assert_eq!(buf.size(), 2550);
    assert_eq!(buf.num_segments(), 4);
    assert_eq!(buf.first_block_offset(), 970);
    assert_eq!(lengths(&buf), vec![50, 1020, 1020, 460]);

    buf.release();
    assert_eq!(buf.state(), LargeBufState::Released);
    assert_eq!(cache.outstanding_handles(), 0);
    assert_eq!(cache.block_count(), 5);
}

#[test]
fn test_allocate_stamps_records() {
    let (config, cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    let index_id = buf.index_block_id();
    let segment_ids = buf.segment_block_ids().to_vec();
    buf.release();

    let index_block = cache.read_block(index_id).unwrap();
    assert_eq!(&index_block[..4], INDEX_MAGIC);
    let record = IndexRecord::decode(&index_block).unwrap();
    assert_eq!(record.first_block_offset, 0);
    assert_eq!(record.blocks, segment_ids);

    for id in segment_ids {
        assert_eq!(&cache.read_block(id).unwrap()[..4], SEGMENT_MAGIC);
    }
}

#[test]
fn test_allocate_exact_multiple() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 3060);
    assert_eq!(lengths(&buf), vec![1020, 1020, 1020]);
    buf.release();
}

#[test]
#[should_panic(expected = "belongs in the node")]
fn test_allocate_in_node_value_panics() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = LargeBuf::new(&txn, &config);
    let _ = buf.allocate(250);
}

#[test]
fn test_allocate_over_segment_limit_is_rejected() {
    let (config, cache, txn) = setup(
        Config::builder()
            .block_size(1024)
            .segment_limit(4)
            .build(),
    );
    let mut buf = LargeBuf::new(&txn, &config);

    match buf.allocate(5000) {
        Err(LargeBufError::CapacityExceeded { requested, limit }) => {
            assert_eq!(requested, 5);
            assert_eq!(limit, 4);
        }
        other => panic!("expected CapacityExceeded, got {:?}", other),
    }
    assert_eq!(buf.state(), LargeBufState::NotLoaded);
    assert_eq!(cache.block_count(), 0);
}

#[test]
fn test_allocate_with_exhausted_store_rolls_back() {
    let (config, cache, txn) = setup(Config::builder().block_size(1024).max_blocks(3).build());
    let mut buf = LargeBuf::new(&txn, &config);

    assert!(matches!(
        buf.allocate(2500),
        Err(LargeBufError::BlockStoreExhausted(_))
    ));
    assert_eq!(buf.state(), LargeBufState::NotLoaded);
    assert_eq!(cache.block_count(), 0);
    assert_eq!(cache.outstanding_handles(), 0);
}

// =============================================================================
// Fill / Read Tests
// =============================================================================

#[test]
fn test_fill_at_crosses_segment_boundaries() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    let data = pattern(1100, 1);

    buf.fill_at(1000, &data);

    assert_eq!(&buf.segment(0)[1000..1020], &data[..20]);
    assert_eq!(buf.segment(1), &data[20..1040]);
    assert_eq!(&buf.segment(2)[..60], &data[1040..]);

    let mut out = vec![0u8; 1100];
    buf.read_at(1000, &mut out);
    assert_eq!(out, data);
    buf.release();
}

#[test]
fn test_fill_whole_buffer_after_prepend() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    buf.prepend(50).unwrap();

    let data = pattern(2550, 2);
    buf.fill_at(0, &data);

    assert_eq!(buf.segment(0), &data[..50]);
    assert_eq!(buf.segment(1), &data[50..1070]);
    assert_eq!(buf.segment(3), &data[2090..]);
    assert_eq!(contents(&buf), data);
    buf.release();
}

#[test]
fn test_fill_empty_slice_at_end() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2040);
    buf.fill_at(2040, &[]);
    buf.release();
}

#[test]
#[should_panic(expected = "overruns")]
fn test_fill_past_end_panics() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    buf.fill_at(2400, &[0u8; 101]);
}

#[test]
fn test_segment_mut_writes_through() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);

    buf.segment_mut(2).fill(0xEE);

    let mut out = vec![0u8; 460];
    buf.read_at(2040, &mut out);
    assert!(out.iter().all(|b| *b == 0xEE));
    buf.release();
}

// =============================================================================
// Append / Unappend Tests
// =============================================================================

#[test]
fn test_append_uses_spare_room_first() {
    let (config, cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    let blocks_before = cache.block_count();

    buf.append(560).unwrap();
    assert_eq!(buf.size(), 3060);
    assert_eq!(buf.num_segments(), 3);
    assert_eq!(cache.block_count(), blocks_before);

    buf.append(1).unwrap();
    assert_eq!(buf.num_segments(), 4);
    assert_eq!(lengths(&buf), vec![1020, 1020, 1020, 1]);
    assert_eq!(cache.block_count(), blocks_before + 1);
    buf.release();
}

#[test]
fn test_append_many_segments() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);

    buf.append(5000).unwrap();
    assert_eq!(buf.size(), 7500);
    assert_eq!(buf.num_segments(), 8);
    assert_eq!(*lengths(&buf).last().unwrap(), 7500 - 7 * 1020);
    assert_well_formed(&buf);
    buf.release();
}

#[test]
fn test_append_then_unappend_restores_contents() {
    let (config, cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    let data = pattern(2500, 3);
    buf.fill_at(0, &data);
    let ids = buf.segment_block_ids().to_vec();

    buf.append(4321).unwrap();
    buf.fill_at(2500, &pattern(4321, 4));
    buf.unappend(4321);

    assert_eq!(buf.size(), 2500);
    assert_eq!(buf.segment_block_ids(), ids.as_slice());
    assert_eq!(contents(&buf), data);
    assert_well_formed(&buf);

    buf.release();
    assert_eq!(cache.block_count(), 4);
    assert_eq!(cache.outstanding_handles(), 0);
}

#[test]
fn test_unappend_to_segment_boundary() {
    let (config, cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 3060);
    let freed = buf.segment_block_ids()[2];

    buf.unappend(1020);

    assert_eq!(buf.size(), 2040);
    assert_eq!(buf.num_segments(), 2);
    assert_eq!(lengths(&buf), vec![1020, 1020]);
    assert!(!cache.contains(freed));
    buf.release();
}

#[test]
fn test_unappend_to_boundary_with_offset() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    buf.prepend(50).unwrap();

    // 50 + 1020 + 1020: ends exactly at the end of segment 2
    buf.unappend(460);

    assert_eq!(buf.size(), 2090);
    assert_eq!(buf.num_segments(), 3);
    assert_eq!(lengths(&buf), vec![50, 1020, 1020]);
    buf.release();
}

#[test]
fn test_unappend_within_last_segment_keeps_blocks() {
    let (config, cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);

    buf.unappend(459);

    assert_eq!(buf.num_segments(), 3);
    assert_eq!(lengths(&buf), vec![1020, 1020, 1]);
    assert_eq!(cache.block_count(), 4);
    buf.release();
}

#[test]
#[should_panic(expected = "cannot unappend")]
fn test_unappend_everything_panics() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    buf.unappend(2500);
}

// =============================================================================
// Prepend / Unprepend Tests
// =============================================================================

#[test]
fn test_prepend_into_existing_offset() {
    let (config, cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    buf.prepend(50).unwrap();
    let blocks_before = cache.block_count();

    buf.prepend(900).unwrap();

    assert_eq!(buf.num_segments(), 4);
    assert_eq!(buf.first_block_offset(), 70);
    assert_eq!(lengths(&buf), vec![950, 1020, 1020, 460]);
    assert_eq!(cache.block_count(), blocks_before);
    buf.release();
}

#[test]
fn test_prepend_several_segments_keeps_order() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    let data = pattern(2500, 5);
    buf.fill_at(0, &data);
    let old_ids = buf.segment_block_ids().to_vec();

    buf.prepend(3000).unwrap();

    assert_eq!(buf.num_segments(), 6);
    assert_eq!(buf.first_block_offset(), 3 * 1020 - 3000);
    assert_eq!(&buf.segment_block_ids()[3..], old_ids.as_slice());

    let head = pattern(3000, 6);
    buf.fill_at(0, &head);
    let all = contents(&buf);
    assert_eq!(&all[..3000], head.as_slice());
    assert_eq!(&all[3000..], data.as_slice());
    assert_well_formed(&buf);
    buf.release();
}

#[test]
fn test_prepend_then_unprepend_restores_everything() {
    let (config, cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    buf.unprepend(300);
    let data = pattern(2200, 7);
    buf.fill_at(0, &data);
    let fbo = buf.first_block_offset();
    let ids = buf.segment_block_ids().to_vec();

    buf.prepend(2345).unwrap();
    buf.unprepend(2345);

    assert_eq!(buf.size(), 2200);
    assert_eq!(buf.first_block_offset(), fbo);
    assert_eq!(buf.segment_block_ids(), ids.as_slice());
    assert_eq!(contents(&buf), data);

    buf.release();
    assert_eq!(cache.block_count(), 1 + ids.len());
}

#[test]
fn test_unprepend_frees_leading_segment() {
    let (config, cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    buf.prepend(50).unwrap();
    let freed = buf.segment_block_ids()[0];

    buf.unprepend(50);

    assert_eq!(buf.size(), 2500);
    assert_eq!(buf.num_segments(), 3);
    assert_eq!(buf.first_block_offset(), 0);
    assert_eq!(lengths(&buf), vec![1020, 1020, 460]);
    assert!(!cache.contains(freed));
    buf.release();
}

#[test]
fn test_unprepend_within_first_segment() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    let data = pattern(2500, 8);
    buf.fill_at(0, &data);

    buf.unprepend(100);

    assert_eq!(buf.first_block_offset(), 100);
    assert_eq!(buf.num_segments(), 3);
    assert_eq!(lengths(&buf), vec![920, 1020, 460]);
    assert_eq!(contents(&buf), &data[100..]);
    buf.release();
}

#[test]
fn test_unprepend_to_single_offset_segment_then_append() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 1500);
    let data = pattern(1500, 9);
    buf.fill_at(0, &data);

    buf.unprepend(1100);

    assert_eq!(buf.size(), 400);
    assert_eq!(buf.num_segments(), 1);
    assert_eq!(buf.first_block_offset(), 80);
    assert_eq!(lengths(&buf), vec![400]);
    assert_eq!(contents(&buf), &data[1100..]);

    buf.append(600).unwrap();
    assert_eq!(buf.num_segments(), 2);
    assert_eq!(lengths(&buf), vec![940, 60]);
    assert_eq!(&contents(&buf)[..400], &data[1100..]);
    buf.release();
}

// =============================================================================
// Capacity Tests
// =============================================================================

/// 64 byte blocks: 60 bytes of payload, 13 segments per index
fn setup_tiny() -> (Config, Arc<MemoryCache>, Arc<MemoryTransaction>) {
    setup(Config::builder().block_size(64).build())
}

#[test]
fn test_append_past_capacity_is_rejected_unchanged() {
    let (config, cache, txn) = setup_tiny();
    let mut buf = allocate(&txn, &config, 700);
    assert_eq!(buf.max_segments(), 13);
    assert_eq!(buf.num_segments(), 12);

    buf.append(60).unwrap();
    assert_eq!(buf.num_segments(), 13);

    let data = pattern(760, 10);
    buf.fill_at(0, &data);
    let ids = buf.segment_block_ids().to_vec();
    let blocks = cache.block_count();

    match buf.append(100) {
        Err(LargeBufError::CapacityExceeded { requested, limit }) => {
            assert_eq!(requested, 15);
            assert_eq!(limit, 13);
        }
        other => panic!("expected CapacityExceeded, got {:?}", other),
    }

    assert_eq!(buf.size(), 760);
    assert_eq!(buf.segment_block_ids(), ids.as_slice());
    assert_eq!(cache.block_count(), blocks);
    assert_eq!(contents(&buf), data);

    // Filling the last segment still fits
    buf.append(20).unwrap();
    assert_eq!(buf.num_segments(), 13);
    buf.release();
}

#[test]
fn test_prepend_past_capacity_is_rejected_unchanged() {
    let (config, cache, txn) = setup_tiny();
    let mut buf = allocate(&txn, &config, 700);
    let ids = buf.segment_block_ids().to_vec();
    let blocks = cache.block_count();

    assert!(matches!(
        buf.prepend(61),
        Err(LargeBufError::CapacityExceeded { requested: 14, limit: 13 })
    ));
    assert_eq!(buf.size(), 700);
    assert_eq!(buf.first_block_offset(), 0);
    assert_eq!(buf.segment_block_ids(), ids.as_slice());
    assert_eq!(cache.block_count(), blocks);

    buf.prepend(60).unwrap();
    assert_eq!(buf.num_segments(), 13);
    assert_eq!(buf.first_block_offset(), 0);
    buf.release();
}

#[test]
fn test_append_with_exhausted_store_rolls_back() {
    let (config, cache, txn) = setup(Config::builder().block_size(1024).max_blocks(5).build());
    let mut buf = allocate(&txn, &config, 2500);
    assert_eq!(cache.block_count(), 4);

    // Needs two new segments, only one block left
    assert!(matches!(
        buf.append(2000),
        Err(LargeBufError::BlockStoreExhausted(_))
    ));
    assert_eq!(buf.size(), 2500);
    assert_eq!(buf.num_segments(), 3);
    assert_eq!(cache.block_count(), 4);
    assert_eq!(cache.outstanding_handles(), 4);

    buf.append(1000).unwrap();
    assert_eq!(buf.num_segments(), 4);
    buf.release();
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_mark_deleted_then_release_frees_all_blocks() {
    let (config, cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    buf.prepend(50).unwrap();

    buf.mark_deleted();
    assert_eq!(buf.state(), LargeBufState::Deleted);
    assert_eq!(buf.num_segments(), 4);

    buf.release();
    assert_eq!(cache.block_count(), 0);
    assert_eq!(cache.outstanding_handles(), 0);
}

#[test]
#[should_panic(expected = "mutation while Deleted")]
fn test_mutation_after_delete_panics() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    buf.mark_deleted();
    let _ = buf.append(10);
}

#[test]
#[should_panic(expected = "release while Released")]
fn test_double_release_panics() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    buf.release();
    buf.release();
}

#[test]
#[should_panic(expected = "dropped while Loaded")]
fn test_drop_without_release_panics() {
    let (config, _cache, txn) = setup_1k();
    let _buf = allocate(&txn, &config, 2500);
}

#[test]
fn test_unused_buf_drops_cleanly() {
    let (config, cache, txn) = setup_1k();
    let buf = LargeBuf::new(&txn, &config);
    assert_eq!(buf.state(), LargeBufState::NotLoaded);
    drop(buf);
    assert_eq!(cache.outstanding_handles(), 0);
}

#[test]
#[should_panic(expected = "after its transaction ended")]
fn test_resize_after_transaction_ended_panics() {
    let (config, _cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 2500);
    drop(txn);
    let _ = buf.append(5000);
}

// =============================================================================
// Mixed Sequence Tests
// =============================================================================

#[derive(Clone, Debug)]
enum Resize {
    Append(u16),
    Prepend(u16),
    Unappend(u16),
    Unprepend(u16),
}

impl Arbitrary for Resize {
    fn arbitrary(g: &mut Gen) -> Self {
        let by = u16::arbitrary(g) % 3000 + 1;
        match u8::arbitrary(g) % 4 {
            0 => Resize::Append(by),
            1 => Resize::Prepend(by),
            2 => Resize::Unappend(by),
            _ => Resize::Unprepend(by),
        }
    }
}

/// Apply `ops` to a 3000 byte buffer and a `Vec` side by side
fn resizes_match_model(ops: Vec<Resize>) -> bool {
    let (config, cache, txn) = setup_1k();
    let mut buf = allocate(&txn, &config, 3000);
    let mut model = pattern(3000, 11);
    buf.fill_at(0, &model);

    for (step, op) in ops.into_iter().enumerate() {
        let size = buf.size();
        match op {
            Resize::Append(by) if size < 20_000 => {
                buf.append(by as u32).unwrap();
                let tail = pattern(by as usize, step);
                buf.fill_at(size, &tail);
                model.extend_from_slice(&tail);
            }
            Resize::Prepend(by) if size < 20_000 => {
                buf.prepend(by as u32).unwrap();
                let head = pattern(by as usize, step);
                buf.fill_at(0, &head);
                model = [head, model].concat();
            }
            // Shrinks keep at least 300 bytes so the value stays out of line
            Resize::Unappend(by) if size > 400 => {
                let k = 1 + (by as u32 - 1) % (size - 300);
                buf.unappend(k);
                model.truncate((size - k) as usize);
            }
            Resize::Unprepend(by) if size > 400 => {
                let k = 1 + (by as u32 - 1) % (size - 300);
                buf.unprepend(k);
                model.drain(..k as usize);
            }
            _ => continue,
        }

        assert_well_formed(&buf);
        if contents(&buf) != model || cache.block_count() != 1 + buf.num_segments() {
            buf.release();
            return false;
        }
    }

    buf.mark_deleted();
    buf.release();
    cache.block_count() == 0 && cache.outstanding_handles() == 0
}

#[test]
fn test_random_resizes_match_model() {
    QuickCheck::new()
        .tests(64)
        .quickcheck(resizes_match_model as fn(Vec<Resize>) -> bool);
}
