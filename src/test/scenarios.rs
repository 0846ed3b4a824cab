use std::collections::HashSet;

use crate::error::ArenaError;
use crate::modules::backing_store::FileBackingStore;
use crate::test::{get_test_arena, page_config};
use crate::util::get_page_size;
use crate::window_manager::AccessMode;
use crate::{ArenaConfig, NodeArena, NodeHandle, SegmentSizing};

/// A directory-tree sized load: 5000 entries of 64 bytes with 256 KiB
/// segments. Everything fits into two segments, so the window pool never
/// has to evict and exactly two OS mappings are made over the whole run.
#[test]
fn test_two_segment_load() {
    let _ = env_logger::builder().is_test(true).try_init();

    const SEGMENT_SIZE: usize = 256 * 1024;
    const COUNT: u64 = 5000;

    let arena = get_test_arena(
        "test_two_segment_load",
        ArenaConfig {
            node_size: 64,
            housekeeping_offset: 8,
            alignment: 8,
            sizing: SegmentSizing::Explicit {
                segment_size: SEGMENT_SIZE,
                max_windows: 4,
            },
            generation_check: true,
        },
    );
    let nodes_per_segment = SEGMENT_SIZE as u64 / 64;

    let mut handles = Vec::new();
    let mut seen = HashSet::new();
    for _ in 0..COUNT {
        let handle = arena.allocate().unwrap();
        assert!(seen.insert(handle.index_checked()), "index handed out twice");
        handles.push(handle);
    }

    // tag every 97th node so the read-back below exercises real payloads
    for handle in handles.iter().step_by(97) {
        let mut guard = arena.map(*handle).unwrap();
        guard[16] = handle.index_checked() as u8;
    }
    for handle in handles.iter().step_by(97) {
        let guard = arena.map(*handle).unwrap();
        assert_eq!(guard[16], handle.index_checked() as u8);
    }

    let stats = arena.stats().unwrap();
    assert_eq!(stats.materialized_segments, 2);
    assert_eq!(stats.materialized_nodes, 2 * nodes_per_segment);
    assert_eq!(stats.allocated_nodes, COUNT);
    assert_eq!(stats.free_nodes, 2 * nodes_per_segment - COUNT);
    assert_eq!(stats.resident_windows, 2);
    assert_eq!(stats.mapping_calls, 2);
}

/// With only two windows over one-page segments, walking six segments
/// forces evictions and remaps. Data written before an eviction has to
/// survive the round trip through the backing file.
#[test]
fn test_eviction_and_data_survival() {
    let arena = get_test_arena("test_eviction_and_data_survival", page_config(true, 2));

    let nodes_per_segment = get_page_size() / 64;
    let count = nodes_per_segment * 6;

    let mut handles = Vec::new();
    for i in 0..count {
        let handle = arena.allocate().unwrap();
        {
            let mut guard = arena.map(handle).unwrap();
            guard[16] = i as u8;
            guard[17] = (i >> 8) as u8;
        }
        handles.push(handle);
        assert!(arena.resident_windows() <= 2);
    }

    for (i, handle) in handles.iter().enumerate() {
        let guard = arena.map(*handle).unwrap();
        assert_eq!(guard[16], i as u8);
        assert_eq!(guard[17], (i >> 8) as u8);
        assert!(arena.resident_windows() <= 2);
    }

    let stats = arena.stats().unwrap();
    assert_eq!(stats.materialized_segments, 6);
    // the pool bound forces more OS mappings than there are segments
    assert!(stats.mapping_calls > 6);
}

/// Holding guards pins windows. Once every window is pinned, mapping a
/// node in yet another segment must fail instead of evicting.
#[test]
fn test_pinned_windows_exhaust_pool() {
    let arena = get_test_arena("test_pinned_windows_exhaust_pool", page_config(true, 3));

    let nodes_per_segment = get_page_size() / 64;
    let mut handles = Vec::new();
    for _ in 0..nodes_per_segment * 4 {
        handles.push(arena.allocate().unwrap());
    }

    // one guard per segment pins three distinct windows
    let _a = arena.map(handles[0]).unwrap();
    let _b = arena.map(handles[nodes_per_segment]).unwrap();
    let _c = arena.map(handles[nodes_per_segment * 2]).unwrap();
    assert_eq!(arena.resident_windows(), 3);

    let err = arena.map(handles[nodes_per_segment * 3]).unwrap_err();
    assert_eq!(err, ArenaError::WindowsExhausted);

    // releasing one window makes room again
    drop(_a);
    assert!(arena.map(handles[nodes_per_segment * 3]).is_ok());
}

/// Tear an arena down mid-life and reattach to the same file: sizing,
/// free-list state and node payloads all come back from the header page,
/// and the window pool starts out cold.
#[test]
fn test_reattach_continues_arena() {
    let path = "/tmp/test_reattach_continues_arena.tmp";
    let store = FileBackingStore::create(path, 0).unwrap();
    let arena = NodeArena::initialize(store, 0, page_config(true, 4)).unwrap();

    let mut handles = Vec::new();
    for i in 0..10u8 {
        let handle = arena.allocate().unwrap();
        arena.map(handle).unwrap()[20] = i;
        handles.push(handle);
    }
    let mut doomed = handles[3];
    arena.free(&mut doomed).unwrap();

    let before = arena.stats().unwrap();
    drop(arena);

    let arena = NodeArena::reattach(FileBackingStore::open(path).unwrap(), 0).unwrap();
    assert_eq!(arena.resident_windows(), 0);
    assert_eq!(arena.mapping_count(), 0);

    // the frontier bound comes back from the header too
    let far = NodeHandle::checked(1, 1 << 20);
    assert_eq!(arena.map(far).unwrap_err(), ArenaError::StaleHandle);

    let after = arena.stats().unwrap();
    assert_eq!(after.materialized_nodes, before.materialized_nodes);
    assert_eq!(after.free_nodes, before.free_nodes);
    assert_eq!(after.allocated_nodes, before.allocated_nodes);

    // the freed node is still at the head of the persisted free list
    let reused = arena.allocate().unwrap();
    assert_eq!(reused.index_checked(), handles[3].index_checked());

    // payloads written before the teardown are intact, the stale handle is
    // still rejected
    for (i, handle) in handles.iter().enumerate() {
        if i == 3 {
            assert_eq!(arena.map(*handle).unwrap_err(), ArenaError::StaleHandle);
        } else {
            assert_eq!(arena.map(*handle).unwrap()[20], i as u8);
        }
    }
}

/// An exclusive-owner phase runs the same operations without spinning.
#[test]
fn test_exclusive_owner_phase() {
    let arena = get_test_arena("test_exclusive_owner_phase", page_config(true, 4));

    arena.set_access_mode(AccessMode::ExclusiveOwner);
    let mut handles = Vec::new();
    for _ in 0..100 {
        handles.push(arena.allocate().unwrap());
    }
    for handle in &mut handles {
        arena.map(*handle).unwrap()[32] = 0x55;
        arena.free(handle).unwrap();
    }
    arena.set_access_mode(AccessMode::Concurrent);

    let stats = arena.stats().unwrap();
    assert_eq!(stats.allocated_nodes, 0);
    assert_eq!(stats.free_nodes, stats.materialized_nodes);
}

/// The auto heuristic has to produce a usable layout from a memory budget
/// and an entry estimate alone.
#[test]
fn test_auto_sizing_end_to_end() {
    let arena = get_test_arena(
        "test_auto_sizing_end_to_end",
        ArenaConfig {
            node_size: 120,
            housekeeping_offset: 9,
            alignment: 16,
            sizing: SegmentSizing::Auto {
                vm_budget: 64 * 1024 * 1024,
                estimated_entries: 50_000,
            },
            generation_check: true,
        },
    );

    // 120 rounds up to the 16-byte alignment
    assert_eq!(arena.node_size(), 128);

    let mut handles = Vec::new();
    for i in 0..1000u32 {
        let handle = arena.allocate().unwrap();
        arena.map(handle).unwrap()[64] = i as u8;
        handles.push(handle);
    }
    for (i, handle) in handles.iter().enumerate() {
        assert_eq!(arena.map(*handle).unwrap()[64], i as u8);
    }

    let stats = arena.stats().unwrap();
    assert_eq!(stats.allocated_nodes, 1000);
    assert_eq!(stats.free_nodes + 1000, stats.materialized_nodes);
}
