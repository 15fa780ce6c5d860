//! Allocator scenarios: filling the heap block by block, split and coalesce
//! behavior, realloc paths, and a randomized stress run.

use anyhow::Result;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

mod common;

use common::{check, heap, heap_with, unique_name};

#[test]
fn create_lays_down_one_spanning_free_block() -> Result<()> {
    let heap = heap_with("create", 80, 1024);
    assert_eq!(heap.static_capacity()?, 80);
    let hcap = heap.heap_capacity()?;
    assert!(hcap >= 1024);
    assert_eq!(hcap % 1024, 0);
    assert_eq!(heap.layout_string()?, format!("{}E", hcap - 8));
    assert!(heap.is_owner());
    check(&heap);
    Ok(())
}

#[test]
fn static_capacity_is_padded_and_clamped() -> Result<()> {
    let heap = heap_with("clamp", 1, 4096);
    // Four words minimum, to hold the header slots.
    assert_eq!(heap.static_capacity()?, 32);
    let heap = heap_with("pad", 33, 4096);
    assert_eq!(heap.static_capacity()?, 40);
    Ok(())
}

#[test]
fn one_byte_allocations_fill_the_heap_exactly() -> Result<()> {
    let heap = heap("fill");
    let hcap = heap.heap_capacity()?;
    let blocks = hcap / 32;

    let mut offsets = Vec::new();
    for index in 0..blocks {
        let offset = heap.alloc(1);
        assert_ne!(offset, 0, "allocation {index} of {blocks} failed");
        assert_eq!(offset, index * 32 + 8);
        offsets.push(offset);
    }
    assert_eq!(heap.alloc(1), 0, "the heap should be exhausted");
    let expected: Vec<String> = (0..blocks).map(|_| "24A".to_owned()).collect();
    assert_eq!(heap.layout_string()?, expected.join(", "));
    check(&heap);

    // Free every other block: no coalescing can happen.
    for index in (1..blocks).step_by(2) {
        assert!(heap.free(offsets[index]));
    }
    check(&heap);
    let expected: Vec<String> = (0..blocks)
        .map(|index| if index % 2 == 0 { "24A" } else { "24E" }.to_owned())
        .collect();
    assert_eq!(heap.layout_string()?, expected.join(", "));

    // Free the rest, except one probe to keep the heap non-trivial.
    for index in (2..blocks).step_by(2) {
        assert!(heap.free(offsets[index]));
    }
    check(&heap);
    assert_eq!(heap.layout_string()?, format!("24A, {}E", hcap - 40));

    assert!(heap.free(offsets[0]));
    assert_eq!(heap.layout_string()?, format!("{}E", hcap - 8));
    check(&heap);
    Ok(())
}

#[test]
fn split_realloc_and_coalesce() -> Result<()> {
    let heap = heap("split");
    let hcap = heap.heap_capacity()?;

    let first = heap.alloc(0x100);
    assert_ne!(first, 0);
    assert_eq!(heap.layout_string()?, format!("256A, {}E", hcap - 272));
    check(&heap);

    // Growing moves the payload: free-then-alloc finds the coalesced block.
    let second = heap.realloc(first, 0x1FA);
    assert_ne!(second, 0);
    assert_eq!(heap.layout_string()?, format!("512A, {}E", hcap - 528));
    check(&heap);

    assert!(heap.free(second));
    assert_eq!(heap.layout_string()?, format!("{}E", hcap - 8));
    check(&heap);
    Ok(())
}

#[test]
fn realloc_same_size_is_a_no_op() -> Result<()> {
    let heap = heap("same");
    let offset = heap.alloc(0x100);
    let layout = heap.layout_string()?;
    assert_eq!(heap.realloc(offset, 0x100), offset);
    assert_eq!(heap.realloc(offset, 0xFF), offset);
    assert_eq!(heap.layout_string()?, layout);
    check(&heap);
    Ok(())
}

#[test]
fn realloc_shrink_carves_a_tail_block() -> Result<()> {
    let heap = heap("shrink");
    let hcap = heap.heap_capacity()?;

    // Pin a second allocation behind the first so the carved tail is
    // observable as its own block.
    let first = heap.alloc(0x100);
    let _second = heap.alloc(0x40);
    assert_eq!(heap.layout_string()?, format!("256A, 64A, {}E", hcap - 344));

    assert_eq!(heap.realloc(first, 8), first);
    assert_eq!(
        heap.layout_string()?,
        format!("24A, 224E, 64A, {}E", hcap - 344)
    );
    check(&heap);
    Ok(())
}

#[test]
fn realloc_shrink_below_minimum_is_kept() -> Result<()> {
    let heap = heap("keep");
    let offset = heap.alloc(0x40);
    let layout = heap.layout_string()?;
    // 72-byte block, 56 required: the 16-byte gap cannot stand alone.
    assert_eq!(heap.realloc(offset, 0x30), offset);
    assert_eq!(heap.layout_string()?, layout);
    check(&heap);
    Ok(())
}

#[test]
fn free_rejects_bad_offsets() -> Result<()> {
    let heap = heap("badfree");
    let offset = heap.alloc(16);
    let layout = heap.layout_string()?;

    assert!(!heap.free(0));
    assert!(!heap.free(offset + 1));
    assert!(!heap.free(heap.heap_capacity()? + 8));
    assert_eq!(heap.layout_string()?, layout);

    assert!(heap.free(offset));
    assert!(!heap.free(offset), "double free must fail");
    check(&heap);
    Ok(())
}

#[test]
fn zero_size_requests_use_the_sentinels() -> Result<()> {
    let heap = heap("zero");
    assert_eq!(heap.alloc(0), 0);
    let offset = heap.alloc(16);
    assert_eq!(heap.realloc(offset, 0), 0, "realloc to zero frees");
    assert_eq!(heap.layout_string()?, format!("{}E", heap.heap_capacity()? - 8));
    Ok(())
}

#[test]
fn best_fit_prefers_the_tightest_hole() -> Result<()> {
    let heap = heap("bestfit");

    // Build holes of 96 and 32 payload bytes separated by live blocks.
    let a = heap.alloc(96);
    let _pin1 = heap.alloc(8);
    let b = heap.alloc(24);
    let _pin2 = heap.alloc(8);
    assert!(heap.free(a));
    assert!(heap.free(b));
    check(&heap);

    // A 24-byte request must land in the 32-byte hole, not the 96-byte one.
    let c = heap.alloc(24);
    assert_eq!(c, b);
    // And a 90-byte request in the bigger hole.
    let d = heap.alloc(90);
    assert_eq!(d, a);
    check(&heap);
    Ok(())
}

#[test]
fn random_alloc_free_stress_keeps_invariants() -> Result<()> {
    let heap = heap_with("stress", 32, 8192);
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let mut live: Vec<usize> = Vec::new();

    for round in 0..400 {
        if live.is_empty() || rng.random_range(0..100) < 55 {
            let size = rng.random_range(1..300);
            let offset = heap.alloc(size);
            if offset != 0 {
                live.push(offset);
            }
        } else {
            let index = rng.random_range(0..live.len());
            let offset = live.swap_remove(index);
            assert!(heap.free(offset), "free of live offset failed in round {round}");
        }
        if round % 25 == 0 {
            check(&heap);
        }
    }
    for offset in live.drain(..) {
        assert!(heap.free(offset));
    }
    assert_eq!(
        heap.layout_string()?,
        format!("{}E", heap.heap_capacity()? - 8)
    );
    check(&heap);
    Ok(())
}

#[test]
fn closed_handles_refuse_everything() -> Result<()> {
    let heap = heap("closed");
    heap.access().set(1i32)?;
    heap.close();
    assert!(matches!(
        heap.heap_capacity().unwrap_err().kind(),
        shmem_heap::ErrorKind::NotConnected
    ));
    assert!(matches!(
        heap.access().get().unwrap_err().kind(),
        shmem_heap::ErrorKind::NotConnected
    ));
    assert_eq!(heap.alloc(8), 0);
    Ok(())
}

#[test]
fn connect_sees_the_same_blocks() -> Result<()> {
    let name = unique_name("connect");
    let owner = shmem_heap::Heap::create(&name, shmem_heap::HeapOptions::default())?;
    let offset = owner.alloc(64);

    let peer = shmem_heap::Heap::connect(&name)?;
    assert!(!peer.is_owner());
    assert_eq!(peer.static_capacity()?, owner.static_capacity()?);
    assert_eq!(peer.layout_string()?, owner.layout_string()?);

    // A peer can free what the owner allocated.
    assert!(peer.free(offset));
    assert_eq!(
        owner.layout_string()?,
        format!("{}E", owner.heap_capacity()? - 8)
    );
    check(&owner);
    Ok(())
}
