use std::sync::atomic::{AtomicUsize, Ordering};

use shmem_heap::{Heap, HeapOptions};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A region name no other test (or concurrently running test binary) uses.
#[allow(dead_code)]
pub fn unique_name(tag: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("shmem_heap_test_{}_{tag}_{n}", std::process::id())
}

/// Create a region with an explicit heap size request.
#[allow(dead_code)]
pub fn heap_with(tag: &str, static_capacity: usize, heap_capacity: usize) -> Heap {
    Heap::create(
        &unique_name(tag),
        HeapOptions {
            static_capacity,
            heap_capacity,
        },
    )
    .expect("create region")
}

/// Create a default-sized region.
#[allow(dead_code)]
pub fn heap(tag: &str) -> Heap {
    heap_with(tag, 32, 4096)
}

/// Assert the structural invariants hold, with a readable failure.
#[allow(dead_code)]
pub fn check(heap: &Heap) {
    if let Err(err) = heap.self_check() {
        heap.dump().ok();
        panic!("invariant violation: {err}");
    }
}
