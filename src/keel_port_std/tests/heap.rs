//! Kernel heap behavior through the public allocation API.
use std::sync::atomic::{AtomicUsize, Ordering};

use keel_kernel::Error;
use keel_port_std::SimKernel;

static FAILED_SIZE: AtomicUsize = AtomicUsize::new(0);

fn on_alloc_failed(size: usize) {
    FAILED_SIZE.store(size, Ordering::SeqCst);
}

/// First fit reuses the earliest hole; exhaustion reports out-of-memory
/// through both the error code and the allocation-failure hook.
#[test]
fn first_fit_reuse_and_failure_hook() {
    let sim = SimKernel::new(1024);
    let k = sim.kernel();
    k.set_alloc_failed_hook(Some(on_alloc_failed));

    let a = k.alloc(100).unwrap();
    let b = k.alloc(200).unwrap();
    assert!(!a.is_null() && !b.is_null());
    assert!(b > a);

    k.free(a).unwrap();
    // The freed leading block is the first fit for an equal request.
    assert_eq!(k.alloc(100).unwrap(), a);

    assert_eq!(k.alloc(900), Err(Error::OutOfMemory));
    assert_eq!(FAILED_SIZE.load(Ordering::SeqCst), 900);

    let stats = k.heap_stats();
    assert_eq!(stats.alloc_count, 3);
    assert_eq!(stats.free_count, 1);
    assert_eq!(stats.fail_count, 1);
    assert_eq!(stats.used_blocks, 2);
}

/// Zero-size allocations and null frees are harmless no-ops; a pointer
/// that is not a live block is rejected as corruption.
#[test]
fn degenerate_requests() {
    let sim = SimKernel::new(1024);
    let k = sim.kernel();

    let z = k.alloc(0).unwrap();
    assert!(z.is_null());
    k.free(std::ptr::null_mut()).unwrap();

    let a = k.alloc(64).unwrap();
    assert_eq!(k.free(a.wrapping_add(4)), Err(Error::MemoryCorruption));
    k.free(a).unwrap();
    assert_eq!(k.free(a), Err(Error::MemoryCorruption));
}

/// Allocated-minus-freed equals the bytes held by used blocks across a
/// mixed sequence, and everything coalesces back to one region.
#[test]
fn conservation_across_churn() {
    let sim = SimKernel::new(8192);
    let k = sim.kernel();
    let baseline = k.heap_stats();
    assert_eq!(baseline.used_bytes, 0);

    let blocks: Vec<_> = (1..=8).map(|i| k.alloc(i * 40).unwrap()).collect();
    let mid = k.heap_stats();
    assert_eq!(mid.used_blocks, 8);
    assert!(mid.peak_used >= mid.used_bytes);

    for p in blocks {
        k.free(p).unwrap();
    }
    let end = k.heap_stats();
    assert_eq!(end.used_bytes, 0);
    assert_eq!(end.used_blocks, 0);
    assert_eq!(end.free_blocks, 1);
    assert_eq!(end.alloc_count, end.free_count);
}
