//! Allocation throughput across the size classes.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use segalloc::{Allocator, SegAllocator};

const OPS: u64 = 100_000;

/// Paired allocate/free of one size, back to back. Exercises the
/// cached-page fast path after the first iteration.
fn alloc_free_pairs(alloc: &SegAllocator, size: usize) {
    for _ in 0..OPS {
        let ptr = alloc.allocate(size);
        black_box(ptr);
        alloc.free(ptr);
    }
}

/// A sliding window of live allocations, so frees land on partially-used
/// pages instead of always re-emptying one slot.
fn alloc_free_windowed(alloc: &SegAllocator, size: usize) {
    const WINDOW: usize = 64;
    let mut live = [std::ptr::null_mut(); WINDOW];
    for i in 0..OPS as usize {
        let slot = i % WINDOW;
        if !live[slot].is_null() {
            alloc.free(live[slot]);
        }
        live[slot] = alloc.allocate(size);
        black_box(live[slot]);
    }
    for ptr in live {
        if !ptr.is_null() {
            alloc.free(ptr);
        }
    }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
    let alloc = SegAllocator::new();
    assert_eq!(alloc.initialize(), 0);

    let mut group = c.benchmark_group("alloc_throughput");
    for size in [16usize, 64, 256, 1024, 4096, 32 * 1024] {
        group.throughput(Throughput::Elements(OPS));
        group.bench_with_input(BenchmarkId::new("pairs", size), &size, |b, &size| {
            b.iter(|| alloc_free_pairs(&alloc, size))
        });
        group.bench_with_input(BenchmarkId::new("windowed", size), &size, |b, &size| {
            b.iter(|| alloc_free_windowed(&alloc, size))
        });
    }
    group.finish();
}

fn benchmark_realloc_growth(c: &mut Criterion) {
    let alloc = SegAllocator::new();
    assert_eq!(alloc.initialize(), 0);

    let mut group = c.benchmark_group("realloc_growth");
    group.throughput(Throughput::Elements(1));
    group.bench_function("double_to_64k", |b| {
        b.iter(|| {
            let mut ptr = alloc.allocate(16);
            let mut size = 16usize;
            while size < 64 * 1024 {
                size *= 2;
                ptr = alloc.reallocate(ptr, size);
                black_box(ptr);
            }
            alloc.free(ptr);
        })
    });
    group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput, benchmark_realloc_growth);
criterion_main!(benches);
