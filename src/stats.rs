//! Allocation statistics: thread-local batches flushed into process-wide
//! atomic totals.
//!
//! Every allocate/free/reallocate bumps a thread-local accumulator; once
//! every `STATS_FLUSH_INTERVAL` operations (or at snapshot time, or at
//! thread exit) the accumulator is added into the process counters with
//! relaxed ordering. Snapshots flush the calling thread first; whatever
//! other threads are still holding is accepted staleness. `bytes_in_use`
//! is derived from a signed delta and saturates at zero so transient
//! reorderings never show a negative footprint.

use std::cell::Cell;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::config::STATS_FLUSH_INTERVAL;

/// Monotonically increasing counter.
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge that can move both ways.
pub struct Gauge(AtomicI64);

impl Gauge {
    pub const fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn add(&self, value: i64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn sub(&self, value: i64) {
        self.0.fetch_sub(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Gauge value clamped at zero (for byte totals that can transiently
    /// dip negative under reordering).
    pub fn value_saturating(&self) -> usize {
        self.value().max(0) as usize
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide totals for the heap.
pub struct HeapStats {
    pub alloc_count: Counter,
    pub free_count: Counter,
    pub realloc_count: Counter,
    pub bytes_allocated: Counter,
    pub bytes_in_use: Gauge,
    pub bytes_mapped: Gauge,
    pub mmap_count: Counter,
    pub munmap_count: Counter,
}

impl HeapStats {
    pub const fn new() -> Self {
        Self {
            alloc_count: Counter::new(),
            free_count: Counter::new(),
            realloc_count: Counter::new(),
            bytes_allocated: Counter::new(),
            bytes_in_use: Gauge::new(),
            bytes_mapped: Gauge::new(),
            mmap_count: Counter::new(),
            munmap_count: Counter::new(),
        }
    }

    pub fn reset(&self) {
        self.alloc_count.reset();
        self.free_count.reset();
        self.realloc_count.reset();
        self.bytes_allocated.reset();
        self.bytes_in_use.reset();
        self.bytes_mapped.reset();
        self.mmap_count.reset();
        self.munmap_count.reset();
    }
}

pub static GLOBAL_STATS: HeapStats = HeapStats::new();

/// Point-in-time view of the process counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    pub alloc_count: u64,
    pub free_count: u64,
    pub realloc_count: u64,
    pub bytes_allocated: u64,
    pub bytes_in_use: usize,
    pub bytes_mapped: usize,
    pub mmap_count: u64,
    pub munmap_count: u64,
}

struct Batch {
    alloc_count: Cell<u64>,
    free_count: Cell<u64>,
    realloc_count: Cell<u64>,
    bytes_allocated: Cell<u64>,
    in_use_delta: Cell<i64>,
    ops: Cell<u32>,
}

impl Batch {
    const fn new() -> Self {
        Self {
            alloc_count: Cell::new(0),
            free_count: Cell::new(0),
            realloc_count: Cell::new(0),
            bytes_allocated: Cell::new(0),
            in_use_delta: Cell::new(0),
            ops: Cell::new(0),
        }
    }

    fn flush(&self) {
        let stats = &GLOBAL_STATS;
        if self.alloc_count.get() != 0 {
            stats.alloc_count.add(self.alloc_count.replace(0));
        }
        if self.free_count.get() != 0 {
            stats.free_count.add(self.free_count.replace(0));
        }
        if self.realloc_count.get() != 0 {
            stats.realloc_count.add(self.realloc_count.replace(0));
        }
        if self.bytes_allocated.get() != 0 {
            stats.bytes_allocated.add(self.bytes_allocated.replace(0));
        }
        let delta = self.in_use_delta.replace(0);
        if delta != 0 {
            stats.bytes_in_use.add(delta);
        }
        self.ops.set(0);
    }

    fn bump_ops(&self) {
        let ops = self.ops.get() + 1;
        self.ops.set(ops);
        if ops >= STATS_FLUSH_INTERVAL {
            self.flush();
        }
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        self.flush();
    }
}

thread_local! {
    static BATCH: Batch = const { Batch::new() };
}

/// Record a successful allocation of `requested` bytes served with
/// `usable` usable bytes.
pub fn record_alloc(requested: usize, usable: usize) {
    let _ = BATCH.try_with(|b| {
        b.alloc_count.set(b.alloc_count.get() + 1);
        b.bytes_allocated.set(b.bytes_allocated.get() + requested as u64);
        b.in_use_delta.set(b.in_use_delta.get() + usable as i64);
        b.bump_ops();
    });
}

/// Record a free returning `usable` bytes to the heap.
pub fn record_free(usable: usize) {
    let _ = BATCH.try_with(|b| {
        b.free_count.set(b.free_count.get() + 1);
        b.in_use_delta.set(b.in_use_delta.get() - usable as i64);
        b.bump_ops();
    });
}

pub fn record_realloc() {
    let _ = BATCH.try_with(|b| {
        b.realloc_count.set(b.realloc_count.get() + 1);
        b.bump_ops();
    });
}

/// OS mapping events go straight to the process counters; they are rare
/// enough not to batch.
pub fn record_mmap(bytes: usize) {
    GLOBAL_STATS.mmap_count.increment();
    GLOBAL_STATS.bytes_mapped.add(bytes as i64);
}

pub fn record_munmap(bytes: usize) {
    GLOBAL_STATS.munmap_count.increment();
    GLOBAL_STATS.bytes_mapped.sub(bytes as i64);
}

/// Flush the calling thread's batch into the process counters.
pub fn flush_current_thread() {
    let _ = BATCH.try_with(Batch::flush);
}

/// Flush the caller, then snapshot. Residuals on other threads show up at
/// their next flush.
pub fn snapshot() -> AllocatorStats {
    flush_current_thread();
    let stats = &GLOBAL_STATS;
    AllocatorStats {
        alloc_count: stats.alloc_count.value(),
        free_count: stats.free_count.value(),
        realloc_count: stats.realloc_count.value(),
        bytes_allocated: stats.bytes_allocated.value(),
        bytes_in_use: stats.bytes_in_use.value_saturating(),
        bytes_mapped: stats.bytes_mapped.value_saturating(),
        mmap_count: stats.mmap_count.value(),
        munmap_count: stats.munmap_count.value(),
    }
}

/// Zero everything (teardown). The calling thread's pending batch is
/// discarded rather than flushed into the fresh ledger.
pub fn reset() {
    let _ = BATCH.try_with(|b| {
        b.alloc_count.set(0);
        b.free_count.set(0);
        b.realloc_count.set(0);
        b.bytes_allocated.set(0);
        b.in_use_delta.set(0);
        b.ops.set(0);
    });
    GLOBAL_STATS.reset();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let c = Counter::new();
        c.increment();
        c.add(4);
        assert_eq!(c.value(), 5);
        c.reset();
        assert_eq!(c.value(), 0);

        let g = Gauge::new();
        g.add(10);
        g.sub(25);
        assert_eq!(g.value(), -15);
        assert_eq!(g.value_saturating(), 0);
    }

    #[test]
    fn test_batch_flushes_on_snapshot() {
        let _lock = crate::test_support::HEAP_TEST_LOCK.lock();
        let before = snapshot();
        record_alloc(100, 112);
        record_free(112);
        record_realloc();
        let after = snapshot();
        assert_eq!(after.alloc_count, before.alloc_count + 1);
        assert_eq!(after.free_count, before.free_count + 1);
        assert_eq!(after.realloc_count, before.realloc_count + 1);
        assert_eq!(after.bytes_allocated, before.bytes_allocated + 100);
        assert_eq!(after.bytes_in_use, before.bytes_in_use);
    }

    #[test]
    fn test_thread_exit_flushes_batch() {
        let _lock = crate::test_support::HEAP_TEST_LOCK.lock();
        let before = snapshot();
        std::thread::spawn(|| {
            // Fewer ops than the flush interval: only the TLS destructor
            // publishes these. Balanced so the in-use gauge nets to zero.
            record_alloc(64, 64);
            record_free(64);
        })
        .join()
        .unwrap();
        let after = snapshot();
        assert_eq!(after.alloc_count, before.alloc_count + 1);
        assert_eq!(after.free_count, before.free_count + 1);
        assert_eq!(after.bytes_in_use, before.bytes_in_use);
    }

    #[test]
    fn test_mapping_counters() {
        let _lock = crate::test_support::HEAP_TEST_LOCK.lock();
        let before = snapshot();
        record_mmap(4096);
        record_munmap(4096);
        let after = snapshot();
        assert_eq!(after.mmap_count, before.mmap_count + 1);
        assert_eq!(after.munmap_count, before.munmap_count + 1);
        assert_eq!(after.bytes_mapped, before.bytes_mapped);
    }
}
