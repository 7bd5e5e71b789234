//! Per-thread allocation hints.
//!
//! Each thread lazily gets a cache holding, per size class, the page it
//! last allocated from and the segment it should try next. Both are hints:
//! every consumer re-validates before use (initialization check on the
//! allocate path, chunk-header provenance on the free path), so a stale
//! entry costs a retry, never correctness.
//!
//! Thread caches also maintain the process-wide live-thread count that
//! switches the engine between the locked multi-threaded paths and the
//! lock-free single-threaded fast paths.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::class::{CLASS_COUNT, SizeClass};
use crate::page::Page;

static LIVE_THREADS: AtomicU32 = AtomicU32::new(0);
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Bumped at every heap teardown. A cache whose recorded epoch is behind
/// drops all its hints before serving them: pointers into a dismantled
/// segment table must never survive a teardown/init cycle.
static HEAP_EPOCH: AtomicU64 = AtomicU64::new(0);

/// Invalidate every thread's hints (called from heap teardown).
pub fn bump_heap_epoch() {
    HEAP_EPOCH.fetch_add(1, Ordering::Release);
}

struct ThreadCache {
    tid: u64,
    active: Cell<bool>,
    epoch: Cell<u64>,
    cached_page: [Cell<*const Page>; CLASS_COUNT],
    preferred_seg: [Cell<u32>; CLASS_COUNT],
    preferred_valid: [Cell<bool>; CLASS_COUNT],
}

impl ThreadCache {
    fn new() -> Self {
        LIVE_THREADS.fetch_add(1, Ordering::Relaxed);
        Self {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            active: Cell::new(true),
            epoch: Cell::new(HEAP_EPOCH.load(Ordering::Acquire)),
            cached_page: [const { Cell::new(std::ptr::null()) }; CLASS_COUNT],
            preferred_seg: [const { Cell::new(0) }; CLASS_COUNT],
            preferred_valid: [const { Cell::new(false) }; CLASS_COUNT],
        }
    }

    /// Drop stale hints after a teardown elsewhere in the process.
    fn sync_epoch(&self) {
        let now = HEAP_EPOCH.load(Ordering::Acquire);
        if self.epoch.get() != now {
            for i in 0..CLASS_COUNT {
                self.cached_page[i].set(std::ptr::null());
                self.preferred_valid[i].set(false);
            }
            self.epoch.set(now);
        }
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        self.active.set(false);
        LIVE_THREADS.fetch_sub(1, Ordering::Relaxed);
    }
}

thread_local! {
    static TCACHE: ThreadCache = ThreadCache::new();
}

/// More than one thread alive right now? Relaxed read: the mode switch is a
/// latency optimization, not a synchronization point.
#[inline]
pub fn is_multi_threaded() -> bool {
    LIVE_THREADS.load(Ordering::Relaxed) > 1
}

/// This thread's allocator id (never 0 for a live thread; 0 means the
/// cache is gone, e.g. during thread teardown).
pub fn current_tid() -> u64 {
    TCACHE.try_with(|tc| tc.tid).unwrap_or(0)
}

/// The cached page for a class, or null.
pub fn cached_page(class: SizeClass) -> *const Page {
    TCACHE
        .try_with(|tc| {
            tc.sync_epoch();
            if tc.active.get() {
                tc.cached_page[class.index()].get()
            } else {
                std::ptr::null()
            }
        })
        .unwrap_or(std::ptr::null())
}

/// Remember the page that just served (or absorbed) an operation so repeat
/// work in this class stays local.
pub fn set_cached_page(class: SizeClass, page: *const Page) {
    let _ = TCACHE.try_with(|tc| {
        tc.sync_epoch();
        tc.cached_page[class.index()].set(page);
    });
}

/// Evict the cached page for a class if it is `page` (used when a page
/// goes empty or is retired).
pub fn clear_cached_page_if(class: SizeClass, page: *const Page) {
    let _ = TCACHE.try_with(|tc| {
        tc.sync_epoch();
        let slot = &tc.cached_page[class.index()];
        if slot.get() == page {
            slot.set(std::ptr::null());
        }
    });
}

/// The preferred segment index for a class, if one is set.
pub fn preferred_segment(class: SizeClass) -> Option<u32> {
    TCACHE
        .try_with(|tc| {
            tc.sync_epoch();
            if tc.active.get() && tc.preferred_valid[class.index()].get() {
                Some(tc.preferred_seg[class.index()].get())
            } else {
                None
            }
        })
        .unwrap_or(None)
}

pub fn set_preferred_segment(class: SizeClass, index: u32) {
    let _ = TCACHE.try_with(|tc| {
        tc.sync_epoch();
        tc.preferred_seg[class.index()].set(index);
        tc.preferred_valid[class.index()].set(true);
    });
}

/// Drop all hints (teardown: pages and segments are gone).
pub fn invalidate_all() {
    let _ = TCACHE.try_with(|tc| {
        for i in 0..CLASS_COUNT {
            tc.cached_page[i].set(std::ptr::null());
            tc.preferred_valid[i].set(false);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tid_stable_and_nonzero() {
        let tid = current_tid();
        assert_ne!(tid, 0);
        assert_eq!(current_tid(), tid);
    }

    #[test]
    fn test_tids_differ_across_threads() {
        let here = current_tid();
        let there = std::thread::spawn(current_tid).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_cached_page_roundtrip() {
        // Serialize with heap tests: a teardown elsewhere bumps the epoch
        // and would evict the hints planted here.
        let _lock = crate::test_support::HEAP_TEST_LOCK.lock();
        let fake = 0x4000 as *const Page;
        set_cached_page(SizeClass::Small, fake);
        assert_eq!(cached_page(SizeClass::Small), fake);
        // Clearing a different pointer is a no-op.
        clear_cached_page_if(SizeClass::Small, 0x8000 as *const Page);
        assert_eq!(cached_page(SizeClass::Small), fake);
        clear_cached_page_if(SizeClass::Small, fake);
        assert!(cached_page(SizeClass::Small).is_null());
    }

    #[test]
    fn test_preferred_segment_roundtrip() {
        let _lock = crate::test_support::HEAP_TEST_LOCK.lock();
        assert_eq!(preferred_segment(SizeClass::Medium), None);
        set_preferred_segment(SizeClass::Medium, 5);
        assert_eq!(preferred_segment(SizeClass::Medium), Some(5));
        invalidate_all();
        assert_eq!(preferred_segment(SizeClass::Medium), None);
    }

    #[test]
    fn test_multi_threaded_mode_observed() {
        // Touch our own cache first so the counter includes this thread.
        let _ = current_tid();
        let handle = std::thread::spawn(|| {
            let _ = current_tid();
            // Two caches exist now, whatever other test threads are doing.
            assert!(is_multi_threaded());
        });
        handle.join().unwrap();
    }
}
