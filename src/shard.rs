//! Per-size-class shard: the index of segments belonging to a class plus a
//! FIFO of segments known to have free space.
//!
//! The non-full queue is a lock-free `Injector`; duplicate entries are
//! suppressed by the segment's own queued-once CAS flag, so a segment
//! appears at most once. The segment list is a small mutex-guarded vector
//! that allocation's bounded scan snapshots.

use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;

use crate::class::SizeClass;

pub struct ClassShard {
    class: SizeClass,
    /// Indices (into the heap's segment table) of every segment of this
    /// class, in registration order.
    segments: Mutex<Vec<u32>>,
    /// FIFO of segment indices believed to have free space.
    non_full: Injector<u32>,
}

impl ClassShard {
    pub fn new(class: SizeClass) -> Self {
        Self {
            class,
            segments: Mutex::new(Vec::new()),
            non_full: Injector::new(),
        }
    }

    #[inline]
    pub fn class(&self) -> SizeClass {
        self.class
    }

    /// Register a newly committed segment with this shard.
    pub fn register(&self, index: u32) {
        self.segments.lock().push(index);
    }

    /// Append a segment index to the non-full queue. The caller must have
    /// won the segment's `try_mark_enqueued` flag first.
    pub fn push_non_full(&self, index: u32) {
        self.non_full.push(index);
    }

    /// Take the oldest queued non-full segment, if any. A contended steal
    /// is treated as empty; the caller has further fallbacks.
    pub fn pop_non_full(&self) -> Option<u32> {
        match self.non_full.steal() {
            Steal::Success(index) => Some(index),
            Steal::Empty | Steal::Retry => None,
        }
    }

    /// Copy of the segment list for the bounded scan. Taken under the shard
    /// lock so the scan never holds the lock while touching pages.
    pub fn snapshot(&self) -> Vec<u32> {
        self.segments.lock().clone()
    }

    /// Drop all shard state (teardown).
    pub fn clear(&self) {
        self.segments.lock().clear();
        while self.pop_non_full().is_some() {}
    }
}
