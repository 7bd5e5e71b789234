//! Segment-based heap allocator.
//!
//! A general-purpose allocator serving a traditional allocate / free /
//! reallocate / zeroed-allocate surface out of a single pre-reserved
//! virtual range. Requests are bucketed into three size classes backed by
//! fixed-span pages inside 4 MiB segments; anything larger is direct-mapped
//! (XL) and tracked in a side table.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                    SegAllocator (public API)                   │
//! │  allocate / allocate_zeroed / reallocate / free / usable_size  │
//! └──────────────────────────────┬─────────────────────────────────┘
//!                                │
//! ┌──────────────────────────────▼─────────────────────────────────┐
//! │ Heap: 2 GiB reservation ── segment table ── XL table ── stats  │
//! │                                                                │
//! │  thread cache hints → class shards → segments → pages → chunks │
//! │  (cached page,        (non-full      (pinned     (bitmap +     │
//! │   preferred segment)   FIFO queue)    chunk size)  deferred    │
//! │                                                    free ring)  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cross-thread frees land in a per-page lock-free ring drained by the
//! owning thread; page state is guarded by a global stripe-lock table that
//! is bypassed entirely while only one thread is live.

pub mod class;
pub mod config;
pub mod heap;
pub mod os;
pub mod stats;

mod alloc;
mod chunk;
mod page;
mod ring;
mod segment;
mod shard;
mod tcache;

pub use alloc::{Allocator, AllocatorFeatures, AllocatorInfo, SegAllocator};
pub use class::SizeClass;
pub use stats::AllocatorStats;

/// Abort the process over an integrity breach, citing the failing
/// invariant and the call site. Every provenance, double-free, and
/// corruption check funnels through here.
#[track_caller]
pub(crate) fn die(message: &'static str) -> ! {
    let location = std::panic::Location::caller();
    eprintln!("integrity failure: {message} at {location}");
    std::process::abort();
}

#[cfg(test)]
pub(crate) mod test_support {
    use parking_lot::Mutex;

    /// Serializes every test that touches the process-wide heap or stats,
    /// so teardown/init cycles and byte accounting don't interleave.
    pub static HEAP_TEST_LOCK: Mutex<()> = Mutex::new(());
}
