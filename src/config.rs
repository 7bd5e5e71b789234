//! Compile-time geometry and tunables for the heap engine.
//!
//! Everything here is fixed at build time. The segment size is the virtual
//! alignment unit: every segment occupies one S-aligned slice of the
//! reserved region, which is what makes page lookup from a chunk header a
//! constant-time operation.

/// log2 of the segment size.
pub const SEGMENT_SHIFT: usize = 22;

/// Size in bytes of one segment (4 MiB). Segment alignment equals this.
pub const SEGMENT_SIZE: usize = 1 << SEGMENT_SHIFT;

/// Mask for the offset-within-segment bits of a pointer.
pub const SEGMENT_MASK: usize = SEGMENT_SIZE - 1;

/// Default virtual reservation backing the whole heap (2 GiB).
pub const HEAP_RESERVED_DEFAULT: usize = 2 << 30;

/// log2 of the small page span (64 KiB).
pub const SMALL_PAGE_SHIFT: usize = 16;

/// log2 of the medium page span (512 KiB).
pub const MEDIUM_PAGE_SHIFT: usize = 19;

/// Span of a small-class page.
pub const SMALL_PAGE_SIZE: usize = 1 << SMALL_PAGE_SHIFT;

/// Span of a medium-class page.
pub const MEDIUM_PAGE_SIZE: usize = 1 << MEDIUM_PAGE_SHIFT;

/// Span of a large-class page: the whole segment, one page per segment.
pub const LARGE_PAGE_SIZE: usize = SEGMENT_SIZE;

/// Bytes of provenance header preceding every user pointer.
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Natural alignment of user pointers and chunk strides.
pub const CHUNK_ALIGN: usize = 16;

/// Largest request routed to the small class. Half a small page minus the
/// header, so a page at the threshold still holds two chunks.
pub const SMALL_CHUNK_MAX: usize = SMALL_PAGE_SIZE / 2 - CHUNK_HEADER_SIZE;

/// Largest request routed to the medium class.
pub const MEDIUM_CHUNK_MAX: usize = MEDIUM_PAGE_SIZE / 2 - CHUNK_HEADER_SIZE;

/// Largest request routed to the large class by threshold alone.
pub const LARGE_CHUNK_MAX: usize = LARGE_PAGE_SIZE / 2 - CHUNK_HEADER_SIZE;

/// Upper bound for demoting an over-threshold request into a large page
/// instead of taking the XL direct-mapped path.
pub const LARGE_FIT_LIMIT: usize = LARGE_PAGE_SIZE - CHUNK_HEADER_SIZE;

/// Requests at or above this are rejected outright.
pub const REQUEST_SANITY_LIMIT: usize = usize::MAX - 4096;

/// Number of page stripe locks. A page's lock is chosen by hashing the page
/// metadata address into this table.
pub const PAGE_LOCK_STRIPES: usize = 2048;

/// Capacity of each page's deferred-free ring. Power of two for masked
/// indexing.
pub const DEFERRED_RING_CAPACITY: usize = 256;

/// Ring occupancy at which the owning thread bothers draining before an
/// allocation.
pub const DEFERRED_DRAIN_THRESHOLD: usize = 32;

/// Upper bound on ring entries drained per allocation call.
pub const DEFERRED_DRAIN_BATCH: usize = 16;

/// Max segments dequeued from a class shard's non-full queue per allocation.
pub const QUEUE_PROBE_LIMIT: usize = 64;

/// Max segments tried from a shard's snapshot scan per allocation.
pub const SCAN_LIMIT: usize = 128;

/// Thread-local operations between flushes into the process-wide counters.
pub const STATS_FLUSH_INTERVAL: u32 = 1024;

const _: () = assert!(SEGMENT_SIZE.is_power_of_two());
const _: () = assert!(SMALL_PAGE_SIZE.is_power_of_two());
const _: () = assert!(MEDIUM_PAGE_SIZE.is_power_of_two());
const _: () = assert!(LARGE_PAGE_SIZE == SEGMENT_SIZE);
const _: () = assert!(DEFERRED_RING_CAPACITY.is_power_of_two());
const _: () = assert!(PAGE_LOCK_STRIPES.is_power_of_two());
const _: () = assert!(CHUNK_HEADER_SIZE % CHUNK_ALIGN == 0);
const _: () = assert!(SMALL_CHUNK_MAX % CHUNK_ALIGN == 0);
const _: () = assert!(MEDIUM_CHUNK_MAX % CHUNK_ALIGN == 0);
const _: () = assert!(LARGE_CHUNK_MAX % CHUNK_ALIGN == 0);
const _: () = assert!(HEAP_RESERVED_DEFAULT % SEGMENT_SIZE == 0);

/// Round `size` up to a multiple of `alignment` (power of two).
#[inline]
pub const fn align_up(size: usize, alignment: usize) -> usize {
    (size + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0x37, 0x10), 0x40);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(0, 16), 0);
    }

    #[test]
    fn test_threshold_geometry() {
        // A maximal request still leaves room for two chunks per page.
        assert_eq!(SMALL_CHUNK_MAX + CHUNK_HEADER_SIZE, SMALL_PAGE_SIZE / 2);
        assert_eq!(MEDIUM_CHUNK_MAX + CHUNK_HEADER_SIZE, MEDIUM_PAGE_SIZE / 2);
        assert_eq!(LARGE_CHUNK_MAX + CHUNK_HEADER_SIZE, LARGE_PAGE_SIZE / 2);
        assert!(LARGE_FIT_LIMIT > LARGE_CHUNK_MAX);
    }
}
