//! Host-facing allocator interface.
//!
//! One narrow trait, one implementation. The trait mirrors the operations a
//! C-style allocator table would carry — the host's name resolution stands
//! in for the function pointers.

use std::ptr;

use crate::heap::Heap;
use crate::stats::{self, AllocatorStats};

/// The public allocator surface: one method per operation.
pub trait Allocator {
    /// Prepare the heap. 0 on success, nonzero on failure. Idempotent once
    /// successful.
    fn initialize(&self) -> i32;

    /// Release the reservation and all XL mappings. Safe only when no
    /// allocations remain owned by the caller.
    fn teardown(&self);

    fn allocate(&self, size: usize) -> *mut u8;

    /// `nmemb * size` zeroed bytes; null on multiplication overflow or OOM.
    fn allocate_zeroed(&self, nmemb: usize, size: usize) -> *mut u8;

    /// Grow or shrink. Null `ptr` allocates; zero `new_size` frees and
    /// returns null; a request already covered by the chunk's usable size
    /// returns `ptr` unchanged.
    fn reallocate(&self, ptr: *mut u8, new_size: usize) -> *mut u8;

    fn free(&self, ptr: *mut u8);

    fn usable_size(&self, ptr: *mut u8) -> usize;

    /// Flush the calling thread's stats batch and copy the process totals
    /// into `out`.
    fn snapshot_stats(&self, out: &mut AllocatorStats) -> bool;

    fn validate_heap(&self) -> bool;

    fn set_zero_on_free(&self, enabled: bool);

    fn set_uaf_check(&self, enabled: bool);
}

/// Capability flags reported alongside the allocator.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorFeatures {
    pub thread_safe: bool,
    pub per_thread_cache: bool,
    pub huge_page_support: bool,
    pub guard_pages: bool,
    pub canaries: bool,
    pub quarantine: bool,
    pub zero_on_free: bool,
    pub min_alignment: usize,
    pub max_alignment: usize,
}

/// Descriptive metadata for hosts that enumerate allocators.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub memory_backend: &'static str,
    pub features: AllocatorFeatures,
}

/// The engine's sole `Allocator` implementation, backed by the process-wide
/// heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct SegAllocator;

impl SegAllocator {
    pub const fn new() -> Self {
        SegAllocator
    }

    pub const INFO: AllocatorInfo = AllocatorInfo {
        name: "segalloc",
        version: env!("CARGO_PKG_VERSION"),
        description: "segment/page/chunk heap with per-thread caches",
        memory_backend: "mmap",
        features: AllocatorFeatures {
            thread_safe: true,
            per_thread_cache: true,
            huge_page_support: false,
            guard_pages: false,
            canaries: false,
            quarantine: false,
            zero_on_free: false,
            min_alignment: crate::config::CHUNK_ALIGN,
            max_alignment: crate::config::CHUNK_ALIGN,
        },
    };

    pub fn info(&self) -> &'static AllocatorInfo {
        &Self::INFO
    }

    /// Write a human-readable snapshot to stdout.
    pub fn print_stats(&self) {
        let snapshot = stats::snapshot();
        println!("  Allocations:   {}", snapshot.alloc_count);
        println!("  Frees:         {}", snapshot.free_count);
        println!("  Reallocs:      {}", snapshot.realloc_count);
        println!("  Bytes in use:  {}", snapshot.bytes_in_use);
        println!("  Bytes mapped:  {}", snapshot.bytes_mapped);
        println!("  mmap calls:    {}", snapshot.mmap_count);
        println!("  munmap calls:  {}", snapshot.munmap_count);
    }
}

impl Allocator for SegAllocator {
    fn initialize(&self) -> i32 {
        if Heap::global().ensure_initialized() {
            0
        } else {
            -1
        }
    }

    fn teardown(&self) {
        Heap::global().clear_metadata();
    }

    fn allocate(&self, size: usize) -> *mut u8 {
        Heap::global().allocate(size)
    }

    fn allocate_zeroed(&self, nmemb: usize, size: usize) -> *mut u8 {
        let Some(total) = nmemb.checked_mul(size) else {
            return ptr::null_mut();
        };
        let user_ptr = self.allocate(total);
        if !user_ptr.is_null() {
            // Chunk slots are recycled dirty; the zeroing here is the
            // contract, not an optimization.
            // SAFETY: a non-null return covers at least `total` bytes.
            unsafe {
                user_ptr.write_bytes(0, total);
            }
        }
        user_ptr
    }

    fn reallocate(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        if new_size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }

        let old_usable = Heap::global().usable_size(ptr);
        if old_usable >= new_size {
            stats::record_realloc();
            return ptr;
        }

        let new_ptr = self.allocate(new_size);
        if new_ptr.is_null() {
            return ptr::null_mut();
        }
        // SAFETY: both ranges are live allocations this engine handed out;
        // the copy length is within each.
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size));
        }
        self.free(ptr);
        stats::record_realloc();
        new_ptr
    }

    fn free(&self, ptr: *mut u8) {
        Heap::global().free_ptr(ptr);
    }

    fn usable_size(&self, ptr: *mut u8) -> usize {
        Heap::global().usable_size(ptr)
    }

    fn snapshot_stats(&self, out: &mut AllocatorStats) -> bool {
        *out = stats::snapshot();
        true
    }

    fn validate_heap(&self) -> bool {
        Heap::global().validate()
    }

    fn set_zero_on_free(&self, enabled: bool) {
        Heap::global().set_zero_on_free(enabled);
    }

    fn set_uaf_check(&self, enabled: bool) {
        Heap::global().set_uaf_check(enabled);
    }
}
