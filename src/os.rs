//! OS virtual-memory primitives.
//!
//! Thin wrappers over mmap/mprotect/madvise. The heap reserves one large
//! `PROT_NONE` range up front and commits S-aligned slices of it on demand;
//! XL allocations and overflow segments get fresh aligned mappings. Failure
//! from any of these is reported to the caller (`None`/`false`) and never
//! terminates the process — the allocation pipeline falls back to its next
//! step instead.

use std::ptr::{self, NonNull};

/// Return the system page size (typically 4096).
pub fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

/// Reserve a contiguous virtual range with no access and no physical
/// commit. The base comes back segment-aligned: the heap carves the range
/// into S-aligned slices, so the reservation over-allocates by one segment
/// and trims the slop.
///
/// `MAP_NORESERVE` keeps the kernel from charging the full range against
/// overcommit accounting, so a 2 GiB reservation succeeds even on small
/// machines.
pub fn reserve_region(size: usize) -> Option<NonNull<u8>> {
    if size == 0 {
        return None;
    }
    let alignment = crate::config::SEGMENT_SIZE;
    let over = size.checked_add(alignment)?;
    // SAFETY: anonymous mapping with a null hint; the kernel picks the range.
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            over,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return None;
    }
    let raw = raw as usize;
    let aligned = crate::config::align_up(raw, alignment);
    let lead = aligned - raw;
    let tail = over - size - lead;
    // SAFETY: trims are subranges of the reservation outside [aligned,
    // aligned + size).
    unsafe {
        if lead > 0 {
            libc::munmap(raw as *mut libc::c_void, lead);
        }
        if tail > 0 {
            libc::munmap((aligned + size) as *mut libc::c_void, tail);
        }
    }
    NonNull::new(aligned as *mut u8)
}

/// Make a subrange of a prior reservation readable and writable.
pub fn commit_region(ptr: *mut u8, size: usize) -> bool {
    // SAFETY: caller passes a subrange of a mapping it owns.
    unsafe { libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
}

/// Obtain a fresh read-write mapping whose base is a multiple of `alignment`
/// (power of two). Over-allocates by `alignment` and trims the leading and
/// trailing slop with munmap.
pub fn alloc_aligned(size: usize, alignment: usize) -> Option<NonNull<u8>> {
    debug_assert!(alignment.is_power_of_two());
    let over = size.checked_add(alignment)?;
    // SAFETY: plain anonymous mapping.
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            over,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return None;
    }
    let raw = raw as usize;
    let aligned = crate::config::align_up(raw, alignment);
    let lead = aligned - raw;
    let tail = over - size - lead;
    // SAFETY: both trims are subranges of the mapping just obtained and do
    // not overlap [aligned, aligned + size).
    unsafe {
        if lead > 0 {
            libc::munmap(raw as *mut libc::c_void, lead);
        }
        if tail > 0 {
            libc::munmap((aligned + size) as *mut libc::c_void, tail);
        }
    }
    NonNull::new(aligned as *mut u8)
}

/// Release a mapping entirely, both virtual and physical.
pub fn free_mapping(ptr: *mut u8, size: usize) {
    // SAFETY: caller passes a mapping it owns in full.
    unsafe {
        libc::munmap(ptr as *mut libc::c_void, size);
    }
}

/// Release physical backing while keeping the virtual reservation. A later
/// read of the range observes zero-fill pages.
pub fn decommit(ptr: *mut u8, size: usize) {
    // SAFETY: caller passes a subrange of a private anonymous mapping.
    unsafe {
        libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_DONTNEED);
    }
}

/// Best-effort hint that a previously decommitted range is about to be
/// touched. Linux faults pages back in on access anyway, so this is only a
/// readahead hint.
pub fn commit(ptr: *mut u8, size: usize) {
    // SAFETY: as for decommit.
    unsafe {
        libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_WILLNEED);
    }
}

/// Remove all permissions on a range; any access faults.
pub fn protect_none(ptr: *mut u8, size: usize) -> bool {
    // SAFETY: caller owns the mapping.
    unsafe { libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_NONE) == 0 }
}

/// Restore read-write on a range.
pub fn protect_rw(ptr: *mut u8, size: usize) -> bool {
    // SAFETY: caller owns the mapping.
    unsafe { libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
}

/// Mark a range read-only.
pub fn protect_ro(ptr: *mut u8, size: usize) -> bool {
    // SAFETY: caller owns the mapping.
    unsafe { libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_READ) == 0 }
}

/// Set up an inter-segment guard: a range that faults on any access.
pub fn setup_guard(ptr: *mut u8, size: usize) -> bool {
    protect_none(ptr, size)
}

/// Attempt a huge-page mapping, falling back to an ordinary anonymous
/// mapping when the system has no huge pages configured.
pub fn alloc_huge(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: anonymous mapping; MAP_HUGETLB fails cleanly when unsupported.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
            -1,
            0,
        )
    };
    if ptr != libc::MAP_FAILED {
        return NonNull::new(ptr as *mut u8);
    }
    // SAFETY: plain fallback mapping.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(ptr as *mut u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_write() {
        let size = 1 << 20;
        let base = reserve_region(size).expect("reserve failed");
        assert_eq!(
            base.as_ptr() as usize & (crate::config::SEGMENT_SIZE - 1),
            0,
            "reservation must be segment-aligned"
        );
        assert!(commit_region(base.as_ptr(), 4096));
        unsafe {
            base.as_ptr().write(0xAB);
            assert_eq!(base.as_ptr().read(), 0xAB);
        }
        free_mapping(base.as_ptr(), size);
    }

    #[test]
    fn test_decommit_zeroes() {
        let size = 64 * 1024;
        let base = reserve_region(size).expect("reserve failed");
        assert!(commit_region(base.as_ptr(), size));
        unsafe {
            base.as_ptr().write_bytes(0x5A, size);
        }
        decommit(base.as_ptr(), size);
        // A private anonymous range reads back zero after MADV_DONTNEED.
        unsafe {
            assert_eq!(base.as_ptr().read(), 0);
            assert_eq!(base.as_ptr().add(size - 1).read(), 0);
        }
        free_mapping(base.as_ptr(), size);
    }

    #[test]
    fn test_alloc_aligned_alignment() {
        let align = 4 << 20;
        let base = alloc_aligned(align, align).expect("aligned alloc failed");
        assert_eq!(base.as_ptr() as usize & (align - 1), 0);
        unsafe {
            base.as_ptr().write(1);
        }
        free_mapping(base.as_ptr(), align);
    }

    #[test]
    fn test_alloc_huge_falls_back() {
        // With no hugetlb pool configured this exercises the fallback path;
        // either way the mapping must be usable.
        let size = 2 << 20;
        let base = alloc_huge(size).expect("huge alloc failed");
        unsafe {
            base.as_ptr().write(7);
            assert_eq!(base.as_ptr().read(), 7);
        }
        free_mapping(base.as_ptr(), size);
    }

    #[test]
    fn test_protect_roundtrip() {
        let size = 4096;
        let base = alloc_aligned(size, 4096).expect("alloc failed");
        assert!(protect_ro(base.as_ptr(), size));
        assert!(protect_none(base.as_ptr(), size));
        assert!(protect_rw(base.as_ptr(), size));
        unsafe {
            base.as_ptr().write(3);
        }
        free_mapping(base.as_ptr(), size);
    }
}
