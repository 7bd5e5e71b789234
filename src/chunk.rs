//! Chunk and XL provenance headers.
//!
//! Every user pointer handed out by the engine is preceded by a fixed
//! header that records where the memory came from. The free path trusts
//! nothing else: a pointer is "ours" exactly when its header validates.
//!
//! Chunk header layout (16 bytes, immediately before the user pointer):
//! ```text
//! [0..8]   owner_page: address of the owning Page metadata
//! [8..12]  slot: index of the chunk's slot within the page
//! [12..16] magic: CHUNK_MAGIC
//! ```
//!
//! XL header layout (32 bytes, immediately before the user pointer):
//! ```text
//! [0..8]   magic: XL_MAGIC
//! [8..16]  mapping_size: full size of the OS mapping
//! [16..24] usable_size: bytes usable by the caller
//! [24..32] reserved (zero)
//! ```
//! The zeroed reserved word overlaps where a chunk header's magic would
//! sit, so reading an XL user pointer through the chunk path can never
//! produce a false magic match.

use crate::config::{CHUNK_HEADER_SIZE, CHUNK_ALIGN};
use crate::page::Page;

/// Magic marking a header written by the chunk path ("SEGC").
pub const CHUNK_MAGIC: u32 = 0x5345_4743;

/// Magic marking a direct-mapped XL allocation ("SEGALLOX").
pub const XL_MAGIC: u64 = 0x5345_4741_4C4C_4F58;

/// Size of the XL header in bytes.
pub const XL_HEADER_SIZE: usize = 32;

/// Provenance header preceding every chunk-path user pointer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ChunkHeader {
    pub owner_page: *mut Page,
    pub slot: u32,
    pub magic: u32,
}

const _: () = assert!(std::mem::size_of::<ChunkHeader>() == CHUNK_HEADER_SIZE);
const _: () = assert!(CHUNK_HEADER_SIZE % CHUNK_ALIGN == 0);

impl ChunkHeader {
    /// Read the candidate header preceding `user_ptr`.
    ///
    /// The bytes may be arbitrary garbage (the caller is probing a pointer
    /// of unknown provenance), so the result must be validated before any
    /// field is trusted. An unaligned read keeps this safe for pointers the
    /// engine never produced.
    ///
    /// # Safety
    /// The 16 bytes below `user_ptr` must be mapped readable.
    #[inline]
    pub unsafe fn read(user_ptr: *const u8) -> ChunkHeader {
        (user_ptr.sub(CHUNK_HEADER_SIZE) as *const ChunkHeader).read_unaligned()
    }

    /// Write a fresh header below `user_ptr`. Done on every allocation; the
    /// header is never touched again while the chunk is live.
    ///
    /// # Safety
    /// The 16 bytes below `user_ptr` must be mapped writable and owned by
    /// the slot being allocated.
    #[inline]
    pub unsafe fn write(user_ptr: *mut u8, owner_page: *mut Page, slot: u32) {
        let header = ChunkHeader {
            owner_page,
            slot,
            magic: CHUNK_MAGIC,
        };
        (user_ptr.sub(CHUNK_HEADER_SIZE) as *mut ChunkHeader).write(header)
    }

    /// First-stage gate: does this even claim to be ours?
    #[inline]
    pub fn looks_valid(&self) -> bool {
        self.magic == CHUNK_MAGIC && !self.owner_page.is_null()
    }
}

/// Header preceding an XL (direct-mapped) user pointer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct XlHeader {
    pub magic: u64,
    pub mapping_size: usize,
    pub usable_size: usize,
    reserved: u64,
}

const _: () = assert!(std::mem::size_of::<XlHeader>() == XL_HEADER_SIZE);
const _: () = assert!(XL_HEADER_SIZE % CHUNK_ALIGN == 0);

impl XlHeader {
    /// Read the XL header preceding `user_ptr`.
    ///
    /// # Safety
    /// The 32 bytes below `user_ptr` must be mapped readable.
    #[inline]
    pub unsafe fn read(user_ptr: *const u8) -> XlHeader {
        (user_ptr.sub(XL_HEADER_SIZE) as *const XlHeader).read_unaligned()
    }

    /// Write the XL header at the start of a fresh mapping; `user_ptr` is
    /// `mapping_base + XL_HEADER_SIZE`.
    ///
    /// # Safety
    /// The 32 bytes below `user_ptr` must be the start of a mapping owned
    /// by the XL path.
    #[inline]
    pub unsafe fn write(user_ptr: *mut u8, mapping_size: usize, usable_size: usize) {
        let header = XlHeader {
            magic: XL_MAGIC,
            mapping_size,
            usable_size,
            reserved: 0,
        };
        (user_ptr.sub(XL_HEADER_SIZE) as *mut XlHeader).write(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Headers are written with aligned stores in real pages; give the test
    /// buffers the same alignment.
    #[repr(align(16))]
    struct AlignedBuf([u8; 64]);

    #[test]
    fn test_chunk_header_roundtrip() {
        let mut buf = AlignedBuf([0; 64]);
        let user = unsafe { buf.0.as_mut_ptr().add(CHUNK_HEADER_SIZE) };
        let fake_page = 0x1000 as *mut Page;
        unsafe {
            ChunkHeader::write(user, fake_page, 7);
            let header = ChunkHeader::read(user);
            assert!(header.looks_valid());
            assert_eq!(header.owner_page, fake_page);
            assert_eq!(header.slot, 7);
        }
    }

    #[test]
    fn test_garbage_does_not_look_valid() {
        let buf = AlignedBuf([0; 64]);
        let user = unsafe { buf.0.as_ptr().add(CHUNK_HEADER_SIZE) };
        let header = unsafe { ChunkHeader::read(user) };
        assert!(!header.looks_valid());
    }

    #[test]
    fn test_xl_header_roundtrip() {
        let mut buf = AlignedBuf([0; 64]);
        let user = unsafe { buf.0.as_mut_ptr().add(XL_HEADER_SIZE) };
        unsafe {
            XlHeader::write(user, 8192, 4096);
            let header = XlHeader::read(user);
            assert_eq!(header.magic, XL_MAGIC);
            assert_eq!(header.mapping_size, 8192);
            assert_eq!(header.usable_size, 4096);
        }
    }

    #[test]
    fn test_xl_bytes_never_match_chunk_magic() {
        // The 16 bytes an XL user pointer exposes to the chunk probe are
        // {usable_size, reserved}; reserved is always zero, which lands in
        // the chunk magic field.
        let mut buf = AlignedBuf([0xFF; 64]);
        let user = unsafe { buf.0.as_mut_ptr().add(XL_HEADER_SIZE) };
        unsafe {
            XlHeader::write(user, 8192, usize::MAX);
            let probe = ChunkHeader::read(user);
            assert!(!probe.looks_valid());
        }
    }
}
