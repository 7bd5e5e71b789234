//! The heap: owner of the reserved region, the segment table, the XL
//! direct-map table, and the allocation / free dispatch pipelines.
//!
//! One heap exists per process, created on first use. Segments are
//! committed out of a single 2 GiB `PROT_NONE` reservation (preferred) or
//! fresh S-aligned mappings once the reservation runs dry. Virtual address
//! space is never returned to the OS while the heap lives — teardown
//! releases the reservation, every overflow segment, and every XL mapping
//! in one sweep.
//!
//! Lock hierarchy, outermost first: heap lock → segment-table lock →
//! class-shard lock → page stripe lock. The segment-table write guard is
//! always dropped before a shard lock is taken.

use std::collections::HashMap;
use std::ptr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use parking_lot::{Mutex, RwLock};

use crate::chunk::{ChunkHeader, XL_HEADER_SIZE, XL_MAGIC, XlHeader};
use crate::class::{CLASS_COUNT, SizeClass};
use crate::config::{
    HEAP_RESERVED_DEFAULT, QUEUE_PROBE_LIMIT, REQUEST_SANITY_LIMIT, SCAN_LIMIT, SEGMENT_SIZE,
    align_up,
};
use crate::die;
use crate::os;
use crate::page::PageStatus;
use crate::segment::Segment;
use crate::shard::ClassShard;
use crate::stats;
use crate::tcache;

struct XlEntry {
    mapping_size: usize,
    usable_size: usize,
}

/// State guarded by the heap lock: the reservation cursor and the XL table.
struct HeapInner {
    initialized: bool,
    reserved_base: usize,
    reserved_size: usize,
    reserved_cursor: usize,
    xl_table: HashMap<usize, XlEntry, RandomState>,
}

pub struct Heap {
    inner: Mutex<HeapInner>,
    /// All committed segments, indexed by the id recorded in each page.
    /// Arc so dispatch paths never hold the table guard across page work.
    segments: RwLock<Vec<Arc<Segment>>>,
    shards: [ClassShard; CLASS_COUNT],
    canary: AtomicU64,
    /// Lock-free mirror of `inner.initialized` for the hot paths.
    ready: AtomicBool,
    zero_on_free: AtomicBool,
    uaf_check: AtomicBool,
}

static HEAP: OnceLock<Heap> = OnceLock::new();

impl Heap {
    pub fn global() -> &'static Heap {
        HEAP.get_or_init(Heap::new)
    }

    fn new() -> Self {
        Self {
            inner: Mutex::new(HeapInner {
                initialized: false,
                reserved_base: 0,
                reserved_size: 0,
                reserved_cursor: 0,
                xl_table: HashMap::with_hasher(RandomState::new()),
            }),
            segments: RwLock::new(Vec::new()),
            shards: [
                ClassShard::new(SizeClass::Small),
                ClassShard::new(SizeClass::Medium),
                ClassShard::new(SizeClass::Large),
            ],
            canary: AtomicU64::new(0),
            ready: AtomicBool::new(false),
            zero_on_free: AtomicBool::new(false),
            uaf_check: AtomicBool::new(false),
        }
    }

    pub fn set_zero_on_free(&self, enabled: bool) {
        self.zero_on_free.store(enabled, Ordering::Relaxed);
    }

    pub fn set_uaf_check(&self, enabled: bool) {
        self.uaf_check.store(enabled, Ordering::Relaxed);
    }

    /// Reserve the region and seed one segment per class. Idempotent; safe
    /// to call again after `clear_metadata`.
    pub fn ensure_initialized(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.initialized {
            return true;
        }
        let Some(base) = os::reserve_region(HEAP_RESERVED_DEFAULT) else {
            return false;
        };
        stats::record_mmap(HEAP_RESERVED_DEFAULT);
        self.init_reserved_locked(&mut inner, base.as_ptr() as usize, HEAP_RESERVED_DEFAULT);

        // Keep one segment of each class live from the start.
        for class in [SizeClass::Small, SizeClass::Medium, SizeClass::Large] {
            if self.add_segment_from_reserved(&mut inner, class).is_none() {
                return false;
            }
        }
        inner.initialized = true;
        self.ready.store(true, Ordering::Release);
        true
    }

    /// Seed the heap with a pre-reserved region, resetting all layout
    /// state. Caller holds the heap lock.
    fn init_reserved_locked(&self, inner: &mut HeapInner, base: usize, size: usize) {
        inner.reserved_base = base;
        inner.reserved_size = size;
        inner.reserved_cursor = 0;
        inner.xl_table.clear();
        self.segments.write().clear();
        for shard in &self.shards {
            shard.clear();
        }
        let mut canary: u64 = rand::random();
        if canary == 0 {
            canary = 1;
        }
        self.canary.store(canary, Ordering::Release);
    }

    /// Commit the next S-aligned slice of the reservation as a segment of
    /// `class`. Caller holds the heap lock.
    fn add_segment_from_reserved(
        &self,
        inner: &mut HeapInner,
        class: SizeClass,
    ) -> Option<Arc<Segment>> {
        if inner.reserved_base == 0
            || inner.reserved_cursor + SEGMENT_SIZE > inner.reserved_size
        {
            return None;
        }
        let seg_base = inner.reserved_base + inner.reserved_cursor;
        if !os::commit_region(seg_base as *mut u8, SEGMENT_SIZE) {
            return None;
        }
        inner.reserved_cursor += SEGMENT_SIZE;
        Some(self.register_segment(seg_base, class, true))
    }

    /// Public seeding hook: commit and register one reserved segment for a
    /// class.
    pub fn add_segment_for_class(&self, class: SizeClass) -> bool {
        let mut inner = self.inner.lock();
        self.add_segment_from_reserved(&mut inner, class).is_some()
    }

    /// Enter a committed segment into the table and its class shard, marked
    /// non-full. The table write guard is released before the shard lock is
    /// taken (lock hierarchy).
    fn register_segment(&self, base: usize, class: SizeClass, from_reserved: bool) -> Arc<Segment> {
        let mut table = self.segments.write();
        let index = table.len() as u32;
        let segment = Arc::new(Segment::new(base, class, index, from_reserved));
        table.push(Arc::clone(&segment));
        drop(table);

        let shard = &self.shards[class.index()];
        shard.register(index);
        if segment.try_mark_enqueued() {
            shard.push_non_full(index);
        }
        segment
    }

    fn get_segment(&self, index: u32) -> Option<Arc<Segment>> {
        self.segments.read().get(index as usize).cloned()
    }

    /// Try one segment and, on success, refresh the calling thread's hints
    /// and the stats ledger.
    fn try_segment(
        &self,
        segment: &Segment,
        class: SizeClass,
        need: usize,
        requested: usize,
        tid: u64,
        multi_threaded: bool,
        zero_on_free: bool,
    ) -> Option<*mut u8> {
        let (ptr, page, usable) = segment.allocate(need, tid, multi_threaded, zero_on_free)?;
        tcache::set_cached_page(class, page);
        tcache::set_preferred_segment(class, segment.index());
        stats::record_alloc(requested, usable);
        Some(ptr)
    }

    /// The allocation pipeline. Order is load-bearing: argument checks,
    /// init, class decision, normalization, cached page, preferred segment,
    /// bounded queue pops, bounded snapshot scan, grow from reservation,
    /// grow by fresh mapping, give up.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        if size == 0 || size >= REQUEST_SANITY_LIMIT || size > HEAP_RESERVED_DEFAULT {
            return ptr::null_mut();
        }
        if !self.ensure_initialized() {
            return ptr::null_mut();
        }

        let Some(class) = SizeClass::for_size(size) else {
            return self.allocate_xl(size);
        };
        let need = class.normalize_request(size);
        let tid = tcache::current_tid();
        let multi_threaded = tcache::is_multi_threaded();
        let zero_on_free = self.zero_on_free.load(Ordering::Relaxed);

        // Fast path A: the page this thread last used for the class.
        let cached = tcache::cached_page(class);
        if !cached.is_null() {
            // SAFETY: cached pages point into segment metadata that lives
            // until teardown, and teardown requires quiescence.
            let page = unsafe { &*cached };
            if page.is_initialized() {
                if let Some(segment) = self.get_segment(page.seg_index()) {
                    if let Some((ptr, usable)) =
                        segment.allocate_on_page(page, need, tid, multi_threaded, zero_on_free)
                    {
                        stats::record_alloc(size, usable);
                        return ptr;
                    }
                }
            }
        }

        // Fast path B: the segment this thread last allocated from.
        if let Some(index) = tcache::preferred_segment(class) {
            if let Some(segment) = self.get_segment(index) {
                if segment.class() == class && segment.can_hold_request(need) {
                    if let Some(ptr) = self.try_segment(
                        &segment, class, need, size, tid, multi_threaded, zero_on_free,
                    ) {
                        return ptr;
                    }
                }
            }
        }

        // Bounded pops from the class's non-full queue.
        let shard = &self.shards[class.index()];
        debug_assert_eq!(shard.class(), class);
        for _ in 0..QUEUE_PROBE_LIMIT {
            let Some(index) = shard.pop_non_full() else {
                break;
            };
            let Some(segment) = self.get_segment(index) else {
                continue;
            };
            segment.clear_enqueued();
            let result = if segment.can_hold_request(need) {
                self.try_segment(&segment, class, need, size, tid, multi_threaded, zero_on_free)
            } else {
                None
            };
            // Still has room (for some request): make it findable again.
            if segment.has_free_pages() && segment.try_mark_enqueued() {
                shard.push_non_full(index);
            }
            if let Some(ptr) = result {
                return ptr;
            }
        }

        // Bounded scan over a snapshot of the class's segment list.
        for index in shard.snapshot().into_iter().take(SCAN_LIMIT) {
            let Some(segment) = self.get_segment(index) else {
                continue;
            };
            if !segment.can_hold_request(need) {
                continue;
            }
            if let Some(ptr) =
                self.try_segment(&segment, class, need, size, tid, multi_threaded, zero_on_free)
            {
                return ptr;
            }
        }

        // Grow: commit another slice of the reservation.
        let grown = {
            let mut inner = self.inner.lock();
            self.add_segment_from_reserved(&mut inner, class)
        };
        if let Some(segment) = grown {
            if let Some(ptr) =
                self.try_segment(&segment, class, need, size, tid, multi_threaded, zero_on_free)
            {
                return ptr;
            }
        }

        // Grow: fresh S-aligned mapping outside the reservation.
        if let Some(base) = os::alloc_aligned(SEGMENT_SIZE, SEGMENT_SIZE) {
            stats::record_mmap(SEGMENT_SIZE);
            let segment = self.register_segment(base.as_ptr() as usize, class, false);
            if let Some(ptr) =
                self.try_segment(&segment, class, need, size, tid, multi_threaded, zero_on_free)
            {
                return ptr;
            }
        }

        ptr::null_mut()
    }

    /// Serve a request too big for any class page with a direct mapping.
    /// Never touches the segment table or a shard.
    fn allocate_xl(&self, size: usize) -> *mut u8 {
        let os_page = os::page_size();
        let mapping_size = align_up(size + XL_HEADER_SIZE, os_page);
        let Some(base) = os::alloc_aligned(mapping_size, os_page) else {
            return ptr::null_mut();
        };
        stats::record_mmap(mapping_size);
        let usable = mapping_size - XL_HEADER_SIZE;
        // SAFETY: the mapping starts at base and is at least header + usable.
        let user_ptr = unsafe {
            let user_ptr = base.as_ptr().add(XL_HEADER_SIZE);
            XlHeader::write(user_ptr, mapping_size, usable);
            user_ptr
        };
        self.inner.lock().xl_table.insert(
            user_ptr as usize,
            XlEntry {
                mapping_size,
                usable_size: usable,
            },
        );
        stats::record_alloc(size, usable);
        user_ptr
    }

    /// Free dispatch. Success is the only non-aborting outcome for a
    /// non-null pointer: anything the chunk header and the XL table both
    /// disown is fatal.
    pub fn free_ptr(&self, user_ptr: *mut u8) {
        if user_ptr.is_null() {
            return;
        }
        if !self.ready.load(Ordering::Acquire) {
            die("free before the heap was initialized");
        }

        // SAFETY: probing the 16 bytes below a pointer the caller claims
        // came from this allocator.
        let header = unsafe { ChunkHeader::read(user_ptr) };
        if header.looks_valid() {
            let usable = self.free_chunk(user_ptr, header);
            stats::record_free(usable);
            return;
        }

        if let Some(usable) = self.free_xl(user_ptr) {
            stats::record_free(usable);
            return;
        }
        die("free of a pointer unknown to the heap");
    }

    /// Chunk-path free: resolve provenance, then either hand the pointer to
    /// the owning thread via the page's deferred ring or release it under
    /// the stripe lock. Returns the usable bytes released.
    fn free_chunk(&self, user_ptr: *mut u8, header: ChunkHeader) -> usize {
        let page_ptr = header.owner_page;
        // SAFETY: the header carried the chunk magic; the page it names is
        // validated against the segment table before any state is touched.
        let page = unsafe { &*page_ptr };
        let Some(segment) = self.get_segment(page.seg_index()) else {
            die("chunk header names a segment outside the heap");
        };
        if !segment.owns_page(page_ptr) {
            die("chunk header page does not belong to its segment");
        }
        if !segment.check_canary(segment.key()) {
            die("segment canary mismatch on free");
        }
        if !segment.contains(user_ptr) || !page.contains_ptr(user_ptr) {
            die("freed pointer lies outside its owning page");
        }

        let class = page.size_class();
        debug_assert_eq!(class, segment.class());
        let multi_threaded = tcache::is_multi_threaded();
        let zero_on_free = self.zero_on_free.load(Ordering::Relaxed);
        let tid = tcache::current_tid();
        let owner = page.owner_tid();

        if owner != 0 && owner != tid {
            // Remote-owner free: queue for the owner to drain. A full ring
            // falls through to the locked path below.
            if let Some(usable) = page.enqueue_deferred_free(user_ptr) {
                return usable;
            }
        }

        let (usable, before, after) = segment.free_on_page(page, user_ptr, multi_threaded, zero_on_free);
        if before == PageStatus::Full && after != PageStatus::Full && segment.try_mark_enqueued() {
            self.shards[class.index()].push_non_full(segment.index());
        }
        // Keep the freed page warm for this thread, unless it just went
        // empty.
        tcache::set_cached_page(class, page_ptr);
        if after == PageStatus::Empty {
            tcache::clear_cached_page_if(class, page_ptr);
        }
        usable
    }

    /// XL-path free. `None` when the pointer has no XL entry.
    fn free_xl(&self, user_ptr: *mut u8) -> Option<usize> {
        let mut inner = self.inner.lock();
        let entry = inner.xl_table.remove(&(user_ptr as usize))?;
        // SAFETY: the table says this is a live XL mapping we created.
        let header = unsafe { XlHeader::read(user_ptr) };
        if header.magic != XL_MAGIC {
            die("XL header magic mismatch on free");
        }
        if header.mapping_size != entry.mapping_size {
            die("XL header disagrees with the table on mapping size");
        }
        let usable = header.usable_size;
        if self.zero_on_free.load(Ordering::Relaxed) {
            // SAFETY: the usable range is inside the mapping being freed.
            unsafe {
                user_ptr.write_bytes(0, usable);
            }
        }
        let base = (user_ptr as usize - XL_HEADER_SIZE) as *mut u8;
        os::free_mapping(base, entry.mapping_size);
        stats::record_munmap(entry.mapping_size);
        drop(inner);
        Some(usable)
    }

    /// Usable bytes behind a pointer: chunk path via its owning page, XL
    /// table otherwise, 0 for anything else.
    pub fn usable_size(&self, user_ptr: *const u8) -> usize {
        if user_ptr.is_null() || !self.ready.load(Ordering::Acquire) {
            return 0;
        }
        // SAFETY: probe of the candidate header, validated before use.
        let header = unsafe { ChunkHeader::read(user_ptr) };
        if header.looks_valid() {
            let page_ptr = header.owner_page;
            // SAFETY: validated against the segment table below.
            let page = unsafe { &*page_ptr };
            let Some(segment) = self.get_segment(page.seg_index()) else {
                return 0;
            };
            if !segment.owns_page(page_ptr) || !segment.check_canary(segment.key()) {
                return 0;
            }
            let multi_threaded = tcache::is_multi_threaded();
            let uaf_check = self.uaf_check.load(Ordering::Relaxed);
            return segment.usable_size_on_page(page, user_ptr, multi_threaded, uaf_check);
        }
        self.inner
            .lock()
            .xl_table
            .get(&(user_ptr as usize))
            .map_or(0, |entry| entry.usable_size)
    }

    /// Heap-wide integrity check: a live canary and every registered
    /// segment structurally sound.
    pub fn validate(&self) -> bool {
        if self.canary.load(Ordering::Acquire) == 0 {
            return false;
        }
        let table = self.segments.read();
        table
            .iter()
            .all(|segment| segment.page_count() > 0 && segment.check_canary(segment.key()))
    }

    /// Tear everything down: the reservation, overflow segments, XL
    /// mappings, shard state, hints, and stats. Only safe when the caller
    /// owns no live allocations and no other thread is in the allocator.
    pub fn clear_metadata(&self) {
        self.ready.store(false, Ordering::Release);
        let mut inner = self.inner.lock();

        let mut table = self.segments.write();
        for segment in table.iter().filter(|segment| !segment.from_reserved()) {
            os::free_mapping(segment.base() as *mut u8, SEGMENT_SIZE);
            stats::record_munmap(SEGMENT_SIZE);
        }
        table.clear();
        drop(table);

        for shard in &self.shards {
            shard.clear();
        }

        if inner.reserved_base != 0 {
            os::free_mapping(inner.reserved_base as *mut u8, inner.reserved_size);
            stats::record_munmap(inner.reserved_size);
        }
        for (user, entry) in inner.xl_table.drain() {
            os::free_mapping((user - XL_HEADER_SIZE) as *mut u8, entry.mapping_size);
            stats::record_munmap(entry.mapping_size);
        }

        inner.reserved_base = 0;
        inner.reserved_size = 0;
        inner.reserved_cursor = 0;
        inner.initialized = false;
        self.canary.store(0, Ordering::Release);
        drop(inner);

        tcache::invalidate_all();
        tcache::bump_heap_epoch();
        stats::reset();
    }

    #[cfg(test)]
    pub(crate) fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    #[cfg(test)]
    pub(crate) fn xl_entry_count(&self) -> usize {
        self.inner.lock().xl_table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::HEAP_TEST_LOCK;

    #[test]
    fn test_seeding_creates_one_segment_per_class() {
        let _lock = HEAP_TEST_LOCK.lock();
        let heap = Heap::global();
        assert!(heap.ensure_initialized());
        assert!(heap.segment_count() >= 3);
        assert!(heap.validate());
    }

    #[test]
    fn test_add_segment_for_class_commits_from_reservation() {
        let _lock = HEAP_TEST_LOCK.lock();
        let heap = Heap::global();
        assert!(heap.ensure_initialized());
        let before = heap.segment_count();
        assert!(heap.add_segment_for_class(SizeClass::Medium));
        assert_eq!(heap.segment_count(), before + 1);
        assert!(heap.validate());
    }

    #[test]
    fn test_validate_false_before_first_init() {
        // Canary is zero both before the first init and after teardown.
        let _lock = HEAP_TEST_LOCK.lock();
        let heap = Heap::global();
        assert!(heap.ensure_initialized());
        heap.clear_metadata();
        assert!(!heap.validate());
        assert!(heap.ensure_initialized());
        assert!(heap.validate());
        crate::stats::flush_current_thread();
    }
}
