use std::{
    mem,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use bitflags::bitflags;
use parking_lot::Mutex;

use object::{ClassId, ClassTable, GcRef, Header};

use crate::{OS_PAGE_SIZE, map_memory, unmap_memory};

/// Smallest free region worth tracking: a header plus one payload word.
/// Anything smaller is left for the next sweep to coalesce.
const MIN_REGION: u32 = 24;

/// Configuration for the arena-structured heap.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Total address-space reservation in bytes. Must be a multiple of
    /// `arena_size`.
    pub heap_size: usize,
    /// Size of one arena. Must be a multiple of the OS page size.
    pub arena_size: usize,
    /// Fraction of the reservation (0.0 - 1.0] that may be in use before an
    /// allocation requests a collection cycle.
    pub gc_threshold: f64,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: 134_217_728, // 128 MB
            arena_size: 65_536,     // 64 KB
            gc_threshold: 0.75,
        }
    }
}

impl HeapSettings {
    fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size == 0 || self.arena_size == 0 {
            return Err("sizes must be > 0");
        }
        if !self.arena_size.is_multiple_of(OS_PAGE_SIZE) {
            return Err("arena_size must match OS page alignment");
        }
        if !self.heap_size.is_multiple_of(self.arena_size) {
            return Err("heap_size must be a multiple of arena_size");
        }
        if self.arena_size > u32::MAX as usize {
            return Err("arena_size too large for 32-bit offsets");
        }
        if self.heap_size / self.arena_size >= u32::MAX as usize {
            return Err("too many arenas for 32-bit indices");
        }
        if !(self.gc_threshold > 0.0 && self.gc_threshold <= 1.0) {
            return Err("gc_threshold must be in (0.0, 1.0]");
        }
        Ok(())
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ArenaFlags: u8 {
        const Used = 1 << 0;
        /// Part of a multi-arena allocation.
        const Large = 1 << 1;
        /// Continuation arena of a large span (never scanned directly).
        const Tail = 1 << 2;
    }
}

/// Book-keeping for one arena. Mutated only under the heap lock (or during
/// a collection pause, when the collector is the only running thread).
#[derive(Debug, Default)]
struct ArenaMeta {
    flags: ArenaFlags,
    /// High-water mark of bump allocation. Only meaningful while the arena
    /// is open; sweep closes every arena.
    bump: u32,
    /// Arena count of a large span (head only).
    span: u32,
    /// Start offsets of allocated objects, ascending. The sweep walks this
    /// to find headers without parsing raw memory.
    objects: Vec<u32>,
}

impl Default for ArenaFlags {
    fn default() -> Self {
        ArenaFlags::empty()
    }
}

/// A reusable hole inside a used arena, produced by the sweep.
#[derive(Debug, Clone, Copy)]
struct FreeRegion {
    arena: u32,
    offset: u32,
    size: u32,
}

#[derive(Debug)]
struct HeapState {
    arenas: Box<[ArenaMeta]>,
    /// The arena currently served by bump allocation.
    open: Option<u32>,
    /// Fully empty arenas ready for reuse.
    free_pool: Vec<u32>,
    /// Holes inside partially live arenas, first-fit.
    free_regions: Vec<FreeRegion>,
    /// First arena that has never been handed out.
    fresh_cursor: u32,
    used_bytes: usize,
}

/// Why an allocation did not produce an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The growth threshold would be exceeded; run a collection and retry.
    NeedsGc,
    /// The reservation is exhausted even ignoring the threshold.
    Exhausted,
}

/// Monotonic allocation / collection counters.
#[derive(Debug, Default)]
pub struct HeapCounters {
    pub objects_allocated: AtomicUsize,
    pub bytes_allocated: AtomicUsize,
    pub collections: AtomicUsize,
    pub bytes_reclaimed: AtomicUsize,
}

/// Summary of one collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionStats {
    pub marked_objects: usize,
    pub reclaimed_objects: usize,
    pub reclaimed_bytes: usize,
    pub live_bytes: usize,
}

/// The arena-structured, non-moving heap.
///
/// One contiguous reservation divided into fixed-size arenas; objects are
/// bump-allocated and never move, so a [`GcRef`] resolves with plain
/// arithmetic for the lifetime of the object. Reclamation happens only in
/// [`Heap::collect`]: unmarked objects become free regions, fully empty
/// arenas return to a free pool.
#[derive(Debug)]
pub struct Heap {
    base: NonNull<u8>,
    settings: HeapSettings,
    arena_count: u32,
    threshold_bytes: usize,
    state: Mutex<HeapState>,
    counters: HeapCounters,
}

// SAFETY: all shared state is behind the state mutex or atomic counters;
// raw memory is handed out only to the single thread that allocated it or
// scanned during a pause.
unsafe impl Send for Heap {}
// SAFETY: see above.
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(settings: HeapSettings) -> Self {
        settings.validate().expect("invalid heap settings");
        let base =
            map_memory(settings.heap_size).expect("reserve heap memory");
        let arena_count = (settings.heap_size / settings.arena_size) as u32;
        let threshold_bytes =
            (settings.heap_size as f64 * settings.gc_threshold) as usize;

        let mut arenas = Vec::with_capacity(arena_count as usize);
        arenas.resize_with(arena_count as usize, ArenaMeta::default);

        Self {
            base,
            settings,
            arena_count,
            threshold_bytes,
            state: Mutex::new(HeapState {
                arenas: arenas.into_boxed_slice(),
                open: None,
                free_pool: Vec::new(),
                free_regions: Vec::new(),
                fresh_cursor: 0,
                used_bytes: 0,
            }),
            counters: HeapCounters::default(),
        }
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub fn counters(&self) -> &HeapCounters {
        &self.counters
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes
    }

    pub fn arena_count(&self) -> u32 {
        self.arena_count
    }

    // ── address resolution ─────────────────────────────────────────

    /// Resolve a handle to its address. Pure arithmetic; valid for the
    /// lifetime of the object because the collector never moves anything.
    #[inline(always)]
    pub fn resolve(&self, r: GcRef) -> NonNull<u8> {
        debug_assert!(!r.is_null(), "resolving null handle");
        debug_assert!(r.arena() < self.arena_count);
        debug_assert!((r.offset() as usize) < self.settings.arena_size);
        // SAFETY: arena/offset are in range of the reservation.
        unsafe {
            NonNull::new_unchecked(self.base.as_ptr().add(
                r.arena() as usize * self.settings.arena_size
                    + r.offset() as usize,
            ))
        }
    }

    /// # Safety
    ///
    /// `r` must refer to a live, initialized object.
    #[inline(always)]
    pub unsafe fn header(&self, r: GcRef) -> &Header {
        // SAFETY: per contract, a Header sits at the start of the object.
        unsafe { &*(self.resolve(r).as_ptr() as *const Header) }
    }

    /// # Safety
    ///
    /// `r` must refer to a live object; `byte_offset` must be within its
    /// payload.
    #[inline(always)]
    pub unsafe fn read_payload_word(&self, r: GcRef, byte_offset: usize) -> u64 {
        // SAFETY: per contract.
        unsafe {
            ptr::read(
                self.resolve(r)
                    .as_ptr()
                    .add(mem::size_of::<Header>() + byte_offset)
                    as *const u64,
            )
        }
    }

    /// # Safety
    ///
    /// Same contract as [`read_payload_word`](Self::read_payload_word), and
    /// the caller must be the thread owning the object mutably (mutators
    /// never run during a collection).
    #[inline(always)]
    pub unsafe fn write_payload_word(
        &self,
        r: GcRef,
        byte_offset: usize,
        bits: u64,
    ) {
        // SAFETY: per contract.
        unsafe {
            ptr::write(
                self.resolve(r)
                    .as_ptr()
                    .add(mem::size_of::<Header>() + byte_offset)
                    as *mut u64,
                bits,
            );
        }
    }

    /// # Safety
    ///
    /// `r` must refer to a live object; the byte range must be within its
    /// payload.
    #[inline(always)]
    pub unsafe fn read_payload_byte(&self, r: GcRef, byte_offset: usize) -> u8 {
        // SAFETY: per contract.
        unsafe {
            *self
                .resolve(r)
                .as_ptr()
                .add(mem::size_of::<Header>() + byte_offset)
        }
    }

    /// # Safety
    ///
    /// Same contract as [`write_payload_word`](Self::write_payload_word).
    #[inline(always)]
    pub unsafe fn write_payload_byte(
        &self,
        r: GcRef,
        byte_offset: usize,
        byte: u8,
    ) {
        // SAFETY: per contract.
        unsafe {
            *self
                .resolve(r)
                .as_ptr()
                .add(mem::size_of::<Header>() + byte_offset) = byte;
        }
    }

    /// # Safety
    ///
    /// `r` must refer to a live byte array object with at least `len` bytes
    /// of payload.
    pub unsafe fn payload_bytes(&self, r: GcRef, len: usize) -> &[u8] {
        // SAFETY: per contract.
        unsafe {
            core::slice::from_raw_parts(
                self.resolve(r).as_ptr().add(mem::size_of::<Header>()),
                len,
            )
        }
    }

    /// Copy raw bytes into an object's payload (string initialization).
    ///
    /// # Safety
    ///
    /// Same contract as [`write_payload_word`](Self::write_payload_word).
    pub unsafe fn write_payload_bytes(&self, r: GcRef, bytes: &[u8]) {
        // SAFETY: per contract.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.resolve(r).as_ptr().add(mem::size_of::<Header>()),
                bytes.len(),
            );
        }
    }

    pub fn object_total_size(
        &self,
        header: &Header,
        classes: &ClassTable,
    ) -> usize {
        mem::size_of::<Header>()
            + classes.get(header.class()).payload_size(header.length())
    }

    // ── allocation ─────────────────────────────────────────────────

    /// Allocate a zero-initialized object. Returns [`AllocError::NeedsGc`]
    /// when the growth threshold would be exceeded; the caller is expected
    /// to run a collection and retry via
    /// [`allocate_after_collect`](Self::allocate_after_collect).
    pub fn allocate(
        &self,
        classes: &ClassTable,
        class: ClassId,
        length: u32,
    ) -> Result<GcRef, AllocError> {
        self.alloc_impl(classes, class, length, true)
    }

    /// Retry after a collection: the threshold no longer applies, only
    /// genuine exhaustion of the reservation fails.
    pub fn allocate_after_collect(
        &self,
        classes: &ClassTable,
        class: ClassId,
        length: u32,
    ) -> Result<GcRef, AllocError> {
        self.alloc_impl(classes, class, length, false)
    }

    fn alloc_impl(
        &self,
        classes: &ClassTable,
        class: ClassId,
        length: u32,
        enforce_threshold: bool,
    ) -> Result<GcRef, AllocError> {
        let cls = classes.get(class);
        debug_assert!(cls.is_variable_length() || length == 0);
        let total = mem::size_of::<Header>() + cls.payload_size(length);

        let r = {
            let mut state = self.state.lock();
            if enforce_threshold
                && state.used_bytes + total > self.threshold_bytes
            {
                return Err(AllocError::NeedsGc);
            }
            let r = if total > self.settings.arena_size {
                self.allocate_large(&mut state, total)?
            } else {
                self.allocate_small(&mut state, total as u32)?
            };
            state.used_bytes += total;
            r
        };

        // The region is exclusively ours once the metadata is committed;
        // zero it and stamp the header outside the lock.
        // SAFETY: freshly reserved, in bounds for `total` bytes.
        unsafe {
            let ptr = self.resolve(r).as_ptr();
            ptr::write_bytes(ptr, 0, total);
            ptr::write(
                ptr as *mut Header,
                Header::with_length(class, length),
            );
        }

        self.counters.objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_allocated.fetch_add(total, Ordering::Relaxed);
        Ok(r)
    }

    fn allocate_small(
        &self,
        state: &mut HeapState,
        total: u32,
    ) -> Result<GcRef, AllocError> {
        let arena_size = self.settings.arena_size as u32;

        // Fast path: bump in the open arena.
        if let Some(idx) = state.open {
            let arena = &mut state.arenas[idx as usize];
            if arena_size - arena.bump >= total {
                let offset = arena.bump;
                arena.bump += total;
                // Bump offsets are strictly increasing, so `objects` stays
                // sorted without a search.
                arena.objects.push(offset);
                return Ok(GcRef::new(idx, offset));
            }
        }

        // First fit from the swept free regions.
        if let Some(pos) =
            state.free_regions.iter().position(|reg| reg.size >= total)
        {
            let region = &mut state.free_regions[pos];
            let arena_idx = region.arena;
            let offset = region.offset;
            region.offset += total;
            region.size -= total;
            if region.size < MIN_REGION {
                // The remainder is too small for any object; the next sweep
                // recovers it from the gap walk.
                state.free_regions.swap_remove(pos);
            }
            let arena = &mut state.arenas[arena_idx as usize];
            let at = arena.objects.binary_search(&offset).unwrap_err();
            arena.objects.insert(at, offset);
            return Ok(GcRef::new(arena_idx, offset));
        }

        // Open a fresh or recycled arena. The old open arena's tail becomes
        // a free region instead of being stranded until the next sweep.
        if let Some(old) = state.open {
            let bump = state.arenas[old as usize].bump;
            if arena_size - bump >= MIN_REGION {
                state.free_regions.push(FreeRegion {
                    arena: old,
                    offset: bump,
                    size: arena_size - bump,
                });
            }
        }
        let idx = self.acquire_arena(state)?;
        let arena = &mut state.arenas[idx as usize];
        arena.bump = total;
        arena.objects.push(0);
        state.open = Some(idx);
        Ok(GcRef::new(idx, 0))
    }

    fn acquire_arena(
        &self,
        state: &mut HeapState,
    ) -> Result<u32, AllocError> {
        let idx = if let Some(idx) = state.free_pool.pop() {
            idx
        } else if state.fresh_cursor < self.arena_count {
            let idx = state.fresh_cursor;
            state.fresh_cursor += 1;
            idx
        } else {
            return Err(AllocError::Exhausted);
        };
        let arena = &mut state.arenas[idx as usize];
        arena.flags = ArenaFlags::Used;
        arena.bump = 0;
        arena.span = 1;
        arena.objects.clear();
        Ok(idx)
    }

    /// Claim a contiguous run of free arenas for one oversized object.
    fn allocate_large(
        &self,
        state: &mut HeapState,
        total: usize,
    ) -> Result<GcRef, AllocError> {
        let span = total.div_ceil(self.settings.arena_size) as u32;

        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for idx in 0..self.arena_count {
            let free = idx >= state.fresh_cursor
                || !state.arenas[idx as usize].flags.contains(ArenaFlags::Used);
            if free {
                if run_len == 0 {
                    run_start = idx;
                }
                run_len += 1;
                if run_len == span {
                    break;
                }
            } else {
                run_len = 0;
            }
        }
        if run_len < span {
            return Err(AllocError::Exhausted);
        }

        let claimed = run_start..run_start + span;
        state.free_pool.retain(|idx| !claimed.contains(idx));
        state.fresh_cursor = state.fresh_cursor.max(claimed.end);
        for idx in claimed.clone() {
            let arena = &mut state.arenas[idx as usize];
            arena.flags = if idx == run_start {
                ArenaFlags::Used | ArenaFlags::Large
            } else {
                ArenaFlags::Used | ArenaFlags::Large | ArenaFlags::Tail
            };
            arena.bump = 0;
            arena.span = if idx == run_start { span } else { 0 };
            arena.objects.clear();
        }
        state.arenas[run_start as usize].objects.push(0);
        Ok(GcRef::new(run_start, 0))
    }

    // ── collection ─────────────────────────────────────────────────

    /// Run one mark-sweep cycle. The caller guarantees that no mutator is
    /// running (all threads parked at safepoints) and that `roots` lists
    /// every live reference slot.
    pub fn collect(
        &self,
        roots: &[GcRef],
        classes: &ClassTable,
    ) -> CollectionStats {
        let started = std::time::Instant::now();
        let marked_objects = self.mark(roots, classes);
        let mut state = self.state.lock();
        let (live_bytes, reclaimed_objects, reclaimed_bytes) =
            self.sweep(&mut state, classes);
        state.used_bytes = live_bytes;
        drop(state);

        self.counters.collections.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_reclaimed
            .fetch_add(reclaimed_bytes, Ordering::Relaxed);

        let stats = CollectionStats {
            marked_objects,
            reclaimed_objects,
            reclaimed_bytes,
            live_bytes,
        };
        log::debug!(
            "gc cycle: {} roots, {} live objects, {} objects / {} bytes reclaimed in {:?}",
            roots.len(),
            marked_objects,
            reclaimed_objects,
            reclaimed_bytes,
            started.elapsed(),
        );
        stats
    }

    /// Worklist trace from the roots, setting mark bits. Field layout comes
    /// from each object's class: fixed reference offsets plus, for
    /// reference arrays, every element.
    fn mark(&self, roots: &[GcRef], classes: &ClassTable) -> usize {
        let mut worklist: Vec<GcRef> = Vec::with_capacity(roots.len());
        for &root in roots {
            // SAFETY: roots come from live frame slots and statics.
            if !root.is_null() && unsafe { self.header(root) }.try_mark() {
                worklist.push(root);
            }
        }

        let mut marked = 0usize;
        while let Some(r) = worklist.pop() {
            marked += 1;
            // SAFETY: marked objects are live.
            let header = unsafe { self.header(r) };
            let class = classes.get(header.class());

            for &offset in &class.reference_offsets {
                // SAFETY: offset comes from the class layout.
                let child = GcRef::from_raw(unsafe {
                    self.read_payload_word(r, offset as usize)
                });
                if !child.is_null()
                    // SAFETY: a non-null stored reference is live.
                    && unsafe { self.header(child) }.try_mark()
                {
                    worklist.push(child);
                }
            }

            if class.element.is_some_and(|e| e.is_ref()) {
                for i in 0..header.length() as usize {
                    // SAFETY: element index is below the header length.
                    let child = GcRef::from_raw(unsafe {
                        self.read_payload_word(r, i * 8)
                    });
                    if !child.is_null()
                        // SAFETY: a non-null stored reference is live.
                        && unsafe { self.header(child) }.try_mark()
                    {
                        worklist.push(child);
                    }
                }
            }
        }
        marked
    }

    /// Walk every arena: unmarked objects become free regions, fully empty
    /// arenas go back to the pool, mark bits are cleared. Returns
    /// (live bytes, reclaimed objects, reclaimed bytes).
    fn sweep(
        &self,
        state: &mut HeapState,
        classes: &ClassTable,
    ) -> (usize, usize, usize) {
        let arena_size = self.settings.arena_size as u32;
        let mut live_bytes = 0usize;
        let mut reclaimed_objects = 0usize;
        let mut reclaimed_bytes = 0usize;
        let mut regions: Vec<FreeRegion> = Vec::new();
        let mut pool: Vec<u32> = mem::take(&mut state.free_pool);

        // Every arena is closed by a sweep; allocation reopens one.
        state.open = None;

        for idx in 0..state.fresh_cursor {
            let flags = state.arenas[idx as usize].flags;
            if !flags.contains(ArenaFlags::Used)
                || flags.contains(ArenaFlags::Tail)
            {
                continue;
            }

            if flags.contains(ArenaFlags::Large) {
                let span = state.arenas[idx as usize].span;
                let r = GcRef::new(idx, 0);
                // SAFETY: a large head arena holds exactly one object.
                let header = unsafe { self.header(r) };
                let total = self.object_total_size(header, classes);
                if header.is_marked() {
                    header.clear_mark();
                    live_bytes += total;
                } else {
                    reclaimed_objects += 1;
                    reclaimed_bytes += total;
                    for tail in idx..idx + span {
                        let arena = &mut state.arenas[tail as usize];
                        arena.flags = ArenaFlags::empty();
                        arena.bump = 0;
                        arena.span = 0;
                        arena.objects.clear();
                        pool.push(tail);
                    }
                }
                continue;
            }

            let offsets =
                mem::take(&mut state.arenas[idx as usize].objects);
            let mut live: Vec<(u32, u32)> = Vec::with_capacity(offsets.len());
            for offset in offsets {
                let r = GcRef::new(idx, offset);
                // SAFETY: `objects` only holds initialized allocations.
                let header = unsafe { self.header(r) };
                let total = self.object_total_size(header, classes) as u32;
                if header.is_marked() {
                    header.clear_mark();
                    live.push((offset, total));
                    live_bytes += total as usize;
                } else {
                    reclaimed_objects += 1;
                    reclaimed_bytes += total as usize;
                }
            }

            let arena = &mut state.arenas[idx as usize];
            if live.is_empty() {
                arena.flags = ArenaFlags::empty();
                arena.bump = 0;
                arena.objects = Vec::new();
                pool.push(idx);
                continue;
            }

            // Free regions are the gaps between live objects, the space of
            // the dead ones included.
            let mut cursor = 0u32;
            for &(offset, total) in &live {
                if offset - cursor >= MIN_REGION {
                    regions.push(FreeRegion {
                        arena: idx,
                        offset: cursor,
                        size: offset - cursor,
                    });
                }
                cursor = offset + total;
            }
            if arena_size - cursor >= MIN_REGION {
                regions.push(FreeRegion {
                    arena: idx,
                    offset: cursor,
                    size: arena_size - cursor,
                });
            }
            arena.objects = live.into_iter().map(|(o, _)| o).collect();
            arena.bump = arena_size;
        }

        state.free_regions = regions;
        state.free_pool = pool;
        (live_bytes, reclaimed_objects, reclaimed_bytes)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unmap_memory(self.base, self.settings.heap_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Class, ElementKind, ValueKind};

    fn mk_heap(arenas: usize, arena_size: usize) -> Heap {
        Heap::new(HeapSettings {
            heap_size: arenas * arena_size,
            arena_size,
            gc_threshold: 1.0,
        })
    }

    // 0: Node { next: Ref, value: Int }, 1: Node[], 2: bytes
    fn classes() -> ClassTable {
        let node = Class::new(
            ClassId(0),
            "Node",
            None,
            vec![ValueKind::Ref, ValueKind::Int],
            None,
            &[],
        );
        let array = Class::new(
            ClassId(1),
            "Node[]",
            None,
            Vec::new(),
            Some(ElementKind::Ref),
            &[],
        );
        let bytes = Class::new(
            ClassId(2),
            "bytes",
            None,
            Vec::new(),
            Some(ElementKind::Byte),
            &[],
        );
        ClassTable::new(vec![node, array, bytes])
    }

    fn alloc_node(heap: &Heap, classes: &ClassTable) -> GcRef {
        heap.allocate(classes, ClassId(0), 0).expect("allocate node")
    }

    #[test]
    fn allocations_are_zeroed_and_distinct() {
        let heap = mk_heap(4, OS_PAGE_SIZE);
        let classes = classes();

        let a = alloc_node(&heap, &classes);
        let b = alloc_node(&heap, &classes);
        assert_ne!(a, b);
        assert_ne!(heap.resolve(a), heap.resolve(b));

        // SAFETY: both just allocated.
        unsafe {
            assert_eq!(heap.read_payload_word(a, 0), 0);
            assert_eq!(heap.read_payload_word(a, 8), 0);
            assert_eq!(heap.header(a).class(), ClassId(0));
        }
    }

    #[test]
    fn zeroed_reference_field_reads_as_null() {
        let heap = mk_heap(4, OS_PAGE_SIZE);
        let classes = classes();
        let node = alloc_node(&heap, &classes);
        // SAFETY: just allocated.
        let field = GcRef::from_raw(unsafe { heap.read_payload_word(node, 0) });
        assert!(field.is_null());
    }

    #[test]
    fn threshold_reports_needs_gc_once() {
        let heap = Heap::new(HeapSettings {
            heap_size: 4 * OS_PAGE_SIZE,
            arena_size: OS_PAGE_SIZE,
            gc_threshold: 0.25, // one arena's worth
        });
        let classes = classes();

        let mut last = Ok(GcRef::NULL);
        for _ in 0..200 {
            last = heap.allocate(&classes, ClassId(0), 0);
            if last.is_err() {
                break;
            }
        }
        assert_eq!(last, Err(AllocError::NeedsGc));
        // Ignoring the threshold still succeeds: the reservation has room.
        assert!(heap.allocate_after_collect(&classes, ClassId(0), 0).is_ok());
    }

    #[test]
    fn collect_reclaims_unrooted_objects_and_reuses_memory() {
        let heap = mk_heap(4, OS_PAGE_SIZE);
        let classes = classes();

        let keep = alloc_node(&heap, &classes);
        let drop1 = alloc_node(&heap, &classes);
        let drop2 = alloc_node(&heap, &classes);

        let stats = heap.collect(&[keep], &classes);
        assert_eq!(stats.marked_objects, 1);
        assert_eq!(stats.reclaimed_objects, 2);
        assert_eq!(stats.live_bytes, 32);

        // The reclaimed slots are reusable after exactly one cycle: new
        // allocations land on the old addresses.
        let again1 = heap.allocate(&classes, ClassId(0), 0).unwrap();
        let again2 = heap.allocate(&classes, ClassId(0), 0).unwrap();
        let old = [drop1, drop2];
        assert!(old.contains(&again1), "expected address reuse, got {again1:?}");
        assert!(old.contains(&again2), "expected address reuse, got {again2:?}");
    }

    #[test]
    fn live_objects_keep_address_and_contents_across_collections() {
        let heap = mk_heap(8, OS_PAGE_SIZE);
        let classes = classes();

        let a = alloc_node(&heap, &classes);
        let b = alloc_node(&heap, &classes);
        // a.next = b; a.value = 77
        // SAFETY: both live.
        unsafe {
            heap.write_payload_word(a, 0, b.raw());
            heap.write_payload_word(a, 8, 77);
            heap.write_payload_word(b, 8, 123);
        }
        let addr_a = heap.resolve(a);
        let addr_b = heap.resolve(b);

        for _ in 0..3 {
            // b is reachable only through a.
            heap.collect(&[a], &classes);
        }

        assert_eq!(heap.resolve(a), addr_a);
        assert_eq!(heap.resolve(b), addr_b);
        // SAFETY: still live.
        unsafe {
            assert_eq!(GcRef::from_raw(heap.read_payload_word(a, 0)), b);
            assert_eq!(heap.read_payload_word(a, 8), 77);
            assert_eq!(heap.read_payload_word(b, 8), 123);
            assert!(!heap.header(a).is_marked(), "sweep must clear marks");
        }
    }

    #[test]
    fn tracing_follows_reference_array_elements() {
        let heap = mk_heap(8, OS_PAGE_SIZE);
        let classes = classes();

        let array = heap.allocate(&classes, ClassId(1), 3).unwrap();
        let held = alloc_node(&heap, &classes);
        let dead = alloc_node(&heap, &classes);
        // SAFETY: array has 3 elements.
        unsafe { heap.write_payload_word(array, 2 * 8, held.raw()) };

        let stats = heap.collect(&[array], &classes);
        assert_eq!(stats.marked_objects, 2, "array + held element");
        assert_eq!(stats.reclaimed_objects, 1);

        let reused = heap.allocate(&classes, ClassId(0), 0).unwrap();
        assert_eq!(reused, dead, "dead node's region should be first fit");
    }

    #[test]
    fn large_objects_span_arenas_and_free_back_to_pool() {
        let arena = OS_PAGE_SIZE;
        let heap = mk_heap(8, arena);
        let classes = classes();

        // A byte payload bigger than two arenas.
        let len = (2 * arena + 100) as u32;
        let big = heap.allocate(&classes, ClassId(2), len).unwrap();
        assert_eq!(big.offset(), 0, "large objects start on an arena boundary");
        // SAFETY: just allocated.
        unsafe {
            assert_eq!(heap.header(big).length(), len);
        }
        let used_before = heap.used_bytes();
        assert!(used_before > 2 * arena);

        heap.collect(&[], &classes);
        assert_eq!(heap.used_bytes(), 0);

        // The span is reusable for another large allocation.
        let big2 = heap.allocate(&classes, ClassId(2), len).unwrap();
        assert_eq!(big2.arena(), big.arena());
    }

    #[test]
    fn exhaustion_is_reported_not_panicked() {
        let heap = Heap::new(HeapSettings {
            heap_size: 2 * OS_PAGE_SIZE,
            arena_size: OS_PAGE_SIZE,
            gc_threshold: 1.0,
        });
        let classes = classes();

        let mut last = heap.allocate_after_collect(&classes, ClassId(0), 0);
        while last.is_ok() {
            last = heap.allocate_after_collect(&classes, ClassId(0), 0);
        }
        assert_eq!(last, Err(AllocError::Exhausted));
    }

    #[test]
    fn counters_track_allocations_and_collections() {
        let heap = mk_heap(4, OS_PAGE_SIZE);
        let classes = classes();

        let _a = alloc_node(&heap, &classes);
        let b = alloc_node(&heap, &classes);
        heap.collect(&[b], &classes);

        let counters = heap.counters();
        assert_eq!(counters.objects_allocated.load(Ordering::Relaxed), 2);
        assert_eq!(counters.bytes_allocated.load(Ordering::Relaxed), 64);
        assert_eq!(counters.collections.load(Ordering::Relaxed), 1);
        assert_eq!(counters.bytes_reclaimed.load(Ordering::Relaxed), 32);
    }

    #[test]
    #[should_panic(expected = "invalid heap settings")]
    fn settings_validation_rejects_misaligned_arenas() {
        let _ = Heap::new(HeapSettings {
            heap_size: 1000,
            arena_size: 100,
            gc_threshold: 0.5,
        });
    }
}
