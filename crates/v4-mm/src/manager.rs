//! Stop-the-world mark/sweep memory manager
//!
//! ## Design
//!
//! - **Chunk-Based Allocation**: objects live in page-aligned chunks (64KB
//!   by default), each dedicated to one 16-byte size class
//! - **Free Lists**: one singly linked list per size class, threaded through
//!   slot headers
//! - **Collect Before Grow**: a free-list miss first runs a full collection
//!   and only reserves a new chunk if the class is still empty
//! - **Blocking**: collection can be disabled or blocked around critical
//!   sections; a blocked or disabled manager simply grows the heap
//! - **No Large Objects**: requests at or above [`MAX_ITEM_SIZE`] are fatal

use std::cell::{Cell, RefCell};
use std::mem::{align_of, size_of};
use std::rc::{Rc, Weak};
use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::blocker::GcBlocker;
use crate::chunk::{
    Chunk, ChunkBounds, MAX_ITEM_SIZE, NUM_SIZE_CLASSES, SLOT_ALIGN, SlotId, SweepOptions,
    align_size, find_chunk, size_class_index,
};
use crate::config::MmConfig;
use crate::context::EngineRoots;
use crate::error::{MmError, MmResult};
use crate::frames::{FrameRegistry, StackFrame};
use crate::mark::{SlotInfo, mark_from};
use crate::object::{Gc, GcBox, HEADER_SIZE, ObjectRef, ObjectVTable, SlotHeader, Trace};
use crate::stats::{MmStats, StatsState};

/// The engine's heap.
///
/// Created once per engine and handed to the subsystems that allocate by
/// reference. Single-threaded: it is neither `Send` nor `Sync`.
pub struct MemoryManager {
    config: MmConfig,
    /// Chunks in creation order; a chunk's id is its index here.
    chunks: RefCell<Vec<Rc<Chunk>>>,
    /// Chunk address ranges sorted by start address.
    chunk_bounds: RefCell<Vec<ChunkBounds>>,
    /// Free-list heads, indexed by size class.
    free_lists: [Cell<Option<SlotId>>; NUM_SIZE_CLASSES],
    gc_enabled: Cell<bool>,
    gc_blocked: Cell<bool>,
    /// Set for the duration of a collection or the teardown sweep.
    collecting: Cell<bool>,
    engine: RefCell<Option<Weak<dyn EngineRoots>>>,
    pub(crate) frames: FrameRegistry,
    stats: RefCell<StatsState>,
}

impl MemoryManager {
    /// Create a memory manager
    pub fn new(config: MmConfig) -> Self {
        Self {
            config,
            chunks: RefCell::new(Vec::new()),
            chunk_bounds: RefCell::new(Vec::new()),
            free_lists: std::array::from_fn(|_| Cell::new(None)),
            gc_enabled: Cell::new(true),
            gc_blocked: Cell::new(false),
            collecting: Cell::new(false),
            engine: RefCell::new(None),
            frames: FrameRegistry::default(),
            stats: RefCell::new(StatsState::default()),
        }
    }

    /// Create a memory manager with the default configuration
    pub fn with_defaults() -> Self {
        Self::new(MmConfig::default())
    }

    /// Get config
    pub fn config(&self) -> &MmConfig {
        &self.config
    }

    /// Register the engine whose globals and contexts are roots.
    pub fn attach_engine(&self, engine: Weak<dyn EngineRoots>) {
        *self.engine.borrow_mut() = Some(engine);
    }

    /// Forget the attached engine
    pub fn detach_engine(&self) {
        *self.engine.borrow_mut() = None;
    }

    pub(crate) fn engine(&self) -> Option<Rc<dyn EngineRoots>> {
        self.engine.borrow().as_ref().and_then(Weak::upgrade)
    }

    // ---------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------

    /// Allocate a slot of exactly `size` bytes, header included.
    ///
    /// `size` must be a non-zero multiple of 16 below [`MAX_ITEM_SIZE`]. The
    /// returned slot is in use, unmarked, and its payload is unspecified.
    ///
    /// # Panics
    /// Panics on an invalid size or when the OS refuses a new chunk.
    pub fn alloc(&self, size: usize) -> ObjectRef {
        match self.try_alloc(size) {
            Ok(obj) => obj,
            Err(err) => fatal(err),
        }
    }

    /// Allocate a slot for `size` bytes, rounding up to the slot quantum.
    pub fn alloc_managed(&self, size: usize) -> ObjectRef {
        self.alloc(align_size(size.max(HEADER_SIZE)))
    }

    /// Fallible form of [`alloc`](Self::alloc).
    pub fn try_alloc(&self, size: usize) -> MmResult<ObjectRef> {
        self.try_alloc_slot(size).map(|(_, obj)| obj)
    }

    /// Move `value` into a fresh slot.
    ///
    /// Objects that `value` references must already be reachable from the
    /// roots or collection must be blocked: the allocation may collect.
    pub fn alloc_object<T: Trace>(&self, value: T) -> Gc<T> {
        const {
            assert!(
                align_of::<T>() <= SLOT_ALIGN,
                "heap objects must not require more than 16 byte alignment"
            );
            assert!(
                size_of::<GcBox<T>>() < MAX_ITEM_SIZE,
                "heap object does not fit below the size-class ceiling"
            );
        }

        let (slot, obj) = match self.try_alloc_slot(size_of::<GcBox<T>>()) {
            Ok(allocated) => allocated,
            Err(err) => fatal(err),
        };
        // SAFETY: the payload is suitably aligned and large enough for `T`
        unsafe { obj.payload().cast::<T>().as_ptr().write(value) };
        self.chunks.borrow()[slot.chunk as usize]
            .set_vtable(slot.index as usize, ObjectVTable::of::<T>());
        // SAFETY: the slot now holds a `T`
        unsafe { Gc::from_object_ref(obj) }
    }

    fn try_alloc_slot(&self, size: usize) -> MmResult<(SlotId, ObjectRef)> {
        if size >= MAX_ITEM_SIZE {
            return Err(MmError::OversizedAllocation {
                size,
                ceiling: MAX_ITEM_SIZE,
            });
        }
        if size == 0 || size % SLOT_ALIGN != 0 {
            return Err(MmError::MisalignedSize(size));
        }

        let class = size_class_index(size);
        self.stats.borrow_mut().record_allocation(class);

        if self.config.aggressive_gc {
            self.run_gc();
        }

        if let Some(slot) = self.pop_free(class) {
            return Ok(slot);
        }

        if !self.config.aggressive_gc {
            self.run_gc();
            if let Some(slot) = self.pop_free(class) {
                return Ok(slot);
            }
        }

        self.grow(class)?;
        self.pop_free(class)
            .ok_or(MmError::OutOfMemory { requested: size })
    }

    fn pop_free(&self, class: usize) -> Option<(SlotId, ObjectRef)> {
        let head = self.free_lists[class].get()?;
        let chunks = self.chunks.borrow();
        let (obj, next) = chunks[head.chunk as usize].claim(head.index as usize);
        self.free_lists[class].set(next);
        Some((head, obj))
    }

    /// Reserve a new chunk for `class` and make it the class's free list.
    fn grow(&self, class: usize) -> MmResult<()> {
        let mut chunks = self.chunks.borrow_mut();
        let id = u32::try_from(chunks.len()).map_err(|_| MmError::OutOfMemory {
            requested: self.config.effective_chunk_size(),
        })?;
        let (chunk, head) = Chunk::reserve(id, class, self.config.effective_chunk_size())?;
        debug_assert!(self.free_lists[class].get().is_none());

        let bounds = chunk.bounds();
        {
            let mut table = self.chunk_bounds.borrow_mut();
            let pos = table.partition_point(|b| b.start < bounds.start);
            table.insert(pos, bounds);
        }
        self.free_lists[class].set(Some(head));
        self.stats
            .borrow_mut()
            .record_reservation(chunk.reserved_bytes());

        tracing::debug!(
            target: "v4::gc",
            chunk = id,
            slot_size = chunk.slot_size(),
            slots = chunk.num_slots(),
            bytes = chunk.reserved_bytes(),
            "heap grown"
        );

        chunks.push(Rc::new(chunk));
        Ok(())
    }

    // ---------------------------------------------------------------
    // Collection
    // ---------------------------------------------------------------

    /// Run a full collection: enumerate roots, mark, sweep.
    ///
    /// Does nothing while collection is disabled, blocked, or already
    /// running. Returns the number of objects freed.
    pub fn run_gc(&self) -> usize {
        if !self.gc_enabled.get() || self.gc_blocked.get() || self.collecting.get() {
            return 0;
        }
        self.collecting.set(true);

        let start = Instant::now();
        let used_before = self.used_bytes();
        let roots = self.collect_roots();

        tracing::debug!(
            target: "v4::gc",
            roots = roots.len(),
            heap_bytes = used_before,
            objects = self.live_objects(),
            chunks = self.chunk_count(),
            "GC cycle starting"
        );

        let marked = self.mark(&roots);
        let freed = self.sweep();

        let pause = start.elapsed();
        let used_after = self.used_bytes();
        let collection = {
            let mut stats = self.stats.borrow_mut();
            stats.record_collection(marked, freed, used_before, used_after, pause);
            stats.snapshot.collections
        };

        tracing::info!(
            target: "v4::gc",
            collection,
            marked,
            freed_objects = freed,
            pause_us = pause.as_micros() as u64,
            live_bytes = used_after,
            "GC cycle complete"
        );

        self.collecting.set(false);
        freed
    }

    /// Mark everything reachable from `roots`. Returns the number of objects
    /// marked.
    ///
    /// # Panics
    /// Panics if a root or any reachable reference is not a slot of this
    /// manager, or designates a free slot.
    pub fn mark(&self, roots: &[ObjectRef]) -> usize {
        mark_from(roots, &|obj| self.resolve_slot(obj))
    }

    /// Reclaim every in-use slot whose mark is clear, clearing the marks of
    /// survivors. Returns the number of objects freed.
    pub fn sweep(&self) -> usize {
        self.sweep_with(SweepOptions {
            poison: self.config.poison_freed,
            last_sweep: false,
        })
    }

    fn sweep_with(&self, options: SweepOptions) -> usize {
        // Finalizers may allocate; none of those allocations may collect
        let was_collecting = self.collecting.replace(true);
        let mut freed_types = self.config.collect_stats.then(FxHashMap::default);
        let chunk_count = self.chunks.borrow().len();
        let mut freed = 0;

        for id in 0..chunk_count {
            let chunk = Rc::clone(&self.chunks.borrow()[id]);
            freed += chunk.sweep(
                &self.free_lists[chunk.size_class()],
                options,
                freed_types.as_mut(),
            );
        }

        if let Some(counts) = freed_types {
            let mut stats = self.stats.borrow_mut();
            for (name, count) in counts {
                *stats.freed_by_type.entry(name).or_default() += count;
            }
        }
        self.collecting.set(was_collecting);
        freed
    }

    fn resolve_slot(&self, obj: ObjectRef) -> Option<SlotInfo> {
        let id = find_chunk(&self.chunk_bounds.borrow(), obj.addr())?;
        let chunks = self.chunks.borrow();
        let chunk = &chunks[id as usize];
        let index = chunk.slot_index(obj.addr())?;
        Some(SlotInfo {
            vtable: chunk.vtable(index),
        })
    }

    /// Allow or forbid collection. A disabled manager grows instead.
    pub fn set_enable_gc(&self, enable: bool) {
        self.gc_enabled.set(enable);
    }

    /// Is collection enabled?
    pub fn is_gc_enabled(&self) -> bool {
        self.gc_enabled.get()
    }

    /// Block or unblock collection. Prefer [`GcBlocker`] for scoped use.
    pub fn set_gc_blocked(&self, blocked: bool) {
        self.gc_blocked.set(blocked);
    }

    /// Is collection currently blocked?
    pub fn is_gc_blocked(&self) -> bool {
        self.gc_blocked.get()
    }

    /// Block collection until the returned guard is dropped.
    pub fn block_gc(&self) -> GcBlocker<'_> {
        GcBlocker::new(self)
    }

    // ---------------------------------------------------------------
    // Interpreter frames
    // ---------------------------------------------------------------

    /// Register a block of `frame_size` value slots as roots. Every slot
    /// starts out `undefined`.
    pub fn alloc_stack_frame(&self, frame_size: usize) -> StackFrame {
        self.frames.register(frame_size)
    }

    /// Release a frame obtained from [`alloc_stack_frame`](Self::alloc_stack_frame).
    ///
    /// # Panics
    /// Panics if the frame was registered with a different manager.
    pub fn dealloc_stack_frame(&self, frame: StackFrame) {
        let id = frame.id();
        assert!(
            self.frames.unregister(frame),
            "v4-mm: stack frame {id:?} is not registered with this memory manager"
        );
    }

    /// Number of registered interpreter frames
    pub fn stack_frame_count(&self) -> usize {
        self.frames.len()
    }

    // ---------------------------------------------------------------
    // Diagnostics
    // ---------------------------------------------------------------

    /// Statistics snapshot
    pub fn stats(&self) -> MmStats {
        self.stats.borrow().snapshot.clone()
    }

    /// Freed-object counts per type name, highest first. Empty unless
    /// `collect_stats` is enabled.
    pub fn freed_object_stats(&self) -> Vec<(&'static str, usize)> {
        self.stats.borrow().freed_types_sorted()
    }

    /// Log the statistics report
    pub fn dump_stats(&self) {
        self.stats.borrow().dump();
    }

    /// Number of chunks reserved
    pub fn chunk_count(&self) -> usize {
        self.chunks.borrow().len()
    }

    /// Number of in-use slots across all chunks
    pub fn live_objects(&self) -> usize {
        self.chunks.borrow().iter().map(|c| c.live_count()).sum()
    }

    /// Bytes held by in-use slots
    pub fn used_bytes(&self) -> usize {
        self.chunks
            .borrow()
            .iter()
            .map(|c| c.live_count() * c.slot_size())
            .sum()
    }

    /// Length of the free list of size class `class`
    pub fn free_list_len(&self, class: usize) -> usize {
        let chunks = self.chunks.borrow();
        let mut len = 0;
        let mut cursor = self.free_lists.get(class).and_then(Cell::get);
        while let Some(slot) = cursor {
            len += 1;
            cursor = chunks[slot.chunk as usize]
                .header(slot.index as usize)
                .next_free();
        }
        len
    }

    /// Header of the slot at `obj`, if `obj` is exactly the start of a slot
    /// in one of this manager's chunks.
    pub fn slot_header(&self, obj: ObjectRef) -> Option<&SlotHeader> {
        let id = find_chunk(&self.chunk_bounds.borrow(), obj.addr())?;
        self.chunks.borrow()[id as usize].slot_index(obj.addr())?;
        // SAFETY: `obj` is a validated slot start and chunks live as long as
        // the manager
        Some(unsafe { obj.header() })
    }

    /// Is `obj` an in-use slot of this manager?
    pub fn is_live(&self, obj: ObjectRef) -> bool {
        self.slot_header(obj).is_some_and(SlotHeader::in_use)
    }

    /// Is `obj` an in-use slot with its mark bit set?
    pub fn is_marked(&self, obj: ObjectRef) -> bool {
        self.slot_header(obj)
            .is_some_and(|h| h.in_use() && h.is_marked())
    }

    /// Size class of the chunk holding `obj`
    pub fn size_class_of(&self, obj: ObjectRef) -> Option<usize> {
        let id = find_chunk(&self.chunk_bounds.borrow(), obj.addr())?;
        Some(self.chunks.borrow()[id as usize].size_class())
    }

    pub(crate) fn chunk_bounds(&self) -> std::cell::Ref<'_, Vec<ChunkBounds>> {
        self.chunk_bounds.borrow()
    }

    pub(crate) fn chunk(&self, id: u32) -> Rc<Chunk> {
        Rc::clone(&self.chunks.borrow()[id as usize])
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.collecting.set(true);

        let leaked_frames = self.frames.len();
        if leaked_frames > 0 {
            tracing::debug!(
                target: "v4::gc",
                frames = leaked_frames,
                "stack frames still registered at shutdown"
            );
        }

        let freed = self.sweep_with(SweepOptions {
            poison: false,
            last_sweep: true,
        });
        tracing::debug!(
            target: "v4::gc",
            finalized = freed,
            chunks = self.chunk_count(),
            "memory manager shut down"
        );

        if self.config.collect_stats {
            self.dump_stats();
        }
    }
}

#[cold]
#[inline(never)]
fn fatal(err: MmError) -> ! {
    tracing::error!(target: "v4::gc", error = %err, "fatal allocation failure");
    panic!("v4-mm: {err}");
}
