//! Chunk-based allocation.
//!
//! Memory is reserved from the OS in page-aligned chunks (64KB by default).
//! Each chunk is dedicated to a single size class and carved into equal
//! slots when it is created. Free slots are threaded into per-class free
//! lists through the `next_free` field of their headers.
//!
//! ## Layout
//!
//! ```text
//! Chunk (chunk_size rounded up to PAGE_SIZE):
//! ┌──────────────────────────────┐
//! │ Slot 0: [SlotHeader|payload] │
//! │ Slot 1: [SlotHeader|payload] │
//! │ ...                          │
//! │ Slot N: [SlotHeader|payload] │
//! │ (unused tail)                │
//! └──────────────────────────────┘
//!
//! Metadata stored separately (not inline):
//!   - vtables: per-slot trace/finalize entry points for typed objects
//! ```

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use rustc_hash::FxHashMap;

use crate::error::{MmError, MmResult};
use crate::object::{HEADER_SIZE, ObjectRef, ObjectVTable, SlotHeader};

/// Page granularity for chunk reservations.
pub const PAGE_SIZE: usize = 4096;

/// Default chunk size: 64KB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// log2 of the size-class quantum.
pub const SLOT_SIZE_SHIFT: u32 = 4;

/// Size-class quantum and slot alignment.
pub const SLOT_ALIGN: usize = 1 << SLOT_SIZE_SHIFT;

/// Allocation ceiling (exclusive). There is no large-object path.
pub const MAX_ITEM_SIZE: usize = 256;

/// Number of free lists. Index 0 is unused; class `k` holds `16 * k` byte slots.
pub const NUM_SIZE_CLASSES: usize = MAX_ITEM_SIZE >> SLOT_SIZE_SHIFT;

/// Byte written over freed payloads when poisoning is enabled.
pub const POISON_BYTE: u8 = 0xbb;

/// Round `size` up to the next multiple of the slot alignment.
#[inline]
pub const fn align_size(size: usize) -> usize {
    (size + SLOT_ALIGN - 1) & !(SLOT_ALIGN - 1)
}

/// Size class of an already aligned size.
#[inline]
pub const fn size_class_index(size: usize) -> usize {
    size >> SLOT_SIZE_SHIFT
}

/// Slot size of a size class.
#[inline]
pub const fn class_slot_size(class: usize) -> usize {
    class << SLOT_SIZE_SHIFT
}

/// Stable identity of a slot: chunk id plus slot index within the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub(crate) chunk: u32,
    pub(crate) index: u32,
}

/// Address range of a chunk, kept sorted by `start` for membership lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkBounds {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) chunk: u32,
}

/// Find the chunk containing `addr` in a table sorted by start address.
pub(crate) fn find_chunk(bounds: &[ChunkBounds], addr: usize) -> Option<u32> {
    let idx = bounds.partition_point(|b| b.start <= addr);
    let candidate = bounds.get(idx.checked_sub(1)?)?;
    (addr < candidate.end).then_some(candidate.chunk)
}

/// Knobs applied while sweeping a chunk.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SweepOptions {
    /// Overwrite freed payloads with [`POISON_BYTE`]
    pub(crate) poison: bool,
    /// Free every in-use slot regardless of its mark (manager teardown)
    pub(crate) last_sweep: bool,
}

/// A page-aligned memory region carved into slots of one size class.
pub struct Chunk {
    id: u32,
    base: NonNull<u8>,
    layout: Layout,
    slot_size: usize,
    num_slots: usize,
    /// Per-slot vtable, set for typed allocations, cleared on free.
    vtables: RefCell<Vec<Option<ObjectVTable>>>,
    /// Number of in-use slots.
    live_count: Cell<usize>,
}

impl Chunk {
    /// Reserve a chunk for `class` and carve it into free slots.
    ///
    /// The region is the larger of `chunk_size` and one slot, rounded up to
    /// the page size. Every slot header starts free and unmarked; slot `i`
    /// links to slot `i + 1` and the last slot's link is empty. Returns the
    /// chunk together with the head of its free chain.
    pub(crate) fn reserve(id: u32, class: usize, chunk_size: usize) -> MmResult<(Self, SlotId)> {
        let slot_size = class_slot_size(class);
        assert!(
            slot_size >= HEADER_SIZE && slot_size < MAX_ITEM_SIZE,
            "invalid size class {class}"
        );

        let bytes = chunk_size.max(slot_size).next_multiple_of(PAGE_SIZE);
        let layout = Layout::from_size_align(bytes, PAGE_SIZE)
            .map_err(|_| MmError::OutOfMemory { requested: bytes })?;
        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or(MmError::OutOfMemory { requested: bytes })?;

        let num_slots = bytes / slot_size;
        let chunk = Self {
            id,
            base,
            layout,
            slot_size,
            num_slots,
            vtables: RefCell::new(vec![None; num_slots]),
            live_count: Cell::new(0),
        };

        for index in 0..num_slots {
            let next = (index + 1 < num_slots).then(|| chunk.slot_id(index + 1));
            // SAFETY: index < num_slots, so the slot lies inside the reservation
            unsafe { chunk.slot_ptr(index).write(SlotHeader::free(next)) };
        }

        let head = chunk.slot_id(0);
        Ok((chunk, head))
    }

    #[inline]
    fn slot_id(&self, index: usize) -> SlotId {
        SlotId {
            chunk: self.id,
            index: index as u32,
        }
    }

    /// Raw pointer to a slot header. `index` must be `< num_slots`.
    #[inline]
    fn slot_ptr(&self, index: usize) -> *mut SlotHeader {
        debug_assert!(index < self.num_slots);
        self.base
            .as_ptr()
            .wrapping_add(index * self.slot_size)
            .cast::<SlotHeader>()
    }

    /// Reference to the slot at `index`.
    #[inline]
    pub(crate) fn slot_ref(&self, index: usize) -> ObjectRef {
        // SAFETY: slot_ptr is derived from the non-null chunk base
        ObjectRef::from_header(unsafe { NonNull::new_unchecked(self.slot_ptr(index)) })
    }

    /// Header of the slot at `index`.
    #[inline]
    pub(crate) fn header(&self, index: usize) -> &SlotHeader {
        // SAFETY: every slot header is initialised in `reserve` and lives as
        // long as the chunk
        unsafe { &*self.slot_ptr(index) }
    }

    /// Chunk id (position in the manager's chunk table)
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// First slot address
    #[inline]
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One past the last slot (the unused tail is excluded)
    #[inline]
    pub fn end(&self) -> usize {
        self.start() + self.num_slots * self.slot_size
    }

    /// Bytes reserved from the OS
    #[inline]
    pub fn reserved_bytes(&self) -> usize {
        self.layout.size()
    }

    /// Slot size in bytes
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Size class served by this chunk
    #[inline]
    pub fn size_class(&self) -> usize {
        size_class_index(self.slot_size)
    }

    /// Number of slots carved from this chunk
    #[inline]
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Number of in-use slots
    #[inline]
    pub fn live_count(&self) -> usize {
        self.live_count.get()
    }

    pub(crate) fn bounds(&self) -> ChunkBounds {
        ChunkBounds {
            start: self.start(),
            end: self.end(),
            chunk: self.id,
        }
    }

    /// Does `addr` fall within the slot area of this chunk?
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }

    /// Slot index for an address that must be exactly at a slot start.
    #[inline]
    pub fn slot_index(&self, addr: usize) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        let offset = addr - self.start();
        (offset % self.slot_size == 0).then(|| offset / self.slot_size)
    }

    /// Pop the slot at `index` off a free list and mark it in use.
    pub(crate) fn claim(&self, index: usize) -> (ObjectRef, Option<SlotId>) {
        let header = self.header(index);
        let next = header.next_free();
        header.claim();
        self.vtables.borrow_mut()[index] = None;
        self.live_count.set(self.live_count.get() + 1);
        (self.slot_ref(index), next)
    }

    pub(crate) fn set_vtable(&self, index: usize, vtable: ObjectVTable) {
        self.vtables.borrow_mut()[index] = Some(vtable);
    }

    pub(crate) fn vtable(&self, index: usize) -> Option<ObjectVTable> {
        self.vtables.borrow()[index]
    }

    /// Sweep this chunk: reclaim every in-use slot whose mark is clear and
    /// clear the mark of every survivor.
    ///
    /// Reclaimed slots are finalized, optionally poisoned, and pushed onto
    /// `free_head`. Returns the number of slots freed.
    pub(crate) fn sweep(
        &self,
        free_head: &Cell<Option<SlotId>>,
        options: SweepOptions,
        mut freed_types: Option<&mut FxHashMap<&'static str, usize>>,
    ) -> usize {
        let mut dead: Vec<(usize, Option<ObjectVTable>)> = Vec::new();

        {
            let mut vtables = self.vtables.borrow_mut();
            for index in 0..self.num_slots {
                let header = self.header(index);
                if !header.in_use() {
                    continue;
                }
                if header.is_marked() && !options.last_sweep {
                    header.set_mark(false);
                    continue;
                }
                dead.push((index, vtables[index].take()));
            }
        }

        // Finalizers run with no borrows held
        for &(index, vtable) in &dead {
            let Some(vtable) = vtable else { continue };
            if let Some(counts) = freed_types.as_deref_mut() {
                *counts.entry(vtable.type_name).or_default() += 1;
            }
            // SAFETY: the slot holds a live object of the vtable's type and is
            // finalized exactly once before being relinked
            unsafe { (vtable.finalize)(self.slot_ref(index).payload()) };
        }

        for &(index, _) in &dead {
            if options.poison {
                // SAFETY: the payload spans the rest of the slot
                unsafe {
                    std::ptr::write_bytes(
                        self.slot_ref(index).payload().as_ptr(),
                        POISON_BYTE,
                        self.slot_size - HEADER_SIZE,
                    );
                }
            }
            self.header(index).release(free_head.get());
            free_head.set(Some(self.slot_id(index)));
        }

        self.live_count.set(self.live_count.get() - dead.len());
        dead.len()
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: base was allocated in `reserve` with this exact layout
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("start", &format_args!("{:#x}", self.start()))
            .field("slot_size", &self.slot_size)
            .field("num_slots", &self.num_slots)
            .field("live", &self.live_count.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walk a free chain confined to one chunk
    fn chain_len(chunk: &Chunk, head: Option<SlotId>) -> usize {
        let mut len = 0;
        let mut cursor = head;
        while let Some(id) = cursor {
            assert_eq!(id.chunk, chunk.id());
            len += 1;
            cursor = chunk.header(id.index as usize).next_free();
        }
        len
    }

    #[test]
    fn test_size_class_arithmetic() {
        assert_eq!(align_size(1), 16);
        assert_eq!(align_size(16), 16);
        assert_eq!(align_size(17), 32);
        assert_eq!(size_class_index(32), 2);
        assert_eq!(size_class_index(240), 15);
        assert_eq!(class_slot_size(3), 48);
        assert_eq!(NUM_SIZE_CLASSES, 16);
    }

    #[test]
    fn test_find_chunk() {
        let bounds = [
            ChunkBounds {
                start: 0x1000,
                end: 0x2000,
                chunk: 1,
            },
            ChunkBounds {
                start: 0x4000,
                end: 0x5000,
                chunk: 0,
            },
        ];
        assert_eq!(find_chunk(&bounds, 0x0fff), None);
        assert_eq!(find_chunk(&bounds, 0x1000), Some(1));
        assert_eq!(find_chunk(&bounds, 0x1fff), Some(1));
        assert_eq!(find_chunk(&bounds, 0x2000), None);
        assert_eq!(find_chunk(&bounds, 0x4800), Some(0));
        assert_eq!(find_chunk(&bounds, 0x5000), None);
        assert_eq!(find_chunk(&[], 0x1000), None);
    }

    #[test]
    fn test_chunk_carving() {
        let (chunk, head) = Chunk::reserve(0, 2, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(chunk.slot_size(), 32);
        assert_eq!(chunk.num_slots(), DEFAULT_CHUNK_SIZE / 32);
        assert_eq!(chunk.start() % PAGE_SIZE, 0);
        assert_eq!(head, SlotId { chunk: 0, index: 0 });
        assert_eq!(chain_len(&chunk, Some(head)), chunk.num_slots());

        let last = chunk.header(chunk.num_slots() - 1);
        assert!(!last.in_use());
        assert_eq!(last.next_free(), None);
    }

    #[test]
    fn test_chunk_rounds_to_pages() {
        let (chunk, _) = Chunk::reserve(0, 15, 100).unwrap();
        assert_eq!(chunk.reserved_bytes(), PAGE_SIZE);
        assert_eq!(chunk.num_slots(), PAGE_SIZE / 240);
        assert_eq!(chunk.end(), chunk.start() + 17 * 240);
    }

    #[test]
    fn test_slot_index_alignment() {
        let (chunk, _) = Chunk::reserve(0, 3, PAGE_SIZE).unwrap();
        let start = chunk.start();
        assert_eq!(chunk.slot_index(start), Some(0));
        assert_eq!(chunk.slot_index(start + 48), Some(1));
        assert_eq!(chunk.slot_index(start + 16), None);
        assert_eq!(chunk.slot_index(chunk.end()), None);
    }

    #[test]
    fn test_claim_and_sweep() {
        let (chunk, head) = Chunk::reserve(0, 2, PAGE_SIZE).unwrap();
        let free = Cell::new(Some(head));

        let (a, next) = chunk.claim(0);
        free.set(next);
        let (b, next) = chunk.claim(1);
        free.set(next);
        assert_eq!(chunk.live_count(), 2);
        assert_eq!(b.addr() - a.addr(), 32);

        // Keep `a`, drop `b`
        unsafe { a.header() }.set_mark(true);
        let freed = chunk.sweep(&free, SweepOptions::default(), None);
        assert_eq!(freed, 1);
        assert_eq!(chunk.live_count(), 1);
        assert!(unsafe { a.header() }.in_use());
        assert!(!unsafe { a.header() }.is_marked());
        assert!(!unsafe { b.header() }.in_use());
        assert_eq!(free.get(), Some(SlotId { chunk: 0, index: 1 }));

        // `a` survived with its mark cleared, so an unmarked pass reclaims it
        // and the pass after that finds nothing
        assert_eq!(chunk.sweep(&free, SweepOptions::default(), None), 1);
        assert_eq!(chunk.sweep(&free, SweepOptions::default(), None), 0);
        assert_eq!(chain_len(&chunk, free.get()), chunk.num_slots());
    }

    #[test]
    fn test_poisoned_sweep() {
        let (chunk, head) = Chunk::reserve(0, 4, PAGE_SIZE).unwrap();
        let free = Cell::new(Some(head));
        let (obj, next) = chunk.claim(0);
        free.set(next);

        let options = SweepOptions {
            poison: true,
            last_sweep: false,
        };
        assert_eq!(chunk.sweep(&free, options, None), 1);

        let payload =
            unsafe { std::slice::from_raw_parts(obj.payload().as_ptr(), 64 - HEADER_SIZE) };
        assert!(payload.iter().all(|&b| b == POISON_BYTE));
    }

    #[test]
    fn test_last_sweep_ignores_marks() {
        let (chunk, head) = Chunk::reserve(0, 2, PAGE_SIZE).unwrap();
        let free = Cell::new(Some(head));
        let (obj, next) = chunk.claim(0);
        free.set(next);
        unsafe { obj.header() }.set_mark(true);

        let options = SweepOptions {
            poison: false,
            last_sweep: true,
        };
        assert_eq!(chunk.sweep(&free, options, None), 1);
        assert_eq!(chunk.live_count(), 0);
    }
}
