//! Mark phase
//!
//! Worklist traversal from the root set. Each reachable slot gets its mark
//! bit set exactly once; already marked slots are skipped, so cycles and
//! shared references terminate.
//!
//! Every reference is resolved against the chunk table before its header is
//! touched. A reference that is not the start of a slot in one of the
//! manager's chunks is a fatal error, as is a reference to a free slot.

use crate::object::{ObjectRef, ObjectVTable};
use crate::value::Value;

/// What the chunk table knows about a slot.
#[derive(Clone, Copy)]
pub(crate) struct SlotInfo {
    /// Trace and finalize entry points; `None` for raw allocations
    pub(crate) vtable: Option<ObjectVTable>,
}

/// Resolves a reference to its slot, or `None` if it is not a heap slot.
pub(crate) type SlotResolver<'a> = &'a dyn Fn(ObjectRef) -> Option<SlotInfo>;

/// Marking state handed to [`Trace`](crate::Trace) implementations.
pub struct Tracer<'a> {
    worklist: Vec<(ObjectRef, Option<ObjectVTable>)>,
    marked: usize,
    resolve: SlotResolver<'a>,
}

impl<'a> Tracer<'a> {
    pub(crate) fn new(resolve: SlotResolver<'a>) -> Self {
        Self {
            worklist: Vec::with_capacity(256),
            marked: 0,
            resolve,
        }
    }

    /// Mark an object as reachable.
    ///
    /// # Panics
    /// Panics if `obj` is not a slot of this heap, or if the slot is not in
    /// use: either means the heap graph is corrupt.
    pub fn mark(&mut self, obj: ObjectRef) {
        let Some(slot) = (self.resolve)(obj) else {
            panic!("v4-mm: marking {obj:?}, which is not a heap slot");
        };
        // SAFETY: the resolver only accepts slot starts inside live chunks
        let header = unsafe { obj.header() };
        assert!(header.in_use(), "v4-mm: marking free slot {obj:?}");
        if header.is_marked() {
            return;
        }
        header.set_mark(true);
        self.marked += 1;
        self.worklist.push((obj, slot.vtable));
    }

    /// Mark the object a value references, if any.
    #[inline]
    pub fn mark_value(&mut self, value: Value) {
        if let Some(obj) = value.as_object() {
            self.mark(obj);
        }
    }

    /// Number of objects marked so far
    #[inline]
    pub fn marked(&self) -> usize {
        self.marked
    }

    /// Trace objects until the worklist is empty. Slots without a vtable
    /// (raw allocations) own nothing.
    pub(crate) fn drain(&mut self) {
        while let Some((obj, vtable)) = self.worklist.pop() {
            if let Some(vtable) = vtable {
                // SAFETY: the vtable was installed for the object in this slot
                unsafe { (vtable.trace)(obj.payload(), self) };
            }
        }
    }
}

/// Mark everything reachable from `roots`, returning the number of objects
/// newly marked.
pub(crate) fn mark_from(roots: &[ObjectRef], resolve: SlotResolver<'_>) -> usize {
    let mut tracer = Tracer::new(resolve);
    for &root in roots {
        tracer.mark(root);
    }
    tracer.drain();
    tracer.marked()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::SlotHeader;
    use std::ptr::NonNull;

    fn live_header() -> Box<SlotHeader> {
        let header = Box::new(SlotHeader::free(None));
        header.claim();
        header
    }

    fn as_ref(header: &SlotHeader) -> ObjectRef {
        ObjectRef::from_header(NonNull::from(header))
    }

    fn any_slot(_: ObjectRef) -> Option<SlotInfo> {
        Some(SlotInfo { vtable: None })
    }

    #[test]
    fn test_mark_single_root() {
        let header = live_header();
        let marked = mark_from(&[as_ref(&header)], &any_slot);
        assert_eq!(marked, 1);
        assert!(header.is_marked());
    }

    #[test]
    fn test_duplicate_roots_marked_once() {
        let header = live_header();
        let root = as_ref(&header);
        assert_eq!(mark_from(&[root, root, root], &any_slot), 1);
    }

    #[test]
    fn test_mark_value_ignores_numbers() {
        let mut tracer = Tracer::new(&any_slot);
        tracer.mark_value(Value::number(42.0));
        tracer.mark_value(Value::undefined());
        assert_eq!(tracer.marked(), 0);
    }

    #[test]
    #[should_panic(expected = "marking free slot")]
    fn test_marking_free_slot_is_fatal() {
        let header = Box::new(SlotHeader::free(None));
        mark_from(&[as_ref(&header)], &any_slot);
    }

    #[test]
    #[should_panic(expected = "not a heap slot")]
    fn test_unresolved_reference_is_fatal() {
        // The header is never read: resolution fails first
        let stray = ObjectRef::from_addr(0x10).unwrap();
        mark_from(&[stray], &|_| None);
    }
}
