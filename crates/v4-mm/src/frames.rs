//! Interpreter-managed stack frames
//!
//! In precise mode the interpreter registers a block of value slots when it
//! enters a function body and deregisters it on return. The root enumerator
//! walks exactly these blocks.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::value::Value;

/// Identifier of a registered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(u64);

/// A contiguous block of value slots registered as roots.
///
/// Returned by `alloc_stack_frame` and handed back to
/// `dealloc_stack_frame`. Not `Clone`: each registration is released once.
#[derive(Debug)]
pub struct StackFrame {
    id: FrameId,
    slots: Rc<[Cell<Value>]>,
}

impl StackFrame {
    /// Frame identifier
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Is the frame empty?
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Read slot `index`
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn get(&self, index: usize) -> Value {
        self.slots[index].get()
    }

    /// Write slot `index`
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn set(&self, index: usize, value: Value) {
        self.slots[index].set(value);
    }

    /// All slots
    pub fn slots(&self) -> &[Cell<Value>] {
        &self.slots
    }
}

/// Registry of live interpreter frames
#[derive(Default)]
pub(crate) struct FrameRegistry {
    frames: RefCell<FxHashMap<FrameId, Rc<[Cell<Value>]>>>,
    next_id: Cell<u64>,
}

impl FrameRegistry {
    pub(crate) fn register(&self, frame_size: usize) -> StackFrame {
        let id = FrameId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        let slots: Rc<[Cell<Value>]> = (0..frame_size)
            .map(|_| Cell::new(Value::undefined()))
            .collect();
        self.frames.borrow_mut().insert(id, slots.clone());
        StackFrame { id, slots }
    }

    /// Remove a frame; returns false if it was not registered here.
    pub(crate) fn unregister(&self, frame: StackFrame) -> bool {
        self.frames.borrow_mut().remove(&frame.id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Visit every slot of every registered frame.
    pub(crate) fn for_each_value(&self, mut visit: impl FnMut(Value)) {
        for slots in self.frames.borrow().values() {
            for slot in slots.iter() {
                visit(slot.get());
            }
        }
    }
}
