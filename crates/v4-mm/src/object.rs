//! Heap object layout
//!
//! Every slot starts with a 16 byte [`SlotHeader`]. The payload the engine
//! owns begins right after it, so typed allocations are laid out as a
//! [`GcBox<T>`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::chunk::SlotId;
use crate::mark::Tracer;
use crate::value::Value;

/// Header at the start of every slot.
///
/// `mark` is only meaningful while `in_use` is set; `next_free` only while it
/// is clear.
#[repr(C, align(16))]
pub struct SlotHeader {
    in_use: Cell<bool>,
    mark: Cell<bool>,
    next_free: Cell<Option<SlotId>>,
}

/// Size of [`SlotHeader`]; payloads start at this offset.
pub const HEADER_SIZE: usize = size_of::<SlotHeader>();

const _: () = assert!(HEADER_SIZE == 16);

impl SlotHeader {
    /// Header of a free slot linked to `next`
    pub(crate) const fn free(next: Option<SlotId>) -> Self {
        Self {
            in_use: Cell::new(false),
            mark: Cell::new(false),
            next_free: Cell::new(next),
        }
    }

    /// Is the slot currently allocated?
    #[inline]
    pub fn in_use(&self) -> bool {
        self.in_use.get()
    }

    /// Was the slot reached by the current mark phase?
    #[inline]
    pub fn is_marked(&self) -> bool {
        self.mark.get()
    }

    #[inline]
    pub(crate) fn set_mark(&self, mark: bool) {
        self.mark.set(mark);
    }

    #[inline]
    pub(crate) fn next_free(&self) -> Option<SlotId> {
        self.next_free.get()
    }

    /// Transition a free slot to allocated.
    #[inline]
    pub(crate) fn claim(&self) {
        debug_assert!(!self.in_use.get(), "claiming a slot that is in use");
        self.in_use.set(true);
        self.mark.set(false);
        self.next_free.set(None);
    }

    /// Transition an allocated slot back onto a free list.
    #[inline]
    pub(crate) fn release(&self, next: Option<SlotId>) {
        self.in_use.set(false);
        self.mark.set(false);
        self.next_free.set(next);
    }
}

impl fmt::Debug for SlotHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotHeader")
            .field("in_use", &self.in_use.get())
            .field("mark", &self.mark.get())
            .field("next_free", &self.next_free.get())
            .finish()
    }
}

/// Untyped reference to an allocated slot.
///
/// This is the address the collector reasons about: the start of the slot,
/// where its header lives.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(NonNull<SlotHeader>);

impl ObjectRef {
    #[inline]
    pub(crate) fn from_header(ptr: NonNull<SlotHeader>) -> Self {
        Self(ptr)
    }

    /// Wrap a raw address. Returns `None` for null.
    #[inline]
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut SlotHeader).map(Self)
    }

    /// Slot address
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Pointer to the payload following the header
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        let ptr = self.0.as_ptr().cast::<u8>().wrapping_add(HEADER_SIZE);
        // SAFETY: `self.0` is non-null and slots never sit at the top of the
        // address space, so adding the header size cannot wrap to null.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Borrow the slot header.
    ///
    /// # Safety
    /// `self` must point at a slot of a memory manager that is still alive.
    #[inline]
    pub unsafe fn header<'a>(self) -> &'a SlotHeader {
        // SAFETY: upheld by the caller
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

/// Layout of a typed allocation
#[repr(C)]
pub struct GcBox<T> {
    header: SlotHeader,
    value: T,
}

/// Typed handle to a heap object.
///
/// Handles are plain pointers: they do not keep the object alive. An object
/// stays valid only while it is reachable from the root set or collection is
/// blocked.
pub struct Gc<T> {
    ptr: NonNull<GcBox<T>>,
    _marker: PhantomData<T>,
}

impl<T> Gc<T> {
    /// Rebuild a typed handle from an untyped reference.
    ///
    /// # Safety
    /// `obj` must have been produced by `alloc_object::<T>` and still be live.
    #[inline]
    pub unsafe fn from_object_ref(obj: ObjectRef) -> Self {
        Self {
            ptr: obj.0.cast(),
            _marker: PhantomData,
        }
    }

    /// Untyped reference to the same slot
    #[inline]
    pub fn object_ref(self) -> ObjectRef {
        ObjectRef(self.ptr.cast())
    }

    /// Object reference as a script value
    #[inline]
    pub fn to_value(self) -> Value {
        Value::object(self.object_ref())
    }

    /// Do both handles point at the same slot?
    #[inline]
    pub fn ptr_eq(a: Self, b: Self) -> bool {
        a.ptr == b.ptr
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Gc<T> {}

impl<T> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Gc<T> {}

impl<T> Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a handle is only dereferenced while its object is live, which
        // is the rooting contract documented on `Gc`.
        unsafe { &self.ptr.as_ref().value }
    }
}

impl<T> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Gc<{}>({:#x})",
            std::any::type_name::<T>(),
            self.ptr.as_ptr() as usize
        )
    }
}

/// Capability every heap type implements: reveal the objects it owns.
pub trait Trace {
    /// Report every directly owned object reference to `tracer`.
    fn trace(&self, tracer: &mut Tracer);
}

/// Type-erased trace entry point (payload pointer)
pub(crate) type TraceFn = unsafe fn(NonNull<u8>, &mut Tracer);

/// Type-erased finalizer entry point (payload pointer)
pub(crate) type FinalizeFn = unsafe fn(NonNull<u8>);

/// Per-type operations the collector needs for a typed slot.
#[derive(Clone, Copy)]
pub(crate) struct ObjectVTable {
    pub(crate) trace: TraceFn,
    pub(crate) finalize: FinalizeFn,
    pub(crate) type_name: &'static str,
}

impl ObjectVTable {
    pub(crate) fn of<T: Trace>() -> Self {
        Self {
            trace: trace_payload::<T>,
            finalize: finalize_payload::<T>,
            type_name: std::any::type_name::<T>(),
        }
    }
}

unsafe fn trace_payload<T: Trace>(payload: NonNull<u8>, tracer: &mut Tracer) {
    // SAFETY: the vtable is only installed for slots holding a live `T`
    let value = unsafe { payload.cast::<T>().as_ref() };
    value.trace(tracer);
}

unsafe fn finalize_payload<T>(payload: NonNull<u8>) {
    // SAFETY: called exactly once, when the slot holding the `T` is reclaimed
    unsafe { std::ptr::drop_in_place(payload.cast::<T>().as_ptr()) };
}

impl Trace for Value {
    fn trace(&self, tracer: &mut Tracer) {
        tracer.mark_value(*self);
    }
}

impl Trace for ObjectRef {
    fn trace(&self, tracer: &mut Tracer) {
        tracer.mark(*self);
    }
}

impl<T> Trace for Gc<T> {
    fn trace(&self, tracer: &mut Tracer) {
        tracer.mark(self.object_ref());
    }
}

impl<T: Trace> Trace for Option<T> {
    fn trace(&self, tracer: &mut Tracer) {
        if let Some(inner) = self {
            inner.trace(tracer);
        }
    }
}

impl<T: Trace> Trace for [T] {
    fn trace(&self, tracer: &mut Tracer) {
        for item in self {
            item.trace(tracer);
        }
    }
}

impl<T: Trace, const N: usize> Trace for [T; N] {
    fn trace(&self, tracer: &mut Tracer) {
        self.as_slice().trace(tracer);
    }
}

impl<T: Trace> Trace for Vec<T> {
    fn trace(&self, tracer: &mut Tracer) {
        self.as_slice().trace(tracer);
    }
}

impl<T: Trace + ?Sized> Trace for Box<T> {
    fn trace(&self, tracer: &mut Tracer) {
        (**self).trace(tracer);
    }
}

impl<T: Trace + Copy> Trace for Cell<T> {
    fn trace(&self, tracer: &mut Tracer) {
        self.get().trace(tracer);
    }
}

/// A `RefCell` must not be mutably borrowed across an allocation: the
/// allocation may collect, and a collection has to read every field it
/// traces. Prefer `Cell` fields for values that change while allocating.
impl<T: Trace> Trace for RefCell<T> {
    fn trace(&self, tracer: &mut Tracer) {
        match self.try_borrow() {
            Ok(value) => value.trace(tracer),
            Err(_) => panic!(
                "v4-mm: cannot trace RefCell<{}>: it is mutably borrowed across an allocation that collected",
                std::any::type_name::<T>()
            ),
        }
    }
}

macro_rules! impl_leaf_trace {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Trace for $ty {
                fn trace(&self, _tracer: &mut Tracer) {}
            }
        )*
    };
}

impl_leaf_trace!(
    (),
    bool,
    u8,
    u16,
    u32,
    u64,
    usize,
    i8,
    i16,
    i32,
    i64,
    isize,
    f32,
    f64,
    char,
    String,
    &'static str,
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of};

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_SIZE, 16);
        assert_eq!(align_of::<SlotHeader>(), 16);
        assert_eq!(offset_of!(GcBox<u64>, value), HEADER_SIZE);
        assert_eq!(size_of::<GcBox<[u64; 2]>>(), 32);
    }

    #[test]
    fn test_header_transitions() {
        let header = SlotHeader::free(None);
        assert!(!header.in_use());
        assert!(!header.is_marked());

        header.claim();
        assert!(header.in_use());
        assert_eq!(header.next_free(), None);

        header.set_mark(true);
        assert!(header.is_marked());

        let next = SlotId { chunk: 0, index: 3 };
        header.release(Some(next));
        assert!(!header.in_use());
        assert!(!header.is_marked());
        assert_eq!(header.next_free(), Some(next));
    }

    #[test]
    fn test_object_ref_payload_offset() {
        let obj = ObjectRef::from_addr(0x1000).unwrap();
        assert_eq!(obj.payload().as_ptr() as usize, 0x1010);
        assert!(ObjectRef::from_addr(0).is_none());
    }
}
