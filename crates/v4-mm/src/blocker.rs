//! Scoped collection blocking

use crate::manager::MemoryManager;

/// Blocks collection for as long as it is alive.
///
/// Entering records whether collection was already blocked; leaving restores
/// that state, so blockers nest. Allocations made while blocked never
/// collect: a free-list miss grows the heap instead.
///
/// ```
/// use v4_mm::{GcBlocker, MemoryManager};
///
/// let mm = MemoryManager::with_defaults();
/// {
///     let _outer = GcBlocker::new(&mm);
///     {
///         let _inner = GcBlocker::new(&mm);
///     }
///     assert!(mm.is_gc_blocked());
/// }
/// assert!(!mm.is_gc_blocked());
/// ```
#[must_use = "collection is only blocked while the guard is alive"]
pub struct GcBlocker<'a> {
    mm: &'a MemoryManager,
    was_blocked: bool,
}

impl<'a> GcBlocker<'a> {
    /// Block collection on `mm` until the guard is dropped
    pub fn new(mm: &'a MemoryManager) -> Self {
        let was_blocked = mm.is_gc_blocked();
        mm.set_gc_blocked(true);
        Self { mm, was_blocked }
    }
}

impl Drop for GcBlocker<'_> {
    fn drop(&mut self) {
        self.mm.set_gc_blocked(self.was_blocked);
    }
}
