//! Allocation and collection statistics

use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::chunk::{NUM_SIZE_CLASSES, class_slot_size};

/// Snapshot of memory manager statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MmStats {
    /// Allocation requests observed per size class (index = class)
    pub allocations: [usize; NUM_SIZE_CLASSES],
    /// Number of completed collections
    pub collections: usize,
    /// Objects marked by the last collection
    pub last_marked: usize,
    /// Objects freed by the last collection
    pub last_freed: usize,
    /// Objects freed across all collections
    pub total_freed: usize,
    /// Bytes currently reserved in chunks
    pub reserved_bytes: usize,
    /// Peak bytes reserved in chunks
    pub max_reserved_bytes: usize,
    /// Peak bytes in use at the start of a collection
    pub max_used_before_gc: usize,
    /// Peak bytes in use at the end of a collection
    pub max_used_after_gc: usize,
    /// Pause time of the last collection
    pub last_pause: Duration,
    /// Accumulated pause time
    pub total_pause: Duration,
}

impl MmStats {
    /// Total allocation requests across every size class
    pub fn total_allocations(&self) -> usize {
        self.allocations.iter().sum()
    }
}

/// Mutable statistics owned by the manager
#[derive(Default)]
pub(crate) struct StatsState {
    pub(crate) snapshot: MmStats,
    /// Freed objects per type name; only filled when enabled
    pub(crate) freed_by_type: FxHashMap<&'static str, usize>,
}

impl StatsState {
    pub(crate) fn record_allocation(&mut self, class: usize) {
        self.snapshot.allocations[class] += 1;
    }

    pub(crate) fn record_reservation(&mut self, bytes: usize) {
        let s = &mut self.snapshot;
        s.reserved_bytes += bytes;
        s.max_reserved_bytes = s.max_reserved_bytes.max(s.reserved_bytes);
    }

    pub(crate) fn record_collection(
        &mut self,
        marked: usize,
        freed: usize,
        used_before: usize,
        used_after: usize,
        pause: Duration,
    ) {
        let s = &mut self.snapshot;
        s.collections += 1;
        s.last_marked = marked;
        s.last_freed = freed;
        s.total_freed += freed;
        s.max_used_before_gc = s.max_used_before_gc.max(used_before);
        s.max_used_after_gc = s.max_used_after_gc.max(used_after);
        s.last_pause = pause;
        s.total_pause += pause;
    }

    /// Freed-object counts sorted by count, highest first
    pub(crate) fn freed_types_sorted(&self) -> Vec<(&'static str, usize)> {
        let mut entries: Vec<_> = self
            .freed_by_type
            .iter()
            .map(|(&name, &count)| (name, count))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        entries
    }

    /// Emit the statistics report through `tracing`.
    pub(crate) fn dump(&self) {
        let s = &self.snapshot;
        tracing::info!(target: "v4::gc", "memory allocation statistics:");
        tracing::info!(target: "v4::gc", "  total memory reserved: {}", s.max_reserved_bytes);
        tracing::info!(target: "v4::gc", "  max memory used before a GC run: {}", s.max_used_before_gc);
        tracing::info!(target: "v4::gc", "  max memory used after a GC run: {}", s.max_used_after_gc);
        tracing::info!(
            target: "v4::gc",
            "  collections: {} (total pause {} us)",
            s.collections,
            s.total_pause.as_micros()
        );
        tracing::info!(target: "v4::gc", "  requests for different item sizes:");
        for class in 1..NUM_SIZE_CLASSES {
            tracing::info!(
                target: "v4::gc",
                "    {:>3} bytes: {}",
                class_slot_size(class),
                s.allocations[class]
            );
        }

        let freed = self.freed_types_sorted();
        if !freed.is_empty() {
            tracing::info!(target: "v4::gc", "  freed objects by type:");
            for (name, count) in freed {
                tracing::info!(target: "v4::gc", "    {name}: {count}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_collection_tracks_peaks() {
        let mut state = StatsState::default();
        state.record_collection(3, 7, 1000, 300, Duration::from_micros(5));
        state.record_collection(1, 2, 500, 400, Duration::from_micros(10));

        let s = &state.snapshot;
        assert_eq!(s.collections, 2);
        assert_eq!(s.last_marked, 1);
        assert_eq!(s.last_freed, 2);
        assert_eq!(s.total_freed, 9);
        assert_eq!(s.max_used_before_gc, 1000);
        assert_eq!(s.max_used_after_gc, 400);
        assert_eq!(s.total_pause, Duration::from_micros(15));
    }

    #[test]
    fn test_reservations() {
        let mut state = StatsState::default();
        state.record_reservation(4096);
        state.record_reservation(8192);
        assert_eq!(state.snapshot.reserved_bytes, 12288);
        assert_eq!(state.snapshot.max_reserved_bytes, 12288);
    }

    #[test]
    fn test_freed_types_sorted() {
        let mut state = StatsState::default();
        state.freed_by_type.insert("String", 3);
        state.freed_by_type.insert("Object", 10);
        state.freed_by_type.insert("Array", 3);
        assert_eq!(
            state.freed_types_sorted(),
            vec![("Object", 10), ("Array", 3), ("String", 3)]
        );
    }

    #[test]
    fn test_allocation_counts() {
        let mut state = StatsState::default();
        state.record_allocation(2);
        state.record_allocation(2);
        state.record_allocation(5);
        assert_eq!(state.snapshot.allocations[2], 2);
        assert_eq!(state.snapshot.total_allocations(), 3);
    }
}
