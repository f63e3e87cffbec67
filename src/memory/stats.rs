//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent. This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use std::fmt;

use super::size_class::{NUM_SIZE_CLASSES, SIZE_CLASSES};
use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `get()`, which
/// clamps negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-class pool gauges, maintained under the class lock.
#[derive(Default)]
pub(crate) struct ClassCounters {
    pub pools: Counter,
    pub exhausted: Counter,
    pub live_blocks: Counter,
}

/// Engine-level gauges.  The OS page cache keeps its own.
pub(crate) struct MallocStats {
    pub pool_bytes: Counter,
    pub os_direct_bytes: Counter,
    pub os_direct_allocs: Counter,
    pub metadata_bytes: Counter,
    pub classes: [ClassCounters; NUM_SIZE_CLASSES],
}

impl MallocStats {
    pub fn new() -> Self {
        Self {
            pool_bytes: Counter::new(),
            os_direct_bytes: Counter::new(),
            os_direct_allocs: Counter::new(),
            metadata_bytes: Counter::new(),
            classes: std::array::from_fn(|_| ClassCounters::default()),
        }
    }
}

/// Point-in-time view of allocator memory use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes currently mapped from the page provider, cache included.
    pub os_bytes: usize,
    /// Bytes parked in the OS page cache.
    pub cached_bytes: usize,
    pub cached_blocks: usize,
    /// Bytes backing small-block pools.
    pub pool_bytes: usize,
    /// Bytes backing OS-direct allocations.
    pub os_direct_bytes: usize,
    pub os_direct_allocs: usize,
    /// Bytes of lookup tables and per-class list heads.
    pub metadata_bytes: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

/// One size class in a [`HeapReport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassReport {
    pub block_size: usize,
    pub pools: usize,
    pub exhausted: usize,
    pub live_blocks: usize,
}

/// Diagnostic dump attached to fatal errors and OOM reports.
#[derive(Debug, Clone, Copy)]
pub struct HeapReport {
    pub memory: MemoryStats,
    pub classes: [ClassReport; NUM_SIZE_CLASSES],
}

impl HeapReport {
    pub(crate) fn collect(memory: MemoryStats, stats: &MallocStats) -> Self {
        Self {
            memory,
            classes: std::array::from_fn(|i| ClassReport {
                block_size: SIZE_CLASSES[i],
                pools: stats.classes[i].pools.get(),
                exhausted: stats.classes[i].exhausted.get(),
                live_blocks: stats.classes[i].live_blocks.get(),
            }),
        }
    }
}

impl fmt::Display for HeapReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.memory;
        writeln!(
            f,
            "os {} B | pools {} B | os-direct {} B in {} allocs | metadata {} B",
            m.os_bytes, m.pool_bytes, m.os_direct_bytes, m.os_direct_allocs, m.metadata_bytes
        )?;
        writeln!(
            f,
            "os cache: {} blocks, {} B (hits {}, misses {})",
            m.cached_blocks, m.cached_bytes, m.cache_hits, m.cache_misses
        )?;
        for class in self.classes.iter().filter(|c| c.pools > 0) {
            writeln!(
                f,
                "  {:>6} B: {} pools ({} active, {} exhausted), {} live blocks",
                class.block_size,
                class.pools,
                class.pools.saturating_sub(class.exhausted),
                class.exhausted,
                class.live_blocks
            )?;
        }
        Ok(())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_negative() {
        let counter = Counter::new();
        counter.add(5);
        counter.sub(8);
        assert_eq!(counter.get(), 0);
        counter.add(10);
        assert_eq!(counter.get(), 7);
    }

    #[test]
    fn test_report_lists_only_populated_classes() {
        let stats = MallocStats::new();
        stats.classes[3].pools.add(2);
        stats.classes[3].exhausted.add(1);
        stats.classes[3].live_blocks.add(100);
        let report = HeapReport::collect(MemoryStats::default(), &stats);
        let text = report.to_string();
        assert!(text.contains("64 B: 2 pools (1 active, 1 exhausted), 100 live blocks"));
        assert_eq!(text.lines().count(), 3);
    }
}
