//! Per-thread small-block caches and the cross-thread bundle recycler.
//!
//! A thread keeps two bundles per size class.  Frees land in `partial`;
//! once it reaches the count or byte cap it becomes `full`, and a `full`
//! bundle that was already there is handed to the [`GlobalRecycler`] as a
//! whole.  Allocation pops `partial`, then swaps in `full`, then adopts a
//! recycled bundle, and only then takes the class lock.
//!
//! Cached blocks are linked through their first word (see
//! [`set_bundle_next`]); they stay `taken` in their pool until flushed.

use std::cell::Cell;
use std::ptr::NonNull;

use super::free_block::{bundle_next, recycler_link, set_bundle_next};
use super::size_class::NUM_SIZE_CLASSES;
use crate::sync::atomic::{AtomicU128, AtomicU32, Ordering};
use crate::sync::hint;

/// A singly linked stack of free blocks of one size class.
pub(crate) struct Bundle {
    head: Option<NonNull<u8>>,
    count: u32,
}

impl Bundle {
    pub const fn new() -> Self {
        Self {
            head: None,
            count: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// # Safety
    /// `block` must be a free block of this bundle's class owned by the
    /// calling thread.
    #[inline]
    pub unsafe fn push(&mut self, block: NonNull<u8>) {
        // Safety: caller contract.
        unsafe { set_bundle_next(block, self.head) };
        self.head = Some(block);
        self.count += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        let block = self.head?;
        // Safety: every block on the bundle was linked by `push` or `adopt`.
        self.head = unsafe { bundle_next(block) };
        self.count -= 1;
        Some(block)
    }

    /// Detach the whole stack as `(head, count)`.
    pub fn take(&mut self) -> Option<(NonNull<u8>, u32)> {
        let head = self.head.take()?;
        let count = std::mem::replace(&mut self.count, 0);
        Some((head, count))
    }

    /// Splice a null-terminated chain in front of this bundle.
    ///
    /// # Safety
    /// `head` must start a chain built by `push`, now owned by the caller.
    pub unsafe fn adopt(&mut self, head: NonNull<u8>) {
        let mut tail = head;
        let mut count = 1;
        // Safety: caller contract.
        while let Some(next) = unsafe { bundle_next(tail) } {
            tail = next;
            count += 1;
        }
        // Safety: as above.
        unsafe { set_bundle_next(tail, self.head) };
        self.head = Some(head);
        self.count += count;
    }
}

/// The `partial`/`full` bundle pair of one size class.
pub(crate) struct FreeBlockLists {
    partial: Bundle,
    full: Bundle,
}

impl FreeBlockLists {
    pub const fn new() -> Self {
        Self {
            partial: Bundle::new(),
            full: Bundle::new(),
        }
    }

    /// Take a cached block, promoting `full` once `partial` runs dry.
    #[inline]
    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        if self.partial.is_empty() && !self.full.is_empty() {
            std::mem::swap(&mut self.partial, &mut self.full);
        }
        self.partial.pop()
    }

    /// Cache a freed block.  When `partial` hits either cap it becomes
    /// `full`; the previous `full` bundle is returned for recycling.
    ///
    /// # Safety
    /// Same as [`Bundle::push`].
    #[inline]
    pub unsafe fn push(
        &mut self,
        block: NonNull<u8>,
        block_size: usize,
        max_count: u32,
        max_bytes: usize,
    ) -> Option<(NonNull<u8>, u32)> {
        // Safety: forwarded caller contract.
        unsafe { self.partial.push(block) };
        let count = self.partial.count();
        if count < max_count && (count as usize) * block_size < max_bytes {
            return None;
        }
        let evicted = self.full.take();
        std::mem::swap(&mut self.partial, &mut self.full);
        evicted
    }

    /// Seed `partial` with a chain obtained from the recycler.
    ///
    /// # Safety
    /// Same as [`Bundle::adopt`].
    pub unsafe fn adopt(&mut self, head: NonNull<u8>) {
        // Safety: forwarded caller contract.
        unsafe { self.partial.adopt(head) };
    }

    /// Refill `partial` with blocks fresh from a pool.
    ///
    /// # Safety
    /// Same as [`Bundle::push`].
    pub unsafe fn refill(&mut self, block: NonNull<u8>) {
        // Safety: forwarded caller contract.
        unsafe { self.partial.push(block) };
    }

    /// Detach both bundles.
    pub fn drain(&mut self) -> [Option<(NonNull<u8>, u32)>; 2] {
        [self.partial.take(), self.full.take()]
    }

    pub fn cached(&self) -> u32 {
        self.partial.count() + self.full.count()
    }
}

/// Tears down a cache for the allocator that owns it: flushes the blocks
/// and frees the cache's own memory.
pub(crate) type TeardownFn = unsafe fn(NonNull<ThreadCache>);

/// One thread's cached blocks for one allocator.
///
/// Lives in memory obtained from the owner's page provider, never from the
/// general heap, so installing it cannot recurse into a global allocator.
pub(crate) struct ThreadCache {
    pub lists: [FreeBlockLists; NUM_SIZE_CLASSES],
    /// The allocator that created this cache, type erased.
    pub owner: *const (),
    pub teardown: TeardownFn,
    /// Last trim epoch this cache acted on.
    pub trim_epoch: u64,
    /// Bytes mapped for this struct.
    pub mapped_size: usize,
}

impl ThreadCache {
    pub fn new(owner: *const (), teardown: TeardownFn, trim_epoch: u64, mapped_size: usize) -> Self {
        Self {
            lists: [const { FreeBlockLists::new() }; NUM_SIZE_CLASSES],
            owner,
            teardown,
            trim_epoch,
            mapped_size,
        }
    }

    #[inline]
    pub fn is_owned_by<T>(&self, owner: &T) -> bool {
        std::ptr::eq(self.owner, std::ptr::from_ref(owner).cast())
    }

    pub fn cached_blocks(&self) -> usize {
        self.lists.iter().map(|l| l.cached() as usize).sum()
    }
}

// ---------------------------------------------------------------------------
// Global recycler
// ---------------------------------------------------------------------------

/// Stack top paired with a generation counter for double-width CAS.
///
/// ```text
///   bits [127:64]  generation (even = stable, odd = reserved by a popper)
///   bits [63:0]    bundle head
/// ```
///
/// Every transition bumps the generation, so a head that is popped, reused
/// and pushed back at the same address still fails a stale CAS.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct TaggedPtr(u128);

impl TaggedPtr {
    const NULL: Self = Self(0);

    #[inline]
    fn new(ptr: *mut u8, generation: u64) -> Self {
        Self((u128::from(generation) << 64) | (ptr as usize as u128))
    }

    #[inline]
    fn ptr(self) -> *mut u8 {
        (self.0 as usize) as *mut u8
    }

    #[inline]
    fn generation(self) -> u64 {
        (self.0 >> 64) as u64
    }

    #[inline]
    fn is_reserved(self) -> bool {
        !self.generation().is_multiple_of(2)
    }
}

impl std::fmt::Debug for TaggedPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaggedPtr({:p}, gen={})", self.ptr(), self.generation())
    }
}

/// Puts the slot back to a stable state if a pop unwinds mid-reservation.
struct PopReservation<'a> {
    slot: &'a AtomicU128,
    old: TaggedPtr,
    committed: bool,
}

impl Drop for PopReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let restored = TaggedPtr::new(self.old.ptr(), self.old.generation().wrapping_add(2));
            self.slot.store(restored.0, Ordering::Release);
        }
    }
}

/// Lock-free per-class stacks of whole bundles, shared by every thread of
/// one allocator.
///
/// A bundle head stores the next bundle at offset 8 (offset 0 is its
/// intra-bundle link).  A popper reserves the top by making the generation
/// odd, which pins the head so its link can be read; pushers and other
/// poppers spin until it is even again.
pub(crate) struct GlobalRecycler {
    slots: [AtomicU128; NUM_SIZE_CLASSES],
    counts: [AtomicU32; NUM_SIZE_CLASSES],
    max_bundles: u32,
}

impl GlobalRecycler {
    pub fn new(max_bundles: u32) -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU128::new(TaggedPtr::NULL.0)),
            counts: std::array::from_fn(|_| AtomicU32::new(0)),
            max_bundles,
        }
    }

    /// Park a bundle.  Gives it back when the class is at capacity; the
    /// caller then returns it to its pools.
    ///
    /// # Safety
    /// `head` must start a bundle of `class` owned by the caller, which
    /// gives up ownership on `None`.
    pub unsafe fn push(&self, class: usize, head: NonNull<u8>) -> Option<NonNull<u8>> {
        let prev = self.counts[class].fetch_add(1, Ordering::Relaxed);
        if prev >= self.max_bundles {
            self.counts[class].fetch_sub(1, Ordering::Relaxed);
            return Some(head);
        }

        let slot = &self.slots[class];
        // Safety: caller owns `head` until the CAS publishes it.
        let link = unsafe { recycler_link(head) };
        loop {
            let old = TaggedPtr(slot.load(Ordering::Acquire));
            if old.is_reserved() {
                hint::spin_loop();
                continue;
            }
            link.store(old.ptr() as usize, Ordering::Relaxed);
            let new = TaggedPtr::new(head.as_ptr(), old.generation().wrapping_add(2));
            if slot
                .compare_exchange_weak(old.0, new.0, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return None;
            }
        }
    }

    /// Take the most recently parked bundle of `class`.
    pub fn pop(&self, class: usize) -> Option<NonNull<u8>> {
        let slot = &self.slots[class];
        loop {
            let old = TaggedPtr(slot.load(Ordering::Acquire));
            if old.ptr().is_null() {
                return None;
            }
            if old.is_reserved() {
                hint::spin_loop();
                continue;
            }

            let reserved = TaggedPtr::new(old.ptr(), old.generation().wrapping_add(1));
            if slot
                .compare_exchange_weak(old.0, reserved.0, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let mut guard = PopReservation {
                slot,
                old,
                committed: false,
            };

            let head = NonNull::new(old.ptr())?;
            // Safety: the reservation pins `head`; nobody else can pop it.
            let next = unsafe { recycler_link(head) }.load(Ordering::Relaxed) as *mut u8;
            let stable = TaggedPtr::new(next, old.generation().wrapping_add(2));
            let res = slot.compare_exchange(reserved.0, stable.0, Ordering::Release, Ordering::Relaxed);
            debug_assert!(res.is_ok(), "recycler reservation lost: {:?}", TaggedPtr(slot.load(Ordering::Relaxed)));
            guard.committed = true;

            self.counts[class].fetch_sub(1, Ordering::Relaxed);
            return Some(head);
        }
    }

    /// Bundles currently parked for `class`.
    pub fn len(&self, class: usize) -> usize {
        self.counts[class].load(Ordering::Relaxed) as usize
    }
}

// Safety: only atomics; bundle memory is handed over through the CAS.
unsafe impl Send for GlobalRecycler {}
// Safety: see above.
unsafe impl Sync for GlobalRecycler {}

// ---------------------------------------------------------------------------
// Thread-local slot
// ---------------------------------------------------------------------------

thread_local! {
    static THREAD_CACHE: Cell<Option<NonNull<ThreadCache>>> = const { Cell::new(None) };
    static TEARDOWN_GUARD: TeardownGuard = const { TeardownGuard };
}

/// Flushes the thread's cache when the thread exits.
struct TeardownGuard;

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if let Ok(Some(cache)) = THREAD_CACHE.try_with(Cell::take) {
            // Safety: the slot held the only reference to the cache.
            unsafe {
                let teardown = cache.as_ref().teardown;
                teardown(cache);
            }
        }
    }
}

/// The calling thread's cache, if one is installed.
#[inline]
pub(crate) fn current() -> Option<NonNull<ThreadCache>> {
    THREAD_CACHE.try_with(Cell::get).ok().flatten()
}

/// Install `cache` for the calling thread.  Returns `false` if the thread
/// already has one or is shutting down.
pub(crate) fn install(cache: NonNull<ThreadCache>) -> bool {
    // Registers the exit hook on first use.
    if TEARDOWN_GUARD.try_with(|_| ()).is_err() {
        return false;
    }
    THREAD_CACHE
        .try_with(|slot| {
            if slot.get().is_some() {
                return false;
            }
            slot.set(Some(cache));
            true
        })
        .unwrap_or(false)
}

/// Remove and return the calling thread's cache.
pub(crate) fn uninstall() -> Option<NonNull<ThreadCache>> {
    THREAD_CACHE.try_with(Cell::take).ok().flatten()
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[repr(C, align(64))]
    struct Arena([u8; 4096]);

    fn blocks(arena: &mut Arena, size: usize, n: usize) -> Vec<NonNull<u8>> {
        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
        // Safety: Test code.
        (0..n).map(|i| unsafe { base.add(i * size) }).collect()
    }

    #[test]
    fn test_bundle_lifo() {
        let mut arena = Arena([0; 4096]);
        let b = blocks(&mut arena, 16, 3);
        let mut bundle = Bundle::new();
        // Safety: Test code.
        unsafe {
            for &p in &b {
                bundle.push(p);
            }
        }
        assert_eq!(bundle.count(), 3);
        assert_eq!(bundle.pop(), Some(b[2]));
        assert_eq!(bundle.pop(), Some(b[1]));
        assert_eq!(bundle.pop(), Some(b[0]));
        assert_eq!(bundle.pop(), None);
        assert_eq!(bundle.count(), 0);
    }

    #[test]
    fn test_partial_promotes_at_count_cap() {
        let mut arena = Arena([0; 4096]);
        let b = blocks(&mut arena, 16, 8);
        let mut lists = FreeBlockLists::new();
        // Safety: Test code.
        unsafe {
            for &p in &b[..3] {
                assert!(lists.push(p, 16, 4, 8192).is_none());
            }
            // Fourth push fills partial; it moves to full with nothing evicted.
            assert!(lists.push(b[3], 16, 4, 8192).is_none());
            assert_eq!(lists.full.count(), 4);
            assert!(lists.partial.is_empty());

            for &p in &b[4..7] {
                assert!(lists.push(p, 16, 4, 8192).is_none());
            }
            // Second promotion evicts the first full bundle whole.
            let (head, count) = lists.push(b[7], 16, 4, 8192).unwrap();
            assert_eq!(count, 4);
            assert_eq!(head, b[3]);
        }
        assert_eq!(lists.cached(), 4);
    }

    #[test]
    fn test_partial_promotes_at_byte_cap() {
        let mut arena = Arena([0; 4096]);
        let b = blocks(&mut arena, 512, 4);
        let mut lists = FreeBlockLists::new();
        // Safety: Test code.
        unsafe {
            assert!(lists.push(b[0], 512, 64, 1024).is_none());
            assert!(lists.push(b[1], 512, 64, 1024).is_none());
        }
        assert_eq!(lists.full.count(), 2);
        assert!(lists.partial.is_empty());
    }

    #[test]
    fn test_pop_swaps_in_full() {
        let mut arena = Arena([0; 4096]);
        let b = blocks(&mut arena, 16, 2);
        let mut lists = FreeBlockLists::new();
        // Safety: Test code.
        unsafe {
            lists.push(b[0], 16, 2, 8192);
            lists.push(b[1], 16, 2, 8192);
        }
        assert!(lists.partial.is_empty());
        assert_eq!(lists.pop(), Some(b[1]));
        assert_eq!(lists.pop(), Some(b[0]));
        assert_eq!(lists.pop(), None);
    }

    #[test]
    fn test_adopt_counts_chain() {
        let mut arena = Arena([0; 4096]);
        let b = blocks(&mut arena, 32, 5);
        let mut donor = Bundle::new();
        let mut lists = FreeBlockLists::new();
        // Safety: Test code.
        unsafe {
            for &p in &b[..3] {
                donor.push(p);
            }
            lists.refill(b[3]);
            let (head, _) = donor.take().unwrap();
            lists.adopt(head);
        }
        assert_eq!(lists.cached(), 4);
        let drained: Vec<_> = std::iter::from_fn(|| lists.pop()).collect();
        assert_eq!(drained, vec![b[2], b[1], b[0], b[3]]);
    }

    #[test]
    fn test_recycler_push_pop() {
        let mut arena = Arena([0; 4096]);
        let b = blocks(&mut arena, 64, 3);
        let recycler = GlobalRecycler::new(2);
        // Safety: Test code.
        unsafe {
            for &p in &b {
                set_bundle_next(p, None);
            }
            assert!(recycler.push(5, b[0]).is_none());
            assert!(recycler.push(5, b[1]).is_none());
            // At capacity: handed back.
            assert_eq!(recycler.push(5, b[2]), Some(b[2]));
        }
        assert_eq!(recycler.len(5), 2);
        assert_eq!(recycler.pop(4), None);
        assert_eq!(recycler.pop(5), Some(b[1]));
        assert_eq!(recycler.pop(5), Some(b[0]));
        assert_eq!(recycler.pop(5), None);
        assert_eq!(recycler.len(5), 0);
        // Intra-bundle links are untouched by the recycler.
        // Safety: Test code.
        assert_eq!(unsafe { bundle_next(b[0]) }, None);
    }

    #[test]
    fn test_recycler_concurrent() {
        use crate::sync::{Arc, thread};

        const THREADS: usize = 4;
        const ROUNDS: usize = 1000;
        let mut arena = Box::new(Arena([0; 4096]));
        let heads: Vec<usize> = blocks(&mut arena, 64, THREADS)
            .into_iter()
            .map(|p| p.as_ptr() as usize)
            .collect();
        // Capacity well above the bundle count; counters lag the stack briefly.
        let recycler = Arc::new(GlobalRecycler::new(1024));

        let handles: Vec<_> = heads
            .into_iter()
            .map(|addr| {
                let recycler = Arc::clone(&recycler);
                thread::spawn(move || {
                    let mut mine = NonNull::new(addr as *mut u8);
                    for _ in 0..ROUNDS {
                        if let Some(p) = mine.take() {
                            // Safety: Test code.
                            unsafe {
                                set_bundle_next(p, None);
                                assert!(recycler.push(0, p).is_none());
                            }
                        }
                        mine = recycler.pop(0);
                    }
                    if let Some(p) = mine {
                        // Safety: Test code.
                        unsafe { assert!(recycler.push(0, p).is_none()) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let mut seen = 0;
        while recycler.pop(0).is_some() {
            seen += 1;
        }
        assert_eq!(seen, THREADS);
        drop(arena);
    }

    #[test]
    fn test_tls_slot_install_and_uninstall() {
        // Never runs: the cache is uninstalled before the thread exits.
        unsafe fn no_teardown(_: NonNull<ThreadCache>) {}
        let mut cache = Box::new(ThreadCache::new(std::ptr::null(), no_teardown, 0, 0));
        let addr = std::ptr::from_mut(&mut *cache) as usize;
        std::thread::spawn(move || {
            let ptr = NonNull::new(addr as *mut ThreadCache).unwrap();
            assert!(current().is_none());
            assert!(install(ptr));
            assert!(!install(ptr));
            assert_eq!(current(), Some(ptr));
            assert_eq!(uninstall(), Some(ptr));
            assert!(current().is_none());
        })
        .join()
        .unwrap();
    }
}
