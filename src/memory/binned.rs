use std::ptr::NonNull;

use super::config::MallocConfig;
use super::error::{HeapCorruption, MallocError, VmError};
use super::free_block::{ReleaseList, bundle_next};
use super::locks::LockSet;
use super::lookup::PoolTable;
use super::os_cache::CachedOsPageAllocator;
use super::pool::{ChunkKind, ClassState, PoolInfo, Taken};
use super::size_class::{
    CHUNK_SIZE, DESCRIPTORS, MAX_POOLED_SIZE, MIN_ALIGN, NUM_SIZE_CLASSES, Route, SIZE_CLASSES,
    os_usable_size, resolve,
};
use super::stats::{HeapReport, MallocStats, MemoryStats};
use super::thread_cache::{self, GlobalRecycler, ThreadCache};
use super::vm::{OsPageProvider, PageProvider};
use crate::sync::atomic::{AtomicU64, Ordering};

/// Why an internal path gave up.  Corruption is escalated by the public
/// entry point once every lock and cache borrow has been released.
#[derive(Debug)]
enum Fault {
    Os(VmError),
    Corrupt(HeapCorruption),
}

impl From<VmError> for Fault {
    fn from(e: VmError) -> Self {
        Self::Os(e)
    }
}

impl From<HeapCorruption> for Fault {
    fn from(e: HeapCorruption) -> Self {
        Self::Corrupt(e)
    }
}

/// Size-classed heap allocator.
///
/// Requests up to [`MAX_POOLED_SIZE`] are served from per-class pools of
/// fixed-size blocks; larger or over-aligned ones are mapped straight from
/// the page provider.  Either kind of pointer is mapped back to its metadata
/// through one shared lookup table, so [`free`](Self::free) needs nothing
/// but the pointer.
///
/// Threads that call
/// [`setup_tls_caches_on_current_thread`](Self::setup_tls_caches_on_current_thread)
/// get a private block cache per size class and only take a lock once per
/// bundle of blocks.
pub struct BinnedMalloc<P: PageProvider = OsPageProvider> {
    config: MallocConfig,
    page_size: usize,
    locks: LockSet,
    table: PoolTable,
    /// `NUM_SIZE_CLASSES` list heads in provider memory.  Pools point back
    /// at these, so they must not move with `self`.
    class_states: NonNull<ClassState>,
    class_states_size: usize,
    recycler: GlobalRecycler,
    trim_epoch: AtomicU64,
    stats: MallocStats,
    os: CachedOsPageAllocator<P>,
}

// Safety: `class_states` is only touched under the matching class lock; all
// other shared state is atomics, mutexes or the lock-free lookup table.
unsafe impl<P: PageProvider> Send for BinnedMalloc<P> {}
// Safety: see above.
unsafe impl<P: PageProvider> Sync for BinnedMalloc<P> {}

impl BinnedMalloc<OsPageProvider> {
    /// Allocator over the platform page provider with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`MallocError::Os`] if the metadata pages cannot be mapped.
    pub fn new() -> Result<Self, MallocError> {
        Self::with_config(OsPageProvider::new(), MallocConfig::default())
    }
}

impl<P: PageProvider> BinnedMalloc<P> {
    /// Build an allocator over `provider`.
    ///
    /// Touches only the page provider, never the global heap, so it may run
    /// from inside a global allocator.
    ///
    /// # Errors
    ///
    /// Returns [`MallocError::InvalidConfig`] for a bad `config` or page
    /// size, and [`MallocError::Os`] if metadata pages cannot be mapped.
    pub fn with_config(provider: P, config: MallocConfig) -> Result<Self, MallocError> {
        config.validate()?;
        let page_size = provider.page_size();
        if !page_size.is_power_of_two() {
            return Err(MallocError::InvalidConfig(format!(
                "page size {page_size} is not a power of two"
            )));
        }

        let class_states_size =
            (size_of::<ClassState>() * NUM_SIZE_CLASSES).next_multiple_of(page_size);
        let class_states = provider
            .alloc_from_os(class_states_size, page_size)?
            .cast::<ClassState>();
        for i in 0..NUM_SIZE_CLASSES {
            // Safety: fresh mapping sized for NUM_SIZE_CLASSES entries.
            unsafe { class_states.add(i).write(ClassState::new()) };
        }

        let stats = MallocStats::new();
        stats.metadata_bytes.add(class_states_size);

        Ok(Self {
            page_size,
            locks: LockSet::new(config.lock_granularity),
            table: PoolTable::new(page_size),
            class_states,
            class_states_size,
            recycler: GlobalRecycler::new(config.recycler_max_bundles),
            trim_epoch: AtomicU64::new(0),
            stats,
            os: CachedOsPageAllocator::new(
                provider,
                config.os_cache_max_entries,
                config.os_cache_max_bytes,
                CHUNK_SIZE,
                config.oom_retries,
            ),
            config,
        })
    }

    pub fn config(&self) -> &MallocConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        self.os.provider()
    }

    /// # Safety
    /// Caller holds the lock for `class` and holds no other reference to
    /// its state.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    unsafe fn class_state(&self, class: usize) -> &mut ClassState {
        debug_assert!(class < NUM_SIZE_CLASSES);
        // Safety: caller contract; the region holds NUM_SIZE_CLASSES entries.
        unsafe { &mut *self.class_states.as_ptr().add(class) }
    }

    #[inline]
    fn check_align(align: usize) -> Result<usize, MallocError> {
        match align {
            0 => Ok(MIN_ALIGN),
            a if a.is_power_of_two() => Ok(a.max(MIN_ALIGN)),
            a => Err(MallocError::InvalidAlignment { align: a }),
        }
    }

    /// The calling thread's cache, if it belongs to this allocator.
    #[inline]
    fn owned_cache(&self) -> Option<NonNull<ThreadCache>> {
        let cache = thread_cache::current()?;
        // Safety: the slot only holds live caches installed by this thread.
        unsafe { cache.as_ref() }.is_owned_by(self).then_some(cache)
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Allocate `size` bytes aligned to `align` (0 means the default
    /// 16-byte alignment).  Zero-byte requests get a distinct, freeable
    /// block of the smallest class.
    ///
    /// # Errors
    ///
    /// [`MallocError::InvalidAlignment`] if `align` is not a power of two,
    /// [`MallocError::OutOfMemory`] if the page provider is exhausted.
    ///
    /// A corrupted heap is reported to the fatal hook, which aborts by
    /// default.
    pub fn try_malloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, MallocError> {
        let align = Self::check_align(align)?;
        let result = match self.owned_cache() {
            // Safety: only this thread reaches its cache, and nothing below
            // re-enters the thread-local slot.
            Some(mut cache) => self.alloc_fault(Some(unsafe { cache.as_mut() }), size, align),
            None => self.alloc_fault(None, size, align),
        };
        result.map_err(|fault| self.escalate(fault, size, align))
    }

    /// Allocate like [`try_malloc`](Self::try_malloc), but never return
    /// null: running out of memory calls the configured out-of-memory hook.
    ///
    /// # Panics
    ///
    /// Panics on an invalid alignment.
    pub fn malloc(&self, size: usize, align: usize) -> *mut u8 {
        match self.try_malloc(size, align) {
            Ok(ptr) => ptr.as_ptr(),
            Err(err) => self.out_of_memory(err, size, align),
        }
    }

    /// Allocate through an explicit cache instead of the thread-local one.
    pub(crate) fn malloc_with_cache(
        &self,
        cache: &mut ThreadCache,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, MallocError> {
        debug_assert!(cache.is_owned_by(self));
        let align = Self::check_align(align)?;
        self.alloc_fault(Some(cache), size, align)
            .map_err(|fault| self.escalate(fault, size, align))
    }

    fn alloc_fault(
        &self,
        cache: Option<&mut ThreadCache>,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, Fault> {
        match resolve(size, align) {
            Route::OsDirect => self.alloc_os_direct(size, align),
            Route::Pooled(class) => match cache {
                Some(cache) => self.alloc_cached(cache, class),
                None => self.alloc_small(class),
            },
        }
    }

    fn alloc_small(&self, class: usize) -> Result<NonNull<u8>, Fault> {
        let _guard = self.locks.lock_class(class);
        // Safety: class lock held.
        unsafe { self.take_block_locked(class, self.class_state(class)) }
    }

    fn alloc_cached(&self, cache: &mut ThreadCache, class: usize) -> Result<NonNull<u8>, Fault> {
        self.sync_trim_epoch(cache)?;
        let lists = &mut cache.lists[class];
        if let Some(block) = lists.pop() {
            return Ok(block);
        }
        if let Some(bundle) = self.recycler.pop(class) {
            // Safety: the recycler handed the bundle over whole.
            unsafe { lists.adopt(bundle) };
            if let Some(block) = lists.pop() {
                return Ok(block);
            }
        }

        // Slow path: one lock for a whole refill.
        let refill = self.config.refill_count_for(SIZE_CLASSES[class]);
        let desc = &DESCRIPTORS[class];
        let _guard = self.locks.lock_class(class);
        // Safety: class lock held.
        let state = unsafe { self.class_state(class) };
        // Safety: as above.
        let first = unsafe { self.take_block_locked(class, state)? };
        // Extra blocks only come from pools that already exist.
        for _ in 1..refill {
            if !state.has_active() {
                break;
            }
            // Safety: as above.
            let Some(taken) = (unsafe { state.alloc_block(desc)? }) else {
                break;
            };
            self.note_taken(class, &taken);
            // Safety: the block was just taken for this thread.
            unsafe { lists.refill(taken.block) };
        }
        Ok(first)
    }

    /// Take one block, creating a pool if the class has no Active one.
    ///
    /// # Safety
    /// Caller holds the lock for `class`; `state` is its state.
    unsafe fn take_block_locked(
        &self,
        class: usize,
        state: &mut ClassState,
    ) -> Result<NonNull<u8>, Fault> {
        if !state.has_active() {
            // Safety: forwarded caller contract.
            unsafe { self.create_pool_locked(class, state)? };
        }
        let desc = &DESCRIPTORS[class];
        // Safety: forwarded caller contract.
        let Some(taken) = (unsafe { state.alloc_block(desc)? }) else {
            return Err(HeapCorruption::BrokenLink { base: 0, class }.into());
        };
        self.note_taken(class, &taken);
        Ok(taken.block)
    }

    #[inline]
    fn note_taken(&self, class: usize, taken: &Taken) {
        let counters = &self.stats.classes[class];
        counters.live_blocks.add(1);
        if taken.exhausted {
            counters.exhausted.add(1);
        }
    }

    /// Map a pool for `class` and put it on the Active list.
    ///
    /// # Safety
    /// Caller holds the lock for `class`; `state` is its state.
    unsafe fn create_pool_locked(&self, class: usize, state: &mut ClassState) -> Result<(), Fault> {
        let desc = &DESCRIPTORS[class];
        let base = self.os.allocate(desc.pool_size, CHUNK_SIZE)?;
        let claimed = {
            let _table = self.locks.lock_table_nested();
            // Safety: bucket creation is serialised by the table lock (or
            // the coarse lock the caller holds); the region is fresh.
            unsafe {
                self.table
                    .claim_region(base.as_ptr() as usize, desc.chunks(), self.os.provider())
            }
        };
        let head = match claimed {
            Ok(head) => head,
            Err(e) => {
                // Safety: the region was never published.
                let _ = unsafe { self.os.free(base, desc.pool_size, CHUNK_SIZE) };
                return Err(e.into());
            }
        };
        // Safety: the head slot belongs to the fresh region; the pool is
        // unused memory of `desc.pool_size` bytes.
        unsafe {
            let info = &mut *head.as_ptr();
            info.init_pool(class, base, desc);
            state.adopt(info);
        }
        self.stats.pool_bytes.add(desc.pool_size);
        self.stats.classes[class].pools.add(1);
        Ok(())
    }

    fn alloc_os_direct(&self, size: usize, align: usize) -> Result<NonNull<u8>, Fault> {
        let os_size = os_usable_size(size, self.page_size).ok_or(VmError::InvalidRequest {
            size,
            align,
        })?;
        let base = self.os.allocate(os_size, align.max(CHUNK_SIZE))?;
        let claimed = {
            let _table = self.locks.lock_table();
            // Safety: table lock held; the region is fresh.
            unsafe {
                self.table
                    .claim_region(base.as_ptr() as usize, os_size.div_ceil(CHUNK_SIZE), self.os.provider())
            }
        };
        let head = match claimed {
            Ok(head) => head,
            Err(e) => {
                // Safety: the region was never published.
                let _ = unsafe { self.os.free(base, os_size, CHUNK_SIZE) };
                return Err(e.into());
            }
        };
        // Safety: the head slot belongs to the fresh region.
        unsafe { (*head.as_ptr()).init_os_direct(base, os_size) };
        self.stats.os_direct_bytes.add(os_size);
        self.stats.os_direct_allocs.add(1);
        Ok(base)
    }

    // -----------------------------------------------------------------------
    // Free
    // -----------------------------------------------------------------------

    /// Release an allocation.  Null is a no-op.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation returned by this allocator.
    ///
    /// A pointer unknown to the allocator, or a corrupted heap, goes to the
    /// fatal hook with a heap report.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let Some(block) = NonNull::new(ptr) else {
            return;
        };
        let result = match self.owned_cache() {
            // Safety: see `try_malloc`; `block` is live per the contract.
            Some(mut cache) => unsafe { self.free_fault(Some(cache.as_mut()), block) },
            // Safety: forwarded caller contract.
            None => unsafe { self.free_fault(None, block) },
        };
        if let Err(fault) = result {
            self.fatal(fault);
        }
    }

    /// Free through an explicit cache instead of the thread-local one.
    ///
    /// # Safety
    /// Same as [`free`](Self::free), and `ptr` must not be null.
    pub(crate) unsafe fn free_with_cache(&self, cache: &mut ThreadCache, ptr: NonNull<u8>) {
        debug_assert!(cache.is_owned_by(self));
        // Safety: forwarded caller contract.
        if let Err(fault) = unsafe { self.free_fault(Some(cache), ptr) } {
            self.fatal(fault);
        }
    }

    /// # Safety
    /// `block` must be a live allocation of this allocator.
    unsafe fn free_fault(
        &self,
        cache: Option<&mut ThreadCache>,
        block: NonNull<u8>,
    ) -> Result<(), Fault> {
        let addr = block.as_ptr() as usize;
        let head = self
            .table
            .resolve(addr)
            .ok_or(HeapCorruption::UnknownPointer { addr })?;
        // Safety: the caller owns a live allocation in this region, so no
        // other thread changes its head slot.
        let (kind, class) = unsafe { ((*head.as_ptr()).kind, (*head.as_ptr()).class as usize) };
        match kind {
            // Safety: forwarded caller contract.
            ChunkKind::OsDirect => unsafe { self.free_os_direct(head, block) },
            ChunkKind::Pool => match cache {
                Some(cache) => {
                    // Safety: forwarded caller contract.
                    unsafe { self.free_cached(cache, head, class, block) }
                }
                None => {
                    let mut retired = ReleaseList::new();
                    let result = {
                        let _guard = self.locks.lock_class(class);
                        // Safety: class lock held; block is live.
                        unsafe {
                            self.return_block_locked(class, self.class_state(class), head, block, &mut retired)
                        }
                    };
                    self.release_retired(retired);
                    Ok(result?)
                }
            },
            ChunkKind::Empty | ChunkKind::Continuation => {
                Err(HeapCorruption::UnknownPointer { addr }.into())
            }
        }
    }

    /// # Safety
    /// `block` is a live block of the pool headed by `head`, of `class`.
    unsafe fn free_cached(
        &self,
        cache: &mut ThreadCache,
        head: NonNull<PoolInfo>,
        class: usize,
        block: NonNull<u8>,
    ) -> Result<(), Fault> {
        let block_size = SIZE_CLASSES[class];
        let addr = block.as_ptr() as usize;
        // Safety: see `free_fault`.
        let base = unsafe { (*head.as_ptr()).base } as usize;
        if !(addr - base).is_multiple_of(block_size) {
            return Err(HeapCorruption::MisalignedBlock { addr, block_size }.into());
        }
        self.sync_trim_epoch(cache)?;
        // Safety: the block is ours until it reaches the pool again.
        let evicted = unsafe {
            cache.lists[class].push(
                block,
                block_size,
                self.config.bundle_max_count,
                self.config.bundle_max_bytes,
            )
        };
        if let Some((bundle, _)) = evicted {
            // Safety: the evicted bundle is owned by this thread.
            if let Some(bundle) = unsafe { self.recycler.push(class, bundle) } {
                // Safety: the recycler declined it; still ours.
                unsafe { self.free_chain(class, bundle)? };
            }
        }
        Ok(())
    }

    /// Give `block` back to its pool, retiring the pool if it empties.
    ///
    /// # Safety
    /// Caller holds the lock for `class`; `state` is its state; `head` is
    /// the head slot that resolved from `block`.
    unsafe fn return_block_locked(
        &self,
        class: usize,
        state: &mut ClassState,
        head: NonNull<PoolInfo>,
        block: NonNull<u8>,
        retired: &mut ReleaseList,
    ) -> Result<(), HeapCorruption> {
        // Safety: pool heads of `class` are guarded by the class lock.
        let info = unsafe { &mut *head.as_ptr() };
        if info.kind != ChunkKind::Pool || info.class as usize != class {
            return Err(HeapCorruption::UnknownPointer {
                addr: block.as_ptr() as usize,
            });
        }
        let desc = &DESCRIPTORS[class];
        // Safety: forwarded caller contract.
        let returned = unsafe { state.free_block(info, block, desc)? };
        let counters = &self.stats.classes[class];
        counters.live_blocks.sub(1);
        if returned.reactivated {
            counters.exhausted.sub(1);
        }
        if returned.emptied {
            let base = info.base;
            let size = info.os_size;
            // Safety: the pool has no live blocks and is off both lists, so
            // nothing resolves into it any more.
            unsafe {
                self.table.clear_region(base as usize, desc.chunks());
                if let Some(base) = NonNull::new(base) {
                    retired.push(base, size);
                }
            }
            counters.pools.sub(1);
            self.stats.pool_bytes.sub(size);
        }
        Ok(())
    }

    /// Return a chain of cached blocks of `class` to their pools under one
    /// lock acquisition.
    ///
    /// # Safety
    /// `head` must start a bundle of `class` owned by the caller.
    unsafe fn free_chain(&self, class: usize, head: NonNull<u8>) -> Result<(), HeapCorruption> {
        let mut retired = ReleaseList::new();
        let result = {
            let _guard = self.locks.lock_class(class);
            // Safety: class lock held.
            let state = unsafe { self.class_state(class) };
            let mut cur = Some(head);
            let mut result = Ok(());
            while let Some(block) = cur {
                // Read the link before the pool overwrites the block.
                // Safety: caller owns the chain.
                cur = unsafe { bundle_next(block) };
                let addr = block.as_ptr() as usize;
                let Some(slot) = self.table.resolve(addr) else {
                    result = Err(HeapCorruption::UnknownPointer { addr });
                    break;
                };
                // Safety: class lock held; the block is ours.
                if let Err(e) =
                    unsafe { self.return_block_locked(class, state, slot, block, &mut retired) }
                {
                    result = Err(e);
                    break;
                }
            }
            result
        };
        self.release_retired(retired);
        result
    }

    /// # Safety
    /// `block` must be the live OS-direct allocation headed by `head`.
    unsafe fn free_os_direct(&self, head: NonNull<PoolInfo>, block: NonNull<u8>) -> Result<(), Fault> {
        // Safety: the caller owns the region.
        let (_, _, os_size) = unsafe { Self::fixed_fields(head) };
        // Safety: as above.
        let base = unsafe { (&raw const (*head.as_ptr()).base).read() };
        let addr = block.as_ptr() as usize;
        if base as usize != addr {
            return Err(HeapCorruption::MisalignedBlock {
                addr,
                block_size: os_size,
            }
            .into());
        }
        // Safety: the caller owns the region; nothing else resolves into it.
        unsafe { self.table.clear_region(addr, os_size.div_ceil(CHUNK_SIZE)) };
        self.stats.os_direct_bytes.sub(os_size);
        self.stats.os_direct_allocs.sub(1);
        // Safety: mapped by `alloc_os_direct` with at least CHUNK_SIZE alignment.
        if let Err(e) = unsafe { self.os.free(block, os_size, CHUNK_SIZE) } {
            log::warn!("failed to release {os_size} byte OS-direct block: {e}");
        }
        Ok(())
    }

    /// Unmap pools retired under a lock.  Called with no lock held.
    fn release_retired(&self, mut retired: ReleaseList) {
        while let Some((base, size)) = retired.pop() {
            // Safety: retired pools are unreachable from every structure.
            if let Err(e) = unsafe { self.os.free(base, size, CHUNK_SIZE) } {
                log::warn!("failed to release {size} byte pool: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Realloc and size queries
    // -----------------------------------------------------------------------

    /// Resize an allocation.  A null `ptr` allocates; a zero `new_size`
    /// frees `ptr` and returns null.  Stays in place when the new size maps
    /// to the same size class, or for OS-direct blocks when it still fits
    /// and does not shrink below two thirds of the mapping.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation of this allocator.  On
    /// success with a different address, `ptr` is freed.
    ///
    /// # Errors
    ///
    /// Same as [`try_malloc`](Self::try_malloc); `ptr` stays valid on error.
    pub unsafe fn try_realloc(
        &self,
        ptr: *mut u8,
        new_size: usize,
        align: usize,
    ) -> Result<*mut u8, MallocError> {
        let Some(old) = NonNull::new(ptr) else {
            return self.try_malloc(new_size, align).map(NonNull::as_ptr);
        };
        if new_size == 0 {
            // Safety: forwarded caller contract.
            unsafe { self.free(ptr) };
            return Ok(std::ptr::null_mut());
        }
        let align = Self::check_align(align)?;
        let addr = old.as_ptr() as usize;
        let Some(head) = self.table.resolve(addr) else {
            self.fatal(HeapCorruption::UnknownPointer { addr }.into());
        };
        // Safety: the caller keeps the allocation alive, so these fields of
        // its head are fixed.  Other fields may be written under the class
        // lock, so no reference to the head is formed.
        let (kind, class, os_size) = unsafe { Self::fixed_fields(head) };
        let usable = match kind {
            ChunkKind::Pool => {
                let class = class as usize;
                if resolve(new_size, align) == Route::Pooled(class) {
                    return Ok(ptr);
                }
                SIZE_CLASSES[class]
            }
            ChunkKind::OsDirect => {
                if new_size > MAX_POOLED_SIZE
                    && new_size <= os_size
                    && new_size.saturating_mul(3) >= os_size.saturating_mul(2)
                    && addr.is_multiple_of(align)
                {
                    return Ok(ptr);
                }
                os_size
            }
            ChunkKind::Empty | ChunkKind::Continuation => {
                self.fatal(HeapCorruption::UnknownPointer { addr }.into());
            }
        };

        let new = self.try_malloc(new_size, align)?;
        // Safety: both regions are live and distinct; `usable` bytes of the
        // old one are ours.
        unsafe {
            std::ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), usable.min(new_size));
            self.free(ptr);
        }
        Ok(new.as_ptr())
    }

    /// Resize like [`try_realloc`](Self::try_realloc), calling the
    /// out-of-memory hook instead of failing.
    ///
    /// # Safety
    /// Same as [`try_realloc`](Self::try_realloc).
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize, align: usize) -> *mut u8 {
        // Safety: forwarded caller contract.
        match unsafe { self.try_realloc(ptr, new_size, align) } {
            Ok(p) => p,
            Err(err) => self.out_of_memory(err, new_size, align),
        }
    }

    /// Usable bytes behind `ptr`: the block size for pooled allocations,
    /// the page-rounded mapping for OS-direct ones.  `None` for null or a
    /// pointer this allocator did not hand out.
    ///
    /// # Safety
    /// `ptr` must be null or point into a live allocation of this allocator,
    /// so that its metadata cannot change concurrently.
    pub unsafe fn get_allocation_size(&self, ptr: *const u8) -> Option<usize> {
        if ptr.is_null() {
            return None;
        }
        let addr = ptr as usize;
        let head = self.table.resolve(addr)?;
        // Safety: caller contract.
        let (kind, class, os_size) = unsafe { Self::fixed_fields(head) };
        // Safety: as above.
        let base = unsafe { (&raw const (*head.as_ptr()).base).read() };
        let offset = addr.checked_sub(base as usize)?;
        match kind {
            ChunkKind::Pool => {
                let desc = &DESCRIPTORS[class as usize];
                (offset.is_multiple_of(desc.block_size)
                    && offset / desc.block_size < desc.blocks_per_pool as usize)
                    .then_some(desc.block_size)
            }
            ChunkKind::OsDirect => (offset == 0).then_some(os_size),
            ChunkKind::Empty | ChunkKind::Continuation => None,
        }
    }

    /// Kind, class and mapped size of a head slot, read field by field.
    ///
    /// # Safety
    /// `head` is the head of a region holding a live allocation the caller
    /// keeps alive.
    #[inline]
    unsafe fn fixed_fields(head: NonNull<PoolInfo>) -> (ChunkKind, u8, usize) {
        let p = head.as_ptr();
        // Safety: caller contract; the slot memory stays mapped.
        unsafe {
            (
                (&raw const (*p).kind).read(),
                (&raw const (*p).class).read(),
                (&raw const (*p).os_size).read(),
            )
        }
    }

    /// What [`get_allocation_size`](Self::get_allocation_size) would report
    /// for a `(size, align)` request, without allocating.  An `align` that
    /// is not a power of two is treated as the default 16 bytes, where
    /// [`try_malloc`](Self::try_malloc) would reject it.
    pub fn quantize_size(&self, size: usize, align: usize) -> usize {
        let align = Self::check_align(align).unwrap_or(MIN_ALIGN);
        match resolve(size, align) {
            Route::Pooled(class) => SIZE_CLASSES[class],
            Route::OsDirect => os_usable_size(size, self.page_size).unwrap_or(size),
        }
    }

    // -----------------------------------------------------------------------
    // Thread caches
    // -----------------------------------------------------------------------

    /// Flush `cache` if a trim happened since it last looked.
    #[inline]
    fn sync_trim_epoch(&self, cache: &mut ThreadCache) -> Result<(), HeapCorruption> {
        if cache.trim_epoch == self.trim_epoch.load(Ordering::Acquire) {
            return Ok(());
        }
        self.flush_cache(cache)
    }

    /// Return every block held by `cache` to its pool.
    pub(crate) fn flush_cache(&self, cache: &mut ThreadCache) -> Result<(), HeapCorruption> {
        cache.trim_epoch = self.trim_epoch.load(Ordering::Acquire);
        for class in 0..NUM_SIZE_CLASSES {
            for (head, _) in cache.lists[class].drain().into_iter().flatten() {
                // Safety: drained bundles belong to this cache alone.
                unsafe { self.free_chain(class, head)? };
            }
        }
        Ok(())
    }

    /// A cache not tied to any thread, for callers that manage caches
    /// themselves.  Must be flushed before it is dropped.
    pub(crate) fn detached_cache(&self) -> ThreadCache {
        ThreadCache::new(
            std::ptr::from_ref(self).cast(),
            Self::teardown_cache,
            self.trim_epoch.load(Ordering::Acquire),
            0,
        )
    }

    /// Give the calling thread a private block cache.  The cache is flushed
    /// when the thread exits or calls
    /// [`clear_and_disable_tls_caches_on_current_thread`](Self::clear_and_disable_tls_caches_on_current_thread).
    /// Does nothing if the thread already has one.
    ///
    /// # Errors
    ///
    /// Returns [`MallocError::Os`] if the cache's pages cannot be mapped.
    pub fn setup_tls_caches_on_current_thread(&'static self) -> Result<(), MallocError> {
        if thread_cache::current().is_some() {
            return Ok(());
        }
        let size = size_of::<ThreadCache>().next_multiple_of(self.page_size);
        let mem = self
            .os
            .provider()
            .alloc_from_os(size, self.page_size)?
            .cast::<ThreadCache>();
        let mut cache = self.detached_cache();
        cache.mapped_size = size;
        // Safety: fresh page-aligned mapping large enough for the cache.
        unsafe { mem.as_ptr().write(cache) };
        self.stats.metadata_bytes.add(size);

        if !thread_cache::install(mem) {
            // Safety: never published.
            unsafe { self.release_cache_memory(mem) };
            return Ok(());
        }
        log::debug!("thread cache installed ({size} bytes)");
        Ok(())
    }

    /// Flush and drop the calling thread's cache, if it belongs to this
    /// allocator.  Later calls on this thread go straight to the pools.
    ///
    /// Corruption found while flushing goes to the fatal hook.
    pub fn clear_and_disable_tls_caches_on_current_thread(&self) {
        if self.owned_cache().is_none() {
            return;
        }
        let Some(cache) = thread_cache::uninstall() else {
            return;
        };
        // Safety: uninstalled, so this is the only reference.
        let result = self.flush_cache(unsafe { &mut *cache.as_ptr() });
        // Safety: as above.
        unsafe { self.release_cache_memory(cache) };
        if let Err(e) = result {
            self.fatal(e.into());
        }
        log::debug!("thread cache removed");
    }

    /// Thread-exit hook stored in every cache this allocator creates.
    ///
    /// # Safety
    /// `cache` was made by `setup_tls_caches_on_current_thread` of a
    /// `'static` allocator and has been uninstalled.
    unsafe fn teardown_cache(cache: NonNull<ThreadCache>) {
        // Safety: caller contract; the owner outlives every thread.
        let this = unsafe { &*cache.as_ref().owner.cast::<Self>() };
        // Safety: sole reference.
        let result = this.flush_cache(unsafe { &mut *cache.as_ptr() });
        // Safety: as above.
        unsafe { this.release_cache_memory(cache) };
        if let Err(e) = result {
            this.fatal(e.into());
        }
    }

    /// # Safety
    /// `cache` is an unpublished cache mapped by this allocator.
    unsafe fn release_cache_memory(&self, cache: NonNull<ThreadCache>) {
        // Safety: caller contract.
        let size = unsafe { cache.as_ref().mapped_size };
        // Safety: mapped in `setup_tls_caches_on_current_thread`.
        let _ = unsafe { self.os.provider().free_to_os(cache.cast::<u8>(), size) };
        self.stats.metadata_bytes.sub(size);
    }

    // -----------------------------------------------------------------------
    // Maintenance and diagnostics
    // -----------------------------------------------------------------------

    /// Hand cached memory back to the OS.  Flushes the calling thread's
    /// cache and the recycler, asks other threads to flush theirs on their
    /// next operation, then empties the OS page cache.  Returns the bytes
    /// released.
    ///
    /// Corruption found while flushing goes to the fatal hook.
    pub fn trim(&self) -> usize {
        let before = self.os.stats().os_bytes;
        self.trim_epoch.fetch_add(1, Ordering::AcqRel);

        let mut result = match self.owned_cache() {
            // Safety: see `try_malloc`.
            Some(mut cache) => self.flush_cache(unsafe { cache.as_mut() }),
            None => Ok(()),
        };
        for class in 0..NUM_SIZE_CLASSES {
            while result.is_ok()
                && let Some(bundle) = self.recycler.pop(class)
            {
                // Safety: popped bundles belong to the caller.
                result = unsafe { self.free_chain(class, bundle) };
            }
        }
        if let Err(e) = result {
            self.fatal(e.into());
        }

        self.os.free_all();
        let released = before.saturating_sub(self.os.stats().os_bytes);
        log::debug!("trim released {released} bytes");
        released
    }

    /// Walk every pool list checking links, list placement, free-chain
    /// canaries and counts, and that each pool resolves to itself.  Logs
    /// the first problem found.
    pub fn validate_heap(&self) -> bool {
        let mut failure = None;
        for class in 0..NUM_SIZE_CLASSES {
            let desc = &DESCRIPTORS[class];
            let counters = &self.stats.classes[class];
            let (checked, pools, full) = {
                let _guard = self.locks.lock_class(class);
                // Safety: class lock held.
                let state = unsafe { self.class_state(class) };
                // Safety: as above.
                let checked = unsafe {
                    state.validate(class, desc, |pool| {
                        let base = pool.base as usize;
                        match self.table.resolve(base) {
                            Some(head) if std::ptr::eq(head.as_ptr().cast_const(), pool) => Ok(()),
                            _ => Err(HeapCorruption::BrokenLink { base, class }),
                        }
                    })
                };
                // Pool gauges only move under this lock.
                (checked, counters.pools.get(), counters.exhausted.get())
            };
            match checked {
                Ok((active, exhausted)) => {
                    if pools != active + exhausted || full != exhausted {
                        failure = Some(format!(
                            "class {class}: counted {pools} pools ({full} exhausted), found {active} active and {exhausted} exhausted"
                        ));
                        break;
                    }
                }
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }
        match failure {
            Some(reason) => {
                log::error!("heap validation failed: {reason}");
                false
            }
            None => true,
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let os = self.os.stats();
        let metadata = self.stats.metadata_bytes.get() + self.table.mapped_bytes();
        MemoryStats {
            os_bytes: os.os_bytes + metadata,
            cached_bytes: os.cached_bytes,
            cached_blocks: os.cached_blocks,
            pool_bytes: self.stats.pool_bytes.get(),
            os_direct_bytes: self.stats.os_direct_bytes.get(),
            os_direct_allocs: self.stats.os_direct_allocs.get(),
            metadata_bytes: metadata,
            cache_hits: os.hits,
            cache_misses: os.misses,
        }
    }

    pub fn heap_report(&self) -> HeapReport {
        HeapReport::collect(self.stats(), &self.stats)
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    fn escalate(&self, fault: Fault, size: usize, align: usize) -> MallocError {
        match fault {
            Fault::Os(VmError::ReservationFailed { source, .. }) => {
                log::debug!("OS reservation for {size} bytes failed: {source}");
                MallocError::OutOfMemory { size, align }
            }
            Fault::Os(e) => MallocError::Os(e),
            Fault::Corrupt(e) => self.corrupted(e),
        }
    }

    #[cold]
    fn out_of_memory(&self, err: MallocError, size: usize, align: usize) -> ! {
        match err {
            MallocError::OutOfMemory { .. } | MallocError::Os(_) => {
                log::error!("{err}\n{}", self.heap_report());
                (self.config.out_of_memory)(size, align)
            }
            other => panic!("allocation of {size} bytes (align {align}) failed: {other}"),
        }
    }

    #[cold]
    fn fatal(&self, fault: Fault) -> ! {
        match fault {
            Fault::Corrupt(e) => self.corrupted(e),
            Fault::Os(e) => self.abort_with(format!("allocator OS failure: {e}")),
        }
    }

    #[cold]
    fn corrupted(&self, err: HeapCorruption) -> ! {
        self.abort_with(format!("heap corruption: {err}\n{}", self.heap_report()))
    }

    /// Log `message` and hand it to the fatal hook.  Only called with no
    /// lock or cache borrow held.
    #[cold]
    fn abort_with(&self, message: String) -> ! {
        log::error!("{message}");
        (self.config.fatal)(&message)
    }
}

impl<P: PageProvider> Drop for BinnedMalloc<P> {
    fn drop(&mut self) {
        // Every pool and OS-direct region, live or not, goes back at once;
        // blocks in recycled bundles and detached caches live inside them.
        let mut regions = ReleaseList::new();
        self.table.for_each_head(|info| {
            if let Some(base) = NonNull::new(info.base) {
                // Safety: teardown; nothing resolves into the region again.
                unsafe { regions.push(base, info.os_size) };
            }
        });
        self.release_retired(regions);
        self.os.free_all();

        let provider = self.os.provider();
        // Safety: no slot is used after this point.
        unsafe { self.table.release_all(provider) };
        // Safety: mapped in `with_config` with this size.
        let _ = unsafe {
            provider.free_to_os(self.class_states.cast::<u8>(), self.class_states_size)
        };
    }
}
