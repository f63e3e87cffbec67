use std::ptr::NonNull;

use super::error::HeapCorruption;
use super::free_block::FreeChain;
use super::size_class::SizeClassDescriptor;

/// What a lookup slot describes.  Zero is `Empty` so freshly zeroed slots
/// are valid.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkKind {
    Empty = 0,
    /// First chunk of a small-block pool.
    Pool = 1,
    /// First chunk of an OS-direct allocation.
    OsDirect = 2,
    /// Trailing chunk of either; `jump_offset` leads back to the head.
    Continuation = 3,
}

/// Per-chunk metadata, stored in the lookup table rather than the chunk.
///
/// Only head slots carry allocation state.  A head slot is mutated under its
/// size class's lock (pools) or by the single owner of the region (OS-direct).
#[repr(C)]
pub(crate) struct PoolInfo {
    pub kind: ChunkKind,
    pub class: u8,
    pub jump_offset: u32,
    pub taken: u32,
    pub base: *mut u8,
    /// Bytes obtained from the OS for the whole region.
    pub os_size: usize,
    pub free: FreeChain,
    next: *mut PoolInfo,
    prev_link: *mut *mut PoolInfo,
}

impl PoolInfo {
    /// Stamp a fresh pool head covering `desc.pool_size` bytes at `base`.
    ///
    /// # Safety
    /// The pool memory must be unused and exclusively owned by the caller.
    pub unsafe fn init_pool(&mut self, class: usize, base: NonNull<u8>, desc: &SizeClassDescriptor) {
        self.kind = ChunkKind::Pool;
        self.class = class as u8;
        self.jump_offset = 0;
        self.taken = 0;
        self.base = base.as_ptr();
        self.os_size = desc.pool_size;
        // Safety: forwarded caller contract.
        self.free = unsafe { FreeChain::whole_pool(base, desc.blocks_per_pool) };
        self.next = std::ptr::null_mut();
        self.prev_link = std::ptr::null_mut();
    }

    pub fn init_os_direct(&mut self, base: NonNull<u8>, os_size: usize) {
        self.clear();
        self.kind = ChunkKind::OsDirect;
        self.base = base.as_ptr();
        self.os_size = os_size;
    }

    pub fn init_continuation(&mut self, jump_offset: u32) {
        self.clear();
        self.kind = ChunkKind::Continuation;
        self.jump_offset = jump_offset;
    }

    pub fn clear(&mut self) {
        self.kind = ChunkKind::Empty;
        self.class = 0;
        self.jump_offset = 0;
        self.taken = 0;
        self.base = std::ptr::null_mut();
        self.os_size = 0;
        self.free = FreeChain::empty();
        self.next = std::ptr::null_mut();
        self.prev_link = std::ptr::null_mut();
    }

    /// Push onto the list whose head pointer lives at `head`.
    ///
    /// # Safety
    /// `head` must be a list head with a stable address, guarded by the same
    /// lock as `self`, and `self` must not be on any list.
    unsafe fn link(&mut self, head: *mut *mut PoolInfo) {
        debug_assert!(self.prev_link.is_null());
        // Safety: caller contract.
        unsafe {
            self.next = *head;
            if let Some(next) = self.next.as_mut() {
                next.prev_link = &raw mut self.next;
            }
            self.prev_link = head;
            *head = self;
        }
    }

    /// Remove from whichever list holds this pool, in O(1).
    ///
    /// # Safety
    /// `self` must be linked, and its list guarded by the caller's lock.
    unsafe fn unlink(&mut self) {
        debug_assert!(!self.prev_link.is_null());
        // Safety: caller contract.
        unsafe {
            if let Some(next) = self.next.as_mut() {
                next.prev_link = self.prev_link;
            }
            *self.prev_link = self.next;
        }
        self.next = std::ptr::null_mut();
        self.prev_link = std::ptr::null_mut();
    }

    fn contains_block(&self, addr: usize, desc: &SizeClassDescriptor) -> bool {
        let base = self.base as usize;
        addr >= base
            && addr < base + desc.block_size * desc.blocks_per_pool as usize
            && (addr - base).is_multiple_of(desc.block_size)
    }
}

/// Result of taking a block from a class.
pub(crate) struct Taken {
    pub block: NonNull<u8>,
    /// The pool moved from Active to Exhausted.
    pub exhausted: bool,
}

/// Result of returning a block to its pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Returned {
    /// The pool moved from Exhausted back to Active.
    pub reactivated: bool,
    /// The pool's last block came back; it is unlinked and must be released.
    pub emptied: bool,
}

/// Active and Exhausted pool lists of one size class.
///
/// Lives in allocator metadata memory that never moves, so pools can point
/// back at these heads.
#[repr(C)]
pub(crate) struct ClassState {
    active: *mut PoolInfo,
    exhausted: *mut PoolInfo,
}

impl ClassState {
    pub const fn new() -> Self {
        Self {
            active: std::ptr::null_mut(),
            exhausted: std::ptr::null_mut(),
        }
    }

    #[inline]
    pub fn has_active(&self) -> bool {
        !self.active.is_null()
    }

    /// Put a freshly initialised pool at the front of the Active list.
    ///
    /// # Safety
    /// Caller holds the class lock; `pool` is an unlinked pool head of this
    /// class.
    pub unsafe fn adopt(&mut self, pool: &mut PoolInfo) {
        // Safety: caller contract; `self` does not move.
        unsafe { pool.link(&raw mut self.active) };
    }

    /// Take one block from the front Active pool, or `None` if there is none.
    ///
    /// # Safety
    /// Caller holds the class lock and `desc` describes this class.
    pub unsafe fn alloc_block(
        &mut self,
        desc: &SizeClassDescriptor,
    ) -> Result<Option<Taken>, HeapCorruption> {
        // Safety: list members are live pool heads guarded by the class lock.
        let Some(pool) = (unsafe { self.active.as_mut() }) else {
            return Ok(None);
        };
        // Safety: the chain belongs to this pool.
        let Some(block) = (unsafe { pool.free.pop(desc.block_size)? }) else {
            return Err(HeapCorruption::FreeCountMismatch {
                base: pool.base as usize,
                class: pool.class as usize,
                found: 0,
                expected: desc.blocks_per_pool.saturating_sub(pool.taken) as usize,
            });
        };
        pool.taken += 1;
        let exhausted = pool.free.is_empty();
        if exhausted {
            // Safety: pool is on the Active list.
            unsafe {
                pool.unlink();
                pool.link(&raw mut self.exhausted);
            }
        }
        Ok(Some(Taken { block, exhausted }))
    }

    /// Return `block` to `pool`.
    ///
    /// # Safety
    /// Caller holds the class lock; `pool` is a head of this class and
    /// `block` is not in use.
    pub unsafe fn free_block(
        &mut self,
        pool: &mut PoolInfo,
        block: NonNull<u8>,
        desc: &SizeClassDescriptor,
    ) -> Result<Returned, HeapCorruption> {
        let addr = block.as_ptr() as usize;
        if !pool.contains_block(addr, desc) {
            return Err(HeapCorruption::MisalignedBlock {
                addr,
                block_size: desc.block_size,
            });
        }
        if pool.taken == 0 {
            return Err(HeapCorruption::FreeCountMismatch {
                base: pool.base as usize,
                class: pool.class as usize,
                found: desc.blocks_per_pool as usize + 1,
                expected: desc.blocks_per_pool as usize,
            });
        }
        let mut out = Returned::default();
        if pool.free.is_empty() {
            // Safety: an empty free chain means the pool is Exhausted.
            unsafe {
                pool.unlink();
                pool.link(&raw mut self.active);
            }
            out.reactivated = true;
        }
        // Safety: block checked to be a block of this pool.
        unsafe { pool.free.push(block) };
        pool.taken -= 1;
        if pool.taken == 0 {
            // Safety: a pool with free blocks is Active.
            unsafe { pool.unlink() };
            out.emptied = true;
        }
        Ok(out)
    }

    /// Walk both lists checking links, list placement and free-chain counts.
    /// Calls `visit` on every pool head.  Returns `(active, exhausted)`.
    ///
    /// # Safety
    /// Caller holds the class lock.
    pub unsafe fn validate(
        &self,
        class: usize,
        desc: &SizeClassDescriptor,
        mut visit: impl FnMut(&PoolInfo) -> Result<(), HeapCorruption>,
    ) -> Result<(usize, usize), HeapCorruption> {
        let mut counts = [0usize; 2];
        for (which, head) in [&self.active, &self.exhausted].into_iter().enumerate() {
            let mut expected_link: *const *mut PoolInfo = head;
            let mut cur = *head;
            // Safety: list members are live pool heads guarded by the lock.
            while let Some(pool) = unsafe { cur.as_ref() } {
                let base = pool.base as usize;
                // A cycle also trips the back-pointer check.
                if pool.kind != ChunkKind::Pool
                    || pool.class as usize != class
                    || !std::ptr::eq(pool.prev_link, expected_link)
                {
                    return Err(HeapCorruption::BrokenLink { base, class });
                }
                // Safety: lock held.
                let free = unsafe {
                    pool.free.count_free(
                        base,
                        desc.pool_size,
                        desc.block_size,
                        desc.blocks_per_pool as usize,
                    )?
                };
                let expected = (desc.blocks_per_pool as usize).saturating_sub(pool.taken as usize);
                let on_exhausted = which == 1;
                if free != expected || pool.taken == 0 || (free == 0) != on_exhausted {
                    return Err(HeapCorruption::FreeCountMismatch {
                        base,
                        class,
                        found: free,
                        expected,
                    });
                }
                visit(pool)?;
                counts[which] += 1;
                expected_link = &pool.next;
                cur = pool.next;
            }
        }
        Ok((counts[0], counts[1]))
    }
}
