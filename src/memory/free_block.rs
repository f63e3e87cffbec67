//! Overlays written into memory the allocator owns but no caller does.
//!
//! Three layouts live here and nowhere else:
//!
//! * [`FreeBlockNode`]: a run of free blocks inside a pool, valid only while
//!   those blocks are logically free.
//! * Bundle links: a block parked in a thread cache stores its successor at
//!   offset 0 and, when it heads a recycled bundle, the next bundle at
//!   offset 8.
//! * [`ReleaseList`] nodes: a fully free pool or OS region queued for return
//!   to the OS after its lock is dropped.

use std::ptr::NonNull;

use super::error::HeapCorruption;
use super::size_class::MIN_ALIGN;
use crate::sync::atomic::AtomicUsize;

pub(crate) const FREE_BLOCK_CANARY: u8 = 0xE3;

/// Header of a run of `num_free_blocks` consecutive free blocks.
#[repr(C)]
pub(crate) struct FreeBlockNode {
    canary: u8,
    _reserved: [u8; 3],
    num_free_blocks: u32,
    next: *mut FreeBlockNode,
}

const _: () = assert!(size_of::<FreeBlockNode>() <= MIN_ALIGN);

impl FreeBlockNode {
    /// Turn dead storage at `block` into a run header.
    ///
    /// # Safety
    /// `block` must point to at least `MIN_ALIGN` writable bytes that no live
    /// allocation uses, and stay that way until [`take_block`](Self::take_block)
    /// hands the last block of the run out.
    unsafe fn claim(
        block: NonNull<u8>,
        num_free_blocks: u32,
        next: *mut FreeBlockNode,
    ) -> NonNull<FreeBlockNode> {
        let node = block.cast::<FreeBlockNode>();
        // Safety: caller contract; blocks are MIN_ALIGN aligned.
        unsafe {
            node.as_ptr().write(FreeBlockNode {
                canary: FREE_BLOCK_CANARY,
                _reserved: [0; 3],
                num_free_blocks,
                next,
            });
        }
        node
    }

    #[inline]
    fn check(node: NonNull<FreeBlockNode>) -> Result<(), HeapCorruption> {
        // Safety: node came from a pool free chain; the canary byte is always
        // readable even if the rest is garbage.
        let found = unsafe { node.as_ptr().cast::<u8>().read() };
        if found == FREE_BLOCK_CANARY {
            Ok(())
        } else {
            Err(HeapCorruption::BadCanary {
                addr: node.as_ptr() as usize,
                found,
                expected: FREE_BLOCK_CANARY,
            })
        }
    }

    /// Detach the highest block of the run at `node`.
    ///
    /// Returns the block and the run that replaces `node` in the chain: the
    /// same node while blocks remain, its successor once the run is spent.
    ///
    /// # Safety
    /// `node` must head a run created by [`claim`](Self::claim) in a pool of
    /// `block_size` blocks.
    unsafe fn take_block(
        node: NonNull<FreeBlockNode>,
        block_size: usize,
    ) -> Result<(NonNull<u8>, *mut FreeBlockNode), HeapCorruption> {
        Self::check(node)?;
        let raw = node.as_ptr();
        // Safety: canary verified; caller owns the pool lock.
        unsafe {
            let Some(remaining) = (*raw).num_free_blocks.checked_sub(1) else {
                let addr = raw as usize;
                return Err(HeapCorruption::RunOutOfBounds { addr, base: addr });
            };
            if remaining == 0 {
                let next = (*raw).next;
                return Ok((node.cast::<u8>(), next));
            }
            (*raw).num_free_blocks = remaining;
            let block = node.cast::<u8>().add(remaining as usize * block_size);
            Ok((block, raw))
        }
    }
}

/// Head of a pool's run-length free chain.  All-zero bytes mean empty, so
/// zeroed pool metadata starts out valid.
#[repr(transparent)]
pub(crate) struct FreeChain {
    head: *mut FreeBlockNode,
}

impl FreeChain {
    pub const fn empty() -> Self {
        Self {
            head: std::ptr::null_mut(),
        }
    }

    /// Chain covering a fresh pool of `blocks` blocks starting at `base`.
    ///
    /// # Safety
    /// Same as [`FreeBlockNode::claim`] for the whole pool.
    pub unsafe fn whole_pool(base: NonNull<u8>, blocks: u32) -> Self {
        // Safety: forwarded caller contract.
        let node = unsafe { FreeBlockNode::claim(base, blocks, std::ptr::null_mut()) };
        Self {
            head: node.as_ptr(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Take one block, or `None` if the chain is empty.
    ///
    /// # Safety
    /// The chain must belong to a pool of `block_size` blocks guarded by the
    /// caller's lock.
    pub unsafe fn pop(&mut self, block_size: usize) -> Result<Option<NonNull<u8>>, HeapCorruption> {
        let Some(node) = NonNull::new(self.head) else {
            return Ok(None);
        };
        // Safety: forwarded caller contract.
        let (block, head) = unsafe { FreeBlockNode::take_block(node, block_size)? };
        self.head = head;
        Ok(Some(block))
    }

    /// Return one block as a single-block run at the chain's front.
    ///
    /// # Safety
    /// `block` must be a block of this chain's pool that no caller uses.
    pub unsafe fn push(&mut self, block: NonNull<u8>) {
        // Safety: forwarded caller contract.
        let node = unsafe { FreeBlockNode::claim(block, 1, self.head) };
        self.head = node.as_ptr();
    }

    /// Walk the chain checking canaries and bounds.  Returns the number of
    /// free blocks.
    ///
    /// # Safety
    /// Caller holds the pool's lock.
    pub unsafe fn count_free(
        &self,
        base: usize,
        pool_size: usize,
        block_size: usize,
        max_blocks: usize,
    ) -> Result<usize, HeapCorruption> {
        let mut total = 0usize;
        let mut cur = self.head;
        while let Some(node) = NonNull::new(cur) {
            let addr = node.as_ptr() as usize;
            if addr < base || addr >= base + pool_size || !(addr - base).is_multiple_of(block_size)
            {
                return Err(HeapCorruption::RunOutOfBounds { addr, base });
            }
            FreeBlockNode::check(node)?;
            // Safety: canary verified and node lies inside the pool.
            let (run, next) = unsafe { ((*node.as_ptr()).num_free_blocks as usize, (*node.as_ptr()).next) };
            if run == 0 || addr + run * block_size > base + pool_size {
                return Err(HeapCorruption::RunOutOfBounds { addr, base });
            }
            total += run;
            if total > max_blocks {
                // Also catches cycles.
                return Ok(total);
            }
            cur = next;
        }
        Ok(total)
    }
}

// ---------------------------------------------------------------------------
// Bundle links
// ---------------------------------------------------------------------------

/// Offset of the inter-bundle link used by the global recycler.  Bytes 0..8
/// hold the intra-bundle link; the smallest block is 16 bytes.
const RECYCLER_LINK_OFFSET: usize = size_of::<usize>();

/// Store `next` as the bundle successor of `block`.
///
/// # Safety
/// `block` must be a cached block owned by the calling thread.
#[inline]
pub(crate) unsafe fn set_bundle_next(block: NonNull<u8>, next: Option<NonNull<u8>>) {
    // Safety: blocks are at least 16 bytes and 16-byte aligned.
    unsafe { block.cast::<usize>().as_ptr().write(next.map_or(0, |p| p.as_ptr() as usize)) };
}

/// Read the bundle successor of `block`.
///
/// # Safety
/// `block` must be a cached block whose link was set by [`set_bundle_next`].
#[inline]
pub(crate) unsafe fn bundle_next(block: NonNull<u8>) -> Option<NonNull<u8>> {
    // Safety: caller contract.
    let raw = unsafe { block.cast::<usize>().as_ptr().read() };
    NonNull::new(raw as *mut u8)
}

/// The recycler stack link stored in a bundle head.
///
/// # Safety
/// `block` must head a bundle owned by the recycler (or about to be pushed),
/// and the returned reference must not outlive that ownership.
#[inline]
pub(crate) unsafe fn recycler_link<'a>(block: NonNull<u8>) -> &'a AtomicUsize {
    // Safety: offset 8 lies inside the 16-byte minimum block and is
    // usize-aligned.
    let p = unsafe { block.as_ptr().add(RECYCLER_LINK_OFFSET) }.cast::<AtomicUsize>();
    debug_assert!((p as usize).is_multiple_of(align_of::<AtomicUsize>()));
    // Safety: see above.
    unsafe { &*p }
}

// ---------------------------------------------------------------------------
// Deferred OS release
// ---------------------------------------------------------------------------

#[repr(C)]
struct RetiredRegion {
    next: *mut RetiredRegion,
    size: usize,
}

/// Regions detached under a lock, returned to the OS after it is dropped.
pub(crate) struct ReleaseList {
    head: *mut RetiredRegion,
}

impl ReleaseList {
    pub const fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
        }
    }

    /// Queue `size` bytes at `base`.
    ///
    /// # Safety
    /// The region must be unreachable from every allocator structure and
    /// from every caller.
    pub unsafe fn push(&mut self, base: NonNull<u8>, size: usize) {
        let node = base.cast::<RetiredRegion>().as_ptr();
        // Safety: regions are chunk aligned and far larger than the header.
        unsafe { node.write(RetiredRegion { next: self.head, size }) };
        self.head = node;
    }

    pub fn pop(&mut self) -> Option<(NonNull<u8>, usize)> {
        let node = NonNull::new(self.head)?;
        // Safety: written by `push`; read before the caller unmaps it.
        let RetiredRegion { next, size } = unsafe { node.as_ptr().read() };
        self.head = next;
        Some((node.cast::<u8>(), size))
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[repr(C, align(64))]
    struct Arena([u8; 1024]);

    #[test]
    fn test_run_hands_out_blocks_high_to_low() {
        let mut arena = Arena([0; 1024]);
        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
        // Safety: Test code.
        unsafe {
            let mut chain = FreeChain::whole_pool(base, 4);
            let expect = |i: usize| base.as_ptr().add(i * 64);
            assert_eq!(chain.pop(64).unwrap().unwrap().as_ptr(), expect(3));
            assert_eq!(chain.pop(64).unwrap().unwrap().as_ptr(), expect(2));
            assert_eq!(chain.pop(64).unwrap().unwrap().as_ptr(), expect(1));
            assert_eq!(chain.count_free(base.as_ptr() as usize, 256, 64, 4).unwrap(), 1);
            assert_eq!(chain.pop(64).unwrap().unwrap().as_ptr(), expect(0));
            assert!(chain.is_empty());
            assert!(chain.pop(64).unwrap().is_none());
        }
    }

    #[test]
    fn test_push_then_pop_is_lifo() {
        let mut arena = Arena([0; 1024]);
        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
        // Safety: Test code.
        unsafe {
            let mut chain = FreeChain::whole_pool(base, 2);
            let a = chain.pop(32).unwrap().unwrap();
            let b = chain.pop(32).unwrap().unwrap();
            chain.push(a);
            chain.push(b);
            assert_eq!(chain.count_free(base.as_ptr() as usize, 64, 32, 2).unwrap(), 2);
            assert_eq!(chain.pop(32).unwrap(), Some(b));
            assert_eq!(chain.pop(32).unwrap(), Some(a));
        }
    }

    #[test]
    fn test_overwritten_canary_detected() {
        let mut arena = Arena([0; 1024]);
        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
        // Safety: Test code.
        unsafe {
            let mut chain = FreeChain::whole_pool(base, 8);
            base.as_ptr().write(0x00);
            assert!(matches!(
                chain.pop(16),
                Err(HeapCorruption::BadCanary { found: 0, .. })
            ));
            assert!(chain.count_free(base.as_ptr() as usize, 128, 16, 8).is_err());
        }
    }

    #[test]
    fn test_release_list_round_trip() {
        let mut a = Arena([0; 1024]);
        let mut b = Arena([0; 1024]);
        let pa = NonNull::new(a.0.as_mut_ptr()).unwrap();
        let pb = NonNull::new(b.0.as_mut_ptr()).unwrap();
        let mut list = ReleaseList::new();
        // Safety: Test code.
        unsafe {
            list.push(pa, 100);
            list.push(pb, 200);
        }
        assert_eq!(list.pop(), Some((pb, 200)));
        assert_eq!(list.pop(), Some((pa, 100)));
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn test_bundle_links() {
        let mut arena = Arena([0; 1024]);
        let a = NonNull::new(arena.0.as_mut_ptr()).unwrap();
        // Safety: Test code.
        let b = unsafe { a.add(16) };
        // Safety: Test code.
        unsafe {
            set_bundle_next(a, Some(b));
            set_bundle_next(b, None);
            assert_eq!(bundle_next(a), Some(b));
            assert_eq!(bundle_next(b), None);
        }
    }
}
