//! Pointer to pool metadata lookup.
//!
//! Addresses split into `(bucket key, chunk index within bucket)`.  Each key
//! owns a lazily mapped, zero-filled array of [`PoolInfo`] slots, one per
//! 64 KiB chunk.  Keys hash into a fixed head array; collisions chain
//! through nodes carved from dedicated OS pages and linked by index, so the
//! table never touches the general heap.
//!
//! Readers walk the chains without locking.  Nodes are fully written before
//! a `Release` store publishes them and are never unlinked until drop.

use std::io;
use std::ptr::NonNull;

use super::pool::{ChunkKind, PoolInfo};
use super::size_class::{CHUNK_SHIFT, CHUNK_SIZE};
use super::vm::{PageProvider, VmError};
use crate::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

#[cfg(not(loom))]
const HASH_BUCKETS: usize = 4096;
#[cfg(not(loom))]
const MAX_NODE_PAGES: usize = 64;
// Every head is a tracked loom object; models only touch a few buckets.
#[cfg(loom)]
const HASH_BUCKETS: usize = 16;
#[cfg(loom)]
const MAX_NODE_PAGES: usize = 2;
const NODE_PAGE_BYTES: usize = 64 * 1024;
const NODES_PER_PAGE: usize = NODE_PAGE_BYTES / size_of::<BucketNode>();
/// Links store `index + 1`; zero ends a chain.
const END: u32 = 0;

#[repr(C)]
struct BucketNode {
    key: usize,
    pools: *mut PoolInfo,
    next: u32,
}

pub(crate) struct PoolTable {
    page_size: usize,
    pools_per_bucket: usize,
    key_shift: u32,
    bucket_bytes: usize,
    heads: [AtomicU32; HASH_BUCKETS],
    node_pages: [AtomicPtr<BucketNode>; MAX_NODE_PAGES],
    node_count: AtomicU32,
    mapped_bytes: AtomicUsize,
}

impl PoolTable {
    pub fn new(page_size: usize) -> Self {
        // A bucket's slot array fills one page, or one chunk if pages are
        // smaller.  Slot count is a power of two so the split is two shifts.
        let per_array = page_size.max(CHUNK_SIZE) / size_of::<PoolInfo>();
        let pools_per_bucket = 1usize << (usize::BITS - 1 - per_array.leading_zeros());
        let bucket_bytes = (pools_per_bucket * size_of::<PoolInfo>()).next_multiple_of(page_size);
        Self {
            page_size,
            pools_per_bucket,
            key_shift: CHUNK_SHIFT + pools_per_bucket.trailing_zeros(),
            bucket_bytes,
            heads: std::array::from_fn(|_| AtomicU32::new(END)),
            node_pages: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            node_count: AtomicU32::new(0),
            mapped_bytes: AtomicUsize::new(0),
        }
    }

    /// Bytes of OS memory held by bucket arrays and node pages.
    pub fn mapped_bytes(&self) -> usize {
        self.mapped_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    fn split(&self, addr: usize) -> (usize, usize) {
        (
            addr >> self.key_shift,
            (addr >> CHUNK_SHIFT) & (self.pools_per_bucket - 1),
        )
    }

    #[inline]
    fn node(&self, link: u32) -> &BucketNode {
        let i = (link - 1) as usize;
        let page = self.node_pages[i / NODES_PER_PAGE].load(Ordering::Acquire);
        // Safety: a published link always refers to a written node whose
        // page was published before it.
        unsafe { &*page.add(i % NODES_PER_PAGE) }
    }

    fn find_bucket(&self, key: usize) -> Option<NonNull<PoolInfo>> {
        let mut link = self.heads[key & (HASH_BUCKETS - 1)].load(Ordering::Acquire);
        while link != END {
            let node = self.node(link);
            if node.key == key {
                return NonNull::new(node.pools);
            }
            link = node.next;
        }
        None
    }

    /// The slot for the chunk containing `addr`, if its bucket exists.
    #[inline]
    pub fn slot(&self, addr: usize) -> Option<NonNull<PoolInfo>> {
        let (key, index) = self.split(addr);
        let pools = self.find_bucket(key)?;
        // Safety: index < pools_per_bucket.
        Some(unsafe { pools.add(index) })
    }

    /// The head slot of the pool or OS-direct region containing `addr`,
    /// following a trailing chunk's jump offset.
    pub fn resolve(&self, addr: usize) -> Option<NonNull<PoolInfo>> {
        let slot = self.slot(addr)?;
        // Safety: reading plain fields of a slot; see module docs.
        let (kind, jump) = unsafe { ((*slot.as_ptr()).kind, (*slot.as_ptr()).jump_offset) };
        match kind {
            ChunkKind::Pool | ChunkKind::OsDirect => Some(slot),
            ChunkKind::Empty => None,
            ChunkKind::Continuation => {
                let head_addr = (addr & !(CHUNK_SIZE - 1)).checked_sub(jump as usize * CHUNK_SIZE)?;
                let head = self.slot(head_addr)?;
                // Safety: as above.
                match unsafe { (*head.as_ptr()).kind } {
                    ChunkKind::Pool | ChunkKind::OsDirect => Some(head),
                    ChunkKind::Empty | ChunkKind::Continuation => None,
                }
            }
        }
    }

    /// Make sure every chunk of `[base, base + chunks * CHUNK_SIZE)` has a
    /// slot, stamp the trailing ones with their jump offsets, and return the
    /// head slot for the caller to fill in.
    ///
    /// # Safety
    /// The caller serialises all calls that may create buckets and owns the
    /// region exclusively.
    pub unsafe fn claim_region<P: PageProvider>(
        &self,
        base: usize,
        chunks: usize,
        provider: &P,
    ) -> Result<NonNull<PoolInfo>, VmError> {
        debug_assert!(base.is_multiple_of(CHUNK_SIZE) && chunks > 0);
        let mut head = None;
        for i in 0..chunks {
            // Safety: forwarded caller contract.
            let slot = unsafe { self.slot_or_create(base + i * CHUNK_SIZE, provider)? };
            if i == 0 {
                head = Some(slot);
            }
        }
        for i in 1..chunks {
            if let Some(slot) = self.slot(base + i * CHUNK_SIZE) {
                // Safety: the region's slots belong to the caller.
                unsafe { (*slot.as_ptr()).init_continuation(i as u32) };
            }
        }
        head.ok_or(VmError::InvalidRequest {
            size: chunks * CHUNK_SIZE,
            align: CHUNK_SIZE,
        })
    }

    /// Reset every slot of a region claimed with [`claim_region`](Self::claim_region).
    ///
    /// # Safety
    /// The caller owns the region and no other thread will resolve into it.
    pub unsafe fn clear_region(&self, base: usize, chunks: usize) {
        for i in 0..chunks {
            if let Some(slot) = self.slot(base + i * CHUNK_SIZE) {
                // Safety: caller contract.
                unsafe { (*slot.as_ptr()).clear() };
            }
        }
    }

    /// # Safety
    /// Same as [`claim_region`](Self::claim_region).
    unsafe fn slot_or_create<P: PageProvider>(
        &self,
        addr: usize,
        provider: &P,
    ) -> Result<NonNull<PoolInfo>, VmError> {
        if let Some(slot) = self.slot(addr) {
            return Ok(slot);
        }
        let (key, index) = self.split(addr);
        let pools = self.create_bucket(key, provider)?;
        // Safety: index < pools_per_bucket.
        Ok(unsafe { pools.add(index) })
    }

    fn create_bucket<P: PageProvider>(
        &self,
        key: usize,
        provider: &P,
    ) -> Result<NonNull<PoolInfo>, VmError> {
        let count = self.node_count.load(Ordering::Relaxed) as usize;
        if count >= MAX_NODE_PAGES * NODES_PER_PAGE {
            return Err(VmError::ReservationFailed {
                size: self.bucket_bytes,
                source: io::Error::new(io::ErrorKind::OutOfMemory, "pool lookup table is full"),
            });
        }
        let page_index = count / NODES_PER_PAGE;
        let mut page = self.node_pages[page_index].load(Ordering::Relaxed);
        if page.is_null() {
            let fresh = provider.alloc_from_os(NODE_PAGE_BYTES, self.page_size)?;
            self.mapped_bytes.fetch_add(NODE_PAGE_BYTES, Ordering::Relaxed);
            page = fresh.cast::<BucketNode>().as_ptr();
            self.node_pages[page_index].store(page, Ordering::Release);
        }

        let pools = provider.alloc_from_os(self.bucket_bytes, self.page_size)?;
        // Safety: fresh mapping of bucket_bytes; zero bytes are empty slots.
        unsafe { pools.as_ptr().write_bytes(0, self.bucket_bytes) };
        self.mapped_bytes.fetch_add(self.bucket_bytes, Ordering::Relaxed);

        let head = &self.heads[key & (HASH_BUCKETS - 1)];
        // Safety: slot `count` of this page is unused and unpublished.
        unsafe {
            page.add(count % NODES_PER_PAGE).write(BucketNode {
                key,
                pools: pools.cast::<PoolInfo>().as_ptr(),
                next: head.load(Ordering::Relaxed),
            });
        }
        let link = count as u32 + 1;
        self.node_count.store(link, Ordering::Relaxed);
        head.store(link, Ordering::Release);
        Ok(pools.cast::<PoolInfo>())
    }

    /// Visit every head slot that owns memory.
    pub fn for_each_head(&self, mut visit: impl FnMut(&PoolInfo)) {
        let count = self.node_count.load(Ordering::Acquire);
        for link in 1..=count {
            let pools = self.node(link).pools;
            for i in 0..self.pools_per_bucket {
                // Safety: i < pools_per_bucket; slots are initialised.
                let info = unsafe { &*pools.add(i) };
                if matches!(info.kind, ChunkKind::Pool | ChunkKind::OsDirect) {
                    visit(info);
                }
            }
        }
    }

    /// Unmap every bucket array and node page.
    ///
    /// # Safety
    /// No slot may be used afterwards.
    pub unsafe fn release_all<P: PageProvider>(&mut self, provider: &P) {
        let count = self.node_count.load(Ordering::Acquire);
        for link in 1..=count {
            if let Some(pools) = NonNull::new(self.node(link).pools) {
                // Safety: mapped in create_bucket with bucket_bytes.
                let _ = unsafe { provider.free_to_os(pools.cast::<u8>(), self.bucket_bytes) };
            }
        }
        for page in &self.node_pages {
            if let Some(p) = NonNull::new(page.swap(std::ptr::null_mut(), Ordering::AcqRel)) {
                // Safety: mapped in create_bucket with NODE_PAGE_BYTES.
                let _ = unsafe { provider.free_to_os(p.cast::<u8>(), NODE_PAGE_BYTES) };
            }
        }
        for head in &self.heads {
            head.store(END, Ordering::Relaxed);
        }
        self.node_count.store(0, Ordering::Relaxed);
        self.mapped_bytes.store(0, Ordering::Relaxed);
    }
}

// Safety: slot arrays and node pages are owned by the table; concurrent
// access follows the publication protocol in the module docs.
unsafe impl Send for PoolTable {}
// Safety: see above.
unsafe impl Sync for PoolTable {}
