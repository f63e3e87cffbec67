use std::ptr::NonNull;

use super::stats::Counter;
use super::vm::{PageProvider, VmError};
use crate::sync::{Mutex, lock};

/// Slot capacity of the OS page cache.
pub const MAX_CACHED_OS_BLOCKS: usize = 64;

/// A freed OS region held in reserve.
#[derive(Debug, Clone, Copy)]
struct CachedOsPageBlock {
    ptr: NonNull<u8>,
    byte_size: usize,
}

/// Fixed array of cached regions, oldest first.
struct PageCache {
    blocks: [Option<CachedOsPageBlock>; MAX_CACHED_OS_BLOCKS],
    len: usize,
    bytes: usize,
}

// Safety: cached pointers refer to OS regions owned by the cache alone.
unsafe impl Send for PageCache {}

impl PageCache {
    const fn new() -> Self {
        Self {
            blocks: [None; MAX_CACHED_OS_BLOCKS],
            len: 0,
            bytes: 0,
        }
    }

    fn take_exact(&mut self, size: usize) -> Option<NonNull<u8>> {
        // Newest first: recently freed memory is more likely still resident.
        let idx = (0..self.len)
            .rev()
            .find(|&i| self.blocks[i].is_some_and(|b| b.byte_size == size))?;
        let block = self.remove(idx)?;
        Some(block.ptr)
    }

    fn remove(&mut self, idx: usize) -> Option<CachedOsPageBlock> {
        let block = self.blocks[idx].take()?;
        self.blocks.copy_within(idx + 1..self.len, idx);
        self.len -= 1;
        self.blocks[self.len] = None;
        self.bytes -= block.byte_size;
        Some(block)
    }

    fn push(&mut self, block: CachedOsPageBlock) {
        debug_assert!(self.len < MAX_CACHED_OS_BLOCKS);
        self.blocks[self.len] = Some(block);
        self.len += 1;
        self.bytes += block.byte_size;
    }
}

/// Occupancy and traffic of the OS page cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct OsCacheStats {
    pub os_bytes: usize,
    pub cached_bytes: usize,
    pub cached_blocks: usize,
    pub hits: usize,
    pub misses: usize,
}

/// Page provider fronted by a small FIFO cache of freed regions.
///
/// Regions are reused only on an exact size match.  Regions above a quarter
/// of the byte budget, over-aligned requests, and sizes the provider has
/// its own pool for go straight through.  Syscalls happen outside the cache
/// mutex.
pub(crate) struct CachedOsPageAllocator<P: PageProvider> {
    provider: P,
    max_entries: usize,
    max_bytes: usize,
    eligible_bytes: usize,
    cacheable_align: usize,
    oom_retries: u32,
    cache: Mutex<PageCache>,
    os_bytes: Counter,
    cached_bytes: Counter,
    cached_blocks: Counter,
    hits: Counter,
    misses: Counter,
}

impl<P: PageProvider> CachedOsPageAllocator<P> {
    /// `cacheable_align` is the alignment every cached region satisfies;
    /// requests asking for more bypass the cache.
    pub fn new(
        provider: P,
        max_entries: usize,
        max_bytes: usize,
        cacheable_align: usize,
        oom_retries: u32,
    ) -> Self {
        Self {
            provider,
            max_entries: max_entries.min(MAX_CACHED_OS_BLOCKS),
            max_bytes,
            eligible_bytes: max_bytes / 4,
            cacheable_align,
            oom_retries,
            cache: Mutex::new(PageCache::new()),
            os_bytes: Counter::new(),
            cached_bytes: Counter::new(),
            cached_blocks: Counter::new(),
            hits: Counter::new(),
            misses: Counter::new(),
        }
    }

    #[inline]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    #[inline]
    fn is_cacheable(&self, size: usize, align: usize) -> bool {
        self.max_entries > 0
            && size <= self.eligible_bytes
            && align <= self.cacheable_align
            && !self.provider.has_memory_pool_for_size(size)
    }

    /// Map `size` bytes aligned to `align`, reusing a cached region of the
    /// same size when possible.  On OS failure, flushes the cache and
    /// retries up to the configured count.
    ///
    /// Cached regions are not zeroed.
    pub fn allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        if self.is_cacheable(size, align) {
            let reused = lock(&self.cache).take_exact(size);
            if let Some(ptr) = reused {
                self.hits.add(1);
                self.cached_bytes.sub(size);
                self.cached_blocks.sub(1);
                return Ok(ptr);
            }
            self.misses.add(1);
        }

        let mut retries_left = self.oom_retries;
        loop {
            match self.provider.alloc_from_os(size, align) {
                Ok(ptr) => {
                    self.os_bytes.add(size);
                    return Ok(ptr);
                }
                Err(e) if retries_left == 0 => return Err(e),
                Err(_) => {
                    retries_left -= 1;
                    self.free_all();
                }
            }
        }
    }

    /// Hand a region back, parking it in the cache if it is eligible.
    ///
    /// # Safety
    /// `ptr`/`size` must come from [`allocate`](Self::allocate), be aligned
    /// to at least `align`, and not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize, align: usize) -> Result<(), VmError> {
        if !self.is_cacheable(size, align) {
            // Safety: forwarded caller contract.
            return unsafe { self.release(ptr, size) };
        }

        let mut evicted = [None; MAX_CACHED_OS_BLOCKS];
        let mut n_evicted = 0;
        {
            let mut cache = lock(&self.cache);
            while cache.len > 0
                && (cache.len >= self.max_entries || cache.bytes + size > self.max_bytes)
            {
                if let Some(old) = cache.remove(0) {
                    evicted[n_evicted] = Some(old);
                    n_evicted += 1;
                }
            }
            cache.push(CachedOsPageBlock {
                ptr,
                byte_size: size,
            });
        }
        self.cached_bytes.add(size);
        self.cached_blocks.add(1);

        let mut result = Ok(());
        for old in evicted.into_iter().flatten() {
            self.cached_bytes.sub(old.byte_size);
            self.cached_blocks.sub(1);
            // Safety: cached regions are owned by the cache alone.
            if let Err(e) = unsafe { self.release(old.ptr, old.byte_size) } {
                result = Err(e);
            }
        }
        result
    }

    /// Return every cached region to the OS.  Returns the bytes released.
    pub fn free_all(&self) -> usize {
        let drained = std::mem::replace(&mut *lock(&self.cache), PageCache::new());
        let mut released = 0;
        for block in drained.blocks.into_iter().flatten() {
            self.cached_bytes.sub(block.byte_size);
            self.cached_blocks.sub(1);
            // Safety: cached regions are owned by the cache alone.
            if unsafe { self.release(block.ptr, block.byte_size) }.is_ok() {
                released += block.byte_size;
            }
        }
        released
    }

    unsafe fn release(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        // Safety: forwarded caller contract.
        unsafe { self.provider.free_to_os(ptr, size)? };
        self.os_bytes.sub(size);
        Ok(())
    }

    pub fn stats(&self) -> OsCacheStats {
        OsCacheStats {
            os_bytes: self.os_bytes.get(),
            cached_bytes: self.cached_bytes.get(),
            cached_blocks: self.cached_blocks.get(),
            hits: self.hits.get(),
            misses: self.misses.get(),
        }
    }
}

impl<P: PageProvider> Drop for CachedOsPageAllocator<P> {
    fn drop(&mut self) {
        self.free_all();
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;
    use crate::memory::size_class::CHUNK_SIZE;
    use crate::memory::vm::testing::CountingPageProvider;

    const MB: usize = 1024 * 1024;

    fn cache(max_entries: usize, max_bytes: usize) -> CachedOsPageAllocator<CountingPageProvider> {
        CachedOsPageAllocator::new(CountingPageProvider::new(), max_entries, max_bytes, CHUNK_SIZE, 1)
    }

    #[test]
    fn test_exact_size_reuse() {
        let os = cache(8, 32 * MB);
        let size = 4 * CHUNK_SIZE;
        let a = os.allocate(size, CHUNK_SIZE).unwrap();
        // Safety: Test code.
        unsafe { os.free(a, size, CHUNK_SIZE).unwrap() };
        assert_eq!(os.stats().cached_blocks, 1);

        // A different size does not match.
        let b = os.allocate(size + CHUNK_SIZE, CHUNK_SIZE).unwrap();
        assert_ne!(a, b);
        let c = os.allocate(size, CHUNK_SIZE).unwrap();
        assert_eq!(a, c);

        let stats = os.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.cached_blocks, 0);
        assert_eq!(os.provider().allocs(), 2);
        // Safety: Test code.
        unsafe {
            os.free(b, size + CHUNK_SIZE, CHUNK_SIZE).unwrap();
            os.free(c, size, CHUNK_SIZE).unwrap();
        }
        assert_eq!(os.free_all(), 2 * size + CHUNK_SIZE);
        assert_eq!(os.provider().live_bytes(), 0);
        assert_eq!(os.stats().os_bytes, 0);
    }

    #[test]
    fn test_evicts_oldest_by_count() {
        let os = cache(2, 32 * MB);
        let sizes = [CHUNK_SIZE, 2 * CHUNK_SIZE, 3 * CHUNK_SIZE];
        let ptrs: Vec<_> = sizes.iter().map(|&s| os.allocate(s, CHUNK_SIZE).unwrap()).collect();
        for (&p, &s) in ptrs.iter().zip(&sizes) {
            // Safety: Test code.
            unsafe { os.free(p, s, CHUNK_SIZE).unwrap() };
        }
        assert_eq!(os.stats().cached_blocks, 2);
        assert_eq!(os.provider().frees(), 1);
        assert_eq!(os.provider().live_bytes(), 5 * CHUNK_SIZE);
        drop(os);
    }

    #[test]
    fn test_evicts_oldest_by_bytes() {
        // Eligible up to 256 KiB; the cache holds 1 MiB in total.
        let os = cache(64, MB);
        let size = 256 * 1024;
        let ptrs: Vec<_> = (0..5).map(|_| os.allocate(size, CHUNK_SIZE).unwrap()).collect();
        for &p in &ptrs {
            // Safety: Test code.
            unsafe { os.free(p, size, CHUNK_SIZE).unwrap() };
        }
        let stats = os.stats();
        assert_eq!(stats.cached_blocks, 4);
        assert_eq!(stats.cached_bytes, MB);
        assert_eq!(os.provider().frees(), 1);
    }

    #[test]
    fn test_ineligible_requests_bypass() {
        let os = cache(8, 4 * MB);
        // Above a quarter of the byte budget.
        let big = 2 * MB;
        let p = os.allocate(big, CHUNK_SIZE).unwrap();
        // Safety: Test code.
        unsafe { os.free(p, big, CHUNK_SIZE).unwrap() };
        // Over-aligned.
        let p = os.allocate(CHUNK_SIZE, 4 * CHUNK_SIZE).unwrap();
        // Safety: Test code.
        unsafe { os.free(p, CHUNK_SIZE, 4 * CHUNK_SIZE).unwrap() };
        // The provider pools this size itself.
        os.provider().set_pooled_size(2 * CHUNK_SIZE);
        let p = os.allocate(2 * CHUNK_SIZE, CHUNK_SIZE).unwrap();
        // Safety: Test code.
        unsafe { os.free(p, 2 * CHUNK_SIZE, CHUNK_SIZE).unwrap() };

        let stats = os.stats();
        assert_eq!(stats.cached_blocks, 0);
        assert_eq!(stats.hits + stats.misses, 0);
        assert_eq!(os.provider().live_bytes(), 0);
    }

    #[test]
    fn test_out_of_memory_flushes_and_retries() {
        let os = cache(8, 32 * MB);
        let size = 4 * CHUNK_SIZE;
        let p = os.allocate(size, CHUNK_SIZE).unwrap();
        // Safety: Test code.
        unsafe { os.free(p, size, CHUNK_SIZE).unwrap() };

        // Only the cached region's worth of memory is left.
        os.provider().set_budget(size);
        let q = os.allocate(2 * size, CHUNK_SIZE);
        assert!(q.is_err());
        assert_eq!(os.stats().cached_blocks, 0);

        os.provider().set_budget(2 * size);
        let q = os.allocate(2 * size, CHUNK_SIZE).unwrap();
        // Safety: Test code.
        unsafe { os.free(q, 2 * size, CHUNK_SIZE).unwrap() };
    }

    #[test]
    fn test_retry_succeeds_after_flush() {
        let os = cache(8, 32 * MB);
        let size = 4 * CHUNK_SIZE;
        let p = os.allocate(size, CHUNK_SIZE).unwrap();
        // Safety: Test code.
        unsafe { os.free(p, size, CHUNK_SIZE).unwrap() };

        // Room for the new request only once the cached region is gone.
        os.provider().set_budget(size + CHUNK_SIZE);
        let q = os.allocate(size + CHUNK_SIZE, CHUNK_SIZE).unwrap();
        assert_eq!(os.stats().cached_blocks, 0);
        assert_eq!(os.provider().live_bytes(), size + CHUNK_SIZE);
        // Safety: Test code.
        unsafe { os.free(q, size + CHUNK_SIZE, CHUNK_SIZE).unwrap() };
    }
}
