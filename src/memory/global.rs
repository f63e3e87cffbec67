use std::alloc::{GlobalAlloc, Layout};

use super::binned::BinnedMalloc;
use super::config::MallocConfig;
use super::error::MallocError;
use super::stats::MemoryStats;
use super::vm::OsPageProvider;
use crate::sync::OnceLock;

static GMALLOC: OnceLock<BinnedMalloc> = OnceLock::new();

/// The process-wide allocator.
///
/// Created on first use with [`MallocConfig::default`], or up front with
/// [`init_with_config`](Self::init_with_config).  Install it with
/// `#[global_allocator] static A: GMalloc = GMalloc;`.
///
/// Threads run uncached until they call
/// [`setup_tls_caches_on_current_thread`](Self::setup_tls_caches_on_current_thread).
pub struct GMalloc;

impl GMalloc {
    /// Create the global instance with `config`.
    ///
    /// # Errors
    ///
    /// [`MallocError::AlreadyInitialized`] if the instance exists, including
    /// one created lazily by an earlier allocation; otherwise any error of
    /// [`BinnedMalloc::with_config`].
    pub fn init_with_config(config: MallocConfig) -> Result<(), MallocError> {
        if GMALLOC.get().is_some() {
            return Err(MallocError::AlreadyInitialized);
        }
        let heap = BinnedMalloc::with_config(OsPageProvider::new(), config)?;
        GMALLOC
            .set(heap)
            .map_err(|_| MallocError::AlreadyInitialized)
    }

    /// The global instance, created with defaults if needed.
    ///
    /// # Errors
    ///
    /// Any error of [`BinnedMalloc::new`].
    #[inline]
    pub fn try_get() -> Result<&'static BinnedMalloc, MallocError> {
        if let Some(heap) = GMALLOC.get() {
            return Ok(heap);
        }
        Self::init_default()
    }

    #[cold]
    fn init_default() -> Result<&'static BinnedMalloc, MallocError> {
        // Construction never touches the heap, so racing initialisers are
        // harmless; the loser's instance is dropped.
        let heap = BinnedMalloc::new()?;
        let _ = GMALLOC.set(heap);
        GMALLOC.get().ok_or(MallocError::AlreadyInitialized)
    }

    /// # Panics
    ///
    /// Panics if the global instance cannot be created.
    pub fn get() -> &'static BinnedMalloc {
        match Self::try_get() {
            Ok(heap) => heap,
            Err(e) => panic!("global allocator unavailable: {e}"),
        }
    }

    /// See [`BinnedMalloc::setup_tls_caches_on_current_thread`].
    ///
    /// # Errors
    ///
    /// Fails if the global instance or the cache cannot be created.
    pub fn setup_tls_caches_on_current_thread() -> Result<(), MallocError> {
        Self::try_get()?.setup_tls_caches_on_current_thread()
    }

    /// See [`BinnedMalloc::clear_and_disable_tls_caches_on_current_thread`].
    pub fn clear_and_disable_tls_caches_on_current_thread() {
        if let Some(heap) = GMALLOC.get() {
            heap.clear_and_disable_tls_caches_on_current_thread();
        }
    }

    /// See [`BinnedMalloc::trim`].  Does nothing before first use.
    pub fn trim() -> usize {
        GMALLOC.get().map_or(0, BinnedMalloc::trim)
    }

    pub fn stats() -> Option<MemoryStats> {
        GMALLOC.get().map(BinnedMalloc::stats)
    }
}

// Safety: every pointer handed out is at least `layout.size()` bytes aligned
// to `layout.align()`, and stays valid until passed back to `dealloc` or
// `realloc`.  Failures return null.
unsafe impl GlobalAlloc for GMalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        Self::try_get()
            .and_then(|heap| heap.try_malloc(layout.size(), layout.align()))
            .map_or(std::ptr::null_mut(), |p| p.as_ptr())
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(heap) = GMALLOC.get() {
            // Safety: `ptr` came from `alloc` or `realloc` of this instance.
            unsafe { heap.free(ptr) };
        }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(heap) = GMALLOC.get() else {
            return std::ptr::null_mut();
        };
        // Safety: forwarded `GlobalAlloc::realloc` contract; `new_size` is
        // non-zero.
        unsafe { heap.try_realloc(ptr, new_size, layout.align()) }.unwrap_or(std::ptr::null_mut())
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::thread;

    #[test]
    fn test_gmalloc_lazy_init() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let heap = GMalloc::get();
        assert!(std::ptr::eq(heap, GMalloc::try_get().unwrap()));
        assert!(GMalloc::stats().is_some());
        assert!(matches!(
            GMalloc::init_with_config(MallocConfig::default()),
            Err(MallocError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_gmalloc_global_alloc() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let a = GMalloc;
        for (size, align) in [(1, 1), (24, 8), (100, 64), (5000, 4096), (70_000, 16)] {
            let layout = Layout::from_size_align(size, align).unwrap();
            // Safety: Test code.
            unsafe {
                let p = a.alloc(layout);
                assert!(!p.is_null());
                assert!((p as usize).is_multiple_of(align));
                p.write_bytes(0xAB, size);
                a.dealloc(p, layout);
            }
        }
    }

    #[test]
    fn test_gmalloc_alloc_zeroed() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let a = GMalloc;
        let layout = Layout::from_size_align(512, 16).unwrap();
        // Safety: Test code.
        unsafe {
            // Dirty a block, free it, then ask for zeroed memory of the same class.
            let p = a.alloc(layout);
            p.write_bytes(0xFF, 512);
            a.dealloc(p, layout);
            let z = a.alloc_zeroed(layout);
            assert!((0..512).all(|i| *z.add(i) == 0));
            a.dealloc(z, layout);
        }
    }

    #[test]
    fn test_gmalloc_realloc_grows() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let a = GMalloc;
        let layout = Layout::from_size_align(32, 8).unwrap();
        // Safety: Test code.
        unsafe {
            let p = a.alloc(layout);
            for i in 0..32 {
                p.add(i).write(i as u8);
            }
            let q = a.realloc(p, layout, 100_000);
            assert!(!q.is_null());
            assert!((0..32).all(|i| *q.add(i) == i as u8));
            a.dealloc(q, Layout::from_size_align(100_000, 8).unwrap());
        }
    }

    #[test]
    fn test_gmalloc_tls_threads() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                thread::spawn(move || {
                    GMalloc::setup_tls_caches_on_current_thread().unwrap();
                    let a = GMalloc;
                    let layout = Layout::from_size_align(48 + t * 16, 16).unwrap();
                    let mut live = Vec::new();
                    for _ in 0..500 {
                        // Safety: Test code.
                        let p = unsafe { a.alloc(layout) };
                        assert!(!p.is_null());
                        live.push(p as usize);
                    }
                    for p in live {
                        // Safety: Test code.
                        unsafe { a.dealloc(p as *mut u8, layout) };
                    }
                    if t % 2 == 0 {
                        GMalloc::clear_and_disable_tls_caches_on_current_thread();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(GMalloc::get().validate_heap());
    }
}
