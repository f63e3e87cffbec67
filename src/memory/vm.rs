use std::ptr::NonNull;

pub use super::error::VmError;

/// Raw page-granular memory source beneath the allocator.
///
/// Implementations must never call back into the allocator they serve.
pub trait PageProvider: Send + Sync {
    /// Map `size` bytes aligned to `align`.
    ///
    /// `size` is a non-zero multiple of [`page_size`](Self::page_size);
    /// `align` is a power of two no smaller than the page size.  Returned
    /// memory is readable, writable and zero-filled.
    fn alloc_from_os(&self, size: usize, align: usize) -> Result<NonNull<u8>, VmError>;

    /// Unmap a region obtained from [`alloc_from_os`](Self::alloc_from_os).
    ///
    /// # Safety
    /// `ptr` and `size` must describe exactly one live region returned by
    /// this provider, and nothing may access it afterwards.
    unsafe fn free_to_os(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size.  Constant for the provider's lifetime.
    fn page_size(&self) -> usize;

    /// Lets a platform keep specific large sizes out of the OS page cache.
    fn has_memory_pool_for_size(&self, _size: usize) -> bool {
        false
    }
}

/// Native virtual-memory provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsPageProvider;

impl OsPageProvider {
    pub const fn new() -> Self {
        Self
    }
}

#[inline]
fn check_request(size: usize, align: usize, page: usize) -> Result<(), VmError> {
    if size == 0 || !align.is_power_of_two() || !size.is_multiple_of(page) {
        return Err(VmError::InvalidRequest { size, align });
    }
    Ok(())
}

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, OsPageProvider, PageProvider, VmError, check_request};
    use std::io;

    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: anonymous private mapping, no aliasing with existing memory.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(VmError::ReservationFailed {
                size,
                source: io::Error::last_os_error(),
            });
        }
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| VmError::ReservationFailed {
            size,
            source: io::Error::other("mmap returned null"),
        })
    }

    unsafe fn unmap(ptr: *mut u8, size: usize) -> Result<(), VmError> {
        if size == 0 {
            return Ok(());
        }
        // Safety: caller passes a page-aligned subrange of a live mapping.
        if unsafe { libc::munmap(ptr.cast::<libc::c_void>(), size) } != 0 {
            return Err(VmError::ReleaseFailed {
                size,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    impl PageProvider for OsPageProvider {
        fn alloc_from_os(&self, size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
            let page = self.page_size();
            check_request(size, align, page)?;
            if align <= page {
                // Safety: size is a non-zero page multiple.
                return unsafe { map(size) };
            }

            // Over-map by `align - page`, then hand the misaligned head and
            // the unused tail back to the kernel.
            let padded = size
                .checked_add(align - page)
                .ok_or(VmError::InvalidRequest { size, align })?;
            // Safety: padded is a non-zero page multiple.
            let raw = unsafe { map(padded)? };
            let start = raw.as_ptr() as usize;
            let aligned = (start + align - 1) & !(align - 1);
            let head = aligned - start;
            let tail = padded - head - size;
            // Safety: both ranges lie inside the fresh mapping and are page
            // aligned because `start`, `aligned` and `size` are.
            unsafe {
                unmap(raw.as_ptr(), head)?;
                unmap((aligned + size) as *mut u8, tail)?;
            }
            NonNull::new(aligned as *mut u8).ok_or(VmError::InvalidRequest { size, align })
        }

        unsafe fn free_to_os(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: forwarded caller contract.
            unsafe { unmap(ptr.as_ptr(), size) }
        }

        fn page_size(&self) -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            if let Some(size) = CACHED.get() {
                return *size;
            }
            // Safety: FFI call to sysconf.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            // This crate supports only 64-bit targets; page size fits in usize.
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let size = if raw > 0 { raw as usize } else { 4096 };
            let _ = CACHED.set(size);
            size
        }
    }
}

#[cfg(all(windows, not(any(loom, miri))))]
mod windows {
    use super::{NonNull, OsPageProvider, PageProvider, VmError, check_request};
    use std::ffi::c_void;
    use std::io;

    const MEM_COMMIT: u32 = 0x0000_1000;
    const MEM_RESERVE: u32 = 0x0000_2000;
    const MEM_RELEASE: u32 = 0x0000_8000;
    const PAGE_READWRITE: u32 = 0x04;
    /// Attempts at landing an aligned placement before giving up.
    const ALIGN_RETRIES: usize = 8;

    #[repr(C)]
    struct SystemInfo {
        processor_architecture: u16,
        reserved: u16,
        page_size: u32,
        minimum_application_address: *mut c_void,
        maximum_application_address: *mut c_void,
        active_processor_mask: usize,
        number_of_processors: u32,
        processor_type: u32,
        allocation_granularity: u32,
        processor_level: u16,
        processor_revision: u16,
    }

    unsafe extern "system" {
        fn VirtualAlloc(addr: *mut c_void, size: usize, kind: u32, protect: u32) -> *mut c_void;
        fn VirtualFree(addr: *mut c_void, size: usize, kind: u32) -> i32;
        fn GetSystemInfo(info: *mut SystemInfo);
    }

    fn reserve_commit(addr: *mut c_void, size: usize) -> *mut u8 {
        // Safety: FFI call; a null or unavailable `addr` yields null.
        unsafe { VirtualAlloc(addr, size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE).cast::<u8>() }
    }

    fn release(ptr: *mut u8, size: usize) -> Result<(), VmError> {
        // MEM_RELEASE requires size 0 and the region's base address.
        // Safety: FFI call on a region base returned by VirtualAlloc.
        if unsafe { VirtualFree(ptr.cast::<c_void>(), 0, MEM_RELEASE) } == 0 {
            return Err(VmError::ReleaseFailed {
                size,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    impl PageProvider for OsPageProvider {
        fn alloc_from_os(&self, size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
            check_request(size, align, self.page_size())?;
            let ptr = reserve_commit(std::ptr::null_mut(), size);
            if ptr.is_null() {
                return Err(VmError::ReservationFailed {
                    size,
                    source: io::Error::last_os_error(),
                });
            }
            if (ptr as usize).is_multiple_of(align) {
                return NonNull::new(ptr).ok_or(VmError::InvalidRequest { size, align });
            }
            release(ptr, size)?;

            // Windows cannot trim a reservation, so probe an oversized range
            // for an aligned address, release it, and claim the aligned part.
            let padded = size
                .checked_add(align)
                .ok_or(VmError::InvalidRequest { size, align })?;
            for _ in 0..ALIGN_RETRIES {
                let probe = reserve_commit(std::ptr::null_mut(), padded);
                if probe.is_null() {
                    break;
                }
                let aligned = ((probe as usize) + align - 1) & !(align - 1);
                release(probe, padded)?;
                let ptr = reserve_commit(aligned as *mut c_void, size);
                if let Some(p) = NonNull::new(ptr) {
                    return Ok(p);
                }
            }
            Err(VmError::ReservationFailed {
                size,
                source: io::Error::last_os_error(),
            })
        }

        unsafe fn free_to_os(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            release(ptr.as_ptr(), size)
        }

        fn page_size(&self) -> usize {
            use crate::sync::OnceLock;
            static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
            if let Some(size) = PAGE_SIZE.get() {
                return *size;
            }
            // Safety: SystemInfo is plain data; GetSystemInfo fills it in.
            let size = unsafe {
                let mut info: SystemInfo = std::mem::zeroed();
                GetSystemInfo(&mut info);
                info.page_size as usize
            };
            let _ = PAGE_SIZE.set(size);
            size
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed provider for loom and Miri
//
// Neither can issue real VM syscalls.  Every "mapping" is a zeroed heap block
// with a fixed alignment, which is enough to exercise the allocator's
// synchronization and pointer logic.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
const MOCK_ALIGN: usize = 64 * 1024;

#[cfg(any(loom, miri))]
impl PageProvider for OsPageProvider {
    fn alloc_from_os(&self, size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        check_request(size, align, self.page_size())?;
        if align > MOCK_ALIGN {
            return Err(VmError::InvalidRequest { size, align });
        }
        let layout = std::alloc::Layout::from_size_align(size, MOCK_ALIGN)
            .map_err(|_| VmError::InvalidRequest { size, align })?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| VmError::ReservationFailed {
            size,
            source: std::io::Error::new(std::io::ErrorKind::OutOfMemory, "alloc returned null"),
        })
    }

    unsafe fn free_to_os(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, MOCK_ALIGN).map_err(|_| {
            VmError::InvalidRequest {
                size,
                align: MOCK_ALIGN,
            }
        })?;
        // Safety: ptr was allocated with the same layout in `alloc_from_os`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size(&self) -> usize {
        4096
    }
}

/// Instrumented providers for tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::{NonNull, OsPageProvider, PageProvider, VmError};
    use crate::sync::atomic::{AtomicUsize, Ordering};

    /// Forwards to the OS provider while tracking live bytes and calls.
    /// An optional byte budget makes it fail like an exhausted machine.
    pub(crate) struct CountingPageProvider {
        inner: OsPageProvider,
        live_bytes: AtomicUsize,
        allocs: AtomicUsize,
        frees: AtomicUsize,
        budget: AtomicUsize,
        pooled_size: AtomicUsize,
    }

    impl CountingPageProvider {
        pub(crate) fn new() -> Self {
            Self::with_budget(usize::MAX)
        }

        pub(crate) fn with_budget(budget: usize) -> Self {
            Self {
                inner: OsPageProvider::new(),
                live_bytes: AtomicUsize::new(0),
                allocs: AtomicUsize::new(0),
                frees: AtomicUsize::new(0),
                budget: AtomicUsize::new(budget),
                pooled_size: AtomicUsize::new(0),
            }
        }

        pub(crate) fn live_bytes(&self) -> usize {
            self.live_bytes.load(Ordering::SeqCst)
        }

        pub(crate) fn allocs(&self) -> usize {
            self.allocs.load(Ordering::SeqCst)
        }

        pub(crate) fn frees(&self) -> usize {
            self.frees.load(Ordering::SeqCst)
        }

        pub(crate) fn set_budget(&self, budget: usize) {
            self.budget.store(budget, Ordering::SeqCst);
        }

        /// Report a platform memory pool for exactly this size.
        pub(crate) fn set_pooled_size(&self, size: usize) {
            self.pooled_size.store(size, Ordering::SeqCst);
        }
    }

    impl PageProvider for CountingPageProvider {
        fn alloc_from_os(&self, size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
            let live = self.live_bytes.load(Ordering::SeqCst);
            if live.saturating_add(size) > self.budget.load(Ordering::SeqCst) {
                return Err(VmError::ReservationFailed {
                    size,
                    source: std::io::Error::new(
                        std::io::ErrorKind::OutOfMemory,
                        "test budget exhausted",
                    ),
                });
            }
            let ptr = self.inner.alloc_from_os(size, align)?;
            self.live_bytes.fetch_add(size, Ordering::SeqCst);
            self.allocs.fetch_add(1, Ordering::SeqCst);
            Ok(ptr)
        }

        unsafe fn free_to_os(&self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: forwarded caller contract.
            unsafe { self.inner.free_to_os(ptr, size)? };
            self.live_bytes.fetch_sub(size, Ordering::SeqCst);
            self.frees.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn page_size(&self) -> usize {
            self.inner.page_size()
        }

        fn has_memory_pool_for_size(&self, size: usize) -> bool {
            size == self.pooled_size.load(Ordering::SeqCst)
        }
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let page = OsPageProvider.page_size();
        assert!(page.is_power_of_two());
        assert!(page >= 4096);
    }

    #[test]
    fn test_alloc_write_free() {
        let os = OsPageProvider;
        let size = os.page_size() * 4;
        let ptr = os.alloc_from_os(size, os.page_size()).expect("alloc failed");
        // Safety: Test code.
        unsafe {
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            assert!(slice.iter().all(|&b| b == 0), "fresh pages must be zeroed");
            slice[0] = 42;
            slice[size - 1] = 7;
            assert_eq!(slice[0], 42);
            os.free_to_os(ptr, size).expect("free failed");
        }
    }

    #[test]
    fn test_over_aligned_alloc() {
        let os = OsPageProvider;
        for align in [64 * 1024, 1024 * 1024, 4 * 1024 * 1024] {
            let size = os.page_size() * 3;
            let ptr = os.alloc_from_os(size, align).expect("aligned alloc failed");
            assert!((ptr.as_ptr() as usize).is_multiple_of(align));
            // Safety: Test code.
            unsafe {
                ptr.as_ptr().add(size - 1).write(1);
                os.free_to_os(ptr, size).expect("free failed");
            }
        }
    }

    #[test]
    fn test_rejects_bad_requests() {
        let os = OsPageProvider;
        let page = os.page_size();
        assert!(matches!(
            os.alloc_from_os(0, page),
            Err(VmError::InvalidRequest { .. })
        ));
        assert!(matches!(
            os.alloc_from_os(page + 1, page),
            Err(VmError::InvalidRequest { .. })
        ));
        assert!(matches!(
            os.alloc_from_os(page, 3 * page),
            Err(VmError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_counting_provider_budget() {
        let provider = testing::CountingPageProvider::with_budget(64 * 1024);
        let page = provider.page_size();
        let a = provider.alloc_from_os(64 * 1024, page).expect("within budget");
        assert_eq!(provider.live_bytes(), 64 * 1024);
        assert!(provider.alloc_from_os(page, page).is_err());
        // Safety: Test code.
        unsafe { provider.free_to_os(a, 64 * 1024).unwrap() };
        assert_eq!(provider.live_bytes(), 0);
        assert_eq!(provider.allocs(), 1);
        assert_eq!(provider.frees(), 1);
    }
}
