/// Allocator-wide minimum alignment; also the smallest block.
pub const MIN_ALIGN: usize = 16;

/// Pools are built from 64 KiB chunks, the granularity of pointer lookup.
pub(crate) const CHUNK_SHIFT: u32 = 16;
pub(crate) const CHUNK_SIZE: usize = 1 << CHUNK_SHIFT;

/// Largest pool a class may use, in chunks.
const MAX_POOL_CHUNKS: usize = 4;

pub const NUM_SIZE_CLASSES: usize = 40;

/// 16 B..128 B in 16-byte steps, then four steps per power of two up to 32 KiB.
pub(crate) const SIZE_CLASSES: [usize; NUM_SIZE_CLASSES] = [
    16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640, 768, 896, 1024,
    1280, 1536, 1792, 2048, 2560, 3072, 3584, 4096, 5120, 6144, 7168, 8192, 10240, 12288, 14336,
    16384, 20480, 24576, 28672, 32768,
];

/// Requests above this (after alignment rounding) go OS-direct.
pub const MAX_POOLED_SIZE: usize = SIZE_CLASSES[NUM_SIZE_CLASSES - 1];

const LUT_LEN: usize = MAX_POOLED_SIZE / MIN_ALIGN + 1;

/// O(1) size-to-class table indexed by `ceil(size / 16)`.
static SIZE_CLASS_LUT: [u8; LUT_LEN] = build_size_class_lut();

const fn build_size_class_lut() -> [u8; LUT_LEN] {
    let mut table = [0u8; LUT_LEN];
    let mut q = 1;
    let mut class = 0;
    while class < NUM_SIZE_CLASSES {
        let class_quanta = SIZE_CLASSES[class] / MIN_ALIGN;
        while q <= class_quanta {
            table[q] = class as u8;
            q += 1;
        }
        class += 1;
    }
    table
}

/// Geometry of one size class's pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SizeClassDescriptor {
    pub block_size: usize,
    /// Bytes per pool; a multiple of [`CHUNK_SIZE`].
    pub pool_size: usize,
    pub blocks_per_pool: u32,
}

impl SizeClassDescriptor {
    /// Pick the pool span (1..=4 chunks) wasting the smallest fraction of
    /// itself; ties go to the smaller pool.
    const fn for_block_size(block_size: usize) -> Self {
        let mut best = 1;
        let mut k = 2;
        while k <= MAX_POOL_CHUNKS {
            let waste_k = (k * CHUNK_SIZE) % block_size;
            let waste_best = (best * CHUNK_SIZE) % block_size;
            if waste_k * best < waste_best * k {
                best = k;
            }
            k += 1;
        }
        let pool_size = best * CHUNK_SIZE;
        Self {
            block_size,
            pool_size,
            blocks_per_pool: (pool_size / block_size) as u32,
        }
    }

    #[inline]
    pub fn chunks(&self) -> usize {
        self.pool_size >> CHUNK_SHIFT
    }
}

pub(crate) static DESCRIPTORS: [SizeClassDescriptor; NUM_SIZE_CLASSES] = build_descriptors();

const fn build_descriptors() -> [SizeClassDescriptor; NUM_SIZE_CLASSES] {
    let mut out = [SizeClassDescriptor {
        block_size: 0,
        pool_size: 0,
        blocks_per_pool: 0,
    }; NUM_SIZE_CLASSES];
    let mut i = 0;
    while i < NUM_SIZE_CLASSES {
        out[i] = SizeClassDescriptor::for_block_size(SIZE_CLASSES[i]);
        i += 1;
    }
    out
}

/// Where a request is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Pooled(usize),
    OsDirect,
}

/// Resolve `(size, align)` to a size class.
///
/// `align` must be a power of two; anything below [`MIN_ALIGN`] is raised to
/// it.  Zero-byte requests take the smallest class so every allocation has
/// a distinct, freeable address.
#[inline]
pub(crate) fn resolve(size: usize, align: usize) -> Route {
    debug_assert!(align == 0 || align.is_power_of_two());
    let align = align.max(MIN_ALIGN);
    if align > MAX_POOLED_SIZE || size > MAX_POOLED_SIZE {
        return Route::OsDirect;
    }
    // Both operands are bounded by MAX_POOLED_SIZE, so no overflow.
    let rounded = (size.max(1) + align - 1) & !(align - 1);
    if rounded > MAX_POOLED_SIZE {
        return Route::OsDirect;
    }
    let mut class = SIZE_CLASS_LUT[rounded.div_ceil(MIN_ALIGN)] as usize;
    // Pool bases are chunk aligned, so a block is `align`-aligned exactly
    // when its size is a multiple of `align`.
    while !SIZE_CLASSES[class].is_multiple_of(align) {
        class += 1;
        if class == NUM_SIZE_CLASSES {
            return Route::OsDirect;
        }
    }
    Route::Pooled(class)
}

/// Usable size of an OS-direct allocation of `size` bytes.
#[inline]
pub(crate) fn os_usable_size(size: usize, page_size: usize) -> Option<usize> {
    size.max(1).checked_next_multiple_of(page_size)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_classes_ascending_and_aligned() {
        for pair in SIZE_CLASSES.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for &size in &SIZE_CLASSES {
            assert!(size.is_multiple_of(MIN_ALIGN));
        }
    }

    #[test]
    fn test_lut_matches_linear_search() {
        for size in 1..=MAX_POOLED_SIZE {
            let expected = SIZE_CLASSES.iter().position(|&c| c >= size).unwrap();
            assert_eq!(resolve(size, 1), Route::Pooled(expected), "size {size}");
        }
    }

    #[test]
    fn test_zero_promoted_to_smallest_class() {
        assert_eq!(resolve(0, 1), Route::Pooled(0));
        assert_eq!(resolve(0, 64), Route::Pooled(3));
    }

    #[test]
    fn test_alignment_rounds_request() {
        assert_eq!(resolve(40, 32), Route::Pooled(3));
        assert_eq!(resolve(1100, 512), Route::Pooled(21));
        assert_eq!(resolve(1, 4096), Route::Pooled(27));
        assert_eq!(resolve(1, 32768), Route::Pooled(39));
    }

    #[test]
    fn test_large_requests_go_os_direct() {
        assert_eq!(resolve(MAX_POOLED_SIZE, 1), Route::Pooled(NUM_SIZE_CLASSES - 1));
        assert_eq!(resolve(MAX_POOLED_SIZE + 1, 1), Route::OsDirect);
        assert_eq!(resolve(16, 65536), Route::OsDirect);
        assert_eq!(resolve(30000, 4096), Route::Pooled(NUM_SIZE_CLASSES - 1));
    }

    #[test]
    fn test_descriptors_fill_pools() {
        for desc in &DESCRIPTORS {
            assert!(desc.pool_size.is_multiple_of(CHUNK_SIZE));
            assert!((1..=MAX_POOL_CHUNKS).contains(&desc.chunks()));
            assert!(desc.blocks_per_pool >= 2);
            assert!(desc.block_size * desc.blocks_per_pool as usize <= desc.pool_size);
        }
        assert_eq!(DESCRIPTORS[0].blocks_per_pool, 4096);
        // 24 KiB blocks tile three chunks exactly.
        assert_eq!(DESCRIPTORS[37].chunks(), 3);
        assert_eq!(DESCRIPTORS[37].blocks_per_pool, 8);
    }

    #[test]
    fn test_os_usable_size_rounds_to_pages() {
        assert_eq!(os_usable_size(40000, 4096), Some(40960));
        assert_eq!(os_usable_size(0, 4096), Some(4096));
        assert_eq!(os_usable_size(usize::MAX, 4096), None);
    }
}
