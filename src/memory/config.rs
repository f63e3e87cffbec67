use super::error::MallocError;
use super::os_cache::MAX_CACHED_OS_BLOCKS;

/// Which locks guard the size-class pools and the reverse-lookup table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockGranularity {
    /// One allocator-wide mutex serialises every pool and table mutation.
    Coarse,
    /// One mutex per size class plus a short-held table mutex.
    #[default]
    FineGrained,
}

/// Invoked when the page provider cannot satisfy a request.
/// Receives the requested `(size, align)` and must not return.
pub type OutOfMemoryHook = fn(usize, usize) -> !;

/// Invoked once the allocator finds its own state unusable, with a message
/// that embeds the heap report.  Must not return.
pub type FatalHook = fn(&str) -> !;

/// Allocator tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct MallocConfig {
    pub lock_granularity: LockGranularity,
    /// Per-thread bundle cap, in blocks.
    pub bundle_max_count: u32,
    /// Per-thread bundle cap, in bytes.
    pub bundle_max_bytes: usize,
    /// Blocks pulled from a pool per locked refill, by block-size tier:
    /// <= 128 B, <= 1 KiB, <= 4 KiB, larger.
    pub refill_counts: [u32; 4],
    /// Bundles parked per size class in the global recycler.
    pub recycler_max_bundles: u32,
    /// Entries held by the OS page cache (at most 64).
    pub os_cache_max_entries: usize,
    /// Bytes held by the OS page cache.  Requests above a quarter of this
    /// bypass the cache.
    pub os_cache_max_bytes: usize,
    /// Times a failed OS request flushes the page cache and retries.
    pub oom_retries: u32,
    pub out_of_memory: OutOfMemoryHook,
    pub fatal: FatalHook,
}

impl Default for MallocConfig {
    fn default() -> Self {
        Self {
            lock_granularity: LockGranularity::FineGrained,
            bundle_max_count: 64,
            bundle_max_bytes: 8192,
            refill_counts: [16, 8, 4, 2],
            recycler_max_bundles: 16,
            os_cache_max_entries: MAX_CACHED_OS_BLOCKS,
            os_cache_max_bytes: 32 * 1024 * 1024,
            oom_retries: 1,
            out_of_memory: default_out_of_memory,
            fatal: default_fatal,
        }
    }
}

impl MallocConfig {
    /// Reject settings the engine cannot honour.
    ///
    /// # Errors
    ///
    /// Returns [`MallocError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), MallocError> {
        if self.bundle_max_count == 0 {
            return Err(MallocError::InvalidConfig(
                "bundle_max_count must be non-zero".to_string(),
            ));
        }
        if self.bundle_max_bytes == 0 {
            return Err(MallocError::InvalidConfig(
                "bundle_max_bytes must be non-zero".to_string(),
            ));
        }
        if self.refill_counts.contains(&0) {
            return Err(MallocError::InvalidConfig(format!(
                "refill_counts must all be non-zero, got {:?}",
                self.refill_counts
            )));
        }
        if self.os_cache_max_entries > MAX_CACHED_OS_BLOCKS {
            return Err(MallocError::InvalidConfig(format!(
                "os_cache_max_entries {} exceeds capacity {MAX_CACHED_OS_BLOCKS}",
                self.os_cache_max_entries
            )));
        }
        Ok(())
    }

    /// Blocks moved per locked refill for `block_size`, clamped so one
    /// refill never exceeds a bundle.
    pub(crate) fn refill_count_for(&self, block_size: usize) -> u32 {
        let tier = match block_size {
            0..=128 => self.refill_counts[0],
            129..=1024 => self.refill_counts[1],
            1025..=4096 => self.refill_counts[2],
            _ => self.refill_counts[3],
        };
        let by_bytes = u32::try_from(self.bundle_max_bytes / block_size.max(1)).unwrap_or(u32::MAX);
        tier.min(self.bundle_max_count).min(by_bytes).max(1)
    }
}

/// Default out-of-memory hook: hand over to the standard allocation error
/// handler, which aborts the process.
pub fn default_out_of_memory(size: usize, align: usize) -> ! {
    match std::alloc::Layout::from_size_align(size, align.max(1)) {
        Ok(layout) => std::alloc::handle_alloc_error(layout),
        Err(_) => std::process::abort(),
    }
}

/// Default fatal hook.  The message has already been logged; unwinding
/// out of an allocator is not allowed, so the process stops here.
pub fn default_fatal(_message: &str) -> ! {
    std::process::abort()
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MallocConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lock_granularity, LockGranularity::FineGrained);
        assert_eq!(config.oom_retries, 1);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = MallocConfig {
            bundle_max_count: 0,
            ..MallocConfig::default()
        };
        assert!(matches!(config.validate(), Err(MallocError::InvalidConfig(_))));

        let config = MallocConfig {
            refill_counts: [16, 0, 4, 2],
            ..MallocConfig::default()
        };
        assert!(matches!(config.validate(), Err(MallocError::InvalidConfig(_))));

        let config = MallocConfig {
            os_cache_max_entries: MAX_CACHED_OS_BLOCKS + 1,
            ..MallocConfig::default()
        };
        assert!(matches!(config.validate(), Err(MallocError::InvalidConfig(_))));
    }

    #[test]
    fn test_refill_count_tiers() {
        let config = MallocConfig::default();
        assert_eq!(config.refill_count_for(16), 16);
        assert_eq!(config.refill_count_for(512), 8);
        assert_eq!(config.refill_count_for(4096), 2); // 8192 / 4096 bytes cap
        assert_eq!(config.refill_count_for(2048), 4);
        assert_eq!(config.refill_count_for(32768), 1);
    }
}
