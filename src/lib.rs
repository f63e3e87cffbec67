#[cfg(not(target_pointer_width = "64"))]
compile_error!("binmalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: implementation details stay pub(crate); TEST_MUTEX is
// shared by the unit tests
pub mod memory;

// allocator
pub use memory::binned::BinnedMalloc;
pub use memory::global::GMalloc;
pub use memory::size_class::{MAX_POOLED_SIZE, MIN_ALIGN, NUM_SIZE_CLASSES};

// configuration
pub use memory::config::{
    FatalHook, LockGranularity, MallocConfig, OutOfMemoryHook, default_fatal, default_out_of_memory,
};

// stats
pub use memory::stats::{ClassReport, HeapReport, MemoryStats};

// OS layer
pub use memory::vm::{OsPageProvider, PageProvider};

// errors
pub use memory::error::{HeapCorruption, MallocError, VmError};
