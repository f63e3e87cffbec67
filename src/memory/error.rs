use std::io;

/// Failures reported by a [`PageProvider`](super::vm::PageProvider).
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("OS reservation of {size} bytes failed: {source}")]
    ReservationFailed {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("OS release of {size} bytes failed: {source}")]
    ReleaseFailed {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("invalid OS request: {size} bytes aligned to {align}")]
    InvalidRequest { size: usize, align: usize },
}

/// Errors surfaced by the fallible allocator entry points.
#[derive(Debug, thiserror::Error)]
pub enum MallocError {
    #[error("out of memory allocating {size} bytes (align {align})")]
    OutOfMemory { size: usize, align: usize },
    #[error("alignment {align} is not a power of two")]
    InvalidAlignment { align: usize },
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(String),
    #[error("global allocator already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Os(#[from] VmError),
}

/// Internal invariant violations.  Never recovered from: the engine hands
/// them to the fatal hook along with a heap report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeapCorruption {
    #[error("free block {addr:#x} has canary {found:#04x}, expected {expected:#04x}")]
    BadCanary { addr: usize, found: u8, expected: u8 },
    #[error("pointer {addr:#x} was not allocated by this allocator")]
    UnknownPointer { addr: usize },
    #[error("pointer {addr:#x} is not the start of a {block_size}-byte block")]
    MisalignedBlock { addr: usize, block_size: usize },
    #[error("free run at {addr:#x} lies outside its pool at {base:#x}")]
    RunOutOfBounds { addr: usize, base: usize },
    #[error("pool {base:#x} (class {class}) has {found} free blocks, expected {expected}")]
    FreeCountMismatch {
        base: usize,
        class: usize,
        found: usize,
        expected: usize,
    },
    #[error("pool {base:#x} (class {class}) has a broken list link")]
    BrokenLink { base: usize, class: usize },
}
