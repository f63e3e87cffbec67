use super::config::LockGranularity;
use super::size_class::NUM_SIZE_CLASSES;
use crate::sync::{Mutex, MutexGuard, lock};

/// Which mutex guards which piece of shared allocator state.
///
/// Lock order: size class, then table, then the OS page cache (internal to
/// it).  Nothing is acquired while the table lock is held except the cache.
pub(crate) trait LockPolicy: Send + Sync {
    /// Guards a size class's pool lists and pool heads.
    fn class_lock(&self, class: usize) -> &Mutex<()>;

    /// Guards bucket creation in the lookup table when no class lock is
    /// held (OS-direct path).
    fn table_lock(&self) -> &Mutex<()>;

    /// Guards bucket creation from inside a class lock.  `None` when the
    /// class lock already covers it.
    fn nested_table_lock(&self) -> Option<&Mutex<()>>;
}

/// A single allocator-wide mutex.
pub(crate) struct CoarseLock {
    global: Mutex<()>,
}

impl CoarseLock {
    pub fn new() -> Self {
        Self {
            global: Mutex::new(()),
        }
    }
}

impl LockPolicy for CoarseLock {
    fn class_lock(&self, _class: usize) -> &Mutex<()> {
        &self.global
    }

    fn table_lock(&self) -> &Mutex<()> {
        &self.global
    }

    fn nested_table_lock(&self) -> Option<&Mutex<()>> {
        None
    }
}

/// One mutex per size class plus a short-held table mutex.
pub(crate) struct FineGrainedLocks {
    classes: [Mutex<()>; NUM_SIZE_CLASSES],
    table: Mutex<()>,
}

impl FineGrainedLocks {
    pub fn new() -> Self {
        Self {
            classes: std::array::from_fn(|_| Mutex::new(())),
            table: Mutex::new(()),
        }
    }
}

impl LockPolicy for FineGrainedLocks {
    fn class_lock(&self, class: usize) -> &Mutex<()> {
        &self.classes[class]
    }

    fn table_lock(&self) -> &Mutex<()> {
        &self.table
    }

    fn nested_table_lock(&self) -> Option<&Mutex<()>> {
        Some(&self.table)
    }
}

/// Policy chosen at construction, so one binary can run either.
pub(crate) enum LockSet {
    Coarse(CoarseLock),
    FineGrained(FineGrainedLocks),
}

impl LockSet {
    pub fn new(granularity: LockGranularity) -> Self {
        match granularity {
            LockGranularity::Coarse => Self::Coarse(CoarseLock::new()),
            LockGranularity::FineGrained => Self::FineGrained(FineGrainedLocks::new()),
        }
    }

    #[inline]
    fn policy(&self) -> &dyn LockPolicy {
        match self {
            Self::Coarse(l) => l,
            Self::FineGrained(l) => l,
        }
    }

    #[inline]
    pub fn lock_class(&self, class: usize) -> MutexGuard<'_, ()> {
        lock(self.policy().class_lock(class))
    }

    #[inline]
    pub fn lock_table(&self) -> MutexGuard<'_, ()> {
        lock(self.policy().table_lock())
    }

    /// Take the table lock from inside a class lock, if the policy needs it.
    #[inline]
    pub fn lock_table_nested(&self) -> Option<MutexGuard<'_, ()>> {
        self.policy().nested_table_lock().map(lock)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_coarse_shares_one_mutex() {
        let locks = CoarseLock::new();
        assert!(std::ptr::eq(locks.class_lock(0), locks.class_lock(39)));
        assert!(std::ptr::eq(locks.class_lock(5), locks.table_lock()));
        assert!(locks.nested_table_lock().is_none());
    }

    #[test]
    fn test_fine_grained_classes_independent() {
        let locks = LockSet::new(LockGranularity::FineGrained);
        let _a = locks.lock_class(0);
        // A different class and the table stay available.
        let _b = locks.lock_class(1);
        let nested = locks.lock_table_nested();
        assert!(nested.is_some());
    }

    #[test]
    fn test_coarse_nested_table_is_free() {
        let locks = LockSet::new(LockGranularity::Coarse);
        let _class = locks.lock_class(7);
        // Would self-deadlock if the coarse policy re-locked here.
        assert!(locks.lock_table_nested().is_none());
    }
}
