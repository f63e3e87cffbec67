pub(crate) mod binned;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod free_block;
pub(crate) mod global;
pub(crate) mod locks;
pub(crate) mod lookup;
pub(crate) mod os_cache;
pub(crate) mod pool;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod thread_cache;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
