//! Reference-counted per-resource read/write locks.
//!
//! The [`LockRegistry`] hands out one read/write lock per resource key. Many
//! readers can serve cached bytes concurrently while a writer (a fetch)
//! excludes everyone else for that key. Entries are reference counted and
//! removed as soon as the last holder lets go, so the registry only ever
//! contains keys that are in use.
//!
//! The registry mutex is held only for the lookup and the reference count
//! update. Blocking happens on the per-key lock, outside the registry mutex.
//!
//! # Example
//!
//! ```
//! use repocache::lock::LockRegistry;
//!
//! let registry = LockRegistry::new();
//! {
//!     let lease = registry.acquire("/debian/pool/main/a/a_1.0_all.deb");
//!     let _read = lease.read();
//!     assert_eq!(registry.reference_count("/debian/pool/main/a/a_1.0_all.deb"), 1);
//! }
//! assert!(registry.is_empty());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

/// Lock plus the number of outstanding leases for one key.
#[derive(Debug)]
struct LockEntry {
    lock: Arc<RwLock<()>>,
    references: usize,
}

/// Registry of per-resource read/write locks.
///
/// One instance is shared by every request handler of a process. Tests can
/// create independent registries.
#[derive(Debug, Default)]
pub struct LockRegistry {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl LockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Obtain the lock for `key`, creating the entry on first use.
    ///
    /// The returned lease keeps the entry alive; the key is deregistered
    /// when the lease is dropped (or [`ResourceLease::release`]d).
    pub fn acquire(&self, key: &str) -> ResourceLease<'_> {
        let mut entries = self.entries.lock();

        let entry = entries
            .entry(key.to_string())
            .and_modify(|entry| entry.references += 1)
            .or_insert_with(|| LockEntry {
                lock: Arc::new(RwLock::new(())),
                references: 1,
            });

        ResourceLease {
            registry: self,
            key: key.to_string(),
            lock: Arc::clone(&entry.lock),
        }
    }

    /// Drop one reference to `key`, removing the entry at zero.
    fn release(&self, key: &str) {
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if entry.references > 1 => entry.references -= 1,
            Some(_) => {
                entries.remove(key);
            }
            None => warn!(key, "Released a lock that was never acquired"),
        }
    }

    /// Number of outstanding leases for `key` (0 if absent).
    pub fn reference_count(&self, key: &str) -> usize {
        self.entries
            .lock()
            .get(key)
            .map(|entry| entry.references)
            .unwrap_or(0)
    }

    /// Number of keys currently registered.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no key is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// A registered interest in one resource's lock.
///
/// Read and write guards borrow the lease, so they are always released
/// before the lease deregisters the key.
#[derive(Debug)]
pub struct ResourceLease<'a> {
    registry: &'a LockRegistry,
    key: String,
    lock: Arc<RwLock<()>>,
}

impl ResourceLease<'_> {
    /// The resource key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Block until the shared (read) side is available.
    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Block until the exclusive (write) side is available.
    pub fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }

    /// Deregister this lease explicitly.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ResourceLease<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}
