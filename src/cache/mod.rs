//! A concurrent, bounded-capacity LRU object cache (spec §4.3/§4.4).
//!
//! [`Cache`] is the public surface: `new`, [`Cache::read`] and
//! [`Cache::write`], matching spec §6.2's three operations (`init` folds into
//! the constructor, as it does for [`crate::alloc::Allocator`]). Internally
//! it pairs an entry [`entry::Store`] with the readers-preferring
//! [`sync::CacheSync`] protocol from [`sync`].

mod entry;
mod sync;

use std::cell::UnsafeCell;

use thiserror::Error;

use entry::Store;
use sync::CacheSync;

/// Why a [`Cache::write`] was rejected (spec §4.3's admission algorithm,
/// "REJECT" outcomes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The object is larger than the cache's configured per-object ceiling
    /// and can never be admitted regardless of eviction.
    #[error("object of {size} bytes exceeds the cache's max_object_size of {max}")]
    TooLarge { size: usize, max: usize },
    /// The object does not fit even in a completely empty cache of this
    /// `total_capacity`, so no amount of eviction would admit it.
    #[error("object of {size} bytes does not fit even in an empty cache of capacity {capacity}")]
    ExceedsCapacity { size: usize, capacity: usize },
}

/// A bounded-capacity, concurrently-accessible LRU cache keyed by
/// `(host, uri)` pairs, as spec §4.3/§4.4 describe for a caching HTTP
/// forward proxy.
///
/// Readers ([`Cache::read`]) may run concurrently with each other; a writer
/// ([`Cache::write`]) excludes all readers and all other writers. The
/// synchronization is the explicit two-mutex/reader-count protocol in
/// [`sync::CacheSync`], not [`std::sync::RwLock`] (see that module's docs for
/// why). Because that protocol lives outside the type system's view of
/// aliasing, the store itself is held behind an [`UnsafeCell`] and exposed
/// to each guarded closure as `&Store` or `&mut Store` by hand; every such
/// `unsafe` block is paired with a comment tying it back to the specific
/// protocol guarantee it relies on.
pub struct Cache {
    sync: CacheSync,
    store: UnsafeCell<Store>,
    max_object_size: usize,
}

// SAFETY: all access to `store` is mediated by `sync`, which guarantees
// readers-exclusive-of-writer and writer-exclusive-of-everyone access the
// same way `std::sync::RwLock` would; `Store` itself is `Send` (plain owned
// data, no interior `Rc`/raw pointers), so sharing a `Cache` across threads
// is sound.
unsafe impl Sync for Cache {}
unsafe impl Send for Cache {}

impl Cache {
    /// Build an empty cache with `total_capacity` bytes of payload budget
    /// and a `max_object_size` ceiling on any single entry (spec §4.3).
    pub fn new(total_capacity: usize, max_object_size: usize) -> Self {
        Self {
            sync: CacheSync::new(),
            store: UnsafeCell::new(Store::new(total_capacity)),
            max_object_size,
        }
    }

    pub fn total_capacity(&self) -> usize {
        self.sync.begin_read();
        // SAFETY: read access guarded by `sync`; no writer can be active
        // while any reader (this one) holds the read lock.
        let cap = unsafe { &*self.store.get() }.total_capacity();
        self.sync.end_read();
        cap
    }

    pub fn remaining_space(&self) -> usize {
        self.sync.begin_read();
        // SAFETY: see `total_capacity`.
        let rem = unsafe { &*self.store.get() }.remaining_space();
        self.sync.end_read();
        rem
    }

    /// Look up `(host, uri)`. On a hit, copies the cached bytes into the
    /// caller-supplied buffer and returns the number of bytes written; on a
    /// miss, returns `None` and touches nothing (spec §4.3's `MISS`
    /// sentinel, resolved as `Option::None` per spec §9).
    ///
    /// `out` must be at least as long as the cached payload; callers that
    /// don't know the size up front should size it to `max_object_size`.
    ///
    /// A hit additionally promotes the entry to most-recently-used. Spec §9
    /// leaves open what happens if the entry is evicted between the read
    /// phase and the promotion phase (a second writer can race in between,
    /// since the reader lock is released first); this resolves it as
    /// re-finding the entry under the write lock and silently skipping
    /// promotion if it is gone, rather than re-inserting it -- a
    /// promotion is a no-op for an object that no longer exists, it is not
    /// an obligation to bring it back.
    pub fn read(&self, host: &str, uri: &str, out: &mut [u8]) -> Option<usize> {
        self.sync.begin_read();
        // SAFETY: read access guarded by `sync`.
        let store = unsafe { &*self.store.get() };
        let found = store.find(host, uri);
        let copied = found.map(|idx| {
            let payload = store.payload(idx);
            out[..payload.len()].copy_from_slice(payload);
            payload.len()
        });
        self.sync.end_read();

        if found.is_some() {
            self.promote_after_read(host, uri);
        }
        copied
    }

    fn promote_after_read(&self, host: &str, uri: &str) {
        self.sync.begin_write();
        // SAFETY: write access guarded by `sync`; exclusive of all readers
        // and other writers.
        let store = unsafe { &mut *self.store.get() };
        if let Some(idx) = store.find(host, uri) {
            store.promote(idx);
        }
        self.sync.end_write();
    }

    /// Insert or replace the cached bytes for `(host, uri)`, per spec
    /// §4.3's admission algorithm: reject outright if `bytes` exceeds
    /// `max_object_size`; otherwise evict least-recently-used entries until
    /// there is enough `remaining_space`, then insert as most-recently-used.
    ///
    /// Re-writing an existing key replaces its payload and promotes it
    /// (spec §9: last write wins, not an error).
    pub fn write(&self, host: &str, uri: &str, bytes: &[u8]) -> Result<(), CacheError> {
        if bytes.len() > self.max_object_size {
            return Err(CacheError::TooLarge { size: bytes.len(), max: self.max_object_size });
        }

        self.sync.begin_write();
        // SAFETY: write access guarded by `sync`.
        let store = unsafe { &mut *self.store.get() };
        let result = Self::admit(store, host, uri, bytes);
        self.sync.end_write();
        result
    }

    fn admit(store: &mut Store, host: &str, uri: &str, bytes: &[u8]) -> Result<(), CacheError> {
        if bytes.len() > store.total_capacity() {
            return Err(CacheError::ExceedsCapacity {
                size: bytes.len(),
                capacity: store.total_capacity(),
            });
        }

        // Remove any existing entry for this key up front rather than
        // carrying its size as a credit through the eviction loop below:
        // with the old entry already gone, `remaining_space` is the one and
        // only source of truth for how much room is left, so the loop below
        // never needs to reason about an entry that hasn't been evicted yet.
        store.remove_key(host, uri);

        while bytes.len() > store.remaining_space() {
            if !store.evict_lru() {
                return Err(CacheError::ExceedsCapacity {
                    size: bytes.len(),
                    capacity: store.total_capacity(),
                });
            }
        }

        store.insert_mru(host, uri, bytes);
        Ok(())
    }
}
