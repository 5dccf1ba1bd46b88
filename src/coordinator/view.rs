//! Consistent (reader, cache) views

use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::Arc;

use tracing::warn;

use super::CacheCoordinator;
use crate::cache::{CacheEntry, CacheKey, CacheMap};
use crate::error::Result;
use crate::store::{DocumentStore, SnapshotReader};

/// A store snapshot reader paired with the cache map that was live when it
/// was acquired.
///
/// The reader goes back to the store when the handle is dropped or
/// [`released`](ViewHandle::release).
pub struct ViewHandle<'a, S: DocumentStore, Q> {
    coordinator: &'a CacheCoordinator<S, Q>,
    reader: ManuallyDrop<S::Reader>,
    cache: Arc<CacheMap<Q>>,
}

impl<S: DocumentStore, Q> std::fmt::Debug for ViewHandle<'_, S, Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewHandle").finish_non_exhaustive()
    }
}

impl<'a, S: DocumentStore, Q> ViewHandle<'a, S, Q> {
    pub(super) fn new(
        coordinator: &'a CacheCoordinator<S, Q>,
        reader: S::Reader,
        cache: Arc<CacheMap<Q>>,
    ) -> Self {
        Self {
            coordinator,
            reader: ManuallyDrop::new(reader),
            cache,
        }
    }

    /// The snapshot reader
    pub fn reader(&self) -> &S::Reader {
        &self.reader
    }

    /// The cache map paired with the reader
    pub fn cache(&self) -> &Arc<CacheMap<Q>> {
        &self.cache
    }

    /// Look up a cached entry
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry<Q>>> {
        self.cache.get(key)
    }

    /// Commit generation of the reader
    pub fn generation(&self) -> u64 {
        self.reader().generation()
    }

    /// Release the reader now, reporting any store error
    pub fn release(self) -> Result<()> {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so each field is moved out once
        let (reader, cache) =
            unsafe { (ManuallyDrop::take(&mut this.reader), ptr::read(&this.cache)) };
        drop(cache);
        this.coordinator.release_reader(reader)
    }
}

impl<S: DocumentStore, Q> Drop for ViewHandle<'_, S, Q> {
    fn drop(&mut self) {
        // SAFETY: drop runs once and the field is not touched afterwards
        let reader = unsafe { ManuallyDrop::take(&mut self.reader) };
        if let Err(e) = self.coordinator.release_reader(reader) {
            warn!("Failed to release snapshot reader: {}", e);
        }
    }
}
