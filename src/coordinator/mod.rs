//! Cache Coordinator
//!
//! Keeps the in-memory query cache coherent with the document store while
//! writers commit, readers search and a background purge rebuilds the cache.
//!
//! # Locking
//!
//! ```text
//!                    commit_lock (Mutex)        state (RwLock)
//! commit()           ── held ──────────────────  shared
//! acquire_view()                                 shared
//! rebuild() open                                 exclusive (brief)
//! rebuild() scan                                 none
//! rebuild() swap                                 exclusive (brief)
//! ```
//!
//! While a rebuild is collecting, every commit mirrors its entries into the
//! overflow buffer. The swap merges that buffer over the freshly scanned map,
//! so nothing committed during the scan is lost.

mod config;
mod rebuild;
mod view;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheEntry, CacheMap, CoordinatorMetrics, LatencyTracker, MetricsSnapshot};
use crate::error::{Error, Result};
use crate::store::{Document, DocumentStore, MemoryStore, Term};

pub use config::{CoordinatorConfig, RebuildMode};
pub use rebuild::{RebuildPhase, RebuildPopulator, RebuildReport};
pub use view::ViewHandle;

use rebuild::RebuildState;

// =============================================================================
// Updates
// =============================================================================

/// A store document and its cache entry, committed as a unit
#[derive(Debug, Clone)]
pub struct PendingUpdate<Q> {
    /// Logical id of the query this update belongs to. One id may produce
    /// several updates.
    pub id: String,
    /// Document to index
    pub document: Document,
    /// Entry to cache
    pub entry: CacheEntry<Q>,
}

impl<Q> PendingUpdate<Q> {
    pub fn new(id: impl Into<String>, document: Document, entry: CacheEntry<Q>) -> Self {
        Self {
            id: id.into(),
            document,
            entry,
        }
    }
}

/// Point-in-time view of coordinator state
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub cache_size: usize,
    pub num_docs: usize,
    pub num_pending_docs: usize,
    pub rebuild_phase: RebuildPhase,
    pub closed: bool,
    pub metrics: MetricsSnapshot,
}

/// State guarded by the coordination lock
struct CoordinatorState<Q> {
    /// Live cache; replaced on swap, never cleared
    live: Arc<CacheMap<Q>>,
    rebuild: RebuildState<Q>,
}

// =============================================================================
// Coordinator
// =============================================================================

/// Owns a document store and the query cache derived from it
pub struct CacheCoordinator<S: DocumentStore, Q> {
    store: S,
    config: CoordinatorConfig,
    state: RwLock<CoordinatorState<Q>>,
    /// Serializes commits
    commit_lock: Mutex<()>,
    /// Single-flight slot for rebuilds
    rebuild_lock: Mutex<()>,
    closed: AtomicBool,
    metrics: CoordinatorMetrics,
}

impl<S: DocumentStore, Q> std::fmt::Debug for CacheCoordinator<S, Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<Q> CacheCoordinator<MemoryStore, Q> {
    /// Create a coordinator over a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }
}

impl<S: DocumentStore, Q> CacheCoordinator<S, Q> {
    /// Create a coordinator with default configuration
    pub fn new(store: S) -> Self {
        Self::build(CoordinatorConfig::default(), store)
    }

    /// Create a coordinator with custom configuration
    pub fn with_config(config: CoordinatorConfig, store: S) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, store))
    }

    fn build(config: CoordinatorConfig, store: S) -> Self {
        Self {
            store,
            config,
            state: RwLock::new(CoordinatorState {
                live: Arc::new(CacheMap::new()),
                rebuild: RebuildState::Idle,
            }),
            commit_lock: Mutex::new(()),
            rebuild_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            metrics: CoordinatorMetrics::new(),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Commit a batch of updates.
    ///
    /// Every existing document whose `delete_field` equals one of the batch's
    /// ids is deleted first, so a re-commit supersedes the previous version of
    /// a query. An empty batch still commits and refreshes the store.
    ///
    /// The superseded version's cache entry is not removed here; it stays in
    /// the live map until the next rebuild drops it. Likewise, if the store
    /// fails part way, cache entries already inserted linger until then.
    #[instrument(skip(self, updates), fields(updates = updates.len()))]
    pub fn commit(&self, updates: Vec<PendingUpdate<Q>>, delete_field: &str) -> Result<()> {
        self.ensure_open()?;
        let tracker = LatencyTracker::start();

        let _commit = self.commit_lock.lock();
        self.ensure_open()?;

        let state = self.state.read();
        let result = self.apply_updates(&state, updates, delete_field);
        drop(state);

        match result {
            Ok((applied, mirrored)) => {
                self.metrics
                    .record_commit(applied, mirrored, tracker.elapsed());
                debug!(applied, mirrored, "Commit complete");
                Ok(())
            }
            Err(e) => {
                self.metrics.record_commit_failure();
                warn!("Commit failed: {}", e);
                Err(e)
            }
        }
    }

    /// Commit using the configured default delete field
    pub fn apply(&self, updates: Vec<PendingUpdate<Q>>) -> Result<()> {
        self.commit(updates, &self.config.default_delete_field)
    }

    fn apply_updates(
        &self,
        state: &CoordinatorState<Q>,
        updates: Vec<PendingUpdate<Q>>,
        delete_field: &str,
    ) -> Result<(usize, usize)> {
        let ids: HashSet<&str> = updates.iter().map(|u| u.id.as_str()).collect();
        for id in ids {
            self.store.delete_documents(&Term::new(delete_field, id))?;
        }

        let overflow = state.rebuild.overflow();
        let applied = updates.len();
        let mut mirrored = 0;

        for update in updates {
            let entry = Arc::new(update.entry);
            state.live.insert_shared(Arc::clone(&entry));
            self.store.add_document(update.document)?;
            if let Some(overflow) = overflow {
                overflow.insert_shared(entry);
                mirrored += 1;
            }
        }

        self.store.commit()?;
        self.store.maybe_refresh()?;
        Ok((applied, mirrored))
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// Hand the live cache map to `consumer` and open a store reader, both
    /// under the shared coordination lock so no swap can fall between them.
    ///
    /// `consumer` runs while the lock is held and must not call back into
    /// the coordinator; a queued rebuild would deadlock it.
    ///
    /// The returned handle releases the reader when dropped.
    pub fn acquire_view<F>(&self, consumer: F) -> Result<ViewHandle<'_, S, Q>>
    where
        F: FnOnce(&Arc<CacheMap<Q>>),
    {
        self.ensure_open()?;

        let state = self.state.read();
        consumer(&state.live);
        let cache = Arc::clone(&state.live);
        let reader = self.store.acquire_reader()?;
        drop(state);

        self.metrics.record_view_acquired();
        Ok(ViewHandle::new(self, reader, cache))
    }

    /// Acquire a view without a consumer; the cache is on the handle
    pub fn view(&self) -> Result<ViewHandle<'_, S, Q>> {
        self.acquire_view(|_| {})
    }

    /// Release a view, reporting any store error
    pub fn release(&self, view: ViewHandle<'_, S, Q>) -> Result<()> {
        view.release()
    }

    fn release_reader(&self, reader: S::Reader) -> Result<()> {
        self.metrics.record_view_released();
        self.store.release_reader(reader)
    }

    // =========================================================================
    // Store proxies
    // =========================================================================

    /// Buffer deletion of documents carrying `term`; visible after the next
    /// commit. Cache entries are left for the next rebuild to drop.
    pub fn delete_documents(&self, term: &Term) -> Result<usize> {
        self.ensure_open()?;
        self.store.delete_documents(term)
    }

    /// Buffer deletion of documents the predicate accepts
    pub fn delete_matching(&self, predicate: &dyn Fn(&Document) -> bool) -> Result<usize> {
        self.ensure_open()?;
        self.store.delete_matching(predicate)
    }

    pub fn num_docs(&self) -> usize {
        self.store.num_docs()
    }

    pub fn num_pending_docs(&self) -> usize {
        self.store.num_pending()
    }

    /// Number of entries in the live cache
    pub fn cache_size(&self) -> usize {
        self.state.read().live.len()
    }

    /// Current live cache map
    pub fn cache(&self) -> Arc<CacheMap<Q>> {
        Arc::clone(&self.state.read().live)
    }

    pub fn rebuild_phase(&self) -> RebuildPhase {
        self.state.read().rebuild.phase()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CoordinatorMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> CoordinatorStats {
        let (cache_size, rebuild_phase) = {
            let state = self.state.read();
            (state.live.len(), state.rebuild.phase())
        };
        CoordinatorStats {
            cache_size,
            num_docs: self.num_docs(),
            num_pending_docs: self.num_pending_docs(),
            rebuild_phase,
            closed: self.is_closed(),
            metrics: self.metrics.snapshot(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shut down: reject new work, wait for the running commit and rebuild,
    /// then close the store. Store errors are logged, not returned.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing cache coordinator");

        // Rebuild first: a populator may commit while holding its slot
        let _rebuild = self.rebuild_lock.lock();
        let _commit = self.commit_lock.lock();

        if let Err(e) = self.store.close() {
            warn!("Error while closing document store: {}", e);
        }
        info!("Cache coordinator closed");
    }
}

impl<S: DocumentStore, Q> Drop for CacheCoordinator<S, Q> {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Tests
// =============================================================================
