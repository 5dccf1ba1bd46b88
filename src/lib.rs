//! Query Cache Coordinator
//!
//! Keeps an in-memory cache of parsed queries coherent with the document
//! store they are indexed in, while the store takes concurrent writes and a
//! background purge periodically rebuilds the cache from a full scan.
//!
//! # Architecture
//!
//! ```text
//!  writers ──commit()──┐                       ┌── PurgeScheduler
//!                      ▼                       ▼
//!               ┌─────────────────────────────────────┐
//!  readers ───▶ │          CacheCoordinator           │
//!  acquire_view │  live CacheMap │ overflow CacheMap  │
//!               └─────────────────────────────────────┘
//!                      │
//!                      ▼
//!               DocumentStore (MemoryStore or your own)
//! ```
//!
//! # Guarantees
//!
//! - A rebuild never sees a torn store snapshot.
//! - Writes landing during a rebuild survive its swap.
//! - A view's reader and cache map are never split across a swap.
//!
//! # Modules
//!
//! - [`cache`] - Keys, entries, the concurrent cache map and metrics
//! - [`coordinator`] - Commit, view and rebuild coordination
//! - [`error`] - Error types
//! - [`purge`] - Periodic background rebuilds
//! - [`store`] - Document store port and in-memory implementation

pub mod cache;
pub mod coordinator;
pub mod error;
pub mod purge;
pub mod store;

// Re-export commonly used types
pub use cache::{CacheEntry, CacheKey, CacheMap};
pub use coordinator::{
    CacheCoordinator, CoordinatorConfig, CoordinatorStats, PendingUpdate, RebuildMode,
    RebuildPhase, RebuildPopulator, RebuildReport, ViewHandle,
};
pub use error::{Error, Result};
pub use purge::{PurgeConfig, PurgeHandle, PurgeScheduler};
pub use store::{Document, DocumentStore, MemoryReader, MemoryStore, SnapshotReader, Term};
