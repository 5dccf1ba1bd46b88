//! Query Cache Data Types
//!
//! Content-addressed entries and the concurrent map that holds them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       CacheMap<Q>                            │
//! │   DashMap<CacheKey, Arc<CacheEntry<Q>>>                      │
//! │                                                              │
//! │   CacheKey ── SHA-256 of the query content (32 bytes)        │
//! │   CacheEntry ── { key, payload: Arc<Q>, metadata }           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Maps are handed around as `Arc<CacheMap<Q>>`. The coordinator replaces the
//! live map wholesale on rebuild, so a reader holding an `Arc` keeps a stable
//! map for as long as it needs one.

mod entry;
mod map;
mod metrics;

pub use entry::{CacheEntry, CacheKey};
pub use map::CacheMap;
pub use metrics::{CoordinatorMetrics, LatencyTracker, MetricsSnapshot};

/// Length of a cache key in bytes (SHA-256)
pub const KEY_LEN: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_len_matches_digest() {
        assert_eq!(KEY_LEN, 32);
        assert_eq!(CacheKey::from_content("x").as_bytes().len(), KEY_LEN);
    }
}
