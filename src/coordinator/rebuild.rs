//! Cache rebuild (purge) protocol
//!
//! A rebuild scans the whole store into a fresh map and swaps it in,
//! dropping entries whose documents are gone. It runs in three phases:
//!
//! 1. **Open** (exclusive): publish an empty overflow buffer. From here on
//!    every commit mirrors its entries into it.
//! 2. **Scan** (no lock): the populator fills a fresh map from the store.
//! 3. **Swap** (exclusive): merge the overflow buffer over the fresh map,
//!    install the result as the live map, drop the buffer.
//!
//! Overflow entries win on conflict: they were committed after the buffer
//! opened, so the scan's copy is at best as new and possibly stale.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{CacheCoordinator, RebuildMode};
use crate::cache::{CacheEntry, CacheMap, LatencyTracker};
use crate::error::{Error, Result};
use crate::store::{Document, DocumentStore, SnapshotReader};

// =============================================================================
// Populator
// =============================================================================

/// Fills an empty cache map with one entry per live store document
pub trait RebuildPopulator<Q> {
    fn populate(&self, cache: &CacheMap<Q>) -> Result<()>;
}

impl<Q, F> RebuildPopulator<Q> for F
where
    F: Fn(&CacheMap<Q>) -> Result<()>,
{
    fn populate(&self, cache: &CacheMap<Q>) -> Result<()> {
        self(cache)
    }
}

// =============================================================================
// State
// =============================================================================

/// Rebuild state held under the coordination lock
pub(super) enum RebuildState<Q> {
    /// No rebuild running; commits touch only the live map
    Idle,
    /// Scan running; commits also write to `overflow`
    Collecting {
        overflow: Arc<CacheMap<Q>>,
        rebuild_id: Uuid,
    },
    /// Overflow being merged; only ever seen under the exclusive lock
    Swapping,
}

impl<Q> RebuildState<Q> {
    /// Buffer commits must mirror into, if a rebuild is collecting
    pub(super) fn overflow(&self) -> Option<&Arc<CacheMap<Q>>> {
        match self {
            RebuildState::Collecting { overflow, .. } => Some(overflow),
            _ => None,
        }
    }

    pub(super) fn phase(&self) -> RebuildPhase {
        match self {
            RebuildState::Idle => RebuildPhase::Idle,
            RebuildState::Collecting { .. } => RebuildPhase::Collecting,
            RebuildState::Swapping => RebuildPhase::Swapping,
        }
    }
}

/// Externally visible rebuild phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildPhase {
    Idle,
    Collecting,
    Swapping,
}

impl fmt::Display for RebuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildPhase::Idle => write!(f, "Idle"),
            RebuildPhase::Collecting => write!(f, "Collecting"),
            RebuildPhase::Swapping => write!(f, "Swapping"),
        }
    }
}

/// Outcome of a completed rebuild
#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub rebuild_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    /// Entries produced by the scan
    pub populated: usize,
    /// Entries merged from the overflow buffer
    pub overflow_merged: usize,
    /// Live cache size before the swap
    pub previous_size: usize,
    /// Live cache size after the swap
    pub cache_size: usize,
}

impl RebuildReport {
    /// Entries dropped by this rebuild (never negative)
    pub fn purged(&self) -> usize {
        self.previous_size.saturating_sub(self.cache_size)
    }
}

/// Resets the state to `Idle` unless disarmed, so a failed or panicking
/// scan never leaves commits mirroring into an orphaned buffer.
struct CollectingGuard<'a, S: DocumentStore, Q> {
    coordinator: &'a CacheCoordinator<S, Q>,
    armed: bool,
}

impl<S: DocumentStore, Q> CollectingGuard<'_, S, Q> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<S: DocumentStore, Q> Drop for CollectingGuard<'_, S, Q> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.state.write().rebuild = RebuildState::Idle;
            debug!("Discarded overflow buffer");
        }
    }
}

// =============================================================================
// Rebuild
// =============================================================================

impl<S: DocumentStore, Q> CacheCoordinator<S, Q> {
    /// Rebuild the live cache from a full store scan.
    ///
    /// Only one rebuild runs at a time; depending on
    /// [`RebuildMode`] a concurrent call is rejected or waits. On failure
    /// the live cache is left untouched.
    #[instrument(skip_all, fields(rebuild_id = tracing::field::Empty))]
    pub fn rebuild<P>(&self, populator: &P) -> Result<RebuildReport>
    where
        P: RebuildPopulator<Q> + ?Sized,
    {
        self.ensure_open()?;

        let _slot = match self.config.rebuild_mode {
            RebuildMode::Reject => match self.rebuild_lock.try_lock() {
                Some(slot) => slot,
                None => {
                    self.metrics.record_rebuild_rejected();
                    debug!("Rebuild rejected, another rebuild is running");
                    return Err(Error::RebuildInProgress);
                }
            },
            RebuildMode::Queue => self.rebuild_lock.lock(),
        };
        // close() may have won the slot race while we queued
        self.ensure_open()?;

        let rebuild_id = Uuid::new_v4();
        tracing::Span::current().record("rebuild_id", tracing::field::display(&rebuild_id));
        let started_at = Utc::now();
        let tracker = LatencyTracker::start();
        info!("Starting cache rebuild");

        // Phase 1: open the overflow buffer
        {
            let mut state = self.state.write();
            state.rebuild = RebuildState::Collecting {
                overflow: Arc::new(CacheMap::new()),
                rebuild_id,
            };
        }
        let collecting = CollectingGuard {
            coordinator: self,
            armed: true,
        };

        // Phase 2: scan without holding the coordination lock
        let fresh = CacheMap::new();
        if let Err(e) = populator.populate(&fresh) {
            self.metrics.record_rebuild_failure();
            warn!("Cache rebuild failed during scan: {}", e);
            return Err(e);
        }
        let populated = fresh.len();

        // Phase 3: merge and swap
        let mut state = self.state.write();
        if self.is_closed() {
            drop(state);
            self.metrics.record_rebuild_failure();
            warn!("Coordinator closed during rebuild, discarding scan result");
            return Err(Error::Closed);
        }

        let overflow = match std::mem::replace(&mut state.rebuild, RebuildState::Swapping) {
            RebuildState::Collecting {
                overflow,
                rebuild_id: owner,
            } if owner == rebuild_id => overflow,
            other => {
                state.rebuild = other;
                drop(state);
                self.metrics.record_rebuild_failure();
                return Err(Error::Internal(
                    "rebuild state changed while collecting".into(),
                ));
            }
        };

        let overflow_merged = fresh.merge_from(&overflow);
        let previous_size = state.live.len();
        state.live = Arc::new(fresh);
        state.rebuild = RebuildState::Idle;
        let cache_size = state.live.len();
        drop(state);
        collecting.disarm();

        let duration = tracker.elapsed();
        self.metrics.record_rebuild(overflow_merged, duration);

        let report = RebuildReport {
            rebuild_id: rebuild_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            duration,
            populated,
            overflow_merged,
            previous_size,
            cache_size,
        };
        info!(
            "Cache rebuild complete in {:?}: {} scanned, {} from overflow, {} purged, {} live",
            duration,
            populated,
            overflow_merged,
            report.purged(),
            cache_size
        );
        Ok(report)
    }

    /// Scan the current store snapshot into `cache`.
    ///
    /// `decode` turns a document into its cache entry; documents it maps to
    /// `None` are skipped. Returns the number of entries inserted.
    pub fn scan_into<F>(&self, cache: &CacheMap<Q>, decode: F) -> Result<usize>
    where
        F: Fn(&Document) -> Result<Option<CacheEntry<Q>>>,
    {
        let view = self.view()?;
        let mut inserted = 0;
        for doc in view.reader().documents() {
            if let Some(entry) = decode(doc)? {
                cache.insert(entry);
                inserted += 1;
            }
        }
        view.release()?;
        Ok(inserted)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::coordinator::{CoordinatorConfig, PendingUpdate};
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;
    use std::sync::Barrier;

    type Coordinator = CacheCoordinator<MemoryStore, String>;

    fn update(id: &str, query: &str) -> PendingUpdate<String> {
        let key = CacheKey::from_content(query);
        let doc = Document::new()
            .with_field("id", id)
            .with_field("hash", key.to_hex())
            .with_field("query", query);
        PendingUpdate::new(id, doc, CacheEntry::new(key, query.to_string()))
    }

    fn decode(doc: &Document) -> Result<Option<CacheEntry<String>>> {
        let (Some(hash), Some(query)) = (doc.get("hash"), doc.get("query")) else {
            return Ok(None);
        };
        let key = CacheKey::from_hex(hash)
            .ok_or_else(|| Error::Populate(format!("bad hash {}", hash)))?;
        Ok(Some(CacheEntry::new(key, query.to_string())))
    }

    fn scan(coordinator: &Coordinator, cache: &CacheMap<String>) -> Result<()> {
        coordinator.scan_into(cache, decode).map(|_| ())
    }

    #[test]
    fn test_rebuild_purges_deleted_entries() {
        let coordinator = Coordinator::in_memory();
        coordinator
            .commit(vec![update("q1", "a"), update("q2", "b")], "id")
            .unwrap();
        coordinator.commit(vec![update("q1", "c")], "id").unwrap();
        // "a" is superseded but still cached
        assert_eq!(coordinator.cache_size(), 3);

        let report = coordinator.rebuild(&|cache: &CacheMap<String>| scan(&coordinator, cache)).unwrap();

        assert_eq!(report.populated, 2);
        assert_eq!(report.overflow_merged, 0);
        assert_eq!(report.previous_size, 3);
        assert_eq!(report.purged(), 1);
        assert_eq!(coordinator.cache_size(), 2);
        assert!(!coordinator.cache().contains(&CacheKey::from_content("a")));
        assert_eq!(coordinator.rebuild_phase(), RebuildPhase::Idle);
    }

    #[test]
    fn test_commit_during_scan_survives_swap() {
        let coordinator = Coordinator::in_memory();
        coordinator
            .commit(vec![update("A", "hash1"), update("B", "hash2")], "id")
            .unwrap();

        let report = coordinator
            .rebuild(&|cache: &CacheMap<String>| -> Result<()> {
                // Scan starts from a snapshot that predates C
                let view = coordinator.view()?;
                assert_eq!(coordinator.rebuild_phase(), RebuildPhase::Collecting);
                coordinator.commit(vec![update("C", "hash3")], "id")?;
                for doc in view.reader().documents() {
                    let key = CacheKey::from_hex(doc.get("hash").unwrap_or_default())
                        .ok_or_else(|| Error::Populate("bad hash".into()))?;
                    cache.insert(CacheEntry::new(key, doc.get("query").unwrap_or_default().to_string()));
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(report.populated, 2);
        assert_eq!(report.overflow_merged, 1);
        let cache = coordinator.cache();
        for query in ["hash1", "hash2", "hash3"] {
            assert!(cache.contains(&CacheKey::from_content(query)), "missing {}", query);
        }
    }

    #[test]
    fn test_overflow_wins_over_scan() {
        let coordinator = Coordinator::in_memory();
        let key = CacheKey::from_content("shared");

        coordinator
            .rebuild(&|cache: &CacheMap<String>| {
                cache.insert(CacheEntry::new(key, "scanned".to_string()));
                let doc = Document::new().with_field("id", "q1");
                coordinator.commit(
                    vec![PendingUpdate::new("q1", doc, CacheEntry::new(key, "committed".to_string()))],
                    "id",
                )
            })
            .unwrap();

        assert_eq!(coordinator.cache().get(&key).unwrap().payload(), "committed");
    }

    #[test]
    fn test_failed_scan_keeps_live_cache_and_stops_mirroring() {
        let coordinator = Coordinator::in_memory();
        coordinator.commit(vec![update("q1", "a")], "id").unwrap();
        let before = coordinator.cache();

        let result = coordinator.rebuild(&|_: &CacheMap<String>| -> Result<()> {
            Err(Error::Populate("disk read failed".into()))
        });

        assert_matches!(result, Err(Error::Populate(_)));
        assert_eq!(coordinator.rebuild_phase(), RebuildPhase::Idle);
        assert!(Arc::ptr_eq(&before, &coordinator.cache()));
        assert_eq!(coordinator.metrics().rebuilds_failed(), 1);

        coordinator.commit(vec![update("q2", "b")], "id").unwrap();
        assert_eq!(coordinator.metrics().snapshot().mirrored_writes, 0);
    }

    #[test]
    fn test_panicking_scan_resets_state() {
        let coordinator = Coordinator::in_memory();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = coordinator.rebuild(&|_: &CacheMap<String>| -> Result<()> {
                panic!("populator bug");
            });
        }));

        assert!(outcome.is_err());
        assert_eq!(coordinator.rebuild_phase(), RebuildPhase::Idle);
        // Rebuild slot was released on unwind
        assert!(coordinator.rebuild(&|_: &CacheMap<String>| -> Result<()> { Ok(()) }).is_ok());
    }

    #[test]
    fn test_concurrent_rebuild_rejected() {
        let coordinator = Coordinator::in_memory();
        let entered = Barrier::new(2);
        let finish = Barrier::new(2);

        std::thread::scope(|s| {
            let first = s.spawn(|| {
                coordinator.rebuild(&|_: &CacheMap<String>| -> Result<()> {
                    entered.wait();
                    finish.wait();
                    Ok(())
                })
            });

            entered.wait();
            let second = coordinator.rebuild(&|_: &CacheMap<String>| -> Result<()> { Ok(()) });
            assert_matches!(second, Err(Error::RebuildInProgress));
            finish.wait();

            assert!(first.join().unwrap().is_ok());
        });

        let snap = coordinator.metrics().snapshot();
        assert_eq!(snap.rebuilds_completed, 1);
        assert_eq!(snap.rebuilds_rejected, 1);
    }

    #[test]
    fn test_queued_rebuilds_never_overlap() {
        let config = CoordinatorConfig {
            rebuild_mode: RebuildMode::Queue,
            ..Default::default()
        };
        let coordinator: Coordinator =
            CacheCoordinator::with_config(config, MemoryStore::new()).unwrap();
        let scanning = std::sync::atomic::AtomicUsize::new(0);
        let overlap = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    coordinator
                        .rebuild(&|_: &CacheMap<String>| -> Result<()> {
                            use std::sync::atomic::Ordering::SeqCst;
                            if scanning.fetch_add(1, SeqCst) > 0 {
                                overlap.store(true, SeqCst);
                            }
                            std::thread::sleep(Duration::from_millis(5));
                            scanning.fetch_sub(1, SeqCst);
                            Ok(())
                        })
                        .unwrap();
                });
            }
        });

        assert!(!overlap.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(coordinator.metrics().rebuilds_completed(), 4);
    }

    #[test]
    fn test_close_during_scan_discards_result() {
        let coordinator = Coordinator::in_memory();
        coordinator.commit(vec![update("q1", "a")], "id").unwrap();
        let before = coordinator.cache();
        let entered = Barrier::new(2);

        std::thread::scope(|s| {
            let rebuild = s.spawn(|| {
                coordinator.rebuild(&|cache: &CacheMap<String>| -> Result<()> {
                    entered.wait();
                    // Give close() time to flag shutdown and block on the slot
                    std::thread::sleep(Duration::from_millis(50));
                    cache.insert(CacheEntry::new(CacheKey::from_content("x"), "x".into()));
                    Ok(())
                })
            });

            entered.wait();
            coordinator.close();
            assert_matches!(rebuild.join().unwrap(), Err(Error::Closed));
        });

        assert!(Arc::ptr_eq(&before, &coordinator.cache()));
        assert_eq!(coordinator.rebuild_phase(), RebuildPhase::Idle);
        assert_matches!(
            coordinator.rebuild(&|_: &CacheMap<String>| -> Result<()> { Ok(()) }),
            Err(Error::Closed)
        );
    }

    #[test]
    fn test_close_racing_committing_populator() {
        let coordinator = Coordinator::in_memory();
        let entered = Barrier::new(3);

        std::thread::scope(|s| {
            let writer = s.spawn(|| {
                entered.wait();
                let mut i = 0;
                while coordinator.commit(vec![update("w", &format!("w{}", i))], "id").is_ok() {
                    i += 1;
                }
            });

            let rebuild = s.spawn(|| {
                coordinator.rebuild(&|_: &CacheMap<String>| -> Result<()> {
                    entered.wait();
                    let mut i = 0;
                    loop {
                        coordinator.commit(vec![update("p", &format!("p{}", i))], "id")?;
                        i += 1;
                    }
                })
            });

            entered.wait();
            std::thread::sleep(Duration::from_millis(5));
            coordinator.close();

            assert_matches!(rebuild.join().unwrap(), Err(Error::Closed));
            writer.join().unwrap();
        });

        assert!(coordinator.store().is_closed());
        assert_eq!(coordinator.rebuild_phase(), RebuildPhase::Idle);
    }

    #[test]
    fn test_old_map_outlives_swap_for_holders() {
        let coordinator = Coordinator::in_memory();
        coordinator.commit(vec![update("q1", "a")], "id").unwrap();

        let view = coordinator.view().unwrap();
        coordinator.rebuild(&|_: &CacheMap<String>| -> Result<()> { Ok(()) }).unwrap();

        // Held map is unchanged; live map was replaced
        assert_eq!(view.cache().len(), 1);
        assert_eq!(coordinator.cache_size(), 0);
        assert_eq!(view.reader().num_docs(), 1);
    }

    #[test]
    fn test_scan_into_skips_undecodable() {
        let coordinator = Coordinator::in_memory();
        coordinator.commit(vec![update("q1", "a")], "id").unwrap();
        coordinator
            .commit(
                vec![PendingUpdate::new(
                    "q2",
                    Document::new().with_field("id", "q2"),
                    CacheEntry::new(CacheKey::from_content("b"), "b".to_string()),
                )],
                "id",
            )
            .unwrap();

        let cache = CacheMap::new();
        assert_eq!(coordinator.scan_into(&cache, decode).unwrap(), 1);
        assert!(cache.contains(&CacheKey::from_content("a")));
        assert_eq!(coordinator.store().open_readers(), 0);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(RebuildPhase::Collecting.to_string(), "Collecting");
        assert_eq!(
            serde_json::to_string(&RebuildPhase::Swapping).unwrap(),
            "\"swapping\""
        );
    }
}
