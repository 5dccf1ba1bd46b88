//! Coordinator Metrics Collection
//!
//! Counters for commit, view and rebuild traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Coordinator metrics collector
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    // Commit metrics
    commits: AtomicU64,
    commit_failures: AtomicU64,
    updates_applied: AtomicU64,
    mirrored_writes: AtomicU64,

    // View metrics
    views_acquired: AtomicU64,
    views_released: AtomicU64,

    // Rebuild metrics
    rebuilds_completed: AtomicU64,
    rebuilds_failed: AtomicU64,
    rebuilds_rejected: AtomicU64,
    overflow_entries_merged: AtomicU64,

    // Latencies (microseconds, last observed)
    last_commit_latency_us: AtomicU64,
    last_rebuild_latency_us: AtomicU64,
}

impl CoordinatorMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_commit(&self, updates: usize, mirrored: usize, latency: Duration) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.updates_applied
            .fetch_add(updates as u64, Ordering::Relaxed);
        self.mirrored_writes
            .fetch_add(mirrored as u64, Ordering::Relaxed);
        self.last_commit_latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_view_acquired(&self) {
        self.views_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_view_released(&self) {
        self.views_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild(&self, overflow_merged: usize, latency: Duration) {
        self.rebuilds_completed.fetch_add(1, Ordering::Relaxed);
        self.overflow_entries_merged
            .fetch_add(overflow_merged as u64, Ordering::Relaxed);
        self.last_rebuild_latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_rebuild_failure(&self) {
        self.rebuilds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild_rejected(&self) {
        self.rebuilds_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn rebuilds_completed(&self) -> u64 {
        self.rebuilds_completed.load(Ordering::Relaxed)
    }

    pub fn rebuilds_failed(&self) -> u64 {
        self.rebuilds_failed.load(Ordering::Relaxed)
    }

    /// Views handed out but not yet released
    pub fn open_views(&self) -> u64 {
        let acquired = self.views_acquired.load(Ordering::Relaxed);
        let released = self.views_released.load(Ordering::Relaxed);
        acquired.saturating_sub(released)
    }

    /// Get a point-in-time snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commits: self.commits(),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            mirrored_writes: self.mirrored_writes.load(Ordering::Relaxed),
            views_acquired: self.views_acquired.load(Ordering::Relaxed),
            views_released: self.views_released.load(Ordering::Relaxed),
            rebuilds_completed: self.rebuilds_completed(),
            rebuilds_failed: self.rebuilds_failed(),
            rebuilds_rejected: self.rebuilds_rejected.load(Ordering::Relaxed),
            overflow_entries_merged: self.overflow_entries_merged.load(Ordering::Relaxed),
            last_commit_latency_us: self.last_commit_latency_us.load(Ordering::Relaxed),
            last_rebuild_latency_us: self.last_rebuild_latency_us.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of coordinator metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub commits: u64,
    pub commit_failures: u64,
    pub updates_applied: u64,
    pub mirrored_writes: u64,
    pub views_acquired: u64,
    pub views_released: u64,
    pub rebuilds_completed: u64,
    pub rebuilds_failed: u64,
    pub rebuilds_rejected: u64,
    pub overflow_entries_merged: u64,
    pub last_commit_latency_us: u64,
    pub last_rebuild_latency_us: u64,
}

/// Measures elapsed time for a single operation
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_start_at_zero() {
        let metrics = CoordinatorMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
        assert_eq!(metrics.open_views(), 0);
    }

    #[test]
    fn test_commit_counters() {
        let metrics = CoordinatorMetrics::new();
        metrics.record_commit(3, 1, Duration::from_micros(250));
        metrics.record_commit(0, 0, Duration::from_micros(40));
        metrics.record_commit_failure();

        let snap = metrics.snapshot();
        assert_eq!(snap.commits, 2);
        assert_eq!(snap.updates_applied, 3);
        assert_eq!(snap.mirrored_writes, 1);
        assert_eq!(snap.commit_failures, 1);
        assert_eq!(snap.last_commit_latency_us, 40);
    }

    #[test]
    fn test_open_views() {
        let metrics = CoordinatorMetrics::new();
        metrics.record_view_acquired();
        metrics.record_view_acquired();
        metrics.record_view_released();

        assert_eq!(metrics.open_views(), 1);
    }

    #[test]
    fn test_rebuild_counters() {
        let metrics = CoordinatorMetrics::new();
        metrics.record_rebuild(4, Duration::from_millis(2));
        metrics.record_rebuild_failure();
        metrics.record_rebuild_rejected();

        let snap = metrics.snapshot();
        assert_eq!(snap.rebuilds_completed, 1);
        assert_eq!(snap.rebuilds_failed, 1);
        assert_eq!(snap.rebuilds_rejected, 1);
        assert_eq!(snap.overflow_entries_merged, 4);
        assert_eq!(snap.last_rebuild_latency_us, 2000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = CoordinatorMetrics::new();
        metrics.record_commit(1, 0, Duration::ZERO);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["commits"], 1);
    }
}
