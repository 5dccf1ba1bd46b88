//! Periodic Cache Purge
//!
//! Drives [`CacheCoordinator::rebuild`] on a fixed interval from a tokio
//! task. The rebuild itself is blocking, so each run goes through
//! `spawn_blocking`; the coordinator's own locking keeps it safe against
//! concurrent commits and views.
//!
//! ```text
//! interval tick ─┐
//! trigger()     ─┼─▶ spawn_blocking(rebuild) ─▶ log report / error
//! shutdown()    ─┴─▶ exit loop
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::coordinator::{CacheCoordinator, RebuildPopulator};
use crate::error::{Error, Result};
use crate::store::DocumentStore;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the purge scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Time between rebuilds
    pub interval: Duration,

    /// Rebuild immediately instead of waiting one interval
    pub run_on_start: bool,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            run_on_start: false,
        }
    }
}

impl PurgeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::Config("purge interval must be greater than zero".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Counters shared between the scheduler task and its handle
#[derive(Debug, Default)]
struct PurgeCounters {
    runs: AtomicU64,
    failures: AtomicU64,
}

/// Handle to a running purge task
pub struct PurgeHandle {
    token: CancellationToken,
    trigger: Arc<Notify>,
    counters: Arc<PurgeCounters>,
    task: JoinHandle<()>,
}

impl PurgeHandle {
    /// Request a rebuild now instead of waiting for the next tick
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Rebuilds that completed successfully
    pub fn runs(&self) -> u64 {
        self.counters.runs.load(Ordering::Relaxed)
    }

    /// Rebuilds that returned an error
    pub fn failures(&self) -> u64 {
        self.counters.failures.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the scheduler and wait for it; a rebuild already running is
    /// allowed to finish
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!("Purge task ended abnormally: {}", e);
        }
    }
}

/// Spawns the periodic purge task
pub struct PurgeScheduler;

impl PurgeScheduler {
    /// Start purging `coordinator` with `populator` every `config.interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S, Q, P>(
        coordinator: Arc<CacheCoordinator<S, Q>>,
        populator: Arc<P>,
        config: PurgeConfig,
    ) -> Result<PurgeHandle>
    where
        S: DocumentStore + 'static,
        Q: Send + Sync + 'static,
        P: RebuildPopulator<Q> + Send + Sync + 'static,
    {
        config.validate()?;

        let token = CancellationToken::new();
        let trigger = Arc::new(Notify::new());
        let counters = Arc::new(PurgeCounters::default());

        let task = tokio::spawn(run(
            coordinator,
            populator,
            config,
            token.clone(),
            Arc::clone(&trigger),
            Arc::clone(&counters),
        ));

        Ok(PurgeHandle {
            token,
            trigger,
            counters,
            task,
        })
    }
}

async fn run<S, Q, P>(
    coordinator: Arc<CacheCoordinator<S, Q>>,
    populator: Arc<P>,
    config: PurgeConfig,
    token: CancellationToken,
    trigger: Arc<Notify>,
    counters: Arc<PurgeCounters>,
) where
    S: DocumentStore + 'static,
    Q: Send + Sync + 'static,
    P: RebuildPopulator<Q> + Send + Sync + 'static,
{
    info!("Starting purge scheduler with {:?}", config);

    let mut tick = interval(config.interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    if !config.run_on_start {
        // First tick of a tokio interval fires immediately
        tick.tick().await;
    }

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Purge scheduler shutting down");
                break;
            }
            _ = tick.tick() => {}
            _ = trigger.notified() => {
                debug!("Purge triggered on demand");
            }
        }

        let c = Arc::clone(&coordinator);
        let p = Arc::clone(&populator);
        match tokio::task::spawn_blocking(move || c.rebuild(p.as_ref())).await {
            Ok(Ok(report)) => {
                counters.runs.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Purge {} removed {} entries, {} live",
                    report.rebuild_id,
                    report.purged(),
                    report.cache_size
                );
            }
            Ok(Err(Error::Closed)) => {
                info!("Coordinator closed, stopping purge scheduler");
                break;
            }
            Ok(Err(Error::RebuildInProgress)) => {
                debug!("Skipping purge, a rebuild is already running");
            }
            Ok(Err(e)) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                error!("Error purging query cache: {}", e);
            }
            Err(e) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                error!("Purge task panicked: {}", e);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
