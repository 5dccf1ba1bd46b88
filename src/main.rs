//! Query Cache Workload Driver
//!
//! Runs concurrent writers and readers against an in-memory coordinator
//! while the purge scheduler rebuilds the cache underneath them, then checks
//! that no view was ever torn and no committed query went missing.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  writers (N) ──commit──▶ CacheCoordinator ◀──view── readers │
//! │                               ▲                             │
//! │                               └──rebuild── PurgeScheduler   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use querycache::{
    CacheCoordinator, CacheEntry, CacheKey, CacheMap, CoordinatorConfig, Document, Error,
    MemoryStore, PendingUpdate, PurgeConfig, PurgeScheduler, RebuildMode, RebuildPopulator,
    Result, SnapshotReader,
};

type Coordinator = CacheCoordinator<MemoryStore, String>;

const ID_FIELD: &str = "id";
const HASH_FIELD: &str = "hash";
const QUERY_FIELD: &str = "query";

// =============================================================================
// CLI Arguments
// =============================================================================

/// Query cache workload driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent writer threads
    #[arg(long, env = "QC_WRITERS", default_value = "4")]
    writers: usize,

    /// Commits performed by each writer
    #[arg(long, env = "QC_COMMITS", default_value = "200")]
    commits: usize,

    /// Number of distinct query ids writers draw from
    #[arg(long, env = "QC_DISTINCT_IDS", default_value = "64")]
    distinct_ids: usize,

    /// Number of concurrent reader threads
    #[arg(long, env = "QC_READERS", default_value = "2")]
    readers: usize,

    /// Purge interval in milliseconds
    #[arg(long, env = "QC_PURGE_INTERVAL_MS", default_value = "25")]
    purge_interval_ms: u64,

    /// Behaviour of overlapping rebuilds (reject, queue)
    #[arg(long, env = "QC_REBUILD_MODE", default_value = "reject")]
    rebuild_mode: RebuildMode,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Populator
// =============================================================================

/// Rebuilds the cache by scanning the coordinator's own store
struct QueryScan {
    coordinator: Arc<Coordinator>,
}

impl RebuildPopulator<String> for QueryScan {
    fn populate(&self, cache: &CacheMap<String>) -> Result<()> {
        let inserted = self.coordinator.scan_into(cache, decode_query)?;
        tracing::debug!("Scanned {} queries", inserted);
        Ok(())
    }
}

fn decode_query(doc: &Document) -> Result<Option<CacheEntry<String>>> {
    let hash = doc
        .get(HASH_FIELD)
        .ok_or_else(|| Error::Populate("document has no hash field".into()))?;
    let key = CacheKey::from_hex(hash)
        .ok_or_else(|| Error::Populate(format!("invalid hash: {}", hash)))?;
    let query = doc.get(QUERY_FIELD).unwrap_or_default().to_string();

    let mut metadata = std::collections::BTreeMap::new();
    if let Some(id) = doc.get(ID_FIELD) {
        metadata.insert(ID_FIELD.to_string(), id.to_string());
    }
    Ok(Some(CacheEntry::with_metadata(key, query, metadata)))
}

fn query_update(id: &str, query: String) -> PendingUpdate<String> {
    let key = CacheKey::from_content(&query);
    let doc = Document::new()
        .with_field(ID_FIELD, id)
        .with_field(HASH_FIELD, key.to_hex())
        .with_field(QUERY_FIELD, query.as_str());
    let mut metadata = std::collections::BTreeMap::new();
    metadata.insert(ID_FIELD.to_string(), id.to_string());
    PendingUpdate::new(id, doc, CacheEntry::with_metadata(key, query, metadata))
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting query cache workload");
    info!("  Writers: {} x {} commits", args.writers, args.commits);
    info!("  Readers: {}", args.readers);
    info!("  Purge interval: {}ms", args.purge_interval_ms);
    info!("  Rebuild mode: {}", args.rebuild_mode);

    if args.distinct_ids == 0 {
        return Err(Error::Config("distinct_ids must be at least 1".into()));
    }

    let config = CoordinatorConfig {
        rebuild_mode: args.rebuild_mode,
        default_delete_field: ID_FIELD.to_string(),
    };
    let coordinator = Arc::new(Coordinator::with_config(config, MemoryStore::new())?);

    let purge = PurgeScheduler::spawn(
        Arc::clone(&coordinator),
        Arc::new(QueryScan {
            coordinator: Arc::clone(&coordinator),
        }),
        PurgeConfig {
            interval: Duration::from_millis(args.purge_interval_ms.max(1)),
            run_on_start: false,
        },
    )?;

    // Readers run until the writers are done
    let stop = Arc::new(AtomicBool::new(false));
    let torn_views = Arc::new(AtomicU64::new(0));
    let mut readers = Vec::with_capacity(args.readers);
    for _ in 0..args.readers {
        let coordinator = Arc::clone(&coordinator);
        let stop = Arc::clone(&stop);
        let torn_views = Arc::clone(&torn_views);
        readers.push(tokio::task::spawn_blocking(move || {
            read_loop(&coordinator, &stop, &torn_views)
        }));
    }

    let mut writers = Vec::with_capacity(args.writers);
    for w in 0..args.writers {
        let coordinator = Arc::clone(&coordinator);
        let commits = args.commits;
        let distinct_ids = args.distinct_ids;
        writers.push(tokio::task::spawn_blocking(move || {
            write_loop(&coordinator, w, commits, distinct_ids)
        }));
    }

    for writer in writers {
        writer
            .await
            .map_err(|e| Error::Internal(format!("writer panicked: {}", e)))??;
    }
    stop.store(true, Ordering::Release);

    let mut views_checked = 0;
    for reader in readers {
        views_checked += reader
            .await
            .map_err(|e| Error::Internal(format!("reader panicked: {}", e)))??;
    }

    purge.shutdown().await;

    // One last purge so the cache holds exactly the live queries
    let final_scan = QueryScan {
        coordinator: Arc::clone(&coordinator),
    };
    let report = coordinator.rebuild(&final_scan)?;
    info!(
        "Final rebuild purged {} entries, {} live",
        report.purged(),
        report.cache_size
    );

    let missing = missing_entries(&coordinator)?;
    let stats = coordinator.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    coordinator.close();

    let torn = torn_views.load(Ordering::Acquire);
    info!("Checked {} views, {} torn, {} missing", views_checked, torn, missing);
    if torn > 0 || missing > 0 || stats.cache_size != stats.num_docs {
        error!("Cache and store diverged");
        return Err(Error::Internal(format!(
            "{} torn views, {} missing entries, cache {} vs docs {}",
            torn, missing, stats.cache_size, stats.num_docs
        )));
    }

    info!("Workload complete");
    Ok(())
}

// =============================================================================
// Workload
// =============================================================================

fn write_loop(coordinator: &Coordinator, writer: usize, commits: usize, distinct_ids: usize) -> Result<()> {
    let mut rng = rand::thread_rng();
    for seq in 0..commits {
        let id = format!("query-{}", rng.gen_range(0..distinct_ids));
        let text = format!("{}:w{}-s{}", id, writer, seq);
        coordinator.apply(vec![query_update(&id, text)])?;
    }
    Ok(())
}

/// Returns the number of views checked
fn read_loop(coordinator: &Coordinator, stop: &AtomicBool, torn_views: &AtomicU64) -> Result<u64> {
    let mut checked = 0;
    while !stop.load(Ordering::Acquire) {
        let view = coordinator.view()?;
        let torn = view.reader().documents().any(|doc| {
            doc.get(HASH_FIELD)
                .and_then(CacheKey::from_hex)
                .map_or(true, |key| !view.cache().contains(&key))
        });
        if torn {
            warn!("View at generation {} is missing cache entries", view.generation());
            torn_views.fetch_add(1, Ordering::Relaxed);
        }
        view.release()?;
        checked += 1;
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(checked)
}

/// Committed documents with no live cache entry
fn missing_entries(coordinator: &Coordinator) -> Result<usize> {
    let view = coordinator.view()?;
    let missing = view
        .reader()
        .documents()
        .filter(|doc| {
            doc.get(HASH_FIELD)
                .and_then(CacheKey::from_hex)
                .map_or(true, |key| !view.cache().contains(&key))
        })
        .count();
    view.release()?;
    Ok(missing)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
