//! In-Memory Document Store
//!
//! A complete [`DocumentStore`] kept entirely in RAM. Committed state is an
//! immutable, reference-counted segment, so readers share it without copying
//! and a later commit never disturbs an open reader.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{Document, DocumentStore, SnapshotReader, Term};
use crate::error::{Error, Result};

/// Immutable committed state
#[derive(Debug, Default)]
struct Segment {
    generation: u64,
    docs: Vec<Document>,
}

/// Uncommitted working set
#[derive(Debug, Default)]
struct Working {
    docs: BTreeMap<u64, Document>,
    next_doc: u64,
    pending: usize,
    generation: u64,
}

/// Snapshot reader over one committed segment
#[derive(Debug, Clone)]
pub struct MemoryReader {
    segment: Arc<Segment>,
}

impl SnapshotReader for MemoryReader {
    fn generation(&self) -> u64 {
        self.segment.generation
    }

    fn num_docs(&self) -> usize {
        self.segment.docs.len()
    }

    fn documents(&self) -> Box<dyn Iterator<Item = &Document> + '_> {
        Box::new(self.segment.docs.iter())
    }
}

/// In-memory document store
pub struct MemoryStore {
    working: Mutex<Working>,
    /// Latest commit
    committed: RwLock<Arc<Segment>>,
    /// Commit currently handed to new readers
    searchable: RwLock<Arc<Segment>>,
    open_readers: AtomicUsize,
    commits: AtomicU64,
    closed: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            working: Mutex::new(Working::default()),
            committed: RwLock::new(Arc::new(Segment::default())),
            searchable: RwLock::new(Arc::new(Segment::default())),
            open_readers: AtomicUsize::new(0),
            commits: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }
}

impl MemoryStore {
    /// Create a new, empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Readers acquired and not yet released
    pub fn open_readers(&self) -> usize {
        self.open_readers.load(Ordering::Acquire)
    }

    /// Number of commits performed
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::StoreClosed);
        }
        Ok(())
    }

    fn remove_where(&self, predicate: impl Fn(&Document) -> bool) -> Result<usize> {
        self.ensure_open()?;
        let mut working = self.working.lock();
        let before = working.docs.len();
        working.docs.retain(|_, doc| !predicate(&*doc));
        let removed = before - working.docs.len();
        working.pending += removed;
        Ok(removed)
    }
}

impl DocumentStore for MemoryStore {
    type Reader = MemoryReader;

    fn add_document(&self, doc: Document) -> Result<()> {
        self.ensure_open()?;
        let mut working = self.working.lock();
        let id = working.next_doc;
        working.next_doc += 1;
        working.docs.insert(id, doc);
        working.pending += 1;
        Ok(())
    }

    fn delete_documents(&self, term: &Term) -> Result<usize> {
        self.remove_where(|doc| term.matches(doc))
    }

    fn delete_matching(&self, predicate: &dyn Fn(&Document) -> bool) -> Result<usize> {
        self.remove_where(predicate)
    }

    fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        let mut working = self.working.lock();
        if working.pending == 0 && working.generation > 0 {
            return Ok(());
        }

        working.generation += 1;
        let segment = Arc::new(Segment {
            generation: working.generation,
            docs: working.docs.values().cloned().collect(),
        });
        debug!(
            "Committed generation {} with {} docs ({} pending changes)",
            segment.generation,
            segment.docs.len(),
            working.pending
        );
        working.pending = 0;
        *self.committed.write() = segment;
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn maybe_refresh(&self) -> Result<bool> {
        self.ensure_open()?;
        let latest = self.committed.read().clone();
        let mut searchable = self.searchable.write();
        if searchable.generation == latest.generation {
            return Ok(false);
        }
        *searchable = latest;
        Ok(true)
    }

    fn acquire_reader(&self) -> Result<MemoryReader> {
        self.ensure_open()?;
        let segment = self.searchable.read().clone();
        self.open_readers.fetch_add(1, Ordering::AcqRel);
        Ok(MemoryReader { segment })
    }

    fn release_reader(&self, reader: MemoryReader) -> Result<()> {
        drop(reader);
        let released = self
            .open_readers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            return Err(Error::Store("released a reader that was never acquired".into()));
        }
        Ok(())
    }

    fn num_docs(&self) -> usize {
        self.working.lock().docs.len()
    }

    fn num_pending(&self) -> usize {
        self.working.lock().pending
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(
            "Closed in-memory store ({} readers still open)",
            self.open_readers()
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
