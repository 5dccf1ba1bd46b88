//! Document Store Port
//!
//! The coordinator treats the backing store purely as a capability set:
//! buffered adds and deletes, an atomic commit, and reference-counted
//! snapshot readers. How the store indexes or matches documents is its own
//! business.
//!
//! # Visibility Model
//!
//! ```text
//! add/delete ──▶ working set ──commit()──▶ committed ──maybe_refresh()──▶ readers
//! ```
//!
//! A reader always sees exactly the state of one refresh and never changes
//! under its holder.

mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use memory::{MemoryReader, MemoryStore};

// =============================================================================
// Documents
// =============================================================================

/// A stored document: a flat set of named string fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    fields: BTreeMap<String, String>,
}

impl Document {
    /// Create an empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field setter
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Set (or replace) a field
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Get a field value
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}

/// Exact-match selector on a single field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Term {
    pub field: String,
    pub value: String,
}

impl Term {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Check whether a document carries this term
    pub fn matches(&self, doc: &Document) -> bool {
        doc.get(&self.field) == Some(self.value.as_str())
    }
}

// =============================================================================
// Ports
// =============================================================================

/// A point-in-time, read-only view of committed documents
pub trait SnapshotReader: Send + Sync {
    /// Commit generation this reader was opened on
    fn generation(&self) -> u64;

    /// Number of live documents visible to this reader
    fn num_docs(&self) -> usize;

    /// Iterate the visible documents
    fn documents(&self) -> Box<dyn Iterator<Item = &Document> + '_>;
}

/// Mutable document store backing the query cache
pub trait DocumentStore: Send + Sync {
    /// Snapshot reader handed out by [`DocumentStore::acquire_reader`]
    type Reader: SnapshotReader;

    /// Buffer a document for the next commit
    fn add_document(&self, doc: Document) -> Result<()>;

    /// Buffer deletion of every document carrying `term`, returning how many
    /// documents it removed from the working set
    fn delete_documents(&self, term: &Term) -> Result<usize>;

    /// Buffer deletion of every document the predicate accepts
    fn delete_matching(&self, predicate: &dyn Fn(&Document) -> bool) -> Result<usize>;

    /// Atomically commit all buffered changes
    fn commit(&self) -> Result<()>;

    /// Make the latest commit visible to newly acquired readers.
    ///
    /// Returns `true` if readers acquired from now on see a new generation.
    fn maybe_refresh(&self) -> Result<bool>;

    /// Acquire a snapshot reader; must be handed back to
    /// [`DocumentStore::release_reader`]
    fn acquire_reader(&self) -> Result<Self::Reader>;

    /// Release a reader obtained from [`DocumentStore::acquire_reader`]
    fn release_reader(&self, reader: Self::Reader) -> Result<()>;

    /// Documents in the working set, committed or not
    fn num_docs(&self) -> usize;

    /// Buffered changes not yet committed
    fn num_pending(&self) -> usize;

    /// Release the store's writer and reader resources
    fn close(&self) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_fields() {
        let mut doc = Document::new().with_field("id", "q1");
        doc.set("query", "title:rust");
        doc.set("id", "q2");

        assert_eq!(doc.get("id"), Some("q2"));
        assert_eq!(doc.get("query"), Some("title:rust"));
        assert_eq!(doc.get("missing"), None);
        assert_eq!(doc.fields().len(), 2);
    }

    #[test]
    fn test_term_matches() {
        let doc = Document::new().with_field("id", "q1");

        assert!(Term::new("id", "q1").matches(&doc));
        assert!(!Term::new("id", "q2").matches(&doc));
        assert!(!Term::new("other", "q1").matches(&doc));
    }

    #[test]
    fn test_document_serde() {
        let doc = Document::new().with_field("id", "q1");
        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }
}
