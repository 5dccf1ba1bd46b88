//! Error types for the query cache coordinator

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while committing to, viewing, or rebuilding the cache
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Document Store Errors
    // =========================================================================
    /// Backing store operation failed
    #[error("Document store error: {0}")]
    Store(String),

    /// Backing store has been closed
    #[error("Document store is closed")]
    StoreClosed,

    // =========================================================================
    // Coordinator Errors
    // =========================================================================
    /// Coordinator has been shut down
    #[error("Cache coordinator is closed")]
    Closed,

    /// Another rebuild already owns the rebuild slot
    #[error("Cache rebuild already in progress")]
    RebuildInProgress,

    /// Populator failed while scanning the store
    #[error("Cache population failed: {0}")]
    Populate(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
