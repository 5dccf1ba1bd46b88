//! Cache Entry Types
//!
//! Content-addressed keys and the immutable entries stored under them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::KEY_LEN;

/// Cache key - SHA-256 hash of the cached query's content
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; KEY_LEN]);

impl CacheKey {
    /// Wrap an existing hash
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary content into a key
    pub fn from_content(content: impl AsRef<[u8]>) -> Self {
        let digest = Sha256::digest(content.as_ref());
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Parse a key from its hex representation
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    /// Raw hash bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Lowercase hex form, as stored in documents
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight hex chars are plenty to tell keys apart in logs
        write!(f, "CacheKey({}..)", &self.to_hex()[..8])
    }
}

/// An entry in the query cache
///
/// Entries are immutable once built. Re-committing the same key, or a
/// rebuild, replaces the whole entry.
#[derive(Debug)]
pub struct CacheEntry<Q> {
    /// Hash value for lookups
    key: CacheKey,
    /// The (possibly partial) query this entry matches with
    payload: Arc<Q>,
    /// Metadata carried over from the entry's parent query
    metadata: BTreeMap<String, String>,
}

impl<Q> Clone for CacheEntry<Q> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            payload: Arc::clone(&self.payload),
            metadata: self.metadata.clone(),
        }
    }
}

impl<Q> CacheEntry<Q> {
    /// Create an entry with no metadata
    pub fn new(key: CacheKey, payload: Q) -> Self {
        Self::with_metadata(key, payload, BTreeMap::new())
    }

    /// Create an entry with metadata
    pub fn with_metadata(key: CacheKey, payload: Q, metadata: BTreeMap<String, String>) -> Self {
        Self {
            key,
            payload: Arc::new(payload),
            metadata,
        }
    }

    #[inline]
    pub fn key(&self) -> CacheKey {
        self.key
    }

    #[inline]
    pub fn payload(&self) -> &Q {
        &self.payload
    }

    /// Shared handle to the payload
    pub fn payload_arc(&self) -> Arc<Q> {
        Arc::clone(&self.payload)
    }

    #[inline]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Look up a single metadata value
    pub fn meta(&self, name: &str) -> Option<&str> {
        self.metadata.get(name).map(String::as_str)
    }
}

// =============================================================================
// Tests
// =============================================================================
