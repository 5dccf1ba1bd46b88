//! Coordinator configuration

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What a `rebuild` call does when another rebuild is already running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildMode {
    /// Fail fast with `Error::RebuildInProgress`
    #[default]
    Reject,
    /// Wait for the running rebuild, then run
    Queue,
}

impl fmt::Display for RebuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildMode::Reject => write!(f, "reject"),
            RebuildMode::Queue => write!(f, "queue"),
        }
    }
}

impl std::str::FromStr for RebuildMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(RebuildMode::Reject),
            "queue" => Ok(RebuildMode::Queue),
            other => Err(Error::Config(format!("unknown rebuild mode: {}", other))),
        }
    }
}

/// Configuration for the cache coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Behaviour of concurrent rebuild calls
    pub rebuild_mode: RebuildMode,

    /// Document field holding the logical query id, used by `apply`
    pub default_delete_field: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            rebuild_mode: RebuildMode::Reject,
            default_delete_field: "id".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Check the configuration for values the coordinator cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.default_delete_field.trim().is_empty() {
            return Err(Error::Config("default_delete_field must not be empty".into()));
        }
        Ok(())
    }
}
