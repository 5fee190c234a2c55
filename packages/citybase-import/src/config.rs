//! Run configuration injected at coordinator construction.
//!
//! Values come from whatever outer surface the embedding application has
//! (CLI flags, a config file); this crate only defines the shape and the
//! defaults.

use crate::error::{ImportError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Worker threads for feature fan-out in `drive`.
    pub worker_threads: usize,
    /// Pending-row count at which a table's batch flushes automatically.
    pub batch_threshold: usize,
    /// Soft capacity of the in-memory identifier caches.
    pub cache_capacity: usize,
    /// Escalate unresolved references to a run-aborting error.
    pub strict: bool,
    /// Rewrite document identifiers on import; the original key is kept
    /// for lookups, the replacement is what output rows carry.
    pub rewrite_ids: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            worker_threads: (num_cpus::get() * 3 / 4).max(1), // 75% of cores
            batch_threshold: 100,
            cache_capacity: 200_000,
            strict: false,
            rewrite_ids: false,
        }
    }
}

impl ImportConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(ImportError::config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_threshold == 0 {
            return Err(ImportError::config("batch_threshold must be at least 1"));
        }
        if self.cache_capacity == 0 {
            return Err(ImportError::config("cache_capacity must be at least 1"));
        }
        if self.worker_threads == 0 {
            return Err(ImportError::config("worker_threads must be at least 1"));
        }
        Ok(())
    }
}
