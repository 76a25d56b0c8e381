//! Repository options.
//!
//! # Responsibility
//! - Carry dispatch thresholds and bulk sizing into each repository instance.
//!
//! # Invariants
//! - Options are passed at construction; there is no process-wide threshold.
//! - `bulk_threshold` and `bulk_batch_size` are at least 1.

use crate::repo::error::{RepoError, RepoResult};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BULK_THRESHOLD: usize = 5;
pub const DEFAULT_BULK_BATCH_SIZE: usize = 500;

/// Per-repository dispatch configuration.
///
/// Deserializable so hosts can embed it in their own configuration files;
/// missing keys fall back to defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryOptions {
    /// Batches of at least this many records use the bulk engine.
    pub bulk_threshold: usize,
    /// Maximum rows per bulk statement chunk. Chunks are further capped so
    /// no statement binds more than 32766 values.
    pub bulk_batch_size: usize,
    /// Apply threshold dispatch to `insert_batch` as well.
    ///
    /// Off by default: session inserts leave records tracked, bulk inserts do not.
    pub bulk_insert: bool,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            bulk_threshold: DEFAULT_BULK_THRESHOLD,
            bulk_batch_size: DEFAULT_BULK_BATCH_SIZE,
            bulk_insert: false,
        }
    }
}

impl RepositoryOptions {
    pub fn with_bulk_threshold(mut self, threshold: usize) -> Self {
        self.bulk_threshold = threshold;
        self
    }

    pub fn with_bulk_insert(mut self, enabled: bool) -> Self {
        self.bulk_insert = enabled;
        self
    }

    /// Rejects values that would make dispatch meaningless.
    pub fn validate(&self) -> RepoResult<()> {
        if self.bulk_threshold == 0 {
            return Err(RepoError::InvalidOptions(
                "bulk_threshold must be at least 1".to_string(),
            ));
        }
        if self.bulk_batch_size == 0 {
            return Err(RepoError::InvalidOptions(
                "bulk_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// True when a batch of `len` records should bypass the session.
    pub fn uses_bulk(&self, len: usize) -> bool {
        len >= self.bulk_threshold
    }
}
