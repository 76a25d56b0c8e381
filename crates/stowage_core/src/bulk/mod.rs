//! Set-oriented bulk writes.
//!
//! # Responsibility
//! - Write many records of one entity type in a single store transaction.
//! - Bypass the identity map entirely; bulk calls never read or change
//!   session tracking state.
//!
//! # Invariants
//! - One call is one transaction; statements are chunked by `batch_size`.
//! - Update columns are resolved through `FieldSelection` before any I/O.
//! - Store failures and cancellation surface unchanged; nothing is retried.

use crate::cancel::Cancellation;
use crate::config::{RepositoryOptions, DEFAULT_BULK_BATCH_SIZE};
use crate::model::entity::Entity;
use crate::model::fields::FieldSelection;
use crate::repo::error::RepoResult;
use async_trait::async_trait;

mod sqlite;

pub use sqlite::SqliteBulkEngine;

/// Per-call bulk settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOptions {
    /// Columns written by `bulk_update`; `All` writes every non-key column.
    pub columns: FieldSelection,
    /// Maximum records per generated statement.
    pub batch_size: usize,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            columns: FieldSelection::All,
            batch_size: DEFAULT_BULK_BATCH_SIZE,
        }
    }
}

impl BulkOptions {
    pub fn from_repository(options: &RepositoryOptions) -> Self {
        Self {
            columns: FieldSelection::All,
            batch_size: options.bulk_batch_size.max(1),
        }
    }

    pub fn with_columns(mut self, columns: FieldSelection) -> Self {
        self.columns = columns;
        self
    }
}

/// Bulk write path used once a batch reaches the repository threshold.
///
/// Every method returns the number of rows the store reports as affected.
#[async_trait]
pub trait BulkEngine: Send + Sync {
    /// Inserts `records`, assigning store-generated keys in place.
    async fn bulk_insert<E: Entity>(
        &self,
        records: &mut [E],
        options: &BulkOptions,
        cancel: &Cancellation,
    ) -> RepoResult<usize>;

    /// Updates `options.columns` of every record, matched by primary key.
    async fn bulk_update<E: Entity>(
        &self,
        records: &[E],
        options: &BulkOptions,
        cancel: &Cancellation,
    ) -> RepoResult<usize>;

    /// Deletes every row whose primary key matches one of `records`.
    async fn bulk_delete<E: Entity>(
        &self,
        records: &[E],
        options: &BulkOptions,
        cancel: &Cancellation,
    ) -> RepoResult<usize>;
}
