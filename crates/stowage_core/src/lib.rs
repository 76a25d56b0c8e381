//! Generic entity repository over SQLite.
//! Tracked writes go through an identity-mapped session; large update and
//! delete batches go through a set-oriented bulk engine.

pub mod bulk;
pub mod cancel;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod session;

pub use bulk::{BulkEngine, BulkOptions, SqliteBulkEngine};
pub use cancel::Cancellation;
pub use config::{RepositoryOptions, DEFAULT_BULK_BATCH_SIZE, DEFAULT_BULK_THRESHOLD};
pub use db::{open_store, open_store_in_memory, DbError, DbResult, SqliteStore};
pub use logging::{default_log_level, init_logging, logging_status, LoggingConfig, LoggingError};
pub use model::entity::{
    expect_integer, expect_optional_integer, expect_optional_text, expect_text, Entity,
    EntitySchema, Value,
};
pub use model::fields::{FieldSelection, FieldSelector};
pub use model::key::{IdentityKey, KeyExtractor};
pub use repo::error::{RepoError, RepoResult, SchemaError};
pub use repo::query::{Order, Query};
pub use repo::repository::Repository;
pub use session::{
    EntryId, PersistenceSession, SessionStats, SqliteSession, TrackingMode, TrackingState,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
