//! Persistence sessions: per-object tracking and flush.
//!
//! # Responsibility
//! - Define the session contract the repository writes through.
//! - Own the identity map and translate tracked changes into store writes.
//!
//! # Invariants
//! - A session is used by one caller at a time; mutation takes `&mut self`.
//! - State changes happen only through session calls, never in background.
//! - After `dispose`, every operation fails with `RepoError::SessionDisposed`.
//!
//! # See also
//! - `repo::repository` for reconciliation rules built on this contract.

use crate::cancel::Cancellation;
use crate::model::entity::Entity;
use crate::model::key::IdentityKey;
use crate::repo::error::RepoResult;
use crate::repo::query::Query;
use async_trait::async_trait;
use std::fmt::{Display, Formatter};

pub(crate) mod identity_map;
mod sqlite;

pub use sqlite::SqliteSession;

/// Lifecycle tag of a record with respect to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingState {
    /// Not known to the session.
    Untracked,
    /// Known and pending insert; becomes `Active` after flush.
    Added,
    /// Known and matching its stored row.
    Active,
    /// Known and marked for update.
    Dirty,
    /// Known and marked for removal.
    PendingDelete,
}

impl Display for TrackingState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Untracked => "untracked",
            Self::Added => "added",
            Self::Active => "active",
            Self::Dirty => "dirty",
            Self::PendingDelete => "pending_delete",
        };
        f.write_str(label)
    }
}

/// Whether query results join the identity map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrackingMode {
    /// Results are tracked and change-detected on flush.
    #[default]
    Tracking,
    /// Results are detached copies.
    NoTracking,
}

/// Session-local handle to one tracked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub(crate) u64);

/// Call counters kept by a session for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub adds: u64,
    pub attaches: u64,
    pub removes: u64,
    pub detaches: u64,
    pub dirty_marks: u64,
    pub flushes: u64,
    pub rows_written: u64,
}

/// Per-object tracked persistence.
///
/// Implementations own an identity map and a store handle. Records passed in
/// are moved into the map; callers address the tracked copy through the
/// returned [`EntryId`].
#[async_trait]
pub trait PersistenceSession: Send + Sync {
    fn is_disposed(&self) -> bool;

    /// Verifies that the store can hold `E` (table and columns present).
    async fn ensure_ready<E: Entity>(&self) -> RepoResult<()>;

    /// Tracks `record` as a pending insert.
    fn add<E: Entity>(&mut self, record: E) -> RepoResult<EntryId>;

    /// Tracks `record` as already stored, in `state`.
    fn attach<E: Entity>(&mut self, record: E, state: TrackingState) -> RepoResult<EntryId>;

    /// Marks an entry for removal. A pending insert is detached instead.
    fn remove(&mut self, entry: EntryId) -> RepoResult<()>;

    /// Forgets an entry without writing anything.
    fn detach(&mut self, entry: EntryId) -> RepoResult<()>;

    /// Marks `fields` dirty. `Active` and `PendingDelete` entries become
    /// `Dirty`; `Added` entries stay `Added`.
    fn mark_dirty(&mut self, entry: EntryId, fields: &[&'static str]) -> RepoResult<()>;

    /// Records that `fields` of `entry` were written outside the session, so
    /// flush does not write them again.
    fn accept_fields(&mut self, entry: EntryId, fields: &[&'static str]) -> RepoResult<()>;

    /// Tracking state of `entry`; `Untracked` when unknown.
    fn state(&self, entry: EntryId) -> TrackingState;

    /// First tracked `E` entry whose key equals `key`.
    fn find_tracked<E: Entity>(&self, key: &IdentityKey) -> RepoResult<Option<EntryId>>;

    fn tracked<E: Entity>(&self, entry: EntryId) -> Option<&E>;

    fn tracked_mut<E: Entity>(&mut self, entry: EntryId) -> Option<&mut E>;

    /// Every tracked `E` entry in tracking order.
    fn tracked_entries<E: Entity>(&self) -> Vec<EntryId>;

    /// Executes `query`, attaching results unless it is `NoTracking`.
    async fn load<E: Entity>(
        &mut self,
        query: Query<E>,
        cancel: &Cancellation,
    ) -> RepoResult<Vec<E>>;

    /// Writes all pending changes in one transaction and returns affected rows.
    ///
    /// On failure or cancellation tracking state is left unchanged.
    async fn flush(&mut self, cancel: &Cancellation) -> RepoResult<usize>;

    /// Releases the store handle and clears the identity map. Idempotent.
    fn dispose(&mut self);

    fn stats(&self) -> SessionStats;
}
