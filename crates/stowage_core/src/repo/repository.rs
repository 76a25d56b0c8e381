//! Generic entity repository.
//!
//! # Responsibility
//! - Expose uniform query/insert/update/delete operations for one entity type.
//! - Dispatch large update/delete batches to the bulk engine and everything
//!   else through the persistence session.
//! - Reconcile incoming values with instances the session already tracks.
//!
//! # Invariants
//! - Batches with `len >= bulk_threshold` reach the bulk engine exactly once;
//!   smaller batches never do.
//! - Reconciliation always transitions the session-resident instance, never a
//!   second instance with the same identity.
//! - Field selections are resolved before any tracking change or store I/O.
//! - After `dispose`, every operation fails with `RepoError::SessionDisposed`.
//!
//! # See also
//! - `session` for tracking states and flush semantics.
//! - `bulk` for the set-oriented write path.

use crate::bulk::{BulkEngine, BulkOptions, SqliteBulkEngine};
use crate::cancel::Cancellation;
use crate::config::RepositoryOptions;
use crate::db::SqliteStore;
use crate::model::entity::{Entity, Value};
use crate::model::fields::FieldSelection;
use crate::model::key::{IdentityKey, KeyExtractor};
use crate::repo::error::{RepoError, RepoResult};
use crate::repo::query::Query;
use crate::session::{
    EntryId, PersistenceSession, SessionStats, SqliteSession, TrackingMode, TrackingState,
};
use log::{debug, error, info};

/// Write path chosen for one batch call; appears in log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WritePath {
    Bulk,
    Session,
}

impl WritePath {
    fn as_str(self) -> &'static str {
        match self {
            Self::Bulk => "bulk",
            Self::Session => "session",
        }
    }
}

/// Repository for entity `E` over one session and one bulk engine.
///
/// One repository serves one unit of work. Mutating operations take
/// `&mut self`; share nothing across concurrent tasks.
pub struct Repository<E, S = SqliteSession, B = SqliteBulkEngine>
where
    E: Entity,
    S: PersistenceSession,
    B: BulkEngine,
{
    session: S,
    bulk: Option<B>,
    keys: KeyExtractor<E>,
    options: RepositoryOptions,
    disposed: bool,
}

impl<E: Entity> Repository<E> {
    /// Builds a SQLite-backed repository sharing `store` between its session
    /// and its bulk engine.
    pub async fn open(store: &SqliteStore, options: RepositoryOptions) -> RepoResult<Self> {
        Self::new(
            SqliteSession::new(store.clone()),
            SqliteBulkEngine::new(store.clone()),
            options,
        )
        .await
    }
}

impl<E, S, B> Repository<E, S, B>
where
    E: Entity,
    S: PersistenceSession,
    B: BulkEngine,
{
    /// Validates options and entity metadata, then checks that the store can
    /// hold `E`.
    ///
    /// # Errors
    /// - `InvalidOptions` for zero thresholds or batch sizes.
    /// - `SchemaError` when `E` has no usable primary key.
    /// - `MissingRequiredTable` / `MissingRequiredColumn` when the store is
    ///   not ready.
    pub async fn new(session: S, bulk: B, options: RepositoryOptions) -> RepoResult<Self> {
        options.validate()?;
        let keys = KeyExtractor::<E>::resolve()?;
        if let Err(err) = session.ensure_ready::<E>().await {
            error!(
                "event=repo_open module=repo status=error entity={} error={}",
                E::schema().name,
                err
            );
            return Err(err);
        }
        info!(
            "event=repo_open module=repo status=ok entity={} bulk_threshold={} bulk_insert={}",
            E::schema().name,
            options.bulk_threshold,
            options.bulk_insert
        );
        Ok(Self {
            session,
            bulk: Some(bulk),
            keys,
            options,
            disposed: false,
        })
    }

    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    /// Bulk engine, until the repository is disposed.
    pub fn bulk_engine(&self) -> Option<&B> {
        self.bulk.as_ref()
    }

    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed || self.session.is_disposed()
    }

    /// Identity key of `record` in declared key order.
    pub fn key_of(&self, record: &E) -> RepoResult<IdentityKey> {
        self.keys.keys_of(record)
    }

    /// Starts a lazy query over every `E` row in `mode`.
    ///
    /// Nothing touches the store until the query is passed to [`Self::fetch`].
    pub fn query(&self, mode: TrackingMode) -> Query<E> {
        Query::<E>::new().tracking(mode)
    }

    /// Executes `query`. Tracked results are the session's copies.
    pub async fn fetch(&mut self, query: Query<E>, cancel: &Cancellation) -> RepoResult<Vec<E>> {
        self.ensure_open()?;
        self.session.load(query, cancel).await
    }

    /// Looks `key` up in the session first, then in the store.
    ///
    /// An entry pending deletion is reported as absent.
    pub async fn find(&mut self, key: &IdentityKey, cancel: &Cancellation) -> RepoResult<Option<E>> {
        self.ensure_open()?;
        if let Some(entry) = self.session.find_tracked::<E>(key)? {
            if self.session.state(entry) == TrackingState::PendingDelete {
                return Ok(None);
            }
            return Ok(self.session.tracked::<E>(entry).cloned());
        }
        let query = Query::<E>::new().filter_key(key).limit(1);
        let mut rows = self.session.load(query, cancel).await?;
        Ok(rows.pop())
    }

    /// Tracked copy holding `key`, if any.
    pub fn tracked(&self, key: &IdentityKey) -> RepoResult<Option<&E>> {
        self.ensure_open()?;
        Ok(self
            .session
            .find_tracked::<E>(key)?
            .and_then(|entry| self.session.tracked::<E>(entry)))
    }

    /// Mutable tracked copy holding `key`. Changes are picked up by the next
    /// flush through snapshot comparison.
    pub fn tracked_mut(&mut self, key: &IdentityKey) -> RepoResult<Option<&mut E>> {
        self.ensure_open()?;
        match self.session.find_tracked::<E>(key)? {
            Some(entry) => Ok(self.session.tracked_mut::<E>(entry)),
            None => Ok(None),
        }
    }

    /// Tracking state of the entry sharing `record`'s identity.
    pub fn state_of(&self, record: &E) -> RepoResult<TrackingState> {
        self.ensure_open()?;
        let key = self.keys.keys_of(record)?;
        Ok(self
            .session
            .find_tracked::<E>(&key)?
            .map_or(TrackingState::Untracked, |entry| self.session.state(entry)))
    }

    /// Tracks `record` as a pending insert and flushes when `save_immediately`.
    ///
    /// Returns the tracked copy, carrying any store-generated key once flushed.
    ///
    /// # Errors
    /// - `AlreadyTracked` when the session holds an instance with the same key.
    pub async fn insert(
        &mut self,
        record: E,
        save_immediately: bool,
        cancel: &Cancellation,
    ) -> RepoResult<E> {
        self.ensure_open()?;
        cancel.check()?;
        self.ensure_untracked(&record)?;
        let entry = self.session.add(record)?;
        if save_immediately {
            self.flush(cancel).await?;
        }
        self.tracked_copy(entry)
    }

    /// Inserts `records` in order and returns them after key assignment.
    ///
    /// Batches go through the session unless `RepositoryOptions::bulk_insert`
    /// is set and the batch reaches the threshold; bulk-inserted records are
    /// committed by the engine and left untracked.
    pub async fn insert_batch(
        &mut self,
        records: Vec<E>,
        save_immediately: bool,
        cancel: &Cancellation,
    ) -> RepoResult<Vec<E>> {
        self.ensure_open()?;
        if records.is_empty() {
            return Ok(records);
        }
        cancel.check()?;

        let count = records.len();
        if self.options.bulk_insert && self.options.uses_bulk(count) {
            let mut records = records;
            let options = BulkOptions::from_repository(&self.options);
            let affected = self
                .bulk()?
                .bulk_insert(&mut records, &options, cancel)
                .await?;
            self.log_batch("repo_insert_batch", WritePath::Bulk, count, affected);
            return Ok(records);
        }

        let mut pending: Vec<IdentityKey> = Vec::with_capacity(count);
        for record in &records {
            let key = self.ensure_untracked(record)?;
            if pending.iter().any(|seen| seen.same_identity(&key)) {
                return Err(RepoError::AlreadyTracked {
                    entity: E::schema().name,
                    key,
                });
            }
            pending.push(key);
        }

        let entries = records
            .into_iter()
            .map(|record| self.session.add(record))
            .collect::<RepoResult<Vec<_>>>()?;
        let affected = if save_immediately {
            self.flush(cancel).await?
        } else {
            0
        };
        self.log_batch("repo_insert_batch", WritePath::Session, count, affected);

        entries
            .into_iter()
            .map(|entry| self.tracked_copy(entry))
            .collect()
    }

    /// Marks the instance sharing `record`'s identity for deletion.
    ///
    /// A tracked instance takes precedence over `record`; otherwise a copy of
    /// `record` is attached and marked.
    pub async fn delete(
        &mut self,
        record: &E,
        save_immediately: bool,
        cancel: &Cancellation,
    ) -> RepoResult<()> {
        self.ensure_open()?;
        cancel.check()?;
        self.mark_deleted(record)?;
        if save_immediately {
            self.flush(cancel).await?;
        }
        Ok(())
    }

    /// Deletes `records`, using the bulk engine once the batch reaches the
    /// threshold unless `force_individual` is set.
    ///
    /// The bulk path commits on its own and detaches any tracked instance
    /// whose key it deleted. The session path reconciles each record exactly
    /// like [`Self::delete`].
    pub async fn delete_batch(
        &mut self,
        records: &[E],
        save_immediately: bool,
        force_individual: bool,
        cancel: &Cancellation,
    ) -> RepoResult<()> {
        self.ensure_open()?;
        if records.is_empty() {
            return Ok(());
        }
        cancel.check()?;

        if !force_individual && self.options.uses_bulk(records.len()) {
            self.ensure_keyed(records)?;
            let options = BulkOptions::from_repository(&self.options);
            let affected = self.bulk()?.bulk_delete(records, &options, cancel).await?;
            for record in records {
                let key = self.keys.keys_of(record)?;
                if let Some(entry) = self.session.find_tracked::<E>(&key)? {
                    self.session.detach(entry)?;
                }
            }
            self.log_batch("repo_delete_batch", WritePath::Bulk, records.len(), affected);
            return Ok(());
        }

        for record in records {
            self.mark_deleted(record)?;
        }
        let affected = if save_immediately {
            self.flush(cancel).await?
        } else {
            0
        };
        self.log_batch("repo_delete_batch", WritePath::Session, records.len(), affected);
        Ok(())
    }

    /// Updates the instance sharing `record`'s identity.
    ///
    /// `FieldSelection::All` replaces every non-key field. A partial selection
    /// copies and marks only the selected fields, so other stored values stay
    /// untouched even when `record` holds different ones.
    pub async fn update(
        &mut self,
        record: &E,
        save_immediately: bool,
        selection: &FieldSelection,
        cancel: &Cancellation,
    ) -> RepoResult<()> {
        self.ensure_open()?;
        let fields = selection.resolve(E::schema())?;
        cancel.check()?;
        self.mark_updated(record, &fields)?;
        if save_immediately {
            self.flush(cancel).await?;
        }
        Ok(())
    }

    /// Like [`Self::update`], but requires an already tracked instance.
    ///
    /// # Errors
    /// - `NotAttached` when no tracked instance has `record`'s key.
    pub async fn update_tracked(
        &mut self,
        record: &E,
        save_immediately: bool,
        selection: &FieldSelection,
        cancel: &Cancellation,
    ) -> RepoResult<()> {
        self.ensure_open()?;
        let fields = selection.resolve(E::schema())?;
        let key = self.keys.keys_of(record)?;
        if self.session.find_tracked::<E>(&key)?.is_none() {
            return Err(RepoError::NotAttached {
                entity: E::schema().name,
                key,
            });
        }
        cancel.check()?;
        self.mark_updated(record, &fields)?;
        if save_immediately {
            self.flush(cancel).await?;
        }
        Ok(())
    }

    /// Updates `records`, using the bulk engine once the batch reaches the
    /// threshold.
    ///
    /// The bulk path writes the selected columns and refreshes any tracked
    /// instance with the written values. The session path reconciles each
    /// record like [`Self::update`] and flushes once.
    pub async fn update_batch(
        &mut self,
        records: &[E],
        save_immediately: bool,
        selection: &FieldSelection,
        cancel: &Cancellation,
    ) -> RepoResult<()> {
        self.ensure_open()?;
        if records.is_empty() {
            return Ok(());
        }
        let fields = selection.resolve(E::schema())?;
        cancel.check()?;

        if self.options.uses_bulk(records.len()) {
            self.ensure_keyed(records)?;
            let options = BulkOptions::from_repository(&self.options).with_columns(selection.clone());
            let affected = self.bulk()?.bulk_update(records, &options, cancel).await?;
            for record in records {
                let key = self.keys.keys_of(record)?;
                if let Some(entry) = self.session.find_tracked::<E>(&key)? {
                    self.copy_fields(entry, record, &fields)?;
                    self.session.accept_fields(entry, &fields)?;
                }
            }
            self.log_batch("repo_update_batch", WritePath::Bulk, records.len(), affected);
            return Ok(());
        }

        for record in records {
            self.mark_updated(record, &fields)?;
        }
        let affected = if save_immediately {
            self.flush(cancel).await?
        } else {
            0
        };
        self.log_batch("repo_update_batch", WritePath::Session, records.len(), affected);
        Ok(())
    }

    /// Flushes every pending change and returns the affected row count.
    pub async fn save(&mut self, cancel: &Cancellation) -> RepoResult<usize> {
        self.ensure_open()?;
        self.flush(cancel).await
    }

    /// Releases the session and the bulk engine. Safe to call repeatedly.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        let stats = self.session.stats();
        self.session.dispose();
        self.bulk = None;
        info!(
            "event=repo_dispose module=repo status=ok entity={} adds={} attaches={} removes={} flushes={} rows_written={}",
            E::schema().name,
            stats.adds,
            stats.attaches,
            stats.removes,
            stats.flushes,
            stats.rows_written
        );
    }

    fn ensure_open(&self) -> RepoResult<()> {
        if self.is_disposed() {
            return Err(RepoError::SessionDisposed);
        }
        Ok(())
    }

    fn bulk(&self) -> RepoResult<&B> {
        self.bulk.as_ref().ok_or(RepoError::SessionDisposed)
    }

    async fn flush(&mut self, cancel: &Cancellation) -> RepoResult<usize> {
        match self.session.flush(cancel).await {
            Ok(affected) => Ok(affected),
            Err(err) => {
                error!(
                    "event=repo_save module=repo status=error entity={} error={}",
                    E::schema().name,
                    err
                );
                Err(err)
            }
        }
    }

    fn tracked_copy(&self, entry: EntryId) -> RepoResult<E> {
        self.session.tracked::<E>(entry).cloned().ok_or_else(|| {
            RepoError::InvalidData(format!(
                "tracked `{}` entry disappeared from the session",
                E::schema().name
            ))
        })
    }

    /// Returns `record`'s key, failing when an instance with that key is
    /// already tracked.
    fn ensure_untracked(&self, record: &E) -> RepoResult<IdentityKey> {
        let key = self.keys.keys_of(record)?;
        if self.session.find_tracked::<E>(&key)?.is_some() {
            return Err(RepoError::AlreadyTracked {
                entity: E::schema().name,
                key,
            });
        }
        Ok(key)
    }

    /// Rejects a bulk batch holding a transient key with the same
    /// `NotAttached` the session path raises, before any store I/O.
    fn ensure_keyed(&self, records: &[E]) -> RepoResult<()> {
        for record in records {
            let key = self.keys.keys_of(record)?;
            if key.is_transient() {
                return Err(RepoError::NotAttached {
                    entity: E::schema().name,
                    key,
                });
            }
        }
        Ok(())
    }

    /// Finds the tracked instance for `record`, attaching a copy as `Active`
    /// when none exists.
    fn reconcile(&mut self, record: &E) -> RepoResult<(EntryId, bool)> {
        let key = self.keys.keys_of(record)?;
        if let Some(entry) = self.session.find_tracked::<E>(&key)? {
            return Ok((entry, true));
        }
        if key.is_transient() {
            return Err(RepoError::NotAttached {
                entity: E::schema().name,
                key,
            });
        }
        let entry = self.session.attach(record.clone(), TrackingState::Active)?;
        Ok((entry, false))
    }

    fn mark_deleted(&mut self, record: &E) -> RepoResult<()> {
        let (entry, _) = self.reconcile(record)?;
        self.session.remove(entry)
    }

    fn mark_updated(&mut self, record: &E, fields: &[&'static str]) -> RepoResult<()> {
        let (entry, was_tracked) = self.reconcile(record)?;
        if was_tracked {
            self.copy_fields(entry, record, fields)?;
        }
        self.session.mark_dirty(entry, fields)
    }

    /// Copies `fields` of `source` onto the tracked instance at `entry`.
    fn copy_fields(&mut self, entry: EntryId, source: &E, fields: &[&'static str]) -> RepoResult<()> {
        let target = self.session.tracked_mut::<E>(entry).ok_or_else(|| {
            RepoError::InvalidData(format!(
                "tracked `{}` entry holds a different type",
                E::schema().name
            ))
        })?;
        for field in fields {
            target.set_field(field, source.field(field).unwrap_or(Value::Null))?;
        }
        Ok(())
    }

    fn log_batch(&self, event: &'static str, path: WritePath, count: usize, affected: usize) {
        debug!(
            "event={event} module=repo status=ok entity={} path={} count={count} affected={affected}",
            E::schema().name,
            path.as_str()
        );
    }
}

impl<E, S, B> Drop for Repository<E, S, B>
where
    E: Entity,
    S: PersistenceSession,
    B: BulkEngine,
{
    fn drop(&mut self) {
        self.dispose();
    }
}
