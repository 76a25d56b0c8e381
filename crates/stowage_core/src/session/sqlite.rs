//! SQLite-backed persistence session.
//!
//! # Responsibility
//! - Track records in an identity map and flush their changes as one
//!   transaction on the blocking pool.
//! - Hydrate query results and reconcile them with tracked copies.
//!
//! # Invariants
//! - Flush writes entries in tracking order.
//! - Flush bookkeeping is applied only after the transaction commits.
//! - A stored entry whose key changed in memory is never written.
//! - Every flushed update or delete must hit its row; otherwise the flush
//!   fails with `RowNotFound` and commits nothing.

use crate::cancel::Cancellation;
use crate::db::plan::{
    delete_statement, insert_statement, update_statement, StatementOutcome, WritePlan,
};
use crate::db::{ensure_table_ready, SqliteStore};
use crate::model::entity::{Entity, Value};
use crate::model::key::{IdentityKey, KeyExtractor};
use crate::repo::error::{RepoError, RepoResult};
use crate::repo::query::Query;
use crate::session::identity_map::{IdentityMap, TrackedEntry};
use crate::session::{EntryId, PersistenceSession, SessionStats, TrackingMode, TrackingState};
use async_trait::async_trait;
use log::{debug, error, info};
use rusqlite::params_from_iter;
use std::time::Instant;
use uuid::Uuid;

/// What a flushed entry becomes once the transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushStep {
    Inserted,
    Updated,
    Deleted,
    /// No statement needed; the entry just returns to `Active`.
    Settled,
}

/// Session over one [`SqliteStore`] handle.
pub struct SqliteSession {
    id: Uuid,
    store: Option<SqliteStore>,
    map: IdentityMap,
    stats: SessionStats,
}

impl SqliteSession {
    pub fn new(store: SqliteStore) -> Self {
        let id = Uuid::new_v4();
        debug!("event=session_open module=session status=ok session_id={id}");
        Self {
            id,
            store: Some(store),
            map: IdentityMap::default(),
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of tracked entries of every type.
    pub fn tracked_count(&self) -> usize {
        self.map.len()
    }

    fn store(&self) -> RepoResult<&SqliteStore> {
        self.store.as_ref().ok_or(RepoError::SessionDisposed)
    }

    fn ensure_open(&self) -> RepoResult<()> {
        self.store().map(|_| ())
    }

    fn entry_mut(&mut self, entry: EntryId) -> RepoResult<&mut TrackedEntry> {
        self.map.get_mut(entry).ok_or_else(|| {
            RepoError::InvalidData(format!("entry {} is not tracked by this session", entry.0))
        })
    }

    /// Builds the flush plan and the per-entry step each statement maps to.
    fn plan_flush(&self) -> RepoResult<(WritePlan, Vec<(EntryId, FlushStep)>)> {
        let mut plan = WritePlan::default();
        let mut steps = Vec::new();

        for (id, entry) in self.map.iter() {
            let schema = entry.record.entity_schema();
            match entry.state {
                TrackingState::Untracked => {}
                TrackingState::Added => {
                    plan.push(insert_statement(schema, &entry.record.current_values()));
                    steps.push((id, FlushStep::Inserted));
                }
                TrackingState::Active | TrackingState::Dirty => {
                    let changed = entry.changed_fields();
                    if changed.is_empty() {
                        if entry.state == TrackingState::Dirty {
                            steps.push((id, FlushStep::Settled));
                        }
                        continue;
                    }
                    let key = stable_key(entry)?;
                    let columns: Vec<(&'static str, Value)> = changed
                        .into_iter()
                        .map(|field| (field, entry.record.value_of(field)))
                        .collect();
                    plan.push(
                        update_statement(schema, &columns, &key)
                            .require_row(schema, IdentityKey::new(key)),
                    );
                    steps.push((id, FlushStep::Updated));
                }
                TrackingState::PendingDelete => {
                    let key = entry
                        .stored_key
                        .clone()
                        .unwrap_or_else(|| entry.current_key());
                    plan.push(
                        delete_statement(schema, &key)
                            .require_row(schema, IdentityKey::new(key)),
                    );
                    steps.push((id, FlushStep::Deleted));
                }
            }
        }

        Ok((plan, steps))
    }

    /// Applies committed outcomes to the identity map.
    fn apply_flush(
        &mut self,
        steps: Vec<(EntryId, FlushStep)>,
        outcomes: Vec<StatementOutcome>,
    ) -> RepoResult<usize> {
        let mut outcomes = outcomes.into_iter();
        let mut affected = 0;

        for (id, step) in steps {
            let outcome = match step {
                FlushStep::Settled => None,
                _ => outcomes.next(),
            };
            affected += outcome.map_or(0, |outcome| outcome.affected);

            if step == FlushStep::Deleted {
                self.map.remove(id);
                continue;
            }

            let entry = self.entry_mut(id)?;
            if let Some(rowid) = outcome.and_then(|outcome| outcome.inserted_rowid) {
                if let Some(field) = entry.record.entity_schema().generated_key {
                    entry.record.assign(field, Value::Integer(rowid))?;
                }
            }
            entry.accept_stored();
        }

        Ok(affected)
    }
}

/// Key used in the `WHERE` clause of an update: the stored key, which must
/// still match the record's current key.
fn stable_key(entry: &TrackedEntry) -> RepoResult<Vec<Value>> {
    let current = entry.current_key();
    match &entry.stored_key {
        Some(stored) if *stored != current => Err(RepoError::InvalidData(format!(
            "key of tracked `{}` entry changed from {} to {}",
            entry.record.entity_schema().name,
            IdentityKey::new(stored.clone()),
            IdentityKey::new(current)
        ))),
        _ => Ok(current),
    }
}

#[async_trait]
impl PersistenceSession for SqliteSession {
    fn is_disposed(&self) -> bool {
        self.store.is_none()
    }

    async fn ensure_ready<E: Entity>(&self) -> RepoResult<()> {
        let schema = E::schema();
        self.store()?
            .run(move |conn| ensure_table_ready(conn, schema))
            .await
    }

    fn add<E: Entity>(&mut self, record: E) -> RepoResult<EntryId> {
        self.ensure_open()?;
        self.stats.adds += 1;
        Ok(self.map.insert(TrackedEntry::added(record)))
    }

    fn attach<E: Entity>(&mut self, record: E, state: TrackingState) -> RepoResult<EntryId> {
        self.ensure_open()?;
        if state == TrackingState::Untracked {
            return Err(RepoError::InvalidData(
                "cannot attach a record as untracked".to_string(),
            ));
        }
        if state == TrackingState::Added {
            return self.add(record);
        }
        let key = KeyExtractor::<E>::resolve()?.keys_of(&record)?;
        self.stats.attaches += 1;
        Ok(self.map.insert(TrackedEntry::stored(record, &key, state)))
    }

    fn remove(&mut self, entry: EntryId) -> RepoResult<()> {
        self.ensure_open()?;
        self.stats.removes += 1;
        let tracked = self.entry_mut(entry)?;
        if tracked.state == TrackingState::Added {
            self.map.remove(entry);
        } else {
            tracked.state = TrackingState::PendingDelete;
        }
        Ok(())
    }

    fn detach(&mut self, entry: EntryId) -> RepoResult<()> {
        self.ensure_open()?;
        self.stats.detaches += 1;
        self.map.remove(entry);
        Ok(())
    }

    fn mark_dirty(&mut self, entry: EntryId, fields: &[&'static str]) -> RepoResult<()> {
        self.ensure_open()?;
        self.stats.dirty_marks += 1;
        let tracked = self.entry_mut(entry)?;
        tracked.mark_dirty(fields);
        if tracked.state != TrackingState::Added {
            tracked.state = TrackingState::Dirty;
        }
        Ok(())
    }

    fn accept_fields(&mut self, entry: EntryId, fields: &[&'static str]) -> RepoResult<()> {
        self.ensure_open()?;
        self.entry_mut(entry)?.accept_fields(fields);
        Ok(())
    }

    fn state(&self, entry: EntryId) -> TrackingState {
        self.map
            .get(entry)
            .map_or(TrackingState::Untracked, |tracked| tracked.state)
    }

    fn find_tracked<E: Entity>(&self, key: &IdentityKey) -> RepoResult<Option<EntryId>> {
        self.ensure_open()?;
        self.map.find(&KeyExtractor::<E>::resolve()?, key)
    }

    fn tracked<E: Entity>(&self, entry: EntryId) -> Option<&E> {
        self.map.get(entry).and_then(|tracked| tracked.downcast_ref::<E>())
    }

    fn tracked_mut<E: Entity>(&mut self, entry: EntryId) -> Option<&mut E> {
        self.map
            .get_mut(entry)
            .and_then(|tracked| tracked.downcast_mut::<E>())
    }

    fn tracked_entries<E: Entity>(&self) -> Vec<EntryId> {
        self.map.ids_of::<E>()
    }

    async fn load<E: Entity>(
        &mut self,
        query: Query<E>,
        cancel: &Cancellation,
    ) -> RepoResult<Vec<E>> {
        self.ensure_open()?;
        cancel.check()?;
        let compiled = query.compile()?;
        let mode = query.tracking_mode();
        let token = cancel.clone();

        let rows = self
            .store()?
            .run(move |conn| {
                let mut stmt = conn.prepare(&compiled.sql)?;
                let mut rows = stmt.query(params_from_iter(compiled.params.iter()))?;
                let mut records = Vec::new();
                while let Some(row) = rows.next()? {
                    token.check()?;
                    records.push(E::from_row(row)?);
                }
                Ok(records)
            })
            .await?;

        if mode == TrackingMode::NoTracking {
            return Ok(rows);
        }

        let keys = KeyExtractor::<E>::resolve()?;
        let mut results = Vec::with_capacity(rows.len());
        for record in rows {
            let key = keys.keys_of(&record)?;
            let entry = match self.map.find(&keys, &key)? {
                Some(entry) => entry,
                None => {
                    self.stats.attaches += 1;
                    self.map
                        .insert(TrackedEntry::stored(record, &key, TrackingState::Active))
                }
            };
            let tracked = self.tracked::<E>(entry).cloned().ok_or_else(|| {
                RepoError::InvalidData(format!("entry {} lost during load", entry.0))
            })?;
            results.push(tracked);
        }
        Ok(results)
    }

    async fn flush(&mut self, cancel: &Cancellation) -> RepoResult<usize> {
        self.ensure_open()?;
        cancel.check()?;
        let started_at = Instant::now();
        let (plan, steps) = self.plan_flush()?;

        if plan.is_empty() {
            self.stats.flushes += 1;
            return self.apply_flush(steps, Vec::new());
        }

        let statements = plan.len();
        let token = cancel.clone();
        let result = self
            .store()?
            .run(move |conn| plan.execute(conn, &token))
            .await;

        let outcomes = match result {
            Ok(outcomes) => outcomes,
            Err(err) => {
                error!(
                    "event=session_flush module=session status=error session_id={} statements={} duration_ms={} error={}",
                    self.id,
                    statements,
                    started_at.elapsed().as_millis(),
                    err
                );
                return Err(err);
            }
        };

        let affected = self.apply_flush(steps, outcomes)?;
        self.stats.flushes += 1;
        self.stats.rows_written += affected as u64;
        debug!(
            "event=session_flush module=session status=ok session_id={} statements={} affected={} duration_ms={}",
            self.id,
            statements,
            affected,
            started_at.elapsed().as_millis()
        );
        Ok(affected)
    }

    fn dispose(&mut self) {
        if self.store.take().is_none() {
            return;
        }
        let released = self.map.len();
        self.map.clear();
        info!(
            "event=session_dispose module=session status=ok session_id={} released_entries={} flushes={} rows_written={}",
            self.id, released, self.stats.flushes, self.stats.rows_written
        );
    }

    fn stats(&self) -> SessionStats {
        self.stats
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        self.dispose();
    }
}
