//! SQLite bulk engine.
//!
//! Records are converted into an owned `WritePlan` on the caller's task and
//! the plan runs as one transaction on the blocking pool.
//!
//! Multi-row statements hold at most `batch_size` rows and never exceed the
//! store's bound-parameter limit. Updates and deletes must hit every listed
//! row, as a session flush must; otherwise nothing is committed.

use crate::bulk::{BulkEngine, BulkOptions};
use crate::cancel::Cancellation;
use crate::db::plan::{
    delete_many_statement, insert_many_statement, insert_statement, rows_per_statement,
    update_statement, StatementOutcome, WritePlan,
};
use crate::db::SqliteStore;
use crate::model::entity::{Entity, Value};
use crate::model::key::{IdentityKey, KeyExtractor};
use crate::repo::error::RepoResult;
use async_trait::async_trait;
use log::{debug, error};
use std::collections::HashSet;
use std::time::Instant;

/// Bulk engine sharing a [`SqliteStore`] handle with the session.
#[derive(Debug, Clone)]
pub struct SqliteBulkEngine {
    store: SqliteStore,
}

impl SqliteBulkEngine {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    async fn run_plan(
        &self,
        operation: &'static str,
        entity: &'static str,
        records: usize,
        plan: WritePlan,
        cancel: &Cancellation,
    ) -> RepoResult<Vec<StatementOutcome>> {
        let started_at = Instant::now();
        let statements = plan.len();
        let token = cancel.clone();
        let result = self.store.run(move |conn| plan.execute(conn, &token)).await;

        match &result {
            Ok(outcomes) => debug!(
                "event={operation} module=bulk status=ok entity={entity} records={records} statements={statements} affected={} duration_ms={}",
                affected(outcomes),
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event={operation} module=bulk status=error entity={entity} records={records} statements={statements} duration_ms={} error={err}",
                started_at.elapsed().as_millis()
            ),
        }
        result
    }
}

fn affected(outcomes: &[StatementOutcome]) -> usize {
    outcomes.iter().map(|outcome| outcome.affected).sum()
}

#[async_trait]
impl BulkEngine for SqliteBulkEngine {
    async fn bulk_insert<E: Entity>(
        &self,
        records: &mut [E],
        options: &BulkOptions,
        cancel: &Cancellation,
    ) -> RepoResult<usize> {
        KeyExtractor::<E>::resolve()?;
        cancel.check()?;
        if records.is_empty() {
            return Ok(0);
        }

        let schema = E::schema();
        let generated_column = schema
            .generated_key
            .and_then(|key| schema.fields.iter().position(|field| *field == key));
        let rows: Vec<Vec<Value>> = records.iter().map(Entity::values).collect();

        // (statement index, record index) pairs awaiting a generated key.
        let mut pending_keys = Vec::new();
        let mut plan = WritePlan::default();
        let batch_size = rows_per_statement(options.batch_size, schema.fields.len());
        for (chunk_index, chunk) in rows.chunks(batch_size).enumerate() {
            let needs_rowid = generated_column.is_some_and(|column| {
                chunk
                    .iter()
                    .any(|row| matches!(row.get(column), Some(Value::Null)))
            });
            if !needs_rowid {
                plan.push(insert_many_statement(schema, chunk));
                continue;
            }
            for (offset, row) in chunk.iter().enumerate() {
                let statement = insert_statement(schema, row);
                if statement.returns_rowid {
                    pending_keys.push((plan.len(), chunk_index * batch_size + offset));
                }
                plan.push(statement);
            }
        }

        let outcomes = self
            .run_plan("bulk_insert", schema.name, records.len(), plan, cancel)
            .await?;

        if let Some(field) = schema.generated_key {
            for (statement, record) in pending_keys {
                if let Some(rowid) = outcomes.get(statement).and_then(|o| o.inserted_rowid) {
                    records[record].set_field(field, Value::Integer(rowid))?;
                }
            }
        }
        Ok(affected(&outcomes))
    }

    async fn bulk_update<E: Entity>(
        &self,
        records: &[E],
        options: &BulkOptions,
        cancel: &Cancellation,
    ) -> RepoResult<usize> {
        let keys = KeyExtractor::<E>::resolve()?;
        let schema = E::schema();
        let columns = options.columns.resolve(schema)?;
        cancel.check()?;
        if records.is_empty() || columns.is_empty() {
            return Ok(0);
        }

        let mut plan = WritePlan::default();
        for record in records {
            let key = keys.keys_of(record)?;
            let assignments: Vec<(&'static str, Value)> = columns
                .iter()
                .map(|column| (*column, record.field(column).unwrap_or(Value::Null)))
                .collect();
            plan.push(
                update_statement(schema, &assignments, key.values()).require_row(schema, key),
            );
        }

        let outcomes = self
            .run_plan("bulk_update", schema.name, records.len(), plan, cancel)
            .await?;
        Ok(affected(&outcomes))
    }

    async fn bulk_delete<E: Entity>(
        &self,
        records: &[E],
        options: &BulkOptions,
        cancel: &Cancellation,
    ) -> RepoResult<usize> {
        let keys = KeyExtractor::<E>::resolve()?;
        cancel.check()?;
        if records.is_empty() {
            return Ok(0);
        }

        let schema = E::schema();
        let mut seen = HashSet::with_capacity(records.len());
        let mut distinct: Vec<IdentityKey> = Vec::with_capacity(records.len());
        for record in records {
            let key = keys.keys_of(record)?;
            if seen.insert(format!("{:?}", key.values())) {
                distinct.push(key);
            }
        }

        let mut plan = WritePlan::default();
        let chunk_rows = rows_per_statement(options.batch_size, schema.primary_key.len());
        for chunk in distinct.chunks(chunk_rows) {
            let key_rows: Vec<Vec<Value>> =
                chunk.iter().map(|key| key.values().to_vec()).collect();
            plan.push(
                delete_many_statement(schema, &key_rows).require_rows(schema, chunk.to_vec()),
            );
        }

        let outcomes = self
            .run_plan("bulk_delete", schema.name, records.len(), plan, cancel)
            .await?;
        Ok(affected(&outcomes))
    }
}
