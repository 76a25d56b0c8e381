//! Owned SQL statement plans.
//!
//! Sessions and bulk engines translate tracked or batched records into a
//! `WritePlan` on the caller's task, then execute the whole plan inside one
//! transaction on the blocking pool.
//!
//! # Invariants
//! - Table and column names come from validated `EntitySchema` values only.
//! - Record values are always bound as parameters.
//! - Cancellation is checked before every statement and before commit, and
//!   interrupts a statement that is already running; a cancelled or failed
//!   plan commits nothing.
//! - A statement guarded with [`PlannedStatement::require_row`] or
//!   [`PlannedStatement::require_rows`] that misses a row fails the whole
//!   plan with `RepoError::RowNotFound`.
//! - No statement binds more than [`MAX_BOUND_PARAMETERS`] values.

use crate::cancel::Cancellation;
use crate::model::entity::{EntitySchema, Value};
use crate::model::key::IdentityKey;
use crate::repo::error::{RepoError, RepoResult};
use rusqlite::{params_from_iter, Connection, TransactionBehavior};

/// Host-parameter limit of the bundled SQLite (`SQLITE_MAX_VARIABLE_NUMBER`).
pub(crate) const MAX_BOUND_PARAMETERS: usize = 32_766;

/// Rows per multi-row statement: `batch_size`, capped so one statement never
/// binds more than [`MAX_BOUND_PARAMETERS`] values.
pub(crate) fn rows_per_statement(batch_size: usize, params_per_row: usize) -> usize {
    let cap = MAX_BOUND_PARAMETERS / params_per_row.max(1);
    batch_size.min(cap).max(1)
}

/// One parameterized statement.
#[derive(Debug, Clone)]
pub(crate) struct PlannedStatement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Capture `last_insert_rowid()` after this statement.
    pub returns_rowid: bool,
    pub required_rows: Option<RowCheck>,
}

impl PlannedStatement {
    /// Fails the plan with `RowNotFound` when this statement affects no row.
    pub fn require_row(self, schema: &'static EntitySchema, key: IdentityKey) -> Self {
        self.require_rows(schema, vec![key])
    }

    /// Fails the plan with `RowNotFound` unless every row in `keys` is
    /// affected. `keys` must be distinct.
    pub fn require_rows(mut self, schema: &'static EntitySchema, keys: Vec<IdentityKey>) -> Self {
        self.required_rows = Some(RowCheck { schema, keys });
        self
    }
}

/// Stored rows a statement must touch for its plan to commit.
#[derive(Debug, Clone)]
pub(crate) struct RowCheck {
    schema: &'static EntitySchema,
    keys: Vec<IdentityKey>,
}

impl RowCheck {
    fn is_met(&self, affected: usize) -> bool {
        affected >= self.keys.len()
    }

    /// `RowNotFound` for the first listed key without a stored row. Run after
    /// the failed transaction has rolled back.
    fn not_found(mut self, conn: &Connection) -> RepoError {
        let index = if self.keys.len() > 1 {
            self.keys
                .iter()
                .position(|key| !row_exists(conn, self.schema, key).unwrap_or(true))
                .unwrap_or(0)
        } else {
            0
        };
        RepoError::RowNotFound {
            entity: self.schema.name,
            key: self.keys.swap_remove(index),
        }
    }
}

fn row_exists(conn: &Connection, schema: &EntitySchema, key: &IdentityKey) -> rusqlite::Result<bool> {
    let sql = format!(
        "SELECT 1 FROM {} WHERE {} LIMIT 1;",
        schema.table,
        key_predicate(schema, 1)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.exists(params_from_iter(key.values().iter()))
}

/// Result of one executed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StatementOutcome {
    pub affected: usize,
    pub inserted_rowid: Option<i64>,
}

/// Ordered statements executed as one transaction.
#[derive(Debug, Clone, Default)]
pub(crate) struct WritePlan {
    statements: Vec<PlannedStatement>,
}

impl WritePlan {
    pub fn push(&mut self, statement: PlannedStatement) {
        self.statements.push(statement);
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Runs every statement in order inside one transaction.
    pub fn execute(
        &self,
        conn: &mut Connection,
        cancel: &Cancellation,
    ) -> RepoResult<Vec<StatementOutcome>> {
        // A rollback cut short by an interrupt can leave a transaction open.
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK;")?;
        }
        let handle = conn.get_interrupt_handle();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let _interrupt = cancel.interrupt_on_cancel(handle);
        let mut outcomes = Vec::with_capacity(self.statements.len());
        for statement in &self.statements {
            cancel.check()?;
            let affected = tx
                .prepare_cached(&statement.sql)
                .and_then(|mut stmt| stmt.execute(params_from_iter(statement.params.iter())))
                .map_err(|err| cancelled_or(cancel, err))?;
            if let Some(check) = &statement.required_rows {
                if !check.is_met(affected) {
                    let check = check.clone();
                    drop(tx);
                    return Err(check.not_found(conn));
                }
            }
            outcomes.push(StatementOutcome {
                affected,
                inserted_rowid: statement.returns_rowid.then(|| tx.last_insert_rowid()),
            });
        }
        cancel.check()?;
        tx.commit().map_err(|err| cancelled_or(cancel, err))?;
        Ok(outcomes)
    }
}

/// An interrupted statement surfaces as `Cancelled`, not as a store error.
fn cancelled_or(cancel: &Cancellation, err: rusqlite::Error) -> RepoError {
    if cancel.is_cancelled() {
        RepoError::Cancelled
    } else {
        err.into()
    }
}

/// `INSERT` of every schema field, omitting a `NULL` generated key so the
/// store assigns it.
pub(crate) fn insert_statement(schema: &EntitySchema, values: &[Value]) -> PlannedStatement {
    let mut columns = Vec::with_capacity(schema.fields.len());
    let mut params = Vec::with_capacity(schema.fields.len());
    let mut returns_rowid = false;

    for (field, value) in schema.fields.iter().zip(values) {
        if Some(*field) == schema.generated_key && matches!(value, Value::Null) {
            returns_rowid = true;
            continue;
        }
        columns.push(*field);
        params.push(value.clone());
    }

    let placeholders = (1..=columns.len())
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    PlannedStatement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({placeholders});",
            schema.table,
            columns.join(", ")
        ),
        params,
        returns_rowid,
        required_rows: None,
    }
}

/// Multi-row `INSERT` of every schema field. Rows must carry explicit keys.
pub(crate) fn insert_many_statement(schema: &EntitySchema, rows: &[Vec<Value>]) -> PlannedStatement {
    let width = schema.fields.len();
    let tuples = (0..rows.len())
        .map(|row| {
            let placeholders = (0..width)
                .map(|column| format!("?{}", row * width + column + 1))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({placeholders})")
        })
        .collect::<Vec<_>>()
        .join(", ");
    PlannedStatement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES {tuples};",
            schema.table,
            schema.fields.join(", ")
        ),
        params: rows.iter().flatten().cloned().collect(),
        returns_rowid: false,
        required_rows: None,
    }
}

/// `UPDATE` of `columns` for the row identified by `key`.
pub(crate) fn update_statement(
    schema: &EntitySchema,
    columns: &[(&'static str, Value)],
    key: &[Value],
) -> PlannedStatement {
    let assignments = columns
        .iter()
        .enumerate()
        .map(|(index, (column, _))| format!("{column} = ?{}", index + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let predicate = key_predicate(schema, columns.len() + 1);

    let mut params: Vec<Value> = columns.iter().map(|(_, value)| value.clone()).collect();
    params.extend(key.iter().cloned());
    PlannedStatement {
        sql: format!("UPDATE {} SET {assignments} WHERE {predicate};", schema.table),
        params,
        returns_rowid: false,
        required_rows: None,
    }
}

/// `DELETE` of the row identified by `key`.
pub(crate) fn delete_statement(schema: &EntitySchema, key: &[Value]) -> PlannedStatement {
    PlannedStatement {
        sql: format!(
            "DELETE FROM {} WHERE {};",
            schema.table,
            key_predicate(schema, 1)
        ),
        params: key.to_vec(),
        returns_rowid: false,
        required_rows: None,
    }
}

/// Set-oriented `DELETE` of every row whose key is in `keys`.
pub(crate) fn delete_many_statement(schema: &EntitySchema, keys: &[Vec<Value>]) -> PlannedStatement {
    let width = schema.primary_key.len();
    let tuple = |row: usize| {
        let placeholders = (0..width)
            .map(|column| format!("?{}", row * width + column + 1))
            .collect::<Vec<_>>()
            .join(", ");
        format!("({placeholders})")
    };

    let sql = if width == 1 {
        let placeholders = (1..=keys.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "DELETE FROM {} WHERE {} IN ({placeholders});",
            schema.table, schema.primary_key[0]
        )
    } else {
        let rows = (0..keys.len()).map(tuple).collect::<Vec<_>>().join(", ");
        format!(
            "DELETE FROM {} WHERE ({}) IN (VALUES {rows});",
            schema.table,
            schema.primary_key.join(", ")
        )
    };

    PlannedStatement {
        sql,
        params: keys.iter().flatten().cloned().collect(),
        returns_rowid: false,
        required_rows: None,
    }
}

fn key_predicate(schema: &EntitySchema, first_param: usize) -> String {
    schema
        .primary_key
        .iter()
        .enumerate()
        .map(|(index, column)| format!("{column} = ?{}", first_param + index))
        .collect::<Vec<_>>()
        .join(" AND ")
}

#[cfg(test)]
mod tests {
    use super::{
        delete_many_statement, delete_statement, insert_many_statement, insert_statement,
        rows_per_statement, update_statement, PlannedStatement, WritePlan,
    };
    use crate::cancel::Cancellation;
    use crate::model::entity::{EntitySchema, Value};
    use crate::model::key::IdentityKey;
    use crate::repo::error::RepoError;
    use rusqlite::Connection;
    use std::thread;
    use std::time::{Duration, Instant};

    static SLOTS: EntitySchema = EntitySchema {
        name: "slot",
        table: "slots",
        fields: &["aisle", "position", "sku"],
        primary_key: &["aisle", "position"],
        generated_key: None,
    };

    static TICKETS: EntitySchema = EntitySchema {
        name: "ticket",
        table: "tickets",
        fields: &["id", "title"],
        primary_key: &["id"],
        generated_key: Some("id"),
    };

    fn slots_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE slots (
                aisle TEXT NOT NULL,
                position INTEGER NOT NULL,
                sku TEXT,
                PRIMARY KEY (aisle, position)
            );",
        )
        .unwrap();
        conn
    }

    fn slot(aisle: &str, position: i64, sku: &str) -> Vec<Value> {
        vec![
            Value::Text(aisle.to_string()),
            Value::Integer(position),
            Value::Text(sku.to_string()),
        ]
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM slots;", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn statements_bind_values_in_column_order() {
        let insert = insert_statement(&SLOTS, &slot("a", 1, "bolt"));
        assert_eq!(
            insert.sql,
            "INSERT INTO slots (aisle, position, sku) VALUES (?1, ?2, ?3);"
        );

        let update = update_statement(
            &SLOTS,
            &[("sku", Value::Text("nut".into()))],
            &[Value::Text("a".into()), Value::Integer(1)],
        );
        assert_eq!(
            update.sql,
            "UPDATE slots SET sku = ?1 WHERE aisle = ?2 AND position = ?3;"
        );
        assert_eq!(update.params.len(), 3);

        let delete = delete_statement(&SLOTS, &[Value::Text("a".into()), Value::Integer(1)]);
        assert_eq!(delete.sql, "DELETE FROM slots WHERE aisle = ?1 AND position = ?2;");
    }

    #[test]
    fn null_generated_key_is_left_to_the_store() {
        let insert = insert_statement(&TICKETS, &[Value::Null, Value::Text("t".into())]);
        assert_eq!(insert.sql, "INSERT INTO tickets (title) VALUES (?1);");
        assert!(insert.returns_rowid);

        let explicit = insert_statement(&TICKETS, &[Value::Integer(9), Value::Text("t".into())]);
        assert!(!explicit.returns_rowid);
    }

    #[test]
    fn composite_delete_many_removes_only_listed_rows() {
        let mut conn = slots_conn();
        let mut seed = WritePlan::default();
        for position in 1..=3 {
            seed.push(insert_statement(&SLOTS, &slot("a", position, "bolt")));
        }
        seed.execute(&mut conn, &Cancellation::new()).unwrap();

        let mut plan = WritePlan::default();
        plan.push(delete_many_statement(
            &SLOTS,
            &[
                vec![Value::Text("a".into()), Value::Integer(1)],
                vec![Value::Text("a".into()), Value::Integer(3)],
            ],
        ));
        let outcomes = plan.execute(&mut conn, &Cancellation::new()).unwrap();

        assert_eq!(outcomes[0].affected, 2);
        assert_eq!(count(&conn), 1);
    }

    #[test]
    fn multi_row_insert_numbers_placeholders_per_row() {
        let mut conn = slots_conn();
        let statement = insert_many_statement(&SLOTS, &[slot("d", 1, "pin"), slot("d", 2, "pin")]);
        assert_eq!(
            statement.sql,
            "INSERT INTO slots (aisle, position, sku) VALUES (?1, ?2, ?3), (?4, ?5, ?6);"
        );

        let mut plan = WritePlan::default();
        plan.push(statement);
        let outcomes = plan.execute(&mut conn, &Cancellation::new()).unwrap();
        assert_eq!(outcomes[0].affected, 2);
        assert_eq!(count(&conn), 2);
    }

    #[test]
    fn cancelled_plan_commits_nothing() {
        let mut conn = slots_conn();
        let mut plan = WritePlan::default();
        plan.push(insert_statement(&SLOTS, &slot("b", 1, "washer")));
        plan.push(insert_statement(&SLOTS, &slot("b", 2, "washer")));

        let cancel = Cancellation::new();
        cancel.cancel();
        let err = plan.execute(&mut conn, &cancel).unwrap_err();

        assert!(matches!(err, RepoError::Cancelled));
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn failing_statement_rolls_back_earlier_ones() {
        let mut conn = slots_conn();
        let mut plan = WritePlan::default();
        plan.push(insert_statement(&SLOTS, &slot("c", 1, "gear")));
        plan.push(insert_statement(&SLOTS, &slot("c", 1, "gear")));

        assert!(plan.execute(&mut conn, &Cancellation::new()).is_err());
        assert_eq!(count(&conn), 0);
    }

    fn slot_key(aisle: &str, position: i64) -> IdentityKey {
        IdentityKey::new(vec![Value::Text(aisle.to_string()), Value::Integer(position)])
    }

    #[test]
    fn chunk_rows_stay_under_parameter_limit() {
        assert_eq!(rows_per_statement(500, 3), 500);
        assert_eq!(rows_per_statement(40_000, 3), 10_922);
        assert_eq!(rows_per_statement(40_000, 1), 32_766);
        assert_eq!(rows_per_statement(10, 0), 10);
    }

    #[test]
    fn missing_required_row_rolls_back_the_plan() {
        let mut conn = slots_conn();
        let mut plan = WritePlan::default();
        plan.push(insert_statement(&SLOTS, &slot("e", 1, "rivet")));
        let ghost = slot_key("e", 9);
        plan.push(delete_statement(&SLOTS, ghost.values()).require_row(&SLOTS, ghost.clone()));

        let err = plan.execute(&mut conn, &Cancellation::new()).unwrap_err();

        assert!(matches!(err, RepoError::RowNotFound { entity: "slot", ref key } if *key == ghost));
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn multi_row_check_names_the_missing_key() {
        let mut conn = slots_conn();
        let mut seed = WritePlan::default();
        seed.push(insert_statement(&SLOTS, &slot("f", 1, "pin")));
        seed.push(insert_statement(&SLOTS, &slot("f", 2, "pin")));
        seed.execute(&mut conn, &Cancellation::new()).unwrap();

        let keys = vec![slot_key("f", 1), slot_key("f", 5), slot_key("f", 2)];
        let rows: Vec<Vec<Value>> = keys.iter().map(|key| key.values().to_vec()).collect();
        let mut plan = WritePlan::default();
        plan.push(delete_many_statement(&SLOTS, &rows).require_rows(&SLOTS, keys));

        let err = plan.execute(&mut conn, &Cancellation::new()).unwrap_err();

        assert!(matches!(err, RepoError::RowNotFound { ref key, .. } if *key == slot_key("f", 5)));
        assert_eq!(count(&conn), 2);
    }

    #[test]
    fn cancel_interrupts_a_running_statement() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE numbers (n INTEGER NOT NULL);")
            .unwrap();
        let mut plan = WritePlan::default();
        plan.push(PlannedStatement {
            sql: "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                  INSERT INTO numbers (n) SELECT x FROM c LIMIT 500000000;"
                .to_string(),
            params: Vec::new(),
            returns_rowid: false,
            required_rows: None,
        });

        let cancel = Cancellation::new();
        let canceller = cancel.clone();
        let signal = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });
        let started = Instant::now();
        let err = plan.execute(&mut conn, &cancel).unwrap_err();
        signal.join().unwrap();

        assert!(matches!(err, RepoError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM numbers;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }
}
