//! Table readiness checks run when a repository is constructed.

use crate::model::entity::EntitySchema;
use crate::repo::error::{RepoError, RepoResult};
use rusqlite::Connection;

/// Verifies that `schema.table` exists and carries every schema field.
pub(crate) fn ensure_table_ready(conn: &Connection, schema: &'static EntitySchema) -> RepoResult<()> {
    if !table_exists(conn, schema.table)? {
        return Err(RepoError::MissingRequiredTable(schema.table));
    }

    let columns = table_columns(conn, schema.table)?;
    for field in schema.fields {
        if !columns.iter().any(|column| column == field) {
            return Err(RepoError::MissingRequiredColumn {
                table: schema.table,
                column: *field,
            });
        }
    }

    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_columns(conn: &Connection, table: &str) -> RepoResult<Vec<String>> {
    // `table` was checked against the identifier pattern by the key plan.
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>("name")?);
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::ensure_table_ready;
    use crate::model::entity::EntitySchema;
    use crate::repo::error::RepoError;
    use rusqlite::Connection;

    static SCHEMA: EntitySchema = EntitySchema {
        name: "bin",
        table: "bins",
        fields: &["id", "label", "capacity"],
        primary_key: &["id"],
        generated_key: None,
    };

    #[test]
    fn missing_table_is_reported() {
        let conn = Connection::open_in_memory().unwrap();
        let err = ensure_table_ready(&conn, &SCHEMA).unwrap_err();
        assert!(matches!(err, RepoError::MissingRequiredTable("bins")));
    }

    #[test]
    fn missing_column_is_reported() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE bins (id TEXT PRIMARY KEY, label TEXT);")
            .unwrap();
        let err = ensure_table_ready(&conn, &SCHEMA).unwrap_err();
        assert!(matches!(
            err,
            RepoError::MissingRequiredColumn {
                table: "bins",
                column: "capacity"
            }
        ));
    }

    #[test]
    fn complete_table_passes() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE bins (id TEXT PRIMARY KEY, label TEXT, capacity INTEGER);",
        )
        .unwrap();
        ensure_table_ready(&conn, &SCHEMA).unwrap();
    }
}
