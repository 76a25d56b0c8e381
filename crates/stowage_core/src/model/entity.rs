//! Entity metadata contract.
//!
//! # Responsibility
//! - Describe how a caller-defined record type maps onto one table.
//! - Expose field-level reads/writes so the repository never needs
//!   compile-time knowledge of which fields are keys.
//!
//! # Invariants
//! - `EntitySchema::fields` lists every persisted column exactly once.
//! - `EntitySchema::primary_key` order defines `IdentityKey` order.
//! - `Entity::from_row` reads columns by the names listed in `fields`.

use crate::repo::error::{RepoError, RepoResult, SchemaError};
use rusqlite::Row;

pub use rusqlite::types::Value;

/// Static table mapping for one entity type.
///
/// Declared as a `static` next to the entity type and returned from
/// [`Entity::schema`].
#[derive(Debug)]
pub struct EntitySchema {
    /// Entity name used in errors and log events.
    pub name: &'static str,
    pub table: &'static str,
    /// Persisted columns, in `SELECT`/`INSERT` order.
    pub fields: &'static [&'static str],
    /// Ordered primary-key columns. Must be a subset of `fields`.
    pub primary_key: &'static [&'static str],
    /// Integer key column assigned by the store when inserted as `NULL`.
    pub generated_key: Option<&'static str>,
}

impl EntitySchema {
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains(&name)
    }

    pub fn is_key_field(&self, name: &str) -> bool {
        self.primary_key.contains(&name)
    }

    /// Non-key fields in declaration order.
    pub fn non_key_fields(&self) -> Vec<&'static str> {
        self.fields
            .iter()
            .copied()
            .filter(|field| !self.is_key_field(field))
            .collect()
    }

    /// Maps a caller-supplied name onto the schema's `'static` field name.
    pub(crate) fn field_named(&self, name: &str) -> RepoResult<&'static str> {
        self.fields
            .iter()
            .copied()
            .find(|field| *field == name)
            .ok_or_else(|| {
                SchemaError::UnknownField {
                    entity: self.name,
                    field: name.to_string(),
                }
                .into()
            })
    }
}

/// A record type the repository can persist.
///
/// Implementations are plain field-by-name accessors. Key discovery, dirty
/// tracking and SQL generation are all driven by [`EntitySchema`].
pub trait Entity: Clone + Send + Sync + 'static {
    fn schema() -> &'static EntitySchema;

    /// Returns the current value of `name`, or `None` when the field is unknown.
    fn field(&self, name: &str) -> Option<Value>;

    /// Overwrites `name` with `value`.
    ///
    /// # Errors
    /// - `SchemaError::UnknownField` for names outside the schema.
    /// - `SchemaError::TypeMismatch` when `value` has the wrong storage class.
    fn set_field(&mut self, name: &str, value: Value) -> RepoResult<()>;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    /// Reads every schema field in declaration order.
    fn values(&self) -> Vec<Value> {
        Self::schema()
            .fields
            .iter()
            .map(|field| self.field(field).unwrap_or(Value::Null))
            .collect()
    }
}

/// Converts `value` into text for `set_field` implementations.
pub fn expect_text(entity: &'static str, field: &str, value: Value) -> RepoResult<String> {
    match value {
        Value::Text(text) => Ok(text),
        _ => Err(type_mismatch(entity, field, "text")),
    }
}

/// Converts `value` into optional text; `NULL` maps to `None`.
pub fn expect_optional_text(
    entity: &'static str,
    field: &str,
    value: Value,
) -> RepoResult<Option<String>> {
    match value {
        Value::Null => Ok(None),
        other => expect_text(entity, field, other).map(Some),
    }
}

/// Converts `value` into an integer for `set_field` implementations.
pub fn expect_integer(entity: &'static str, field: &str, value: Value) -> RepoResult<i64> {
    match value {
        Value::Integer(number) => Ok(number),
        _ => Err(type_mismatch(entity, field, "an integer")),
    }
}

/// Converts `value` into an optional integer; `NULL` maps to `None`.
pub fn expect_optional_integer(
    entity: &'static str,
    field: &str,
    value: Value,
) -> RepoResult<Option<i64>> {
    match value {
        Value::Null => Ok(None),
        other => expect_integer(entity, field, other).map(Some),
    }
}

fn type_mismatch(entity: &'static str, field: &str, expected: &'static str) -> RepoError {
    SchemaError::TypeMismatch {
        entity,
        field: field.to_string(),
        expected,
    }
    .into()
}
