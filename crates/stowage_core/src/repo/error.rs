//! Repository error taxonomy.
//!
//! # Responsibility
//! - Separate schema/metadata failures from tracking-state and store failures.
//! - Carry store errors to callers unchanged, without retry or recovery.
//!
//! # Invariants
//! - `SchemaError` is raised before any store I/O for the failing call.
//! - Nothing in this crate swallows an error on behalf of the caller.

use crate::db::DbError;
use crate::model::key::IdentityKey;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type RepoResult<T> = Result<T, RepoError>;

/// Entity metadata problems detected while resolving keys or field selectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The entity schema declares no primary-key field.
    NoPrimaryKey { entity: &'static str },
    /// A primary-key field is not part of the entity field list.
    UnknownKeyField {
        entity: &'static str,
        field: &'static str,
    },
    /// A selector or query referenced a field the entity does not declare.
    UnknownField { entity: &'static str, field: String },
    /// Partial updates cannot mark primary-key fields dirty.
    KeyFieldSelected {
        entity: &'static str,
        field: &'static str,
    },
    /// A field name appears twice in the entity field list.
    DuplicateField {
        entity: &'static str,
        field: &'static str,
    },
    /// A table or field name is not a plain SQL identifier.
    InvalidIdentifier { entity: &'static str, name: String },
    /// The entity accessor returned no value for a declared key field.
    MissingKeyValue {
        entity: &'static str,
        field: &'static str,
    },
    /// `Entity::set_field` received a value of the wrong storage class.
    TypeMismatch {
        entity: &'static str,
        field: String,
        expected: &'static str,
    },
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoPrimaryKey { entity } => {
                write!(f, "entity `{entity}` declares no primary key")
            }
            Self::UnknownKeyField { entity, field } => write!(
                f,
                "primary-key field `{field}` is not a declared field of `{entity}`"
            ),
            Self::UnknownField { entity, field } => {
                write!(f, "entity `{entity}` has no field `{field}`")
            }
            Self::KeyFieldSelected { entity, field } => write!(
                f,
                "primary-key field `{field}` of `{entity}` cannot be selected for update"
            ),
            Self::DuplicateField { entity, field } => {
                write!(f, "field `{field}` is declared twice on `{entity}`")
            }
            Self::InvalidIdentifier { entity, name } => {
                write!(f, "`{name}` on `{entity}` is not a valid SQL identifier")
            }
            Self::MissingKeyValue { entity, field } => {
                write!(f, "entity `{entity}` returned no value for key field `{field}`")
            }
            Self::TypeMismatch {
                entity,
                field,
                expected,
            } => write!(f, "field `{field}` of `{entity}` expects {expected}"),
        }
    }
}

impl Error for SchemaError {}

/// Error returned by repository, session and bulk-engine operations.
#[derive(Debug)]
pub enum RepoError {
    Schema(SchemaError),
    /// The operation requires a tracked instance and may not attach one.
    NotAttached {
        entity: &'static str,
        key: IdentityKey,
    },
    /// Insert of a record whose key is already tracked by the session.
    AlreadyTracked {
        entity: &'static str,
        key: IdentityKey,
    },
    /// A tracked update or delete matched no stored row; nothing was written.
    RowNotFound {
        entity: &'static str,
        key: IdentityKey,
    },
    /// The session was disposed before this call.
    SessionDisposed,
    /// The caller's cancellation signal fired before the store call finished.
    Cancelled,
    Db(DbError),
    InvalidData(String),
    MissingRequiredTable(&'static str),
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
    InvalidOptions(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema(err) => write!(f, "{err}"),
            Self::NotAttached { entity, key } => {
                write!(f, "no tracked `{entity}` instance with key {key}")
            }
            Self::AlreadyTracked { entity, key } => {
                write!(f, "a `{entity}` instance with key {key} is already tracked")
            }
            Self::RowNotFound { entity, key } => {
                write!(f, "no stored `{entity}` row with key {key}")
            }
            Self::SessionDisposed => write!(f, "session has been disposed"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid data: {message}"),
            Self::MissingRequiredTable(table) => {
                write!(f, "repository requires table `{table}`")
            }
            Self::MissingRequiredColumn { table, column } => write!(
                f,
                "repository requires column `{column}` in table `{table}`"
            ),
            Self::InvalidOptions(message) => write!(f, "invalid repository options: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Schema(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::NotAttached { .. }
            | Self::AlreadyTracked { .. }
            | Self::RowNotFound { .. }
            | Self::SessionDisposed
            | Self::Cancelled
            | Self::InvalidData(_)
            | Self::MissingRequiredTable(_)
            | Self::MissingRequiredColumn { .. }
            | Self::InvalidOptions(_) => None,
        }
    }
}

impl From<SchemaError> for RepoError {
    fn from(value: SchemaError) -> Self {
        Self::Schema(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}
