//! Typed field selection for partial updates.
//!
//! # Responsibility
//! - Let callers name the subset of fields an update may write.
//! - Resolve selections against entity metadata before any tracking change.
//!
//! # Invariants
//! - Unknown names and primary-key names fail with `SchemaError`.
//! - An empty selection means "every non-key field".

use crate::model::entity::EntitySchema;
use crate::repo::error::{RepoResult, SchemaError};

/// Anything that names one entity field.
///
/// Implemented for string names; entity crates usually add a field enum.
pub trait FieldSelector {
    fn field_name(&self) -> &str;
}

impl FieldSelector for &str {
    fn field_name(&self) -> &str {
        self
    }
}

impl FieldSelector for String {
    fn field_name(&self) -> &str {
        self.as_str()
    }
}

/// Which fields an update marks dirty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldSelection {
    /// Full replace of every non-key field.
    #[default]
    All,
    /// Partial update restricted to the named fields.
    Only(Vec<String>),
}

impl FieldSelection {
    pub fn all() -> Self {
        Self::All
    }

    pub fn only<I, S>(selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: FieldSelector,
    {
        let names: Vec<String> = selectors
            .into_iter()
            .map(|selector| selector.field_name().to_string())
            .collect();
        if names.is_empty() {
            Self::All
        } else {
            Self::Only(names)
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Only(names) if !names.is_empty())
    }

    /// Resolves the selection to schema field names, in selection order
    /// without duplicates.
    pub fn resolve(&self, schema: &'static EntitySchema) -> RepoResult<Vec<&'static str>> {
        let names = match self {
            Self::Only(names) if !names.is_empty() => names,
            _ => return Ok(schema.non_key_fields()),
        };

        let mut resolved: Vec<&'static str> = Vec::with_capacity(names.len());
        for name in names {
            let field = schema.field_named(name)?;
            if schema.is_key_field(field) {
                return Err(SchemaError::KeyFieldSelected {
                    entity: schema.name,
                    field,
                }
                .into());
            }
            if !resolved.contains(&field) {
                resolved.push(field);
            }
        }
        Ok(resolved)
    }
}
