//! Primary-key extraction and identity keys.
//!
//! # Responsibility
//! - Resolve, once per entity type, which fields form the primary key.
//! - Produce ordered key tuples used by identity-map reconciliation.
//!
//! # Invariants
//! - Key plans are validated before first use and cached per `TypeId`.
//! - Keys are computed on demand and never cached across field mutation.
//! - A key containing `NULL` is transient and equals no other key.

use crate::model::entity::{Entity, EntitySchema, Value};
use crate::repo::error::{RepoError, RepoResult, SchemaError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::any::TypeId;
use std::collections::{BTreeSet, HashMap};
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

static SQL_IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

static KEY_PLANS: Lazy<Mutex<HashMap<TypeId, Arc<KeyPlan>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Ordered primary-key values of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityKey(Vec<Value>);

impl IdentityKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// True when any component is `NULL`, e.g. a generated key not yet assigned.
    pub fn is_transient(&self) -> bool {
        self.0.iter().any(|value| matches!(value, Value::Null))
    }

    /// Identity comparison: transient keys never match.
    pub fn same_identity(&self, other: &IdentityKey) -> bool {
        !self.is_transient() && !other.is_transient() && self.0 == other.0
    }
}

impl From<Value> for IdentityKey {
    fn from(value: Value) -> Self {
        Self(vec![value])
    }
}

impl Display for IdentityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (index, value) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            match value {
                Value::Null => write!(f, "NULL")?,
                Value::Integer(number) => write!(f, "{number}")?,
                Value::Real(number) => write!(f, "{number}")?,
                Value::Text(text) => write!(f, "'{text}'")?,
                Value::Blob(bytes) => write!(f, "<blob {} bytes>", bytes.len())?,
            }
        }
        write!(f, ")")
    }
}

/// Validated key shape of one entity type.
#[derive(Debug)]
struct KeyPlan {
    fields: Vec<&'static str>,
}

/// Reads primary-key values of `E` using its cached key plan.
#[derive(Debug)]
pub struct KeyExtractor<E> {
    plan: Arc<KeyPlan>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for KeyExtractor<E> {
    fn clone(&self) -> Self {
        Self {
            plan: Arc::clone(&self.plan),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> KeyExtractor<E> {
    /// Returns the extractor for `E`, validating its schema on first use.
    ///
    /// # Errors
    /// - `SchemaError` when the schema has no key, references unknown key
    ///   fields, repeats a field, or uses a non-identifier name.
    pub fn resolve() -> RepoResult<Self> {
        let type_id = TypeId::of::<E>();
        if let Some(plan) = cached_plan(type_id) {
            return Ok(Self::from_plan(plan));
        }

        let plan = Arc::new(build_plan(E::schema())?);
        let mut plans = KEY_PLANS
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let plan = Arc::clone(plans.entry(type_id).or_insert(plan));
        Ok(Self::from_plan(plan))
    }

    fn from_plan(plan: Arc<KeyPlan>) -> Self {
        Self {
            plan,
            _entity: PhantomData,
        }
    }

    /// Ordered primary-key field names.
    pub fn key_fields(&self) -> &[&'static str] {
        &self.plan.fields
    }

    /// Returns the current key values of `record`, in declared key order.
    pub fn keys_of(&self, record: &E) -> RepoResult<IdentityKey> {
        let schema = E::schema();
        let values = self
            .plan
            .fields
            .iter()
            .map(|field| {
                record.field(field).ok_or_else(|| {
                    RepoError::Schema(SchemaError::MissingKeyValue {
                        entity: schema.name,
                        field: *field,
                    })
                })
            })
            .collect::<RepoResult<Vec<_>>>()?;
        Ok(IdentityKey(values))
    }
}

fn cached_plan(type_id: TypeId) -> Option<Arc<KeyPlan>> {
    KEY_PLANS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(&type_id)
        .cloned()
}

fn build_plan(schema: &'static EntitySchema) -> Result<KeyPlan, SchemaError> {
    validate_identifier(schema.name, schema.table)?;

    let mut seen = BTreeSet::new();
    for field in schema.fields {
        validate_identifier(schema.name, field)?;
        if !seen.insert(*field) {
            return Err(SchemaError::DuplicateField {
                entity: schema.name,
                field: *field,
            });
        }
    }

    if schema.primary_key.is_empty() {
        return Err(SchemaError::NoPrimaryKey {
            entity: schema.name,
        });
    }

    for field in schema.primary_key.iter().chain(schema.generated_key.iter()) {
        if !schema.has_field(field) {
            return Err(SchemaError::UnknownKeyField {
                entity: schema.name,
                field: *field,
            });
        }
    }

    Ok(KeyPlan {
        fields: schema.primary_key.to_vec(),
    })
}

/// Checks that `name` can be spliced into SQL without quoting.
pub(crate) fn validate_identifier(entity: &'static str, name: &str) -> Result<(), SchemaError> {
    if SQL_IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier {
            entity,
            name: name.to_string(),
        })
    }
}
