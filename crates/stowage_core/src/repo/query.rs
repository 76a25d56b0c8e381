//! Lazy, composable queries over one entity table.
//!
//! # Responsibility
//! - Describe filters, ordering and paging without touching the store.
//! - Compile to one parameterized `SELECT` at execution time.
//!
//! # Invariants
//! - Building a query performs no I/O; execution consumes it.
//! - Field names are validated against the schema when compiled.
//! - Result order is deterministic: caller ordering, then primary key.

use crate::model::entity::{Entity, Value};
use crate::model::fields::FieldSelector;
use crate::model::key::IdentityKey;
use crate::repo::error::RepoResult;
use crate::session::TrackingMode;
use std::marker::PhantomData;

/// Sort direction for [`Query::order_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Query description for entity `E`.
#[derive(Debug, Clone)]
pub struct Query<E> {
    filters: Vec<(String, Value)>,
    ordering: Vec<(String, Order)>,
    limit: Option<u32>,
    offset: u32,
    tracking: TrackingMode,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Default for Query<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Compiled `SELECT` ready for the blocking pool.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

impl<E: Entity> Query<E> {
    /// Query over every row of `E`, tracked by default.
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            ordering: Vec::new(),
            limit: None,
            offset: 0,
            tracking: TrackingMode::default(),
            _entity: PhantomData,
        }
    }

    /// Keeps rows where `field` equals `value` (`NULL` matches `IS NULL`).
    pub fn filter_eq(mut self, field: impl FieldSelector, value: impl Into<Value>) -> Self {
        self.filters
            .push((field.field_name().to_string(), value.into()));
        self
    }

    /// Keeps the row whose primary key equals `key`.
    pub fn filter_key(mut self, key: &IdentityKey) -> Self {
        for (field, value) in E::schema().primary_key.iter().zip(key.values()) {
            self.filters.push(((*field).to_string(), value.clone()));
        }
        self
    }

    pub fn order_by(mut self, field: impl FieldSelector, order: Order) -> Self {
        self.ordering.push((field.field_name().to_string(), order));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn tracking(mut self, mode: TrackingMode) -> Self {
        self.tracking = mode;
        self
    }

    pub fn no_tracking(self) -> Self {
        self.tracking(TrackingMode::NoTracking)
    }

    pub fn tracking_mode(&self) -> TrackingMode {
        self.tracking
    }

    pub(crate) fn compile(&self) -> RepoResult<CompiledQuery> {
        let schema = E::schema();
        let mut sql = format!(
            "SELECT {} FROM {} WHERE 1 = 1",
            schema.fields.join(", "),
            schema.table
        );
        let mut params: Vec<Value> = Vec::new();

        for (name, value) in &self.filters {
            let field = schema.field_named(name)?;
            if matches!(value, Value::Null) {
                sql.push_str(&format!(" AND {field} IS NULL"));
            } else {
                params.push(value.clone());
                sql.push_str(&format!(" AND {field} = ?{}", params.len()));
            }
        }

        let mut order_terms = Vec::with_capacity(self.ordering.len() + schema.primary_key.len());
        for (name, order) in &self.ordering {
            let field = schema.field_named(name)?;
            let direction = match order {
                Order::Asc => "ASC",
                Order::Desc => "DESC",
            };
            order_terms.push(format!("{field} {direction}"));
        }
        for field in schema.primary_key {
            if !self.ordering.iter().any(|(name, _)| name == field) {
                order_terms.push(format!("{field} ASC"));
            }
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_terms.join(", "));

        if let Some(limit) = self.limit {
            params.push(Value::Integer(i64::from(limit)));
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
            if self.offset > 0 {
                params.push(Value::Integer(i64::from(self.offset)));
                sql.push_str(&format!(" OFFSET ?{}", params.len()));
            }
        } else if self.offset > 0 {
            params.push(Value::Integer(i64::from(self.offset)));
            sql.push_str(&format!(" LIMIT -1 OFFSET ?{}", params.len()));
        }

        sql.push(';');
        Ok(CompiledQuery { sql, params })
    }
}
