//! Repository surface: errors, lazy queries and the generic repository.
//!
//! # Responsibility
//! - Expose the CRUD contract callers use per entity type.
//! - Keep store and tracking details behind `session` and `bulk`.
//!
//! # See also
//! - `session` for tracking states and flush.

pub mod error;
pub mod query;
pub mod repository;
