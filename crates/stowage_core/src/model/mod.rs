//! Entity metadata, identity keys and field selection.
//!
//! # Responsibility
//! - Define the contract caller record types implement.
//! - Derive identity and dirty-field information from that contract only.
//!
//! # Invariants
//! - Every persisted record type is described by one static `EntitySchema`.
//! - Identity is the ordered tuple of primary-key values, never object address.

pub mod entity;
pub mod fields;
pub mod key;
