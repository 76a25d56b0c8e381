//! In-memory identity map for one session.
//!
//! # Responsibility
//! - Own the tracked copy of every record known to a session.
//! - Keep per-entry tracking metadata: state, dirty fields, stored snapshot.
//!
//! # Invariants
//! - Entries iterate in tracking order (`EntryId` is monotonic).
//! - `Untracked` is never stored; absence from the map means untracked.
//! - `stored_key` is `None` only for `Added` entries.

use crate::model::entity::{Entity, EntitySchema, Value};
use crate::model::key::{IdentityKey, KeyExtractor};
use crate::repo::error::RepoResult;
use crate::session::{EntryId, TrackingState};
use std::any::{Any, TypeId};
use std::collections::BTreeMap;

/// Object-safe view of a tracked record, used when flushing mixed types.
pub(crate) trait ErasedRecord: Send + Sync {
    fn entity_schema(&self) -> &'static EntitySchema;
    fn current_values(&self) -> Vec<Value>;
    fn value_of(&self, field: &str) -> Value;
    fn assign(&mut self, field: &str, value: Value) -> RepoResult<()>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<E: Entity> ErasedRecord for E {
    fn entity_schema(&self) -> &'static EntitySchema {
        E::schema()
    }

    fn current_values(&self) -> Vec<Value> {
        self.values()
    }

    fn value_of(&self, field: &str) -> Value {
        self.field(field).unwrap_or(Value::Null)
    }

    fn assign(&mut self, field: &str, value: Value) -> RepoResult<()> {
        self.set_field(field, value)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub(crate) struct TrackedEntry {
    type_id: TypeId,
    pub record: Box<dyn ErasedRecord>,
    pub state: TrackingState,
    /// Fields explicitly marked for update, in marking order.
    pub dirty: Vec<&'static str>,
    /// Field values as last read from or written to the store.
    pub snapshot: Option<Vec<Value>>,
    /// Key values of the stored row this entry maps to.
    pub stored_key: Option<Vec<Value>>,
}

impl TrackedEntry {
    /// Entry for a record that has not reached the store yet.
    pub fn added<E: Entity>(record: E) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            record: Box::new(record),
            state: TrackingState::Added,
            dirty: Vec::new(),
            snapshot: None,
            stored_key: None,
        }
    }

    /// Entry for a record assumed to match a stored row.
    pub fn stored<E: Entity>(record: E, key: &IdentityKey, state: TrackingState) -> Self {
        let snapshot = record.values();
        Self {
            type_id: TypeId::of::<E>(),
            record: Box::new(record),
            state,
            dirty: Vec::new(),
            snapshot: Some(snapshot),
            stored_key: Some(key.values().to_vec()),
        }
    }

    pub fn is<E: Entity>(&self) -> bool {
        self.type_id == TypeId::of::<E>()
    }

    pub fn downcast_ref<E: Entity>(&self) -> Option<&E> {
        self.record.as_any().downcast_ref::<E>()
    }

    pub fn downcast_mut<E: Entity>(&mut self) -> Option<&mut E> {
        self.record.as_any_mut().downcast_mut::<E>()
    }

    /// Records `fields` as dirty without duplicates.
    pub fn mark_dirty(&mut self, fields: &[&'static str]) {
        for field in fields {
            if !self.dirty.contains(field) {
                self.dirty.push(*field);
            }
        }
    }

    /// Non-key fields to write: marked fields first, then fields whose value
    /// drifted from the stored snapshot.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let schema = self.record.entity_schema();
        let mut fields = self.dirty.clone();
        if let Some(snapshot) = &self.snapshot {
            for (field, original) in schema.fields.iter().zip(snapshot) {
                if schema.is_key_field(field) || fields.contains(field) {
                    continue;
                }
                if self.record.value_of(field) != *original {
                    fields.push(*field);
                }
            }
        }
        fields
    }

    /// Current key values in declared key order.
    pub fn current_key(&self) -> Vec<Value> {
        let schema = self.record.entity_schema();
        schema
            .primary_key
            .iter()
            .map(|field| self.record.value_of(field))
            .collect()
    }

    /// Treats `fields` as already written to the stored row.
    pub fn accept_fields(&mut self, fields: &[&'static str]) {
        let schema = self.record.entity_schema();
        if let Some(snapshot) = &mut self.snapshot {
            for (slot, field) in snapshot.iter_mut().zip(schema.fields) {
                if fields.contains(field) {
                    *slot = self.record.value_of(field);
                }
            }
        }
        self.dirty.retain(|field| !fields.contains(field));
        if self.state == TrackingState::Dirty && self.changed_fields().is_empty() {
            self.state = TrackingState::Active;
        }
    }

    /// Marks the entry as matching its stored row again.
    pub fn accept_stored(&mut self) {
        self.state = TrackingState::Active;
        self.dirty.clear();
        self.snapshot = Some(self.record.current_values());
        self.stored_key = Some(self.current_key());
    }
}

#[derive(Default)]
pub(crate) struct IdentityMap {
    entries: BTreeMap<EntryId, TrackedEntry>,
    next_id: u64,
}

impl IdentityMap {
    pub fn insert(&mut self, entry: TrackedEntry) -> EntryId {
        self.next_id += 1;
        let id = EntryId(self.next_id);
        self.entries.insert(id, entry);
        id
    }

    pub fn get(&self, id: EntryId) -> Option<&TrackedEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut TrackedEntry> {
        self.entries.get_mut(&id)
    }

    pub fn remove(&mut self, id: EntryId) -> Option<TrackedEntry> {
        self.entries.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &TrackedEntry)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    /// Entry ids holding records of type `E`, in tracking order.
    pub fn ids_of<E: Entity>(&self) -> Vec<EntryId> {
        self.iter()
            .filter(|(_, entry)| entry.is::<E>())
            .map(|(id, _)| id)
            .collect()
    }

    /// Linear scan for the first `E` entry whose current key matches `key`.
    pub fn find<E: Entity>(
        &self,
        keys: &KeyExtractor<E>,
        key: &IdentityKey,
    ) -> RepoResult<Option<EntryId>> {
        if key.is_transient() {
            return Ok(None);
        }
        for (id, entry) in self.iter() {
            let Some(record) = entry.downcast_ref::<E>() else {
                continue;
            };
            if keys.keys_of(record)?.same_identity(key) {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
