//! Conflict-free document state
//!
//! The state is a join-semilattice: every component merges with a
//! commutative, associative, idempotent join, and applying an operation is
//! the same as joining with a state holding only that operation. Replicas that
//! have seen the same set of operations therefore hold identical state no
//! matter the order or number of times they saw them.
//!
//! - scalar and `List` fields: [`LwwRegister`], larger [`OpId`] wins
//! - record existence: [`Membership`], remove wins when its id is ≥ the add's
//! - `Log` fields: [`AppendLog`], union ordered by [`OpId`]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::change::{Change, Op};
use super::schema::{FieldValue, Schema};
use crate::error::SyncResult;
use crate::types::{OpId, RecordId};

/// Last-writer-wins register
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister {
    stamp: OpId,
    value: Option<FieldValue>,
}

impl LwwRegister {
    pub fn new(stamp: OpId, value: Option<FieldValue>) -> Self {
        Self { stamp, value }
    }

    /// Assign if `stamp` is newer. Returns whether the value changed hands.
    pub fn set(&mut self, stamp: OpId, value: Option<FieldValue>) -> bool {
        if stamp > self.stamp {
            self.stamp = stamp;
            self.value = value;
            true
        } else {
            false
        }
    }

    pub fn merge(&mut self, other: &LwwRegister) {
        self.set(other.stamp.clone(), other.value.clone());
    }

    pub fn value(&self) -> Option<&FieldValue> {
        self.value.as_ref()
    }

    pub fn stamp(&self) -> &OpId {
        &self.stamp
    }
}

/// Existence set entry for one record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    added: Option<OpId>,
    removed: Option<OpId>,
}

fn keep_max(slot: &mut Option<OpId>, candidate: &OpId) {
    match slot {
        Some(current) if *current >= *candidate => {}
        _ => *slot = Some(candidate.clone()),
    }
}

impl Membership {
    pub fn add(&mut self, stamp: &OpId) {
        keep_max(&mut self.added, stamp);
    }

    pub fn remove(&mut self, stamp: &OpId) {
        keep_max(&mut self.removed, stamp);
    }

    /// Present iff the latest add is strictly newer than the latest remove.
    pub fn is_present(&self) -> bool {
        match (&self.added, &self.removed) {
            (Some(added), Some(removed)) => added > removed,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn merge(&mut self, other: &Membership) {
        if let Some(added) = &other.added {
            self.add(added);
        }
        if let Some(removed) = &other.removed {
            self.remove(removed);
        }
    }
}

/// Append-only log, merged by union
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendLog {
    entries: BTreeMap<OpId, FieldValue>,
}

impl AppendLog {
    pub fn append(&mut self, stamp: OpId, entry: FieldValue) {
        self.entries.entry(stamp).or_insert(entry);
    }

    pub fn merge(&mut self, other: &AppendLog) {
        for (stamp, entry) in &other.entries {
            self.append(stamp.clone(), entry.clone());
        }
    }

    /// Entries in (counter, replica, position) order.
    pub fn values(&self) -> Vec<FieldValue> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// State of one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldState {
    Register(LwwRegister),
    Log(AppendLog),
}

impl FieldState {
    fn merge(&mut self, other: &FieldState) {
        match (self, other) {
            (FieldState::Register(a), FieldState::Register(b)) => a.merge(b),
            (FieldState::Log(a), FieldState::Log(b)) => a.merge(b),
            // Kinds are fixed by the schema; a mismatch can only come from a
            // change that failed validation and never reaches here.
            _ => {}
        }
    }

    fn materialize(&self) -> Option<FieldValue> {
        match self {
            FieldState::Register(reg) => reg.value().cloned(),
            FieldState::Log(log) => Some(FieldValue::List(log.values())),
        }
    }
}

/// State of one record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordState {
    pub(crate) membership: Membership,
    pub(crate) fields: BTreeMap<String, FieldState>,
}

impl RecordState {
    fn merge(&mut self, other: &RecordState) {
        self.membership.merge(&other.membership);
        for (name, field) in &other.fields {
            match self.fields.get_mut(name) {
                Some(existing) => existing.merge(field),
                None => {
                    self.fields.insert(name.clone(), field.clone());
                }
            }
        }
    }
}

/// Read-only view of a live record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub collection: String,
    pub id: RecordId,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_text)
    }

    pub fn boolean(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(FieldValue::as_bool)
    }

    pub fn integer(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(FieldValue::as_integer)
    }

    pub fn timestamp(&self, field: &str) -> Option<u64> {
        self.get(field).and_then(FieldValue::as_timestamp)
    }

    pub fn list(&self, field: &str) -> Option<&[FieldValue]> {
        self.get(field).and_then(FieldValue::as_list)
    }
}

/// Whole-document state: collection name → record id → record state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocState {
    pub(crate) collections: BTreeMap<String, BTreeMap<RecordId, RecordState>>,
}

impl DocState {
    fn record_mut(&mut self, collection: &str, record: &RecordId) -> &mut RecordState {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .entry(record.clone())
            .or_default()
    }

    /// Join a single operation into the state.
    pub fn apply_op(&mut self, op: &Op, stamp: OpId) {
        let state = self.record_mut(op.collection(), op.record());
        match op {
            Op::Insert { .. } => state.membership.add(&stamp),
            Op::Remove { .. } => state.membership.remove(&stamp),
            Op::Set { field, value, .. } => match state.fields.get_mut(field) {
                Some(FieldState::Register(reg)) => {
                    reg.set(stamp, value.clone());
                }
                Some(FieldState::Log(_)) => {}
                None => {
                    state.fields.insert(
                        field.clone(),
                        FieldState::Register(LwwRegister::new(stamp, value.clone())),
                    );
                }
            },
            Op::Append { field, entry, .. } => {
                let slot = state
                    .fields
                    .entry(field.clone())
                    .or_insert_with(|| FieldState::Log(AppendLog::default()));
                if let FieldState::Log(log) = slot {
                    log.append(stamp, entry.clone());
                }
            }
        }
    }

    /// Join every operation of a change.
    pub fn apply_change(&mut self, change: &Change) {
        for (op, stamp) in change.stamped_ops() {
            self.apply_op(op, stamp);
        }
    }

    /// Join another state into this one.
    pub fn merge(&mut self, other: &DocState) {
        for (collection, records) in &other.collections {
            let mine = self.collections.entry(collection.clone()).or_default();
            for (id, record) in records {
                match mine.get_mut(id) {
                    Some(existing) => existing.merge(record),
                    None => {
                        mine.insert(id.clone(), record.clone());
                    }
                }
            }
        }
    }

    pub fn is_present(&self, collection: &str, record: &RecordId) -> bool {
        self.collections
            .get(collection)
            .and_then(|records| records.get(record))
            .is_some_and(|r| r.membership.is_present())
    }

    /// Materialized view of a live record.
    pub fn record(&self, collection: &str, id: &RecordId) -> Option<Record> {
        let state = self.collections.get(collection)?.get(id)?;
        if !state.membership.is_present() {
            return None;
        }
        Some(Self::view(collection, id, state))
    }

    /// All live records of a collection, in id order.
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, state)| state.membership.is_present())
                    .map(|(id, state)| Self::view(collection, id, state))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Check every stored value against the schema.
    ///
    /// Used on snapshots received from peers, which cannot be validated op
    /// by op the way changes are.
    pub fn check_schema(&self, schema: &Schema) -> SyncResult<()> {
        for (name, records) in &self.collections {
            let collection = schema.get(name)?;
            for record in records.values() {
                for (field, state) in &record.fields {
                    match state {
                        FieldState::Register(reg) => collection.check_set(field, reg.value())?,
                        FieldState::Log(log) => {
                            for entry in log.entries.values() {
                                collection.check_append(field, entry)?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of live records across all collections.
    pub fn live_records(&self) -> usize {
        self.collections
            .values()
            .flat_map(|records| records.values())
            .filter(|r| r.membership.is_present())
            .count()
    }

    fn view(collection: &str, id: &RecordId, state: &RecordState) -> Record {
        Record {
            collection: collection.to_string(),
            id: id.clone(),
            fields: state
                .fields
                .iter()
                .filter_map(|(name, field)| field.materialize().map(|v| (name.clone(), v)))
                .collect(),
        }
    }
}
