//! Changes: the immutable unit of replication
//!
//! A [`Change`] is built locally through a [`ChangeBuilder`], tagged with the
//! replica's next sequence number and Lamport counter, and from then on is
//! never edited. Peers may receive a copy with withheld ops; a fuller copy
//! arriving later widens what they applied.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::crdt::DocState;
use super::schema::{FieldValue, Schema, Visibility};
use crate::error::{SyncError, SyncResult};
use crate::types::{ChangeId, OpId, RecordId, ReplicaId};

/// One operation inside a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Insert {
        collection: String,
        record: RecordId,
    },
    Remove {
        collection: String,
        record: RecordId,
    },
    Set {
        collection: String,
        record: RecordId,
        field: String,
        value: Option<FieldValue>,
    },
    Append {
        collection: String,
        record: RecordId,
        field: String,
        entry: FieldValue,
    },
}

impl Op {
    pub fn collection(&self) -> &str {
        match self {
            Op::Insert { collection, .. }
            | Op::Remove { collection, .. }
            | Op::Set { collection, .. }
            | Op::Append { collection, .. } => collection,
        }
    }

    pub fn record(&self) -> &RecordId {
        match self {
            Op::Insert { record, .. }
            | Op::Remove { record, .. }
            | Op::Set { record, .. }
            | Op::Append { record, .. } => record,
        }
    }

    /// Field touched by the op, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            Op::Set { field, .. } | Op::Append { field, .. } => Some(field),
            Op::Insert { .. } | Op::Remove { .. } => None,
        }
    }

    /// Effective visibility under `schema`; `None` if the op does not fit it.
    pub fn visibility(&self, schema: &Schema) -> Option<Visibility> {
        match self.field() {
            Some(field) => schema.field_visibility(self.collection(), field),
            None => schema.collection_visibility(self.collection()),
        }
    }

    fn validate(&self, schema: &Schema) -> SyncResult<()> {
        let collection = schema.get(self.collection())?;
        match self {
            Op::Insert { .. } | Op::Remove { .. } => Ok(()),
            Op::Set { field, value, .. } => collection.check_set(field, value.as_ref()),
            Op::Append { field, entry, .. } => collection.check_append(field, entry),
        }
    }
}

/// An immutable, causally tagged batch of operations from one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub replica: ReplicaId,
    /// Contiguous per-replica sequence number, starting at 1
    pub seq: u64,
    /// Lamport counter used for conflict resolution
    pub counter: u64,
    /// Wall clock at creation (informational only)
    pub timestamp: u64,
    pub ops: Vec<Op>,
}

impl Change {
    pub fn id(&self) -> ChangeId {
        ChangeId {
            replica: self.replica.clone(),
            seq: self.seq,
        }
    }

    /// Each op with its stamp.
    ///
    /// The index part of a stamp counts only earlier ops on the same slot
    /// (the membership or one field of one record). Visibility is uniform
    /// within a slot, so an audience-filtered copy of the change stamps its
    /// surviving ops exactly like the full change does.
    pub fn stamped_ops(&self) -> impl Iterator<Item = (&Op, OpId)> + '_ {
        let mut slots: BTreeMap<(&str, &RecordId, Option<&str>), u32> = BTreeMap::new();
        self.ops.iter().map(move |op| {
            let ordinal = slots
                .entry((op.collection(), op.record(), op.field()))
                .or_insert(0);
            let stamp = OpId::new(self.counter, self.replica.clone(), *ordinal);
            *ordinal += 1;
            (op, stamp)
        })
    }

    /// Validate every op against the schema.
    pub fn validate(&self, schema: &Schema) -> SyncResult<()> {
        if self.seq == 0 {
            return Err(SyncError::InvalidChange(format!(
                "Change from {} has sequence 0",
                self.replica
            )));
        }
        for op in &self.ops {
            op.validate(schema)?;
        }
        Ok(())
    }

    /// Records created by this change.
    pub fn inserted_records(&self) -> impl Iterator<Item = (&str, &RecordId)> {
        self.ops.iter().filter_map(|op| match op {
            Op::Insert { collection, record } => Some((collection.as_str(), record)),
            _ => None,
        })
    }

    /// Most restrictive visibility any op in this change carries.
    pub fn max_visibility(&self, schema: &Schema) -> Visibility {
        self.ops
            .iter()
            .filter_map(|op| op.visibility(schema))
            .max()
            .unwrap_or(Visibility::Public)
    }
}

/// Collects validated operations for one local change.
///
/// Handed to the closure passed to
/// [`DocumentStore::apply_local_change`](super::DocumentStore::apply_local_change).
/// Every call validates immediately, so a closure that returns an error leaves
/// the document untouched.
pub struct ChangeBuilder<'a> {
    schema: &'a Schema,
    state: &'a DocState,
    replica: ReplicaId,
    counter: u64,
    ops: Vec<Op>,
    inserted: BTreeSet<(String, RecordId)>,
}

impl<'a> ChangeBuilder<'a> {
    pub(crate) fn new(
        schema: &'a Schema,
        state: &'a DocState,
        replica: ReplicaId,
        counter: u64,
    ) -> Self {
        Self {
            schema,
            state,
            replica,
            counter,
            ops: Vec::new(),
            inserted: BTreeSet::new(),
        }
    }

    fn next_op_id(&self) -> OpId {
        OpId::new(self.counter, self.replica.clone(), self.ops.len() as u32)
    }

    fn ensure_live(&self, collection: &str, record: &RecordId) -> SyncResult<()> {
        if self
            .inserted
            .contains(&(collection.to_string(), record.clone()))
            || self.state.is_present(collection, record)
        {
            Ok(())
        } else {
            Err(SyncError::RecordNotFound(format!("{}/{}", collection, record)))
        }
    }

    /// Create a new record and return its minted id.
    pub fn insert(&mut self, collection: &str) -> SyncResult<RecordId> {
        self.schema.get(collection)?;
        let record = RecordId::mint(&self.next_op_id());
        self.inserted.insert((collection.to_string(), record.clone()));
        self.ops.push(Op::Insert {
            collection: collection.to_string(),
            record: record.clone(),
        });
        Ok(record)
    }

    /// Remove a live record.
    pub fn remove(&mut self, collection: &str, record: &RecordId) -> SyncResult<()> {
        self.schema.get(collection)?;
        self.ensure_live(collection, record)?;
        self.inserted.remove(&(collection.to_string(), record.clone()));
        self.ops.push(Op::Remove {
            collection: collection.to_string(),
            record: record.clone(),
        });
        Ok(())
    }

    /// Assign a field value.
    pub fn set(
        &mut self,
        collection: &str,
        record: &RecordId,
        field: &str,
        value: impl Into<FieldValue>,
    ) -> SyncResult<()> {
        self.put(collection, record, field, Some(value.into()))
    }

    /// Explicitly clear a field.
    pub fn clear(&mut self, collection: &str, record: &RecordId, field: &str) -> SyncResult<()> {
        self.put(collection, record, field, None)
    }

    /// Assign or clear a field.
    pub fn put(
        &mut self,
        collection: &str,
        record: &RecordId,
        field: &str,
        value: Option<FieldValue>,
    ) -> SyncResult<()> {
        self.schema.get(collection)?.check_set(field, value.as_ref())?;
        self.ensure_live(collection, record)?;
        self.ops.push(Op::Set {
            collection: collection.to_string(),
            record: record.clone(),
            field: field.to_string(),
            value,
        });
        Ok(())
    }

    /// Append an entry to an append-only log field.
    pub fn append(
        &mut self,
        collection: &str,
        record: &RecordId,
        field: &str,
        entry: impl Into<FieldValue>,
    ) -> SyncResult<()> {
        let entry = entry.into();
        self.schema.get(collection)?.check_append(field, &entry)?;
        self.ensure_live(collection, record)?;
        self.ops.push(Op::Append {
            collection: collection.to_string(),
            record: record.clone(),
            field: field.to_string(),
            entry,
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn finish(self, seq: u64, timestamp: u64) -> Change {
        Change {
            replica: self.replica,
            seq,
            counter: self.counter,
            timestamp,
            ops: self.ops,
        }
    }
}
