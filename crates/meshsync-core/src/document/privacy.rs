//! Per-field disclosure filtering
//!
//! Everything that leaves the device passes through here first. `Private`
//! data is never emitted; `Trusted` data only to peers the user verified.

use std::collections::BTreeMap;

use super::change::Change;
use super::crdt::DocState;
use super::schema::{Schema, Visibility};
use crate::types::TrustLevel;

/// Who a payload is being prepared for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    /// Any community member, including broadcast bundles
    Community,
    /// A peer the local user explicitly verified
    TrustedPeer,
}

impl Audience {
    pub fn for_trust(trust: TrustLevel) -> Self {
        match trust {
            TrustLevel::FirstUse => Audience::Community,
            TrustLevel::Verified => Audience::TrustedPeer,
        }
    }

    /// Most restrictive visibility this audience may receive.
    pub fn max_visibility(self) -> Visibility {
        match self {
            Audience::Community => Visibility::Public,
            Audience::TrustedPeer => Visibility::Trusted,
        }
    }

    pub fn allows(self, visibility: Visibility) -> bool {
        visibility <= self.max_visibility()
    }
}

/// Copy of `change` holding only the ops `audience` may see.
///
/// The id and counter are kept so the receiver's version vector stays
/// contiguous even when every op was withheld.
pub fn filter_change(change: &Change, schema: &Schema, audience: Audience) -> Change {
    Change {
        ops: change
            .ops
            .iter()
            .filter(|op| op.visibility(schema).is_some_and(|v| audience.allows(v)))
            .cloned()
            .collect(),
        ..change.clone()
    }
}

/// Copy of `state` holding only what `audience` may see.
pub fn filter_state(state: &DocState, schema: &Schema, audience: Audience) -> DocState {
    let mut collections = BTreeMap::new();
    for (name, records) in &state.collections {
        let Ok(collection) = schema.get(name) else {
            continue;
        };
        if !audience.allows(collection.visibility) {
            continue;
        }
        let filtered = records
            .iter()
            .map(|(id, record)| {
                let mut record = record.clone();
                record.fields.retain(|field, _| {
                    collection
                        .field_visibility(field)
                        .is_some_and(|v| audience.allows(v))
                });
                (id.clone(), record)
            })
            .collect();
        collections.insert(name.clone(), filtered);
    }
    DocState { collections }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::change::Op;
    use crate::document::schema::{CollectionSchema, FieldKind};
    use crate::types::{RecordId, ReplicaId};

    fn schema() -> Schema {
        Schema::new()
            .collection(
                CollectionSchema::new("listings", Visibility::Public)
                    .field("title", FieldKind::Text, Visibility::Public)
                    .field("location", FieldKind::Text, Visibility::Trusted)
                    .field("notes", FieldKind::Text, Visibility::Private),
            )
            .collection(
                CollectionSchema::new("attestations", Visibility::Trusted)
                    .field("statement", FieldKind::Text, Visibility::Public),
            )
    }

    fn set(collection: &str, field: &str) -> Op {
        Op::Set {
            collection: collection.into(),
            record: RecordId::from("1.0@r1"),
            field: field.into(),
            value: Some("v".into()),
        }
    }

    fn change() -> Change {
        Change {
            replica: ReplicaId::new("r1"),
            seq: 1,
            counter: 1,
            timestamp: 0,
            ops: vec![
                Op::Insert {
                    collection: "listings".into(),
                    record: RecordId::from("1.0@r1"),
                },
                set("listings", "title"),
                set("listings", "location"),
                set("listings", "notes"),
                set("attestations", "statement"),
            ],
        }
    }

    #[test]
    fn test_community_sees_public_only() {
        let filtered = filter_change(&change(), &schema(), Audience::Community);
        assert_eq!(filtered.ops.len(), 2);
        assert_eq!(filtered.seq, 1);
    }

    #[test]
    fn test_trusted_never_sees_private() {
        let filtered = filter_change(&change(), &schema(), Audience::TrustedPeer);
        assert_eq!(filtered.ops.len(), 4);
        assert!(filtered.ops.iter().all(|op| op.field() != Some("notes")));
    }

    #[test]
    fn test_state_filter_drops_fields_and_collections() {
        let schema = schema();
        let mut state = DocState::default();
        state.apply_change(&change());

        let community = filter_state(&state, &schema, Audience::Community);
        let record = community
            .record("listings", &RecordId::from("1.0@r1"))
            .unwrap();
        assert!(record.get("title").is_some());
        assert!(record.get("location").is_none());
        assert!(record.get("notes").is_none());
        assert!(!community.collections.contains_key("attestations"));

        let trusted = filter_state(&state, &schema, Audience::TrustedPeer);
        let record = trusted.record("listings", &RecordId::from("1.0@r1")).unwrap();
        assert!(record.get("location").is_some());
        assert!(record.get("notes").is_none());
    }
}
