//! Typed collection models for the community document
//!
//! Feature modules work with these structs instead of raw records. Each model
//! declares its collection, reads itself from a [`Record`] and writes itself
//! through a [`ChangeBuilder`].

use super::change::ChangeBuilder;
use super::crdt::Record;
use super::schema::{CollectionSchema, FieldKind, FieldValue, Schema, Visibility};
use crate::error::SyncResult;
use crate::types::RecordId;

/// A struct stored as one record of a collection
pub trait Model: Sized {
    const COLLECTION: &'static str;

    fn schema() -> CollectionSchema;

    fn from_record(record: &Record) -> Option<Self>;

    /// Write every non-log field of `self` to record `id`.
    fn write(&self, tx: &mut ChangeBuilder<'_>, id: &RecordId) -> SyncResult<()>;
}

fn opt_text(value: &Option<String>) -> Option<FieldValue> {
    value.clone().map(FieldValue::Text)
}

fn text_list(items: &[String]) -> FieldValue {
    FieldValue::List(items.iter().cloned().map(FieldValue::Text).collect())
}

fn read_text_list(record: &Record, field: &str) -> Vec<String> {
    record
        .list(field)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_text().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// A community member's public profile
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Profile {
    pub display_name: String,
    pub bio: Option<String>,
    /// Shared with verified peers only
    pub contact: Option<String>,
    /// Never leaves this device
    pub home_area: Option<String>,
}

impl Model for Profile {
    const COLLECTION: &'static str = "profiles";

    fn schema() -> CollectionSchema {
        CollectionSchema::new(Self::COLLECTION, Visibility::Public)
            .field("display_name", FieldKind::Text, Visibility::Public)
            .field("bio", FieldKind::Text, Visibility::Public)
            .field("contact", FieldKind::Text, Visibility::Trusted)
            .field("home_area", FieldKind::Text, Visibility::Private)
    }

    fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            display_name: record.text("display_name")?.to_string(),
            bio: record.text("bio").map(str::to_string),
            contact: record.text("contact").map(str::to_string),
            home_area: record.text("home_area").map(str::to_string),
        })
    }

    fn write(&self, tx: &mut ChangeBuilder<'_>, id: &RecordId) -> SyncResult<()> {
        tx.set(Self::COLLECTION, id, "display_name", self.display_name.as_str())?;
        tx.put(Self::COLLECTION, id, "bio", opt_text(&self.bio))?;
        tx.put(Self::COLLECTION, id, "contact", opt_text(&self.contact))?;
        tx.put(Self::COLLECTION, id, "home_area", opt_text(&self.home_area))
    }
}

/// An item or skill offered to the community
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Listing {
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub available: bool,
    /// Pickup location, verified peers only
    pub location: Option<String>,
    pub tags: Vec<String>,
    /// Owner's private notes
    pub notes: Option<String>,
    /// Append-only comment thread (read-only here; append through the builder)
    pub comments: Vec<String>,
}

impl Model for Listing {
    const COLLECTION: &'static str = "listings";

    fn schema() -> CollectionSchema {
        CollectionSchema::new(Self::COLLECTION, Visibility::Public)
            .field("title", FieldKind::Text, Visibility::Public)
            .field("description", FieldKind::Text, Visibility::Public)
            .field("category", FieldKind::Text, Visibility::Public)
            .field("available", FieldKind::Boolean, Visibility::Public)
            .field("location", FieldKind::Text, Visibility::Trusted)
            .field("tags", FieldKind::List, Visibility::Public)
            .field("notes", FieldKind::Text, Visibility::Private)
            .field("comments", FieldKind::Log, Visibility::Public)
    }

    fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            title: record.text("title")?.to_string(),
            description: record.text("description").map(str::to_string),
            category: record.text("category").unwrap_or_default().to_string(),
            available: record.boolean("available").unwrap_or(false),
            location: record.text("location").map(str::to_string),
            tags: read_text_list(record, "tags"),
            notes: record.text("notes").map(str::to_string),
            comments: read_text_list(record, "comments"),
        })
    }

    fn write(&self, tx: &mut ChangeBuilder<'_>, id: &RecordId) -> SyncResult<()> {
        tx.set(Self::COLLECTION, id, "title", self.title.as_str())?;
        tx.put(Self::COLLECTION, id, "description", opt_text(&self.description))?;
        tx.set(Self::COLLECTION, id, "category", self.category.as_str())?;
        tx.set(Self::COLLECTION, id, "available", self.available)?;
        tx.put(Self::COLLECTION, id, "location", opt_text(&self.location))?;
        tx.set(Self::COLLECTION, id, "tags", text_list(&self.tags))?;
        tx.put(Self::COLLECTION, id, "notes", opt_text(&self.notes))
    }
}

/// A request for help or resources
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceRequest {
    pub title: String,
    pub description: Option<String>,
    /// Unix millis
    pub needed_by: Option<u64>,
    pub fulfilled: bool,
    pub responses: Vec<String>,
}

impl Model for ResourceRequest {
    const COLLECTION: &'static str = "requests";

    fn schema() -> CollectionSchema {
        CollectionSchema::new(Self::COLLECTION, Visibility::Public)
            .field("title", FieldKind::Text, Visibility::Public)
            .field("description", FieldKind::Text, Visibility::Public)
            .field("needed_by", FieldKind::Timestamp, Visibility::Public)
            .field("fulfilled", FieldKind::Boolean, Visibility::Public)
            .field("responses", FieldKind::Log, Visibility::Public)
    }

    fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            title: record.text("title")?.to_string(),
            description: record.text("description").map(str::to_string),
            needed_by: record.timestamp("needed_by"),
            fulfilled: record.boolean("fulfilled").unwrap_or(false),
            responses: read_text_list(record, "responses"),
        })
    }

    fn write(&self, tx: &mut ChangeBuilder<'_>, id: &RecordId) -> SyncResult<()> {
        tx.set(Self::COLLECTION, id, "title", self.title.as_str())?;
        tx.put(Self::COLLECTION, id, "description", opt_text(&self.description))?;
        tx.put(
            Self::COLLECTION,
            id,
            "needed_by",
            self.needed_by.map(FieldValue::Timestamp),
        )?;
        tx.set(Self::COLLECTION, id, "fulfilled", self.fulfilled)
    }
}

/// A statement vouching for another member, shared among verified peers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Attestation {
    /// Peer identifier of the member vouched for
    pub subject: String,
    pub statement: String,
    /// Unix millis
    pub issued_at: u64,
}

impl Model for Attestation {
    const COLLECTION: &'static str = "attestations";

    fn schema() -> CollectionSchema {
        CollectionSchema::new(Self::COLLECTION, Visibility::Trusted)
            .field("subject", FieldKind::Text, Visibility::Trusted)
            .field("statement", FieldKind::Text, Visibility::Trusted)
            .field("issued_at", FieldKind::Timestamp, Visibility::Trusted)
    }

    fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            subject: record.text("subject")?.to_string(),
            statement: record.text("statement")?.to_string(),
            issued_at: record.timestamp("issued_at").unwrap_or(0),
        })
    }

    fn write(&self, tx: &mut ChangeBuilder<'_>, id: &RecordId) -> SyncResult<()> {
        tx.set(Self::COLLECTION, id, "subject", self.subject.as_str())?;
        tx.set(Self::COLLECTION, id, "statement", self.statement.as_str())?;
        tx.put(
            Self::COLLECTION,
            id,
            "issued_at",
            Some(FieldValue::Timestamp(self.issued_at)),
        )
    }
}

impl Schema {
    /// Collections shared by every community node.
    pub fn community() -> Self {
        Schema::new()
            .collection(Profile::schema())
            .collection(Listing::schema())
            .collection(ResourceRequest::schema())
            .collection(Attestation::schema())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::crdt::DocState;
    use crate::types::ReplicaId;

    #[test]
    fn test_listing_roundtrip_through_state() {
        let schema = Schema::community();
        let state = DocState::default();
        let mut tx = ChangeBuilder::new(&schema, &state, ReplicaId::new("r1"), 1);
        let id = tx.insert(Listing::COLLECTION).unwrap();
        let listing = Listing {
            title: "Cordless drill".into(),
            category: "tools".into(),
            available: true,
            tags: vec!["diy".into()],
            ..Default::default()
        };
        listing.write(&mut tx, &id).unwrap();
        tx.append(Listing::COLLECTION, &id, "comments", "Can I borrow it Sunday?")
            .unwrap();
        let change = tx.finish(1, 0);

        let mut state = DocState::default();
        state.apply_change(&change);
        let record = state.record(Listing::COLLECTION, &id).unwrap();
        let read = Listing::from_record(&record).unwrap();
        assert_eq!(read.title, "Cordless drill");
        assert!(read.available);
        assert_eq!(read.tags, vec!["diy".to_string()]);
        assert_eq!(read.comments, vec!["Can I borrow it Sunday?".to_string()]);
    }

    #[test]
    fn test_community_schema_visibility() {
        let schema = Schema::community();
        assert_eq!(
            schema.field_visibility("profiles", "home_area"),
            Some(Visibility::Private)
        );
        assert_eq!(
            schema.field_visibility("listings", "location"),
            Some(Visibility::Trusted)
        );
        assert_eq!(
            schema.collection_visibility("attestations"),
            Some(Visibility::Trusted)
        );
    }
}
