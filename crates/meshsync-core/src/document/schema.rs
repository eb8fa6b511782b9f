//! Statically declared collection schemas
//!
//! Every collection the document holds is declared up front with its fields,
//! their value kinds and their visibility. Local mutations and remote changes
//! are both validated against the schema before anything is applied.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::SyncError;

/// Kind of value a field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    Integer,
    Boolean,
    /// Unix millis
    Timestamp,
    Bytes,
    /// Array replaced as a whole, last writer wins
    List,
    /// Append-only array merged by union
    Log,
}

/// Who may see a field (or a whole collection).
///
/// Ordered from least to most restrictive, so the effective visibility of a
/// field is the maximum of its own and its collection's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Visibility {
    /// Shared with the whole community
    Public,
    /// Shared only with peers the user explicitly verified
    Trusted,
    /// Never leaves this device
    Private,
}

/// A concrete field value. Absence is `Option::None`, never a sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
    Timestamp(u64),
    Bytes(Vec<u8>),
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Kind of this value as a register value.
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::Integer(_) => FieldKind::Integer,
            FieldValue::Boolean(_) => FieldKind::Boolean,
            FieldValue::Timestamp(_) => FieldKind::Timestamp,
            FieldValue::Bytes(_) => FieldKind::Bytes,
            FieldValue::List(_) => FieldKind::List,
        }
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, FieldValue::List(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<u64> {
        match self {
            FieldValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Integer(i)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Boolean(b)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(bytes: Vec<u8>) -> Self {
        FieldValue::Bytes(bytes)
    }
}

/// Declaration of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub visibility: Visibility,
}

/// Declaration of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    pub name: String,
    pub visibility: Visibility,
    pub fields: BTreeMap<String, FieldSpec>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>, visibility: Visibility) -> Self {
        Self {
            name: name.into(),
            visibility,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field declaration.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind, visibility: Visibility) -> Self {
        self.fields.insert(name.into(), FieldSpec { kind, visibility });
        self
    }

    /// Effective visibility of a field: the stricter of field and collection.
    pub fn field_visibility(&self, field: &str) -> Option<Visibility> {
        self.fields
            .get(field)
            .map(|spec| spec.visibility.max(self.visibility))
    }

    fn field_spec(&self, field: &str) -> Result<&FieldSpec, SyncError> {
        self.fields.get(field).ok_or_else(|| {
            SyncError::InvalidChange(format!("Unknown field '{}.{}'", self.name, field))
        })
    }

    /// Check that `value` may be assigned to `field`.
    pub fn check_set(&self, field: &str, value: Option<&FieldValue>) -> Result<(), SyncError> {
        let spec = self.field_spec(field)?;
        if spec.kind == FieldKind::Log {
            return Err(SyncError::InvalidChange(format!(
                "Field '{}.{}' is append-only",
                self.name, field
            )));
        }
        let Some(value) = value else {
            return Ok(());
        };
        if value.kind() != spec.kind {
            return Err(SyncError::InvalidChange(format!(
                "Field '{}.{}' expects {:?}, got {:?}",
                self.name,
                field,
                spec.kind,
                value.kind()
            )));
        }
        if let FieldValue::List(items) = value {
            if !items.iter().all(FieldValue::is_scalar) {
                return Err(SyncError::InvalidChange(format!(
                    "Field '{}.{}' cannot hold nested lists",
                    self.name, field
                )));
            }
        }
        Ok(())
    }

    /// Check that `entry` may be appended to `field`.
    pub fn check_append(&self, field: &str, entry: &FieldValue) -> Result<(), SyncError> {
        let spec = self.field_spec(field)?;
        if spec.kind != FieldKind::Log {
            return Err(SyncError::InvalidChange(format!(
                "Field '{}.{}' is not an append-only log",
                self.name, field
            )));
        }
        if !entry.is_scalar() {
            return Err(SyncError::InvalidChange(format!(
                "Log '{}.{}' entries must be scalar",
                self.name, field
            )));
        }
        Ok(())
    }
}

/// The full set of collections a document holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    collections: BTreeMap<String, CollectionSchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(mut self, collection: CollectionSchema) -> Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    pub fn get(&self, name: &str) -> Result<&CollectionSchema, SyncError> {
        self.collections
            .get(name)
            .ok_or_else(|| SyncError::InvalidChange(format!("Unknown collection '{}'", name)))
    }

    pub fn collections(&self) -> impl Iterator<Item = &CollectionSchema> {
        self.collections.values()
    }

    pub fn collection_visibility(&self, name: &str) -> Option<Visibility> {
        self.collections.get(name).map(|c| c.visibility)
    }

    pub fn field_visibility(&self, collection: &str, field: &str) -> Option<Visibility> {
        self.collections
            .get(collection)
            .and_then(|c| c.field_visibility(field))
    }
}
