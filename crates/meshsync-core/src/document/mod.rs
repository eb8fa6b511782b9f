//! Replicated community document
//!
//! Typed collections merged conflict-free across replicas. Feature modules
//! read and write through [`DocumentStore`] and listen on
//! [`DocumentStore::subscribe`]; they never see wire bytes.
//!
//! ## Example
//!
//! ```rust
//! use meshsync_core::document::{Audience, DocumentStore, Listing, Schema};
//! use meshsync_core::types::ReplicaId;
//!
//! let phone = DocumentStore::new_in_memory(ReplicaId::new("phone"), Schema::community()).unwrap();
//! let radio = DocumentStore::new_in_memory(ReplicaId::new("radio"), Schema::community()).unwrap();
//!
//! phone.insert(&Listing { title: "Ladder".into(), available: true, ..Default::default() }).unwrap();
//!
//! let delta = phone.changes_since(&radio.version(), Audience::Community).unwrap();
//! radio.merge_remote(delta).unwrap();
//! assert_eq!(radio.list::<Listing>().len(), 1);
//! ```

mod change;
mod crdt;
mod model;
mod privacy;
mod schema;
mod store;
mod version;

pub use change::{Change, ChangeBuilder, Op};
pub use crdt::{AppendLog, DocState, LwwRegister, Membership, Record};
pub use model::{Attestation, Listing, Model, Profile, ResourceRequest};
pub use privacy::{filter_change, filter_state, Audience};
pub use schema::{CollectionSchema, FieldKind, FieldSpec, FieldValue, Schema, Visibility};
pub use store::{DocumentEvent, DocumentStore, MergeReport, DEFAULT_MAX_LOG_CHANGES};
pub use version::{SeqRange, VersionVector};
