//! meshsync core library
//!
//! Offline-first synchronization for a community database replicated across
//! devices that only meet now and then, over short-range or very slow links.
//!
//! ## Overview
//!
//! - **Document store**: typed collections merged as CRDTs; any order, any
//!   number of times, same result
//! - **Transport**: one `Bearer` trait over proximity radios, the local
//!   network and long-range mesh links
//! - **Bundle router**: store-and-forward relay with priorities, TTLs and
//!   hop limits for peers that are never in range of each other
//! - **Sync protocol**: mutual authentication, per-field disclosure and
//!   encrypted exchange whenever two nodes meet
//!
//! ## Quick Start
//!
//! ```ignore
//! use meshsync_core::{EngineConfig, Listing, MeshEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = MeshEngine::open_dir(EngineConfig::load("meshsync.toml")?)?;
//!
//!     engine.documents().insert(&Listing {
//!         title: "Grain mill".into(),
//!         category: "tools".into(),
//!         available: true,
//!         ..Default::default()
//!     })?;
//!
//!     for (id, listing) in engine.documents().list::<Listing>() {
//!         println!("{id}: {}", listing.title);
//!     }
//!
//!     engine.start()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod document;
pub mod dtn;
pub mod engine;
pub mod error;
pub mod identity;
pub mod logging;
pub mod peers;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports
pub use config::EngineConfig;
pub use document::{
    Attestation, Change, DocumentEvent, DocumentStore, Listing, MergeReport, Model, Profile,
    ResourceRequest, Schema, VersionVector,
};
pub use dtn::{Bundle, BundleId, BundleRouter, Priority};
pub use engine::{MeshEngine, NodeInfo};
pub use error::{SyncError, SyncResult};
pub use identity::{Did, IdentityService, LocalIdentity};
pub use peers::PeerRegistry;
pub use storage::Storage;
pub use sync::{SessionReport, SessionState, SyncEvent};
pub use transport::{Bearer, BearerKind, BearerProfile, Connection, PeerAddress};
pub use types::*;
