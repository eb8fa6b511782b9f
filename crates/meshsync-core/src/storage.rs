//! Persistent storage using redb
//!
//! One database per node holds everything that must survive a restart with
//! no network:
//! - the local identity and the community key
//! - the document snapshot and change log
//! - stored bundles, the delivered-bundle ledger and the bundle counter
//! - pinned peer records
//!
//! The handle is cheap to clone; the document store, bundle store and peer
//! registry all share it.

use crate::error::SyncError;
use crate::identity::{IdentityService, LocalIdentity};
use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use std::path::Path;
use std::sync::Arc;

mod bundles;
mod document;
mod peers;

use bundles::{BUNDLES_TABLE, DELIVERED_TABLE};
use document::{DOC_CHANGES_TABLE, DOC_SNAPSHOT_TABLE};
use peers::PEERS_TABLE;

const IDENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");
const KEYS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("keys");
pub(crate) const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const IDENTITY_KEY: &str = "local";
const COMMUNITY_KEY: &str = "community";
const ENDPOINT_KEY: &str = "endpoint";

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Volatile database for tests and ephemeral nodes.
    pub fn in_memory() -> Result<Self, SyncError> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, SyncError> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(IDENTITY_TABLE)?;
            let _ = write_txn.open_table(KEYS_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
            let _ = write_txn.open_table(DOC_SNAPSHOT_TABLE)?;
            let _ = write_txn.open_table(DOC_CHANGES_TABLE)?;
            let _ = write_txn.open_table(BUNDLES_TABLE)?;
            let _ = write_txn.open_table(DELIVERED_TABLE)?;
            let _ = write_txn.open_table(PEERS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    pub(crate) fn db(&self) -> &Arc<RwLock<Database>> {
        &self.db
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity & Keys
    // ═══════════════════════════════════════════════════════════════════════

    pub fn save_identity(&self, identity: &LocalIdentity) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITY_TABLE)?;
            table.insert(IDENTITY_KEY, identity.to_bytes().as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_identity(&self) -> Result<Option<LocalIdentity>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;
        match table.get(IDENTITY_KEY)? {
            Some(v) => Ok(Some(LocalIdentity::from_bytes(v.value())?)),
            None => Ok(None),
        }
    }

    /// Load the stored identity, generating and saving one on first run.
    pub fn load_or_create_identity(&self) -> Result<LocalIdentity, SyncError> {
        if let Some(identity) = self.load_identity()? {
            return Ok(identity);
        }
        let identity = LocalIdentity::generate()?;
        self.save_identity(&identity)?;
        tracing::info!(peer = %identity.peer_id(), "Generated new node identity");
        Ok(identity)
    }

    pub fn save_community_key(&self, key: &[u8; 32]) -> Result<(), SyncError> {
        self.save_key(COMMUNITY_KEY, key)
    }

    pub fn load_community_key(&self) -> Result<Option<[u8; 32]>, SyncError> {
        self.load_key(COMMUNITY_KEY)
    }

    /// Secret key of the local-network endpoint, stable across restarts so
    /// statically configured peers can keep dialing the same address.
    pub fn load_or_create_endpoint_key(&self) -> Result<[u8; 32], SyncError> {
        if let Some(key) = self.load_key(ENDPOINT_KEY)? {
            return Ok(key);
        }
        let mut key = [0u8; 32];
        getrandom::getrandom(&mut key)
            .map_err(|e| SyncError::Crypto(format!("Failed to generate endpoint key: {}", e)))?;
        self.save_key(ENDPOINT_KEY, &key)?;
        Ok(key)
    }

    fn save_key(&self, name: &str, key: &[u8; 32]) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(KEYS_TABLE)?;
            table.insert(name, key.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_key(&self, name: &str) -> Result<Option<[u8; 32]>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KEYS_TABLE)?;
        match table.get(name)? {
            Some(v) => {
                let key: [u8; 32] = v.value().try_into().map_err(|_| {
                    SyncError::Storage(format!("Key '{}' must be 32 bytes", name))
                })?;
                Ok(Some(key))
            }
            None => Ok(None),
        }
    }
}
