//! Peer record persistence (key: peer identifier, value: postcard PeerRecord)

use crate::error::SyncError;
use crate::identity::Did;
use crate::types::PeerRecord;
use redb::{ReadableTable, TableDefinition};

use super::Storage;

pub(crate) const PEERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("peers");

impl Storage {
    /// Save a peer record, overwriting any existing one.
    pub fn save_peer(&self, peer: &PeerRecord) -> Result<(), SyncError> {
        let db = self.db().read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(PEERS_TABLE)?;
            let serialized =
                postcard::to_allocvec(peer).map_err(|e| SyncError::Serialization(e.to_string()))?;
            table.insert(peer.peer_id.as_str(), serialized.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_peer(&self, peer_id: &Did) -> Result<Option<PeerRecord>, SyncError> {
        let db = self.db().read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PEERS_TABLE)?;

        if let Some(data) = table.get(peer_id.as_str())? {
            let peer: PeerRecord = postcard::from_bytes(data.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            Ok(Some(peer))
        } else {
            Ok(None)
        }
    }

    /// Delete a peer record. Returns whether one existed.
    pub fn delete_peer(&self, peer_id: &Did) -> Result<bool, SyncError> {
        let db = self.db().read();
        let write_txn = db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(PEERS_TABLE)?;
            let removed = table.remove(peer_id.as_str())?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    pub fn list_peers(&self) -> Result<Vec<PeerRecord>, SyncError> {
        let db = self.db().read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PEERS_TABLE)?;

        let mut peers = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let peer: PeerRecord = postcard::from_bytes(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            peers.push(peer);
        }
        Ok(peers)
    }
}
