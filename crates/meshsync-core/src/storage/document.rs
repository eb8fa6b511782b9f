//! Document snapshot and change log
//!
//! The change log is keyed by `(replica, seq)` so replaying it after a
//! restart walks each replica's changes in order. A checkpoint writes a fresh
//! snapshot and drops compacted changes in the same transaction.

use crate::document::Change;
use crate::error::SyncError;
use crate::types::ChangeId;
use redb::{ReadableTable, ReadableTableMetadata, TableDefinition};

use super::Storage;

pub(crate) const DOC_SNAPSHOT_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("doc_snapshot");

pub(crate) const DOC_CHANGES_TABLE: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("doc_changes");

const SNAPSHOT_KEY: &str = "current";

impl Storage {
    /// Persist a batch of changes atomically.
    pub fn append_changes(&self, changes: &[Change]) -> Result<(), SyncError> {
        if changes.is_empty() {
            return Ok(());
        }
        let db = self.db().read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(DOC_CHANGES_TABLE)?;
            for change in changes {
                let data = postcard::to_allocvec(change)
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                table.insert((change.replica.as_str(), change.seq), data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_changes(&self) -> Result<Vec<Change>, SyncError> {
        let db = self.db().read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(DOC_CHANGES_TABLE)?;

        let mut changes = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let change: Change = postcard::from_bytes(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            changes.push(change);
        }
        Ok(changes)
    }

    pub fn count_changes(&self) -> Result<u64, SyncError> {
        let db = self.db().read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(DOC_CHANGES_TABLE)?;
        Ok(table.len()?)
    }

    /// Replace the snapshot and drop `compacted` changes in one transaction.
    pub fn save_doc_snapshot(
        &self,
        snapshot: &[u8],
        compacted: &[ChangeId],
    ) -> Result<(), SyncError> {
        let db = self.db().read();
        let write_txn = db.begin_write()?;
        {
            let mut snapshots = write_txn.open_table(DOC_SNAPSHOT_TABLE)?;
            snapshots.insert(SNAPSHOT_KEY, snapshot)?;
            let mut changes = write_txn.open_table(DOC_CHANGES_TABLE)?;
            for id in compacted {
                changes.remove((id.replica.as_str(), id.seq))?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_doc_snapshot(&self) -> Result<Option<Vec<u8>>, SyncError> {
        let db = self.db().read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(DOC_SNAPSHOT_TABLE)?;
        match table.get(SNAPSHOT_KEY)? {
            Some(v) => Ok(Some(v.value().to_vec())),
            None => Ok(None),
        }
    }
}
