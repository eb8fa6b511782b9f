//! Bundle persistence
//!
//! Stored bundles, the delivered-id ledger (with its own expiry so it does not
//! grow forever) and the local bundle sequence counter.

use crate::dtn::{Bundle, BundleId};
use crate::error::SyncError;
use crate::identity::Did;
use redb::{ReadableTable, TableDefinition};

use super::{Storage, META_TABLE};

/// Stored bundles (key: (origin, seq), value: encoded bundle)
pub(crate) const BUNDLES_TABLE: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("bundles");

/// Delivered bundle ids (key: (origin, seq), value: forget-after unix millis)
pub(crate) const DELIVERED_TABLE: TableDefinition<(&str, u64), u64> =
    TableDefinition::new("delivered");

const BUNDLE_SEQ_KEY: &str = "bundle_seq";

impl Storage {
    /// Insert or replace `bundle` and drop `evicted` in one transaction.
    ///
    /// With `seen_until`, the bundle id also enters the delivered ledger in
    /// the same transaction.
    pub fn put_bundle(
        &self,
        bundle: &Bundle,
        evicted: &[BundleId],
        seen_until: Option<u64>,
    ) -> Result<(), SyncError> {
        let data = bundle.encode()?;
        let key = (bundle.id.origin.as_str(), bundle.id.seq);
        let db = self.db().read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(BUNDLES_TABLE)?;
            for id in evicted {
                table.remove((id.origin.as_str(), id.seq))?;
            }
            table.insert(key, data.as_slice())?;
            if let Some(forget_after) = seen_until {
                let mut delivered = write_txn.open_table(DELIVERED_TABLE)?;
                delivered.insert(key, forget_after)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn remove_bundles(&self, ids: &[BundleId]) -> Result<(), SyncError> {
        if ids.is_empty() {
            return Ok(());
        }
        let db = self.db().read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(BUNDLES_TABLE)?;
            for id in ids {
                table.remove((id.origin.as_str(), id.seq))?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_bundles(&self) -> Result<Vec<Bundle>, SyncError> {
        let db = self.db().read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(BUNDLES_TABLE)?;

        let mut bundles = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            bundles.push(Bundle::decode(value.value())?);
        }
        Ok(bundles)
    }

    /// Record `id` as delivered and drop any stored copy, atomically.
    pub fn record_delivered(
        &self,
        id: &BundleId,
        forget_after: u64,
        drop_stored: bool,
    ) -> Result<(), SyncError> {
        let db = self.db().read();
        let write_txn = db.begin_write()?;
        {
            let key = (id.origin.as_str(), id.seq);
            let mut delivered = write_txn.open_table(DELIVERED_TABLE)?;
            delivered.insert(key, forget_after)?;
            if drop_stored {
                let mut bundles = write_txn.open_table(BUNDLES_TABLE)?;
                bundles.remove(key)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn load_delivered(&self) -> Result<Vec<(BundleId, u64)>, SyncError> {
        let db = self.db().read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(DELIVERED_TABLE)?;

        let mut entries = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let (origin, seq) = key.value();
            let id = BundleId {
                origin: Did::parse(origin)?,
                seq,
            };
            entries.push((id, value.value()));
        }
        Ok(entries)
    }

    /// Drop expired bundles and ledger entries in one transaction.
    pub fn purge_bundles(
        &self,
        bundles: &[BundleId],
        ledger: &[BundleId],
    ) -> Result<(), SyncError> {
        let db = self.db().read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(BUNDLES_TABLE)?;
            for id in bundles {
                table.remove((id.origin.as_str(), id.seq))?;
            }
            let mut delivered = write_txn.open_table(DELIVERED_TABLE)?;
            for id in ledger {
                delivered.remove((id.origin.as_str(), id.seq))?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Allocate the next local bundle sequence number (starts at 1).
    pub fn next_bundle_seq(&self) -> Result<u64, SyncError> {
        let db = self.db().read();
        let write_txn = db.begin_write()?;
        let next = {
            let mut table = write_txn.open_table(META_TABLE)?;
            let current = table.get(BUNDLE_SEQ_KEY)?.map(|v| v.value()).unwrap_or(0);
            let next = current + 1;
            table.insert(BUNDLE_SEQ_KEY, next)?;
            next
        };
        write_txn.commit()?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtn::Priority;
    use std::time::Duration;

    fn bundle(seq: u64) -> Bundle {
        Bundle::new(
            BundleId {
                origin: Did::from_signing_key(&[1u8; 32]),
                seq,
            },
            None,
            vec![0u8; 16],
            Priority::Normal,
            Duration::from_secs(60),
            3,
            0,
        )
    }

    #[test]
    fn test_put_with_eviction_is_atomic() {
        let storage = Storage::in_memory().unwrap();
        storage.put_bundle(&bundle(1), &[], None).unwrap();
        storage.put_bundle(&bundle(2), &[bundle(1).id], Some(50)).unwrap();
        let stored = storage.load_bundles().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id.seq, 2);
        assert_eq!(storage.load_delivered().unwrap(), vec![(bundle(2).id, 50)]);
    }

    #[test]
    fn test_delivered_ledger() {
        let storage = Storage::in_memory().unwrap();
        storage.put_bundle(&bundle(1), &[], None).unwrap();
        storage.record_delivered(&bundle(1).id, 99, true).unwrap();
        assert!(storage.load_bundles().unwrap().is_empty());
        let ledger = storage.load_delivered().unwrap();
        assert_eq!(ledger, vec![(bundle(1).id, 99)]);

        storage.purge_bundles(&[], &[bundle(1).id]).unwrap();
        assert!(storage.load_delivered().unwrap().is_empty());
    }

    #[test]
    fn test_bundle_seq_is_monotonic() {
        let storage = Storage::in_memory().unwrap();
        assert_eq!(storage.next_bundle_seq().unwrap(), 1);
        assert_eq!(storage.next_bundle_seq().unwrap(), 2);
    }
}
