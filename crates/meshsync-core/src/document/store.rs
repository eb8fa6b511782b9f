//! The document store: typed reads, validated writes, idempotent merge
//!
//! One `DocumentStore` per node. It is cheap to clone (shared inner state) and
//! is handed explicitly to every component that needs it. Readers run
//! concurrently; writers are serialized by a single `RwLock`. Every write is
//! validated first and persisted in one redb transaction before the in-memory
//! state changes, so a crash or cancellation never leaves a half-applied unit.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::change::{Change, ChangeBuilder};
use super::crdt::{DocState, Record};
use super::model::Model;
use super::privacy::{filter_change, filter_state, Audience};
use super::schema::{Schema, Visibility};
use super::version::VersionVector;
use crate::error::{SyncError, SyncResult};
use crate::storage::Storage;
use crate::types::{now_millis, ChangeId, RecordId, ReplicaId};

/// Snapshot wire version
const SNAPSHOT_VERSION: u8 = 1;

/// zstd level used for snapshots
const SNAPSHOT_COMPRESSION: i32 = 3;

/// Channel capacity for document events
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Changes kept in the log after a checkpoint
pub const DEFAULT_MAX_LOG_CHANGES: usize = 10_000;

/// Largest decompressed snapshot accepted from storage or a peer.
pub const MAX_SNAPSHOT_RAW_BYTES: u64 = 256 * 1024 * 1024;

/// Fired after every successful mutation
#[derive(Debug, Clone)]
pub enum DocumentEvent {
    /// A change made on this device
    LocalChange(Change),
    /// Foreign changes absorbed by `merge_remote`
    RemoteChanges { ids: Vec<ChangeId> },
    /// A peer snapshot was joined into the document
    SnapshotImported { records: usize },
}

/// Outcome of `merge_remote`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub applied: Vec<ChangeId>,
    pub duplicates: usize,
    pub rejected: usize,
}

impl MergeReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u8,
    clock: u64,
    applied: VersionVector,
    state: DocState,
}

impl Snapshot {
    fn encode(&self) -> SyncResult<Vec<u8>> {
        let raw =
            postcard::to_allocvec(self).map_err(|e| SyncError::Serialization(e.to_string()))?;
        zstd::encode_all(raw.as_slice(), SNAPSHOT_COMPRESSION)
            .map_err(|e| SyncError::Serialization(format!("Snapshot compression failed: {}", e)))
    }

    fn decode(bytes: &[u8]) -> SyncResult<Self> {
        Self::decode_bounded(bytes, MAX_SNAPSHOT_RAW_BYTES)
    }

    fn decode_bounded(bytes: &[u8], limit: u64) -> SyncResult<Self> {
        let failed =
            |e: std::io::Error| SyncError::Decode(format!("Snapshot decompression failed: {}", e));
        let decoder = zstd::stream::read::Decoder::new(bytes).map_err(failed)?;
        let mut raw = Vec::new();
        decoder
            .take(limit + 1)
            .read_to_end(&mut raw)
            .map_err(failed)?;
        if raw.len() as u64 > limit {
            return Err(SyncError::Decode(format!(
                "Snapshot expands beyond {} bytes",
                limit
            )));
        }
        let snapshot: Snapshot = postcard::from_bytes(&raw)
            .map_err(|e| SyncError::Decode(format!("Malformed snapshot: {}", e)))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SyncError::Decode(format!(
                "Unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}

#[derive(Default)]
struct DocData {
    state: DocState,
    applied: VersionVector,
    log: BTreeMap<ChangeId, Change>,
    clock: u64,
}

impl DocData {
    fn absorb(&mut self, change: Change) {
        self.state.apply_change(&change);
        self.applied.insert(&change.id());
        self.clock = self.clock.max(change.counter);
        self.log.insert(change.id(), change);
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            clock: self.clock,
            applied: self.applied.clone(),
            state: self.state.clone(),
        }
    }
}

struct StoreInner {
    replica: ReplicaId,
    schema: Schema,
    storage: Storage,
    max_log_changes: usize,
    data: RwLock<DocData>,
    events: broadcast::Sender<DocumentEvent>,
}

/// CRDT document store
#[derive(Clone)]
pub struct DocumentStore {
    inner: Arc<StoreInner>,
}

impl DocumentStore {
    /// Volatile store backed by an in-memory database.
    pub fn new_in_memory(replica: ReplicaId, schema: Schema) -> SyncResult<Self> {
        Self::open(Storage::in_memory()?, replica, schema)
    }

    /// Open the document persisted in `storage`.
    pub fn open(storage: Storage, replica: ReplicaId, schema: Schema) -> SyncResult<Self> {
        Self::open_with_log_limit(storage, replica, schema, DEFAULT_MAX_LOG_CHANGES)
    }

    /// Open with an explicit change-log bound applied at each checkpoint.
    pub fn open_with_log_limit(
        storage: Storage,
        replica: ReplicaId,
        schema: Schema,
        max_log_changes: usize,
    ) -> SyncResult<Self> {
        let mut data = DocData::default();

        if let Some(bytes) = storage.load_doc_snapshot()? {
            let snapshot = Snapshot::decode(&bytes)?;
            data.state = snapshot.state;
            data.applied = snapshot.applied;
            data.clock = snapshot.clock;
        }

        let changes = storage.load_changes()?;
        let replayed = changes.len();
        for change in changes {
            data.absorb(change);
        }

        info!(
            replica = %replica,
            changes = replayed,
            clock = data.clock,
            "Opened document store"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(StoreInner {
                replica,
                schema,
                storage,
                max_log_changes,
                data: RwLock::new(data),
                events,
            }),
        })
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.inner.replica
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Subscribe to mutation notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.inner.events.subscribe()
    }

    fn notify(&self, event: DocumentEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    /// Summary of every change reflected in the document.
    pub fn version(&self) -> VersionVector {
        self.inner.data.read().applied.clone()
    }

    /// Current Lamport clock.
    pub fn clock(&self) -> u64 {
        self.inner.data.read().clock
    }

    /// Number of changes held in the log.
    pub fn log_len(&self) -> usize {
        self.inner.data.read().log.len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Mutation
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply a local mutation and return the resulting change.
    ///
    /// Fails only if the mutation is malformed (unknown collection or field,
    /// wrong value kind, missing record) or persistence fails.
    pub fn apply_local_change<F>(&self, mutate: F) -> SyncResult<Change>
    where
        F: FnOnce(&mut ChangeBuilder<'_>) -> SyncResult<()>,
    {
        let mut guard = self.inner.data.write();
        let data = &mut *guard;

        let change = {
            let mut tx = ChangeBuilder::new(
                &self.inner.schema,
                &data.state,
                self.inner.replica.clone(),
                data.clock + 1,
            );
            mutate(&mut tx)?;
            if tx.is_empty() {
                return Err(SyncError::InvalidChange(
                    "Change has no operations".to_string(),
                ));
            }
            let seq = data.applied.max_seq(&self.inner.replica) + 1;
            tx.finish(seq, now_millis())
        };

        self.inner
            .storage
            .append_changes(std::slice::from_ref(&change))?;
        data.absorb(change.clone());
        drop(guard);

        debug!(
            seq = change.seq,
            counter = change.counter,
            ops = change.ops.len(),
            "Applied local change"
        );
        self.notify(DocumentEvent::LocalChange(change.clone()));
        Ok(change)
    }

    /// Absorb foreign changes. Duplicates are skipped silently; changes that
    /// do not fit the schema are rejected individually. Ops on private fields
    /// are stripped, since private data never arrives from a peer.
    pub fn merge_remote(&self, changes: Vec<Change>) -> SyncResult<MergeReport> {
        let mut report = MergeReport::default();
        let mut guard = self.inner.data.write();

        let mut seen = BTreeSet::new();
        let mut fresh = Vec::new();
        for change in changes {
            let id = change.id();
            if !seen.insert(id.clone()) {
                report.duplicates += 1;
                continue;
            }
            if let Err(e) = change.validate(&self.inner.schema) {
                warn!(change = %id, error = %e, "Rejected remote change");
                report.rejected += 1;
                continue;
            }
            let change = if change.max_visibility(&self.inner.schema) == Visibility::Private {
                warn!(change = %id, "Stripped private ops from remote change");
                filter_change(&change, &self.inner.schema, Audience::TrustedPeer)
            } else {
                change
            };
            if guard.applied.contains(&id) {
                // A fuller copy of a change we only saw filtered
                let narrower = match guard.log.get(&id) {
                    Some(logged) => logged.ops.len() < change.ops.len(),
                    // Compacted; ops are idempotent so trusted ones reapply safely
                    None => change.max_visibility(&self.inner.schema) == Visibility::Trusted,
                };
                if !narrower {
                    report.duplicates += 1;
                    continue;
                }
                debug!(change = %id, "Widening previously filtered change");
            }
            fresh.push(change);
        }

        if fresh.is_empty() {
            return Ok(report);
        }

        self.inner.storage.append_changes(&fresh)?;
        for change in fresh {
            report.applied.push(change.id());
            guard.absorb(change);
        }
        drop(guard);

        debug!(
            applied = report.applied.len(),
            duplicates = report.duplicates,
            rejected = report.rejected,
            "Merged remote changes"
        );
        self.notify(DocumentEvent::RemoteChanges {
            ids: report.applied.clone(),
        });
        Ok(report)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Snapshots
    // ═══════════════════════════════════════════════════════════════════════

    /// Full local state, private fields included. For local backup only;
    /// use [`export_snapshot_for`](Self::export_snapshot_for) for peers.
    pub fn export_snapshot(&self) -> SyncResult<Vec<u8>> {
        self.inner.data.read().snapshot().encode()
    }

    /// State filtered for `audience`, compressed for transfer.
    pub fn export_snapshot_for(&self, audience: Audience) -> SyncResult<Vec<u8>> {
        let data = self.inner.data.read();
        Snapshot {
            version: SNAPSHOT_VERSION,
            clock: data.clock,
            applied: data.applied.clone(),
            state: filter_state(&data.state, &self.inner.schema, audience),
        }
        .encode()
    }

    /// Join a snapshot into the document.
    ///
    /// Private data in the incoming snapshot is discarded, and any value that
    /// does not fit the schema rejects the whole snapshot.
    pub fn import_snapshot(&self, bytes: &[u8]) -> SyncResult<()> {
        let incoming = Snapshot::decode(bytes)?;
        let sanitized = filter_state(&incoming.state, &self.inner.schema, Audience::TrustedPeer);
        sanitized.check_schema(&self.inner.schema)?;

        let mut guard = self.inner.data.write();
        let mut merged = guard.snapshot();
        merged.state.merge(&sanitized);
        merged.applied.merge(&incoming.applied);
        merged.clock = merged.clock.max(incoming.clock);

        self.inner.storage.save_doc_snapshot(&merged.encode()?, &[])?;
        guard.state = merged.state;
        guard.applied = merged.applied;
        guard.clock = merged.clock;
        let records = guard.state.live_records();
        drop(guard);

        info!(records, "Imported snapshot");
        self.notify(DocumentEvent::SnapshotImported { records });
        Ok(())
    }

    /// Persist a snapshot and compact the change log down to its bound.
    ///
    /// Compacted changes are the oldest by Lamport counter. Peers that still
    /// need them get a snapshot instead of incremental changes.
    pub fn checkpoint(&self) -> SyncResult<usize> {
        let mut guard = self.inner.data.write();
        let excess = guard.log.len().saturating_sub(self.inner.max_log_changes);
        let mut by_age: Vec<(u64, ChangeId)> = guard
            .log
            .values()
            .map(|c| (c.counter, c.id()))
            .collect();
        by_age.sort();
        let compacted: Vec<ChangeId> = by_age.into_iter().take(excess).map(|(_, id)| id).collect();

        self.inner
            .storage
            .save_doc_snapshot(&guard.snapshot().encode()?, &compacted)?;
        for id in &compacted {
            guard.log.remove(id);
        }
        drop(guard);

        if !compacted.is_empty() {
            info!(compacted = compacted.len(), "Compacted change log");
        }
        Ok(compacted.len())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Delta computation
    // ═══════════════════════════════════════════════════════════════════════

    /// Changes a peer at `remote` is missing, filtered for `audience`.
    ///
    /// Returns `None` when some of those changes are no longer in the log
    /// (compacted, or only known through an imported snapshot); the peer then
    /// needs a snapshot.
    pub fn changes_since(
        &self,
        remote: &VersionVector,
        audience: Audience,
    ) -> Option<Vec<Change>> {
        let data = self.inner.data.read();
        let mut out = Vec::new();
        for id in data.applied.missing_from(remote) {
            let change = data.log.get(&id)?;
            out.push(filter_change(change, &self.inner.schema, audience));
        }
        out.sort_by(|a, b| (a.counter, &a.replica, a.seq).cmp(&(b.counter, &b.replica, b.seq)));
        Some(out)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    pub fn get_record(&self, collection: &str, id: &RecordId) -> Option<Record> {
        self.inner.data.read().state.record(collection, id)
    }

    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.inner.data.read().state.records(collection)
    }

    pub fn get<M: Model>(&self, id: &RecordId) -> Option<M> {
        self.get_record(M::COLLECTION, id)
            .and_then(|r| M::from_record(&r))
    }

    pub fn list<M: Model>(&self) -> Vec<(RecordId, M)> {
        self.records(M::COLLECTION)
            .into_iter()
            .filter_map(|r| M::from_record(&r).map(|m| (r.id, m)))
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Typed writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert a model as a new record.
    pub fn insert<M: Model>(&self, model: &M) -> SyncResult<RecordId> {
        let change = self.apply_local_change(|tx| {
            let id = tx.insert(M::COLLECTION)?;
            model.write(tx, &id)
        })?;
        let id = change
            .inserted_records()
            .next()
            .map(|(_, id)| id.clone())
            .ok_or_else(|| SyncError::InvalidOperation("Insert produced no record".to_string()));
        id
    }

    /// Overwrite every field of an existing record.
    pub fn update<M: Model>(&self, id: &RecordId, model: &M) -> SyncResult<Change> {
        self.apply_local_change(|tx| model.write(tx, id))
    }

    pub fn remove<M: Model>(&self, id: &RecordId) -> SyncResult<Change> {
        self.apply_local_change(|tx| tx.remove(M::COLLECTION, id))
    }
}
