//! Session wire protocol
//!
//! Every frame on a [`Connection`](crate::transport::Connection) is a
//! [`Frame`]: a version byte followed by postcard. The handshake travels in
//! clear `Hello`/`Proof` frames; everything after it is a [`SyncMessage`]
//! sealed in an [`EncryptedEnvelope`](super::EncryptedEnvelope) under the
//! session key.
//!
//! ## Message Flow
//!
//! ```text
//! Initiator                              Responder
//!   |--- Hello {challenge, sig} ------------->|
//!   |<-- Hello {challenge, counter, sig} -----|
//!   |--- Proof {counter} -------------------->|
//!   |                                         |
//!   |<=== Summary {version} ================>|   (both ways, sealed)
//!   |<=== Changes / SnapshotPart ===========>|
//!   |<=== Bundles / BundleAck ==============>|
//!   |<=== Done / Ack =======================>|
//!   |<=== Changes (live) ===================>|
//! ```
//!
//! Messages larger than the bearer's payload ceiling are split into
//! [`SyncMessage::Fragment`]s; snapshots always travel as
//! [`SyncMessage::SnapshotPart`]s.

use serde::{Deserialize, Serialize};

use crate::crypto::TAG_SIZE;
use crate::document::{Change, VersionVector};
use crate::dtn::BundleId;
use crate::error::SyncError;
use crate::identity::Did;
use crate::transport::{BearerKind, BearerProfile};

use super::envelope::ENVELOPE_FIXED_OVERHEAD;

/// Current frame protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Version byte, enum tag and the length prefix of a sealed frame.
const FRAME_OVERHEAD: usize = 8;

/// Enum tag plus three varints of a part message.
const PART_OVERHEAD: usize = 16;

/// Largest message a peer may send as fragments.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Largest compressed snapshot a peer may send as parts.
pub const MAX_SNAPSHOT_BYTES: usize = 64 * 1024 * 1024;

/// Opening message of each side of the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub peer_id: Did,
    pub display_name: Option<String>,
    pub signing_key: [u8; 32],
    pub agreement_key: [u8; 32],
    /// Fresh random challenge for the other side to sign
    pub challenge: [u8; 32],
    pub transports: Vec<BearerKind>,
    /// Responder only: signature over the initiator's challenge
    pub counter_signature: Option<Vec<u8>>,
    /// Signature over all of the above
    pub signature: Vec<u8>,
}

/// Initiator's answer to the responder's challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub counter_signature: Vec<u8>,
}

/// Unit of transmission on a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Hello(Hello),
    Proof(Proof),
    /// An encoded [`EncryptedEnvelope`](super::EncryptedEnvelope)
    Sealed(Vec<u8>),
    /// Handshake refused; the sender disconnects next
    Reject { reason: String },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        let mut out = vec![PROTOCOL_VERSION];
        out.extend(
            postcard::to_allocvec(self)
                .map_err(|e| SyncError::Serialization(format!("Failed to encode frame: {}", e)))?,
        );
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        match bytes.split_first() {
            Some((&PROTOCOL_VERSION, body)) => postcard::from_bytes(body)
                .map_err(|e| SyncError::Decode(format!("Malformed frame: {}", e))),
            Some((version, _)) => Err(SyncError::Decode(format!(
                "Unsupported frame version {}",
                version
            ))),
            None => Err(SyncError::Decode("Empty frame".into())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::Proof(_) => "proof",
            Frame::Sealed(_) => "sealed",
            Frame::Reject { .. } => "reject",
        }
    }
}

/// Messages exchanged once a session is authenticated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// What the sender already holds
    Summary { version: VersionVector },

    /// Incremental changes, filtered for the receiver
    Changes { changes: Vec<Change> },

    /// One chunk of a compressed, filtered document snapshot
    SnapshotPart { index: u32, total: u32, data: Vec<u8> },

    /// One chunk of an encoded `SyncMessage` too large for a single frame
    Fragment { index: u32, total: u32, data: Vec<u8> },

    /// Encoded bundles handed over for store-and-forward
    Bundles { bundles: Vec<Vec<u8>> },

    /// Bundles the sender has taken responsibility for
    BundleAck { ids: Vec<BundleId> },

    /// Sender has pushed everything it had at the time
    Done,

    /// Acknowledges the peer's `Done`
    Ack,
}

impl SyncMessage {
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        postcard::to_allocvec(self)
            .map_err(|e| SyncError::Serialization(format!("Failed to encode message: {}", e)))
    }

    pub fn decode(data: &[u8]) -> Result<Self, SyncError> {
        postcard::from_bytes(data)
            .map_err(|e| SyncError::Decode(format!("Malformed message: {}", e)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Summary { .. } => "summary",
            SyncMessage::Changes { .. } => "changes",
            SyncMessage::SnapshotPart { .. } => "snapshot-part",
            SyncMessage::Fragment { .. } => "fragment",
            SyncMessage::Bundles { .. } => "bundles",
            SyncMessage::BundleAck { .. } => "bundle-ack",
            SyncMessage::Done => "done",
            SyncMessage::Ack => "ack",
        }
    }
}

/// Largest encoded `SyncMessage` that still fits one frame on `profile`
/// once sealed by `sender`.
pub fn message_budget(profile: &BearerProfile, sender: &Did) -> usize {
    let overhead = FRAME_OVERHEAD + ENVELOPE_FIXED_OVERHEAD + TAG_SIZE + sender.as_str().len();
    profile
        .max_payload
        .saturating_sub(overhead)
        .max(PART_OVERHEAD + 1)
}

/// Split `message` into fragments when its encoding exceeds `budget`.
pub fn fragment(message: SyncMessage, budget: usize) -> Result<Vec<SyncMessage>, SyncError> {
    let encoded = message.encode()?;
    if encoded.len() <= budget {
        return Ok(vec![message]);
    }
    Ok(split_parts(&encoded, budget)
        .map(|(index, total, data)| SyncMessage::Fragment { index, total, data })
        .collect())
}

/// Cut a snapshot into parts that each fit `budget`.
pub fn snapshot_parts(snapshot: &[u8], budget: usize) -> Vec<SyncMessage> {
    split_parts(snapshot, budget)
        .map(|(index, total, data)| SyncMessage::SnapshotPart { index, total, data })
        .collect()
}

fn part_chunk(budget: usize) -> usize {
    budget.saturating_sub(PART_OVERHEAD).max(1)
}

fn split_parts(bytes: &[u8], budget: usize) -> impl Iterator<Item = (u32, u32, Vec<u8>)> + '_ {
    let chunk = part_chunk(budget);
    let total = bytes.len().div_ceil(chunk).max(1) as u32;
    (0..total).map(move |index| {
        let start = index as usize * chunk;
        let end = (start + chunk).min(bytes.len());
        (index, total, bytes[start..end].to_vec())
    })
}

/// Group changes into as few `Changes` messages as fit `budget`.
///
/// A change too large on its own is fragmented.
pub fn pack_changes(changes: Vec<Change>, budget: usize) -> Result<Vec<SyncMessage>, SyncError> {
    pack(changes, budget, |changes| SyncMessage::Changes { changes })
}

/// Group encoded bundles into as few `Bundles` messages as fit `budget`.
pub fn pack_bundles(bundles: Vec<Vec<u8>>, budget: usize) -> Result<Vec<SyncMessage>, SyncError> {
    pack(bundles, budget, |bundles| SyncMessage::Bundles { bundles })
}

fn pack<T: Serialize>(
    items: Vec<T>,
    budget: usize,
    wrap: impl Fn(Vec<T>) -> SyncMessage,
) -> Result<Vec<SyncMessage>, SyncError> {
    // enum tag + vec length prefix
    const BATCH_OVERHEAD: usize = 6;

    let mut out = Vec::new();
    let mut batch = Vec::new();
    let mut size = BATCH_OVERHEAD;
    for item in items {
        let len = postcard::to_allocvec(&item)
            .map_err(|e| SyncError::Serialization(e.to_string()))?
            .len();
        if !batch.is_empty() && size + len > budget {
            out.extend(fragment(wrap(std::mem::take(&mut batch)), budget)?);
            size = BATCH_OVERHEAD;
        }
        size += len;
        batch.push(item);
    }
    if !batch.is_empty() {
        out.extend(fragment(wrap(batch), budget)?);
    }
    Ok(out)
}

/// Collects numbered parts until all have arrived.
#[derive(Debug)]
pub struct Reassembly {
    max_parts: u32,
    max_bytes: usize,
    total: u32,
    parts: Vec<Option<Vec<u8>>>,
    received: u32,
    held_bytes: usize,
}

impl Reassembly {
    /// Accept at most `max_bytes` cut into parts that fit `budget`.
    pub fn new(max_bytes: usize, budget: usize) -> Self {
        let max_parts = max_bytes.div_ceil(part_chunk(budget)).max(1);
        Self {
            max_parts: u32::try_from(max_parts).unwrap_or(u32::MAX),
            max_bytes,
            total: 0,
            parts: Vec::new(),
            received: 0,
            held_bytes: 0,
        }
    }

    /// Add one part; returns the joined bytes once complete.
    ///
    /// A part whose `total` disagrees with the parts already held restarts
    /// the assembly from that part.
    pub fn push(
        &mut self,
        index: u32,
        total: u32,
        data: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, SyncError> {
        if total == 0 || index >= total {
            return Err(SyncError::Decode(format!("Part {} of {}", index, total)));
        }
        if total > self.max_parts {
            return Err(SyncError::Decode(format!(
                "{} parts exceed the limit of {}",
                total, self.max_parts
            )));
        }
        if total != self.total {
            self.total = total;
            self.parts = vec![None; total as usize];
            self.received = 0;
            self.held_bytes = 0;
        }

        let slot = &mut self.parts[index as usize];
        let replaced = slot.as_ref().map_or(0, Vec::len);
        let held = self.held_bytes - replaced + data.len();
        if held > self.max_bytes {
            self.reset();
            return Err(SyncError::Decode(format!(
                "Parts exceed {} bytes",
                self.max_bytes
            )));
        }
        if slot.is_none() {
            self.received += 1;
        }
        *slot = Some(data);
        self.held_bytes = held;

        if self.received < self.total {
            return Ok(None);
        }
        let joined = self.parts.drain(..).flatten().flatten().collect();
        self.reset();
        Ok(Some(joined))
    }

    fn reset(&mut self) {
        self.total = 0;
        self.parts = Vec::new();
        self.received = 0;
        self.held_bytes = 0;
    }

    pub fn is_pending(&self) -> bool {
        self.received > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Op;
    use crate::types::{RecordId, ReplicaId};

    fn change(seq: u64, text: &str) -> Change {
        Change {
            replica: ReplicaId::new("r1"),
            seq,
            counter: seq,
            timestamp: 0,
            ops: vec![Op::Set {
                collection: "listings".into(),
                record: RecordId::from("rec"),
                field: "title".into(),
                value: Some(text.into()),
            }],
        }
    }

    #[test]
    fn test_frame_version_byte() {
        let frame = Frame::Reject {
            reason: "no".into(),
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);

        let mut future = bytes;
        future[0] = PROTOCOL_VERSION + 1;
        assert!(matches!(Frame::decode(&future), Err(SyncError::Decode(_))));
        assert!(Frame::decode(&[]).is_err());
    }

    #[test]
    fn test_budget_fits_sealed_frame() {
        let did = Did::from_signing_key(&[1u8; 32]);
        let profile = BearerProfile::long_range_mesh();
        let budget = message_budget(&profile, &did);
        assert!(budget < profile.max_payload);
        assert!(budget > 512);
    }

    #[test]
    fn test_small_message_is_not_fragmented() {
        let parts = fragment(SyncMessage::Done, 100).unwrap();
        assert_eq!(parts, vec![SyncMessage::Done]);
    }

    #[test]
    fn test_fragments_reassemble() {
        let big = SyncMessage::Changes {
            changes: vec![change(1, &"x".repeat(500))],
        };
        let parts = fragment(big.clone(), 128).unwrap();
        assert!(parts.len() > 1);

        let mut assembly = Reassembly::new(MAX_MESSAGE_BYTES, 128);
        let mut joined = None;
        // Arrival order does not matter
        for part in parts.into_iter().rev() {
            let SyncMessage::Fragment { index, total, data } = part else {
                panic!("expected fragment");
            };
            assert!(part_fits(index, total, &data, 128));
            joined = assembly.push(index, total, data).unwrap();
        }
        assert_eq!(SyncMessage::decode(&joined.unwrap()).unwrap(), big);
        assert!(!assembly.is_pending());
    }

    fn part_fits(index: u32, total: u32, data: &[u8], budget: usize) -> bool {
        SyncMessage::Fragment {
            index,
            total,
            data: data.to_vec(),
        }
        .encode()
        .unwrap()
        .len()
            <= budget
    }

    #[test]
    fn test_pack_changes_respects_budget() {
        let changes: Vec<Change> = (1..=20).map(|i| change(i, "hello")).collect();
        let messages = pack_changes(changes.clone(), 200).unwrap();
        assert!(messages.len() > 1);

        let mut unpacked = Vec::new();
        for message in messages {
            assert!(message.encode().unwrap().len() <= 200);
            let SyncMessage::Changes { changes } = message else {
                panic!("expected changes");
            };
            unpacked.extend(changes);
        }
        assert_eq!(unpacked, changes);
    }

    #[test]
    fn test_snapshot_parts_cover_bytes() {
        let snapshot: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let parts = snapshot_parts(&snapshot, 256);
        let mut assembly = Reassembly::new(MAX_SNAPSHOT_BYTES, 256);
        let mut out = None;
        for part in parts {
            let SyncMessage::SnapshotPart { index, total, data } = part else {
                panic!("expected snapshot part");
            };
            out = assembly.push(index, total, data).unwrap();
        }
        assert_eq!(out.unwrap(), snapshot);
    }

    #[test]
    fn test_empty_snapshot_is_one_part() {
        assert_eq!(snapshot_parts(&[], 256).len(), 1);
    }

    #[test]
    fn test_bad_part_index() {
        let mut assembly = Reassembly::new(MAX_MESSAGE_BYTES, 256);
        assert!(assembly.push(3, 3, vec![]).is_err());
        assert!(assembly.push(0, 0, vec![]).is_err());
    }

    #[test]
    fn test_oversized_part_count_is_rejected() {
        let mut assembly = Reassembly::new(1024, 128);
        let err = assembly.push(0, u32::MAX, vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
        assert!(!assembly.is_pending());

        // 1024 bytes at 112 per part needs 10 parts
        assert!(assembly.push(0, 10, vec![0; 112]).unwrap().is_none());
        assert!(assembly.push(0, 11, vec![0; 112]).is_err());
    }

    #[test]
    fn test_parts_beyond_byte_limit_are_rejected() {
        let mut assembly = Reassembly::new(256, 128);
        assert!(assembly.push(0, 3, vec![0; 200]).unwrap().is_none());
        assert!(matches!(
            assembly.push(1, 3, vec![0; 200]),
            Err(SyncError::Decode(_))
        ));
        assert!(!assembly.is_pending());
    }
}
