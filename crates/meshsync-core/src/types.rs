//! Core identifier types shared across the engine

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::Did;

pub mod peer;

pub use peer::{PeerRecord, TrustLevel};

/// Identifier of a document replica (one per device).
///
/// In a running engine this is the device's [`Did`]; the document layer
/// only treats it as an ordered opaque string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Did> for ReplicaId {
    fn from(did: &Did) -> Self {
        Self(did.as_str().to_string())
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Causal position of one operation: (logical counter, replica, index in change).
///
/// The derived ordering compares fields in declaration order, which is the
/// total order used for last-writer-wins, existence sets and append logs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub counter: u64,
    pub replica: ReplicaId,
    pub index: u32,
}

impl OpId {
    pub fn new(counter: u64, replica: ReplicaId, index: u32) -> Self {
        Self {
            counter,
            replica,
            index,
        }
    }
}

/// Identifier of a change: originating replica plus its contiguous sequence number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeId {
    pub replica: ReplicaId,
    pub seq: u64,
}

impl std::fmt::Display for ChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.replica, self.seq)
    }
}

/// Stable record identifier minted from the creating operation.
///
/// Format: `{counter}.{index}@{replica}`. Two replicas can never mint the same
/// id because the replica id is part of it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn mint(op: &OpId) -> Self {
        Self(format!("{}.{}@{}", op.counter, op.index, op.replica))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
