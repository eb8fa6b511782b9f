//! Store-and-forward bundles
//!
//! A bundle wraps one sealed envelope for delivery when no direct path to the
//! destination exists. Relays read the routing header (destination, priority,
//! expiry, hop budget, path history) but never the payload.
//!
//! ## Wire Format
//!
//! `[version: u8 = 1] + postcard(Bundle)`

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SyncError;
use crate::identity::Did;

/// Current bundle wire version
pub const BUNDLE_VERSION: u8 = 1;

/// Fixed per-bundle bookkeeping counted against the byte capacity
const HEADER_OVERHEAD: usize = 64;

/// Forwarding and eviction priority, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(SyncError::Config(format!("Unknown priority '{}'", other))),
        }
    }
}

/// Origin plus the origin's monotonic bundle counter
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BundleId {
    pub origin: Did,
    pub seq: u64,
}

impl std::fmt::Display for BundleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.origin.short(), self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub id: BundleId,
    pub source: Did,
    /// `None` means broadcast to every community member
    pub destination: Option<Did>,
    /// Sealed envelope bytes, opaque to relays
    pub payload: Vec<u8>,
    pub priority: Priority,
    /// Unix millis
    pub created_at: u64,
    /// Unix millis
    pub expires_at: u64,
    pub hop_count: u16,
    pub max_hops: u16,
    /// Every peer known to hold a copy, source first
    pub visited: Vec<Did>,
}

impl Bundle {
    pub fn new(
        id: BundleId,
        destination: Option<Did>,
        payload: Vec<u8>,
        priority: Priority,
        ttl: Duration,
        max_hops: u16,
        now: u64,
    ) -> Self {
        let source = id.origin.clone();
        Self {
            visited: vec![source.clone()],
            id,
            source,
            destination,
            payload,
            priority,
            created_at: now,
            expires_at: now.saturating_add(ttl.as_millis() as u64),
            hop_count: 0,
            max_hops,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination.is_none()
    }

    pub fn is_addressed_to(&self, peer: &Did) -> bool {
        self.destination.as_ref().map_or(true, |d| d == peer)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn hops_exhausted(&self) -> bool {
        self.hop_count >= self.max_hops
    }

    pub fn has_visited(&self, peer: &Did) -> bool {
        self.visited.contains(peer)
    }

    /// Whether this copy may be handed to `peer`.
    pub fn can_forward_to(&self, peer: &Did, now: u64) -> bool {
        !self.hops_exhausted() && !self.is_expired(now) && !self.has_visited(peer)
    }

    /// The copy handed to `peer`: one more hop, `peer` appended to the path.
    pub fn forwarded_to(&self, peer: &Did) -> Bundle {
        let mut copy = self.clone();
        copy.hop_count = copy.hop_count.saturating_add(1);
        copy.record_visit(peer);
        copy
    }

    pub fn record_visit(&mut self, peer: &Did) {
        if !self.has_visited(peer) {
            self.visited.push(peer.clone());
        }
    }

    /// Union another copy's path history into this one.
    pub fn merge_visited(&mut self, other: &Bundle) {
        for peer in &other.visited {
            self.record_visit(peer);
        }
    }

    /// Bytes counted against the store's capacity.
    pub fn footprint(&self) -> usize {
        HEADER_OVERHEAD
            + self.payload.len()
            + self
                .visited
                .iter()
                .map(|d| d.as_str().len())
                .sum::<usize>()
    }

    /// Eviction rank: lower evicts first.
    pub fn rank(&self) -> (Priority, u64) {
        (self.priority, self.created_at)
    }

    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        let mut bytes = vec![BUNDLE_VERSION];
        let body =
            postcard::to_allocvec(self).map_err(|e| SyncError::Serialization(e.to_string()))?;
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let (&version, body) = bytes
            .split_first()
            .ok_or_else(|| SyncError::Decode("Empty bundle".to_string()))?;
        if version != BUNDLE_VERSION {
            return Err(SyncError::Decode(format!(
                "Unsupported bundle version {}",
                version
            )));
        }
        let bundle: Bundle = postcard::from_bytes(body)
            .map_err(|e| SyncError::Decode(format!("Malformed bundle: {}", e)))?;
        if bundle.source != bundle.id.origin {
            return Err(SyncError::Decode(format!(
                "Bundle {} source does not match its id",
                bundle.id
            )));
        }
        Ok(bundle)
    }
}
