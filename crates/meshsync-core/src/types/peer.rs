//! Peer records
//!
//! A `PeerRecord` is created the first time a peer completes the handshake
//! and pins both of its public keys (trust on first use). Later contacts only
//! refresh the display name, transports and contact metrics; the pinned keys
//! never change unless the user forgets the peer.

use serde::{Deserialize, Serialize};

use crate::identity::Did;
use crate::transport::BearerKind;

/// How far the local user trusts a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum TrustLevel {
    /// Keys pinned on first contact; sees public fields only
    #[default]
    FirstUse,
    /// Explicitly verified by the user; also sees trusted fields
    Verified,
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustLevel::FirstUse => write!(f, "first-use"),
            TrustLevel::Verified => write!(f, "verified"),
        }
    }
}

/// Everything remembered about a peer between contacts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: Did,
    pub display_name: Option<String>,
    /// Unix millis of the last authenticated contact
    pub last_seen_at: u64,
    /// Ed25519 key pinned on first contact
    pub trusted_public_key: [u8; 32],
    /// X25519 key pinned on first contact
    pub agreement_key: [u8; 32],
    pub supported_transports: Vec<BearerKind>,
    pub trust: TrustLevel,
    pub first_seen: u64,
    pub contact_count: u32,
    /// Verified since the last session; history goes out again at the
    /// trusted audience
    pub trusted_backfill: bool,
}

impl PeerRecord {
    /// Record for a peer seen for the first time.
    pub fn first_contact(
        peer_id: Did,
        signing_key: [u8; 32],
        agreement_key: [u8; 32],
        now: u64,
    ) -> Self {
        Self {
            peer_id,
            display_name: None,
            last_seen_at: now,
            trusted_public_key: signing_key,
            agreement_key,
            supported_transports: Vec::new(),
            trust: TrustLevel::FirstUse,
            first_seen: now,
            contact_count: 0,
            trusted_backfill: false,
        }
    }

    pub fn is_verified(&self) -> bool {
        self.trust == TrustLevel::Verified
    }

    /// Whether the presented keys match the pinned ones.
    pub fn keys_match(&self, signing_key: &[u8; 32], agreement_key: &[u8; 32]) -> bool {
        &self.trusted_public_key == signing_key && &self.agreement_key == agreement_key
    }

    /// Label for display: the display name or the short identifier.
    pub fn label(&self) -> String {
        match &self.display_name {
            Some(name) => name.clone(),
            None => self.peer_id.short().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_contact_defaults() {
        let did = Did::from_signing_key(&[1u8; 32]);
        let peer = PeerRecord::first_contact(did.clone(), [1u8; 32], [2u8; 32], 1000);
        assert_eq!(peer.trust, TrustLevel::FirstUse);
        assert_eq!(peer.first_seen, 1000);
        assert!(!peer.is_verified());
        assert_eq!(peer.label(), did.short());
    }

    #[test]
    fn test_keys_match() {
        let did = Did::from_signing_key(&[1u8; 32]);
        let peer = PeerRecord::first_contact(did, [1u8; 32], [2u8; 32], 0);
        assert!(peer.keys_match(&[1u8; 32], &[2u8; 32]));
        assert!(!peer.keys_match(&[1u8; 32], &[3u8; 32]));
        assert!(!peer.keys_match(&[9u8; 32], &[2u8; 32]));
    }

    #[test]
    fn test_postcard_roundtrip() {
        let did = Did::from_signing_key(&[4u8; 32]);
        let mut peer = PeerRecord::first_contact(did, [4u8; 32], [5u8; 32], 42);
        peer.display_name = Some("Ana".into());
        peer.supported_transports = vec![BearerKind::Proximity, BearerKind::LongRangeMesh];
        let bytes = postcard::to_allocvec(&peer).unwrap();
        let decoded: PeerRecord = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(peer, decoded);
    }
}
