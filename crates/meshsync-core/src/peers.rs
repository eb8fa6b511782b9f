//! Peer registry with trust-on-first-use key pinning
//!
//! The first authenticated contact pins a peer's signing and agreement keys.
//! A later contact presenting different keys for the same identifier is a
//! hard authentication failure; the stored record is left untouched.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Contact Flow                                            │
//! │  1. Handshake proves possession of the signing key       │
//! │  2. check_trust: identifier matches key? pinned keys?    │
//! │  3. record_contact: pin (new) or refresh (known)         │
//! │  4. set_verified: user confirms out of band              │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::identity::Did;
use crate::storage::Storage;
use crate::transport::BearerKind;
use crate::types::{now_millis, PeerRecord, TrustLevel};

/// Result of checking presented keys against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// Never seen; keys will be pinned on contact.
    FirstContact,
    /// Keys match the pinned record.
    Known(PeerRecord),
}

/// Contact details learned during a handshake.
#[derive(Debug, Clone)]
pub struct ContactInfo {
    pub peer_id: Did,
    pub signing_key: [u8; 32],
    pub agreement_key: [u8; 32],
    pub display_name: Option<String>,
    pub transports: Vec<BearerKind>,
}

/// Persistent peer records over the shared [`Storage`].
#[derive(Clone)]
pub struct PeerRegistry {
    storage: Storage,
    /// Serializes check-then-write sequences.
    write_lock: Arc<Mutex<()>>,
}

impl PeerRegistry {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Decide whether the presented keys are acceptable for `peer_id`.
    ///
    /// Fails with [`SyncError::Authentication`] when the identifier does not
    /// embed `signing_key` or when the keys differ from the pinned ones.
    pub fn check_trust(
        &self,
        peer_id: &Did,
        signing_key: &[u8; 32],
        agreement_key: &[u8; 32],
    ) -> SyncResult<TrustDecision> {
        let embedded = peer_id.signing_key()?;
        if &embedded != signing_key {
            return Err(SyncError::Authentication(format!(
                "{} does not match the presented signing key",
                peer_id.short()
            )));
        }

        match self.storage.load_peer(peer_id)? {
            Some(record) if record.keys_match(signing_key, agreement_key) => {
                Ok(TrustDecision::Known(record))
            }
            Some(_) => {
                warn!(peer = %peer_id.short(), "Presented keys differ from pinned keys");
                Err(SyncError::Authentication(format!(
                    "Keys for {} changed since first contact",
                    peer_id.short()
                )))
            }
            None => Ok(TrustDecision::FirstContact),
        }
    }

    /// Pin (first contact) or refresh (known peer) a record after a
    /// successful handshake.
    pub fn record_contact(&self, contact: ContactInfo) -> SyncResult<PeerRecord> {
        let _guard = self.write_lock.lock();
        let now = now_millis();

        let mut record = match self.check_trust(
            &contact.peer_id,
            &contact.signing_key,
            &contact.agreement_key,
        )? {
            TrustDecision::Known(record) => record,
            TrustDecision::FirstContact => {
                info!(peer = %contact.peer_id.short(), "Pinned keys for new peer");
                PeerRecord::first_contact(
                    contact.peer_id.clone(),
                    contact.signing_key,
                    contact.agreement_key,
                    now,
                )
            }
        };

        if contact.display_name.is_some() {
            record.display_name = contact.display_name;
        }
        for kind in contact.transports {
            if !record.supported_transports.contains(&kind) {
                record.supported_transports.push(kind);
            }
        }
        record.last_seen_at = now;
        record.contact_count = record.contact_count.saturating_add(1);

        self.storage.save_peer(&record)?;
        Ok(record)
    }

    pub fn get(&self, peer_id: &Did) -> SyncResult<Option<PeerRecord>> {
        self.storage.load_peer(peer_id)
    }

    pub fn trust_of(&self, peer_id: &Did) -> SyncResult<Option<TrustLevel>> {
        Ok(self.storage.load_peer(peer_id)?.map(|r| r.trust))
    }

    /// All records, most recently seen first.
    pub fn list(&self) -> SyncResult<Vec<PeerRecord>> {
        let mut peers = self.storage.list_peers()?;
        peers.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(peers)
    }

    pub fn verified(&self) -> SyncResult<Vec<PeerRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(PeerRecord::is_verified)
            .collect())
    }

    /// Mark a peer as verified out of band.
    pub fn set_verified(&self, peer_id: &Did) -> SyncResult<PeerRecord> {
        let _guard = self.write_lock.lock();
        let mut record = self
            .storage
            .load_peer(peer_id)?
            .ok_or_else(|| SyncError::PeerNotFound(peer_id.to_string()))?;
        if record.is_verified() {
            return Ok(record);
        }
        record.trust = TrustLevel::Verified;
        // Earlier sessions only carried community fields
        record.trusted_backfill = true;
        self.storage.save_peer(&record)?;
        info!(peer = %peer_id.short(), "Peer verified");
        Ok(record)
    }

    /// Clear the backfill flag once a session has resent history.
    pub fn complete_backfill(&self, peer_id: &Did) -> SyncResult<()> {
        let _guard = self.write_lock.lock();
        if let Some(mut record) = self.storage.load_peer(peer_id)? {
            if record.trusted_backfill {
                record.trusted_backfill = false;
                self.storage.save_peer(&record)?;
                debug!(peer = %peer_id.short(), "Trusted backfill complete");
            }
        }
        Ok(())
    }

    /// Forget a peer, unpinning its keys. Returns whether it was known.
    pub fn remove(&self, peer_id: &Did) -> SyncResult<bool> {
        let _guard = self.write_lock.lock();
        let existed = self.storage.delete_peer(peer_id)?;
        if existed {
            info!(peer = %peer_id.short(), "Peer forgotten");
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityService, LocalIdentity};

    fn contact(identity: &LocalIdentity) -> ContactInfo {
        ContactInfo {
            peer_id: identity.peer_id().clone(),
            signing_key: identity.signing_public_key(),
            agreement_key: identity.agreement_public_key(),
            display_name: Some("Ana".into()),
            transports: vec![BearerKind::Proximity],
        }
    }

    fn registry() -> PeerRegistry {
        PeerRegistry::new(Storage::in_memory().unwrap())
    }

    #[test]
    fn test_first_contact_pins_keys() {
        let registry = registry();
        let peer = LocalIdentity::from_seed(&[1u8; 32]);
        let info = contact(&peer);

        assert_eq!(
            registry
                .check_trust(&info.peer_id, &info.signing_key, &info.agreement_key)
                .unwrap(),
            TrustDecision::FirstContact
        );
        let record = registry.record_contact(info.clone()).unwrap();
        assert_eq!(record.contact_count, 1);
        assert_eq!(record.trust, TrustLevel::FirstUse);
        assert!(matches!(
            registry
                .check_trust(&info.peer_id, &info.signing_key, &info.agreement_key)
                .unwrap(),
            TrustDecision::Known(_)
        ));
    }

    #[test]
    fn test_repeat_contact_refreshes_record() {
        let registry = registry();
        let peer = LocalIdentity::from_seed(&[1u8; 32]);
        registry.record_contact(contact(&peer)).unwrap();

        let mut again = contact(&peer);
        again.display_name = None;
        again.transports = vec![BearerKind::LocalNetwork, BearerKind::Proximity];
        let record = registry.record_contact(again).unwrap();
        assert_eq!(record.contact_count, 2);
        assert_eq!(record.display_name.as_deref(), Some("Ana"));
        assert_eq!(
            record.supported_transports,
            vec![BearerKind::Proximity, BearerKind::LocalNetwork]
        );
    }

    #[test]
    fn test_changed_agreement_key_is_rejected() {
        let registry = registry();
        let peer = LocalIdentity::from_seed(&[1u8; 32]);
        registry.record_contact(contact(&peer)).unwrap();

        let mut forged = contact(&peer);
        forged.agreement_key = [0xAA; 32];
        assert!(matches!(
            registry.record_contact(forged),
            Err(SyncError::Authentication(_))
        ));
        let stored = registry.get(&peer.peer_id().clone()).unwrap().unwrap();
        assert_eq!(stored.agreement_key, peer.agreement_public_key());
    }

    #[test]
    fn test_identifier_must_embed_signing_key() {
        let registry = registry();
        let peer = LocalIdentity::from_seed(&[1u8; 32]);
        let other = LocalIdentity::from_seed(&[2u8; 32]);
        let mut info = contact(&peer);
        info.signing_key = other.signing_public_key();
        assert!(matches!(
            registry.record_contact(info),
            Err(SyncError::Authentication(_))
        ));
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_verify_and_forget() {
        let registry = registry();
        let peer = LocalIdentity::from_seed(&[1u8; 32]);
        let did = peer.peer_id().clone();
        assert!(matches!(
            registry.set_verified(&did),
            Err(SyncError::PeerNotFound(_))
        ));

        registry.record_contact(contact(&peer)).unwrap();
        registry.set_verified(&did).unwrap();
        assert_eq!(registry.trust_of(&did).unwrap(), Some(TrustLevel::Verified));
        assert_eq!(registry.verified().unwrap().len(), 1);

        assert!(registry.remove(&did).unwrap());
        assert!(!registry.remove(&did).unwrap());
        assert_eq!(registry.trust_of(&did).unwrap(), None);
    }

    #[test]
    fn test_verification_requests_backfill_once() {
        let registry = registry();
        let peer = LocalIdentity::from_seed(&[1u8; 32]);
        let did = peer.peer_id().clone();
        let first = registry.record_contact(contact(&peer)).unwrap();
        assert!(!first.trusted_backfill);

        assert!(registry.set_verified(&did).unwrap().trusted_backfill);
        // Contacts in between keep the request
        assert!(registry.record_contact(contact(&peer)).unwrap().trusted_backfill);

        registry.complete_backfill(&did).unwrap();
        assert!(!registry.get(&did).unwrap().unwrap().trusted_backfill);
        // Verifying again is a no-op
        assert!(!registry.set_verified(&did).unwrap().trusted_backfill);
    }
}
