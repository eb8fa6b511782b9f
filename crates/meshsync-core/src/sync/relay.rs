//! Bundle payload sealing
//!
//! A bundle payload is an [`EncryptedEnvelope`] holding a
//! [`SyncMessage::Changes`], signed by the bundle's source. Relays carry it
//! without being able to read it unless they are an intended recipient:
//!
//! - broadcast bundles are sealed under the community key and carry only
//!   public fields
//! - unicast bundles are sealed under the pairwise key of source and
//!   destination and may carry trusted fields

use std::sync::Arc;

use crate::crypto::derive_pairwise_key;
use crate::document::Change;
use crate::dtn::Bundle;
use crate::error::{SyncError, SyncResult};
use crate::identity::{Did, IdentityService};
use crate::peers::PeerRegistry;
use crate::types::{now_millis, PeerRecord};

use super::envelope::EncryptedEnvelope;
use super::protocol::SyncMessage;

/// Seals outgoing and opens incoming bundle payloads.
#[derive(Clone)]
pub struct PayloadSealer {
    identity: Arc<dyn IdentityService>,
    registry: PeerRegistry,
    community_key: [u8; 32],
}

impl PayloadSealer {
    pub fn new(
        identity: Arc<dyn IdentityService>,
        registry: PeerRegistry,
        community_key: [u8; 32],
    ) -> Self {
        Self {
            identity,
            registry,
            community_key,
        }
    }

    pub fn local(&self) -> &Did {
        self.identity.peer_id()
    }

    /// Payload readable by every community member.
    pub fn seal_broadcast(&self, changes: Vec<Change>) -> SyncResult<Vec<u8>> {
        self.seal(changes, &self.community_key)
    }

    /// Payload readable only by `peer`.
    pub fn seal_for(&self, peer: &PeerRecord, changes: Vec<Change>) -> SyncResult<Vec<u8>> {
        let key = self.pairwise_key(&peer.peer_id, &peer.agreement_key)?;
        self.seal(changes, &key)
    }

    fn seal(&self, changes: Vec<Change>, key: &[u8; 32]) -> SyncResult<Vec<u8>> {
        let message = SyncMessage::Changes { changes };
        EncryptedEnvelope::seal(&message, key, self.identity.as_ref(), now_millis())?.to_bytes()
    }

    /// Decrypt and verify a bundle that was delivered to us.
    ///
    /// The envelope must be signed by the bundle's source. Unicast bundles
    /// need the source's pinned agreement key; without it the payload is
    /// unreadable and the unit is discarded.
    pub fn open(&self, bundle: &Bundle) -> SyncResult<Vec<Change>> {
        let key = match &bundle.destination {
            None => self.community_key,
            Some(dest) if dest == self.identity.peer_id() => {
                let origin = self.registry.get(&bundle.source)?.ok_or_else(|| {
                    SyncError::Decode(format!(
                        "No pinned keys for bundle origin {}",
                        bundle.source.short()
                    ))
                })?;
                self.pairwise_key(&origin.peer_id, &origin.agreement_key)?
            }
            Some(dest) => {
                return Err(SyncError::InvalidOperation(format!(
                    "Bundle {} is addressed to {}",
                    bundle.id,
                    dest.short()
                )))
            }
        };

        let envelope = EncryptedEnvelope::from_bytes(&bundle.payload)?;
        match envelope.open(&key, Some(&bundle.source))? {
            SyncMessage::Changes { changes } => Ok(changes),
            other => Err(SyncError::Decode(format!(
                "Bundle {} carries a {} message",
                bundle.id,
                other.kind()
            ))),
        }
    }

    fn pairwise_key(&self, peer: &Did, agreement_key: &[u8; 32]) -> SyncResult<[u8; 32]> {
        let shared = self.identity.agree(agreement_key)?;
        Ok(derive_pairwise_key(
            &shared,
            self.identity.peer_id().as_str(),
            peer.as_str(),
        ))
    }
}
