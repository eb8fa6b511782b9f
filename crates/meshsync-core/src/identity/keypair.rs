//! Local identity: Ed25519 signing plus X25519 key agreement
//!
//! This is the default [`IdentityService`] implementation. Key material is
//! generated and held here; the sync engine only ever calls `sign`, `verify`
//! and `agree`.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use super::{Did, IdentityService};
use crate::SyncError;

/// Serialized length: ed25519 seed (32) + x25519 secret (32)
const KEYPAIR_BYTES: usize = 64;

/// Node identity backed by an Ed25519 signing key and an X25519 static secret.
pub struct LocalIdentity {
    ed25519: SigningKey,
    x25519: X25519StaticSecret,
    did: Did,
}

impl LocalIdentity {
    /// Generate a fresh random identity.
    pub fn generate() -> Result<Self, SyncError> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| SyncError::Identity(format!("Failed to get random bytes: {}", e)))?;
        let mut x_seed = [0u8; 32];
        getrandom::getrandom(&mut x_seed)
            .map_err(|e| SyncError::Identity(format!("Failed to get random bytes: {}", e)))?;
        Ok(Self::from_parts(seed, x_seed))
    }

    /// Deterministic identity from a single seed.
    ///
    /// The agreement secret is derived from the seed with BLAKE3 so one
    /// 32-byte value reproduces the whole identity (handy for test fixtures).
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let x_seed = blake3::derive_key("meshsync-x25519-seed-v1", seed);
        Self::from_parts(*seed, x_seed)
    }

    fn from_parts(ed_seed: [u8; 32], x_seed: [u8; 32]) -> Self {
        let ed25519 = SigningKey::from_bytes(&ed_seed);
        let x25519 = X25519StaticSecret::from(x_seed);
        let did = Did::from_signing_key(ed25519.verifying_key().as_bytes());
        Self {
            ed25519,
            x25519,
            did,
        }
    }

    /// Serialize the private keys.
    ///
    /// Format: `[ed25519_seed: 32][x25519_secret: 32]`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(KEYPAIR_BYTES);
        bytes.extend_from_slice(self.ed25519.as_bytes());
        bytes.extend_from_slice(self.x25519.as_bytes());
        bytes
    }

    /// Deserialize an identity written by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        if bytes.len() != KEYPAIR_BYTES {
            return Err(SyncError::Identity(format!(
                "Identity data must be {} bytes, got {}",
                KEYPAIR_BYTES,
                bytes.len()
            )));
        }
        let mut ed_seed = [0u8; 32];
        ed_seed.copy_from_slice(&bytes[..32]);
        let mut x_seed = [0u8; 32];
        x_seed.copy_from_slice(&bytes[32..]);
        Ok(Self::from_parts(ed_seed, x_seed))
    }
}

/// Verify an Ed25519 signature against a raw 32-byte verifying key.
pub fn verify_ed25519(signature: &[u8], data: &[u8], public_key: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(data, &signature).is_ok()
}

impl IdentityService for LocalIdentity {
    fn peer_id(&self) -> &Did {
        &self.did
    }

    fn signing_public_key(&self) -> [u8; 32] {
        self.ed25519.verifying_key().to_bytes()
    }

    fn agreement_public_key(&self) -> [u8; 32] {
        *X25519PublicKey::from(&self.x25519).as_bytes()
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.ed25519.sign(data).to_bytes().to_vec()
    }

    fn verify(&self, signature: &[u8], data: &[u8], public_key: &[u8]) -> bool {
        verify_ed25519(signature, data, public_key)
    }

    fn agree(&self, peer_agreement_key: &[u8; 32]) -> Result<[u8; 32], SyncError> {
        let shared = self
            .x25519
            .diffie_hellman(&X25519PublicKey::from(*peer_agreement_key));
        if !shared.was_contributory() {
            return Err(SyncError::Identity(
                "Peer agreement key is a low-order point".to_string(),
            ));
        }
        Ok(*shared.as_bytes())
    }

    fn identifier_for(&self, public_key: &[u8]) -> Option<Did> {
        let key: [u8; 32] = public_key.try_into().ok()?;
        Some(Did::from_signing_key(&key))
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("did", &self.did.as_str())
            .finish_non_exhaustive()
    }
}
