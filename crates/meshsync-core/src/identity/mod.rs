//! Identity service consumed by the sync engine
//!
//! The engine never touches private key material. It asks an
//! [`IdentityService`] for a stable identifier, signatures, signature checks
//! and X25519 key agreement. [`LocalIdentity`] is the bundled implementation;
//! platforms with a secure element can supply their own.
//!
//! ## Example
//!
//! ```rust
//! use meshsync_core::identity::{IdentityService, LocalIdentity};
//!
//! let identity = LocalIdentity::generate().unwrap();
//! let signature = identity.sign(b"challenge");
//! assert!(identity.verify(&signature, b"challenge", &identity.signing_public_key()));
//! println!("peer id: {}", identity.peer_id());
//! ```

mod did;
mod keypair;

pub use did::Did;
pub use keypair::{verify_ed25519, LocalIdentity};

use crate::SyncError;

/// Sign/verify/agree operations plus the stable public identifier.
pub trait IdentityService: Send + Sync + 'static {
    /// Stable identifier derived from the signing public key.
    fn peer_id(&self) -> &Did;

    /// Raw signing public key advertised during the handshake.
    fn signing_public_key(&self) -> [u8; 32];

    /// Raw key-agreement public key advertised during the handshake.
    fn agreement_public_key(&self) -> [u8; 32];

    /// Sign arbitrary bytes.
    fn sign(&self, data: &[u8]) -> Vec<u8>;

    /// Check `signature` over `data` against `public_key`.
    fn verify(&self, signature: &[u8], data: &[u8], public_key: &[u8]) -> bool;

    /// Static key agreement with a peer's agreement public key.
    fn agree(&self, peer_agreement_key: &[u8; 32]) -> Result<[u8; 32], SyncError>;

    /// Identifier a given signing public key maps to, if the key is well formed.
    fn identifier_for(&self, public_key: &[u8]) -> Option<Did>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_identity_workflow() {
        let identity = LocalIdentity::generate().unwrap();
        let did = identity.peer_id().clone();
        assert!(did.as_str().starts_with("did:mesh:z"));

        // The identifier alone is enough to verify.
        let signature = identity.sign(b"bundle origin");
        let key = did.signing_key().unwrap();
        assert!(verify_ed25519(&signature, b"bundle origin", &key));
    }
}
