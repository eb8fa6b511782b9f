//! Payload encryption and key derivation
//!
//! Every outbound payload is sealed with ChaCha20-Poly1305. Keys come from
//! one of three places:
//!
//! - **Session key**: HKDF over the static X25519 agreement of both peers,
//!   salted with both handshake challenges, so every session gets a fresh key.
//! - **Pairwise key**: HKDF over the same agreement with a fixed salt, used
//!   for unicast bundles that are opened long after the session ended.
//! - **Community key**: a shared symmetric key for broadcast bundles.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::SyncError;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag appended by ChaCha20-Poly1305
pub const TAG_SIZE: usize = 16;

/// Domain separation for every HKDF expansion in this crate
const HKDF_INFO: &[u8] = b"meshsync-key-v1";

/// Symmetric AEAD cipher bound to one 32-byte key.
///
/// # Wire Format
///
/// [`encrypt`](Self::encrypt) output: `[nonce (12 bytes)] + [ciphertext + tag (16 bytes)]`.
/// [`encrypt_with_nonce`](Self::encrypt_with_nonce) leaves nonce storage to the caller,
/// which is what [`EncryptedEnvelope`](crate::sync::EncryptedEnvelope) does.
///
/// # Example
///
/// ```
/// use meshsync_core::crypto::PayloadCrypto;
///
/// let key = PayloadCrypto::generate_key();
/// let crypto = PayloadCrypto::new(&key);
///
/// let ciphertext = crypto.encrypt(b"listing delta").unwrap();
/// assert_eq!(crypto.decrypt(&ciphertext).unwrap(), b"listing delta");
/// ```
pub struct PayloadCrypto {
    cipher: ChaCha20Poly1305,
}

impl PayloadCrypto {
    /// Create a cipher for the given 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte key.
    pub fn generate_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Generate a random 12-byte nonce.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt with a fresh random nonce prepended to the output.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SyncError> {
        let nonce_bytes = Self::generate_nonce();
        let ciphertext = self.encrypt_with_nonce(plaintext, &nonce_bytes)?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, SyncError> {
        if data.len() < NONCE_SIZE {
            return Err(SyncError::Crypto(
                "Data too short to contain nonce".to_string(),
            ));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[..NONCE_SIZE]);
        self.decrypt_with_nonce(&data[NONCE_SIZE..], &nonce)
    }

    /// Encrypt using a caller-supplied nonce (nonce is NOT prepended).
    pub fn encrypt_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, SyncError> {
        self.cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|e| SyncError::Crypto(format!("Encryption failed: {}", e)))
    }

    /// Decrypt using a caller-supplied nonce.
    ///
    /// Wrong key, wrong nonce and tampered ciphertext all surface as
    /// [`SyncError::Decode`] so callers discard just this unit.
    pub fn decrypt_with_nonce(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, SyncError> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| SyncError::Decode(format!("Decryption failed: {}", e)))
    }
}

/// Expand a shared secret into a 32-byte key.
fn derive_key(shared_secret: &[u8], salt: &[u8], context: &[u8]) -> [u8; 32] {
    let mut info = Vec::with_capacity(HKDF_INFO.len() + context.len());
    info.extend_from_slice(HKDF_INFO);
    info.extend_from_slice(context);

    let hkdf = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut output = [0u8; 32];
    hkdf.expand(&info, &mut output)
        .expect("HKDF expand should never fail with 32-byte output");
    output
}

/// Order two identifiers so both peers derive identical keys.
fn ordered<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Derive the per-session key from the static agreement and both challenges.
///
/// `initiator_challenge` and `responder_challenge` are ordered by role, not
/// by value, so both ends must pass them the same way round.
pub fn derive_session_key(
    shared_secret: &[u8; 32],
    initiator_challenge: &[u8; 32],
    responder_challenge: &[u8; 32],
    id_a: &str,
    id_b: &str,
) -> [u8; 32] {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(initiator_challenge);
    salt.extend_from_slice(responder_challenge);

    let (first, second) = ordered(id_a, id_b);
    let mut context = b"session:".to_vec();
    context.extend_from_slice(first.as_bytes());
    context.push(0);
    context.extend_from_slice(second.as_bytes());

    derive_key(shared_secret, &salt, &context)
}

/// Derive the long-lived pairwise key used for unicast bundles.
pub fn derive_pairwise_key(shared_secret: &[u8; 32], id_a: &str, id_b: &str) -> [u8; 32] {
    let (first, second) = ordered(id_a, id_b);
    let mut context = b"pairwise:".to_vec();
    context.extend_from_slice(first.as_bytes());
    context.push(0);
    context.extend_from_slice(second.as_bytes());

    derive_key(shared_secret, b"meshsync-pairwise", &context)
}

/// Key for broadcast bundles, shared by everyone who knows the community
/// passphrase.
pub fn derive_community_key(secret: &str) -> [u8; 32] {
    blake3::derive_key("meshsync 2026 community bundle key", secret.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let crypto = PayloadCrypto::new(&PayloadCrypto::generate_key());

        let plaintext = b"Hello, mesh!";
        let ciphertext = crypto.encrypt(plaintext).unwrap();
        assert!(ciphertext.len() >= plaintext.len() + NONCE_SIZE + TAG_SIZE);
        assert_eq!(crypto.decrypt(&ciphertext).unwrap(), plaintext.as_slice());
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let crypto = PayloadCrypto::new(&PayloadCrypto::generate_key());
        let c1 = crypto.encrypt(b"same").unwrap();
        let c2 = crypto.encrypt(b"same").unwrap();
        assert_ne!(c1, c2);
    }

    #[test]
    fn test_wrong_key_is_decode_failure() {
        let c1 = PayloadCrypto::new(&PayloadCrypto::generate_key());
        let c2 = PayloadCrypto::new(&PayloadCrypto::generate_key());

        let ciphertext = c1.encrypt(b"secret").unwrap();
        assert!(matches!(c2.decrypt(&ciphertext), Err(SyncError::Decode(_))));
    }

    #[test]
    fn test_tampered_data_fails() {
        let crypto = PayloadCrypto::new(&PayloadCrypto::generate_key());
        let mut ciphertext = crypto.encrypt(b"Original message").unwrap();
        ciphertext[NONCE_SIZE] ^= 0xFF;
        assert!(crypto.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_truncated_data_fails() {
        let crypto = PayloadCrypto::new(&PayloadCrypto::generate_key());
        let result = crypto.decrypt(&[1, 2, 3]);
        match result {
            Err(SyncError::Crypto(msg)) => assert!(msg.contains("too short")),
            other => panic!("Expected Crypto error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_explicit_nonce_has_no_prefix() {
        let crypto = PayloadCrypto::new(&PayloadCrypto::generate_key());
        let nonce = PayloadCrypto::generate_nonce();
        let ciphertext = crypto.encrypt_with_nonce(b"Test", &nonce).unwrap();
        assert_eq!(ciphertext.len(), 4 + TAG_SIZE);
        assert_eq!(crypto.decrypt_with_nonce(&ciphertext, &nonce).unwrap(), b"Test");
    }

    #[test]
    fn test_session_key_symmetric_in_ids() {
        let secret = [7u8; 32];
        let ca = [1u8; 32];
        let cb = [2u8; 32];
        let k1 = derive_session_key(&secret, &ca, &cb, "did:mesh:zA", "did:mesh:zB");
        let k2 = derive_session_key(&secret, &ca, &cb, "did:mesh:zB", "did:mesh:zA");
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_session_key_depends_on_challenges() {
        let secret = [7u8; 32];
        let k1 = derive_session_key(&secret, &[1; 32], &[2; 32], "a", "b");
        let k2 = derive_session_key(&secret, &[1; 32], &[3; 32], "a", "b");
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_pairwise_key_differs_from_session_key() {
        let secret = [9u8; 32];
        let pairwise = derive_pairwise_key(&secret, "a", "b");
        let session = derive_session_key(&secret, &[0; 32], &[0; 32], "a", "b");
        assert_ne!(pairwise, session);
        assert_eq!(pairwise, derive_pairwise_key(&secret, "b", "a"));
    }

    #[test]
    fn test_community_key_depends_on_secret() {
        assert_eq!(
            derive_community_key("valley-commons"),
            derive_community_key("valley-commons")
        );
        assert_ne!(
            derive_community_key("valley-commons"),
            derive_community_key("hill-commons")
        );
    }
}
