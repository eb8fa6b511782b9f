//! Signed and encrypted sync message envelopes
//!
//! The [`EncryptedEnvelope`] wraps a [`SyncMessage`] for one hop of a session
//! or for the payload of a store-and-forward bundle.
//!
//! ## Security Model
//!
//! Uses **Encrypt-then-Sign**:
//! 1. Serialize the `SyncMessage` with postcard
//! 2. Encrypt with the session, pairwise or community key (ChaCha20-Poly1305)
//! 3. Sign version, sender, nonce, ciphertext and timestamp with Ed25519
//!
//! The sender identifier embeds its signing key, so any node can check the
//! signature without having met the sender.
//!
//! ## Wire Format
//!
//! ```text
//! +---------+------------+--------+-------+---------+------------+---------+-----------+-----------+
//! | version | sender_len | sender | nonce | ct_len  | ciphertext | sig_len | signature | timestamp |
//! | u8      | u16 BE     | utf-8  | 12    | u32 BE  | variable   | u16 BE  | variable  | u64 BE    |
//! +---------+------------+--------+-------+---------+------------+---------+-----------+-----------+
//! ```

use crate::crypto::{PayloadCrypto, NONCE_SIZE};
use crate::error::SyncError;
use crate::identity::{verify_ed25519, Did, IdentityService};
use crate::sync::protocol::SyncMessage;

/// Current envelope protocol version
pub const ENVELOPE_VERSION: u8 = 1;

/// Bytes an envelope adds around its ciphertext, excluding the sender.
pub const ENVELOPE_FIXED_OVERHEAD: usize = 1 + 2 + NONCE_SIZE + 4 + 2 + 64 + 8;

/// A signed and encrypted wrapper for sync messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    /// Protocol version for forward compatibility
    pub version: u8,

    /// Sender's identifier
    pub sender: String,

    /// Nonce used for encryption (12 bytes for ChaCha20-Poly1305)
    pub nonce: [u8; NONCE_SIZE],

    /// `SyncMessage` serialized then encrypted
    pub ciphertext: Vec<u8>,

    /// Ed25519 signature over everything but itself
    pub signature: Vec<u8>,

    /// Sender clock in milliseconds since the epoch
    pub timestamp: u64,
}

impl EncryptedEnvelope {
    /// Encrypt `message` under `key` and sign it as `identity`.
    pub fn seal(
        message: &SyncMessage,
        key: &[u8; 32],
        identity: &dyn IdentityService,
        timestamp: u64,
    ) -> Result<Self, SyncError> {
        let plaintext = message.encode()?;
        let nonce = PayloadCrypto::generate_nonce();
        let ciphertext = PayloadCrypto::new(key).encrypt_with_nonce(&plaintext, &nonce)?;

        let mut envelope = Self {
            version: ENVELOPE_VERSION,
            sender: identity.peer_id().to_string(),
            nonce,
            ciphertext,
            signature: Vec::new(),
            timestamp,
        };
        envelope.signature = identity.sign(&envelope.signed_data());
        Ok(envelope)
    }

    /// Verify the signature, then decrypt and decode the message.
    ///
    /// With `expected_sender` set, an envelope claiming any other sender is
    /// refused before any cryptography runs. Every failure is
    /// [`SyncError::Decode`] except an unknown version.
    pub fn open(
        &self,
        key: &[u8; 32],
        expected_sender: Option<&Did>,
    ) -> Result<SyncMessage, SyncError> {
        if self.version != ENVELOPE_VERSION {
            return Err(SyncError::EnvelopeVersionUnsupported(self.version));
        }
        if let Some(expected) = expected_sender {
            if expected.as_str() != self.sender {
                return Err(SyncError::Decode(format!(
                    "Envelope from {} where {} was expected",
                    self.sender,
                    expected.short()
                )));
            }
        }

        let sender = Did::parse(&self.sender)
            .map_err(|e| SyncError::Decode(format!("Bad sender: {}", e)))?;
        let public_key = sender
            .signing_key()
            .map_err(|e| SyncError::Decode(format!("Bad sender key: {}", e)))?;
        if !verify_ed25519(&self.signature, &self.signed_data(), &public_key) {
            return Err(SyncError::Decode(format!(
                "Signature verification failed for sender: {}",
                sender.short()
            )));
        }

        let plaintext = PayloadCrypto::new(key).decrypt_with_nonce(&self.ciphertext, &self.nonce)?;
        SyncMessage::decode(&plaintext)
    }

    /// Sender as a parsed identifier.
    pub fn sender_did(&self) -> Result<Did, SyncError> {
        Did::parse(&self.sender).map_err(|e| SyncError::Decode(e.to_string()))
    }

    /// Bytes covered by the signature.
    fn signed_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(
            1 + self.sender.len() + NONCE_SIZE + self.ciphertext.len() + 8,
        );
        data.push(self.version);
        data.extend_from_slice(&(self.sender.len() as u16).to_be_bytes());
        data.extend_from_slice(self.sender.as_bytes());
        data.extend_from_slice(&self.nonce);
        data.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        data.extend_from_slice(&self.ciphertext);
        data.extend_from_slice(&self.timestamp.to_be_bytes());
        data
    }

    /// Encoded size on the wire.
    pub fn encoded_len(&self) -> usize {
        ENVELOPE_FIXED_OVERHEAD - 64 + self.sender.len() + self.ciphertext.len() + self.signature.len()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        let sender_len = u16::try_from(self.sender.len())
            .map_err(|_| SyncError::Serialization("Sender identifier too long".into()))?;
        let ct_len = u32::try_from(self.ciphertext.len())
            .map_err(|_| SyncError::Serialization("Ciphertext too long".into()))?;
        let sig_len = u16::try_from(self.signature.len())
            .map_err(|_| SyncError::Serialization("Signature too long".into()))?;

        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.version);
        out.extend_from_slice(&sender_len.to_be_bytes());
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&ct_len.to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&sig_len.to_be_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        let mut reader = Reader { bytes, pos: 0 };

        let version = reader.take(1)?[0];
        if version != ENVELOPE_VERSION {
            return Err(SyncError::EnvelopeVersionUnsupported(version));
        }
        let sender_len = u16::from_be_bytes(reader.array()?) as usize;
        let sender = std::str::from_utf8(reader.take(sender_len)?)
            .map_err(|_| SyncError::Decode("Sender is not UTF-8".into()))?
            .to_string();
        let nonce: [u8; NONCE_SIZE] = reader.array()?;
        let ct_len = u32::from_be_bytes(reader.array()?) as usize;
        let ciphertext = reader.take(ct_len)?.to_vec();
        let sig_len = u16::from_be_bytes(reader.array()?) as usize;
        let signature = reader.take(sig_len)?.to_vec();
        let timestamp = u64::from_be_bytes(reader.array()?);

        if reader.pos != bytes.len() {
            return Err(SyncError::Decode(format!(
                "{} trailing bytes after envelope",
                bytes.len() - reader.pos
            )));
        }

        Ok(Self {
            version,
            sender,
            nonce,
            ciphertext,
            signature,
            timestamp,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SyncError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| SyncError::Decode("Truncated envelope".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], SyncError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}
