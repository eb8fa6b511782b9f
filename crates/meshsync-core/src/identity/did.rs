//! Peer identifiers
//!
//! Format: `did:mesh:z{base58 ed25519 public key}`
//!
//! The identifier embeds the signing key itself rather than a hash of it, so
//! a node that has never met the origin of a multi-hop bundle can still
//! verify the origin's envelope signature from the identifier alone.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::SyncError;

const DID_PREFIX: &str = "did:mesh:z";

/// Stable public identifier of a peer (also used as the CRDT replica id).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Did(String);

impl Did {
    /// Derive the identifier for an Ed25519 verifying key.
    pub fn from_signing_key(public_key: &[u8; 32]) -> Self {
        Did(format!("{}{}", DID_PREFIX, bs58::encode(public_key).into_string()))
    }

    /// Get the DID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the identifier part (after "did:mesh:z")
    pub fn identifier(&self) -> &str {
        &self.0[DID_PREFIX.len()..]
    }

    /// Short form for log lines (first 8 identifier characters).
    pub fn short(&self) -> &str {
        let id = self.identifier();
        &id[..id.len().min(8)]
    }

    /// Recover the Ed25519 verifying key embedded in the identifier.
    pub fn signing_key(&self) -> Result<[u8; 32], SyncError> {
        let bytes = bs58::decode(self.identifier())
            .into_vec()
            .map_err(|_| SyncError::Identity("Invalid base58 in identifier".to_string()))?;
        bytes
            .try_into()
            .map_err(|_| SyncError::Identity("Identifier key must be 32 bytes".to_string()))
    }

    /// Parse and validate a DID string.
    pub fn parse(did_str: &str) -> Result<Self, SyncError> {
        let identifier = did_str.strip_prefix(DID_PREFIX).ok_or_else(|| {
            SyncError::Identity(format!("Identifier must start with '{}'", DID_PREFIX))
        })?;
        if identifier.is_empty() {
            return Err(SyncError::Identity(
                "Identifier cannot be empty".to_string(),
            ));
        }
        let did = Did(did_str.to_string());
        did.signing_key()?;
        Ok(did)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Did {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_did_roundtrips_signing_key() {
        let key = [42u8; 32];
        let did = Did::from_signing_key(&key);
        assert!(did.as_str().starts_with("did:mesh:z"));
        assert_eq!(did.signing_key().unwrap(), key);
    }

    #[test]
    fn test_did_parse_valid() {
        let did = Did::from_signing_key(&[7u8; 32]);
        let parsed: Did = did.as_str().parse().unwrap();
        assert_eq!(did, parsed);
    }

    #[test]
    fn test_did_parse_invalid() {
        assert!(Did::parse("").is_err());
        assert!(Did::parse("did:sync:zabc").is_err());
        assert!(Did::parse("did:mesh:z").is_err());
        // 0, O, I, l are not valid base58
        assert!(Did::parse("did:mesh:z0OIl").is_err());
        // valid base58 but not 32 bytes
        assert!(Did::parse("did:mesh:z2g").is_err());
    }

    #[test]
    fn test_short_form() {
        let did = Did::from_signing_key(&[1u8; 32]);
        assert_eq!(did.short().len(), 8);
        assert!(did.identifier().starts_with(did.short()));
    }
}
