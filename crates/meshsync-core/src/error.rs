//! Error types for the mesh synchronization engine

use thiserror::Error;

use crate::transport::TransportError;

/// Main error type for meshsync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Bearer-level failure (unreachable, permission denied, timeout)
    ///
    /// Always recoverable: the next discovery cycle retries, or the payload
    /// falls back to store-and-forward.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// Peer failed the challenge/response handshake or its pinned key changed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Malformed envelope or bundle, failed decryption, or bad signature.
    ///
    /// Only the offending unit is discarded; the session continues.
    #[error("Decode failure: {0}")]
    Decode(String),

    /// Bundle store is full and the incoming bundle ranks below everything stored
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// A local mutation or remote change does not match the schema
    #[error("Invalid change: {0}")]
    InvalidChange(String),

    /// Record was not found in the requested collection
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Peer is not present in the registry
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Envelope protocol version not supported
    #[error("Envelope version {0} is not supported")]
    EnvelopeVersionUnsupported(u8),

    /// Identity-related error (keys, signatures, identifiers)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Invalid or inconsistent configuration
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Whether the failure heals by itself on the next contact cycle.
    ///
    /// Transport failures, decode failures and eviction are transient;
    /// authentication failures need the peer to present its pinned keys again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Decode(_) | SyncError::CapacityExceeded(_)
        )
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::RecordNotFound("listings/42".to_string());
        assert_eq!(format!("{}", err), "Record not found: listings/42");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
    }

    #[test]
    fn test_transport_errors_are_recoverable() {
        let err: SyncError = TransportError::Timeout("ble send".into()).into();
        assert!(err.is_recoverable());
        assert!(!SyncError::Authentication("bad signature".into()).is_recoverable());
    }
}
