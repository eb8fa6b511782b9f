//! Session lifecycle and sync notifications
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SessionState: per-connection progress                          │
//! │  Discovered → Challenged → Authenticated → Syncing → Idle       │
//! │                                     (any) → Disconnected        │
//! │                                                                 │
//! │  SyncEvent: broadcast to the application                        │
//! │  ├── PeerDiscovered / PeerAuthenticated / UntrustedPeer         │
//! │  ├── SessionStateChanged / SessionTimedOut                      │
//! │  ├── SyncCompleted                                              │
//! │  └── BundleDelivered / DecodeFailure                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use crate::dtn::BundleId;
use crate::identity::Did;
use crate::transport::{BearerKind, PeerAddress};

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Link is up, nothing exchanged yet
    Discovered,
    /// Our challenge is out
    Challenged,
    /// Both sides proved their identity
    Authenticated,
    /// Exchanging changes, snapshots and bundles
    Syncing,
    /// Both sides acknowledged; live changes only
    Idle,
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Discovered => "discovered",
            SessionState::Challenged => "challenged",
            SessionState::Authenticated => "authenticated",
            SessionState::Syncing => "syncing",
            SessionState::Idle => "idle",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Notifications about sync activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A bearer reported a reachable candidate
    PeerDiscovered {
        address: PeerAddress,
        bearer: BearerKind,
    },

    /// A handshake completed
    PeerAuthenticated {
        peer: Did,
        bearer: BearerKind,
        first_contact: bool,
    },

    /// A handshake failed; nothing was exchanged
    UntrustedPeer {
        address: PeerAddress,
        reason: String,
    },

    SessionStateChanged {
        address: PeerAddress,
        peer: Option<Did>,
        state: SessionState,
    },

    /// Both sides acknowledged the exchange
    SyncCompleted {
        peer: Did,
        sent_changes: usize,
        received_changes: usize,
        snapshot: bool,
    },

    /// The handshake or an exchange step ran out of time
    SessionTimedOut {
        address: PeerAddress,
        peer: Option<Did>,
    },

    /// A bundle addressed to us (or broadcast) was opened and merged
    BundleDelivered { id: BundleId, origin: Did },

    /// A received unit was discarded
    DecodeFailure { peer: Option<Did>, reason: String },
}

impl SyncEvent {
    pub fn peer(&self) -> Option<&Did> {
        match self {
            SyncEvent::PeerAuthenticated { peer, .. } | SyncEvent::SyncCompleted { peer, .. } => {
                Some(peer)
            }
            SyncEvent::SessionStateChanged { peer, .. }
            | SyncEvent::SessionTimedOut { peer, .. }
            | SyncEvent::DecodeFailure { peer, .. } => peer.as_ref(),
            SyncEvent::BundleDelivered { origin, .. } => Some(origin),
            SyncEvent::PeerDiscovered { .. } | SyncEvent::UntrustedPeer { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Challenged.to_string(), "challenged");
        assert_eq!(SessionState::Disconnected.to_string(), "disconnected");
    }

    #[test]
    fn test_event_peer() {
        let did = Did::from_signing_key(&[1u8; 32]);
        let event = SyncEvent::SyncCompleted {
            peer: did.clone(),
            sent_changes: 1,
            received_changes: 0,
            snapshot: false,
        };
        assert_eq!(event.peer(), Some(&did));
        let event = SyncEvent::UntrustedPeer {
            address: "a".into(),
            reason: "bad".into(),
        };
        assert_eq!(event.peer(), None);
    }
}
