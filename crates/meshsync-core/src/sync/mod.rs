//! Peer-to-peer synchronization protocol
//!
//! ## Overview
//!
//! Whenever two nodes meet on any bearer they run one session: a mutual
//! challenge/response handshake, then an exchange of document state and
//! carried bundles, sealed under a per-session key.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  run_session (one task per connection)                          │
//! │  ├── Handshake: Hello / Hello+counter / Proof                   │
//! │  ├── Writer: Summary → Changes | Snapshot → Bundles → Done      │
//! │  ├── Reader: merge, accept bundles, Ack / BundleAck             │
//! │  └── Live mode: push local changes until idle                   │
//! │                                                                 │
//! │  EncryptedEnvelope: encrypt-then-sign wrapper for every message │
//! │  PayloadSealer: bundle payloads (community or pairwise key)     │
//! │  SyncEvent: notifications for the application                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod envelope;
mod events;
mod handshake;
mod protocol;
mod relay;
mod session;

pub use envelope::{EncryptedEnvelope, ENVELOPE_VERSION};
pub use events::{SessionState, SyncEvent};
pub use handshake::{Handshake, HandshakeOutcome};
pub use protocol::{
    fragment, message_budget, pack_bundles, pack_changes, snapshot_parts, Frame, Hello, Proof,
    Reassembly, SyncMessage, PROTOCOL_VERSION,
};
pub use relay::PayloadSealer;
pub use session::{run_session, LivePeers, Role, SessionConfig, SessionContext, SessionReport};
