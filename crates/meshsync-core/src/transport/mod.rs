//! Bearer-agnostic transport
//!
//! A [`Bearer`] is one physical or logical link technology (short-range
//! radio, local network, long-range mesh). The engine only sees the trait:
//! it discovers candidates, opens [`Connection`]s, and reads the bearer's
//! [`BearerProfile`] to choose between snapshot and incremental sync.
//!
//! Connections are explicit channels. Received frames are pulled with
//! [`Connection::recv`]; there are no callbacks.

mod discovery;
mod memory;
mod quic;

pub use self::discovery::{BackoffPolicy, DiscoveryLoop, KnownPeers};
pub use self::memory::{MemoryBearer, MemoryMedium};
pub use self::quic::{IrohBearer, MESH_ALPN};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::identity::Did;

/// Frames buffered per direction before senders wait.
pub const CONNECTION_BUFFER: usize = 32;

/// Non-fatal link failures. The caller retries on the next cycle or falls
/// back to store-and-forward.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Payload of {size} bytes exceeds bearer limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Connection closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BearerKind {
    /// Short-range radio (BLE class).
    Proximity,
    /// IP on a shared local network.
    LocalNetwork,
    /// Long-range low-bandwidth mesh (LoRa class).
    LongRangeMesh,
}

impl fmt::Display for BearerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BearerKind::Proximity => write!(f, "proximity"),
            BearerKind::LocalNetwork => write!(f, "local-network"),
            BearerKind::LongRangeMesh => write!(f, "long-range-mesh"),
        }
    }
}

/// Latency/throughput class of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkClass {
    Interactive,
    Moderate,
    Constrained,
}

impl LinkClass {
    /// Upper bound for a single send or receive on this class of link.
    pub fn io_timeout(&self) -> Duration {
        match self {
            LinkClass::Interactive => Duration::from_secs(10),
            LinkClass::Moderate => Duration::from_secs(30),
            LinkClass::Constrained => Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BearerProfile {
    pub kind: BearerKind,
    /// Largest single frame the bearer carries.
    pub max_payload: usize,
    pub class: LinkClass,
}

impl BearerProfile {
    pub const fn proximity() -> Self {
        Self {
            kind: BearerKind::Proximity,
            max_payload: 16 * 1024,
            class: LinkClass::Moderate,
        }
    }

    pub const fn local_network() -> Self {
        Self {
            kind: BearerKind::LocalNetwork,
            max_payload: 1024 * 1024,
            class: LinkClass::Interactive,
        }
    }

    pub const fn long_range_mesh() -> Self {
        Self {
            kind: BearerKind::LongRangeMesh,
            max_payload: 1024,
            class: LinkClass::Constrained,
        }
    }

    /// Whether a full snapshot is worth sending over this link.
    pub fn prefers_snapshot(&self) -> bool {
        self.class != LinkClass::Constrained
    }
}

/// Bearer-specific address (endpoint id, MAC, radio node number...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(pub String);

impl PeerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A candidate produced by one discovery cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub address: PeerAddress,
    pub bearer: BearerKind,
    /// Identifier advertised alongside the address, when the bearer has one.
    /// Unauthenticated until the handshake completes.
    pub peer_hint: Option<Did>,
}

/// One link technology.
#[async_trait]
pub trait Bearer: Send + Sync + 'static {
    fn profile(&self) -> BearerProfile;

    fn local_address(&self) -> PeerAddress;

    /// One discovery cycle. The stream is lazy and finite; call again for the
    /// next cycle.
    async fn discover(&self) -> Result<BoxStream<'static, DiscoveredPeer>, TransportError>;

    async fn connect(&self, peer: &PeerAddress) -> Result<Connection, TransportError>;

    /// Next inbound connection, or `None` once the bearer is shut down.
    async fn accept(&self) -> Option<Connection>;

    async fn shutdown(&self);
}

/// A framed, bidirectional link to one peer.
///
/// Both directions are bounded channels, so a slow receiver pushes back on
/// the sender. Either side calling [`Connection::disconnect`] closes the link
/// for both.
#[derive(Debug)]
pub struct Connection {
    sender: FrameSender,
    receiver: FrameReceiver,
}

impl Connection {
    /// Build a connection over existing channels. Bearer drivers pump frames
    /// between these channels and the real link until `cancel` fires.
    pub fn from_parts(
        remote: PeerAddress,
        profile: BearerProfile,
        tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sender: FrameSender {
                remote: remote.clone(),
                profile,
                tx,
                cancel: cancel.clone(),
            },
            receiver: FrameReceiver {
                remote,
                profile,
                rx,
                cancel,
            },
        }
    }

    /// Two directly wired ends sharing one close token.
    ///
    /// The first end talks to `b`, the second to `a`.
    pub fn pair(a: PeerAddress, b: PeerAddress, profile: BearerProfile) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(CONNECTION_BUFFER);
        let (b_tx, a_rx) = mpsc::channel(CONNECTION_BUFFER);
        let cancel = CancellationToken::new();
        (
            Self::from_parts(b, profile, a_tx, a_rx, cancel.clone()),
            Self::from_parts(a, profile, b_tx, b_rx, cancel),
        )
    }

    pub fn remote(&self) -> &PeerAddress {
        &self.sender.remote
    }

    pub fn profile(&self) -> BearerProfile {
        self.sender.profile
    }

    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.sender.send(frame).await
    }

    pub async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        self.receiver.recv().await
    }

    pub async fn recv_within(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.receiver.recv_within(timeout).await
    }

    pub fn disconnect(&self) {
        self.sender.disconnect();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.cancel.is_cancelled()
    }

    /// Token that fires when either side disconnects.
    pub fn close_token(&self) -> CancellationToken {
        self.sender.cancel.clone()
    }

    /// Separate halves so one task can read while another writes.
    pub fn split(self) -> (FrameSender, FrameReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half of a [`Connection`]. Cheap to clone.
#[derive(Clone)]
pub struct FrameSender {
    remote: PeerAddress,
    profile: BearerProfile,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl fmt::Debug for FrameSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSender")
            .field("remote", &self.remote)
            .field("bearer", &self.profile.kind)
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

impl FrameSender {
    pub fn remote(&self) -> &PeerAddress {
        &self.remote
    }

    pub fn profile(&self) -> BearerProfile {
        self.profile
    }

    /// Send one frame, waiting at most the link class timeout for room.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if frame.len() > self.profile.max_payload {
            return Err(TransportError::PayloadTooLarge {
                size: frame.len(),
                max: self.profile.max_payload,
            });
        }
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let timeout = self.profile.class.io_timeout();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
            res = tokio::time::timeout(timeout, self.tx.send(frame)) => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(TransportError::Closed),
                Err(_) => Err(TransportError::Timeout(format!("send to {}", self.remote))),
            },
        }
    }

    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub fn close_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Receiving half of a [`Connection`].
pub struct FrameReceiver {
    remote: PeerAddress,
    profile: BearerProfile,
    rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
}

impl fmt::Debug for FrameReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReceiver")
            .field("remote", &self.remote)
            .field("bearer", &self.profile.kind)
            .finish()
    }
}

impl FrameReceiver {
    /// Receive one frame within the link class timeout.
    pub async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        let timeout = self.profile.class.io_timeout();
        self.recv_within(timeout).await
    }

    pub async fn recv_within(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame.ok_or(TransportError::Closed),
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
            _ = tokio::time::sleep(timeout) => {
                Err(TransportError::Timeout(format!("recv from {}", self.remote)))
            }
        }
    }

    /// Next frame with no deadline; `None` once the link is closed.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = self.cancel.cancelled() => None,
        }
    }
}
