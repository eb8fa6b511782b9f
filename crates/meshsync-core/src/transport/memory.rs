//! In-process bearer
//!
//! A [`MemoryMedium`] is a shared radio environment: nodes register on it,
//! links between pairs of nodes are switched on and off, and a node can have
//! its permission revoked. Tests and simulations use it to stand in for
//! proximity or long-range links by choosing the medium's profile.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Bearer, BearerProfile, Connection, DiscoveredPeer, PeerAddress, TransportError};
use crate::identity::Did;

const ACCEPT_BACKLOG: usize = 16;

struct NodeSlot {
    accept_tx: mpsc::Sender<Connection>,
    peer_hint: Option<Did>,
    denied: bool,
    online: bool,
}

struct OpenLink {
    ends: (PeerAddress, PeerAddress),
    token: CancellationToken,
}

#[derive(Default)]
struct MediumState {
    nodes: HashMap<PeerAddress, NodeSlot>,
    links: HashSet<(PeerAddress, PeerAddress)>,
    open: Vec<OpenLink>,
}

fn link_key(a: &PeerAddress, b: &PeerAddress) -> (PeerAddress, PeerAddress) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Shared environment connecting [`MemoryBearer`]s.
#[derive(Clone)]
pub struct MemoryMedium {
    profile: BearerProfile,
    state: Arc<Mutex<MediumState>>,
}

impl std::fmt::Debug for MemoryMedium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryMedium")
            .field("kind", &self.profile.kind)
            .field("nodes", &state.nodes.len())
            .field("links", &state.links.len())
            .finish()
    }
}

impl MemoryMedium {
    pub fn new(profile: BearerProfile) -> Self {
        Self {
            profile,
            state: Arc::new(Mutex::new(MediumState::default())),
        }
    }

    pub fn profile(&self) -> BearerProfile {
        self.profile
    }

    /// Register a node and return its bearer. Re-registering an address
    /// replaces the previous node.
    pub fn bearer(&self, address: impl Into<PeerAddress>, peer_hint: Option<Did>) -> MemoryBearer {
        let address = address.into();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        self.state.lock().nodes.insert(
            address.clone(),
            NodeSlot {
                accept_tx,
                peer_hint,
                denied: false,
                online: true,
            },
        );
        MemoryBearer {
            address,
            medium: self.clone(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            shutdown: CancellationToken::new(),
        }
    }

    /// Bring two nodes into range of each other.
    pub fn link(&self, a: impl Into<PeerAddress>, b: impl Into<PeerAddress>) {
        let (a, b) = (a.into(), b.into());
        self.state.lock().links.insert(link_key(&a, &b));
    }

    /// Take two nodes out of range. Open connections between them drop.
    pub fn unlink(&self, a: impl Into<PeerAddress>, b: impl Into<PeerAddress>) {
        let key = link_key(&a.into(), &b.into());
        let mut state = self.state.lock();
        state.links.remove(&key);
        state.open.retain(|link| {
            if link.ends == key {
                link.token.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Link every registered node with every other.
    pub fn link_all(&self) {
        let mut state = self.state.lock();
        let nodes: Vec<PeerAddress> = state.nodes.keys().cloned().collect();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                state.links.insert(link_key(a, b));
            }
        }
    }

    pub fn is_linked(&self, a: &PeerAddress, b: &PeerAddress) -> bool {
        self.state.lock().links.contains(&link_key(a, b))
    }

    /// Simulate the OS revoking (or granting back) radio permission.
    pub fn set_permission_denied(&self, address: &PeerAddress, denied: bool) {
        if let Some(slot) = self.state.lock().nodes.get_mut(address) {
            slot.denied = denied;
        }
    }

    fn neighbours(&self, address: &PeerAddress) -> Result<Vec<DiscoveredPeer>, TransportError> {
        let state = self.state.lock();
        let me = state
            .nodes
            .get(address)
            .ok_or(TransportError::Closed)?;
        if me.denied {
            return Err(TransportError::PermissionDenied(format!(
                "{} may not scan",
                address
            )));
        }
        if !me.online {
            return Err(TransportError::Closed);
        }

        let mut found: Vec<DiscoveredPeer> = state
            .nodes
            .iter()
            .filter(|(addr, slot)| {
                *addr != address && slot.online && state.links.contains(&link_key(address, addr))
            })
            .map(|(addr, slot)| DiscoveredPeer {
                address: addr.clone(),
                bearer: self.profile.kind,
                peer_hint: slot.peer_hint.clone(),
            })
            .collect();
        found.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(found)
    }

    fn dial(
        &self,
        from: &PeerAddress,
        to: &PeerAddress,
    ) -> Result<(Connection, Connection, mpsc::Sender<Connection>), TransportError> {
        let mut state = self.state.lock();
        match state.nodes.get(from) {
            Some(slot) if slot.denied => {
                return Err(TransportError::PermissionDenied(format!(
                    "{} may not connect",
                    from
                )))
            }
            Some(slot) if slot.online => {}
            _ => return Err(TransportError::Closed),
        }

        let accept_tx = match state.nodes.get(to) {
            Some(slot) if slot.online && !slot.denied => slot.accept_tx.clone(),
            _ => return Err(TransportError::Unreachable(to.to_string())),
        };
        let key = link_key(from, to);
        if !state.links.contains(&key) {
            return Err(TransportError::Unreachable(format!("{} out of range", to)));
        }

        let (mine, theirs) = Connection::pair(from.clone(), to.clone(), self.profile);
        state.open.retain(|link| !link.token.is_cancelled());
        state.open.push(OpenLink {
            ends: key,
            token: mine.close_token(),
        });
        Ok((mine, theirs, accept_tx))
    }

    fn go_offline(&self, address: &PeerAddress) {
        let mut state = self.state.lock();
        if let Some(slot) = state.nodes.get_mut(address) {
            slot.online = false;
        }
        state.open.retain(|link| {
            if link.ends.0 == *address || link.ends.1 == *address {
                link.token.cancel();
                false
            } else {
                true
            }
        });
    }
}

/// One node's view of a [`MemoryMedium`].
pub struct MemoryBearer {
    address: PeerAddress,
    medium: MemoryMedium,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for MemoryBearer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBearer")
            .field("address", &self.address)
            .field("kind", &self.medium.profile.kind)
            .finish()
    }
}

impl MemoryBearer {
    pub fn medium(&self) -> &MemoryMedium {
        &self.medium
    }
}

#[async_trait]
impl Bearer for MemoryBearer {
    fn profile(&self) -> BearerProfile {
        self.medium.profile
    }

    fn local_address(&self) -> PeerAddress {
        self.address.clone()
    }

    async fn discover(&self) -> Result<BoxStream<'static, DiscoveredPeer>, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        // Permission is checked up front; the neighbour list is read when the
        // stream is first polled.
        self.medium.neighbours(&self.address)?;
        let medium = self.medium.clone();
        let address = self.address.clone();
        let cycle = stream::once(async move { medium.neighbours(&address).unwrap_or_default() })
            .flat_map(stream::iter);
        Ok(cycle.boxed())
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<Connection, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let (mine, theirs, accept_tx) = self.medium.dial(&self.address, peer)?;
        accept_tx
            .send(theirs)
            .await
            .map_err(|_| TransportError::Unreachable(peer.to_string()))?;
        debug!(from = %self.address, to = %peer, kind = %self.medium.profile.kind, "Memory link opened");
        Ok(mine)
    }

    async fn accept(&self) -> Option<Connection> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            conn = rx.recv() => conn,
        }
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        self.medium.go_offline(&self.address);
    }
}
