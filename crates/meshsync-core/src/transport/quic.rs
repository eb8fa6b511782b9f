//! Local-network bearer over iroh QUIC
//!
//! Peers are addressed by their iroh endpoint id. Addresses are learned
//! statically (configuration or [`IrohBearer::add_peer`]) and fed to iroh's
//! static discovery provider. Each frame travels on its own bi-directional
//! stream: the sender writes and finishes, the receiver reads to end.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use iroh::discovery::static_provider::StaticProvider;
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Bearer, BearerKind, BearerProfile, Connection, DiscoveredPeer, PeerAddress, TransportError,
    CONNECTION_BUFFER,
};
use crate::error::SyncError;

/// ALPN protocol identifier for mesh sync sessions.
pub const MESH_ALPN: &[u8] = b"/meshsync/1";

/// Time given to in-flight frames before a closed connection is torn down.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Bearer backed by an iroh endpoint.
pub struct IrohBearer {
    endpoint: Endpoint,
    router: Router,
    static_provider: StaticProvider,
    known: Arc<Mutex<Vec<EndpointAddr>>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    profile: BearerProfile,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for IrohBearer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohBearer")
            .field("endpoint_id", &self.endpoint.id())
            .field("known", &self.known.lock().len())
            .finish()
    }
}

impl IrohBearer {
    /// Bind an endpoint with a stable secret key and register the mesh
    /// protocol handler.
    pub async fn bind(secret: [u8; 32], static_peers: Vec<EndpointAddr>) -> Result<Self, SyncError> {
        let profile = BearerProfile::local_network();
        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(SecretKey::from(secret))
            .alpns(vec![MESH_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| SyncError::Transport(TransportError::Unreachable(format!(
                "Failed to bind endpoint: {}",
                e
            ))))?;
        info!(endpoint_id = %endpoint.id(), "Endpoint bound");

        let shutdown = CancellationToken::new();
        let (accept_tx, accept_rx) = mpsc::channel(CONNECTION_BUFFER);
        let handler = MeshProtocolHandler {
            accept_tx,
            profile,
            shutdown: shutdown.clone(),
        };
        let router = Router::builder(endpoint.clone())
            .accept(MESH_ALPN, handler)
            .spawn();

        let bearer = Self {
            endpoint,
            router,
            static_provider,
            known: Arc::new(Mutex::new(Vec::new())),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            profile,
            shutdown,
        };
        for addr in static_peers {
            bearer.add_peer(addr);
        }
        Ok(bearer)
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// Current address (id plus direct addresses) for sharing with peers.
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Make a peer known to both discovery and iroh's address lookup.
    pub fn add_peer(&self, addr: EndpointAddr) {
        info!(peer = %addr.id, addrs = addr.addrs.len(), "Adding static peer");
        self.static_provider.add_endpoint_info(addr.clone());
        let mut known = self.known.lock();
        known.retain(|a| a.id != addr.id);
        known.push(addr);
    }

    /// Parse `<endpoint-id>` or `<endpoint-id>@<ip:port>`.
    pub fn parse_peer(s: &str) -> Result<EndpointAddr, SyncError> {
        let (id, socket) = match s.split_once('@') {
            Some((id, socket)) => (id, Some(socket)),
            None => (s, None),
        };
        let id: EndpointId = id
            .trim()
            .parse()
            .map_err(|e| SyncError::Config(format!("Invalid endpoint id '{}': {}", id, e)))?;
        let mut addr = EndpointAddr::new(id);
        if let Some(socket) = socket {
            let socket: std::net::SocketAddr = socket
                .trim()
                .parse()
                .map_err(|e| SyncError::Config(format!("Invalid socket address '{}': {}", socket, e)))?;
            addr = addr.with_ip_addr(socket);
        }
        Ok(addr)
    }

    fn lookup(&self, id: EndpointId) -> EndpointAddr {
        self.known
            .lock()
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .unwrap_or_else(|| EndpointAddr::new(id))
    }
}

#[async_trait]
impl Bearer for IrohBearer {
    fn profile(&self) -> BearerProfile {
        self.profile
    }

    fn local_address(&self) -> PeerAddress {
        PeerAddress::new(self.endpoint.id().to_string())
    }

    async fn discover(&self) -> Result<BoxStream<'static, DiscoveredPeer>, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let known = self.known.clone();
        let cycle = stream::once(async move {
            known
                .lock()
                .iter()
                .map(|addr| DiscoveredPeer {
                    address: PeerAddress::new(addr.id.to_string()),
                    bearer: BearerKind::LocalNetwork,
                    peer_hint: None,
                })
                .collect::<Vec<_>>()
        })
        .flat_map(stream::iter);
        Ok(cycle.boxed())
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<Connection, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let id: EndpointId = peer
            .as_str()
            .parse()
            .map_err(|e| TransportError::Unreachable(format!("Invalid endpoint id {}: {}", peer, e)))?;
        let addr = self.lookup(id);

        let timeout = self.profile.class.io_timeout();
        let conn = match tokio::time::timeout(timeout, self.endpoint.connect(addr, MESH_ALPN)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(TransportError::Unreachable(format!("{}: {}", peer, e))),
            Err(_) => return Err(TransportError::Timeout(format!("connect to {}", peer))),
        };
        debug!(peer = %peer, "Connected over local network");
        Ok(wire(conn, peer.clone(), self.profile, &self.shutdown))
    }

    async fn accept(&self) -> Option<Connection> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            conn = rx.recv() => conn,
        }
    }

    async fn shutdown(&self) {
        info!("Shutting down local-network bearer");
        self.shutdown.cancel();
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
    }
}

/// Pump frames between a [`Connection`]'s channels and an iroh connection.
fn wire(
    conn: iroh::endpoint::Connection,
    remote: PeerAddress,
    profile: BearerProfile,
    parent: &CancellationToken,
) -> Connection {
    let cancel = parent.child_token();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CONNECTION_BUFFER);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(CONNECTION_BUFFER);

    let writer_conn = conn.clone();
    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = out_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if let Err(e) = send_frame(&writer_conn, &frame).await {
                warn!(error = %e, "Failed to send frame");
                break;
            }
        }
        writer_cancel.cancel();
        tokio::time::sleep(CLOSE_GRACE).await;
        writer_conn.close(0u32.into(), b"done");
    });

    let reader_cancel = cancel.clone();
    let max = profile.max_payload;
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = reader_cancel.cancelled() => break,
                accepted = conn.accept_bi() => accepted,
            };
            let (_send, mut recv) = match accepted {
                Ok(streams) => streams,
                Err(e) => {
                    debug!(error = %e, "Connection closed by peer");
                    break;
                }
            };
            match recv.read_to_end(max).await {
                Ok(bytes) => {
                    if in_tx.send(bytes).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read frame");
                    break;
                }
            }
        }
        reader_cancel.cancel();
    });

    Connection::from_parts(remote, profile, out_tx, in_rx, cancel)
}

async fn send_frame(conn: &iroh::endpoint::Connection, frame: &[u8]) -> Result<(), SyncError> {
    let (mut send, _recv) = conn
        .open_bi()
        .await
        .map_err(|e| SyncError::Transport(TransportError::Unreachable(format!("open stream: {}", e))))?;
    send.write_all(frame)
        .await
        .map_err(|e| SyncError::Transport(TransportError::Unreachable(format!("write frame: {}", e))))?;
    send.finish()
        .map_err(|e| SyncError::Transport(TransportError::Unreachable(format!("finish stream: {}", e))))?;
    Ok(())
}

/// Hands inbound mesh connections to [`IrohBearer::accept`].
#[derive(Debug, Clone)]
struct MeshProtocolHandler {
    accept_tx: mpsc::Sender<Connection>,
    profile: BearerProfile,
    shutdown: CancellationToken,
}

impl ProtocolHandler for MeshProtocolHandler {
    fn accept(
        &self,
        conn: iroh::endpoint::Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let accept_tx = self.accept_tx.clone();
        let profile = self.profile;
        let shutdown = self.shutdown.clone();

        async move {
            let remote = PeerAddress::new(conn.remote_id().to_string());
            debug!(peer = %remote, "Router accepting mesh connection");

            let connection = wire(conn, remote, profile, &shutdown);
            let closed = connection.close_token();
            if accept_tx.send(connection).await.is_err() {
                return Err(AcceptError::from_err(SyncError::Transport(TransportError::Closed)));
            }
            // Hold the handler open for the life of the session.
            closed.cancelled().await;
            Ok(())
        }
    }
}
