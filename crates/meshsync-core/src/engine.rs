//! MeshEngine: one node of the mesh
//!
//! The engine owns the node's stores and wires them to its bearers:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  MeshEngine                                                      │
//! │  ├── DocumentStore ──LocalChange──▶ relay task ──▶ BundleRouter  │
//! │  ├── per bearer:                                                 │
//! │  │   ├── DiscoveryLoop ──candidates──▶ dialer ──▶ run_session    │
//! │  │   └── accept loop ─────────────────────────▶ run_session      │
//! │  ├── expiry task (BundleRouter::run_expiry)                      │
//! │  └── SyncEvent broadcast                                         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every task hangs off one root [`CancellationToken`]; [`MeshEngine::shutdown`]
//! cancels it and joins them all.
//!
//! # Example
//!
//! ```ignore
//! use meshsync_core::{EngineConfig, MeshEngine, Listing};
//!
//! let engine = MeshEngine::open_dir(EngineConfig::default())?;
//! engine.documents().insert(&Listing { title: "Ladder".into(), ..Default::default() })?;
//! engine.add_bearer(Arc::new(bearer));
//! engine.start()?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::crypto::derive_community_key;
use crate::document::{
    filter_change, Audience, Change, DocumentEvent, DocumentStore, Profile, Schema,
};
use crate::dtn::{BundleId, BundleRouter};
use crate::error::{SyncError, SyncResult};
use crate::identity::{Did, IdentityService};
use crate::peers::PeerRegistry;
use crate::storage::Storage;
use crate::sync::{
    run_session, LivePeers, PayloadSealer, Role, SessionConfig, SessionContext, SessionReport,
    SyncEvent,
};
use crate::transport::{
    Bearer, BearerKind, Connection, DiscoveredPeer, DiscoveryLoop, KnownPeers, PeerAddress,
};
use crate::types::{PeerRecord, RecordId, ReplicaId};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Candidates queued between a discovery loop and its dialer
const CANDIDATE_BUFFER: usize = 16;

/// Snapshot of a node's state for status displays
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub peer_id: Did,
    pub display_name: Option<String>,
    pub clock: u64,
    pub log_len: usize,
    pub stored_bundles: usize,
    pub stored_bundle_bytes: usize,
    pub known_peers: usize,
    pub verified_peers: usize,
    pub bearers: Vec<BearerKind>,
}

struct EngineInner {
    config: EngineConfig,
    storage: Storage,
    identity: Arc<dyn IdentityService>,
    documents: DocumentStore,
    router: Arc<BundleRouter>,
    registry: PeerRegistry,
    sealer: PayloadSealer,
    events: broadcast::Sender<SyncEvent>,
    known: KnownPeers,
    live: LivePeers,
    bearers: RwLock<Vec<Arc<dyn Bearer>>>,
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
    started: AtomicBool,
}

/// One mesh node. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct MeshEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for MeshEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshEngine")
            .field("peer", &self.peer_id().short())
            .field("bearers", &self.bearer_kinds())
            .field("started", &self.inner.started.load(Ordering::SeqCst))
            .finish()
    }
}

impl MeshEngine {
    /// Build an engine over an already opened database.
    pub fn open(
        config: EngineConfig,
        storage: Storage,
        identity: Arc<dyn IdentityService>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let local = identity.peer_id().clone();

        let documents = DocumentStore::open_with_log_limit(
            storage.clone(),
            ReplicaId::from(&local),
            Schema::community(),
            config.document.max_log_changes,
        )?;
        let router = Arc::new(BundleRouter::open(
            storage.clone(),
            local.clone(),
            config.bundles.limits(),
            config.bundles.max_hops,
        )?);
        let registry = PeerRegistry::new(storage.clone());

        let community_key = derive_community_key(&config.node.community_secret);
        if let Some(stored) = storage.load_community_key()? {
            if stored != community_key {
                warn!("Community secret changed; bundles sealed under the old key are unreadable");
            }
        }
        storage.save_community_key(&community_key)?;
        let sealer = PayloadSealer::new(identity.clone(), registry.clone(), community_key);

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(peer = %local, name = ?config.node.display_name, "Mesh engine opened");
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                storage,
                identity,
                documents,
                router,
                registry,
                sealer,
                events,
                known: KnownPeers::new(),
                live: LivePeers::new(),
                bearers: RwLock::new(Vec::new()),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(JoinSet::new()),
                started: AtomicBool::new(false),
            }),
        })
    }

    /// Open (or create) the database under `config.node.data_dir`, creating
    /// the node identity on first run.
    pub fn open_dir(config: EngineConfig) -> SyncResult<Self> {
        let storage = Storage::new(config.database_path())?;
        let identity = storage.load_or_create_identity()?;
        Self::open(config, storage, Arc::new(identity))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn peer_id(&self) -> &Did {
        self.inner.identity.peer_id()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.inner.documents
    }

    pub fn router(&self) -> &Arc<BundleRouter> {
        &self.inner.router
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    pub fn known_peers(&self) -> &KnownPeers {
        &self.inner.known
    }

    pub fn live_peers(&self) -> &LivePeers {
        &self.inner.live
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.cancel.is_cancelled()
    }

    pub fn bearer_kinds(&self) -> Vec<BearerKind> {
        let mut kinds: Vec<BearerKind> = self
            .inner
            .bearers
            .read()
            .iter()
            .map(|b| b.profile().kind)
            .collect();
        kinds.dedup();
        kinds
    }

    pub fn node_info(&self) -> SyncResult<NodeInfo> {
        let peers = self.inner.registry.list()?;
        Ok(NodeInfo {
            peer_id: self.peer_id().clone(),
            display_name: self.inner.config.node.display_name.clone(),
            clock: self.inner.documents.clock(),
            log_len: self.inner.documents.log_len(),
            stored_bundles: self.inner.router.stored_len(),
            stored_bundle_bytes: self.inner.router.stored_bytes(),
            verified_peers: peers.iter().filter(|p| p.is_verified()).count(),
            known_peers: peers.len(),
            bearers: self.bearer_kinds(),
        })
    }

    /// This node's profile: the profile record minted by the local replica.
    pub fn own_profile(&self) -> Option<(RecordId, Profile)> {
        let suffix = format!("@{}", self.inner.documents.replica_id());
        self.inner
            .documents
            .list::<Profile>()
            .into_iter()
            .find(|(id, _)| id.as_str().ends_with(&suffix))
    }

    /// Create or overwrite this node's profile.
    pub fn set_profile(&self, profile: &Profile) -> SyncResult<RecordId> {
        match self.own_profile() {
            Some((id, _)) => {
                self.inner.documents.update(&id, profile)?;
                Ok(id)
            }
            None => self.inner.documents.insert(profile),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Peers
    // ═══════════════════════════════════════════════════════════════════════

    /// Mark a peer verified; it will receive trusted fields from now on.
    pub fn verify_peer(&self, peer: &Did) -> SyncResult<PeerRecord> {
        self.inner.registry.set_verified(peer)
    }

    /// Unpin a peer's keys. Its next contact is a first contact again.
    pub fn forget_peer(&self, peer: &Did) -> SyncResult<bool> {
        self.inner.registry.remove(peer)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a bearer. Bearers added after [`start`](Self::start) begin
    /// discovering immediately.
    pub fn add_bearer(&self, bearer: Arc<dyn Bearer>) {
        let profile = bearer.profile();
        info!(bearer = %profile.kind, address = %bearer.local_address(), "Bearer added");
        self.inner.bearers.write().push(bearer.clone());
        if self.is_running() {
            self.spawn_bearer(bearer);
        }
    }

    /// Spawn discovery, accept, expiry and relay tasks.
    pub fn start(&self) -> SyncResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(SyncError::InvalidOperation(
                "Engine has been shut down".to_string(),
            ));
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::InvalidOperation(
                "Engine already started".to_string(),
            ));
        }

        let config = &self.inner.config;
        let router = self.inner.router.clone();
        self.spawn(router.run_expiry(config.bundles.expiry_interval, self.inner.cancel.child_token()));

        if config.bundles.relay_local_changes {
            self.spawn(self.clone().relay_local_changes());
        }

        let bearers = self.inner.bearers.read().clone();
        for bearer in bearers {
            self.spawn_bearer(bearer);
        }

        info!(peer = %self.peer_id().short(), bearers = ?self.bearer_kinds(), "Mesh engine started");
        Ok(())
    }

    /// Cancel every task and wait for them to finish, then checkpoint the
    /// document.
    pub async fn shutdown(&self) {
        info!("Shutting down mesh engine");
        self.inner.cancel.cancel();

        let bearers = self.inner.bearers.read().clone();
        for bearer in bearers {
            bearer.shutdown().await;
        }

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!(error = %e, "Engine task panicked");
                }
            }
        }

        if let Err(e) = self.inner.documents.checkpoint() {
            warn!(error = %e, "Checkpoint on shutdown failed");
        }
        info!("Mesh engine stopped");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════

    /// Dial `address` on the registered bearer of `kind` and run one
    /// exchange, disconnecting once both sides acknowledged.
    pub async fn sync_with(
        &self,
        kind: BearerKind,
        address: &PeerAddress,
    ) -> SyncResult<SessionReport> {
        let bearer = self
            .bearer(kind)
            .ok_or_else(|| SyncError::InvalidOperation(format!("No {} bearer registered", kind)))?;
        let conn = bearer.connect(address).await?;
        let ctx = self.session_context(false);
        run_session(&ctx, conn, Role::Initiator, self.inner.cancel.child_token()).await
    }

    /// Wrap a local change in bundles: a broadcast bundle with its public
    /// ops, plus one unicast bundle per verified peer when trusted ops exist.
    /// Peers in a live session already get the change directly and are
    /// left out.
    pub fn relay_change(&self, change: &Change) -> SyncResult<Vec<BundleId>> {
        let inner = &self.inner;
        let schema = inner.documents.schema();
        let settings = &inner.config.bundles;
        let live = inner.live.list();
        let mut created = Vec::new();

        let public = filter_change(change, schema, Audience::Community);
        let public_ops = public.ops.len();
        if public_ops > 0 {
            let payload = inner.sealer.seal_broadcast(vec![public])?;
            created.push(inner.router.create_bundle_bypassing(
                None,
                payload,
                settings.priority,
                settings.default_ttl,
                &live,
            )?);
        }

        let trusted = filter_change(change, schema, Audience::TrustedPeer);
        if trusted.ops.len() > public_ops {
            for peer in inner.registry.verified()? {
                if live.contains(&peer.peer_id) {
                    debug!(peer = %peer.peer_id.short(), "Peer is live, no unicast bundle");
                    continue;
                }
                let payload = inner.sealer.seal_for(&peer, vec![trusted.clone()])?;
                created.push(inner.router.create_bundle(
                    Some(peer.peer_id.clone()),
                    payload,
                    settings.priority,
                    settings.default_ttl,
                )?);
            }
        }

        debug!(change = %change.id(), bundles = created.len(), "Relayed local change");
        Ok(created)
    }

    fn bearer(&self, kind: BearerKind) -> Option<Arc<dyn Bearer>> {
        self.inner
            .bearers
            .read()
            .iter()
            .find(|b| b.profile().kind == kind)
            .cloned()
    }

    fn session_context(&self, keep_alive: bool) -> SessionContext {
        let inner = &self.inner;
        SessionContext {
            identity: inner.identity.clone(),
            documents: inner.documents.clone(),
            router: inner.router.clone(),
            registry: inner.registry.clone(),
            sealer: inner.sealer.clone(),
            events: inner.events.clone(),
            display_name: inner.config.node.display_name.clone(),
            transports: self.bearer_kinds(),
            config: SessionConfig {
                keep_alive,
                ..inner.config.session.clone()
            },
            live: inner.live.clone(),
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.inner.events.send(event);
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.inner.tasks.lock();
        // Reap finished sessions so the set does not grow without bound
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    fn spawn_bearer(&self, bearer: Arc<dyn Bearer>) {
        let discovery = &self.inner.config.discovery;
        let (tx, rx) = mpsc::channel(CANDIDATE_BUFFER);
        let discovery_loop = DiscoveryLoop::new(
            bearer.clone(),
            self.inner.known.clone(),
            discovery.backoff(),
            discovery.interval,
        );
        self.spawn(discovery_loop.run(tx, self.inner.cancel.child_token()));
        self.spawn(self.clone().dial_candidates(bearer.clone(), rx));
        self.spawn(self.clone().accept_inbound(bearer));
    }

    async fn dial_candidates(
        self,
        bearer: Arc<dyn Bearer>,
        mut candidates: mpsc::Receiver<DiscoveredPeer>,
    ) {
        let cancel = self.inner.cancel.clone();
        loop {
            let candidate = tokio::select! {
                _ = cancel.cancelled() => break,
                candidate = candidates.recv() => match candidate {
                    Some(candidate) => candidate,
                    None => break,
                },
            };
            if candidate.peer_hint.as_ref() == Some(self.peer_id()) {
                continue;
            }
            self.emit(SyncEvent::PeerDiscovered {
                address: candidate.address.clone(),
                bearer: candidate.bearer,
            });
            let engine = self.clone();
            let bearer = bearer.clone();
            self.spawn(async move { engine.dial(bearer, candidate).await });
        }
    }

    async fn dial(self, bearer: Arc<dyn Bearer>, candidate: DiscoveredPeer) {
        let DiscoveredPeer {
            address,
            bearer: kind,
            ..
        } = candidate;
        let known = &self.inner.known;

        let conn = match bearer.connect(&address).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(bearer = %kind, remote = %address, error = %e, "Dial failed");
                known.record_failure(kind, &address);
                return;
            }
        };
        known.record_connected(kind, &address);

        let result = self.run(conn, Role::Initiator).await;
        known.record_disconnected(kind, &address);
        if result.is_err() {
            known.record_failure(kind, &address);
        }
    }

    async fn accept_inbound(self, bearer: Arc<dyn Bearer>) {
        let kind = bearer.profile().kind;
        let cancel = self.inner.cancel.clone();
        loop {
            let conn = tokio::select! {
                _ = cancel.cancelled() => break,
                conn = bearer.accept() => match conn {
                    Some(conn) => conn,
                    None => break,
                },
            };
            let engine = self.clone();
            self.spawn(async move {
                let address = conn.remote().clone();
                engine.inner.known.record_connected(kind, &address);
                let _ = engine.run(conn, Role::Responder).await;
                engine.inner.known.record_disconnected(kind, &address);
            });
        }
        debug!(bearer = %kind, "Accept loop stopped");
    }

    async fn run(&self, conn: Connection, role: Role) -> SyncResult<SessionReport> {
        let ctx = self.session_context(self.inner.config.session.keep_alive);
        let remote = conn.remote().clone();
        let result = run_session(&ctx, conn, role, self.inner.cancel.child_token()).await;
        match &result {
            Ok(report) => info!(
                peer = %report.peer.short(),
                bearer = %report.bearer,
                sent = report.sent_changes,
                received = report.received_changes,
                bundles_in = report.bundles_received,
                bundles_out = report.bundles_sent,
                "Session finished"
            ),
            Err(e) => debug!(remote = %remote, ?role, error = %e, "Session failed"),
        }
        result
    }

    async fn relay_local_changes(self) {
        let mut changes = self.inner.documents.subscribe();
        let cancel = self.inner.cancel.clone();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = changes.recv() => event,
            };
            match event {
                Ok(DocumentEvent::LocalChange(change)) => {
                    if let Err(e) = self.relay_change(&change) {
                        warn!(change = %change.id(), error = %e, "Failed to relay local change");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Bundle relay fell behind local changes");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}
