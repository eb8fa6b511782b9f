//! One authenticated sync session over one connection
//!
//! After the handshake the connection is split: a writer pushes our state
//! (summary, then changes or a snapshot, then bundles, then `Done`) while a
//! reader merges whatever the peer pushes and answers with acknowledgements.
//! The reader never writes to the link itself: its replies and its signals
//! to the writer pass through one ordered queue. Each received unit is
//! applied atomically, so a session torn down halfway leaves both stores
//! consistent and the next contact picks up where this one stopped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::document::{filter_change, Audience, DocumentEvent, DocumentStore, VersionVector};
use crate::dtn::{AcceptOutcome, Bundle, BundleRouter};
use crate::error::{SyncError, SyncResult};
use crate::identity::{Did, IdentityService};
use crate::peers::PeerRegistry;
use crate::transport::{
    BearerKind, BearerProfile, Connection, FrameReceiver, FrameSender, PeerAddress, TransportError,
};
use crate::types::{now_millis, PeerRecord};

use super::envelope::EncryptedEnvelope;
use super::events::{SessionState, SyncEvent};
use super::handshake::{Handshake, HandshakeOutcome};
use super::protocol::{
    fragment, message_budget, pack_bundles, pack_changes, snapshot_parts, Frame, Reassembly,
    SyncMessage, MAX_MESSAGE_BYTES, MAX_SNAPSHOT_BYTES,
};
use super::relay::PayloadSealer;

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Session timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on the whole handshake
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Silence tolerated while waiting on the peer, and in live mode
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Stay connected after the exchange and push local changes live
    pub keep_alive: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(30),
            keep_alive: true,
        }
    }
}

/// Peers that currently receive local changes over a live session.
#[derive(Debug, Clone, Default)]
pub struct LivePeers {
    sessions: Arc<Mutex<HashMap<Did, usize>>>,
}

impl LivePeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, peer: &Did) -> bool {
        self.sessions.lock().contains_key(peer)
    }

    pub fn list(&self) -> Vec<Did> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub(crate) fn enter(&self, peer: &Did) -> LiveGuard {
        *self.sessions.lock().entry(peer.clone()).or_default() += 1;
        LiveGuard {
            peers: self.clone(),
            peer: peer.clone(),
        }
    }
}

pub(crate) struct LiveGuard {
    peers: LivePeers,
    peer: Did,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let mut sessions = self.peers.sessions.lock();
        if let Some(count) = sessions.get_mut(&self.peer) {
            *count -= 1;
            if *count == 0 {
                sessions.remove(&self.peer);
            }
        }
    }
}

/// Everything a session needs from the node.
#[derive(Clone)]
pub struct SessionContext {
    pub identity: Arc<dyn IdentityService>,
    pub documents: DocumentStore,
    pub router: Arc<BundleRouter>,
    pub registry: PeerRegistry,
    pub sealer: PayloadSealer,
    pub events: broadcast::Sender<SyncEvent>,
    pub display_name: Option<String>,
    pub transports: Vec<BearerKind>,
    pub config: SessionConfig,
    pub live: LivePeers,
}

impl SessionContext {
    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn state(&self, address: &PeerAddress, peer: Option<&Did>, state: SessionState) {
        debug!(remote = %address, %state, "Session state");
        self.emit(SyncEvent::SessionStateChanged {
            address: address.clone(),
            peer: peer.cloned(),
            state,
        });
    }
}

/// What a finished session exchanged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub peer: Did,
    pub bearer: BearerKind,
    pub first_contact: bool,
    pub sent_changes: usize,
    pub received_changes: usize,
    pub snapshot_sent: bool,
    pub snapshot_received: bool,
    pub bundles_sent: usize,
    pub bundles_received: usize,
    /// Both sides acknowledged each other's `Done`
    pub completed: bool,
}

/// Authenticate the peer on `conn`, then synchronize with it.
///
/// Authentication failures and timeouts end the session with an error after
/// emitting `UntrustedPeer` or `SessionTimedOut`. A peer that vanishes
/// mid-exchange is not an error; the report shows `completed: false`.
pub async fn run_session(
    ctx: &SessionContext,
    mut conn: Connection,
    role: Role,
    cancel: CancellationToken,
) -> SyncResult<SessionReport> {
    let address = conn.remote().clone();
    let profile = conn.profile();

    ctx.state(&address, None, SessionState::Challenged);
    let outcome = match authenticate(ctx, &mut conn, role, &cancel).await {
        Ok(outcome) => outcome,
        Err(e) => {
            conn.disconnect();
            match &e {
                SyncError::Authentication(reason) => {
                    warn!(remote = %address, %reason, "Peer failed authentication");
                    ctx.emit(SyncEvent::UntrustedPeer {
                        address: address.clone(),
                        reason: reason.clone(),
                    });
                }
                SyncError::Transport(TransportError::Timeout(_)) => {
                    warn!(remote = %address, "Handshake timed out");
                    ctx.emit(SyncEvent::SessionTimedOut {
                        address: address.clone(),
                        peer: None,
                    });
                }
                _ => debug!(remote = %address, error = %e, "Handshake aborted"),
            }
            ctx.state(&address, None, SessionState::Disconnected);
            return Err(e);
        }
    };

    let peer = outcome.peer.peer_id.clone();
    info!(
        peer = %peer.short(),
        remote = %address,
        bearer = %profile.kind,
        first_contact = outcome.first_contact,
        "Peer authenticated"
    );
    ctx.emit(SyncEvent::PeerAuthenticated {
        peer: peer.clone(),
        bearer: profile.kind,
        first_contact: outcome.first_contact,
    });
    ctx.state(&address, Some(&peer), SessionState::Authenticated);

    let (tx, rx) = conn.split();
    let link = Link {
        tx,
        key: outcome.session_key,
        identity: ctx.identity.clone(),
        budget: message_budget(&profile, ctx.identity.peer_id()),
    };
    let counters = Counters::default();
    let (signals_tx, signals_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let writer = Writer {
        ctx,
        link: link.clone(),
        address: &address,
        profile,
        outcome: &outcome,
        counters: &counters,
        signals: signals_rx,
        cancel: &cancel,
    };
    let reader = Reader {
        ctx,
        link: link.clone(),
        peer: &peer,
        counters: &counters,
        outbound: outbound_tx,
        snapshot: Reassembly::new(MAX_SNAPSHOT_BYTES, link.budget),
        fragments: Reassembly::new(MAX_MESSAGE_BYTES, link.budget),
    };

    let (written, read, replied) = tokio::join!(
        writer.run(),
        reader.run(rx),
        forward_outbound(link.clone(), outbound_rx, signals_tx)
    );
    link.tx.disconnect();
    ctx.state(&address, Some(&peer), SessionState::Disconnected);

    if let Err(e) = read.and(replied) {
        warn!(peer = %peer.short(), error = %e, "Session reader failed");
        return Err(e);
    }
    let completed = match written {
        Ok(completed) => completed,
        Err(SyncError::Transport(TransportError::Timeout(reason))) => {
            warn!(peer = %peer.short(), %reason, "Session timed out");
            ctx.emit(SyncEvent::SessionTimedOut {
                address,
                peer: Some(peer),
            });
            return Err(SyncError::Transport(TransportError::Timeout(reason)));
        }
        Err(SyncError::Transport(TransportError::Closed)) => false,
        Err(e) => return Err(e),
    };

    Ok(SessionReport {
        peer,
        bearer: profile.kind,
        first_contact: outcome.first_contact,
        sent_changes: counters.sent_changes.load(Ordering::Relaxed),
        received_changes: counters.received_changes.load(Ordering::Relaxed),
        snapshot_sent: counters.snapshot_sent.load(Ordering::Relaxed),
        snapshot_received: counters.snapshot_received.load(Ordering::Relaxed),
        bundles_sent: counters.bundles_sent.load(Ordering::Relaxed),
        bundles_received: counters.bundles_received.load(Ordering::Relaxed),
        completed,
    })
}

async fn authenticate(
    ctx: &SessionContext,
    conn: &mut Connection,
    role: Role,
    cancel: &CancellationToken,
) -> SyncResult<HandshakeOutcome> {
    let handshake = Handshake {
        identity: ctx.identity.as_ref(),
        registry: &ctx.registry,
        display_name: ctx.display_name.as_deref(),
        transports: &ctx.transports,
    };
    let run = async {
        match role {
            Role::Initiator => handshake.initiate(conn).await,
            Role::Responder => handshake.respond(conn).await,
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(TransportError::Closed.into()),
        res = tokio::time::timeout(ctx.config.handshake_timeout, run) => match res {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout("handshake".into()).into()),
        },
    }
}

#[derive(Default)]
struct Counters {
    sent_changes: AtomicUsize,
    received_changes: AtomicUsize,
    snapshot_sent: AtomicBool,
    snapshot_received: AtomicBool,
    bundles_sent: AtomicUsize,
    bundles_received: AtomicUsize,
}

/// Queued by the reader so it never blocks on the link
#[derive(Debug)]
enum Outbound {
    Reply(SyncMessage),
    Signal(Signal),
}

/// Send the reader's replies in order, passing signals to the writer only
/// once every reply queued before them is on the link.
async fn forward_outbound(
    link: Link,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    signals: mpsc::UnboundedSender<Signal>,
) -> SyncResult<()> {
    while let Some(item) = queue.recv().await {
        match item {
            Outbound::Reply(message) => match link.send(message).await {
                Ok(()) => {}
                Err(SyncError::Transport(TransportError::Closed)) => return Ok(()),
                Err(e) => return Err(e),
            },
            Outbound::Signal(signal) => {
                // Writer may already be finished
                let _ = signals.send(signal);
            }
        }
    }
    Ok(())
}

/// Reader to writer notifications
#[derive(Debug)]
enum Signal {
    Summary(VersionVector),
    PeerDone,
    Acked,
    /// Anything else arrived; keeps a live session from idling out
    Activity,
}

/// Sealing half of the session.
#[derive(Clone)]
struct Link {
    tx: FrameSender,
    key: [u8; 32],
    identity: Arc<dyn IdentityService>,
    budget: usize,
}

impl Link {
    /// Send `message`, fragmenting it if needed.
    async fn send(&self, message: SyncMessage) -> SyncResult<()> {
        for part in fragment(message, self.budget)? {
            self.send_sealed(&part).await?;
        }
        Ok(())
    }

    /// Send messages already cut to the budget.
    async fn send_all(&self, messages: Vec<SyncMessage>) -> SyncResult<()> {
        for message in &messages {
            self.send_sealed(message).await?;
        }
        Ok(())
    }

    async fn send_sealed(&self, message: &SyncMessage) -> SyncResult<()> {
        let envelope =
            EncryptedEnvelope::seal(message, &self.key, self.identity.as_ref(), now_millis())?;
        let frame = Frame::Sealed(envelope.to_bytes()?).encode()?;
        self.tx.send(frame).await?;
        Ok(())
    }
}

struct Writer<'a> {
    ctx: &'a SessionContext,
    link: Link,
    address: &'a PeerAddress,
    profile: BearerProfile,
    outcome: &'a HandshakeOutcome,
    counters: &'a Counters,
    signals: mpsc::UnboundedReceiver<Signal>,
    cancel: &'a CancellationToken,
}

impl Writer<'_> {
    /// Push everything, then optionally stay live. Returns whether both
    /// sides acknowledged the exchange. Always closes the link on the way out.
    async fn run(mut self) -> SyncResult<bool> {
        let result = self.exchange().await;
        self.link.tx.disconnect();
        result
    }

    async fn exchange(&mut self) -> SyncResult<bool> {
        let ctx = self.ctx;
        let outcome = self.outcome;
        let peer = &outcome.peer;
        let audience = Audience::for_trust(peer.trust);

        // Subscribe before reading the version so no local change slips
        // between the summary and live mode
        let mut local_changes = ctx.documents.subscribe();
        let _live = ctx
            .config
            .keep_alive
            .then(|| ctx.live.enter(&peer.peer_id));

        ctx.state(self.address, Some(&peer.peer_id), SessionState::Syncing);
        self.link
            .send(SyncMessage::Summary {
                version: ctx.documents.version(),
            })
            .await?;

        let remote = loop {
            if let Signal::Summary(version) = self.next_signal().await? {
                break version;
            }
        };

        if peer.trusted_backfill && audience == Audience::TrustedPeer {
            info!(peer = %peer.peer_id.short(), "Resending history at trusted audience");
            self.push_document(&VersionVector::new(), audience).await?;
            ctx.registry.complete_backfill(&peer.peer_id)?;
        } else {
            self.push_document(&remote, audience).await?;
        }
        self.push_bundles(peer).await?;
        self.link.send(SyncMessage::Done).await?;

        let (mut acked, mut peer_done) = (false, false);
        while !(acked && peer_done) {
            match self.next_signal().await? {
                Signal::Acked => acked = true,
                Signal::PeerDone => peer_done = true,
                _ => {}
            }
        }

        ctx.state(self.address, Some(&peer.peer_id), SessionState::Idle);
        let sent = self.counters.sent_changes.load(Ordering::Relaxed);
        let received = self.counters.received_changes.load(Ordering::Relaxed);
        info!(peer = %peer.peer_id.short(), sent, received, "Sync completed");
        ctx.emit(SyncEvent::SyncCompleted {
            peer: peer.peer_id.clone(),
            sent_changes: sent,
            received_changes: received,
            snapshot: self.counters.snapshot_sent.load(Ordering::Relaxed)
                || self.counters.snapshot_received.load(Ordering::Relaxed),
        });

        if ctx.config.keep_alive {
            self.live(&mut local_changes, peer, audience).await?;
        }
        Ok(true)
    }

    /// Snapshot or incremental changes, whichever fits the peer and bearer.
    async fn push_document(&self, remote: &VersionVector, audience: Audience) -> SyncResult<()> {
        let documents = &self.ctx.documents;
        let local = documents.version();
        if remote.dominates(&local) {
            debug!(peer = %self.outcome.peer.peer_id.short(), "Peer already up to date");
            return Ok(());
        }

        let fresh_peer = self.outcome.first_contact || remote.is_empty();
        let incremental = if fresh_peer && self.profile.prefers_snapshot() {
            None
        } else {
            documents.changes_since(remote, audience)
        };

        match incremental {
            Some(changes) => {
                let count = changes.len();
                self.link
                    .send_all(pack_changes(changes, self.link.budget)?)
                    .await?;
                self.counters
                    .sent_changes
                    .fetch_add(count, Ordering::Relaxed);
            }
            None => {
                let snapshot = documents.export_snapshot_for(audience)?;
                debug!(
                    peer = %self.outcome.peer.peer_id.short(),
                    bytes = snapshot.len(),
                    "Sending snapshot"
                );
                self.link
                    .send_all(snapshot_parts(&snapshot, self.link.budget))
                    .await?;
                self.counters.snapshot_sent.store(true, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn push_bundles(&self, peer: &PeerRecord) -> SyncResult<()> {
        let bundles = self.ctx.router.on_peer_contact(&peer.peer_id);
        if bundles.is_empty() {
            return Ok(());
        }
        let count = bundles.len();
        let encoded = bundles
            .iter()
            .map(Bundle::encode)
            .collect::<SyncResult<Vec<_>>>()?;
        self.link
            .send_all(pack_bundles(encoded, self.link.budget)?)
            .await?;
        self.counters
            .bundles_sent
            .fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    /// Push local changes as they happen until the link idles out.
    async fn live(
        &mut self,
        local_changes: &mut broadcast::Receiver<DocumentEvent>,
        peer: &PeerRecord,
        audience: Audience,
    ) -> SyncResult<()> {
        let idle = self.ctx.config.idle_timeout;
        let mut deadline = Instant::now() + idle;
        let ctx = self.ctx;
        let schema = ctx.documents.schema();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(peer = %peer.peer_id.short(), "Live session idle");
                    return Ok(());
                }
                signal = self.signals.recv() => match signal {
                    Some(_) => deadline = Instant::now() + idle,
                    None => return Ok(()),
                },
                event = local_changes.recv() => match event {
                    Ok(DocumentEvent::LocalChange(change)) => {
                        let filtered = filter_change(&change, schema, audience);
                        self.link
                            .send(SyncMessage::Changes { changes: vec![filtered] })
                            .await?;
                        self.counters.sent_changes.fetch_add(1, Ordering::Relaxed);
                        deadline = Instant::now() + idle;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // The next contact's summary exchange covers these
                        warn!(peer = %peer.peer_id.short(), missed, "Live push fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    async fn next_signal(&mut self) -> SyncResult<Signal> {
        let idle = self.ctx.config.idle_timeout;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Closed.into()),
            signal = tokio::time::timeout(idle, self.signals.recv()) => match signal {
                Ok(Some(signal)) => Ok(signal),
                Ok(None) => Err(TransportError::Closed.into()),
                Err(_) => Err(TransportError::Timeout(format!(
                    "no progress from {} in {:?}",
                    self.outcome.peer.peer_id.short(),
                    idle
                ))
                .into()),
            },
        }
    }
}

struct Reader<'a> {
    ctx: &'a SessionContext,
    link: Link,
    peer: &'a Did,
    counters: &'a Counters,
    outbound: mpsc::UnboundedSender<Outbound>,
    snapshot: Reassembly,
    fragments: Reassembly,
}

impl Reader<'_> {
    /// Consumes the reader so the forwarder, and then the writer, see
    /// their channels close.
    async fn run(mut self, mut rx: FrameReceiver) -> SyncResult<()> {
        let result = self.receive(&mut rx).await;
        if result.is_err() {
            self.link.tx.disconnect();
        }
        result
    }

    async fn receive(&mut self, rx: &mut FrameReceiver) -> SyncResult<()> {
        while let Some(bytes) = rx.next().await {
            let message = match self.open(&bytes) {
                Ok(message) => message,
                Err(e @ SyncError::Authentication(_)) => return Err(e),
                Err(e) => {
                    self.decode_failure(&e);
                    continue;
                }
            };

            let mut replies = Vec::new();
            let mut signals = Vec::new();
            self.handle(message, &mut replies, &mut signals)?;

            let queued = replies
                .into_iter()
                .map(Outbound::Reply)
                .chain(signals.into_iter().map(Outbound::Signal));
            for item in queued {
                // Forwarder only stops once the link is gone
                let _ = self.outbound.send(item);
            }
        }
        Ok(())
    }

    fn open(&self, bytes: &[u8]) -> SyncResult<SyncMessage> {
        match Frame::decode(bytes)? {
            Frame::Sealed(sealed) => {
                EncryptedEnvelope::from_bytes(&sealed)?.open(&self.link.key, Some(self.peer))
            }
            Frame::Reject { reason } => Err(SyncError::Authentication(reason)),
            other => Err(SyncError::Decode(format!(
                "Unexpected {} frame in session",
                other.kind()
            ))),
        }
    }

    fn decode_failure(&self, error: &SyncError) {
        warn!(peer = %self.peer.short(), %error, "Discarding unit");
        let _ = self.ctx.events.send(SyncEvent::DecodeFailure {
            peer: Some(self.peer.clone()),
            reason: error.to_string(),
        });
    }

    fn handle(
        &mut self,
        message: SyncMessage,
        replies: &mut Vec<SyncMessage>,
        signals: &mut Vec<Signal>,
    ) -> SyncResult<()> {
        match message {
            SyncMessage::Summary { version } => signals.push(Signal::Summary(version)),
            SyncMessage::Changes { changes } => {
                let report = self.ctx.documents.merge_remote(changes)?;
                self.counters
                    .received_changes
                    .fetch_add(report.applied.len(), Ordering::Relaxed);
                signals.push(Signal::Activity);
            }
            SyncMessage::SnapshotPart { index, total, data } => {
                match self.snapshot.push(index, total, data) {
                    Ok(Some(bytes)) => match self.ctx.documents.import_snapshot(&bytes) {
                        Ok(()) => {
                            self.counters
                                .snapshot_received
                                .store(true, Ordering::Relaxed);
                        }
                        Err(e @ (SyncError::Decode(_) | SyncError::InvalidChange(_))) => {
                            self.decode_failure(&e)
                        }
                        Err(e) => return Err(e),
                    },
                    Ok(None) => {}
                    Err(e) => self.decode_failure(&e),
                }
                signals.push(Signal::Activity);
            }
            SyncMessage::Fragment { index, total, data } => {
                let joined = match self.fragments.push(index, total, data) {
                    Ok(Some(joined)) => joined,
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        self.decode_failure(&e);
                        return Ok(());
                    }
                };
                match SyncMessage::decode(&joined) {
                    Ok(SyncMessage::Fragment { .. }) => {
                        self.decode_failure(&SyncError::Decode("Nested fragment".into()))
                    }
                    Ok(inner) => self.handle(inner, replies, signals)?,
                    Err(e) => self.decode_failure(&e),
                }
            }
            SyncMessage::Bundles { bundles } => {
                let mut ids = Vec::with_capacity(bundles.len());
                for bytes in bundles {
                    match Bundle::decode(&bytes) {
                        Ok(bundle) => {
                            ids.push(bundle.id.clone());
                            self.accept(bundle)?;
                        }
                        Err(e) => self.decode_failure(&e),
                    }
                }
                if !ids.is_empty() {
                    replies.push(SyncMessage::BundleAck { ids });
                }
                signals.push(Signal::Activity);
            }
            SyncMessage::BundleAck { ids } => {
                self.ctx.router.mark_delivered(self.peer, &ids)?;
            }
            SyncMessage::Done => {
                replies.push(SyncMessage::Ack);
                signals.push(Signal::PeerDone);
            }
            SyncMessage::Ack => signals.push(Signal::Acked),
        }
        Ok(())
    }

    fn accept(&mut self, bundle: Bundle) -> SyncResult<()> {
        match self.ctx.router.accept_bundle(bundle, self.peer)? {
            AcceptOutcome::Deliver { bundle, relay } => {
                self.counters
                    .bundles_received
                    .fetch_add(1, Ordering::Relaxed);
                match self.ctx.sealer.open(&bundle) {
                    Ok(changes) => {
                        let report = self.ctx.documents.merge_remote(changes)?;
                        debug!(
                            bundle = %bundle.id,
                            applied = report.applied.len(),
                            relay,
                            "Bundle delivered"
                        );
                        let _ = self.ctx.events.send(SyncEvent::BundleDelivered {
                            id: bundle.id.clone(),
                            origin: bundle.source.clone(),
                        });
                    }
                    Err(e @ (SyncError::Decode(_) | SyncError::EnvelopeVersionUnsupported(_))) => {
                        self.decode_failure(&e)
                    }
                    Err(e) => return Err(e),
                }
            }
            AcceptOutcome::Relay { .. } => {
                self.counters
                    .bundles_received
                    .fetch_add(1, Ordering::Relaxed);
            }
            AcceptOutcome::Duplicate | AcceptOutcome::Dropped(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Listing, Schema};
    use crate::dtn::{Priority, StoreLimits};
    use crate::identity::LocalIdentity;
    use crate::storage::Storage;
    use crate::types::ReplicaId;

    struct Node {
        ctx: SessionContext,
        events: broadcast::Receiver<SyncEvent>,
    }

    fn node(seed: u8, keep_alive: bool) -> Node {
        let identity: Arc<dyn IdentityService> = Arc::new(LocalIdentity::from_seed(&[seed; 32]));
        let storage = Storage::in_memory().unwrap();
        let documents = DocumentStore::open(
            storage.clone(),
            ReplicaId::from(identity.peer_id()),
            Schema::community(),
        )
        .unwrap();
        let router = Arc::new(
            BundleRouter::open(
                storage.clone(),
                identity.peer_id().clone(),
                StoreLimits::default(),
                4,
            )
            .unwrap(),
        );
        let registry = PeerRegistry::new(storage);
        let sealer = PayloadSealer::new(identity.clone(), registry.clone(), [7u8; 32]);
        let (events, rx) = broadcast::channel(256);
        Node {
            ctx: SessionContext {
                identity,
                documents,
                router,
                registry,
                sealer,
                events,
                display_name: Some(format!("node-{}", seed)),
                transports: vec![BearerKind::LocalNetwork],
                config: SessionConfig {
                    handshake_timeout: Duration::from_secs(5),
                    idle_timeout: Duration::from_millis(300),
                    keep_alive,
                },
                live: LivePeers::new(),
            },
            events: rx,
        }
    }

    fn listing(title: &str) -> Listing {
        Listing {
            title: title.into(),
            category: "tools".into(),
            available: true,
            ..Default::default()
        }
    }

    async fn sync(a: &Node, b: &Node, profile: BearerProfile) -> (SessionReport, SessionReport) {
        let (left, right) = Connection::pair("a".into(), "b".into(), profile);
        let cancel = CancellationToken::new();
        let (ra, rb) = tokio::join!(
            run_session(&a.ctx, left, Role::Initiator, cancel.clone()),
            run_session(&b.ctx, right, Role::Responder, cancel)
        );
        (ra.unwrap(), rb.unwrap())
    }

    #[tokio::test]
    async fn test_first_contact_exchanges_snapshots() {
        let (a, b) = (node(1, false), node(2, false));
        a.ctx.documents.insert(&listing("ladder")).unwrap();
        b.ctx.documents.insert(&listing("drill")).unwrap();

        let (ra, rb) = sync(&a, &b, BearerProfile::local_network()).await;
        assert!(ra.completed && rb.completed);
        assert!(ra.first_contact && ra.snapshot_sent && ra.snapshot_received);

        for n in [&a, &b] {
            let mut titles: Vec<String> = n
                .ctx
                .documents
                .list::<Listing>()
                .into_iter()
                .map(|(_, l)| l.title)
                .collect();
            titles.sort();
            assert_eq!(titles, vec!["drill", "ladder"]);
        }
    }

    #[tokio::test]
    async fn test_constrained_bearer_sends_changes() {
        let (a, b) = (node(1, false), node(2, false));
        for i in 0..10 {
            a.ctx.documents.insert(&listing(&format!("item {}", i))).unwrap();
        }

        let (ra, rb) = sync(&a, &b, BearerProfile::long_range_mesh()).await;
        assert!(!ra.snapshot_sent);
        assert_eq!(ra.sent_changes, 10);
        assert_eq!(rb.received_changes, 10);
        assert_eq!(b.ctx.documents.list::<Listing>().len(), 10);
    }

    #[tokio::test]
    async fn test_second_contact_is_incremental() {
        let (a, b) = (node(1, false), node(2, false));
        a.ctx.documents.insert(&listing("ladder")).unwrap();
        sync(&a, &b, BearerProfile::local_network()).await;

        a.ctx.documents.insert(&listing("saw")).unwrap();
        let (ra, rb) = sync(&a, &b, BearerProfile::local_network()).await;
        assert!(!ra.first_contact && !ra.snapshot_sent);
        assert_eq!(ra.sent_changes, 1);
        assert_eq!(rb.sent_changes, 0);
        assert_eq!(b.ctx.documents.list::<Listing>().len(), 2);
    }

    #[tokio::test]
    async fn test_private_fields_stay_home() {
        let (a, b) = (node(1, false), node(2, false));
        let mut item = listing("ladder");
        item.notes = Some("behind the shed".into());
        item.location = Some("north gate".into());
        let id = a.ctx.documents.insert(&item).unwrap();

        sync(&a, &b, BearerProfile::long_range_mesh()).await;
        let received: Listing = b.ctx.documents.get(&id).unwrap();
        assert_eq!(received.title, "ladder");
        assert_eq!(received.notes, None);
        // First contact: not verified, so trusted fields are withheld too
        assert_eq!(received.location, None);
    }

    #[tokio::test]
    async fn test_bundles_are_handed_over_and_acked() {
        let (a, b) = (node(1, false), node(2, false));
        a.ctx.documents.insert(&listing("ladder")).unwrap();
        let changes = a
            .ctx
            .documents
            .changes_since(&VersionVector::new(), Audience::Community)
            .unwrap();
        let payload = a.ctx.sealer.seal_broadcast(changes).unwrap();
        let id = a
            .ctx
            .router
            .create_bundle(None, payload, Priority::Normal, Duration::from_secs(60))
            .unwrap();

        let (ra, rb) = sync(&a, &b, BearerProfile::long_range_mesh()).await;
        assert_eq!(ra.bundles_sent, 1);
        assert_eq!(rb.bundles_received, 1);
        assert!(b.ctx.router.contains(&id));
        // Acked, so the same bundle is not offered to b again
        assert!(a.ctx.router.on_peer_contact(b.ctx.identity.peer_id()).is_empty());
    }

    #[tokio::test]
    async fn test_live_mode_pushes_new_changes() {
        let (a, b) = (node(1, true), node(2, true));
        let (left, right) = Connection::pair("a".into(), "b".into(), BearerProfile::local_network());
        let cancel = CancellationToken::new();
        let mut a_events = a.ctx.events.subscribe();

        let mutate = async {
            while let Ok(event) = a_events.recv().await {
                if matches!(event, SyncEvent::SyncCompleted { .. }) {
                    break;
                }
            }
            a.ctx.documents.insert(&listing("late")).unwrap();
        };
        let (ra, rb, _) = tokio::join!(
            run_session(&a.ctx, left, Role::Initiator, cancel.clone()),
            run_session(&b.ctx, right, Role::Responder, cancel),
            mutate
        );

        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert!(ra.completed && rb.completed);
        assert_eq!(ra.sent_changes, 1);
        assert_eq!(b.ctx.documents.list::<Listing>().len(), 1);
    }

    #[tokio::test]
    async fn test_untrusted_peer_event_on_auth_failure() {
        let (a, mut b) = (node(1, false), node(2, false));
        sync(&a, &b, BearerProfile::local_network()).await;

        // b's pin for a changes, so a's next hello is refused
        let mut record = b.ctx.registry.get(a.ctx.identity.peer_id()).unwrap().unwrap();
        record.agreement_key = [1u8; 32];
        b.ctx.registry.remove(a.ctx.identity.peer_id()).unwrap();
        b.ctx.registry.record_contact(crate::peers::ContactInfo {
            peer_id: record.peer_id.clone(),
            signing_key: record.trusted_public_key,
            agreement_key: record.agreement_key,
            display_name: None,
            transports: vec![],
        })
        .unwrap();

        let (left, right) = Connection::pair("a".into(), "b".into(), BearerProfile::local_network());
        let cancel = CancellationToken::new();
        let (ra, rb) = tokio::join!(
            run_session(&a.ctx, left, Role::Initiator, cancel.clone()),
            run_session(&b.ctx, right, Role::Responder, cancel)
        );
        assert!(matches!(ra, Err(SyncError::Authentication(_))));
        assert!(matches!(rb, Err(SyncError::Authentication(_))));

        let mut untrusted = false;
        while let Ok(event) = b.events.try_recv() {
            if matches!(event, SyncEvent::UntrustedPeer { .. }) {
                untrusted = true;
            }
        }
        assert!(untrusted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let a = node(1, false);
        let (left, _right) = Connection::pair("a".into(), "b".into(), BearerProfile::local_network());
        let err = run_session(&a.ctx, left, Role::Initiator, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Transport(TransportError::Timeout(_))));
    }
}
