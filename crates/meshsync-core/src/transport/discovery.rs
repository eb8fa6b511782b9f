//! Per-bearer discovery loop
//!
//! Each bearer gets its own long-running loop. All loops share one
//! [`KnownPeers`] set, so restarting a loop (or running the same bearer kind
//! twice) never hands out a candidate that is already being dialed or is
//! already connected. Failed candidates back off on a Fibonacci schedule.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Bearer, BearerKind, DiscoveredPeer, PeerAddress, TransportError};

/// Retry schedule for discovered candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Unit multiplied by the Fibonacci number of consecutive failures.
    pub base: Duration,
    /// Ceiling on any single delay.
    pub max: Duration,
    /// Wait after a finished session before contacting the same peer again.
    pub revisit: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(300),
            revisit: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    ///
    /// Sequence in units of `base`: 1, 1, 2, 3, 5, 8, ... capped at `max`.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.revisit;
        }
        let fib = fibonacci(failures - 1);
        let delay = self.base.saturating_mul(u32::try_from(fib).unwrap_or(u32::MAX));
        delay.min(self.max)
    }
}

/// F(0) = 1, F(1) = 1, F(n) = F(n-1) + F(n-2)
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    // F(93) already saturates u64
    for _ in 0..n.min(93) {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

#[derive(Debug, Clone, Default)]
struct CandidateState {
    failures: u32,
    last_attempt: Option<Instant>,
    in_flight: bool,
    connected: bool,
}

type CandidateKey = (BearerKind, PeerAddress);

/// Candidates seen by any discovery loop, with their retry state.
#[derive(Debug, Clone, Default)]
pub struct KnownPeers {
    inner: Arc<Mutex<HashMap<CandidateKey, CandidateState>>>,
}

impl KnownPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `peer` for a dial attempt. Returns false while the peer is
    /// connected, being dialed, or still backing off.
    pub fn claim(&self, peer: &DiscoveredPeer, policy: &BackoffPolicy) -> bool {
        let now = Instant::now();
        let mut map = self.inner.lock();
        let state = map
            .entry((peer.bearer, peer.address.clone()))
            .or_default();
        if state.in_flight || state.connected {
            return false;
        }
        if let Some(last) = state.last_attempt {
            if now.duration_since(last) < policy.delay(state.failures) {
                return false;
            }
        }
        state.in_flight = true;
        state.last_attempt = Some(now);
        true
    }

    /// The dial (or an inbound connection) succeeded.
    pub fn record_connected(&self, bearer: BearerKind, address: &PeerAddress) {
        let mut map = self.inner.lock();
        let state = map.entry((bearer, address.clone())).or_default();
        state.failures = 0;
        state.in_flight = false;
        state.connected = true;
    }

    pub fn record_failure(&self, bearer: BearerKind, address: &PeerAddress) {
        let mut map = self.inner.lock();
        let state = map.entry((bearer, address.clone())).or_default();
        state.failures = state.failures.saturating_add(1);
        state.in_flight = false;
        state.last_attempt = Some(Instant::now());
    }

    /// The session with this peer ended; it becomes eligible again after the
    /// revisit delay.
    pub fn record_disconnected(&self, bearer: BearerKind, address: &PeerAddress) {
        let mut map = self.inner.lock();
        if let Some(state) = map.get_mut(&(bearer, address.clone())) {
            state.connected = false;
            state.in_flight = false;
            state.last_attempt = Some(Instant::now());
        }
    }

    pub fn is_connected(&self, bearer: BearerKind, address: &PeerAddress) -> bool {
        self.inner
            .lock()
            .get(&(bearer, address.clone()))
            .is_some_and(|s| s.connected)
    }

    pub fn failures(&self, bearer: BearerKind, address: &PeerAddress) -> u32 {
        self.inner
            .lock()
            .get(&(bearer, address.clone()))
            .map_or(0, |s| s.failures)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Repeated discovery over one bearer.
pub struct DiscoveryLoop {
    bearer: Arc<dyn Bearer>,
    known: KnownPeers,
    policy: BackoffPolicy,
    interval: Duration,
}

impl DiscoveryLoop {
    pub fn new(
        bearer: Arc<dyn Bearer>,
        known: KnownPeers,
        policy: BackoffPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            bearer,
            known,
            policy,
            interval,
        }
    }

    /// Run one discovery cycle and forward every claimable candidate.
    pub async fn run_cycle(
        &self,
        out: &mpsc::Sender<DiscoveredPeer>,
    ) -> Result<usize, TransportError> {
        let mut candidates = self.bearer.discover().await?;
        let mut emitted = 0;
        while let Some(peer) = candidates.next().await {
            if !self.known.claim(&peer, &self.policy) {
                continue;
            }
            debug!(bearer = %peer.bearer, address = %peer.address, "Discovered candidate");
            if out.send(peer).await.is_err() {
                return Err(TransportError::Closed);
            }
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Loop until `cancel` fires or the receiver goes away.
    pub async fn run(self, out: mpsc::Sender<DiscoveredPeer>, cancel: CancellationToken) {
        let kind = self.bearer.profile().kind;
        info!(bearer = %kind, interval = ?self.interval, "Discovery loop started");

        loop {
            match self.run_cycle(&out).await {
                Ok(_) => {}
                Err(TransportError::Closed) => break,
                Err(e) => warn!(bearer = %kind, error = %e, "Discovery cycle failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(bearer = %kind, "Discovery loop stopped");
    }

    pub fn spawn(
        self,
        out: mpsc::Sender<DiscoveredPeer>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(out, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{BearerProfile, MemoryMedium};

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(10),
            revisit: Duration::from_secs(30),
        }
    }

    fn candidate(addr: &str) -> DiscoveredPeer {
        DiscoveredPeer {
            address: addr.into(),
            bearer: BearerKind::Proximity,
            peer_hint: None,
        }
    }

    #[test]
    fn test_fibonacci_backoff_progression() {
        let p = policy();
        let secs: Vec<u64> = (1..=7).map(|n| p.delay(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 1, 2, 3, 5, 8, 10]);
        assert_eq!(p.delay(0), Duration::from_secs(30));
        assert_eq!(p.delay(u32::MAX), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_is_exclusive_until_released() {
        let known = KnownPeers::new();
        let peer = candidate("b");
        assert!(known.claim(&peer, &policy()));
        assert!(!known.claim(&peer, &policy()));

        known.record_connected(peer.bearer, &peer.address);
        assert!(known.is_connected(peer.bearer, &peer.address));
        assert!(!known.claim(&peer, &policy()));

        known.record_disconnected(peer.bearer, &peer.address);
        assert!(!known.claim(&peer, &policy()));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(known.claim(&peer, &policy()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_back_off() {
        let known = KnownPeers::new();
        let peer = candidate("b");
        assert!(known.claim(&peer, &policy()));
        known.record_failure(peer.bearer, &peer.address);
        known.record_failure(peer.bearer, &peer.address);
        known.record_failure(peer.bearer, &peer.address);
        assert_eq!(known.failures(peer.bearer, &peer.address), 3);

        assert!(!known.claim(&peer, &policy()));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(known.claim(&peer, &policy()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_loop_does_not_duplicate_candidates() {
        let medium = MemoryMedium::new(BearerProfile::proximity());
        let a: Arc<dyn Bearer> = Arc::new(medium.bearer("a", None));
        let _b = medium.bearer("b", None);
        let _c = medium.bearer("c", None);
        medium.link_all();

        let known = KnownPeers::new();
        let (tx, mut rx) = mpsc::channel(8);

        let first = DiscoveryLoop::new(a.clone(), known.clone(), policy(), Duration::from_secs(1));
        assert_eq!(first.run_cycle(&tx).await.unwrap(), 2);

        let restarted = DiscoveryLoop::new(a, known.clone(), policy(), Duration::from_secs(1));
        assert_eq!(restarted.run_cycle(&tx).await.unwrap(), 0);

        drop(tx);
        let mut seen = Vec::new();
        while let Some(peer) = rx.recv().await {
            seen.push(peer.address);
        }
        assert_eq!(seen, vec![PeerAddress::from("b"), PeerAddress::from("c")]);
        assert_eq!(known.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_cancel() {
        let medium = MemoryMedium::new(BearerProfile::long_range_mesh());
        let a: Arc<dyn Bearer> = Arc::new(medium.bearer("a", None));
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = DiscoveryLoop::new(a, KnownPeers::new(), policy(), Duration::from_secs(5))
            .spawn(tx, cancel.clone());
        tokio::time::advance(Duration::from_secs(12)).await;
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_permission_denied_cycle_reports_error() {
        let medium = MemoryMedium::new(BearerProfile::proximity());
        let a: Arc<dyn Bearer> = Arc::new(medium.bearer("a", None));
        medium.set_permission_denied(&"a".into(), true);
        let (tx, _rx) = mpsc::channel(8);

        let discovery = DiscoveryLoop::new(a, KnownPeers::new(), policy(), Duration::from_secs(1));
        assert!(matches!(
            discovery.run_cycle(&tx).await,
            Err(TransportError::PermissionDenied(_))
        ));
    }
}
