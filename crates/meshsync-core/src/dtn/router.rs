//! Flood-limited epidemic routing
//!
//! Every stored bundle is offered to each newly contacted peer that is not in
//! its path history, until its hop budget or lifetime runs out. Delivery is
//! at-least-once; the delivered ledger absorbs repeats.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::identity::Did;
use crate::storage::Storage;
use crate::types::now_millis;

use super::store::{BundleStore, StoreLimits};
use super::{Bundle, BundleId, Priority};

/// Longest a bundle or its ledger entry is kept, whatever expiry the
/// sender claims.
pub const MAX_BUNDLE_LIFETIME: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Delivered ledger size before the earliest-expiring entries are dropped.
pub const MAX_DELIVERED_ENTRIES: usize = 65_536;

/// What happened to a bundle handed over by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Addressed to this node and not seen before. `relay` is true when a
    /// copy was also kept for forwarding.
    Deliver { bundle: Bundle, relay: bool },
    /// Kept for forwarding only.
    Relay { evicted: Vec<BundleId> },
    /// Already stored or already delivered.
    Duplicate,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Expired,
    /// Out of hops and not addressed to this node.
    HopsExhausted,
    /// No room without evicting higher-ranked bundles.
    Capacity,
}

#[derive(Debug, Default)]
struct RouterState {
    store: BundleStore,
    /// Bundle id -> unix millis after which the entry can be forgotten
    delivered: HashMap<BundleId, u64>,
}

/// Store-and-forward router for one node.
pub struct BundleRouter {
    local: Did,
    storage: Storage,
    max_hops: u16,
    max_delivered: usize,
    state: Mutex<RouterState>,
}

impl std::fmt::Debug for BundleRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BundleRouter")
            .field("local", &self.local.short())
            .field("stored", &state.store.len())
            .field("delivered", &state.delivered.len())
            .finish()
    }
}

impl BundleRouter {
    /// Load stored bundles and the delivered ledger.
    pub fn open(
        storage: Storage,
        local: Did,
        limits: StoreLimits,
        max_hops: u16,
    ) -> SyncResult<Self> {
        let bundles = storage.load_bundles()?;
        let delivered: HashMap<BundleId, u64> = storage.load_delivered()?.into_iter().collect();
        info!(
            stored = bundles.len(),
            delivered = delivered.len(),
            "Bundle router opened"
        );
        Ok(Self {
            local,
            storage,
            max_hops,
            max_delivered: MAX_DELIVERED_ENTRIES,
            state: Mutex::new(RouterState {
                store: BundleStore::restore(limits, bundles),
                delivered,
            }),
        })
    }

    pub fn local(&self) -> &Did {
        &self.local
    }

    /// Wrap `payload` in a new bundle originating here and store it for
    /// forwarding. `destination: None` broadcasts to the community.
    pub fn create_bundle(
        &self,
        destination: Option<Did>,
        payload: Vec<u8>,
        priority: Priority,
        ttl: Duration,
    ) -> SyncResult<BundleId> {
        self.create_bundle_bypassing(destination, payload, priority, ttl, &[])
    }

    /// Like [`create_bundle`](Self::create_bundle), with `reached` already
    /// in the path history so the bundle is never offered to them.
    pub fn create_bundle_bypassing(
        &self,
        destination: Option<Did>,
        payload: Vec<u8>,
        priority: Priority,
        ttl: Duration,
        reached: &[Did],
    ) -> SyncResult<BundleId> {
        let now = now_millis();
        let seq = self.storage.next_bundle_seq()?;
        let id = BundleId {
            origin: self.local.clone(),
            seq,
        };
        let mut bundle =
            Bundle::new(id.clone(), destination, payload, priority, ttl, self.max_hops, now);
        for peer in reached {
            bundle.record_visit(peer);
        }

        let mut state = self.state.lock();
        let evicted = state.store.plan_insert(&bundle)?;
        self.storage
            .put_bundle(&bundle, &evicted, Some(bundle.expires_at))?;
        log_evictions(&evicted, &bundle);
        state.delivered.insert(id.clone(), bundle.expires_at);
        state.store.insert_planned(bundle, &evicted);
        self.trim_ledger(&mut state)?;

        debug!(bundle = %id, %priority, "Bundle created");
        Ok(id)
    }

    /// Copies of every stored bundle `peer` may receive, in forwarding order.
    /// Each copy already carries the extra hop and `peer` in its path.
    pub fn on_peer_contact(&self, peer: &Did) -> Vec<Bundle> {
        let now = now_millis();
        let state = self.state.lock();
        state
            .store
            .forwardable_to(peer, now)
            .into_iter()
            .map(|b| b.forwarded_to(peer))
            .collect()
    }

    /// Take a bundle forwarded by `from`.
    pub fn accept_bundle(&self, bundle: Bundle, from: &Did) -> SyncResult<AcceptOutcome> {
        let now = now_millis();
        if bundle.is_expired(now) {
            debug!(bundle = %bundle.id, "Dropping expired bundle");
            return Ok(AcceptOutcome::Dropped(DropReason::Expired));
        }

        let mut bundle = bundle;
        bundle.expires_at = bundle
            .expires_at
            .min(now.saturating_add(MAX_BUNDLE_LIFETIME.as_millis() as u64));
        bundle.record_visit(from);
        bundle.record_visit(&self.local);

        let mut state = self.state.lock();

        if let Some(stored) = state.store.get(&bundle.id) {
            let mut merged = stored.clone();
            merged.merge_visited(&bundle);
            if merged.visited.len() != stored.visited.len() {
                self.storage.put_bundle(&merged, &[], None)?;
                state.store.insert_planned(merged, &[]);
            }
            return Ok(AcceptOutcome::Duplicate);
        }
        if state.delivered.contains_key(&bundle.id) || bundle.source == self.local {
            return Ok(AcceptOutcome::Duplicate);
        }

        let deliver = bundle.is_addressed_to(&self.local);
        let only_for_us = bundle.destination.as_ref() == Some(&self.local);
        let relay = !only_for_us && !bundle.hops_exhausted();

        if !relay {
            self.storage
                .record_delivered(&bundle.id, bundle.expires_at, false)?;
            state.delivered.insert(bundle.id.clone(), bundle.expires_at);
            self.trim_ledger(&mut state)?;
            return Ok(if deliver {
                AcceptOutcome::Deliver {
                    bundle,
                    relay: false,
                }
            } else {
                debug!(bundle = %bundle.id, "Dropping bundle out of hops");
                AcceptOutcome::Dropped(DropReason::HopsExhausted)
            });
        }

        let evicted = match state.store.plan_insert(&bundle) {
            Ok(evicted) => evicted,
            Err(SyncError::CapacityExceeded(reason)) => {
                warn!(bundle = %bundle.id, %reason, "Bundle store full");
                self.storage
                    .record_delivered(&bundle.id, bundle.expires_at, false)?;
                state.delivered.insert(bundle.id.clone(), bundle.expires_at);
                self.trim_ledger(&mut state)?;
                return Ok(if deliver {
                    AcceptOutcome::Deliver {
                        bundle,
                        relay: false,
                    }
                } else {
                    AcceptOutcome::Dropped(DropReason::Capacity)
                });
            }
            Err(e) => return Err(e),
        };

        self.storage
            .put_bundle(&bundle, &evicted, Some(bundle.expires_at))?;
        log_evictions(&evicted, &bundle);
        state.delivered.insert(bundle.id.clone(), bundle.expires_at);
        state.store.insert_planned(bundle.clone(), &evicted);
        self.trim_ledger(&mut state)?;

        Ok(if deliver {
            AcceptOutcome::Deliver {
                bundle,
                relay: true,
            }
        } else {
            AcceptOutcome::Relay { evicted }
        })
    }

    /// `peer` acknowledged receipt of `ids`. Unicast bundles destined to it
    /// are done; everything else remembers that `peer` holds a copy.
    pub fn mark_delivered(&self, peer: &Did, ids: &[BundleId]) -> SyncResult<usize> {
        let mut state = self.state.lock();
        let mut finished = 0;
        for id in ids {
            let Some(stored) = state.store.get(id) else {
                continue;
            };
            if stored.destination.as_ref() == Some(peer) {
                self.storage
                    .record_delivered(id, stored.expires_at, true)?;
                state.store.remove(id);
                finished += 1;
                debug!(bundle = %id, peer = %peer.short(), "Bundle delivered");
            } else if !stored.has_visited(peer) {
                let mut updated = stored.clone();
                updated.record_visit(peer);
                self.storage.put_bundle(&updated, &[], None)?;
                state.store.insert_planned(updated, &[]);
            }
        }
        Ok(finished)
    }

    /// Purge bundles past expiry or out of hops, and ledger entries past
    /// their retention. Returns the number of bundles purged.
    pub fn expire(&self) -> SyncResult<usize> {
        self.expire_at(now_millis())
    }

    pub(crate) fn expire_at(&self, now: u64) -> SyncResult<usize> {
        let mut state = self.state.lock();
        let stale = state.store.stale(now);
        let forgotten: Vec<BundleId> = state
            .delivered
            .iter()
            .filter(|(_, forget_after)| **forget_after <= now)
            .map(|(id, _)| id.clone())
            .collect();
        if stale.is_empty() && forgotten.is_empty() {
            return Ok(0);
        }

        self.storage.purge_bundles(&stale, &forgotten)?;
        for id in &stale {
            state.store.remove(id);
        }
        for id in &forgotten {
            state.delivered.remove(id);
        }
        debug!(
            bundles = stale.len(),
            ledger = forgotten.len(),
            "Expired bundles"
        );
        Ok(stale.len())
    }

    /// Drop the earliest-expiring ledger entries once over the cap, leaving
    /// a tenth of headroom. Stored bundles keep their entries.
    fn trim_ledger(&self, state: &mut RouterState) -> SyncResult<()> {
        if state.delivered.len() <= self.max_delivered {
            return Ok(());
        }
        let keep = self.max_delivered - self.max_delivered / 10;
        let mut by_expiry: Vec<(u64, BundleId)> = state
            .delivered
            .iter()
            .filter(|(id, _)| state.store.get(id).is_none())
            .map(|(id, forget_after)| (*forget_after, id.clone()))
            .collect();
        by_expiry.sort();
        let excess = state.delivered.len().saturating_sub(keep);
        let dropped: Vec<BundleId> = by_expiry
            .into_iter()
            .take(excess)
            .map(|(_, id)| id)
            .collect();

        self.storage.purge_bundles(&[], &dropped)?;
        for id in &dropped {
            state.delivered.remove(id);
        }
        debug!(dropped = dropped.len(), "Trimmed delivered ledger");
        Ok(())
    }

    /// Periodic expiry sweep until `cancel` fires.
    pub async fn run_expiry(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.expire() {
                        warn!(error = %e, "Bundle expiry sweep failed");
                    }
                }
            }
        }
        debug!("Bundle expiry task stopped");
    }

    pub fn contains(&self, id: &BundleId) -> bool {
        self.state.lock().store.contains(id)
    }

    pub fn is_delivered(&self, id: &BundleId) -> bool {
        self.state.lock().delivered.contains_key(id)
    }

    /// Stored bundles, highest priority first.
    pub fn bundles(&self) -> Vec<Bundle> {
        let state = self.state.lock();
        let mut out: Vec<Bundle> = state.store.iter().cloned().collect();
        out.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    pub fn stored_len(&self) -> usize {
        self.state.lock().store.len()
    }

    pub fn stored_bytes(&self) -> usize {
        self.state.lock().store.bytes()
    }
}

fn log_evictions(evicted: &[BundleId], incoming: &Bundle) {
    for id in evicted {
        info!(
            evicted = %id,
            incoming = %incoming.id,
            priority = %incoming.priority,
            "Evicted bundle to make room"
        );
    }
}
