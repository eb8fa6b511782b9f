//! Capacity-bounded bundle set
//!
//! Pure in-memory bookkeeping. The router persists every change before
//! applying it here, so insertion is split into [`BundleStore::plan_insert`]
//! (decide what to evict) and [`BundleStore::insert_planned`].

use std::collections::HashMap;

use crate::error::SyncError;
use crate::identity::Did;

use super::{Bundle, BundleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_bundles: usize,
    pub max_bytes: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_bundles: 512,
            max_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Default)]
pub struct BundleStore {
    limits: StoreLimits,
    bundles: HashMap<BundleId, Bundle>,
    bytes: usize,
}

impl BundleStore {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            bundles: HashMap::new(),
            bytes: 0,
        }
    }

    /// Rebuild from persisted bundles. Limits are enforced on the next insert.
    pub fn restore(limits: StoreLimits, bundles: Vec<Bundle>) -> Self {
        let mut store = Self::new(limits);
        for bundle in bundles {
            store.bytes += bundle.footprint();
            store.bundles.insert(bundle.id.clone(), bundle);
        }
        store
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn get(&self, id: &BundleId) -> Option<&Bundle> {
        self.bundles.get(id)
    }

    pub fn contains(&self, id: &BundleId) -> bool {
        self.bundles.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bundle> {
        self.bundles.values()
    }

    /// Ids that must be evicted to make room for `bundle`, lowest rank
    /// first.
    ///
    /// Fails with [`SyncError::CapacityExceeded`] when the bundle can never
    /// fit, or when making room would evict something ranked above it.
    pub fn plan_insert(&self, bundle: &Bundle) -> Result<Vec<BundleId>, SyncError> {
        let footprint = bundle.footprint();
        let replaced = self.bundles.get(&bundle.id).map_or(0, Bundle::footprint);
        if self.limits.max_bundles == 0 || footprint > self.limits.max_bytes {
            return Err(SyncError::CapacityExceeded(format!(
                "Bundle {} ({} bytes) exceeds store limits",
                bundle.id, footprint
            )));
        }

        let extra_slot = usize::from(!self.bundles.contains_key(&bundle.id));
        let mut count = self.bundles.len() + extra_slot;
        let mut bytes = self.bytes - replaced + footprint;
        if count <= self.limits.max_bundles && bytes <= self.limits.max_bytes {
            return Ok(Vec::new());
        }

        let mut victims: Vec<&Bundle> = self
            .bundles
            .values()
            .filter(|b| b.id != bundle.id)
            .collect();
        victims.sort_by(|a, b| a.rank().cmp(&b.rank()).then_with(|| a.id.cmp(&b.id)));

        let mut evicted = Vec::new();
        for victim in victims {
            if count <= self.limits.max_bundles && bytes <= self.limits.max_bytes {
                break;
            }
            if victim.rank() >= bundle.rank() {
                break;
            }
            count -= 1;
            bytes -= victim.footprint();
            evicted.push(victim.id.clone());
        }

        if count <= self.limits.max_bundles && bytes <= self.limits.max_bytes {
            Ok(evicted)
        } else {
            Err(SyncError::CapacityExceeded(format!(
                "No room for {} bundle {}",
                bundle.priority, bundle.id
            )))
        }
    }

    /// Apply a plan from [`BundleStore::plan_insert`].
    pub(crate) fn insert_planned(&mut self, bundle: Bundle, evicted: &[BundleId]) {
        for id in evicted {
            self.remove(id);
        }
        if let Some(old) = self.bundles.remove(&bundle.id) {
            self.bytes -= old.footprint();
        }
        self.bytes += bundle.footprint();
        self.bundles.insert(bundle.id.clone(), bundle);
    }

    pub(crate) fn remove(&mut self, id: &BundleId) -> Option<Bundle> {
        let removed = self.bundles.remove(id)?;
        self.bytes -= removed.footprint();
        Some(removed)
    }

    /// Bundles past their expiry or out of hops.
    pub fn stale(&self, now: u64) -> Vec<BundleId> {
        self.bundles
            .values()
            .filter(|b| b.is_expired(now) || b.hops_exhausted())
            .map(|b| b.id.clone())
            .collect()
    }

    /// Stored bundles that may be handed to `peer`, highest priority first
    /// and oldest first within a priority.
    pub fn forwardable_to(&self, peer: &Did, now: u64) -> Vec<&Bundle> {
        let mut out: Vec<&Bundle> = self
            .bundles
            .values()
            .filter(|b| b.can_forward_to(peer, now))
            .collect();
        out.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtn::Priority;
    use std::time::Duration;

    fn did(n: u8) -> Did {
        Did::from_signing_key(&[n; 32])
    }

    fn bundle(seq: u64, priority: Priority, created_at: u64) -> Bundle {
        Bundle::new(
            BundleId { origin: did(1), seq },
            None,
            vec![0u8; 100],
            priority,
            Duration::from_secs(3600),
            4,
            created_at,
        )
    }

    fn store_with(limits: StoreLimits, bundles: Vec<Bundle>) -> BundleStore {
        let mut store = BundleStore::new(limits);
        for b in bundles {
            let plan = store.plan_insert(&b).unwrap();
            store.insert_planned(b, &plan);
        }
        store
    }

    fn count_limit(n: usize) -> StoreLimits {
        StoreLimits {
            max_bundles: n,
            max_bytes: usize::MAX,
        }
    }

    #[test]
    fn test_room_needs_no_eviction() {
        let store = store_with(count_limit(3), vec![bundle(1, Priority::Low, 1)]);
        assert!(store.plan_insert(&bundle(2, Priority::Low, 2)).unwrap().is_empty());
        assert_eq!(store.len(), 1);
        assert_eq!(store.bytes(), bundle(1, Priority::Low, 1).footprint());
    }

    #[test]
    fn test_critical_evicts_oldest_low() {
        let store = store_with(
            count_limit(3),
            vec![
                bundle(1, Priority::Normal, 1),
                bundle(2, Priority::Low, 5),
                bundle(3, Priority::Low, 2),
            ],
        );
        let plan = store.plan_insert(&bundle(4, Priority::Critical, 9)).unwrap();
        assert_eq!(plan, vec![bundle(3, Priority::Low, 2).id]);
    }

    #[test]
    fn test_lower_ranked_newcomer_is_refused() {
        let store = store_with(
            count_limit(2),
            vec![bundle(1, Priority::High, 1), bundle(2, Priority::High, 2)],
        );
        assert!(matches!(
            store.plan_insert(&bundle(3, Priority::Low, 10)),
            Err(SyncError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_byte_limit_evicts_several() {
        let one = bundle(1, Priority::Low, 1).footprint();
        let limits = StoreLimits {
            max_bundles: 10,
            max_bytes: one * 3,
        };
        let store = store_with(
            limits,
            vec![
                bundle(1, Priority::Low, 1),
                bundle(2, Priority::Low, 2),
                bundle(3, Priority::Normal, 3),
            ],
        );
        let mut big = bundle(4, Priority::High, 4);
        big.payload = vec![0u8; 150];
        let plan = store.plan_insert(&big).unwrap();
        assert_eq!(
            plan,
            vec![bundle(1, Priority::Low, 1).id, bundle(2, Priority::Low, 2).id]
        );
    }

    #[test]
    fn test_oversized_bundle_is_refused() {
        let store = BundleStore::new(StoreLimits {
            max_bundles: 10,
            max_bytes: 50,
        });
        assert!(store.plan_insert(&bundle(1, Priority::Critical, 1)).is_err());
    }

    #[test]
    fn test_replacing_same_id_keeps_accounting() {
        let mut store = store_with(count_limit(1), vec![bundle(1, Priority::Low, 1)]);
        let mut updated = bundle(1, Priority::Low, 1);
        updated.record_visit(&did(7));
        let plan = store.plan_insert(&updated).unwrap();
        assert!(plan.is_empty());
        store.insert_planned(updated.clone(), &plan);
        assert_eq!(store.len(), 1);
        assert_eq!(store.bytes(), updated.footprint());
    }

    #[test]
    fn test_forwarding_order_and_filter() {
        let mut visited = bundle(4, Priority::Critical, 1);
        visited.record_visit(&did(2));
        let store = store_with(
            count_limit(10),
            vec![
                bundle(1, Priority::Low, 1),
                bundle(2, Priority::High, 5),
                bundle(3, Priority::High, 3),
                visited,
            ],
        );
        let order: Vec<u64> = store
            .forwardable_to(&did(2), 10)
            .iter()
            .map(|b| b.id.seq)
            .collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn test_stale_finds_expired_and_exhausted() {
        let mut exhausted = bundle(2, Priority::Normal, 0);
        exhausted.hop_count = exhausted.max_hops;
        let store = store_with(
            count_limit(10),
            vec![bundle(1, Priority::Normal, 0), exhausted],
        );
        assert_eq!(store.stale(10), vec![bundle(2, Priority::Normal, 0).id]);
        assert_eq!(store.stale(3_600_000).len(), 2);
    }
}
