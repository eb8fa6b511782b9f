//! Version vectors over per-replica change sequences
//!
//! Changes can arrive out of order over store-and-forward paths, so each
//! replica entry is a contiguous prefix `1..=contiguous` plus a sparse set of
//! sequence numbers seen beyond it. The set collapses back into the prefix as
//! gaps fill.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{ChangeId, ReplicaId};

/// Sequence numbers seen from one replica
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqRange {
    pub contiguous: u64,
    pub extras: BTreeSet<u64>,
}

impl SeqRange {
    pub fn contains(&self, seq: u64) -> bool {
        seq <= self.contiguous || self.extras.contains(&seq)
    }

    /// Returns `false` if already present.
    pub fn insert(&mut self, seq: u64) -> bool {
        if self.contains(seq) {
            return false;
        }
        if seq == self.contiguous + 1 {
            self.contiguous = seq;
            while self.extras.remove(&(self.contiguous + 1)) {
                self.contiguous += 1;
            }
        } else {
            self.extras.insert(seq);
        }
        true
    }

    pub fn merge(&mut self, other: &SeqRange) {
        if other.contiguous > self.contiguous {
            self.contiguous = other.contiguous;
            self.extras.retain(|s| *s > other.contiguous);
            while self.extras.remove(&(self.contiguous + 1)) {
                self.contiguous += 1;
            }
        }
        for seq in &other.extras {
            self.insert(*seq);
        }
    }

    /// Highest sequence seen.
    pub fn max(&self) -> u64 {
        self.extras
            .iter()
            .next_back()
            .copied()
            .unwrap_or(self.contiguous)
            .max(self.contiguous)
    }

    /// Sequences in `self` that `other` lacks.
    pub fn missing_from(&self, other: &SeqRange) -> Vec<u64> {
        let mut missing: Vec<u64> = (other.contiguous + 1..=self.contiguous)
            .filter(|s| !other.extras.contains(s))
            .collect();
        missing.extend(self.extras.iter().filter(|s| !other.contains(**s)));
        missing
    }

    pub fn has_gaps(&self) -> bool {
        !self.extras.is_empty()
    }
}

/// Per-replica summary of every change reflected in a document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    replicas: BTreeMap<ReplicaId, SeqRange>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &ChangeId) -> bool {
        self.replicas
            .get(&id.replica)
            .is_some_and(|range| range.contains(id.seq))
    }

    /// Record a change id. Returns `false` if it was already present.
    pub fn insert(&mut self, id: &ChangeId) -> bool {
        self.replicas
            .entry(id.replica.clone())
            .or_default()
            .insert(id.seq)
    }

    pub fn merge(&mut self, other: &VersionVector) {
        for (replica, range) in &other.replicas {
            self.replicas.entry(replica.clone()).or_default().merge(range);
        }
    }

    /// Highest sequence seen from `replica` (0 if none).
    pub fn max_seq(&self, replica: &ReplicaId) -> u64 {
        self.replicas.get(replica).map(SeqRange::max).unwrap_or(0)
    }

    /// Change ids present here and absent from `other`.
    pub fn missing_from(&self, other: &VersionVector) -> Vec<ChangeId> {
        let empty = SeqRange::default();
        let mut missing = Vec::new();
        for (replica, range) in &self.replicas {
            let theirs = other.replicas.get(replica).unwrap_or(&empty);
            missing.extend(range.missing_from(theirs).into_iter().map(|seq| ChangeId {
                replica: replica.clone(),
                seq,
            }));
        }
        missing
    }

    /// Whether `self` has seen everything `other` has.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other.missing_from(self).is_empty()
    }

    pub fn has_gaps(&self) -> bool {
        self.replicas.values().any(SeqRange::has_gaps)
    }

    /// Total number of changes summarised.
    pub fn len(&self) -> u64 {
        self.replicas
            .values()
            .map(|r| r.contiguous + r.extras.len() as u64)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &SeqRange)> {
        self.replicas.iter()
    }
}
