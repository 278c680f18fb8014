use std::collections::BTreeMap;

use crate::ids::ReplicaId;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Counters observed from one replica: a contiguous prefix `1..=frontier`
/// followed by disjoint inclusive ranges for anything that arrived past a hole.
///
/// Invariant: `ranges` is sorted, non-adjacent, and every range starts above
/// `frontier + 1`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
struct SeenCounters {
    frontier: u64,
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Vec::is_empty"))]
    ranges: Vec<(u64, u64)>,
}

impl SeenCounters {
    fn max_seen(&self) -> u64 {
        self.ranges.last().map_or(self.frontier, |&(_, end)| end)
    }

    fn contains(&self, counter: u64) -> bool {
        if counter == 0 {
            return false;
        }
        if counter <= self.frontier {
            return true;
        }
        let idx = self.ranges.partition_point(|&(_, end)| end < counter);
        self.ranges
            .get(idx)
            .is_some_and(|&(start, _)| start <= counter)
    }

    fn observe(&mut self, counter: u64) {
        if self.contains(counter) || counter == 0 {
            return;
        }
        self.insert_range(counter, counter);
    }

    /// Insert `[start, end]` and restore the invariant.
    fn insert_range(&mut self, start: u64, end: u64) {
        if start == 0 || start > end || end <= self.frontier {
            return;
        }
        let start = start.max(self.frontier.saturating_add(1));

        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut pending = (start, end);
        let mut placed = false;
        for &(s, e) in &self.ranges {
            if placed || e.saturating_add(1) < pending.0 {
                merged.push((s, e));
            } else if pending.1.saturating_add(1) < s {
                merged.push(pending);
                merged.push((s, e));
                placed = true;
            } else {
                pending = (pending.0.min(s), pending.1.max(e));
            }
        }
        if !placed {
            merged.push(pending);
        }
        self.ranges = merged;
        self.absorb_into_frontier();
    }

    fn absorb_into_frontier(&mut self) {
        while let Some(&(start, end)) = self.ranges.first() {
            if start > self.frontier.saturating_add(1) {
                break;
            }
            self.frontier = self.frontier.max(end);
            self.ranges.remove(0);
        }
    }

    fn covers(&self, start: u64, end: u64) -> bool {
        if end <= self.frontier {
            return true;
        }
        if start <= self.frontier {
            return false;
        }
        let idx = self.ranges.partition_point(|&(_, e)| e < start);
        self.ranges
            .get(idx)
            .is_some_and(|&(s, e)| s <= start && e >= end)
    }

    fn is_superset_of(&self, other: &SeenCounters) -> bool {
        self.frontier >= other.frontier
            && other.ranges.iter().all(|&(s, e)| self.covers(s, e))
    }

    fn union(&mut self, other: &SeenCounters) {
        if other.frontier > self.frontier {
            self.frontier = other.frontier;
            let ranges = std::mem::take(&mut self.ranges);
            for (s, e) in ranges {
                self.insert_range(s, e);
            }
            self.absorb_into_frontier();
        }
        for &(s, e) in &other.ranges {
            self.insert_range(s, e);
        }
    }
}

/// Gap-aware state vector keyed by per-replica operation counters.
///
/// Exchanged during resync: each side sends only what the other side's vector
/// does not contain. Holes are tracked explicitly so an operation that arrived
/// early never hides an earlier one that is still missing.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VersionVector {
    entries: BTreeMap<ReplicaId, SeenCounters>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, replica: &ReplicaId, counter: u64) {
        if counter == 0 {
            return;
        }
        self.entries
            .entry(replica.clone())
            .or_default()
            .observe(counter);
    }

    pub fn contains(&self, replica: &ReplicaId, counter: u64) -> bool {
        self.entries
            .get(replica)
            .is_some_and(|seen| seen.contains(counter))
    }

    pub fn merge(&mut self, other: &VersionVector) {
        for (replica, seen) in &other.entries {
            self.entries.entry(replica.clone()).or_default().union(seen);
        }
    }

    pub fn is_aware_of(&self, other: &VersionVector) -> bool {
        other.entries.iter().all(|(replica, seen)| {
            self.entries
                .get(replica)
                .map_or(seen.frontier == 0 && seen.ranges.is_empty(), |mine| {
                    mine.is_superset_of(seen)
                })
        })
    }

    /// Highest counter observed for `replica`, or 0. Not gap-aware; use
    /// [`VersionVector::frontier`] for the contiguous prefix.
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.entries.get(replica).map_or(0, SeenCounters::max_seen)
    }

    pub fn frontier(&self, replica: &ReplicaId) -> u64 {
        self.entries.get(replica).map_or(0, |seen| seen.frontier)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn replicas(&self) -> impl Iterator<Item = &ReplicaId> {
        self.entries.keys()
    }

    pub fn entries(&self) -> BTreeMap<ReplicaId, u64> {
        self.entries
            .iter()
            .map(|(replica, seen)| (replica.clone(), seen.max_seen()))
            .collect()
    }
}
