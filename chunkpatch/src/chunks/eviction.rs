//! Victim selection for the memory chunk store.

use std::cmp::Reverse;
use std::sync::Arc;

use super::ChunkReferenceTracker;
use crate::manifest::ChunkId;

/// Chunks a store should evict to get back under its size target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionDecision {
    /// Chunks with no remaining uses; drop them.
    pub cleanable: Vec<ChunkId>,
    /// Chunks still needed later; move them to the overflow store.
    pub bootable: Vec<ChunkId>,
}

/// Decides which resident chunks a store evicts.
pub trait ChunkEvictionPolicy: Send + Sync {
    /// Choose evictions so that at most `desired_max` of `resident` remain.
    fn query(&self, resident: &[ChunkId], desired_max: usize) -> EvictionDecision;
}

/// Belady-style policy: evict the chunk whose next use is furthest away.
///
/// Chunks never used again count as infinitely far. Equal distances are broken
/// by ascending [`ChunkId`] so eviction is deterministic.
#[derive(Debug, Clone)]
pub struct ReferencedChunkEvictionPolicy {
    tracker: Arc<ChunkReferenceTracker>,
}

impl ReferencedChunkEvictionPolicy {
    pub fn new(tracker: Arc<ChunkReferenceTracker>) -> Self {
        Self { tracker }
    }

    /// Resident chunks in eviction order, first victim first.
    fn eviction_order(&self, resident: &[ChunkId]) -> Vec<ChunkId> {
        let mut ranked: Vec<(Option<usize>, ChunkId)> = resident
            .iter()
            .map(|id| (self.tracker.distance_to_next_use(id), *id))
            .collect();
        // None (never used) sorts first, then by descending distance
        ranked.sort_by_key(|(distance, id)| (distance.map(Reverse), *id));
        ranked.into_iter().map(|(_, id)| id).collect()
    }

    /// The single chunk this policy would evict first.
    pub fn select_victim(&self, resident: &[ChunkId]) -> Option<ChunkId> {
        self.eviction_order(resident).into_iter().next()
    }
}

impl ChunkEvictionPolicy for ReferencedChunkEvictionPolicy {
    fn query(&self, resident: &[ChunkId], desired_max: usize) -> EvictionDecision {
        let mut decision = EvictionDecision::default();
        let mut remaining = Vec::with_capacity(resident.len());
        for id in resident {
            if self.tracker.remaining_uses(id) == 0 {
                decision.cleanable.push(*id);
            } else {
                remaining.push(*id);
            }
        }

        if remaining.len() > desired_max {
            let excess = remaining.len() - desired_max;
            decision.bootable = self
                .eviction_order(&remaining)
                .into_iter()
                .take(excess)
                .collect();
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(n: u128) -> ChunkId {
        ChunkId::from_u128(n)
    }

    fn policy(uses: &[u128]) -> ReferencedChunkEvictionPolicy {
        let tracker = ChunkReferenceTracker::from_uses(uses.iter().map(|n| id(*n)));
        ReferencedChunkEvictionPolicy::new(Arc::new(tracker))
    }

    #[test]
    fn test_never_used_chunk_is_first_victim() {
        let policy = policy(&[1, 2, 3]);
        assert_eq!(policy.select_victim(&[id(1), id(9), id(3)]), Some(id(9)));
    }

    #[test]
    fn test_furthest_next_use_is_victim() {
        let policy = policy(&[1, 2, 3, 4]);
        assert_eq!(policy.select_victim(&[id(2), id(4), id(1)]), Some(id(4)));
    }

    #[test]
    fn test_ties_broken_by_ascending_id() {
        let policy = policy(&[1]);
        assert_eq!(policy.select_victim(&[id(7), id(5), id(6)]), Some(id(5)));
    }

    #[test]
    fn test_query_separates_cleanable_and_bootable() {
        let policy = policy(&[1, 2, 3]);
        let decision = policy.query(&[id(1), id(2), id(3), id(8)], 1);

        assert_eq!(decision.cleanable, vec![id(8)]);
        assert_eq!(decision.bootable, vec![id(3), id(2)]);
    }

    #[test]
    fn test_query_under_limit_boots_nothing() {
        let policy = policy(&[1, 2]);
        let decision = policy.query(&[id(1), id(2)], 5);

        assert!(decision.cleanable.is_empty());
        assert!(decision.bootable.is_empty());
    }

    proptest! {
        #[test]
        fn prop_victim_has_greatest_distance(
            uses in proptest::collection::vec(0u128..10, 1..40),
            resident in proptest::collection::hash_set(0u128..12, 1..10),
        ) {
            let policy = policy(&uses);
            let resident: Vec<ChunkId> = resident.into_iter().map(id).collect();
            let victim = policy.select_victim(&resident).unwrap();

            let distance = |c: &ChunkId| policy.tracker.distance_to_next_use(c).unwrap_or(usize::MAX);
            let victim_distance = distance(&victim);
            for other in &resident {
                let d = distance(other);
                prop_assert!(d < victim_distance || (d == victim_distance && *other >= victim));
            }
        }
    }
}
