//! Future-use tracking for chunks.
//!
//! The tracker records, for every chunk, the positions at which the file
//! constructor will consume it. Consuming a use advances the cursor; the
//! distance from the cursor to a chunk's next position drives eviction.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use crate::manifest::{BuildManifest, ChunkId};

#[derive(Debug, Default)]
struct TrackerInner {
    /// Every chunk use, in construction order.
    uses: Vec<ChunkId>,
    /// Remaining use positions per chunk, ascending.
    positions: HashMap<ChunkId, VecDeque<usize>>,
    /// Position after the latest consumed use.
    cursor: usize,
}

/// Ordered record of the chunk uses still ahead of the file constructor.
#[derive(Debug)]
pub struct ChunkReferenceTracker {
    inner: Mutex<TrackerInner>,
}

impl ChunkReferenceTracker {
    /// Track the chunk uses of `files`, constructed in the given order.
    ///
    /// Files missing from the manifest are skipped.
    pub fn new(manifest: &BuildManifest, files: &[String]) -> Self {
        let uses = files
            .iter()
            .filter_map(|name| manifest.file(name))
            .flat_map(|file| file.parts.iter().map(|part| part.chunk));
        Self::from_uses(uses)
    }

    /// Track an explicit sequence of chunk uses.
    pub fn from_uses(uses: impl IntoIterator<Item = ChunkId>) -> Self {
        let uses: Vec<ChunkId> = uses.into_iter().collect();
        let mut positions: HashMap<ChunkId, VecDeque<usize>> = HashMap::new();
        for (position, id) in uses.iter().enumerate() {
            positions.entry(*id).or_default().push_back(position);
        }
        Self {
            inner: Mutex::new(TrackerInner {
                uses,
                positions,
                cursor: 0,
            }),
        }
    }

    /// Chunks with at least one remaining use.
    pub fn get_referenced_chunks(&self) -> HashSet<ChunkId> {
        self.inner
            .lock()
            .positions
            .iter()
            .filter(|(_, p)| !p.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Mark the next use of `id` as consumed.
    ///
    /// Returns `false` if the chunk had no remaining uses.
    pub fn consume_next_use(&self, id: &ChunkId) -> bool {
        let mut inner = self.inner.lock();
        let Some(position) = inner.positions.get_mut(id).and_then(VecDeque::pop_front) else {
            return false;
        };
        inner.cursor = inner.cursor.max(position + 1);
        true
    }

    /// Number of uses between the cursor and the next use of `id`.
    ///
    /// `None` means the chunk is never used again.
    pub fn distance_to_next_use(&self, id: &ChunkId) -> Option<usize> {
        let inner = self.inner.lock();
        inner
            .positions
            .get(id)
            .and_then(|p| p.front())
            .map(|position| position.saturating_sub(inner.cursor))
    }

    pub fn remaining_uses(&self, id: &ChunkId) -> usize {
        self.inner.lock().positions.get(id).map_or(0, VecDeque::len)
    }

    /// Up to `count` distinct chunks in upcoming use order that pass `filter`.
    pub fn next_references(&self, count: usize, filter: impl Fn(&ChunkId) -> bool) -> Vec<ChunkId> {
        let inner = self.inner.lock();
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for id in inner.uses.iter().skip(inner.cursor) {
            if result.len() >= count {
                break;
            }
            let pending = inner.positions.get(id).is_some_and(|p| !p.is_empty());
            if pending && seen.insert(*id) && filter(id) {
                result.push(*id);
            }
        }
        result
    }

    pub fn current_position(&self) -> usize {
        self.inner.lock().cursor
    }

    pub fn total_uses(&self) -> usize {
        self.inner.lock().uses.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::test_support::manifest_with_files;
    use proptest::prelude::*;

    fn id(n: u128) -> ChunkId {
        ChunkId::from_u128(n)
    }

    #[test]
    fn test_referenced_chunks_shrink_as_uses_are_consumed() {
        let tracker = ChunkReferenceTracker::from_uses([id(1), id(2), id(1)]);

        assert_eq!(tracker.get_referenced_chunks(), HashSet::from([id(1), id(2)]));

        assert!(tracker.consume_next_use(&id(1)));
        assert!(tracker.consume_next_use(&id(2)));
        assert_eq!(tracker.get_referenced_chunks(), HashSet::from([id(1)]));

        assert!(tracker.consume_next_use(&id(1)));
        assert!(tracker.get_referenced_chunks().is_empty());
        assert!(!tracker.consume_next_use(&id(1)));
    }

    #[test]
    fn test_distance_to_next_use() {
        let tracker = ChunkReferenceTracker::from_uses([id(1), id(2), id(3), id(1)]);

        assert_eq!(tracker.distance_to_next_use(&id(1)), Some(0));
        assert_eq!(tracker.distance_to_next_use(&id(3)), Some(2));
        assert_eq!(tracker.distance_to_next_use(&id(9)), None);

        tracker.consume_next_use(&id(1));
        assert_eq!(tracker.distance_to_next_use(&id(1)), Some(2));
        assert_eq!(tracker.distance_to_next_use(&id(2)), Some(0));
        assert_eq!(tracker.current_position(), 1);
    }

    #[test]
    fn test_new_follows_file_order() {
        let manifest = manifest_with_files(&[
            ("a", &[(1, "x"), (2, "y")]),
            ("b", &[(2, "y"), (3, "z")]),
        ]);
        let tracker =
            ChunkReferenceTracker::new(&manifest, &["b".to_string(), "a".to_string()]);

        assert_eq!(tracker.total_uses(), 4);
        assert_eq!(tracker.remaining_uses(&id(2)), 2);
        assert_eq!(tracker.distance_to_next_use(&id(3)), Some(1));
        assert_eq!(tracker.distance_to_next_use(&id(1)), Some(2));
    }

    #[test]
    fn test_next_references_are_distinct_and_filtered() {
        let tracker = ChunkReferenceTracker::from_uses([id(1), id(2), id(1), id(3), id(4)]);

        assert_eq!(tracker.next_references(10, |_| true), vec![id(1), id(2), id(3), id(4)]);
        assert_eq!(tracker.next_references(2, |_| true), vec![id(1), id(2)]);
        assert_eq!(tracker.next_references(10, |c| *c != id(2)), vec![id(1), id(3), id(4)]);

        tracker.consume_next_use(&id(1));
        tracker.consume_next_use(&id(2));
        assert_eq!(tracker.next_references(10, |_| true), vec![id(1), id(3), id(4)]);
    }

    proptest! {
        #[test]
        fn prop_referenced_set_is_union_of_remaining_uses(
            uses in proptest::collection::vec(0u128..8, 0..64),
            consumed in 0usize..64,
        ) {
            let ids: Vec<ChunkId> = uses.iter().map(|n| id(*n)).collect();
            let tracker = ChunkReferenceTracker::from_uses(ids.clone());
            let consumed = consumed.min(ids.len());

            for chunk in &ids[..consumed] {
                prop_assert!(tracker.consume_next_use(chunk));
            }

            let expected: HashSet<ChunkId> = ids[consumed..].iter().copied().collect();
            prop_assert_eq!(tracker.get_referenced_chunks(), expected);
            prop_assert_eq!(tracker.current_position(), consumed);
        }
    }
}
