//! Memory tier of the chunk store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ChunkData, ChunkEvictionPolicy, ChunkStoreError, DiskChunkStore};
use crate::manifest::ChunkId;
use crate::stats::InstallerStatistics;

/// Fixed-capacity in-memory chunk store with disk overflow.
///
/// When full, `put` and promoting `get`s ask the eviction policy for victims.
/// Chunks with no remaining uses are dropped; the others are booted to the
/// overflow store. If a boot fails the victim stays resident and the error is
/// returned, so no chunk is ever lost.
pub struct MemoryChunkStore {
    capacity: usize,
    policy: Arc<dyn ChunkEvictionPolicy>,
    overflow: Arc<DiskChunkStore>,
    stats: Arc<InstallerStatistics>,
    chunks: Mutex<HashMap<ChunkId, Arc<ChunkData>>>,
}

impl MemoryChunkStore {
    /// Create a store holding at most `capacity` chunks (minimum 1).
    pub fn new(
        capacity: usize,
        policy: Arc<dyn ChunkEvictionPolicy>,
        overflow: Arc<DiskChunkStore>,
        stats: Arc<InstallerStatistics>,
    ) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            overflow,
            stats,
            chunks: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of chunks resident in memory.
    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the chunk is held in either tier.
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.chunks.lock().contains_key(id) || self.overflow.contains(id)
    }

    pub fn is_resident(&self, id: &ChunkId) -> bool {
        self.chunks.lock().contains_key(id)
    }

    /// Store a chunk, evicting to stay within capacity.
    pub fn put(&self, chunk: Arc<ChunkData>) -> Result<(), ChunkStoreError> {
        let mut chunks = self.chunks.lock();
        let id = chunk.id();
        if chunks.contains_key(&id) {
            chunks.insert(id, chunk);
            return Ok(());
        }

        self.make_room(&mut chunks, self.capacity - 1)?;
        chunks.insert(id, chunk);
        // A newer copy supersedes anything booted earlier
        self.overflow.remove(&id);
        Ok(())
    }

    /// Fetch a chunk, promoting it from the overflow store if needed.
    pub fn get(&self, id: &ChunkId) -> Result<Option<Arc<ChunkData>>, ChunkStoreError> {
        let mut chunks = self.chunks.lock();
        if let Some(chunk) = chunks.get(id) {
            return Ok(Some(Arc::clone(chunk)));
        }

        let Some(chunk) = self.overflow.get(id)? else {
            return Ok(None);
        };

        match self.make_room(&mut chunks, self.capacity - 1) {
            Ok(()) => {
                chunks.insert(*id, Arc::clone(&chunk));
                self.overflow.remove(id);
            }
            Err(e) => {
                // The disk copy stays authoritative
                tracing::warn!(chunk = %id, error = %e, "Could not promote chunk into memory");
            }
        }
        Ok(Some(chunk))
    }

    /// Remove a chunk from both tiers.
    pub fn remove(&self, id: &ChunkId) -> Option<Arc<ChunkData>> {
        let removed = self.chunks.lock().remove(id);
        self.overflow.remove(id);
        removed
    }

    fn make_room(
        &self,
        chunks: &mut HashMap<ChunkId, Arc<ChunkData>>,
        desired_max: usize,
    ) -> Result<(), ChunkStoreError> {
        if chunks.len() <= desired_max {
            return Ok(());
        }

        let resident: Vec<ChunkId> = chunks.keys().copied().collect();
        let decision = self.policy.query(&resident, desired_max);

        for id in &decision.cleanable {
            if chunks.remove(id).is_some() {
                self.stats.record_released();
            }
        }

        for id in &decision.bootable {
            if chunks.len() <= desired_max {
                break;
            }
            let Some(chunk) = chunks.get(id) else {
                continue;
            };
            self.overflow.put(chunk)?;
            chunks.remove(id);
            self.stats.record_booted();
            tracing::debug!(chunk = %id, "Chunk booted to disk store");
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChunkStore")
            .field("capacity", &self.capacity)
            .field("resident", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::{ChunkReferenceTracker, ReferencedChunkEvictionPolicy};
    use crate::fs::LocalFileSystem;
    use std::path::Path;
    use tempfile::TempDir;

    fn id(n: u128) -> ChunkId {
        ChunkId::from_u128(n)
    }

    fn chunk(n: u128) -> Arc<ChunkData> {
        Arc::new(ChunkData::new(id(n), format!("chunk-{n}").into_bytes()))
    }

    struct Fixture {
        store: MemoryChunkStore,
        overflow: Arc<DiskChunkStore>,
        tracker: Arc<ChunkReferenceTracker>,
        stats: Arc<InstallerStatistics>,
    }

    fn fixture(dir: &Path, capacity: usize, uses: &[u128]) -> Fixture {
        let stats = Arc::new(InstallerStatistics::new());
        let tracker = Arc::new(ChunkReferenceTracker::from_uses(uses.iter().map(|n| id(*n))));
        let overflow = Arc::new(DiskChunkStore::new(
            Arc::new(LocalFileSystem),
            dir.to_path_buf(),
            Arc::clone(&stats),
        ));
        let policy = Arc::new(ReferencedChunkEvictionPolicy::new(Arc::clone(&tracker)));
        Fixture {
            store: MemoryChunkStore::new(capacity, policy, Arc::clone(&overflow), Arc::clone(&stats)),
            overflow,
            tracker,
            stats,
        }
    }

    #[test]
    fn test_put_and_get() {
        let temp = TempDir::new().unwrap();
        let f = fixture(temp.path(), 4, &[1]);

        f.store.put(chunk(1)).unwrap();
        assert_eq!(f.store.get(&id(1)).unwrap().unwrap().id(), id(1));
        assert!(f.store.get(&id(2)).unwrap().is_none());
    }

    #[test]
    fn test_capacity_never_exceeded_and_victim_booted() {
        let temp = TempDir::new().unwrap();
        let f = fixture(temp.path(), 2, &[1, 2, 3]);

        f.store.put(chunk(1)).unwrap();
        f.store.put(chunk(2)).unwrap();
        f.store.put(chunk(3)).unwrap();

        assert_eq!(f.store.len(), 2);
        // Chunk 2 is needed furthest in the future among the residents
        assert!(!f.store.is_resident(&id(2)));
        assert!(f.overflow.contains(&id(2)));
        assert_eq!(f.stats.snapshot().chunks_booted, 1);
    }

    #[test]
    fn test_unreferenced_chunks_released_not_booted() {
        let temp = TempDir::new().unwrap();
        let f = fixture(temp.path(), 2, &[1, 2, 3]);

        f.store.put(chunk(1)).unwrap();
        f.store.put(chunk(2)).unwrap();
        f.tracker.consume_next_use(&id(1));
        f.store.put(chunk(3)).unwrap();

        assert!(!f.store.contains(&id(1)));
        assert!(f.overflow.is_empty());
        assert_eq!(f.stats.snapshot().chunks_released, 1);
    }

    #[test]
    fn test_get_promotes_from_disk() {
        let temp = TempDir::new().unwrap();
        let f = fixture(temp.path(), 2, &[1, 2, 3, 2]);

        f.store.put(chunk(1)).unwrap();
        f.store.put(chunk(2)).unwrap();
        f.store.put(chunk(3)).unwrap();
        assert!(f.overflow.contains(&id(2)));

        f.tracker.consume_next_use(&id(1));
        let promoted = f.store.get(&id(2)).unwrap().unwrap();

        assert_eq!(promoted.data().as_ref(), b"chunk-2");
        assert!(f.store.is_resident(&id(2)));
        assert!(!f.overflow.contains(&id(2)));
        assert!(f.store.len() <= 2);
    }

    #[test]
    fn test_failed_boot_leaves_store_unchanged() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocked");
        std::fs::write(&blocker, b"x").unwrap();
        let f = fixture(&blocker, 2, &[1, 2, 3]);

        f.store.put(chunk(1)).unwrap();
        f.store.put(chunk(2)).unwrap();
        let err = f.store.put(chunk(3)).unwrap_err();

        assert!(err.is_retryable());
        assert!(f.store.is_resident(&id(1)));
        assert!(f.store.is_resident(&id(2)));
        assert!(!f.store.contains(&id(3)));
        assert_eq!(f.store.len(), 2);
    }

    #[test]
    fn test_no_chunk_lost_across_tiers() {
        let temp = TempDir::new().unwrap();
        let uses: Vec<u128> = (1..=20).chain(1..=20).collect();
        let f = fixture(temp.path(), 3, &uses);

        for n in 1..=20 {
            f.store.put(chunk(n)).unwrap();
            assert!(f.store.len() <= 3);
        }
        for n in 1..=20 {
            let c = f.store.get(&id(n)).unwrap().unwrap();
            assert_eq!(c.data().as_ref(), format!("chunk-{n}").as_bytes());
            assert!(f.store.len() <= 3);
        }
    }
}
