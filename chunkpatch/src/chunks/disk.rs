//! Disk overflow tier of the chunk store.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{ChunkData, ChunkStoreError};
use crate::fs::FileSystem;
use crate::manifest::ChunkId;
use crate::stats::InstallerStatistics;

/// On-disk record for a booted chunk.
#[derive(Serialize, Deserialize)]
struct StoredChunk {
    id: ChunkId,
    hash: String,
    data: Vec<u8>,
}

/// Stores booted chunks as individual files in a staging directory.
///
/// Only chunks written by this store are visible; files left over from a
/// previous session are ignored.
#[derive(Debug)]
pub struct DiskChunkStore {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    stats: Arc<InstallerStatistics>,
    index: Mutex<HashSet<ChunkId>>,
}

impl DiskChunkStore {
    pub fn new(fs: Arc<dyn FileSystem>, dir: PathBuf, stats: Arc<InstallerStatistics>) -> Self {
        Self {
            fs,
            dir,
            stats,
            index: Mutex::new(HashSet::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &ChunkId) -> PathBuf {
        self.dir.join(format!("{id}.chunk"))
    }

    /// Write a chunk to disk.
    pub fn put(&self, chunk: &ChunkData) -> Result<(), ChunkStoreError> {
        let id = chunk.id();
        let record = StoredChunk {
            id,
            hash: chunk.hash().to_string(),
            data: chunk.data().to_vec(),
        };
        let encoded =
            bincode::serialize(&record).map_err(|source| ChunkStoreError::Encode { id, source })?;

        let path = self.path_for(&id);
        self.fs
            .write(&path, &encoded)
            .map_err(|source| ChunkStoreError::Write { id, path, source })?;

        self.index.lock().insert(id);
        tracing::trace!(chunk = %id, "Chunk written to disk store");
        Ok(())
    }

    /// Read a chunk back. `Ok(None)` if this store does not hold it.
    pub fn get(&self, id: &ChunkId) -> Result<Option<Arc<ChunkData>>, ChunkStoreError> {
        if !self.index.lock().contains(id) {
            return Ok(None);
        }

        let result = self.load(id);
        self.stats.record_disk_load(result.is_ok());
        if let Err(e) = &result {
            tracing::warn!(chunk = %id, error = %e, "Failed to load chunk from disk store");
        }
        result.map(|chunk| Some(Arc::new(chunk)))
    }

    fn load(&self, id: &ChunkId) -> Result<ChunkData, ChunkStoreError> {
        let path = self.path_for(id);
        let encoded = self
            .fs
            .read(&path)
            .map_err(|source| ChunkStoreError::Read {
                id: *id,
                path: path.clone(),
                source,
            })?;
        let record: StoredChunk =
            bincode::deserialize(&encoded).map_err(|_| ChunkStoreError::Corrupt { id: *id })?;

        let chunk = ChunkData::with_hash(record.id, record.hash, Bytes::from(record.data));
        if chunk.id() != *id || !chunk.verify(chunk.hash()) {
            return Err(ChunkStoreError::Corrupt { id: *id });
        }
        Ok(chunk)
    }

    /// Delete a chunk. Returns true if it was held.
    pub fn remove(&self, id: &ChunkId) -> bool {
        if !self.index.lock().remove(id) {
            return false;
        }
        let path = self.path_for(id);
        if let Err(e) = self.fs.remove_file(&path) {
            tracing::debug!(chunk = %id, error = %e, "Failed to delete disk store file");
        }
        true
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.index.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use tempfile::TempDir;

    fn store(dir: PathBuf) -> (DiskChunkStore, Arc<InstallerStatistics>) {
        let stats = Arc::new(InstallerStatistics::new());
        (
            DiskChunkStore::new(Arc::new(LocalFileSystem), dir, Arc::clone(&stats)),
            stats,
        )
    }

    #[test]
    fn test_put_get_remove() {
        let temp = TempDir::new().unwrap();
        let (store, stats) = store(temp.path().join("PatchData"));
        let chunk = ChunkData::new(ChunkId::from_u128(1), b"chunk bytes".to_vec());

        store.put(&chunk).unwrap();
        assert!(store.contains(&chunk.id()));

        let loaded = store.get(&chunk.id()).unwrap().unwrap();
        assert_eq!(*loaded, chunk);
        assert_eq!(stats.snapshot().disk_cache_loads, 1);

        assert!(store.remove(&chunk.id()));
        assert!(store.get(&chunk.id()).unwrap().is_none());
        assert!(!temp
            .path()
            .join("PatchData")
            .join(format!("{}.chunk", chunk.id()))
            .exists());
    }

    #[test]
    fn test_get_unknown_chunk() {
        let temp = TempDir::new().unwrap();
        let (store, _) = store(temp.path().to_path_buf());
        assert!(store.get(&ChunkId::from_u128(5)).unwrap().is_none());
        assert!(!store.remove(&ChunkId::from_u128(5)));
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let temp = TempDir::new().unwrap();
        let (store, stats) = store(temp.path().to_path_buf());
        let chunk = ChunkData::new(ChunkId::from_u128(1), b"chunk bytes".to_vec());
        store.put(&chunk).unwrap();

        std::fs::write(temp.path().join(format!("{}.chunk", chunk.id())), b"garbage").unwrap();

        let result = store.get(&chunk.id());
        assert!(matches!(result, Err(ChunkStoreError::Corrupt { .. })));
        assert_eq!(stats.snapshot().disk_cache_load_failures, 1);
    }

    #[test]
    fn test_write_failure_is_retryable_error() {
        let temp = TempDir::new().unwrap();
        // A regular file where the store directory should be
        let blocker = temp.path().join("blocked");
        std::fs::write(&blocker, b"x").unwrap();
        let (store, _) = store(blocker);

        let chunk = ChunkData::new(ChunkId::from_u128(1), b"data".to_vec());
        let err = store.put(&chunk).unwrap_err();

        assert!(matches!(err, ChunkStoreError::Write { .. }));
        assert!(err.is_retryable());
        assert!(!store.contains(&chunk.id()));
    }
}
