//! Chunk source backed by local chunk database files.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::chunkdb_file::{ChunkDbError, ChunkDbReader};
use super::{ChunkSource, ChunkSourceError};
use crate::chunks::{ChunkData, ChunkReferenceTracker, MemoryChunkStore};
use crate::control::{ControlFlags, Controllable};
use crate::fs::FileSystem;
use crate::manifest::{BuildManifest, ChunkId};
use crate::message::{ChunkSourceEvent, ChunkSourceKind, MessageSender};
use crate::stats::InstallerStatistics;

const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct ChunkDbSourceConfig {
    pub chunk_db_files: Vec<PathBuf>,
    /// Below this many upcoming chunks in the store, a batch is loaded.
    pub prefetch_min: usize,
    /// Most chunks loaded by one batch.
    pub prefetch_max: usize,
    /// How long to keep retrying a database that fails to open.
    pub open_retry_time: Duration,
}

struct ChunkDbState {
    readers: Vec<ChunkDbReader>,
    locations: HashMap<ChunkId, usize>,
    failed: HashSet<ChunkId>,
}

/// Serves chunks out of chunk database files.
///
/// Databases are opened and indexed when the source is created. Only chunks
/// present in the manifest's catalog are served, and each one is checked
/// against the catalog hash before it enters the store.
pub struct ChunkDbChunkSource {
    config: ChunkDbSourceConfig,
    store: Arc<MemoryChunkStore>,
    tracker: Arc<ChunkReferenceTracker>,
    stats: Arc<InstallerStatistics>,
    messages: MessageSender,
    expected: HashMap<ChunkId, String>,
    flags: ControlFlags,
    state: Mutex<ChunkDbState>,
}

impl ChunkDbChunkSource {
    pub fn new(
        config: ChunkDbSourceConfig,
        fs: Arc<dyn FileSystem>,
        store: Arc<MemoryChunkStore>,
        tracker: Arc<ChunkReferenceTracker>,
        manifest: &BuildManifest,
        stats: Arc<InstallerStatistics>,
        messages: MessageSender,
    ) -> Self {
        let expected: HashMap<ChunkId, String> = manifest
            .chunks
            .iter()
            .map(|(id, info)| (*id, info.hash.clone()))
            .collect();

        let mut readers = Vec::new();
        let mut locations = HashMap::new();
        for path in &config.chunk_db_files {
            let Some(reader) = open_with_retry(fs.as_ref(), path, config.open_retry_time) else {
                messages.chunk_source(ChunkSourceKind::ChunkDb, ChunkSourceEvent::AccessLost, None);
                continue;
            };

            let index = readers.len();
            let mut indexed = 0usize;
            for entry in reader.entries() {
                if expected.contains_key(&entry.id) {
                    locations.entry(entry.id).or_insert(index);
                    indexed += 1;
                }
            }
            tracing::info!(path = %path.display(), chunks = indexed, "Chunk database opened");
            readers.push(reader);
        }

        Self {
            config,
            store,
            tracker,
            stats,
            messages,
            expected,
            flags: ControlFlags::new(),
            state: Mutex::new(ChunkDbState {
                readers,
                locations,
                failed: HashSet::new(),
            }),
        }
    }

    /// Load one chunk from its database and verify it.
    fn load(&self, state: &mut ChunkDbState, id: &ChunkId) -> Option<Arc<ChunkData>> {
        let index = *state.locations.get(id)?;
        let expected = self.expected.get(id)?;

        let event = match state.readers[index].read_chunk(id) {
            Ok(chunk) if chunk.verify(expected) => {
                self.stats.record_chunkdb_read();
                return Some(Arc::new(chunk));
            }
            Ok(_) => {
                tracing::warn!(chunk = %id, "Chunk database entry failed hash verification");
                ChunkSourceEvent::CorruptChunk
            }
            Err(e) => {
                tracing::warn!(chunk = %id, error = %e, "Chunk database read failed");
                ChunkSourceEvent::ReadFailed
            }
        };

        self.stats.record_chunkdb_failure();
        self.messages
            .chunk_source(ChunkSourceKind::ChunkDb, event, Some(*id));
        state.failed.insert(*id);
        None
    }

    /// Chunks to load along with `id`, in database order.
    fn batch_for(&self, state: &ChunkDbState, id: &ChunkId) -> Vec<ChunkId> {
        let upcoming = self.tracker.next_references(self.config.prefetch_max, |c| {
            c != id && state.locations.contains_key(c) && !state.failed.contains(c)
        });
        let loaded = upcoming.iter().filter(|c| self.store.contains(c)).count();
        if loaded >= self.config.prefetch_min {
            return Vec::new();
        }

        let mut batch: Vec<ChunkId> = upcoming
            .into_iter()
            .filter(|c| !self.store.contains(c))
            .take(self.config.prefetch_max.saturating_sub(loaded))
            .collect();
        batch.sort_by_key(|c| {
            let index = state.locations.get(c).copied().unwrap_or(usize::MAX);
            let offset = state.readers.get(index).and_then(|r| r.entry(c)).map(|e| e.offset);
            (index, offset)
        });
        batch
    }
}

fn open_with_retry(fs: &dyn FileSystem, path: &std::path::Path, retry_time: Duration) -> Option<ChunkDbReader> {
    let started = Instant::now();
    loop {
        match ChunkDbReader::open(fs, path) {
            Ok(reader) => return Some(reader),
            Err(ChunkDbError::Io { source, .. }) if started.elapsed() < retry_time => {
                tracing::debug!(path = %path.display(), error = %source, "Retrying chunk database open");
                thread::sleep(OPEN_RETRY_INTERVAL);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Chunk database unavailable");
                return None;
            }
        }
    }
}

impl ChunkSource for ChunkDbChunkSource {
    fn available_chunks(&self) -> HashSet<ChunkId> {
        let state = self.state.lock();
        state
            .locations
            .keys()
            .filter(|id| !state.failed.contains(id))
            .copied()
            .collect()
    }

    fn get(&self, id: &ChunkId) -> Result<Option<Arc<ChunkData>>, ChunkSourceError> {
        if !self.flags.wait_while_paused() {
            return Err(ChunkSourceError::Aborted);
        }
        if let Some(chunk) = self.store.get(id)? {
            return Ok(Some(chunk));
        }

        let mut state = self.state.lock();
        if !state.locations.contains_key(id) || state.failed.contains(id) {
            return Ok(None);
        }

        let Some(chunk) = self.load(&mut state, id) else {
            return Ok(None);
        };
        self.store.put(Arc::clone(&chunk))?;

        for next in self.batch_for(&state, id) {
            if self.flags.is_aborted() {
                return Err(ChunkSourceError::Aborted);
            }
            if let Some(prefetched) = self.load(&mut state, &next) {
                self.store.put(prefetched)?;
            }
        }

        Ok(Some(chunk))
    }
}

impl Controllable for ChunkDbChunkSource {
    fn abort(&self) {
        self.flags.abort();
    }

    fn set_paused(&self, paused: bool) {
        self.flags.set_paused(paused);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use crate::manifest::test_support::manifest_with_files;
    use crate::message::{InstallerMessage, MessagePump};
    use crate::source::test_support::store_for;
    use crate::source::ChunkDbWriter;
    use tempfile::TempDir;

    fn id(n: u128) -> ChunkId {
        ChunkId::from_u128(n)
    }

    fn write_db(path: &std::path::Path, chunks: &[(u128, &str)]) {
        let mut writer = ChunkDbWriter::new();
        for (n, data) in chunks {
            writer.add(&ChunkData::new(id(*n), data.as_bytes().to_vec()));
        }
        writer.write(&LocalFileSystem, path).unwrap();
    }

    fn config(files: Vec<PathBuf>, min: usize, max: usize) -> ChunkDbSourceConfig {
        ChunkDbSourceConfig {
            chunk_db_files: files,
            prefetch_min: min,
            prefetch_max: max,
            open_retry_time: Duration::ZERO,
        }
    }

    #[test]
    fn test_serves_and_prefetches() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("a.chunkdb");
        write_db(&db, &[(1, "one"), (2, "two"), (3, "three"), (9, "not in manifest")]);
        let manifest = manifest_with_files(&[("f", &[(1, "one"), (2, "two"), (3, "three")])]);

        let fixture = store_for(temp.path(), &manifest, 8);
        let pump = MessagePump::new();
        let source = ChunkDbChunkSource::new(
            config(vec![db], 2, 4),
            Arc::new(LocalFileSystem),
            Arc::clone(&fixture.store),
            Arc::clone(&fixture.tracker),
            &manifest,
            Arc::clone(&fixture.stats),
            pump.sender(),
        );

        let available = source.available_chunks();
        assert_eq!(available, [id(1), id(2), id(3)].into_iter().collect());

        let chunk = source.get(&id(1)).unwrap().unwrap();
        assert_eq!(chunk.data().as_ref(), b"one");
        assert!(fixture.store.contains(&id(2)));
        assert!(fixture.store.contains(&id(3)));
        assert_eq!(fixture.stats.snapshot().chunkdb_chunks_read, 3);
        assert!(source.get(&id(9)).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_entry_reported_and_skipped() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("a.chunkdb");
        write_db(&db, &[(1, "tampered")]);
        let manifest = manifest_with_files(&[("f", &[(1, "original")])]);

        let fixture = store_for(temp.path(), &manifest, 8);
        let pump = MessagePump::new();
        let source = ChunkDbChunkSource::new(
            config(vec![db], 1, 1),
            Arc::new(LocalFileSystem),
            Arc::clone(&fixture.store),
            Arc::clone(&fixture.tracker),
            &manifest,
            Arc::clone(&fixture.stats),
            pump.sender(),
        );

        assert!(source.get(&id(1)).unwrap().is_none());
        assert!(source.available_chunks().is_empty());
        assert_eq!(fixture.stats.snapshot().chunkdb_failures, 1);

        struct Collect(Arc<Mutex<Vec<InstallerMessage>>>);
        impl crate::message::MessageHandler for Collect {
            fn handle_message(&mut self, message: &InstallerMessage) {
                self.0.lock().push(message.clone());
            }
        }
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut handlers: Vec<Box<dyn crate::message::MessageHandler>> =
            vec![Box::new(Collect(Arc::clone(&seen)))];
        pump.pump(&mut handlers);
        assert_eq!(
            seen.lock().as_slice(),
            &[InstallerMessage::ChunkSource {
                source: ChunkSourceKind::ChunkDb,
                event: ChunkSourceEvent::CorruptChunk,
                chunk: Some(id(1)),
            }]
        );
    }

    #[test]
    fn test_missing_database_reported() {
        let temp = TempDir::new().unwrap();
        let manifest = manifest_with_files(&[("f", &[(1, "one")])]);
        let fixture = store_for(temp.path(), &manifest, 8);
        let pump = MessagePump::new();

        let source = ChunkDbChunkSource::new(
            config(vec![temp.path().join("gone.chunkdb")], 1, 1),
            Arc::new(LocalFileSystem),
            Arc::clone(&fixture.store),
            Arc::clone(&fixture.tracker),
            &manifest,
            Arc::clone(&fixture.stats),
            pump.sender(),
        );

        assert!(source.available_chunks().is_empty());
        let mut handlers: Vec<Box<dyn crate::message::MessageHandler>> = Vec::new();
        assert_eq!(pump.pump(&mut handlers), 1);
    }

    #[test]
    fn test_aborted_source_refuses() {
        let temp = TempDir::new().unwrap();
        let manifest = manifest_with_files(&[("f", &[(1, "one")])]);
        let fixture = store_for(temp.path(), &manifest, 8);
        let source = ChunkDbChunkSource::new(
            config(Vec::new(), 1, 1),
            Arc::new(LocalFileSystem),
            Arc::clone(&fixture.store),
            Arc::clone(&fixture.tracker),
            &manifest,
            Arc::clone(&fixture.stats),
            MessagePump::new().sender(),
        );

        source.abort();
        assert!(matches!(source.get(&id(1)), Err(ChunkSourceError::Aborted)));
    }
}
