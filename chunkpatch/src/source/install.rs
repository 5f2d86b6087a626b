//! Chunk source that recycles chunks out of installed builds.
//!
//! A chunk can be rebuilt from an existing installation when every byte of it
//! appears in some file of that installation. For each candidate chunk the
//! source plans a *recipe*: a list of byte ranges in installed files that,
//! read in order, reproduce the chunk.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use super::{ChunkSource, ChunkSourceError};
use crate::chunks::{ChunkData, ChunkReferenceTracker, MemoryChunkStore};
use crate::control::{ControlFlags, Controllable};
use crate::fs::FileSystem;
use crate::manifest::{BuildManifest, ChunkId};
use crate::message::{ChunkSourceEvent, ChunkSourceKind, MessageSender};
use crate::stats::InstallerStatistics;

#[derive(Debug, Clone, Default)]
pub struct InstallSourceConfig {
    pub batch_fetch_min: usize,
    pub batch_fetch_max: usize,
    /// Chunks another source already provides.
    pub chunk_ignore_set: HashSet<ChunkId>,
}

/// A byte range of an installed file that lands at `chunk_offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Piece {
    path: PathBuf,
    file_offset: u64,
    chunk_offset: u64,
    size: u64,
}

pub struct InstallChunkSource {
    config: InstallSourceConfig,
    fs: Arc<dyn FileSystem>,
    store: Arc<MemoryChunkStore>,
    tracker: Arc<ChunkReferenceTracker>,
    stats: Arc<InstallerStatistics>,
    messages: MessageSender,
    expected: HashMap<ChunkId, String>,
    flags: ControlFlags,
    recipes: Mutex<HashMap<ChunkId, Vec<Piece>>>,
}

impl InstallChunkSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: InstallSourceConfig,
        fs: Arc<dyn FileSystem>,
        store: Arc<MemoryChunkStore>,
        tracker: Arc<ChunkReferenceTracker>,
        manifest: &BuildManifest,
        installations: &BTreeMap<PathBuf, Arc<BuildManifest>>,
        stats: Arc<InstallerStatistics>,
        messages: MessageSender,
    ) -> Self {
        let referenced = tracker.get_referenced_chunks();
        let wanted = |id: &ChunkId| referenced.contains(id) && !config.chunk_ignore_set.contains(id);

        let mut pieces: HashMap<ChunkId, Vec<Piece>> = HashMap::new();
        for (install_dir, installed) in installations {
            collect_pieces(fs.as_ref(), install_dir, installed, manifest, &wanted, &mut pieces);
        }

        let recipes: HashMap<ChunkId, Vec<Piece>> = pieces
            .into_iter()
            .filter_map(|(id, pieces)| {
                let size = manifest.chunk_info(&id)?.size;
                plan_recipe(pieces, size).map(|recipe| (id, recipe))
            })
            .collect();

        tracing::info!(
            installations = installations.len(),
            recyclable = recipes.len(),
            "Install chunk source ready"
        );

        Self {
            config,
            fs,
            store,
            tracker,
            stats,
            messages,
            expected: manifest
                .chunks
                .iter()
                .map(|(id, info)| (*id, info.hash.clone()))
                .collect(),
            flags: ControlFlags::new(),
            recipes: Mutex::new(recipes),
        }
    }

    fn read_recipe(&self, recipe: &[Piece]) -> std::io::Result<Bytes> {
        let total: u64 = recipe.iter().map(|p| p.size).sum();
        let mut data = BytesMut::with_capacity(total as usize);
        for piece in recipe {
            let mut reader = self.fs.open_read(&piece.path)?;
            reader.seek(SeekFrom::Start(piece.file_offset))?;
            let mut buf = vec![0u8; piece.size as usize];
            reader.read_exact(&mut buf)?;
            data.extend_from_slice(&buf);
        }
        Ok(data.freeze())
    }

    /// Rebuild a chunk from its recipe. A recipe that fails is dropped.
    fn assemble(&self, id: &ChunkId) -> Option<Arc<ChunkData>> {
        let recipe = self.recipes.lock().get(id).cloned()?;
        let expected = self.expected.get(id)?;

        let event = match self.read_recipe(&recipe) {
            Ok(data) => {
                let chunk = ChunkData::new(*id, data);
                if chunk.verify(expected) {
                    self.stats.record_recycled();
                    return Some(Arc::new(chunk));
                }
                tracing::warn!(chunk = %id, "Recycled chunk failed hash verification");
                ChunkSourceEvent::CorruptChunk
            }
            Err(e) => {
                tracing::warn!(chunk = %id, error = %e, "Could not read installed file for recycling");
                ChunkSourceEvent::ReadFailed
            }
        };

        self.stats.record_recycle_failure();
        self.messages
            .chunk_source(ChunkSourceKind::Install, event, Some(*id));
        self.recipes.lock().remove(id);
        None
    }

    fn batch_for(&self, id: &ChunkId) -> Vec<ChunkId> {
        let upcoming = {
            let recipes = self.recipes.lock();
            self.tracker
                .next_references(self.config.batch_fetch_max, |c| c != id && recipes.contains_key(c))
        };
        let loaded = upcoming.iter().filter(|c| self.store.contains(c)).count();
        if loaded >= self.config.batch_fetch_min {
            return Vec::new();
        }
        upcoming
            .into_iter()
            .filter(|c| !self.store.contains(c))
            .take(self.config.batch_fetch_max.saturating_sub(loaded))
            .collect()
    }
}

/// Gather the pieces of wanted chunks found in one installation.
fn collect_pieces(
    fs: &dyn FileSystem,
    install_dir: &Path,
    installed: &BuildManifest,
    manifest: &BuildManifest,
    wanted: &impl Fn(&ChunkId) -> bool,
    pieces: &mut HashMap<ChunkId, Vec<Piece>>,
) {
    for file in installed.files.values() {
        let path = install_dir.join(&file.filename);
        if fs.file_size(&path) != Some(file.size) {
            continue;
        }

        let mut file_offset = 0u64;
        for part in &file.parts {
            let same_chunk = match (installed.chunk_info(&part.chunk), manifest.chunk_info(&part.chunk)) {
                (Some(old), Some(new)) => old.hash.eq_ignore_ascii_case(&new.hash),
                _ => false,
            };
            if same_chunk && wanted(&part.chunk) {
                pieces.entry(part.chunk).or_default().push(Piece {
                    path: path.clone(),
                    file_offset,
                    chunk_offset: part.offset,
                    size: part.size,
                });
            }
            file_offset += part.size;
        }
    }
}

/// Greedily cover `[0, chunk_size)` with pieces, or `None` if a gap remains.
fn plan_recipe(mut pieces: Vec<Piece>, chunk_size: u64) -> Option<Vec<Piece>> {
    pieces.sort_by_key(|p| (p.chunk_offset, std::cmp::Reverse(p.size)));

    let mut recipe = Vec::new();
    let mut covered = 0u64;
    while covered < chunk_size {
        let best = pieces
            .iter()
            .filter(|p| p.chunk_offset <= covered && p.chunk_offset + p.size > covered)
            .max_by_key(|p| p.chunk_offset + p.size)?;

        let skip = covered - best.chunk_offset;
        let end = (best.chunk_offset + best.size).min(chunk_size);
        recipe.push(Piece {
            path: best.path.clone(),
            file_offset: best.file_offset + skip,
            chunk_offset: covered,
            size: end - covered,
        });
        covered = end;
    }
    Some(recipe)
}

impl ChunkSource for InstallChunkSource {
    fn available_chunks(&self) -> HashSet<ChunkId> {
        self.recipes.lock().keys().copied().collect()
    }

    fn get(&self, id: &ChunkId) -> Result<Option<Arc<ChunkData>>, ChunkSourceError> {
        if !self.flags.wait_while_paused() {
            return Err(ChunkSourceError::Aborted);
        }
        if let Some(chunk) = self.store.get(id)? {
            return Ok(Some(chunk));
        }

        let Some(chunk) = self.assemble(id) else {
            return Ok(None);
        };
        self.store.put(Arc::clone(&chunk))?;

        for next in self.batch_for(id) {
            if self.flags.is_aborted() {
                return Err(ChunkSourceError::Aborted);
            }
            if let Some(recycled) = self.assemble(&next) {
                self.store.put(recycled)?;
            }
        }
        Ok(Some(chunk))
    }
}

impl Controllable for InstallChunkSource {
    fn abort(&self) {
        self.flags.abort();
    }

    fn set_paused(&self, paused: bool) {
        self.flags.set_paused(paused);
    }
}
