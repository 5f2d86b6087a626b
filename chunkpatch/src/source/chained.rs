//! Source that consults other sources in a fixed order.

use std::collections::HashSet;
use std::sync::Arc;

use super::{ChunkSource, ChunkSourceError};
use crate::chunks::ChunkData;
use crate::manifest::ChunkId;

/// Chunks the cloud must provide: everything referenced that neither local
/// source can serve.
pub fn initial_download_set(
    referenced: &HashSet<ChunkId>,
    chunkdb: &HashSet<ChunkId>,
    install: &HashSet<ChunkId>,
) -> HashSet<ChunkId> {
    referenced
        .iter()
        .filter(|id| !chunkdb.contains(id) && !install.contains(id))
        .copied()
        .collect()
}

/// Asks each source in turn and returns the first chunk found.
///
/// The installer chains chunk database, install and cloud sources, cheapest
/// first.
pub struct ChainedChunkSource {
    sources: Vec<Arc<dyn ChunkSource>>,
}

impl ChainedChunkSource {
    pub fn new(sources: Vec<Arc<dyn ChunkSource>>) -> Self {
        Self { sources }
    }
}

impl ChunkSource for ChainedChunkSource {
    fn available_chunks(&self) -> HashSet<ChunkId> {
        self.sources
            .iter()
            .flat_map(|s| s.available_chunks())
            .collect()
    }

    fn get(&self, id: &ChunkId) -> Result<Option<Arc<ChunkData>>, ChunkSourceError> {
        for source in &self.sources {
            if let Some(chunk) = source.get(id)? {
                return Ok(Some(chunk));
            }
        }
        Ok(None)
    }
}
