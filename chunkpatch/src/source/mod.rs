//! Chunk sources.
//!
//! A [`ChunkSource`] hands out chunk data on demand. Three concrete sources
//! exist, tried in order of cost by [`ChainedChunkSource`]:
//!
//! 1. [`ChunkDbChunkSource`]: local chunk database files
//! 2. [`InstallChunkSource`]: chunks recycled from installed builds
//! 3. [`CloudChunkSource`]: chunks downloaded from cloud directories
//!
//! Every source places what it loads into a shared
//! [`MemoryChunkStore`](crate::chunks::MemoryChunkStore) and prefetches the
//! chunks the [`ChunkReferenceTracker`](crate::chunks::ChunkReferenceTracker)
//! says are needed next.

mod chained;
mod chunkdb;
mod chunkdb_file;
mod cloud;
mod health;
mod install;

pub use chained::{initial_download_set, ChainedChunkSource};
pub use chunkdb::{ChunkDbChunkSource, ChunkDbSourceConfig};
pub use chunkdb_file::{ChunkDbEntry, ChunkDbError, ChunkDbReader, ChunkDbWriter};
pub use cloud::{cloud_chunk_url, CloudChunkSource, CloudSourceConfig};
pub use health::{DownloadHealth, DownloadHealthTracker, HEALTH_SAMPLE_SIZE};
pub use install::{InstallChunkSource, InstallSourceConfig};

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::chunks::{ChunkData, ChunkStoreError};
use crate::manifest::ChunkId;

#[derive(Debug, Error)]
pub enum ChunkSourceError {
    #[error("chunk source aborted")]
    Aborted,

    #[error("chunk {id} could not be downloaded: {reason}")]
    DownloadFailed { id: ChunkId, reason: String },

    #[error(transparent)]
    Store(#[from] ChunkStoreError),
}

/// Provider of chunk data.
pub trait ChunkSource: Send + Sync {
    /// Chunks this source can serve without waiting on the network.
    fn available_chunks(&self) -> HashSet<ChunkId>;

    /// Fetch a chunk.
    ///
    /// `Ok(None)` means this source cannot provide the chunk and the next
    /// source should be asked.
    fn get(&self, id: &ChunkId) -> Result<Option<Arc<ChunkData>>, ChunkSourceError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::sync::Arc;

    use crate::chunks::{ChunkReferenceTracker, DiskChunkStore, MemoryChunkStore, ReferencedChunkEvictionPolicy};
    use crate::fs::LocalFileSystem;
    use crate::manifest::BuildManifest;
    use crate::stats::InstallerStatistics;

    pub struct SourceFixture {
        pub store: Arc<MemoryChunkStore>,
        pub tracker: Arc<ChunkReferenceTracker>,
        pub stats: Arc<InstallerStatistics>,
    }

    /// A store and tracker covering every file of `manifest` in path order.
    pub fn store_for(dir: &Path, manifest: &BuildManifest, capacity: usize) -> SourceFixture {
        let stats = Arc::new(InstallerStatistics::new());
        let tracker = Arc::new(ChunkReferenceTracker::new(manifest, &manifest.file_list()));
        let overflow = Arc::new(DiskChunkStore::new(
            Arc::new(LocalFileSystem),
            dir.join("overflow"),
            Arc::clone(&stats),
        ));
        let policy = Arc::new(ReferencedChunkEvictionPolicy::new(Arc::clone(&tracker)));
        SourceFixture {
            store: Arc::new(MemoryChunkStore::new(capacity, policy, overflow, Arc::clone(&stats))),
            tracker,
            stats,
        }
    }
}
