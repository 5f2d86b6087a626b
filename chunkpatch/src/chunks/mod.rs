//! Chunk data and the two-tier chunk store.
//!
//! # Architecture
//!
//! ```text
//!   chunk sources ──put──► MemoryChunkStore (N chunks, locked)
//!                               │      ▲
//!                   boot victim │      │ promote on get
//!                               ▼      │
//!                          DiskChunkStore (one bincode file per chunk)
//!
//!   ChunkReferenceTracker ──► ReferencedChunkEvictionPolicy
//!   (future use order)         (picks victims for the memory store)
//! ```
//!
//! A chunk has exactly one authoritative copy across the two tiers: booting
//! moves it to disk, promotion moves it back and deletes the file.

mod data;
mod disk;
mod eviction;
mod memory;
mod tracker;

pub use data::ChunkData;
pub use disk::DiskChunkStore;
pub use eviction::{ChunkEvictionPolicy, EvictionDecision, ReferencedChunkEvictionPolicy};
pub use memory::MemoryChunkStore;
pub use tracker::ChunkReferenceTracker;

use std::path::PathBuf;

use thiserror::Error;

use crate::manifest::ChunkId;

/// Errors raised by the chunk stores.
///
/// All store errors are retryable: the chunk stays wherever it was before the
/// failed operation.
#[derive(Debug, Error)]
pub enum ChunkStoreError {
    #[error("failed to write chunk {id} to {path}: {source}")]
    Write {
        id: ChunkId,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read chunk {id} from {path}: {source}")]
    Read {
        id: ChunkId,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode chunk {id}: {source}")]
    Encode {
        id: ChunkId,
        #[source]
        source: bincode::Error,
    },

    #[error("stored chunk {id} is corrupt")]
    Corrupt { id: ChunkId },
}

impl ChunkStoreError {
    pub fn is_retryable(&self) -> bool {
        true
    }
}
