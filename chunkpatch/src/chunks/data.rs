use bytes::Bytes;

use crate::checksum::hash_bytes;
use crate::manifest::ChunkId;

/// Chunk payload together with its identity and content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkData {
    id: ChunkId,
    hash: String,
    data: Bytes,
}

impl ChunkData {
    /// Wrap `data`, computing its hash.
    pub fn new(id: ChunkId, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let hash = hash_bytes(&data);
        Self { id, hash, data }
    }

    /// Wrap `data` with an already known hash.
    pub fn with_hash(id: ChunkId, hash: String, data: Bytes) -> Self {
        Self { id, hash, data }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True if the payload hashes to `expected`.
    pub fn verify(&self, expected: &str) -> bool {
        hash_bytes(&self.data).eq_ignore_ascii_case(expected)
    }
}
