//! Chunk database container.
//!
//! Layout:
//!
//! ```text
//! ┌──────────┬─────────────┬──────────────────┬────────────────────────┐
//! │ magic 8B │ version u32 │ header len u64   │ header (bincode TOC)   │
//! └──────────┴─────────────┴──────────────────┴────────────────────────┘
//! ┌────────────────────────────────────────────────────────────────────┐
//! │ chunk payloads, back to back; TOC offsets are relative to here     │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Integers are little-endian.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunks::ChunkData;
use crate::fs::{FileSystem, ReadSeek};
use crate::manifest::ChunkId;

const MAGIC: &[u8; 8] = b"CPCHUNKD";
const VERSION: u32 = 1;
const PREAMBLE_LEN: u64 = 8 + 4 + 8;

/// Table of contents entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDbEntry {
    pub id: ChunkId,
    pub offset: u64,
    pub size: u64,
    pub hash: String,
}

#[derive(Debug, Error)]
pub enum ChunkDbError {
    #[error("I/O error on chunk database {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not a chunk database")]
    BadMagic { path: PathBuf },

    #[error("{path} has unsupported chunk database version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },

    #[error("corrupt chunk database header in {path}: {source}")]
    Header {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },

    #[error("chunk {id} is not in {path}")]
    MissingChunk { id: ChunkId, path: PathBuf },
}

/// Collects chunks and writes them as one chunk database file.
#[derive(Debug, Default)]
pub struct ChunkDbWriter {
    chunks: Vec<(ChunkId, String, Bytes)>,
}

impl ChunkDbWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk. Duplicates are ignored.
    pub fn add(&mut self, chunk: &ChunkData) {
        if self.chunks.iter().any(|(id, _, _)| *id == chunk.id()) {
            return;
        }
        self.chunks
            .push((chunk.id(), chunk.hash().to_string(), chunk.data().clone()));
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Write the database to `path`, returning its size in bytes.
    pub fn write(&self, fs: &dyn FileSystem, path: &Path) -> Result<u64, ChunkDbError> {
        let mut offset = 0u64;
        let entries: Vec<ChunkDbEntry> = self
            .chunks
            .iter()
            .map(|(id, hash, data)| {
                let entry = ChunkDbEntry {
                    id: *id,
                    offset,
                    size: data.len() as u64,
                    hash: hash.clone(),
                };
                offset += data.len() as u64;
                entry
            })
            .collect();

        let header = bincode::serialize(&entries).map_err(|source| ChunkDbError::Header {
            path: path.to_path_buf(),
            source,
        })?;

        let io_err = |source| ChunkDbError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = fs.create_write(path).map_err(io_err)?;
        writer.write_all(MAGIC).map_err(io_err)?;
        writer.write_all(&VERSION.to_le_bytes()).map_err(io_err)?;
        writer
            .write_all(&(header.len() as u64).to_le_bytes())
            .map_err(io_err)?;
        writer.write_all(&header).map_err(io_err)?;
        for (_, _, data) in &self.chunks {
            writer.write_all(data).map_err(io_err)?;
        }
        writer.flush().map_err(io_err)?;

        Ok(PREAMBLE_LEN + header.len() as u64 + offset)
    }
}

/// Random-access reader over a chunk database file.
pub struct ChunkDbReader {
    path: PathBuf,
    reader: Box<dyn ReadSeek>,
    data_start: u64,
    entries: HashMap<ChunkId, ChunkDbEntry>,
}

impl ChunkDbReader {
    pub fn open(fs: &dyn FileSystem, path: &Path) -> Result<Self, ChunkDbError> {
        let io_err = |source| ChunkDbError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = fs.open_read(path).map_err(io_err)?;

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic).map_err(io_err)?;
        if &magic != MAGIC {
            return Err(ChunkDbError::BadMagic {
                path: path.to_path_buf(),
            });
        }

        let mut version = [0u8; 4];
        reader.read_exact(&mut version).map_err(io_err)?;
        let version = u32::from_le_bytes(version);
        if version != VERSION {
            return Err(ChunkDbError::UnsupportedVersion {
                path: path.to_path_buf(),
                version,
            });
        }

        let mut header_len = [0u8; 8];
        reader.read_exact(&mut header_len).map_err(io_err)?;
        let header_len = u64::from_le_bytes(header_len);

        let mut header = Vec::new();
        (&mut reader)
            .take(header_len)
            .read_to_end(&mut header)
            .map_err(io_err)?;
        let entries: Vec<ChunkDbEntry> =
            bincode::deserialize(&header).map_err(|source| ChunkDbError::Header {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            data_start: PREAMBLE_LEN + header_len,
            entries: entries.into_iter().map(|e| (e.id, e)).collect(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> impl Iterator<Item = &ChunkDbEntry> {
        self.entries.values()
    }

    pub fn entry(&self, id: &ChunkId) -> Option<&ChunkDbEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.entries.contains_key(id)
    }

    /// Read a chunk's payload. The hash is the one recorded in the table of
    /// contents; callers verify it.
    pub fn read_chunk(&mut self, id: &ChunkId) -> Result<ChunkData, ChunkDbError> {
        let entry = self
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| ChunkDbError::MissingChunk {
                id: *id,
                path: self.path.clone(),
            })?;

        let path = &self.path;
        let io_err = |source| ChunkDbError::Io {
            path: path.clone(),
            source,
        };
        self.reader
            .seek(SeekFrom::Start(self.data_start + entry.offset))
            .map_err(io_err)?;
        let mut data = vec![0u8; entry.size as usize];
        self.reader.read_exact(&mut data).map_err(io_err)?;

        Ok(ChunkData::with_hash(entry.id, entry.hash, Bytes::from(data)))
    }
}

impl std::fmt::Debug for ChunkDbReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkDbReader")
            .field("path", &self.path)
            .field("chunks", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use tempfile::TempDir;

    fn chunk(n: u128, data: &str) -> ChunkData {
        ChunkData::new(ChunkId::from_u128(n), data.as_bytes().to_vec())
    }

    #[test]
    fn test_write_and_read_back() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pack.chunkdb");

        let mut writer = ChunkDbWriter::new();
        writer.add(&chunk(1, "first chunk"));
        writer.add(&chunk(2, "second"));
        writer.add(&chunk(1, "duplicate ignored"));
        assert_eq!(writer.len(), 2);

        let size = writer.write(&LocalFileSystem, &path).unwrap();
        assert_eq!(size, std::fs::metadata(&path).unwrap().len());

        let mut reader = ChunkDbReader::open(&LocalFileSystem, &path).unwrap();
        assert_eq!(reader.entries().count(), 2);

        let second = reader.read_chunk(&ChunkId::from_u128(2)).unwrap();
        assert_eq!(second.data().as_ref(), b"second");
        assert!(second.verify(second.hash()));

        let first = reader.read_chunk(&ChunkId::from_u128(1)).unwrap();
        assert_eq!(first.data().as_ref(), b"first chunk");
    }

    #[test]
    fn test_missing_chunk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pack.chunkdb");
        ChunkDbWriter::new().write(&LocalFileSystem, &path).unwrap();

        let mut reader = ChunkDbReader::open(&LocalFileSystem, &path).unwrap();
        assert!(matches!(
            reader.read_chunk(&ChunkId::from_u128(9)),
            Err(ChunkDbError::MissingChunk { .. })
        ));
    }

    #[test]
    fn test_rejects_other_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("not-a-db");
        std::fs::write(&path, b"definitely not a chunk database").unwrap();

        assert!(matches!(
            ChunkDbReader::open(&LocalFileSystem, &path),
            Err(ChunkDbError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_truncated_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("short");
        std::fs::write(&path, b"CPCH").unwrap();

        assert!(matches!(
            ChunkDbReader::open(&LocalFileSystem, &path),
            Err(ChunkDbError::Io { .. })
        ));
    }
}
