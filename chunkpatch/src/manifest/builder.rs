//! Chunking file content into a manifest.
//!
//! Files are split into fixed-size chunks. Identical chunks are stored once
//! and shared by every file part that needs them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use bytes::Bytes;
use walkdir::WalkDir;

use super::{
    BuildManifest, ChunkId, ChunkInfo, FileAttributes, FileManifestEntry, FilePart, ManifestError,
};
use crate::checksum::hash_bytes;
use crate::fs::FileSystem;

/// Default chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Location of a chunk inside a cloud directory.
pub fn chunk_relative_path(id: &ChunkId) -> String {
    format!("chunks/{id}.chunk")
}

/// A manifest together with the chunk payloads it references.
#[derive(Debug, Clone)]
pub struct BuiltBuild {
    pub manifest: BuildManifest,
    pub chunks: BTreeMap<ChunkId, Bytes>,
}

impl BuiltBuild {
    /// Write every chunk into `cloud_dir` using the cloud layout.
    pub fn write_chunks(&self, fs: &dyn FileSystem, cloud_dir: &Path) -> Result<(), ManifestError> {
        for (id, data) in &self.chunks {
            let path = cloud_dir.join(chunk_relative_path(id));
            fs.write(&path, data)
                .map_err(|source| ManifestError::Write { path, source })?;
        }
        Ok(())
    }
}

/// Builds a [`BuildManifest`] from file contents.
#[derive(Debug)]
pub struct ManifestBuilder {
    app_name: String,
    version: String,
    chunk_size: usize,
    files: BTreeMap<String, (Bytes, BTreeSet<String>, FileAttributes)>,
}

impl ManifestBuilder {
    pub fn new(app_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            version: version.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            files: BTreeMap::new(),
        }
    }

    /// Set the chunk size in bytes (minimum 1).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn add_file(mut self, filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.files.insert(
            filename.into(),
            (data.into(), BTreeSet::new(), FileAttributes::default()),
        );
        self
    }

    pub fn add_tagged_file(
        mut self,
        filename: impl Into<String>,
        data: impl Into<Bytes>,
        tags: &[&str],
        attributes: FileAttributes,
    ) -> Self {
        let tags = tags.iter().map(|t| t.to_string()).collect();
        self.files
            .insert(filename.into(), (data.into(), tags, attributes));
        self
    }

    /// Add every file below `root`, named by its `/`-separated relative path.
    pub fn add_directory(mut self, fs: &dyn FileSystem, root: &Path) -> Result<Self, ManifestError> {
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| ManifestError::Build {
                path: root.to_path_buf(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let data = fs.read(entry.path()).map_err(|source| ManifestError::Build {
                path: entry.path().to_path_buf(),
                source,
            })?;
            self = self.add_file(name, data);
        }
        Ok(self)
    }

    pub fn build(self) -> BuiltBuild {
        let mut manifest = BuildManifest::new(self.app_name, self.version);
        let mut chunks = BTreeMap::new();
        let mut by_hash: HashMap<String, ChunkId> = HashMap::new();

        for (filename, (data, tags, attributes)) in self.files {
            let mut parts = Vec::new();
            for start in (0..data.len()).step_by(self.chunk_size) {
                let end = (start + self.chunk_size).min(data.len());
                let slice = data.slice(start..end);
                let hash = hash_bytes(&slice);
                let id = *by_hash.entry(hash.clone()).or_insert_with(|| {
                    let id = ChunkId::new_v4();
                    manifest.chunks.insert(
                        id,
                        ChunkInfo {
                            size: slice.len() as u64,
                            hash,
                        },
                    );
                    chunks.insert(id, slice.clone());
                    id
                });
                parts.push(FilePart {
                    chunk: id,
                    offset: 0,
                    size: slice.len() as u64,
                });
            }
            manifest.files.insert(
                filename.clone(),
                FileManifestEntry {
                    filename,
                    parts,
                    size: data.len() as u64,
                    hash: hash_bytes(&data),
                    tags,
                    attributes,
                },
            );
        }

        BuiltBuild { manifest, chunks }
    }
}
