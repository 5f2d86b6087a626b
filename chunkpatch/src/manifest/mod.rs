//! Build manifests.
//!
//! A [`BuildManifest`] describes one version of an application as a set of
//! files, each reconstructed from an ordered list of [`FilePart`]s that slice
//! content-addressed chunks. Manifests are persisted as JSON.

mod builder;

pub use builder::{chunk_relative_path, BuiltBuild, ManifestBuilder, DEFAULT_CHUNK_SIZE};

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::fs::FileSystem;

/// Current manifest format version written by this crate.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Globally unique chunk identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(Uuid);

impl ChunkId {
    /// Generate a new random chunk identifier.
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl From<Uuid> for ChunkId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Catalog entry for a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub size: u64,
    pub hash: String,
}

/// A slice of a chunk copied into a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePart {
    pub chunk: ChunkId,
    pub offset: u64,
    pub size: u64,
}

/// File attributes applied after installation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub executable: bool,
}

impl FileAttributes {
    pub fn is_default(&self) -> bool {
        !self.read_only && !self.executable
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifestEntry {
    pub filename: String,
    pub parts: Vec<FilePart>,
    pub size: u64,
    pub hash: String,
    /// Install tags; an untagged file belongs to the empty tag.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "FileAttributes::is_default")]
    pub attributes: FileAttributes,
}

impl FileManifestEntry {
    /// Tags this file is installed under.
    pub fn effective_tags(&self) -> BTreeSet<String> {
        if self.tags.is_empty() {
            BTreeSet::from([String::new()])
        } else {
            self.tags.clone()
        }
    }
}

/// Prerequisite installer shipped with a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrereqInfo {
    pub name: String,
    /// Path of the prerequisite executable, relative to the install directory.
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Identifiers recorded as installed once the prerequisite succeeds.
    #[serde(default)]
    pub ids: Vec<String>,
}

/// Errors that can occur while loading or validating a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write manifest {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid manifest: {0}")]
    Invalid(String),

    #[error("I/O error building manifest from {path}: {source}")]
    Build {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A versioned description of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub format_version: u32,
    pub app_name: String,
    pub version: String,
    pub files: BTreeMap<String, FileManifestEntry>,
    pub chunks: BTreeMap<ChunkId, ChunkInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prereq: Option<PrereqInfo>,
}

impl BuildManifest {
    pub fn new(app_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            app_name: app_name.into(),
            version: version.into(),
            files: BTreeMap::new(),
            chunks: BTreeMap::new(),
            prereq: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ManifestError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load and validate a manifest file.
    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Self, ManifestError> {
        let data = fs.read(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Self = serde_json::from_slice(&data)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn save(&self, fs: &dyn FileSystem, path: &Path) -> Result<(), ManifestError> {
        let json = self.to_json()?;
        fs.write(path, json.as_bytes())
            .map_err(|source| ManifestError::Write {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Check that every file is fully described by catalogued chunks.
    pub fn validate(&self) -> Result<(), ManifestError> {
        for (name, file) in &self.files {
            if name != &file.filename {
                return Err(ManifestError::Invalid(format!(
                    "file key {name} does not match filename {}",
                    file.filename
                )));
            }
            let mut total = 0u64;
            for part in &file.parts {
                let info = self.chunks.get(&part.chunk).ok_or_else(|| {
                    ManifestError::Invalid(format!("{name} references unknown chunk {}", part.chunk))
                })?;
                if part.offset.saturating_add(part.size) > info.size {
                    return Err(ManifestError::Invalid(format!(
                        "{name} part exceeds chunk {} bounds",
                        part.chunk
                    )));
                }
                total += part.size;
            }
            if total != file.size {
                return Err(ManifestError::Invalid(format!(
                    "{name} parts sum to {total} bytes but file size is {}",
                    file.size
                )));
            }
        }
        Ok(())
    }

    pub fn file(&self, filename: &str) -> Option<&FileManifestEntry> {
        self.files.get(filename)
    }

    /// All filenames, path-sorted.
    pub fn file_list(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    pub fn file_size(&self, filename: &str) -> Option<u64> {
        self.files.get(filename).map(|f| f.size)
    }

    pub fn file_hash(&self, filename: &str) -> Option<&str> {
        self.files.get(filename).map(|f| f.hash.as_str())
    }

    pub fn chunk_info(&self, id: &ChunkId) -> Option<&ChunkInfo> {
        self.chunks.get(id)
    }

    /// Every tag used by the build, including the empty tag when any file is
    /// untagged.
    pub fn tag_list(&self) -> BTreeSet<String> {
        self.files
            .values()
            .flat_map(|f| f.effective_tags())
            .collect()
    }

    /// Files installed by any of `tags`.
    pub fn tagged_files(&self, tags: &BTreeSet<String>) -> BTreeSet<String> {
        self.files
            .values()
            .filter(|f| f.effective_tags().iter().any(|t| tags.contains(t)))
            .map(|f| f.filename.clone())
            .collect()
    }

    /// Total size of the given files.
    pub fn file_set_size<'a>(&self, files: impl IntoIterator<Item = &'a String>) -> u64 {
        files
            .into_iter()
            .filter_map(|f| self.file_size(f))
            .sum()
    }

    /// Chunks referenced by the given files.
    pub fn chunks_for_files<'a>(&self, files: impl IntoIterator<Item = &'a String>) -> HashSet<ChunkId> {
        files
            .into_iter()
            .filter_map(|f| self.files.get(f))
            .flat_map(|f| f.parts.iter().map(|p| p.chunk))
            .collect()
    }

    pub fn has_file_attributes(&self) -> bool {
        self.files.values().any(|f| !f.attributes.is_default())
    }

    /// True if `filename` differs between `old` and this manifest.
    pub fn is_file_outdated(&self, old: &BuildManifest, filename: &str) -> bool {
        match (old.file_hash(filename), self.file_hash(filename)) {
            (Some(old_hash), Some(new_hash)) => old_hash != new_hash,
            _ => true,
        }
    }

    /// Files that must be (re)constructed to turn `install_dir` into this
    /// build.
    ///
    /// Without a previous manifest every file is outdated. Otherwise a file is
    /// outdated when its content changed, or when the installed copy is
    /// missing or has the wrong size.
    pub fn outdated_files(
        &self,
        old: Option<&BuildManifest>,
        install_dir: &Path,
        fs: &dyn FileSystem,
    ) -> BTreeSet<String> {
        let Some(old) = old else {
            return self.files.keys().cloned().collect();
        };
        self.files
            .values()
            .filter(|file| {
                self.is_file_outdated(old, &file.filename)
                    || fs.file_size(&install_dir.join(&file.filename)) != Some(file.size)
            })
            .map(|file| file.filename.clone())
            .collect()
    }

    /// Files of `old` that no longer exist in this build.
    pub fn removable_files(&self, old: &BuildManifest) -> Vec<String> {
        old.files
            .keys()
            .filter(|name| !self.files.contains_key(*name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::checksum::hash_bytes;

    /// Build a manifest whose files are made of whole chunks, one chunk per
    /// `(id, content)` entry.
    pub fn manifest_with_files(files: &[(&str, &[(u128, &str)])]) -> BuildManifest {
        let mut manifest = BuildManifest::new("TestApp", "1.0");
        for (name, parts) in files {
            let mut entry_parts = Vec::new();
            let mut content = Vec::new();
            for (id, data) in *parts {
                let data = data.as_bytes();
                let id = ChunkId::from_u128(*id);
                manifest.chunks.insert(
                    id,
                    ChunkInfo {
                        size: data.len() as u64,
                        hash: hash_bytes(data),
                    },
                );
                entry_parts.push(FilePart {
                    chunk: id,
                    offset: 0,
                    size: data.len() as u64,
                });
                content.extend_from_slice(data);
            }
            manifest.files.insert(
                name.to_string(),
                FileManifestEntry {
                    filename: name.to_string(),
                    parts: entry_parts,
                    size: content.len() as u64,
                    hash: hash_bytes(&content),
                    tags: BTreeSet::new(),
                    attributes: FileAttributes::default(),
                },
            );
        }
        manifest
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::manifest_with_files;
    use super::*;
    use crate::fs::LocalFileSystem;
    use tempfile::TempDir;

    #[test]
    fn test_json_roundtrip_preserves_chunk_keys() {
        let manifest = manifest_with_files(&[("a.txt", &[(1, "hello")])]);
        let json = manifest.to_json().unwrap();

        assert!(json.contains(&ChunkId::from_u128(1).as_uuid().to_string()));
        assert_eq!(BuildManifest::from_json(&json).unwrap(), manifest);
    }

    #[test]
    fn test_validate_rejects_unknown_chunk() {
        let mut manifest = manifest_with_files(&[("a.txt", &[(1, "hello")])]);
        manifest.chunks.clear();

        assert!(matches!(manifest.validate(), Err(ManifestError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_size_mismatch() {
        let mut manifest = manifest_with_files(&[("a.txt", &[(1, "hello")])]);
        manifest.files.get_mut("a.txt").unwrap().size = 99;

        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_tags_and_tagged_files() {
        let mut manifest = manifest_with_files(&[
            ("base.txt", &[(1, "a")]),
            ("hd/tex.bin", &[(2, "b")]),
        ]);
        manifest
            .files
            .get_mut("hd/tex.bin")
            .unwrap()
            .tags
            .insert("hd".to_string());

        let tags = manifest.tag_list();
        assert_eq!(tags, BTreeSet::from([String::new(), "hd".to_string()]));

        let base_only = manifest.tagged_files(&BTreeSet::from([String::new()]));
        assert_eq!(base_only, BTreeSet::from(["base.txt".to_string()]));

        let all = manifest.tagged_files(&tags);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_outdated_files_without_old_manifest() {
        let manifest = manifest_with_files(&[("a", &[(1, "x")]), ("b", &[(2, "y")])]);
        let temp = TempDir::new().unwrap();

        let outdated = manifest.outdated_files(None, temp.path(), &LocalFileSystem);
        assert_eq!(outdated.len(), 2);
    }

    #[test]
    fn test_outdated_files_with_old_manifest() {
        let old = manifest_with_files(&[("same", &[(1, "x")]), ("changed", &[(2, "y")])]);
        let new = manifest_with_files(&[
            ("same", &[(1, "x")]),
            ("changed", &[(3, "z!")]),
            ("added", &[(4, "w")]),
        ]);
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("same"), b"x").unwrap();
        std::fs::write(temp.path().join("changed"), b"y").unwrap();

        let outdated = new.outdated_files(Some(&old), temp.path(), &LocalFileSystem);
        assert_eq!(
            outdated,
            BTreeSet::from(["added".to_string(), "changed".to_string()])
        );

        // An unchanged file with the wrong size on disk is outdated too
        std::fs::write(temp.path().join("same"), b"xx").unwrap();
        let outdated = new.outdated_files(Some(&old), temp.path(), &LocalFileSystem);
        assert!(outdated.contains("same"));
    }

    #[test]
    fn test_removable_files() {
        let old = manifest_with_files(&[("keep", &[(1, "x")]), ("gone", &[(2, "y")])]);
        let new = manifest_with_files(&[("keep", &[(1, "x")])]);

        assert_eq!(new.removable_files(&old), vec!["gone".to_string()]);
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.manifest");
        let manifest = manifest_with_files(&[("a.txt", &[(1, "hello"), (2, " world")])]);

        manifest.save(&LocalFileSystem, &path).unwrap();
        let loaded = BuildManifest::load(&LocalFileSystem, &path).unwrap();

        assert_eq!(loaded, manifest);
        assert_eq!(loaded.file_size("a.txt"), Some(11));
    }

    #[test]
    fn test_load_missing_file() {
        let result = BuildManifest::load(&LocalFileSystem, Path::new("/nonexistent/manifest.json"));
        assert!(matches!(result, Err(ManifestError::Read { .. })));
    }
}
