//! Builds target files in the staging directory from chunk data.
//!
//! Files are constructed one at a time in path order. Each file is written
//! part by part from the chained chunk source while its SHA-256 is computed;
//! the finished file must match the manifest's size and hash.
//!
//! A `$resumeData` marker in the staging directory records which build the
//! staged files belong to. When a later attempt finds the marker for the same
//! build, staged files that already match are kept.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::checksum::calculate_file_checksum;
use crate::chunks::ChunkReferenceTracker;
use crate::control::{ControlFlags, Controllable};
use crate::fs::FileSystem;
use crate::installer::{BuildProgress, InstallState};
use crate::manifest::{BuildManifest, ChunkId, FileManifestEntry};
use crate::source::{ChunkSource, ChunkSourceError};
use crate::stats::InstallerStatistics;

/// Marker file naming the build the staging directory belongs to.
pub const RESUME_DATA_FILE: &str = "$resumeData";

/// Longest staged path accepted.
#[cfg(windows)]
pub const MAX_PATH_LENGTH: usize = 260;
#[cfg(not(windows))]
pub const MAX_PATH_LENGTH: usize = 4096;

#[derive(Debug, Error)]
pub enum ConstructError {
    #[error("construction aborted")]
    Aborted,

    #[error("staged path too long ({length} characters): {path}")]
    PathTooLong { path: PathBuf, length: usize },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("chunk {chunk} needed by {file} is not available")]
    MissingChunk { file: String, chunk: ChunkId },

    #[error("chunk {chunk} is too small for the part of {file} it backs")]
    PartOutOfRange { file: String, chunk: ChunkId },

    #[error("chunk {chunk} for {file}: {source}")]
    Source {
        file: String,
        chunk: ChunkId,
        #[source]
        source: ChunkSourceError,
    },

    #[error("{file} is {actual} bytes, expected {expected}")]
    SizeMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },

    #[error("{file} does not match its manifest hash")]
    HashMismatch { file: String },
}

impl ConstructError {
    /// True when a chunk could not be downloaded.
    pub fn is_download_failure(&self) -> bool {
        matches!(
            self,
            Self::Source {
                source: ChunkSourceError::DownloadFailed { .. },
                ..
            }
        )
    }

    /// True when construction stopped because it was aborted.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            Self::Aborted
                | Self::Source {
                    source: ChunkSourceError::Aborted,
                    ..
                }
        )
    }

    /// Short reason used in installer error codes.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Aborted => "Aborted",
            Self::PathTooLong { .. } => "PathTooLong",
            Self::Write { .. } => "WriteFailed",
            Self::MissingChunk { .. } => "MissingChunk",
            Self::PartOutOfRange { .. } => "PartOutOfRange",
            Self::Source { source, .. } => match source {
                ChunkSourceError::Aborted => "Aborted",
                ChunkSourceError::DownloadFailed { .. } => "ChunkDownloadFailed",
                ChunkSourceError::Store(_) => "ChunkStoreFailed",
            },
            Self::SizeMismatch { .. } => "SizeMismatch",
            Self::HashMismatch { .. } => "HashMismatch",
        }
    }
}

/// What a construction run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstructionSummary {
    pub constructed: Vec<String>,
    /// Files found already staged by an earlier attempt.
    pub resumed: Vec<String>,
    pub bytes_constructed: u64,
}

pub struct FileConstructor {
    manifest: Arc<BuildManifest>,
    files: Vec<String>,
    staging_dir: PathBuf,
    source: Arc<dyn ChunkSource>,
    tracker: Arc<ChunkReferenceTracker>,
    fs: Arc<dyn FileSystem>,
    stats: Arc<InstallerStatistics>,
    progress: Arc<BuildProgress>,
    flags: ControlFlags,
}

impl FileConstructor {
    /// `files` are constructed in sorted order regardless of the order given.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manifest: Arc<BuildManifest>,
        files: impl IntoIterator<Item = String>,
        staging_dir: PathBuf,
        source: Arc<dyn ChunkSource>,
        tracker: Arc<ChunkReferenceTracker>,
        fs: Arc<dyn FileSystem>,
        stats: Arc<InstallerStatistics>,
        progress: Arc<BuildProgress>,
    ) -> Self {
        let mut files: Vec<String> = files.into_iter().collect();
        files.sort();
        files.dedup();
        Self {
            manifest,
            files,
            staging_dir,
            source,
            tracker,
            fs,
            stats,
            progress,
            flags: ControlFlags::new(),
        }
    }

    pub fn staged_path(&self, filename: &str) -> PathBuf {
        self.staging_dir.join(filename)
    }

    /// Construct every file, stopping at the first failure.
    pub fn run(&self) -> Result<ConstructionSummary, ConstructError> {
        let mut summary = ConstructionSummary::default();
        let total_bytes = self.manifest.file_set_size(self.files.iter()).max(1);
        let mut done_bytes = 0u64;

        self.check_path_lengths()?;
        self.progress.set_state(InstallState::Resuming);
        let resumable = self.prepare_staging()?;

        let mut resumed = HashSet::new();
        for name in &self.files {
            let Some(file) = self.manifest.file(name) else {
                continue;
            };
            if resumable && self.is_staged(file) {
                for part in &file.parts {
                    self.tracker.consume_next_use(&part.chunk);
                }
                done_bytes += file.size;
                resumed.insert(name.as_str());
                summary.resumed.push(name.clone());
                tracing::debug!(file = %name, "Keeping staged file");
            }
        }
        self.progress.set_state_progress(InstallState::Resuming, 1.0);
        self.progress
            .set_state_progress(InstallState::Installing, done_bytes as f64 / total_bytes as f64);
        if !summary.resumed.is_empty() {
            tracing::info!(files = summary.resumed.len(), "Resuming from staged files");
        }

        self.progress.set_state(InstallState::Installing);
        for name in &self.files {
            if resumed.contains(name.as_str()) {
                continue;
            }
            let Some(file) = self.manifest.file(name) else {
                continue;
            };
            if !self.flags.wait_while_paused() {
                return Err(ConstructError::Aborted);
            }

            self.construct_file(file, &mut done_bytes, total_bytes)?;
            summary.constructed.push(name.clone());
            summary.bytes_constructed += file.size;
            self.stats.record_file_constructed();
        }

        self.progress.set_state_progress(InstallState::Installing, 1.0);
        tracing::info!(
            constructed = summary.constructed.len(),
            resumed = summary.resumed.len(),
            bytes = summary.bytes_constructed,
            "File construction complete"
        );
        Ok(summary)
    }

    /// Reject the run before anything is written if any staged path would be
    /// too long.
    fn check_path_lengths(&self) -> Result<(), ConstructError> {
        for name in &self.files {
            let path = self.staged_path(name);
            let length = path.as_os_str().len();
            if length > MAX_PATH_LENGTH {
                return Err(ConstructError::PathTooLong { path, length });
            }
        }
        Ok(())
    }

    /// Make sure the staging directory belongs to this build.
    ///
    /// Returns true when staged files from an earlier attempt may be kept.
    fn prepare_staging(&self) -> Result<bool, ConstructError> {
        let marker = self.staging_dir.join(RESUME_DATA_FILE);
        let resumable = self
            .fs
            .read(&marker)
            .ok()
            .and_then(|data| String::from_utf8(data).ok())
            .is_some_and(|version| version.trim() == self.manifest.version);

        if !resumable && self.fs.is_dir(&self.staging_dir) {
            tracing::debug!(dir = %self.staging_dir.display(), "Clearing stale staging directory");
            self.fs
                .remove_dir_all(&self.staging_dir)
                .map_err(|source| ConstructError::Write {
                    path: self.staging_dir.clone(),
                    source,
                })?;
        }

        self.fs
            .write(&marker, self.manifest.version.as_bytes())
            .map_err(|source| ConstructError::Write {
                path: marker.clone(),
                source,
            })?;
        Ok(resumable)
    }

    fn is_staged(&self, file: &FileManifestEntry) -> bool {
        let path = self.staged_path(&file.filename);
        self.fs.file_size(&path) == Some(file.size)
            && calculate_file_checksum(self.fs.as_ref(), &path)
                .is_ok_and(|hash| hash.eq_ignore_ascii_case(&file.hash))
    }

    fn construct_file(
        &self,
        file: &FileManifestEntry,
        done_bytes: &mut u64,
        total_bytes: u64,
    ) -> Result<(), ConstructError> {
        let path = self.staged_path(&file.filename);
        tracing::debug!(file = %file.filename, size = file.size, "Constructing file");
        let result = self.write_file(file, &path, done_bytes, total_bytes);
        match &result {
            // Left in place; the next attempt rewrites it
            Err(ConstructError::Aborted) => {}
            Err(ConstructError::Source {
                source: ChunkSourceError::Aborted,
                ..
            }) => {}
            Err(e) => {
                tracing::warn!(file = %file.filename, error = %e, "File construction failed");
                if let Err(remove_err) = self.fs.remove_file(&path) {
                    if self.fs.exists(&path) {
                        tracing::warn!(path = %path.display(), error = %remove_err, "Could not remove partial file");
                    }
                }
            }
            Ok(()) => {}
        }
        result
    }

    fn write_file(
        &self,
        file: &FileManifestEntry,
        path: &Path,
        done_bytes: &mut u64,
        total_bytes: u64,
    ) -> Result<(), ConstructError> {
        let write_err = |source| ConstructError::Write {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = self.fs.create_write(path).map_err(write_err)?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;

        for part in &file.parts {
            if !self.flags.wait_while_paused() {
                return Err(ConstructError::Aborted);
            }

            let chunk = self
                .source
                .get(&part.chunk)
                .map_err(|source| ConstructError::Source {
                    file: file.filename.clone(),
                    chunk: part.chunk,
                    source,
                })?
                .ok_or_else(|| ConstructError::MissingChunk {
                    file: file.filename.clone(),
                    chunk: part.chunk,
                })?;

            let start = part.offset as usize;
            let end = start.saturating_add(part.size as usize);
            let Some(slice) = chunk.data().get(start..end) else {
                return Err(ConstructError::PartOutOfRange {
                    file: file.filename.clone(),
                    chunk: part.chunk,
                });
            };

            writer.write_all(slice).map_err(write_err)?;
            hasher.update(slice);
            self.tracker.consume_next_use(&part.chunk);

            written += part.size;
            *done_bytes += part.size;
            self.stats.add_bytes_constructed(part.size);
            self.progress
                .set_state_progress(InstallState::Installing, *done_bytes as f64 / total_bytes as f64);
        }
        writer.flush().map_err(write_err)?;
        drop(writer);

        if written != file.size {
            return Err(ConstructError::SizeMismatch {
                file: file.filename.clone(),
                expected: file.size,
                actual: written,
            });
        }
        let hash = format!("{:x}", hasher.finalize());
        if !hash.eq_ignore_ascii_case(&file.hash) {
            return Err(ConstructError::HashMismatch {
                file: file.filename.clone(),
            });
        }
        Ok(())
    }
}

impl Controllable for FileConstructor {
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
    use crate::chunks::ChunkData;
    use crate::fs::LocalFileSystem;
    use crate::manifest::test_support::manifest_with_files;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use tempfile::TempDir;

    /// Serves chunks from a map and counts requests.
    struct MapSource {
        chunks: HashMap<ChunkId, Arc<ChunkData>>,
        requests: Mutex<Vec<ChunkId>>,
    }

    impl MapSource {
        fn from_manifest_data(entries: &[(u128, &str)]) -> Arc<Self> {
            Arc::new(Self {
                chunks: entries
                    .iter()
                    .map(|(n, d)| {
                        let id = ChunkId::from_u128(*n);
                        (id, Arc::new(ChunkData::new(id, d.as_bytes().to_vec())))
                    })
                    .collect(),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    impl ChunkSource for MapSource {
        fn available_chunks(&self) -> HashSet<ChunkId> {
            self.chunks.keys().copied().collect()
        }

        fn get(&self, id: &ChunkId) -> Result<Option<Arc<ChunkData>>, ChunkSourceError> {
            self.requests.lock().push(*id);
            Ok(self.chunks.get(id).cloned())
        }
    }

    fn constructor(
        manifest: &Arc<BuildManifest>,
        staging: &Path,
        source: Arc<MapSource>,
    ) -> (FileConstructor, Arc<ChunkReferenceTracker>) {
        let files = manifest.file_list();
        let tracker = Arc::new(ChunkReferenceTracker::new(manifest, &files));
        let constructor = FileConstructor::new(
            Arc::clone(manifest),
            files,
            staging.to_path_buf(),
            source as Arc<dyn ChunkSource>,
            Arc::clone(&tracker),
            Arc::new(LocalFileSystem),
            Arc::new(InstallerStatistics::new()),
            Arc::new(BuildProgress::new()),
        );
        (constructor, tracker)
    }

    fn sample() -> Arc<BuildManifest> {
        Arc::new(manifest_with_files(&[
            ("bin/app", &[(1, "head-"), (2, "tail")]),
            ("data/readme.txt", &[(2, "tail")]),
        ]))
    }

    #[test]
    fn test_constructs_all_files() {
        let temp = TempDir::new().unwrap();
        let manifest = sample();
        let source = MapSource::from_manifest_data(&[(1, "head-"), (2, "tail")]);
        let (constructor, tracker) = constructor(&manifest, temp.path(), Arc::clone(&source));

        let summary = constructor.run().unwrap();

        assert_eq!(summary.constructed, vec!["bin/app", "data/readme.txt"]);
        assert_eq!(std::fs::read(temp.path().join("bin/app")).unwrap(), b"head-tail");
        assert_eq!(std::fs::read(temp.path().join("data/readme.txt")).unwrap(), b"tail");
        assert!(tracker.get_referenced_chunks().is_empty());
        assert_eq!(
            std::fs::read_to_string(temp.path().join(RESUME_DATA_FILE)).unwrap(),
            "1.0"
        );
    }

    #[test]
    fn test_missing_chunk_removes_partial_file() {
        let temp = TempDir::new().unwrap();
        let manifest = sample();
        let source = MapSource::from_manifest_data(&[(1, "head-")]);
        let (constructor, _) = constructor(&manifest, temp.path(), source);

        let err = constructor.run().unwrap_err();

        assert!(matches!(err, ConstructError::MissingChunk { .. }));
        assert!(!temp.path().join("bin/app").exists());
    }

    #[test]
    fn test_wrong_chunk_content_fails_hash() {
        let temp = TempDir::new().unwrap();
        let manifest = sample();
        let source = MapSource::from_manifest_data(&[(1, "HEAD-"), (2, "tail")]);
        let (constructor, _) = constructor(&manifest, temp.path(), source);

        assert!(matches!(
            constructor.run().unwrap_err(),
            ConstructError::HashMismatch { .. }
        ));
    }

    #[test]
    fn test_resume_keeps_matching_staged_files() {
        let temp = TempDir::new().unwrap();
        let manifest = sample();

        let full = MapSource::from_manifest_data(&[(1, "head-"), (2, "tail")]);
        let (first, _) = constructor(&manifest, temp.path(), full);
        first.run().unwrap();
        std::fs::write(temp.path().join("data/readme.txt"), b"torn").unwrap();

        let source = MapSource::from_manifest_data(&[(1, "head-"), (2, "tail")]);
        let (second, tracker) = constructor(&manifest, temp.path(), Arc::clone(&source));
        let summary = second.run().unwrap();

        assert_eq!(summary.resumed, vec!["bin/app"]);
        assert_eq!(summary.constructed, vec!["data/readme.txt"]);
        assert_eq!(source.requests.lock().as_slice(), &[ChunkId::from_u128(2)]);
        assert!(tracker.get_referenced_chunks().is_empty());
    }

    #[test]
    fn test_stale_staging_for_other_version_cleared() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(RESUME_DATA_FILE), "0.9").unwrap();
        std::fs::create_dir_all(temp.path().join("bin")).unwrap();
        std::fs::write(temp.path().join("bin/app"), b"head-tail").unwrap();
        std::fs::write(temp.path().join("leftover"), b"old").unwrap();

        let manifest = sample();
        let source = MapSource::from_manifest_data(&[(1, "head-"), (2, "tail")]);
        let (constructor, _) = constructor(&manifest, temp.path(), source);
        let summary = constructor.run().unwrap();

        assert!(summary.resumed.is_empty());
        assert!(!temp.path().join("leftover").exists());
    }

    #[test]
    fn test_long_path_fails_before_anything_is_written() {
        let temp = TempDir::new().unwrap();
        let long_name = format!("zz/{}", "x".repeat(MAX_PATH_LENGTH));
        let manifest = Arc::new(manifest_with_files(&[
            ("a.txt", &[(1, "head-")]),
            (long_name.as_str(), &[(2, "tail")]),
        ]));
        let source = MapSource::from_manifest_data(&[(1, "head-"), (2, "tail")]);
        let (constructor, _) = constructor(&manifest, temp.path(), Arc::clone(&source));

        let err = constructor.run().unwrap_err();

        assert!(matches!(err, ConstructError::PathTooLong { .. }));
        assert_eq!(err.reason(), "PathTooLong");
        assert!(!temp.path().join("a.txt").exists());
        assert!(!temp.path().join(RESUME_DATA_FILE).exists());
        assert!(source.requests.lock().is_empty());
    }

    #[test]
    fn test_abort_stops_construction() {
        let temp = TempDir::new().unwrap();
        let manifest = sample();
        let source = MapSource::from_manifest_data(&[(1, "head-"), (2, "tail")]);
        let (constructor, _) = constructor(&manifest, temp.path(), source);

        constructor.abort();
        assert!(matches!(constructor.run().unwrap_err(), ConstructError::Aborted));
    }
}
