//! Build verification.

use std::path::PathBuf;
use std::sync::Arc;

use crate::checksum::calculate_file_checksum;
use crate::control::{ControlFlags, Controllable};
use crate::fs::FileSystem;
use crate::manifest::BuildManifest;

use super::progress::{BuildProgress, InstallState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFailureKind {
    Missing,
    SizeMismatch,
    HashMismatch,
}

impl VerifyFailureKind {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Missing => "MissingFile",
            Self::SizeMismatch => "SizeMismatch",
            Self::HashMismatch => "HashMismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyFailure {
    pub file: String,
    pub kind: VerifyFailureKind,
}

/// Checks files in a directory against the manifest, by size or by SHA-256.
pub struct Verifier {
    fs: Arc<dyn FileSystem>,
    manifest: Arc<BuildManifest>,
    dir: PathBuf,
    files: Vec<String>,
    use_sha: bool,
    progress: Arc<BuildProgress>,
    flags: ControlFlags,
}

impl Verifier {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        manifest: Arc<BuildManifest>,
        dir: PathBuf,
        files: impl IntoIterator<Item = String>,
        use_sha: bool,
        progress: Arc<BuildProgress>,
    ) -> Self {
        let mut files: Vec<String> = files.into_iter().collect();
        files.sort();
        Self {
            fs,
            manifest,
            dir,
            files,
            use_sha,
            progress,
            flags: ControlFlags::new(),
        }
    }

    /// Verify every file. `None` if aborted.
    pub fn run(&self) -> Option<Vec<VerifyFailure>> {
        let total = self.manifest.file_set_size(self.files.iter()).max(1);
        let mut checked = 0u64;
        let mut failures = Vec::new();

        for name in &self.files {
            if !self.flags.wait_while_paused() {
                return None;
            }
            let Some(file) = self.manifest.file(name) else {
                continue;
            };

            let path = self.dir.join(name);
            let failure = match self.fs.file_size(&path) {
                None => Some(VerifyFailureKind::Missing),
                Some(size) if size != file.size => Some(VerifyFailureKind::SizeMismatch),
                Some(_) if self.use_sha => match calculate_file_checksum(self.fs.as_ref(), &path) {
                    Ok(hash) if hash.eq_ignore_ascii_case(&file.hash) => None,
                    Ok(_) => Some(VerifyFailureKind::HashMismatch),
                    Err(e) => {
                        tracing::warn!(file = %name, error = %e, "Could not hash file");
                        Some(VerifyFailureKind::Missing)
                    }
                },
                Some(_) => None,
            };
            if let Some(kind) = failure {
                tracing::warn!(file = %name, reason = kind.reason(), "File failed verification");
                failures.push(VerifyFailure {
                    file: name.clone(),
                    kind,
                });
            }

            checked += file.size;
            self.progress
                .set_state_progress(InstallState::BuildVerification, checked as f64 / total as f64);
        }

        self.progress.set_state_progress(InstallState::BuildVerification, 1.0);
        tracing::info!(
            files = self.files.len(),
            failed = failures.len(),
            sha = self.use_sha,
            "Verification complete"
        );
        Some(failures)
    }
}

impl Controllable for Verifier {
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
    use tempfile::TempDir;

    fn verifier(dir: &std::path::Path, use_sha: bool) -> Verifier {
        let manifest = Arc::new(manifest_with_files(&[
            ("good", &[(1, "good")]),
            ("missing", &[(2, "gone")]),
            ("resized", &[(3, "abc")]),
            ("tampered", &[(4, "same")]),
        ]));
        std::fs::write(dir.join("good"), "good").unwrap();
        std::fs::write(dir.join("resized"), "abcdef").unwrap();
        std::fs::write(dir.join("tampered"), "SAME").unwrap();
        let files = manifest.file_list();
        Verifier::new(
            Arc::new(LocalFileSystem),
            manifest,
            dir.to_path_buf(),
            files,
            use_sha,
            Arc::new(BuildProgress::new()),
        )
    }

    #[test]
    fn test_sha_verification() {
        let temp = TempDir::new().unwrap();
        let failures = verifier(temp.path(), true).run().unwrap();

        assert_eq!(
            failures,
            vec![
                VerifyFailure {
                    file: "missing".into(),
                    kind: VerifyFailureKind::Missing
                },
                VerifyFailure {
                    file: "resized".into(),
                    kind: VerifyFailureKind::SizeMismatch
                },
                VerifyFailure {
                    file: "tampered".into(),
                    kind: VerifyFailureKind::HashMismatch
                },
            ]
        );
    }

    #[test]
    fn test_size_only_misses_same_size_edit() {
        let temp = TempDir::new().unwrap();
        let failures = verifier(temp.path(), false).run().unwrap();

        let names: Vec<&str> = failures.iter().map(|f| f.file.as_str()).collect();
        assert_eq!(names, vec!["missing", "resized"]);
    }

    #[test]
    fn test_aborted_verification() {
        let temp = TempDir::new().unwrap();
        let verifier = verifier(temp.path(), true);
        verifier.abort();
        assert!(verifier.run().is_none());
    }
}
