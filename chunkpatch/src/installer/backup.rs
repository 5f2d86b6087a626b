//! Moving staged files into the install directory.
//!
//! Before an installed file is replaced or deleted it is copied to the backup
//! directory if the user changed it, i.e. it matches neither the installed
//! build nor the new one.

use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::checksum::file_matches_any;
use crate::fs::FileSystem;
use crate::manifest::BuildManifest;

/// Written to the install directory while staged files are being moved.
pub const MOVED_MARKER_FILE: &str = "$movedMarker";

/// Pause between attempts to move a file.
const MOVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Copies user-modified files aside before they are overwritten.
pub struct FileBackup<'a> {
    pub fs: &'a dyn FileSystem,
    pub install_dir: &'a Path,
    pub backup_dir: Option<&'a Path>,
    pub current: Option<&'a BuildManifest>,
    pub target: &'a BuildManifest,
}

impl FileBackup<'_> {
    /// Back `filename` up if it was modified. Returns the backup path.
    pub fn backup_if_modified(&self, filename: &str) -> io::Result<Option<PathBuf>> {
        let Some(backup_dir) = self.backup_dir else {
            return Ok(None);
        };
        let installed = self.install_dir.join(filename);
        if !self.fs.exists(&installed) {
            return Ok(None);
        }

        let known: Vec<&str> = [
            self.current.and_then(|m| m.file_hash(filename)),
            self.target.file_hash(filename),
        ]
        .into_iter()
        .flatten()
        .collect();
        if file_matches_any(self.fs, &installed, &known) {
            return Ok(None);
        }

        let backup = backup_dir.join(filename);
        self.fs.copy(&installed, &backup)?;
        tracing::info!(file = %filename, backup = %backup.display(), "Backed up modified file");
        Ok(Some(backup))
    }
}

/// Move `from` over `to`, retrying, then falling back to copy and delete.
pub fn move_file(fs: &dyn FileSystem, from: &Path, to: &Path, retries: u32) -> io::Result<()> {
    let mut last_error = None;
    for attempt in 0..=retries {
        if attempt > 0 {
            thread::sleep(MOVE_RETRY_DELAY);
        }
        if fs.exists(to) {
            if let Err(e) = fs.remove_file(to) {
                last_error = Some(e);
                continue;
            }
        }
        match fs.rename(from, to) {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::debug!(from = %from.display(), to = %to.display(), attempt, error = %e, "Move failed");
                last_error = Some(e);
            }
        }
    }

    tracing::warn!(
        from = %from.display(),
        to = %to.display(),
        error = ?last_error,
        "Rename kept failing, copying instead"
    );
    fs.copy(from, to)?;
    fs.remove_file(from)
}
