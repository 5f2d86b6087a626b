//! What to install and where.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::manifest::BuildManifest;

/// How installed files are verified after they are moved into place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyMode {
    /// SHA-256 check of every tagged file.
    ShaVerifyAllFiles,
    /// SHA-256 check of the files constructed by this installation.
    #[default]
    ShaVerifyTouchedFiles,
    /// Size check of every tagged file.
    FileSizeCheckAllFiles,
    /// Size check of the files constructed by this installation.
    FileSizeCheckTouchedFiles,
}

impl VerifyMode {
    pub fn is_sha(&self) -> bool {
        matches!(self, Self::ShaVerifyAllFiles | Self::ShaVerifyTouchedFiles)
    }

    pub fn is_all_files(&self) -> bool {
        matches!(self, Self::ShaVerifyAllFiles | Self::FileSizeCheckAllFiles)
    }
}

/// Configuration for one installation.
///
/// Built with [`InstallerConfiguration::new`] and the `with_*` setters.
#[derive(Debug, Clone)]
pub struct InstallerConfiguration {
    /// The build being installed.
    pub install_manifest: Arc<BuildManifest>,

    /// The build currently present in the install directory, if any.
    pub current_manifest: Option<Arc<BuildManifest>>,

    /// Other installed builds chunks may be recycled from, keyed by their
    /// install directory.
    pub installation_info: BTreeMap<PathBuf, Arc<BuildManifest>>,

    /// Directory the build is installed into.
    pub install_dir: PathBuf,

    /// Directory for intermediate data (staged files, chunk overflow).
    pub staging_dir: PathBuf,

    /// Directory user-modified files are backed up to before being replaced.
    pub backup_dir: Option<PathBuf>,

    /// Base URLs or local directories holding chunk files.
    pub cloud_dirs: Vec<String>,

    /// Chunk database files to read chunks from.
    pub chunk_db_files: Vec<PathBuf>,

    /// Install tags to install. Empty means every tag.
    pub install_tags: BTreeSet<String>,

    pub verify_mode: VerifyMode,

    /// Repair an existing installation of the same build.
    pub is_repair: bool,

    /// Leave constructed files in the staging directory.
    pub stage_only: bool,

    /// Run the build's prerequisite installer if this machine has not run it yet.
    pub run_required_prereqs: bool,

    /// Ini file recording prerequisites installed on this machine.
    pub machine_config_file: PathBuf,
}

impl InstallerConfiguration {
    /// Create a configuration installing `manifest` into `install_dir`.
    ///
    /// The staging directory defaults to `<install_dir>/.patching`.
    pub fn new(manifest: Arc<BuildManifest>, install_dir: PathBuf) -> Self {
        let staging_dir = install_dir.join(".patching");
        let machine_config_file = dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("chunkpatch")
            .join("machine.ini");
        Self {
            install_manifest: manifest,
            current_manifest: None,
            installation_info: BTreeMap::new(),
            install_dir,
            staging_dir,
            backup_dir: None,
            cloud_dirs: Vec::new(),
            chunk_db_files: Vec::new(),
            install_tags: BTreeSet::new(),
            verify_mode: VerifyMode::default(),
            is_repair: false,
            stage_only: false,
            run_required_prereqs: true,
            machine_config_file,
        }
    }

    /// Set the manifest of the build currently installed.
    pub fn with_current_manifest(mut self, manifest: Arc<BuildManifest>) -> Self {
        self.current_manifest = Some(manifest);
        self
    }

    /// Add an installed build chunks may be recycled from.
    pub fn with_installation(mut self, dir: PathBuf, manifest: Arc<BuildManifest>) -> Self {
        self.installation_info.insert(dir, manifest);
        self
    }

    pub fn with_staging_dir(mut self, path: PathBuf) -> Self {
        self.staging_dir = path;
        self
    }

    pub fn with_backup_dir(mut self, path: PathBuf) -> Self {
        self.backup_dir = Some(path);
        self
    }

    /// Add a cloud directory. Directories are tried in order of addition.
    pub fn with_cloud_dir(mut self, dir: impl Into<String>) -> Self {
        self.cloud_dirs.push(dir.into());
        self
    }

    pub fn with_chunk_db(mut self, path: PathBuf) -> Self {
        self.chunk_db_files.push(path);
        self
    }

    pub fn with_install_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.install_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_verify_mode(mut self, mode: VerifyMode) -> Self {
        self.verify_mode = mode;
        self
    }

    pub fn with_repair(mut self, is_repair: bool) -> Self {
        self.is_repair = is_repair;
        self
    }

    pub fn with_stage_only(mut self, stage_only: bool) -> Self {
        self.stage_only = stage_only;
        self
    }

    pub fn with_run_required_prereqs(mut self, run: bool) -> Self {
        self.run_required_prereqs = run;
        self
    }

    pub fn with_machine_config_file(mut self, path: PathBuf) -> Self {
        self.machine_config_file = path;
        self
    }

    /// Staging directory for constructed files.
    pub fn install_staging_dir(&self) -> PathBuf {
        self.staging_dir.join("Install")
    }

    /// Staging directory for disk-overflow chunk data.
    pub fn data_staging_dir(&self) -> PathBuf {
        self.staging_dir.join("PatchData")
    }
}
