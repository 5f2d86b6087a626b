//! The installation pipeline, run on the installer's worker thread.
//!
//! ```text
//!   Initialize
//!       │
//!       ▼
//!   ┌─► RunInstallation ─────(resume detected)─────┐
//!   │        │                                     │
//!   │        ▼                                     │
//!   │   BackupAndMove ◄────────────────────────────┘
//!   │        │
//!   │        ▼
//!   │   FileAttributes
//!   │        │
//!   │        ▼
//!   └── Verification  (failed files are rebuilt by the next attempt)
//!            │
//!            ▼
//!     Prerequisites ──► CleanUp ──► Completed
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use super::attributes::apply_file_attributes;
use super::backup::{move_file, FileBackup, MOVED_MARKER_FILE};
use super::error::InstallErrorKind;
use super::prereq::run_prerequisites;
use super::progress::InstallState;
use super::timer::StageTimer;
use super::verify::Verifier;
use super::Shared;
use crate::chunks::{
    ChunkReferenceTracker, DiskChunkStore, MemoryChunkStore, ReferencedChunkEvictionPolicy,
};
use crate::config::{InstallerConfiguration, VerifyMode};
use crate::constructor::{ConstructError, ConstructionSummary, FileConstructor, RESUME_DATA_FILE};
use crate::control::ControlFlags;
use crate::fs::remove_empty_directories;
use crate::manifest::{BuildManifest, ChunkId};
use crate::message::{InstallerMessage, MessageSender};
use crate::source::{
    initial_download_set, ChainedChunkSource, ChunkDbChunkSource, ChunkDbSourceConfig,
    ChunkSource, CloudChunkSource, CloudSourceConfig, InstallChunkSource, InstallSourceConfig,
};

/// Serializes pipeline runs across every installer in the process.
static RUN_LOCK: Mutex<()> = parking_lot::const_mutex(());

#[derive(Debug, Default)]
struct Timers {
    initialize: StageTimer,
    construct: StageTimer,
    move_from_stage: StageTimer,
    attributes: StageTimer,
    verify: StageTimer,
    clean_up: StageTimer,
    prereq: StageTimer,
    process: StageTimer,
}

/// Run the whole pipeline. Returns true on success.
pub(super) fn run(shared: &Shared) -> bool {
    let _lock = RUN_LOCK.lock();
    Pipeline::new(shared).run()
}

struct Pipeline<'a> {
    shared: &'a Shared,
    messages: MessageSender,
    timers: Timers,
    /// Files selected by the install tags.
    tagged_files: BTreeSet<String>,
    /// Files the next installation attempt must build.
    files_to_construct: BTreeSet<String>,
    /// Files written by any attempt so far.
    touched_files: BTreeSet<String>,
    resume_to_verification: bool,
}

impl<'a> Pipeline<'a> {
    fn new(shared: &'a Shared) -> Self {
        Self {
            shared,
            messages: shared.messages.sender(),
            timers: Timers::default(),
            tagged_files: BTreeSet::new(),
            files_to_construct: BTreeSet::new(),
            touched_files: BTreeSet::new(),
            resume_to_verification: false,
        }
    }

    fn run(mut self) -> bool {
        let manifest = &self.shared.config.install_manifest;
        tracing::info!(
            app = %manifest.app_name,
            version = %manifest.version,
            install_dir = %self.shared.config.install_dir.display(),
            "Installation started"
        );
        self.timers.process.start();

        let mut success = !self.has_error() && self.initialize();
        if success {
            success = self.run_attempts();
        }
        if success {
            success = self.run_prerequisites();
        }
        self.clean_up(success);

        self.timers.process.stop();
        self.finish(success);
        success
    }

    fn enter(&self, state: InstallState) {
        self.shared.progress.set_state(state);
        self.messages.send(InstallerMessage::StageStarted(state));
        tracing::info!(stage = state.name(), "Install stage started");
    }

    fn fail(&self, kind: InstallErrorKind, reason: &str, text: impl Into<String>) -> bool {
        self.shared.error.set_error(kind, reason, text);
        false
    }

    fn has_error(&self) -> bool {
        self.shared.error.error().is_some()
    }

    /// Where finished files end up.
    fn output_dir(&self) -> PathBuf {
        let config = &self.shared.config;
        if config.stage_only {
            config.install_staging_dir()
        } else {
            config.install_dir.clone()
        }
    }

    fn initialize(&mut self) -> bool {
        self.timers.initialize.start();
        self.enter(InstallState::Initializing);
        let ok = self.check_configuration();
        self.timers.initialize.stop();
        if ok {
            self.shared
                .progress
                .set_state_progress(InstallState::Initializing, 1.0);
        }
        ok
    }

    fn check_configuration(&mut self) -> bool {
        let shared = self.shared;
        let config = &shared.config;
        let fs = shared.fs.as_ref();
        let manifest = &config.install_manifest;

        if config.install_dir.as_os_str().is_empty() {
            return self.fail(
                InstallErrorKind::InitializationError,
                "MissingInstallDirectory",
                "No install directory was configured",
            );
        }
        if config.staging_dir.as_os_str().is_empty() {
            return self.fail(
                InstallErrorKind::InitializationError,
                "MissingStageDirectory",
                "No staging directory was configured",
            );
        }
        if let Err(e) = manifest.validate() {
            return self.fail(
                InstallErrorKind::InitializationError,
                "InvalidManifest",
                e.to_string(),
            );
        }
        if fs.exists(&config.install_dir) && !fs.is_dir(&config.install_dir) {
            return self.fail(
                InstallErrorKind::InitializationError,
                "InstallDirectoryIsFile",
                format!("{} is not a directory", config.install_dir.display()),
            );
        }
        for dir in [&config.install_dir, &config.staging_dir] {
            if let Err(e) = fs.create_dir_all(dir) {
                return self.fail(
                    InstallErrorKind::InitializationError,
                    "CreateDirectory",
                    format!("Could not create {}: {}", dir.display(), e),
                );
            }
        }

        self.tagged_files = if config.install_tags.is_empty() {
            manifest.files.keys().cloned().collect()
        } else {
            manifest.tagged_files(&config.install_tags)
        };

        let current = config.current_manifest.as_deref();
        let outdated = manifest.outdated_files(current, &config.install_dir, fs);
        self.files_to_construct = outdated
            .intersection(&self.tagged_files)
            .cloned()
            .collect();
        self.resume_to_verification = self.detect_resume();

        let mut stats = shared.build_stats.lock();
        stats.app_name = manifest.app_name.clone();
        stats.app_installed_version = current.map(|m| m.version.clone()).unwrap_or_default();
        stats.app_patch_version = manifest.version.clone();
        stats.cloud_directories = config.cloud_dirs.clone();
        stats.num_files_in_build = manifest.files.len() as u64;
        stats.num_files_outdated = self.files_to_construct.len() as u64;
        stats.num_files_to_remove = current.map_or(0, |c| manifest.removable_files(c).len() as u64);
        drop(stats);

        tracing::info!(
            tagged = self.tagged_files.len(),
            outdated = self.files_to_construct.len(),
            resume = self.resume_to_verification,
            "Installation initialized"
        );
        true
    }

    /// True when an earlier attempt got far enough that verification should
    /// run before anything is rebuilt.
    fn detect_resume(&self) -> bool {
        let config = &self.shared.config;
        let fs = self.shared.fs.as_ref();

        if fs.exists(&config.install_dir.join(MOVED_MARKER_FILE)) {
            tracing::info!("Found moved marker from an earlier attempt");
            return true;
        }
        if config.current_manifest.is_some() || config.stage_only {
            return false;
        }

        let manifest = &config.install_manifest;
        let found = self.tagged_files.iter().find(|name| {
            manifest
                .file_size(name)
                .is_some_and(|size| fs.file_size(&config.install_dir.join(name)) == Some(size))
        });
        if let Some(name) = found {
            tracing::info!(file = %name, "Found installed file matching the manifest size");
        }
        found.is_some()
    }

    fn run_attempts(&mut self) -> bool {
        let shared = self.shared;
        // Total number of attempts, the first included
        let max_attempts = shared.tuning.num_installer_retries.max(1);
        let mut attempt = 0u32;

        loop {
            if self.run_attempt(attempt) {
                return true;
            }

            let can_retry = attempt + 1 < max_attempts && shared.error.is_retryable();
            if !can_retry || shared.apply_cancellation() {
                return false;
            }

            if let Some(error) = shared.error.error() {
                tracing::warn!(
                    attempt,
                    code = %error.code,
                    text = %error.text,
                    "Installation attempt failed, retrying"
                );
                let mut stats = shared.build_stats.lock();
                stats.num_installer_retries += 1;
                stats.retry_failure_types.push(error.kind);
                stats.retry_error_codes.push(error.code);
            }
            shared.registry.reset_abort();
            shared.error.reset();
            shared.progress.reset_for_retry();

            // A cancel may have been dropped while the retryable error was set
            if shared.apply_cancellation() {
                return false;
            }
            attempt += 1;
        }
    }

    fn run_attempt(&mut self, attempt: u32) -> bool {
        let progress = &self.shared.progress;
        if attempt == 0 && self.resume_to_verification {
            tracing::info!("Skipping to verification");
            for state in [
                InstallState::Initializing,
                InstallState::Resuming,
                InstallState::Downloading,
                InstallState::Installing,
            ] {
                progress.set_state_progress(state, 1.0);
            }
            self.touched_files.extend(self.tagged_files.iter().cloned());
        } else if !self.run_installation() {
            return false;
        }

        if self.has_error() || !self.run_backup_and_move() {
            return false;
        }
        if self.has_error() {
            return false;
        }
        self.run_file_attributes();

        let first_repair_pass = attempt == 0 && self.shared.config.is_repair;
        !self.has_error() && self.run_verification(first_repair_pass)
    }

    fn run_installation(&mut self) -> bool {
        self.timers.construct.start();
        let result = self.construct_files();
        self.timers.construct.stop();
        self.remove_patch_data();

        let shared = self.shared;
        match result {
            Ok(summary) => {
                shared
                    .progress
                    .set_state_progress(InstallState::Downloading, 1.0);
                let mut stats = shared.build_stats.lock();
                stats.num_files_constructed += summary.constructed.len() as u64;
                stats.num_files_resumed += summary.resumed.len() as u64;
                drop(stats);
                self.touched_files.extend(summary.constructed);
                self.touched_files.extend(summary.resumed);
                true
            }
            Err(e) if e.is_abort() => {
                self.fail(InstallErrorKind::FileConstructionFail, e.reason(), e.to_string())
            }
            Err(e) => {
                let kind = match &e {
                    ConstructError::PathTooLong { .. } => InstallErrorKind::PathLengthExceeded,
                    e if e.is_download_failure() => InstallErrorKind::DownloadError,
                    _ => InstallErrorKind::FileConstructionFail,
                };
                self.fail(kind, e.reason(), e.to_string())
            }
        }
    }

    /// Build the chunk stores and sources, then construct every outdated file.
    fn construct_files(&self) -> Result<ConstructionSummary, ConstructError> {
        let shared = self.shared;
        let config = &shared.config;
        let tuning = &shared.tuning;
        let fs = &shared.fs;
        let stats = &shared.stats;
        let manifest = Arc::clone(&config.install_manifest);

        let files: Vec<String> = self.files_to_construct.iter().cloned().collect();
        let tracker = Arc::new(ChunkReferenceTracker::new(&manifest, &files));
        let referenced = tracker.get_referenced_chunks();

        let data_dir = config.data_staging_dir();
        let policy = Arc::new(ReferencedChunkEvictionPolicy::new(Arc::clone(&tracker)));
        let cloud_store = Arc::new(MemoryChunkStore::new(
            tuning.cloud_store_size(),
            policy.clone(),
            Arc::new(DiskChunkStore::new(Arc::clone(fs), data_dir.join("cloud"), Arc::clone(stats))),
            Arc::clone(stats),
        ));
        let install_store = Arc::new(MemoryChunkStore::new(
            tuning.install_store_size(),
            policy,
            Arc::new(DiskChunkStore::new(Arc::clone(fs), data_dir.join("install"), Arc::clone(stats))),
            Arc::clone(stats),
        ));

        let mut guards = Vec::new();
        let mut sources: Vec<Arc<dyn ChunkSource>> = Vec::new();

        let mut chunkdb_chunks = HashSet::new();
        if !config.chunk_db_files.is_empty() {
            let chunkdb = Arc::new(ChunkDbChunkSource::new(
                ChunkDbSourceConfig {
                    chunk_db_files: config.chunk_db_files.clone(),
                    prefetch_min: tuning.chunkdb_prefetch_min,
                    prefetch_max: tuning.chunkdb_prefetch_max,
                    open_retry_time: tuning.chunkdb_open_retry_time,
                },
                Arc::clone(fs),
                Arc::clone(&cloud_store),
                Arc::clone(&tracker),
                &manifest,
                Arc::clone(stats),
                self.messages.clone(),
            ));
            guards.push(shared.registry.register(chunkdb.clone()));
            chunkdb_chunks = chunkdb.available_chunks();
            sources.push(chunkdb);
        }

        let installations = recyclable_installations(config);
        let mut install_chunks = HashSet::new();
        if !installations.is_empty() {
            let install = Arc::new(InstallChunkSource::new(
                InstallSourceConfig {
                    batch_fetch_min: tuning.install_batch_min,
                    batch_fetch_max: tuning.install_batch_max,
                    chunk_ignore_set: chunkdb_chunks.clone(),
                },
                Arc::clone(fs),
                install_store,
                Arc::clone(&tracker),
                &manifest,
                &installations,
                Arc::clone(stats),
                self.messages.clone(),
            ));
            guards.push(shared.registry.register(install.clone()));
            install_chunks = install.available_chunks();
            sources.push(install);
        }

        let download_set = initial_download_set(&referenced, &chunkdb_chunks, &install_chunks);
        self.record_chunk_plan(&referenced, &chunkdb_chunks, &install_chunks, &download_set);
        if download_set.is_empty() {
            shared
                .progress
                .set_state_progress(InstallState::Downloading, 1.0);
        }

        let cloud = Arc::new(CloudChunkSource::new(
            CloudSourceConfig::from_tuning(tuning, config.cloud_dirs.clone(), download_set),
            Arc::clone(&shared.transport),
            Arc::clone(fs),
            cloud_store,
            Arc::clone(&tracker),
            &manifest,
            Arc::clone(stats),
            self.messages.clone(),
        ));
        guards.push(shared.registry.register(cloud.clone()));
        *shared.cloud.lock() = Some(Arc::clone(&cloud));
        sources.push(cloud);

        let constructor = Arc::new(FileConstructor::new(
            manifest,
            files,
            config.install_staging_dir(),
            Arc::new(ChainedChunkSource::new(sources)),
            tracker,
            Arc::clone(fs),
            Arc::clone(stats),
            Arc::clone(&shared.progress),
        ));
        guards.push(shared.registry.register(constructor.clone()));

        let result = constructor.run();
        *shared.cloud.lock() = None;
        result
    }

    fn record_chunk_plan(
        &self,
        referenced: &HashSet<ChunkId>,
        chunkdb: &HashSet<ChunkId>,
        install: &HashSet<ChunkId>,
        download: &HashSet<ChunkId>,
    ) {
        let in_chunkdb = referenced.intersection(chunkdb).count() as u64;
        let mut stats = self.shared.build_stats.lock();
        stats.num_chunks_required = referenced.len() as u64;
        stats.chunks_in_chunk_dbs = in_chunkdb;
        stats.chunks_locally_available = install.len() as u64;
        stats.chunks_queued_for_download = download.len() as u64;
        tracing::info!(
            required = referenced.len(),
            chunk_db = in_chunkdb,
            recyclable = install.len(),
            download = download.len(),
            "Chunk sources planned"
        );
    }

    fn remove_patch_data(&self) {
        let fs = self.shared.fs.as_ref();
        let dir = self.shared.config.data_staging_dir();
        if fs.exists(&dir) {
            if let Err(e) = fs.remove_dir_all(&dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "Could not remove patch data");
            }
        }
    }

    fn run_backup_and_move(&mut self) -> bool {
        if self.shared.config.stage_only {
            self.shared
                .progress
                .set_state_progress(InstallState::MovingToInstall, 1.0);
            return true;
        }
        self.enter(InstallState::MovingToInstall);
        self.timers.move_from_stage.start();
        let ok = self.move_staged_files();
        self.timers.move_from_stage.stop();
        ok
    }

    fn move_staged_files(&mut self) -> bool {
        let shared = self.shared;
        let config = &shared.config;
        let fs = shared.fs.as_ref();
        let flags = Arc::new(ControlFlags::new());
        let _guard = shared.registry.register(flags.clone());

        let marker = config.install_dir.join(MOVED_MARKER_FILE);
        if let Err(e) = fs.write(&marker, config.install_manifest.version.as_bytes()) {
            return self.fail(
                InstallErrorKind::MoveFileToInstall,
                "MovedMarker",
                format!("Could not write {}: {}", marker.display(), e),
            );
        }

        let backup = FileBackup {
            fs,
            install_dir: &config.install_dir,
            backup_dir: config.backup_dir.as_deref(),
            current: config.current_manifest.as_deref(),
            target: &config.install_manifest,
        };
        let staging = config.install_staging_dir();
        let files: Vec<String> = self.files_to_construct.iter().cloned().collect();
        let total = files.len().max(1) as f64;
        let mut moved = 0usize;

        for (index, name) in files.iter().enumerate() {
            if !flags.wait_while_paused() {
                return false;
            }
            let staged = staging.join(name);
            if fs.exists(&staged) {
                if let Err(e) = backup.backup_if_modified(name) {
                    tracing::warn!(file = %name, error = %e, "Could not back up installed file");
                }
                let target = config.install_dir.join(name);
                if let Err(e) = move_file(fs, &staged, &target, shared.tuning.num_file_move_retries) {
                    return self.fail(
                        InstallErrorKind::MoveFileToInstall,
                        "MoveFailed",
                        format!("Could not move {} into place: {}", name, e),
                    );
                }
                self.files_to_construct.remove(name);
                moved += 1;
            } else {
                tracing::debug!(file = %name, "No staged file to move");
            }
            shared
                .progress
                .set_state_progress(InstallState::MovingToInstall, (index + 1) as f64 / total);
        }

        let mut removed = 0usize;
        if let Some(current) = config.current_manifest.as_deref() {
            for name in config.install_manifest.removable_files(current) {
                if !flags.wait_while_paused() {
                    return false;
                }
                let path = config.install_dir.join(&name);
                if !fs.exists(&path) {
                    continue;
                }
                if let Err(e) = backup.backup_if_modified(&name) {
                    tracing::warn!(file = %name, error = %e, "Could not back up removed file");
                }
                match fs.remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!(file = %name, error = %e, "Could not remove old file"),
                }
            }
        }
        remove_empty_directories(fs, &config.install_dir);

        shared
            .progress
            .set_state_progress(InstallState::MovingToInstall, 1.0);
        tracing::info!(moved, removed, "Staged files moved into place");
        true
    }

    fn run_file_attributes(&mut self) {
        let shared = self.shared;
        let config = &shared.config;
        self.enter(InstallState::SettingAttributes);
        self.timers.attributes.start();

        let dir = self.output_dir();
        let failures = apply_file_attributes(
            shared.fs.as_ref(),
            &config.install_manifest,
            config.current_manifest.as_deref(),
            &dir,
            self.touched_files.intersection(&self.tagged_files),
        );
        if failures > 0 {
            tracing::warn!(failures, "Some file attributes could not be set");
        }

        shared
            .progress
            .set_state_progress(InstallState::SettingAttributes, 1.0);
        self.timers.attributes.stop();
    }

    fn run_verification(&mut self, first_repair_pass: bool) -> bool {
        self.enter(InstallState::BuildVerification);
        self.timers.verify.start();
        let ok = self.verify_files(first_repair_pass);
        self.timers.verify.stop();
        ok
    }

    fn verify_files(&mut self, first_repair_pass: bool) -> bool {
        let shared = self.shared;
        let config = &shared.config;
        let fs = shared.fs.as_ref();

        let mode = if first_repair_pass {
            VerifyMode::ShaVerifyAllFiles
        } else {
            config.verify_mode
        };
        let files: Vec<String> = if mode.is_all_files() {
            self.tagged_files.iter().cloned().collect()
        } else {
            self.touched_files
                .intersection(&self.tagged_files)
                .cloned()
                .collect()
        };
        let dir = self.output_dir();

        let verifier = Arc::new(Verifier::new(
            Arc::clone(&shared.fs),
            Arc::clone(&config.install_manifest),
            dir.clone(),
            files,
            mode.is_sha(),
            Arc::clone(&shared.progress),
        ));
        let _guard = shared.registry.register(verifier.clone());
        let Some(failures) = verifier.run() else {
            return self.fail(
                InstallErrorKind::BuildVerifyFail,
                "Aborted",
                "Verification was aborted",
            );
        };

        let Some(first) = failures.first() else {
            let marker = config.install_dir.join(MOVED_MARKER_FILE);
            if fs.exists(&marker) {
                if let Err(e) = fs.remove_file(&marker) {
                    tracing::warn!(error = %e, "Could not remove moved marker");
                }
            }
            return true;
        };

        let backup = FileBackup {
            fs,
            install_dir: &dir,
            backup_dir: config.backup_dir.as_deref(),
            current: config.current_manifest.as_deref(),
            target: &config.install_manifest,
        };
        for failure in &failures {
            let path = dir.join(&failure.file);
            if !fs.exists(&path) {
                continue;
            }
            if !config.stage_only {
                if let Err(e) = backup.backup_if_modified(&failure.file) {
                    tracing::warn!(file = %failure.file, error = %e, "Could not back up corrupt file");
                }
            }
            if let Err(e) = fs.remove_file(&path) {
                tracing::warn!(file = %failure.file, error = %e, "Could not remove corrupt file");
            }
        }

        let text = format!(
            "{} file(s) failed verification, first {} ({})",
            failures.len(),
            first.file,
            first.kind.reason()
        );
        let reason = first.kind.reason();
        self.files_to_construct = failures.iter().map(|f| f.file.clone()).collect();
        self.fail(InstallErrorKind::BuildVerifyFail, reason, text)
    }

    fn run_prerequisites(&mut self) -> bool {
        let shared = self.shared;
        let config = &shared.config;
        let Some(info) = config.install_manifest.prereq.as_ref() else {
            return true;
        };
        if !config.run_required_prereqs || config.stage_only {
            tracing::info!(prereq = %info.name, "Prerequisites skipped");
            return true;
        }

        self.enter(InstallState::PrerequisitesInstall);
        self.timers.prereq.start();
        let result = run_prerequisites(
            shared.fs.as_ref(),
            &shared.prereq_runner,
            info,
            &config.install_dir,
            &config.machine_config_file,
        );
        self.timers.prereq.stop();
        shared
            .progress
            .set_state_progress(InstallState::PrerequisitesInstall, 1.0);

        match result {
            Ok(_) => true,
            Err(e) => self.fail(InstallErrorKind::PrerequisiteError, &e.reason(), e.to_string()),
        }
    }

    /// Remove patch data always, and the whole staging directory on success.
    /// In stage-only mode the staged files are the result and stay; only the
    /// resume marker is removed.
    fn clean_up(&mut self, success: bool) {
        let shared = self.shared;
        let config = &shared.config;
        let fs = shared.fs.as_ref();
        self.enter(InstallState::CleanUp);
        self.timers.clean_up.start();

        self.remove_patch_data();
        if success && config.stage_only {
            let marker = config.install_staging_dir().join(RESUME_DATA_FILE);
            if fs.exists(&marker) {
                if let Err(e) = fs.remove_file(&marker) {
                    tracing::warn!(error = %e, "Could not remove resume marker");
                }
            }
        } else if success && fs.exists(&config.staging_dir) {
            if let Err(e) = fs.remove_dir_all(&config.staging_dir) {
                tracing::warn!(dir = %config.staging_dir.display(), error = %e, "Could not remove staging directory");
            }
        }

        shared.progress.set_state_progress(InstallState::CleanUp, 1.0);
        self.timers.clean_up.stop();
    }

    fn finish(&mut self, success: bool) {
        let shared = self.shared;
        let snapshot = shared.stats.snapshot();
        let paused = shared.registry.paused_time().as_secs_f64();
        let execute = self.timers.process.seconds();
        let construct = self.timers.construct.seconds();

        let mut stats = shared.build_stats.lock();
        stats.apply_statistics(&snapshot);
        stats.initialize_time = self.timers.initialize.seconds();
        stats.construct_time = construct;
        stats.move_from_stage_time = self.timers.move_from_stage.seconds();
        stats.file_attributes_time = self.timers.attributes.seconds();
        stats.verify_time = self.timers.verify.seconds();
        stats.clean_up_time = self.timers.clean_up.seconds();
        stats.prereq_time = self.timers.prereq.seconds();
        stats.process_paused_time = paused;
        stats.process_execute_time = execute;
        stats.process_active_time = (execute - paused).max(0.0);
        stats.average_download_speed = if construct > 0.0 {
            snapshot.bytes_downloaded as f64 / construct
        } else {
            0.0
        };
        stats.process_success = success;
        stats.failure_type = shared.error.kind();
        stats.error_code = shared.error.code();
        stats.failure_reason_text = shared.error.text();
        stats.log();
        drop(stats);

        if success {
            for state in InstallState::ALL {
                shared.progress.set_state_progress(state, 1.0);
            }
        }
        self.enter(InstallState::Completed);
        tracing::info!(
            success,
            code = %shared.error.code(),
            seconds = execute,
            "Installation finished"
        );
    }
}

/// Installed builds chunks may be recycled from, including the build being
/// replaced.
fn recyclable_installations(
    config: &InstallerConfiguration,
) -> BTreeMap<PathBuf, Arc<BuildManifest>> {
    let mut installations = config.installation_info.clone();
    if let Some(current) = &config.current_manifest {
        installations
            .entry(config.install_dir.clone())
            .or_insert_with(|| Arc::clone(current));
    }
    installations
}
