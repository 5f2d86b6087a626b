//! Installation orchestrator.
//!
//! An [`Installer`] runs one installation of a build on a dedicated worker
//! thread. The caller never blocks on the worker: it polls for completion,
//! pumps queued messages to its handlers, and may pause or cancel at any
//! time.
//!
//! # Architecture
//!
//! ```text
//!   caller thread                           worker thread
//!   ─────────────                           ─────────────
//!   start_installation() ───── spawn ─────► pipeline::run
//!   cancel / toggle pause ─── registry ───► registered stage components
//!   pump_messages()       ◄── channel ────  stage and chunk source messages
//!   poll_completion()     ◄── oneshot ────  success flag
//!        │
//!        └─► completion callback (once, on the caller thread)
//! ```
//!
//! Only one pipeline runs at a time per process, whatever the number of
//! installers.

mod attributes;
mod backup;
mod build_stats;
mod control;
mod error;
mod pipeline;
mod prereq;
mod progress;
mod timer;
mod verify;

pub use attributes::apply_file_attributes;
pub use backup::{move_file, FileBackup, MOVED_MARKER_FILE};
pub use build_stats::BuildStats;
pub use control::{ControlGuard, ControlRegistry};
pub use error::{InstallError, InstallErrorKind, InstallerError};
pub use prereq::{
    prereq_ids, run_prerequisites, MachineConfig, PrereqError, PrereqRunner, ProcessPrereqRunner,
};
pub use progress::{BuildProgress, InstallState};
pub use timer::StageTimer;
pub use verify::{Verifier, VerifyFailure, VerifyFailureKind};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::config::{InstallerConfiguration, PatchTuning};
use crate::constructor::RESUME_DATA_FILE;
use crate::control::Controllable;
use crate::fs::{FileSystem, LocalFileSystem};
use crate::http::HttpTransport;
use crate::manifest::BuildManifest;
use crate::message::{MessageHandler, MessagePump};
use crate::source::{CloudChunkSource, DownloadHealth};
use crate::stats::InstallerStatistics;

/// Called once when an installation finishes, with its outcome and the
/// installed build.
pub type InstallCompleteCallback = Box<dyn FnOnce(bool, Arc<BuildManifest>) + Send>;

/// State shared between the installer handle and its worker thread.
struct Shared {
    config: InstallerConfiguration,
    tuning: PatchTuning,
    fs: Arc<dyn FileSystem>,
    transport: Arc<dyn HttpTransport>,
    prereq_runner: Arc<dyn PrereqRunner>,
    progress: Arc<BuildProgress>,
    error: InstallerError,
    registry: Arc<ControlRegistry>,
    stats: Arc<InstallerStatistics>,
    build_stats: Mutex<BuildStats>,
    messages: MessagePump,
    /// The cloud source while files are being constructed.
    cloud: Mutex<Option<Arc<CloudChunkSource>>>,
    /// Cancellation requested by the caller, kept across retries.
    cancellation: Mutex<Option<InstallErrorKind>>,
    complete: AtomicBool,
    success: AtomicBool,
}

impl Shared {
    fn request_cancel(&self, kind: InstallErrorKind) {
        self.cancellation.lock().get_or_insert(kind);
        self.apply_cancellation();
    }

    /// Report a pending cancellation as the installer error, replacing any
    /// failure stored before it. Returns true if one was requested.
    fn apply_cancellation(&self) -> bool {
        let Some(kind) = *self.cancellation.lock() else {
            return false;
        };
        let text = match kind {
            InstallErrorKind::ApplicationClosing => "The application is closing",
            _ => "The installation was cancelled",
        };
        self.error.set_cancellation(kind, text);
        true
    }
}

/// Builder for [`Installer`].
pub struct InstallerBuilder {
    config: InstallerConfiguration,
    transport: Arc<dyn HttpTransport>,
    tuning: PatchTuning,
    fs: Arc<dyn FileSystem>,
    prereq_runner: Arc<dyn PrereqRunner>,
    on_complete: Option<InstallCompleteCallback>,
}

impl InstallerBuilder {
    pub fn new(config: InstallerConfiguration, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            config,
            transport,
            tuning: PatchTuning::default(),
            fs: Arc::new(LocalFileSystem),
            prereq_runner: Arc::new(ProcessPrereqRunner),
            on_complete: None,
        }
    }

    pub fn with_tuning(mut self, tuning: PatchTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_prereq_runner(mut self, runner: Arc<dyn PrereqRunner>) -> Self {
        self.prereq_runner = runner;
        self
    }

    /// Set the callback fired by [`Installer::poll_completion`] or
    /// [`Installer::wait`] once the installation finishes.
    pub fn with_completion_callback(
        mut self,
        callback: impl FnOnce(bool, Arc<BuildManifest>) + Send + 'static,
    ) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> Installer {
        let registry = ControlRegistry::new();
        let progress = Arc::new(BuildProgress::new());

        // Any error stops every running component and ends a pause
        let error = InstallerError::new();
        let abort_registry = Arc::clone(&registry);
        let abort_progress = Arc::clone(&progress);
        error.register_handler(move |_| {
            abort_registry.abort_all();
            abort_registry.set_paused(false);
            abort_progress.set_paused(false);
        });

        let shared = Arc::new(Shared {
            config: self.config,
            tuning: self.tuning,
            fs: self.fs,
            transport: self.transport,
            prereq_runner: self.prereq_runner,
            progress,
            error,
            registry,
            stats: Arc::new(InstallerStatistics::new()),
            build_stats: Mutex::new(BuildStats::default()),
            messages: MessagePump::new(),
            cloud: Mutex::new(None),
            cancellation: Mutex::new(None),
            complete: AtomicBool::new(false),
            success: AtomicBool::new(false),
        });

        Installer {
            shared,
            handlers: Mutex::new(Vec::new()),
            on_complete: Mutex::new(self.on_complete),
            completion: Mutex::new(None),
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }
}

/// Handle to one installation.
///
/// Dropping the handle of a running installation stops it with
/// [`InstallErrorKind::ApplicationClosing`] and waits for the worker; the
/// completion callback is not fired.
pub struct Installer {
    shared: Arc<Shared>,
    handlers: Mutex<Vec<Box<dyn MessageHandler>>>,
    on_complete: Mutex<Option<InstallCompleteCallback>>,
    completion: Mutex<Option<oneshot::Receiver<bool>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Installer {
    /// Start the worker thread. Returns false if already started or the
    /// thread could not be spawned.
    pub fn start_installation(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }

        let (tx, rx) = oneshot::channel();
        *self.completion.lock() = Some(rx);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("chunkpatch-installer".to_string())
            .spawn(move || {
                let success = pipeline::run(&shared);
                shared.success.store(success, Ordering::SeqCst);
                shared.complete.store(true, Ordering::SeqCst);
                let _ = tx.send(success);
            });

        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                true
            }
            Err(e) => {
                self.shared.error.set_error(
                    InstallErrorKind::InitializationError,
                    "WorkerThread",
                    format!("Could not start the installer thread: {}", e),
                );
                self.shared.complete.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    /// Cancel the installation. Staged work is kept for a later resume.
    pub fn cancel_install(&self) {
        tracing::info!("Installation cancel requested");
        self.shared.request_cancel(InstallErrorKind::UserCanceled);
    }

    /// Pause or resume. Returns whether the installation is now paused.
    ///
    /// An installation with an error, or one that has finished, cannot be
    /// paused.
    pub fn toggle_pause_install(&self) -> bool {
        let shared = &self.shared;
        if shared.error.error().is_some() || self.is_complete() {
            return false;
        }
        let paused = !shared.registry.is_paused();
        shared.registry.set_paused(paused);
        shared.progress.set_paused(paused);
        tracing::info!(paused, "Installation pause toggled");
        paused
    }

    /// Current stage. Reports [`InstallState::Downloading`] while files are
    /// waiting on chunk downloads.
    pub fn state(&self) -> InstallState {
        let state = self.shared.progress.state();
        let downloading = self
            .shared
            .cloud
            .lock()
            .as_ref()
            .is_some_and(|cloud| cloud.downloads_in_flight() > 0);
        if state == InstallState::Installing && downloading {
            InstallState::Downloading
        } else {
            state
        }
    }

    /// Weighted overall progress, 0.0-1.0.
    pub fn progress(&self) -> f64 {
        let shared = &self.shared;
        if shared.cloud.lock().is_some() {
            let snapshot = shared.stats.snapshot();
            if snapshot.required_download_bytes > 0 {
                shared.progress.set_state_progress(
                    InstallState::Downloading,
                    snapshot.bytes_downloaded as f64 / snapshot.required_download_bytes as f64,
                );
            }
        }
        shared.progress.overall()
    }

    /// Progress of one stage, 0.0-1.0.
    pub fn state_progress(&self, state: InstallState) -> f64 {
        self.shared.progress.state_progress(state)
    }

    /// Statistics so far, final once the installation is complete.
    pub fn build_statistics(&self) -> BuildStats {
        let mut stats = self.shared.build_stats.lock().clone();
        if !self.is_complete() {
            stats.apply_statistics(&self.shared.stats.snapshot());
        }
        stats
    }

    pub fn register_message_handler(&self, handler: impl MessageHandler + 'static) {
        self.handlers.lock().push(Box::new(handler));
    }

    /// Deliver queued messages to the registered handlers on this thread.
    pub fn pump_messages(&self) -> usize {
        let mut handlers = self.handlers.lock();
        self.shared.messages.pump(handlers.as_mut_slice())
    }

    pub fn download_health(&self) -> DownloadHealth {
        self.shared.stats.download_health()
    }

    /// Bytes per second averaged over the configured window.
    pub fn download_speed(&self) -> f64 {
        self.shared
            .stats
            .download_speed(self.shared.tuning.download_speed_average_time)
    }

    pub fn error_type(&self) -> InstallErrorKind {
        self.shared.error.kind()
    }

    pub fn error_code(&self) -> String {
        self.shared.error.code()
    }

    pub fn error_text(&self) -> String {
        self.shared.error.text()
    }

    pub fn is_complete(&self) -> bool {
        self.shared.complete.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.error.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.registry.is_paused() && !self.is_complete()
    }

    /// True when a failed or cancelled installation left staged work a new
    /// installer can pick up.
    pub fn is_resumable(&self) -> bool {
        let shared = &self.shared;
        if shared.success.load(Ordering::SeqCst)
            || shared.error.kind() == InstallErrorKind::PathLengthExceeded
        {
            return false;
        }
        let marker = shared.config.install_staging_dir().join(RESUME_DATA_FILE);
        shared.fs.exists(&marker)
    }

    /// True for any error other than a cancellation.
    pub fn has_error(&self) -> bool {
        self.shared.error.has_fatal_error()
    }

    /// Fire the completion callback if the worker has finished.
    ///
    /// Returns the outcome the first time it is observed, `None` before that
    /// and after.
    pub fn poll_completion(&self) -> Option<bool> {
        let mut completion = self.completion.lock();
        let rx = completion.as_mut()?;
        let success = match rx.try_recv() {
            Ok(success) => success,
            Err(TryRecvError::Empty) => return None,
            // The worker died without reporting
            Err(TryRecvError::Closed) => {
                self.shared.complete.store(true, Ordering::SeqCst);
                false
            }
        };
        *completion = None;
        drop(completion);

        self.join_worker();
        let callback = self.on_complete.lock().take();
        if let Some(callback) = callback {
            callback(success, Arc::clone(&self.shared.config.install_manifest));
        }
        Some(success)
    }

    /// Block until the worker finishes, then fire the completion callback.
    pub fn wait(&self) -> bool {
        self.join_worker();
        self.poll_completion()
            .unwrap_or_else(|| self.shared.success.load(Ordering::SeqCst))
    }

    fn join_worker(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Installer thread panicked");
            }
        }
    }
}

impl Drop for Installer {
    fn drop(&mut self) {
        let running = self.worker.get_mut().is_some();
        if running && !self.is_complete() {
            self.shared.request_cancel(InstallErrorKind::ApplicationClosing);
        }
        self.on_complete.get_mut().take();
        self.join_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::MemoryTransport;
    use crate::manifest::test_support::manifest_with_files;
    use tempfile::TempDir;

    fn installer(temp: &TempDir) -> Installer {
        let manifest = Arc::new(manifest_with_files(&[("a.txt", &[(1, "alpha")])]));
        let config = InstallerConfiguration::new(manifest, temp.path().join("install"))
            .with_staging_dir(temp.path().join("staging"))
            .with_machine_config_file(temp.path().join("machine.ini"));
        InstallerBuilder::new(config, Arc::new(MemoryTransport::new())).build()
    }

    #[test]
    fn test_new_installer_state() {
        let temp = TempDir::new().unwrap();
        let installer = installer(&temp);

        assert_eq!(installer.state(), InstallState::Queued);
        assert!(!installer.is_complete());
        assert!(!installer.has_error());
        assert_eq!(installer.error_code(), "OK");
        assert_eq!(installer.poll_completion(), None);
    }

    #[test]
    fn test_cancel_before_start_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        let installer = installer(&temp);

        installer.cancel_install();
        assert!(installer.is_canceled());
        assert!(!installer.has_error());
        assert_eq!(installer.error_code(), "UC-UserCanceled");
        assert!(!installer.toggle_pause_install());
    }

    #[test]
    fn test_cancel_overrides_earlier_failure() {
        let temp = TempDir::new().unwrap();
        let installer = installer(&temp);

        installer.shared.error.set_error(
            InstallErrorKind::FileConstructionFail,
            "HashMismatch",
            "a.txt",
        );
        installer.cancel_install();

        assert!(installer.is_canceled());
        assert!(!installer.has_error());
        assert_eq!(installer.error_code(), "UC-UserCanceled");
    }

    #[test]
    fn test_toggle_pause() {
        let temp = TempDir::new().unwrap();
        let installer = installer(&temp);

        assert!(installer.toggle_pause_install());
        assert!(installer.is_paused());
        assert_eq!(installer.state(), InstallState::Paused);
        assert!(!installer.toggle_pause_install());
        assert!(!installer.is_paused());
    }

    #[test]
    fn test_start_only_once() {
        let temp = TempDir::new().unwrap();
        let installer = installer(&temp);

        assert!(installer.start_installation());
        assert!(!installer.start_installation());
        installer.wait();
    }
}
