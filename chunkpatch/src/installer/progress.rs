//! Installation state and weighted progress.

use parking_lot::Mutex;
use serde::Serialize;

use crate::control::Controllable;

/// Installation stages for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InstallState {
    /// Waiting for the installer thread to start.
    Queued,
    /// Checking directories and manifests.
    Initializing,
    /// Scanning staged files left by an earlier attempt.
    Resuming,
    /// Acquiring chunk data.
    Downloading,
    /// Constructing files in the staging directory.
    Installing,
    /// Moving staged files into the install directory.
    MovingToInstall,
    /// Applying file attributes.
    SettingAttributes,
    /// Checking installed files against the manifest.
    BuildVerification,
    /// Removing staging data.
    CleanUp,
    /// Running the prerequisite installer.
    PrerequisitesInstall,
    /// Installation finished, successfully or not.
    Completed,
    /// Reported while paused; never stored as the current stage.
    Paused,
}

impl InstallState {
    pub const COUNT: usize = 12;

    pub const ALL: [InstallState; Self::COUNT] = [
        Self::Queued,
        Self::Initializing,
        Self::Resuming,
        Self::Downloading,
        Self::Installing,
        Self::MovingToInstall,
        Self::SettingAttributes,
        Self::BuildVerification,
        Self::CleanUp,
        Self::PrerequisitesInstall,
        Self::Completed,
        Self::Paused,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Get a human-readable name for the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Initializing => "Initializing",
            Self::Resuming => "Resuming",
            Self::Downloading => "Downloading",
            Self::Installing => "Installing",
            Self::MovingToInstall => "Moving to install",
            Self::SettingAttributes => "Setting attributes",
            Self::BuildVerification => "Verifying",
            Self::CleanUp => "Cleaning up",
            Self::PrerequisitesInstall => "Installing prerequisites",
            Self::Completed => "Complete",
            Self::Paused => "Paused",
        }
    }

    /// Share of the overall progress bar this state covers by default.
    fn default_weight(self) -> f64 {
        match self {
            Self::Initializing => 0.01,
            Self::Resuming => 0.05,
            Self::Downloading => 0.40,
            Self::Installing => 0.20,
            Self::MovingToInstall => 0.05,
            Self::SettingAttributes => 0.01,
            Self::BuildVerification => 0.20,
            Self::CleanUp => 0.02,
            Self::PrerequisitesInstall => 0.06,
            Self::Queued | Self::Completed | Self::Paused => 0.0,
        }
    }
}

#[derive(Debug)]
struct ProgressInner {
    state: InstallState,
    paused: bool,
    progress: [f64; InstallState::COUNT],
    weights: [f64; InstallState::COUNT],
}

/// Per-state progress combined into one weighted figure.
///
/// Each stage reports its own 0.0-1.0 progress; [`overall`](Self::overall)
/// blends them by weight. Stages that will not run get weight zero.
#[derive(Debug)]
pub struct BuildProgress {
    inner: Mutex<ProgressInner>,
}

impl Default for BuildProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildProgress {
    pub fn new() -> Self {
        let mut weights = [0.0; InstallState::COUNT];
        for state in InstallState::ALL {
            weights[state.index()] = state.default_weight();
        }
        Self {
            inner: Mutex::new(ProgressInner {
                state: InstallState::Queued,
                paused: false,
                progress: [0.0; InstallState::COUNT],
                weights,
            }),
        }
    }

    /// Current state, or [`InstallState::Paused`] while paused.
    pub fn state(&self) -> InstallState {
        let inner = self.inner.lock();
        if inner.paused && inner.state != InstallState::Completed {
            InstallState::Paused
        } else {
            inner.state
        }
    }

    pub fn set_state(&self, state: InstallState) {
        if state == InstallState::Paused {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state != state {
            tracing::debug!(from = inner.state.name(), to = state.name(), "Install state changed");
            inner.state = state;
        }
    }

    pub fn state_progress(&self, state: InstallState) -> f64 {
        self.inner.lock().progress[state.index()]
    }

    /// Set a state's progress, clamped to 0.0-1.0.
    pub fn set_state_progress(&self, state: InstallState, value: f64) {
        let value = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
        self.inner.lock().progress[state.index()] = value;
    }

    pub fn set_state_weight(&self, state: InstallState, weight: f64) {
        self.inner.lock().weights[state.index()] = weight.max(0.0);
    }

    /// Weighted progress across all states, 0.0-1.0.
    pub fn overall(&self) -> f64 {
        let inner = self.inner.lock();
        let total: f64 = inner.weights.iter().sum();
        if total <= 0.0 {
            return 0.0;
        }
        let done: f64 = inner
            .weights
            .iter()
            .zip(inner.progress.iter())
            .map(|(w, p)| w * p)
            .sum();
        (done / total).clamp(0.0, 1.0)
    }

    /// Forget per-state progress before a retry, keeping finished set-up
    /// stages.
    pub fn reset_for_retry(&self) {
        let mut inner = self.inner.lock();
        for state in [
            InstallState::Downloading,
            InstallState::Installing,
            InstallState::MovingToInstall,
            InstallState::SettingAttributes,
            InstallState::BuildVerification,
        ] {
            inner.progress[state.index()] = 0.0;
        }
    }
}

impl Controllable for BuildProgress {
    fn abort(&self) {}

    fn set_paused(&self, paused: bool) {
        self.inner.lock().paused = paused;
    }
}
