//! Installer configuration.
//!
//! Two layers:
//!
//! - [`InstallerConfiguration`]: what to install and where, fixed for the
//!   lifetime of one installer.
//! - [`PatchTuning`]: engine tunables (store sizes, retry counts, prefetch
//!   windows) read from the `[Portal.BuildPatch]` section of an ini file.

mod installer;
mod tuning;

pub use installer::{InstallerConfiguration, VerifyMode};
pub use tuning::{HealthThresholds, PatchTuning, TUNING_SECTION};
pub(crate) use tuning::retry_delay;

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config file {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] ini::ParseError),

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
