//! Prerequisite installers and the machine config recording which ran.
//!
//! The machine config is a small ini file:
//!
//! ```ini
//! [Prerequisites]
//! InstalledPrereqs=vcredist-2022,directx-june
//! ```

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use ini::Ini;
use thiserror::Error;

use crate::config::ConfigError;
use crate::fs::FileSystem;
use crate::manifest::PrereqInfo;

const PREREQ_SECTION: &str = "Prerequisites";
const INSTALLED_KEY: &str = "InstalledPrereqs";

/// Exit code meaning success with a reboot pending.
const EXIT_REBOOT_REQUIRED: i32 = 3010;

#[derive(Debug, Error)]
pub enum PrereqError {
    #[error("failed to launch prerequisite {path}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("prerequisite {name} exited with code {code}")]
    ExitCode { name: String, code: i32 },

    #[error(transparent)]
    MachineConfig(#[from] ConfigError),
}

impl PrereqError {
    /// Short reason used in error codes.
    pub fn reason(&self) -> String {
        match self {
            Self::Launch { .. } => "StartPrereqInstaller".to_string(),
            Self::ExitCode { code, .. } => format!("ExitCode{}", code),
            Self::MachineConfig(_) => "MachineConfig".to_string(),
        }
    }
}

/// Runs a prerequisite executable and reports its exit code.
pub trait PrereqRunner: Send + Sync {
    fn run(&self, program: &Path, args: &[String]) -> Result<i32, PrereqError>;
}

/// Runs prerequisites as child processes and waits for them.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessPrereqRunner;

impl PrereqRunner for ProcessPrereqRunner {
    fn run(&self, program: &Path, args: &[String]) -> Result<i32, PrereqError> {
        let status = Command::new(program)
            .args(args)
            .status()
            .map_err(|source| PrereqError::Launch {
                path: program.to_path_buf(),
                source,
            })?;
        // Killed by a signal
        Ok(status.code().unwrap_or(-1))
    }
}

/// Prerequisite ids recorded on this machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineConfig {
    installed: BTreeSet<String>,
}

impl MachineConfig {
    /// Load the machine config. A missing file is an empty config.
    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Self, ConfigError> {
        if !fs.exists(path) {
            return Ok(Self::default());
        }
        let bytes = fs.read(path).map_err(|source| ConfigError::Load {
            path: path.to_path_buf(),
            source: ini::Error::Io(source),
        })?;
        let ini = Ini::load_from_str(&String::from_utf8_lossy(&bytes))?;
        let installed = ini
            .get_from(Some(PREREQ_SECTION), INSTALLED_KEY)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self { installed })
    }

    pub fn save(&self, fs: &dyn FileSystem, path: &Path) -> Result<(), ConfigError> {
        let mut ini = Ini::new();
        let joined = self.installed.iter().cloned().collect::<Vec<_>>().join(",");
        ini.with_section(Some(PREREQ_SECTION)).set(INSTALLED_KEY, joined);

        let write_error = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = fs.create_write(path).map_err(write_error)?;
        ini.write_to(&mut writer).map_err(write_error)?;
        writer.flush().map_err(write_error)
    }

    pub fn is_installed(&self, id: &str) -> bool {
        self.installed.contains(id)
    }

    pub fn installed(&self) -> impl Iterator<Item = &str> {
        self.installed.iter().map(String::as_str)
    }

    pub fn mark_installed<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.installed.extend(ids.into_iter().map(Into::into));
    }
}

/// Ids a prerequisite is recorded under. Falls back to its path.
pub fn prereq_ids(info: &PrereqInfo) -> Vec<String> {
    if info.ids.is_empty() {
        vec![info.path.clone()]
    } else {
        info.ids.clone()
    }
}

/// Run a build's prerequisite unless the machine config already lists it.
///
/// Returns `Ok(true)` if the prerequisite ran.
pub fn run_prerequisites(
    fs: &dyn FileSystem,
    runner: &Arc<dyn PrereqRunner>,
    info: &PrereqInfo,
    base_dir: &Path,
    machine_config_file: &Path,
) -> Result<bool, PrereqError> {
    let mut config = MachineConfig::load(fs, machine_config_file)?;
    let ids = prereq_ids(info);
    if ids.iter().all(|id| config.is_installed(id)) {
        tracing::info!(prereq = %info.name, "Prerequisites already installed");
        return Ok(false);
    }

    let program = base_dir.join(&info.path);
    tracing::info!(prereq = %info.name, program = %program.display(), "Running prerequisite installer");
    let code = runner.run(&program, &info.args)?;
    if code != 0 && code != EXIT_REBOOT_REQUIRED {
        return Err(PrereqError::ExitCode {
            name: info.name.clone(),
            code,
        });
    }

    config.mark_installed(ids);
    config.save(fs, machine_config_file)?;
    tracing::info!(prereq = %info.name, code, "Prerequisite installed");
    Ok(true)
}
