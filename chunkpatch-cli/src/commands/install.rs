//! Install command - install or patch a build with a live progress bar.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};

use chunkpatch::fs::LocalFileSystem;
use chunkpatch::http::{ReqwestTransport, DEFAULT_REQUEST_TIMEOUT};
use chunkpatch::installer::InstallState;
use chunkpatch::{BuildManifest, InstallerBuilder, InstallerConfiguration, PatchTuning, VerifyMode};

use super::format_size;
use crate::error::CliError;

const TICK: Duration = Duration::from_millis(100);
const BAR_LENGTH: u64 = 1000;

/// Verification mode selection for CLI arguments.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum VerifyArg {
    /// SHA-256 of every selected file
    ShaAll,
    /// SHA-256 of files written by this install
    ShaTouched,
    /// Size of every selected file
    SizeAll,
    /// Size of files written by this install
    SizeTouched,
}

impl From<VerifyArg> for VerifyMode {
    fn from(arg: VerifyArg) -> Self {
        match arg {
            VerifyArg::ShaAll => VerifyMode::ShaVerifyAllFiles,
            VerifyArg::ShaTouched => VerifyMode::ShaVerifyTouchedFiles,
            VerifyArg::SizeAll => VerifyMode::FileSizeCheckAllFiles,
            VerifyArg::SizeTouched => VerifyMode::FileSizeCheckTouchedFiles,
        }
    }
}

/// Arguments for the install command.
#[derive(Debug, Args)]
pub struct InstallArgs {
    /// Manifest of the build to install
    #[arg(long)]
    pub manifest: PathBuf,

    /// Directory to install into
    #[arg(long)]
    pub install_dir: PathBuf,

    /// Manifest of the build currently in the install directory
    #[arg(long)]
    pub current_manifest: Option<PathBuf>,

    /// Other installed build to recycle chunks from, as DIR=MANIFEST
    #[arg(long = "recycle", value_parser = parse_installation)]
    pub installations: Vec<(PathBuf, PathBuf)>,

    /// Staging directory (defaults to <install-dir>/.patching)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Keep copies of locally modified files here before replacing them
    #[arg(long)]
    pub backup_dir: Option<PathBuf>,

    /// Cloud directory URL or path; repeat to add fallbacks
    #[arg(long = "cloud-dir")]
    pub cloud_dirs: Vec<String>,

    /// Chunk database file; repeatable
    #[arg(long = "chunk-db")]
    pub chunk_dbs: Vec<PathBuf>,

    /// Only install files with this tag; repeatable
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// How installed files are verified
    #[arg(long, value_enum, default_value = "sha-touched")]
    pub verify: VerifyArg,

    /// Check every file first and rebuild whatever is wrong
    #[arg(long)]
    pub repair: bool,

    /// Build into the staging directory and leave the install directory alone
    #[arg(long)]
    pub stage_only: bool,

    /// Do not run the build's prerequisite installer
    #[arg(long)]
    pub skip_prereqs: bool,

    /// Machine config recording installed prerequisites
    #[arg(long)]
    pub machine_config: Option<PathBuf>,

    /// Ini file with patch tuning
    #[arg(long)]
    pub tuning: Option<PathBuf>,
}

fn parse_installation(value: &str) -> Result<(PathBuf, PathBuf), String> {
    let (dir, manifest) = value
        .split_once('=')
        .ok_or_else(|| format!("expected DIR=MANIFEST, got '{}'", value))?;
    Ok((PathBuf::from(dir), PathBuf::from(manifest)))
}

fn load_manifest(path: &PathBuf) -> Result<Arc<BuildManifest>, CliError> {
    Ok(Arc::new(BuildManifest::load(&LocalFileSystem, path)?))
}

fn configuration(args: InstallArgs) -> Result<InstallerConfiguration, CliError> {
    let manifest = load_manifest(&args.manifest)?;
    let mut config = InstallerConfiguration::new(manifest, args.install_dir)
        .with_install_tags(args.tags)
        .with_verify_mode(args.verify.into())
        .with_repair(args.repair)
        .with_stage_only(args.stage_only)
        .with_run_required_prereqs(!args.skip_prereqs);

    if let Some(path) = args.current_manifest {
        config = config.with_current_manifest(load_manifest(&path)?);
    }
    for (dir, manifest) in args.installations {
        config = config.with_installation(dir, load_manifest(&manifest)?);
    }
    for dir in args.cloud_dirs {
        config = config.with_cloud_dir(dir);
    }
    for db in args.chunk_dbs {
        config = config.with_chunk_db(db);
    }
    if let Some(dir) = args.staging_dir {
        config = config.with_staging_dir(dir);
    }
    if let Some(dir) = args.backup_dir {
        config = config.with_backup_dir(dir);
    }
    if let Some(path) = args.machine_config {
        config = config.with_machine_config_file(path);
    }
    Ok(config)
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(BAR_LENGTH);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% | {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    bar.set_style(style);
    bar
}

/// Run the install command.
pub fn run(args: InstallArgs) -> Result<(), CliError> {
    let tuning = match &args.tuning {
        Some(path) => PatchTuning::load(path)?,
        None => PatchTuning::default(),
    };
    let config = configuration(args)?;

    let manifest = Arc::clone(&config.install_manifest);
    println!("Installing {} {}", manifest.app_name, manifest.version);
    println!("  Target:  {}", config.install_dir.display());
    for dir in &config.cloud_dirs {
        println!("  Cloud:   {}", dir);
    }
    for db in &config.chunk_db_files {
        println!("  ChunkDB: {}", db.display());
    }
    println!();

    let transport = Arc::new(ReqwestTransport::new(tuning.chunk_downloads, DEFAULT_REQUEST_TIMEOUT)?);
    let installer = InstallerBuilder::new(config, transport)
        .with_tuning(tuning)
        .build();

    // First Ctrl+C cancels, keeping staged work for a resume
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    if !installer.start_installation() {
        return Err(CliError::InstallFailed {
            code: installer.error_code(),
            text: installer.error_text(),
        });
    }

    let bar = progress_bar();
    let mut cancel_sent = false;
    let success = loop {
        if interrupted.load(Ordering::SeqCst) && !cancel_sent {
            bar.println("Cancelling...");
            installer.cancel_install();
            cancel_sent = true;
        }

        installer.pump_messages();
        bar.set_position((installer.progress() * BAR_LENGTH as f64) as u64);
        let state = installer.state();
        let message = if state == InstallState::Downloading {
            format!(
                "{} {}/s ({})",
                state.name(),
                format_size(installer.download_speed() as u64),
                installer.download_health().name()
            )
        } else {
            state.name().to_string()
        };
        bar.set_message(message);

        if let Some(success) = installer.poll_completion() {
            break success;
        }
        std::thread::sleep(TICK);
    };
    bar.finish_and_clear();

    let stats = installer.build_statistics();
    println!("Files constructed: {}", stats.num_files_constructed);
    println!("Chunks downloaded: {}", stats.num_chunks_downloaded);
    println!("Chunks recycled:   {}", stats.num_chunks_recycled);
    println!("Data downloaded:   {}", format_size(stats.total_downloaded_data));

    if success {
        println!();
        println!("Installed {} {}", manifest.app_name, manifest.version);
        return Ok(());
    }
    if installer.is_canceled() {
        if installer.is_resumable() {
            println!("Staged work was kept; run the same command again to resume.");
        }
        return Err(CliError::Cancelled);
    }
    Err(CliError::InstallFailed {
        code: installer.error_code(),
        text: installer.error_text(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_installation() {
        let (dir, manifest) = parse_installation("/games/old=/games/old.json").unwrap();
        assert_eq!(dir, PathBuf::from("/games/old"));
        assert_eq!(manifest, PathBuf::from("/games/old.json"));
        assert!(parse_installation("/games/old").is_err());
    }

    #[test]
    fn test_verify_arg_mapping() {
        assert_eq!(VerifyMode::from(VerifyArg::SizeAll), VerifyMode::FileSizeCheckAllFiles);
        assert_eq!(VerifyMode::from(VerifyArg::ShaTouched), VerifyMode::default());
    }
}
