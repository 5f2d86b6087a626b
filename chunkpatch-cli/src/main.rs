//! Chunkpatch CLI - install, patch and package chunked builds.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::{build, chunkdb, install};
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "chunkpatch", version, about = "Install and patch chunked builds")]
struct Cli {
    /// Directory for log files (defaults to the user data directory)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Install or patch a build into a directory
    Install(install::InstallArgs),
    /// Chunk a directory into a manifest and cloud directory
    Build(build::BuildArgs),
    /// Pack the chunks of a build into a chunk database
    Chunkdb(chunkdb::ChunkDbArgs),
}

fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("chunkpatch")
        .join("logs")
}

fn run(cli: Cli) -> Result<(), CliError> {
    let log_dir = cli.log_dir.unwrap_or_else(default_log_dir);
    let _guard = chunkpatch::logging::init_logging(&log_dir, "chunkpatch.log", &cli.log_level)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "chunkpatch starting");

    match cli.command {
        Command::Install(args) => install::run(args),
        Command::Build(args) => build::run(args),
        Command::Chunkdb(args) => chunkdb::run(args),
    }
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
