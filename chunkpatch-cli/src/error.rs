//! CLI error type.

use std::path::PathBuf;

use thiserror::Error;

use chunkpatch::config::ConfigError;
use chunkpatch::http::HttpError;
use chunkpatch::logging::LoggingError;
use chunkpatch::manifest::ManifestError;
use chunkpatch::source::ChunkDbError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    ConfigFile(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    ChunkDb(#[from] ChunkDbError),

    #[error("Failed to create HTTP client: {0}")]
    Http(#[from] HttpError),

    #[error("Chunk {id} in {path} is missing or corrupt")]
    BadChunk { id: String, path: PathBuf },

    #[error("Installation failed: {code}: {text}")]
    InstallFailed { code: String, text: String },

    #[error("Installation cancelled")]
    Cancelled,
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Cancelled => 130,
            CliError::InstallFailed { .. } => 2,
            _ => 1,
        }
    }
}
