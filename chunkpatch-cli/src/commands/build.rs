//! Build command - chunk a directory into a manifest and cloud directory.

use std::path::{Path, PathBuf};

use clap::Args;

use chunkpatch::fs::LocalFileSystem;
use chunkpatch::manifest::{ManifestBuilder, DEFAULT_CHUNK_SIZE};

use super::format_size;
use crate::error::CliError;

/// Name of the manifest written next to the chunks.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Arguments for the build command.
#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Directory holding the build's files
    #[arg(long)]
    pub source: PathBuf,

    /// Cloud directory to write chunks and the manifest into
    #[arg(long)]
    pub output: PathBuf,

    /// Application name recorded in the manifest
    #[arg(long)]
    pub app: String,

    /// Build version recorded in the manifest
    #[arg(long)]
    pub version: String,

    /// Chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,
}

/// Run the build command.
pub fn run(args: BuildArgs) -> Result<(), CliError> {
    if !args.source.is_dir() {
        return Err(CliError::Config(format!(
            "{} is not a directory",
            args.source.display()
        )));
    }

    let fs = LocalFileSystem;
    let built = ManifestBuilder::new(args.app, args.version)
        .with_chunk_size(args.chunk_size)
        .add_directory(&fs, &args.source)?
        .build();

    built.write_chunks(&fs, &args.output)?;
    let manifest_path = manifest_path(&args.output);
    built.manifest.save(&fs, &manifest_path)?;

    let chunk_bytes: u64 = built.manifest.chunks.values().map(|c| c.size).sum();
    let file_bytes: u64 = built.manifest.files.values().map(|f| f.size).sum();
    tracing::info!(
        files = built.manifest.files.len(),
        chunks = built.chunks.len(),
        "Build written"
    );
    println!("Manifest: {}", manifest_path.display());
    println!("Files:    {} ({})", built.manifest.files.len(), format_size(file_bytes));
    println!("Chunks:   {} ({})", built.chunks.len(), format_size(chunk_bytes));
    Ok(())
}

fn manifest_path(output: &Path) -> PathBuf {
    output.join(MANIFEST_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkpatch::BuildManifest;
    use tempfile::TempDir;

    #[test]
    fn test_build_writes_manifest_and_chunks() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        std::fs::create_dir_all(source.join("data")).unwrap();
        std::fs::write(source.join("game.exe"), b"binary").unwrap();
        std::fs::write(source.join("data/level.pak"), b"level data").unwrap();
        let output = temp.path().join("cloud");

        run(BuildArgs {
            source,
            output: output.clone(),
            app: "Game".to_string(),
            version: "1.2".to_string(),
            chunk_size: 4,
        })
        .unwrap();

        let manifest = BuildManifest::load(&LocalFileSystem, &manifest_path(&output)).unwrap();
        assert_eq!(manifest.version, "1.2");
        assert_eq!(manifest.files.len(), 2);
        assert!(output.join("chunks").is_dir());
    }

    #[test]
    fn test_build_rejects_missing_source() {
        let temp = TempDir::new().unwrap();
        let result = run(BuildArgs {
            source: temp.path().join("missing"),
            output: temp.path().join("cloud"),
            app: "Game".to_string(),
            version: "1.0".to_string(),
            chunk_size: 4,
        });
        assert!(matches!(result, Err(CliError::Config(_))));
    }
}
