//! Chunkdb command - pack a build's chunks into a chunk database.

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::Args;

use chunkpatch::chunks::ChunkData;
use chunkpatch::fs::{FileSystem, LocalFileSystem};
use chunkpatch::manifest::chunk_relative_path;
use chunkpatch::source::ChunkDbWriter;
use chunkpatch::BuildManifest;

use super::format_size;
use crate::error::CliError;

/// Arguments for the chunkdb command.
#[derive(Debug, Args)]
pub struct ChunkDbArgs {
    /// Manifest of the build
    #[arg(long)]
    pub manifest: PathBuf,

    /// Local cloud directory holding the chunks
    #[arg(long)]
    pub cloud_dir: PathBuf,

    /// Chunk database to write
    #[arg(long)]
    pub output: PathBuf,

    /// Only pack chunks of files with this tag; repeatable
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

/// Run the chunkdb command.
pub fn run(args: ChunkDbArgs) -> Result<(), CliError> {
    let fs = LocalFileSystem;
    let manifest = BuildManifest::load(&fs, &args.manifest)?;

    let files: Vec<String> = if args.tags.is_empty() {
        manifest.files.keys().cloned().collect()
    } else {
        let tags: BTreeSet<String> = args.tags.into_iter().collect();
        manifest.tagged_files(&tags).into_iter().collect()
    };
    let chunks: BTreeSet<_> = files
        .iter()
        .filter_map(|name| manifest.file(name))
        .flat_map(|file| file.parts.iter().map(|part| part.chunk))
        .collect();

    let mut writer = ChunkDbWriter::new();
    for id in &chunks {
        let path = args.cloud_dir.join(chunk_relative_path(id));
        let bad_chunk = || CliError::BadChunk {
            id: id.to_string(),
            path: path.clone(),
        };
        let data = fs.read(&path).map_err(|_| bad_chunk())?;
        let chunk = ChunkData::new(*id, data);
        let expected = manifest.chunks.get(id).map(|c| c.hash.as_str());
        if !expected.is_some_and(|hash| chunk.verify(hash)) {
            return Err(bad_chunk());
        }
        writer.add(&chunk);
    }

    let bytes = writer.write(&fs, &args.output)?;
    tracing::info!(chunks = writer.len(), bytes, output = %args.output.display(), "Chunk database written");
    println!(
        "Wrote {} chunks ({}) to {}",
        writer.len(),
        format_size(bytes),
        args.output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkpatch::manifest::ManifestBuilder;
    use chunkpatch::source::ChunkDbReader;
    use tempfile::TempDir;

    #[test]
    fn test_pack_tagged_chunks() {
        let temp = TempDir::new().unwrap();
        let built = ManifestBuilder::new("Game", "1.0")
            .with_chunk_size(4)
            .add_tagged_file("core.bin", b"core".to_vec(), &["core"], Default::default())
            .add_tagged_file("hd.bin", b"hd-textures".to_vec(), &["hd"], Default::default())
            .build();
        let cloud = temp.path().join("cloud");
        built.write_chunks(&LocalFileSystem, &cloud).unwrap();
        let manifest_path = temp.path().join("manifest.json");
        built.manifest.save(&LocalFileSystem, &manifest_path).unwrap();
        let output = temp.path().join("core.chunkdb");

        run(ChunkDbArgs {
            manifest: manifest_path,
            cloud_dir: cloud,
            output: output.clone(),
            tags: vec!["core".to_string()],
        })
        .unwrap();

        let reader = ChunkDbReader::open(&LocalFileSystem, &output).unwrap();
        let core = built.manifest.file("core.bin").unwrap().parts[0].chunk;
        assert_eq!(reader.entries().count(), 1);
        assert!(reader.contains(&core));
    }

    #[test]
    fn test_corrupt_chunk_is_rejected() {
        let temp = TempDir::new().unwrap();
        let built = ManifestBuilder::new("Game", "1.0")
            .add_file("a.bin", b"payload".to_vec())
            .build();
        let cloud = temp.path().join("cloud");
        built.write_chunks(&LocalFileSystem, &cloud).unwrap();
        let (id, _) = built.chunks.iter().next().unwrap();
        std::fs::write(cloud.join(chunk_relative_path(id)), b"tampered").unwrap();
        let manifest_path = temp.path().join("manifest.json");
        built.manifest.save(&LocalFileSystem, &manifest_path).unwrap();

        let result = run(ChunkDbArgs {
            manifest: manifest_path,
            cloud_dir: cloud,
            output: temp.path().join("out.chunkdb"),
            tags: Vec::new(),
        });
        assert!(matches!(result, Err(CliError::BadChunk { .. })));
    }
}
