//! SHA-256 checksum calculation for chunk and file verification.
//!
//! All hashes are lowercase hexadecimal SHA-256 digests, the same format the
//! manifest stores for chunks and files.

use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::fs::FileSystem;

/// Buffer size for reading files during checksum calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Calculate the SHA-256 checksum of an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Calculate the SHA-256 checksum of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn calculate_file_checksum(fs: &dyn FileSystem, path: &Path) -> io::Result<String> {
    let mut reader = fs.open_read(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Check whether a file matches any of the given checksums.
///
/// Empty expected hashes never match. A file that cannot be read matches
/// nothing.
pub fn file_matches_any(fs: &dyn FileSystem, path: &Path, expected: &[&str]) -> bool {
    let candidates: Vec<&str> = expected.iter().copied().filter(|h| !h.is_empty()).collect();
    if candidates.is_empty() {
        return false;
    }
    match calculate_file_checksum(fs, path) {
        Ok(actual) => candidates.iter().any(|h| h.eq_ignore_ascii_case(&actual)),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_hash_bytes() {
        assert_eq!(
            hash_bytes(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_calculate_file_checksum() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("test.txt");

        let mut file = std::fs::File::create(&file_path).unwrap();
        file.write_all(b"hello world").unwrap();

        let checksum = calculate_file_checksum(&LocalFileSystem, &file_path).unwrap();
        assert_eq!(
            checksum,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_calculate_empty_file() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("empty.txt");
        std::fs::File::create(&file_path).unwrap();

        let checksum = calculate_file_checksum(&LocalFileSystem, &file_path).unwrap();
        assert_eq!(
            checksum,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_calculate_nonexistent_file() {
        let result = calculate_file_checksum(&LocalFileSystem, Path::new("/nonexistent/file.txt"));
        assert!(result.is_err());
    }

    #[test]
    fn test_large_file_checksum_matches_bytes() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("large.bin");

        // Larger than the read buffer
        let data = vec![0xABu8; 100_000];
        std::fs::write(&file_path, &data).unwrap();

        let checksum = calculate_file_checksum(&LocalFileSystem, &file_path).unwrap();
        assert_eq!(checksum, hash_bytes(&data));
    }

    #[test]
    fn test_file_matches_any() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("test.txt");
        std::fs::write(&file_path, b"hello world").unwrap();

        let good = hash_bytes(b"hello world");
        let bad = hash_bytes(b"other");

        assert!(file_matches_any(&LocalFileSystem, &file_path, &[&bad, &good]));
        assert!(!file_matches_any(&LocalFileSystem, &file_path, &[&bad]));
        assert!(!file_matches_any(&LocalFileSystem, &file_path, &["", ""]));
        assert!(!file_matches_any(
            &LocalFileSystem,
            &temp.path().join("missing"),
            &[&good]
        ));
    }
}
