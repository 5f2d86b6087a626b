//! File system service.
//!
//! Every component that touches disk goes through [`FileSystem`], so tests and
//! embedders can substitute their own implementation. [`LocalFileSystem`] is
//! the default, backed by `std::fs`.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::manifest::FileAttributes;

/// A readable, seekable file handle.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Operations the installer needs from the file system.
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Returns true if a file or directory exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Returns true if `path` is a directory.
    fn is_dir(&self, path: &Path) -> bool;

    /// Size of the file at `path`, or `None` if it is missing or not a file.
    fn file_size(&self, path: &Path) -> Option<u64>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>>;

    /// Create (or truncate) a file for writing, creating parent directories.
    fn create_write(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut reader = self.open_read(path)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut writer = self.create_write(path)?;
        writer.write_all(data)?;
        writer.flush()
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Direct children of a directory.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    fn set_attributes(&self, path: &Path, attributes: &FileAttributes) -> io::Result<()>;
}

/// [`FileSystem`] implementation over the local disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn file_size(&self, path: &Path) -> Option<u64> {
        fs::metadata(path)
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(File::open(path)?))
    }

    fn create_write(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(io::BufWriter::new(file)))
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        // A read-only file cannot be deleted on some platforms
        if let Ok(metadata) = fs::metadata(path) {
            let mut permissions = metadata.permissions();
            if permissions.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                permissions.set_readonly(false);
                let _ = fs::set_permissions(path, permissions);
            }
        }
        fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            entries.push(entry?.path());
        }
        entries.sort();
        Ok(entries)
    }

    fn set_attributes(&self, path: &Path, attributes: &FileAttributes) -> io::Result<()> {
        let mut permissions = fs::metadata(path)?.permissions();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = permissions.mode();
            let mode = if attributes.executable {
                mode | 0o111
            } else {
                mode & !0o111
            };
            let mode = if attributes.read_only {
                mode & !0o222
            } else {
                mode | 0o200
            };
            permissions.set_mode(mode);
        }

        #[cfg(not(unix))]
        permissions.set_readonly(attributes.read_only);

        fs::set_permissions(path, permissions)
    }
}

/// Remove every empty directory below `root`, deepest first.
///
/// `root` itself is kept even when it ends up empty.
pub fn remove_empty_directories(fs: &dyn FileSystem, root: &Path) {
    let directories = WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir());

    for entry in directories {
        let dir = entry.path();
        if fs.read_dir(dir).is_ok_and(|children| children.is_empty()) {
            if let Err(e) = fs.remove_dir(dir) {
                tracing::debug!(path = %dir.display(), error = %e, "Could not remove empty directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_write_makes_parents() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a/b/c.txt");

        LocalFileSystem.write(&path, b"data").unwrap();

        assert_eq!(LocalFileSystem.read(&path).unwrap(), b"data");
        assert_eq!(LocalFileSystem.file_size(&path), Some(4));
    }

    #[test]
    fn test_file_size_of_directory_is_none() {
        let temp = TempDir::new().unwrap();
        assert_eq!(LocalFileSystem.file_size(temp.path()), None);
        assert_eq!(LocalFileSystem.file_size(&temp.path().join("missing")), None);
    }

    #[test]
    fn test_rename_into_new_directory() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("from.txt");
        let to = temp.path().join("nested/to.txt");
        std::fs::write(&from, b"x").unwrap();

        LocalFileSystem.rename(&from, &to).unwrap();

        assert!(!from.exists());
        assert!(to.exists());
    }

    #[test]
    fn test_remove_read_only_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ro.txt");
        std::fs::write(&path, b"x").unwrap();
        LocalFileSystem
            .set_attributes(
                &path,
                &FileAttributes {
                    read_only: true,
                    executable: false,
                },
            )
            .unwrap();

        LocalFileSystem.remove_file(&path).unwrap();
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_set_executable() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.sh");
        std::fs::write(&path, b"#!/bin/sh").unwrap();

        LocalFileSystem
            .set_attributes(
                &path,
                &FileAttributes {
                    read_only: false,
                    executable: true,
                },
            )
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }

    #[test]
    fn test_remove_empty_directories_keeps_root_and_files() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("empty/deeper")).unwrap();
        std::fs::create_dir_all(root.join("full")).unwrap();
        std::fs::write(root.join("full/file.txt"), b"x").unwrap();

        remove_empty_directories(&LocalFileSystem, root);

        assert!(root.exists());
        assert!(!root.join("empty").exists());
        assert!(root.join("full/file.txt").exists());
    }

    #[test]
    fn test_remove_empty_directories_collapses_nested_chain() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("install");
        std::fs::create_dir_all(root.join("a/b/c/d")).unwrap();
        std::fs::create_dir_all(root.join("a/keep")).unwrap();
        std::fs::write(root.join("a/keep/save.dat"), b"x").unwrap();

        remove_empty_directories(&LocalFileSystem, &root);

        assert!(!root.join("a/b").exists());
        assert!(root.join("a/keep/save.dat").exists());

        std::fs::remove_dir_all(root.join("a/keep")).unwrap();
        remove_empty_directories(&LocalFileSystem, &root);
        assert!(!root.join("a").exists());
        assert!(root.exists());
    }
}
