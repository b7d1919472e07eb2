//! Storage I/O collaborator.
//!
//! The core never touches the filesystem directly; every create, write,
//! sync, rename and delete goes through [`StorageIo`] so callers can plug in
//! their own durability layer (or a fault-injecting one in tests).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A file opened for writing by [`StorageIo::create_file`].
pub trait WritableFile: Send {
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Makes everything written so far durable.
    fn fsync(&mut self) -> io::Result<()>;
}

pub trait StorageIo: Send + Sync + 'static {
    /// Creates (or truncates) `path` for writing.
    fn create_file(&self, path: &Path) -> io::Result<Box<dyn WritableFile>>;
    /// Atomically moves `from` to `to` and makes the rename durable.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn delete(&self, path: &Path) -> io::Result<()>;
    fn file_size(&self, path: &Path) -> io::Result<u64>;
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
    /// Regular files directly inside `dir`.
    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;
    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
}

/// [`StorageIo`] over the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

struct LocalFile {
    file: File,
}

impl WritableFile for LocalFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)
    }

    fn fsync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

impl StorageIo for LocalFs {
    fn create_file(&self, path: &Path) -> io::Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(LocalFile { file }))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)?;
        // Fsync directory to ensure rename is durable
        if let Some(dir) = to.parent() {
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}
