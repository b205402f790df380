//! File-based storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A commit log stored in a single file.
///
/// Opening takes an exclusive advisory lock on a sibling `.lock` file, so
/// two engines never append to the same log. The lock is released when
/// the backend is dropped.
///
/// `replace` writes the new contents to a temporary sibling, syncs it and
/// renames it over the log, so a crash during compaction leaves either
/// the old or the new log in place.
///
/// # Example
///
/// ```no_run
/// use threaddb_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("data/commit.log")).unwrap();
/// backend.append(b"frame").unwrap();
/// backend.flush().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: File,
    size: u64,
    _lock: File,
}

impl FileBackend {
    /// Opens or creates the log at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another handle holds the lock,
    /// or an I/O error if the file cannot be opened.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path(path))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
            _lock: lock,
        })
    }

    /// Returns the path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".compact");
    PathBuf::from(name)
}

impl StorageBackend for FileBackend {
    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let offset = self.size;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.size += data.len() as u64;
        Ok(offset)
    }

    fn contents(&self) -> StorageResult<Vec<u8>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(self.size as usize);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        let tmp = temp_path(&self.path);
        {
            let mut out = File::create(&tmp)?;
            out.write_all(data)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        self.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        self.size = data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn len(&self) -> StorageResult<u64> {
        Ok(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("commit.log");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"hello ").unwrap();
            backend.append(b"world").unwrap();
            backend.flush().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.len().unwrap(), 11);
        assert_eq!(backend.contents().unwrap(), b"hello world");
    }

    #[test]
    fn second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commit.log");

        let _first = FileBackend::open(&path).unwrap();
        let second = FileBackend::open(&path);
        assert!(matches!(second, Err(StorageError::Locked)));
    }

    #[test]
    fn replace_then_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commit.log");

        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(b"a long history").unwrap();
        backend.replace(b"snap").unwrap();
        backend.append(b"+1").unwrap();
        backend.flush().unwrap();

        assert_eq!(backend.contents().unwrap(), b"snap+1");
        assert_eq!(fs::read(&path).unwrap(), b"snap+1");
    }
}
