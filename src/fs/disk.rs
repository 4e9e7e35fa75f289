//! The disk-backed file system used by real databases.

use std::fs::{File, OpenOptions};
use std::io::{Read, Result, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::Mutex;

use super::{
    AppendableFile, FileLock, FileSystem, ReadonlyRandomAccessFile, UnlockableFile,
};

/// A [`FileSystem`] implementation backed by the operating system.
#[derive(Clone, Debug, Default)]
pub struct OsFileSystem;

impl OsFileSystem {
    /// Create a new instance of [`OsFileSystem`].
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for OsFileSystem {
    fn name(&self) -> String {
        "OsFileSystem".to_string()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = vec![];
        for dir_entry in std::fs::read_dir(path)? {
            entries.push(dir_entry?.path());
        }

        Ok(entries)
    }

    fn open_file(&self, path: &Path) -> Result<Arc<dyn ReadonlyRandomAccessFile>> {
        let file = File::open(path)?;
        Ok(Arc::new(DiskReadonlyFile {
            file: Mutex::new(file),
        }))
    }

    fn create_file(&self, path: &Path, append: bool) -> Result<Box<dyn AppendableFile>> {
        let mut open_options = OpenOptions::new();
        open_options.create(true).write(true);
        if append {
            open_options.append(true);
        } else {
            open_options.truncate(true);
        }

        Ok(Box::new(DiskAppendableFile {
            file: open_options.open(path)?,
        }))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn lock_file(&self, path: &Path) -> Result<FileLock> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.try_lock_exclusive()?;

        Ok(FileLock::new(Box::new(DiskLockedFile { file })))
    }
}

/// A read-only file on disk. A mutex serializes the seek-then-read pairs.
struct DiskReadonlyFile {
    file: Mutex<File>,
}

impl ReadonlyRandomAccessFile for DiskReadonlyFile {
    fn read_from(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        // Fill as much of the buffer as the file allows.
        let mut total_read = 0;
        while total_read < buf.len() {
            let bytes_read = file.read(&mut buf[total_read..])?;
            if bytes_read == 0 {
                break;
            }
            total_read += bytes_read;
        }

        Ok(total_read)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }
}

/// An append-only file on disk.
struct DiskAppendableFile {
    file: File,
}

impl AppendableFile for DiskAppendableFile {
    fn append(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()
    }
}

/// A file with an advisory lock held on it.
struct DiskLockedFile {
    file: File,
}

impl UnlockableFile for DiskLockedFile {
    fn unlock(&self) -> Result<()> {
        FileExt::unlock(&self.file)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn files_round_trip_through_append_and_random_reads() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("roundtrip");
        let fs = OsFileSystem::new();

        let mut writable = fs.create_file(&path, false).unwrap();
        writable.append(b"hello stratadb").unwrap();
        writable.flush().unwrap();
        writable.sync().unwrap();
        drop(writable);

        let readable = fs.open_file(&path).unwrap();
        assert_eq!(readable.len().unwrap(), 14);

        let mut buf = vec![0; 8];
        let bytes_read = readable.read_from(&mut buf, 6).unwrap();
        assert_eq!(bytes_read, 8);
        assert_eq!(&buf, b"stratadb");
    }

    #[test]
    fn locks_are_exclusive() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("LOCK");
        let fs = OsFileSystem::new();

        let held = fs.lock_file(&path).unwrap();
        assert!(
            fs.lock_file(&path).is_err(),
            "A second lock on the same file must fail fast."
        );

        drop(held);
        let reacquired = fs.lock_file(&path);
        assert!(
            reacquired.is_ok(),
            "Dropping the lock handle must release the lock."
        );
    }
}
