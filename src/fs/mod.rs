/*!
File system wrappers that let different file system implementations back a
database.

The primary purpose of the abstraction is testing: the crash and recovery
tests run against an in-memory file system where "crashing" is simply
dropping the database object while keeping the stored bytes.
*/

use core::fmt::Debug;
use std::io::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod disk;
mod mem;

pub use disk::OsFileSystem;
pub use mem::InMemoryFileSystem;

/// A source of binary content that can serve reads at arbitrary offsets.
pub trait ReadonlyRandomAccessFile: Send + Sync {
    /// Read up to `buf.len()` bytes starting from the given offset.
    fn read_from(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Get the length of the file.
    fn len(&self) -> Result<u64>;

    /// Return true if the file is empty. Otherwise, false.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/**
A sink for sequential writes with explicit flush and durability points.

Write-ahead logs, manifests, and table files are all written through this
interface.
*/
pub trait AppendableFile: Send {
    /// Append the buffer to the end of the file.
    fn append(&mut self, buf: &[u8]) -> Result<()>;

    /// Push buffered bytes to the operating system.
    fn flush(&mut self) -> Result<()>;

    /// Force written bytes to durable storage.
    fn sync(&mut self) -> Result<()>;
}

/// An interface for common file system operations.
pub trait FileSystem: Debug + Send + Sync {
    /// The name of the file system implementation.
    fn name(&self) -> String;

    /// Recursively create a directory and its missing parents.
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// List the files under `path`.
    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Open a file for random-access reads.
    fn open_file(&self, path: &Path) -> Result<Arc<dyn ReadonlyRandomAccessFile>>;

    /**
    Open a file for appending.

    The file is created if it does not exist. With `append` set, writing
    continues from the current end of an existing file; otherwise an
    existing file is truncated to length zero.
    */
    fn create_file(&self, path: &Path, append: bool) -> Result<Box<dyn AppendableFile>>;

    /**
    Rename a file, replacing any file already at the destination.

    Matches the platform caveats of [`std::fs::rename`] for disk-backed
    implementations.
    */
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Remove a file.
    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Get the size of the file at the specified path.
    fn file_size(&self, path: &Path) -> Result<u64>;

    /// Whether a file exists at the specified path.
    fn exists(&self, path: &Path) -> bool;

    /**
    Place an advisory exclusive lock on the file at the specified path,
    creating it if needed. Fails fast if the lock is already held.
    */
    fn lock_file(&self, path: &Path) -> Result<FileLock>;
}

/**
An opaque handle for a held file lock.

The lock is released when the handle is dropped.
*/
pub struct FileLock {
    inner: Box<dyn UnlockableFile>,
}

impl FileLock {
    /// Create a new instance of [`FileLock`].
    pub fn new(file: Box<dyn UnlockableFile>) -> Self {
        Self { inner: file }
    }
}

impl Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").finish()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(unlock_error) = self.inner.unlock() {
            log::error!(
                "There was an error releasing a file lock during shutdown. Error: {unlock_error}"
            );
        }
    }
}

/// A locked file that can be unlocked.
pub trait UnlockableFile: Send {
    /// Unlock the file.
    fn unlock(&self) -> Result<()>;
}
