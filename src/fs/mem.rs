/*!
An in-memory file system.

Used by tests, most notably the crash-recovery tests: dropping every handle
to a database while keeping the file system alive is a faithful stand-in
for a process crash, since nothing buffered below the [`AppendableFile`]
interface survives either way.
*/

use std::collections::{HashMap, HashSet};
use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{
    AppendableFile, FileLock, FileSystem, ReadonlyRandomAccessFile, UnlockableFile,
};

/// Shared contents of one in-memory file.
type FileContents = Arc<RwLock<Vec<u8>>>;

/// A [`FileSystem`] implementation that stores all files on the heap.
#[derive(Clone, Debug, Default)]
pub struct InMemoryFileSystem {
    inner: Arc<FsState>,
}

#[derive(Debug, Default)]
struct FsState {
    files: RwLock<HashMap<PathBuf, FileContents>>,
    locked_files: Mutex<HashSet<PathBuf>>,
}

impl InMemoryFileSystem {
    /// Create a new instance of [`InMemoryFileSystem`].
    pub fn new() -> Self {
        Self::default()
    }

    fn get_contents(&self, path: &Path) -> Result<FileContents> {
        match self.inner.files.read().get(path) {
            Some(contents) => Ok(Arc::clone(contents)),
            None => Err(Error::new(
                ErrorKind::NotFound,
                format!("No in-memory file at {path:?}."),
            )),
        }
    }
}

impl FileSystem for InMemoryFileSystem {
    fn name(&self) -> String {
        "InMemoryFileSystem".to_string()
    }

    fn create_dir_all(&self, _path: &Path) -> Result<()> {
        // Directories are implicit.
        Ok(())
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let files = self.inner.files.read();
        Ok(files
            .keys()
            .filter(|file_path| file_path.parent() == Some(path))
            .cloned()
            .collect())
    }

    fn open_file(&self, path: &Path) -> Result<Arc<dyn ReadonlyRandomAccessFile>> {
        let contents = self.get_contents(path)?;
        Ok(Arc::new(InMemoryFile { contents }))
    }

    fn create_file(&self, path: &Path, append: bool) -> Result<Box<dyn AppendableFile>> {
        let mut files = self.inner.files.write();
        let contents = files
            .entry(path.to_path_buf())
            .or_insert_with(FileContents::default);
        if !append {
            contents.write().clear();
        }

        Ok(Box::new(InMemoryFile {
            contents: Arc::clone(contents),
        }))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut files = self.inner.files.write();
        match files.remove(from) {
            Some(contents) => {
                files.insert(to.to_path_buf(), contents);
                Ok(())
            }
            None => Err(Error::new(
                ErrorKind::NotFound,
                format!("No in-memory file at {from:?} to rename."),
            )),
        }
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        match self.inner.files.write().remove(path) {
            Some(_) => Ok(()),
            None => Err(Error::new(
                ErrorKind::NotFound,
                format!("No in-memory file at {path:?} to remove."),
            )),
        }
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        Ok(self.get_contents(path)?.read().len() as u64)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.files.read().contains_key(path)
    }

    fn lock_file(&self, path: &Path) -> Result<FileLock> {
        self.create_file(path, true)?;

        let mut locked_files = self.inner.locked_files.lock();
        if !locked_files.insert(path.to_path_buf()) {
            return Err(Error::new(
                ErrorKind::WouldBlock,
                format!("The in-memory file at {path:?} is already locked."),
            ));
        }

        Ok(FileLock::new(Box::new(InMemoryLockedFile {
            state: Arc::clone(&self.inner),
            path: path.to_path_buf(),
        })))
    }
}

/// A single in-memory file, usable for both reading and appending.
struct InMemoryFile {
    contents: FileContents,
}

impl ReadonlyRandomAccessFile for InMemoryFile {
    fn read_from(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let contents = self.contents.read();
        let offset = offset as usize;
        if offset >= contents.len() {
            return Ok(0);
        }

        let readable = std::cmp::min(buf.len(), contents.len() - offset);
        buf[..readable].copy_from_slice(&contents[offset..offset + readable]);
        Ok(readable)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.contents.read().len() as u64)
    }
}

impl AppendableFile for InMemoryFile {
    fn append(&mut self, buf: &[u8]) -> Result<()> {
        self.contents.write().extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Lock bookkeeping for the in-memory file system.
struct InMemoryLockedFile {
    state: Arc<FsState>,
    path: PathBuf,
}

impl UnlockableFile for InMemoryLockedFile {
    fn unlock(&self) -> Result<()> {
        self.state.locked_files.lock().remove(&self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn files_round_trip_and_are_listable() {
        let fs = InMemoryFileSystem::new();
        let dir = PathBuf::from("/db");

        let mut file = fs.create_file(&dir.join("000003.log"), false).unwrap();
        file.append(b"abc").unwrap();
        file.append(b"def").unwrap();
        drop(file);

        let mut listing = fs.list_dir(&dir).unwrap();
        listing.sort();
        assert_eq!(listing, vec![dir.join("000003.log")]);

        let readable = fs.open_file(&dir.join("000003.log")).unwrap();
        let mut buf = vec![0; 4];
        assert_eq!(readable.read_from(&mut buf, 2).unwrap(), 4);
        assert_eq!(&buf, b"cdef");
        assert_eq!(fs.file_size(&dir.join("000003.log")).unwrap(), 6);
    }

    #[test]
    fn truncating_create_clears_previous_contents() {
        let fs = InMemoryFileSystem::new();
        let path = PathBuf::from("/db/CURRENT");

        fs.create_file(&path, false)
            .unwrap()
            .append(b"MANIFEST-000007")
            .unwrap();
        fs.create_file(&path, false)
            .unwrap()
            .append(b"MANIFEST-000009")
            .unwrap();

        assert_eq!(fs.file_size(&path).unwrap(), 15);
        let readable = fs.open_file(&path).unwrap();
        let mut buf = vec![0; 15];
        readable.read_from(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"MANIFEST-000009");
    }

    #[test]
    fn renames_replace_the_target() {
        let fs = InMemoryFileSystem::new();
        let temp = PathBuf::from("/db/000004.dbtmp");
        let current = PathBuf::from("/db/CURRENT");

        fs.create_file(&temp, false).unwrap().append(b"new").unwrap();
        fs.create_file(&current, false)
            .unwrap()
            .append(b"old contents")
            .unwrap();

        fs.rename(&temp, &current).unwrap();
        assert!(!fs.exists(&temp));
        assert_eq!(fs.file_size(&current).unwrap(), 3);
    }

    #[test]
    fn locks_are_exclusive_until_dropped() {
        let fs = InMemoryFileSystem::new();
        let path = PathBuf::from("/db/LOCK");

        let lock = fs.lock_file(&path).unwrap();
        assert!(fs.lock_file(&path).is_err());
        drop(lock);
        assert!(fs.lock_file(&path).is_ok());
    }
}
