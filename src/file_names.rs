/*!
Utilities for managing the file names used by the database.

All files live flat in the database directory:

- `CURRENT` — names the active manifest
- `LOCK` — the advisory lock file
- `LOG`, `LOG.old` — human-readable info logs (recognized, not written)
- `MANIFEST-<n>` — version-edit logs
- `<n>.log` — write-ahead logs
- `<n>.ldb` — table files (the legacy `.sst` suffix is also accepted)
- `<n>.dbtmp` — scratch files that are renamed into place
*/

use std::path::{Path, PathBuf};

use crate::errors::{StrataError, StrataResult};

/// Name of the `CURRENT` file.
pub(crate) const CURRENT_FILE_NAME: &str = "CURRENT";

/// The name of the database lock file.
pub(crate) const LOCK_FILE_NAME: &str = "LOCK";

/// The name of the human-readable info log.
pub(crate) const INFO_LOG_FILE_NAME: &str = "LOG";

/// The name the previous info log is rotated to.
pub(crate) const OLD_INFO_LOG_FILE_NAME: &str = "LOG.old";

/// Suffix for write-ahead log files.
const WAL_EXT: &str = "log";

/// Suffix for table files.
const TABLE_EXT: &str = "ldb";

/// The table file suffix written by older releases of this format family.
const LEGACY_TABLE_EXT: &str = "sst";

/// Suffix for temp files.
const TEMP_EXT: &str = "dbtmp";

/// Prefix for manifest files.
const MANIFEST_PREFIX: &str = "MANIFEST-";

/**
Enum of file types used by the database.

If appropriate, variants hold the file number parsed from the file name.
*/
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ParsedFileType {
    WriteAheadLog(u64),
    DbLockFile,
    TableFile(u64),
    ManifestFile(u64),
    CurrentFile,
    TempFile(u64),
    InfoLogFile,
}

/// Produces and parses the paths of the files a database uses.
#[derive(Clone, Debug)]
pub(crate) struct FileNameHandler {
    db_path: PathBuf,
}

/// Crate-only methods
impl FileNameHandler {
    /// Create a new instance of the [`FileNameHandler`].
    pub(crate) fn new<P: Into<PathBuf>>(db_path: P) -> Self {
        FileNameHandler {
            db_path: db_path.into(),
        }
    }

    /// The database directory itself.
    pub(crate) fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Resolve the path to a write-ahead log.
    pub(crate) fn wal_path(&self, wal_number: u64) -> PathBuf {
        self.db_path.join(format!("{wal_number:06}.{WAL_EXT}"))
    }

    /// Resolve the path to a table file.
    pub(crate) fn table_path(&self, file_number: u64) -> PathBuf {
        self.db_path.join(format!("{file_number:06}.{TABLE_EXT}"))
    }

    /// Resolve the path a table file would have under the legacy suffix.
    pub(crate) fn legacy_table_path(&self, file_number: u64) -> PathBuf {
        self.db_path
            .join(format!("{file_number:06}.{LEGACY_TABLE_EXT}"))
    }

    /// Resolve the path to a manifest file.
    pub(crate) fn manifest_path(&self, manifest_number: u64) -> PathBuf {
        self.db_path
            .join(format!("{MANIFEST_PREFIX}{manifest_number:06}"))
    }

    /// Resolve the path to the `CURRENT` file.
    pub(crate) fn current_path(&self) -> PathBuf {
        self.db_path.join(CURRENT_FILE_NAME)
    }

    /// Resolve the path to the `LOCK` file.
    pub(crate) fn lock_path(&self) -> PathBuf {
        self.db_path.join(LOCK_FILE_NAME)
    }

    /// Resolve the path to a temp file.
    pub(crate) fn temp_path(&self, file_number: u64) -> PathBuf {
        self.db_path.join(format!("{file_number:06}.{TEMP_EXT}"))
    }

    /// Determine the file type (and number, if any) encoded in a file path.
    pub(crate) fn parse_file_name(file_path: &Path) -> StrataResult<ParsedFileType> {
        let unrecognized = || {
            StrataError::InvalidArgument(format!(
                "Not a recognized database file name: {file_path:?}."
            ))
        };

        let file_name = file_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(unrecognized)?;

        match file_name {
            CURRENT_FILE_NAME => return Ok(ParsedFileType::CurrentFile),
            LOCK_FILE_NAME => return Ok(ParsedFileType::DbLockFile),
            INFO_LOG_FILE_NAME | OLD_INFO_LOG_FILE_NAME => {
                return Ok(ParsedFileType::InfoLogFile)
            }
            _ => {}
        }

        if let Some(manifest_number) = file_name.strip_prefix(MANIFEST_PREFIX) {
            let file_number = manifest_number.parse::<u64>().map_err(|_| unrecognized())?;
            return Ok(ParsedFileType::ManifestFile(file_number));
        }

        let (stem, extension) = file_name.split_once('.').ok_or_else(unrecognized)?;
        let file_number = stem.parse::<u64>().map_err(|_| unrecognized())?;
        match extension {
            WAL_EXT => Ok(ParsedFileType::WriteAheadLog(file_number)),
            TABLE_EXT | LEGACY_TABLE_EXT => Ok(ParsedFileType::TableFile(file_number)),
            TEMP_EXT => Ok(ParsedFileType::TempFile(file_number)),
            _ => Err(unrecognized()),
        }
    }
}
