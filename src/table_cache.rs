/*!
A bounded cache of open table files.

Every read through a version goes through this cache, which maps a file
number to an opened [`Table`] handle. The cache holds most of the
database's file-descriptor budget; evicting an entry closes the underlying
file once the last in-flight read drops its handle.
*/

use std::path::PathBuf;
use std::sync::Arc;

use crate::errors::{StrataError, StrataResult};
use crate::file_names::FileNameHandler;
use crate::iterator::StorageIterator;
use crate::options::{DbOptions, ReadOptions};
use crate::tables::Table;
use crate::utils::cache::{Cache, ShardedLruCache};

/**
File descriptors kept in reserve for non-table uses (the write-ahead log,
the manifest, and incidental files).
*/
const RESERVED_FILE_HANDLES: usize = 10;

/// A cache of open table files keyed by file number.
pub(crate) struct TableCache {
    /// Options for configuring the operation of the database.
    options: DbOptions,

    /// Handler for the database's file names.
    file_name_handler: FileNameHandler,

    /// The table handles, charged one cache unit each.
    cache: ShardedLruCache<u64, Table>,
}

/// Crate-only methods
impl TableCache {
    /// Create a new instance of [`TableCache`] for the database at `db_path`.
    pub(crate) fn new<P: Into<PathBuf>>(db_path: P, options: DbOptions) -> Self {
        let capacity = options
            .max_open_files
            .saturating_sub(RESERVED_FILE_HANDLES)
            .max(1);

        Self {
            file_name_handler: FileNameHandler::new(db_path),
            options,
            cache: ShardedLruCache::new(capacity),
        }
    }

    /**
    Look up `internal_key` in the given table file.

    See [`Table::get`] for the shape of the result.
    */
    pub(crate) fn get(
        &self,
        read_options: &ReadOptions,
        file_number: u64,
        file_size: u64,
        internal_key: &[u8],
    ) -> StrataResult<Option<(Vec<u8>, Vec<u8>)>> {
        let table = self.find_table(file_number, file_size)?;
        table.get(read_options, internal_key)
    }

    /// An iterator over the given table file.
    pub(crate) fn iter_table(
        &self,
        read_options: ReadOptions,
        file_number: u64,
        file_size: u64,
    ) -> StrataResult<Box<dyn StorageIterator>> {
        let table = self.find_table(file_number, file_size)?;
        Ok(Box::new(table.iter(read_options)))
    }

    /// The approximate data offset of `internal_key` within a table file.
    pub(crate) fn approximate_offset_of(
        &self,
        file_number: u64,
        file_size: u64,
        internal_key: &[u8],
    ) -> u64 {
        match self.find_table(file_number, file_size) {
            Ok(table) => table.approximate_offset_of(internal_key),
            Err(_) => 0,
        }
    }

    /// Drop the cached handle for a deleted table file.
    pub(crate) fn evict(&self, file_number: u64) {
        self.cache.erase(&file_number);
    }

    /// Fetch the table handle, opening the file on a cache miss.
    pub(crate) fn find_table(&self, file_number: u64, file_size: u64) -> StrataResult<Arc<Table>> {
        if let Some(table) = self.cache.get(&file_number) {
            return Ok(table);
        }

        let table = self.open_table(file_number, file_size)?;
        Ok(self.cache.insert(file_number, Arc::new(table), 1))
    }
}

/// Private methods
impl TableCache {
    fn open_table(&self, file_number: u64, file_size: u64) -> StrataResult<Table> {
        let fs = &self.options.filesystem_provider;
        let primary_path = self.file_name_handler.table_path(file_number);

        let file = match fs.open_file(&primary_path) {
            Ok(file) => file,
            Err(primary_err) => {
                // Fall back to the legacy table suffix before failing.
                let legacy_path = self.file_name_handler.legacy_table_path(file_number);
                match fs.open_file(&legacy_path) {
                    Ok(file) => file,
                    Err(_) => {
                        log::error!(
                            "Table file {file_number} is missing (checked {primary_path:?} \
                            and the legacy suffix)."
                        );
                        return Err(StrataError::Corruption(format!(
                            "Missing table file {file_number}: {primary_err}."
                        )));
                    }
                }
            }
        };

        Table::open(self.options.clone(), file, file_size)
    }
}
