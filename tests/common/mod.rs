//! Helpers shared by the integration tests.

use std::sync::Arc;

use stratadb::filter_policy::BloomFilterPolicy;
use stratadb::fs::{FileSystem, InMemoryFileSystem};
use stratadb::{DbOptions, ReadOptions, DB};

/// The database directory used by every test.
pub const DB_PATH: &str = "/testdb";

/// Options over a fresh in-memory file system.
pub fn memory_options() -> DbOptions {
    DbOptions::with_filesystem(Arc::new(InMemoryFileSystem::new()))
}

/// Like [`memory_options`] but with a Bloom filter policy configured.
#[allow(dead_code)]
pub fn memory_options_with_filter() -> DbOptions {
    DbOptions {
        filter_policy: Some(Arc::new(BloomFilterPolicy::new(10))),
        ..memory_options()
    }
}

/// Open the test database with the given options.
pub fn open_db(options: &DbOptions) -> DB {
    DB::open(options.clone(), DB_PATH).expect("The test database should open.")
}

/// Fetch a key as a UTF-8 string, or `None` for NotFound.
#[allow(dead_code)]
pub fn get_string(db: &DB, key: &str) -> Option<String> {
    match db.get(ReadOptions::default(), key.as_bytes()) {
        Ok(value) => Some(String::from_utf8(value).expect("Test values are UTF-8.")),
        Err(stratadb::StrataError::NotFound) => None,
        Err(error) => panic!("Unexpected read error: {error}"),
    }
}

/// The names of the files currently in the test database directory.
#[allow(dead_code)]
pub fn list_db_files(fs: &dyn FileSystem) -> Vec<String> {
    let mut names: Vec<String> = fs
        .list_dir(std::path::Path::new(DB_PATH))
        .unwrap_or_default()
        .into_iter()
        .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    names.sort();
    names
}
