/*!
The option structures accepted by database operations.
*/

use std::sync::Arc;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::config::CompressionType;
use crate::filter_policy::FilterPolicy;
use crate::fs::{FileSystem, OsFileSystem};
use crate::snapshots::Snapshot;
use crate::tables::{Block, BlockCacheKey};
use crate::utils::cache::{Cache, ShardedLruCache};

/// The default capacity of the block cache: 8 MiB of decoded blocks.
const DEFAULT_BLOCK_CACHE_CAPACITY_BYTES: usize = 8 * 1024 * 1024;

/// Holds options controlling the behavior of a database instance.
#[derive(Clone, Debug)]
pub struct DbOptions {
    /// Create a fresh database if none exists at the path. Defaults to false.
    pub create_if_missing: bool,

    /// Fail opening if a database already exists at the path. Defaults to false.
    pub error_if_exists: bool,

    /**
    Treat recoverable read damage as hard errors.

    With this set, checksum failures in the write-ahead log or manifest
    fail the open instead of truncating recovery at the damage. Defaults to
    false.
    */
    pub paranoid_checks: bool,

    /**
    The maximum size the memtable may reach before it is frozen and flushed
    to a table file.

    Up to two memtables can reside in memory at a time: one serving reads
    and writes and one in the process of being flushed. **Defaults to
    4 MiB.**
    */
    pub write_buffer_size: usize,

    /**
    The number of files the database may hold open at once, the bulk of
    which are table files with cached handles. **Defaults to 1000.**
    */
    pub max_open_files: usize,

    /**
    The approximate size of uncompressed user data packed per table file
    block. **Defaults to 4 KiB.**
    */
    pub block_size: usize,

    /// Keys between restart points in a block. **Defaults to 16.**
    pub block_restart_interval: usize,

    /**
    Bytes written to a table file before a compaction rolls over to a new
    one. **Defaults to 2 MiB.**
    */
    pub max_file_size: usize,

    /// The codec applied to blocks. **Defaults to Snappy.**
    pub compression: CompressionType,

    /**
    Reuse the tail write-ahead log and manifest across restarts instead of
    switching to fresh files. Defaults to false.
    */
    pub reuse_logs: bool,

    /// The user-key order. **Defaults to the bytewise comparator.**
    pub comparator: Arc<dyn Comparator>,

    /**
    The filter policy consulted to skip table reads, or `None` to read
    without filters. Defaults to `None`.
    */
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /**
    The cache of decoded blocks, shared by every table file of the
    database. **Defaults to an 8 MiB sharded LRU cache.**
    */
    pub block_cache: Arc<dyn Cache<BlockCacheKey, Block>>,

    /// The file system the database operates on. **Defaults to the OS.**
    pub filesystem_provider: Arc<dyn FileSystem>,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_open_files: 1000,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            max_file_size: 2 * 1024 * 1024,
            compression: CompressionType::Snappy,
            reuse_logs: false,
            comparator: Arc::new(BytewiseComparator),
            filter_policy: None,
            block_cache: Arc::new(ShardedLruCache::new(DEFAULT_BLOCK_CACHE_CAPACITY_BYTES)),
            filesystem_provider: Arc::new(OsFileSystem::new()),
        }
    }
}

/// Public methods
impl DbOptions {
    /// Options for a throwaway database on the given file system, creating it if missing.
    pub fn with_filesystem(filesystem_provider: Arc<dyn FileSystem>) -> Self {
        DbOptions {
            create_if_missing: true,
            filesystem_provider,
            ..DbOptions::default()
        }
    }
}

/// Options for read operations.
#[derive(Clone, Debug)]
pub struct ReadOptions {
    /// Verify block checksums on every read. Defaults to false.
    pub verify_checksums: bool,

    /**
    Whether blocks read for this operation populate the block cache.

    Bulk scans may want to leave the cache alone. Defaults to true.
    */
    pub fill_cache: bool,

    /**
    Read as of this snapshot instead of the latest state. Defaults to the
    latest state.
    */
    pub snapshot: Option<Snapshot>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}

impl ReadOptions {
    /// Read options with the defaults: cache-filling, no verification, latest state.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Options for write operations.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /**
    Force the write-ahead log to durable storage before acknowledging the
    write.

    A non-sync write risks only the last few writes on a machine crash; a
    process crash alone loses nothing. Defaults to false.
    */
    pub sync: bool,
}
