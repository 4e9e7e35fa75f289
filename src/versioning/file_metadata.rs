//! Metadata about one table file.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::config::{MIN_ALLOWED_SEEKS, SEEK_CHARGE_DATA_SIZE_BYTES};
use crate::key::InternalKey;

/// Metadata describing a table file tracked by the version set.
#[derive(Debug)]
pub(crate) struct FileMetadata {
    /// The number identifying the file on disk.
    file_number: u64,

    /// The size of the file in bytes.
    file_size: u64,

    /// The smallest internal key served by the file.
    smallest: InternalKey,

    /// The largest internal key served by the file.
    largest: InternalKey,

    /**
    Seeks allowed through this file before it is scheduled for compaction.

    A lookup that traverses the file without finding its key consumes one
    seek. Mutated under the database mutex; atomic because the metadata is
    shared between versions.
    */
    allowed_seeks: AtomicI64,
}

/// Crate-only methods
impl FileMetadata {
    /// Create a new instance of [`FileMetadata`].
    pub(crate) fn new(
        file_number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) -> Self {
        // One seek is afforded per 16 KiB of file, with a floor so small
        // files are not compacted over a handful of misses.
        let allowed_seeks = std::cmp::max(
            (file_size / SEEK_CHARGE_DATA_SIZE_BYTES) as i64,
            MIN_ALLOWED_SEEKS,
        );

        Self {
            file_number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed_seeks),
        }
    }

    /// The number identifying the file on disk.
    pub(crate) fn file_number(&self) -> u64 {
        self.file_number
    }

    /// The size of the file in bytes.
    pub(crate) fn file_size(&self) -> u64 {
        self.file_size
    }

    /// The smallest internal key served by the file.
    pub(crate) fn smallest(&self) -> &InternalKey {
        &self.smallest
    }

    /// The largest internal key served by the file.
    pub(crate) fn largest(&self) -> &InternalKey {
        &self.largest
    }

    /**
    Consume one of the file's allowed seeks.

    Returns the remaining allowance; zero means the file should be
    scheduled for a seek-triggered compaction.
    */
    pub(crate) fn consume_seek(&self) -> i64 {
        self.allowed_seeks.fetch_sub(1, Ordering::Relaxed) - 1
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::key::Operation;

    use super::*;

    fn metadata(file_size: u64) -> FileMetadata {
        FileMetadata::new(
            7,
            file_size,
            InternalKey::new(b"a", 1, Operation::Put),
            InternalKey::new(b"z", 2, Operation::Put),
        )
    }

    #[test]
    fn small_files_get_the_seek_floor() {
        let file = metadata(1024);
        assert_eq!(file.consume_seek(), 99);
    }

    #[test]
    fn seek_allowance_scales_with_file_size() {
        // 16 MiB of file yields 1024 seeks.
        let file = metadata(16 * 1024 * 1024);
        assert_eq!(file.consume_seek(), 1023);
    }
}
