/*!
Global configuration constants for stratadb.

Values that LevelDB-lineage engines make tunable per database are on
[`DbOptions`](crate::options::DbOptions); the constants here are structural
and shared by every database instance.
*/

use std::convert::TryFrom;

use crate::errors::{StrataError, StrataResult};

/// The size of a `u32` in bytes.
pub(crate) const SIZE_OF_U32_BYTES: usize = 4;

/// The size of a `u64` in bytes.
pub(crate) const SIZE_OF_U64_BYTES: usize = 8;

/// The maximum number of table file levels.
pub(crate) const MAX_NUM_LEVELS: usize = 7;

/// Level-0 compaction is started when we hit this many files.
pub(crate) const L0_COMPACTION_TRIGGER: usize = 4;

/**
Soft limit on the number of level-0 files.

Writes are slowed down by a one-time 1 ms delay when a write finds this many
level-0 files.
*/
pub(crate) const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;

/// Maximum number of level-0 files. Writes stall entirely at this point.
pub(crate) const L0_STOP_WRITES_TRIGGER: usize = 12;

/**
Maximum level to which a newly flushed memtable is pushed if it does not
create overlap.

We try to push to level 2 to avoid the relatively expensive level 0 to
level 1 compactions and to avoid some manifest file operations. We do not
push all the way to the largest level since that can generate a lot of
wasted disk space if the same key space is being repeatedly overwritten.
*/
pub(crate) const MAX_MEM_COMPACT_LEVEL: usize = 2;

/**
The overall maximum group commit size.

Bounding the group keeps the latency of any single write from growing
without limit while the group leader batches followers.
*/
pub(crate) const MAX_GROUP_COMMIT_SIZE_BYTES: usize = 1024 * 1024;

/// The upper threshold for a write to be considered a small write.
pub(crate) const GROUP_COMMIT_SMALL_WRITE_THRESHOLD_BYTES: usize = 128 * 1024;

/**
The additional bytes a group commit may grow by when the leading writer has
a small batch, so that small writes are not penalized by a large group.
*/
pub(crate) const SMALL_WRITE_ADDITIONAL_GROUP_COMMIT_SIZE_BYTES: usize = 128 * 1024;

/**
One seek through a table file is charged per this many bytes of file size
when initializing the file's seek allowance. A file whose allowance reaches
zero is scheduled for a seek-triggered compaction.

The reasoning, inherited from LevelDB: one disk seek costs about as much as
compacting 40 KiB of data, and we are conservative by a factor of about
three.
*/
pub(crate) const SEEK_CHARGE_DATA_SIZE_BYTES: u64 = 16 * 1024;

/// The floor for a table file's initial seek allowance.
pub(crate) const MIN_ALLOWED_SEEKS: i64 = 100;

/**
Iterators sample roughly one internal key per this many bytes read and feed
the sample into the seek-compaction statistics.
*/
pub(crate) const READ_BYTES_PERIOD: u64 = 1024 * 1024;

/**
The compression applied to blocks within a table file.

The codec is recorded per block on disk, so a database may contain a mix of
compressed and uncompressed blocks (for example after changing the option
between restarts, or when a block did not compress well enough to be worth
storing compressed).
*/
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CompressionType {
    /// Identity codec.
    None = 0,
    /// Snappy byte-stream compression.
    Snappy = 1,
}

impl TryFrom<u8> for CompressionType {
    type Error = StrataError;

    fn try_from(value: u8) -> StrataResult<CompressionType> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Snappy),
            _ => Err(StrataError::Corruption(format!(
                "Unknown block compression type: {value}."
            ))),
        }
    }
}
