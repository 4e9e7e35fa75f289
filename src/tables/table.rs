/*!
Reads a table file.

Opening a table parses the footer, loads the index block, and, when the
configured filter policy matches a filter recorded in the metaindex, loads
the filter block. Data blocks are fetched on demand through the shared
block cache.
*/

use std::sync::Arc;

use integer_encoding::FixedInt;

use crate::comparator::{BytewiseComparator, Comparator};
use crate::config::{CompressionType, SIZE_OF_U32_BYTES};
use crate::errors::{StrataError, StrataResult};
use crate::filter_policy::InternalFilterPolicy;
use crate::fs::ReadonlyRandomAccessFile;
use crate::iterator::StorageIterator;
use crate::key::InternalKeyComparator;
use crate::options::{DbOptions, ReadOptions};
use crate::utils::crc::{unmask_checksum, CRC_CALCULATOR};

use super::block::{Block, BlockIterator};
use super::block_handle::BlockHandle;
use super::errors::{ReadError, TableReadResult};
use super::filter_block::FilterBlockReader;
use super::footer::{Footer, SIZE_OF_FOOTER_BYTES};
use super::table_builder::{BLOCK_TRAILER_SIZE_BYTES, FILTER_META_KEY_PREFIX};
use super::BlockCacheKey;

/// An open, immutable table file.
pub(crate) struct Table {
    /// Options for configuring the operation of the database.
    options: DbOptions,

    /// Orders the internal keys stored in the table.
    comparator: InternalKeyComparator,

    /// The underlying file.
    file: Arc<dyn ReadonlyRandomAccessFile>,

    /// This table's partition of the shared block cache key space.
    cache_id: u64,

    /// The index block, held for the lifetime of the table.
    index_block: Arc<Block>,

    /// Offset of the metaindex block, used as the "past the end" estimate.
    metaindex_offset: u64,

    /// The filter reader, when the file carries a matching filter block.
    filter: Option<FilterBlockReader>,
}

/// Crate-only methods
impl Table {
    /// Open a table file of `file_size` bytes.
    pub(crate) fn open(
        options: DbOptions,
        file: Arc<dyn ReadonlyRandomAccessFile>,
        file_size: u64,
    ) -> StrataResult<Table> {
        if (file_size as usize) < SIZE_OF_FOOTER_BYTES {
            return Err(StrataError::Corruption(
                "File is too short to be a table file.".to_string(),
            ));
        }

        log::debug!("Opening a table file of {file_size} bytes.");
        let mut footer_buf = vec![0; SIZE_OF_FOOTER_BYTES];
        let footer_offset = file_size - SIZE_OF_FOOTER_BYTES as u64;
        let bytes_read = file
            .read_from(&mut footer_buf, footer_offset)
            .map_err(|err| StrataError::from(ReadError::from(err)))?;
        if bytes_read < SIZE_OF_FOOTER_BYTES {
            return Err(StrataError::Corruption(
                "Could not read a whole footer from the table file.".to_string(),
            ));
        }
        let footer = Footer::decode(&footer_buf)?;

        let verify_checksums = options.paranoid_checks;
        let index_contents =
            read_block_contents(file.as_ref(), footer.index_handle(), verify_checksums)?;
        let index_block = Arc::new(Block::new(index_contents)?);

        let comparator = InternalKeyComparator::new(Arc::clone(&options.comparator));
        let cache_id = options.block_cache.new_id();
        let metaindex_offset = footer.metaindex_handle().offset();

        let mut table = Self {
            options,
            comparator,
            file,
            cache_id,
            index_block,
            metaindex_offset,
            filter: None,
        };
        table.read_filter_block(footer.metaindex_handle(), verify_checksums);

        Ok(table)
    }

    /**
    Find the entry for `internal_key`, if the table holds one.

    Returns the stored internal key and value of the first entry at or
    after the target within the data block the index points at. The caller
    decides whether the user keys actually match and how to interpret the
    operation tag.
    */
    pub(crate) fn get(
        &self,
        read_options: &ReadOptions,
        internal_key: &[u8],
    ) -> StrataResult<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = self.index_block.iter(self.comparator_handle());
        index_iter.seek(internal_key);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }

        let (handle, _) = BlockHandle::decode(index_iter.value())?;

        // The filter gives a definitive "absent" for most misses without
        // touching the data block.
        if let Some(filter) = self.filter.as_ref() {
            if !filter.key_may_match(handle.offset(), internal_key) {
                return Ok(None);
            }
        }

        let block = self.block_reader(read_options, &handle)?;
        let mut block_iter = block.iter(self.comparator_handle());
        block_iter.seek(internal_key);
        if !block_iter.valid() {
            block_iter.status()?;
            return Ok(None);
        }

        Ok(Some((block_iter.key().to_vec(), block_iter.value().to_vec())))
    }

    /// Iterate every entry of the table in key order.
    pub(crate) fn iter(self: &Arc<Self>, read_options: ReadOptions) -> TableIterator {
        TableIterator {
            table: Arc::clone(self),
            read_options,
            index_iter: self.index_block.iter(self.comparator_handle()),
            data_iter: None,
            current_data_handle: vec![],
            error: None,
        }
    }

    /**
    The approximate file offset at which the data for `internal_key`
    begins.

    Keys past the end of the table map to the metaindex offset, which is a
    tight upper bound on the data region.
    */
    pub(crate) fn approximate_offset_of(&self, internal_key: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(self.comparator_handle());
        index_iter.seek(internal_key);
        if index_iter.valid() {
            if let Ok((handle, _)) = BlockHandle::decode(index_iter.value()) {
                return handle.offset();
            }
        }

        self.metaindex_offset
    }
}

/// Private methods
impl Table {
    fn comparator_handle(&self) -> Arc<dyn Comparator> {
        Arc::new(self.comparator.clone())
    }

    /**
    Fetch a data block, preferring the shared block cache.

    Cache misses read from the file and, when the read options permit,
    populate the cache charged at the block's byte size.
    */
    fn block_reader(
        &self,
        read_options: &ReadOptions,
        handle: &BlockHandle,
    ) -> StrataResult<Arc<Block>> {
        let cache_key = BlockCacheKey {
            cache_id: self.cache_id,
            block_offset: handle.offset(),
        };

        if let Some(cached) = self.options.block_cache.get(&cache_key) {
            return Ok(cached);
        }

        let contents = read_block_contents(
            self.file.as_ref(),
            handle,
            read_options.verify_checksums,
        )?;
        let block = Arc::new(Block::new(contents)?);

        if read_options.fill_cache {
            let charge = block.size();
            self.options
                .block_cache
                .insert(cache_key, Arc::clone(&block), charge);
        }

        Ok(block)
    }

    /// Locate and load the filter block named by the metaindex, if any.
    fn read_filter_block(&mut self, metaindex_handle: &BlockHandle, verify_checksums: bool) {
        let user_policy = match self.options.filter_policy.as_ref() {
            Some(policy) => Arc::clone(policy),
            None => return,
        };

        let metaindex_contents =
            match read_block_contents(self.file.as_ref(), metaindex_handle, verify_checksums) {
                Ok(contents) => contents,
                Err(error) => {
                    log::warn!(
                        "Could not read the metaindex block; continuing without a filter. \
                        Error: {error}"
                    );
                    return;
                }
            };
        let metaindex_block = match Block::new(metaindex_contents) {
            Ok(block) => Arc::new(block),
            Err(error) => {
                log::warn!(
                    "Could not parse the metaindex block; continuing without a filter. \
                    Error: {error}"
                );
                return;
            }
        };

        // Metaindex keys are plain strings, compared bytewise.
        let mut metaindex_iter = metaindex_block.iter(Arc::new(BytewiseComparator));
        let meta_key = format!("{FILTER_META_KEY_PREFIX}{}", user_policy.name());
        metaindex_iter.seek(meta_key.as_bytes());
        if !metaindex_iter.valid() || metaindex_iter.key() != meta_key.as_bytes() {
            // The file was written without this filter policy.
            return;
        }

        let filter_result = BlockHandle::decode(metaindex_iter.value())
            .and_then(|(handle, _)| {
                read_block_contents(self.file.as_ref(), &handle, verify_checksums)
            })
            .and_then(|contents| {
                FilterBlockReader::new(
                    Arc::new(InternalFilterPolicy::new(user_policy)),
                    contents,
                )
            });
        match filter_result {
            Ok(filter) => self.filter = Some(filter),
            Err(error) => {
                log::warn!(
                    "Could not load the filter block; continuing without a filter. \
                    Error: {error}"
                );
            }
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("cache_id", &self.cache_id)
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

/**
Read, verify, and decompress one block given its handle.

The 5-byte trailer (compression type plus masked CRC32C over the stored
bytes and the type) is validated when `verify_checksums` is set.
*/
pub(crate) fn read_block_contents(
    file: &dyn ReadonlyRandomAccessFile,
    handle: &BlockHandle,
    verify_checksums: bool,
) -> TableReadResult<Vec<u8>> {
    let total_length = handle.size() as usize + BLOCK_TRAILER_SIZE_BYTES;
    let mut buf = vec![0; total_length];
    let bytes_read = file.read_from(&mut buf, handle.offset())?;
    if bytes_read < total_length {
        return Err(ReadError::FailedToParse(format!(
            "Block read truncated: wanted {total_length} bytes at offset {} but got \
            {bytes_read}.",
            handle.offset()
        )));
    }

    let block_size = handle.size() as usize;
    let type_byte = buf[block_size];

    if verify_checksums {
        let stored = unmask_checksum(u32::decode_fixed(
            &buf[block_size + 1..block_size + 1 + SIZE_OF_U32_BYTES],
        ));
        let computed = {
            let mut digest = CRC_CALCULATOR.digest();
            digest.update(&buf[..block_size + 1]);
            digest.finalize()
        };
        if stored != computed {
            return Err(ReadError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }
    }

    buf.truncate(block_size);
    match CompressionType::try_from(type_byte) {
        Ok(CompressionType::None) => Ok(buf),
        Ok(CompressionType::Snappy) => snap::raw::Decoder::new()
            .decompress_vec(&buf)
            .map_err(|err| ReadError::Decompression(err.to_string())),
        Err(_) => Err(ReadError::FailedToParse(format!(
            "Unknown block compression type byte {type_byte}."
        ))),
    }
}

/**
A cursor over a whole table: an index-block cursor choosing data blocks and
a data-block cursor within the current one.
*/
pub(crate) struct TableIterator {
    table: Arc<Table>,
    read_options: ReadOptions,
    index_iter: BlockIterator,
    data_iter: Option<BlockIterator>,
    /// The encoded handle of the loaded data block, to skip reloads.
    current_data_handle: Vec<u8>,
    /// The first error encountered while loading data blocks.
    error: Option<StrataError>,
}

/// Private methods
impl TableIterator {
    /// Load (or reuse) the data block the index cursor points at.
    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            return;
        }

        let handle_bytes = self.index_iter.value().to_vec();
        if self.data_iter.is_some() && handle_bytes == self.current_data_handle {
            return;
        }

        match BlockHandle::decode(&handle_bytes)
            .map_err(StrataError::from)
            .and_then(|(handle, _)| self.table.block_reader(&self.read_options, &handle))
        {
            Ok(block) => {
                self.data_iter = Some(block.iter(self.table.comparator_handle()));
                self.current_data_handle = handle_bytes;
            }
            Err(error) => {
                if self.error.is_none() {
                    self.error = Some(error);
                }
                self.data_iter = None;
                self.current_data_handle.clear();
            }
        }
    }

    /// Move forward over data blocks until a valid position or the end.
    fn skip_empty_data_blocks_forward(&mut self) {
        while self
            .data_iter
            .as_ref()
            .map_or(true, |data_iter| !data_iter.valid())
        {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(data_iter) = self.data_iter.as_mut() {
                data_iter.seek_to_first();
            }
        }
    }

    /// Move backward over data blocks until a valid position or the front.
    fn skip_empty_data_blocks_backward(&mut self) {
        while self
            .data_iter
            .as_ref()
            .map_or(true, |data_iter| !data_iter.valid())
        {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(data_iter) = self.data_iter.as_mut() {
                data_iter.seek_to_last();
            }
        }
    }
}

impl StorageIterator for TableIterator {
    fn valid(&self) -> bool {
        self.data_iter
            .as_ref()
            .map_or(false, |data_iter| data_iter.valid())
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(data_iter) = self.data_iter.as_mut() {
            data_iter.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(data_iter) = self.data_iter.as_mut() {
            data_iter.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(data_iter) = self.data_iter.as_mut() {
            data_iter.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().unwrap().next();
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().unwrap().prev();
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().unwrap().value()
    }

    fn status(&self) -> StrataResult<()> {
        if let Some(error) = self.error.as_ref() {
            return Err(error.clone());
        }
        self.index_iter.status()?;
        if let Some(data_iter) = self.data_iter.as_ref() {
            data_iter.status()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::filter_policy::BloomFilterPolicy;
    use crate::fs::{FileSystem, InMemoryFileSystem};
    use crate::key::{InternalKey, Operation};
    use crate::options::DbOptions;
    use crate::tables::TableBuilder;

    use super::*;

    fn build_table(
        options: &DbOptions,
        entries: &[(InternalKey, Vec<u8>)],
    ) -> (Arc<Table>, u64) {
        let path = std::path::PathBuf::from("/tables/000007.ldb");
        let file = options
            .filesystem_provider
            .create_file(&path, false)
            .unwrap();

        let mut builder = TableBuilder::new(options.clone(), file);
        for (key, value) in entries {
            builder.add(key.as_bytes(), value).unwrap();
        }
        builder.finish().unwrap();
        let file_size = builder.file_size();

        let readable = options.filesystem_provider.open_file(&path).unwrap();
        let table = Table::open(options.clone(), readable, file_size).unwrap();
        (Arc::new(table), file_size)
    }

    fn sorted_entries(count: usize) -> Vec<(InternalKey, Vec<u8>)> {
        (0..count)
            .map(|idx| {
                let user_key = format!("key{idx:06}").into_bytes();
                let key = InternalKey::new(&user_key, idx as u64 + 1, Operation::Put);
                (key, format!("value{idx}").into_bytes())
            })
            .collect()
    }

    fn test_options(filter: bool, compression: CompressionType) -> DbOptions {
        DbOptions {
            compression,
            filter_policy: filter.then(|| {
                Arc::new(BloomFilterPolicy::new(10)) as Arc<dyn crate::filter_policy::FilterPolicy>
            }),
            ..DbOptions::with_filesystem(Arc::new(InMemoryFileSystem::new()))
        }
    }

    fn check_table(options: DbOptions) {
        let entries = sorted_entries(5_000);
        let (table, file_size) = build_table(&options, &entries);

        // Every entry is retrievable through `get`.
        for (key, value) in entries.iter().step_by(17) {
            let found = table
                .get(&ReadOptions::default(), key.as_bytes())
                .unwrap()
                .expect("Key must be present in the table.");
            assert_eq!(&found.0, key.as_bytes());
            assert_eq!(&found.1, value);
        }

        // A missing user key seeks to a neighbor with a different user key.
        let missing = InternalKey::new(b"key00123x", u64::MAX >> 8, Operation::Put);
        let neighbor = table
            .get(&ReadOptions::default(), missing.as_bytes())
            .unwrap();
        if let Some((found_key, _)) = neighbor {
            let decoded = InternalKey::decode(found_key).unwrap();
            assert_ne!(decoded.user_key(), missing.user_key());
        }

        // Full scans see every entry in order.
        let mut iter = table.iter(ReadOptions::default());
        iter.seek_to_first();
        let mut scanned = 0;
        for (key, value) in entries.iter() {
            assert!(iter.valid());
            assert_eq!(iter.key(), key.as_bytes());
            assert_eq!(iter.value(), value.as_slice());
            scanned += 1;
            iter.next();
        }
        assert!(!iter.valid());
        assert_eq!(scanned, entries.len());

        // Reverse scan from the end.
        iter.seek_to_last();
        for (key, _) in entries.iter().rev() {
            assert!(iter.valid());
            assert_eq!(iter.key(), key.as_bytes());
            iter.prev();
        }
        assert!(!iter.valid());

        // Approximate offsets are monotone and bounded by the file size.
        let first_offset = table.approximate_offset_of(entries[0].0.as_bytes());
        let mid_offset = table.approximate_offset_of(entries[2_500].0.as_bytes());
        let past_end = table.approximate_offset_of(
            InternalKey::new(b"zzzzzz", 1, Operation::Put).as_bytes(),
        );
        assert!(first_offset <= mid_offset);
        assert!(mid_offset < past_end);
        assert!(past_end <= file_size);
    }

    #[test]
    fn tables_round_trip_without_compression() {
        check_table(test_options(false, CompressionType::None));
    }

    #[test]
    fn tables_round_trip_with_snappy_compression() {
        check_table(test_options(false, CompressionType::Snappy));
    }

    #[test]
    fn tables_round_trip_with_a_filter_policy() {
        check_table(test_options(true, CompressionType::Snappy));
    }

    #[test]
    fn corrupted_blocks_are_reported_when_verification_is_on() {
        let options = test_options(false, CompressionType::None);
        let entries = sorted_entries(100);
        let (_, file_size) = build_table(&options, &entries);

        // Flip one byte early in the file (inside the first data block).
        let path = std::path::PathBuf::from("/tables/000007.ldb");
        let readable = options.filesystem_provider.open_file(&path).unwrap();
        let mut raw = vec![0; file_size as usize];
        readable.read_from(&mut raw, 0).unwrap();
        raw[10] ^= 0x01;
        let mut rewrite = options
            .filesystem_provider
            .create_file(&path, false)
            .unwrap();
        rewrite.append(&raw).unwrap();
        drop(rewrite);

        let reopened = options.filesystem_provider.open_file(&path).unwrap();
        let table = Arc::new(Table::open(options, reopened, file_size).unwrap());

        let verify = ReadOptions {
            verify_checksums: true,
            ..ReadOptions::default()
        };
        let result = table.get(&verify, entries[0].0.as_bytes());
        assert!(
            result.is_err(),
            "A checksum failure must surface as an error for the read."
        );
    }

    #[test]
    fn short_files_are_not_tables() {
        let options = test_options(false, CompressionType::None);
        let path = std::path::PathBuf::from("/tables/small.ldb");
        let mut file = options
            .filesystem_provider
            .create_file(&path, false)
            .unwrap();
        file.append(b"tiny").unwrap();
        drop(file);

        let readable = options.filesystem_provider.open_file(&path).unwrap();
        assert!(Table::open(options, readable, 4).is_err());
    }
}
