/*!
Builds a table file.

The layout, in file order: data blocks holding the entries; the filter
meta-block (when a filter policy is configured); the metaindex block mapping
`"filter.<policy name>"` to the filter block's handle; the index block whose
keys are short separators between adjacent data blocks and whose values are
the data blocks' handles; and the fixed-size footer.

Every block is followed on disk by a 5-byte trailer: a compression type
byte and the masked CRC32C of the block contents plus that byte.
*/

use std::cmp::Ordering;
use std::sync::Arc;

use integer_encoding::FixedInt;

use crate::comparator::Comparator;
use crate::config::CompressionType;
use crate::filter_policy::InternalFilterPolicy;
use crate::fs::AppendableFile;
use crate::key::InternalKeyComparator;
use crate::options::DbOptions;
use crate::utils::crc::{mask_checksum, CRC_CALCULATOR};

use super::block_builder::BlockBuilder;
use super::block_handle::BlockHandle;
use super::errors::BuilderError;
use super::filter_block_builder::FilterBlockBuilder;
use super::footer::Footer;

/// Alias for a [`Result`] wrapping a [`BuilderError`].
pub(crate) type TableBuildResult<T> = Result<T, BuilderError>;

/// The compression type byte plus the masked checksum.
pub(crate) const BLOCK_TRAILER_SIZE_BYTES: usize = 1 + 4;

/// The metaindex key prefix under which a filter block is registered.
pub(crate) const FILTER_META_KEY_PREFIX: &str = "filter.";

/// Streams sorted key-value pairs into the table file layout.
pub(crate) struct TableBuilder {
    /// Options for configuring the operation of the database.
    options: DbOptions,

    /// Orders the internal keys being added.
    comparator: InternalKeyComparator,

    /// The physical table file being written.
    file: Box<dyn AppendableFile>,

    /// The file offset at which the next block will land.
    offset: u64,

    /// The number of entries added so far.
    num_entries: usize,

    /// Set once the table is finished or abandoned.
    closed: bool,

    /// Builder for the data block currently being filled.
    data_block: BlockBuilder,

    /// Builder for the index block, filled as data blocks are emitted.
    index_block: BlockBuilder,

    /// The last key added, used for ordering checks and separators.
    last_key: Vec<u8>,

    /**
    Whether an index entry for the just-emitted data block is still owed.

    The entry is written only once the *next* key arrives, which lets the
    separator be shortened against that key instead of repeating the full
    last key of the block.
    */
    pending_index_entry: bool,

    /// The handle of the just-emitted data block.
    pending_handle: BlockHandle,

    /// Builds the filter meta-block, when a policy is configured.
    filter_block: Option<FilterBlockBuilder>,
}

/// Crate-only methods
impl TableBuilder {
    /// Create a builder writing to `file`.
    pub(crate) fn new(options: DbOptions, file: Box<dyn AppendableFile>) -> Self {
        let comparator = InternalKeyComparator::new(Arc::clone(&options.comparator));
        let filter_block = options.filter_policy.as_ref().map(|user_policy| {
            FilterBlockBuilder::new(Arc::new(InternalFilterPolicy::new(Arc::clone(user_policy))))
        });
        let block_restart_interval = options.block_restart_interval;

        Self {
            options,
            comparator,
            file,
            offset: 0,
            num_entries: 0,
            closed: false,
            data_block: BlockBuilder::new(block_restart_interval),
            // Index entries are never prefix-compressed; each must be
            // decodable in isolation during the binary search.
            index_block: BlockBuilder::new(1),
            last_key: vec![],
            pending_index_entry: false,
            pending_handle: BlockHandle::new(0, 0),
            filter_block,
        }
    }

    /**
    Add an entry to the table.

    # Panics

    Internal keys must arrive in strictly increasing order and the builder
    must still be open; violations are caller bugs.
    */
    pub(crate) fn add(&mut self, key: &[u8], value: &[u8]) -> TableBuildResult<()> {
        assert!(!self.closed, "{}", BuilderError::AlreadyClosed);
        assert!(
            self.num_entries == 0
                || self.comparator.compare(&self.last_key, key) == Ordering::Less,
            "{}",
            BuilderError::OutOfOrder
        );

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            let separator = self.comparator.find_shortest_separator(&self.last_key, key);
            self.index_block.add(&separator, &self.pending_handle.encode());
            self.pending_index_entry = false;
        }

        if let Some(filter_block) = self.filter_block.as_mut() {
            filter_block.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush_data_block()?;
        }

        Ok(())
    }

    /**
    Finish building the table.

    Emits the trailing data block, the filter and metaindex blocks, the
    index block, and the footer.
    */
    pub(crate) fn finish(&mut self) -> TableBuildResult<()> {
        assert!(!self.closed, "{}", BuilderError::AlreadyClosed);
        self.flush_data_block()?;
        self.closed = true;

        // Filter block, stored uncompressed.
        let mut filter_handle = None;
        if let Some(mut filter_block) = self.filter_block.take() {
            let contents = filter_block.finish();
            filter_handle = Some(self.write_raw_block(&contents, CompressionType::None)?);
        }

        // Metaindex block.
        let mut metaindex_block = BlockBuilder::new(self.options.block_restart_interval);
        if let Some(handle) = filter_handle {
            let policy_name = self
                .options
                .filter_policy
                .as_ref()
                .map(|policy| policy.name())
                .unwrap_or_default();
            let meta_key = format!("{FILTER_META_KEY_PREFIX}{policy_name}");
            metaindex_block.add(meta_key.as_bytes(), &handle.encode());
        }
        let metaindex_contents = metaindex_block.finish();
        let metaindex_handle = self.write_block(&metaindex_contents)?;

        // Index block, completing the entry for the final data block with a
        // short successor of the last key.
        if self.pending_index_entry {
            let successor = self.comparator.find_short_successor(&self.last_key);
            self.index_block.add(&successor, &self.pending_handle.encode());
            self.pending_index_entry = false;
        }
        let index_contents = self.index_block.finish();
        let index_handle = self.write_block(&index_contents)?;

        // Footer.
        let footer = Footer::new(metaindex_handle, index_handle);
        self.file.append(&footer.encode())?;
        self.offset += super::footer::SIZE_OF_FOOTER_BYTES as u64;
        self.file.flush()?;

        log::debug!(
            "Finished a table of {num_entries} entries spanning {offset} bytes.",
            num_entries = self.num_entries,
            offset = self.offset
        );
        Ok(())
    }

    /**
    Abandon the table.

    A builder that is not finished must be abandoned before being dropped;
    the caller is responsible for deleting the partial file.
    */
    pub(crate) fn abandon(&mut self) {
        assert!(!self.closed, "{}", BuilderError::AlreadyClosed);
        self.closed = true;
    }

    /// Force the bytes written so far to durable storage.
    pub(crate) fn sync(&mut self) -> TableBuildResult<()> {
        self.file.sync()?;
        Ok(())
    }

    /// The number of entries added.
    pub(crate) fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// The current size of the table file.
    pub(crate) fn file_size(&self) -> u64 {
        self.offset
    }
}

/// Private methods
impl TableBuilder {
    /// Emit the current data block and queue its index entry.
    fn flush_data_block(&mut self) -> TableBuildResult<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        let contents = self.data_block.finish();
        self.pending_handle = self.write_block(&contents)?;
        self.data_block.reset();
        self.pending_index_entry = true;
        self.file.flush()?;

        if let Some(filter_block) = self.filter_block.as_mut() {
            filter_block.start_block(self.offset);
        }

        Ok(())
    }

    /// Compress a finished block per the configured codec and write it.
    fn write_block(&mut self, contents: &[u8]) -> TableBuildResult<BlockHandle> {
        match self.options.compression {
            CompressionType::Snappy => {
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(contents)
                    .unwrap_or_default();

                // Store compressed only when it saves at least 12.5%;
                // incompressible data goes straight through.
                if !compressed.is_empty()
                    && compressed.len() < contents.len() - (contents.len() / 8)
                {
                    self.write_raw_block(&compressed, CompressionType::Snappy)
                } else {
                    self.write_raw_block(contents, CompressionType::None)
                }
            }
            CompressionType::None => self.write_raw_block(contents, CompressionType::None),
        }
    }

    /// Write a block and its type/checksum trailer.
    fn write_raw_block(
        &mut self,
        contents: &[u8],
        compression_type: CompressionType,
    ) -> TableBuildResult<BlockHandle> {
        let handle = BlockHandle::new(self.offset, contents.len() as u64);
        self.file.append(contents)?;

        let mut digest = CRC_CALCULATOR.digest();
        digest.update(contents);
        digest.update(&[compression_type as u8]);
        let checksum = mask_checksum(digest.finalize());

        let mut trailer = Vec::with_capacity(BLOCK_TRAILER_SIZE_BYTES);
        trailer.push(compression_type as u8);
        trailer.extend(u32::encode_fixed_vec(checksum));
        self.file.append(&trailer)?;

        self.offset += (contents.len() + BLOCK_TRAILER_SIZE_BYTES) as u64;
        Ok(handle)
    }
}
