/*!
Reads the filter meta-block of a table file.

See [`FilterBlockBuilder`](super::filter_block_builder::FilterBlockBuilder)
for the serialized layout. The reader errs on the side of a disk seek:
malformed offsets and out-of-range partition indexes report "may match"
rather than wrongly skipping a block.
*/

use std::sync::Arc;

use integer_encoding::FixedInt;

use crate::config::SIZE_OF_U32_BYTES;
use crate::filter_policy::FilterPolicy;

use super::errors::{ReadError, TableReadResult};

/// Answers membership queries against a table's partitioned filters.
pub(crate) struct FilterBlockReader {
    /// The policy the filters were generated with.
    filter_policy: Arc<dyn FilterPolicy>,

    /// The raw filter meta-block.
    data: Vec<u8>,

    /// Offset of the filter offset array within `data`.
    offset_array_start: usize,

    /// The number of filter partitions.
    num_filters: usize,

    /// log2 of the data-offset range covered by one filter.
    base_lg: u8,
}

/// Crate-only methods
impl FilterBlockReader {
    /// Parse the frame of a filter meta-block.
    pub(crate) fn new(
        filter_policy: Arc<dyn FilterPolicy>,
        data: Vec<u8>,
    ) -> TableReadResult<Self> {
        // The trailer is the fixed32 offset array start plus the base byte.
        if data.len() < SIZE_OF_U32_BYTES + 1 {
            return Err(ReadError::FailedToParse(
                "Filter meta-block is too small to hold its trailer.".to_string(),
            ));
        }

        let base_lg = data[data.len() - 1];
        let offset_array_start =
            u32::decode_fixed(&data[data.len() - 1 - SIZE_OF_U32_BYTES..data.len() - 1]) as usize;
        if offset_array_start > data.len() - 1 - SIZE_OF_U32_BYTES {
            return Err(ReadError::FailedToParse(
                "Filter offset array starts outside the meta-block.".to_string(),
            ));
        }

        let num_filters =
            (data.len() - 1 - SIZE_OF_U32_BYTES - offset_array_start) / SIZE_OF_U32_BYTES;

        Ok(Self {
            filter_policy,
            data,
            offset_array_start,
            num_filters,
            base_lg,
        })
    }

    /**
    Whether `key` may be present in the data block starting at
    `block_offset` in the table file.
    */
    pub(crate) fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let filter_index = (block_offset >> self.base_lg) as usize;
        if filter_index >= self.num_filters {
            // Out of range: force the read rather than risk a false skip.
            log::warn!(
                "Block offset {block_offset} has no filter partition (there are \
                {num_filters}); treating as a match.",
                num_filters = self.num_filters
            );
            return true;
        }

        let offset_entry = self.offset_array_start + filter_index * SIZE_OF_U32_BYTES;
        let filter_start =
            u32::decode_fixed(&self.data[offset_entry..offset_entry + SIZE_OF_U32_BYTES]) as usize;
        // The word after the last offset is the offset array start itself,
        // which is exactly the limit of the final filter.
        let filter_limit = u32::decode_fixed(
            &self.data[offset_entry + SIZE_OF_U32_BYTES..offset_entry + 2 * SIZE_OF_U32_BYTES],
        ) as usize;

        if filter_start == filter_limit {
            // An empty filter matches nothing.
            return false;
        }
        if filter_start > filter_limit || filter_limit > self.offset_array_start {
            // Malformed offsets; force the read.
            log::warn!(
                "Filter partition {filter_index} has malformed offsets; treating as a match."
            );
            return true;
        }

        self.filter_policy
            .key_may_match(key, &self.data[filter_start..filter_limit])
    }
}
