/*!
Builds the filter meta-block of a table file.

Filter data is partitioned: one filter is generated per 2 KiB
([`FILTER_BASE_LG`]) of data-file offset space, so a reader can find the
filter responsible for a data block directly from the block's file offset.
The meta-block layout is every filter back to back, the fixed32 start
offset of each filter, the fixed32 offset where that offset array begins,
and a final byte holding [`FILTER_BASE_LG`].
*/

use std::sync::Arc;

use integer_encoding::FixedInt;

use crate::filter_policy::FilterPolicy;

/// log2 of the data-offset range covered by one filter.
pub(crate) const FILTER_BASE_LG: u8 = 11;

/// The data-offset range covered by one filter.
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Accumulates keys and emits the serialized filter meta-block.
pub(crate) struct FilterBlockBuilder {
    /// The policy that generates the individual filters.
    filter_policy: Arc<dyn FilterPolicy>,

    /// Keys added since the last filter was generated.
    pending_keys: Vec<Vec<u8>>,

    /// Start offset of each generated filter within `result`.
    filter_offsets: Vec<u32>,

    /// The concatenated filters generated so far.
    result: Vec<u8>,
}

/// Crate-only methods
impl FilterBlockBuilder {
    /// Create a new instance of [`FilterBlockBuilder`].
    pub(crate) fn new(filter_policy: Arc<dyn FilterPolicy>) -> Self {
        Self {
            filter_policy,
            pending_keys: vec![],
            filter_offsets: vec![],
            result: vec![],
        }
    }

    /**
    Note that the table is starting a data block at `block_offset`.

    Generates filters up to the partition containing that offset. Must be
    called with monotonically increasing offsets.
    */
    pub(crate) fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);

        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    /// Add a key that the current data block will contain.
    pub(crate) fn add_key(&mut self, key: &[u8]) {
        self.pending_keys.push(key.to_vec());
    }

    /// Emit the serialized filter meta-block.
    pub(crate) fn finish(&mut self) -> Vec<u8> {
        if !self.pending_keys.is_empty() {
            self.generate_filter();
        }

        let offset_array_start = self.result.len() as u32;
        for offset in self.filter_offsets.iter() {
            self.result.extend(u32::encode_fixed_vec(*offset));
        }
        self.result
            .extend(u32::encode_fixed_vec(offset_array_start));
        self.result.push(FILTER_BASE_LG);

        std::mem::take(&mut self.result)
    }
}

/// Private methods
impl FilterBlockBuilder {
    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.pending_keys.is_empty() {
            // An empty partition gets a zero-length filter.
            return;
        }

        let filter = self.filter_policy.create_filter(&self.pending_keys);
        self.result.extend(filter);
        self.pending_keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::filter_policy::BloomFilterPolicy;
    use crate::tables::filter_block::FilterBlockReader;

    use super::*;

    fn policy() -> Arc<dyn FilterPolicy> {
        Arc::new(BloomFilterPolicy::new(10))
    }

    #[test]
    fn an_empty_builder_produces_the_minimal_meta_block() {
        let mut builder = FilterBlockBuilder::new(policy());
        let block = builder.finish();

        // No filters, a zero offset-array start, and the base lg byte.
        assert_eq!(block.len(), 5);
        assert_eq!(block[4], FILTER_BASE_LG);

        let reader = FilterBlockReader::new(policy(), block).unwrap();
        assert!(
            reader.key_may_match(0, b"foo"),
            "An out-of-range partition index must be treated as a match."
        );
        assert!(reader.key_may_match(100_000, b"foo"));
    }

    #[test]
    fn a_single_partition_answers_membership() {
        let mut builder = FilterBlockBuilder::new(policy());
        builder.start_block(100);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        builder.add_key(b"box");
        builder.start_block(200);
        builder.add_key(b"box");
        builder.start_block(300);
        builder.add_key(b"hello");

        let reader = FilterBlockReader::new(policy(), builder.finish()).unwrap();
        assert!(reader.key_may_match(100, b"foo"));
        assert!(reader.key_may_match(100, b"bar"));
        assert!(reader.key_may_match(100, b"box"));
        assert!(reader.key_may_match(100, b"hello"));
        assert!(reader.key_may_match(100, b"foo"));
        assert!(!reader.key_may_match(100, b"missing"));
        assert!(!reader.key_may_match(100, b"other"));
    }

    #[test]
    fn partitions_are_independent() {
        let mut builder = FilterBlockBuilder::new(policy());

        // First partition: offsets [0, 2048).
        builder.start_block(0);
        builder.add_key(b"first");
        // Third partition: offsets [4096, 6144); the second is empty.
        builder.start_block(4100);
        builder.add_key(b"third");

        let reader = FilterBlockReader::new(policy(), builder.finish()).unwrap();

        assert!(reader.key_may_match(0, b"first"));
        assert!(!reader.key_may_match(0, b"third"));

        // The empty second partition matches nothing.
        assert!(!reader.key_may_match(2100, b"first"));
        assert!(!reader.key_may_match(2100, b"third"));

        assert!(reader.key_may_match(4100, b"third"));
        assert!(!reader.key_may_match(4100, b"first"));
    }
}
