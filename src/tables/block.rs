/*!
Reader and iterator for table file blocks.

A block's serialized form is produced by
[`BlockBuilder`](super::block_builder::BlockBuilder). The reader keeps the
raw bytes and decodes entries on demand: a seek binary-searches the restart
point array comparing the full keys stored there, then decodes forward
within the chosen restart segment. This keeps the resident cost of a cached
block at its byte size, no matter how it is iterated.
*/

use std::cmp::Ordering;
use std::sync::Arc;

use integer_encoding::{FixedInt, VarInt};

use crate::comparator::Comparator;
use crate::config::SIZE_OF_U32_BYTES;
use crate::errors::{StrataError, StrataResult};
use crate::iterator::StorageIterator;

use super::errors::{ReadError, TableReadResult};

/// The parsed, still-serialized contents of one block.
#[derive(Debug)]
pub struct Block {
    /// The raw block: entries followed by the restart array and its count.
    data: Vec<u8>,

    /// Offset of the restart point array within `data`.
    restart_offset: usize,

    /// The number of restart points.
    num_restarts: u32,
}

/// Crate-only methods
impl Block {
    /// Adopt the raw bytes of a block, validating the restart array bounds.
    pub(crate) fn new(data: Vec<u8>) -> TableReadResult<Self> {
        if data.len() < SIZE_OF_U32_BYTES {
            return Err(ReadError::FailedToParse(
                "Block is too small to hold a restart count.".to_string(),
            ));
        }

        let num_restarts = u32::decode_fixed(&data[data.len() - SIZE_OF_U32_BYTES..]);
        let max_restarts = (data.len() - SIZE_OF_U32_BYTES) / SIZE_OF_U32_BYTES;
        if (num_restarts as usize) > max_restarts {
            return Err(ReadError::FailedToParse(format!(
                "Block declares {num_restarts} restart points but has room for at most \
                {max_restarts}."
            )));
        }

        let restart_offset =
            data.len() - (1 + num_restarts as usize) * SIZE_OF_U32_BYTES;

        Ok(Self {
            data,
            restart_offset,
            num_restarts,
        })
    }

    /// The byte size of the block (its block cache charge).
    pub(crate) fn size(&self) -> usize {
        self.data.len()
    }

    /// Iterate the block's entries under the given key order.
    pub(crate) fn iter(self: &Arc<Self>, comparator: Arc<dyn Comparator>) -> BlockIterator {
        BlockIterator {
            block: Arc::clone(self),
            comparator,
            current: self.restart_offset,
            restart_index: 0,
            key: vec![],
            value_start: 0,
            value_length: 0,
            corruption: None,
        }
    }

    /// The data offset of the `index`-th restart point.
    fn restart_point(&self, index: usize) -> usize {
        debug_assert!(index < self.num_restarts as usize);
        let offset = self.restart_offset + index * SIZE_OF_U32_BYTES;
        u32::decode_fixed(&self.data[offset..offset + SIZE_OF_U32_BYTES]) as usize
    }
}

/**
Decode one entry header at `offset`.

Returns `(shared, non_shared, value_length, header_width)` or `None` when
the entry would run outside the block's entry region.
*/
fn decode_entry_header(
    data: &[u8],
    restart_offset: usize,
    offset: usize,
) -> Option<(usize, usize, usize, usize)> {
    let region = &data[..restart_offset];
    if offset >= region.len() {
        return None;
    }

    let mut cursor = offset;
    let (shared, width) = u32::decode_var(&region[cursor..])?;
    cursor += width;
    let (non_shared, width) = u32::decode_var(&region[cursor..])?;
    cursor += width;
    let (value_length, width) = u32::decode_var(&region[cursor..])?;
    cursor += width;

    let entry_end = cursor + non_shared as usize + value_length as usize;
    if entry_end > region.len() {
        return None;
    }

    Some((
        shared as usize,
        non_shared as usize,
        value_length as usize,
        cursor - offset,
    ))
}

/// A cursor over a block's entries.
pub(crate) struct BlockIterator {
    block: Arc<Block>,
    comparator: Arc<dyn Comparator>,

    /**
    Offset of the current entry within the block data.

    `restart_offset` doubles as the "not positioned" sentinel since no
    entry can start there.
    */
    current: usize,

    /// Index of the restart segment containing the cursor.
    restart_index: usize,

    /// The current entry's full key, reconstructed from the deltas.
    key: Vec<u8>,

    /// Start offset of the current entry's value within the block data.
    value_start: usize,

    /// Length of the current entry's value.
    value_length: usize,

    /// Set when malformed data is encountered; the cursor stays invalid.
    corruption: Option<ReadError>,
}

/// Private methods
impl BlockIterator {
    /// Offset just past the current entry.
    fn next_entry_offset(&self) -> usize {
        self.value_start + self.value_length
    }

    fn seek_to_restart_point(&mut self, restart_index: usize) {
        self.restart_index = restart_index;
        self.key.clear();
        // parse_next_entry picks up from the restart offset.
        let offset = self.block.restart_point(restart_index);
        self.value_start = offset;
        self.value_length = 0;
    }

    /// Decode the entry at `next_entry_offset`, making it current.
    fn parse_next_entry(&mut self) -> bool {
        let offset = self.next_entry_offset();
        if offset >= self.block.restart_offset {
            // Walked off the end of the entry region.
            self.current = self.block.restart_offset;
            self.restart_index = self.block.num_restarts as usize;
            return false;
        }

        match decode_entry_header(&self.block.data, self.block.restart_offset, offset) {
            Some((shared, non_shared, value_length, header_width)) if shared <= self.key.len() => {
                let delta_start = offset + header_width;
                self.current = offset;
                self.key.truncate(shared);
                self.key
                    .extend_from_slice(&self.block.data[delta_start..delta_start + non_shared]);
                self.value_start = delta_start + non_shared;
                self.value_length = value_length;

                // Keep the restart index in step with the cursor.
                while self.restart_index + 1 < self.block.num_restarts as usize
                    && self.block.restart_point(self.restart_index + 1) < self.current
                {
                    self.restart_index += 1;
                }

                true
            }
            _ => {
                self.mark_corrupted();
                false
            }
        }
    }

    fn mark_corrupted(&mut self) {
        self.current = self.block.restart_offset;
        self.restart_index = self.block.num_restarts as usize;
        self.key.clear();
        self.corruption = Some(ReadError::FailedToParse(
            "Bad entry encountered while iterating a block.".to_string(),
        ));
    }
}

impl StorageIterator for BlockIterator {
    fn valid(&self) -> bool {
        self.corruption.is_none()
            && self.block.num_restarts > 0
            && self.current < self.block.restart_offset
    }

    fn seek_to_first(&mut self) {
        if self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek_to_last(&mut self) {
        if self.block.num_restarts == 0 {
            return;
        }
        self.seek_to_restart_point(self.block.num_restarts as usize - 1);
        // Walk forward to the final entry of the final segment.
        while self.parse_next_entry() && self.next_entry_offset() < self.block.restart_offset {}
    }

    fn seek(&mut self, target: &[u8]) {
        if self.block.num_restarts == 0 {
            return;
        }

        // Binary search the restart array for the last restart point whose
        // (fully stored) key is less than the target.
        let mut left = 0usize;
        let mut right = self.block.num_restarts as usize - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let region_offset = self.block.restart_point(mid);
            match decode_entry_header(&self.block.data, self.block.restart_offset, region_offset)
            {
                Some((0, non_shared, _, header_width)) => {
                    let key_start = region_offset + header_width;
                    let restart_key = &self.block.data[key_start..key_start + non_shared];
                    if self.comparator.compare(restart_key, target) == Ordering::Less {
                        left = mid;
                    } else {
                        right = mid - 1;
                    }
                }
                _ => {
                    // A restart point with a shared prefix is malformed.
                    self.mark_corrupted();
                    return;
                }
            }
        }

        // Scan forward within the segment for the first key >= target.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_entry() {
                return;
            }
            if self.comparator.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_entry();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let original = self.current;

        // Find the restart segment that starts strictly before the current
        // entry.
        while self.block.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                // The cursor was at the first entry; there is no previous.
                self.current = self.block.restart_offset;
                self.restart_index = self.block.num_restarts as usize;
                return;
            }
            self.restart_index -= 1;
        }

        // Scan forward until the entry just before the original position.
        self.seek_to_restart_point(self.restart_index);
        while self.parse_next_entry() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.block.data[self.value_start..self.value_start + self.value_length]
    }

    fn status(&self) -> StrataResult<()> {
        match &self.corruption {
            Some(err) => Err(StrataError::from(err.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::comparator::BytewiseComparator;
    use crate::tables::block_builder::BlockBuilder;

    use super::*;

    fn build_block(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, value) in entries {
            builder.add(key, value);
        }
        Arc::new(Block::new(builder.finish()).unwrap())
    }

    fn sample_entries(count: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..count)
            .map(|idx| {
                let key = format!("key{:05}", idx).into_bytes();
                let value = format!("value{idx}").into_bytes();
                (key, value)
            })
            .collect()
    }

    fn iter_of(block: &Arc<Block>) -> BlockIterator {
        block.iter(Arc::new(BytewiseComparator))
    }

    #[test]
    fn a_block_round_trips_its_entries_in_order() {
        let entries = sample_entries(1000);
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let block = build_block(&borrowed, 16);

        let mut iter = iter_of(&block);
        iter.seek_to_first();
        for (expected_key, expected_value) in entries.iter() {
            assert!(iter.valid());
            assert_eq!(iter.key(), expected_key.as_slice());
            assert_eq!(iter.value(), expected_value.as_slice());
            iter.next();
        }
        assert!(!iter.valid(), "The cursor must invalidate past the end.");
        iter.status().unwrap();
    }

    #[test]
    fn seeks_find_exact_keys_and_successors() {
        let entries = sample_entries(500);
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let block = build_block(&borrowed, 16);
        let mut iter = iter_of(&block);

        // Exact hit.
        iter.seek(b"key00123");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key00123");
        assert_eq!(iter.value(), b"value123");

        // Between two keys: lands on the successor.
        iter.seek(b"key00123x");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key00124");

        // Before the first key.
        iter.seek(b"aaa");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key00000");

        // Past the last key.
        iter.seek(b"zzz");
        assert!(!iter.valid());
    }

    #[test]
    fn reverse_iteration_crosses_restart_segments() {
        let entries = sample_entries(100);
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        // A small interval forces many segments.
        let block = build_block(&borrowed, 4);

        let mut iter = iter_of(&block);
        iter.seek_to_last();
        for (expected_key, _) in entries.iter().rev() {
            assert!(iter.valid());
            assert_eq!(iter.key(), expected_key.as_slice());
            iter.prev();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn a_restart_interval_of_one_disables_prefix_compression() {
        let entries = sample_entries(50);
        let borrowed: Vec<(&[u8], &[u8])> = entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let block = build_block(&borrowed, 1);

        let mut iter = iter_of(&block);
        iter.seek(b"key00031");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key00031");

        iter.prev();
        assert_eq!(iter.key(), b"key00030");
    }

    #[test]
    fn a_block_with_zero_restart_points_is_never_valid() {
        // Hand-craft a block whose restart count is zero.
        let data = u32::encode_fixed_vec(0);
        let block = Arc::new(Block::new(data).unwrap());

        let mut iter = iter_of(&block);
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        iter.seek(b"anything");
        assert!(!iter.valid());
    }

    #[test]
    fn oversized_restart_counts_are_rejected() {
        let data = u32::encode_fixed_vec(9_999);
        assert!(Block::new(data).is_err());
        assert!(Block::new(vec![1, 2]).is_err());
    }

    #[test]
    fn an_empty_block_yields_no_entries() {
        let block = Arc::new(Block::new(BlockBuilder::new(16).finish()).unwrap());
        let mut iter = iter_of(&block);
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek(b"x");
        assert!(!iter.valid());
    }
}
