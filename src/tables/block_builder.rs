/*!
Builds table file blocks with prefix-compressed keys.

When a key is stored, the prefix it shares with the previous key is dropped
and only the byte count of that prefix is recorded. Every
`restart_interval`-th key is stored whole and begins a *restart point*; the
block's tail lists the offsets of all restart points so readers can binary
search them. Each entry is serialized as:

```text
shared_len: varint32 || non_shared_len: varint32 || value_len: varint32
key_delta: non_shared_len bytes || value: value_len bytes
```

followed, after the final entry, by the restart offsets as fixed32 values
and a fixed32 count of them.
*/

use integer_encoding::{FixedInt, VarInt};

use crate::config::SIZE_OF_U32_BYTES;

/// Builds the serialized form of a single block.
pub(crate) struct BlockBuilder {
    /// The number of keys between restart points.
    restart_interval: usize,

    /// The serialized entries so far.
    buffer: Vec<u8>,

    /// The offsets of the restart points within the block.
    restart_points: Vec<u32>,

    /// The number of entries emitted since the last restart point.
    entries_since_restart: usize,

    /// The last key that was added, reconstructed in full.
    last_key: Vec<u8>,

    /// True once [`BlockBuilder::finish`] has been called.
    finished: bool,
}

/// Crate-only methods
impl BlockBuilder {
    /**
    Create a new instance of [`BlockBuilder`].

    # Panics

    A `restart_interval` of zero is a programming error.
    */
    pub(crate) fn new(restart_interval: usize) -> Self {
        assert!(
            restart_interval >= 1,
            "The restart interval must be at least one."
        );

        Self {
            restart_interval,
            buffer: vec![],
            // The first key is always stored whole.
            restart_points: vec![0],
            entries_since_restart: 0,
            last_key: vec![],
            finished: false,
        }
    }

    /**
    Add a key-value pair to the block.

    # Panics

    Keys must arrive in strictly increasing order, and the builder must not
    have been finished. Violations are bugs in the caller.
    */
    pub(crate) fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(!self.finished, "Attempted to add to a finished block.");
        assert!(
            self.buffer.is_empty() || self.last_key.as_slice() < key,
            "Keys must be added to a block in strictly increasing order."
        );
        debug_assert!(self.entries_since_restart <= self.restart_interval);

        let mut shared = 0;
        if self.entries_since_restart < self.restart_interval {
            // Count how much prefix the new key shares with the previous one.
            let max_shared = std::cmp::min(self.last_key.len(), key.len());
            while shared < max_shared && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            // Restart compression with this key stored whole.
            self.restart_points.push(self.buffer.len() as u32);
            self.entries_since_restart = 0;
        }

        let non_shared = key.len() - shared;
        self.buffer.extend(u32::encode_var_vec(shared as u32));
        self.buffer.extend(u32::encode_var_vec(non_shared as u32));
        self.buffer.extend(u32::encode_var_vec(value.len() as u32));
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        // Rebuild the full key rather than copying the input; the two must
        // agree, which doubles as a check that compression inverts cleanly.
        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(&key[shared..]);
        debug_assert!(self.last_key.as_slice() == key);

        self.entries_since_restart += 1;
    }

    /// Append the restart point array and return the completed block.
    pub(crate) fn finish(&mut self) -> Vec<u8> {
        for restart_point in self.restart_points.iter() {
            self.buffer.extend(u32::encode_fixed_vec(*restart_point));
        }
        self.buffer
            .extend(u32::encode_fixed_vec(self.restart_points.len() as u32));
        self.finished = true;

        std::mem::take(&mut self.buffer)
    }

    /// Reset to the state of a freshly constructed builder.
    pub(crate) fn reset(&mut self) {
        self.buffer.clear();
        self.restart_points.clear();
        self.restart_points.push(0);
        self.entries_since_restart = 0;
        self.last_key.clear();
        self.finished = false;
    }

    /// The size the block would serialize to if finished now.
    pub(crate) fn current_size_estimate(&self) -> usize {
        self.buffer.len()
            + self.restart_points.len() * SIZE_OF_U32_BYTES
            + SIZE_OF_U32_BYTES
    }

    /// True if no entries have been added since construction or reset.
    pub(crate) fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The most recently added key.
    pub(crate) fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn an_empty_block_serializes_to_just_the_restart_array() {
        let mut builder = BlockBuilder::new(16);
        assert!(builder.is_empty());

        let block = builder.finish();
        // One restart point (offset zero) plus the count.
        assert_eq!(block.len(), 2 * SIZE_OF_U32_BYTES);
    }

    #[test]
    fn shared_prefixes_are_dropped_from_the_serialized_form() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"prefix_aaa", b"1");
        let size_after_first = builder.current_size_estimate();
        builder.add(b"prefix_bbb", b"2");

        // The second entry stores only the three differing bytes plus the
        // three varint headers and the value.
        let second_entry_size = builder.current_size_estimate() - size_after_first;
        assert_eq!(second_entry_size, 3 + 3 + 1);
    }

    #[test]
    fn restart_points_are_emitted_at_the_configured_interval() {
        let mut builder = BlockBuilder::new(2);
        builder.add(b"aaa1", b"v");
        builder.add(b"aaa2", b"v");
        builder.add(b"aaa3", b"v"); // restart: stored whole
        builder.add(b"aaa4", b"v");

        let block = builder.finish();
        let count_offset = block.len() - SIZE_OF_U32_BYTES;
        let num_restarts = u32::decode_fixed(&block[count_offset..]);
        assert_eq!(num_restarts, 2);
    }

    #[test]
    #[should_panic(expected = "strictly increasing")]
    fn out_of_order_keys_panic() {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"banana", b"v");
        builder.add(b"apple", b"v");
    }
}
