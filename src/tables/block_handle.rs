//! Pointers to blocks within a table file.

use integer_encoding::VarInt;

use super::errors::{ReadError, TableReadResult};

/**
The maximum encoded size of a [`BlockHandle`]: two varint64 values of up to
ten bytes each.
*/
pub(crate) const BLOCK_HANDLE_MAX_ENCODED_LENGTH_BYTES: usize = 10 + 10;

/// The position and extent of a block within a table file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct BlockHandle {
    /// The file offset at which the block begins.
    offset: u64,

    /// The size of the block, excluding its on-disk trailer.
    size: u64,
}

/// Crate-only methods
impl BlockHandle {
    /// Create a new instance of [`BlockHandle`].
    pub(crate) fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// The file offset at which the block begins.
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// The size of the block, excluding its on-disk trailer.
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Serialize the handle as two varint64 values.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut encoded = self.offset.encode_var_vec();
        encoded.extend(self.size.encode_var_vec());

        encoded
    }

    /**
    Deserialize a handle from the front of `buf`.

    Returns the handle and the number of bytes it occupied.
    */
    pub(crate) fn decode(buf: &[u8]) -> TableReadResult<(BlockHandle, usize)> {
        let (offset, offset_width) = u64::decode_var(buf).ok_or_else(|| {
            ReadError::FailedToParse("Failed to decode a block handle offset.".to_string())
        })?;
        let (size, size_width) = u64::decode_var(&buf[offset_width..]).ok_or_else(|| {
            ReadError::FailedToParse("Failed to decode a block handle size.".to_string())
        })?;

        Ok((BlockHandle::new(offset, size), offset_width + size_width))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn handles_round_trip() {
        let handle = BlockHandle::new(1 << 40, 4096);
        let encoded = handle.encode();
        assert!(encoded.len() <= BLOCK_HANDLE_MAX_ENCODED_LENGTH_BYTES);

        let (decoded, consumed) = BlockHandle::decode(&encoded).unwrap();
        assert_eq!(decoded, handle);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn truncated_handles_are_rejected() {
        let encoded = BlockHandle::new(u64::MAX, u64::MAX).encode();
        assert!(BlockHandle::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(BlockHandle::decode(&[]).is_err());
    }
}
