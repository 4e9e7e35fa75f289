//! The fixed-size footer that anchors a table file.

use integer_encoding::FixedInt;

use crate::config::SIZE_OF_U64_BYTES;

use super::block_handle::{BlockHandle, BLOCK_HANDLE_MAX_ENCODED_LENGTH_BYTES};
use super::errors::{ReadError, TableReadResult};

/**
The fixed size of a footer: two padded block handles plus the magic number.
*/
pub(crate) const SIZE_OF_FOOTER_BYTES: usize =
    2 * BLOCK_HANDLE_MAX_ENCODED_LENGTH_BYTES + SIZE_OF_U64_BYTES;

/**
The table file magic number.

Picked by the original authors of this file format by running
`echo http://code.google.com/p/leveldb/ | sha1sum` and taking the leading
64 bits; kept so that existing tooling recognizes the files.
*/
const TABLE_MAGIC_NUMBER: u64 = 0xdb47_7524_8b80_fb57;

/**
The footer of a table file.

Serialized as the metaindex handle, the index handle, zero padding up to
forty bytes, and the 8-byte magic number, for a fixed total of
[`SIZE_OF_FOOTER_BYTES`].
*/
#[derive(Debug)]
pub(crate) struct Footer {
    metaindex_handle: BlockHandle,
    index_handle: BlockHandle,
}

/// Crate-only methods
impl Footer {
    /// Create a new instance of [`Footer`].
    pub(crate) fn new(metaindex_handle: BlockHandle, index_handle: BlockHandle) -> Self {
        Self {
            metaindex_handle,
            index_handle,
        }
    }

    /// The handle of the metaindex block.
    pub(crate) fn metaindex_handle(&self) -> &BlockHandle {
        &self.metaindex_handle
    }

    /// The handle of the index block.
    pub(crate) fn index_handle(&self) -> &BlockHandle {
        &self.index_handle
    }

    /// Serialize to the fixed footer layout.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(SIZE_OF_FOOTER_BYTES);
        encoded.extend(self.metaindex_handle.encode());
        encoded.extend(self.index_handle.encode());
        encoded.resize(2 * BLOCK_HANDLE_MAX_ENCODED_LENGTH_BYTES, 0);
        encoded.extend(u64::encode_fixed_vec(TABLE_MAGIC_NUMBER));

        debug_assert_eq!(encoded.len(), SIZE_OF_FOOTER_BYTES);
        encoded
    }

    /// Deserialize a footer, verifying length and magic number.
    pub(crate) fn decode(buf: &[u8]) -> TableReadResult<Footer> {
        if buf.len() != SIZE_OF_FOOTER_BYTES {
            return Err(ReadError::FailedToParse(format!(
                "A footer must be exactly {SIZE_OF_FOOTER_BYTES} bytes but {} were provided.",
                buf.len()
            )));
        }

        let magic = u64::decode_fixed(&buf[buf.len() - SIZE_OF_U64_BYTES..]);
        if magic != TABLE_MAGIC_NUMBER {
            return Err(ReadError::FailedToParse(
                "Bad magic number. This is not a table file.".to_string(),
            ));
        }

        let (metaindex_handle, metaindex_width) = BlockHandle::decode(buf)?;
        let (index_handle, _) = BlockHandle::decode(&buf[metaindex_width..])?;

        Ok(Footer::new(metaindex_handle, index_handle))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn footers_round_trip_at_a_fixed_size() {
        let footer = Footer::new(BlockHandle::new(0, 17), BlockHandle::new(4096, 910));
        let encoded = footer.encode();
        assert_eq!(encoded.len(), SIZE_OF_FOOTER_BYTES);
        assert_eq!(encoded.len(), 48);

        let decoded = Footer::decode(&encoded).unwrap();
        assert_eq!(decoded.metaindex_handle(), &BlockHandle::new(0, 17));
        assert_eq!(decoded.index_handle(), &BlockHandle::new(4096, 910));
    }

    #[test]
    fn bad_magic_numbers_are_rejected() {
        let footer = Footer::new(BlockHandle::new(0, 17), BlockHandle::new(4096, 910));
        let mut encoded = footer.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;

        assert!(Footer::decode(&encoded).is_err());
        assert!(Footer::decode(&encoded[..47]).is_err());
    }
}
