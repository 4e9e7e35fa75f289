/*!
Byte-coding helpers layered on top of the `integer_encoding` crate.

Most serialization in the crate appends varint or fixed-width integers
directly; the helpers here cover the recurring compound shape of a
length-prefixed byte slice.
*/

use integer_encoding::VarInt;

/// Append `varint32(slice.len()) || slice` to `buf`.
pub(crate) fn put_length_prefixed_slice(buf: &mut Vec<u8>, slice: &[u8]) {
    buf.extend(u32::encode_var_vec(slice.len() as u32));
    buf.extend_from_slice(slice);
}

/**
Decode a length-prefixed slice from the front of `buf`.

Returns the slice and the total number of bytes consumed, or `None` if the
buffer is too short to hold the encoded length or the announced payload.
*/
pub(crate) fn get_length_prefixed_slice(buf: &[u8]) -> Option<(&[u8], usize)> {
    let (length, length_width) = u32::decode_var(buf)?;
    let end = length_width.checked_add(length as usize)?;
    if buf.len() < end {
        return None;
    }

    Some((&buf[length_width..end], end))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn length_prefixed_slices_round_trip() {
        let mut buf = vec![];
        put_length_prefixed_slice(&mut buf, b"");
        put_length_prefixed_slice(&mut buf, b"foo");
        put_length_prefixed_slice(&mut buf, &[0xff; 300]);

        let (first, consumed) = get_length_prefixed_slice(&buf).unwrap();
        assert_eq!(first, b"");
        let buf = &buf[consumed..];

        let (second, consumed) = get_length_prefixed_slice(buf).unwrap();
        assert_eq!(second, b"foo");
        let buf = &buf[consumed..];

        let (third, consumed) = get_length_prefixed_slice(buf).unwrap();
        assert_eq!(third, &[0xff; 300][..]);
        assert_eq!(buf.len(), consumed, "The whole buffer should be consumed.");
    }

    #[test]
    fn truncated_slices_are_rejected() {
        let mut buf = vec![];
        put_length_prefixed_slice(&mut buf, b"some payload");

        assert!(get_length_prefixed_slice(&buf[..buf.len() - 1]).is_none());
        assert!(get_length_prefixed_slice(&[]).is_none());
    }
}
