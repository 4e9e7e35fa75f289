//! Utilities for checksums.

use crc::{Crc, CRC_32_ISCSI};

/**
CRC calculator using the iSCSI polynomial (CRC32C).

The lineage of this format family uses the google/crc32c implementation
which is specified with the iSCSI polynomial, so that is what we use here
as well.
*/
pub(crate) const CRC_CALCULATOR: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// A constant delta for masking and unmasking checksums.
const CRC_MASKING_DELTA: u32 = 0xa282_ead8;

/**
Return a masked representation of the checksum.

Computing the CRC of a string that itself contains embedded CRCs tends to
produce degenerate checksums, so every CRC that is stored in a file is
masked first.
*/
pub(crate) fn mask_checksum(checksum: u32) -> u32 {
    // Rotate right by 15 bits and add a constant.
    ((checksum.wrapping_shr(15)) | (checksum.wrapping_shl(17))).wrapping_add(CRC_MASKING_DELTA)
}

/**
Return the unmasked checksum.

The checksum must have been masked with [`mask_checksum`].
*/
pub(crate) fn unmask_checksum(masked_checksum: u32) -> u32 {
    let rotated = masked_checksum.wrapping_sub(CRC_MASKING_DELTA);
    (rotated.wrapping_shr(17)) | (rotated.wrapping_shl(15))
}
