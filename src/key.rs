/*!
Entries in the database are keyed by an internal key: the user key plus a
trailing fixed64 tag packing a sequence number and the operation performed.

The sequence number is a 56-bit, globally monotonic counter. Writes are
append-only, so multiple entries for one user key coexist; the sequence
number decides which entry is the most recent and which entries a snapshot
is allowed to observe.

Internal keys order by ascending user key, then *descending* sequence
number, then descending operation. This places the newest entry for a user
key first in scan order.
*/

use std::cmp::Ordering;
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;

use integer_encoding::{FixedInt, VarInt};

use crate::comparator::Comparator;
use crate::config::SIZE_OF_U64_BYTES;
use crate::errors::{StrataError, StrataResult};

/// The highest sequence number a write can be assigned (56 bits).
pub(crate) const MAX_SEQUENCE_NUMBER: u64 = (1 << 56) - 1;

/**
The operation tag used when constructing seek targets.

[`Operation::Put`] has the greatest tag value, and tags sort in descending
order, so a seek key built with it positions before every entry with the
same user key and sequence number.
*/
pub(crate) const SEEK_OPERATION: Operation = Operation::Put;

/// The operation that was applied to an entry in the database.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    /// A tombstone. There is no value for the operation.
    Delete = 0,
    /// Adds a new key-value pair or updates an existing key-value pair.
    Put = 1,
}

impl TryFrom<u8> for Operation {
    type Error = StrataError;

    fn try_from(value: u8) -> StrataResult<Operation> {
        match value {
            0 => Ok(Operation::Delete),
            1 => Ok(Operation::Put),
            _ => Err(StrataError::Corruption(format!(
                "Unknown entry operation tag: {value}."
            ))),
        }
    }
}

/// Pack a sequence number and operation into the trailing 8-byte tag.
pub(crate) fn pack_sequence_and_operation(sequence: u64, operation: Operation) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | (operation as u64)
}

/// The user key portion of an encoded internal key.
pub(crate) fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= SIZE_OF_U64_BYTES);
    &internal_key[..internal_key.len() - SIZE_OF_U64_BYTES]
}

/// The packed tag of an encoded internal key.
pub(crate) fn extract_tag(internal_key: &[u8]) -> u64 {
    debug_assert!(internal_key.len() >= SIZE_OF_U64_BYTES);
    u64::decode_fixed(&internal_key[internal_key.len() - SIZE_OF_U64_BYTES..])
}

/**
Split an encoded internal key into its user key, sequence number, and
operation. Returns `None` for buffers too short to hold a tag or with an
unknown operation byte.
*/
pub(crate) fn parse_internal_key(internal_key: &[u8]) -> Option<(&[u8], u64, Operation)> {
    if internal_key.len() < SIZE_OF_U64_BYTES {
        return None;
    }

    let tag = extract_tag(internal_key);
    let operation = Operation::try_from((tag & 0xff) as u8).ok()?;

    Some((extract_user_key(internal_key), tag >> 8, operation))
}

/**
An owned, encoded internal key.

The wrapped buffer is always `user_key || fixed64((sequence << 8) | op)`.
The `Ord` implementation applies the default bytewise user-key order; code
paths that honor a configured comparator go through
[`InternalKeyComparator`] on the raw encoding instead.
*/
#[derive(Clone, Eq, PartialEq)]
pub struct InternalKey(Vec<u8>);

/// Crate-only methods
impl InternalKey {
    /// Construct an internal key from its parts.
    pub(crate) fn new(user_key: &[u8], sequence: u64, operation: Operation) -> Self {
        let mut encoded = Vec::with_capacity(user_key.len() + SIZE_OF_U64_BYTES);
        encoded.extend_from_slice(user_key);
        encoded.extend(u64::encode_fixed_vec(pack_sequence_and_operation(
            sequence, operation,
        )));

        InternalKey(encoded)
    }

    /// Adopt an already encoded internal key, validating its shape.
    pub(crate) fn decode(encoded: Vec<u8>) -> StrataResult<Self> {
        if parse_internal_key(&encoded).is_none() {
            return Err(StrataError::Corruption(
                "Buffer is too short or has a bad tag for an internal key.".to_string(),
            ));
        }

        Ok(InternalKey(encoded))
    }

    /// The full encoded representation.
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The user key portion.
    pub(crate) fn user_key(&self) -> &[u8] {
        extract_user_key(&self.0)
    }

    /// The sequence number of the operation that created this entry.
    pub(crate) fn sequence_number(&self) -> u64 {
        extract_tag(&self.0) >> 8
    }

    /// The operation that created this entry.
    pub(crate) fn operation(&self) -> Operation {
        // The tag was validated at construction.
        Operation::try_from((extract_tag(&self.0) & 0xff) as u8).unwrap()
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.user_key().cmp(other.user_key()) {
            Ordering::Equal => {
                // Descending by tag: newer entries (higher sequence) first.
                extract_tag(&other.0).cmp(&extract_tag(&self.0))
            }
            user_key_order => user_key_order,
        }
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InternalKey({:?} @ {} : {:?})",
            String::from_utf8_lossy(self.user_key()),
            self.sequence_number(),
            self.operation()
        )
    }
}

/**
The key shape used for point lookups.

The buffer holds `varint32(internal_key_len) || user_key || tag`, where the
tag carries the snapshot sequence and the seek operation. Accessors expose
the sub-slices that the memtable and the table files each want.
*/
pub struct LookupKey {
    data: Vec<u8>,
    /// Offset where the internal key begins (just past the length prefix).
    key_start: usize,
}

/// Crate-only methods
impl LookupKey {
    /// Build a lookup key for `user_key` as of `sequence`.
    pub(crate) fn new(user_key: &[u8], sequence: u64) -> Self {
        let internal_key_length = user_key.len() + SIZE_OF_U64_BYTES;
        let length_prefix = u32::encode_var_vec(internal_key_length as u32);
        let key_start = length_prefix.len();

        let mut data = Vec::with_capacity(key_start + internal_key_length);
        data.extend(length_prefix);
        data.extend_from_slice(user_key);
        data.extend(u64::encode_fixed_vec(pack_sequence_and_operation(
            sequence,
            SEEK_OPERATION,
        )));

        Self { data, key_start }
    }

    /// The full length-prefixed form used for memtable seeks.
    pub(crate) fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    /// The encoded internal key used for table seeks.
    pub(crate) fn internal_key(&self) -> &[u8] {
        &self.data[self.key_start..]
    }

    /// The bare user key.
    pub(crate) fn user_key(&self) -> &[u8] {
        &self.data[self.key_start..self.data.len() - SIZE_OF_U64_BYTES]
    }

    /// The snapshot sequence the lookup runs at.
    pub(crate) fn sequence_number(&self) -> u64 {
        extract_tag(self.internal_key()) >> 8
    }
}

/**
Orders encoded internal keys: ascending user key per the wrapped user
comparator, then descending tag.
*/
#[derive(Clone, Debug)]
pub(crate) struct InternalKeyComparator {
    user_comparator: Arc<dyn Comparator>,
}

/// Crate-only methods
impl InternalKeyComparator {
    pub(crate) fn new(user_comparator: Arc<dyn Comparator>) -> Self {
        Self { user_comparator }
    }

    /// The wrapped user-key comparator.
    pub(crate) fn user_comparator(&self) -> Arc<dyn Comparator> {
        Arc::clone(&self.user_comparator)
    }

    /// Compare only the user-key portions of two encoded internal keys.
    pub(crate) fn compare_user_keys(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.user_comparator
            .compare(extract_user_key(a), extract_user_key(b))
    }
}

impl Comparator for InternalKeyComparator {
    fn name(&self) -> &'static str {
        "stratadb.InternalKeyComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self
            .user_comparator
            .compare(extract_user_key(a), extract_user_key(b))
        {
            Ordering::Equal => extract_tag(b).cmp(&extract_tag(a)),
            user_key_order => user_key_order,
        }
    }

    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        // Attempt to shorten the user key portion only.
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let shortened = self
            .user_comparator
            .find_shortest_separator(user_start, user_limit);

        if shortened.len() < user_start.len()
            && self.user_comparator.compare(user_start, &shortened) == Ordering::Less
        {
            // A physically shorter user key sorts between the two inputs
            // when given the maximum possible tag.
            let mut separator = shortened;
            separator.extend(u64::encode_fixed_vec(pack_sequence_and_operation(
                MAX_SEQUENCE_NUMBER,
                SEEK_OPERATION,
            )));
            debug_assert!(self.compare(start, &separator) == Ordering::Less);
            debug_assert!(self.compare(&separator, limit) == Ordering::Less);
            return separator;
        }

        start.to_vec()
    }

    fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        let user_key = extract_user_key(key);
        let shortened = self.user_comparator.find_short_successor(user_key);

        if shortened.len() < user_key.len()
            && self.user_comparator.compare(user_key, &shortened) == Ordering::Less
        {
            let mut successor = shortened;
            successor.extend(u64::encode_fixed_vec(pack_sequence_and_operation(
                MAX_SEQUENCE_NUMBER,
                SEEK_OPERATION,
            )));
            debug_assert!(self.compare(key, &successor) == Ordering::Less);
            return successor;
        }

        key.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::comparator::BytewiseComparator;

    use super::*;

    #[test]
    fn internal_keys_round_trip_their_parts() {
        let key = InternalKey::new(b"balloon", 901, Operation::Put);

        assert_eq!(key.user_key(), b"balloon");
        assert_eq!(key.sequence_number(), 901);
        assert_eq!(key.operation(), Operation::Put);
        assert_eq!(key.as_bytes().len(), b"balloon".len() + 8);

        let decoded = InternalKey::decode(key.as_bytes().to_vec()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn internal_keys_order_newest_first_within_a_user_key() {
        let older = InternalKey::new(b"k", 5, Operation::Put);
        let newer = InternalKey::new(b"k", 9, Operation::Put);
        let other_user_key = InternalKey::new(b"l", 1, Operation::Put);

        assert!(newer < older, "Higher sequence numbers must sort first.");
        assert!(older < other_user_key, "User key order dominates.");

        let delete = InternalKey::new(b"k", 5, Operation::Delete);
        let put = InternalKey::new(b"k", 5, Operation::Put);
        assert!(
            put < delete,
            "At equal sequence numbers the higher operation tag sorts first."
        );
    }

    #[test]
    fn short_internal_key_buffers_are_rejected() {
        assert!(InternalKey::decode(vec![1, 2, 3]).is_err());
        assert!(parse_internal_key(&[0; 7]).is_none());
    }

    #[test]
    fn lookup_keys_expose_each_representation() {
        let lookup = LookupKey::new(b"cloudberry", 77);

        assert_eq!(lookup.user_key(), b"cloudberry");
        assert_eq!(lookup.sequence_number(), 77);
        assert_eq!(
            lookup.internal_key().len(),
            b"cloudberry".len() + 8,
            "The internal key is the user key plus the 8-byte tag."
        );
        // varint32 of 18 is a single byte.
        assert_eq!(lookup.memtable_key().len(), 1 + lookup.internal_key().len());

        let (user_key, sequence, operation) =
            parse_internal_key(lookup.internal_key()).unwrap();
        assert_eq!(user_key, b"cloudberry");
        assert_eq!(sequence, 77);
        assert_eq!(operation, SEEK_OPERATION);
    }

    #[test]
    fn internal_key_comparator_shortens_separators_between_user_keys() {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));

        let start = InternalKey::new(b"grandmother", 100, Operation::Put);
        let limit = InternalKey::new(b"grocery", 90, Operation::Put);
        let separator = icmp.find_shortest_separator(start.as_bytes(), limit.as_bytes());

        assert!(separator.len() < start.as_bytes().len());
        assert_eq!(icmp.compare(start.as_bytes(), &separator), Ordering::Less);
        assert_eq!(icmp.compare(&separator, limit.as_bytes()), Ordering::Less);

        let successor = icmp.find_short_successor(start.as_bytes());
        assert_eq!(icmp.compare(start.as_bytes(), &successor), Ordering::Less);
    }
}
