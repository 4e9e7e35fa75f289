/*!
A batch is an atomically applied, ordered sequence of put and delete
operations.

# Serialization

The wire form, which is also what gets appended to the write-ahead log, is:

```text
sequence: fixed64
count: fixed32
records: one per operation, in insertion order
```

Each record is an operation byte followed by a length-prefixed key, and for
puts a length-prefixed value. The record at index `i` is applied at
`sequence + i`.
*/

use integer_encoding::FixedInt;

use crate::config::{SIZE_OF_U32_BYTES, SIZE_OF_U64_BYTES};
use crate::errors::{StrataError, StrataResult};
use crate::key::Operation;
use crate::memtable::MemTable;
use crate::utils::coding::{get_length_prefixed_slice, put_length_prefixed_slice};

/// The size of the serialized sequence number and count prefix.
const BATCH_HEADER_LENGTH_BYTES: usize = SIZE_OF_U64_BYTES + SIZE_OF_U32_BYTES;

/// Receives the operations of a batch during iteration.
pub trait BatchHandler {
    /// Called once per put record.
    fn put(&mut self, key: &[u8], value: &[u8]);

    /// Called once per delete record.
    fn delete(&mut self, key: &[u8]);
}

/// An ordered set of operations to apply atomically.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Batch {
    /// The serialized representation described in the module docs.
    rep: Vec<u8>,
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// Public methods
impl Batch {
    /// Create a new, empty [`Batch`].
    pub fn new() -> Self {
        Self {
            rep: vec![0; BATCH_HEADER_LENGTH_BYTES],
        }
    }

    /// Queue a put of `key` to `value`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(Operation::Put as u8);
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    /// Queue a deletion of `key`.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(Operation::Delete as u8);
        put_length_prefixed_slice(&mut self.rep, key);
    }

    /// Reset the batch to empty.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_LENGTH_BYTES, 0);
    }

    /// The number of operations in the batch.
    pub fn count(&self) -> u32 {
        u32::decode_fixed(&self.rep[SIZE_OF_U64_BYTES..BATCH_HEADER_LENGTH_BYTES])
    }

    /// The serialized size of the batch in bytes.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Whether the batch holds no operations.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /**
    Invoke `handler` for each operation in insertion order.

    Returns a corruption error if the serialized form is malformed or the
    stored count disagrees with the records present.
    */
    pub fn iterate(&self, handler: &mut dyn BatchHandler) -> StrataResult<()> {
        if self.rep.len() < BATCH_HEADER_LENGTH_BYTES {
            return Err(StrataError::Corruption(
                "Batch is too small to hold its header.".to_string(),
            ));
        }

        let mut records = &self.rep[BATCH_HEADER_LENGTH_BYTES..];
        let mut records_found: u32 = 0;
        while !records.is_empty() {
            records_found += 1;
            let operation = Operation::try_from(records[0])?;
            records = &records[1..];

            let (key, consumed) = get_length_prefixed_slice(records).ok_or_else(|| {
                StrataError::Corruption("Bad key length in batch record.".to_string())
            })?;

            match operation {
                Operation::Put => {
                    let after_key = &records[consumed..];
                    let (value, value_consumed) =
                        get_length_prefixed_slice(after_key).ok_or_else(|| {
                            StrataError::Corruption(
                                "Bad value length in batch record.".to_string(),
                            )
                        })?;
                    handler.put(key, value);
                    records = &after_key[value_consumed..];
                }
                Operation::Delete => {
                    handler.delete(key);
                    records = &records[consumed..];
                }
            }
        }

        if records_found != self.count() {
            return Err(StrataError::Corruption(format!(
                "Batch declared {} operations but contained {records_found}.",
                self.count()
            )));
        }

        Ok(())
    }
}

/// Crate-only methods
impl Batch {
    /// Adopt a serialized batch, e.g. one replayed from the write-ahead log.
    pub(crate) fn from_contents(rep: Vec<u8>) -> StrataResult<Self> {
        if rep.len() < BATCH_HEADER_LENGTH_BYTES {
            return Err(StrataError::Corruption(
                "Batch is too small to hold its header.".to_string(),
            ));
        }

        Ok(Self { rep })
    }

    /// The serialized representation.
    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// The sequence number the first operation applies at.
    pub(crate) fn sequence_number(&self) -> u64 {
        u64::decode_fixed(&self.rep[..SIZE_OF_U64_BYTES])
    }

    /// Set the sequence number the first operation applies at.
    pub(crate) fn set_sequence_number(&mut self, sequence: u64) {
        self.rep[..SIZE_OF_U64_BYTES].copy_from_slice(&u64::encode_fixed_vec(sequence));
    }

    /**
    Append the operations of `other` to this batch.

    The combined batch applies this batch's operations first; counts are
    summed.
    */
    pub(crate) fn append(&mut self, other: &Batch) {
        self.set_count(self.count() + other.count());
        self.rep
            .extend_from_slice(&other.rep[BATCH_HEADER_LENGTH_BYTES..]);
    }

    /**
    Apply the batch's operations to `memtable`, assigning consecutive
    sequence numbers starting at the batch's sequence number.
    */
    pub(crate) fn apply_to_memtable(&self, memtable: &MemTable) -> StrataResult<()> {
        let mut inserter = MemTableInserter {
            sequence: self.sequence_number(),
            memtable,
        };

        self.iterate(&mut inserter)
    }

    fn set_count(&mut self, count: u32) {
        self.rep[SIZE_OF_U64_BYTES..BATCH_HEADER_LENGTH_BYTES]
            .copy_from_slice(&u32::encode_fixed_vec(count));
    }
}

/// Applies batch records to a memtable with advancing sequence numbers.
struct MemTableInserter<'m> {
    sequence: u64,
    memtable: &'m MemTable,
}

impl BatchHandler for MemTableInserter<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.memtable.add(self.sequence, Operation::Put, key, value);
        self.sequence += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.memtable.add(self.sequence, Operation::Delete, key, b"");
        self.sequence += 1;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::key::LookupKey;
    use crate::memtable::EntryValue;

    use super::*;

    /// Records handler invocations for assertions.
    #[derive(Default)]
    struct RecordingHandler {
        operations: Vec<(String, Vec<u8>, Vec<u8>)>,
    }

    impl BatchHandler for RecordingHandler {
        fn put(&mut self, key: &[u8], value: &[u8]) {
            self.operations
                .push(("put".to_string(), key.to_vec(), value.to_vec()));
        }

        fn delete(&mut self, key: &[u8]) {
            self.operations
                .push(("delete".to_string(), key.to_vec(), vec![]));
        }
    }

    #[test]
    fn an_empty_batch_has_no_operations() {
        let batch = Batch::new();
        assert_eq!(batch.count(), 0);
        assert!(batch.is_empty());

        let mut handler = RecordingHandler::default();
        batch.iterate(&mut handler).unwrap();
        assert!(handler.operations.is_empty());
    }

    #[test]
    fn iteration_visits_operations_in_insertion_order_exactly_once() {
        let mut batch = Batch::new();
        batch.put(b"a", b"1");
        batch.delete(b"b");
        batch.put(b"c", b"3");
        assert_eq!(batch.count(), 3);

        let mut handler = RecordingHandler::default();
        batch.iterate(&mut handler).unwrap();
        assert_eq!(
            handler.operations,
            vec![
                ("put".to_string(), b"a".to_vec(), b"1".to_vec()),
                ("delete".to_string(), b"b".to_vec(), vec![]),
                ("put".to_string(), b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn appending_batches_concatenates_records_and_sums_counts() {
        let mut first = Batch::new();
        first.put(b"a", b"1");
        let mut second = Batch::new();
        second.delete(b"a");
        second.put(b"b", b"2");

        first.append(&second);
        assert_eq!(first.count(), 3);

        let mut handler = RecordingHandler::default();
        first.iterate(&mut handler).unwrap();
        assert_eq!(handler.operations[0].0, "put");
        assert_eq!(handler.operations[1].0, "delete");
        assert_eq!(handler.operations[2].1, b"b".to_vec());
    }

    #[test]
    fn the_sequence_number_survives_a_round_trip() {
        let mut batch = Batch::new();
        batch.put(b"k", b"v");
        batch.set_sequence_number(9000);

        let recovered = Batch::from_contents(batch.contents().to_vec()).unwrap();
        assert_eq!(recovered.sequence_number(), 9000);
        assert_eq!(recovered, batch);
    }

    #[test]
    fn memtable_application_assigns_consecutive_sequence_numbers() {
        let mut batch = Batch::new();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"a");
        batch.set_sequence_number(100);

        let memtable = MemTable::new();
        batch.apply_to_memtable(&memtable).unwrap();

        // The delete at sequence 102 masks the put at sequence 100.
        assert_eq!(
            memtable.get(&LookupKey::new(b"a", 200)),
            Some(EntryValue::Deleted)
        );
        assert_eq!(
            memtable.get(&LookupKey::new(b"a", 101)),
            Some(EntryValue::Present(b"1".to_vec()))
        );
        assert_eq!(
            memtable.get(&LookupKey::new(b"b", 200)),
            Some(EntryValue::Present(b"2".to_vec()))
        );
    }

    #[test]
    fn corrupted_batches_are_rejected() {
        let mut batch = Batch::new();
        batch.put(b"key", b"value");

        // Truncate into the middle of the value.
        let mut truncated = batch.contents().to_vec();
        truncated.truncate(truncated.len() - 2);
        let bad_batch = Batch::from_contents(truncated).unwrap();

        let mut handler = RecordingHandler::default();
        assert!(bad_batch.iterate(&mut handler).is_err());

        assert!(Batch::from_contents(vec![0; 4]).is_err());
    }
}
