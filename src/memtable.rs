/*!
The memtable accumulates recent writes in an ordered in-memory structure
keyed by internal keys.

The store is a lock-free skip list ([`crossbeam_skiplist::SkipMap`]), which
gives the concurrency contract the write path needs: many readers proceed
concurrently with the single inserting writer, with no lock around the
structure itself. Entries are never removed; a memtable only grows until it
is frozen and flushed to a table file, and readers that captured a reference
keep it alive until they finish.
*/

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::config::SIZE_OF_U64_BYTES;
use crate::iterator::StorageIterator;
use crate::key::{InternalKey, LookupKey, Operation};

/// The outcome of a memtable or table lookup for a user key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum EntryValue {
    /// The key has a live value.
    Present(Vec<u8>),
    /// The newest entry for the key is a tombstone.
    Deleted,
}

/// An ordered in-memory map of internal keys to values.
pub(crate) struct MemTable {
    entries: SkipMap<InternalKey, Vec<u8>>,

    /**
    Approximate bytes used by entries.

    Tracks the serialized footprint an entry has when flushed (key, tag,
    value, and length prefixes), which is what the write-buffer threshold
    is meant to bound.
    */
    approximate_size: AtomicUsize,
}

/// Crate-only methods
impl MemTable {
    /// Create a new, empty [`MemTable`].
    pub(crate) fn new() -> Self {
        Self {
            entries: SkipMap::new(),
            approximate_size: AtomicUsize::new(0),
        }
    }

    /// The approximate memory usage of the memtable in bytes.
    pub(crate) fn approximate_memory_usage(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }

    /// Whether the memtable holds no entries.
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /**
    Insert an entry.

    Tombstones are stored as entries whose operation is
    [`Operation::Delete`] with an empty value.
    */
    pub(crate) fn add(
        &self,
        sequence: u64,
        operation: Operation,
        user_key: &[u8],
        value: &[u8],
    ) {
        let key = InternalKey::new(user_key, sequence, operation);
        // Two varint length prefixes plus key, tag, and value bytes.
        let charge = 2 + user_key.len() + SIZE_OF_U64_BYTES + value.len();

        self.entries.insert(key, value.to_vec());
        self.approximate_size.fetch_add(charge, Ordering::Relaxed);
    }

    /**
    Look up the newest entry for the lookup key's user key at or below its
    snapshot sequence.

    Returns `None` when the memtable holds no entry for the user key at
    all; the caller then continues to older layers.
    */
    pub(crate) fn get(&self, lookup_key: &LookupKey) -> Option<EntryValue> {
        let seek_key = InternalKey::new(
            lookup_key.user_key(),
            lookup_key.sequence_number(),
            crate::key::SEEK_OPERATION,
        );

        // The first entry at or after the seek key is the newest entry for
        // this user key visible at the snapshot, if the user keys match.
        let entry = self
            .entries
            .lower_bound(std::ops::Bound::Included(&seek_key))?;
        if entry.key().user_key() != lookup_key.user_key() {
            return None;
        }

        match entry.key().operation() {
            Operation::Put => Some(EntryValue::Present(entry.value().clone())),
            Operation::Delete => Some(EntryValue::Deleted),
        }
    }

    /// An iterator over the memtable's entries.
    pub(crate) fn iter(self: &Arc<Self>) -> MemTableIterator {
        MemTableIterator {
            memtable: Arc::clone(self),
            current: None,
        }
    }
}

/**
A cursor over a memtable.

The iterator holds the key of its current entry and repositions through
range queries, so it stays consistent while the single writer continues to
insert around it.
*/
pub(crate) struct MemTableIterator {
    memtable: Arc<MemTable>,
    /// The entry the cursor is positioned at.
    current: Option<(InternalKey, Vec<u8>)>,
}

impl MemTableIterator {
    fn capture(
        current: &mut Option<(InternalKey, Vec<u8>)>,
        entry: Option<crossbeam_skiplist::map::Entry<'_, InternalKey, Vec<u8>>>,
    ) {
        *current = entry.map(|entry| (entry.key().clone(), entry.value().clone()));
    }
}

impl StorageIterator for MemTableIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        let entry = self.memtable.entries.front();
        Self::capture(&mut self.current, entry);
    }

    fn seek_to_last(&mut self) {
        let entry = self.memtable.entries.back();
        Self::capture(&mut self.current, entry);
    }

    fn seek(&mut self, target: &[u8]) {
        match InternalKey::decode(target.to_vec()) {
            Ok(target_key) => {
                let entry = self
                    .memtable
                    .entries
                    .lower_bound(std::ops::Bound::Included(&target_key));
                Self::capture(&mut self.current, entry);
            }
            Err(_) => self.current = None,
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        let (current_key, _) = self.current.as_ref().unwrap();
        let entry = self
            .memtable
            .entries
            .lower_bound(std::ops::Bound::Excluded(current_key));
        Self::capture(&mut self.current, entry);
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let (current_key, _) = self.current.as_ref().unwrap();
        let entry = self
            .memtable
            .entries
            .upper_bound(std::ops::Bound::Excluded(current_key));
        Self::capture(&mut self.current, entry);
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().unwrap().0.as_bytes()
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().unwrap().1
    }

    fn status(&self) -> crate::errors::StrataResult<()> {
        Ok(())
    }
}
