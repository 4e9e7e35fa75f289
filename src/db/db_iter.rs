/*!
The iterator handed to database clients.

Internally the database iterates (user key, sequence, operation) triples;
this adapter collapses them to the user's view: one entry per user key, the
newest version at or below the iterator's sequence number, with deleted
keys absent. Direction changes have to step past every obsolete version of
the neighboring user key, so the adapter tracks which way it is moving.

As a side job, the iterator samples the internal keys it passes (roughly
one sample per megabyte read) and feeds them into the seek-compaction
statistics, so read-heavy cold ranges eventually get compacted.
*/

use std::cmp::Ordering;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::comparator::Comparator;
use crate::config::READ_BYTES_PERIOD;
use crate::errors::{StrataError, StrataResult};
use crate::iterator::{MergingIterator, StorageIterator};
use crate::key::{parse_internal_key, Operation};
use crate::versioning::version::Version;

use super::DbState;

/// Which way the iterator most recently moved.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Direction {
    /// `internal` is positioned at the entry yielding `key()`.
    Forward,
    /**
    `internal` is positioned just before the entries for `key()`, whose
    key and value are buffered in `saved_key`/`saved_value`.
    */
    Reverse,
}

/// An iterator over the live user keys of the database.
pub struct DbIterator {
    /// Shared database state, for read-sample bookkeeping.
    state: Arc<DbState>,

    /// The merged view over memtables and table files.
    internal: MergingIterator,

    /// Orders user keys.
    user_comparator: Arc<dyn Comparator>,

    /// Entries above this sequence number are invisible.
    sequence: u64,

    /// Pins the version (and thus the files) this iterator reads.
    version: Arc<Version>,

    direction: Direction,
    valid: bool,

    /// See [`Direction`]; doubles as skip target while moving forward.
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,

    /// First error encountered.
    deferred_error: Option<StrataError>,

    /// Source of the randomized read-sampling period.
    rng: StdRng,

    /// Bytes left before the next read sample is taken.
    bytes_until_read_sampling: u64,
}

/// Public methods
impl DbIterator {
    /// Whether the iterator is positioned at an entry.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Position at the first user key at or after `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_key.clear();
        self.saved_value.clear();

        let seek_key = crate::key::LookupKey::new(target, self.sequence);
        self.internal.seek(seek_key.internal_key());
        if self.internal.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    /// Position at the first user key in the database.
    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.internal.seek_to_first();
        if self.internal.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    /// Position at the last user key in the database.
    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.internal.seek_to_last();
        self.find_prev_user_entry();
    }

    /// Advance to the next user key. Requires `valid()`.
    pub fn next(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Reverse {
            // The internal cursor sits before the current key's entries;
            // move it to the first entry at or past the current key so the
            // forward skip starts from the right place.
            self.direction = Direction::Forward;
            if !self.internal.valid() {
                self.internal.seek_to_first();
            } else {
                self.internal.next();
            }
            if !self.internal.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
            // saved_key already holds the current user key, which is what
            // the skip below wants.
        } else {
            // Remember the current user key as the skip target.
            let current = self.internal.key().to_vec();
            match parse_internal_key(&current) {
                Some((user_key, _, _)) => {
                    self.saved_key.clear();
                    self.saved_key.extend_from_slice(user_key);
                }
                None => self.record_corruption(),
            }

            self.internal.next();
            if !self.internal.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        }

        self.find_next_user_entry(true);
    }

    /// Retreat to the previous user key. Requires `valid()`.
    pub fn prev(&mut self) {
        debug_assert!(self.valid);

        if self.direction == Direction::Forward {
            // The internal cursor is at the current key's newest entry;
            // back up until we are before every entry of this user key.
            debug_assert!(self.internal.valid());
            let current_user_key = match parse_internal_key(self.internal.key()) {
                Some((user_key, _, _)) => user_key.to_vec(),
                None => {
                    self.record_corruption();
                    return;
                }
            };
            self.saved_key = current_user_key;
            loop {
                self.internal.prev();
                if !self.internal.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                let user_key = match parse_internal_key(self.internal.key()) {
                    Some((user_key, _, _)) => user_key,
                    None => continue,
                };
                if self.user_comparator.compare(user_key, &self.saved_key)
                    == Ordering::Less
                {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    /// The current user key. Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => {
                parse_internal_key(self.internal.key())
                    .map(|(user_key, _, _)| user_key)
                    .unwrap_or_default()
            }
            Direction::Reverse => &self.saved_key,
        }
    }

    /// The current value. Requires `valid()`.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.internal.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    /// The first error this iterator encountered, if any.
    pub fn status(&self) -> StrataResult<()> {
        if let Some(error) = self.deferred_error.as_ref() {
            return Err(error.clone());
        }

        self.internal.status()
    }
}

/// Crate-only methods
impl DbIterator {
    pub(crate) fn new(
        state: Arc<DbState>,
        internal: MergingIterator,
        sequence: u64,
        version: Arc<Version>,
    ) -> Self {
        let user_comparator = state.options.comparator.clone();
        let mut rng = StdRng::from_entropy();
        let bytes_until_read_sampling = random_sampling_period(&mut rng);

        Self {
            state,
            internal,
            user_comparator,
            sequence,
            version,
            direction: Direction::Forward,
            valid: false,
            saved_key: vec![],
            saved_value: vec![],
            deferred_error: None,
            rng,
            bytes_until_read_sampling,
        }
    }
}

/// Private methods
impl DbIterator {
    /**
    Parse the internal cursor's key, charging read sampling as a side
    effect. Returns `None` (and latches corruption) on malformed keys.
    */
    fn parse_current_key(&mut self) -> Option<(Vec<u8>, u64, Operation)> {
        let raw_key = self.internal.key().to_vec();
        let bytes_read = (raw_key.len() + self.internal.value().len()) as u64;

        while self.bytes_until_read_sampling < bytes_read {
            self.bytes_until_read_sampling += random_sampling_period(&mut self.rng);
            if let Some(stats) = self.version.record_read_sample(&raw_key) {
                let mut guard = self.state.guarded.lock();
                if self.version.update_stats(stats) {
                    super::maybe_schedule_compaction(&self.state, &mut guard);
                }
            }
        }
        self.bytes_until_read_sampling -= bytes_read;

        match parse_internal_key(&raw_key) {
            Some((user_key, sequence, operation)) => {
                Some((user_key.to_vec(), sequence, operation))
            }
            None => {
                self.record_corruption();
                None
            }
        }
    }

    /**
    Move forward to the newest visible, live entry of the next acceptable
    user key. With `skipping` set, user keys at or before `saved_key` are
    passed over.
    */
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.direction == Direction::Forward);

        loop {
            if !self.internal.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }

            if let Some((user_key, sequence, operation)) = self.parse_current_key() {
                if sequence <= self.sequence {
                    match operation {
                        Operation::Delete => {
                            // Everything older for this user key is
                            // shadowed by the tombstone.
                            self.saved_key = user_key;
                            skipping = true;
                        }
                        Operation::Put => {
                            if skipping
                                && self
                                    .user_comparator
                                    .compare(&user_key, &self.saved_key)
                                    != Ordering::Greater
                            {
                                // An older version of a key already
                                // yielded or deleted.
                            } else {
                                self.valid = true;
                                self.saved_key.clear();
                                return;
                            }
                        }
                    }
                }
            }

            self.internal.next();
        }
    }

    /**
    Move backward to the previous live user key, buffering its newest
    visible value. On entry the cursor is before every entry of the key
    the iterator just yielded.
    */
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);

        // What we know about the candidate user key accumulated so far.
        let mut value_operation: Option<Operation> = None;
        self.saved_key.clear();
        self.saved_value.clear();

        while self.internal.valid() {
            if let Some((user_key, sequence, operation)) = self.parse_current_key() {
                if sequence <= self.sequence {
                    if value_operation.is_some()
                        && self.user_comparator.compare(&user_key, &self.saved_key)
                            == Ordering::Less
                    {
                        // Crossed into an earlier user key; the buffered
                        // entry is the answer.
                        break;
                    }

                    value_operation = Some(operation);
                    match operation {
                        Operation::Delete => {
                            self.saved_key.clear();
                            self.saved_value.clear();
                        }
                        Operation::Put => {
                            self.saved_key = user_key;
                            self.saved_value = self.internal.value().to_vec();
                        }
                    }
                }
            }

            self.internal.prev();
        }

        match value_operation {
            None | Some(Operation::Delete) => {
                // Ran off the front without a live entry.
                self.valid = false;
                self.saved_key.clear();
                self.saved_value.clear();
                self.direction = Direction::Forward;
            }
            Some(Operation::Put) => {
                self.valid = true;
            }
        }
    }

    fn record_corruption(&mut self) {
        if self.deferred_error.is_none() {
            self.deferred_error = Some(StrataError::Corruption(
                "Malformed internal key encountered during iteration.".to_string(),
            ));
        }
        self.valid = false;
    }
}

/// A randomized inter-sample gap averaging [`READ_BYTES_PERIOD`].
fn random_sampling_period(rng: &mut StdRng) -> u64 {
    rng.gen_range(0..2 * READ_BYTES_PERIOD)
}
