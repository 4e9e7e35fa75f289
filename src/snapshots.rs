//! Snapshots scope reads to the state of the database at a point in time.

use std::collections::VecDeque;
use std::sync::Arc;

/**
A handle to the database state as of a captured sequence number.

Snapshots are opaque to clients; they are acquired from
[`DB::get_snapshot`](crate::db::DB::get_snapshot) and handed back through
read options or released explicitly.
*/
#[derive(Clone, Debug)]
pub struct Snapshot {
    inner: Arc<InnerSnapshot>,
}

/// Crate-only methods
impl Snapshot {
    /// The sequence number at which this snapshot was taken.
    pub(crate) fn sequence_number(&self) -> u64 {
        self.inner.sequence_number
    }

    fn inner(&self) -> &Arc<InnerSnapshot> {
        &self.inner
    }
}

/// The internal representation of a snapshot.
#[derive(Debug)]
struct InnerSnapshot {
    /// The sequence number at which this snapshot was taken.
    sequence_number: u64,
}

/**
The list of outstanding snapshots, oldest first.

The oldest snapshot's sequence number bounds which superseded entries a
compaction is allowed to drop.
*/
pub(crate) struct SnapshotList {
    snapshots: VecDeque<Arc<InnerSnapshot>>,
}

/// Crate-only methods
impl SnapshotList {
    /// Create a new instance of [`SnapshotList`].
    pub(crate) fn new() -> Self {
        Self {
            snapshots: VecDeque::new(),
        }
    }

    /**
    Create a snapshot at `sequence_number` and append it to the list.

    # Panics

    Sequence numbers only grow over the life of a database, so the new
    snapshot cannot be older than the newest one in the list.
    */
    pub(crate) fn new_snapshot(&mut self, sequence_number: u64) -> Snapshot {
        assert!(
            self.snapshots
                .back()
                .map_or(true, |newest| newest.sequence_number <= sequence_number),
            "Snapshots must be created with monotonically increasing sequence numbers."
        );

        let inner = Arc::new(InnerSnapshot { sequence_number });
        self.snapshots.push_back(Arc::clone(&inner));

        Snapshot { inner }
    }

    /// Remove a snapshot from the list.
    pub(crate) fn release(&mut self, snapshot: &Snapshot) {
        self.snapshots
            .retain(|candidate| !Arc::ptr_eq(candidate, snapshot.inner()));
    }

    /// Returns true if there are no outstanding snapshots.
    pub(crate) fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /**
    The sequence number of the oldest outstanding snapshot.

    # Panics

    The list must not be empty.
    */
    pub(crate) fn oldest_sequence_number(&self) -> u64 {
        self.snapshots
            .front()
            .expect("Asked for the oldest snapshot of an empty list.")
            .sequence_number
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn snapshots_are_tracked_oldest_first() {
        let mut snapshots = SnapshotList::new();
        assert!(snapshots.is_empty());

        let first = snapshots.new_snapshot(1000);
        let second = snapshots.new_snapshot(2000);
        assert_eq!(first.sequence_number(), 1000);
        assert_eq!(second.sequence_number(), 2000);
        assert_eq!(snapshots.oldest_sequence_number(), 1000);

        snapshots.release(&first);
        assert_eq!(snapshots.oldest_sequence_number(), 2000);

        snapshots.release(&second);
        assert!(snapshots.is_empty());
    }

    #[test]
    fn equal_sequence_numbers_are_allowed() {
        let mut snapshots = SnapshotList::new();
        let first = snapshots.new_snapshot(5);
        let second = snapshots.new_snapshot(5);

        snapshots.release(&first);
        assert_eq!(
            snapshots.oldest_sequence_number(),
            5,
            "Releasing one of two equal-sequence snapshots must keep the other."
        );
        snapshots.release(&second);
        assert!(snapshots.is_empty());
    }
}
