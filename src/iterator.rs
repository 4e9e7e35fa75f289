/*!
The internal iterator abstraction and the merging iterator that combines
sources.

Internal iterators are cursors over encoded internal keys: a single position
moves back and forth over the source, unlike [`std::iter::Iterator`]'s
consume-once model. A cursor is either positioned at an entry (`valid()`)
or not; `key()`/`value()` may only be called while valid.

Errors encountered while positioning do not panic and do not end iteration
with a sentinel entry; the cursor turns invalid and the underlying error is
surfaced by `status()`.
*/

use std::cmp::Ordering;

use crate::errors::StrataResult;
use crate::key::InternalKeyComparator;

use crate::comparator::Comparator;

/// A cursor over encoded internal keys and their values.
pub(crate) trait StorageIterator: Send {
    /// Whether the cursor is positioned at an entry.
    fn valid(&self) -> bool;

    /// Position the cursor at the first entry of the source.
    fn seek_to_first(&mut self);

    /// Position the cursor at the last entry of the source.
    fn seek_to_last(&mut self);

    /// Position the cursor at the first entry whose key is `>= target`.
    fn seek(&mut self, target: &[u8]);

    /// Advance to the next entry. Requires `valid()`.
    fn next(&mut self);

    /// Retreat to the previous entry. Requires `valid()`.
    fn prev(&mut self);

    /// The key at the cursor. Requires `valid()`.
    fn key(&self) -> &[u8];

    /// The value at the cursor. Requires `valid()`.
    fn value(&self) -> &[u8];

    /// The first error this cursor has encountered, if any.
    fn status(&self) -> StrataResult<()>;
}

/// The direction the merging iterator most recently moved in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Direction {
    Forward,
    Reverse,
}

/**
Merges several sorted sources into one sorted view.

Entries with equal keys across children are yielded in child order, so
callers list newer sources (memtable before tables, lower levels before
higher) first.
*/
pub(crate) struct MergingIterator {
    comparator: InternalKeyComparator,
    children: Vec<Box<dyn StorageIterator>>,
    /// Index into `children` of the child the cursor points at.
    current: Option<usize>,
    direction: Direction,
}

/// Crate-only methods
impl MergingIterator {
    pub(crate) fn new(
        comparator: InternalKeyComparator,
        children: Vec<Box<dyn StorageIterator>>,
    ) -> Self {
        Self {
            comparator,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }
}

/// Private methods
impl MergingIterator {
    /// Point the cursor at the child with the smallest current key.
    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (idx, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(idx),
                Some(best) => {
                    if self
                        .comparator
                        .compare(child.key(), self.children[best].key())
                        == Ordering::Less
                    {
                        smallest = Some(idx);
                    }
                }
            }
        }

        self.current = smallest;
    }

    /// Point the cursor at the child with the largest current key.
    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (idx, child) in self.children.iter().enumerate().rev() {
            if !child.valid() {
                continue;
            }
            match largest {
                None => largest = Some(idx),
                Some(best) => {
                    if self
                        .comparator
                        .compare(child.key(), self.children[best].key())
                        == Ordering::Greater
                    {
                        largest = Some(idx);
                    }
                }
            }
        }

        self.current = largest;
    }
}

impl StorageIterator for MergingIterator {
    fn valid(&self) -> bool {
        match self.current {
            Some(idx) => self.children[idx].valid(),
            None => false,
        }
    }

    fn seek_to_first(&mut self) {
        for child in self.children.iter_mut() {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_last(&mut self) {
        for child in self.children.iter_mut() {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in self.children.iter_mut() {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        let current = self.current.unwrap();

        // After moving backwards, the non-current children sit before the
        // cursor key. Reposition them to the first entry after it so that
        // advancing the current child and re-picking the smallest yields
        // the true successor.
        if self.direction != Direction::Forward {
            let cursor_key = self.children[current].key().to_vec();
            for (idx, child) in self.children.iter_mut().enumerate() {
                if idx == current {
                    continue;
                }
                child.seek(&cursor_key);
                if child.valid()
                    && self.comparator.compare(&cursor_key, child.key()) == Ordering::Equal
                {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let current = self.current.unwrap();

        // Mirror of `next`: place every other child just before the cursor
        // key.
        if self.direction != Direction::Reverse {
            let cursor_key = self.children[current].key().to_vec();
            for (idx, child) in self.children.iter_mut().enumerate() {
                if idx == current {
                    continue;
                }
                child.seek(&cursor_key);
                if child.valid() {
                    // Child is at the first entry >= cursor_key; step back
                    // to land strictly before it.
                    child.prev();
                } else {
                    // Every entry in this child is < cursor_key.
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.children[self.current.unwrap()].key()
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        self.children[self.current.unwrap()].value()
    }

    fn status(&self) -> StrataResult<()> {
        for child in self.children.iter() {
            child.status()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use crate::comparator::BytewiseComparator;
    use crate::key::{InternalKey, Operation};

    use super::*;

    /// A simple in-memory iterator over pre-sorted entries.
    pub(crate) struct VecIterator {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        position: Option<usize>,
        comparator: InternalKeyComparator,
    }

    impl VecIterator {
        fn new(mut entries: Vec<(InternalKey, Vec<u8>)>) -> Self {
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Self {
                entries: entries
                    .into_iter()
                    .map(|(key, value)| (key.as_bytes().to_vec(), value))
                    .collect(),
                position: None,
                comparator: InternalKeyComparator::new(Arc::new(BytewiseComparator)),
            }
        }
    }

    impl StorageIterator for VecIterator {
        fn valid(&self) -> bool {
            self.position.map_or(false, |pos| pos < self.entries.len())
        }

        fn seek_to_first(&mut self) {
            self.position = Some(0);
        }

        fn seek_to_last(&mut self) {
            self.position = if self.entries.is_empty() {
                None
            } else {
                Some(self.entries.len() - 1)
            };
        }

        fn seek(&mut self, target: &[u8]) {
            let found = self
                .entries
                .iter()
                .position(|(key, _)| self.comparator.compare(key, target) != Ordering::Less);
            self.position = Some(found.unwrap_or(self.entries.len()));
        }

        fn next(&mut self) {
            self.position = Some(self.position.unwrap() + 1);
        }

        fn prev(&mut self) {
            let pos = self.position.unwrap();
            self.position = if pos == 0 {
                Some(self.entries.len()) // invalid
            } else {
                Some(pos - 1)
            };
        }

        fn key(&self) -> &[u8] {
            &self.entries[self.position.unwrap()].0
        }

        fn value(&self) -> &[u8] {
            &self.entries[self.position.unwrap()].1
        }

        fn status(&self) -> StrataResult<()> {
            Ok(())
        }
    }

    fn ikey(user_key: &str, sequence: u64) -> InternalKey {
        InternalKey::new(user_key.as_bytes(), sequence, Operation::Put)
    }

    fn merged() -> MergingIterator {
        let left = VecIterator::new(vec![
            (ikey("apple", 4), b"a".to_vec()),
            (ikey("melon", 2), b"m".to_vec()),
        ]);
        let right = VecIterator::new(vec![
            (ikey("banana", 3), b"b".to_vec()),
            (ikey("zebra", 1), b"z".to_vec()),
        ]);

        MergingIterator::new(
            InternalKeyComparator::new(Arc::new(BytewiseComparator)),
            vec![Box::new(left), Box::new(right)],
        )
    }

    #[test]
    fn forward_iteration_interleaves_children_in_key_order() {
        let mut iter = merged();
        iter.seek_to_first();

        let mut seen = vec![];
        while iter.valid() {
            seen.push(iter.value().to_vec());
            iter.next();
        }
        assert_eq!(seen, vec![b"a", b"b", b"m", b"z"]);
    }

    #[test]
    fn reverse_iteration_yields_descending_key_order() {
        let mut iter = merged();
        iter.seek_to_last();

        let mut seen = vec![];
        while iter.valid() {
            seen.push(iter.value().to_vec());
            iter.prev();
        }
        assert_eq!(seen, vec![b"z", b"m", b"b", b"a"]);
    }

    #[test]
    fn direction_switches_visit_the_correct_neighbors() {
        let mut iter = merged();
        iter.seek(ikey("banana", u64::MAX >> 8).as_bytes());
        assert!(iter.valid());
        assert_eq!(iter.value(), b"b");

        // Switch to reverse: the entry before "banana" is "apple".
        iter.prev();
        assert!(iter.valid());
        assert_eq!(iter.value(), b"a");

        // And switch forward again.
        iter.next();
        assert_eq!(iter.value(), b"b");
        iter.next();
        assert_eq!(iter.value(), b"m");
    }

    #[test]
    fn seeking_past_the_end_invalidates_the_cursor() {
        let mut iter = merged();
        iter.seek(ikey("zzzz", 100).as_bytes());
        assert!(!iter.valid());
    }
}
