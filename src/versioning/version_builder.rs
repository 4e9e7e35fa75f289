/*!
Accumulates a sequence of version edits on top of a base version and
materializes the resulting version.

Used in two places: applying a single edit during normal operation, and
replaying the whole manifest during recovery without building one
intermediate version per edit.
*/

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::config::MAX_NUM_LEVELS;
use crate::key::{InternalKey, InternalKeyComparator};

use super::file_metadata::FileMetadata;
use super::version::Version;
use super::version_edit::VersionEdit;

/// Per-level accumulated changes.
#[derive(Default)]
struct LevelState {
    deleted_files: HashSet<u64>,
    added_files: Vec<Arc<FileMetadata>>,
}

/// Builds a version from a base version plus a sequence of edits.
pub(crate) struct VersionBuilder {
    icmp: InternalKeyComparator,
    base: Arc<Version>,
    levels: Vec<LevelState>,
}

/// Crate-only methods
impl VersionBuilder {
    /// Create a builder over `base`.
    pub(crate) fn new(icmp: InternalKeyComparator, base: Arc<Version>) -> Self {
        let levels = (0..MAX_NUM_LEVELS).map(|_| LevelState::default()).collect();
        Self { icmp, base, levels }
    }

    /**
    Fold one edit into the builder.

    Compact pointers are applied straight to the caller's array since they
    live on the version set rather than on versions.
    */
    pub(crate) fn apply(
        &mut self,
        edit: &VersionEdit,
        compact_pointers: &mut [Option<InternalKey>],
    ) {
        for (level, pointer) in edit.compact_pointers.iter() {
            compact_pointers[*level] = Some(pointer.clone());
        }

        for (level, file_number) in edit.deleted_files.iter() {
            self.levels[*level].deleted_files.insert(*file_number);
        }

        for (level, file) in edit.new_files.iter() {
            // A file deleted and re-added within the accumulated edits is
            // live.
            self.levels[*level].deleted_files.remove(&file.file_number());
            self.levels[*level].added_files.push(Arc::clone(file));
        }
    }

    /// Materialize the accumulated state into `version`.
    pub(crate) fn save_to(&mut self, version: &mut Version) {
        for level in 0..MAX_NUM_LEVELS {
            let state = &self.levels[level];

            let mut merged: Vec<Arc<FileMetadata>> = self
                .base
                .files(level)
                .iter()
                .chain(state.added_files.iter())
                .filter(|file| !state.deleted_files.contains(&file.file_number()))
                .cloned()
                .collect();
            merged.sort_by(|a, b| {
                match self
                    .icmp
                    .compare(a.smallest().as_bytes(), b.smallest().as_bytes())
                {
                    Ordering::Equal => a.file_number().cmp(&b.file_number()),
                    key_order => key_order,
                }
            });

            // Levels past zero must stay pairwise disjoint.
            debug_assert!(
                level == 0
                    || merged.windows(2).all(|pair| {
                        self.icmp
                            .compare(pair[0].largest().as_bytes(), pair[1].smallest().as_bytes())
                            == Ordering::Less
                    }),
                "Overlapping files produced for level {level}."
            );

            version.set_files(level, merged);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::comparator::BytewiseComparator;
    use crate::fs::InMemoryFileSystem;
    use crate::key::Operation;
    use crate::options::DbOptions;
    use crate::table_cache::TableCache;

    use super::*;

    fn file(number: u64, smallest: &[u8], largest: &[u8]) -> Arc<FileMetadata> {
        Arc::new(FileMetadata::new(
            number,
            1024,
            InternalKey::new(smallest, 100, Operation::Put),
            InternalKey::new(largest, 1, Operation::Put),
        ))
    }

    fn empty_version() -> (Arc<Version>, InternalKeyComparator, DbOptions, Arc<TableCache>) {
        let options = DbOptions::with_filesystem(Arc::new(InMemoryFileSystem::new()));
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        let table_cache = Arc::new(TableCache::new("/db", options.clone()));
        let version = Arc::new(Version::new(
            options.clone(),
            icmp.clone(),
            Arc::clone(&table_cache),
        ));
        (version, icmp, options, table_cache)
    }

    #[test]
    fn added_files_land_sorted_and_deleted_files_disappear() {
        let (base, icmp, options, table_cache) = empty_version();

        let mut first_edit = VersionEdit::new();
        first_edit.add_file(1, file(10, b"m", b"p"));
        first_edit.add_file(1, file(11, b"a", b"c"));
        let mut second_edit = VersionEdit::new();
        second_edit.remove_file(1, 10);
        second_edit.add_file(1, file(12, b"q", b"z"));

        let mut pointers: Vec<Option<InternalKey>> = vec![None; MAX_NUM_LEVELS];
        let mut builder = VersionBuilder::new(icmp.clone(), base);
        builder.apply(&first_edit, &mut pointers);
        builder.apply(&second_edit, &mut pointers);

        let mut version = Version::new(options, icmp, table_cache);
        builder.save_to(&mut version);

        let level1: Vec<u64> = version
            .files(1)
            .iter()
            .map(|file| file.file_number())
            .collect();
        assert_eq!(level1, vec![11, 12]);
    }

    #[test]
    fn compact_pointers_flow_through_to_the_callers_array() {
        let (base, icmp, _, _) = empty_version();

        let mut edit = VersionEdit::new();
        edit.compact_pointers
            .push((4, InternalKey::new(b"resume-here", 7, Operation::Put)));

        let mut pointers: Vec<Option<InternalKey>> = vec![None; MAX_NUM_LEVELS];
        VersionBuilder::new(icmp, base).apply(&edit, &mut pointers);

        assert!(pointers[4].is_some());
        assert_eq!(pointers[4].as_ref().unwrap().user_key(), b"resume-here");
    }
}
