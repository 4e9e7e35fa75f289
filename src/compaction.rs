/*!
State for one compaction: the input files from level L and level L+1, the
"grandparent" files at level L+2 that bound output file sizes, and the
version edit being accumulated.
*/

use std::cmp::Ordering;
use std::sync::Arc;

use crate::comparator::Comparator;
use crate::config::MAX_NUM_LEVELS;
use crate::errors::StrataResult;
use crate::iterator::{MergingIterator, StorageIterator};
use crate::key::InternalKeyComparator;
use crate::options::{DbOptions, ReadOptions};
use crate::table_cache::TableCache;
use crate::versioning::file_metadata::FileMetadata;
use crate::versioning::version::{
    max_grandparent_overlap_bytes, total_file_size, LevelIterator, Version,
};
use crate::versioning::version_edit::VersionEdit;

/// Inputs may be grown up to this multiple of the target file size.
pub(crate) fn expanded_compaction_byte_size_limit(options: &DbOptions) -> u64 {
    25 * options.max_file_size as u64
}

/// A planned merge of level `level` into level `level + 1`.
pub(crate) struct Compaction {
    /// The level being compacted (inputs also come from `level + 1`).
    level: usize,

    /// Options for configuring the operation of the database.
    options: DbOptions,

    /// Orders internal keys across the inputs.
    icmp: InternalKeyComparator,

    /// The version the inputs were chosen from, pinned for the duration.
    input_version: Arc<Version>,

    /// The edit that will install this compaction's results.
    pub(crate) edit: VersionEdit,

    /// The input files: `inputs[0]` from `level`, `inputs[1]` from `level + 1`.
    inputs: [Vec<Arc<FileMetadata>>; 2],

    /// Files from `level + 2` overlapping the compaction's key range.
    grandparents: Vec<Arc<FileMetadata>>,

    /// Cursor into `grandparents` used by [`Compaction::should_stop_before`].
    grandparent_index: usize,

    /// Whether some output key has been seen since the last file roll.
    seen_key: bool,

    /// Grandparent bytes overlapped by the current output file so far.
    overlapped_bytes: u64,

    /**
    Per-level cursors for [`Compaction::is_base_level_for_key`]; monotone
    because compaction keys only grow.
    */
    level_pointers: [usize; MAX_NUM_LEVELS],
}

/// Crate-only methods
impl Compaction {
    pub(crate) fn new(options: DbOptions, level: usize, input_version: Arc<Version>) -> Self {
        let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));
        Self {
            level,
            options,
            icmp,
            input_version,
            edit: VersionEdit::new(),
            inputs: [vec![], vec![]],
            grandparents: vec![],
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_pointers: [0; MAX_NUM_LEVELS],
        }
    }

    /// The level being compacted.
    pub(crate) fn level(&self) -> usize {
        self.level
    }

    /// The version the inputs belong to.
    pub(crate) fn input_version(&self) -> &Arc<Version> {
        &self.input_version
    }

    /// The input files of `which` side (0 = level, 1 = level + 1).
    pub(crate) fn inputs(&self, which: usize) -> &[Arc<FileMetadata>] {
        &self.inputs[which]
    }

    /// Mutable access for the picker while assembling inputs.
    pub(crate) fn inputs_mut(&mut self, which: usize) -> &mut Vec<Arc<FileMetadata>> {
        &mut self.inputs[which]
    }

    /// Install the grandparent file list.
    pub(crate) fn set_grandparents(&mut self, grandparents: Vec<Arc<FileMetadata>>) {
        self.grandparents = grandparents;
    }

    /// The number of input files on `which` side.
    pub(crate) fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    /// The byte ceiling for one output file of this compaction.
    pub(crate) fn max_output_file_size(&self) -> u64 {
        self.options.max_file_size as u64
    }

    /**
    Whether the compaction can be performed by moving a single input file
    down a level, with no merge at all.

    Disallowed when the file drags a large grandparent overlap with it,
    which would later force an expensive merge at `level + 2`.
    */
    pub(crate) fn is_trivial_move(&self) -> bool {
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && total_file_size(&self.grandparents)
                <= max_grandparent_overlap_bytes(&self.options)
    }

    /// Mark every input file as deleted in the pending edit.
    pub(crate) fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for file in self.inputs[which].iter() {
                self.edit.remove_file(self.level + which, file.file_number());
            }
        }
    }

    /**
    Whether `user_key` cannot exist in any level deeper than the
    compaction's output level.

    When true, a tombstone for the key may be dropped once no snapshot can
    observe older entries.
    */
    pub(crate) fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let user_comparator = self.icmp.user_comparator();
        for level in (self.level + 2)..MAX_NUM_LEVELS {
            let files = self.input_version.files(level);
            while self.level_pointers[level] < files.len() {
                let file = &files[self.level_pointers[level]];
                if user_comparator.compare(user_key, file.largest().user_key())
                    != Ordering::Greater
                {
                    if user_comparator.compare(user_key, file.smallest().user_key())
                        != Ordering::Less
                    {
                        // The key falls inside this file's range.
                        return false;
                    }
                    break;
                }
                self.level_pointers[level] += 1;
            }
        }

        true
    }

    /**
    Whether the current output file should be closed before writing
    `internal_key`.

    Bounds how much of level `level + 2` any single output file overlaps,
    so compacting that output later stays affordable.
    */
    pub(crate) fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && self.icmp.compare(
                internal_key,
                self.grandparents[self.grandparent_index].largest().as_bytes(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes +=
                    self.grandparents[self.grandparent_index].file_size();
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > max_grandparent_overlap_bytes(&self.options) {
            self.overlapped_bytes = 0;
            return true;
        }

        false
    }

    /**
    A merging iterator over every input file.

    Level-0 inputs each get their own table iterator; the sorted sides use
    lazy per-level iterators.
    */
    pub(crate) fn make_input_iterator(
        &self,
        table_cache: &Arc<TableCache>,
    ) -> StrataResult<MergingIterator> {
        // Compaction reads are one-shot; do not displace the read path's
        // cached blocks.
        let read_options = ReadOptions {
            verify_checksums: self.options.paranoid_checks,
            fill_cache: false,
            snapshot: None,
        };

        let mut children: Vec<Box<dyn StorageIterator>> = vec![];
        for which in 0..2 {
            if self.inputs[which].is_empty() {
                continue;
            }
            if self.level + which == 0 {
                for file in self.inputs[which].iter() {
                    children.push(table_cache.iter_table(
                        read_options.clone(),
                        file.file_number(),
                        file.file_size(),
                    )?);
                }
            } else {
                children.push(Box::new(LevelIterator::new(
                    Arc::clone(table_cache),
                    self.icmp.clone(),
                    read_options.clone(),
                    self.inputs[which].clone(),
                )));
            }
        }

        Ok(MergingIterator::new(self.icmp.clone(), children))
    }

    /// A one-line description for the log.
    pub(crate) fn describe(&self) -> String {
        format!(
            "compaction of {} files from level {} with {} files from level {}",
            self.num_input_files(0),
            self.level,
            self.num_input_files(1),
            self.level + 1
        )
    }
}
