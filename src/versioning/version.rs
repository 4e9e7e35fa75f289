/*!
A version is an immutable snapshot of the table files at every level.

Reads resolve against a version: level 0 files may overlap and are searched
newest first, while every deeper level is fully sorted and disjoint so a
binary search finds the single candidate file. Versions also accumulate the
read statistics (seek charges) that drive seek-triggered compactions.
*/

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::comparator::Comparator;
use crate::config::{MAX_MEM_COMPACT_LEVEL, MAX_NUM_LEVELS};
use crate::errors::StrataResult;
use crate::iterator::StorageIterator;
use crate::key::{
    parse_internal_key, InternalKey, InternalKeyComparator, LookupKey, Operation,
    MAX_SEQUENCE_NUMBER, SEEK_OPERATION,
};
use crate::memtable::EntryValue;
use crate::options::{DbOptions, ReadOptions};
use crate::table_cache::TableCache;

use super::file_metadata::FileMetadata;

/// The file (and its level) a read seeked through without a result.
#[derive(Clone, Debug)]
pub(crate) struct SeekStats {
    pub(crate) file: Arc<FileMetadata>,
    pub(crate) level: usize,
}

/// The summed size of a set of files.
pub(crate) fn total_file_size(files: &[Arc<FileMetadata>]) -> u64 {
    files.iter().map(|file| file.file_size()).sum()
}

/**
The index of the first file in the (sorted, disjoint) list whose largest
key is at or after `internal_key`; `files.len()` if there is none.
*/
pub(crate) fn find_file(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetadata>],
    internal_key: &[u8],
) -> usize {
    let mut left = 0usize;
    let mut right = files.len();
    while left < right {
        let mid = (left + right) / 2;
        if icmp.compare(files[mid].largest().as_bytes(), internal_key) == Ordering::Less {
            left = mid + 1;
        } else {
            right = mid;
        }
    }

    left
}

/// An immutable snapshot of the database's table files.
pub(crate) struct Version {
    /// Options for configuring the operation of the database.
    options: DbOptions,

    /// Orders the internal keys in the files.
    icmp: InternalKeyComparator,

    /// Shared cache of open table handles.
    table_cache: Arc<TableCache>,

    /**
    The files at each level.

    Level 0 is ordered newest file first; deeper levels are sorted by
    smallest key and pairwise disjoint.
    */
    files: Vec<Vec<Arc<FileMetadata>>>,

    /// The level the next size-triggered compaction should work on.
    pub(crate) compaction_level: usize,

    /**
    How urgently that level needs compacting; at or above 1.0 a compaction
    is due.
    */
    pub(crate) compaction_score: f64,

    /// A file that exhausted its seek allowance, with its level.
    seek_compaction: Mutex<Option<SeekStats>>,
}

/// Crate-only methods
impl Version {
    /// Create an empty version.
    pub(crate) fn new(
        options: DbOptions,
        icmp: InternalKeyComparator,
        table_cache: Arc<TableCache>,
    ) -> Self {
        Self {
            options,
            icmp,
            table_cache,
            files: vec![vec![]; MAX_NUM_LEVELS],
            compaction_level: 0,
            compaction_score: -1.0,
            seek_compaction: Mutex::new(None),
        }
    }

    /// The files at `level`.
    pub(crate) fn files(&self, level: usize) -> &[Arc<FileMetadata>] {
        &self.files[level]
    }

    /// Install the file list for `level`. Only used while building a version.
    pub(crate) fn set_files(&mut self, level: usize, files: Vec<Arc<FileMetadata>>) {
        self.files[level] = files;
    }

    /// The number of files at `level`.
    pub(crate) fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    /// The summed file size of `level`.
    pub(crate) fn level_bytes(&self, level: usize) -> u64 {
        total_file_size(&self.files[level])
    }

    /// The file flagged by seek statistics as due for compaction, if any.
    pub(crate) fn seek_compaction_target(&self) -> Option<SeekStats> {
        self.seek_compaction.lock().clone()
    }

    /**
    Look up the lookup key's user key, newest layer first.

    Returns the lookup outcome and, when the read had to traverse more
    than one file, the seek statistics the caller should apply under the
    database mutex.
    */
    pub(crate) fn get(
        &self,
        read_options: &ReadOptions,
        lookup_key: &LookupKey,
    ) -> StrataResult<(Option<EntryValue>, Option<SeekStats>)> {
        let internal_key = lookup_key.internal_key();
        let user_key = lookup_key.user_key();
        let user_comparator = self.icmp.user_comparator();

        let mut stats: Option<SeekStats> = None;
        let mut last_file_read: Option<SeekStats> = None;

        for (level, file) in self.candidate_files(internal_key, user_key) {
            if stats.is_none() && last_file_read.is_some() {
                // This read is traversing a second file; the fruitless
                // seek through the first one gets charged.
                stats = last_file_read.take();
            }
            last_file_read = Some(SeekStats {
                file: Arc::clone(&file),
                level,
            });

            let found = self.table_cache.get(
                read_options,
                file.file_number(),
                file.file_size(),
                internal_key,
            )?;
            if let Some((found_key, value)) = found {
                match parse_internal_key(&found_key) {
                    Some((found_user_key, _, operation))
                        if user_comparator.compare(found_user_key, user_key)
                            == Ordering::Equal =>
                    {
                        let outcome = match operation {
                            Operation::Put => EntryValue::Present(value),
                            Operation::Delete => EntryValue::Deleted,
                        };
                        return Ok((Some(outcome), stats));
                    }
                    Some(_) => {
                        // The nearest entry belongs to a different user
                        // key; keep searching older files.
                    }
                    None => {
                        return Err(crate::errors::StrataError::Corruption(
                            "Unparseable internal key in a table file.".to_string(),
                        ));
                    }
                }
            }
        }

        Ok((None, stats))
    }

    /**
    Apply seek statistics from a read.

    Returns true if the charged file just exhausted its allowance and a
    compaction should be scheduled. Must be called under the DB mutex.
    */
    pub(crate) fn update_stats(&self, stats: SeekStats) -> bool {
        if stats.file.consume_seek() <= 0 {
            let mut seek_compaction = self.seek_compaction.lock();
            if seek_compaction.is_none() {
                log::debug!(
                    "Table file {file_number} exhausted its seek allowance; flagging for \
                    compaction from level {level}.",
                    file_number = stats.file.file_number(),
                    level = stats.level
                );
                *seek_compaction = Some(stats);
                return true;
            }
        }

        false
    }

    /**
    Feed an iterator's sampled internal key into the seek statistics.

    Returns seek stats to apply when the sampled key's range spans more
    than one file (the same situation a point read would be charged for).
    */
    pub(crate) fn record_read_sample(&self, internal_key: &[u8]) -> Option<SeekStats> {
        let user_key = match parse_internal_key(internal_key) {
            Some((user_key, _, _)) => user_key,
            None => return None,
        };

        let mut first_match: Option<SeekStats> = None;
        let mut matches = 0;
        for (level, file) in self.candidate_files(internal_key, user_key) {
            matches += 1;
            if matches == 1 {
                first_match = Some(SeekStats { file, level });
            } else {
                // Two or more files cover this key; charging the first is
                // enough to eventually trigger a compaction.
                return first_match;
            }
        }

        None
    }

    /// Whether any file at `level` overlaps the user-key range.
    pub(crate) fn overlap_in_level(
        &self,
        level: usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> bool {
        let user_comparator = self.icmp.user_comparator();
        let files = &self.files[level];

        if level == 0 {
            // Level-0 files are unordered and may mutually overlap; check
            // each one.
            return files.iter().any(|file| {
                !before_file(user_comparator.as_ref(), largest_user_key, file)
                    && !after_file(user_comparator.as_ref(), smallest_user_key, file)
            });
        }

        // Binary search for the earliest file ending at or after the range
        // start.
        let index = match smallest_user_key {
            Some(user_key) => {
                let probe = InternalKey::new(user_key, MAX_SEQUENCE_NUMBER, SEEK_OPERATION);
                find_file(&self.icmp, files, probe.as_bytes())
            }
            None => 0,
        };
        if index >= files.len() {
            return false;
        }

        !before_file(user_comparator.as_ref(), largest_user_key, &files[index])
    }

    /**
    The level a flushed memtable spanning the given user-key range should
    be placed at.

    Level 0 whenever the range overlaps level 0; otherwise the output is
    pushed down while the next level stays clear and the grandparent
    overlap stays bounded, up to [`MAX_MEM_COMPACT_LEVEL`].
    */
    pub(crate) fn pick_level_for_memtable_output(
        &self,
        smallest_user_key: &[u8],
        largest_user_key: &[u8],
    ) -> usize {
        let mut level = 0;
        if self.overlap_in_level(0, Some(smallest_user_key), Some(largest_user_key)) {
            return level;
        }

        let start = InternalKey::new(smallest_user_key, MAX_SEQUENCE_NUMBER, SEEK_OPERATION);
        let limit = InternalKey::new(largest_user_key, 0, Operation::Delete);
        while level < MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(level + 1, Some(smallest_user_key), Some(largest_user_key))
            {
                break;
            }
            if level + 2 < MAX_NUM_LEVELS {
                let grandparents =
                    self.get_overlapping_inputs(level + 2, Some(&start), Some(&limit));
                if total_file_size(&grandparents)
                    > max_grandparent_overlap_bytes(&self.options)
                {
                    break;
                }
            }
            level += 1;
        }

        level
    }

    /**
    All files at `level` whose user-key ranges intersect `[begin, end]`
    (either bound may be absent, meaning unbounded).

    For level 0, where files overlap each other, the range is expanded
    until it is closed under overlap, matching what a compaction of those
    files must consume.
    */
    pub(crate) fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetadata>> {
        let user_comparator = self.icmp.user_comparator();
        let mut user_begin = begin.map(|key| key.user_key().to_vec());
        let mut user_end = end.map(|key| key.user_key().to_vec());

        let mut inputs: Vec<Arc<FileMetadata>> = vec![];
        let mut index = 0;
        while index < self.files[level].len() {
            let file = &self.files[level][index];
            index += 1;

            let file_start = file.smallest().user_key();
            let file_limit = file.largest().user_key();
            let ends_before = user_begin.as_ref().map_or(false, |begin_key| {
                user_comparator.compare(file_limit, begin_key) == Ordering::Less
            });
            let starts_after = user_end.as_ref().map_or(false, |end_key| {
                user_comparator.compare(file_start, end_key) == Ordering::Greater
            });
            if ends_before || starts_after {
                continue;
            }

            inputs.push(Arc::clone(file));
            if level == 0 {
                // Level-0 files may overlap each other: widen the range to
                // this file's bounds and restart so every transitive
                // overlap is included.
                let widened_start = user_begin.as_ref().map_or(false, |begin_key| {
                    user_comparator.compare(file_start, begin_key) == Ordering::Less
                });
                let widened_end = user_end.as_ref().map_or(false, |end_key| {
                    user_comparator.compare(file_limit, end_key) == Ordering::Greater
                });
                if widened_start {
                    user_begin = Some(file_start.to_vec());
                }
                if widened_end {
                    user_end = Some(file_limit.to_vec());
                }
                if widened_start || widened_end {
                    inputs.clear();
                    index = 0;
                }
            }
        }

        inputs
    }

    /// Iterators over every file of this version, for the database iterator.
    pub(crate) fn iterators(
        &self,
        read_options: &ReadOptions,
    ) -> StrataResult<Vec<Box<dyn StorageIterator>>> {
        let mut iterators: Vec<Box<dyn StorageIterator>> = vec![];

        // Level-0 files can overlap, so each gets its own full iterator.
        for file in self.files[0].iter() {
            iterators.push(self.table_cache.iter_table(
                read_options.clone(),
                file.file_number(),
                file.file_size(),
            )?);
        }

        // Deeper levels are disjoint and sorted: one lazy two-level
        // iterator per level avoids opening every file up front.
        for level in 1..MAX_NUM_LEVELS {
            if !self.files[level].is_empty() {
                iterators.push(Box::new(LevelIterator::new(
                    Arc::clone(&self.table_cache),
                    self.icmp.clone(),
                    read_options.clone(),
                    self.files[level].clone(),
                )));
            }
        }

        Ok(iterators)
    }

    /// A human-readable per-level file count summary, e.g. `files[ 2 4 0 0 0 0 0 ]`.
    pub(crate) fn level_summary(&self) -> String {
        let counts: Vec<String> = self
            .files
            .iter()
            .map(|level_files| level_files.len().to_string())
            .collect();

        format!("files[ {} ]", counts.join(" "))
    }
}

/// Private methods
impl Version {
    /**
    The files a lookup for `internal_key` must consult, in search order:
    overlapping level-0 files newest first, then the single candidate per
    deeper level.
    */
    fn candidate_files(
        &self,
        internal_key: &[u8],
        user_key: &[u8],
    ) -> Vec<(usize, Arc<FileMetadata>)> {
        let user_comparator = self.icmp.user_comparator();
        let mut candidates: Vec<(usize, Arc<FileMetadata>)> = vec![];

        let mut level0: Vec<&Arc<FileMetadata>> = self.files[0]
            .iter()
            .filter(|file| {
                user_comparator.compare(user_key, file.smallest().user_key())
                    != Ordering::Less
                    && user_comparator.compare(user_key, file.largest().user_key())
                        != Ordering::Greater
            })
            .collect();
        level0.sort_by(|a, b| b.file_number().cmp(&a.file_number()));
        candidates.extend(level0.into_iter().map(|file| (0, Arc::clone(file))));

        for level in 1..MAX_NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }

            let index = find_file(&self.icmp, files, internal_key);
            if index < files.len() {
                let file = &files[index];
                if user_comparator.compare(user_key, file.smallest().user_key())
                    != Ordering::Less
                {
                    candidates.push((level, Arc::clone(file)));
                }
            }
        }

        candidates
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Version")
            .field("levels", &self.level_summary())
            .field("compaction_level", &self.compaction_level)
            .field("compaction_score", &self.compaction_score)
            .finish()
    }
}

/// Whether the whole file lies after `largest_user_key`.
fn before_file(
    user_comparator: &dyn Comparator,
    largest_user_key: Option<&[u8]>,
    file: &FileMetadata,
) -> bool {
    largest_user_key.map_or(false, |user_key| {
        user_comparator.compare(user_key, file.smallest().user_key()) == Ordering::Less
    })
}

/// Whether the whole file lies before `smallest_user_key`.
fn after_file(
    user_comparator: &dyn Comparator,
    smallest_user_key: Option<&[u8]>,
    file: &FileMetadata,
) -> bool {
    smallest_user_key.map_or(false, |user_key| {
        user_comparator.compare(user_key, file.largest().user_key()) == Ordering::Greater
    })
}

/// The most overlap a level-(L+2) ("grandparent") range may have before
/// output files are cut or a memtable stops being pushed down.
pub(crate) fn max_grandparent_overlap_bytes(options: &DbOptions) -> u64 {
    10 * options.max_file_size as u64
}

/**
A cursor over one fully sorted, disjoint level: an implicit index over the
file list with a lazily opened table iterator under it.
*/
pub(crate) struct LevelIterator {
    table_cache: Arc<TableCache>,
    icmp: InternalKeyComparator,
    read_options: ReadOptions,
    files: Vec<Arc<FileMetadata>>,

    /// Index of the file the cursor is in; `files.len()` means unpositioned.
    file_index: usize,

    /// Iterator over the current file's table.
    data_iter: Option<Box<dyn StorageIterator>>,

    /// The first table-open error encountered.
    error: Option<crate::errors::StrataError>,
}

/// Crate-only methods
impl LevelIterator {
    pub(crate) fn new(
        table_cache: Arc<TableCache>,
        icmp: InternalKeyComparator,
        read_options: ReadOptions,
        files: Vec<Arc<FileMetadata>>,
    ) -> Self {
        let file_index = files.len();
        Self {
            table_cache,
            icmp,
            read_options,
            files,
            file_index,
            data_iter: None,
            error: None,
        }
    }
}

/// Private methods
impl LevelIterator {
    fn open_current_file(&mut self) {
        if self.file_index >= self.files.len() {
            self.data_iter = None;
            return;
        }

        let file = &self.files[self.file_index];
        match self.table_cache.iter_table(
            self.read_options.clone(),
            file.file_number(),
            file.file_size(),
        ) {
            Ok(iter) => self.data_iter = Some(iter),
            Err(error) => {
                if self.error.is_none() {
                    self.error = Some(error);
                }
                self.data_iter = None;
            }
        }
    }

    fn skip_forward(&mut self) {
        while self
            .data_iter
            .as_ref()
            .map_or(true, |data_iter| !data_iter.valid())
        {
            if self.file_index + 1 >= self.files.len() {
                self.file_index = self.files.len();
                self.data_iter = None;
                return;
            }
            self.file_index += 1;
            self.open_current_file();
            if let Some(data_iter) = self.data_iter.as_mut() {
                data_iter.seek_to_first();
            }
        }
    }

    fn skip_backward(&mut self) {
        while self
            .data_iter
            .as_ref()
            .map_or(true, |data_iter| !data_iter.valid())
        {
            if self.file_index == 0 {
                self.file_index = self.files.len();
                self.data_iter = None;
                return;
            }
            self.file_index -= 1;
            self.open_current_file();
            if let Some(data_iter) = self.data_iter.as_mut() {
                data_iter.seek_to_last();
            }
        }
    }
}

impl StorageIterator for LevelIterator {
    fn valid(&self) -> bool {
        self.data_iter
            .as_ref()
            .map_or(false, |data_iter| data_iter.valid())
    }

    fn seek_to_first(&mut self) {
        if self.files.is_empty() {
            return;
        }
        self.file_index = 0;
        self.open_current_file();
        if let Some(data_iter) = self.data_iter.as_mut() {
            data_iter.seek_to_first();
        }
        self.skip_forward();
    }

    fn seek_to_last(&mut self) {
        if self.files.is_empty() {
            return;
        }
        self.file_index = self.files.len() - 1;
        self.open_current_file();
        if let Some(data_iter) = self.data_iter.as_mut() {
            data_iter.seek_to_last();
        }
        self.skip_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.file_index = find_file(&self.icmp, &self.files, target);
        if self.file_index >= self.files.len() {
            self.data_iter = None;
            return;
        }
        self.open_current_file();
        if let Some(data_iter) = self.data_iter.as_mut() {
            data_iter.seek(target);
        }
        self.skip_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().unwrap().next();
        self.skip_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().unwrap().prev();
        self.skip_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().unwrap().value()
    }

    fn status(&self) -> StrataResult<()> {
        if let Some(error) = self.error.as_ref() {
            return Err(error.clone());
        }
        if let Some(data_iter) = self.data_iter.as_ref() {
            data_iter.status()?;
        }

        Ok(())
    }
}
