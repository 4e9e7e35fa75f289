/*!
The version set owns the current [`Version`], persists transitions to the
manifest, and picks compactions.

The manifest is a log-format file whose records are serialized
[`VersionEdit`]s; `CURRENT` names the active manifest and is replaced
atomically via a temp-file rename. Recovery replays the manifest into a
builder to reconstruct the newest version.
*/

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::compaction::{expanded_compaction_byte_size_limit, Compaction};
use crate::comparator::Comparator;
use crate::config::{L0_COMPACTION_TRIGGER, MAX_NUM_LEVELS};
use crate::db::GuardedDbFields;
use crate::errors::{StrataError, StrataResult};
use crate::file_names::FileNameHandler;
use crate::fs::FileSystem;
use crate::key::{InternalKey, InternalKeyComparator};
use crate::logs::{CorruptionReporter, LogReader, LogWriter};
use crate::options::DbOptions;
use crate::table_cache::TableCache;

use super::file_metadata::FileMetadata;
use super::version::{total_file_size, SeekStats, Version};
use super::version_builder::VersionBuilder;
use super::version_edit::VersionEdit;

/// Manifests below this size may be reused across restarts with `reuse_logs`.
const MANIFEST_REUSE_SIZE_LIMIT_BYTES: u64 = 1024 * 1024;

/// The total-byte budget of `level`; beyond it the level needs compaction.
pub(crate) fn max_bytes_for_level(level: usize) -> f64 {
    // 10 MiB at level 1, a factor of ten per level after that. Level 0 is
    // scored by file count instead, since its files overlap.
    let mut result: f64 = 10.0 * 1024.0 * 1024.0;
    let mut level = level;
    while level > 1 {
        result *= 10.0;
        level -= 1;
    }

    result
}

/// Manages the versions of the database.
pub(crate) struct VersionSet {
    /// Options for configuring the operation of the database.
    options: DbOptions,

    /// Orders internal keys.
    icmp: InternalKeyComparator,

    /// The file system in use by the database.
    fs: Arc<dyn FileSystem>,

    /// Handler for the database's file names.
    file_name_handler: FileNameHandler,

    /// Shared cache of open table handles.
    table_cache: Arc<TableCache>,

    /// The next file number to hand out.
    next_file_number: u64,

    /// The file number of the active manifest.
    manifest_file_number: u64,

    /// The most recently assigned sequence number.
    last_sequence: u64,

    /// The file number of the active write-ahead log.
    log_number: u64,

    /**
    The file number of the previous write-ahead log, while its memtable is
    still being flushed. Zero when there is none.
    */
    prev_log_number: u64,

    /**
    The active manifest writer.

    Wrapped so the database mutex can be dropped while a record is being
    appended and synced.
    */
    descriptor_log: Option<Arc<Mutex<LogWriter>>>,

    /// The most recent version.
    current: Arc<Version>,

    /**
    Weak handles to every version handed out. Strong references are held
    by `current`, in-flight iterators, and compactions; dead entries are
    pruned opportunistically.
    */
    live_versions: Vec<Weak<Version>>,

    /// Per-level keys at which the next compaction of that level should begin.
    compact_pointers: Vec<Option<InternalKey>>,
}

/// Crate-only methods
impl VersionSet {
    /// Create a new instance of [`VersionSet`].
    pub(crate) fn new(db_path: &str, options: DbOptions, table_cache: Arc<TableCache>) -> Self {
        let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));
        let fs = Arc::clone(&options.filesystem_provider);
        let current = Arc::new(Version::new(
            options.clone(),
            icmp.clone(),
            Arc::clone(&table_cache),
        ));

        Self {
            file_name_handler: FileNameHandler::new(db_path),
            fs,
            icmp,
            table_cache,
            options,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            descriptor_log: None,
            live_versions: vec![Arc::downgrade(&current)],
            current,
            compact_pointers: vec![None; MAX_NUM_LEVELS],
        }
    }

    /// The most recent version.
    pub(crate) fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    /// The most recently assigned sequence number.
    pub(crate) fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Record that sequence numbers up to `sequence` have been assigned.
    pub(crate) fn set_last_sequence(&mut self, sequence: u64) {
        debug_assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    /// Allocate and return a new file number.
    pub(crate) fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /**
    Return an unused file number so the space is not burned.

    Only valid for the most recently allocated number.
    */
    pub(crate) fn reuse_file_number(&mut self, file_number: u64) {
        if self.next_file_number == file_number + 1 {
            self.next_file_number = file_number;
        }
    }

    /// Record that `file_number` is in use.
    pub(crate) fn mark_file_number_used(&mut self, file_number: u64) {
        if self.next_file_number <= file_number {
            self.next_file_number = file_number + 1;
        }
    }

    /// The file number of the active write-ahead log.
    pub(crate) fn log_number(&self) -> u64 {
        self.log_number
    }

    /// The WAL number of the memtable being flushed; zero when none.
    pub(crate) fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    /// The file number of the active manifest.
    pub(crate) fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    /// The number of files at `level` in the current version.
    pub(crate) fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    /// The total bytes at `level` in the current version.
    pub(crate) fn num_level_bytes(&self, level: usize) -> u64 {
        self.current.level_bytes(level)
    }

    /// Whether the current version is due for a compaction.
    pub(crate) fn needs_compaction(&self) -> bool {
        self.current.compaction_score >= 1.0
            || self.current.seek_compaction_target().is_some()
    }

    /**
    The numbers of every file referenced by any live version.

    Covers versions still pinned by iterators or compactions, not just the
    current one.
    */
    pub(crate) fn live_files(&mut self) -> HashSet<u64> {
        let mut live = HashSet::new();

        self.live_versions.retain(|weak| match weak.upgrade() {
            Some(version) => {
                for level in 0..MAX_NUM_LEVELS {
                    for file in version.files(level) {
                        live.insert(file.file_number());
                    }
                }
                true
            }
            None => false,
        });

        live
    }

    /**
    Persist `edit` to the manifest and install the resulting version.

    Fills the edit's bookkeeping fields from the version set, builds the
    new version under the mutex, then releases the database mutex for the
    manifest append/sync (and the `CURRENT` switch when a fresh manifest
    was started). A failed manifest write leaves the old version current
    and removes the half-written manifest.
    */
    pub(crate) fn log_and_apply(
        guard: &mut MutexGuard<'_, GuardedDbFields>,
        mut edit: VersionEdit,
    ) -> StrataResult<()> {
        let vs = &mut guard.version_set;

        match edit.log_number {
            Some(log_number) => {
                debug_assert!(log_number >= vs.log_number && log_number < vs.next_file_number)
            }
            None => edit.log_number = Some(vs.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.prev_log_number = Some(vs.prev_log_number);
        }
        edit.next_file_number = Some(vs.next_file_number);
        edit.last_sequence = Some(vs.last_sequence);

        // Build the successor version under the mutex.
        let mut new_version = Version::new(
            vs.options.clone(),
            vs.icmp.clone(),
            Arc::clone(&vs.table_cache),
        );
        {
            let mut builder = VersionBuilder::new(vs.icmp.clone(), vs.current());
            builder.apply(&edit, &mut vs.compact_pointers);
            builder.save_to(&mut new_version);
        }
        vs.finalize(&mut new_version);

        // Start a fresh manifest if none is open (first edit after open).
        let mut created_manifest = false;
        if vs.descriptor_log.is_none() {
            let manifest_path = vs.file_name_handler.manifest_path(vs.manifest_file_number);
            log::info!("Creating a new manifest at {manifest_path:?}.");
            let file = vs.fs.create_file(&manifest_path, false)?;
            let mut writer = LogWriter::new(file, 0);
            vs.write_snapshot(&mut writer)?;
            vs.descriptor_log = Some(Arc::new(Mutex::new(writer)));
            created_manifest = true;
        }

        let record = edit.encode();
        let manifest = Arc::clone(vs.descriptor_log.as_ref().unwrap());
        let manifest_number = vs.manifest_file_number;
        let fs = Arc::clone(&vs.fs);
        let file_name_handler = vs.file_name_handler.clone();

        // The manifest I/O happens with the database mutex released.
        let write_result: StrataResult<()> = MutexGuard::unlocked(guard, || {
            let mut writer = manifest.lock();
            writer.add_record(&record)?;
            writer.sync()?;
            if created_manifest {
                set_current_file(fs.as_ref(), &file_name_handler, manifest_number)?;
            }
            Ok(())
        });

        let vs = &mut guard.version_set;
        match write_result {
            Ok(()) => {
                vs.install_version(new_version);
                vs.log_number = edit.log_number.unwrap();
                vs.prev_log_number = edit.prev_log_number.unwrap();
                Ok(())
            }
            Err(error) => {
                log::error!("Failed to write a manifest record: {error}.");
                if created_manifest {
                    vs.descriptor_log = None;
                    let manifest_path = vs.file_name_handler.manifest_path(manifest_number);
                    if let Err(remove_error) = vs.fs.remove_file(&manifest_path) {
                        log::warn!(
                            "Could not remove the failed manifest {manifest_path:?}: \
                            {remove_error}."
                        );
                    }
                }
                Err(error)
            }
        }
    }

    /**
    Rebuild state from the manifest named by `CURRENT`.

    Returns whether a new manifest should be written (via a subsequent
    [`VersionSet::log_and_apply`]) rather than appending to the recovered
    one.
    */
    pub(crate) fn recover(&mut self) -> StrataResult<bool> {
        let current_path = self.file_name_handler.current_path();
        let current_contents = read_whole_file(self.fs.as_ref(), &current_path)?;
        let current_contents = String::from_utf8(current_contents).map_err(|_| {
            StrataError::Corruption("CURRENT does not hold a file name.".to_string())
        })?;
        if !current_contents.ends_with('\n') {
            return Err(StrataError::Corruption(
                "CURRENT file does not end with a newline.".to_string(),
            ));
        }
        let manifest_name = current_contents.trim_end();
        let manifest_path = self.file_name_handler.db_path().join(manifest_name);
        log::info!("Recovering versions from manifest {manifest_path:?}.");

        let manifest_file = self.fs.open_file(&manifest_path).map_err(|err| {
            StrataError::Corruption(format!(
                "CURRENT points to a missing manifest ({manifest_name}): {err}."
            ))
        })?;

        struct Reporter {
            error: Arc<Mutex<Option<String>>>,
        }
        impl CorruptionReporter for Reporter {
            fn corruption(&mut self, bytes_dropped: usize, reason: &str) {
                let mut slot = self.error.lock();
                if slot.is_none() {
                    *slot = Some(format!("{reason} ({bytes_dropped} bytes dropped)"));
                }
            }
        }
        let reader_error = Arc::new(Mutex::new(None));
        let mut reader = LogReader::new(
            manifest_file,
            Some(Box::new(Reporter {
                error: Arc::clone(&reader_error),
            })),
            true,
            0,
        );

        let mut builder = VersionBuilder::new(self.icmp.clone(), self.current());
        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        while let Some(record) = reader.read_record().map_err(StrataError::from)? {
            let edit = VersionEdit::decode(&record)?;

            if let Some(comparator_name) = edit.comparator_name.as_ref() {
                if comparator_name != self.options.comparator.name() {
                    return Err(StrataError::InvalidArgument(format!(
                        "The database was created with comparator {comparator_name} but was \
                        opened with {}.",
                        self.options.comparator.name()
                    )));
                }
            }

            builder.apply(&edit, &mut self.compact_pointers);
            log_number = edit.log_number.or(log_number);
            prev_log_number = edit.prev_log_number.or(prev_log_number);
            next_file_number = edit.next_file_number.or(next_file_number);
            last_sequence = edit.last_sequence.or(last_sequence);
        }

        if let Some(reason) = reader_error.lock().take() {
            if self.options.paranoid_checks {
                return Err(StrataError::Corruption(format!(
                    "Corruption in the manifest: {reason}."
                )));
            }
            log::warn!("Tolerating manifest corruption: {reason}.");
        }

        let next_file_number = next_file_number.ok_or_else(|| {
            StrataError::Corruption("Manifest has no next-file-number entry.".to_string())
        })?;
        let log_number = log_number.ok_or_else(|| {
            StrataError::Corruption("Manifest has no log-number entry.".to_string())
        })?;
        let last_sequence = last_sequence.ok_or_else(|| {
            StrataError::Corruption("Manifest has no last-sequence entry.".to_string())
        })?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        let mut new_version = Version::new(
            self.options.clone(),
            self.icmp.clone(),
            Arc::clone(&self.table_cache),
        );
        builder.save_to(&mut new_version);
        self.finalize(&mut new_version);
        self.install_version(new_version);

        self.manifest_file_number = next_file_number;
        self.next_file_number = next_file_number + 1;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;
        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);

        // Optionally keep appending to the recovered manifest.
        if self.options.reuse_logs {
            if let Ok(size) = self.fs.file_size(&manifest_path) {
                if size < MANIFEST_REUSE_SIZE_LIMIT_BYTES {
                    if let Ok(file) = self.fs.create_file(&manifest_path, true) {
                        log::info!("Reusing the recovered manifest {manifest_path:?}.");
                        self.descriptor_log = Some(Arc::new(Mutex::new(LogWriter::new(
                            file, size,
                        ))));
                        // Keep writing under the recovered manifest's own
                        // number.
                        if let Ok(crate::file_names::ParsedFileType::ManifestFile(number)) =
                            FileNameHandler::parse_file_name(&manifest_path)
                        {
                            self.manifest_file_number = number;
                        }
                        return Ok(false);
                    }
                }
            }
        }

        Ok(true)
    }

    /**
    Pick the next compaction to run, preferring size-triggered compactions
    over seek-triggered ones. Returns `None` when nothing is due.
    */
    pub(crate) fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current();

        let mut compaction;
        let level;
        if current.compaction_score >= 1.0 {
            level = current.compaction_level;
            compaction = Compaction::new(self.options.clone(), level, Arc::clone(&current));

            // Resume after the key where the last compaction of this level
            // stopped, wrapping to the start when exhausted.
            let pointer = self.compact_pointers[level].as_ref();
            let resume_file = current.files(level).iter().find(|file| {
                pointer.map_or(true, |pointer_key| {
                    self.icmp
                        .compare(file.largest().as_bytes(), pointer_key.as_bytes())
                        == Ordering::Greater
                })
            });
            let chosen = resume_file.or_else(|| current.files(level).first())?;
            compaction.inputs_mut(0).push(Arc::clone(chosen));
        } else if let Some(SeekStats { file, level: seek_level }) =
            current.seek_compaction_target()
        {
            level = seek_level;
            compaction = Compaction::new(self.options.clone(), level, Arc::clone(&current));
            compaction.inputs_mut(0).push(file);
        } else {
            return None;
        }

        // Level-0 files overlap each other: the chosen file's range pulls
        // in every level-0 file it intersects.
        if level == 0 {
            let (smallest, largest) = key_range(&self.icmp, compaction.inputs(0));
            let overlapping =
                current.get_overlapping_inputs(0, Some(&smallest), Some(&largest));
            debug_assert!(!overlapping.is_empty());
            *compaction.inputs_mut(0) = overlapping;
        }

        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /**
    Build a compaction covering `[begin, end]` at `level`, for manual
    compactions. Returns `None` when nothing at the level overlaps.
    */
    pub(crate) fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = self.current();
        let mut inputs = current.get_overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Keep one manual pass bounded: past level 0, stop accumulating
        // inputs once a whole output file's worth is queued.
        if level > 0 {
            let limit = self.options.max_file_size as u64;
            let mut total = 0;
            let mut cutoff = inputs.len();
            for (index, file) in inputs.iter().enumerate() {
                total += file.file_size();
                if total >= limit {
                    cutoff = index + 1;
                    break;
                }
            }
            inputs.truncate(cutoff);
        }

        let mut compaction = Compaction::new(self.options.clone(), level, current);
        *compaction.inputs_mut(0) = inputs;
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /**
    The approximate byte offset of `internal_key` within `version`'s data,
    summing whole files before it and probing the file containing it.
    */
    pub(crate) fn approximate_offset_of(
        &self,
        version: &Arc<Version>,
        internal_key: &InternalKey,
    ) -> u64 {
        let mut offset = 0;
        for level in 0..MAX_NUM_LEVELS {
            for file in version.files(level) {
                if self
                    .icmp
                    .compare(file.largest().as_bytes(), internal_key.as_bytes())
                    != Ordering::Greater
                {
                    // The whole file is before the key.
                    offset += file.file_size();
                } else if self
                    .icmp
                    .compare(file.smallest().as_bytes(), internal_key.as_bytes())
                    == Ordering::Greater
                {
                    // The whole file is past the key; deeper files at a
                    // sorted level are too.
                    if level > 0 {
                        break;
                    }
                } else {
                    offset += self.table_cache.approximate_offset_of(
                        file.file_number(),
                        file.file_size(),
                        internal_key.as_bytes(),
                    );
                }
            }
        }

        offset
    }
}

/// Private methods
impl VersionSet {
    /// Make `version` current, keeping a weak handle for liveness queries.
    fn install_version(&mut self, version: Version) {
        let version = Arc::new(version);
        self.live_versions.push(Arc::downgrade(&version));
        self.current = version;
        self.live_versions
            .retain(|weak| weak.strong_count() > 0);
    }

    /// Compute the next size-triggered compaction for `version`.
    fn finalize(&self, version: &mut Version) {
        let mut best_level = 0;
        // Level 0 is scored by file count: with overlapping files every
        // read merges across all of them, so the count matters more than
        // the bytes (which a large write buffer can legitimately inflate).
        let mut best_score =
            version.num_files(0) as f64 / L0_COMPACTION_TRIGGER as f64;

        for level in 1..MAX_NUM_LEVELS - 1 {
            let score = version.level_bytes(level) as f64 / max_bytes_for_level(level);
            if score > best_score {
                best_level = level;
                best_score = score;
            }
        }

        version.compaction_level = best_level;
        version.compaction_score = best_score;
    }

    /// Write the full current state as one edit (the base of a new manifest).
    fn write_snapshot(&self, writer: &mut LogWriter) -> StrataResult<()> {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some(self.options.comparator.name().to_string());

        for (level, pointer) in self.compact_pointers.iter().enumerate() {
            if let Some(pointer_key) = pointer {
                edit.compact_pointers.push((level, pointer_key.clone()));
            }
        }
        for level in 0..MAX_NUM_LEVELS {
            for file in self.current.files(level) {
                edit.add_file(level, Arc::clone(file));
            }
        }

        writer.add_record(&edit.encode()).map_err(StrataError::from)
    }

    /// Complete a compaction's inputs: level+1 files, growth, grandparents.
    fn setup_other_inputs(&mut self, compaction: &mut Compaction) {
        let level = compaction.level();
        let current = compaction.input_version().clone();

        add_boundary_inputs(&self.icmp, current.files(level), compaction.inputs_mut(0));
        let (smallest, mut largest) = key_range(&self.icmp, compaction.inputs(0));

        let mut inputs1 =
            current.get_overlapping_inputs(level + 1, Some(&smallest), Some(&largest));
        add_boundary_inputs(&self.icmp, current.files(level + 1), &mut inputs1);
        *compaction.inputs_mut(1) = inputs1;

        let (mut all_start, mut all_limit) = key_range_2(
            &self.icmp,
            compaction.inputs(0),
            compaction.inputs(1),
        );

        // Try to grow the level-L side as long as doing so does not pull in
        // more level-(L+1) files and the combined size stays affordable.
        if !compaction.inputs(1).is_empty() {
            let mut expanded0 =
                current.get_overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            add_boundary_inputs(&self.icmp, current.files(level), &mut expanded0);

            let inputs0_size = total_file_size(compaction.inputs(0));
            let inputs1_size = total_file_size(compaction.inputs(1));
            let expanded0_size = total_file_size(&expanded0);
            if expanded0.len() > compaction.num_input_files(0)
                && inputs1_size + expanded0_size
                    < expanded_compaction_byte_size_limit(&self.options)
            {
                let (new_start, new_limit) = key_range(&self.icmp, &expanded0);
                let mut expanded1 = current.get_overlapping_inputs(
                    level + 1,
                    Some(&new_start),
                    Some(&new_limit),
                );
                add_boundary_inputs(&self.icmp, current.files(level + 1), &mut expanded1);

                if expanded1.len() == compaction.num_input_files(1) {
                    log::info!(
                        "Expanding level-{level} compaction inputs from \
                        {inputs0_before}+{inputs1_before} to {inputs0_after}+{inputs1_after} \
                        files.",
                        inputs0_before = compaction.num_input_files(0),
                        inputs1_before = compaction.num_input_files(1),
                        inputs0_after = expanded0.len(),
                        inputs1_after = expanded1.len()
                    );
                    largest = new_limit;
                    *compaction.inputs_mut(0) = expanded0;
                    *compaction.inputs_mut(1) = expanded1;
                    let recomputed = key_range_2(
                        &self.icmp,
                        compaction.inputs(0),
                        compaction.inputs(1),
                    );
                    all_start = recomputed.0;
                    all_limit = recomputed.1;
                }
            }
        }

        // Grandparents bound how large output files may grow.
        if level + 2 < MAX_NUM_LEVELS {
            compaction.set_grandparents(current.get_overlapping_inputs(
                level + 2,
                Some(&all_start),
                Some(&all_limit),
            ));
        }

        // The next compaction of this level resumes after the chosen range,
        // recorded both in memory and in the pending edit so a restart
        // resumes at the same place.
        debug_assert!(
            self.icmp.compare(smallest.as_bytes(), largest.as_bytes()) != Ordering::Greater
        );
        self.compact_pointers[level] = Some(largest.clone());
        compaction.edit.compact_pointers.push((level, largest));
    }
}

impl std::fmt::Debug for VersionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSet")
            .field("next_file_number", &self.next_file_number)
            .field("last_sequence", &self.last_sequence)
            .field("log_number", &self.log_number)
            .field("current", &self.current)
            .finish()
    }
}

/// The smallest and largest internal keys across `files`.
fn key_range(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetadata>],
) -> (InternalKey, InternalKey) {
    debug_assert!(!files.is_empty());
    let mut smallest = files[0].smallest().clone();
    let mut largest = files[0].largest().clone();
    for file in files.iter().skip(1) {
        if icmp.compare(file.smallest().as_bytes(), smallest.as_bytes()) == Ordering::Less {
            smallest = file.smallest().clone();
        }
        if icmp.compare(file.largest().as_bytes(), largest.as_bytes()) == Ordering::Greater {
            largest = file.largest().clone();
        }
    }

    (smallest, largest)
}

/// The smallest and largest internal keys across two file sets.
fn key_range_2(
    icmp: &InternalKeyComparator,
    first: &[Arc<FileMetadata>],
    second: &[Arc<FileMetadata>],
) -> (InternalKey, InternalKey) {
    let combined: Vec<Arc<FileMetadata>> =
        first.iter().chain(second.iter()).cloned().collect();
    key_range(icmp, &combined)
}

/**
Extend `compaction_files` with "boundary" files from `level_files`.

Two files at a sorted level may share a boundary user key (the entries
differ only in sequence number). Compacting the older file without the
newer one would let the newer entry sink below an older one during a later
read, so any file whose smallest key continues the chosen range's largest
user key is pulled in, transitively.
*/
fn add_boundary_inputs(
    icmp: &InternalKeyComparator,
    level_files: &[Arc<FileMetadata>],
    compaction_files: &mut Vec<Arc<FileMetadata>>,
) {
    if compaction_files.is_empty() {
        return;
    }

    let mut largest = {
        let (_, largest) = key_range(icmp, compaction_files);
        largest
    };

    loop {
        // The smallest boundary file strictly after `largest` sharing its
        // user key.
        let boundary = level_files
            .iter()
            .filter(|file| {
                icmp.compare(file.smallest().as_bytes(), largest.as_bytes())
                    == Ordering::Greater
                    && icmp.user_comparator().compare(
                        file.smallest().user_key(),
                        largest.user_key(),
                    ) == Ordering::Equal
            })
            .min_by(|a, b| icmp.compare(a.smallest().as_bytes(), b.smallest().as_bytes()));

        match boundary {
            Some(boundary_file) => {
                largest = boundary_file.largest().clone();
                compaction_files.push(Arc::clone(boundary_file));
            }
            None => break,
        }
    }
}

/// Read the entire contents of a file.
fn read_whole_file(fs: &dyn FileSystem, path: &std::path::Path) -> StrataResult<Vec<u8>> {
    let file = fs.open_file(path).map_err(|err| {
        StrataError::Corruption(format!("Could not open {path:?}: {err}."))
    })?;
    let length = file.len().map_err(StrataError::from)? as usize;
    let mut contents = vec![0; length];
    let bytes_read = file
        .read_from(&mut contents, 0)
        .map_err(StrataError::from)?;
    contents.truncate(bytes_read);

    Ok(contents)
}

/**
Atomically point `CURRENT` at the manifest with `manifest_number`.

The name is written to a temp file which is synced and renamed over
`CURRENT`, so a crash can never leave a partially written pointer.
*/
pub(crate) fn set_current_file(
    fs: &dyn FileSystem,
    file_name_handler: &FileNameHandler,
    manifest_number: u64,
) -> StrataResult<()> {
    let manifest_path = file_name_handler.manifest_path(manifest_number);
    let manifest_name = manifest_path
        .file_name()
        .and_then(|name| name.to_str())
        .expect("Manifest paths always have utf-8 file names.")
        .to_string();

    let temp_path = file_name_handler.temp_path(manifest_number);
    {
        let mut temp_file = fs.create_file(&temp_path, false)?;
        temp_file.append(format!("{manifest_name}\n").as_bytes())?;
        temp_file.sync()?;
    }

    match fs.rename(&temp_path, &file_name_handler.current_path()) {
        Ok(()) => Ok(()),
        Err(error) => {
            let _ = fs.remove_file(&temp_path);
            Err(StrataError::from(error))
        }
    }
}
