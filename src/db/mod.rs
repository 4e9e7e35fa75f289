/*!
The database: the public API and the machinery tying the storage layers
together.

One mutex guards the database-wide state ([`GuardedDbFields`]). Writers
queue up and the queue leader commits a group of batches: WAL append (and
optional sync) and memtable insertion happen with the mutex released, so
readers and queueing writers are not blocked behind I/O. A single
background thread drains a task channel and performs memtable flushes and
compactions; foreground threads schedule at most one pending task.
*/

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::batch::Batch;
use crate::compaction::Compaction;
use crate::comparator::Comparator;
use crate::config::{
    GROUP_COMMIT_SMALL_WRITE_THRESHOLD_BYTES, L0_SLOWDOWN_WRITES_TRIGGER,
    L0_STOP_WRITES_TRIGGER, MAX_GROUP_COMMIT_SIZE_BYTES, MAX_NUM_LEVELS,
    SMALL_WRITE_ADDITIONAL_GROUP_COMMIT_SIZE_BYTES,
};
use crate::errors::{DbIoError, StrataError, StrataResult};
use crate::file_names::{FileNameHandler, ParsedFileType};
use crate::fs::{FileLock, FileSystem};
use crate::iterator::{MergingIterator, StorageIterator};
use crate::key::{InternalKey, InternalKeyComparator, LookupKey, MAX_SEQUENCE_NUMBER};
use crate::logs::{CorruptionReporter, LogReader, LogWriter};
use crate::memtable::{EntryValue, MemTable};
use crate::options::{DbOptions, ReadOptions, WriteOptions};
use crate::snapshots::{Snapshot, SnapshotList};
use crate::table_cache::TableCache;
use crate::tables::TableBuilder;
use crate::versioning::file_metadata::FileMetadata;
use crate::versioning::version_edit::VersionEdit;
use crate::versioning::version_set::{set_current_file, VersionSet};
use crate::writers::Writer;

mod db_iter;
mod repair;

pub use db_iter::DbIterator;

/// Tasks understood by the background thread.
enum BackgroundTask {
    /// Flush the immutable memtable and/or run one compaction.
    Compaction,
    /// Exit the thread.
    Terminate,
}

/// Per-level compaction statistics, for the `stats` property.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct CompactionStats {
    duration: Duration,
    bytes_read: u64,
    bytes_written: u64,
}

impl CompactionStats {
    fn add(&mut self, duration: Duration, bytes_read: u64, bytes_written: u64) {
        self.duration += duration;
        self.bytes_read += bytes_read;
        self.bytes_written += bytes_written;
    }
}

/// A client-requested compaction of a key range at one level.
#[derive(Clone, Debug)]
struct ManualCompactionState {
    level: usize,
    /// Set by the background thread when the range is exhausted.
    done: bool,
    /// Unbounded when `None`. Advanced as successive passes complete.
    begin: Option<InternalKey>,
    end: Option<InternalKey>,
}

/// The database state protected by the one database-wide mutex.
pub(crate) struct GuardedDbFields {
    /// The active memtable, receiving writes.
    memtable: Arc<MemTable>,

    /// A frozen memtable awaiting its flush to level 0.
    immutable_memtable: Option<Arc<MemTable>>,

    /**
    The active write-ahead log.

    Shared and separately locked so the group-commit leader can append
    with the database mutex released.
    */
    wal: Option<Arc<Mutex<LogWriter>>>,

    /// The file number of the active write-ahead log.
    wal_file_number: u64,

    /// The versions of the database.
    pub(crate) version_set: VersionSet,

    /// Writers awaiting their turn, front is the leader.
    writer_queue: VecDeque<Arc<Writer>>,

    /// Outstanding snapshots.
    snapshots: SnapshotList,

    /// Whether a background task has been queued and not yet finished.
    background_compaction_scheduled: bool,

    /// An in-flight client-requested compaction.
    manual_compaction: Option<ManualCompactionState>,

    /**
    The first background failure.

    Once set, every subsequent write fails with it until the database is
    closed; reads continue to be served.
    */
    bg_error: Option<StrataError>,

    /// File numbers being written and not yet installed in a version.
    pending_outputs: HashSet<u64>,

    /// Per-level compaction statistics.
    stats: [CompactionStats; MAX_NUM_LEVELS],

    /// The advisory lock on the database directory.
    db_lock: Option<FileLock>,
}

/// State shared between the public handle and the background thread.
pub(crate) struct DbState {
    /// Options for configuring the operation of the database.
    pub(crate) options: DbOptions,

    /// The file system the database operates on.
    fs: Arc<dyn FileSystem>,

    /// Handler for the database's file names.
    file_names: FileNameHandler,

    /// Shared cache of open table handles.
    table_cache: Arc<TableCache>,

    /// Orders internal keys.
    icmp: InternalKeyComparator,

    /// All mutable database-wide state.
    pub(crate) guarded: Mutex<GuardedDbFields>,

    /// Signalled whenever a background task finishes.
    background_work_finished: Condvar,

    /// Mirror of `immutable_memtable.is_some()` readable without the mutex.
    has_immutable_memtable: AtomicBool,

    /// Set once the database has begun closing.
    is_shutting_down: AtomicBool,

    /// Queues tasks to the background thread.
    task_sender: Mutex<Option<Sender<BackgroundTask>>>,
}

/// An open database.
pub struct DB {
    state: Arc<DbState>,
    worker_handle: Option<std::thread::JoinHandle<()>>,
}

/// Public methods
impl DB {
    /// Open (or, with `create_if_missing`, create) the database at `db_path`.
    pub fn open(options: DbOptions, db_path: &str) -> StrataResult<DB> {
        log::info!("Opening database at {db_path}.");
        let fs = Arc::clone(&options.filesystem_provider);
        let file_names = FileNameHandler::new(db_path);
        fs.create_dir_all(file_names.db_path())?;

        let table_cache = Arc::new(TableCache::new(db_path, options.clone()));
        let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));
        let guarded = GuardedDbFields {
            memtable: Arc::new(MemTable::new()),
            immutable_memtable: None,
            wal: None,
            wal_file_number: 0,
            version_set: VersionSet::new(db_path, options.clone(), Arc::clone(&table_cache)),
            writer_queue: VecDeque::new(),
            snapshots: SnapshotList::new(),
            background_compaction_scheduled: false,
            manual_compaction: None,
            bg_error: None,
            pending_outputs: HashSet::new(),
            stats: [CompactionStats::default(); MAX_NUM_LEVELS],
            db_lock: None,
        };
        let state = Arc::new(DbState {
            options,
            fs: Arc::clone(&fs),
            file_names,
            table_cache,
            icmp,
            guarded: Mutex::new(guarded),
            background_work_finished: Condvar::new(),
            has_immutable_memtable: AtomicBool::new(false),
            is_shutting_down: AtomicBool::new(false),
            task_sender: Mutex::new(None),
        });

        let (sender, receiver) = std::sync::mpsc::channel();
        *state.task_sender.lock() = Some(sender);
        let worker_state = Arc::clone(&state);
        let worker_handle = std::thread::Builder::new()
            .name("stratadb-background".to_string())
            .spawn(move || worker_main(worker_state, receiver))
            .map_err(StrataError::from)?;

        let mut db = DB {
            state: Arc::clone(&state),
            worker_handle: Some(worker_handle),
        };

        let open_result = (|| {
            let mut guard = state.guarded.lock();
            guard.db_lock = Some(
                state
                    .fs
                    .lock_file(&state.file_names.lock_path())
                    .map_err(|err| {
                        StrataError::Io(DbIoError::new(
                            err.kind(),
                            format!("Could not lock the database: {err}."),
                        ))
                    })?,
            );

            let mut edit = VersionEdit::new();
            let save_manifest = recover(&state, &mut guard, &mut edit)?;

            if guard.wal.is_none() {
                let wal_number = guard.version_set.new_file_number();
                let wal_path = state.file_names.wal_path(wal_number);
                let wal_file = state.fs.create_file(&wal_path, false)?;
                guard.wal = Some(Arc::new(Mutex::new(LogWriter::new(wal_file, 0))));
                guard.wal_file_number = wal_number;
                edit.log_number = Some(wal_number);
            }

            if save_manifest {
                edit.prev_log_number = Some(0);
                edit.log_number = Some(guard.wal_file_number);
                VersionSet::log_and_apply(&mut guard, edit)?;
            }

            remove_obsolete_files(&state, &mut guard);
            maybe_schedule_compaction(&state, &mut guard);
            Ok(())
        })();

        match open_result {
            Ok(()) => Ok(db),
            Err(error) => {
                let _ = db.close();
                Err(error)
            }
        }
    }

    /// Set `key` to `value`.
    pub fn put(&self, write_options: WriteOptions, key: &[u8], value: &[u8]) -> StrataResult<()> {
        let mut batch = Batch::new();
        batch.put(key, value);
        self.write(write_options, batch)
    }

    /// Remove `key`.
    pub fn delete(&self, write_options: WriteOptions, key: &[u8]) -> StrataResult<()> {
        let mut batch = Batch::new();
        batch.delete(key);
        self.write(write_options, batch)
    }

    /// Apply `batch` atomically.
    pub fn write(&self, write_options: WriteOptions, batch: Batch) -> StrataResult<()> {
        self.write_internal(write_options, Some(batch))
    }

    /**
    Get the value stored for `key`.

    Returns [`StrataError::NotFound`] when the key is absent or deleted as
    of the read's snapshot.
    */
    pub fn get(&self, read_options: ReadOptions, key: &[u8]) -> StrataResult<Vec<u8>> {
        let state = &self.state;
        let (sequence, memtable, immutable_memtable, version) = {
            let guard = state.guarded.lock();
            let sequence = read_options
                .snapshot
                .as_ref()
                .map(|snapshot| snapshot.sequence_number())
                .unwrap_or_else(|| guard.version_set.last_sequence());
            (
                sequence,
                Arc::clone(&guard.memtable),
                guard.immutable_memtable.clone(),
                guard.version_set.current(),
            )
        };

        // Probe the layers newest-first with the mutex released.
        let lookup_key = LookupKey::new(key, sequence);
        let mut stats = None;
        let outcome = if let Some(entry) = memtable.get(&lookup_key) {
            Some(entry)
        } else if let Some(entry) = immutable_memtable
            .as_ref()
            .and_then(|immutable| immutable.get(&lookup_key))
        {
            Some(entry)
        } else {
            let (entry, version_stats) = version.get(&read_options, &lookup_key)?;
            stats = version_stats;
            entry
        };

        if let Some(seek_stats) = stats {
            let mut guard = state.guarded.lock();
            if version.update_stats(seek_stats) {
                maybe_schedule_compaction(state, &mut guard);
            }
        }

        match outcome {
            Some(EntryValue::Present(value)) => Ok(value),
            Some(EntryValue::Deleted) | None => Err(StrataError::NotFound),
        }
    }

    /// An iterator over the database as of the read options' snapshot.
    pub fn new_iterator(&self, read_options: ReadOptions) -> StrataResult<DbIterator> {
        let state = &self.state;
        let guard = state.guarded.lock();

        let sequence = read_options
            .snapshot
            .as_ref()
            .map(|snapshot| snapshot.sequence_number())
            .unwrap_or_else(|| guard.version_set.last_sequence());
        let version = guard.version_set.current();

        let mut children: Vec<Box<dyn StorageIterator>> =
            vec![Box::new(guard.memtable.iter())];
        if let Some(immutable) = guard.immutable_memtable.as_ref() {
            children.push(Box::new(immutable.iter()));
        }
        children.extend(version.iterators(&read_options)?);
        drop(guard);

        let internal = MergingIterator::new(state.icmp.clone(), children);
        Ok(DbIterator::new(
            Arc::clone(state),
            internal,
            sequence,
            version,
        ))
    }

    /// Capture a snapshot of the current state.
    pub fn get_snapshot(&self) -> Snapshot {
        let mut guard = self.state.guarded.lock();
        let sequence = guard.version_set.last_sequence();
        guard.snapshots.new_snapshot(sequence)
    }

    /// Release a snapshot, letting compactions drop what it pinned.
    pub fn release_snapshot(&self, snapshot: Snapshot) {
        let mut guard = self.state.guarded.lock();
        guard.snapshots.release(&snapshot);
    }

    /**
    Compact the key range `[begin, end]` (either bound may be `None` for
    unbounded) all the way down the level hierarchy.

    On return, the range has been merged into the deepest level it reaches
    and superseded entries have been dropped.
    */
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> StrataResult<()> {
        let state = &self.state;

        let max_level_with_files = {
            let guard = state.guarded.lock();
            let version = guard.version_set.current();
            let mut max_level = 1;
            for level in 1..MAX_NUM_LEVELS {
                if version.overlap_in_level(level, begin, end) {
                    max_level = level;
                }
            }
            max_level
        };

        self.force_flush_memtable()?;
        for level in 0..max_level_with_files {
            self.manual_compact_level(level, begin, end)?;
        }

        Ok(())
    }

    /**
    The approximate on-disk bytes spanned by each `(begin, end)` user-key
    range. In-memory data is not counted.
    */
    pub fn get_approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Vec<u64> {
        let guard = self.state.guarded.lock();
        let version = guard.version_set.current();

        ranges
            .iter()
            .map(|(begin, end)| {
                let begin_key =
                    InternalKey::new(begin, MAX_SEQUENCE_NUMBER, crate::key::SEEK_OPERATION);
                let end_key =
                    InternalKey::new(end, MAX_SEQUENCE_NUMBER, crate::key::SEEK_OPERATION);
                let start = guard.version_set.approximate_offset_of(&version, &begin_key);
                let limit = guard.version_set.approximate_offset_of(&version, &end_key);
                limit.saturating_sub(start)
            })
            .collect()
    }

    /// Introspection properties, addressed by name.
    pub fn get_property(&self, property: &str) -> Option<String> {
        const PREFIX: &str = "stratadb.";
        let name = property.strip_prefix(PREFIX)?;
        let guard = self.state.guarded.lock();

        if let Some(level) = name.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= MAX_NUM_LEVELS {
                return None;
            }
            return Some(guard.version_set.num_level_files(level).to_string());
        }

        match name {
            "stats" => {
                let mut output = String::from(
                    "Level  Files  Size(MB)  Time(sec)  Read(MB)  Write(MB)\n\
                     --------------------------------------------------------\n",
                );
                for level in 0..MAX_NUM_LEVELS {
                    let files = guard.version_set.num_level_files(level);
                    let bytes = guard.version_set.num_level_bytes(level);
                    let stats = &guard.stats[level];
                    if files == 0 && stats.bytes_written == 0 {
                        continue;
                    }
                    output.push_str(&format!(
                        "{level:>5}  {files:>5}  {size:>8.1}  {time:>9.3}  {read:>8.1}  {write:>9.1}\n",
                        size = bytes as f64 / 1_048_576.0,
                        time = stats.duration.as_secs_f64(),
                        read = stats.bytes_read as f64 / 1_048_576.0,
                        write = stats.bytes_written as f64 / 1_048_576.0,
                    ));
                }
                Some(output)
            }
            "sstables" => {
                let version = guard.version_set.current();
                let mut output = String::new();
                for level in 0..MAX_NUM_LEVELS {
                    output.push_str(&format!("--- level {level} ---\n"));
                    for file in version.files(level) {
                        output.push_str(&format!(
                            "{}: {} bytes [{:?} .. {:?}]\n",
                            file.file_number(),
                            file.file_size(),
                            file.smallest(),
                            file.largest(),
                        ));
                    }
                }
                Some(output)
            }
            "approximate-memory-usage" => {
                let mut total = guard.memtable.approximate_memory_usage();
                if let Some(immutable) = guard.immutable_memtable.as_ref() {
                    total += immutable.approximate_memory_usage();
                }
                total += self.state.options.block_cache.total_charge();
                Some(total.to_string())
            }
            _ => None,
        }
    }

    /**
    Close the database: drain background work, stop the worker thread, and
    release the directory lock. Called automatically on drop.
    */
    pub fn close(&mut self) -> StrataResult<()> {
        if self.worker_handle.is_none() {
            return Ok(());
        }
        log::info!("Closing the database.");
        self.state
            .is_shutting_down
            .store(true, AtomicOrdering::SeqCst);

        {
            let mut guard = self.state.guarded.lock();
            while guard.background_compaction_scheduled {
                self.state.background_work_finished.wait(&mut guard);
            }
            guard.db_lock = None;
        }

        if let Some(sender) = self.state.task_sender.lock().take() {
            let _ = sender.send(BackgroundTask::Terminate);
        }
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }

        Ok(())
    }

    /**
    Destroy the contents of the database at `db_path`.

    The database must be closed. Unrecognized files in the directory are
    left untouched.
    */
    pub fn destroy(options: DbOptions, db_path: &str) -> StrataResult<()> {
        let fs = Arc::clone(&options.filesystem_provider);
        let file_names = FileNameHandler::new(db_path);

        let files = match fs.list_dir(file_names.db_path()) {
            Ok(files) => files,
            // Missing directory counts as destroyed.
            Err(_) => return Ok(()),
        };

        let _lock = fs.lock_file(&file_names.lock_path())?;
        let mut result = Ok(());
        for path in files {
            match FileNameHandler::parse_file_name(&path) {
                Ok(ParsedFileType::DbLockFile) => {} // deleted last, below
                Ok(_) => {
                    if let Err(error) = fs.remove_file(&path) {
                        result = Err(StrataError::from(error));
                    }
                }
                Err(_) => {}
            }
        }
        drop(_lock);
        let _ = fs.remove_file(&file_names.lock_path());

        result
    }

    /**
    Rebuild a usable manifest for the (closed) database at `db_path` from
    its surviving table and log files. See [`repair`](self::repair) for
    the caveats.
    */
    pub fn repair(options: DbOptions, db_path: &str) -> StrataResult<()> {
        repair::repair(&options, db_path)
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            log::error!("Error while closing the database: {error}.");
        }
    }
}

/// Private methods
impl DB {
    /// The shared write path; `batch` of `None` only forces room-making.
    fn write_internal(
        &self,
        write_options: WriteOptions,
        batch: Option<Batch>,
    ) -> StrataResult<()> {
        let state = &self.state;
        if state.is_shutting_down.load(AtomicOrdering::Acquire) {
            return Err(StrataError::Io(DbIoError::new(
                std::io::ErrorKind::Interrupted,
                "The database is shutting down.".to_string(),
            )));
        }
        let force_room = batch.is_none();
        let writer = Arc::new(Writer::new(batch, write_options.sync));

        let mut guard = state.guarded.lock();
        guard.writer_queue.push_back(Arc::clone(&writer));
        while !writer.is_completed()
            && !guard
                .writer_queue
                .front()
                .map_or(false, |front| Arc::ptr_eq(front, &writer))
        {
            writer.wait(&mut guard);
        }
        if writer.is_completed() {
            return writer.take_result();
        }

        // This writer is the leader: it commits a group of queued batches.
        let mut result = make_room_for_write(state, &mut guard, force_room);
        let mut writers_in_group = 1;
        if result.is_ok() && !force_room {
            let (mut group, group_size) = build_batch_group(&guard);
            writers_in_group = group_size;

            let sequence = guard.version_set.last_sequence() + 1;
            group.set_sequence_number(sequence);
            let last_sequence = sequence + group.count() as u64 - 1;

            let wal = Arc::clone(guard.wal.as_ref().expect("The WAL is open while writing."));
            let memtable = Arc::clone(&guard.memtable);
            let sync = writer.is_sync();

            // The expensive part happens with the database mutex released;
            // the leader role serializes writers, so no other thread
            // touches the WAL or inserts into the memtable.
            let write_result: StrataResult<()> = MutexGuard::unlocked(&mut guard, || {
                let mut wal_writer = wal.lock();
                wal_writer.add_record(group.contents())?;
                if sync {
                    wal_writer.sync()?;
                }
                drop(wal_writer);

                group.apply_to_memtable(&memtable)
            });

            match &write_result {
                Ok(()) => guard.version_set.set_last_sequence(last_sequence),
                Err(error) => {
                    // The log (or memtable) may hold a torn group; the
                    // database cannot accept further writes safely.
                    record_background_error(state, &mut guard, error.clone());
                }
            }
            result = write_result;
        }

        // Hand results to every follower that was committed in the group
        // and wake the next leader.
        for _ in 0..writers_in_group {
            let finished = guard
                .writer_queue
                .pop_front()
                .expect("The group's writers are still queued.");
            if !Arc::ptr_eq(&finished, &writer) {
                finished.complete(result.clone());
                finished.signal();
            }
        }
        if let Some(next_leader) = guard.writer_queue.front() {
            next_leader.signal();
        }

        result
    }

    /// Freeze the current memtable and wait until it is flushed.
    fn force_flush_memtable(&self) -> StrataResult<()> {
        self.write_internal(WriteOptions::default(), None)?;

        let state = &self.state;
        let mut guard = state.guarded.lock();
        while guard.immutable_memtable.is_some() && guard.bg_error.is_none() {
            state.background_work_finished.wait(&mut guard);
        }

        match guard.bg_error.as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Run manual compactions at `level` until the range is exhausted.
    fn manual_compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> StrataResult<()> {
        let state = &self.state;
        let manual = ManualCompactionState {
            level,
            done: false,
            begin: begin
                .map(|key| InternalKey::new(key, MAX_SEQUENCE_NUMBER, crate::key::SEEK_OPERATION)),
            end: end.map(|key| InternalKey::new(key, 0, crate::key::Operation::Delete)),
        };

        let mut guard = state.guarded.lock();

        // One manual compaction at a time.
        while guard.manual_compaction.is_some() {
            state.background_work_finished.wait(&mut guard);
        }
        guard.manual_compaction = Some(manual);

        loop {
            if state.is_shutting_down.load(AtomicOrdering::Acquire) {
                guard.manual_compaction = None;
                return Err(StrataError::Io(DbIoError::new(
                    std::io::ErrorKind::Interrupted,
                    "The database is shutting down.".to_string(),
                )));
            }
            if let Some(error) = guard.bg_error.clone() {
                guard.manual_compaction = None;
                return Err(error);
            }
            if guard
                .manual_compaction
                .as_ref()
                .map_or(true, |manual| manual.done)
            {
                guard.manual_compaction = None;
                state.background_work_finished.notify_all();
                return Ok(());
            }

            maybe_schedule_compaction(state, &mut guard);
            state.background_work_finished.wait(&mut guard);
        }
    }
}

/**
Combine the leader's batch with compatible queued batches.

Returns the combined batch and the number of writers it covers (including
the leader). Sync writes are never folded into a non-sync leader's group,
and the group size is capped so one commit cannot stall small writes
behind it indefinitely.
*/
fn build_batch_group(guard: &MutexGuard<'_, GuardedDbFields>) -> (Batch, usize) {
    let leader = guard
        .writer_queue
        .front()
        .expect("The leader is still queued.");
    let leader_batch = leader
        .batch()
        .expect("Group building requires the leader to carry a batch.");

    let mut group_bytes = leader_batch.approximate_size();
    let max_group_bytes = if group_bytes <= GROUP_COMMIT_SMALL_WRITE_THRESHOLD_BYTES {
        group_bytes + SMALL_WRITE_ADDITIONAL_GROUP_COMMIT_SIZE_BYTES
    } else {
        MAX_GROUP_COMMIT_SIZE_BYTES
    };

    let mut group = leader_batch.clone();
    let mut writers_in_group = 1;
    for follower in guard.writer_queue.iter().skip(1) {
        if follower.is_sync() && !leader.is_sync() {
            // A sync write must not be acknowledged off a non-sync commit.
            break;
        }
        let follower_batch = match follower.batch() {
            Some(batch) => batch,
            // Room-forcing writers are leaders of their own turn.
            None => break,
        };

        group_bytes += follower_batch.approximate_size();
        if group_bytes > max_group_bytes {
            break;
        }
        group.append(follower_batch);
        writers_in_group += 1;
    }

    (group, writers_in_group)
}

/**
Ensure there is room in the memtable for an incoming write, applying
backpressure along the way: a one-time 1 ms delay near the level-0
slowdown threshold, a memtable rotation when the write buffer fills, and a
hard wait at the level-0 stop threshold or while a flush is already in
flight.
*/
fn make_room_for_write(
    state: &Arc<DbState>,
    guard: &mut MutexGuard<'_, GuardedDbFields>,
    force: bool,
) -> StrataResult<()> {
    let mut force = force;
    let mut allow_delay = !force;

    loop {
        if let Some(error) = guard.bg_error.clone() {
            return Err(error);
        }

        if allow_delay
            && guard.version_set.num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER
        {
            // Gently push back on writers instead of stalling them hard
            // once level 0 fills up completely. At most one delay per
            // write.
            allow_delay = false;
            MutexGuard::unlocked(guard, || {
                std::thread::sleep(Duration::from_millis(1));
            });
            continue;
        }

        if !force
            && guard.memtable.approximate_memory_usage()
                <= state.options.write_buffer_size
        {
            return Ok(());
        }

        if guard.immutable_memtable.is_some() {
            log::debug!("Write waits for the in-flight memtable flush.");
            state.background_work_finished.wait(guard);
            continue;
        }

        if guard.version_set.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
            log::warn!("Write stalls: too many level-0 files.");
            state.background_work_finished.wait(guard);
            continue;
        }

        // Rotate: freeze the memtable behind a fresh WAL and let the
        // background thread flush it.
        let new_wal_number = guard.version_set.new_file_number();
        let wal_path = state.file_names.wal_path(new_wal_number);
        let wal_file = match state.fs.create_file(&wal_path, false) {
            Ok(file) => file,
            Err(error) => {
                guard.version_set.reuse_file_number(new_wal_number);
                return Err(StrataError::from(error));
            }
        };
        log::info!("Rotating to write-ahead log {new_wal_number}.");
        guard.wal = Some(Arc::new(Mutex::new(LogWriter::new(wal_file, 0))));
        guard.wal_file_number = new_wal_number;
        guard.immutable_memtable = Some(Arc::clone(&guard.memtable));
        state
            .has_immutable_memtable
            .store(true, AtomicOrdering::Release);
        guard.memtable = Arc::new(MemTable::new());
        force = false;
        maybe_schedule_compaction(state, guard);
    }
}

/// Queue a background task if one is needed and none is pending.
pub(crate) fn maybe_schedule_compaction(
    state: &Arc<DbState>,
    guard: &mut MutexGuard<'_, GuardedDbFields>,
) {
    if guard.background_compaction_scheduled {
        return;
    }
    if state.is_shutting_down.load(AtomicOrdering::Acquire) {
        return;
    }
    if guard.bg_error.is_some() {
        return;
    }

    let manual_pending = guard
        .manual_compaction
        .as_ref()
        .map_or(false, |manual| !manual.done);
    let work_to_do = guard.immutable_memtable.is_some()
        || manual_pending
        || guard.version_set.needs_compaction();
    if !work_to_do {
        return;
    }

    guard.background_compaction_scheduled = true;
    if let Some(sender) = state.task_sender.lock().as_ref() {
        let _ = sender.send(BackgroundTask::Compaction);
    }
}

/// Latch the first background error; subsequent writes will return it.
fn record_background_error(
    state: &Arc<DbState>,
    guard: &mut MutexGuard<'_, GuardedDbFields>,
    error: StrataError,
) {
    if guard.bg_error.is_none() {
        log::error!("Background error latched: {error}.");
        guard.bg_error = Some(error);
        state.background_work_finished.notify_all();
    }
}

/// The body of the background thread.
fn worker_main(state: Arc<DbState>, receiver: Receiver<BackgroundTask>) {
    log::info!("Background thread started.");
    while let Ok(task) = receiver.recv() {
        match task {
            BackgroundTask::Terminate => break,
            BackgroundTask::Compaction => background_call(&state),
        }
    }
    log::info!("Background thread exiting.");
}

/// One dequeued background task: flush and/or compact, then reschedule.
fn background_call(state: &Arc<DbState>) {
    let mut guard = state.guarded.lock();
    debug_assert!(guard.background_compaction_scheduled);

    if !state.is_shutting_down.load(AtomicOrdering::Acquire) && guard.bg_error.is_none() {
        if let Err(error) = background_compaction(state, &mut guard) {
            record_background_error(state, &mut guard, error);
        }
    }

    guard.background_compaction_scheduled = false;
    // The just-finished round may have unlocked more work (e.g. a flush
    // that pushed level 0 over its trigger).
    maybe_schedule_compaction(state, &mut guard);
    state.background_work_finished.notify_all();
}

/// Flush the immutable memtable if there is one, otherwise run one compaction.
fn background_compaction(
    state: &Arc<DbState>,
    guard: &mut MutexGuard<'_, GuardedDbFields>,
) -> StrataResult<()> {
    if guard.immutable_memtable.is_some() {
        return compact_memtable(state, guard);
    }

    let manual = guard
        .manual_compaction
        .clone()
        .filter(|manual| !manual.done);
    let is_manual = manual.is_some();

    let compaction = match manual.as_ref() {
        Some(manual_state) => {
            let compaction = guard.version_set.compact_range(
                manual_state.level,
                manual_state.begin.as_ref(),
                manual_state.end.as_ref(),
            );
            if compaction.is_none() {
                if let Some(slot) = guard.manual_compaction.as_mut() {
                    slot.done = true;
                }
            }
            compaction
        }
        None => guard.version_set.pick_compaction(),
    };

    let mut compaction = match compaction {
        Some(compaction) => compaction,
        None => return Ok(()),
    };

    // Where this pass ends, so a follow-up manual pass resumes after it.
    let manual_end = compaction
        .inputs(0)
        .last()
        .map(|file| file.largest().clone());

    let result = if !is_manual && compaction.is_trivial_move() {
        // The file can simply move down one level.
        let file = Arc::clone(&compaction.inputs(0)[0]);
        log::info!(
            "Trivially moving table file {} ({} bytes) from level {} to level {}.",
            file.file_number(),
            file.file_size(),
            compaction.level(),
            compaction.level() + 1,
        );
        compaction.edit.remove_file(compaction.level(), file.file_number());
        compaction.edit.add_file(compaction.level() + 1, file);
        let edit = std::mem::take(&mut compaction.edit);
        VersionSet::log_and_apply(guard, edit)
    } else {
        do_compaction_work(state, guard, compaction)
    };

    if is_manual {
        if let Some(slot) = guard.manual_compaction.as_mut() {
            if result.is_err() {
                slot.done = true;
            } else if !slot.done {
                // Resume after the key range this pass consumed.
                slot.begin = manual_end;
            }
        }
    }

    remove_obsolete_files(state, guard);
    result
}

/// Flush the immutable memtable to a table file and install it.
fn compact_memtable(
    state: &Arc<DbState>,
    guard: &mut MutexGuard<'_, GuardedDbFields>,
) -> StrataResult<()> {
    let immutable = Arc::clone(
        guard
            .immutable_memtable
            .as_ref()
            .expect("A memtable flush requires an immutable memtable."),
    );

    let mut edit = VersionEdit::new();
    let base_version = guard.version_set.current();
    write_level0_table(state, guard, &immutable, &mut edit, Some(base_version))?;

    if state.is_shutting_down.load(AtomicOrdering::Acquire) {
        return Err(StrataError::Io(DbIoError::new(
            std::io::ErrorKind::Interrupted,
            "The database shut down during a memtable flush.".to_string(),
        )));
    }

    // The flushed memtable's WAL (and everything before it) is obsolete.
    edit.prev_log_number = Some(0);
    edit.log_number = Some(guard.wal_file_number);
    VersionSet::log_and_apply(guard, edit)?;

    guard.immutable_memtable = None;
    state
        .has_immutable_memtable
        .store(false, AtomicOrdering::Release);
    Ok(())
}

/**
Write the contents of `memtable` to a new table file and register it in
`edit`.

With a base version the output may be placed below level 0 when it causes
no overlap there. An empty memtable produces no file.
*/
fn write_level0_table(
    state: &Arc<DbState>,
    guard: &mut MutexGuard<'_, GuardedDbFields>,
    memtable: &Arc<MemTable>,
    edit: &mut VersionEdit,
    base_version: Option<Arc<crate::versioning::version::Version>>,
) -> StrataResult<()> {
    let start_time = Instant::now();
    let file_number = guard.version_set.new_file_number();
    guard.pending_outputs.insert(file_number);
    log::info!("Flushing a memtable to table file {file_number}.");

    let options = state.options.clone();
    let fs = Arc::clone(&state.fs);
    let table_path = state.file_names.table_path(file_number);
    let source = Arc::clone(memtable);

    let build_result: StrataResult<Option<FileMetadata>> =
        MutexGuard::unlocked(guard, || {
            let mut iter = source.iter();
            iter.seek_to_first();
            if !iter.valid() {
                return Ok(None);
            }

            let file = fs.create_file(&table_path, false)?;
            let mut builder = TableBuilder::new(options, file);
            let smallest = InternalKey::decode(iter.key().to_vec())?;
            let mut largest = smallest.clone();
            while iter.valid() {
                largest = InternalKey::decode(iter.key().to_vec())?;
                builder.add(iter.key(), iter.value())?;
                iter.next();
            }
            builder.finish()?;
            builder.sync()?;

            Ok(Some(FileMetadata::new(
                file_number,
                builder.file_size(),
                smallest,
                largest,
            )))
        });

    guard.pending_outputs.remove(&file_number);
    match build_result {
        Ok(Some(metadata)) => {
            let level = base_version
                .map(|version| {
                    version.pick_level_for_memtable_output(
                        metadata.smallest().user_key(),
                        metadata.largest().user_key(),
                    )
                })
                .unwrap_or(0);
            log::info!(
                "Table file {file_number} holds {size} bytes; placing at level {level}.",
                size = metadata.file_size()
            );
            guard.stats[level].add(start_time.elapsed(), 0, metadata.file_size());
            edit.add_file(level, Arc::new(metadata));
            Ok(())
        }
        Ok(None) => {
            guard.version_set.reuse_file_number(file_number);
            Ok(())
        }
        Err(error) => {
            let _ = fs.remove_file(&table_path);
            Err(error)
        }
    }
}

/// One finished output file of a compaction.
struct CompactionOutput {
    file_number: u64,
    file_size: u64,
    smallest: InternalKey,
    largest: InternalKey,
}

/// Scratch state while executing a compaction.
struct CompactionJob {
    compaction: Compaction,
    smallest_snapshot: u64,
    outputs: Vec<CompactionOutput>,
    builder: Option<TableBuilder>,
    current_file_number: u64,
    current_smallest: Option<InternalKey>,
    current_largest: Option<InternalKey>,
}

/// Execute a (non-trivial) compaction and install its results.
fn do_compaction_work(
    state: &Arc<DbState>,
    guard: &mut MutexGuard<'_, GuardedDbFields>,
    compaction: Compaction,
) -> StrataResult<()> {
    let start_time = Instant::now();
    log::info!("Starting {}.", compaction.describe());
    debug_assert!(guard.immutable_memtable.is_none());

    // Entries only a snapshot can see must survive; absent snapshots, the
    // latest sequence is the floor.
    let smallest_snapshot = if guard.snapshots.is_empty() {
        guard.version_set.last_sequence()
    } else {
        guard.snapshots.oldest_sequence_number()
    };

    let level = compaction.level();
    let input_bytes: u64 = (0..2)
        .map(|which| crate::versioning::version::total_file_size(compaction.inputs(which)))
        .sum();
    let mut job = CompactionJob {
        compaction,
        smallest_snapshot,
        outputs: vec![],
        builder: None,
        current_file_number: 0,
        current_smallest: None,
        current_largest: None,
    };

    let io_result: StrataResult<()> =
        MutexGuard::unlocked(guard, || compaction_io_loop(state, &mut job));

    // Back under the mutex: account stats and install or roll back.
    let output_bytes: u64 = job.outputs.iter().map(|output| output.file_size).sum();
    guard.stats[level + 1].add(start_time.elapsed(), input_bytes, output_bytes);

    let result = io_result.and_then(|()| {
        log::info!(
            "Compaction produced {count} level-{next_level} files ({output_bytes} bytes).",
            count = job.outputs.len(),
            next_level = level + 1,
        );
        install_compaction_results(guard, &mut job)
    });

    // Output numbers are either installed in a version now or dead.
    for output in job.outputs.iter() {
        guard.pending_outputs.remove(&output.file_number);
    }
    if job.builder.is_some() {
        guard.pending_outputs.remove(&job.current_file_number);
    }

    if let Err(error) = &result {
        log::error!("Compaction failed: {error}. Removing partial outputs.");
        let mut partial_numbers: Vec<u64> =
            job.outputs.iter().map(|output| output.file_number).collect();
        if let Some(mut builder) = job.builder.take() {
            builder.abandon();
            partial_numbers.push(job.current_file_number);
        }
        for file_number in partial_numbers {
            let _ = state.fs.remove_file(&state.file_names.table_path(file_number));
        }
    }

    result
}

/// The mutex-free portion of a compaction: merge inputs into output files.
fn compaction_io_loop(state: &Arc<DbState>, job: &mut CompactionJob) -> StrataResult<()> {
    let user_comparator = state.icmp.user_comparator();
    let mut input = job.compaction.make_input_iterator(&state.table_cache)?;
    input.seek_to_first();

    let mut current_user_key: Option<Vec<u8>> = None;
    // Sentinel above any real sequence number.
    let mut last_sequence_for_key = u64::MAX;

    while input.valid() {
        if state.is_shutting_down.load(AtomicOrdering::Acquire) {
            return Err(StrataError::Io(DbIoError::new(
                std::io::ErrorKind::Interrupted,
                "The database shut down during a compaction.".to_string(),
            )));
        }

        // A memtable flush outranks the compaction; do it inline so
        // writers never stall behind a long merge.
        if state
            .has_immutable_memtable
            .load(AtomicOrdering::Acquire)
        {
            let mut guard = state.guarded.lock();
            if guard.immutable_memtable.is_some() {
                compact_memtable(state, &mut guard)?;
                state.background_work_finished.notify_all();
            }
        }

        let key = input.key().to_vec();

        if job.compaction.should_stop_before(&key) && job.builder.is_some() {
            finish_compaction_output_file(state, job)?;
        }

        let mut drop_entry = false;
        match crate::key::parse_internal_key(&key) {
            None => {
                // Keep unparseable keys so the damage stays visible.
                current_user_key = None;
                last_sequence_for_key = u64::MAX;
            }
            Some((user_key, sequence, operation)) => {
                let first_occurrence = current_user_key
                    .as_deref()
                    .map_or(true, |current| {
                        user_comparator.compare(user_key, current)
                            != std::cmp::Ordering::Equal
                    });
                if first_occurrence {
                    current_user_key = Some(user_key.to_vec());
                    last_sequence_for_key = u64::MAX;
                }

                if last_sequence_for_key <= job.smallest_snapshot {
                    // A newer entry for this user key at or below the
                    // oldest snapshot shadows this one for every observer.
                    drop_entry = true;
                } else if operation == crate::key::Operation::Delete
                    && sequence <= job.smallest_snapshot
                    && job.compaction.is_base_level_for_key(user_key)
                {
                    // The tombstone has nothing left to delete below it
                    // and nobody can see around it.
                    drop_entry = true;
                }

                last_sequence_for_key = sequence;
            }
        }

        if !drop_entry {
            if job.builder.is_none() {
                open_compaction_output_file(state, job)?;
            }
            if job
                .builder
                .as_ref()
                .map_or(false, |builder| builder.num_entries() == 0)
            {
                job.current_smallest = Some(InternalKey::decode(key.clone())?);
            }
            job.current_largest = Some(InternalKey::decode(key.clone())?);
            job.builder
                .as_mut()
                .unwrap()
                .add(&key, input.value())?;

            if job.builder.as_ref().unwrap().file_size()
                >= job.compaction.max_output_file_size()
            {
                finish_compaction_output_file(state, job)?;
            }
        }

        input.next();
    }

    if job.builder.is_some() {
        finish_compaction_output_file(state, job)?;
    }

    input.status()
}

/// Open the next output table file, registering its number as pending.
fn open_compaction_output_file(
    state: &Arc<DbState>,
    job: &mut CompactionJob,
) -> StrataResult<()> {
    debug_assert!(job.builder.is_none());

    let file_number = {
        let mut guard = state.guarded.lock();
        let file_number = guard.version_set.new_file_number();
        guard.pending_outputs.insert(file_number);
        file_number
    };

    let table_path = state.file_names.table_path(file_number);
    let file = state.fs.create_file(&table_path, false)?;
    job.builder = Some(TableBuilder::new(state.options.clone(), file));
    job.current_file_number = file_number;
    job.current_smallest = None;
    job.current_largest = None;

    Ok(())
}

/// Finish the open output table file and record it.
fn finish_compaction_output_file(
    state: &Arc<DbState>,
    job: &mut CompactionJob,
) -> StrataResult<()> {
    let mut builder = job
        .builder
        .take()
        .expect("Finishing an output file requires an open builder.");
    debug_assert!(builder.num_entries() > 0);

    builder.finish()?;
    builder.sync()?;

    let output = CompactionOutput {
        file_number: job.current_file_number,
        file_size: builder.file_size(),
        smallest: job
            .current_smallest
            .take()
            .expect("A non-empty output has a smallest key."),
        largest: job
            .current_largest
            .take()
            .expect("A non-empty output has a largest key."),
    };
    log::debug!(
        "Compaction output {file_number}: {entries} entries, {size} bytes.",
        file_number = output.file_number,
        entries = builder.num_entries(),
        size = output.file_size,
    );

    // Sanity-check that the file opens before relying on it.
    state
        .table_cache
        .find_table(output.file_number, output.file_size)?;
    job.outputs.push(output);

    Ok(())
}

/// Apply the compaction's edit: drop inputs, install outputs.
fn install_compaction_results(
    guard: &mut MutexGuard<'_, GuardedDbFields>,
    job: &mut CompactionJob,
) -> StrataResult<()> {
    job.compaction.add_input_deletions();
    let output_level = job.compaction.level() + 1;
    for output in job.outputs.iter() {
        job.compaction.edit.add_file(
            output_level,
            Arc::new(FileMetadata::new(
                output.file_number,
                output.file_size,
                output.smallest.clone(),
                output.largest.clone(),
            )),
        );
    }

    let edit = std::mem::take(&mut job.compaction.edit);
    VersionSet::log_and_apply(guard, edit)
}

/// Delete files no live version, pending output, or active log references.
fn remove_obsolete_files(state: &Arc<DbState>, guard: &mut MutexGuard<'_, GuardedDbFields>) {
    if guard.bg_error.is_some() {
        // After a background error the version edit that would have
        // reflected reality may never have landed; deleting by it would be
        // guesswork.
        return;
    }

    let mut live = guard.pending_outputs.clone();
    live.extend(guard.version_set.live_files());
    let log_number = guard.version_set.log_number();
    let prev_log_number = guard.version_set.prev_log_number();
    let manifest_number = guard.version_set.manifest_file_number();

    let paths = match state.fs.list_dir(state.file_names.db_path()) {
        Ok(paths) => paths,
        Err(error) => {
            log::warn!("Could not list the database directory: {error}.");
            return;
        }
    };

    let mut to_delete = vec![];
    for path in paths {
        let parsed = match FileNameHandler::parse_file_name(&path) {
            Ok(parsed) => parsed,
            // Foreign files are none of our business.
            Err(_) => continue,
        };

        let keep = match parsed {
            ParsedFileType::WriteAheadLog(number) => {
                number >= log_number || number == prev_log_number
            }
            ParsedFileType::ManifestFile(number) => number >= manifest_number,
            ParsedFileType::TableFile(number) => live.contains(&number),
            ParsedFileType::TempFile(number) => live.contains(&number),
            ParsedFileType::CurrentFile
            | ParsedFileType::DbLockFile
            | ParsedFileType::InfoLogFile => true,
        };

        if !keep {
            if let ParsedFileType::TableFile(number) = parsed {
                state.table_cache.evict(number);
            }
            to_delete.push(path);
        }
    }

    // The actual unlinking happens with the mutex released; everything
    // being deleted is unreachable from any live state.
    MutexGuard::unlocked(guard, || {
        for path in to_delete {
            log::info!("Deleting obsolete file {path:?}.");
            if let Err(error) = state.fs.remove_file(&path) {
                log::warn!("Could not delete {path:?}: {error}.");
            }
        }
    });
}

/// Recover the persistent state, replaying WALs newer than the manifest.
fn recover(
    state: &Arc<DbState>,
    guard: &mut MutexGuard<'_, GuardedDbFields>,
    edit: &mut VersionEdit,
) -> StrataResult<bool> {
    let current_path = state.file_names.current_path();
    if !state.fs.exists(&current_path) {
        if !state.options.create_if_missing {
            return Err(StrataError::InvalidArgument(format!(
                "The database at {:?} does not exist and create_if_missing is off.",
                state.file_names.db_path()
            )));
        }
        new_db(state)?;
    } else if state.options.error_if_exists {
        return Err(StrataError::InvalidArgument(format!(
            "The database at {:?} already exists and error_if_exists is on.",
            state.file_names.db_path()
        )));
    }

    let mut save_manifest = guard.version_set.recover()?;

    // Any WAL at or past the manifest's log number holds writes newer than
    // the manifest; replay them in order. Along the way, verify that every
    // table file the manifest expects actually exists.
    let min_log = guard.version_set.log_number();
    let prev_log = guard.version_set.prev_log_number();
    let mut expected_files = guard.version_set.live_files();
    let mut log_numbers = vec![];
    for path in state.fs.list_dir(state.file_names.db_path())? {
        if let Ok(parsed) = FileNameHandler::parse_file_name(&path) {
            match parsed {
                ParsedFileType::TableFile(number) => {
                    expected_files.remove(&number);
                }
                ParsedFileType::WriteAheadLog(number) => {
                    expected_files.remove(&number);
                    if number >= min_log || number == prev_log {
                        log_numbers.push(number);
                    }
                }
                _ => {}
            }
        }
    }
    if !expected_files.is_empty() {
        return Err(StrataError::Corruption(format!(
            "{} table files referenced by the manifest are missing, e.g. file {}.",
            expected_files.len(),
            expected_files.iter().next().unwrap()
        )));
    }

    log_numbers.sort_unstable();
    let mut max_sequence = 0;
    for (index, log_number) in log_numbers.iter().enumerate() {
        let is_last = index == log_numbers.len() - 1;
        let flushed =
            recover_log_file(state, guard, *log_number, is_last, edit, &mut max_sequence)?;
        save_manifest |= flushed;
        guard.version_set.mark_file_number_used(*log_number);
    }

    if guard.version_set.last_sequence() < max_sequence {
        guard.version_set.set_last_sequence(max_sequence);
    }

    Ok(save_manifest)
}

/// Initialize a fresh database: manifest one, pointing CURRENT at it.
fn new_db(state: &Arc<DbState>) -> StrataResult<()> {
    log::info!("Creating a fresh database at {:?}.", state.file_names.db_path());
    let mut edit = VersionEdit::new();
    edit.comparator_name = Some(state.options.comparator.name().to_string());
    edit.log_number = Some(0);
    edit.next_file_number = Some(2);
    edit.last_sequence = Some(0);

    let manifest_path = state.file_names.manifest_path(1);
    {
        let file = state.fs.create_file(&manifest_path, false)?;
        let mut writer = LogWriter::new(file, 0);
        writer.add_record(&edit.encode())?;
        writer.sync()?;
    }

    match set_current_file(state.fs.as_ref(), &state.file_names, 1) {
        Ok(()) => Ok(()),
        Err(error) => {
            let _ = state.fs.remove_file(&manifest_path);
            Err(error)
        }
    }
}

/// Replay one WAL into memtables, flushing to level 0 as they fill.
fn recover_log_file(
    state: &Arc<DbState>,
    guard: &mut MutexGuard<'_, GuardedDbFields>,
    log_number: u64,
    is_last_log: bool,
    edit: &mut VersionEdit,
    max_sequence: &mut u64,
) -> StrataResult<bool> {
    let wal_path = state.file_names.wal_path(log_number);
    log::info!("Replaying write-ahead log {wal_path:?}.");
    let file = state.fs.open_file(&wal_path)?;

    // In paranoid mode any corruption aborts the recovery; otherwise the
    // damage is logged and the log is cut short at that point.
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
    let read_error = Arc::new(Mutex::new(None));
    let mut reader = LogReader::new(
        file,
        Some(Box::new(Reporter {
            error: Arc::clone(&read_error),
        })),
        true,
        0,
    );

    let mut memtable: Option<Arc<MemTable>> = None;
    let mut flushes = 0;
    let mut save_manifest = false;

    while let Some(record) = reader.read_record().map_err(StrataError::from)? {
        if state.options.paranoid_checks {
            if let Some(reason) = read_error.lock().clone() {
                return Err(StrataError::Corruption(format!(
                    "Corruption in write-ahead log {log_number}: {reason}."
                )));
            }
        }

        let batch = match Batch::from_contents(record) {
            Ok(batch) => batch,
            Err(error) => {
                log::warn!("Skipping a malformed record in log {log_number}: {error}.");
                continue;
            }
        };

        let target = memtable.get_or_insert_with(|| Arc::new(MemTable::new()));
        batch.apply_to_memtable(target)?;

        let batch_last_sequence = batch.sequence_number() + batch.count() as u64 - 1;
        if batch_last_sequence > *max_sequence {
            *max_sequence = batch_last_sequence;
        }

        if target.approximate_memory_usage() > state.options.write_buffer_size {
            flushes += 1;
            save_manifest = true;
            write_level0_table(state, guard, target, edit, None)?;
            memtable = None;
        }
    }

    if state.options.paranoid_checks {
        if let Some(reason) = read_error.lock().clone() {
            return Err(StrataError::Corruption(format!(
                "Corruption in write-ahead log {log_number}: {reason}."
            )));
        }
    }

    // With `reuse_logs`, adopt the tail log and its memtable instead of
    // rolling new files on every restart.
    if state.options.reuse_logs && is_last_log && flushes == 0 {
        let existing_size = state.fs.file_size(&wal_path).map_err(StrataError::from)?;
        let appendable = state.fs.create_file(&wal_path, true)?;
        log::info!("Reusing write-ahead log {wal_path:?} ({existing_size} bytes).");
        guard.wal = Some(Arc::new(Mutex::new(LogWriter::new(
            appendable,
            existing_size,
        ))));
        guard.wal_file_number = log_number;
        if let Some(recovered) = memtable.take() {
            guard.memtable = recovered;
        }
    }

    if let Some(remaining) = memtable {
        if !remaining.is_empty() {
            save_manifest = true;
            write_level0_table(state, guard, &remaining, edit, None)?;
        }
    }

    Ok(save_manifest)
}
