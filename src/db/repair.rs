/*!
Best-effort repair of a database whose manifest is lost or damaged.

The repair discards all manifests, converts every surviving write-ahead log
into a level-0 table, re-derives each table file's key range by scanning
it, and writes a fresh manifest describing everything found. Some data may
be resurrected from before a deletion (tombstones dropped by past
compactions are gone), but no acknowledged write that still has bytes on
disk is lost.
*/

use std::sync::Arc;

use crate::batch::Batch;
use crate::errors::{StrataError, StrataResult};
use crate::file_names::{FileNameHandler, ParsedFileType};
use crate::iterator::StorageIterator;
use crate::key::{parse_internal_key, InternalKey};
use crate::logs::{LogReader, LogWriter};
use crate::memtable::MemTable;
use crate::options::{DbOptions, ReadOptions};
use crate::tables::{Table, TableBuilder};
use crate::versioning::file_metadata::FileMetadata;
use crate::versioning::version_edit::VersionEdit;
use crate::versioning::version_set::set_current_file;

/// Everything learned about one recovered table file.
struct TableInfo {
    metadata: FileMetadata,
    max_sequence: u64,
}

/// Rebuild a usable manifest for the (closed) database at `db_path`.
pub(crate) fn repair(options: &DbOptions, db_path: &str) -> StrataResult<()> {
    let fs = Arc::clone(&options.filesystem_provider);
    let file_names = FileNameHandler::new(db_path);
    let _lock = fs.lock_file(&file_names.lock_path())?;
    log::info!("Repairing the database at {db_path}.");

    // Inventory the directory.
    let mut log_numbers = vec![];
    let mut table_numbers = vec![];
    let mut manifest_paths = vec![];
    let mut max_file_number = 1;
    for path in fs.list_dir(file_names.db_path())? {
        match FileNameHandler::parse_file_name(&path) {
            Ok(ParsedFileType::WriteAheadLog(number)) => {
                log_numbers.push(number);
                max_file_number = max_file_number.max(number);
            }
            Ok(ParsedFileType::TableFile(number)) => {
                table_numbers.push(number);
                max_file_number = max_file_number.max(number);
            }
            Ok(ParsedFileType::ManifestFile(number)) => {
                manifest_paths.push(path);
                max_file_number = max_file_number.max(number);
            }
            Ok(ParsedFileType::TempFile(number)) => {
                max_file_number = max_file_number.max(number);
                let _ = fs.remove_file(&path);
            }
            _ => {}
        }
    }
    let mut next_file_number = max_file_number + 1;

    // Convert surviving logs into tables so their writes are not lost.
    log_numbers.sort_unstable();
    let mut tables = vec![];
    for log_number in log_numbers {
        let table_number = next_file_number;
        next_file_number += 1;
        match convert_log_to_table(options, &file_names, log_number, table_number) {
            Ok(Some(info)) => {
                tables.push(info);
                let _ = fs.remove_file(&file_names.wal_path(log_number));
            }
            Ok(None) => {
                // The log held no usable records.
                let _ = fs.remove_file(&file_names.wal_path(log_number));
            }
            Err(error) => {
                log::warn!("Could not convert log {log_number} to a table: {error}.");
            }
        }
    }

    // Re-derive the key range of every table by scanning it.
    for table_number in table_numbers {
        match scan_table(options, &file_names, table_number) {
            Ok(info) => tables.push(info),
            Err(error) => {
                log::warn!(
                    "Table file {table_number} is unreadable and will be dropped from the \
                    repaired database: {error}."
                );
            }
        }
    }

    // Write a fresh manifest listing everything at level 0.
    let max_sequence = tables
        .iter()
        .map(|info| info.max_sequence)
        .max()
        .unwrap_or(0);
    let mut edit = VersionEdit::new();
    edit.comparator_name = Some(options.comparator.name().to_string());
    edit.log_number = Some(0);
    edit.next_file_number = Some(next_file_number + 1);
    edit.last_sequence = Some(max_sequence);
    let recovered_count = tables.len();
    for info in tables {
        edit.add_file(0, Arc::new(info.metadata));
    }

    let manifest_number = next_file_number;
    let manifest_path = file_names.manifest_path(manifest_number);
    {
        let file = fs.create_file(&manifest_path, false)?;
        let mut writer = LogWriter::new(file, 0);
        writer.add_record(&edit.encode())?;
        writer.sync()?;
    }
    set_current_file(fs.as_ref(), &file_names, manifest_number)?;

    // The old manifests are superseded.
    for path in manifest_paths {
        let _ = fs.remove_file(&path);
    }

    log::info!(
        "Repair complete: {recovered_count} tables recovered, last sequence {max_sequence}."
    );
    Ok(())
}

/// Replay one log's batches into a memtable and flush it to a table file.
fn convert_log_to_table(
    options: &DbOptions,
    file_names: &FileNameHandler,
    log_number: u64,
    table_number: u64,
) -> StrataResult<Option<TableInfo>> {
    let fs = &options.filesystem_provider;
    let wal_path = file_names.wal_path(log_number);
    let file = fs.open_file(&wal_path)?;
    // Damage just truncates the replay; repair keeps whatever parses.
    let mut reader = LogReader::new(file, None, true, 0);

    let memtable = MemTable::new();
    let mut max_sequence = 0;
    while let Some(record) = reader.read_record().map_err(StrataError::from)? {
        let batch = match Batch::from_contents(record) {
            Ok(batch) => batch,
            Err(error) => {
                log::warn!("Skipping a malformed batch in log {log_number}: {error}.");
                continue;
            }
        };
        if let Err(error) = batch.apply_to_memtable(&memtable) {
            log::warn!("Skipping an unusable batch in log {log_number}: {error}.");
            continue;
        }
        max_sequence = max_sequence.max(batch.sequence_number() + batch.count() as u64 - 1);
    }

    let memtable = Arc::new(memtable);
    let mut iter = memtable.iter();
    iter.seek_to_first();
    if !iter.valid() {
        return Ok(None);
    }

    let table_path = file_names.table_path(table_number);
    let file = fs.create_file(&table_path, false)?;
    let mut builder = TableBuilder::new(options.clone(), file);
    let smallest = InternalKey::decode(iter.key().to_vec())?;
    let mut largest = smallest.clone();
    while iter.valid() {
        largest = InternalKey::decode(iter.key().to_vec())?;
        builder.add(iter.key(), iter.value())?;
        iter.next();
    }
    builder.finish()?;
    builder.sync()?;

    log::info!(
        "Converted log {log_number} into table {table_number} ({} bytes).",
        builder.file_size()
    );
    Ok(Some(TableInfo {
        metadata: FileMetadata::new(table_number, builder.file_size(), smallest, largest),
        max_sequence,
    }))
}

/// Scan a table file to recover its key range and newest sequence number.
fn scan_table(
    options: &DbOptions,
    file_names: &FileNameHandler,
    table_number: u64,
) -> StrataResult<TableInfo> {
    let fs = &options.filesystem_provider;
    let table_path = file_names.table_path(table_number);
    let path = if fs.exists(&table_path) {
        table_path
    } else {
        file_names.legacy_table_path(table_number)
    };

    let file_size = fs.file_size(&path).map_err(StrataError::from)?;
    let file = fs.open_file(&path)?;
    let table = Arc::new(Table::open(options.clone(), file, file_size)?);

    let read_options = ReadOptions {
        verify_checksums: options.paranoid_checks,
        fill_cache: false,
        snapshot: None,
    };
    let mut iter = table.iter(read_options);
    iter.seek_to_first();

    let mut smallest: Option<InternalKey> = None;
    let mut largest: Option<InternalKey> = None;
    let mut max_sequence = 0;
    let mut entries = 0usize;
    while iter.valid() {
        let key = InternalKey::decode(iter.key().to_vec())?;
        if let Some((_, sequence, _)) = parse_internal_key(key.as_bytes()) {
            max_sequence = max_sequence.max(sequence);
        }
        if smallest.is_none() {
            smallest = Some(key.clone());
        }
        largest = Some(key);
        entries += 1;
        iter.next();
    }
    iter.status()?;

    let smallest = smallest.ok_or_else(|| {
        StrataError::Corruption(format!("Table file {table_number} holds no entries."))
    })?;
    let largest = largest.expect("A non-empty scan saw a largest key.");

    log::info!("Recovered table {table_number} with {entries} entries.");
    Ok(TableInfo {
        metadata: FileMetadata::new(table_number, file_size, smallest, largest),
        max_sequence,
    })
}
