/*!
The framed log format used by both write-ahead logs and manifest files.

A log file is a sequence of 32 KiB blocks. Each block holds zero or more
physical records with a 7-byte header: a 4-byte masked CRC32C, a 2-byte
little-endian payload length, and a 1-byte record type. The checksum covers
the type byte followed by the payload.

A logical record that does not fit in the current block is split into
`First`/`Middle`/`Last` fragments; a record that fits whole is written as
`Full`. A record never starts within the last six bytes of a block (the
header would not fit), so a writer arriving there pads the remainder with
zeroes and the reader skips it as trailer.

The reader reports damage (bad checksum, bad length, orphaned fragments) to
a [`CorruptionReporter`] and resynchronizes at the next block boundary, so a
single torn write does not take out the rest of the file.
*/

use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;

use integer_encoding::FixedInt;

use crate::errors::{LogIoError, LogIoResult};
use crate::fs::{AppendableFile, ReadonlyRandomAccessFile};
use crate::utils::crc::{mask_checksum, unmask_checksum, CRC_CALCULATOR};

/// The length of record headers: checksum + length + record type.
const HEADER_LENGTH_BYTES: usize = 4 + 2 + 1;

/// The size of blocks in the log file format.
pub(crate) const BLOCK_SIZE_BYTES: usize = 32 * 1024;

/**
Record types denote whether a physical record carries a complete logical
record or one of its fragments.
*/
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RecordType {
    /// The record contains the entirety of a logical record.
    Full = 1,
    /// The first fragment of a logical record.
    First = 2,
    /// An interior fragment of a logical record.
    Middle = 3,
    /// The last fragment of a logical record.
    Last = 4,
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<RecordType, u8> {
        match value {
            1 => Ok(RecordType::Full),
            2 => Ok(RecordType::First),
            3 => Ok(RecordType::Middle),
            4 => Ok(RecordType::Last),
            other => Err(other),
        }
    }
}

/// Receives notice of corrupted regions encountered while reading a log.
pub(crate) trait CorruptionReporter: Send {
    /// `bytes_dropped` were skipped because of the condition in `reason`.
    fn corruption(&mut self, bytes_dropped: usize, reason: &str);
}

/// Handles all write activity to a log file.
pub(crate) struct LogWriter {
    /// The underlying file representing the log.
    file: Box<dyn AppendableFile>,

    /**
    The write offset within the current block.

    Never more than [`BLOCK_SIZE_BYTES`]; the writer switches blocks by
    padding when fewer than [`HEADER_LENGTH_BYTES`] remain.
    */
    current_block_offset: usize,
}

/// Crate-only methods
impl LogWriter {
    /**
    Construct a new [`LogWriter`].

    `initial_length` is the number of bytes already in the file, used when
    appending to a log that survived a restart.
    */
    pub(crate) fn new(file: Box<dyn AppendableFile>, initial_length: u64) -> Self {
        Self {
            file,
            current_block_offset: (initial_length as usize) % BLOCK_SIZE_BYTES,
        }
    }

    /// Append a logical record to the log, fragmenting it over blocks as needed.
    pub(crate) fn add_record(&mut self, data: &[u8]) -> LogIoResult<()> {
        let mut remaining = data;
        let mut is_first_fragment = true;

        // A do-while formulation: an empty `data` still emits one empty
        // `Full` record.
        loop {
            let space_in_block = BLOCK_SIZE_BYTES - self.current_block_offset;
            if space_in_block < HEADER_LENGTH_BYTES {
                // Not even a header fits; pad the tail with zeroes and
                // switch to a new block.
                if space_in_block > 0 {
                    self.file.append(&[0; HEADER_LENGTH_BYTES - 1][..space_in_block])?;
                }
                self.current_block_offset = 0;
            }

            let space_for_payload =
                BLOCK_SIZE_BYTES - self.current_block_offset - HEADER_LENGTH_BYTES;
            let fragment_length = std::cmp::min(remaining.len(), space_for_payload);
            let is_last_fragment = fragment_length == remaining.len();

            let record_type = match (is_first_fragment, is_last_fragment) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(record_type, &remaining[..fragment_length])?;
            remaining = &remaining[fragment_length..];
            is_first_fragment = false;

            if remaining.is_empty() {
                break;
            }
        }

        Ok(())
    }

    /// Force everything appended so far to durable storage.
    pub(crate) fn sync(&mut self) -> LogIoResult<()> {
        self.file.sync()?;
        Ok(())
    }
}

/// Private methods
impl LogWriter {
    fn emit_physical_record(
        &mut self,
        record_type: RecordType,
        payload: &[u8],
    ) -> LogIoResult<()> {
        debug_assert!(
            self.current_block_offset + HEADER_LENGTH_BYTES + payload.len() <= BLOCK_SIZE_BYTES
        );

        // The stored checksum covers the type byte and the payload.
        let mut digest = CRC_CALCULATOR.digest();
        digest.update(&[record_type as u8]);
        digest.update(payload);
        let checksum = mask_checksum(digest.finalize());

        let mut header = Vec::with_capacity(HEADER_LENGTH_BYTES);
        header.extend(u32::encode_fixed_vec(checksum));
        header.extend(u16::encode_fixed_vec(payload.len() as u16));
        header.push(record_type as u8);

        self.file.append(&header)?;
        self.file.append(payload)?;
        self.file.flush()?;
        self.current_block_offset += HEADER_LENGTH_BYTES + payload.len();

        Ok(())
    }
}

impl fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogWriter")
            .field("current_block_offset", &self.current_block_offset)
            .finish()
    }
}

/// The outcome of reading one physical record.
enum PhysicalRecord {
    /// A record parsed cleanly.
    Record {
        record_type: RecordType,
        payload: Vec<u8>,
        /// File offset at which the record's header begins.
        offset: u64,
    },
    /// A record was damaged; the reader has skipped past it.
    Bad,
    /// The end of the file was reached.
    Eof,
}

/// Handles all read activity on a log file.
pub(crate) struct LogReader {
    /// The underlying file representing the log.
    file: Arc<dyn ReadonlyRandomAccessFile>,

    /// Destination for corruption notices. `None` drops them silently.
    reporter: Option<Box<dyn CorruptionReporter>>,

    /// Whether record checksums are verified before use.
    verify_checksums: bool,

    /// Byte offset at which reading starts.
    initial_offset: u64,

    /// Contents of the block currently being consumed.
    buffer: Vec<u8>,

    /// Read position within `buffer`.
    buffer_offset: usize,

    /// File offset just past the bytes currently in `buffer`.
    end_of_buffer_offset: u64,

    /// Whether the end of the underlying file has been reached.
    reached_eof: bool,

    /// The file offset at which the most recent logical record began.
    last_record_offset: u64,

    /// True while skipping fragments that started before `initial_offset`.
    resyncing: bool,
}

/// Crate-only methods
impl LogReader {
    /// Construct a new [`LogReader`] starting at `initial_offset`.
    pub(crate) fn new(
        file: Arc<dyn ReadonlyRandomAccessFile>,
        reporter: Option<Box<dyn CorruptionReporter>>,
        verify_checksums: bool,
        initial_offset: u64,
    ) -> Self {
        Self {
            file,
            reporter,
            verify_checksums,
            initial_offset,
            buffer: vec![],
            buffer_offset: 0,
            end_of_buffer_offset: 0,
            reached_eof: false,
            last_record_offset: 0,
            resyncing: initial_offset > 0,
        }
    }

    /**
    Read the next logical record.

    Returns `Ok(None)` at the end of the log. Damaged regions are reported
    to the corruption reporter and skipped rather than surfaced as errors;
    only I/O failures from the underlying file produce an `Err`.
    */
    pub(crate) fn read_record(&mut self) -> LogIoResult<Option<Vec<u8>>> {
        if self.end_of_buffer_offset == 0 && self.initial_offset > 0 {
            self.seek_to_initial_block()?;
        }

        let mut assembled: Vec<u8> = vec![];
        let mut in_fragmented_record = false;
        // The offset of the first fragment of the record being assembled.
        let mut prospective_record_offset = 0;

        loop {
            match self.read_physical_record()? {
                PhysicalRecord::Record {
                    record_type,
                    payload,
                    offset,
                } => {
                    if self.resyncing {
                        // Skip the tail of a record that began before the
                        // initial offset.
                        match record_type {
                            RecordType::Middle | RecordType::Last => continue,
                            _ => self.resyncing = false,
                        }
                    }

                    match record_type {
                        RecordType::Full => {
                            if in_fragmented_record {
                                self.report_corruption(
                                    assembled.len(),
                                    "partial record without end",
                                );
                            }
                            self.last_record_offset = offset;
                            return Ok(Some(payload));
                        }
                        RecordType::First => {
                            if in_fragmented_record {
                                self.report_corruption(
                                    assembled.len(),
                                    "partial record without end",
                                );
                            }
                            prospective_record_offset = offset;
                            assembled = payload;
                            in_fragmented_record = true;
                        }
                        RecordType::Middle => {
                            if !in_fragmented_record {
                                self.report_corruption(
                                    payload.len(),
                                    "missing start of fragmented record",
                                );
                            } else {
                                assembled.extend(payload);
                            }
                        }
                        RecordType::Last => {
                            if !in_fragmented_record {
                                self.report_corruption(
                                    payload.len(),
                                    "missing start of fragmented record",
                                );
                            } else {
                                assembled.extend(payload);
                                self.last_record_offset = prospective_record_offset;
                                return Ok(Some(assembled));
                            }
                        }
                    }
                }
                PhysicalRecord::Bad => {
                    if in_fragmented_record {
                        self.report_corruption(assembled.len(), "error in middle of record");
                        in_fragmented_record = false;
                        assembled.clear();
                    }
                }
                PhysicalRecord::Eof => {
                    // A truncated final record (the writer crashed mid
                    // append) is dropped without a corruption report; it was
                    // never acknowledged.
                    return Ok(None);
                }
            }
        }
    }

    /// The file offset at which the most recently returned record began.
    pub(crate) fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }
}

/// Private methods
impl LogReader {
    /// Position the buffer at the block containing `initial_offset`.
    fn seek_to_initial_block(&mut self) -> LogIoResult<()> {
        let offset_in_block = (self.initial_offset as usize) % BLOCK_SIZE_BYTES;
        let mut block_start = self.initial_offset - offset_in_block as u64;

        // An initial offset inside the block trailer belongs to the next block.
        if offset_in_block > BLOCK_SIZE_BYTES - HEADER_LENGTH_BYTES + 1 {
            block_start += BLOCK_SIZE_BYTES as u64;
        }

        self.end_of_buffer_offset = block_start;
        Ok(())
    }

    /// Read and validate the next physical record, refilling block buffers as needed.
    fn read_physical_record(&mut self) -> LogIoResult<PhysicalRecord> {
        loop {
            let remaining = self.buffer.len() - self.buffer_offset;
            if remaining < HEADER_LENGTH_BYTES {
                if !self.reached_eof {
                    // The remainder of a block is zero-padded trailer; drop
                    // it and read the next block.
                    self.buffer.clear();
                    self.buffer_offset = 0;

                    let mut block = vec![0; BLOCK_SIZE_BYTES];
                    let bytes_read = self
                        .file
                        .read_from(&mut block, self.end_of_buffer_offset)
                        .map_err(LogIoError::from)?;
                    block.truncate(bytes_read);
                    self.end_of_buffer_offset += bytes_read as u64;
                    self.buffer = block;
                    if self.buffer.len() < BLOCK_SIZE_BYTES {
                        self.reached_eof = true;
                    }
                    continue;
                }

                // A header that runs past the end of the file was a write in
                // flight when the writer died; treat it as a clean end.
                return Ok(PhysicalRecord::Eof);
            }

            let header = &self.buffer[self.buffer_offset..self.buffer_offset + HEADER_LENGTH_BYTES];
            let stored_checksum = u32::decode_fixed(&header[0..4]);
            let payload_length = u16::decode_fixed(&header[4..6]) as usize;
            let raw_type = header[6];

            if HEADER_LENGTH_BYTES + payload_length > remaining {
                let dropped = remaining;
                self.drop_rest_of_buffer();
                if !self.reached_eof {
                    self.report_corruption(dropped, "bad record length");
                    return Ok(PhysicalRecord::Bad);
                }
                // The writer died mid-write; no corruption to report.
                return Ok(PhysicalRecord::Eof);
            }

            let record_type = match RecordType::try_from(raw_type) {
                Ok(record_type) => record_type,
                Err(unknown) => {
                    let dropped = remaining;
                    self.drop_rest_of_buffer();
                    self.report_corruption(dropped, &format!("unknown record type {unknown}"));
                    return Ok(PhysicalRecord::Bad);
                }
            };

            let payload_start = self.buffer_offset + HEADER_LENGTH_BYTES;
            let payload = &self.buffer[payload_start..payload_start + payload_length];

            if self.verify_checksums {
                let mut digest = CRC_CALCULATOR.digest();
                digest.update(&[raw_type]);
                digest.update(payload);
                if digest.finalize() != unmask_checksum(stored_checksum) {
                    // The whole rest of the block is suspect: the length
                    // field itself may be corrupted, and trusting it could
                    // make us skip into the middle of a real record.
                    let dropped = remaining;
                    self.drop_rest_of_buffer();
                    self.report_corruption(dropped, "checksum mismatch");
                    return Ok(PhysicalRecord::Bad);
                }
            }

            let record_offset = self.end_of_buffer_offset
                - (self.buffer.len() - self.buffer_offset) as u64;
            let payload = payload.to_vec();
            self.buffer_offset += HEADER_LENGTH_BYTES + payload_length;

            // Skip records that ended before the initial offset.
            if (record_offset + (HEADER_LENGTH_BYTES + payload_length) as u64)
                < self.initial_offset
            {
                continue;
            }

            return Ok(PhysicalRecord::Record {
                record_type,
                payload,
                offset: record_offset,
            });
        }
    }

    /// Abandon the rest of the current block (corruption resynchronization).
    fn drop_rest_of_buffer(&mut self) {
        self.buffer_offset = self.buffer.len();
    }

    fn report_corruption(&mut self, bytes_dropped: usize, reason: &str) {
        log::warn!("Log read dropped {bytes_dropped} bytes: {reason}.");
        if let Some(reporter) = self.reporter.as_mut() {
            reporter.corruption(bytes_dropped, reason);
        }
    }
}

impl fmt::Debug for LogReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogReader")
            .field("initial_offset", &self.initial_offset)
            .field("last_record_offset", &self.last_record_offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use crate::fs::{FileSystem, InMemoryFileSystem};

    use super::*;

    /// Collects corruption reports for assertions.
    #[derive(Clone, Default)]
    struct CountingReporter {
        events: Arc<Mutex<Vec<(usize, String)>>>,
    }

    impl CorruptionReporter for CountingReporter {
        fn corruption(&mut self, bytes_dropped: usize, reason: &str) {
            self.events
                .lock()
                .unwrap()
                .push((bytes_dropped, reason.to_string()));
        }
    }

    fn log_path() -> PathBuf {
        PathBuf::from("/logs/000001.log")
    }

    fn write_records(fs: &InMemoryFileSystem, records: &[Vec<u8>]) {
        let file = fs.create_file(&log_path(), false).unwrap();
        let mut writer = LogWriter::new(file, 0);
        for record in records {
            writer.add_record(record).unwrap();
        }
    }

    fn read_all(fs: &InMemoryFileSystem, reporter: Option<CountingReporter>) -> Vec<Vec<u8>> {
        let file = fs.open_file(&log_path()).unwrap();
        let boxed_reporter: Option<Box<dyn CorruptionReporter>> = match reporter {
            Some(r) => Some(Box::new(r)),
            None => None,
        };
        let mut reader = LogReader::new(file, boxed_reporter, true, 0);

        let mut records = vec![];
        while let Some(record) = reader.read_record().unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn small_records_round_trip() {
        let fs = InMemoryFileSystem::new();
        let records = vec![b"foo".to_vec(), b"bar".to_vec(), vec![], b"xxxx".to_vec()];
        write_records(&fs, &records);

        assert_eq!(read_all(&fs, None), records);
    }

    #[test]
    fn records_spanning_multiple_blocks_are_reassembled() {
        let fs = InMemoryFileSystem::new();
        // Three records where the middle one spans more than two blocks.
        let records = vec![
            vec![b'a'; 25_000],
            vec![b'b'; 70_000],
            vec![b'c'; 8],
        ];
        write_records(&fs, &records);

        let read_back = read_all(&fs, None);
        assert_eq!(read_back.len(), 3);
        assert_eq!(read_back, records);
    }

    #[test]
    fn block_trailers_are_padded_and_skipped() {
        let fs = InMemoryFileSystem::new();
        // The first record leaves fewer than seven bytes in the block so the
        // writer must pad and switch blocks for the second record.
        let first_length = BLOCK_SIZE_BYTES - HEADER_LENGTH_BYTES - 3;
        let records = vec![vec![b'p'; first_length], b"after the pad".to_vec()];
        write_records(&fs, &records);

        assert_eq!(
            fs.file_size(&log_path()).unwrap() as usize,
            BLOCK_SIZE_BYTES + HEADER_LENGTH_BYTES + records[1].len(),
            "The trailer must be zero-filled so the next record starts a fresh block."
        );
        assert_eq!(read_all(&fs, None), records);
    }

    #[test]
    fn a_corrupted_record_is_reported_and_skipped_to_the_next_block() {
        let fs = InMemoryFileSystem::new();
        // Two records in the first block, one in the second.
        let records = vec![
            b"first victim".to_vec(),
            b"collateral damage in the same block".to_vec(),
            vec![b'z'; BLOCK_SIZE_BYTES], // forces content into block two
        ];
        write_records(&fs, &records);

        // Flip a payload byte of the first record.
        let contents_handle = fs.open_file(&log_path()).unwrap();
        let mut raw = vec![0; contents_handle.len().unwrap() as usize];
        contents_handle.read_from(&mut raw, 0).unwrap();
        raw[HEADER_LENGTH_BYTES] ^= 0xff;
        let mut rewrite = fs.create_file(&log_path(), false).unwrap();
        rewrite.append(&raw).unwrap();
        drop(rewrite);

        let reporter = CountingReporter::default();
        let read_back = read_all(&fs, Some(reporter.clone()));

        // Both records in the damaged block are gone; resynchronization
        // recovers everything from the next block on.
        assert_eq!(read_back.len(), 1);
        assert_eq!(read_back[0].len(), BLOCK_SIZE_BYTES);
        let events = reporter.events.lock().unwrap();
        assert!(!events.is_empty(), "The corruption must be reported.");
        assert!(events[0].1.contains("checksum"));
    }

    #[test]
    fn a_truncated_final_record_is_dropped_silently() {
        let fs = InMemoryFileSystem::new();
        write_records(&fs, &[b"whole".to_vec(), b"will be truncated".to_vec()]);

        // Chop the file in the middle of the second record's payload.
        let contents_handle = fs.open_file(&log_path()).unwrap();
        let full_length = contents_handle.len().unwrap() as usize;
        let mut raw = vec![0; full_length - 6];
        contents_handle.read_from(&mut raw, 0).unwrap();
        let mut rewrite = fs.create_file(&log_path(), false).unwrap();
        rewrite.append(&raw).unwrap();
        drop(rewrite);

        let reporter = CountingReporter::default();
        let read_back = read_all(&fs, Some(reporter.clone()));

        assert_eq!(read_back, vec![b"whole".to_vec()]);
        assert!(
            reporter.events.lock().unwrap().is_empty(),
            "A record the writer never finished is not corruption."
        );
    }

    #[test]
    fn last_record_offset_points_at_the_start_of_the_record() {
        let fs = InMemoryFileSystem::new();
        let records = vec![b"aaa".to_vec(), vec![b'b'; 40_000], b"ccc".to_vec()];
        write_records(&fs, &records);

        let file = fs.open_file(&log_path()).unwrap();
        let mut reader = LogReader::new(file, None, true, 0);

        reader.read_record().unwrap().unwrap();
        assert_eq!(reader.last_record_offset(), 0);

        reader.read_record().unwrap().unwrap();
        let second_offset = reader.last_record_offset();
        assert_eq!(second_offset, (HEADER_LENGTH_BYTES + 3) as u64);

        reader.read_record().unwrap().unwrap();
        assert!(
            reader.last_record_offset() > second_offset,
            "Offsets must be monotonically increasing across records."
        );
    }

    #[test]
    fn appending_after_reopen_continues_mid_block() {
        let fs = InMemoryFileSystem::new();
        write_records(&fs, &[b"before reopen".to_vec()]);

        let existing_length = fs.file_size(&log_path()).unwrap();
        let file = fs.create_file(&log_path(), true).unwrap();
        let mut writer = LogWriter::new(file, existing_length);
        writer.add_record(b"after reopen").unwrap();

        assert_eq!(
            read_all(&fs, None),
            vec![b"before reopen".to_vec(), b"after reopen".to_vec()]
        );
    }
}
