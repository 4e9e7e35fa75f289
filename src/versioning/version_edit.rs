/*!
A version edit is one delta to the set of live files, serialized as a
record in the manifest.

# Serialization

An edit is a stream of tagged fields. Each field begins with a varint32
tag; scalar fields are varint64 values, keys are length-prefixed, and the
repeated fields (compact pointers, deleted files, new files) may appear any
number of times.
*/

use std::sync::Arc;

use integer_encoding::VarInt;

use crate::config::MAX_NUM_LEVELS;
use crate::errors::{StrataError, StrataResult};
use crate::key::InternalKey;
use crate::utils::coding::{get_length_prefixed_slice, put_length_prefixed_slice};

use super::file_metadata::FileMetadata;

/// Field tags of the serialized form.
#[repr(u32)]
enum Tag {
    ComparatorName = 1,
    LogNumber = 2,
    NextFileNumber = 3,
    LastSequence = 4,
    CompactPointer = 5,
    DeletedFile = 6,
    NewFile = 7,
    // Tag 8 was used by an early incarnation of this format family and is
    // never written or accepted.
    PrevLogNumber = 9,
}

/// A delta over the version set's state and file lists.
#[derive(Debug, Default)]
pub(crate) struct VersionEdit {
    /// The name of the comparator the database was created with.
    pub(crate) comparator_name: Option<String>,

    /// The write-ahead log number all prior logs are obsoleted by.
    pub(crate) log_number: Option<u64>,

    /// The log number of a memtable still awaiting its flush.
    pub(crate) prev_log_number: Option<u64>,

    /// The next file number counter.
    pub(crate) next_file_number: Option<u64>,

    /// The highest sequence number applied.
    pub(crate) last_sequence: Option<u64>,

    /// Saved per-level keys at which the next compaction should start.
    pub(crate) compact_pointers: Vec<(usize, InternalKey)>,

    /// Files removed from a level, as `(level, file_number)`.
    pub(crate) deleted_files: Vec<(usize, u64)>,

    /// Files added to a level.
    pub(crate) new_files: Vec<(usize, Arc<FileMetadata>)>,
}

/// Crate-only methods
impl VersionEdit {
    /// Create an empty edit.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record the addition of a file to `level`.
    pub(crate) fn add_file(&mut self, level: usize, file: Arc<FileMetadata>) {
        debug_assert!(level < MAX_NUM_LEVELS);
        self.new_files.push((level, file));
    }

    /// Record the removal of `file_number` from `level`.
    pub(crate) fn remove_file(&mut self, level: usize, file_number: u64) {
        debug_assert!(level < MAX_NUM_LEVELS);
        self.deleted_files.push((level, file_number));
    }

    /// Serialize the edit to the tagged byte stream.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = vec![];

        if let Some(comparator_name) = self.comparator_name.as_ref() {
            buf.extend(u32::encode_var_vec(Tag::ComparatorName as u32));
            put_length_prefixed_slice(&mut buf, comparator_name.as_bytes());
        }
        if let Some(log_number) = self.log_number {
            buf.extend(u32::encode_var_vec(Tag::LogNumber as u32));
            buf.extend(u64::encode_var_vec(log_number));
        }
        if let Some(prev_log_number) = self.prev_log_number {
            buf.extend(u32::encode_var_vec(Tag::PrevLogNumber as u32));
            buf.extend(u64::encode_var_vec(prev_log_number));
        }
        if let Some(next_file_number) = self.next_file_number {
            buf.extend(u32::encode_var_vec(Tag::NextFileNumber as u32));
            buf.extend(u64::encode_var_vec(next_file_number));
        }
        if let Some(last_sequence) = self.last_sequence {
            buf.extend(u32::encode_var_vec(Tag::LastSequence as u32));
            buf.extend(u64::encode_var_vec(last_sequence));
        }

        for (level, pointer) in self.compact_pointers.iter() {
            buf.extend(u32::encode_var_vec(Tag::CompactPointer as u32));
            buf.extend(u32::encode_var_vec(*level as u32));
            put_length_prefixed_slice(&mut buf, pointer.as_bytes());
        }
        for (level, file_number) in self.deleted_files.iter() {
            buf.extend(u32::encode_var_vec(Tag::DeletedFile as u32));
            buf.extend(u32::encode_var_vec(*level as u32));
            buf.extend(u64::encode_var_vec(*file_number));
        }
        for (level, file) in self.new_files.iter() {
            buf.extend(u32::encode_var_vec(Tag::NewFile as u32));
            buf.extend(u32::encode_var_vec(*level as u32));
            buf.extend(u64::encode_var_vec(file.file_number()));
            buf.extend(u64::encode_var_vec(file.file_size()));
            put_length_prefixed_slice(&mut buf, file.smallest().as_bytes());
            put_length_prefixed_slice(&mut buf, file.largest().as_bytes());
        }

        buf
    }

    /// Deserialize an edit from the tagged byte stream.
    pub(crate) fn decode(mut buf: &[u8]) -> StrataResult<VersionEdit> {
        let mut edit = VersionEdit::new();

        while !buf.is_empty() {
            let (tag, tag_width) = u32::decode_var(buf)
                .ok_or_else(|| corruption("bad field tag"))?;
            buf = &buf[tag_width..];

            match tag {
                tag if tag == Tag::ComparatorName as u32 => {
                    let (name, consumed) = get_length_prefixed_slice(buf)
                        .ok_or_else(|| corruption("bad comparator name"))?;
                    edit.comparator_name = Some(
                        String::from_utf8(name.to_vec())
                            .map_err(|_| corruption("comparator name is not utf-8"))?,
                    );
                    buf = &buf[consumed..];
                }
                tag if tag == Tag::LogNumber as u32 => {
                    let (value, consumed) = decode_u64(buf, "log number")?;
                    edit.log_number = Some(value);
                    buf = &buf[consumed..];
                }
                tag if tag == Tag::PrevLogNumber as u32 => {
                    let (value, consumed) = decode_u64(buf, "previous log number")?;
                    edit.prev_log_number = Some(value);
                    buf = &buf[consumed..];
                }
                tag if tag == Tag::NextFileNumber as u32 => {
                    let (value, consumed) = decode_u64(buf, "next file number")?;
                    edit.next_file_number = Some(value);
                    buf = &buf[consumed..];
                }
                tag if tag == Tag::LastSequence as u32 => {
                    let (value, consumed) = decode_u64(buf, "last sequence")?;
                    edit.last_sequence = Some(value);
                    buf = &buf[consumed..];
                }
                tag if tag == Tag::CompactPointer as u32 => {
                    let (level, consumed) = decode_level(buf)?;
                    buf = &buf[consumed..];
                    let (key, consumed) = get_length_prefixed_slice(buf)
                        .ok_or_else(|| corruption("bad compact pointer key"))?;
                    edit.compact_pointers
                        .push((level, InternalKey::decode(key.to_vec())?));
                    buf = &buf[consumed..];
                }
                tag if tag == Tag::DeletedFile as u32 => {
                    let (level, consumed) = decode_level(buf)?;
                    buf = &buf[consumed..];
                    let (file_number, consumed) = decode_u64(buf, "deleted file number")?;
                    edit.deleted_files.push((level, file_number));
                    buf = &buf[consumed..];
                }
                tag if tag == Tag::NewFile as u32 => {
                    let (level, consumed) = decode_level(buf)?;
                    buf = &buf[consumed..];
                    let (file_number, consumed) = decode_u64(buf, "new file number")?;
                    buf = &buf[consumed..];
                    let (file_size, consumed) = decode_u64(buf, "new file size")?;
                    buf = &buf[consumed..];
                    let (smallest, consumed) = get_length_prefixed_slice(buf)
                        .ok_or_else(|| corruption("bad smallest key"))?;
                    let smallest = InternalKey::decode(smallest.to_vec())?;
                    buf = &buf[consumed..];
                    let (largest, consumed) = get_length_prefixed_slice(buf)
                        .ok_or_else(|| corruption("bad largest key"))?;
                    let largest = InternalKey::decode(largest.to_vec())?;
                    buf = &buf[consumed..];

                    edit.new_files.push((
                        level,
                        Arc::new(FileMetadata::new(file_number, file_size, smallest, largest)),
                    ));
                }
                unknown => {
                    return Err(corruption(&format!("unknown field tag {unknown}")));
                }
            }
        }

        Ok(edit)
    }
}

fn corruption(reason: &str) -> StrataError {
    StrataError::Corruption(format!("Malformed version edit: {reason}."))
}

fn decode_u64(buf: &[u8], what: &str) -> StrataResult<(u64, usize)> {
    u64::decode_var(buf).ok_or_else(|| corruption(&format!("bad {what}")))
}

fn decode_level(buf: &[u8]) -> StrataResult<(usize, usize)> {
    let (level, consumed) =
        u32::decode_var(buf).ok_or_else(|| corruption("bad level"))?;
    if (level as usize) >= MAX_NUM_LEVELS {
        return Err(corruption(&format!("level {level} is out of range")));
    }

    Ok((level as usize, consumed))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::key::Operation;

    use super::*;

    #[test]
    fn edits_round_trip_every_field() {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some("stratadb.BytewiseComparator".to_string());
        edit.log_number = Some(12);
        edit.prev_log_number = Some(9);
        edit.next_file_number = Some(42);
        edit.last_sequence = Some(1_000_000);
        edit.compact_pointers
            .push((3, InternalKey::new(b"pointer", 55, Operation::Put)));
        edit.remove_file(2, 17);
        edit.add_file(
            1,
            Arc::new(FileMetadata::new(
                18,
                4096,
                InternalKey::new(b"aardvark", 2, Operation::Put),
                InternalKey::new(b"zebu", 900, Operation::Delete),
            )),
        );

        let decoded = VersionEdit::decode(&edit.encode()).unwrap();
        assert_eq!(decoded.comparator_name, edit.comparator_name);
        assert_eq!(decoded.log_number, edit.log_number);
        assert_eq!(decoded.prev_log_number, edit.prev_log_number);
        assert_eq!(decoded.next_file_number, edit.next_file_number);
        assert_eq!(decoded.last_sequence, edit.last_sequence);
        assert_eq!(decoded.compact_pointers.len(), 1);
        assert_eq!(decoded.compact_pointers[0].0, 3);
        assert_eq!(
            decoded.compact_pointers[0].1.as_bytes(),
            edit.compact_pointers[0].1.as_bytes()
        );
        assert_eq!(decoded.deleted_files, vec![(2, 17)]);
        assert_eq!(decoded.new_files.len(), 1);
        let (level, file) = &decoded.new_files[0];
        assert_eq!(*level, 1);
        assert_eq!(file.file_number(), 18);
        assert_eq!(file.file_size(), 4096);
        assert_eq!(file.smallest().user_key(), b"aardvark");
        assert_eq!(file.largest().user_key(), b"zebu");
    }

    #[test]
    fn an_empty_edit_is_empty_bytes() {
        let edit = VersionEdit::new();
        assert!(edit.encode().is_empty());

        let decoded = VersionEdit::decode(&[]).unwrap();
        assert!(decoded.comparator_name.is_none());
        assert!(decoded.new_files.is_empty());
    }

    #[test]
    fn unknown_tags_and_bad_levels_are_corruption() {
        // Tag 8 is retired.
        let mut buf = u32::encode_var_vec(8);
        buf.extend(u64::encode_var_vec(1));
        assert!(VersionEdit::decode(&buf).is_err());

        // A deleted-file record with a level beyond the maximum.
        let mut buf = u32::encode_var_vec(Tag::DeletedFile as u32);
        buf.extend(u32::encode_var_vec(99));
        buf.extend(u64::encode_var_vec(1));
        assert!(VersionEdit::decode(&buf).is_err());
    }
}
