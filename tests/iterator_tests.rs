//! Range scans through the database iterator.

mod common;

use pretty_assertions::assert_eq;

use common::{memory_options, memory_options_with_filter, open_db};
use stratadb::{DbOptions, ReadOptions, WriteOptions};

fn populate(db: &stratadb::DB, count: usize) -> Vec<(String, String)> {
    let mut expected = vec![];
    for i in 0..count {
        let key = format!("key-{i:06}");
        let value = format!("value-{i}");
        db.put(WriteOptions::default(), key.as_bytes(), value.as_bytes())
            .unwrap();
        expected.push((key, value));
    }
    expected
}

fn collect_forward(db: &stratadb::DB) -> Vec<(String, String)> {
    let mut iter = db.new_iterator(ReadOptions::default()).unwrap();
    iter.seek_to_first();
    let mut entries = vec![];
    while iter.valid() {
        entries.push((
            String::from_utf8(iter.key().to_vec()).unwrap(),
            String::from_utf8(iter.value().to_vec()).unwrap(),
        ));
        iter.next();
    }
    iter.status().unwrap();
    entries
}

fn collect_backward(db: &stratadb::DB) -> Vec<(String, String)> {
    let mut iter = db.new_iterator(ReadOptions::default()).unwrap();
    iter.seek_to_last();
    let mut entries = vec![];
    while iter.valid() {
        entries.push((
            String::from_utf8(iter.key().to_vec()).unwrap(),
            String::from_utf8(iter.value().to_vec()).unwrap(),
        ));
        iter.prev();
    }
    iter.status().unwrap();
    entries
}

#[test]
fn forward_and_backward_scans_agree() {
    let options = memory_options();
    let db = open_db(&options);
    let expected = populate(&db, 500);

    assert_eq!(collect_forward(&db), expected);

    let mut reversed = expected;
    reversed.reverse();
    assert_eq!(collect_backward(&db), reversed);
}

#[test]
fn scans_merge_memtable_and_table_entries() {
    let options = DbOptions {
        write_buffer_size: 8_000,
        ..memory_options_with_filter()
    };
    let db = open_db(&options);

    // Enough data to spill several table files, then overwrite a slice of
    // the keys so the newest versions live in the memtable.
    let mut expected = populate(&db, 400);
    for i in (0..400).step_by(7) {
        let key = format!("key-{i:06}");
        let value = format!("fresh-{i}");
        db.put(WriteOptions::default(), key.as_bytes(), value.as_bytes())
            .unwrap();
        expected[i].1 = value;
    }
    // Delete a different slice.
    let mut removed = std::collections::HashSet::new();
    for i in (0..400).step_by(11) {
        let key = format!("key-{i:06}");
        db.delete(WriteOptions::default(), key.as_bytes()).unwrap();
        removed.insert(i);
    }
    let expected: Vec<(String, String)> = expected
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !removed.contains(i))
        .map(|(_, entry)| entry)
        .collect();

    assert_eq!(collect_forward(&db), expected);
    let mut reversed = expected;
    reversed.reverse();
    assert_eq!(collect_backward(&db), reversed);
}

#[test]
fn seeks_position_at_the_right_user_key() {
    let options = memory_options();
    let db = open_db(&options);
    populate(&db, 100);

    let mut iter = db.new_iterator(ReadOptions::default()).unwrap();

    iter.seek(b"key-000050");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"key-000050");

    // Between keys: lands on the successor.
    iter.seek(b"key-000050x");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"key-000051");

    // Before the smallest key.
    iter.seek(b"aaa");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"key-000000");

    // Past the largest key.
    iter.seek(b"zzz");
    assert!(!iter.valid());
}

#[test]
fn direction_changes_mid_scan_visit_neighbors() {
    let options = memory_options();
    let db = open_db(&options);
    populate(&db, 10);

    let mut iter = db.new_iterator(ReadOptions::default()).unwrap();
    iter.seek(b"key-000005");
    assert_eq!(iter.key(), b"key-000005");

    iter.prev();
    assert_eq!(iter.key(), b"key-000004");

    iter.next();
    assert_eq!(iter.key(), b"key-000005");

    iter.next();
    assert_eq!(iter.key(), b"key-000006");

    iter.prev();
    assert_eq!(iter.key(), b"key-000005");
}

#[test]
fn deleted_keys_are_invisible_in_both_directions() {
    let options = memory_options();
    let db = open_db(&options);
    populate(&db, 5);

    db.delete(WriteOptions::default(), b"key-000000").unwrap();
    db.delete(WriteOptions::default(), b"key-000002").unwrap();
    db.delete(WriteOptions::default(), b"key-000004").unwrap();

    let forward: Vec<String> = collect_forward(&db)
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(forward, vec!["key-000001", "key-000003"]);

    let backward: Vec<String> = collect_backward(&db)
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(backward, vec!["key-000003", "key-000001"]);

    // A seek onto a deleted key skips to the next live one.
    let mut iter = db.new_iterator(ReadOptions::default()).unwrap();
    iter.seek(b"key-000002");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"key-000003");
}

#[test]
fn an_empty_database_yields_an_invalid_iterator() {
    let options = memory_options();
    let db = open_db(&options);

    let mut iter = db.new_iterator(ReadOptions::default()).unwrap();
    iter.seek_to_first();
    assert!(!iter.valid());
    iter.seek_to_last();
    assert!(!iter.valid());
    iter.seek(b"anything");
    assert!(!iter.valid());
    iter.status().unwrap();
}
