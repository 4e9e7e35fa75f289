//! Snapshot isolation guarantees.

mod common;

use pretty_assertions::assert_eq;

use common::{get_string, memory_options, open_db};
use stratadb::{ReadOptions, StrataError, WriteOptions};

#[test]
fn a_snapshot_pins_the_state_at_its_creation() {
    let options = memory_options();
    let db = open_db(&options);

    db.put(WriteOptions::default(), b"x", b"a").unwrap();
    let snapshot = db.get_snapshot();
    db.put(WriteOptions::default(), b"x", b"b").unwrap();

    let at_snapshot = ReadOptions {
        snapshot: Some(snapshot.clone()),
        ..ReadOptions::default()
    };
    assert_eq!(db.get(at_snapshot, b"x").unwrap(), b"a");
    assert_eq!(db.get(ReadOptions::default(), b"x").unwrap(), b"b");

    db.release_snapshot(snapshot);
    assert_eq!(db.get(ReadOptions::default(), b"x").unwrap(), b"b");
}

#[test]
fn snapshots_hide_later_inserts_and_deletes() {
    let options = memory_options();
    let db = open_db(&options);

    db.put(WriteOptions::default(), b"stays", b"1").unwrap();
    let snapshot = db.get_snapshot();

    db.delete(WriteOptions::default(), b"stays").unwrap();
    db.put(WriteOptions::default(), b"later", b"2").unwrap();

    let at_snapshot = ReadOptions {
        snapshot: Some(snapshot.clone()),
        ..ReadOptions::default()
    };
    assert_eq!(db.get(at_snapshot.clone(), b"stays").unwrap(), b"1");
    assert_eq!(db.get(at_snapshot, b"later"), Err(StrataError::NotFound));

    assert_eq!(get_string(&db, "stays"), None);
    assert_eq!(get_string(&db, "later"), Some("2".to_string()));
    db.release_snapshot(snapshot);
}

#[test]
fn snapshots_survive_flushes_and_compactions() {
    let options = stratadb::DbOptions {
        write_buffer_size: 8_000,
        ..memory_options()
    };
    let db = open_db(&options);

    db.put(WriteOptions::default(), b"watched", b"before").unwrap();
    let snapshot = db.get_snapshot();

    // Bury the snapshotted entry under enough data to force flushes, then
    // compact everything.
    for i in 0..300 {
        let key = format!("filler-{i:05}");
        db.put(WriteOptions::default(), key.as_bytes(), &[b'x'; 64])
            .unwrap();
    }
    db.put(WriteOptions::default(), b"watched", b"after").unwrap();
    db.compact_range(None, None).unwrap();

    let at_snapshot = ReadOptions {
        snapshot: Some(snapshot.clone()),
        ..ReadOptions::default()
    };
    assert_eq!(
        db.get(at_snapshot, b"watched").unwrap(),
        b"before",
        "Compaction must not drop entries a live snapshot can see."
    );
    assert_eq!(get_string(&db, "watched"), Some("after".to_string()));
    db.release_snapshot(snapshot);
}

#[test]
fn iterators_honor_their_snapshot() {
    let options = memory_options();
    let db = open_db(&options);

    db.put(WriteOptions::default(), b"a", b"1").unwrap();
    db.put(WriteOptions::default(), b"b", b"2").unwrap();
    let snapshot = db.get_snapshot();

    db.put(WriteOptions::default(), b"b", b"overwritten").unwrap();
    db.put(WriteOptions::default(), b"c", b"3").unwrap();
    db.delete(WriteOptions::default(), b"a").unwrap();

    let mut iter = db
        .new_iterator(ReadOptions {
            snapshot: Some(snapshot.clone()),
            ..ReadOptions::default()
        })
        .unwrap();

    iter.seek_to_first();
    let mut seen = vec![];
    while iter.valid() {
        seen.push((
            String::from_utf8(iter.key().to_vec()).unwrap(),
            String::from_utf8(iter.value().to_vec()).unwrap(),
        ));
        iter.next();
    }
    iter.status().unwrap();

    assert_eq!(
        seen,
        vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ],
        "The iterator sees exactly the snapshot's state."
    );
    db.release_snapshot(snapshot);
}
