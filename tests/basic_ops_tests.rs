//! Point operations against a live database.

mod common;

use pretty_assertions::assert_eq;

use common::{get_string, memory_options, open_db};
use stratadb::{Batch, DbOptions, ReadOptions, StrataError, WriteOptions, DB};

#[test]
fn put_get_delete_round_trip() {
    let options = memory_options();
    let db = open_db(&options);

    db.put(WriteOptions::default(), b"foo", b"v1").unwrap();
    db.put(WriteOptions::default(), b"bar", b"v2").unwrap();
    assert_eq!(get_string(&db, "foo"), Some("v1".to_string()));
    assert_eq!(get_string(&db, "bar"), Some("v2".to_string()));

    db.delete(WriteOptions::default(), b"foo").unwrap();
    assert_eq!(get_string(&db, "foo"), None);
    assert_eq!(get_string(&db, "bar"), Some("v2".to_string()));
}

#[test]
fn the_latest_write_for_a_key_wins() {
    let options = memory_options();
    let db = open_db(&options);

    for round in 0..25 {
        db.put(
            WriteOptions::default(),
            b"counter",
            round.to_string().as_bytes(),
        )
        .unwrap();
    }
    assert_eq!(get_string(&db, "counter"), Some("24".to_string()));

    db.delete(WriteOptions::default(), b"counter").unwrap();
    assert_eq!(get_string(&db, "counter"), None);

    db.put(WriteOptions::default(), b"counter", b"back").unwrap();
    assert_eq!(get_string(&db, "counter"), Some("back".to_string()));
}

#[test]
fn missing_keys_report_not_found() {
    let options = memory_options();
    let db = open_db(&options);

    assert_eq!(
        db.get(ReadOptions::default(), b"never-written"),
        Err(StrataError::NotFound)
    );
}

#[test]
fn empty_values_are_legal() {
    let options = memory_options();
    let db = open_db(&options);

    db.put(WriteOptions::default(), b"empty", b"").unwrap();
    assert_eq!(db.get(ReadOptions::default(), b"empty").unwrap(), b"");
}

#[test]
fn batches_apply_atomically_and_in_order() {
    let options = memory_options();
    let db = open_db(&options);

    db.put(WriteOptions::default(), b"a", b"old").unwrap();

    let mut batch = Batch::new();
    batch.put(b"a", b"new");
    batch.put(b"b", b"added");
    batch.delete(b"a");
    db.write(WriteOptions::default(), batch).unwrap();

    // The delete is ordered after the put of "a" within the batch.
    assert_eq!(get_string(&db, "a"), None);
    assert_eq!(get_string(&db, "b"), Some("added".to_string()));
}

#[test]
fn an_empty_batch_is_a_no_op() {
    let options = memory_options();
    let db = open_db(&options);

    db.write(WriteOptions::default(), Batch::new()).unwrap();
    db.put(WriteOptions::default(), b"still", b"works").unwrap();
    assert_eq!(get_string(&db, "still"), Some("works".to_string()));
}

#[test]
fn concurrent_writers_are_all_acknowledged() {
    let options = memory_options();
    let db = std::sync::Arc::new(open_db(&options));

    let mut handles = vec![];
    for thread_id in 0..4 {
        let db = std::sync::Arc::clone(&db);
        handles.push(std::thread::spawn(move || {
            for i in 0..100 {
                let key = format!("t{thread_id}-k{i}");
                db.put(WriteOptions::default(), key.as_bytes(), key.as_bytes())
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for thread_id in 0..4 {
        for i in 0..100 {
            let key = format!("t{thread_id}-k{i}");
            assert_eq!(
                db.get(ReadOptions::default(), key.as_bytes()).unwrap(),
                key.as_bytes(),
                "{key} must be readable after its write was acknowledged."
            );
        }
    }
}

#[test]
fn a_second_open_of_a_live_database_fails() {
    let options = memory_options();
    let _db = open_db(&options);

    let second = DB::open(options.clone(), common::DB_PATH);
    assert!(
        second.is_err(),
        "The advisory lock must reject a second concurrent open."
    );
}

#[test]
fn properties_expose_basic_introspection() {
    let options = memory_options();
    let db = open_db(&options);

    db.put(WriteOptions::default(), b"k", b"v").unwrap();

    assert!(db.get_property("stratadb.num-files-at-level0").is_some());
    assert!(db.get_property("stratadb.stats").is_some());
    assert!(db.get_property("stratadb.sstables").is_some());
    let usage: usize = db
        .get_property("stratadb.approximate-memory-usage")
        .unwrap()
        .parse()
        .unwrap();
    assert!(usage > 0);
    assert!(db.get_property("stratadb.no-such-property").is_none());
    assert!(db.get_property("unprefixed").is_none());
}

#[test]
fn destroy_removes_the_database_files() {
    let options = memory_options();
    {
        let db = open_db(&options);
        db.put(WriteOptions::default(), b"doomed", b"data").unwrap();
    }

    DB::destroy(options.clone(), common::DB_PATH).unwrap();
    let leftovers = common::list_db_files(options.filesystem_provider.as_ref());
    assert!(
        leftovers.is_empty(),
        "Destroy must remove every database file, found {leftovers:?}."
    );

    // A destroyed database can be recreated from scratch.
    let db = open_db(&options);
    assert_eq!(get_string(&db, "doomed"), None);
}

#[test]
fn reopening_with_a_mismatched_comparator_name_fails() {
    use std::cmp::Ordering;

    #[derive(Debug)]
    struct ReversedComparator;
    impl stratadb::comparator::Comparator for ReversedComparator {
        fn name(&self) -> &'static str {
            "test.ReversedComparator"
        }
        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            b.cmp(a)
        }
        fn find_shortest_separator(&self, start: &[u8], _limit: &[u8]) -> Vec<u8> {
            start.to_vec()
        }
        fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
            key.to_vec()
        }
    }

    let options = memory_options();
    {
        let db = open_db(&options);
        db.put(WriteOptions::default(), b"k", b"v").unwrap();
    }

    let mismatched = DbOptions {
        comparator: std::sync::Arc::new(ReversedComparator),
        ..options.clone()
    };
    match DB::open(mismatched, common::DB_PATH) {
        Err(StrataError::InvalidArgument(_)) => {}
        Err(other) => panic!("Expected an invalid-argument error, got: {other}"),
        Ok(_) => panic!("A comparator name mismatch must fail the open."),
    }
}
