//! Crash recovery: reopening a database must expose every acknowledged
//! write. Dropping the database object while keeping the in-memory file
//! system is the crash simulation: nothing buffered above the file system
//! survives it.

mod common;

use pretty_assertions::assert_eq;

use common::{get_string, list_db_files, memory_options, open_db, DB_PATH};
use stratadb::{DbOptions, ReadOptions, WriteOptions, DB};

#[test]
fn writes_survive_a_reopen_via_the_wal() {
    let options = memory_options();
    {
        let db = open_db(&options);
        db.put(WriteOptions { sync: true }, b"k", b"v").unwrap();
    }

    // The write never reached a table file, so the reopen must replay it
    // from the write-ahead log.
    let db = open_db(&options);
    assert_eq!(get_string(&db, "k"), Some("v".to_string()));
}

#[test]
fn recovery_preserves_deletes_and_overwrites() {
    let options = memory_options();
    {
        let db = open_db(&options);
        db.put(WriteOptions::default(), b"keep", b"original").unwrap();
        db.put(WriteOptions::default(), b"gone", b"temporary").unwrap();
        db.put(WriteOptions::default(), b"keep", b"updated").unwrap();
        db.delete(WriteOptions::default(), b"gone").unwrap();
    }

    let db = open_db(&options);
    assert_eq!(get_string(&db, "keep"), Some("updated".to_string()));
    assert_eq!(get_string(&db, "gone"), None);
}

#[test]
fn repeated_reopens_keep_all_data() {
    let options = memory_options();

    for round in 0u32..5 {
        let db = open_db(&options);
        // Verify everything written in earlier incarnations.
        for earlier in 0..round {
            let key = format!("round-{earlier}");
            assert_eq!(
                get_string(&db, &key),
                Some(earlier.to_string()),
                "{key} must survive {round} reopens."
            );
        }
        db.put(
            WriteOptions::default(),
            format!("round-{round}").as_bytes(),
            round.to_string().as_bytes(),
        )
        .unwrap();
    }
}

#[test]
fn flushed_data_is_served_from_level_zero_tables() {
    let options = DbOptions {
        // A tiny write buffer forces memtable flushes while writing.
        write_buffer_size: 10_000,
        ..memory_options()
    };

    let keys: Vec<String> = (0..200).map(|i| format!("{:032}", i * 7919)).collect();
    {
        let db = open_db(&options);
        for key in keys.iter() {
            db.put(WriteOptions::default(), key.as_bytes(), key.as_bytes())
                .unwrap();
        }
    }

    let db = open_db(&options);
    let table_files: Vec<String> = list_db_files(options.filesystem_provider.as_ref())
        .into_iter()
        .filter(|name| name.ends_with(".ldb"))
        .collect();
    assert!(
        !table_files.is_empty(),
        "The small write buffer must have produced table files."
    );
    let level0: usize = db
        .get_property("stratadb.num-files-at-level0")
        .unwrap()
        .parse()
        .unwrap();
    assert!(
        level0 >= 1,
        "Recovery flushes the write-ahead log tail into level 0."
    );

    for key in keys.iter() {
        assert_eq!(
            db.get(ReadOptions::default(), key.as_bytes()).unwrap(),
            key.as_bytes(),
            "{key} must be retrievable after flush and reopen."
        );
    }
}

#[test]
fn opening_a_missing_database_requires_create_if_missing() {
    let options = DbOptions {
        create_if_missing: false,
        ..memory_options()
    };
    assert!(DB::open(options, DB_PATH).is_err());
}

#[test]
fn error_if_exists_rejects_an_existing_database() {
    let options = memory_options();
    {
        let _db = open_db(&options);
    }

    let strict = DbOptions {
        error_if_exists: true,
        ..options
    };
    assert!(DB::open(strict, DB_PATH).is_err());
}

#[test]
fn reuse_logs_appends_to_the_previous_wal() {
    let options = DbOptions {
        reuse_logs: true,
        ..memory_options()
    };

    {
        let db = open_db(&options);
        db.put(WriteOptions::default(), b"first", b"1").unwrap();
    }
    let logs_after_first: Vec<String> = list_db_files(options.filesystem_provider.as_ref())
        .into_iter()
        .filter(|name| name.ends_with(".log"))
        .collect();

    {
        let db = open_db(&options);
        db.put(WriteOptions::default(), b"second", b"2").unwrap();
        assert_eq!(get_string(&db, "first"), Some("1".to_string()));
    }
    let logs_after_second: Vec<String> = list_db_files(options.filesystem_provider.as_ref())
        .into_iter()
        .filter(|name| name.ends_with(".log"))
        .collect();
    assert_eq!(
        logs_after_first, logs_after_second,
        "With reuse_logs the same write-ahead log file keeps growing."
    );

    let db = open_db(&options);
    assert_eq!(get_string(&db, "first"), Some("1".to_string()));
    assert_eq!(get_string(&db, "second"), Some("2".to_string()));
}

#[test]
fn repair_rebuilds_a_database_with_a_lost_manifest() {
    let options = DbOptions {
        write_buffer_size: 8_000,
        ..memory_options()
    };
    let keys: Vec<String> = (0..150).map(|i| format!("repair-key-{i:05}")).collect();
    {
        let db = open_db(&options);
        for key in keys.iter() {
            db.put(WriteOptions::default(), key.as_bytes(), key.as_bytes())
                .unwrap();
        }
    }

    // Lose the manifest and the CURRENT pointer.
    let fs = options.filesystem_provider.clone();
    for name in list_db_files(fs.as_ref()) {
        if name.starts_with("MANIFEST-") || name == "CURRENT" {
            fs.remove_file(&std::path::Path::new(DB_PATH).join(name))
                .unwrap();
        }
    }

    let no_create = DbOptions {
        create_if_missing: false,
        ..options.clone()
    };
    assert!(
        DB::open(no_create, DB_PATH).is_err(),
        "Without CURRENT the database looks nonexistent and must not open."
    );

    DB::repair(options.clone(), DB_PATH).unwrap();

    let db = open_db(&options);
    for key in keys.iter() {
        assert_eq!(
            db.get(ReadOptions::default(), key.as_bytes()).unwrap(),
            key.as_bytes(),
            "{key} must survive the repair."
        );
    }
}
