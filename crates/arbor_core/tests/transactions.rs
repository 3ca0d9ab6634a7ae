//! Snapshots, commits and recovery from the node log.

use arbor_core::{ColumnType, CoreError, Database, Version};
use arbor_testkit::prelude::*;
use std::fs::OpenOptions;
use std::io::Write;

#[test]
fn readers_keep_their_snapshot_across_commits() {
    let db = TestDatabase::memory();
    let (cols, keys) = scenarios::populate_items(&db, "items", 20);
    let before = db.begin_read().unwrap();

    {
        let wt = db.begin_write().unwrap();
        let table = wt.table("items").unwrap();
        for key in &keys {
            table.set(*key, cols.value, -1).unwrap();
        }
        table.remove_object(keys[0]).unwrap();
        wt.commit().unwrap();
    }

    let old = before.table("items").unwrap();
    assert_eq!(old.size().unwrap(), 20);
    assert_eq!(old.get(keys[5], cols.value).unwrap(), Mixed::from(5));
    old.verify().unwrap();

    let after = db.begin_read().unwrap();
    let new = after.table("items").unwrap();
    assert_eq!(new.size().unwrap(), 19);
    assert_eq!(new.get(keys[5], cols.value).unwrap(), Mixed::from(-1));
    assert!(after.version() > before.version());
}

#[test]
fn dropped_write_transaction_rolls_back() {
    let db = TestDatabase::memory();
    scenarios::populate_items(&db, "items", 5);
    let version = db.committed_version();

    {
        let wt = db.begin_write().unwrap();
        let table = wt.table("items").unwrap();
        table.create_object().unwrap();
        wt.group().add_table("scratch").unwrap();
    }

    assert_eq!(db.committed_version(), version);
    let rt = db.begin_read().unwrap();
    assert_eq!(rt.table("items").unwrap().size().unwrap(), 5);
    assert!(matches!(
        rt.table("scratch"),
        Err(CoreError::TableNotFound { .. })
    ));
}

#[test]
fn read_transactions_refuse_writes() {
    let db = TestDatabase::memory();
    let (cols, keys) = scenarios::populate_items(&db, "items", 1);
    let rt = db.begin_read().unwrap();
    let table = rt.table("items").unwrap();

    assert!(matches!(table.create_object(), Err(CoreError::ReadOnly)));
    assert!(matches!(
        table.set(keys[0], cols.value, 3),
        Err(CoreError::ReadOnly)
    ));
    let mut dict = table.dictionary(keys[0], cols.attrs).unwrap();
    assert!(matches!(dict.insert("x", 1), Err(CoreError::ReadOnly)));
}

#[test]
fn readers_pin_versions_until_dropped() {
    let db = TestDatabase::memory();
    scenarios::populate_items(&db, "items", 3);
    let rt = db.begin_read().unwrap();
    let pinned = rt.version();
    assert!(db.pinned_versions().contains(&pinned));

    scenarios::populate_items(&db, "more", 3);
    let mut rt2 = db.begin_read().unwrap();
    assert_eq!(db.pinned_versions().len(), 2);

    drop(rt);
    assert_eq!(db.pinned_versions(), vec![rt2.version()]);

    scenarios::populate_items(&db, "even_more", 1);
    let latest = rt2.advance_read();
    assert_eq!(latest, db.committed_version());
    assert_eq!(db.pinned_versions(), vec![latest]);
}

#[test]
fn file_database_reopens_at_last_commit() {
    init_test_tracing();
    let db = TestDatabase::file();
    let (cols, keys) = scenarios::populate_items(&db, "items", 40);
    scenarios::strong_ring(&db, "ring", 5);
    let version = db.committed_version();

    // Uncommitted work never reaches the log.
    {
        let wt = db.begin_write().unwrap();
        wt.table("items").unwrap().create_object().unwrap();
    }

    let db = db.reopen();
    assert_eq!(db.committed_version(), version);
    let rt = db.begin_read().unwrap();
    let items = rt.table("items").unwrap();
    items.verify().unwrap();
    assert_eq!(items.keys().unwrap(), keys);
    assert_eq!(items.get(keys[39], cols.value).unwrap(), Mixed::from(39));
    assert_eq!(
        items
            .const_dictionary(keys[12], cols.attrs)
            .unwrap()
            .get("ordinal")
            .unwrap(),
        Mixed::from(12)
    );
    assert_eq!(rt.table("ring").unwrap().size().unwrap(), 5);
    drop(rt);

    // Keys keep counting from where they left off.
    let wt = db.begin_write().unwrap();
    let next = wt.table("items").unwrap().create_object().unwrap();
    assert!(next > keys[39]);
    wt.commit().unwrap();
}

#[test]
fn torn_tail_is_discarded_on_open() {
    let db = TestDatabase::file();
    let path = db.path().unwrap();
    scenarios::populate_items(&db, "items", 10);
    let version = db.committed_version();
    let config = db.config().clone();
    drop(db.db);

    let intact = std::fs::metadata(&path).unwrap().len();
    {
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x40, 0, 0, 0, 0xde, 0xad, 0xbe]).unwrap();
    }

    {
        let db = Database::open_file(config.clone(), &path).unwrap();
        assert_eq!(db.committed_version(), version);
        let rt = db.begin_read().unwrap();
        assert_eq!(rt.table("items").unwrap().size().unwrap(), 10);
    }
    assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);

    // The log is writable again after truncation.
    let db = Database::open_file(config, &path).unwrap();
    let wt = db.begin_write().unwrap();
    wt.table("items").unwrap().create_object().unwrap();
    assert!(wt.commit().unwrap() > version);
}

#[test]
fn second_open_of_a_locked_file_fails() {
    with_file_db(|_, path| {
        assert!(matches!(
            Database::open_file(test_config(), path),
            Err(CoreError::Storage(_))
        ));
    });
}

#[test]
fn memory_database_starts_at_version_zero() {
    let db = Database::open_in_memory(test_config()).unwrap();
    assert_eq!(db.committed_version(), Version::new(0));
    let rt = db.begin_read().unwrap();
    assert_eq!(rt.group().table_count().unwrap(), 0);
    drop(rt);

    let wt = db.begin_write().unwrap();
    wt.group().add_table("t").unwrap().add_column("n", ColumnType::Int, true).unwrap();
    assert_eq!(wt.commit().unwrap(), Version::new(1));
}

#[test]
fn readers_starting_during_commits_see_whole_snapshots() {
    let db = Database::open_in_memory(test_config()).unwrap();
    let col = {
        let wt = db.begin_write().unwrap();
        let table = wt.group().add_table("items").unwrap();
        let col = table.add_column("value", ColumnType::Int, false).unwrap();
        for _ in 0..40 {
            let key = table.create_object().unwrap();
            table.set(key, col, 0).unwrap();
        }
        wt.commit().unwrap();
        col
    };

    std::thread::scope(|s| {
        s.spawn(|| {
            for round in 1..=60i64 {
                let wt = db.begin_write().unwrap();
                let table = wt.table("items").unwrap();
                for key in table.keys().unwrap() {
                    table.set(key, col, round).unwrap();
                }
                wt.commit().unwrap();
            }
        });
        for _ in 0..3 {
            s.spawn(|| {
                for _ in 0..60 {
                    let mut rt = db.begin_read().unwrap();
                    for _ in 0..2 {
                        let table = rt.table("items").unwrap();
                        table.verify().unwrap();
                        let values: Vec<Mixed> = table
                            .keys()
                            .unwrap()
                            .into_iter()
                            .map(|key| table.get(key, col).unwrap())
                            .collect();
                        assert_eq!(values.len(), 40);
                        assert!(values.iter().all(|v| *v == values[0]));
                        rt.advance_read();
                    }
                }
            });
        }
    });
    assert!(db.pinned_versions().is_empty());
}
