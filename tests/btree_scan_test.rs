mod test_utils;

use test_utils::{count_rows, open_db, scratch_dir, setup, wide_key};
use timberdb::{HandyRwLock, TimberError};

const URI: &str = "file:scan.tdb";

#[test]
fn test_forced_split_ordered_walk() {
    setup();
    let dir = scratch_dir();
    let db = open_db(
        dir.path(),
        "leaf_page_max=4K,internal_page_max=4K,memory_page_max=256K,transaction_sync=off",
    );
    db.create(URI, "key_format=u,value_format=u").unwrap();
    let session = db.open_session().unwrap();

    let rows = 10_000;
    {
        let mut cursor = session.open_cursor(URI).unwrap();
        for i in 0..rows {
            // 200-byte keys in ascending order
            cursor.put(&wide_key(i, 200), b"v", true).unwrap();
        }
    }

    // reconciliation carves the tree into many blocks
    db.checkpoint().unwrap();

    // a full walk returns every key, in order
    let mut cursor = session.open_cursor(URI).unwrap();
    let mut prev: Option<Vec<u8>> = None;
    let mut count = 0;
    while let Some((key, _)) = cursor.next().unwrap() {
        let key = key.row().to_vec();
        if let Some(prev) = &prev {
            assert!(*prev < key, "walk out of order");
        }
        prev = Some(key);
        count += 1;
    }
    assert_eq!(count, rows);

    // and the root really has fanned out
    let root = cursor.btree.root_ref();
    let root_page = root.page().expect("root in memory");
    assert!(root_page.is_internal());
    let children = root_page.data.rl().as_int().index.len();
    assert!(children > 1, "root has {} children", children);

    drop(cursor);
    db.close().unwrap();
}

#[test]
fn test_next_after_prev_returns_same_position() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(URI, "key_format=u,value_format=u").unwrap();
    let session = db.open_session().unwrap();
    let mut cursor = session.open_cursor(URI).unwrap();

    for i in 0..100 {
        cursor.put(&wide_key(i, 8), b"v", true).unwrap();
    }

    // walk in a bit
    let mut last = Vec::new();
    for _ in 0..10 {
        let (key, _) = cursor.next().unwrap().unwrap();
        last = key.row().to_vec();
    }

    let (back, _) = cursor.prev().unwrap().unwrap();
    assert!(back.row().to_vec() < last);
    let (again, _) = cursor.next().unwrap().unwrap();
    assert_eq!(again.row().to_vec(), last);

    drop(cursor);
    db.close().unwrap();
}

#[test]
fn test_reverse_walk() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(URI, "key_format=u,value_format=u").unwrap();
    let session = db.open_session().unwrap();
    let mut cursor = session.open_cursor(URI).unwrap();

    let rows = 500;
    for i in 0..rows {
        cursor.put(&wide_key(i, 8), b"v", true).unwrap();
    }

    let mut seen = 0;
    let mut prev: Option<Vec<u8>> = None;
    while let Some((key, _)) = cursor.prev().unwrap() {
        let key = key.row().to_vec();
        if let Some(prev) = &prev {
            assert!(key < *prev);
        }
        prev = Some(key);
        seen += 1;
    }
    assert_eq!(seen, rows);

    drop(cursor);
    db.close().unwrap();
}

#[test]
fn test_truncate_range() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(URI, "key_format=u,value_format=u").unwrap();
    let session = db.open_session().unwrap();
    let mut cursor = session.open_cursor(URI).unwrap();

    for i in 0..100 {
        cursor.put(&wide_key(i, 8), b"v", true).unwrap();
    }

    let start = wide_key(20, 8);
    let stop = wide_key(59, 8);
    cursor.truncate(Some(&start), Some(&stop)).unwrap();

    // everything inside the range is gone
    for i in 20..60 {
        assert!(
            matches!(cursor.search(&wide_key(i, 8)), Err(TimberError::NotFound)),
            "key {} survived the truncate",
            i
        );
    }
    assert_eq!(&cursor.search(&wide_key(19, 8)).unwrap()[..], b"v");
    assert_eq!(&cursor.search(&wide_key(60, 8)).unwrap()[..], b"v");
    drop(cursor);

    assert_eq!(count_rows(&session, URI), 60);
    db.close().unwrap();
}

#[test]
fn test_split_survives_reopen() {
    setup();
    let dir = scratch_dir();
    let rows = 3_000;
    {
        let db = open_db(
            dir.path(),
            "leaf_page_max=4K,memory_page_max=128K,transaction_sync=off",
        );
        db.create(URI, "key_format=u,value_format=u").unwrap();
        let session = db.open_session().unwrap();
        let mut cursor = session.open_cursor(URI).unwrap();
        for i in 0..rows {
            cursor
                .put(&wide_key(i, 64), format!("v{}", i).as_bytes(), true)
                .unwrap();
        }
        drop(cursor);
        db.close().unwrap();
    }

    let db = open_db(dir.path(), "leaf_page_max=4K,memory_page_max=128K");
    let session = db.open_session().unwrap();
    assert_eq!(count_rows(&session, URI), rows);
    let mut cursor = session.open_cursor(URI).unwrap();
    assert_eq!(
        &cursor.search(&wide_key(1234, 64)).unwrap()[..],
        b"v1234"
    );
    drop(cursor);
    db.close().unwrap();
}
