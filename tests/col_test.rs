mod test_utils;

use test_utils::{open_db, scratch_dir, setup};
use timberdb::TimberError;

const VAR_URI: &str = "file:colvar.tdb";
const FIX_URI: &str = "file:colfix.tdb";

#[test]
fn test_col_append_and_read() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(VAR_URI, "key_format=r,value_format=u").unwrap();
    let session = db.open_session().unwrap();
    let mut cursor = session.open_cursor(VAR_URI).unwrap();

    let mut recnos = Vec::new();
    for i in 0..200u64 {
        let recno = cursor.append(format!("row{}", i).as_bytes()).unwrap();
        recnos.push(recno);
    }

    // appends allocate monotonically increasing recnos from 1
    assert_eq!(recnos[0], 1);
    for pair in recnos.windows(2) {
        assert_eq!(pair[0] + 1, pair[1]);
    }

    assert_eq!(&cursor.search_recno(1).unwrap()[..], b"row0");
    assert_eq!(&cursor.search_recno(200).unwrap()[..], b"row199");

    drop(cursor);
    db.close().unwrap();
}

#[test]
fn test_col_scan_and_remove() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(VAR_URI, "key_format=r,value_format=u").unwrap();
    let session = db.open_session().unwrap();
    let mut cursor = session.open_cursor(VAR_URI).unwrap();

    for i in 0..100u64 {
        cursor.append(format!("v{}", i).as_bytes()).unwrap();
    }
    cursor.remove_recno(50).unwrap();
    assert!(matches!(
        cursor.search_recno(50),
        Err(TimberError::NotFound)
    ));

    let mut seen = Vec::new();
    while let Some((key, _)) = cursor.next().unwrap() {
        seen.push(key.recno());
    }
    assert_eq!(seen.len(), 99);
    assert!(!seen.contains(&50));
    // still ordered
    for pair in seen.windows(2) {
        assert!(pair[0] < pair[1]);
    }

    drop(cursor);
    db.close().unwrap();
}

#[test]
fn test_col_survives_reopen() {
    setup();
    let dir = scratch_dir();
    {
        let db = open_db(dir.path(), "transaction_sync=off");
        db.create(VAR_URI, "key_format=r,value_format=u").unwrap();
        let session = db.open_session().unwrap();
        let mut cursor = session.open_cursor(VAR_URI).unwrap();
        for i in 0..500u64 {
            cursor.append(format!("d{}", i).as_bytes()).unwrap();
        }
        drop(cursor);
        db.close().unwrap();
    }

    let db = open_db(dir.path(), "");
    let session = db.open_session().unwrap();
    let mut cursor = session.open_cursor(VAR_URI).unwrap();
    assert_eq!(&cursor.search_recno(250).unwrap()[..], b"d249");
    // appends continue past the recovered tail
    let next = cursor.append(b"after").unwrap();
    assert_eq!(next, 501);
    drop(cursor);
    db.close().unwrap();
}

#[test]
fn test_col_truncate() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(VAR_URI, "key_format=r,value_format=u").unwrap();
    let session = db.open_session().unwrap();
    let mut cursor = session.open_cursor(VAR_URI).unwrap();

    for _ in 0..50u64 {
        cursor.append(b"x").unwrap();
    }
    cursor.truncate_recno(10, 19).unwrap();
    for recno in 10..20u64 {
        assert!(matches!(
            cursor.search_recno(recno),
            Err(TimberError::NotFound)
        ));
    }
    assert!(cursor.search_recno(9).is_ok());
    assert!(cursor.search_recno(20).is_ok());
    drop(cursor);
    db.close().unwrap();
}

#[test]
fn test_col_fixed_width() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(FIX_URI, "key_format=r,value_format=8t").unwrap();
    let session = db.open_session().unwrap();
    let mut cursor = session.open_cursor(FIX_URI).unwrap();

    for i in 0..50u64 {
        let recno = cursor.append(&[(i % 251) as u8]).unwrap();
        assert_eq!(recno, i + 1);
    }
    assert_eq!(&cursor.search_recno(10).unwrap()[..], &[9u8]);

    // a bitfield value is exactly one byte
    assert!(cursor.put_recno(5, b"toolong", true).is_err());

    cursor.put_recno(5, &[200], true).unwrap();
    assert_eq!(&cursor.search_recno(5).unwrap()[..], &[200u8]);

    drop(cursor);
    db.checkpoint().unwrap();
    db.close().unwrap();

    let db = open_db(dir.path(), "");
    let session = db.open_session().unwrap();
    let mut cursor = session.open_cursor(FIX_URI).unwrap();
    assert_eq!(&cursor.search_recno(5).unwrap()[..], &[200u8]);
    assert_eq!(&cursor.search_recno(50).unwrap()[..], &[49u8]);
    drop(cursor);
    db.close().unwrap();
}
