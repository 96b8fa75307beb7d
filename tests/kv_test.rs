mod test_utils;

use test_utils::{open_db, scratch_dir, search_key, setup};
use timberdb::TimberError;

const URI: &str = "file:kv.tdb";

#[test]
fn test_cold_insert_and_read() {
    setup();
    let dir = scratch_dir();

    // open an empty database, insert one row, close
    {
        let db = open_db(dir.path(), "");
        db.create(URI, "key_format=u,value_format=u").unwrap();
        let session = db.open_session().unwrap();
        let mut cursor = session.open_cursor(URI).unwrap();
        cursor.put(b"a", b"1", true).unwrap();
        drop(cursor);
        db.close().unwrap();
    }

    // reopen: the row is there
    let db = open_db(dir.path(), "");
    let session = db.open_session().unwrap();
    assert_eq!(search_key(&session, URI, b"a"), Some(b"1".to_vec()));
    db.close().unwrap();
}

#[test]
fn test_duplicate_and_missing() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(URI, "key_format=u,value_format=u").unwrap();
    let session = db.open_session().unwrap();
    let mut cursor = session.open_cursor(URI).unwrap();

    cursor.put(b"k", b"v1", true).unwrap();
    // insert without overwrite refuses an existing key
    assert!(matches!(
        cursor.put(b"k", b"v2", false),
        Err(TimberError::DuplicateKey)
    ));
    assert_eq!(&cursor.search(b"k").unwrap()[..], b"v1");

    cursor.remove(b"k").unwrap();
    assert!(matches!(cursor.search(b"k"), Err(TimberError::NotFound)));
    assert!(matches!(cursor.remove(b"k"), Err(TimberError::NotFound)));

    drop(cursor);
    db.close().unwrap();
}

#[test]
fn test_search_near() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(URI, "key_format=u,value_format=u").unwrap();
    let session = db.open_session().unwrap();
    let mut cursor = session.open_cursor(URI).unwrap();

    for key in ["bb", "dd", "ff"].iter() {
        cursor.put(key.as_bytes(), b"x", true).unwrap();
    }

    let (key, _, ord) = cursor.search_near(b"dd").unwrap();
    assert_eq!(&key.row()[..], b"dd");
    assert_eq!(ord, std::cmp::Ordering::Equal);

    let (key, _, ord) = cursor.search_near(b"cc").unwrap();
    assert_eq!(&key.row()[..], b"dd");
    assert_eq!(ord, std::cmp::Ordering::Greater);

    let (key, _, ord) = cursor.search_near(b"zz").unwrap();
    assert_eq!(&key.row()[..], b"ff");
    assert_eq!(ord, std::cmp::Ordering::Less);

    drop(cursor);
    db.close().unwrap();
}

#[test]
fn test_overflow_value_round_trip() {
    setup();
    let dir = scratch_dir();

    // the overflow threshold is a quarter of leaf_page_max
    let big = vec![0xabu8; 20 << 10];
    {
        let db = open_db(dir.path(), "leaf_page_max=32K,transaction_sync=off");
        db.create(URI, "key_format=u,value_format=u").unwrap();
        let session = db.open_session().unwrap();
        let mut cursor = session.open_cursor(URI).unwrap();
        cursor.put(b"big", &big, true).unwrap();
        cursor.put(b"small", b"s", true).unwrap();
        drop(cursor);
        db.checkpoint().unwrap();
        db.close().unwrap();
    }

    let db = open_db(dir.path(), "leaf_page_max=32K");
    let session = db.open_session().unwrap();
    assert_eq!(search_key(&session, URI, b"big"), Some(big));
    assert_eq!(search_key(&session, URI, b"small"), Some(b"s".to_vec()));
    db.close().unwrap();
}

#[test]
fn test_create_drop_rename() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");

    db.create("file:one.tdb", "key_format=u,value_format=u")
        .unwrap();
    let session = db.open_session().unwrap();
    let mut cursor = session.open_cursor("file:one.tdb").unwrap();
    cursor.put(b"k", b"v", true).unwrap();
    drop(cursor);

    db.rename("file:one.tdb", "file:two.tdb").unwrap();
    assert_eq!(search_key(&session, "file:two.tdb", b"k"), Some(b"v".to_vec()));
    assert!(matches!(
        session.open_cursor("file:one.tdb"),
        Err(TimberError::NotFound)
    ));

    db.drop_object("file:two.tdb").unwrap();
    assert!(matches!(
        session.open_cursor("file:two.tdb"),
        Err(TimberError::NotFound)
    ));
    db.close().unwrap();
}
