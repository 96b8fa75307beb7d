mod test_utils;

use test_utils::{open_db, scratch_dir, setup};
use timberdb::TimberError;

const URI: &str = "file:txn.tdb";

#[test]
fn test_snapshot_isolation() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(URI, "key_format=u,value_format=u").unwrap();

    let s1 = db.open_session().unwrap();
    let s2 = db.open_session().unwrap();

    // s1 snapshots before s2 commits
    s1.begin_transaction("isolation=snapshot").unwrap();
    let mut c1 = s1.open_cursor(URI).unwrap();
    assert!(matches!(c1.search(b"k1"), Err(TimberError::NotFound)));

    {
        let mut c2 = s2.open_cursor(URI).unwrap();
        c2.put(b"k1", b"2", true).unwrap();
        assert_eq!(&c2.search(b"k1").unwrap()[..], b"2");
    }

    // the old snapshot still excludes the commit
    assert!(matches!(c1.search(b"k1"), Err(TimberError::NotFound)));
    drop(c1);
    s1.commit_transaction().unwrap();

    // a fresh snapshot sees it
    s1.begin_transaction("isolation=snapshot").unwrap();
    let mut c1 = s1.open_cursor(URI).unwrap();
    assert_eq!(&c1.search(b"k1").unwrap()[..], b"2");
    drop(c1);
    s1.commit_transaction().unwrap();

    db.close().unwrap();
}

#[test]
fn test_read_committed_sees_new_commits() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(URI, "key_format=u,value_format=u").unwrap();

    let s1 = db.open_session().unwrap();
    let s2 = db.open_session().unwrap();

    s1.begin_transaction("isolation=read-committed").unwrap();
    let mut c1 = s1.open_cursor(URI).unwrap();
    assert!(matches!(c1.search(b"rc"), Err(TimberError::NotFound)));

    {
        let mut c2 = s2.open_cursor(URI).unwrap();
        c2.put(b"rc", b"1", true).unwrap();
    }

    // read-committed re-takes its snapshot per operation
    assert_eq!(&c1.search(b"rc").unwrap()[..], b"1");
    drop(c1);
    s1.commit_transaction().unwrap();
    db.close().unwrap();
}

#[test]
fn test_rollback_discards_writes() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(URI, "key_format=u,value_format=u").unwrap();

    let session = db.open_session().unwrap();
    session.begin_transaction("").unwrap();
    {
        let mut cursor = session.open_cursor(URI).unwrap();
        cursor.put(b"gone", b"1", true).unwrap();
        cursor.put(b"gone2", b"2", true).unwrap();
        assert_eq!(&cursor.search(b"gone").unwrap()[..], b"1");
    }
    session.rollback_transaction().unwrap();

    let mut cursor = session.open_cursor(URI).unwrap();
    assert!(matches!(cursor.search(b"gone"), Err(TimberError::NotFound)));
    assert!(matches!(cursor.search(b"gone2"), Err(TimberError::NotFound)));
    drop(cursor);
    db.close().unwrap();
}

#[test]
fn test_write_conflict_rolls_back() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(URI, "key_format=u,value_format=u").unwrap();

    let s1 = db.open_session().unwrap();
    let s2 = db.open_session().unwrap();

    s1.begin_transaction("").unwrap();
    s2.begin_transaction("").unwrap();

    let mut c1 = s1.open_cursor(URI).unwrap();
    c1.put(b"fight", b"one", true).unwrap();

    // s2 cannot write over s1's uncommitted update
    let mut c2 = s2.open_cursor(URI).unwrap();
    assert!(matches!(
        c2.put(b"fight", b"two", true),
        Err(TimberError::Rollback(_))
    ));

    drop(c1);
    drop(c2);
    s1.commit_transaction().unwrap();
    s2.rollback_transaction().unwrap();

    let s3 = db.open_session().unwrap();
    let mut c3 = s3.open_cursor(URI).unwrap();
    assert_eq!(&c3.search(b"fight").unwrap()[..], b"one");
    drop(c3);
    db.close().unwrap();
}

#[test]
fn test_commit_after_commit_visible_everywhere() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(URI, "key_format=u,value_format=u").unwrap();

    let s1 = db.open_session().unwrap();
    s1.begin_transaction("").unwrap();
    {
        let mut cursor = s1.open_cursor(URI).unwrap();
        cursor.put(b"pub", b"v", true).unwrap();
    }
    s1.commit_transaction().unwrap();

    // both the same session and a new one observe the commit
    let mut c1 = s1.open_cursor(URI).unwrap();
    assert_eq!(&c1.search(b"pub").unwrap()[..], b"v");
    drop(c1);

    let s2 = db.open_session().unwrap();
    let mut c2 = s2.open_cursor(URI).unwrap();
    assert_eq!(&c2.search(b"pub").unwrap()[..], b"v");
    drop(c2);
    db.close().unwrap();
}
