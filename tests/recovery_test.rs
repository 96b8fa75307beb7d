mod test_utils;

use test_utils::{open_db, scratch_dir, search_key, setup, wide_key};

const URI: &str = "file:recover.tdb";

/// Synced commits survive a crash with no checkpoint at all: recovery
/// rebuilds the file table and replays the log.
#[test]
fn test_recover_without_any_checkpoint() {
    setup();
    let dir = scratch_dir();
    let rows = 300;
    {
        let db = open_db(dir.path(), "");
        db.create(URI, "key_format=u,value_format=u").unwrap();
        let session = db.open_session().unwrap();
        let mut cursor = session.open_cursor(URI).unwrap();
        for i in 0..rows {
            cursor
                .put(&wide_key(i, 12), format!("r{}", i).as_bytes(), true)
                .unwrap();
        }
        drop(cursor);
        db.crash();
    }

    let db = open_db(dir.path(), "");
    let session = db.open_session().unwrap();
    for i in 0..rows {
        assert_eq!(
            search_key(&session, URI, &wide_key(i, 12)),
            Some(format!("r{}", i).into_bytes()),
            "row {} lost in recovery",
            i
        );
    }
    db.close().unwrap();
}

/// A crash between a checkpoint and later commits: the checkpointed
/// data comes from the btree, the rest replays from the log.
#[test]
fn test_recover_after_checkpoint_and_more_writes() {
    setup();
    let dir = scratch_dir();
    {
        let db = open_db(dir.path(), "");
        db.create(URI, "key_format=u,value_format=u").unwrap();
        let session = db.open_session().unwrap();
        let mut cursor = session.open_cursor(URI).unwrap();
        for i in 0..200 {
            cursor.put(&wide_key(i, 12), b"before", true).unwrap();
        }
        drop(cursor);
        db.checkpoint().unwrap();

        let mut cursor = session.open_cursor(URI).unwrap();
        for i in 200..400 {
            cursor.put(&wide_key(i, 12), b"after", true).unwrap();
        }
        // overwrite something already checkpointed
        cursor.put(&wide_key(7, 12), b"after", true).unwrap();
        drop(cursor);
        db.crash();
    }

    let db = open_db(dir.path(), "");
    let session = db.open_session().unwrap();
    assert_eq!(
        search_key(&session, URI, &wide_key(0, 12)),
        Some(b"before".to_vec())
    );
    assert_eq!(
        search_key(&session, URI, &wide_key(7, 12)),
        Some(b"after".to_vec())
    );
    assert_eq!(
        search_key(&session, URI, &wide_key(399, 12)),
        Some(b"after".to_vec())
    );
    db.close().unwrap();
}

/// An aborted transaction's writes never reappear after recovery:
/// only commits are logged.
#[test]
fn test_rollback_not_replayed() {
    setup();
    let dir = scratch_dir();
    {
        let db = open_db(dir.path(), "");
        db.create(URI, "key_format=u,value_format=u").unwrap();
        let session = db.open_session().unwrap();

        let mut cursor = session.open_cursor(URI).unwrap();
        cursor.put(b"keep", b"1", true).unwrap();
        drop(cursor);

        session.begin_transaction("").unwrap();
        let mut cursor = session.open_cursor(URI).unwrap();
        cursor.put(b"lose", b"2", true).unwrap();
        drop(cursor);
        session.rollback_transaction().unwrap();

        db.crash();
    }

    let db = open_db(dir.path(), "");
    let session = db.open_session().unwrap();
    assert_eq!(search_key(&session, URI, b"keep"), Some(b"1".to_vec()));
    assert_eq!(search_key(&session, URI, b"lose"), None);
    db.close().unwrap();
}

/// After a clean checkpoint and crash, recovery restores the state
/// without needing log records older than the checkpoint (which the
/// archiver may have removed).
#[test]
fn test_checkpoint_bounds_recovery() {
    setup();
    let dir = scratch_dir();
    {
        let db = open_db(dir.path(), "log=(file_max=1M,archive=true)");
        db.create(URI, "key_format=u,value_format=u").unwrap();
        let session = db.open_session().unwrap();
        let mut cursor = session.open_cursor(URI).unwrap();
        for i in 0..500 {
            cursor
                .put(&wide_key(i, 12), &vec![1u8; 256], true)
                .unwrap();
        }
        drop(cursor);
        db.checkpoint().unwrap();
        db.crash();
    }

    let db = open_db(dir.path(), "log=(file_max=1M,archive=true)");
    let session = db.open_session().unwrap();
    for i in (0..500).step_by(101) {
        assert!(search_key(&session, URI, &wide_key(i, 12)).is_some());
    }
    db.close().unwrap();
}
