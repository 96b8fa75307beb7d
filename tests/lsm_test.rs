mod test_utils;

use std::time::{Duration, Instant};

use test_utils::{open_db, scratch_dir, setup, wide_key};
use timberdb::TimberError;

const URI: &str = "lsm:stack";

#[test]
fn test_lsm_put_get_delete() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(URI, "lsm=(chunk_size=64K,bloom=true)").unwrap();
    let session = db.open_session().unwrap();
    let tree = session.open_lsm(URI).unwrap();

    for i in 0..500 {
        session
            .lsm_put(&tree, &wide_key(i, 12), format!("v{}", i).as_bytes())
            .unwrap();
    }
    assert_eq!(&session.lsm_get(&tree, &wide_key(42, 12)).unwrap()[..], b"v42");

    session.lsm_delete(&tree, &wide_key(42, 12)).unwrap();
    assert!(matches!(
        session.lsm_get(&tree, &wide_key(42, 12)),
        Err(TimberError::NotFound)
    ));
    // neighbors unaffected
    assert_eq!(&session.lsm_get(&tree, &wide_key(41, 12)).unwrap()[..], b"v41");

    db.close().unwrap();
}

#[test]
fn test_lsm_scan_merges_chunks() {
    setup();
    let dir = scratch_dir();
    // a tiny chunk budget so several switches happen during the load
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(URI, "lsm=(chunk_size=16K,bloom=true,merge_min=2,merge_max=4)")
        .unwrap();
    let session = db.open_session().unwrap();
    let tree = session.open_lsm(URI).unwrap();

    let rows = 1_000;
    let value = vec![7u8; 64];
    for i in 0..rows {
        session.lsm_put(&tree, &wide_key(i, 12), &value).unwrap();
    }
    // overwrite a band so newest-wins is exercised across chunks
    for i in 100..200 {
        session.lsm_put(&tree, &wide_key(i, 12), b"newer").unwrap();
    }
    // give the background switch a moment
    std::thread::sleep(Duration::from_millis(500));

    let mut scan = session.lsm_scan(&tree);
    let mut count = 0;
    let mut prev: Option<Vec<u8>> = None;
    while let Some((key, val)) = scan.next().unwrap() {
        let key = key.to_vec();
        if let Some(prev) = &prev {
            assert!(*prev < key);
        }
        let i: usize = String::from_utf8(key.clone()).unwrap().parse().unwrap();
        if (100..200).contains(&i) {
            assert_eq!(&val[..], b"newer");
        }
        prev = Some(key);
        count += 1;
    }
    assert_eq!(count, rows);

    db.close().unwrap();
}

#[test]
fn test_lsm_merge_progress() {
    setup();
    let dir = scratch_dir();
    let db = open_db(dir.path(), "transaction_sync=off");
    db.create(URI, "lsm=(chunk_size=16K,merge_min=2,merge_max=4,bloom=true)")
        .unwrap();
    let session = db.open_session().unwrap();
    let tree = session.open_lsm(URI).unwrap();

    let rows = 3_000;
    let value = vec![3u8; 128];
    for i in 0..rows {
        session.lsm_put(&tree, &wide_key(i, 12), &value).unwrap();
    }
    let loaded_chunks = tree.chunk_count();

    // quiesce: flush + merge workers compact the stack
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut final_chunks = tree.chunk_count();
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(200));
        final_chunks = tree.chunk_count();
        if loaded_chunks > 4 && final_chunks <= loaded_chunks / 2 {
            break;
        }
    }
    if loaded_chunks > 4 {
        assert!(
            final_chunks < loaded_chunks,
            "no merge progress: {} chunks before, {} after",
            loaded_chunks,
            final_chunks
        );
    }

    // data intact after merging
    for i in (0..rows).step_by(499) {
        assert_eq!(session.lsm_get(&tree, &wide_key(i, 12)).unwrap().len(), 128);
    }
    db.close().unwrap();
}
