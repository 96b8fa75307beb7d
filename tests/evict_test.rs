mod test_utils;

use test_utils::{open_db, scratch_dir, setup, wide_key};

const URI: &str = "file:evict.tdb";

/// Write far more data than the cache can hold; back-pressure and the
/// eviction server keep the in-use bytes bounded and no insert fails.
#[test]
fn test_eviction_back_pressure() {
    setup();
    let dir = scratch_dir();
    let cache_size: u64 = 1 << 20;
    let db = open_db(
        dir.path(),
        "cache_size=1M,eviction_target=70,eviction_dirty_target=60,\
         leaf_page_max=4K,memory_page_max=32K,transaction_sync=off",
    );
    db.create(URI, "key_format=u,value_format=u").unwrap();
    let session = db.open_session().unwrap();
    let mut cursor = session.open_cursor(URI).unwrap();

    let rows = 5_000;
    let value = vec![0x5au8; 512];
    for i in 0..rows {
        cursor.put(&wide_key(i, 16), &value, true).unwrap();
    }
    drop(cursor);

    // steady state: usage is bounded by a small multiple of the
    // configured cache size
    let inuse = db.cache_bytes_inuse();
    assert!(
        inuse <= 4 * cache_size,
        "cache grew to {} bytes against a {} byte budget",
        inuse,
        cache_size
    );

    // spot check that evicted data reads back
    let mut cursor = session.open_cursor(URI).unwrap();
    for i in (0..rows).step_by(997) {
        assert_eq!(cursor.search(&wide_key(i, 16)).unwrap().len(), 512);
    }
    drop(cursor);
    db.close().unwrap();
}
