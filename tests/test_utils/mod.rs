#![allow(dead_code)]

use std::path::Path;

use tempfile::TempDir;
use timberdb::{Database, Session};

/// # Conduct the initialization
///
/// - Setting up log configurations.
pub fn setup() {
    timberdb::init_log();
}

pub fn scratch_dir() -> TempDir {
    tempfile::tempdir().unwrap()
}

pub fn open_db(home: &Path, config: &str) -> Database {
    Database::open(home, config).unwrap()
}

/// A fixed-width ascending key so inserts arrive in collation order.
pub fn wide_key(i: usize, width: usize) -> Vec<u8> {
    format!("{:0width$}", i, width = width).into_bytes()
}

pub fn insert_row(session: &Session, uri: &str, key: &[u8], value: &[u8]) {
    let mut cursor = session.open_cursor(uri).unwrap();
    cursor.put(key, value, true).unwrap();
}

pub fn search_key(session: &Session, uri: &str, key: &[u8]) -> Option<Vec<u8>> {
    let mut cursor = session.open_cursor(uri).unwrap();
    match cursor.search(key) {
        Ok(value) => Some(value.to_vec()),
        Err(timberdb::TimberError::NotFound) => None,
        Err(e) => panic!("search failed: {}", e),
    }
}

/// Count the visible rows with a full forward walk.
pub fn count_rows(session: &Session, uri: &str) -> usize {
    let mut cursor = session.open_cursor(uri).unwrap();
    let mut count = 0;
    while cursor.next().unwrap().is_some() {
        count += 1;
    }
    count
}
