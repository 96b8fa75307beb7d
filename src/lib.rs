//! TimberDB: an embedded, transactional key/value engine built around
//! copy-on-write B-trees over block-addressed files, a shared page
//! cache with generation-based LRU eviction, MVCC transactions, a
//! slot-batched write-ahead log with crash recovery, and an optional
//! LSM composition of B-trees.

pub mod block;
pub mod btree;
pub mod cache;
pub(crate) mod checkpoint;
pub mod config;
pub mod database;
pub mod error;
pub mod io;
pub mod lsm;
pub mod meta;
pub mod session;
pub mod txn;
pub mod utils;
pub mod wal;

pub use crate::{
    block::Compressor,
    btree::{Collator, Cursor, CursorKey},
    config::Config,
    database::{Database, EventHandler, Session},
    error::{TimberError, TimberResult, TimberVoid},
    lsm::{LsmScan, LsmTree},
    txn::Isolation,
    utils::{init_log, HandyRwLock},
    wal::Lsn,
};
