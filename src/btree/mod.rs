//! The B-tree: in-memory pages, search, cursors, splits and
//! reconciliation.

pub mod cell;
pub mod cursor;
pub mod hazard;
pub mod ovfl;
pub mod page;
pub mod reconcile;
pub mod search;
pub mod skiplist;
pub mod split;
pub mod tree;

pub use cursor::{Cursor, CursorKey};
pub use tree::{BTree, BtreeConfig, Collator, Store};
