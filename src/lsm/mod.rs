//! The LSM layer: an ordered roster of B-tree chunks with Bloom
//! filters and a background merge worker pool.

pub mod bloom;
pub mod cursor;
pub mod manager;
pub mod tree;

pub use cursor::LsmScan;
pub use manager::LsmManager;
pub use tree::LsmTree;
