//! The block manager: extent allocation inside a single file, page
//! image I/O, and checkpoint-time extent bookkeeping.

pub mod ext;
pub mod io;
pub mod mgr;

pub use io::{Compressor, Cookie, PageHeader, PageType};
pub use mgr::{BlockCheckpoint, BlockManager};
