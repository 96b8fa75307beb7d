use std::sync::PoisonError;

use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// `Restart` never escapes the B-tree layer; cursors catch it and
/// re-descend from the root. `Panic` poisons the owning database handle,
/// after which every call except close fails with `Panic` again.
#[derive(Debug, Error)]
pub enum TimberError {
    #[error("conflict with a concurrent operation, transaction must roll back: {0}")]
    Rollback(String),

    #[error("duplicate key")]
    DuplicateKey,

    #[error("item not found")]
    NotFound,

    #[error("database panic: {0}")]
    Panic(String),

    /// A tree walk raced with a split; re-descend from the root.
    #[error("restart the operation")]
    Restart,

    #[error("recovery must be run before the database can be used")]
    RunRecovery,

    /// Transient contention (hazard pointer held, slot full, lock
    /// attempt failed). Recovered by retrying at the call site.
    #[error("resource busy")]
    Busy,

    #[error("operation timed out")]
    Timeout,

    #[error("data corruption detected: {0}")]
    Corrupt(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TimberError {
    /// Print the current backtrace to the log. Debugging aid for
    /// deadlock-ish failures where the error text alone is useless.
    pub fn show_backtrace(&self) {
        let bt = backtrace::Backtrace::new();
        log::error!("error: {}, backtrace:\n{:?}", self, bt);
    }

    /// True for the error kinds a caller may transparently retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, TimberError::Busy | TimberError::Restart)
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        TimberError::Corrupt(msg.into())
    }

    pub fn panic(msg: impl Into<String>) -> Self {
        let e = TimberError::Panic(msg.into());
        e.show_backtrace();
        e
    }
}

impl<T> From<PoisonError<T>> for TimberError {
    fn from(e: PoisonError<T>) -> Self {
        TimberError::Panic(format!("poisoned lock: {}", e))
    }
}

pub type TimberResult<T> = Result<T, TimberError>;

/// The common `Result<(), _>` shape.
pub type TimberVoid = Result<(), TimberError>;
