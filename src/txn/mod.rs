//! The transaction manager: snapshot assembly, visibility, and the
//! global oldest-id computation that bounds update-chain garbage
//! collection.

pub mod log;

use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc, RwLock,
};

use crate::{
    error::{TimberError, TimberResult},
    utils::HandyRwLock,
    wal::record::LogOp,
};

/// "No transaction": initial update state and published id of idle
/// sessions.
pub const TXN_NONE: u64 = 0;

/// Rolled-back updates have their id poisoned to this; never visible.
pub const TXN_ABORTED: u64 = u64::MAX;

/// First id handed to a real transaction.
pub const TXN_FIRST: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    ReadUncommitted,
    ReadCommitted,
    Snapshot,
}

impl Isolation {
    pub fn parse(value: &str) -> TimberResult<Self> {
        match value {
            "read-uncommitted" => Ok(Isolation::ReadUncommitted),
            "read-committed" => Ok(Isolation::ReadCommitted),
            "snapshot" => Ok(Isolation::Snapshot),
            _ => Err(TimberError::Config(format!(
                "unknown isolation level {:?}",
                value
            ))),
        }
    }
}

/// The slice of transaction state other threads need to see: the
/// session's running id and the lower bound of its snapshot.
pub struct TxnShared {
    pub id: AtomicU64,
    pub snap_min: AtomicU64,
}

impl TxnShared {
    fn new() -> Self {
        Self {
            id: AtomicU64::new(TXN_NONE),
            snap_min: AtomicU64::new(TXN_NONE),
        }
    }
}

/// One buffered modification: the in-memory update (for rollback) and
/// the log payload (for commit).
pub struct TxnOp {
    pub upd: Option<Arc<crate::btree::page::Update>>,
    pub log: Option<LogOp>,
}

/// Commit-time durability request, per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    None,
    Fsync,
    FsyncDir,
}

/// Per-session transaction context. A session is single-threaded, so
/// this needs no lock of its own; only `TxnShared` is read by others.
pub struct Txn {
    pub isolation: Isolation,
    pub id: u64,
    pub running: bool,
    pub has_snapshot: bool,
    pub snapshot: Vec<u64>,
    pub snap_min: u64,
    pub snap_max: u64,
    pub mods: Vec<TxnOp>,
    pub sync: SyncPolicy,
    /// Set when the cache rolled this transaction back to unstick
    /// eviction; all further operations fail with `Rollback`.
    pub forced_rollback: bool,
}

impl Txn {
    pub fn new(isolation: Isolation) -> Self {
        Self {
            isolation,
            id: TXN_NONE,
            running: false,
            has_snapshot: false,
            snapshot: Vec::new(),
            snap_min: TXN_NONE,
            snap_max: TXN_NONE,
            mods: Vec::new(),
            sync: SyncPolicy::Fsync,
            forced_rollback: false,
        }
    }

    /// Is an update made by `id` visible to this transaction?
    pub fn visible(&self, id: u64) -> bool {
        if id == TXN_ABORTED {
            return false;
        }
        // everyone sees their own writes
        if self.id != TXN_NONE && id == self.id {
            return true;
        }
        match self.isolation {
            Isolation::ReadUncommitted => true,
            Isolation::ReadCommitted | Isolation::Snapshot => {
                if !self.has_snapshot {
                    // no snapshot yet: only committed-before-now data,
                    // which is everything not currently running
                    return true;
                }
                if id >= self.snap_max {
                    return false;
                }
                self.snapshot.binary_search(&id).is_err()
            }
        }
    }
}

/// The process-wide transaction table.
pub struct TxnGlobal {
    /// Next id to allocate.
    current: AtomicU64,
    /// Below this id every update is visible to every transaction.
    oldest: AtomicU64,
    /// Oldest id that was running at the last scan.
    last_running: AtomicU64,
    /// Positive: concurrent snapshot scans; -1: an oldest-id rewrite
    /// in progress.
    scan_count: AtomicI64,
    states: RwLock<Vec<Arc<TxnShared>>>,
}

impl TxnGlobal {
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(TXN_FIRST),
            oldest: AtomicU64::new(TXN_FIRST),
            last_running: AtomicU64::new(TXN_FIRST),
            scan_count: AtomicI64::new(0),
            states: RwLock::new(Vec::new()),
        }
    }

    /// Register a session slot; the returned shared state is scanned
    /// by snapshot assembly and oldest-id advancement.
    pub fn register_session(&self) -> Arc<TxnShared> {
        let shared = Arc::new(TxnShared::new());
        self.states.wl().push(Arc::clone(&shared));
        shared
    }

    pub fn current_id(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn oldest_id(&self) -> u64 {
        self.oldest.load(Ordering::SeqCst)
    }

    pub fn last_running(&self) -> u64 {
        self.last_running.load(Ordering::SeqCst)
    }

    /// Allocate a transaction id; deferred to the first write of a
    /// transaction so read-only transactions stay id-less.
    pub fn alloc_id(&self, txn: &mut Txn, shared: &TxnShared) -> u64 {
        if txn.id == TXN_NONE {
            let id = self.current.fetch_add(1, Ordering::SeqCst);
            txn.id = id;
            shared.id.store(id, Ordering::SeqCst);
        }
        txn.id
    }

    fn scan_enter(&self) {
        loop {
            let count = self.scan_count.load(Ordering::SeqCst);
            if count >= 0
                && self
                    .scan_count
                    .compare_exchange(count, count + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                return;
            }
            std::thread::yield_now();
        }
    }

    fn scan_leave(&self) {
        self.scan_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Capture a snapshot: the ascending array of concurrently-running
    /// ids, `snap_max` = current, `snap_min` = min of both.
    pub fn get_snapshot(&self, txn: &mut Txn, shared: &TxnShared) {
        self.scan_enter();
        let current = self.current.load(Ordering::SeqCst);

        let mut snapshot = Vec::new();
        {
            let states = self.states.rl();
            for state in states.iter() {
                let id = state.id.load(Ordering::SeqCst);
                if id == TXN_NONE || id == txn.id || id >= current {
                    continue;
                }
                snapshot.push(id);
            }
        }
        snapshot.sort_unstable();
        snapshot.dedup();

        txn.snap_max = current;
        txn.snap_min = snapshot.first().copied().unwrap_or(current);
        txn.snapshot = snapshot;
        txn.has_snapshot = true;

        // pin garbage collection while this snapshot is in use
        shared.snap_min.store(txn.snap_min, Ordering::SeqCst);
        self.scan_leave();
    }

    pub fn release_snapshot(&self, txn: &mut Txn, shared: &TxnShared) {
        txn.has_snapshot = false;
        txn.snapshot.clear();
        shared.snap_min.store(TXN_NONE, Ordering::SeqCst);
    }

    /// Advance the published oldest id: the minimum of every session's
    /// running id and snapshot minimum. Any thread may call this; a
    /// CAS on the scan counter admits one rewriter at a time.
    pub fn update_oldest(&self) {
        self.scan_enter();
        let current = self.current.load(Ordering::SeqCst);
        let mut oldest = current;
        let mut last_running = current;
        {
            let states = self.states.rl();
            for state in states.iter() {
                let id = state.id.load(Ordering::SeqCst);
                if id != TXN_NONE && id < last_running {
                    last_running = id;
                }
                if id != TXN_NONE && id < oldest {
                    oldest = id;
                }
                let snap_min = state.snap_min.load(Ordering::SeqCst);
                if snap_min != TXN_NONE && snap_min < oldest {
                    oldest = snap_min;
                }
            }
        }

        // become the single rewriter: only possible when we are the
        // only scanner left
        if self
            .scan_count
            .compare_exchange(1, -1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // monotonic: never step backwards
            if oldest > self.oldest.load(Ordering::SeqCst) {
                self.oldest.store(oldest, Ordering::SeqCst);
            }
            if last_running > self.last_running.load(Ordering::SeqCst) {
                self.last_running.store(last_running, Ordering::SeqCst);
            }
            self.scan_count.store(0, Ordering::SeqCst);
        } else {
            self.scan_leave();
        }
    }

    /// Is `id` visible to every current and future transaction?
    pub fn visible_all(&self, id: u64) -> bool {
        id != TXN_ABORTED && id != TXN_NONE && id < self.oldest_id()
    }

    /// Does this session hold the oldest pinned snapshot or id? Used
    /// by the cache to pick a victim when eviction is stuck.
    pub fn is_pinning_oldest(&self, shared: &TxnShared) -> bool {
        let oldest = self.oldest_id();
        let id = shared.id.load(Ordering::SeqCst);
        let snap_min = shared.snap_min.load(Ordering::SeqCst);
        (id != TXN_NONE && id <= oldest) || (snap_min != TXN_NONE && snap_min <= oldest)
    }
}

/// Begin a transaction on a session.
pub fn begin(global: &TxnGlobal, txn: &mut Txn, shared: &TxnShared) -> TimberResult<()> {
    if txn.running {
        return Err(TimberError::Rollback(
            "transaction already running".to_string(),
        ));
    }
    txn.running = true;
    txn.forced_rollback = false;
    txn.id = TXN_NONE;
    txn.mods.clear();
    if txn.isolation == Isolation::Snapshot {
        global.get_snapshot(txn, shared);
    }
    Ok(())
}

/// Read-committed transactions re-take their snapshot at each
/// operation.
pub fn refresh_snapshot(global: &TxnGlobal, txn: &mut Txn, shared: &TxnShared) {
    if txn.running && txn.isolation == Isolation::ReadCommitted {
        global.get_snapshot(txn, shared);
    }
}

/// Finish the in-memory side of a commit: release the snapshot and
/// publish "no transaction". The caller has already written the log.
pub fn commit_finish(global: &TxnGlobal, txn: &mut Txn, shared: &TxnShared) {
    txn.mods.clear();
    txn.running = false;
    txn.id = TXN_NONE;
    shared.id.store(TXN_NONE, Ordering::SeqCst);
    global.release_snapshot(txn, shared);
    global.update_oldest();
}

/// Roll back: poison every buffered update so readers skip it, then
/// publish "no transaction".
pub fn rollback(global: &TxnGlobal, txn: &mut Txn, shared: &TxnShared) {
    for op in txn.mods.drain(..) {
        if let Some(upd) = op.upd {
            upd.txn_id.store(TXN_ABORTED, Ordering::SeqCst);
        }
    }
    txn.running = false;
    txn.id = TXN_NONE;
    shared.id.store(TXN_NONE, Ordering::SeqCst);
    global.release_snapshot(txn, shared);
    global.update_oldest();
}

/// Record a modification in the running transaction.
pub fn remember_op(
    txn: &mut Txn,
    upd: Option<Arc<crate::btree::page::Update>>,
    log: Option<LogOp>,
) {
    txn.mods.push(TxnOp { upd, log });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_excludes_running() {
        let global = TxnGlobal::new();
        let s1 = global.register_session();
        let s2 = global.register_session();

        // s1 starts writing
        let mut t1 = Txn::new(Isolation::Snapshot);
        begin(&global, &mut t1, &s1).unwrap();
        let id1 = global.alloc_id(&mut t1, &s1);

        // s2 snapshots while t1 is running
        let mut t2 = Txn::new(Isolation::Snapshot);
        begin(&global, &mut t2, &s2).unwrap();
        assert!(t2.snapshot.contains(&id1));
        assert!(!t2.visible(id1));

        commit_finish(&global, &mut t1, &s1);
        // the old snapshot still excludes it
        assert!(!t2.visible(id1));

        // a fresh snapshot sees it
        let mut t3 = Txn::new(Isolation::Snapshot);
        begin(&global, &mut t3, &s1).unwrap();
        assert!(t3.visible(id1));
    }

    #[test]
    fn test_own_writes_visible() {
        let global = TxnGlobal::new();
        let s1 = global.register_session();
        let mut t1 = Txn::new(Isolation::Snapshot);
        begin(&global, &mut t1, &s1).unwrap();
        let id = global.alloc_id(&mut t1, &s1);
        assert!(t1.visible(id));
    }

    #[test]
    fn test_aborted_never_visible() {
        let t = Txn::new(Isolation::ReadUncommitted);
        assert!(!t.visible(TXN_ABORTED));
    }

    #[test]
    fn test_oldest_monotonic() {
        let global = TxnGlobal::new();
        let s1 = global.register_session();

        let mut prev = global.oldest_id();
        for _ in 0..10 {
            let mut t = Txn::new(Isolation::Snapshot);
            begin(&global, &mut t, &s1).unwrap();
            global.alloc_id(&mut t, &s1);
            commit_finish(&global, &mut t, &s1);

            let oldest = global.oldest_id();
            assert!(oldest >= prev);
            prev = oldest;
        }
    }

    #[test]
    fn test_oldest_pinned_by_snapshot() {
        let global = TxnGlobal::new();
        let s1 = global.register_session();
        let s2 = global.register_session();

        let mut t1 = Txn::new(Isolation::Snapshot);
        begin(&global, &mut t1, &s1).unwrap();
        let pinned = t1.snap_min;

        // other sessions churn
        for _ in 0..5 {
            let mut t = Txn::new(Isolation::Snapshot);
            begin(&global, &mut t, &s2).unwrap();
            global.alloc_id(&mut t, &s2);
            commit_finish(&global, &mut t, &s2);
        }

        assert!(global.oldest_id() <= pinned);
        assert!(global.is_pinning_oldest(&s1));
    }
}
