//! The shared page cache: byte accounting, the global read
//! generation, and back-pressure on application threads. The eviction
//! server and workers live in `evict`.

pub mod evict;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Condvar, Mutex, RwLock, Weak,
};

use log::debug;
use once_cell::sync::OnceCell;

use crate::{
    btree::{page::Page, BTree},
    config::Config,
    error::{TimberError, TimberVoid},
    utils::HandyRwLock,
};

/// Pages touched by internal chores keep their old generation so a
/// maintenance scan does not promote everything it reads.
pub const READ_GEN_OLDEST: u64 = 1;

/// Application threads give up and roll back the pinning transaction
/// after this many fruitless eviction attempts.
const STUCK_RETRY_MAX: u32 = 100;

pub struct CacheConfig {
    pub max_bytes: u64,
    /// Percent of `max_bytes` where the eviction server starts a pass.
    pub target_pct: u64,
    /// Percent of `max_bytes` of dirty data where a pass starts.
    pub dirty_target_pct: u64,
}

impl CacheConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_bytes: config.get_u64("cache_size", 100 << 20),
            target_pct: config.get_u64("eviction_target", 80),
            dirty_target_pct: config.get_u64("eviction_dirty_target", 80),
        }
    }
}

pub struct Cache {
    pub cfg: CacheConfig,
    bytes_inuse: AtomicU64,
    bytes_dirty: AtomicU64,
    read_gen: AtomicU64,
    /// Open btrees, scanned by the eviction server.
    trees: RwLock<Vec<Weak<BTree>>>,
    /// Sessions, scanned for hazard pointers and stuck transactions.
    sessions: RwLock<Vec<Weak<crate::session::SessionInner>>>,
    /// Application threads wait here under back-pressure.
    waiter_lock: Mutex<()>,
    waiter_cond: Condvar,
    /// Wakes the eviction server out of its timer.
    pub(crate) server_lock: Mutex<bool>,
    pub(crate) server_cond: Condvar,
    pub(crate) running: AtomicBool,
    /// The candidate queue, created when the server starts.
    pub(crate) queue: OnceCell<evict::EvictQueue>,
}

impl Cache {
    pub fn new(cfg: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            bytes_inuse: AtomicU64::new(0),
            bytes_dirty: AtomicU64::new(0),
            read_gen: AtomicU64::new(READ_GEN_OLDEST),
            trees: RwLock::new(Vec::new()),
            sessions: RwLock::new(Vec::new()),
            waiter_lock: Mutex::new(()),
            waiter_cond: Condvar::new(),
            server_lock: Mutex::new(false),
            server_cond: Condvar::new(),
            running: AtomicBool::new(true),
            queue: OnceCell::new(),
        })
    }

    pub fn register_tree(&self, tree: &Arc<BTree>) {
        self.trees.wl().push(Arc::downgrade(tree));
    }

    pub fn deregister_tree(&self, tree: &Arc<BTree>) {
        self.trees
            .wl()
            .retain(|w| w.upgrade().map_or(false, |t| !Arc::ptr_eq(&t, tree)));
    }

    pub fn register_session(&self, session: &Arc<crate::session::SessionInner>) {
        self.sessions.wl().push(Arc::downgrade(session));
    }

    pub fn trees(&self) -> Vec<Arc<BTree>> {
        self.trees.rl().iter().filter_map(|w| w.upgrade()).collect()
    }

    pub fn sessions(&self) -> Vec<Arc<crate::session::SessionInner>> {
        self.sessions
            .rl()
            .iter()
            .filter_map(|w| w.upgrade())
            .collect()
    }

    // ------------------------------------------------------------------
    // accounting

    pub fn bytes_inuse(&self) -> u64 {
        self.bytes_inuse.load(Ordering::SeqCst)
    }

    pub fn bytes_dirty(&self) -> u64 {
        self.bytes_dirty.load(Ordering::SeqCst)
    }

    pub fn page_in(&self, bytes: u64) {
        self.bytes_inuse.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn page_out(&self, bytes: u64, was_dirty: bool) {
        saturating_sub(&self.bytes_inuse, bytes);
        if was_dirty {
            saturating_sub(&self.bytes_dirty, bytes);
        }
        // room freed up; release anyone stuck in eviction_check
        self.waiter_cond.notify_all();
    }

    /// Stamp a page most-recently-used.
    pub fn touch(&self, page: &Arc<Page>) {
        let gen = self.read_gen.fetch_add(1, Ordering::SeqCst) + 1;
        page.read_gen.store(gen, Ordering::SeqCst);
    }

    pub fn global_read_gen(&self) -> u64 {
        self.read_gen.load(Ordering::SeqCst)
    }

    pub fn mark_dirty(&self, page: &Arc<Page>) {
        if page.mark_dirty() {
            self.bytes_dirty
                .fetch_add(page.footprint(), Ordering::SeqCst);
        }
    }

    pub fn mark_clean(&self, page: &Arc<Page>) {
        if page.mark_clean() {
            saturating_sub(&self.bytes_dirty, page.footprint());
        }
    }

    // ------------------------------------------------------------------
    // thresholds

    pub fn over_trigger(&self) -> bool {
        let inuse = self.bytes_inuse();
        let dirty = self.bytes_dirty();
        inuse > self.cfg.max_bytes * self.cfg.target_pct / 100
            || dirty > self.cfg.max_bytes * self.cfg.dirty_target_pct / 100
    }

    pub fn over_limit(&self) -> bool {
        self.bytes_inuse() > self.cfg.max_bytes
    }

    /// Is a hazard pointer anywhere referencing `page`?
    pub fn page_pinned(&self, page: &Arc<Page>) -> bool {
        self.sessions().iter().any(|s| s.hazards.holds(page))
    }

    pub fn wake_server(&self) {
        let mut urgent = self.server_lock.lock().unwrap();
        *urgent = true;
        self.server_cond.notify_all();
    }

    /// Back-pressure: a thread about to grow the cache helps evict or
    /// waits while usage is over the hard limit. Rolls back the
    /// calling session's transaction when eviction is stuck and that
    /// transaction is the one pinning the oldest snapshot.
    pub fn eviction_check(&self, session: &crate::session::SessionInner) -> TimberVoid {
        if !self.over_limit() {
            return Ok(());
        }
        self.wake_server();

        let mut retries = 0u32;
        while self.over_limit() {
            // help out before sleeping
            match evict::evict_one(self, session) {
                Ok(true) => {
                    retries = 0;
                    continue;
                }
                Ok(false) => {
                    // queue is dry; force out coldest-generation pages
                    match evict::evict_would_block(self, session) {
                        Ok(true) => {
                            retries = 0;
                            continue;
                        }
                        Ok(false) => {}
                        Err(e) if e.is_transient() => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(e),
            }

            retries += 1;
            if retries > STUCK_RETRY_MAX {
                if session.txn_global.is_pinning_oldest(&session.txn_shared) {
                    // the cache is full of data this transaction pins;
                    // sacrifice it rather than deadlock
                    let mut txn = session.txn.lock().unwrap();
                    if txn.running {
                        debug!("cache stuck; rolling back the oldest transaction");
                        txn.forced_rollback = true;
                        crate::txn::rollback(&session.txn_global, &mut txn, &session.txn_shared);
                        return Err(TimberError::Rollback(
                            "cache stuck; oldest transaction rolled back".to_string(),
                        ));
                    }
                }
                retries = 0;
            }

            let guard = self.waiter_lock.lock().unwrap();
            let _ = self
                .waiter_cond
                .wait_timeout(guard, std::time::Duration::from_millis(10))
                .unwrap();
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.server_cond.notify_all();
        self.waiter_cond.notify_all();
    }
}

fn saturating_sub(counter: &AtomicU64, n: u64) {
    let mut cur = counter.load(Ordering::SeqCst);
    loop {
        let next = cur.saturating_sub(n);
        match counter.compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return,
            Err(actual) => cur = actual,
        }
    }
}
