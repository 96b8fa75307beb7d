use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use crate::{
    btree::hazard::{HazardArray, HazardSlot},
    cache::Cache,
    error::{TimberError, TimberResult},
    txn::{self, Isolation, Txn, TxnGlobal, TxnShared},
    wal::LogManager,
};

/// The per-session state the core layers need: the hazard array, the
/// transaction context, and the split generation the session is
/// reading under. The public session object in `database` wraps this.
pub struct SessionInner {
    pub id: usize,
    pub hazards: HazardArray,
    pub txn: Mutex<Txn>,
    pub txn_shared: Arc<TxnShared>,
    /// Which internal-page index generation this session may be
    /// traversing; gates split-stash reclamation.
    pub split_gen: AtomicU64,
    pub cache: Arc<Cache>,
    pub txn_global: Arc<TxnGlobal>,
    pub log: Option<Arc<LogManager>>,
}

impl SessionInner {
    pub fn new(
        id: usize,
        isolation: Isolation,
        cache: Arc<Cache>,
        txn_global: Arc<TxnGlobal>,
        log: Option<Arc<LogManager>>,
    ) -> Arc<Self> {
        let txn_shared = txn_global.register_session();
        Arc::new(Self {
            id,
            hazards: HazardArray::new(),
            txn: Mutex::new(Txn::new(isolation)),
            txn_shared,
            split_gen: AtomicU64::new(0),
            cache,
            txn_global,
            log,
        })
    }

    /// Enter a split generation: while set, internal index vectors of
    /// this generation or newer may be in use by this session.
    pub fn enter_split_gen(&self, gen: u64) {
        self.split_gen.store(gen, Ordering::SeqCst);
    }

    pub fn leave_split_gen(&self) {
        self.split_gen.store(0, Ordering::SeqCst);
    }

    pub fn active_split_gen(&self) -> u64 {
        self.split_gen.load(Ordering::SeqCst)
    }

    /// Run `body` with the session transaction; the transaction lock
    /// is held for the duration.
    pub fn with_txn<R>(&self, body: impl FnOnce(&mut Txn) -> R) -> R {
        let mut txn = self.txn.lock().unwrap();
        body(&mut txn)
    }

    /// Begin an explicit transaction.
    pub fn begin(&self, isolation: Option<Isolation>) -> TimberResult<()> {
        let mut guard = self.txn.lock().unwrap();
        if let Some(iso) = isolation {
            guard.isolation = iso;
        }
        txn::begin(&self.txn_global, &mut guard, &self.txn_shared)
    }

    /// True if an explicit transaction is open.
    pub fn in_txn(&self) -> bool {
        self.txn.lock().unwrap().running
    }

    /// Fail fast when the cache forced this transaction to roll back.
    pub fn check_forced_rollback(&self) -> TimberResult<()> {
        if self.txn.lock().unwrap().forced_rollback {
            return Err(TimberError::Rollback(
                "transaction rolled back to unstick cache eviction".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scoped hazard pointer: released on drop unless explicitly kept for
/// a saved cursor position.
pub struct HazardGuard<'a> {
    session: &'a SessionInner,
    slot: Option<HazardSlot>,
}

impl<'a> HazardGuard<'a> {
    pub fn new(session: &'a SessionInner, slot: HazardSlot) -> Self {
        Self {
            session,
            slot: Some(slot),
        }
    }

    pub fn page(&self) -> &Arc<crate::btree::page::Page> {
        &self.slot.as_ref().unwrap().page
    }

    /// Keep the hazard pointer beyond this scope (a cursor saving its
    /// position); the caller becomes responsible for releasing the
    /// returned slot.
    pub fn keep(mut self) -> HazardSlot {
        self.slot.take().unwrap()
    }
}

impl<'a> Drop for HazardGuard<'a> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.session.hazards.release_slot(slot.slot);
        }
    }
}
