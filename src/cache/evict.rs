//! Eviction: a generation-clock LRU shared across btrees, driven by a
//! server thread that samples pages and a worker pool that writes
//! them out.

use std::{
    sync::{atomic::Ordering, Arc},
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, trace, warn};

use crate::{
    btree::{
        page::{Page, PageRef, RefState, PAGE_EVICT_LRU, PAGE_SCANNING, PAGE_SPLITTING},
        reconcile, split,
        tree::BTree,
    },
    cache::Cache,
    error::{TimberError, TimberResult, TimberVoid},
    session::SessionInner,
    utils::HandyRwLock,
};

/// Pages sampled per btree per pass.
const WALK_PER_TREE: usize = 64;

/// Capacity of the candidate queue (the LRU array).
const EVICT_QUEUE_MAX: usize = 128;

/// Internal pages are skewed old so leaves go first.
const INTERNAL_SKEW: u64 = 1 << 32;

pub struct EvictEntry {
    pub btree: Arc<BTree>,
    pub ref_: Arc<PageRef>,
    pub page: Arc<Page>,
    pub score: u64,
}

/// The channel endpoints live on the cache so application threads can
/// help drain the queue.
pub struct EvictQueue {
    pub tx: Sender<EvictEntry>,
    pub rx: Receiver<EvictEntry>,
}

impl Cache {
    fn evict_queue(&self) -> &EvictQueue {
        self.queue.get_or_init(|| {
            let (tx, rx) = bounded(EVICT_QUEUE_MAX);
            EvictQueue { tx, rx }
        })
    }
}

/// Start the eviction server and its worker pool. Each thread runs on
/// its own session; the handles join in database close.
pub fn start(
    cache: &Arc<Cache>,
    server_session: Arc<SessionInner>,
    worker_sessions: Vec<Arc<SessionInner>>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    {
        let cache = Arc::clone(cache);
        handles.push(
            std::thread::Builder::new()
                .name("timber-evict-server".to_string())
                .spawn(move || server_loop(cache, server_session))
                .expect("spawn eviction server"),
        );
    }

    for (i, session) in worker_sessions.into_iter().enumerate() {
        let cache = Arc::clone(cache);
        handles.push(
            std::thread::Builder::new()
                .name(format!("timber-evict-worker-{}", i))
                .spawn(move || worker_loop(cache, session))
                .expect("spawn eviction worker"),
        );
    }
    handles
}

fn server_loop(cache: Arc<Cache>, session: Arc<SessionInner>) {
    debug!("eviction server running");
    while cache.running.load(Ordering::SeqCst) {
        {
            let guard = cache.server_lock.lock().unwrap();
            let (mut guard, _) = cache
                .server_cond
                .wait_timeout(guard, Duration::from_millis(100))
                .unwrap();
            *guard = false;
        }
        if !cache.running.load(Ordering::SeqCst) {
            break;
        }

        session.txn_global.update_oldest();
        if cache.over_trigger() {
            if let Err(e) = run_pass(&cache) {
                warn!("eviction pass failed: {}", e);
            }
        }

        // retire split-stashed index arrays nobody can reach
        let sessions = cache.sessions();
        for tree in cache.trees() {
            split::stash_sweep(&tree, &sessions);
        }
    }
    debug!("eviction server exiting");
}

/// One eviction pass: sample pages per btree from a rotating walk
/// position, sort by adjusted read generation, queue the oldest
/// quartile for the workers.
fn run_pass(cache: &Arc<Cache>) -> TimberVoid {
    let mut candidates: Vec<EvictEntry> = Vec::new();

    for btree in cache.trees() {
        if btree.no_evict {
            continue;
        }
        let skip = btree.evict_skip.fetch_add(WALK_PER_TREE as u64, Ordering::SeqCst);
        collect_candidates(&btree, skip, &mut candidates);
    }
    if candidates.is_empty() {
        return Ok(());
    }

    candidates.sort_by_key(|c| c.score);
    let take = (candidates.len() / 4).max(1);
    let queue = cache.evict_queue();
    for entry in candidates.into_iter().take(take) {
        if !entry.page.try_set_flag(PAGE_EVICT_LRU) {
            continue;
        }
        match queue.tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                entry.page.clear_flag(PAGE_EVICT_LRU);
                break;
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
    Ok(())
}

/// Depth-first sample of in-memory pages, skipping the first `skip`
/// visits so successive passes cover different parts of the tree.
fn collect_candidates(btree: &Arc<BTree>, skip: u64, out: &mut Vec<EvictEntry>) {
    let mut stack: Vec<Arc<PageRef>> = vec![btree.root_ref()];
    let mut seen = 0u64;
    let mut taken = 0usize;
    let total_skip = skip % (WALK_PER_TREE as u64 * 4);

    while let Some(ref_) = stack.pop() {
        if taken >= WALK_PER_TREE {
            return;
        }
        if ref_.state() != RefState::Mem {
            continue;
        }
        let page = match ref_.page() {
            Some(page) => page,
            None => continue,
        };

        let is_root = page.parent.rl().is_none() || {
            let guard = ref_.home.rl();
            guard.is_none()
        };

        let mut mem_children = false;
        if page.is_internal() {
            let data = page.data.rl();
            let int = data.as_int();
            for child in int.index.iter() {
                if child.state() != RefState::Disk && child.state() != RefState::Deleted {
                    mem_children = true;
                }
                stack.push(Arc::clone(child));
            }
        }

        seen += 1;
        if seen <= total_skip {
            continue;
        }
        if is_root || mem_children {
            continue;
        }
        if page.has_flag(PAGE_EVICT_LRU | PAGE_SPLITTING | PAGE_SCANNING) {
            continue;
        }
        let mut score = page.read_gen.load(Ordering::SeqCst);
        if page.is_internal() {
            score = score.saturating_add(INTERNAL_SKEW);
        }
        out.push(EvictEntry {
            btree: Arc::clone(btree),
            ref_,
            page,
            score,
        });
        taken += 1;
    }
}

fn worker_loop(cache: Arc<Cache>, session: Arc<SessionInner>) {
    let rx = cache.evict_queue().rx.clone();
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(entry) => {
                let result = evict_ref(&cache, &session, &entry);
                entry.page.clear_flag(PAGE_EVICT_LRU);
                match result {
                    Ok(()) => trace!("evicted a page from {}", entry.btree.uri),
                    Err(e) if e.is_transient() => {}
                    Err(e) => warn!("eviction failed: {}", e),
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !cache.running.load(Ordering::SeqCst) {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Application-thread help: take one queued candidate and evict it.
pub fn evict_one(cache: &Cache, session: &SessionInner) -> TimberResult<bool> {
    let entry = match cache.evict_queue().rx.try_recv() {
        Ok(entry) => entry,
        Err(_) => return Ok(false),
    };
    let result = evict_ref(cache, session, &entry);
    entry.page.clear_flag(PAGE_EVICT_LRU);
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_transient() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Evict one page: lock its ref, re-check hazards, reconcile when
/// dirty under the eviction snapshot, and swap the ref to its on-disk
/// state (or its split replacements).
pub fn evict_ref(cache: &Cache, session: &SessionInner, entry: &EvictEntry) -> TimberVoid {
    let ref_ = &entry.ref_;
    let btree = &entry.btree;

    if !ref_.cas_state(RefState::Mem, RefState::Locked) {
        return Err(TimberError::Busy);
    }

    let unlock = |state: RefState| ref_.set_state(state);

    let page = match ref_.page() {
        Some(page) => page,
        None => {
            unlock(RefState::Mem);
            return Err(TimberError::Busy);
        }
    };

    // any hazard pointer is conclusive: the page is in use
    if cache.page_pinned(&page) {
        unlock(RefState::Mem);
        return Err(TimberError::Busy);
    }
    if page.has_flag(PAGE_SPLITTING | PAGE_SCANNING) {
        unlock(RefState::Mem);
        return Err(TimberError::Busy);
    }
    if page.is_internal() {
        let data = page.data.rl();
        let int = data.as_int();
        let busy = int
            .index
            .iter()
            .any(|c| c.state() != RefState::Disk && c.state() != RefState::Deleted);
        if busy {
            drop(data);
            unlock(RefState::Mem);
            return Err(TimberError::Busy);
        }
    }

    if page.is_dirty() {
        if btree.ckpt_active.load(Ordering::SeqCst) {
            // a checkpoint is writing this tree; a dirty eviction here
            // could free a block the checkpoint already points at
            unlock(RefState::Mem);
            return Err(TimberError::Busy);
        }
        let rec_txn = reconcile::eviction_txn(&session.txn_global);
        let result = match reconcile::reconcile(btree, &page, &rec_txn) {
            Ok(result) => result,
            Err(e) => {
                unlock(RefState::Mem);
                return Err(e);
            }
        };
        // from here on failures are fatal, blocks are on disk
        reconcile::finish_reconcile(btree, session, ref_, &page, result, true)?;
    } else {
        // clean page: its address is still good, just drop the memory
        let has_addr = ref_.addr.rl().is_some();
        if !has_addr {
            unlock(RefState::Mem);
            return Err(TimberError::Busy);
        }
        *ref_.page.wl() = None;
        unlock(RefState::Disk);
        cache.page_out(page.footprint(), false);
    }
    Ok(())
}

/// Force out the pages with the oldest possible generation first; the
/// would-block mode of the back-pressure path.
pub fn evict_would_block(cache: &Cache, session: &SessionInner) -> TimberResult<bool> {
    let mut candidates = Vec::new();
    for btree in cache.trees() {
        if btree.no_evict {
            continue;
        }
        collect_candidates(&btree, 0, &mut candidates);
    }
    candidates.sort_by_key(|c| c.score);
    for entry in candidates {
        if entry.page.read_gen.load(Ordering::SeqCst) <= crate::cache::READ_GEN_OLDEST {
            match evict_ref(cache, session, &entry) {
                Ok(()) => return Ok(true),
                Err(e) if e.is_transient() => continue,
                Err(e) => return Err(e),
            }
        }
    }
    Ok(false)
}
