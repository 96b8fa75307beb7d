//! The LSM manager: a thread that periodically inspects each tree and
//! a worker pool draining the typed work queue.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::{
    checkpoint,
    config::Config,
    database::DbInner,
    error::{TimberError, TimberResult, TimberVoid},
    lsm::tree::LsmTree,
    utils::HandyRwLock,
};

/// A unit of background work for one tree.
pub enum WorkUnit {
    Switch(Arc<LsmTree>),
    Flush(Arc<LsmTree>),
    Bloom(Arc<LsmTree>, u32),
    Merge(Arc<LsmTree>),
    Drop(Arc<LsmTree>),
}

pub struct LsmManager {
    db: Weak<DbInner>,
    trees: RwLock<HashMap<String, Arc<LsmTree>>>,
    tx: Sender<WorkUnit>,
    rx: Receiver<WorkUnit>,
    running: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LsmManager {
    pub(crate) fn start(db: Weak<DbInner>, _config: &Config) -> TimberResult<Arc<Self>> {
        let (tx, rx) = unbounded();
        let manager = Arc::new(Self {
            db,
            trees: RwLock::new(HashMap::new()),
            tx,
            rx,
            running: AtomicBool::new(true),
            handles: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        {
            let manager = Arc::clone(&manager);
            handles.push(
                std::thread::Builder::new()
                    .name("timber-lsm-manager".to_string())
                    .spawn(move || manager.manager_loop())
                    .expect("spawn lsm manager"),
            );
        }
        for i in 0..2 {
            let manager = Arc::clone(&manager);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("timber-lsm-worker-{}", i))
                    .spawn(move || manager.worker_loop())
                    .expect("spawn lsm worker"),
            );
        }
        *manager.handles.lock().unwrap() = handles;
        Ok(manager)
    }

    pub fn take_handles(&self) -> Vec<JoinHandle<()>> {
        self.handles.lock().unwrap().drain(..).collect()
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn create_tree(&self, uri: &str, config: &Config) -> TimberResult<Arc<LsmTree>> {
        if let Some(tree) = self.trees.rl().get(uri) {
            return Ok(Arc::clone(tree));
        }
        let db = self
            .db
            .upgrade()
            .ok_or_else(|| TimberError::panic("database is gone"))?;
        let tree = LsmTree::create(&db, uri, config)?;
        self.trees.wl().insert(uri.to_string(), Arc::clone(&tree));
        Ok(tree)
    }

    pub fn tree(&self, uri: &str) -> TimberResult<Arc<LsmTree>> {
        self.trees
            .rl()
            .get(uri)
            .cloned()
            .ok_or(TimberError::NotFound)
    }

    pub fn drop_tree(&self, uri: &str) -> TimberVoid {
        let tree = match self.trees.wl().remove(uri) {
            Some(tree) => tree,
            None => return Err(TimberError::NotFound),
        };
        let db = self
            .db
            .upgrade()
            .ok_or_else(|| TimberError::panic("database is gone"))?;
        let chunks: Vec<String> = tree.chunks.rl().iter().map(|c| c.uri.clone()).collect();
        for uri in chunks {
            db.drop_file_handle(&uri)?;
        }
        Ok(())
    }

    /// The periodic inspection: queue whatever each tree needs.
    fn manager_loop(self: Arc<Self>) {
        debug!("lsm manager running");
        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
            let trees: Vec<Arc<LsmTree>> = self.trees.rl().values().cloned().collect();
            for tree in trees {
                tree.update_throttle();

                if tree.needs_switch()
                    && !tree.switch_pending.swap(true, Ordering::SeqCst)
                {
                    let _ = self.tx.send(WorkUnit::Switch(Arc::clone(&tree)));
                }

                let (unflushed, unbloomed) = {
                    let chunks = tree.chunks.rl();
                    let stack = &chunks[..chunks.len().saturating_sub(1)];
                    (
                        stack.iter().any(|c| !c.is_flushed()),
                        stack
                            .iter()
                            .find(|c| c.is_flushed() && c.bloom.rl().is_none())
                            .map(|c| c.id),
                    )
                };
                if unflushed {
                    let _ = self.tx.send(WorkUnit::Flush(Arc::clone(&tree)));
                }
                if let Some(chunk_id) = unbloomed {
                    if tree.cfg.bloom {
                        let _ = self.tx.send(WorkUnit::Bloom(Arc::clone(&tree), chunk_id));
                    }
                }
                if tree.merge_run().is_some() {
                    let _ = self.tx.send(WorkUnit::Merge(Arc::clone(&tree)));
                }
                if !tree.old_chunks.lock().unwrap().is_empty() {
                    let _ = self.tx.send(WorkUnit::Drop(Arc::clone(&tree)));
                }
            }
        }
        debug!("lsm manager exiting");
    }

    fn worker_loop(self: Arc<Self>) {
        // each worker runs on a session of its own
        let mut session = None;
        loop {
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(unit) => {
                    if let Err(e) = self.service(unit, &mut session) {
                        if !e.is_transient() {
                            warn!("lsm work unit failed: {}", e);
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !self.running.load(Ordering::SeqCst) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn service(
        &self,
        unit: WorkUnit,
        session_slot: &mut Option<Arc<crate::session::SessionInner>>,
    ) -> TimberVoid {
        let db = match self.db.upgrade() {
            Some(db) => db,
            None => return Ok(()),
        };
        if session_slot.is_none() {
            *session_slot = Some(db.new_session());
        }
        let session = Arc::clone(session_slot.as_ref().unwrap());
        match unit {
            WorkUnit::Switch(tree) => tree.switch(&db),
            WorkUnit::Flush(tree) => {
                // flushing a chunk is checkpointing its btree; the
                // database checkpoint covers it and the metadata in
                // one sweep
                checkpoint::run(&db)?;
                let chunks = tree.chunks.rl();
                for chunk in chunks[..chunks.len().saturating_sub(1)].iter() {
                    chunk.flushed.store(true, Ordering::SeqCst);
                }
                Ok(())
            }
            WorkUnit::Bloom(tree, chunk_id) => {
                let chunk = {
                    let chunks = tree.chunks.rl();
                    chunks.iter().find(|c| c.id == chunk_id).cloned()
                };
                match chunk {
                    Some(chunk) => tree.build_bloom(&session, &chunk),
                    None => Ok(()),
                }
            }
            WorkUnit::Merge(tree) => tree.merge(&db, &session),
            WorkUnit::Drop(tree) => {
                tree.drop_old_chunks(&db)?;
                Ok(())
            }
        }
    }
}
