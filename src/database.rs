//! The database: owns the cache, the transaction table, the log, the
//! schema map and the server threads. No static mutable state; the
//! lifecycle is `Database::open` to `Database::close`.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    thread::JoinHandle,
    time::Duration,
};

use log::{debug, info, warn};
use once_cell::sync::OnceCell;

use crate::{
    block::{io::Compressor, BlockCheckpoint},
    btree::{BTree, BtreeConfig, Collator, Cursor, Store},
    cache::{evict, Cache, CacheConfig},
    checkpoint,
    config::Config,
    error::{TimberError, TimberResult, TimberVoid},
    lsm::{LsmManager, LsmTree},
    meta,
    session::SessionInner,
    txn::{log as txn_log, Isolation, SyncPolicy, TxnGlobal},
    utils::HandyRwLock,
    wal::{recover, LogManager},
};

/// Baseline configuration, layered under whatever the caller passes.
const DEFAULT_CONFIG: &str = "cache_size=100M,eviction_target=80,eviction_dirty_target=80,\
    isolation=snapshot,allocation_size=4K,internal_page_max=4K,leaf_page_max=32K,\
    memory_page_max=5M,split_pct=75,log=(enabled=true,file_max=100M,prealloc=1,archive=true)";

/// Event callbacks an embedding application may supply.
pub trait EventHandler: Send + Sync {
    fn handle_error(&self, _error: &TimberError) {}
    fn handle_message(&self, _message: &str) {}
    fn handle_progress(&self, _operation: &str, _count: u64) {}
    fn handle_close(&self) {}
}

pub(crate) struct DbInner {
    pub home: PathBuf,
    pub config: Config,
    pub cache: Arc<Cache>,
    pub txn_global: Arc<TxnGlobal>,
    pub log: Option<Arc<LogManager>>,
    pub dhandles: RwLock<HashMap<String, Arc<BTree>>>,
    pub meta_tree: OnceCell<Arc<BTree>>,
    pub schema_lock: Mutex<()>,
    pub sessions: RwLock<Vec<Arc<SessionInner>>>,
    next_session_id: AtomicUsize,
    pub next_file_id: AtomicU32,
    pub panicked: AtomicBool,
    pub backup_active: AtomicBool,
    pub default_isolation: Isolation,
    servers: Mutex<Vec<JoinHandle<()>>>,
    ckpt_running: AtomicBool,
    pub internal_session: OnceCell<Arc<SessionInner>>,
    /// Metadata operations run on their own session so the checkpoint
    /// session's snapshot is never disturbed; metadata writes are
    /// single-writer under the schema lock.
    pub meta_session: OnceCell<Arc<SessionInner>>,
    pub lsm: OnceCell<Arc<LsmManager>>,
    pub compressors: RwLock<HashMap<String, Arc<dyn Compressor>>>,
    pub collators: RwLock<HashMap<String, Arc<dyn Collator>>>,
    pub event_handler: RwLock<Option<Arc<dyn EventHandler>>>,
}

impl DbInner {
    pub fn meta_tree(&self) -> Arc<BTree> {
        Arc::clone(self.meta_tree.get().expect("metadata table open"))
    }

    pub fn internal_session(&self) -> Arc<SessionInner> {
        Arc::clone(self.internal_session.get().expect("internal session open"))
    }

    pub fn meta_session(&self) -> Arc<SessionInner> {
        Arc::clone(self.meta_session.get().expect("metadata session open"))
    }

    /// Recovery applies operations without re-logging them: a session
    /// with no log attached.
    pub fn new_recovery_session(self: &Arc<Self>) -> Arc<SessionInner> {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let session = SessionInner::new(
            id,
            Isolation::Snapshot,
            Arc::clone(&self.cache),
            Arc::clone(&self.txn_global),
            None,
        );
        self.cache.register_session(&session);
        self.sessions.wl().push(Arc::clone(&session));
        session
    }

    pub fn check_panic(&self) -> TimberVoid {
        if self.panicked.load(Ordering::SeqCst) {
            return Err(TimberError::Panic(
                "the database handle is poisoned".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poison(&self, why: &TimberError) {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            log::error!("database poisoned: {}", why);
            if let Some(handler) = &*self.event_handler.rl() {
                handler.handle_error(why);
            }
        }
    }

    /// Escalate panic-class failures to handle poisoning.
    pub fn guard<T>(&self, result: TimberResult<T>) -> TimberResult<T> {
        if let Err(e) = &result {
            if matches!(e, TimberError::Panic(_)) {
                self.poison(e);
            }
        }
        result
    }

    pub fn new_session(self: &Arc<Self>) -> Arc<SessionInner> {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let session = SessionInner::new(
            id,
            self.default_isolation,
            Arc::clone(&self.cache),
            Arc::clone(&self.txn_global),
            self.log.clone(),
        );
        session.txn.lock().unwrap().sync =
            match self.config.get_string("transaction_sync", "fsync").as_str() {
                "off" | "none" => SyncPolicy::None,
                "dir" => SyncPolicy::FsyncDir,
                _ => SyncPolicy::Fsync,
            };
        self.cache.register_session(&session);
        self.sessions.wl().push(Arc::clone(&session));
        session
    }

    fn file_path(&self, uri: &str) -> TimberResult<PathBuf> {
        match uri.strip_prefix("file:") {
            Some(name) if !name.is_empty() && !name.contains('/') => Ok(self.home.join(name)),
            _ => Err(TimberError::Config(format!("bad file uri {:?}", uri))),
        }
    }

    fn resolve_compressor(&self, config: &Config) -> Option<Arc<dyn Compressor>> {
        let name = config.get_str("block_compressor")?;
        if name.is_empty() || name == "none" {
            return None;
        }
        self.compressors.rl().get(name).cloned()
    }

    fn resolve_collator(&self, config: &Config) -> Option<Arc<dyn Collator>> {
        let name = config.get_str("collator")?;
        self.collators.rl().get(name).cloned()
    }

    /// Open (or create) the btree behind a `file:` uri from its
    /// metadata entry.
    pub fn open_btree(
        self: &Arc<Self>,
        uri: &str,
        create_config: Option<&Config>,
    ) -> TimberResult<Arc<BTree>> {
        if let Some(tree) = self.dhandles.rl().get(uri) {
            return Ok(Arc::clone(tree));
        }

        let session = self.meta_session();
        let meta_tree = self.meta_tree();

        let (file_config, create) = match meta::meta_get(&session, &meta_tree, uri) {
            Ok(config) => (config, false),
            Err(TimberError::NotFound) => {
                let create_config = create_config.ok_or(TimberError::NotFound)?;
                let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
                let entry = meta::file_meta(
                    file_id,
                    create_config.get_str("key_format").unwrap_or("u"),
                    create_config.get_str("value_format").unwrap_or("u"),
                    create_config,
                );
                meta::meta_put(&session, &meta_tree, uri, &entry)?;
                if let Some(log) = &self.log {
                    log.write(
                        &crate::wal::record::RecordBody::FileSync {
                            file_id,
                            uri: uri.to_string(),
                        },
                        SyncPolicy::None,
                    )?;
                }
                (entry, true)
            }
            Err(e) => return Err(e),
        };

        // database-wide knobs first, per-file settings win
        let mut merged = self.config.clone();
        merged.merge(&file_config.to_config_string())?;

        let store = Store::from_formats(
            merged.get_str("key_format").unwrap_or("u"),
            merged.get_str("value_format").unwrap_or("u"),
        )?;
        let cfg = BtreeConfig::from_config(&merged)?;
        let ckpt = match merged.get_str("checkpoint") {
            Some(hex) if !create => Some(BlockCheckpoint::from_hex(hex)?),
            _ => None,
        };
        let logged = self.log.is_some() && merged.get_bool("log.enabled", true);
        let first_fit = merged.get_string("block_allocation", "best") == "first";

        let tree = BTree::open(
            uri,
            self.file_path(uri)?,
            merged.get_u32("id", 0),
            store,
            cfg,
            self.resolve_collator(&merged),
            self.resolve_compressor(&merged),
            false,
            logged,
            first_fit,
            ckpt.as_ref(),
            create,
        )?;
        self.cache.register_tree(&tree);
        self.dhandles.wl().insert(uri.to_string(), Arc::clone(&tree));
        debug!("opened btree {} (create: {})", uri, create);
        Ok(tree)
    }

    /// Close a file handle and remove its backing file; the LSM drop
    /// worker retires old chunks through here.
    pub fn drop_file_handle(self: &Arc<Self>, uri: &str) -> TimberVoid {
        let _schema = self.schema_lock.lock().unwrap();
        let session = self.internal_session();
        if let Some(tree) = self.dhandles.wl().remove(uri) {
            self.cache.deregister_tree(&tree);
            tree.evict_all(&session)?;
        }
        match meta::meta_remove(&self.meta_session(), &self.meta_tree(), uri) {
            Ok(()) | Err(TimberError::NotFound) => {}
            Err(e) => return Err(e),
        }
        let path = self.file_path(uri)?;
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        debug!("dropped file handle {}", uri);
        Ok(())
    }

    pub fn tree_by_file_id(&self, file_id: u32) -> Option<Arc<BTree>> {
        self.dhandles
            .rl()
            .values()
            .find(|t| t.file_id == file_id)
            .cloned()
    }

    fn join_servers(&self) {
        let handles: Vec<JoinHandle<()>> = self.servers.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// An open database.
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

impl Database {
    /// Open (and if necessary create and recover) a database in
    /// `home`.
    pub fn open<P: Into<PathBuf>>(home: P, config_str: &str) -> TimberResult<Database> {
        let home = home.into();
        std::fs::create_dir_all(&home)?;

        let mut config = Config::parse(DEFAULT_CONFIG)?;
        config.merge(config_str)?;

        let cache = Cache::new(CacheConfig::from_config(&config));
        let txn_global = Arc::new(TxnGlobal::new());
        let default_isolation =
            Isolation::parse(&config.get_string("isolation", "snapshot"))?;

        let log = if config.get_bool("log.enabled", true) {
            let log_dir = match config.get_str("log.path") {
                Some(path) => home.join(path),
                None => home.clone(),
            };
            Some(LogManager::open(
                log_dir,
                config.get_u64("log.file_max", 100 << 20),
                config.get_u32("log.prealloc", 1),
                config.get_bool("log.archive", true),
                None,
            )?)
        } else {
            None
        };

        let inner = Arc::new(DbInner {
            home: home.clone(),
            config: config.clone(),
            cache: Arc::clone(&cache),
            txn_global,
            log,
            dhandles: RwLock::new(HashMap::new()),
            meta_tree: OnceCell::new(),
            schema_lock: Mutex::new(()),
            sessions: RwLock::new(Vec::new()),
            next_session_id: AtomicUsize::new(0),
            next_file_id: AtomicU32::new(1),
            panicked: AtomicBool::new(false),
            backup_active: AtomicBool::new(false),
            default_isolation,
            servers: Mutex::new(Vec::new()),
            ckpt_running: AtomicBool::new(false),
            internal_session: OnceCell::new(),
            meta_session: OnceCell::new(),
            lsm: OnceCell::new(),
            compressors: RwLock::new(HashMap::new()),
            collators: RwLock::new(HashMap::new()),
            event_handler: RwLock::new(None),
        });

        let internal = inner.new_session();
        inner
            .internal_session
            .set(internal)
            .map_err(|_| TimberError::panic("internal session set twice"))?;
        let meta_session = inner.new_session();
        inner
            .meta_session
            .set(meta_session)
            .map_err(|_| TimberError::panic("metadata session set twice"))?;

        // bootstrap the metadata table
        let base = meta::read_base(&home)?;
        let meta_cfg = {
            let mut cfg = BtreeConfig::from_config(&config)?;
            cfg.raw_compression = false;
            cfg
        };
        let meta_ckpt = base.as_ref().and_then(|b| b.meta_ckpt.clone());
        let meta_tree = BTree::open(
            meta::METADATA_URI,
            home.join(meta::METADATA_FILE),
            meta::METADATA_FILE_ID,
            Store::Row,
            meta_cfg,
            None,
            None,
            true, // the metadata table is never evicted
            inner.log.is_some(),
            false,
            meta_ckpt.as_ref(),
            true,
        )?;
        inner.cache.register_tree(&meta_tree);
        inner
            .meta_tree
            .set(meta_tree)
            .map_err(|_| TimberError::panic("metadata table set twice"))?;

        if let (Some(log), Some(base)) = (&inner.log, &base) {
            log.set_ckpt_lsn(base.ckpt_lsn);
        }

        let db = Database { inner };

        // crash recovery before anything else can run
        if db.inner.log.is_some() {
            let replayed = recover::run(&db.inner)?;
            if replayed {
                info!("recovery complete, forcing a checkpoint");
                checkpoint::run(&db.inner)?;
            }
        }

        db.start_servers()?;
        info!("database open in {:?}", home);
        Ok(db)
    }

    fn start_servers(&self) -> TimberVoid {
        let inner = &self.inner;
        let server_session = inner.new_session();
        let worker_sessions: Vec<Arc<SessionInner>> =
            (0..2).map(|_| inner.new_session()).collect();
        let mut handles = evict::start(&inner.cache, server_session, worker_sessions);

        // checkpoint cadence
        let wait = inner.config.get_u64("checkpoint.wait", 0);
        if wait > 0 {
            let weak = Arc::downgrade(inner);
            handles.push(
                std::thread::Builder::new()
                    .name("timber-ckpt-server".to_string())
                    .spawn(move || {
                        let mut ticks = 0u64;
                        loop {
                            std::thread::sleep(Duration::from_secs(1));
                            let db = match weak.upgrade() {
                                Some(db) => db,
                                None => return,
                            };
                            if !db.cache.running.load(Ordering::SeqCst) {
                                return;
                            }
                            ticks += 1;
                            if ticks >= wait {
                                ticks = 0;
                                if let Err(e) = checkpoint::run(&db) {
                                    warn!("scheduled checkpoint failed: {}", e);
                                }
                            }
                        }
                    })
                    .expect("spawn checkpoint server"),
            );
        }

        let manager = LsmManager::start(Arc::downgrade(inner), &inner.config)?;
        handles.append(&mut manager.take_handles());
        inner
            .lsm
            .set(manager)
            .map_err(|_| TimberError::panic("lsm manager set twice"))?;

        self.inner.servers.lock().unwrap().append(&mut handles);
        Ok(())
    }

    /// Register a block compressor under a name usable as
    /// `block_compressor=<name>`.
    pub fn add_compressor(&self, name: &str, compressor: Arc<dyn Compressor>) {
        self.inner
            .compressors
            .wl()
            .insert(name.to_string(), compressor);
    }

    pub fn add_collator(&self, name: &str, collator: Arc<dyn Collator>) {
        self.inner.collators.wl().insert(name.to_string(), collator);
    }

    pub fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.inner.event_handler.wl() = Some(handler);
    }

    pub fn open_session(&self) -> TimberResult<Session> {
        self.inner.check_panic()?;
        Ok(Session {
            inner: self.inner.new_session(),
            db: Arc::clone(&self.inner),
        })
    }

    /// Create an object. `file:` uris make a btree; `lsm:` uris make
    /// an LSM tree of btrees.
    pub fn create(&self, uri: &str, config_str: &str) -> TimberVoid {
        self.inner.check_panic()?;
        let config = Config::parse(config_str)?;
        let _schema = self.inner.schema_lock.lock().unwrap();
        if uri.starts_with("lsm:") {
            let manager = self.inner.lsm.get().expect("lsm manager running");
            manager.create_tree(uri, &config)?;
            return Ok(());
        }
        let result = self.inner.open_btree(uri, Some(&config)).map(|_| ());
        self.inner.guard(result)
    }

    /// Drop an object and its backing file.
    pub fn drop_object(&self, uri: &str) -> TimberVoid {
        self.inner.check_panic()?;
        let _schema = self.inner.schema_lock.lock().unwrap();
        if uri.starts_with("lsm:") {
            let manager = self.inner.lsm.get().expect("lsm manager running");
            return manager.drop_tree(uri);
        }
        let session = self.inner.internal_session();

        if let Some(tree) = self.inner.dhandles.wl().remove(uri) {
            self.inner.cache.deregister_tree(&tree);
            tree.evict_all(&session)?;
        }
        meta::meta_remove(&self.inner.meta_session(), &self.inner.meta_tree(), uri)?;
        let path = self.inner.file_path(uri)?;
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        info!("dropped {}", uri);
        Ok(())
    }

    /// Rename an object (and its backing file).
    pub fn rename(&self, from: &str, to: &str) -> TimberVoid {
        self.inner.check_panic()?;
        let _schema = self.inner.schema_lock.lock().unwrap();
        let session = self.inner.internal_session();
        let meta_session = self.inner.meta_session();
        let meta_tree = self.inner.meta_tree();

        let mut entry = meta::meta_get(&meta_session, &meta_tree, from)?;
        if self.inner.dhandles.rl().contains_key(from) {
            // close the handle first; everything it holds must be on
            // disk under a checkpoint the new name can reopen
            let tree = self.inner.dhandles.wl().remove(from).unwrap();
            let ckpt = checkpoint::checkpoint_tree(&self.inner, &session, &tree)?;
            tree.block.checkpoint_resolve(&ckpt)?;
            entry.set("checkpoint", ckpt.to_hex());
            self.inner.cache.deregister_tree(&tree);
            tree.evict_all(&session)?;
        }

        meta::meta_put(&meta_session, &meta_tree, to, &entry)?;
        meta::meta_remove(&meta_session, &meta_tree, from)?;
        std::fs::rename(self.inner.file_path(from)?, self.inner.file_path(to)?)?;
        crate::io::sync_dir(&self.inner.home)?;
        info!("renamed {} to {}", from, to);
        Ok(())
    }

    /// Take a database-wide checkpoint.
    pub fn checkpoint(&self) -> TimberVoid {
        self.inner.check_panic()?;
        if self.inner.ckpt_running.swap(true, Ordering::SeqCst) {
            // one checkpoint at a time
            while self.inner.ckpt_running.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            return Ok(());
        }
        let result = checkpoint::run(&self.inner);
        self.inner.ckpt_running.store(false, Ordering::SeqCst);
        self.inner.guard(result)
    }

    pub fn cache_bytes_inuse(&self) -> u64 {
        self.inner.cache.bytes_inuse()
    }

    /// Flag consulted by the LSM drop worker: old chunk files are
    /// retained while a hot backup is in progress.
    pub fn set_backup_active(&self, active: bool) {
        self.inner.backup_active.store(active, Ordering::SeqCst);
    }

    /// Tear down without a final checkpoint or log flush: what the
    /// process looks like after `kill -9`. Recovery on the next open
    /// must reconstruct everything from the log. Test hook.
    pub fn crash(self) {
        if let Some(manager) = self.inner.lsm.get() {
            manager.shutdown();
        }
        self.inner.cache.shutdown();
        self.inner.join_servers();
        info!("database crashed (simulated)");
    }

    /// Close the database: final checkpoint, server shutdown, log
    /// flush. All sessions must be done.
    pub fn close(self) -> TimberVoid {
        let poisoned = self.inner.panicked.load(Ordering::SeqCst);
        if !poisoned {
            if let Err(e) = checkpoint::run(&self.inner) {
                warn!("final checkpoint failed: {}", e);
            }
        }

        if let Some(manager) = self.inner.lsm.get() {
            manager.shutdown();
        }
        self.inner.cache.shutdown();
        self.inner.join_servers();

        if let Some(log) = &self.inner.log {
            let _ = log.close();
        }
        if let Some(handler) = &*self.inner.event_handler.rl() {
            handler.handle_close();
        }
        info!("database closed");
        Ok(())
    }
}

/// An application session: transactions and cursors.
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
    db: Arc<DbInner>,
}

impl Session {
    pub fn begin_transaction(&self, config_str: &str) -> TimberVoid {
        self.db.check_panic()?;
        let config = Config::parse(config_str)?;
        let isolation = match config.get_str("isolation") {
            Some(raw) => Some(Isolation::parse(raw)?),
            None => None,
        };
        self.inner.begin(isolation)?;
        if let Some(sync) = config.get_str("sync") {
            let mut txn = self.inner.txn.lock().unwrap();
            txn.sync = match sync {
                "off" | "none" => SyncPolicy::None,
                "dir" => SyncPolicy::FsyncDir,
                _ => SyncPolicy::Fsync,
            };
        }
        Ok(())
    }

    pub fn commit_transaction(&self) -> TimberVoid {
        self.db.check_panic()?;
        let result = txn_log::commit_session(&self.inner);
        self.db.guard(result)
    }

    pub fn rollback_transaction(&self) -> TimberVoid {
        self.db.check_panic()?;
        txn_log::rollback_session(&self.inner)
    }

    pub fn open_cursor(&self, uri: &str) -> TimberResult<Cursor> {
        self.db.check_panic()?;
        let tree = self.db.open_btree(uri, None)?;
        Ok(Cursor::new(Arc::clone(&self.inner), tree))
    }

    /// Create-if-missing variant of `open_cursor`.
    pub fn open_or_create_cursor(&self, uri: &str, config_str: &str) -> TimberResult<Cursor> {
        self.db.check_panic()?;
        let config = Config::parse(config_str)?;
        let tree = self.db.open_btree(uri, Some(&config))?;
        Ok(Cursor::new(Arc::clone(&self.inner), tree))
    }

    pub fn open_lsm(&self, uri: &str) -> TimberResult<Arc<LsmTree>> {
        self.db.check_panic()?;
        let manager = self
            .db
            .lsm
            .get()
            .ok_or_else(|| TimberError::panic("lsm manager not running"))?;
        manager.tree(uri)
    }

    pub fn lsm_put(&self, tree: &LsmTree, key: &[u8], value: &[u8]) -> TimberVoid {
        self.db.check_panic()?;
        tree.put(&self.inner, key, Some(value))
    }

    pub fn lsm_get(&self, tree: &LsmTree, key: &[u8]) -> TimberResult<bytes::Bytes> {
        self.db.check_panic()?;
        tree.get(&self.inner, key)
    }

    pub fn lsm_delete(&self, tree: &LsmTree, key: &[u8]) -> TimberVoid {
        self.db.check_panic()?;
        tree.delete(&self.inner, key)
    }

    pub fn lsm_scan(&self, tree: &LsmTree) -> crate::lsm::LsmScan {
        crate::lsm::LsmScan::open(tree, &self.inner)
    }
}
