use std::{
    cmp::Ordering as CmpOrdering,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use bytes::Bytes;
use log::debug;

use crate::{
    block::{io::Compressor, BlockCheckpoint, BlockManager, PageType},
    btree::{
        hazard::HazardSlot,
        page::{
            link_child, ColFixData, ColVarData, Page, PageData, PageRef, RefAddr, RefKey,
            RefState, RowLeafData,
        },
    },
    config::Config,
    error::{TimberError, TimberResult, TimberVoid},
    session::SessionInner,
    utils::HandyRwLock,
};

/// Physical layout of one btree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Store {
    Row,
    ColVar,
    ColFix(u8),
}

impl Store {
    /// `key_format=r` selects a column store; a `Nt` value format
    /// makes it fixed-width.
    pub fn from_formats(key_format: &str, value_format: &str) -> TimberResult<Self> {
        match key_format {
            "r" => {
                if let Some(width) = value_format.strip_suffix('t') {
                    let bits: u8 = width
                        .parse()
                        .map_err(|_| TimberError::Config(format!(
                            "bad value_format {:?}",
                            value_format
                        )))?;
                    if bits == 0 || bits > 8 {
                        return Err(TimberError::Config(
                            "fixed-width columns are 1 to 8 bits".to_string(),
                        ));
                    }
                    Ok(Store::ColFix(bits))
                } else {
                    Ok(Store::ColVar)
                }
            }
            "u" => Ok(Store::Row),
            other => Err(TimberError::Config(format!("bad key_format {:?}", other))),
        }
    }

    pub fn is_column(&self) -> bool {
        !matches!(self, Store::Row)
    }

    pub fn leaf_type(&self) -> PageType {
        match self {
            Store::Row => PageType::RowLeaf,
            Store::ColVar => PageType::ColVar,
            Store::ColFix(_) => PageType::ColFix,
        }
    }

    pub fn int_type(&self) -> PageType {
        match self {
            Store::Row => PageType::RowInt,
            _ => PageType::ColInt,
        }
    }
}

/// Custom key ordering plug-in.
pub trait Collator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> CmpOrdering;
}

/// Page sizing and codec knobs, resolved from the config string.
#[derive(Debug, Clone)]
pub struct BtreeConfig {
    pub allocation_size: u64,
    pub internal_page_max: u64,
    pub leaf_page_max: u64,
    pub memory_page_max: u64,
    pub split_pct: u64,
    pub split_deepen_min_child: usize,
    pub split_deepen_per_child: usize,
    pub prefix_compression: bool,
    pub internal_key_truncate: bool,
    pub raw_compression: bool,
    /// Values at least this large go to overflow blocks.
    pub ovfl_threshold: u64,
}

impl BtreeConfig {
    pub fn from_config(config: &Config) -> TimberResult<Self> {
        let allocation_size = config.get_u64("allocation_size", 4 << 10);
        let leaf_page_max = config.get_u64("leaf_page_max", 32 << 10);
        let raw_compression = config.get_bool("raw_compression", false);
        let cfg = Self {
            allocation_size,
            internal_page_max: config.get_u64("internal_page_max", 4 << 10),
            leaf_page_max,
            memory_page_max: config.get_u64("memory_page_max", 5 << 20),
            split_pct: config.get_u64("split_pct", 75),
            split_deepen_min_child: config.get_usize("split_deepen_min_child", 10_000),
            split_deepen_per_child: config.get_usize("split_deepen_per_child", 100),
            // raw compression picks its own split points and is
            // exclusive with prefix and suffix compression
            prefix_compression: !raw_compression && config.get_bool("prefix_compression", true),
            internal_key_truncate: !raw_compression
                && config.get_bool("internal_key_truncate", true),
            raw_compression,
            ovfl_threshold: leaf_page_max / 4,
        };
        if !cfg.allocation_size.is_power_of_two() {
            return Err(TimberError::Config(
                "allocation_size must be a power of two".to_string(),
            ));
        }
        if cfg.split_pct < 50 || cfg.split_pct > 100 {
            return Err(TimberError::Config(
                "split_pct must be between 50 and 100".to_string(),
            ));
        }
        Ok(cfg)
    }
}

struct SplitStash {
    gen: u64,
    _index: Arc<Vec<Arc<PageRef>>>,
}

/// An open btree: one file, one root.
pub struct BTree {
    pub uri: String,
    pub file_id: u32,
    pub store: Store,
    pub block: BlockManager,
    pub cfg: BtreeConfig,
    pub collator: Option<Arc<dyn Collator>>,
    /// Never evicted (the metadata table, LSM primaries being
    /// switched).
    pub no_evict: bool,
    /// Operations on this tree go to the write-ahead log.
    pub logged: bool,
    root: RwLock<Arc<PageRef>>,
    /// Highest recno in use, column stores only; 0 until discovered.
    pub last_recno: AtomicU64,
    /// Bumped on every internal index replacement.
    pub split_gen: AtomicU64,
    split_stash: Mutex<Vec<SplitStash>>,
    /// Rotating eviction-walk position.
    pub evict_skip: AtomicU64,
    /// A checkpoint is writing this tree; dirty-page eviction would
    /// free blocks the checkpoint may already reference.
    pub ckpt_active: std::sync::atomic::AtomicBool,
}

impl BTree {
    #[allow(clippy::too_many_arguments)]
    pub fn open<P: AsRef<Path>>(
        uri: &str,
        path: P,
        file_id: u32,
        store: Store,
        cfg: BtreeConfig,
        collator: Option<Arc<dyn Collator>>,
        compressor: Option<Arc<dyn Compressor>>,
        no_evict: bool,
        logged: bool,
        first_fit: bool,
        ckpt: Option<&BlockCheckpoint>,
        create: bool,
    ) -> TimberResult<Arc<Self>> {
        let block = BlockManager::open(
            path,
            cfg.allocation_size,
            first_fit,
            compressor,
            create,
        )?;

        let root = match ckpt {
            Some(ckpt) => {
                block.checkpoint_load(ckpt)?;
                match ckpt.root {
                    Some(cookie) => {
                        let key = match store {
                            Store::Row => RefKey::Row(Bytes::new()),
                            _ => RefKey::Recno(1),
                        };
                        PageRef::new_disk(key, RefAddr {
                            cookie,
                            is_internal: false,
                            recno_or_entries: 0,
                        })
                    }
                    None => Self::empty_root(store),
                }
            }
            None => Self::empty_root(store),
        };

        debug!("btree {} opened, root state {:?}", uri, root.state());
        Ok(Arc::new(Self {
            uri: uri.to_string(),
            file_id,
            store,
            block,
            cfg,
            collator,
            no_evict,
            logged,
            root: RwLock::new(root),
            last_recno: AtomicU64::new(0),
            split_gen: AtomicU64::new(1),
            split_stash: Mutex::new(Vec::new()),
            evict_skip: AtomicU64::new(0),
            ckpt_active: std::sync::atomic::AtomicBool::new(false),
        }))
    }

    fn empty_root(store: Store) -> Arc<PageRef> {
        let (key, page) = match store {
            Store::Row => (
                RefKey::Row(Bytes::new()),
                Page::new(
                    PageType::RowLeaf,
                    PageData::RowLeaf(RowLeafData::empty()),
                    None,
                ),
            ),
            Store::ColVar => (
                RefKey::Recno(1),
                Page::new(PageType::ColVar, PageData::ColVar(ColVarData::empty(1)), None),
            ),
            Store::ColFix(bits) => (
                RefKey::Recno(1),
                Page::new(
                    PageType::ColFix,
                    PageData::ColFix(ColFixData::empty(1, bits)),
                    None,
                ),
            ),
        };
        let ref_ = PageRef::new_mem(key, Arc::clone(&page));
        link_child(&ref_, &page);
        ref_
    }

    pub fn root_ref(&self) -> Arc<PageRef> {
        Arc::clone(&self.root.rl())
    }

    /// Swap in a new root (root split or checkpoint replacement).
    pub fn set_root(&self, root: Arc<PageRef>) {
        *self.root.wl() = root;
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> CmpOrdering {
        match &self.collator {
            Some(collator) => collator.compare(a, b),
            None => a.cmp(b),
        }
    }

    /// Bring the page behind `ref_` into memory and pin it with a
    /// hazard pointer. `Ok(None)` means the subtree is deleted.
    pub fn page_in(
        &self,
        session: &SessionInner,
        ref_: &Arc<PageRef>,
    ) -> TimberResult<Option<HazardSlot>> {
        loop {
            match ref_.state() {
                RefState::Mem => {
                    if let Some(slot) = session.hazards.acquire(ref_)? {
                        session.cache.touch(&slot.page);
                        return Ok(Some(slot));
                    }
                    // eviction got between us and the page; retry
                }
                RefState::Disk => {
                    if ref_.cas_state(RefState::Disk, RefState::Reading) {
                        match self.read_page(ref_) {
                            Ok(page) => {
                                session.cache.page_in(page.footprint());
                                ref_.set_state(RefState::Mem);
                            }
                            Err(e) => {
                                ref_.set_state(RefState::Disk);
                                return Err(e);
                            }
                        }
                    }
                }
                RefState::Reading | RefState::Locked => {
                    std::thread::yield_now();
                }
                RefState::Deleted => return Ok(None),
                RefState::Split => return Err(TimberError::Restart),
            }
        }
    }

    fn read_page(&self, ref_: &Arc<PageRef>) -> TimberResult<Arc<Page>> {
        let addr = (*ref_.addr.rl())
            .ok_or_else(|| TimberError::panic("ref on disk without an address"))?;
        let (header, payload) = self.block.read_block(&addr.cookie)?;
        let fix_bits = match self.store {
            Store::ColFix(bits) => bits,
            _ => 0,
        };
        let page = Page::from_image(&header, &payload, &self.block, fix_bits)?;
        page.modify.lock().unwrap().disk_cookie = Some(addr.cookie);
        link_child(ref_, &page);
        Ok(page)
    }

    /// Park a superseded internal index vector until every session
    /// has left the generation that could still be iterating it.
    pub fn stash_old_index(&self, gen: u64, index: Arc<Vec<Arc<PageRef>>>) {
        self.split_stash.lock().unwrap().push(SplitStash {
            gen,
            _index: index,
        });
    }

    /// Drop stashed index vectors older than the oldest split
    /// generation any session is still inside.
    pub fn stash_drain(&self, oldest_active_gen: u64) {
        let mut stash = self.split_stash.lock().unwrap();
        if oldest_active_gen == 0 {
            stash.clear();
        } else {
            stash.retain(|s| s.gen >= oldest_active_gen);
        }
    }

    pub fn next_split_gen(&self) -> u64 {
        self.split_gen.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Column stores: allocate the next append recno. Walks to the
    /// rightmost leaf once to discover the current maximum.
    pub fn alloc_recno(&self, session: &SessionInner) -> TimberResult<u64> {
        if self.last_recno.load(Ordering::SeqCst) == 0 {
            let max = self.discover_last_recno(session)?;
            // another thread may have beaten us; never go backwards
            let _ = self.last_recno.compare_exchange(
                0,
                max,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        Ok(self.last_recno.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn discover_last_recno(&self, session: &SessionInner) -> TimberResult<u64> {
        let mut ref_ = self.root_ref();
        let mut held: Option<HazardSlot> = None;
        loop {
            let slot = match self.page_in(session, &ref_)? {
                Some(slot) => slot,
                None => return Ok(0),
            };
            if let Some(prev) = held.take() {
                session.hazards.release_slot(prev.slot);
            }

            let page = Arc::clone(&slot.page);
            let next = {
                let data = page.data.rl();
                match &*data {
                    PageData::ColInt(int) => int.index.last().cloned(),
                    PageData::ColVar(col) => {
                        let mut max = col.stop_recno().saturating_sub(1);
                        if let Some(idx) = col.updates.last() {
                            max = max.max(*col.updates.key(idx));
                        }
                        session.hazards.release_slot(slot.slot);
                        return Ok(max);
                    }
                    PageData::ColFix(col) => {
                        let mut max = col.start_recno + col.entries;
                        max = max.saturating_sub(1);
                        if let Some(idx) = col.updates.last() {
                            max = max.max(*col.updates.key(idx));
                        }
                        session.hazards.release_slot(slot.slot);
                        return Ok(max);
                    }
                    _ => {
                        session.hazards.release_slot(slot.slot);
                        return Err(TimberError::panic("row page in a column tree"));
                    }
                }
            };
            held = Some(slot);
            match next {
                Some(child) => ref_ = child,
                None => {
                    if let Some(prev) = held.take() {
                        session.hazards.release_slot(prev.slot);
                    }
                    return Ok(0);
                }
            }
        }
    }

    /// Discard the whole in-memory tree; only safe once no other
    /// thread can reach this handle (close, drop).
    pub fn evict_all(&self, session: &SessionInner) -> TimberVoid {
        let root = self.root_ref();
        discard_subtree(session, &root);
        Ok(())
    }
}

fn discard_subtree(session: &SessionInner, ref_: &Arc<PageRef>) {
    if let Some(page) = ref_.page() {
        let children: Vec<Arc<PageRef>> = {
            let data = page.data.rl();
            match &*data {
                PageData::RowInt(int) | PageData::ColInt(int) => int.index.iter().cloned().collect(),
                _ => Vec::new(),
            }
        };
        for child in children {
            discard_subtree(session, &child);
        }
        session.cache.page_out(page.footprint(), page.is_dirty());
        *ref_.page.wl() = None;
    }
}
