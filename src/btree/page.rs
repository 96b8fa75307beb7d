use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
    Arc, Mutex, RwLock, Weak,
};

use bit_vec::BitVec;
use bytes::Bytes;

use crate::{
    block::{
        io::{Cookie, PageHeader, PageType},
        BlockManager,
    },
    btree::{
        cell::{self, Cell},
        ovfl::OvflTrack,
        skiplist::SkipList,
    },
    error::{TimberError, TimberResult},
    txn::{Txn, TXN_NONE},
    utils::HandyRwLock,
};

/// Page flag bits.
pub const PAGE_SPLITTING: u32 = 0x01;
/// Set while reconciliation walks the page; excludes eviction.
pub const PAGE_SCANNING: u32 = 0x02;
/// The page sits in the eviction candidate array.
pub const PAGE_EVICT_LRU: u32 = 0x04;

/// Baseline per-structure memory charges; close enough for cache
/// accounting, which only needs to be proportional.
const UPDATE_OVERHEAD: u64 = 48;
const SLOT_OVERHEAD: u64 = 64;

/// One entry in an update chain, newest first. The id is atomic so a
/// rollback can poison it to `TXN_ABORTED` while readers walk the
/// chain; everything else is immutable after creation.
pub struct Update {
    pub txn_id: AtomicU64,
    /// `None` is a tombstone.
    pub value: Option<Bytes>,
    pub next: Option<Arc<Update>>,
}

impl Update {
    pub fn new(txn_id: u64, value: Option<Bytes>, next: Option<Arc<Update>>) -> Arc<Self> {
        Arc::new(Self {
            txn_id: AtomicU64::new(txn_id),
            value,
            next,
        })
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn mem_size(&self) -> u64 {
        UPDATE_OVERHEAD + self.value.as_ref().map_or(0, |v| v.len() as u64)
    }
}

pub type UpdChain = Option<Arc<Update>>;

/// The newest update in `chain` visible to `txn`.
pub fn visible_update<'a>(chain: Option<&'a Arc<Update>>, txn: &Txn) -> Option<&'a Arc<Update>> {
    let mut cursor = chain;
    while let Some(upd) = cursor {
        if txn.visible(upd.txn_id.load(Ordering::SeqCst)) {
            return Some(upd);
        }
        cursor = upd.next.as_ref();
    }
    None
}

/// Does the chain carry anything not yet visible to `txn`? Used by
/// reconciliation to decide whether the page can come clean.
pub fn chain_has_invisible(chain: Option<&Arc<Update>>, txn: &Txn) -> bool {
    let mut cursor = chain;
    while let Some(upd) = cursor {
        let id = upd.txn_id.load(Ordering::SeqCst);
        if id != crate::txn::TXN_ABORTED && !txn.visible(id) {
            return true;
        }
        if txn.visible(id) {
            return false;
        }
        cursor = upd.next.as_ref();
    }
    false
}

/// A value as stored on the page image.
#[derive(Debug, Clone)]
pub enum OnPage {
    Value(Bytes),
    Ovfl { cookie: Cookie, len: u64 },
}

/// What a reader resolved a position to.
#[derive(Debug, Clone)]
pub enum ValueRef {
    Inline(Bytes),
    Ovfl { cookie: Cookie, len: u64 },
    NotVisible,
}

/// Resolve one logical slot (on-page value plus update chain) for a
/// reader.
pub fn resolve_value(onpage: Option<&OnPage>, chain: Option<&Arc<Update>>, txn: &Txn) -> ValueRef {
    if let Some(upd) = visible_update(chain, txn) {
        return match &upd.value {
            Some(v) => ValueRef::Inline(v.clone()),
            None => ValueRef::NotVisible,
        };
    }
    // no visible update: the base image predates every chain entry,
    // so it is what this snapshot should see
    match onpage {
        Some(OnPage::Value(v)) => ValueRef::Inline(v.clone()),
        Some(OnPage::Ovfl { cookie, len }) => ValueRef::Ovfl {
            cookie: *cookie,
            len: *len,
        },
        None => ValueRef::NotVisible,
    }
}

/// One on-page row entry.
pub struct RowSlot {
    pub key: Bytes,
    pub value: Option<OnPage>,
    pub upd: UpdChain,
}

pub struct RowLeafData {
    pub rows: Vec<RowSlot>,
    /// Keys sorting before `rows[0]`.
    pub insert_smallest: SkipList<Bytes, UpdChain>,
    /// `inserts[i]`: keys sorting after `rows[i]` and before
    /// `rows[i+1]`.
    pub inserts: Vec<SkipList<Bytes, UpdChain>>,
}

impl RowLeafData {
    pub fn empty() -> Self {
        Self {
            rows: Vec::new(),
            insert_smallest: SkipList::new(),
            inserts: Vec::new(),
        }
    }
}

/// One cell of a variable-length column leaf: `rle` consecutive
/// recnos starting at `start`, all with the same value.
pub struct ColVarCell {
    pub start: u64,
    pub rle: u64,
    /// `None` is a deleted range.
    pub value: Option<OnPage>,
}

pub struct ColVarData {
    pub start_recno: u64,
    pub cells: Vec<ColVarCell>,
    /// Updates and appends, keyed by recno.
    pub updates: SkipList<u64, UpdChain>,
}

impl ColVarData {
    pub fn empty(start_recno: u64) -> Self {
        Self {
            start_recno,
            cells: Vec::new(),
            updates: SkipList::new(),
        }
    }

    /// One past the highest recno covered by on-page cells.
    pub fn stop_recno(&self) -> u64 {
        match self.cells.last() {
            Some(cell) => cell.start + cell.rle,
            None => self.start_recno,
        }
    }

    /// The first on-page recno at or after `from`, skipping sparse
    /// gaps without iterating them.
    pub fn next_covered(&self, from: u64) -> Option<u64> {
        if self.cell_for(from).is_some() {
            return Some(from);
        }
        let idx = match self.cells.binary_search_by(|cell| cell.start.cmp(&from)) {
            Ok(idx) => idx,
            Err(idx) => idx,
        };
        self.cells.get(idx).map(|cell| cell.start.max(from))
    }

    /// The on-page cell covering `recno`.
    pub fn cell_for(&self, recno: u64) -> Option<&ColVarCell> {
        let idx = match self
            .cells
            .binary_search_by(|cell| cell.start.cmp(&recno))
        {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let cell = &self.cells[idx];
        if recno < cell.start + cell.rle {
            Some(cell)
        } else {
            None
        }
    }
}

pub struct ColFixData {
    pub start_recno: u64,
    /// Bits per entry, 1..=8.
    pub bitcnt: u8,
    pub entries: u64,
    pub bits: BitVec,
    /// Updates and appends, keyed by recno; values are single bytes.
    pub updates: SkipList<u64, UpdChain>,
}

impl ColFixData {
    pub fn empty(start_recno: u64, bitcnt: u8) -> Self {
        Self {
            start_recno,
            bitcnt,
            entries: 0,
            bits: BitVec::new(),
            updates: SkipList::new(),
        }
    }

    pub fn get_bits(&self, slot: u64) -> u8 {
        let mut v = 0u8;
        let base = slot as usize * self.bitcnt as usize;
        for bit in 0..self.bitcnt as usize {
            v <<= 1;
            if self.bits.get(base + bit).unwrap_or(false) {
                v |= 1;
            }
        }
        v
    }

    pub fn set_bits(&mut self, slot: u64, value: u8) {
        let base = slot as usize * self.bitcnt as usize;
        if self.bits.len() < base + self.bitcnt as usize {
            self.bits.grow(base + self.bitcnt as usize - self.bits.len(), false);
        }
        for bit in 0..self.bitcnt as usize {
            let on = value >> (self.bitcnt as usize - 1 - bit) & 1 == 1;
            self.bits.set(base + bit, on);
        }
    }
}

/// An internal page's child table. The ref vector is behind an `Arc`
/// so readers iterate a consistent index while a split installs a new
/// one; superseded vectors park in the btree's split stash until no
/// session can still hold them.
pub struct IntData {
    pub index: Arc<Vec<Arc<PageRef>>>,
}

pub enum PageData {
    RowInt(IntData),
    ColInt(IntData),
    RowLeaf(RowLeafData),
    ColVar(ColVarData),
    ColFix(ColFixData),
}

impl PageData {
    pub fn as_int(&self) -> &IntData {
        match self {
            PageData::RowInt(d) | PageData::ColInt(d) => d,
            _ => panic!("internal page expected"),
        }
    }

    pub fn as_int_mut(&mut self) -> &mut IntData {
        match self {
            PageData::RowInt(d) | PageData::ColInt(d) => d,
            _ => panic!("internal page expected"),
        }
    }

    pub fn as_row_leaf(&self) -> &RowLeafData {
        match self {
            PageData::RowLeaf(d) => d,
            _ => panic!("row leaf expected"),
        }
    }

    pub fn as_row_leaf_mut(&mut self) -> &mut RowLeafData {
        match self {
            PageData::RowLeaf(d) => d,
            _ => panic!("row leaf expected"),
        }
    }

    pub fn as_col_var(&self) -> &ColVarData {
        match self {
            PageData::ColVar(d) => d,
            _ => panic!("var-length column leaf expected"),
        }
    }

    pub fn as_col_var_mut(&mut self) -> &mut ColVarData {
        match self {
            PageData::ColVar(d) => d,
            _ => panic!("var-length column leaf expected"),
        }
    }

    pub fn as_col_fix(&self) -> &ColFixData {
        match self {
            PageData::ColFix(d) => d,
            _ => panic!("fixed-length column leaf expected"),
        }
    }

    pub fn as_col_fix_mut(&mut self) -> &mut ColFixData {
        match self {
            PageData::ColFix(d) => d,
            _ => panic!("fixed-length column leaf expected"),
        }
    }
}

/// Reconciliation bookkeeping for a page.
pub struct PageModify {
    /// The block currently backing this page, freed when a new image
    /// is written.
    pub disk_cookie: Option<Cookie>,
    pub ovfl: OvflTrack,
}

impl PageModify {
    fn new(disk_cookie: Option<Cookie>) -> Self {
        Self {
            disk_cookie,
            ovfl: OvflTrack::new(),
        }
    }
}

/// An in-memory page.
pub struct Page {
    pub page_type: PageType,
    pub read_gen: AtomicU64,
    pub mem_size: AtomicU64,
    flags: AtomicU32,
    dirty: AtomicBool,
    /// Back-reference to the ref slot that owns this page; re-pointed
    /// when a deep split rehomes the ref.
    pub parent: RwLock<Option<Weak<PageRef>>>,
    pub data: RwLock<PageData>,
    pub modify: Mutex<PageModify>,
}

impl Page {
    pub fn new(page_type: PageType, data: PageData, disk_cookie: Option<Cookie>) -> Arc<Self> {
        let base = match page_type {
            PageType::RowLeaf | PageType::ColVar | PageType::ColFix => SLOT_OVERHEAD,
            _ => SLOT_OVERHEAD * 2,
        };
        Arc::new(Self {
            page_type,
            read_gen: AtomicU64::new(0),
            mem_size: AtomicU64::new(base),
            flags: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            parent: RwLock::new(None),
            data: RwLock::new(data),
            modify: Mutex::new(PageModify::new(disk_cookie)),
        })
    }

    pub fn is_internal(&self) -> bool {
        self.page_type.is_internal()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Returns true when this call made the page dirty (the caller
    /// owes the cache a dirty-bytes credit).
    pub fn mark_dirty(&self) -> bool {
        !self.dirty.swap(true, Ordering::SeqCst)
    }

    /// Returns true when this call cleaned the page.
    pub fn mark_clean(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::SeqCst) & flag != 0
    }

    /// Atomically set a flag bit; false if it was already set.
    pub fn try_set_flag(&self, flag: u32) -> bool {
        self.flags.fetch_or(flag, Ordering::SeqCst) & flag == 0
    }

    pub fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    pub fn incr_mem(&self, n: u64) {
        self.mem_size.fetch_add(n, Ordering::SeqCst);
    }

    pub fn footprint(&self) -> u64 {
        self.mem_size.load(Ordering::SeqCst)
    }

    /// Instantiate a page from a verified disk image.
    pub fn from_image(
        header: &PageHeader,
        payload: &[u8],
        block: &BlockManager,
        fix_bitcnt: u8,
    ) -> TimberResult<Arc<Page>> {
        let mut reader = crate::io::RecReader::new(payload);
        let data = match header.page_type {
            PageType::RowLeaf => {
                let mut rows = Vec::with_capacity(header.recno_or_entries as usize);
                let mut prev_key = Bytes::new();
                for _ in 0..header.recno_or_entries {
                    let key = match cell::unpack(&mut reader)? {
                        Cell::Key { prefix, suffix } => {
                            cell::resolve_key(&prev_key, prefix, &suffix)?
                        }
                        Cell::KeyOvfl { cookie, .. } => {
                            let (_, bytes) = block.read_block(&cookie)?;
                            Bytes::from(bytes)
                        }
                        other => {
                            return Err(TimberError::corrupt(format!(
                                "expected key cell, found {:?}",
                                other
                            )))
                        }
                    };
                    prev_key = key.clone();
                    let value = match cell::unpack(&mut reader)? {
                        Cell::Value { data, .. } => Some(OnPage::Value(data)),
                        Cell::ValueOvfl { cookie, len, .. } => Some(OnPage::Ovfl { cookie, len }),
                        Cell::Del { .. } => None,
                        other => {
                            return Err(TimberError::corrupt(format!(
                                "expected value cell, found {:?}",
                                other
                            )))
                        }
                    };
                    rows.push(RowSlot {
                        key,
                        value,
                        upd: None,
                    });
                }
                let inserts = (0..rows.len()).map(|_| SkipList::new()).collect();
                PageData::RowLeaf(RowLeafData {
                    rows,
                    insert_smallest: SkipList::new(),
                    inserts,
                })
            }
            PageType::RowInt => {
                let mut index = Vec::with_capacity(header.recno_or_entries as usize);
                let mut prev_key = Bytes::new();
                for _ in 0..header.recno_or_entries {
                    let key = match cell::unpack(&mut reader)? {
                        Cell::Key { prefix, suffix } => {
                            cell::resolve_key(&prev_key, prefix, &suffix)?
                        }
                        Cell::KeyOvfl { cookie, .. } => {
                            let (_, bytes) = block.read_block(&cookie)?;
                            Bytes::from(bytes)
                        }
                        other => {
                            return Err(TimberError::corrupt(format!(
                                "expected key cell, found {:?}",
                                other
                            )))
                        }
                    };
                    prev_key = key.clone();
                    match cell::unpack(&mut reader)? {
                        Cell::Addr {
                            cookie,
                            is_internal,
                            recno_or_entries,
                        } => {
                            index.push(PageRef::new_disk(
                                RefKey::Row(key),
                                RefAddr {
                                    cookie,
                                    is_internal,
                                    recno_or_entries,
                                },
                            ));
                        }
                        other => {
                            return Err(TimberError::corrupt(format!(
                                "expected address cell, found {:?}",
                                other
                            )))
                        }
                    }
                }
                PageData::RowInt(IntData {
                    index: Arc::new(index),
                })
            }
            PageType::ColInt => {
                // column internal pages carry their start recno in the
                // header; children run to the end of the payload
                let mut index = Vec::new();
                while reader.remaining() > 0 {
                    match cell::unpack(&mut reader)? {
                        Cell::Addr {
                            cookie,
                            is_internal,
                            recno_or_entries,
                        } => {
                            index.push(PageRef::new_disk(
                                RefKey::Recno(recno_or_entries),
                                RefAddr {
                                    cookie,
                                    is_internal,
                                    recno_or_entries,
                                },
                            ));
                        }
                        other => {
                            return Err(TimberError::corrupt(format!(
                                "expected address cell, found {:?}",
                                other
                            )))
                        }
                    }
                }
                PageData::ColInt(IntData {
                    index: Arc::new(index),
                })
            }
            PageType::ColVar => {
                let start_recno = header.recno_or_entries;
                let mut cells = Vec::new();
                let mut recno = start_recno;
                while reader.remaining() > 0 {
                    let (rle, value) = match cell::unpack(&mut reader)? {
                        Cell::Value { data, rle } => (rle.max(1), Some(OnPage::Value(data))),
                        Cell::ValueOvfl { cookie, len, rle } => {
                            (rle.max(1), Some(OnPage::Ovfl { cookie, len }))
                        }
                        Cell::Del { rle } => (rle.max(1), None),
                        other => {
                            return Err(TimberError::corrupt(format!(
                                "expected column cell, found {:?}",
                                other
                            )))
                        }
                    };
                    cells.push(ColVarCell {
                        start: recno,
                        rle,
                        value,
                    });
                    recno += rle;
                }
                PageData::ColVar(ColVarData {
                    start_recno,
                    cells,
                    updates: SkipList::new(),
                })
            }
            PageType::ColFix => {
                let start_recno = header.recno_or_entries;
                let bitcnt = reader.get_u8()?;
                if bitcnt != fix_bitcnt {
                    return Err(TimberError::corrupt(format!(
                        "fixed-column width {} does not match configured {}",
                        bitcnt, fix_bitcnt
                    )));
                }
                let entries = reader.get_uvarint()?;
                let nbytes = ((entries * bitcnt as u64) + 7) / 8;
                let bits = BitVec::from_bytes(reader.get_bytes(nbytes as usize)?);
                PageData::ColFix(ColFixData {
                    start_recno,
                    bitcnt,
                    entries,
                    bits,
                    updates: SkipList::new(),
                })
            }
            other => {
                return Err(TimberError::corrupt(format!(
                    "cannot instantiate page of type {:?}",
                    other
                )))
            }
        };

        let page = Page::new(header.page_type, data, None);
        page.incr_mem(header.mem_size as u64);

        // children of an internal page point back at the page whose
        // index holds them; sideways walks climb through these
        {
            let data = page.data.rl();
            match &*data {
                PageData::RowInt(int) | PageData::ColInt(int) => {
                    for r in int.index.iter() {
                        *r.home.wl() = Some(Arc::downgrade(&page));
                    }
                }
                _ => {}
            }
        }
        Ok(page)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RefState {
    /// On disk only; `addr` is valid.
    Disk = 0,
    /// A thread is reading it in.
    Reading = 1,
    /// Locked for eviction or deletion.
    Locked = 2,
    /// In memory; `page` is valid.
    Mem = 3,
    /// The subtree is deleted.
    Deleted = 4,
    /// The ref was split; restart from the root.
    Split = 5,
}

impl RefState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RefState::Disk,
            1 => RefState::Reading,
            2 => RefState::Locked,
            3 => RefState::Mem,
            4 => RefState::Deleted,
            5 => RefState::Split,
            _ => unreachable!("bad ref state"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RefKey {
    Row(Bytes),
    Recno(u64),
}

impl RefKey {
    pub fn row(&self) -> &Bytes {
        match self {
            RefKey::Row(k) => k,
            _ => panic!("row key expected"),
        }
    }

    pub fn recno(&self) -> u64 {
        match self {
            RefKey::Recno(r) => *r,
            _ => panic!("recno key expected"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RefAddr {
    pub cookie: Cookie,
    pub is_internal: bool,
    pub recno_or_entries: u64,
}

/// A child slot in an internal page: the child's disk address, its
/// in-memory page when instantiated, and the state machine gating the
/// transitions between them.
pub struct PageRef {
    state: AtomicU8,
    pub addr: RwLock<Option<RefAddr>>,
    pub page: RwLock<Option<Arc<Page>>>,
    pub key: RwLock<RefKey>,
    /// The internal page whose index currently holds this ref.
    pub home: RwLock<Option<Weak<Page>>>,
}

impl PageRef {
    pub fn new_disk(key: RefKey, addr: RefAddr) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(RefState::Disk as u8),
            addr: RwLock::new(Some(addr)),
            page: RwLock::new(None),
            key: RwLock::new(key),
            home: RwLock::new(None),
        })
    }

    pub fn new_mem(key: RefKey, page: Arc<Page>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(RefState::Mem as u8),
            addr: RwLock::new(None),
            page: RwLock::new(Some(page)),
            key: RwLock::new(key),
            home: RwLock::new(None),
        })
    }

    pub fn state(&self) -> RefState {
        RefState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn cas_state(&self, old: RefState, new: RefState) -> bool {
        self.state
            .compare_exchange(old as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn set_state(&self, state: RefState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// The in-memory page; caller must have observed `Mem` and hold a
    /// hazard pointer.
    pub fn page(&self) -> Option<Arc<Page>> {
        self.page.rl().clone()
    }

    pub fn key_clone(&self) -> RefKey {
        self.key.rl().clone()
    }
}

/// Link `page` under `ref_` (both directions).
pub fn link_child(ref_: &Arc<PageRef>, page: &Arc<Page>) {
    *page.parent.wl() = Some(Arc::downgrade(ref_));
    *ref_.page.wl() = Some(Arc::clone(page));
}

/// Note an update's transaction id for conflict checks: a write to a
/// chain whose newest entry is invisible to the writer is a
/// write-write conflict under snapshot isolation.
pub fn update_conflict(chain: Option<&Arc<Update>>, txn: &Txn) -> bool {
    if let Some(upd) = chain {
        let id = upd.txn_id.load(Ordering::SeqCst);
        if id == crate::txn::TXN_ABORTED {
            return update_conflict(upd.next.as_ref(), txn);
        }
        if id != TXN_NONE && !txn.visible(id) {
            return true;
        }
    }
    false
}
