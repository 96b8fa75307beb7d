use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use crate::{
    btree::{
        hazard::HazardSlot,
        page::{
            resolve_value, update_conflict, OnPage, Page, PageData, PageRef, RowSlot,
            UpdChain, Update, ValueRef,
        },
        search::{descend_to_leaf, edge_leaf, insert_list_mut, neighbor_leaf, row_leaf_search, SearchKey},
        split,
        tree::{BTree, Store},
    },
    error::{TimberError, TimberResult, TimberVoid},
    session::{HazardGuard, SessionInner},
    txn::{self, log as txn_log},
    utils::HandyRwLock,
    wal::record::LogOp,
};

/// The key a cursor is positioned on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorKey {
    Row(Bytes),
    Recno(u64),
}

impl CursorKey {
    pub fn row(&self) -> &Bytes {
        match self {
            CursorKey::Row(k) => k,
            _ => panic!("row key expected"),
        }
    }

    pub fn recno(&self) -> u64 {
        match self {
            CursorKey::Recno(r) => *r,
            _ => panic!("recno expected"),
        }
    }
}

/// Position within a pinned leaf.
#[derive(Debug, Clone)]
enum LeafLoc {
    /// Before everything on the page.
    Start,
    /// After everything on the page.
    End,
    /// Positioned just before `key` (search_near, traversal restart).
    RowSeek(Bytes),
    RowOnPage(usize),
    /// Insert list `list` (0 = before the first row, i+1 = after row
    /// i), node index within it.
    RowInsert { list: usize, node: usize },
    ColSeek(u64),
    ColRecno(u64),
}

struct CursorPos {
    ref_: Arc<PageRef>,
    hazard: HazardSlot,
    loc: LeafLoc,
}

/// An ordered cursor over one btree.
pub struct Cursor {
    pub session: Arc<SessionInner>,
    pub btree: Arc<BTree>,
    pos: Option<CursorPos>,
    /// Last key returned by a traversal; the anchor for restarting
    /// after a raced split, and the filter that keeps traversal
    /// strictly monotonic.
    last_key: Option<CursorKey>,
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.reset();
    }
}

impl Cursor {
    pub fn new(session: Arc<SessionInner>, btree: Arc<BTree>) -> Self {
        Self {
            session,
            btree,
            pos: None,
            last_key: None,
        }
    }

    /// Forget the position and release the pinned page.
    pub fn reset(&mut self) {
        self.drop_position();
        self.last_key = None;
    }

    /// Release the pinned page but keep the traversal anchor.
    fn drop_position(&mut self) {
        if let Some(pos) = self.pos.take() {
            self.session.hazards.release_slot(pos.hazard.slot);
        }
        self.session.leave_split_gen();
    }

    // ------------------------------------------------------------------
    // reads

    /// Exact row lookup.
    pub fn search(&mut self, key: &[u8]) -> TimberResult<Bytes> {
        self.session.check_forced_rollback()?;
        let key = Bytes::copy_from_slice(key);
        loop {
            match self.try_search(&key) {
                Err(TimberError::Restart) => continue,
                other => return other,
            }
        }
    }

    fn try_search(&mut self, key: &Bytes) -> TimberResult<Bytes> {
        let temp = self.read_txn_enter();
        let result = (|| {
            let (_ref, hazard) =
                descend_to_leaf(&self.btree, &self.session, &SearchKey::Row(key.clone()))?;
            // released on every exit path from here on
            let guard = HazardGuard::new(&self.session, hazard);
            let page = Arc::clone(guard.page());
            let out = {
                let txn = self.session.txn.lock().unwrap();
                let data = page.data.rl();
                let leaf = data.as_row_leaf();
                let pos = row_leaf_search(&self.btree, leaf, key);
                match pos.slot {
                    Some(slot) => {
                        let row = &leaf.rows[slot];
                        resolve_value(row.value.as_ref(), row.upd.as_ref(), &txn)
                    }
                    None => {
                        let list = crate::btree::search::insert_list(leaf, pos.ins_list);
                        let cmp = |a: &Bytes, b: &Bytes| self.btree.compare(a, b);
                        match list.search_with(key, cmp).found {
                            Some(node) => {
                                resolve_value(None, list.value(node).as_ref(), &txn)
                            }
                            None => ValueRef::NotVisible,
                        }
                    }
                }
            };
            drop(guard);
            match fetch_value(&self.btree, &page, out)? {
                Some(v) => Ok(v),
                None => Err(TimberError::NotFound),
            }
        })();
        self.read_txn_leave(temp);
        self.session.leave_split_gen();
        result
    }

    /// Exact column lookup.
    pub fn search_recno(&mut self, recno: u64) -> TimberResult<Bytes> {
        self.session.check_forced_rollback()?;
        loop {
            match self.try_search_recno(recno) {
                Err(TimberError::Restart) => continue,
                other => return other,
            }
        }
    }

    fn try_search_recno(&mut self, recno: u64) -> TimberResult<Bytes> {
        let temp = self.read_txn_enter();
        let result = (|| {
            let (_ref, hazard) =
                descend_to_leaf(&self.btree, &self.session, &SearchKey::Recno(recno))?;
            let guard = HazardGuard::new(&self.session, hazard);
            let page = Arc::clone(guard.page());
            let out = {
                let txn = self.session.txn.lock().unwrap();
                let data = page.data.rl();
                col_resolve(&data, recno, &txn)
            };
            drop(guard);
            match fetch_value(&self.btree, &page, out)? {
                Some(v) => Ok(v),
                None => Err(TimberError::NotFound),
            }
        })();
        self.read_txn_leave(temp);
        self.session.leave_split_gen();
        result
    }

    /// Position on `key` if present, else on the nearest neighbor.
    /// The ordering tells the caller which side the result is on.
    pub fn search_near(
        &mut self,
        key: &[u8],
    ) -> TimberResult<(CursorKey, Bytes, std::cmp::Ordering)> {
        self.session.check_forced_rollback()?;
        let key = Bytes::copy_from_slice(key);
        loop {
            match self.try_search_near(&key) {
                Err(TimberError::Restart) => {
                    self.reset();
                    continue;
                }
                other => return other,
            }
        }
    }

    fn try_search_near(
        &mut self,
        key: &Bytes,
    ) -> TimberResult<(CursorKey, Bytes, std::cmp::Ordering)> {
        self.reset();
        self.seek(SearchKey::Row(key.clone()))?;
        if let Some((k, v)) = self.advance(true)? {
            let ord = match self.btree.compare(k.row(), key) {
                std::cmp::Ordering::Equal => std::cmp::Ordering::Equal,
                _ => std::cmp::Ordering::Greater,
            };
            self.last_key = Some(k.clone());
            return Ok((k, v, ord));
        }
        // nothing at or after the key; look below
        self.drop_position();
        self.seek(SearchKey::Row(key.clone()))?;
        match self.advance(false)? {
            Some((k, v)) => {
                self.last_key = Some(k.clone());
                Ok((k, v, std::cmp::Ordering::Less))
            }
            None => Err(TimberError::NotFound),
        }
    }

    /// Step to the next visible entry.
    pub fn next(&mut self) -> TimberResult<Option<(CursorKey, Bytes)>> {
        self.traverse(true)
    }

    /// Step to the previous visible entry.
    pub fn prev(&mut self) -> TimberResult<Option<(CursorKey, Bytes)>> {
        self.traverse(false)
    }

    fn traverse(&mut self, forward: bool) -> TimberResult<Option<(CursorKey, Bytes)>> {
        self.session.check_forced_rollback()?;
        loop {
            match self.try_step(forward) {
                Err(TimberError::Restart) => {
                    // re-seek to the last returned key and resume
                    let anchor = self.last_key.clone();
                    self.drop_position();
                    if let Some(anchor) = anchor {
                        let key = match anchor {
                            CursorKey::Row(k) => SearchKey::Row(k),
                            CursorKey::Recno(r) => SearchKey::Recno(r),
                        };
                        if self.seek(key).is_err() {
                            // fall back to a cold start; the monotonic
                            // filter below keeps us from re-returning
                        }
                    }
                    continue;
                }
                Ok(Some((key, value))) => {
                    // strictly monotonic per direction; also swallows
                    // the re-returned anchor after a restart
                    if let Some(last) = &self.last_key {
                        let ord = key_order(&self.btree, &key, last);
                        let stale = if forward {
                            ord != std::cmp::Ordering::Greater
                        } else {
                            ord != std::cmp::Ordering::Less
                        };
                        if stale {
                            continue;
                        }
                    }
                    self.last_key = Some(key.clone());
                    return Ok(Some((key, value)));
                }
                other => return other,
            }
        }
    }

    fn try_step(&mut self, forward: bool) -> TimberResult<Option<(CursorKey, Bytes)>> {
        let temp = self.read_txn_enter();
        let result = self.advance(forward);
        self.read_txn_leave(temp);
        result
    }

    /// Pin the first (or last) leaf when unpositioned.
    fn seed_position(&mut self, forward: bool) -> TimberVoid {
        if self.pos.is_some() {
            return Ok(());
        }
        let root = self.btree.root_ref();
        let (ref_, hazard) = edge_leaf(&self.btree, &self.session, root, !forward)?;
        self.pos = Some(CursorPos {
            ref_,
            hazard,
            loc: if forward { LeafLoc::Start } else { LeafLoc::End },
        });
        Ok(())
    }

    /// Pin the leaf owning `key` and remember a just-before-`key`
    /// position.
    fn seek(&mut self, key: SearchKey) -> TimberVoid {
        let (ref_, hazard) = descend_to_leaf(&self.btree, &self.session, &key)?;
        self.pos = Some(CursorPos {
            loc: match key {
                SearchKey::Row(k) => LeafLoc::RowSeek(k),
                SearchKey::Recno(r) => LeafLoc::ColSeek(r),
            },
            ref_,
            hazard,
        });
        Ok(())
    }

    /// The traversal engine: step within the pinned leaf, hopping to
    /// the neighbor leaf when the page is exhausted, skipping entries
    /// invisible to the session transaction.
    fn advance(&mut self, forward: bool) -> TimberResult<Option<(CursorKey, Bytes)>> {
        self.seed_position(forward)?;
        loop {
            let pos = match self.pos.as_mut() {
                Some(pos) => pos,
                None => return Ok(None),
            };
            let page = Arc::clone(&pos.hazard.page);

            let candidate = {
                let txn = self.session.txn.lock().unwrap();
                let data = page.data.rl();
                let mut loc = pos.loc.clone();
                let mut out = None;
                loop {
                    let step = match &*data {
                        PageData::RowLeaf(leaf) => {
                            row_step(&self.btree, leaf, &loc, forward)
                        }
                        PageData::ColVar(_) | PageData::ColFix(_) => {
                            col_step(&data, &loc, forward)
                        }
                        _ => return Err(TimberError::panic("cursor on an internal page")),
                    };
                    match step {
                        Some((next_loc, key, onpage, chain)) => {
                            loc = next_loc;
                            let vref = resolve_value(onpage.as_ref(), chain.as_ref(), &txn);
                            if !matches!(vref, ValueRef::NotVisible) {
                                out = Some((key, vref));
                                break;
                            }
                            // invisible or deleted: keep walking
                        }
                        None => break,
                    }
                }
                pos.loc = loc;
                out
            };

            match candidate {
                Some((key, vref)) => {
                    let value = fetch_value(&self.btree, &page, vref)?
                        .ok_or_else(|| TimberError::panic("resolved value vanished"))?;
                    return Ok(Some((key, value)));
                }
                None => {
                    // page exhausted: move sideways
                    let from = Arc::clone(&pos.ref_);
                    let next = neighbor_leaf(&self.btree, &self.session, &from, forward)?;
                    let old = self.pos.take().unwrap();
                    self.session.hazards.release_slot(old.hazard.slot);
                    match next {
                        Some((ref_, hazard)) => {
                            self.pos = Some(CursorPos {
                                ref_,
                                hazard,
                                loc: if forward { LeafLoc::Start } else { LeafLoc::End },
                            });
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // writes

    /// Insert or overwrite a row.
    pub fn put(&mut self, key: &[u8], value: &[u8], overwrite: bool) -> TimberVoid {
        let key = Bytes::copy_from_slice(key);
        let value = Bytes::copy_from_slice(value);
        self.write_op(|cursor| {
            cursor.row_modify(
                &key,
                Some(value.clone()),
                ModifyCheck::if_absent(overwrite),
                true,
            )
        })
    }

    /// Remove a row; `NotFound` when no visible value exists.
    pub fn remove(&mut self, key: &[u8]) -> TimberVoid {
        let key = Bytes::copy_from_slice(key);
        self.write_op(|cursor| cursor.row_modify(&key, None, ModifyCheck::MustExist, true))
    }

    /// Append a value to a column store; returns the new recno.
    pub fn append(&mut self, value: &[u8]) -> TimberResult<u64> {
        let value = Bytes::copy_from_slice(value);
        let mut out = 0;
        self.write_op(|cursor| {
            let recno = cursor.btree.alloc_recno(&cursor.session)?;
            cursor.col_modify(recno, Some(value.clone()), ModifyCheck::None, true)?;
            out = recno;
            Ok(())
        })?;
        Ok(out)
    }

    /// Insert or overwrite a column value at `recno`.
    pub fn put_recno(&mut self, recno: u64, value: &[u8], overwrite: bool) -> TimberVoid {
        let value = Bytes::copy_from_slice(value);
        self.write_op(|cursor| {
            cursor.col_modify(
                recno,
                Some(value.clone()),
                ModifyCheck::if_absent(overwrite),
                true,
            )
        })
    }

    pub fn remove_recno(&mut self, recno: u64) -> TimberVoid {
        self.write_op(|cursor| cursor.col_modify(recno, None, ModifyCheck::MustExist, true))
    }

    /// Remove every visible row in `[start, stop]` (either bound may
    /// be open), logged as a single truncate operation.
    pub fn truncate(&mut self, start: Option<&[u8]>, stop: Option<&[u8]>) -> TimberVoid {
        let start = start.map(Bytes::copy_from_slice);
        let stop = stop.map(Bytes::copy_from_slice);
        self.write_op(|cursor| {
            let keys = cursor.range_keys(start.as_ref(), stop.as_ref())?;
            for key in &keys {
                match cursor.row_modify(key, None, ModifyCheck::MustExist, false) {
                    Ok(()) | Err(TimberError::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            if cursor.btree.logged {
                let op = LogOp::RowTruncate {
                    file_id: cursor.btree.file_id,
                    start: start.clone().unwrap_or_default(),
                    stop: stop.clone().unwrap_or_default(),
                };
                let mut txn = cursor.session.txn.lock().unwrap();
                txn::remember_op(&mut txn, None, Some(op));
            }
            debug!("truncated {} rows", keys.len());
            Ok(())
        })
    }

    /// Remove every visible recno in `[start, stop]`.
    pub fn truncate_recno(&mut self, start: u64, stop: u64) -> TimberVoid {
        self.write_op(|cursor| {
            let mut recnos = Vec::new();
            {
                let mut probe = Cursor::new(
                    Arc::clone(&cursor.session),
                    Arc::clone(&cursor.btree),
                );
                probe.seek(SearchKey::Recno(start))?;
                while let Some((key, _)) = probe.advance(true)? {
                    let recno = key.recno();
                    if recno > stop {
                        break;
                    }
                    recnos.push(recno);
                }
            }
            for recno in &recnos {
                match cursor.col_modify(*recno, None, ModifyCheck::MustExist, false) {
                    Ok(()) | Err(TimberError::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            if cursor.btree.logged {
                let op = LogOp::ColTruncate {
                    file_id: cursor.btree.file_id,
                    start,
                    stop,
                };
                let mut txn = cursor.session.txn.lock().unwrap();
                txn::remember_op(&mut txn, None, Some(op));
            }
            Ok(())
        })
    }

    /// Keys of the visible rows in a range, collected with a scan.
    fn range_keys(
        &mut self,
        start: Option<&Bytes>,
        stop: Option<&Bytes>,
    ) -> TimberResult<Vec<Bytes>> {
        let mut probe = Cursor::new(Arc::clone(&self.session), Arc::clone(&self.btree));
        let mut keys = Vec::new();
        match start {
            Some(start) => probe.seek(SearchKey::Row(start.clone()))?,
            None => {}
        }
        while let Some((key, _)) = probe.advance(true)? {
            let key = key.row().clone();
            if let Some(stop) = stop {
                if self.btree.compare(&key, stop) == std::cmp::Ordering::Greater {
                    break;
                }
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// Wrap a write in an implicit transaction when the session has
    /// none open.
    fn write_op(&mut self, body: impl FnOnce(&mut Self) -> TimberVoid) -> TimberVoid {
        self.session.check_forced_rollback()?;
        self.reset();
        let implicit = !self.session.in_txn();
        if implicit {
            self.session.begin(None)?;
        }
        let result = body(self);
        if implicit {
            match result {
                Ok(()) => txn_log::commit_session(&self.session),
                Err(e) => {
                    let _ = txn_log::rollback_session(&self.session);
                    Err(e)
                }
            }
        } else {
            result
        }
    }

    fn row_modify(
        &mut self,
        key: &Bytes,
        value: Option<Bytes>,
        check: ModifyCheck,
        log_it: bool,
    ) -> TimberVoid {
        loop {
            match self.try_row_modify(key, &value, check, log_it) {
                Err(TimberError::Restart) => continue,
                other => return other,
            }
        }
    }

    fn try_row_modify(
        &mut self,
        key: &Bytes,
        value: &Option<Bytes>,
        check: ModifyCheck,
        log_it: bool,
    ) -> TimberVoid {
        let (ref_, hazard) =
            descend_to_leaf(&self.btree, &self.session, &SearchKey::Row(key.clone()))?;
        let page = Arc::clone(&hazard.page);

        let result = (|| -> TimberVoid {
            let mut txn = self.session.txn.lock().unwrap();
            let mut data = page.data.wl();
            let leaf = data.as_row_leaf_mut();
            let pos = row_leaf_search(&self.btree, leaf, key);
            let cmp = |a: &Bytes, b: &Bytes| self.btree.compare(a, b);

            // existing state for conflict and duplicate checks
            let (chain, onpage, node): (UpdChain, Option<OnPage>, Option<usize>) =
                match pos.slot {
                    Some(slot) => {
                        let row = &leaf.rows[slot];
                        (row.upd.clone(), row.value.clone(), None)
                    }
                    None => {
                        let list = crate::btree::search::insert_list(leaf, pos.ins_list);
                        match list.search_with(key, cmp).found {
                            Some(node) => (list.value(node).clone(), None, Some(node)),
                            None => (None, None, None),
                        }
                    }
                };

            if update_conflict(chain.as_ref(), &txn) {
                return Err(TimberError::Rollback(
                    "write conflicts with a concurrent update".to_string(),
                ));
            }
            let existing = !matches!(
                resolve_value(onpage.as_ref(), chain.as_ref(), &txn),
                ValueRef::NotVisible
            );
            check.apply(existing)?;

            let id = self
                .session
                .txn_global
                .alloc_id(&mut txn, &self.session.txn_shared);
            let upd = Update::new(id, value.clone(), chain);
            let mut added = upd.mem_size();

            match (pos.slot, node) {
                (Some(slot), _) => leaf.rows[slot].upd = Some(Arc::clone(&upd)),
                (None, Some(node)) => {
                    let list = insert_list_mut(leaf, pos.ins_list);
                    *list.value_mut(node) = Some(Arc::clone(&upd));
                }
                (None, None) => {
                    let list = insert_list_mut(leaf, pos.ins_list);
                    let search = list.search_with(key, cmp);
                    list.insert(&search, key.clone(), Some(Arc::clone(&upd)));
                    added += key.len() as u64 + 64;
                }
            }
            page.incr_mem(added);
            // the cache pays for update-chain growth as it happens
            self.session.cache.page_in(added);

            let log_op = if log_it && self.btree.logged {
                Some(match value {
                    Some(v) => LogOp::RowPut {
                        file_id: self.btree.file_id,
                        key: key.clone(),
                        value: v.clone(),
                    },
                    None => LogOp::RowRemove {
                        file_id: self.btree.file_id,
                        key: key.clone(),
                    },
                })
            } else {
                None
            };
            txn::remember_op(&mut txn, Some(upd), log_op);
            Ok(())
        })();

        if result.is_ok() {
            // still holding the hazard pointer: eviction cannot race
            // the split
            self.session.cache.mark_dirty(&page);
            let split_result = split::split_insert(&self.btree, &self.session, &ref_, &page);
            self.session.hazards.release_slot(hazard.slot);
            self.session.leave_split_gen();
            split_result?;
            self.session.cache.eviction_check(&self.session)?;
        } else {
            self.session.hazards.release_slot(hazard.slot);
            self.session.leave_split_gen();
        }
        result
    }

    fn col_modify(
        &mut self,
        recno: u64,
        value: Option<Bytes>,
        check: ModifyCheck,
        log_it: bool,
    ) -> TimberVoid {
        if let (Store::ColFix(_), Some(v)) = (self.btree.store, &value) {
            if v.len() != 1 {
                return Err(TimberError::Config(
                    "fixed-width column values are a single byte".to_string(),
                ));
            }
        }
        loop {
            match self.try_col_modify(recno, &value, check, log_it) {
                Err(TimberError::Restart) => continue,
                other => return other,
            }
        }
    }

    fn try_col_modify(
        &mut self,
        recno: u64,
        value: &Option<Bytes>,
        check: ModifyCheck,
        log_it: bool,
    ) -> TimberVoid {
        let (ref_, hazard) =
            descend_to_leaf(&self.btree, &self.session, &SearchKey::Recno(recno))?;
        let page = Arc::clone(&hazard.page);

        let result = (|| -> TimberVoid {
            let mut txn = self.session.txn.lock().unwrap();
            let mut data = page.data.wl();

            let (chain, onpage, updates) = match &mut *data {
                PageData::ColVar(col) => {
                    let onpage = col.cell_for(recno).and_then(|cell| cell.value.clone());
                    let found = col.updates.search_with(&recno, u64_cmp).found;
                    let chain = found.map(|n| col.updates.value(n).clone()).unwrap_or(None);
                    (chain, onpage, &mut col.updates)
                }
                PageData::ColFix(col) => {
                    let slot = recno.checked_sub(col.start_recno);
                    let onpage = match slot {
                        Some(slot) if slot < col.entries => {
                            Some(OnPage::Value(Bytes::copy_from_slice(&[col.get_bits(slot)])))
                        }
                        _ => None,
                    };
                    let found = col.updates.search_with(&recno, u64_cmp).found;
                    let chain = found.map(|n| col.updates.value(n).clone()).unwrap_or(None);
                    (chain, onpage, &mut col.updates)
                }
                _ => return Err(TimberError::panic("column write on a row tree")),
            };

            if update_conflict(chain.as_ref(), &txn) {
                return Err(TimberError::Rollback(
                    "write conflicts with a concurrent update".to_string(),
                ));
            }
            let existing = !matches!(
                resolve_value(onpage.as_ref(), chain.as_ref(), &txn),
                ValueRef::NotVisible
            );
            check.apply(existing)?;

            let id = self
                .session
                .txn_global
                .alloc_id(&mut txn, &self.session.txn_shared);
            let upd = Update::new(id, value.clone(), chain);
            let mut added = upd.mem_size();

            let search = updates.search_with(&recno, u64_cmp);
            match search.found {
                Some(node) => *updates.value_mut(node) = Some(Arc::clone(&upd)),
                None => {
                    updates.insert(&search, recno, Some(Arc::clone(&upd)));
                    added += 32;
                }
            }
            page.incr_mem(added);
            // the cache pays for update-chain growth as it happens
            self.session.cache.page_in(added);

            let log_op = if log_it && self.btree.logged {
                Some(match value {
                    Some(v) => LogOp::ColPut {
                        file_id: self.btree.file_id,
                        recno,
                        value: v.clone(),
                    },
                    None => LogOp::ColRemove {
                        file_id: self.btree.file_id,
                        recno,
                    },
                })
            } else {
                None
            };
            txn::remember_op(&mut txn, Some(upd), log_op);
            Ok(())
        })();

        if result.is_ok() {
            // still holding the hazard pointer: eviction cannot race
            // the split
            self.session.cache.mark_dirty(&page);
            let split_result = split::split_insert(&self.btree, &self.session, &ref_, &page);
            self.session.hazards.release_slot(hazard.slot);
            self.session.leave_split_gen();
            split_result?;
            self.session.cache.eviction_check(&self.session)?;
        } else {
            self.session.hazards.release_slot(hazard.slot);
            self.session.leave_split_gen();
        }
        result
    }

    // ------------------------------------------------------------------
    // transaction context for reads

    /// Read-committed transactions re-snapshot per operation; reads
    /// outside any transaction borrow a snapshot for the duration of
    /// the call.
    fn read_txn_enter(&self) -> bool {
        let mut txn = self.session.txn.lock().unwrap();
        if txn.running {
            if txn.isolation == txn::Isolation::ReadCommitted {
                self.session
                    .txn_global
                    .get_snapshot(&mut txn, &self.session.txn_shared);
            }
            false
        } else {
            self.session
                .txn_global
                .get_snapshot(&mut txn, &self.session.txn_shared);
            true
        }
    }

    fn read_txn_leave(&self, temp: bool) {
        if temp {
            let mut txn = self.session.txn.lock().unwrap();
            self.session
                .txn_global
                .release_snapshot(&mut txn, &self.session.txn_shared);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModifyCheck {
    None,
    MustExist,
    MustNotExist,
}

impl ModifyCheck {
    fn if_absent(overwrite: bool) -> Self {
        if overwrite {
            ModifyCheck::None
        } else {
            ModifyCheck::MustNotExist
        }
    }

    fn apply(self, existing: bool) -> TimberVoid {
        match self {
            ModifyCheck::None => Ok(()),
            ModifyCheck::MustExist if !existing => Err(TimberError::NotFound),
            ModifyCheck::MustNotExist if existing => Err(TimberError::DuplicateKey),
            _ => Ok(()),
        }
    }
}

fn u64_cmp(a: &u64, b: &u64) -> std::cmp::Ordering {
    a.cmp(b)
}

fn key_order(btree: &BTree, a: &CursorKey, b: &CursorKey) -> std::cmp::Ordering {
    match (a, b) {
        (CursorKey::Row(x), CursorKey::Row(y)) => btree.compare(x, y),
        (CursorKey::Recno(x), CursorKey::Recno(y)) => x.cmp(y),
        _ => std::cmp::Ordering::Equal,
    }
}

/// Materialize a resolved value, chasing overflow addresses through
/// the page's transaction cache or the block manager.
fn fetch_value(btree: &BTree, page: &Page, vref: ValueRef) -> TimberResult<Option<Bytes>> {
    match vref {
        ValueRef::Inline(v) => Ok(Some(v)),
        ValueRef::NotVisible => Ok(None),
        ValueRef::Ovfl { cookie, .. } => {
            {
                let modify = page.modify.lock().unwrap();
                if let Some(v) = modify.ovfl.lookup_cached(cookie.off) {
                    return Ok(Some(v));
                }
            }
            let (_, payload) = btree.block.read_block(&cookie)?;
            Ok(Some(Bytes::from(payload)))
        }
    }
}

/// One traversal step over a row leaf: the next candidate position
/// and the raw material to resolve its visibility.
type StepOut = Option<(LeafLoc, CursorKey, Option<OnPage>, UpdChain)>;

fn row_candidate(leaf: &crate::btree::page::RowLeafData, loc: &LeafLoc) -> StepOut {
    match loc {
        LeafLoc::RowOnPage(slot) => {
            let row: &RowSlot = &leaf.rows[*slot];
            Some((
                loc.clone(),
                CursorKey::Row(row.key.clone()),
                row.value.clone(),
                row.upd.clone(),
            ))
        }
        LeafLoc::RowInsert { list, node } => {
            let l = list_at(leaf, *list);
            Some((
                loc.clone(),
                CursorKey::Row(l.key(*node).clone()),
                None,
                l.value(*node).clone(),
            ))
        }
        _ => None,
    }
}

fn list_at(
    leaf: &crate::btree::page::RowLeafData,
    list: usize,
) -> &crate::btree::skiplist::SkipList<Bytes, UpdChain> {
    if list == 0 {
        &leaf.insert_smallest
    } else {
        &leaf.inserts[list - 1]
    }
}

fn row_step(
    btree: &BTree,
    leaf: &crate::btree::page::RowLeafData,
    loc: &LeafLoc,
    forward: bool,
) -> StepOut {
    let cmp = |a: &Bytes, b: &Bytes| btree.compare(a, b);
    let next_loc: Option<LeafLoc> = if forward {
        match loc {
            LeafLoc::Start => first_loc(leaf, 0),
            LeafLoc::RowSeek(key) => {
                let pos = row_leaf_search(btree, leaf, key);
                match pos.slot {
                    Some(slot) => Some(LeafLoc::RowOnPage(slot)),
                    None => match list_at(leaf, pos.ins_list).ceiling(key, cmp) {
                        Some(node) => Some(LeafLoc::RowInsert {
                            list: pos.ins_list,
                            node,
                        }),
                        None => after_list(leaf, pos.ins_list),
                    },
                }
            }
            LeafLoc::RowOnPage(slot) => match list_at(leaf, slot + 1).first() {
                Some(node) => Some(LeafLoc::RowInsert {
                    list: slot + 1,
                    node,
                }),
                None => after_list(leaf, slot + 1),
            },
            LeafLoc::RowInsert { list, node } => match list_at(leaf, *list).next(*node) {
                Some(next) => Some(LeafLoc::RowInsert {
                    list: *list,
                    node: next,
                }),
                None => after_list(leaf, *list),
            },
            LeafLoc::End => None,
            _ => None,
        }
    } else {
        match loc {
            LeafLoc::End => last_loc(leaf),
            LeafLoc::RowSeek(key) => {
                let pos = row_leaf_search(btree, leaf, key);
                match pos.slot {
                    Some(slot) => Some(LeafLoc::RowOnPage(slot)),
                    None => {
                        let list = list_at(leaf, pos.ins_list);
                        match floor_strict(list, key, cmp) {
                            Some(node) => Some(LeafLoc::RowInsert {
                                list: pos.ins_list,
                                node,
                            }),
                            None => before_list(pos.ins_list),
                        }
                    }
                }
            }
            LeafLoc::RowOnPage(slot) => match list_at(leaf, *slot).last() {
                Some(node) => Some(LeafLoc::RowInsert {
                    list: *slot,
                    node,
                }),
                None => before_list(*slot),
            },
            LeafLoc::RowInsert { list, node } => {
                let l = list_at(leaf, *list);
                let key = l.key(*node).clone();
                match floor_strict(l, &key, cmp) {
                    Some(prev) => Some(LeafLoc::RowInsert {
                        list: *list,
                        node: prev,
                    }),
                    None => before_list(*list),
                }
            }
            LeafLoc::Start => None,
            _ => None,
        }
    };
    next_loc.and_then(|loc| row_candidate(leaf, &loc))
}

/// First position at or after insert list `list`.
fn first_loc(leaf: &crate::btree::page::RowLeafData, list: usize) -> Option<LeafLoc> {
    match list_at(leaf, list).first() {
        Some(node) => Some(LeafLoc::RowInsert { list, node }),
        None => after_list(leaf, list),
    }
}

/// The on-page row following insert list `list` (list i sits before
/// row i).
fn after_list(leaf: &crate::btree::page::RowLeafData, list: usize) -> Option<LeafLoc> {
    if list < leaf.rows.len() {
        Some(LeafLoc::RowOnPage(list))
    } else {
        None
    }
}

/// The on-page row preceding insert list `list`.
fn before_list(list: usize) -> Option<LeafLoc> {
    if list > 0 {
        Some(LeafLoc::RowOnPage(list - 1))
    } else {
        None
    }
}

fn last_loc(leaf: &crate::btree::page::RowLeafData) -> Option<LeafLoc> {
    let last_list = leaf.rows.len();
    match list_at(leaf, last_list).last() {
        Some(node) => Some(LeafLoc::RowInsert {
            list: last_list,
            node,
        }),
        None if !leaf.rows.is_empty() => Some(LeafLoc::RowOnPage(leaf.rows.len() - 1)),
        None => None,
    }
}

/// Last node strictly below `key`.
fn floor_strict<F>(
    list: &crate::btree::skiplist::SkipList<Bytes, UpdChain>,
    key: &Bytes,
    cmp: F,
) -> Option<usize>
where
    F: Fn(&Bytes, &Bytes) -> std::cmp::Ordering,
{
    list.prev_of(key, cmp)
}

/// Resolve one recno of a column page for a reader.
fn col_resolve(data: &PageData, recno: u64, txn: &txn::Txn) -> ValueRef {
    match data {
        PageData::ColVar(col) => {
            let onpage = col.cell_for(recno).and_then(|cell| cell.value.clone());
            let chain = col
                .updates
                .search_with(&recno, u64_cmp)
                .found
                .map(|n| col.updates.value(n).clone())
                .unwrap_or(None);
            resolve_value(onpage.as_ref(), chain.as_ref(), txn)
        }
        PageData::ColFix(col) => {
            let slot = recno.checked_sub(col.start_recno);
            let onpage = match slot {
                Some(slot) if slot < col.entries => {
                    Some(OnPage::Value(Bytes::copy_from_slice(&[col.get_bits(slot)])))
                }
                _ => None,
            };
            let chain = col
                .updates
                .search_with(&recno, u64_cmp)
                .found
                .map(|n| col.updates.value(n).clone())
                .unwrap_or(None);
            resolve_value(onpage.as_ref(), chain.as_ref(), txn)
        }
        _ => ValueRef::NotVisible,
    }
}

/// One traversal step over a column leaf.
fn col_step(data: &PageData, loc: &LeafLoc, forward: bool) -> StepOut {
    let (start, page_max, updates) = match data {
        PageData::ColVar(col) => {
            let mut max = col.stop_recno().saturating_sub(1);
            if let Some(idx) = col.updates.last() {
                max = max.max(*col.updates.key(idx));
            }
            (col.start_recno, max, &col.updates)
        }
        PageData::ColFix(col) => {
            let mut max = (col.start_recno + col.entries).saturating_sub(1);
            if let Some(idx) = col.updates.last() {
                max = max.max(*col.updates.key(idx));
            }
            (col.start_recno, max, &col.updates)
        }
        _ => return None,
    };
    if page_max < start {
        return None;
    }

    let target: Option<u64> = if forward {
        match loc {
            LeafLoc::Start => Some(start),
            LeafLoc::ColSeek(recno) => Some((*recno).max(start)),
            LeafLoc::ColRecno(recno) => next_candidate(data, updates, *recno, page_max),
            LeafLoc::End => None,
            _ => None,
        }
    } else {
        match loc {
            LeafLoc::End => Some(page_max),
            LeafLoc::ColSeek(recno) => {
                if *recno > start {
                    Some((*recno - 1).min(page_max))
                } else {
                    None
                }
            }
            LeafLoc::ColRecno(recno) => {
                if *recno > start {
                    Some(recno - 1)
                } else {
                    None
                }
            }
            LeafLoc::Start => None,
            _ => None,
        }
    };

    let recno = match target {
        Some(r) if r >= start && r <= page_max => r,
        _ => return None,
    };

    let (onpage, chain) = match data {
        PageData::ColVar(col) => {
            let onpage = col.cell_for(recno).and_then(|cell| cell.value.clone());
            let chain = col
                .updates
                .search_with(&recno, u64_cmp)
                .found
                .map(|n| col.updates.value(n).clone())
                .unwrap_or(None);
            (onpage, chain)
        }
        PageData::ColFix(col) => {
            let slot = recno - col.start_recno;
            let onpage = if slot < col.entries {
                Some(OnPage::Value(Bytes::copy_from_slice(&[col.get_bits(slot)])))
            } else {
                None
            };
            let chain = col
                .updates
                .search_with(&recno, u64_cmp)
                .found
                .map(|n| col.updates.value(n).clone())
                .unwrap_or(None);
            (onpage, chain)
        }
        _ => return None,
    };

    Some((
        LeafLoc::ColRecno(recno),
        CursorKey::Recno(recno),
        onpage,
        chain,
    ))
}

/// The next recno after `recno` that the page could possibly cover:
/// either on-page data or an update node. Skips sparse gaps without
/// iterating them.
fn next_candidate(
    data: &PageData,
    updates: &crate::btree::skiplist::SkipList<u64, UpdChain>,
    recno: u64,
    page_max: u64,
) -> Option<u64> {
    let want = recno + 1;
    if want > page_max {
        return None;
    }
    let onpage_next = match data {
        PageData::ColVar(col) => col.next_covered(want),
        PageData::ColFix(col) => {
            let stop = col.start_recno + col.entries;
            if want < stop {
                Some(want.max(col.start_recno))
            } else {
                None
            }
        }
        _ => None,
    };
    let upd_next = updates.ceiling(&want, u64_cmp).map(|n| *updates.key(n));
    match (onpage_next, upd_next) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
