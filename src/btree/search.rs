use std::sync::Arc;

use bytes::Bytes;

use crate::{
    btree::{
        hazard::HazardSlot,
        page::{PageRef, RowLeafData},
        tree::BTree,
    },
    error::{TimberError, TimberResult},
    session::SessionInner,
    utils::HandyRwLock,
};

/// What we are looking for.
#[derive(Debug, Clone)]
pub enum SearchKey {
    Row(Bytes),
    Recno(u64),
}

impl SearchKey {
    pub fn row(&self) -> &Bytes {
        match self {
            SearchKey::Row(k) => k,
            _ => panic!("row key expected"),
        }
    }

    pub fn recno(&self) -> u64 {
        match self {
            SearchKey::Recno(r) => *r,
            _ => panic!("recno expected"),
        }
    }
}

/// Pick the child of an internal page for `key`. The first child acts
/// as minus infinity so out-of-range-low keys still descend.
pub fn choose_child(
    btree: &BTree,
    index: &[Arc<PageRef>],
    key: &SearchKey,
) -> TimberResult<usize> {
    if index.is_empty() {
        return Err(TimberError::panic("internal page with no children"));
    }
    match key {
        SearchKey::Row(want) => {
            let mut lo = 1usize;
            let mut hi = index.len();
            // greatest slot whose key is <= want; slot 0 if none
            while lo < hi {
                let mid = (lo + hi) / 2;
                let ref_key = index[mid].key.rl().row().clone();
                match btree.compare(&ref_key, want) {
                    std::cmp::Ordering::Greater => hi = mid,
                    _ => lo = mid + 1,
                }
            }
            Ok(lo - 1)
        }
        SearchKey::Recno(want) => {
            let mut lo = 1usize;
            let mut hi = index.len();
            while lo < hi {
                let mid = (lo + hi) / 2;
                let start = index[mid].key.rl().recno();
                if start > *want {
                    hi = mid;
                } else {
                    lo = mid + 1;
                }
            }
            Ok(lo - 1)
        }
    }
}

/// Descend from the root to the leaf that owns `key`, hand-over-hand
/// on hazard pointers. The caller owns the returned hazard slot.
///
/// Raced splits surface as `Restart`; catch it at the cursor boundary
/// and re-descend.
pub fn descend_to_leaf(
    btree: &BTree,
    session: &SessionInner,
    key: &SearchKey,
) -> TimberResult<(Arc<PageRef>, HazardSlot)> {
    let mut ref_ = btree.root_ref();
    let mut held: Option<HazardSlot> = None;

    let result = loop {
        let slot = match btree.page_in(session, &ref_) {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                // deleted subtree: nothing to find here
                break Err(TimberError::NotFound);
            }
            Err(e) => break Err(e),
        };
        if let Some(prev) = held.take() {
            session.hazards.release_slot(prev.slot);
        }

        if !slot.page.is_internal() {
            break Ok((ref_, slot));
        }

        session.enter_split_gen(btree.split_gen.load(std::sync::atomic::Ordering::SeqCst));
        let child = {
            let data = slot.page.data.rl();
            let int = data.as_int();
            match choose_child(btree, &int.index, key) {
                Ok(idx) => Ok(Arc::clone(&int.index[idx])),
                Err(e) => Err(e),
            }
        };
        match child {
            Ok(child) => {
                held = Some(slot);
                ref_ = child;
            }
            Err(e) => {
                session.hazards.release_slot(slot.slot);
                break Err(e);
            }
        }
    };

    if let Some(prev) = held.take() {
        session.hazards.release_slot(prev.slot);
    }
    if result.is_err() {
        session.leave_split_gen();
    }
    result
}

/// Result of positioning a row key inside a leaf.
#[derive(Debug, Clone, Copy)]
pub struct RowLeafPos {
    /// Exact on-page match.
    pub slot: Option<usize>,
    /// Which insert list the key belongs to when not on page:
    /// 0 = before the first row, i+1 = after row i.
    pub ins_list: usize,
}

/// Binary-search the on-page rows; the insert lists are searched by
/// the caller under whichever latch it holds.
pub fn row_leaf_search(btree: &BTree, data: &RowLeafData, key: &[u8]) -> RowLeafPos {
    match data
        .rows
        .binary_search_by(|row| btree.compare(&row.key, key))
    {
        Ok(slot) => RowLeafPos {
            slot: Some(slot),
            ins_list: slot + 1,
        },
        Err(ins) => RowLeafPos {
            slot: None,
            ins_list: ins,
        },
    }
}

/// Which insert list of a row leaf a position refers to.
pub fn insert_list<'a>(
    data: &'a RowLeafData,
    ins_list: usize,
) -> &'a crate::btree::skiplist::SkipList<Bytes, crate::btree::page::UpdChain> {
    if ins_list == 0 {
        &data.insert_smallest
    } else {
        &data.inserts[ins_list - 1]
    }
}

pub fn insert_list_mut<'a>(
    data: &'a mut RowLeafData,
    ins_list: usize,
) -> &'a mut crate::btree::skiplist::SkipList<Bytes, crate::btree::page::UpdChain> {
    if ins_list == 0 {
        &mut data.insert_smallest
    } else {
        &mut data.inserts[ins_list - 1]
    }
}

/// Walk the tree sideways: the leaf following (or preceding) `ref_`
/// in tree order, descending to the edge leaf of each subtree.
pub fn neighbor_leaf(
    btree: &BTree,
    session: &SessionInner,
    from: &Arc<PageRef>,
    forward: bool,
) -> TimberResult<Option<(Arc<PageRef>, HazardSlot)>> {
    // climb until there is a sibling in the parent's index
    let mut current = Arc::clone(from);
    loop {
        let page = match current.page() {
            Some(p) => p,
            None => return Err(TimberError::Restart),
        };
        let parent_ref = {
            let guard = page.parent.rl();
            match &*guard {
                Some(weak) => match weak.upgrade() {
                    Some(r) => r,
                    None => return Err(TimberError::Restart),
                },
                // at the root: no neighbor
                None => return Ok(None),
            }
        };
        let home = {
            let guard = parent_ref.home.rl();
            match &*guard {
                Some(weak) => match weak.upgrade() {
                    Some(h) => h,
                    None => return Err(TimberError::Restart),
                },
                None => return Ok(None),
            }
        };

        let sibling = {
            let data = home.data.rl();
            let int = data.as_int();
            let pos = int
                .index
                .iter()
                .position(|r| Arc::ptr_eq(r, &parent_ref))
                .ok_or(TimberError::Restart)?;
            if forward {
                int.index.get(pos + 1).cloned()
            } else if pos > 0 {
                int.index.get(pos - 1).cloned()
            } else {
                None
            }
        };

        match sibling {
            Some(next) => {
                // descend to the near edge of that subtree
                return edge_leaf(btree, session, next, !forward).map(Some);
            }
            None => {
                // keep climbing
                let home_ref = {
                    let guard = home.parent.rl();
                    match &*guard {
                        Some(weak) => weak.upgrade().ok_or(TimberError::Restart)?,
                        None => return Ok(None),
                    }
                };
                current = home_ref;
            }
        }
    }
}

/// Descend to the first (or last) leaf of a subtree.
pub fn edge_leaf(
    btree: &BTree,
    session: &SessionInner,
    mut ref_: Arc<PageRef>,
    last: bool,
) -> TimberResult<(Arc<PageRef>, HazardSlot)> {
    let mut held: Option<HazardSlot> = None;
    let result = loop {
        let slot = match btree.page_in(session, &ref_) {
            Ok(Some(slot)) => slot,
            Ok(None) => break Err(TimberError::NotFound),
            Err(e) => break Err(e),
        };
        if let Some(prev) = held.take() {
            session.hazards.release_slot(prev.slot);
        }
        if !slot.page.is_internal() {
            break Ok((ref_, slot));
        }
        let child = {
            let data = slot.page.data.rl();
            let int = data.as_int();
            if last {
                int.index.last().cloned()
            } else {
                int.index.first().cloned()
            }
        };
        held = Some(slot);
        match child {
            Some(c) => ref_ = c,
            None => break Err(TimberError::NotFound),
        }
    };
    if let Some(prev) = held.take() {
        session.hazards.release_slot(prev.slot);
    }
    result
}
