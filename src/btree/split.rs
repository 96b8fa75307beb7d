use std::sync::{atomic::Ordering, Arc};

use bytes::Bytes;
use log::debug;

use crate::{
    block::PageType,
    btree::{
        page::{
            link_child, ColVarData, IntData, Page, PageData, PageRef, RefAddr, RefKey, RefState,
            RowLeafData, UpdChain, PAGE_SPLITTING,
        },
        tree::BTree,
    },
    error::{TimberError, TimberVoid},
    session::SessionInner,
    utils::HandyRwLock,
};

/// How tall the tail insert list must be before an in-memory split is
/// worth it.
const SPLIT_INSERT_MIN: usize = 16;

/// Memory charge for one ref slot in an internal index.
const REF_OVERHEAD: u64 = 64;

/// In-memory split of an append-heavy leaf: move the tail of its last
/// insert list into a fresh sibling, bypassing reconciliation. A
/// no-op unless the page is oversized and the tail list is tall.
pub fn split_insert(
    btree: &Arc<BTree>,
    session: &SessionInner,
    ref_: &Arc<PageRef>,
    page: &Arc<Page>,
) -> TimberVoid {
    if page.footprint() < btree.cfg.memory_page_max {
        return Ok(());
    }
    if !page.try_set_flag(PAGE_SPLITTING) {
        return Ok(());
    }
    let result = split_insert_locked(btree, session, ref_, page);
    page.clear_flag(PAGE_SPLITTING);
    result
}

fn split_insert_locked(
    btree: &Arc<BTree>,
    session: &SessionInner,
    ref_: &Arc<PageRef>,
    page: &Arc<Page>,
) -> TimberVoid {
    let (sibling_ref, moved_bytes) = {
        let mut data = page.data.wl();
        match &mut *data {
            PageData::RowLeaf(leaf) => match row_split_tail(btree, leaf) {
                Some(out) => out,
                None => return Ok(()),
            },
            PageData::ColVar(col) => match col_split_tail(col) {
                Some(out) => out,
                None => return Ok(()),
            },
            // fixed-width and internal pages never split in memory
            _ => return Ok(()),
        }
    };

    page.mem_size
        .fetch_sub(moved_bytes.min(page.footprint()), Ordering::SeqCst);
    // the moved bytes stay resident, they just changed pages; the
    // cache total is untouched
    let sibling = sibling_ref.page().unwrap();
    session.cache.mark_dirty(&sibling);
    session.cache.mark_dirty(page);

    debug!(
        "{}: in-memory split, sibling of {} bytes",
        btree.uri,
        sibling.footprint()
    );
    insert_siblings(btree, session, ref_, vec![sibling_ref], true)
}

/// Split the tail half off the last insert list of a row leaf.
fn row_split_tail(btree: &Arc<BTree>, leaf: &mut RowLeafData) -> Option<(Arc<PageRef>, u64)> {
    let list = if leaf.rows.is_empty() {
        &mut leaf.insert_smallest
    } else {
        let last = leaf.inserts.len() - 1;
        &mut leaf.inserts[last]
    };
    if list.len() < SPLIT_INSERT_MIN {
        return None;
    }

    // median key of the list
    let mid = list.len() / 2;
    let split_key = list
        .iter()
        .nth(mid)
        .map(|(k, _)| k.clone())
        .expect("list is non-empty");

    let cmp = |a: &Bytes, b: &Bytes| btree.compare(a, b);
    let moved = list.split_tail(&split_key, cmp);
    if moved.is_empty() {
        return None;
    }

    let mut moved_bytes = 0u64;
    let mut sibling = RowLeafData::empty();
    for (key, chain) in moved {
        moved_bytes += key.len() as u64 + chain_bytes(&chain) + 64;
        let search = sibling.insert_smallest.search_with(&key, cmp);
        sibling.insert_smallest.insert(&search, key, chain);
    }

    let page = Page::new(PageType::RowLeaf, PageData::RowLeaf(sibling), None);
    page.incr_mem(moved_bytes);
    let ref_ = PageRef::new_mem(RefKey::Row(split_key), Arc::clone(&page));
    link_child(&ref_, &page);
    Some((ref_, moved_bytes))
}

/// Split the append tail off a variable-length column leaf.
fn col_split_tail(col: &mut ColVarData) -> Option<(Arc<PageRef>, u64)> {
    let stop = col.stop_recno();
    let appended: Vec<u64> = col
        .updates
        .iter()
        .map(|(recno, _)| *recno)
        .filter(|recno| *recno >= stop)
        .collect();
    if appended.len() < SPLIT_INSERT_MIN {
        return None;
    }

    let split_recno = appended[appended.len() / 2];
    let cmp = |a: &u64, b: &u64| a.cmp(b);
    let moved: Vec<(u64, UpdChain)> = col.updates.split_tail(&split_recno, cmp);
    if moved.is_empty() {
        return None;
    }

    let mut moved_bytes = 0u64;
    let mut sibling = ColVarData::empty(split_recno);
    for (recno, chain) in moved {
        moved_bytes += chain_bytes(&chain) + 32;
        let search = sibling.updates.search_with(&recno, cmp);
        sibling.updates.insert(&search, recno, chain);
    }

    let page = Page::new(PageType::ColVar, PageData::ColVar(sibling), None);
    page.incr_mem(moved_bytes);
    let ref_ = PageRef::new_mem(RefKey::Recno(split_recno), Arc::clone(&page));
    link_child(&ref_, &page);
    Some((ref_, moved_bytes))
}

fn chain_bytes(chain: &UpdChain) -> u64 {
    let mut total = 0;
    let mut cursor = chain.as_ref();
    while let Some(upd) = cursor {
        total += upd.mem_size();
        cursor = upd.next.as_ref();
    }
    total
}

/// Install `replacement` next to (or in place of) `child` in the
/// tree. With `keep_child`, the child stays and the replacement refs
/// are spliced in after it (in-memory split); without it, the child's
/// slot is handed over and the child ref is marked `Split` so racing
/// readers restart (eviction split).
///
/// `replacement` must never contain `child` itself.
pub fn insert_siblings(
    btree: &Arc<BTree>,
    session: &SessionInner,
    child: &Arc<PageRef>,
    replacement: Vec<Arc<PageRef>>,
    keep_child: bool,
) -> TimberVoid {
    let mut spins = 0u64;
    loop {
        let home = {
            let guard = child.home.rl();
            guard.as_ref().and_then(|weak| weak.upgrade())
        };

        let result = match home {
            None => return split_root(btree, session, child, replacement, keep_child),
            Some(home) => {
                match split_parent(btree, session, &home, child, &replacement, keep_child) {
                    Ok(()) => {
                        maybe_deepen(btree, session, &home)?;
                        return Ok(());
                    }
                    Err(e) => Err(e),
                }
            }
        };

        // the child's home may be mid-move (deep split); re-resolve
        match result {
            Err(TimberError::Restart) | Err(TimberError::Busy) => {
                spins += 1;
                if spins > 1_000_000 {
                    return Err(TimberError::panic("split cannot locate child in parent"));
                }
                std::thread::yield_now();
            }
            other => return other,
        }
    }
}

/// The child is the root: push it (and its new siblings) down under a
/// fresh internal page installed in the persistent root ref.
fn split_root(
    btree: &Arc<BTree>,
    session: &SessionInner,
    root_ref: &Arc<PageRef>,
    replacement: Vec<Arc<PageRef>>,
    keep_child: bool,
) -> TimberVoid {
    let mut index: Vec<Arc<PageRef>> = Vec::with_capacity(replacement.len() + 1);
    if keep_child {
        // the old root page moves under a new ref of its own
        let page = root_ref
            .page()
            .ok_or_else(|| TimberError::panic("root split without a root page"))?;
        let left_ref = PageRef::new_mem(root_ref.key_clone(), Arc::clone(&page));
        link_child(&left_ref, &page);
        index.push(left_ref);
    }
    index.extend(replacement);

    let int_type = btree.store.int_type();
    let int_data = IntData {
        index: Arc::new(index),
    };
    let new_root = Page::new(
        int_type,
        match int_type {
            PageType::RowInt => PageData::RowInt(int_data),
            _ => PageData::ColInt(int_data),
        },
        None,
    );
    {
        let data = new_root.data.rl();
        for r in data.as_int().index.iter() {
            *r.home.wl() = Some(Arc::downgrade(&new_root));
        }
    }
    new_root.incr_mem(REF_OVERHEAD * 2);

    // the root ref persists; it now owns the new internal page
    *new_root.parent.wl() = Some(Arc::downgrade(root_ref));
    *root_ref.page.wl() = Some(Arc::clone(&new_root));
    *root_ref.addr.wl() = None;
    root_ref.set_state(RefState::Mem);

    session.cache.page_in(new_root.footprint());
    session.cache.mark_dirty(&new_root);
    btree.next_split_gen();
    debug!("{}: root split", btree.uri);
    Ok(())
}

/// Single-thread the parent while its index array is rebuilt.
fn split_parent(
    btree: &Arc<BTree>,
    session: &SessionInner,
    home: &Arc<Page>,
    child: &Arc<PageRef>,
    replacement: &[Arc<PageRef>],
    keep_child: bool,
) -> TimberVoid {
    if !home.try_set_flag(PAGE_SPLITTING) {
        return Err(TimberError::Busy);
    }

    let result = (|| -> TimberVoid {
        let mut data = home.data.wl();
        let int = data.as_int_mut();
        let pos = int
            .index
            .iter()
            .position(|r| Arc::ptr_eq(r, child))
            .ok_or(TimberError::Restart)?;

        let mut new_index = Vec::with_capacity(int.index.len() + replacement.len());
        let keep_upto = if keep_child { pos + 1 } else { pos };
        new_index.extend(int.index[..keep_upto].iter().cloned());
        new_index.extend(replacement.iter().cloned());
        new_index.extend(int.index[pos + 1..].iter().cloned());

        for r in replacement.iter() {
            *r.home.wl() = Some(Arc::downgrade(home));
        }

        let old = Arc::clone(&int.index);
        let old_gen = btree.split_gen.load(Ordering::SeqCst);
        int.index = Arc::new(new_index);
        btree.next_split_gen();
        btree.stash_old_index(old_gen, old);

        if !keep_child {
            child.set_state(RefState::Split);
        }
        Ok(())
    })();

    home.clear_flag(PAGE_SPLITTING);
    if result.is_ok() {
        home.incr_mem(REF_OVERHEAD * replacement.len() as u64);
        session.cache.mark_dirty(home);
    }
    result
}

/// Deep split: an internal page that grew too wide is carved into
/// sibling internal pages and the moved refs re-homed.
fn maybe_deepen(btree: &Arc<BTree>, session: &SessionInner, page: &Arc<Page>) -> TimberVoid {
    let (too_wide, entries) = {
        let data = page.data.rl();
        let len = data.as_int().index.len();
        (
            len > btree.cfg.split_deepen_min_child && page.footprint() > btree.cfg.memory_page_max,
            len,
        )
    };
    if !too_wide {
        return Ok(());
    }

    if !page.try_set_flag(PAGE_SPLITTING) {
        return Ok(());
    }
    let result = deepen_locked(btree, session, page, entries);
    page.clear_flag(PAGE_SPLITTING);
    result
}

fn deepen_locked(
    btree: &Arc<BTree>,
    session: &SessionInner,
    page: &Arc<Page>,
    entries: usize,
) -> TimberVoid {
    let per_child = btree.cfg.split_deepen_per_child.max(2);
    let children = (entries + per_child - 1) / per_child;
    if children < 2 {
        return Ok(());
    }

    let int_type = page.page_type;
    let mut data = page.data.wl();
    let int = data.as_int_mut();
    let old = Arc::clone(&int.index);

    let mut new_index = Vec::with_capacity(children);
    for group in old.chunks(per_child) {
        let group_vec: Vec<Arc<PageRef>> = group.to_vec();
        let key = group_vec[0].key_clone();
        let int_data = IntData {
            index: Arc::new(group_vec.clone()),
        };
        let child_page = Page::new(
            int_type,
            match int_type {
                PageType::RowInt => PageData::RowInt(int_data),
                _ => PageData::ColInt(int_data),
            },
            None,
        );
        child_page.incr_mem(REF_OVERHEAD * group_vec.len() as u64);
        // re-point the moved refs at their new home
        for r in group_vec.iter() {
            *r.home.wl() = Some(Arc::downgrade(&child_page));
        }
        let child_ref = PageRef::new_mem(key, Arc::clone(&child_page));
        link_child(&child_ref, &child_page);
        *child_ref.home.wl() = Some(Arc::downgrade(page));
        session.cache.page_in(child_page.footprint());
        session.cache.mark_dirty(&child_page);
        new_index.push(child_ref);
    }

    let old_gen = btree.split_gen.load(Ordering::SeqCst);
    int.index = Arc::new(new_index);
    btree.next_split_gen();
    btree.stash_old_index(old_gen, old);
    drop(data);

    session.cache.mark_dirty(page);
    debug!(
        "{}: deep split, {} children under {} new internal pages",
        btree.uri, entries, children
    );
    Ok(())
}

/// Eviction found the page reconciled into multiple blocks: swap the
/// evicted ref for one on-disk ref per block.
pub fn split_evict(
    btree: &Arc<BTree>,
    session: &SessionInner,
    ref_: &Arc<PageRef>,
    blocks: Vec<(RefKey, RefAddr)>,
) -> TimberVoid {
    let replacement: Vec<Arc<PageRef>> = blocks
        .into_iter()
        .map(|(key, addr)| PageRef::new_disk(key, addr))
        .collect();
    insert_siblings(btree, session, ref_, replacement, false)
}

/// Drop stashed index arrays no session can still be traversing.
pub fn stash_sweep(btree: &Arc<BTree>, sessions: &[Arc<SessionInner>]) {
    let mut oldest = 0u64;
    for session in sessions {
        let gen = session.active_split_gen();
        if gen != 0 && (oldest == 0 || gen < oldest) {
            oldest = gen;
        }
    }
    btree.stash_drain(oldest);
}
