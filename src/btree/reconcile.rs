//! Reconciliation: turning a dirty in-memory page into one or more
//! on-disk page images.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace};

use crate::{
    block::{io::Cookie, PageType},
    btree::{
        cell,
        page::{
            chain_has_invisible, resolve_value, visible_update, OnPage, Page, PageData, PageRef,
            RefAddr, RefKey, RefState, UpdChain, ValueRef, PAGE_SCANNING,
        },
        search::SearchKey,
        split,
        tree::{BTree, Store},
    },
    error::{TimberError, TimberResult, TimberVoid},
    io::RecWriter,
    session::SessionInner,
    txn::{Isolation, Txn, TxnGlobal},
    utils::HandyRwLock,
};

/// One block written by a reconciliation: the boundary key that will
/// name it in the parent, and its address.
pub struct RecBlock {
    pub key: RefKey,
    pub addr: RefAddr,
}

pub struct RecResult {
    pub blocks: Vec<RecBlock>,
    /// Some update in the page was not written because it is not yet
    /// visible to the reconciliation snapshot; the page cannot come
    /// clean.
    pub leave_dirty: bool,
    /// The chains carrying those unwritten updates, keyed by row key
    /// or recno, for reinstantiation on the evicted side.
    pub invisible: Vec<(SearchKey, UpdChain)>,
}

/// The snapshot eviction reconciles under: only data visible to every
/// running transaction may be written.
pub fn eviction_txn(global: &TxnGlobal) -> Txn {
    let mut txn = Txn::new(Isolation::Snapshot);
    txn.has_snapshot = true;
    txn.snap_max = global.oldest_id();
    txn.snap_min = txn.snap_max;
    txn
}

/// A logical entry headed for a disk image.
struct RecEntry {
    key: SearchKey,
    value: RecValue,
}

enum RecValue {
    Inline(Bytes),
    /// Keep an existing overflow block as-is.
    Ovfl { cookie: Cookie, len: u64 },
    /// Column stores only: an explicitly deleted recno.
    Deleted,
    /// Internal pages: a child address.
    Addr {
        cookie: Cookie,
        is_internal: bool,
        recno_or_entries: u64,
    },
}

/// Reconcile `page` into one or more disk images under `rec_txn`.
/// The caller owns the page exclusively enough (a locked ref for
/// eviction, the checkpoint's schema position otherwise); `SCANNING`
/// additionally excludes a concurrent eviction pass.
pub fn reconcile(
    btree: &Arc<BTree>,
    page: &Arc<Page>,
    rec_txn: &Txn,
) -> TimberResult<RecResult> {
    if !page.try_set_flag(PAGE_SCANNING) {
        return Err(TimberError::Busy);
    }
    let result = reconcile_locked(btree, page, rec_txn);
    page.clear_flag(PAGE_SCANNING);

    match result {
        Ok(out) => Ok(out),
        Err(e) => {
            // failure before publication: free whatever we wrote
            let mut modify = page.modify.lock().unwrap();
            let _ = modify.ovfl.abort(&btree.block);
            Err(e)
        }
    }
}

fn reconcile_locked(
    btree: &Arc<BTree>,
    page: &Arc<Page>,
    rec_txn: &Txn,
) -> TimberResult<RecResult> {
    let mut leave_dirty = false;
    let mut invisible: Vec<(SearchKey, UpdChain)> = Vec::new();

    // pass 1: resolve the logical contents under the reconciliation
    // snapshot
    let entries: Vec<RecEntry> = {
        let data = page.data.rl();
        match &*data {
            PageData::RowLeaf(leaf) => {
                let mut out = Vec::new();
                let mut emit = |key: &Bytes, onpage: Option<&OnPage>, chain: &UpdChain| {
                    collect_row_entry(
                        btree,
                        page,
                        key,
                        onpage,
                        chain,
                        rec_txn,
                        &mut out,
                        &mut leave_dirty,
                        &mut invisible,
                    )
                };
                for (key, chain) in leaf.insert_smallest.iter() {
                    emit(key, None, chain)?;
                }
                for (slot, row) in leaf.rows.iter().enumerate() {
                    emit(&row.key, row.value.as_ref(), &row.upd)?;
                    for (key, chain) in leaf.inserts[slot].iter() {
                        emit(key, None, chain)?;
                    }
                }
                out
            }
            PageData::ColVar(col) => collect_col_var(
                btree,
                page,
                col,
                rec_txn,
                &mut leave_dirty,
                &mut invisible,
            )?,
            PageData::ColFix(col) => {
                let mut out = Vec::new();
                let max = {
                    let mut max = (col.start_recno + col.entries).saturating_sub(1);
                    if let Some(idx) = col.updates.last() {
                        max = max.max(*col.updates.key(idx));
                    }
                    max
                };
                let mut recno = col.start_recno;
                while recno <= max && max >= col.start_recno {
                    let slot = recno - col.start_recno;
                    let onpage = if slot < col.entries {
                        Some(OnPage::Value(Bytes::copy_from_slice(&[col.get_bits(slot)])))
                    } else {
                        None
                    };
                    let chain = col
                        .updates
                        .search_with(&recno, |a, b| a.cmp(b))
                        .found
                        .map(|n| col.updates.value(n).clone())
                        .unwrap_or(None);
                    if chain_has_invisible(chain.as_ref(), rec_txn) {
                        leave_dirty = true;
                        invisible.push((SearchKey::Recno(recno), chain.clone()));
                    }
                    let byte = match resolve_value(onpage.as_ref(), chain.as_ref(), rec_txn) {
                        ValueRef::Inline(v) => v,
                        // unset or deleted recnos read back as zero
                        _ => Bytes::copy_from_slice(&[0u8]),
                    };
                    out.push(RecEntry {
                        key: SearchKey::Recno(recno),
                        value: RecValue::Inline(byte),
                    });
                    recno += 1;
                }
                out
            }
            PageData::RowInt(int) | PageData::ColInt(int) => {
                let mut out = Vec::new();
                for ref_ in int.index.iter() {
                    match collect_child(ref_)? {
                        Some(entry) => out.push(entry),
                        None => continue,
                    }
                }
                out
            }
        }
    };

    // pass 2: pack cells and cut block boundaries
    let blocks = write_blocks(btree, page, &entries)?;

    trace!(
        "{}: reconciled into {} block(s), leave_dirty {}",
        btree.uri,
        blocks.len(),
        leave_dirty
    );
    Ok(RecResult {
        blocks,
        leave_dirty,
        invisible,
    })
}

#[allow(clippy::too_many_arguments)]
fn collect_row_entry(
    btree: &Arc<BTree>,
    page: &Arc<Page>,
    key: &Bytes,
    onpage: Option<&OnPage>,
    chain: &UpdChain,
    rec_txn: &Txn,
    out: &mut Vec<RecEntry>,
    leave_dirty: &mut bool,
    invisible: &mut Vec<(SearchKey, UpdChain)>,
) -> TimberVoid {
    if chain_has_invisible(chain.as_ref(), rec_txn) {
        *leave_dirty = true;
        invisible.push((SearchKey::Row(key.clone()), chain.clone()));
    }

    let chosen = visible_update(chain.as_ref(), rec_txn);
    match chosen {
        Some(upd) => {
            // an update supersedes the base image; an overflow base
            // value loses its last on-page reference here
            if let Some(OnPage::Ovfl { cookie, .. }) = onpage {
                retire_ovfl(btree, page, cookie, rec_txn)?;
            }
            if let Some(value) = &upd.value {
                out.push(RecEntry {
                    key: SearchKey::Row(key.clone()),
                    value: RecValue::Inline(value.clone()),
                });
            }
            // visible tombstone: the entry is simply not written
        }
        None => match onpage {
            Some(OnPage::Value(v)) => out.push(RecEntry {
                key: SearchKey::Row(key.clone()),
                value: RecValue::Inline(v.clone()),
            }),
            Some(OnPage::Ovfl { cookie, len }) => out.push(RecEntry {
                key: SearchKey::Row(key.clone()),
                value: RecValue::Ovfl {
                    cookie: *cookie,
                    len: *len,
                },
            }),
            None => {}
        },
    }
    Ok(())
}

fn collect_col_var(
    btree: &Arc<BTree>,
    page: &Arc<Page>,
    col: &crate::btree::page::ColVarData,
    rec_txn: &Txn,
    leave_dirty: &mut bool,
    invisible: &mut Vec<(SearchKey, UpdChain)>,
) -> TimberResult<Vec<RecEntry>> {
    let mut out = Vec::new();
    let mut max = col.stop_recno().saturating_sub(1);
    if let Some(idx) = col.updates.last() {
        max = max.max(*col.updates.key(idx));
    }
    if max < col.start_recno {
        return Ok(out);
    }

    let mut recno = col.start_recno;
    while recno <= max {
        let cell = col.cell_for(recno);
        let chain = col
            .updates
            .search_with(&recno, |a, b| a.cmp(b))
            .found
            .map(|n| col.updates.value(n).clone())
            .unwrap_or(None);

        if chain.is_none() {
            if let Some(cell) = cell {
                // no updates anywhere in this run: emit it wholesale
                let run_end = (cell.start + cell.rle - 1).min(max);
                let covered = run_end - recno + 1;
                let value = match &cell.value {
                    Some(OnPage::Value(v)) => RecValue::Inline(v.clone()),
                    Some(OnPage::Ovfl { cookie, len }) => RecValue::Ovfl {
                        cookie: *cookie,
                        len: *len,
                    },
                    None => RecValue::Deleted,
                };
                // only safe when the whole run is update-free
                let run_clean = col
                    .updates
                    .ceiling(&recno, |a, b| a.cmp(b))
                    .map_or(true, |n| *col.updates.key(n) > run_end);
                if run_clean {
                    for _ in 0..covered {
                        out.push(RecEntry {
                            key: SearchKey::Recno(recno),
                            value: clone_rec_value(&value),
                        });
                        recno += 1;
                    }
                    continue;
                }
            }
        }

        if chain_has_invisible(chain.as_ref(), rec_txn) {
            *leave_dirty = true;
            invisible.push((SearchKey::Recno(recno), chain.clone()));
        }
        let onpage = cell.and_then(|c| c.value.clone());
        let entry = match resolve_value(onpage.as_ref(), chain.as_ref(), rec_txn) {
            ValueRef::Inline(v) => RecValue::Inline(v),
            ValueRef::Ovfl { cookie, len } => RecValue::Ovfl { cookie, len },
            ValueRef::NotVisible => {
                if let Some(OnPage::Ovfl { cookie, .. }) = &onpage {
                    retire_ovfl(btree, page, cookie, rec_txn)?;
                }
                RecValue::Deleted
            }
        };
        out.push(RecEntry {
            key: SearchKey::Recno(recno),
            value: entry,
        });
        recno += 1;
    }
    Ok(out)
}

fn clone_rec_value(value: &RecValue) -> RecValue {
    match value {
        RecValue::Inline(v) => RecValue::Inline(v.clone()),
        RecValue::Ovfl { cookie, len } => RecValue::Ovfl {
            cookie: *cookie,
            len: *len,
        },
        RecValue::Deleted => RecValue::Deleted,
        RecValue::Addr {
            cookie,
            is_internal,
            recno_or_entries,
        } => RecValue::Addr {
            cookie: *cookie,
            is_internal: *is_internal,
            recno_or_entries: *recno_or_entries,
        },
    }
}

/// An overflow block whose value just lost its last reference in the
/// new image: keep the bytes for snapshot readers if anyone can still
/// see them, and free the block when this reconciliation commits.
fn retire_ovfl(
    btree: &Arc<BTree>,
    page: &Arc<Page>,
    cookie: &Cookie,
    rec_txn: &Txn,
) -> TimberVoid {
    let mut modify = page.modify.lock().unwrap();
    // a cached entry means an earlier reconciliation already retired
    // this block; retiring twice would double-free it
    if modify.ovfl.lookup_cached(cookie.off).is_none() {
        // snapshot readers below the reconciliation snapshot may
        // still resolve to the removed value
        let _ = rec_txn;
        let (_, payload) = btree.block.read_block(cookie)?;
        modify.ovfl.cache_value(cookie.off, Bytes::from(payload));
        modify.ovfl.discard_later(*cookie);
    }
    Ok(())
}

fn collect_child(ref_: &Arc<PageRef>) -> TimberResult<Option<RecEntry>> {
    match ref_.state() {
        RefState::Deleted => Ok(None),
        RefState::Disk | RefState::Mem | RefState::Locked => {
            let addr = *ref_.addr.rl();
            match addr {
                Some(addr) => Ok(Some(RecEntry {
                    key: match ref_.key_clone() {
                        RefKey::Row(k) => SearchKey::Row(k),
                        RefKey::Recno(r) => SearchKey::Recno(r),
                    },
                    value: RecValue::Addr {
                        cookie: addr.cookie,
                        is_internal: addr.is_internal,
                        recno_or_entries: addr.recno_or_entries,
                    },
                })),
                None => {
                    // an in-memory child that was never written; the
                    // caller reconciles children first
                    Err(TimberError::Busy)
                }
            }
        }
        RefState::Reading => Err(TimberError::Busy),
        RefState::Split => Err(TimberError::Restart),
    }
}

/// Pack the resolved entries into page images, cutting boundaries at
/// the split size. In raw-compression mode the full buffer is handed
/// to the compressor, which picks its own boundary and returns the
/// accepted source prefix.
fn write_blocks(
    btree: &Arc<BTree>,
    page: &Arc<Page>,
    entries: &[RecEntry],
) -> TimberResult<Vec<RecBlock>> {
    let page_type = page.page_type;
    if page_type == PageType::ColFix {
        return write_colfix_block(btree, page, entries);
    }

    let is_internal = page_type.is_internal();
    let max_size = if is_internal {
        btree.cfg.internal_page_max
    } else {
        btree.cfg.leaf_page_max
    };
    let split_size = (max_size * btree.cfg.split_pct / 100).max(btree.cfg.allocation_size);
    let raw = btree.cfg.raw_compression && btree.block.compressor().is_some();
    let limit = if raw { max_size } else { split_size };

    let mut modify = page.modify.lock().unwrap();
    let mut blocks: Vec<RecBlock> = Vec::new();
    let mut writer = RecWriter::with_capacity(split_size as usize);
    // (buffer offset after entry, entry count consumed so far)
    let mut cuts: Vec<(usize, usize)> = Vec::new();
    let mut block_start = 0usize;
    let mut prev_key: Option<Bytes> = None;
    let mut pending_run: Option<(Bytes, u64)> = None;

    let mut idx = 0usize;
    while idx < entries.len() {
        let entry = &entries[idx];

        match (&entry.key, page_type) {
            (SearchKey::Row(key), PageType::RowLeaf) => {
                pack_row_key(btree, &mut writer, &mut prev_key, key, &mut modify)?;
                pack_leaf_value(btree, &mut writer, &entry.value, 1, &mut modify)?;
            }
            (SearchKey::Row(key), PageType::RowInt) => {
                cell::pack_key(&mut writer, 0, key);
                pack_addr_value(&mut writer, &entry.value)?;
            }
            (SearchKey::Recno(_), PageType::ColInt) => {
                pack_addr_value(&mut writer, &entry.value)?;
            }
            (SearchKey::Recno(_), PageType::ColVar) => match &entry.value {
                // coalesce equal adjacent inline values into RLE runs
                RecValue::Inline(v) => match &mut pending_run {
                    Some((run_val, rle)) if run_val == v => *rle += 1,
                    Some(_) => {
                        flush_run(&mut writer, &mut pending_run);
                        pending_run = Some((v.clone(), 1));
                    }
                    None => pending_run = Some((v.clone(), 1)),
                },
                RecValue::Deleted => {
                    flush_run(&mut writer, &mut pending_run);
                    let mut rle = 1u64;
                    while idx + 1 < entries.len()
                        && matches!(entries[idx + 1].value, RecValue::Deleted)
                    {
                        idx += 1;
                        rle += 1;
                    }
                    cell::pack_del(&mut writer, rle);
                }
                RecValue::Ovfl { cookie, len } => {
                    flush_run(&mut writer, &mut pending_run);
                    cell::pack_value_ovfl(&mut writer, cookie, *len, 1);
                }
                RecValue::Addr { .. } => {
                    return Err(TimberError::panic("address cell on a leaf page"))
                }
            },
            (key, ptype) => {
                return Err(TimberError::panic(format!(
                    "key {:?} cannot appear on a {:?} page",
                    key, ptype
                )))
            }
        }

        idx += 1;
        if pending_run.is_none() {
            cuts.push((writer.len(), idx));
        }

        if writer.len() as u64 >= limit && idx < entries.len() {
            flush_run(&mut writer, &mut pending_run);
            if cuts.last().map(|(off, _)| *off) != Some(writer.len()) {
                cuts.push((writer.len(), idx));
            }

            if raw {
                match raw_cut(btree, page_type, entries, &writer, &cuts, block_start)? {
                    Some((block, accepted, cut_entry)) => {
                        blocks.push(block);
                        let rest = writer.as_slice()[accepted..].to_vec();
                        writer = RecWriter::with_capacity(split_size as usize);
                        writer.put_bytes(&rest);
                        cuts = cuts
                            .iter()
                            .filter(|(off, _)| *off > accepted)
                            .map(|(off, e)| (*off - accepted, *e))
                            .collect();
                        block_start = cut_entry;
                        continue;
                    }
                    None => {
                        // the compressor declined: plain boundary
                    }
                }
            }

            blocks.push(finish_block(
                btree,
                page,
                page_type,
                entries,
                block_start,
                idx,
                writer.as_slice(),
            )?);
            writer = RecWriter::with_capacity(split_size as usize);
            cuts.clear();
            block_start = idx;
            prev_key = None;
        }
    }

    flush_run(&mut writer, &mut pending_run);
    if block_start < entries.len() || blocks.is_empty() {
        blocks.push(finish_block(
            btree,
            page,
            page_type,
            entries,
            block_start,
            entries.len(),
            writer.as_slice(),
        )?);
    }

    drop(modify);
    Ok(blocks)
}

/// Ask the raw compressor to pick a boundary from the valid cut
/// offsets; `None` when it declines or picks nothing usable.
fn raw_cut(
    btree: &Arc<BTree>,
    page_type: PageType,
    entries: &[RecEntry],
    writer: &RecWriter,
    cuts: &[(usize, usize)],
    block_start: usize,
) -> TimberResult<Option<(RecBlock, usize, usize)>> {
    let compressor = match btree.block.compressor() {
        Some(c) => Arc::clone(c),
        None => return Ok(None),
    };
    let offsets: Vec<usize> = cuts.iter().map(|(off, _)| *off).collect();
    let mut dst = Vec::new();
    let accepted = match compressor.compress_raw(writer.as_slice(), &offsets, &mut dst)? {
        Some(accepted) if accepted > 0 => accepted,
        _ => return Ok(None),
    };
    let cut_entry = match cuts.iter().find(|(off, _)| *off == accepted) {
        Some((_, entry)) => *entry,
        // the callback must return one of the offered offsets
        None => return Ok(None),
    };

    let (recno_or_entries, key) =
        block_identity(btree, None, page_type, entries, block_start, cut_entry)?;
    let cookie = btree
        .block
        .write_block_raw(page_type, recno_or_entries, &dst, accepted)?;
    Ok(Some((
        RecBlock {
            key,
            addr: RefAddr {
                cookie,
                is_internal: page_type.is_internal(),
                recno_or_entries,
            },
        },
        accepted,
        cut_entry,
    )))
}

fn finish_block(
    btree: &Arc<BTree>,
    page: &Arc<Page>,
    page_type: PageType,
    entries: &[RecEntry],
    block_start: usize,
    block_end: usize,
    payload: &[u8],
) -> TimberResult<RecBlock> {
    let (recno_or_entries, key) =
        block_identity(btree, Some(page), page_type, entries, block_start, block_end)?;
    let cookie = btree
        .block
        .write_block(page_type, recno_or_entries, payload)?;
    Ok(RecBlock {
        key,
        addr: RefAddr {
            cookie,
            is_internal: page_type.is_internal(),
            recno_or_entries,
        },
    })
}

/// The header field and boundary key of one block: the entry count
/// for row pages and the starting recno for column pages; the page's
/// own key for the first block and a (possibly suffix-truncated)
/// promoted key after that.
fn block_identity(
    btree: &Arc<BTree>,
    page: Option<&Arc<Page>>,
    page_type: PageType,
    entries: &[RecEntry],
    block_start: usize,
    block_end: usize,
) -> TimberResult<(u64, RefKey)> {
    let count = (block_end - block_start) as u64;
    match page_type {
        PageType::ColVar | PageType::ColInt | PageType::ColFix => {
            let first_recno = entries
                .get(block_start)
                .map(|e| e.key.recno())
                .unwrap_or_else(|| page.map(page_start_recno).unwrap_or(1));
            Ok((first_recno, RefKey::Recno(first_recno)))
        }
        _ => {
            if block_start == 0 {
                let own = page
                    .map(|p| ref_key_of(p))
                    .unwrap_or_else(|| RefKey::Row(Bytes::new()));
                Ok((count, own))
            } else {
                let first = match &entries[block_start].key {
                    SearchKey::Row(k) => k.clone(),
                    SearchKey::Recno(r) => return Ok((*r, RefKey::Recno(*r))),
                };
                let promoted = if btree.cfg.internal_key_truncate {
                    match &entries[block_start - 1].key {
                        SearchKey::Row(prev) => cell::suffix_truncate(prev, &first),
                        _ => first.clone(),
                    }
                } else {
                    first.clone()
                };
                Ok((count, RefKey::Row(promoted)))
            }
        }
    }
}

/// A fixed-width page is its bitfield, written in one piece.
fn write_colfix_block(
    btree: &Arc<BTree>,
    page: &Arc<Page>,
    entries: &[RecEntry],
) -> TimberResult<Vec<RecBlock>> {
    let bitcnt = match &*page.data.rl() {
        PageData::ColFix(col) => col.bitcnt,
        _ => return Err(TimberError::panic("fixed-column page expected")),
    };

    let mut writer = RecWriter::new();
    writer.put_u8(bitcnt);
    writer.put_uvarint(entries.len() as u64);
    let mut bits = bit_vec::BitVec::from_elem(entries.len() * bitcnt as usize, false);
    for (i, entry) in entries.iter().enumerate() {
        if let RecValue::Inline(v) = &entry.value {
            let byte = v.first().copied().unwrap_or(0);
            for bit in 0..bitcnt as usize {
                let on = byte >> (bitcnt as usize - 1 - bit) & 1 == 1;
                bits.set(i * bitcnt as usize + bit, on);
            }
        }
    }
    writer.put_bytes(&bits.to_bytes());

    let first_recno = entries
        .first()
        .map(|e| e.key.recno())
        .unwrap_or_else(|| page_start_recno(page));
    let cookie = btree
        .block
        .write_block(PageType::ColFix, first_recno, writer.as_slice())?;
    Ok(vec![RecBlock {
        key: RefKey::Recno(first_recno),
        addr: RefAddr {
            cookie,
            is_internal: false,
            recno_or_entries: first_recno,
        },
    }])
}

fn page_start_recno(page: &Arc<Page>) -> u64 {
    match &*page.data.rl() {
        PageData::ColVar(col) => col.start_recno,
        PageData::ColFix(col) => col.start_recno,
        _ => 0,
    }
}

fn flush_run(writer: &mut RecWriter, pending: &mut Option<(Bytes, u64)>) {
    if let Some((value, rle)) = pending.take() {
        cell::pack_value(writer, &value, rle);
    }
}

fn ref_key_of(page: &Arc<Page>) -> RefKey {
    let parent = page.parent.rl();
    if let Some(weak) = &*parent {
        if let Some(ref_) = weak.upgrade() {
            return ref_.key_clone();
        }
    }
    RefKey::Row(Bytes::new())
}

fn pack_row_key(
    btree: &Arc<BTree>,
    writer: &mut RecWriter,
    prev_key: &mut Option<Bytes>,
    key: &Bytes,
    modify: &mut std::sync::MutexGuard<'_, crate::btree::page::PageModify>,
) -> TimberVoid {
    if key.len() as u64 >= btree.cfg.ovfl_threshold {
        let cookie = modify.ovfl.reuse_or_write(&btree.block, key)?;
        cell::pack_key_ovfl(writer, &cookie, key.len() as u64);
        *prev_key = Some(key.clone());
        return Ok(());
    }
    let prefix = match (btree.cfg.prefix_compression, prev_key.as_ref()) {
        (true, Some(prev)) => cell::common_prefix(prev, key),
        _ => 0,
    };
    cell::pack_key(writer, prefix, &key[prefix as usize..]);
    *prev_key = Some(key.clone());
    Ok(())
}

fn pack_leaf_value(
    btree: &Arc<BTree>,
    writer: &mut RecWriter,
    value: &RecValue,
    rle: u64,
    modify: &mut std::sync::MutexGuard<'_, crate::btree::page::PageModify>,
) -> TimberVoid {
    match value {
        RecValue::Inline(v) => {
            if v.len() as u64 >= btree.cfg.ovfl_threshold {
                let cookie = modify.ovfl.reuse_or_write(&btree.block, v)?;
                cell::pack_value_ovfl(writer, &cookie, v.len() as u64, rle);
            } else {
                cell::pack_value(writer, v, rle);
            }
        }
        RecValue::Ovfl { cookie, len } => {
            cell::pack_value_ovfl(writer, cookie, *len, rle);
        }
        RecValue::Deleted => cell::pack_del(writer, rle),
        RecValue::Addr { .. } => {
            return Err(TimberError::panic("address cell on a leaf page"))
        }
    }
    Ok(())
}

fn pack_addr_value(writer: &mut RecWriter, value: &RecValue) -> TimberVoid {
    match value {
        RecValue::Addr {
            cookie,
            is_internal,
            recno_or_entries,
        } => {
            cell::pack_addr(writer, cookie, *is_internal, *recno_or_entries);
            Ok(())
        }
        _ => Err(TimberError::panic("internal page entry without an address")),
    }
}

/// Publish a successful reconciliation: free the old backing block,
/// resolve overflow tracking, install the new address, and (for
/// eviction) discard or reinstantiate the in-memory page.
///
/// A failure in here is fatal: new blocks are already on disk and
/// partially published state cannot be unwound.
pub fn finish_reconcile(
    btree: &Arc<BTree>,
    session: &SessionInner,
    ref_: &Arc<PageRef>,
    page: &Arc<Page>,
    result: RecResult,
    evict: bool,
) -> TimberVoid {
    let out = finish_inner(btree, session, ref_, page, result, evict);
    if let Err(e) = out {
        return Err(TimberError::panic(format!(
            "reconciliation publish failed: {}",
            e
        )));
    }
    Ok(())
}

fn finish_inner(
    btree: &Arc<BTree>,
    session: &SessionInner,
    ref_: &Arc<PageRef>,
    page: &Arc<Page>,
    result: RecResult,
    evict: bool,
) -> TimberVoid {
    // the old image is superseded; freeing it lands on the discard
    // list and resolves at the next checkpoint
    {
        let mut modify = page.modify.lock().unwrap();
        if let Some(old) = modify.disk_cookie.take() {
            btree.block.free_cookie(&old)?;
        }
        modify.ovfl.commit(&btree.block)?;
    }

    let single = result.blocks.len() == 1;
    if single {
        let block = &result.blocks[0];
        *ref_.addr.wl() = Some(block.addr);
        if !evict {
            page.modify.lock().unwrap().disk_cookie = Some(block.addr.cookie);
            if !result.leave_dirty {
                session.cache.mark_clean(page);
            }
            return Ok(());
        }

        // eviction of a single-block page
        session.cache.mark_clean(page);
        if result.invisible.is_empty() {
            *ref_.page.wl() = None;
            ref_.set_state(RefState::Disk);
            session.cache.page_out(page.footprint(), false);
        } else {
            // bring a fresh page up from the just-written image and
            // re-attach the chains the image could not include
            let (header, payload) = btree.block.read_block(&block.addr.cookie)?;
            let fix_bits = match btree.store {
                Store::ColFix(bits) => bits,
                _ => 0,
            };
            let fresh = Page::from_image(&header, &payload, &btree.block, fix_bits)?;
            fresh.modify.lock().unwrap().disk_cookie = Some(block.addr.cookie);
            reattach_invisible(btree, &fresh, &result.invisible)?;
            crate::btree::page::link_child(ref_, &fresh);
            session.cache.page_out(page.footprint(), false);
            session.cache.page_in(fresh.footprint());
            session.cache.mark_dirty(&fresh);
            ref_.set_state(RefState::Mem);
        }
        return Ok(());
    }

    // multi-block: the page splits into one ref per block
    debug!(
        "{}: page split into {} blocks at reconciliation",
        btree.uri,
        result.blocks.len()
    );
    let was_footprint = page.footprint();
    session.cache.mark_clean(page);
    let block_refs: Vec<(RefKey, RefAddr)> = result
        .blocks
        .iter()
        .map(|b| (clone_ref_key(&b.key), b.addr))
        .collect();
    split::split_evict(btree, session, ref_, block_refs)?;
    session.cache.page_out(was_footprint, false);

    if !result.invisible.is_empty() {
        reattach_scattered(btree, session, &result.invisible)?;
    }
    Ok(())
}

fn clone_ref_key(key: &RefKey) -> RefKey {
    match key {
        RefKey::Row(k) => RefKey::Row(k.clone()),
        RefKey::Recno(r) => RefKey::Recno(*r),
    }
}

/// Re-attach invisible update chains onto a freshly instantiated
/// replacement page (single-block eviction).
fn reattach_invisible(
    btree: &Arc<BTree>,
    page: &Arc<Page>,
    invisible: &[(SearchKey, UpdChain)],
) -> TimberVoid {
    let mut data = page.data.wl();
    for (key, chain) in invisible {
        match (&mut *data, key) {
            (PageData::RowLeaf(leaf), SearchKey::Row(key)) => {
                let cmp = |a: &Bytes, b: &Bytes| btree.compare(a, b);
                match leaf.rows.binary_search_by(|row| btree.compare(&row.key, key)) {
                    Ok(slot) => leaf.rows[slot].upd = chain.clone(),
                    Err(ins) => {
                        let list = if ins == 0 {
                            &mut leaf.insert_smallest
                        } else {
                            &mut leaf.inserts[ins - 1]
                        };
                        let search = list.search_with(key, cmp);
                        if search.found.is_none() {
                            list.insert(&search, key.clone(), chain.clone());
                        }
                    }
                }
            }
            (PageData::ColVar(col), SearchKey::Recno(recno)) => {
                let search = col.updates.search_with(recno, |a, b| a.cmp(b));
                if search.found.is_none() {
                    col.updates.insert(&search, *recno, chain.clone());
                }
            }
            (PageData::ColFix(col), SearchKey::Recno(recno)) => {
                let search = col.updates.search_with(recno, |a, b| a.cmp(b));
                if search.found.is_none() {
                    col.updates.insert(&search, *recno, chain.clone());
                }
            }
            _ => return Err(TimberError::panic("invisible chain shape mismatch")),
        }
        page.incr_mem(128);
    }
    Ok(())
}

/// After a multi-block split the invisible chains may belong to
/// different children; re-insert them through the tree.
fn reattach_scattered(
    btree: &Arc<BTree>,
    session: &SessionInner,
    invisible: &[(SearchKey, UpdChain)],
) -> TimberVoid {
    for (key, chain) in invisible {
        loop {
            let attempt = (|| -> TimberVoid {
                let (target_ref, hazard) =
                    crate::btree::search::descend_to_leaf(btree, session, key)?;
                let page = Arc::clone(&hazard.page);
                reattach_invisible(btree, &page, std::slice::from_ref(&(clone_search_key(key), chain.clone())))?;
                session.cache.mark_dirty(&page);
                session.hazards.release_slot(hazard.slot);
                let _ = target_ref;
                Ok(())
            })();
            match attempt {
                Err(TimberError::Restart) => continue,
                other => break other?,
            }
        }
    }
    Ok(())
}

fn clone_search_key(key: &SearchKey) -> SearchKey {
    match key {
        SearchKey::Row(k) => SearchKey::Row(k.clone()),
        SearchKey::Recno(r) => SearchKey::Recno(*r),
    }
}
