//! Checkpoint: an atomic, consistent snapshot of every open btree,
//! published through the metadata table and the base record.

use std::sync::Arc;

use log::{debug, info};

use crate::{
    block::BlockCheckpoint,
    btree::{
        page::{PageData, PageRef, RefState},
        reconcile, BTree,
    },
    database::DbInner,
    error::{TimberError, TimberResult, TimberVoid},
    meta,
    session::SessionInner,
    txn::SyncPolicy,
    utils::HandyRwLock,
    wal::{record::RecordBody, Lsn},
};

/// Take a database-wide checkpoint.
pub(crate) fn run(db: &Arc<DbInner>) -> TimberVoid {
    // 1. no schema changes while the handle list is walked
    let _schema = db.schema_lock.lock().unwrap();
    let session = db.internal_session();

    // 2. the participating btrees, metadata last
    let trees: Vec<Arc<BTree>> = db.dhandles.rl().values().cloned().collect();

    // 3. the prepare record fixes the checkpoint LSN
    let prepare_lsn = match &db.log {
        Some(log) => log.write(
            &RecordBody::Message {
                text: "checkpoint.prepare".to_string(),
            },
            SyncPolicy::None,
        )?,
        None => Lsn::zero(),
    };

    // 4. everything the checkpoint writes is what was committed when
    // the snapshot is taken
    {
        let mut txn = session.txn.lock().unwrap();
        if txn.running {
            return Err(TimberError::Busy);
        }
        session.txn_global.get_snapshot(&mut txn, &session.txn_shared);
    }

    let result = run_under_snapshot(db, &session, &trees, prepare_lsn);

    {
        let mut txn = session.txn.lock().unwrap();
        session
            .txn_global
            .release_snapshot(&mut txn, &session.txn_shared);
    }
    db.guard(result)?;

    // 10. the log before the checkpoint LSN is now redundant
    if let Some(log) = &db.log {
        log.set_ckpt_lsn(prepare_lsn);
        log.archive()?;
    }
    if let Some(handler) = &*db.event_handler.rl() {
        handler.handle_message(&format!("checkpoint complete at {}", prepare_lsn));
    }
    info!("checkpoint complete at {}", prepare_lsn);
    Ok(())
}

fn run_under_snapshot(
    db: &Arc<DbInner>,
    session: &Arc<SessionInner>,
    trees: &[Arc<BTree>],
    prepare_lsn: Lsn,
) -> TimberVoid {
    let meta_tree = db.meta_tree();
    let meta_session = db.meta_session();

    // 5/6/7. flush each tree bottom-up and stage its block checkpoint
    let mut staged: Vec<(Arc<BTree>, BlockCheckpoint)> = Vec::new();
    for tree in trees {
        let ckpt = checkpoint_tree(db, session, tree)?;
        meta::meta_set_checkpoint(&meta_session, &meta_tree, &tree.uri, &ckpt, prepare_lsn)?;
        staged.push((Arc::clone(tree), ckpt));
    }

    // 8. the metadata table is a btree too; checkpoint it and publish
    // through the base record
    let meta_ckpt = checkpoint_tree(db, session, &meta_tree)?;
    meta::write_base(
        &db.home,
        &meta::BaseRecord {
            meta_ckpt: Some(meta_ckpt.clone()),
            ckpt_lsn: prepare_lsn,
        },
    )?;

    // 9. mark the checkpoint complete in the log
    if let Some(log) = &db.log {
        log.write(
            &RecordBody::Checkpoint {
                prepare: prepare_lsn,
            },
            SyncPolicy::Fsync,
        )?;
    }

    // the new checkpoint is durable; retained extents become free and
    // file tails shrink
    for (tree, ckpt) in staged {
        tree.block.checkpoint_resolve(&ckpt)?;
    }
    meta_tree.block.checkpoint_resolve(&meta_ckpt)?;
    Ok(())
}

/// Reconcile one tree bottom-up and write its block checkpoint. The
/// root may split while being written; keep reconciling until it
/// comes back as a single block.
pub(crate) fn checkpoint_tree(
    db: &Arc<DbInner>,
    session: &Arc<SessionInner>,
    tree: &Arc<BTree>,
) -> TimberResult<BlockCheckpoint> {
    tree.ckpt_active
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let result = (|| {
        sync_tree(db, session, tree)?;

        let root = tree.root_ref();
        let root_cookie = (*root.addr.rl()).map(|addr| addr.cookie);
        tree.block.checkpoint(root_cookie)
    })();
    tree.ckpt_active
        .store(false, std::sync::atomic::Ordering::SeqCst);
    debug!("checkpointed {}", tree.uri);
    result
}

/// Write back every dirty page of a tree, leaves first.
pub(crate) fn sync_tree(
    db: &Arc<DbInner>,
    session: &Arc<SessionInner>,
    tree: &Arc<BTree>,
) -> TimberVoid {
    loop {
        let root = tree.root_ref();
        sync_subtree(db, session, tree, &root)?;

        // a multi-block root reconciliation replaced the root with a
        // fresh internal page; go around again until it fits
        let root_now = tree.root_ref();
        let done = {
            match root_now.state() {
                RefState::Mem => match root_now.page() {
                    Some(page) => !page.is_dirty(),
                    None => true,
                },
                _ => true,
            }
        };
        if done {
            return Ok(());
        }
    }
}

fn sync_subtree(
    db: &Arc<DbInner>,
    session: &Arc<SessionInner>,
    tree: &Arc<BTree>,
    ref_: &Arc<PageRef>,
) -> TimberVoid {
    if ref_.state() != RefState::Mem {
        return Ok(());
    }
    let page = match ref_.page() {
        Some(page) => page,
        None => return Ok(()),
    };

    // children first so parent address cells see fresh cookies
    if page.is_internal() {
        let children: Vec<Arc<PageRef>> = {
            let data = page.data.rl();
            match &*data {
                PageData::RowInt(int) | PageData::ColInt(int) => {
                    int.index.iter().cloned().collect()
                }
                _ => Vec::new(),
            }
        };
        for child in children {
            sync_subtree(db, session, tree, &child)?;
        }
    }

    let needs_write = page.is_dirty() || ref_.addr.rl().is_none();
    if !needs_write {
        return Ok(());
    }

    let mut spins = 0;
    loop {
        let result = {
            let rec_txn = session.txn.lock().unwrap();
            reconcile::reconcile(tree, &page, &rec_txn)
        };
        match result {
            Ok(out) => {
                reconcile::finish_reconcile(tree, session, ref_, &page, out, false)?;
                return Ok(());
            }
            Err(TimberError::Busy) => {
                spins += 1;
                if spins > 1000 {
                    return Err(TimberError::Busy);
                }
                std::thread::yield_now();
            }
            Err(e) => return Err(e),
        }
    }
}
