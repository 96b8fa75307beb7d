//! Crash recovery: rebuild the file table from the metadata
//! operations in the log, then replay committed operations onto the
//! files whose checkpoints predate them.

use std::{collections::HashMap, sync::Arc};

use log::{debug, info, warn};

use crate::{
    btree::Cursor,
    database::DbInner,
    error::{TimberError, TimberResult},
    meta,
    txn::{self, log as txn_log},
    wal::{
        record::{LogOp, RecordBody},
        Lsn, ScanStart,
    },
};

struct RecoveredFile {
    uri: String,
    ckpt_lsn: Lsn,
    /// The backing file disappeared (dropped after the last backup);
    /// its operations are skipped.
    missing: bool,
}

/// Run recovery. Returns true when any operation was replayed (the
/// caller then forces a fresh checkpoint).
pub(crate) fn run(db: &Arc<DbInner>) -> TimberResult<bool> {
    let log = match &db.log {
        Some(log) => Arc::clone(log),
        None => return Ok(false),
    };
    let session = db.new_recovery_session();
    let tolerant = db.config.get_string("log.recover", "on") == "salvage";

    // pass 1: metadata only, from the database checkpoint LSN; this
    // rebuilds the file table inside the metadata btree itself
    let meta_tree = db.meta_tree();
    let mut meta_ops = 0u64;
    log.scan(ScanStart::FromCkpt, tolerant, |body, lsn, _next| {
        if let RecordBody::Commit { ops, .. } = body {
            for op in ops {
                if op.file_id() != meta::METADATA_FILE_ID {
                    continue;
                }
                apply_op(&session, &meta_tree, op)?;
                meta_ops += 1;
            }
        }
        let _ = lsn;
        Ok(true)
    })?;

    // the recovered metadata tells us which files exist and where
    // each one's checkpoint sits
    let mut files: HashMap<u32, RecoveredFile> = HashMap::new();
    let mut max_file_id = meta::METADATA_FILE_ID;
    for (uri, config) in meta::meta_list(&db.meta_session(), &meta_tree)? {
        if !uri.starts_with("file:") {
            continue;
        }
        let file_id = config.get_u32("id", 0);
        max_file_id = max_file_id.max(file_id);
        let ckpt_lsn = config
            .get_pair("checkpoint_lsn")
            .map(|(f, o)| Lsn::new(f as u32, o))
            .unwrap_or_else(Lsn::zero);
        let missing = !db.file_exists(&uri);
        if missing {
            warn!("{} is in the metadata but its file is gone", uri);
        }
        files.insert(
            file_id,
            RecoveredFile {
                uri,
                ckpt_lsn,
                missing,
            },
        );
    }
    db.next_file_id.store(
        max_file_id + 1,
        std::sync::atomic::Ordering::SeqCst,
    );

    // pass 2: replay from the oldest per-file checkpoint
    let start = files
        .values()
        .filter(|f| !f.missing)
        .map(|f| f.ckpt_lsn)
        .min()
        .unwrap_or_else(Lsn::zero);
    let start = if start.is_zero() {
        ScanStart::First
    } else {
        ScanStart::At(start)
    };

    // recovery runs inside one snapshot transaction
    {
        let mut guard = session.txn.lock().unwrap();
        txn::begin(&session.txn_global, &mut guard, &session.txn_shared)?;
    }

    let mut replayed = 0u64;
    let replay_result = log.scan(start, tolerant, |body, lsn, _next| {
        if let RecordBody::Commit { ops, .. } = body {
            for op in ops {
                let file_id = op.file_id();
                if file_id == meta::METADATA_FILE_ID {
                    continue;
                }
                let file = match files.get(&file_id) {
                    Some(file) => file,
                    None => {
                        debug!("op for unknown file {} at {}, skipped", file_id, lsn);
                        continue;
                    }
                };
                if file.missing || lsn < file.ckpt_lsn {
                    continue;
                }
                let tree = db.open_btree(&file.uri, None)?;
                apply_op(&session, &tree, op)?;
                replayed += 1;

                // a replay bigger than the cache must not pin the
                // oldest snapshot forever; nothing else runs during
                // recovery, so batched commits stay invisible
                if replayed % 5000 == 0 {
                    txn_log::commit_session(&session)?;
                    let mut guard = session.txn.lock().unwrap();
                    txn::begin(&session.txn_global, &mut guard, &session.txn_shared)?;
                }
            }
        }
        Ok(true)
    });

    match replay_result {
        Ok(()) => {
            txn_log::commit_session(&session)?;
        }
        Err(e) => {
            let _ = txn_log::rollback_session(&session);
            return Err(e);
        }
    }

    if meta_ops + replayed > 0 {
        info!(
            "recovery replayed {} metadata and {} data operations",
            meta_ops, replayed
        );
    }
    Ok(meta_ops + replayed > 0)
}

/// Apply one logged operation to a btree. The session carries no log,
/// so nothing is re-logged.
fn apply_op(
    session: &Arc<crate::session::SessionInner>,
    tree: &Arc<crate::btree::BTree>,
    op: &LogOp,
) -> TimberResult<()> {
    let mut cursor = Cursor::new(Arc::clone(session), Arc::clone(tree));
    let result = match op {
        LogOp::RowPut { key, value, .. } => cursor.put(key, value, true),
        LogOp::RowRemove { key, .. } => match cursor.remove(key) {
            Err(TimberError::NotFound) => Ok(()),
            other => other,
        },
        LogOp::RowTruncate { start, stop, .. } => {
            let start = if start.is_empty() { None } else { Some(&start[..]) };
            let stop = if stop.is_empty() { None } else { Some(&stop[..]) };
            cursor.truncate(start, stop)
        }
        LogOp::ColPut { recno, value, .. } => cursor.put_recno(*recno, value, true),
        LogOp::ColRemove { recno, .. } => match cursor.remove_recno(*recno) {
            Err(TimberError::NotFound) => Ok(()),
            other => other,
        },
        LogOp::ColTruncate { start, stop, .. } => cursor.truncate_recno(*start, *stop),
    };
    result
}

impl DbInner {
    fn file_exists(&self, uri: &str) -> bool {
        uri.strip_prefix("file:")
            .map(|name| self.home.join(name).exists())
            .unwrap_or(false)
    }
}
