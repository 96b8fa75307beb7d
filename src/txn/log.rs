//! Transaction commit and rollback against the write-ahead log.

use log::debug;

use crate::{
    error::{TimberError, TimberVoid},
    session::SessionInner,
    txn,
    wal::record::{LogOp, RecordBody},
};

/// Commit the session's transaction: assemble the operation list into
/// a single commit record, hand it to the log with the session's sync
/// policy, and only then publish the transaction as finished. A log
/// failure rolls the transaction back.
pub fn commit_session(session: &SessionInner) -> TimberVoid {
    let mut guard = session.txn.lock().unwrap();
    if !guard.running {
        return Err(TimberError::Rollback("no transaction running".to_string()));
    }
    if guard.forced_rollback {
        txn::rollback(&session.txn_global, &mut guard, &session.txn_shared);
        return Err(TimberError::Rollback(
            "transaction was rolled back to unstick cache eviction".to_string(),
        ));
    }

    let ops: Vec<LogOp> = guard
        .mods
        .iter()
        .filter_map(|op| op.log.clone())
        .collect();
    if !ops.is_empty() {
        if let Some(log) = &session.log {
            let body = RecordBody::Commit {
                txn_id: guard.id,
                ops,
            };
            let sync = guard.sync;
            if let Err(e) = log.write(&body, sync) {
                txn::rollback(&session.txn_global, &mut guard, &session.txn_shared);
                return Err(e);
            }
        }
    }

    debug!(
        "commit txn {} with {} buffered operations",
        guard.id,
        guard.mods.len()
    );
    txn::commit_finish(&session.txn_global, &mut guard, &session.txn_shared);
    Ok(())
}

/// Roll the session's transaction back: poison its updates and
/// release its snapshot. No log record is written; recovery only
/// replays commits.
pub fn rollback_session(session: &SessionInner) -> TimberVoid {
    let mut guard = session.txn.lock().unwrap();
    if !guard.running {
        return Err(TimberError::Rollback("no transaction running".to_string()));
    }
    debug!("rollback txn {}", guard.id);
    txn::rollback(&session.txn_global, &mut guard, &session.txn_shared);
    Ok(())
}
