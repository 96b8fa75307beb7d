//! The merged LSM cursor: iterate all chunks in parallel, newest
//! chunk winning per key.

use std::sync::{atomic::Ordering, Arc};

use bytes::Bytes;

use crate::{
    btree::Cursor,
    error::TimberResult,
    lsm::tree::{decode_value, LsmChunk, LsmTree},
    session::SessionInner,
    utils::HandyRwLock,
};

/// K-way merge over per-chunk cursors ordered newest first. Yields
/// the raw (still tagged) value of the newest chunk holding each key.
pub struct MergeCursor {
    cursors: Vec<Cursor>,
    peeked: Vec<Option<(Bytes, Bytes)>>,
    primed: bool,
}

impl MergeCursor {
    pub fn new(cursors: Vec<Cursor>) -> Self {
        let peeked = (0..cursors.len()).map(|_| None).collect();
        Self {
            cursors,
            peeked,
            primed: false,
        }
    }

    fn prime(&mut self) -> TimberResult<()> {
        for (idx, cursor) in self.cursors.iter_mut().enumerate() {
            self.peeked[idx] = cursor
                .next()?
                .map(|(key, value)| (key.row().clone(), value));
        }
        self.primed = true;
        Ok(())
    }

    pub fn next(&mut self) -> TimberResult<Option<(Bytes, Bytes)>> {
        if !self.primed {
            self.prime()?;
        }

        // smallest key across the peeks
        let min_key: Bytes = match self
            .peeked
            .iter()
            .flatten()
            .map(|(key, _)| key)
            .min()
            .cloned()
        {
            Some(key) => key,
            None => return Ok(None),
        };

        // the newest chunk (lowest index) supplies the value; every
        // cursor sitting on this key steps past it
        let mut chosen: Option<Bytes> = None;
        for idx in 0..self.cursors.len() {
            let matches = matches!(&self.peeked[idx], Some((key, _)) if *key == min_key);
            if !matches {
                continue;
            }
            let (_, value) = self.peeked[idx].take().unwrap();
            if chosen.is_none() {
                chosen = Some(value);
            }
            self.peeked[idx] = self.cursors[idx]
                .next()?
                .map(|(key, value)| (key.row().clone(), value));
        }
        Ok(Some((min_key, chosen.expect("at least one cursor matched"))))
    }
}

/// A full scan over an LSM tree: merged chunks, tombstones filtered,
/// values untagged. Holds reader counts on the chunks it iterates so
/// the drop worker leaves their files alone.
pub struct LsmScan {
    chunks: Vec<Arc<LsmChunk>>,
    merge: MergeCursor,
}

impl LsmScan {
    pub fn open(tree: &LsmTree, session: &Arc<SessionInner>) -> Self {
        let chunks: Vec<Arc<LsmChunk>> = tree.chunks.rl().iter().cloned().collect();
        for chunk in &chunks {
            chunk.readers.fetch_add(1, Ordering::SeqCst);
        }
        let cursors = chunks
            .iter()
            .rev()
            .map(|c| Cursor::new(Arc::clone(session), Arc::clone(&c.btree)))
            .collect();
        Self {
            chunks,
            merge: MergeCursor::new(cursors),
        }
    }

    pub fn next(&mut self) -> TimberResult<Option<(Bytes, Bytes)>> {
        loop {
            match self.merge.next()? {
                Some((key, raw)) => match decode_value(&raw) {
                    Some(value) => return Ok(Some((key, value))),
                    // tombstone: the key is gone
                    None => continue,
                },
                None => return Ok(None),
            }
        }
    }
}

impl Drop for LsmScan {
    fn drop(&mut self) {
        for chunk in &self.chunks {
            chunk.readers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
