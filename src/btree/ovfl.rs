use bytes::Bytes;
use log::debug;

use crate::{
    block::{io::Cookie, BlockManager, PageType},
    btree::skiplist::SkipList,
    error::TimberResult,
};

/// State of one reusable overflow block.
pub struct OvflReuse {
    pub cookie: Cookie,
    pub len: u64,
    /// Referenced by the reconciliation in progress.
    pub in_use: bool,
    /// Written by the reconciliation in progress; on failure these
    /// blocks are the ones to free.
    pub just_added: bool,
}

/// Overflow-item bookkeeping hanging off a page's modify record:
///
/// - `reuse`, keyed by value bytes, deduplicates identical overflow
///   writes within a page across reconciliations;
/// - `txnc`, keyed by block offset, keeps the bytes of freed overflow
///   blocks long enough for snapshot readers that can still see the
///   removed value;
/// - `discard` collects blocks to free when the reconciliation
///   commits.
pub struct OvflTrack {
    pub reuse: SkipList<Bytes, OvflReuse>,
    pub txnc: SkipList<u64, Bytes>,
    pub discard: Vec<Cookie>,
}

impl OvflTrack {
    pub fn new() -> Self {
        Self {
            reuse: SkipList::new(),
            txnc: SkipList::new(),
            discard: Vec::new(),
        }
    }

    /// Get an overflow address for `value`, reusing a block written
    /// for the same bytes earlier if there is one.
    pub fn reuse_or_write(
        &mut self,
        block: &BlockManager,
        value: &Bytes,
    ) -> TimberResult<Cookie> {
        let search = self.reuse.search_with(value, |a, b| a.cmp(b));
        if let Some(idx) = search.found {
            let entry = self.reuse.value_mut(idx);
            entry.in_use = true;
            return Ok(entry.cookie);
        }

        let cookie = block.write_block(PageType::Ovfl, value.len() as u64, value)?;
        debug!(
            "overflow value of {} bytes written at {}/{}",
            value.len(),
            cookie.off,
            cookie.size
        );
        self.reuse.insert(&search, value.clone(), OvflReuse {
            cookie,
            len: value.len() as u64,
            in_use: true,
            just_added: true,
        });
        Ok(cookie)
    }

    /// Schedule a block for freeing at reconciliation commit.
    pub fn discard_later(&mut self, cookie: Cookie) {
        self.discard.push(cookie);
    }

    /// Retain the bytes of an overflow block about to be freed, keyed
    /// by its address, for snapshot readers that still see the value.
    pub fn cache_value(&mut self, off: u64, value: Bytes) {
        let search = self.txnc.search_with(&off, |a, b| a.cmp(b));
        if search.found.is_none() {
            self.txnc.insert(&search, off, value);
        }
    }

    pub fn lookup_cached(&self, off: u64) -> Option<Bytes> {
        let search = self.txnc.search_with(&off, |a, b| a.cmp(b));
        search.found.map(|idx| self.txnc.value(idx).clone())
    }

    /// Commit: free the discard array and expire reuse entries the
    /// new image no longer references.
    pub fn commit(&mut self, block: &BlockManager) -> TimberResult<()> {
        for cookie in self.discard.drain(..) {
            block.free_cookie(&cookie)?;
        }

        let mut stale = Vec::new();
        for (key, entry) in self.reuse.iter() {
            if !entry.in_use {
                stale.push((key.clone(), entry.cookie));
            }
        }
        if !stale.is_empty() {
            let mut rebuilt = SkipList::new();
            for (key, entry) in self.reuse.iter() {
                if entry.in_use {
                    let search = rebuilt.search_with(key, |a: &Bytes, b: &Bytes| a.cmp(b));
                    rebuilt.insert(&search, key.clone(), OvflReuse {
                        cookie: entry.cookie,
                        len: entry.len,
                        in_use: false,
                        just_added: false,
                    });
                }
            }
            self.reuse = rebuilt;
            for (_, cookie) in stale {
                block.free_cookie(&cookie)?;
            }
        } else {
            // clear the round's flags in place
            let keys: Vec<Bytes> = self.reuse.iter().map(|(k, _)| k.clone()).collect();
            for key in keys {
                let search = self.reuse.search_with(&key, |a, b| a.cmp(b));
                if let Some(idx) = search.found {
                    let entry = self.reuse.value_mut(idx);
                    entry.in_use = false;
                    entry.just_added = false;
                }
            }
        }
        Ok(())
    }

    /// Abort: free only the blocks this reconciliation wrote and
    /// forget the discard list.
    pub fn abort(&mut self, block: &BlockManager) -> TimberResult<()> {
        self.discard.clear();
        let mut rebuilt = SkipList::new();
        for (key, entry) in self.reuse.iter() {
            if entry.just_added {
                block.free_cookie(&entry.cookie)?;
            } else {
                let search = rebuilt.search_with(key, |a: &Bytes, b: &Bytes| a.cmp(b));
                rebuilt.insert(&search, key.clone(), OvflReuse {
                    cookie: entry.cookie,
                    len: entry.len,
                    in_use: false,
                    just_added: false,
                });
            }
        }
        self.reuse = rebuilt;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_reuse_deduplicates() {
        let dir = tempdir().unwrap();
        let block =
            BlockManager::open(dir.path().join("o.tdb"), 512, false, None, true).unwrap();
        let mut track = OvflTrack::new();

        let value = Bytes::from(vec![7u8; 2000]);
        let c1 = track.reuse_or_write(&block, &value).unwrap();
        let c2 = track.reuse_or_write(&block, &value).unwrap();
        assert_eq!(c1, c2);

        let other = Bytes::from(vec![8u8; 2000]);
        let c3 = track.reuse_or_write(&block, &other).unwrap();
        assert_ne!(c1, c3);

        // round trip through the block manager
        let (header, payload) = block.read_block(&c1).unwrap();
        assert_eq!(header.page_type, PageType::Ovfl);
        assert_eq!(payload, &value[..]);
    }

    #[test]
    fn test_commit_expires_unused() {
        let dir = tempdir().unwrap();
        let block =
            BlockManager::open(dir.path().join("o.tdb"), 512, false, None, true).unwrap();
        let mut track = OvflTrack::new();

        let value = Bytes::from(vec![7u8; 2000]);
        track.reuse_or_write(&block, &value).unwrap();
        track.commit(&block).unwrap();
        assert_eq!(track.reuse.len(), 1);

        // next round never touches it: commit drops it and frees the
        // block
        track.commit(&block).unwrap();
        assert_eq!(track.reuse.len(), 0);
    }

    #[test]
    fn test_txn_cache() {
        let mut track = OvflTrack::new();
        let value = Bytes::from_static(b"old overflow value");
        track.cache_value(4096, value.clone());
        assert_eq!(track.lookup_cached(4096), Some(value));
        assert_eq!(track.lookup_cached(8192), None);
    }
}
