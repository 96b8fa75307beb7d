use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc, Mutex, RwLock, Weak,
};

use bytes::Bytes;
use log::{debug, info};

use crate::{
    btree::{BTree, Cursor},
    config::Config,
    database::DbInner,
    error::{TimberError, TimberResult, TimberVoid},
    lsm::bloom::Bloom,
    session::SessionInner,
    utils::HandyRwLock,
};

/// Values inside chunk btrees carry a one-byte tag so a removal can
/// shadow live values in older chunks.
const TAG_TOMBSTONE: u8 = 0;
const TAG_VALUE: u8 = 1;

pub fn encode_value(value: Option<&[u8]>) -> Vec<u8> {
    match value {
        Some(v) => {
            let mut out = Vec::with_capacity(v.len() + 1);
            out.push(TAG_VALUE);
            out.extend_from_slice(v);
            out
        }
        None => vec![TAG_TOMBSTONE],
    }
}

pub fn decode_value(raw: &Bytes) -> Option<Bytes> {
    match raw.first() {
        Some(&TAG_VALUE) => Some(raw.slice(1..)),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct LsmConfig {
    pub chunk_size: u64,
    pub chunk_max: u64,
    pub merge_min: usize,
    pub merge_max: usize,
    pub bloom: bool,
    pub bloom_bit_count: u64,
    pub bloom_hash_count: u32,
    pub chunk_count_limit: usize,
}

impl LsmConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.get_u64("lsm.chunk_size", 10 << 20),
            chunk_max: config.get_u64("lsm.chunk_max", 5 << 30),
            merge_min: config.get_usize("lsm.merge_min", 4),
            merge_max: config.get_usize("lsm.merge_max", 15),
            bloom: config.get_bool("lsm.bloom", true),
            bloom_bit_count: config.get_u64("lsm.bloom_bit_count", 16),
            bloom_hash_count: config.get_u32("lsm.bloom_hash_count", 8),
            chunk_count_limit: config.get_usize("lsm.chunk_count_limit", 0),
        }
    }
}

/// One generation of the LSM stack: a full btree in its own file.
pub struct LsmChunk {
    pub id: u32,
    pub uri: String,
    pub btree: Arc<BTree>,
    pub generation: AtomicU32,
    /// Approximate bytes written into the chunk.
    pub bytes: AtomicU64,
    pub count: AtomicU64,
    /// Transaction id current when this chunk stopped being primary.
    pub switch_txn: AtomicU64,
    /// Chunk contents are durable on disk.
    pub flushed: AtomicBool,
    pub bloom: RwLock<Option<Bloom>>,
    /// Open cursors; the drop worker waits for zero.
    pub readers: AtomicU32,
}

impl LsmChunk {
    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }
}

/// An ordered roster of chunks; the newest (last) is the writable
/// primary.
pub struct LsmTree {
    pub name: String,
    pub cfg: LsmConfig,
    pub(crate) db: Weak<DbInner>,
    pub chunks: RwLock<Vec<Arc<LsmChunk>>>,
    pub old_chunks: Mutex<Vec<Arc<LsmChunk>>>,
    pub next_chunk_id: AtomicU32,
    /// Microseconds each write sleeps so merges keep up.
    pub throttle_us: AtomicU64,
    /// A switch has been queued and not yet serviced.
    pub switch_pending: AtomicBool,
}

impl LsmTree {
    pub(crate) fn create(db: &Arc<DbInner>, uri: &str, config: &Config) -> TimberResult<Arc<Self>> {
        let name = uri
            .strip_prefix("lsm:")
            .ok_or_else(|| TimberError::Config(format!("bad lsm uri {:?}", uri)))?
            .to_string();
        let tree = Arc::new(Self {
            name,
            cfg: LsmConfig::from_config(config),
            db: Arc::downgrade(db),
            chunks: RwLock::new(Vec::new()),
            old_chunks: Mutex::new(Vec::new()),
            next_chunk_id: AtomicU32::new(1),
            throttle_us: AtomicU64::new(0),
            switch_pending: AtomicBool::new(false),
        });
        tree.push_new_chunk(db, 0)?;
        info!("created lsm tree {}", uri);
        Ok(tree)
    }

    fn chunk_uri(&self, id: u32) -> String {
        format!("file:{}-{:06}.lsm", self.name, id)
    }

    fn push_new_chunk(&self, db: &Arc<DbInner>, generation: u32) -> TimberResult<Arc<LsmChunk>> {
        let id = self.next_chunk_id.fetch_add(1, Ordering::SeqCst);
        let uri = self.chunk_uri(id);
        let mut config = Config::new();
        config.set("key_format", "u");
        config.set("value_format", "u");
        // chunk durability comes from flushing whole chunks, not the
        // write-ahead log
        config.set("log.enabled", "false");
        let btree = db.open_btree(&uri, Some(&config))?;

        let chunk = Arc::new(LsmChunk {
            id,
            uri,
            btree,
            generation: AtomicU32::new(generation),
            bytes: AtomicU64::new(0),
            count: AtomicU64::new(0),
            switch_txn: AtomicU64::new(0),
            flushed: AtomicBool::new(false),
            bloom: RwLock::new(None),
            readers: AtomicU32::new(0),
        });
        self.chunks.wl().push(Arc::clone(&chunk));
        Ok(chunk)
    }

    pub fn primary(&self) -> Arc<LsmChunk> {
        Arc::clone(self.chunks.rl().last().expect("lsm tree has a primary"))
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.rl().len()
    }

    /// The primary outgrew its budget; demote it and start a new one.
    /// Readers decide which chunks their snapshot includes by the
    /// recorded switch transaction.
    pub(crate) fn switch(&self, db: &Arc<DbInner>) -> TimberVoid {
        let old = self.primary();
        if old.bytes.load(Ordering::SeqCst) < self.cfg.chunk_size {
            self.switch_pending.store(false, Ordering::SeqCst);
            return Ok(());
        }
        old.switch_txn
            .store(db.txn_global.current_id(), Ordering::SeqCst);
        self.push_new_chunk(db, 0)?;
        self.switch_pending.store(false, Ordering::SeqCst);
        debug!(
            "lsm {}: switched, chunk {} demoted at {} bytes",
            self.name,
            old.id,
            old.bytes.load(Ordering::SeqCst)
        );
        Ok(())
    }

    pub fn needs_switch(&self) -> bool {
        let primary = self.primary();
        primary.bytes.load(Ordering::SeqCst) >= self.cfg.chunk_size
    }

    pub fn put(
        &self,
        session: &Arc<SessionInner>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> TimberVoid {
        // back-pressure so merges are not starved
        let throttle = self.throttle_us.load(Ordering::SeqCst);
        if throttle > 0 {
            std::thread::sleep(std::time::Duration::from_micros(throttle));
        }

        let primary = self.primary();
        let encoded = encode_value(value);
        let mut cursor = Cursor::new(Arc::clone(session), Arc::clone(&primary.btree));
        cursor.put(key, &encoded, true)?;
        primary
            .bytes
            .fetch_add((key.len() + encoded.len() + 32) as u64, Ordering::SeqCst);
        primary.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn delete(&self, session: &Arc<SessionInner>, key: &[u8]) -> TimberVoid {
        self.put(session, key, None)
    }

    /// Point lookup: newest chunk wins; Bloom filters skip most
    /// chunks that never saw the key.
    pub fn get(&self, session: &Arc<SessionInner>, key: &[u8]) -> TimberResult<Bytes> {
        let chunks: Vec<Arc<LsmChunk>> = self.chunks.rl().iter().cloned().collect();
        for (idx, chunk) in chunks.iter().enumerate().rev() {
            let is_primary = idx + 1 == chunks.len();
            if !is_primary {
                let bloom = chunk.bloom.rl();
                if let Some(bloom) = &*bloom {
                    if !bloom.maybe_contains(key) {
                        continue;
                    }
                }
            }
            let mut cursor = Cursor::new(Arc::clone(session), Arc::clone(&chunk.btree));
            match cursor.search(key) {
                Ok(raw) => {
                    return match decode_value(&raw) {
                        Some(value) => Ok(value),
                        None => Err(TimberError::NotFound),
                    };
                }
                Err(TimberError::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(TimberError::NotFound)
    }

    /// Build a chunk's Bloom filter from its keyset.
    pub fn build_bloom(&self, session: &Arc<SessionInner>, chunk: &Arc<LsmChunk>) -> TimberVoid {
        if !self.cfg.bloom {
            return Ok(());
        }
        let mut bloom = Bloom::new(
            chunk.count.load(Ordering::SeqCst),
            self.cfg.bloom_bit_count,
            self.cfg.bloom_hash_count,
        );
        let mut cursor = Cursor::new(Arc::clone(session), Arc::clone(&chunk.btree));
        let mut keys = 0u64;
        while let Some((key, _)) = cursor.next()? {
            bloom.insert(key.row());
            keys += 1;
        }
        *chunk.bloom.wl() = Some(bloom);
        debug!("lsm {}: bloom built for chunk {} ({} keys)", self.name, chunk.id, keys);
        Ok(())
    }

    /// Select a run of merge candidates: contiguous, flushed,
    /// non-primary chunks of the same generation, oldest first.
    pub fn merge_run(&self) -> Option<Vec<Arc<LsmChunk>>> {
        use itertools::Itertools;

        let chunks = self.chunks.rl();
        if chunks.len() <= 1 {
            return None;
        }
        let db = self.db.upgrade()?;
        let stack = &chunks[..chunks.len() - 1];
        for (_, group) in &stack
            .iter()
            .filter(|c| {
                // readers may still depend on the pre-switch view
                c.is_flushed() && db.txn_global.visible_all(c.switch_txn.load(Ordering::SeqCst))
            })
            .group_by(|c| c.generation.load(Ordering::SeqCst))
        {
            let run: Vec<Arc<LsmChunk>> = group.cloned().collect();
            if run.len() >= self.cfg.merge_min {
                let take = run.len().min(self.cfg.merge_max);
                return Some(run[..take].to_vec());
            }
        }
        None
    }

    /// Merge a run of chunks into one new chunk and retire the
    /// originals to the old-chunks list.
    pub(crate) fn merge(&self, db: &Arc<DbInner>, session: &Arc<SessionInner>) -> TimberVoid {
        let run = match self.merge_run() {
            Some(run) => run,
            None => return Ok(()),
        };
        let generation = run[0].generation.load(Ordering::SeqCst) + 1;

        // does the run reach the bottom of the stack? then tombstones
        // have nothing left to shadow and can be dropped
        let at_bottom = {
            let chunks = self.chunks.rl();
            Arc::ptr_eq(&chunks[0], &run[0])
        };

        let id = self.next_chunk_id.fetch_add(1, Ordering::SeqCst);
        let uri = self.chunk_uri(id);
        let mut config = Config::new();
        config.set("key_format", "u");
        config.set("value_format", "u");
        config.set("log.enabled", "false");
        let btree = db.open_btree(&uri, Some(&config))?;

        let mut bloom = Bloom::new(
            run.iter().map(|c| c.count.load(Ordering::SeqCst)).sum(),
            self.cfg.bloom_bit_count,
            self.cfg.bloom_hash_count,
        );
        let mut out = Cursor::new(Arc::clone(session), Arc::clone(&btree));
        let mut bytes = 0u64;
        let mut count = 0u64;

        // newest-first cursors; the merge keeps the newest value per
        // key
        let mut merged = crate::lsm::cursor::MergeCursor::new(
            run.iter()
                .rev()
                .map(|c| Cursor::new(Arc::clone(session), Arc::clone(&c.btree)))
                .collect(),
        );
        while let Some((key, raw)) = merged.next()? {
            if at_bottom && decode_value(&raw).is_none() {
                continue;
            }
            out.put(&key, &raw, true)?;
            bloom.insert(&key);
            bytes += (key.len() + raw.len() + 32) as u64;
            count += 1;
        }
        drop(merged);
        drop(out);

        let merged_chunk = Arc::new(LsmChunk {
            id,
            uri,
            btree,
            generation: AtomicU32::new(generation),
            bytes: AtomicU64::new(bytes),
            count: AtomicU64::new(count),
            switch_txn: AtomicU64::new(0),
            flushed: AtomicBool::new(false),
            bloom: RwLock::new(if self.cfg.bloom { Some(bloom) } else { None }),
            readers: AtomicU32::new(0),
        });

        // splice: replace the run with the merged chunk
        {
            let mut chunks = self.chunks.wl();
            let start = chunks
                .iter()
                .position(|c| Arc::ptr_eq(c, &run[0]))
                .ok_or(TimberError::Restart)?;
            chunks.splice(start..start + run.len(), vec![Arc::clone(&merged_chunk)]);
        }
        let mut old = self.old_chunks.lock().unwrap();
        old.extend(run.iter().cloned());
        info!(
            "lsm {}: merged {} chunks into chunk {} ({} records)",
            self.name,
            run.len(),
            id,
            count
        );
        Ok(())
    }

    /// Retire old chunks whose files nothing references any more. Old
    /// chunks are kept while a hot backup is in progress.
    pub(crate) fn drop_old_chunks(&self, db: &Arc<DbInner>) -> TimberResult<usize> {
        if db.backup_active.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let mut dropped = 0;
        let mut keep = Vec::new();
        let retired: Vec<Arc<LsmChunk>> = self.old_chunks.lock().unwrap().drain(..).collect();
        for chunk in retired {
            if chunk.readers.load(Ordering::SeqCst) > 0 {
                keep.push(chunk);
                continue;
            }
            db.drop_file_handle(&chunk.uri)?;
            dropped += 1;
        }
        self.old_chunks.lock().unwrap().extend(keep);
        Ok(dropped)
    }

    /// Writers slow down as the on-disk stack grows; merges must not
    /// be starved.
    pub fn update_throttle(&self) {
        let count = self.chunk_count();
        let limit = if self.cfg.chunk_count_limit > 0 {
            self.cfg.chunk_count_limit
        } else {
            self.cfg.merge_max
        };
        let excess = count.saturating_sub(limit) as u64;
        self.throttle_us.store(excess * 1000, Ordering::SeqCst);
    }
}
