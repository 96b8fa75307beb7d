use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use log::{debug, info, warn};

use crate::{
    block::{
        ext::{overlap_resolve, ExtList},
        io::{
            build_desc, build_image, check_desc, parse_image, Compressor, Cookie, PageHeader,
            PageType, PAGE_HEADER_SIZE,
        },
    },
    error::{TimberError, TimberResult, TimberVoid},
    io::{Decodeable, Encodeable, RecReader, RecWriter, TimberFile},
};

/// The four live extent lists, all mutated under the single `live`
/// lock.
struct Live {
    /// Free extents, allocation source.
    avail: ExtList,
    /// Extents allocated in the current checkpoint.
    alloc: ExtList,
    /// Extents freed in the current checkpoint but belonging to the
    /// previous one.
    discard: ExtList,
    /// Extents freed across checkpoints but retained for the current
    /// one.
    ckpt_avail: ExtList,
}

impl Live {
    fn new() -> Self {
        Self {
            avail: ExtList::new("live.avail", true),
            alloc: ExtList::new("live.alloc", false),
            discard: ExtList::new("live.discard", false),
            ckpt_avail: ExtList::new("live.ckpt_avail", false),
        }
    }
}

/// Everything needed to reopen one checkpoint of one file: the root
/// page plus the serialized extent lists, and the file size the
/// checkpoint was taken at.
#[derive(Debug, Clone, Default)]
pub struct BlockCheckpoint {
    pub root: Option<Cookie>,
    pub alloc: Option<Cookie>,
    pub avail: Option<Cookie>,
    pub discard: Option<Cookie>,
    pub file_size: u64,
}

impl Encodeable for BlockCheckpoint {
    fn encode(&self, writer: &mut RecWriter) {
        for cookie in [&self.root, &self.alloc, &self.avail, &self.discard].iter() {
            match cookie {
                Some(c) => {
                    writer.put_u8(1);
                    writer.write(c);
                }
                None => writer.put_u8(0),
            }
        }
        writer.put_uvarint(self.file_size);
    }
}

impl Decodeable for BlockCheckpoint {
    fn decode(reader: &mut RecReader<'_>) -> TimberResult<Self> {
        let mut cookies = [None, None, None, None];
        for slot in cookies.iter_mut() {
            if reader.get_u8()? != 0 {
                *slot = Some(Cookie::decode(reader)?);
            }
        }
        Ok(Self {
            root: cookies[0],
            alloc: cookies[1],
            avail: cookies[2],
            discard: cookies[3],
            file_size: reader.get_uvarint()?,
        })
    }
}

impl BlockCheckpoint {
    pub fn to_hex(&self) -> String {
        let mut writer = RecWriter::new();
        self.encode(&mut writer);
        hex::encode(writer.as_slice())
    }

    pub fn from_hex(raw: &str) -> TimberResult<Self> {
        let bytes =
            hex::decode(raw).map_err(|e| TimberError::corrupt(format!("bad checkpoint: {}", e)))?;
        BlockCheckpoint::decode(&mut RecReader::new(&bytes))
    }
}

/// A block found by salvage: a checksum-valid page image somewhere in
/// the file.
pub struct SalvageBlock {
    pub cookie: Cookie,
    pub page_type: PageType,
    pub write_gen: u64,
}

/// Per-file block manager: extent allocation inside a single file plus
/// checkpoint-time extent bookkeeping.
pub struct BlockManager {
    file: TimberFile,
    pub alloc_unit: u64,
    first_fit: bool,
    compressor: Option<Arc<dyn Compressor>>,
    live: Mutex<Live>,
    write_gen: AtomicU64,
    /// Extent-list blocks of the previous checkpoint, freed when the
    /// next checkpoint starts.
    prev_ckpt: Mutex<Option<BlockCheckpoint>>,
}

impl BlockManager {
    /// Open (or create) the file backing one btree.
    pub fn open<P: AsRef<Path>>(
        path: P,
        alloc_unit: u64,
        first_fit: bool,
        compressor: Option<Arc<dyn Compressor>>,
        create: bool,
    ) -> TimberResult<Self> {
        assert!(alloc_unit.is_power_of_two() && alloc_unit >= 512);
        let file = TimberFile::open(&path, create)?;

        if file.size() == 0 {
            if !create {
                return Err(TimberError::NotFound);
            }
            file.write_at(0, &build_desc(alloc_unit))?;
            file.sync()?;
            debug!("created block file {:?}", path.as_ref());
        } else {
            let mut desc = vec![0u8; alloc_unit as usize];
            file.read_at(0, &mut desc)?;
            check_desc(&desc, alloc_unit)?;
        }

        Ok(Self {
            file,
            alloc_unit,
            first_fit,
            compressor,
            live: Mutex::new(Live::new()),
            write_gen: AtomicU64::new(1),
            prev_ckpt: Mutex::new(None),
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file.size()
    }

    pub fn compressor(&self) -> Option<&Arc<dyn Compressor>> {
        self.compressor.as_ref()
    }

    pub fn next_write_gen(&self) -> u64 {
        self.write_gen.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Load the live state from a checkpoint: the avail list is read
    /// back, alloc/discard start empty.
    pub fn checkpoint_load(&self, ckpt: &BlockCheckpoint) -> TimberVoid {
        if self.file.size() > ckpt.file_size && ckpt.file_size != 0 {
            // a crash between publish and truncate leaves garbage past
            // the checkpointed size
            warn!(
                "{:?}: truncating {} trailing bytes",
                self.file.path(),
                self.file.size() - ckpt.file_size
            );
            self.file.truncate(ckpt.file_size)?;
        }

        let mut live = self.live.lock().unwrap();
        *live = Live::new();
        if let Some(avail) = &ckpt.avail {
            let (_, payload) = self.read_block(avail)?;
            live.avail
                .read_from(&mut RecReader::new(&payload), self.alloc_unit)?;
        }
        self.write_gen.store(
            self.write_gen.load(Ordering::SeqCst).max(1),
            Ordering::SeqCst,
        );
        *self.prev_ckpt.lock().unwrap() = Some(ckpt.clone());
        Ok(())
    }

    /// Allocate `size` bytes (an allocation-unit multiple), extending
    /// the file if no free extent fits.
    pub fn alloc(&self, size: u64) -> TimberResult<u64> {
        assert!(size > 0 && size % self.alloc_unit == 0);
        let mut live = self.live.lock().unwrap();

        let choice = if self.first_fit {
            live.avail.first_fit(size)
        } else {
            live.avail.best_fit(size)
        };

        let off = match choice {
            Some((off, ext_size)) => {
                let removed = live.avail.remove_range(off, ext_size)?;
                debug_assert!(removed);
                if ext_size > size {
                    live.avail.merge(off + size, ext_size - size)?;
                }
                off
            }
            None => {
                let off = self.file.extend(self.file.size() + size)? as u64;
                debug!(
                    "{:?}: extend file to {} for {} byte alloc",
                    self.file.path(),
                    off + size,
                    size
                );
                off
            }
        };

        live.alloc.merge(off, size)?;
        Ok(off)
    }

    /// Return a range to the free pool. Ranges allocated in the
    /// current checkpoint rejoin the avail list directly; ranges from
    /// prior checkpoints must wait on the discard list.
    pub fn free(&self, off: u64, size: u64) -> TimberVoid {
        assert!(off % self.alloc_unit == 0 && size % self.alloc_unit == 0);
        let mut live = self.live.lock().unwrap();
        if live.alloc.remove_range(off, size)? {
            live.avail.merge(off, size)
        } else {
            live.discard.merge(off, size)
        }
    }

    pub fn free_cookie(&self, cookie: &Cookie) -> TimberVoid {
        self.free(cookie.off, cookie.size as u64)
    }

    /// Write a page image and return its address cookie.
    pub fn write_block(
        &self,
        page_type: PageType,
        recno_or_entries: u64,
        payload: &[u8],
    ) -> TimberResult<Cookie> {
        let compressor = if page_type == PageType::BlockMgr {
            // extent lists must be readable before plug-ins are wired up
            None
        } else {
            self.compressor.as_deref()
        };
        let (image, checksum) = build_image(
            page_type,
            recno_or_entries,
            self.next_write_gen(),
            payload,
            compressor,
            self.alloc_unit,
        )?;
        let off = self.alloc(image.len() as u64)?;
        self.file.write_at(off, &image)?;
        Ok(Cookie {
            off,
            size: image.len() as u32,
            checksum,
        })
    }

    /// Write a page image whose payload the raw-compression callback
    /// already compressed.
    pub fn write_block_raw(
        &self,
        page_type: PageType,
        recno_or_entries: u64,
        compressed: &[u8],
        mem_len: usize,
    ) -> TimberResult<Cookie> {
        let (image, checksum) = crate::block::io::build_image_precompressed(
            page_type,
            recno_or_entries,
            self.next_write_gen(),
            compressed,
            mem_len,
            self.alloc_unit,
        )?;
        let off = self.alloc(image.len() as u64)?;
        self.file.write_at(off, &image)?;
        Ok(Cookie {
            off,
            size: image.len() as u32,
            checksum,
        })
    }

    /// Read and verify the block at `cookie`; returns the page header
    /// and the decompressed payload.
    pub fn read_block(&self, cookie: &Cookie) -> TimberResult<(PageHeader, Vec<u8>)> {
        let mut image = vec![0u8; cookie.size as usize];
        self.file.read_at(cookie.off, &mut image)?;
        parse_image(&image, cookie, self.compressor.as_deref())
    }

    fn write_extlist(&self, live: &mut Live, which: Which) -> TimberResult<Option<Cookie>> {
        let mut writer = RecWriter::new();
        {
            let (list, additional) = match which {
                Which::Alloc => (&live.alloc, None),
                Which::Discard => (&live.discard, None),
                Which::Avail => (&live.avail, Some(&live.ckpt_avail)),
            };
            if list.is_empty() && additional.map_or(true, |a| a.is_empty()) {
                return Ok(None);
            }
            // the avail list is written together with the blocks freed
            // across checkpoints but retained for this one
            match additional {
                None => list.write_to(&mut writer),
                Some(extra) => {
                    let mut union = ExtList::new("live.avail.union", false);
                    for (off, size) in list.iter().chain(extra.iter()) {
                        union.merge(off, size)?;
                    }
                    union.write_to(&mut writer);
                }
            }
        }

        // allocate by hand: alloc() mutates the lists being serialized
        let payload = writer.into_bytes();
        let disk_size = ((PAGE_HEADER_SIZE + payload.len()) as u64 + self.alloc_unit - 1)
            / self.alloc_unit
            * self.alloc_unit;
        let off = match if self.first_fit {
            live.avail.first_fit(disk_size)
        } else {
            live.avail.best_fit(disk_size)
        } {
            Some((off, ext_size)) => {
                live.avail.remove_range(off, ext_size)?;
                if ext_size > disk_size {
                    live.avail.merge(off + disk_size, ext_size - disk_size)?;
                }
                off
            }
            None => self.file.extend(self.file.size() + disk_size)?,
        };
        live.alloc.merge(off, disk_size)?;

        let (image, checksum) = build_image(
            PageType::BlockMgr,
            0,
            self.next_write_gen(),
            &payload,
            None,
            self.alloc_unit,
        )?;
        self.file.write_at(off, &image)?;
        Ok(Some(Cookie {
            off,
            size: image.len() as u32,
            checksum,
        }))
    }

    /// Checkpoint the file: resolve the alloc/discard overlap, persist
    /// the extent lists, and return the checkpoint record for the
    /// metadata table. The caller completes the checkpoint with
    /// `checkpoint_resolve` once the record is published.
    pub fn checkpoint(&self, root: Option<Cookie>) -> TimberResult<BlockCheckpoint> {
        let mut live = self.live.lock().unwrap();

        // the previous checkpoint's extent-list blocks die with it
        if let Some(prev) = self.prev_ckpt.lock().unwrap().take() {
            for cookie in [&prev.alloc, &prev.avail, &prev.discard].iter() {
                if let Some(c) = cookie {
                    if live.alloc.remove_range(c.off, c.size as u64)? {
                        live.avail.merge(c.off, c.size as u64)?;
                    } else {
                        live.discard.merge(c.off, c.size as u64)?;
                    }
                }
            }
        }

        let discard_cookie = self.write_extlist(&mut live, Which::Discard)?;

        let live = &mut *live;
        overlap_resolve(&mut live.alloc, &mut live.discard, &mut live.ckpt_avail)?;

        // what the previous checkpoint freed becomes free once this
        // checkpoint is the live one
        let discards: Vec<(u64, u64)> = live.discard.iter().collect();
        for (off, size) in discards {
            live.discard.remove_range(off, size)?;
            live.ckpt_avail.merge(off, size)?;
        }

        let alloc_cookie = self.write_extlist(&mut *live, Which::Alloc)?;
        let avail_cookie = self.write_extlist(&mut *live, Which::Avail)?;

        self.file.sync()?;

        let ckpt = BlockCheckpoint {
            root,
            alloc: alloc_cookie,
            avail: avail_cookie,
            discard: discard_cookie,
            file_size: self.file.size(),
        };
        info!(
            "{:?}: checkpoint, root {:?}, file size {}",
            self.file.path(),
            ckpt.root,
            ckpt.file_size
        );
        Ok(ckpt)
    }

    /// Second half of a checkpoint, called after the checkpoint record
    /// is durably published: fold the retained extents back into the
    /// free pool and give back any free tail of the file.
    pub fn checkpoint_resolve(&self, ckpt: &BlockCheckpoint) -> TimberVoid {
        let mut live = self.live.lock().unwrap();

        let retained: Vec<(u64, u64)> = live.ckpt_avail.iter().collect();
        for (off, size) in retained {
            live.ckpt_avail.remove_range(off, size)?;
            live.avail.merge(off, size)?;
        }
        live.alloc = ExtList::new("live.alloc", false);
        live.discard = ExtList::new("live.discard", false);

        *self.prev_ckpt.lock().unwrap() = Some(ckpt.clone());

        // truncate_tail: give the tail of the file back to the file
        // system when the last avail extent reaches end-of-file
        if let Some((off, size)) = live.avail.last_extent() {
            if off + size == self.file.size() {
                live.avail.remove_range(off, size)?;
                self.file.truncate(off)?;
                debug!("{:?}: truncated tail to {}", self.file.path(), off);
            }
        }
        Ok(())
    }

    pub fn sync(&self) -> TimberVoid {
        self.file.sync()
    }

    /// Salvage: ignore all extent bookkeeping and rebuild the avail
    /// list by scanning the file for checksum-valid page images.
    /// Returns the valid blocks found, newest write generations last.
    pub fn salvage(&self) -> TimberResult<Vec<SalvageBlock>> {
        let file_size = self.file.size();
        let mut valid = Vec::new();
        let mut allocated = ExtList::new("salvage.allocated", false);

        let mut off = self.alloc_unit;
        while off < file_size {
            match self.try_read_any(off, file_size) {
                Some((header, checksum)) => {
                    let size = header.disk_size as u64;
                    allocated.merge(off, size)?;
                    valid.push(SalvageBlock {
                        cookie: Cookie {
                            off,
                            size: header.disk_size,
                            checksum,
                        },
                        page_type: header.page_type,
                        write_gen: header.write_gen,
                    });
                    off += size;
                }
                None => {
                    debug!("salvage: skipping unreadable unit at {}", off);
                    off += self.alloc_unit;
                }
            }
        }
        valid.sort_by_key(|b| b.write_gen);

        // the avail list is the complement of the valid blocks
        let mut live = self.live.lock().unwrap();
        *live = Live::new();
        let mut cursor = self.alloc_unit;
        for (aoff, asize) in allocated.iter() {
            if aoff > cursor {
                live.avail.merge(cursor, aoff - cursor)?;
            }
            cursor = aoff + asize;
        }
        if cursor < file_size {
            live.avail.merge(cursor, file_size - cursor)?;
        }
        *self.prev_ckpt.lock().unwrap() = None;

        info!(
            "{:?}: salvage found {} valid blocks, {} free bytes",
            self.file.path(),
            valid.len(),
            live.avail.bytes
        );
        Ok(valid)
    }

    /// Attempt to parse a block starting at `off`; `None` when the
    /// bytes there do not form a checksum-valid image.
    fn try_read_any(&self, off: u64, file_size: u64) -> Option<(PageHeader, u32)> {
        let mut head = vec![0u8; self.alloc_unit as usize];
        self.file.read_at(off, &mut head).ok()?;
        let header = PageHeader::from_bytes(&head).ok()?;
        let disk_size = header.disk_size as u64;
        if disk_size == 0
            || disk_size % self.alloc_unit != 0
            || off + disk_size > file_size
            || (header.mem_size as usize) + PAGE_HEADER_SIZE > disk_size as usize
        {
            return None;
        }

        let mut image = vec![0u8; disk_size as usize];
        self.file.read_at(off, &mut image).ok()?;
        let stored = header.checksum;
        image[24..28].copy_from_slice(&0u32.to_be_bytes());
        if super::io::checksum32(&image) != stored {
            return None;
        }
        Some((header, stored))
    }

    #[cfg(test)]
    pub fn avail_extents(&self) -> Vec<(u64, u64)> {
        self.live.lock().unwrap().avail.iter().collect()
    }
}

#[derive(Clone, Copy)]
enum Which {
    Alloc,
    Avail,
    Discard,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_mgr(dir: &tempfile::TempDir, name: &str) -> BlockManager {
        BlockManager::open(dir.path().join(name), 512, false, None, true).unwrap()
    }

    #[test]
    fn test_write_read_block() {
        let dir = tempdir().unwrap();
        let mgr = open_mgr(&dir, "t.tdb");

        let payload = b"some cells".to_vec();
        let cookie = mgr.write_block(PageType::RowLeaf, 2, &payload).unwrap();
        let (header, body) = mgr.read_block(&cookie).unwrap();
        assert_eq!(header.page_type, PageType::RowLeaf);
        assert_eq!(body, payload);
    }

    #[test]
    fn test_alloc_free_round_trip() {
        let dir = tempdir().unwrap();
        let mgr = open_mgr(&dir, "t.tdb");

        let off1 = mgr.alloc(512).unwrap();
        let off2 = mgr.alloc(1024).unwrap();
        assert_eq!(off1 + 512, off2);

        // freed in the same checkpoint: back on avail, merged
        mgr.free(off1, 512).unwrap();
        mgr.free(off2, 1024).unwrap();
        assert_eq!(mgr.avail_extents(), vec![(off1, 512 + 1024)]);

        // and the space is reused rather than extending the file
        let off3 = mgr.alloc(512).unwrap();
        assert_eq!(off3, off1);
    }

    #[test]
    fn test_checkpoint_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tdb");

        let cookie;
        let ckpt;
        {
            let mgr = BlockManager::open(&path, 512, false, None, true).unwrap();
            cookie = mgr
                .write_block(PageType::RowLeaf, 1, b"root contents")
                .unwrap();
            ckpt = mgr.checkpoint(Some(cookie)).unwrap();
            mgr.checkpoint_resolve(&ckpt).unwrap();
        }

        let hex = ckpt.to_hex();
        let decoded = BlockCheckpoint::from_hex(&hex).unwrap();
        let mgr = BlockManager::open(&path, 512, false, None, false).unwrap();
        mgr.checkpoint_load(&decoded).unwrap();
        let (_, body) = mgr.read_block(&decoded.root.unwrap()).unwrap();
        assert_eq!(body, b"root contents");
    }

    #[test]
    fn test_free_unknown_offset_is_fatal() {
        let dir = tempdir().unwrap();
        let mgr = open_mgr(&dir, "t.tdb");
        let off = mgr.alloc(512).unwrap();
        mgr.free(off, 512).unwrap();
        // not in the alloc list any more, so this lands on discard
        mgr.free(off, 512).unwrap();
        // a third free overlaps the discard extent: fatal
        assert!(mgr.free(off, 512).is_err());
    }

    #[test]
    fn test_salvage_finds_valid_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tdb");
        let c1;
        let c2;
        {
            let mgr = BlockManager::open(&path, 512, false, None, true).unwrap();
            c1 = mgr.write_block(PageType::RowLeaf, 1, b"one").unwrap();
            c2 = mgr.write_block(PageType::RowLeaf, 2, b"two").unwrap();
        }

        // scribble over the second block
        {
            let file = TimberFile::open(&path, false).unwrap();
            file.write_at(c2.off + 40, b"garbage garbage").unwrap();
        }

        let mgr = BlockManager::open(&path, 512, false, None, false).unwrap();
        let found = mgr.salvage().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].cookie, c1);
        // the damaged range is free again
        assert!(!mgr.avail_extents().is_empty());
    }
}
