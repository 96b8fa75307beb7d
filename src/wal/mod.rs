//! The write-ahead log: slot-batched appends, per-commit fsync
//! policy, file rotation with pre-allocation, and the forward scan
//! recovery is built on.

pub mod record;
pub mod recover;

use std::{
    cell::UnsafeCell,
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
};

use log::{debug, info, warn};

use crate::{
    block::io::{checksum32, Compressor},
    error::{TimberError, TimberResult, TimberVoid},
    io::{sync_dir, TimberFile},
    txn::SyncPolicy,
    wal::record::{RecType, RecordBody},
};

pub const LOG_MAGIC: u32 = 0x0010_1064;
pub const LOG_VERSION: u16 = 1;

/// Records are padded to this unit; the description block occupies
/// the first one of every file.
pub const LOG_ALIGN: u64 = 128;
pub const LOG_FIRST_RECORD: u64 = LOG_ALIGN;

const RECORD_HEADER_SIZE: usize = 16;
const SLOT_BUF_SIZE: usize = 256 << 10;

const REC_COMPRESSED: u16 = 0x01;

/// Sync request bits carried on a slot.
const SLOT_SYNC: u32 = 0x01;
const SLOT_SYNC_DIR: u32 = 0x02;

pub const LOG_FILE_PREFIX: &str = "TimberLog.";
pub const PREP_FILE_PREFIX: &str = "TimberPreplog.";
pub const TMP_FILE_PREFIX: &str = "TimberTmplog.";

/// Log sequence number; ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn {
    pub file: u32,
    pub offset: u64,
}

impl Lsn {
    pub const fn new(file: u32, offset: u64) -> Self {
        Self { file, offset }
    }

    pub const fn zero() -> Self {
        Self { file: 0, offset: 0 }
    }

    pub fn is_zero(&self) -> bool {
        self.file == 0 && self.offset == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{})", self.file, self.offset)
    }
}

fn log_file_name(num: u32) -> String {
    format!("{}{:010}", LOG_FILE_PREFIX, num)
}

fn prep_file_name(num: u32) -> String {
    format!("{}{:010}", PREP_FILE_PREFIX, num)
}

fn tmp_file_name(num: u32) -> String {
    format!("{}{:010}", TMP_FILE_PREFIX, num)
}

fn align_up(len: u64) -> u64 {
    (len + LOG_ALIGN - 1) / LOG_ALIGN * LOG_ALIGN
}

/// The slot buffer: writers with disjoint reservations copy into it
/// concurrently, no per-byte lock.
struct SlotBuf {
    buf: UnsafeCell<Box<[u8]>>,
}

// Safety: every writer copies into a byte range it reserved with a
// fetch-add on the slot's join counter, ranges never overlap, and the
// closer reads the buffer only after `released` reaches the final
// join count.
unsafe impl Sync for SlotBuf {}
unsafe impl Send for SlotBuf {}

impl SlotBuf {
    fn new(cap: usize) -> Self {
        Self {
            buf: UnsafeCell::new(vec![0u8; cap].into_boxed_slice()),
        }
    }

    /// Safety: the caller must own the reservation [off, off+len).
    unsafe fn copy_in(&self, off: usize, data: &[u8]) {
        let dst = (*self.buf.get()).as_mut_ptr().add(off);
        std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
    }

    /// Safety: only the closer calls this, after all reservations
    /// released.
    unsafe fn contents(&self, len: usize) -> &[u8] {
        &(&*self.buf.get())[..len]
    }
}

struct LogSlot {
    start_lsn: Lsn,
    fh: Arc<TimberFile>,
    cap: usize,
    buf: SlotBuf,
    /// Bytes reserved by fetch-add; crossing `cap` fails the join.
    joined: AtomicUsize,
    /// Bytes copied in by successful joiners.
    released: AtomicUsize,
    /// Final byte count, set by the closer.
    final_len: AtomicUsize,
    closed: AtomicBool,
    flags: AtomicU32,
}

impl LogSlot {
    fn new(start_lsn: Lsn, fh: Arc<TimberFile>, cap: usize) -> Arc<Self> {
        Arc::new(Self {
            start_lsn,
            fh,
            cap,
            buf: SlotBuf::new(cap),
            joined: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            final_len: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            flags: AtomicU32::new(0),
        })
    }
}

struct LogState {
    active: Arc<LogSlot>,
    fh: Arc<TimberFile>,
    file_num: u32,
    /// Next unreserved byte in the current file.
    alloc_offset: u64,
}

struct OrderState {
    write_lsn: Lsn,
    sync_lsn: Lsn,
}

pub struct LogManager {
    dir: PathBuf,
    file_max: u64,
    prealloc: u32,
    archive_enabled: bool,
    compressor: Option<Arc<dyn Compressor>>,
    state: Mutex<LogState>,
    order: Mutex<OrderState>,
    order_cond: Condvar,
    sync_lock: Mutex<()>,
    /// End-of-file write LSN -> first record LSN of the next file.
    boundaries: Mutex<HashMap<Lsn, Lsn>>,
    ckpt_lsn: Mutex<Lsn>,
    next_prealloc: AtomicU32,
}

impl LogManager {
    pub fn open<P: AsRef<Path>>(
        dir: P,
        file_max: u64,
        prealloc: u32,
        archive_enabled: bool,
        compressor: Option<Arc<dyn Compressor>>,
    ) -> TimberResult<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let file_max = file_max.max(1 << 20);

        // appends go to a fresh file past everything already on disk
        let newest = Self::newest_file_number(&dir)?;
        let file_num = newest + 1;
        let fh = Arc::new(Self::create_log_file(&dir, file_num, file_max, None)?);
        let start = Lsn::new(file_num, LOG_FIRST_RECORD);

        let active = LogSlot::new(start, Arc::clone(&fh), SLOT_BUF_SIZE);
        info!("log opened in {:?}, writing file {}", dir, file_num);

        Ok(Arc::new(Self {
            dir,
            file_max,
            prealloc,
            archive_enabled,
            compressor,
            state: Mutex::new(LogState {
                active,
                fh,
                file_num,
                alloc_offset: LOG_FIRST_RECORD,
            }),
            order: Mutex::new(OrderState {
                write_lsn: start,
                sync_lsn: start,
            }),
            order_cond: Condvar::new(),
            sync_lock: Mutex::new(()),
            boundaries: Mutex::new(HashMap::new()),
            ckpt_lsn: Mutex::new(Lsn::zero()),
            next_prealloc: AtomicU32::new(file_num + 1),
        }))
    }

    fn newest_file_number(dir: &Path) -> TimberResult<u32> {
        let mut newest = 0u32;
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(num) = name.strip_prefix(LOG_FILE_PREFIX) {
                    if let Ok(num) = num.parse::<u32>() {
                        newest = newest.max(num);
                    }
                }
            }
        }
        Ok(newest)
    }

    /// Create (or promote a preallocated file into) log file `num`,
    /// stamped with its description block.
    fn create_log_file(
        dir: &Path,
        num: u32,
        file_max: u64,
        prealloc_from: Option<u32>,
    ) -> TimberResult<TimberFile> {
        let path = dir.join(log_file_name(num));

        if let Some(prep) = prealloc_from {
            let prep_path = dir.join(prep_file_name(prep));
            if prep_path.exists() && std::fs::rename(&prep_path, &path).is_ok() {
                debug!("log file {} renamed from preallocated {}", num, prep);
                let fh = TimberFile::open(&path, false)?;
                sync_dir(dir)?;
                return Ok(fh);
            }
        }

        let fh = TimberFile::open(&path, true)?;
        fh.write_at(0, &Self::build_desc(file_max))?;
        fh.sync()?;
        sync_dir(dir)?;
        Ok(fh)
    }

    fn build_desc(file_max: u64) -> Vec<u8> {
        let mut buf = vec![0u8; LOG_ALIGN as usize];
        buf[0..4].copy_from_slice(&LOG_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&LOG_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&file_max.to_be_bytes());
        let checksum = checksum32(&buf);
        buf[16..20].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    fn check_desc(buf: &[u8]) -> TimberResult<()> {
        let mut u32buf = [0u8; 4];
        u32buf.copy_from_slice(&buf[0..4]);
        if u32::from_be_bytes(u32buf) != LOG_MAGIC {
            return Err(TimberError::corrupt("not a timberdb log file"));
        }
        let mut copy = buf.to_vec();
        u32buf.copy_from_slice(&buf[16..20]);
        let stored = u32::from_be_bytes(u32buf);
        copy[16..20].copy_from_slice(&0u32.to_be_bytes());
        if checksum32(&copy) != stored {
            return Err(TimberError::corrupt("log description block corrupted"));
        }
        Ok(())
    }

    /// Build the on-disk form of a record: 16-byte header, payload,
    /// padding to the allocation unit, checksum stamped in.
    fn build_record(&self, body: &RecordBody) -> Vec<u8> {
        let payload = body.encode_payload();
        let mem_len = payload.len() as u32;
        let mut flags = 0u16;
        let mut stored = payload;

        if let Some(c) = &self.compressor {
            if stored.len() as u64 > LOG_ALIGN {
                let mut dst = Vec::with_capacity(c.pre_size(stored.len()));
                if let Ok(true) = c.compress(&stored, &mut dst) {
                    if dst.len() < stored.len() {
                        flags |= REC_COMPRESSED;
                        stored = dst;
                    }
                }
            }
        }

        let total = align_up((RECORD_HEADER_SIZE + stored.len()) as u64) as usize;
        let mut rec = Vec::with_capacity(total);
        rec.extend_from_slice(&(total as u32).to_be_bytes());
        rec.extend_from_slice(&0u32.to_be_bytes());
        rec.extend_from_slice(&flags.to_be_bytes());
        rec.extend_from_slice(&(body.rectype() as u16).to_be_bytes());
        rec.extend_from_slice(&mem_len.to_be_bytes());
        rec.extend_from_slice(&stored);
        rec.resize(total, 0);

        let checksum = checksum32(&rec);
        rec[4..8].copy_from_slice(&checksum.to_be_bytes());
        rec
    }

    /// Append a record; returns the LSN one past its end. With a sync
    /// policy the call does not return until the record is durable.
    pub fn write(&self, body: &RecordBody, sync: SyncPolicy) -> TimberResult<Lsn> {
        let rec = self.build_record(body);
        let end = if rec.len() > SLOT_BUF_SIZE {
            self.append_large(&rec, sync)?
        } else {
            self.append(&rec, sync)?
        };

        if sync != SyncPolicy::None {
            self.wait_durable(end)?;
        }
        Ok(end)
    }

    fn sync_flag_bits(sync: SyncPolicy) -> u32 {
        match sync {
            SyncPolicy::None => 0,
            SyncPolicy::Fsync => SLOT_SYNC,
            SyncPolicy::FsyncDir => SLOT_SYNC | SLOT_SYNC_DIR,
        }
    }

    /// The slot protocol: reserve a range in the active slot with a
    /// fetch-add, copy the record in, and let the first writer to
    /// overflow the slot close and write it.
    fn append(&self, rec: &[u8], sync: SyncPolicy) -> TimberResult<Lsn> {
        loop {
            let slot = Arc::clone(&self.state.lock().unwrap().active);
            let off = slot.joined.fetch_add(rec.len(), Ordering::SeqCst);

            if off + rec.len() <= slot.cap {
                // our range; no lock protects these bytes, the
                // reservation does
                unsafe { slot.buf.copy_in(off, rec) };
                slot.flags
                    .fetch_or(Self::sync_flag_bits(sync), Ordering::SeqCst);
                slot.released.fetch_add(rec.len(), Ordering::SeqCst);

                let end = Lsn::new(
                    slot.start_lsn.file,
                    slot.start_lsn.offset + off as u64 + rec.len() as u64,
                );
                if sync != SyncPolicy::None {
                    // a sync request closes the batch promptly
                    self.close_active_upto(end)?;
                }
                return Ok(end);
            }

            if off <= slot.cap {
                // first overflower: the bytes before us are exactly
                // the batch; close it and install a fresh slot
                slot.final_len.store(off, Ordering::SeqCst);
                slot.closed.store(true, Ordering::SeqCst);
                self.switch_slot(&slot, off, 0)?;
                self.close_slot(&slot, off)?;
            } else {
                // someone else is closing; wait for the switch
                while Arc::ptr_eq(&self.state.lock().unwrap().active, &slot) {
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Records too large for slot buffers get a private slot written
    /// directly.
    fn append_large(&self, rec: &[u8], sync: SyncPolicy) -> TimberResult<Lsn> {
        loop {
            let slot = Arc::clone(&self.state.lock().unwrap().active);
            let off = slot.joined.fetch_add(slot.cap + 1, Ordering::SeqCst);
            if off > slot.cap {
                while Arc::ptr_eq(&self.state.lock().unwrap().active, &slot) {
                    std::thread::yield_now();
                }
                continue;
            }

            slot.final_len.store(off, Ordering::SeqCst);
            slot.closed.store(true, Ordering::SeqCst);
            let private = self.switch_slot(&slot, off, rec.len())?;
            self.close_slot(&slot, off)?;

            let private = private.expect("switch_slot returns the private slot");
            unsafe { private.buf.copy_in(0, rec) };
            private
                .flags
                .fetch_or(Self::sync_flag_bits(sync), Ordering::SeqCst);
            private.released.fetch_add(rec.len(), Ordering::SeqCst);
            self.close_slot(&private, rec.len())?;
            return Ok(Lsn::new(
                private.start_lsn.file,
                private.start_lsn.offset + rec.len() as u64,
            ));
        }
    }

    /// Install a fresh active slot after `old` (whose byte count is
    /// now final). With `large` nonzero, also carve out a private
    /// slot of exactly that size between the two.
    fn switch_slot(
        &self,
        old: &Arc<LogSlot>,
        final_len: usize,
        large: usize,
    ) -> TimberResult<Option<Arc<LogSlot>>> {
        let mut state = self.state.lock().unwrap();
        if !Arc::ptr_eq(&state.active, old) {
            return Err(TimberError::panic("log slot switched twice"));
        }

        state.alloc_offset = old.start_lsn.offset + final_len as u64;

        let mut private = None;
        if large > 0 {
            if state.alloc_offset + large as u64 > self.file_max
                && state.alloc_offset > LOG_FIRST_RECORD
            {
                self.rotate(&mut state)?;
            }
            let slot = LogSlot::new(
                Lsn::new(state.file_num, state.alloc_offset),
                Arc::clone(&state.fh),
                large,
            );
            state.alloc_offset += large as u64;
            private = Some(slot);
        } else if state.alloc_offset + 2 * LOG_ALIGN > self.file_max {
            self.rotate(&mut state)?;
        }

        state.active = LogSlot::new(
            Lsn::new(state.file_num, state.alloc_offset),
            Arc::clone(&state.fh),
            SLOT_BUF_SIZE,
        );
        Ok(private)
    }

    /// Close the current file and open the next, promoting a
    /// preallocated file when one is ready.
    fn rotate(&self, state: &mut LogState) -> TimberVoid {
        let old_end = Lsn::new(state.file_num, state.alloc_offset);
        state.fh.sync()?;

        let next = state.file_num + 1;
        let fh = Arc::new(Self::create_log_file(
            &self.dir,
            next,
            self.file_max,
            Some(next),
        )?);
        state.fh = fh;
        state.file_num = next;
        state.alloc_offset = LOG_FIRST_RECORD;

        let next_start = Lsn::new(next, LOG_FIRST_RECORD);
        {
            let mut order = self.order.lock().unwrap();
            if order.write_lsn == old_end {
                order.write_lsn = next_start;
                if order.sync_lsn < next_start {
                    order.sync_lsn = next_start;
                }
                self.order_cond.notify_all();
            } else {
                self.boundaries.lock().unwrap().insert(old_end, next_start);
            }
        }

        self.ensure_prealloc(next + 1);
        info!("log rotated to file {}", next);
        Ok(())
    }

    /// Keep one file pre-created ahead of the writer so rotation does
    /// not pay file-create latency.
    fn ensure_prealloc(&self, num: u32) {
        if self.prealloc == 0 {
            return;
        }
        if self.next_prealloc.swap(num + 1, Ordering::SeqCst) > num {
            return;
        }
        let tmp = self.dir.join(tmp_file_name(num));
        let prep = self.dir.join(prep_file_name(num));
        let result = (|| -> TimberVoid {
            let fh = TimberFile::open(&tmp, true)?;
            fh.write_at(0, &Self::build_desc(self.file_max))?;
            fh.extend(self.file_max)?;
            fh.sync()?;
            std::fs::rename(&tmp, &prep)?;
            sync_dir(&self.dir)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!("log preallocation of file {} failed: {}", num, e);
            let _ = std::fs::remove_file(&tmp);
        }
    }

    /// Write a closed slot out, in start-LSN order, and run its sync
    /// batch.
    fn close_slot(&self, slot: &Arc<LogSlot>, final_len: usize) -> TimberVoid {
        // wait for every joiner to finish its copy
        while slot.released.load(Ordering::SeqCst) < final_len {
            std::thread::yield_now();
        }

        let end = Lsn::new(
            slot.start_lsn.file,
            slot.start_lsn.offset + final_len as u64,
        );

        {
            let mut order = self.order.lock().unwrap();
            while order.write_lsn != slot.start_lsn {
                order = self.order_cond.wait(order).unwrap();
            }
            if final_len > 0 {
                // the buffered write happens under the order lock;
                // slots are written strictly in LSN order
                let data = unsafe { slot.buf.contents(final_len) };
                slot.fh.write_at(slot.start_lsn.offset, data)?;
            }
            order.write_lsn = end;
            self.apply_boundaries(&mut order);
            self.order_cond.notify_all();
        }

        let flags = slot.flags.load(Ordering::SeqCst);
        if flags != 0 {
            let _batch = self.sync_lock.lock().unwrap();
            let need = {
                let order = self.order.lock().unwrap();
                order.sync_lsn < end
            };
            if need {
                slot.fh.sync()?;
                if flags & SLOT_SYNC_DIR != 0 {
                    sync_dir(&self.dir)?;
                }
                let mut order = self.order.lock().unwrap();
                if order.sync_lsn < end {
                    order.sync_lsn = end;
                }
                self.order_cond.notify_all();
            }
        }
        Ok(())
    }

    fn apply_boundaries(&self, order: &mut OrderState) {
        let mut boundaries = self.boundaries.lock().unwrap();
        while let Some(next) = boundaries.remove(&order.write_lsn) {
            order.write_lsn = next;
            if order.sync_lsn < next {
                order.sync_lsn = next;
            }
        }
    }

    /// Close the active slot if it holds anything at or before
    /// `target`.
    fn close_active_upto(&self, target: Lsn) -> TimberVoid {
        loop {
            let slot = Arc::clone(&self.state.lock().unwrap().active);
            if slot.start_lsn >= target {
                return Ok(());
            }
            let off = slot.joined.fetch_add(slot.cap + 1, Ordering::SeqCst);
            if off <= slot.cap {
                slot.final_len.store(off, Ordering::SeqCst);
                slot.closed.store(true, Ordering::SeqCst);
                self.switch_slot(&slot, off, 0)?;
                self.close_slot(&slot, off)?;
                return Ok(());
            }
            // a close is already in flight; let it finish
            while Arc::ptr_eq(&self.state.lock().unwrap().active, &slot) {
                std::thread::yield_now();
            }
        }
    }

    fn wait_durable(&self, target: Lsn) -> TimberVoid {
        let mut order = self.order.lock().unwrap();
        while order.sync_lsn < target {
            order = self.order_cond.wait(order).unwrap();
        }
        Ok(())
    }

    /// Push everything appended so far to the file (and to disk when
    /// `sync`).
    pub fn flush(&self, sync: bool) -> TimberVoid {
        let target = {
            let state = self.state.lock().unwrap();
            let joined = state
                .active
                .joined
                .load(Ordering::SeqCst)
                .min(state.active.cap);
            Lsn::new(
                state.active.start_lsn.file,
                state.active.start_lsn.offset + joined as u64,
            )
        };
        self.close_active_upto(target)?;

        let mut order = self.order.lock().unwrap();
        while order.write_lsn < target {
            order = self.order_cond.wait(order).unwrap();
        }
        drop(order);

        if sync {
            let _batch = self.sync_lock.lock().unwrap();
            let fh = Arc::clone(&self.state.lock().unwrap().fh);
            fh.sync()?;
            let mut order = self.order.lock().unwrap();
            if order.sync_lsn < target {
                order.sync_lsn = target;
            }
            self.order_cond.notify_all();
        }
        Ok(())
    }

    pub fn write_lsn(&self) -> Lsn {
        self.order.lock().unwrap().write_lsn
    }

    pub fn sync_lsn(&self) -> Lsn {
        self.order.lock().unwrap().sync_lsn
    }

    pub fn set_ckpt_lsn(&self, lsn: Lsn) {
        *self.ckpt_lsn.lock().unwrap() = lsn;
    }

    pub fn ckpt_lsn(&self) -> Lsn {
        *self.ckpt_lsn.lock().unwrap()
    }

    /// Remove log files strictly older than the checkpoint LSN.
    pub fn archive(&self) -> TimberVoid {
        if !self.archive_enabled {
            return Ok(());
        }
        let ckpt = self.ckpt_lsn();
        if ckpt.is_zero() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(num) = name.strip_prefix(LOG_FILE_PREFIX) {
                if let Ok(num) = num.parse::<u32>() {
                    if num < ckpt.file {
                        debug!("archiving log file {}", num);
                        let _ = std::fs::remove_file(entry.path());
                    }
                }
            }
        }
        Ok(())
    }

    /// Where a scan starts.
    pub fn scan<F>(&self, start: ScanStart, tolerant: bool, mut callback: F) -> TimberVoid
    where
        F: FnMut(&RecordBody, Lsn, Lsn) -> TimberResult<bool>,
    {
        // make everything appended so far readable
        self.flush(false)?;
        let start_lsn = match start {
            ScanStart::First => {
                let first = self.oldest_file_number()?;
                if first == 0 {
                    return Ok(());
                }
                Lsn::new(first, LOG_FIRST_RECORD)
            }
            ScanStart::FromCkpt => {
                let ckpt = self.ckpt_lsn();
                if ckpt.is_zero() {
                    let first = self.oldest_file_number()?;
                    if first == 0 {
                        return Ok(());
                    }
                    Lsn::new(first, LOG_FIRST_RECORD)
                } else {
                    ckpt
                }
            }
            ScanStart::At(lsn) => lsn,
        };
        scan_dir(
            &self.dir,
            start_lsn,
            tolerant,
            self.compressor.as_deref(),
            &mut callback,
        )
    }

    fn oldest_file_number(&self) -> TimberResult<u32> {
        let mut oldest = 0u32;
        for entry in std::fs::read_dir(&self.dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(num) = name.strip_prefix(LOG_FILE_PREFIX) {
                if let Ok(num) = num.parse::<u32>() {
                    if oldest == 0 || num < oldest {
                        oldest = num;
                    }
                }
            }
        }
        Ok(oldest)
    }

    pub fn close(&self) -> TimberVoid {
        self.flush(true)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ScanStart {
    First,
    FromCkpt,
    At(Lsn),
}

/// Forward scan of the log files in `dir` from `start_lsn`, invoking
/// `callback(body, lsn, next_lsn)` per record; the callback returns
/// false to stop the scan.
pub fn scan_dir<F>(
    dir: &Path,
    start_lsn: Lsn,
    tolerant: bool,
    compressor: Option<&dyn Compressor>,
    callback: &mut F,
) -> TimberVoid
where
    F: FnMut(&RecordBody, Lsn, Lsn) -> TimberResult<bool>,
{
    let mut file_num = start_lsn.file;
    let mut offset = start_lsn.offset.max(LOG_FIRST_RECORD);

    loop {
        let path = dir.join(log_file_name(file_num));
        if !path.exists() {
            return Ok(());
        }
        let fh = TimberFile::open(&path, false)?;
        let file_size = fh.size();

        if file_size >= LOG_ALIGN {
            let mut desc = vec![0u8; LOG_ALIGN as usize];
            fh.read_at(0, &mut desc)?;
            if let Err(e) = LogManager::check_desc(&desc) {
                if !tolerant {
                    return Err(e);
                }
                warn!("skipping log file {}: {}", file_num, e);
                file_num += 1;
                offset = LOG_FIRST_RECORD;
                continue;
            }
        }

        while offset + RECORD_HEADER_SIZE as u64 <= file_size {
            let mut header = [0u8; RECORD_HEADER_SIZE];
            fh.read_at(offset, &mut header)?;
            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
            if len == 0 || len % LOG_ALIGN != 0 || offset + len > file_size {
                // end of the valid data in this file
                break;
            }

            let mut rec = vec![0u8; len as usize];
            fh.read_at(offset, &mut rec)?;
            let stored = u32::from_be_bytes([rec[4], rec[5], rec[6], rec[7]]);
            rec[4..8].copy_from_slice(&0u32.to_be_bytes());
            if checksum32(&rec) != stored {
                if tolerant {
                    warn!("log record at {} fails checksum, scan stops", offset);
                    break;
                }
                return Err(TimberError::corrupt(format!(
                    "log record at ({},{}) fails its checksum",
                    file_num, offset
                )));
            }

            let flags = u16::from_be_bytes([rec[8], rec[9]]);
            let rectype = RecType::from_u16(u16::from_be_bytes([rec[10], rec[11]]))?;
            let mem_len = u32::from_be_bytes([rec[12], rec[13], rec[14], rec[15]]) as usize;

            let payload: Vec<u8> = if flags & REC_COMPRESSED != 0 {
                let c = compressor.ok_or_else(|| {
                    TimberError::corrupt("compressed log record but no compressor configured")
                })?;
                let mut dst = Vec::with_capacity(mem_len);
                c.decompress(&rec[RECORD_HEADER_SIZE..], &mut dst, mem_len)?;
                dst.truncate(mem_len);
                dst
            } else {
                rec[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + mem_len].to_vec()
            };

            let body = RecordBody::decode_payload(rectype, &payload)?;
            let lsn = Lsn::new(file_num, offset);
            let next = Lsn::new(file_num, offset + len);
            if !callback(&body, lsn, next)? {
                return Ok(());
            }
            offset += len;
        }

        file_num += 1;
        offset = LOG_FIRST_RECORD;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use record::LogOp;
    use tempfile::tempdir;

    fn commit_body(txn_id: u64, key: &str) -> RecordBody {
        RecordBody::Commit {
            txn_id,
            ops: vec![LogOp::RowPut {
                file_id: 1,
                key: Bytes::copy_from_slice(key.as_bytes()),
                value: Bytes::from_static(b"v"),
            }],
        }
    }

    #[test]
    fn test_write_then_scan() {
        let dir = tempdir().unwrap();
        let log = LogManager::open(dir.path(), 1 << 20, 0, false, None).unwrap();

        for i in 0..10u64 {
            log.write(&commit_body(i, &format!("key{}", i)), SyncPolicy::None)
                .unwrap();
        }
        log.flush(true).unwrap();

        let mut seen = Vec::new();
        log.scan(ScanStart::First, false, |body, _lsn, _next| {
            if let RecordBody::Commit { txn_id, .. } = body {
                seen.push(*txn_id);
            }
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen, (0..10).collect::<Vec<u64>>());
    }

    #[test]
    fn test_sync_advances_sync_lsn() {
        let dir = tempdir().unwrap();
        let log = LogManager::open(dir.path(), 1 << 20, 0, false, None).unwrap();

        let end = log.write(&commit_body(1, "a"), SyncPolicy::Fsync).unwrap();
        assert!(log.sync_lsn() >= end);
        assert!(log.write_lsn() >= end);
    }

    #[test]
    fn test_concurrent_writers_write_lsn() {
        let dir = tempdir().unwrap();
        let log = LogManager::open(dir.path(), 8 << 20, 0, false, None).unwrap();
        let start = log.write_lsn();

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let log = Arc::clone(&log);
            handles.push(std::thread::spawn(move || {
                let mut bytes = 0u64;
                for i in 0..50u64 {
                    let body = commit_body(t * 1000 + i, &format!("key-{}-{}", t, i));
                    let rec_len = log.build_record(&body).len() as u64;
                    log.write(&body, SyncPolicy::None).unwrap();
                    bytes += rec_len;
                }
                bytes
            }));
        }
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        log.flush(true).unwrap();

        // all records in one file: write_lsn advanced by exactly the
        // packed lengths
        let end = log.write_lsn();
        assert_eq!(end.file, start.file);
        assert_eq!(end.offset, start.offset + total);

        let mut count = 0;
        log.scan(ScanStart::First, false, |_, _, _| {
            count += 1;
            Ok(true)
        })
        .unwrap();
        assert_eq!(count, 200);
    }

    #[test]
    fn test_rotation() {
        let dir = tempdir().unwrap();
        // the manager clamps file_max to 1MB; write more than that
        let log = LogManager::open(dir.path(), 1 << 20, 1, false, None).unwrap();
        let first_file = log.write_lsn().file;

        let big_value = "x".repeat(16 << 10);
        for i in 0..100u64 {
            log.write(&commit_body(i, &big_value), SyncPolicy::None)
                .unwrap();
        }
        log.flush(true).unwrap();
        assert!(log.write_lsn().file > first_file);

        let mut count = 0;
        log.scan(ScanStart::First, false, |_, _, _| {
            count += 1;
            Ok(true)
        })
        .unwrap();
        assert_eq!(count, 100);
    }

    #[test]
    fn test_large_record_direct_path() {
        let dir = tempdir().unwrap();
        let log = LogManager::open(dir.path(), 8 << 20, 0, false, None).unwrap();

        let huge = "y".repeat(SLOT_BUF_SIZE + 1000);
        log.write(&commit_body(7, &huge), SyncPolicy::Fsync).unwrap();
        log.write(&commit_body(8, "small"), SyncPolicy::Fsync)
            .unwrap();

        let mut seen = Vec::new();
        log.scan(ScanStart::First, false, |body, _, _| {
            if let RecordBody::Commit { txn_id, .. } = body {
                seen.push(*txn_id);
            }
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen, vec![7, 8]);
    }

    #[test]
    fn test_scan_from_lsn_filters(){
        let dir = tempdir().unwrap();
        let log = LogManager::open(dir.path(), 1 << 20, 0, false, None).unwrap();

        log.write(&commit_body(1, "a"), SyncPolicy::None).unwrap();
        let mid = log.write(&commit_body(2, "b"), SyncPolicy::None).unwrap();
        log.write(&commit_body(3, "c"), SyncPolicy::None).unwrap();
        log.flush(true).unwrap();

        let mut seen = Vec::new();
        log.scan(ScanStart::At(mid), false, |body, _, _| {
            if let RecordBody::Commit { txn_id, .. } = body {
                seen.push(*txn_id);
            }
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen, vec![3]);
    }
}
