use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Mutex,
};

use bytes::Bytes;

use crate::error::{TimberError, TimberResult, TimberVoid};

/// An append-friendly byte buffer; everything that goes to disk
/// (extent lists, cells, log records, metadata values) is built with
/// one of these.
pub struct RecWriter {
    buf: Vec<u8>,
}

impl RecWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn write<T: Encodeable + ?Sized>(&mut self, obj: &T) {
        obj.encode(self);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// LEB128 unsigned varint, the packed integer format shared by
    /// extent lists, cells and log payloads.
    pub fn put_uvarint(&mut self, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    /// A byte string prefixed with its varint length.
    pub fn put_lenbytes(&mut self, bytes: &[u8]) {
        self.put_uvarint(bytes.len() as u64);
        self.put_bytes(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn to_padded_bytes(&self, size: usize) -> Vec<u8> {
        let mut buf = self.buf.clone();
        assert!(
            buf.len() <= size,
            "buffer size is larger than the given size: {} > {}",
            buf.len(),
            size
        );
        buf.resize(size, 0);
        buf
    }
}

/// The consuming counterpart of `RecWriter`.
pub struct RecReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read<T: Decodeable>(&mut self) -> TimberResult<T> {
        T::decode(self)
    }

    pub fn get_bytes(&mut self, count: usize) -> TimberResult<&'a [u8]> {
        if self.pos + count > self.buf.len() {
            return Err(TimberError::corrupt(format!(
                "short read: want {} bytes at offset {}, have {}",
                count,
                self.pos,
                self.buf.len()
            )));
        }
        let out = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> TimberResult<u8> {
        Ok(self.get_bytes(1)?[0])
    }

    pub fn get_u32(&mut self) -> TimberResult<u32> {
        let b = self.get_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> TimberResult<u64> {
        let b = self.get_bytes(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_uvarint(&mut self) -> TimberResult<u64> {
        let mut v: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.get_u8()?;
            if shift >= 64 {
                return Err(TimberError::corrupt("varint overflow"));
            }
            v |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
        }
    }

    pub fn get_lenbytes(&mut self) -> TimberResult<Bytes> {
        let len = self.get_uvarint()? as usize;
        Ok(Bytes::copy_from_slice(self.get_bytes(len)?))
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

pub trait Encodeable {
    fn encode(&self, writer: &mut RecWriter);
}

pub trait Decodeable: Sized {
    fn decode(reader: &mut RecReader<'_>) -> TimberResult<Self>;
}

impl Encodeable for u64 {
    fn encode(&self, writer: &mut RecWriter) {
        writer.put_u64(*self);
    }
}

impl Decodeable for u64 {
    fn decode(reader: &mut RecReader<'_>) -> TimberResult<Self> {
        reader.get_u64()
    }
}

impl Encodeable for u32 {
    fn encode(&self, writer: &mut RecWriter) {
        writer.put_u32(*self);
    }
}

impl Decodeable for u32 {
    fn decode(reader: &mut RecReader<'_>) -> TimberResult<Self> {
        reader.get_u32()
    }
}

impl Encodeable for [u8] {
    fn encode(&self, writer: &mut RecWriter) {
        writer.put_lenbytes(self);
    }
}

impl Encodeable for Bytes {
    fn encode(&self, writer: &mut RecWriter) {
        writer.put_lenbytes(self);
    }
}

impl Decodeable for Bytes {
    fn decode(reader: &mut RecReader<'_>) -> TimberResult<Self> {
        reader.get_lenbytes()
    }
}

/// A block-addressed file: positional reads and writes, explicit
/// sync, explicit extension. One per data file, shared by the block
/// manager and salvage.
pub struct TimberFile {
    file: File,
    path: PathBuf,
    // serializes size queries against extensions
    size: Mutex<u64>,
}

impl TimberFile {
    pub fn open<P: AsRef<Path>>(path: P, create: bool) -> TimberResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path.as_ref())?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            size: Mutex::new(size),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> TimberVoid {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> TimberVoid {
        self.file.write_all_at(buf, offset)?;
        let mut size = self.size.lock().unwrap();
        if offset + buf.len() as u64 > *size {
            *size = offset + buf.len() as u64;
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        *self.size.lock().unwrap()
    }

    /// Grow the file to `new_size`; returns the old size.
    pub fn extend(&self, new_size: u64) -> TimberResult<u64> {
        let mut size = self.size.lock().unwrap();
        let old = *size;
        if new_size > old {
            self.file.set_len(new_size)?;
            *size = new_size;
        }
        Ok(old)
    }

    pub fn truncate(&self, new_size: u64) -> TimberVoid {
        let mut size = self.size.lock().unwrap();
        self.file.set_len(new_size)?;
        *size = new_size;
        Ok(())
    }

    pub fn sync(&self) -> TimberVoid {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn sync_all(&self) -> TimberVoid {
        self.file.sync_all()?;
        Ok(())
    }
}

/// fsync a directory so renames and creates within it are durable.
pub fn sync_dir<P: AsRef<Path>>(dir: P) -> TimberVoid {
    let f = File::open(dir.as_ref())?;
    f.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uvarint_round_trip() {
        let values = [0u64, 1, 127, 128, 300, 71002, u32::MAX as u64, u64::MAX];

        let mut writer = RecWriter::new();
        for v in &values {
            writer.put_uvarint(*v);
        }

        let buf = writer.into_bytes();
        let mut reader = RecReader::new(&buf);
        for v in &values {
            assert_eq!(*v, reader.get_uvarint().unwrap());
        }
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_lenbytes_round_trip() {
        let mut writer = RecWriter::new();
        writer.put_lenbytes(b"timber");
        writer.put_lenbytes(b"");

        let buf = writer.into_bytes();
        let mut reader = RecReader::new(&buf);
        assert_eq!(&reader.get_lenbytes().unwrap()[..], b"timber");
        assert_eq!(&reader.get_lenbytes().unwrap()[..], b"");
    }

    #[test]
    fn test_short_read_is_corruption() {
        let buf = [0u8; 2];
        let mut reader = RecReader::new(&buf);
        assert!(matches!(
            reader.get_u64(),
            Err(crate::error::TimberError::Corrupt(_))
        ));
    }
}
