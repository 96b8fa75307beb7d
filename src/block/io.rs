use xxhash_rust::xxh3::xxh3_64;

use crate::{
    error::{TimberError, TimberResult},
    io::{Decodeable, Encodeable, RecReader, RecWriter},
};

/// First bytes of every data file.
pub const TIMBER_MAGIC: u32 = 120_897;
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

/// Fixed page header, precedes every on-disk page image.
///
/// Compression covers everything after this header; `mem_size` is the
/// payload length after decompression, `disk_size` the full aligned
/// image length on disk.
pub const PAGE_HEADER_SIZE: usize = 32;

pub const PAGE_COMPRESSED: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    ColInt = 1,
    RowInt = 2,
    ColFix = 3,
    ColVar = 4,
    RowLeaf = 5,
    Ovfl = 6,
    BlockMgr = 7,
}

impl PageType {
    pub fn from_u8(value: u8) -> TimberResult<Self> {
        match value {
            1 => Ok(PageType::ColInt),
            2 => Ok(PageType::RowInt),
            3 => Ok(PageType::ColFix),
            4 => Ok(PageType::ColVar),
            5 => Ok(PageType::RowLeaf),
            6 => Ok(PageType::Ovfl),
            7 => Ok(PageType::BlockMgr),
            _ => Err(TimberError::corrupt(format!("bad page type {}", value))),
        }
    }

    pub fn is_internal(self) -> bool {
        matches!(self, PageType::ColInt | PageType::RowInt)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    /// Starting recno for column pages, entry count for row pages.
    pub recno_or_entries: u64,
    pub write_gen: u64,
    pub mem_size: u32,
    pub disk_size: u32,
    pub checksum: u32,
    pub page_type: PageType,
    pub flags: u8,
}

impl PageHeader {
    pub fn to_bytes(&self) -> [u8; PAGE_HEADER_SIZE] {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.recno_or_entries.to_be_bytes());
        buf[8..16].copy_from_slice(&self.write_gen.to_be_bytes());
        buf[16..20].copy_from_slice(&self.mem_size.to_be_bytes());
        buf[20..24].copy_from_slice(&self.disk_size.to_be_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_be_bytes());
        buf[28] = self.page_type as u8;
        buf[29] = self.flags;
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> TimberResult<Self> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(TimberError::corrupt("page image shorter than its header"));
        }
        let mut u64buf = [0u8; 8];
        let mut u32buf = [0u8; 4];
        u64buf.copy_from_slice(&buf[0..8]);
        let recno_or_entries = u64::from_be_bytes(u64buf);
        u64buf.copy_from_slice(&buf[8..16]);
        let write_gen = u64::from_be_bytes(u64buf);
        u32buf.copy_from_slice(&buf[16..20]);
        let mem_size = u32::from_be_bytes(u32buf);
        u32buf.copy_from_slice(&buf[20..24]);
        let disk_size = u32::from_be_bytes(u32buf);
        u32buf.copy_from_slice(&buf[24..28]);
        let checksum = u32::from_be_bytes(u32buf);
        Ok(Self {
            recno_or_entries,
            write_gen,
            mem_size,
            disk_size,
            checksum,
            page_type: PageType::from_u8(buf[28])?,
            flags: buf[29],
        })
    }
}

/// The opaque `(off, size, checksum)` handle to one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cookie {
    pub off: u64,
    pub size: u32,
    pub checksum: u32,
}

impl Encodeable for Cookie {
    fn encode(&self, writer: &mut RecWriter) {
        writer.put_uvarint(self.off);
        writer.put_uvarint(self.size as u64);
        writer.put_uvarint(self.checksum as u64);
    }
}

impl Decodeable for Cookie {
    fn decode(reader: &mut RecReader<'_>) -> TimberResult<Self> {
        Ok(Self {
            off: reader.get_uvarint()?,
            size: reader.get_uvarint()? as u32,
            checksum: reader.get_uvarint()? as u32,
        })
    }
}

impl Cookie {
    pub fn to_hex(&self) -> String {
        let mut writer = RecWriter::new();
        self.encode(&mut writer);
        hex::encode(writer.as_slice())
    }

    pub fn from_hex(raw: &str) -> TimberResult<Self> {
        let bytes =
            hex::decode(raw).map_err(|e| TimberError::corrupt(format!("bad cookie: {}", e)))?;
        Cookie::decode(&mut RecReader::new(&bytes))
    }
}

pub fn checksum32(buf: &[u8]) -> u32 {
    (xxh3_64(buf) & 0xffff_ffff) as u32
}

/// Block compressor plug-in.
///
/// `compress` may decline (return false) when the output would not
/// shrink; `compress_raw` is the page-at-a-time variant that picks its
/// own split point and returns the accepted source prefix length.
pub trait Compressor: Send + Sync {
    fn name(&self) -> &str;

    /// Worst-case output size for `src_len` input bytes.
    fn pre_size(&self, src_len: usize) -> usize {
        src_len
    }

    fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> TimberResult<bool>;

    fn decompress(&self, src: &[u8], dst: &mut Vec<u8>, expected_len: usize) -> TimberResult<()>;

    fn compress_raw(
        &self,
        _src: &[u8],
        _split_offsets: &[usize],
        _dst: &mut Vec<u8>,
    ) -> TimberResult<Option<usize>> {
        Ok(None)
    }
}

fn align_up(len: u64, alloc_unit: u64) -> u64 {
    (len + alloc_unit - 1) / alloc_unit * alloc_unit
}

/// Assemble the final on-disk image: header + (maybe compressed)
/// payload, padded to the allocation unit, checksum stamped into the
/// header. Returns the image and its checksum.
pub fn build_image(
    page_type: PageType,
    recno_or_entries: u64,
    write_gen: u64,
    payload: &[u8],
    compressor: Option<&dyn Compressor>,
    alloc_unit: u64,
) -> TimberResult<(Vec<u8>, u32)> {
    let mut flags = 0u8;
    let mut body: Vec<u8>;

    match compressor {
        Some(c) => {
            let mut dst = Vec::with_capacity(c.pre_size(payload.len()));
            if c.compress(payload, &mut dst)? && dst.len() < payload.len() {
                flags |= PAGE_COMPRESSED;
                body = dst;
            } else {
                body = payload.to_vec();
            }
        }
        None => body = payload.to_vec(),
    }

    let disk_size = align_up((PAGE_HEADER_SIZE + body.len()) as u64, alloc_unit);
    let header = PageHeader {
        recno_or_entries,
        write_gen,
        mem_size: payload.len() as u32,
        disk_size: disk_size as u32,
        checksum: 0,
        page_type,
        flags,
    };

    let mut image = Vec::with_capacity(disk_size as usize);
    image.extend_from_slice(&header.to_bytes());
    image.append(&mut body);
    image.resize(disk_size as usize, 0);

    let checksum = checksum32(&image);
    image[24..28].copy_from_slice(&checksum.to_be_bytes());
    Ok((image, checksum))
}

/// Assemble an image whose payload was already compressed by the
/// raw-compression callback; `mem_len` is the uncompressed length.
pub fn build_image_precompressed(
    page_type: PageType,
    recno_or_entries: u64,
    write_gen: u64,
    compressed: &[u8],
    mem_len: usize,
    alloc_unit: u64,
) -> TimberResult<(Vec<u8>, u32)> {
    let disk_size = align_up((PAGE_HEADER_SIZE + compressed.len()) as u64, alloc_unit);
    let header = PageHeader {
        recno_or_entries,
        write_gen,
        mem_size: mem_len as u32,
        disk_size: disk_size as u32,
        checksum: 0,
        page_type,
        flags: PAGE_COMPRESSED,
    };
    let mut image = Vec::with_capacity(disk_size as usize);
    image.extend_from_slice(&header.to_bytes());
    image.extend_from_slice(compressed);
    image.resize(disk_size as usize, 0);
    let checksum = checksum32(&image);
    image[24..28].copy_from_slice(&checksum.to_be_bytes());
    Ok((image, checksum))
}

/// Verify and unpack a raw on-disk image read for `cookie`. Returns
/// the header and the decompressed payload.
pub fn parse_image(
    image: &[u8],
    cookie: &Cookie,
    compressor: Option<&dyn Compressor>,
) -> TimberResult<(PageHeader, Vec<u8>)> {
    let mut copy = image.to_vec();
    copy[24..28].copy_from_slice(&0u32.to_be_bytes());
    let actual = checksum32(&copy);
    if actual != cookie.checksum {
        return Err(TimberError::corrupt(format!(
            "block {}/{}: checksum mismatch {:#x} != {:#x}",
            cookie.off, cookie.size, actual, cookie.checksum
        )));
    }

    let header = PageHeader::from_bytes(image)?;
    if header.checksum != cookie.checksum {
        return Err(TimberError::corrupt(format!(
            "block {}/{}: header checksum {:#x} != cookie {:#x}",
            cookie.off, cookie.size, header.checksum, cookie.checksum
        )));
    }

    let body = &image[PAGE_HEADER_SIZE..];
    let payload = if header.flags & PAGE_COMPRESSED != 0 {
        let c = compressor.ok_or_else(|| {
            TimberError::corrupt("compressed block but no compressor configured")
        })?;
        let mut dst = Vec::with_capacity(header.mem_size as usize);
        c.decompress(body, &mut dst, header.mem_size as usize)?;
        if dst.len() != header.mem_size as usize {
            return Err(TimberError::corrupt("decompressed length mismatch"));
        }
        dst
    } else {
        body[..header.mem_size as usize].to_vec()
    };
    Ok((header, payload))
}

/// The description block at offset 0 of every data file.
pub fn build_desc(alloc_unit: u64) -> Vec<u8> {
    let mut buf = vec![0u8; alloc_unit as usize];
    buf[0..4].copy_from_slice(&TIMBER_MAGIC.to_be_bytes());
    buf[4..6].copy_from_slice(&VERSION_MAJOR.to_be_bytes());
    buf[6..8].copy_from_slice(&VERSION_MINOR.to_be_bytes());
    buf[8..12].copy_from_slice(&(alloc_unit as u32).to_be_bytes());
    let checksum = checksum32(&buf);
    buf[12..16].copy_from_slice(&checksum.to_be_bytes());
    buf
}

pub fn check_desc(buf: &[u8], alloc_unit: u64) -> TimberResult<()> {
    let mut u32buf = [0u8; 4];
    u32buf.copy_from_slice(&buf[0..4]);
    if u32::from_be_bytes(u32buf) != TIMBER_MAGIC {
        return Err(TimberError::corrupt("not a timberdb file (bad magic)"));
    }
    let mut u16buf = [0u8; 2];
    u16buf.copy_from_slice(&buf[4..6]);
    let major = u16::from_be_bytes(u16buf);
    if major > VERSION_MAJOR {
        return Err(TimberError::corrupt(format!(
            "unsupported file version {}",
            major
        )));
    }
    u32buf.copy_from_slice(&buf[8..12]);
    let unit = u32::from_be_bytes(u32buf) as u64;
    if unit != alloc_unit {
        return Err(TimberError::Config(format!(
            "allocation_size {} does not match file's {}",
            alloc_unit, unit
        )));
    }
    let mut copy = buf.to_vec();
    u32buf.copy_from_slice(&buf[12..16]);
    let stored = u32::from_be_bytes(u32buf);
    copy[12..16].copy_from_slice(&0u32.to_be_bytes());
    if checksum32(&copy) != stored {
        return Err(TimberError::corrupt("description block checksum mismatch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_round_trip() {
        let payload = b"cell cell cell cell".to_vec();
        let (image, checksum) = build_image(PageType::RowLeaf, 3, 7, &payload, None, 512).unwrap();
        assert_eq!(image.len(), 512);

        let cookie = Cookie {
            off: 512,
            size: image.len() as u32,
            checksum,
        };
        let (header, body) = parse_image(&image, &cookie, None).unwrap();
        assert_eq!(header.page_type, PageType::RowLeaf);
        assert_eq!(header.recno_or_entries, 3);
        assert_eq!(header.write_gen, 7);
        assert_eq!(body, payload);
    }

    #[test]
    fn test_corrupt_image_detected() {
        let payload = vec![7u8; 100];
        let (mut image, checksum) =
            build_image(PageType::ColVar, 1, 1, &payload, None, 512).unwrap();
        image[100] ^= 0xff;

        let cookie = Cookie {
            off: 0,
            size: image.len() as u32,
            checksum,
        };
        assert!(matches!(
            parse_image(&image, &cookie, None),
            Err(TimberError::Corrupt(_))
        ));
    }

    #[test]
    fn test_desc_round_trip() {
        let desc = build_desc(4096);
        check_desc(&desc, 4096).unwrap();
        assert!(check_desc(&desc, 512).is_err());

        let mut bad = desc.clone();
        bad[0] = 0;
        assert!(check_desc(&bad, 4096).is_err());
    }

    #[test]
    fn test_cookie_hex_round_trip() {
        let cookie = Cookie {
            off: 123456,
            size: 4096,
            checksum: 0xdeadbeef,
        };
        let back = Cookie::from_hex(&cookie.to_hex()).unwrap();
        assert_eq!(cookie, back);
    }
}
