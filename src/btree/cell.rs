use bytes::Bytes;

use crate::{
    block::io::Cookie,
    error::{TimberError, TimberResult},
    io::{RecReader, RecWriter},
};

/// Cell descriptors. Short keys and values pack their length into the
/// descriptor byte; everything else is a kind byte followed by
/// varint-framed fields.
const CELL_KEY: u8 = 0x01;
const CELL_KEY_PFX: u8 = 0x02;
const CELL_KEY_OVFL: u8 = 0x03;
const CELL_VALUE: u8 = 0x04;
const CELL_VALUE_OVFL: u8 = 0x05;
const CELL_VALUE_RLE: u8 = 0x06;
const CELL_DEL: u8 = 0x07;
const CELL_ADDR_INT: u8 = 0x08;
const CELL_ADDR_LEAF: u8 = 0x09;

const CELL_SHORT_KEY: u8 = 0x40;
const CELL_SHORT_VALUE: u8 = 0x80;
const CELL_SHORT_MAX: usize = 0x3f;

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    /// A row key; `prefix` bytes are shared with the previous key on
    /// the page.
    Key { prefix: u8, suffix: Bytes },
    KeyOvfl { cookie: Cookie, len: u64 },
    /// A value, possibly run-length encoded (column stores).
    Value { data: Bytes, rle: u64 },
    ValueOvfl { cookie: Cookie, len: u64, rle: u64 },
    /// A deleted range (column stores).
    Del { rle: u64 },
    /// A child address; `recno_or_entries` is the starting recno for
    /// column trees and the entry count for row trees.
    Addr {
        cookie: Cookie,
        is_internal: bool,
        recno_or_entries: u64,
    },
}

pub fn pack_key(writer: &mut RecWriter, prefix: u8, suffix: &[u8]) {
    if prefix == 0 && !suffix.is_empty() && suffix.len() <= CELL_SHORT_MAX {
        writer.put_u8(CELL_SHORT_KEY | suffix.len() as u8);
        writer.put_bytes(suffix);
        return;
    }
    if prefix == 0 {
        writer.put_u8(CELL_KEY);
    } else {
        writer.put_u8(CELL_KEY_PFX);
        writer.put_u8(prefix);
    }
    writer.put_lenbytes(suffix);
}

pub fn pack_key_ovfl(writer: &mut RecWriter, cookie: &Cookie, len: u64) {
    writer.put_u8(CELL_KEY_OVFL);
    writer.write(cookie);
    writer.put_uvarint(len);
}

pub fn pack_value(writer: &mut RecWriter, data: &[u8], rle: u64) {
    if rle <= 1 {
        if !data.is_empty() && data.len() <= CELL_SHORT_MAX {
            writer.put_u8(CELL_SHORT_VALUE | data.len() as u8);
            writer.put_bytes(data);
        } else {
            writer.put_u8(CELL_VALUE);
            writer.put_lenbytes(data);
        }
    } else {
        writer.put_u8(CELL_VALUE_RLE);
        writer.put_uvarint(rle);
        writer.put_lenbytes(data);
    }
}

pub fn pack_value_ovfl(writer: &mut RecWriter, cookie: &Cookie, len: u64, rle: u64) {
    writer.put_u8(CELL_VALUE_OVFL);
    writer.put_uvarint(rle.max(1));
    writer.write(cookie);
    writer.put_uvarint(len);
}

pub fn pack_del(writer: &mut RecWriter, rle: u64) {
    writer.put_u8(CELL_DEL);
    writer.put_uvarint(rle.max(1));
}

pub fn pack_addr(writer: &mut RecWriter, cookie: &Cookie, is_internal: bool, recno_or_entries: u64) {
    writer.put_u8(if is_internal {
        CELL_ADDR_INT
    } else {
        CELL_ADDR_LEAF
    });
    writer.write(cookie);
    writer.put_uvarint(recno_or_entries);
}

pub fn unpack(reader: &mut RecReader<'_>) -> TimberResult<Cell> {
    let desc = reader.get_u8()?;

    if desc & 0xc0 == CELL_SHORT_KEY {
        let len = (desc & CELL_SHORT_MAX as u8) as usize;
        return Ok(Cell::Key {
            prefix: 0,
            suffix: Bytes::copy_from_slice(reader.get_bytes(len)?),
        });
    }
    if desc & 0xc0 == CELL_SHORT_VALUE {
        let len = (desc & CELL_SHORT_MAX as u8) as usize;
        return Ok(Cell::Value {
            data: Bytes::copy_from_slice(reader.get_bytes(len)?),
            rle: 1,
        });
    }

    match desc {
        CELL_KEY => Ok(Cell::Key {
            prefix: 0,
            suffix: reader.get_lenbytes()?,
        }),
        CELL_KEY_PFX => {
            let prefix = reader.get_u8()?;
            Ok(Cell::Key {
                prefix,
                suffix: reader.get_lenbytes()?,
            })
        }
        CELL_KEY_OVFL => Ok(Cell::KeyOvfl {
            cookie: reader.read()?,
            len: reader.get_uvarint()?,
        }),
        CELL_VALUE => Ok(Cell::Value {
            data: reader.get_lenbytes()?,
            rle: 1,
        }),
        CELL_VALUE_RLE => {
            let rle = reader.get_uvarint()?;
            Ok(Cell::Value {
                data: reader.get_lenbytes()?,
                rle,
            })
        }
        CELL_VALUE_OVFL => {
            let rle = reader.get_uvarint()?;
            Ok(Cell::ValueOvfl {
                cookie: reader.read()?,
                len: reader.get_uvarint()?,
                rle,
            })
        }
        CELL_DEL => Ok(Cell::Del {
            rle: reader.get_uvarint()?,
        }),
        CELL_ADDR_INT | CELL_ADDR_LEAF => Ok(Cell::Addr {
            cookie: reader.read()?,
            is_internal: desc == CELL_ADDR_INT,
            recno_or_entries: reader.get_uvarint()?,
        }),
        _ => Err(TimberError::corrupt(format!(
            "unexpected cell descriptor {:#x}",
            desc
        ))),
    }
}

/// Resolve a prefix-compressed key against the previous full key on
/// the page.
pub fn resolve_key(prev: &[u8], prefix: u8, suffix: &[u8]) -> TimberResult<Bytes> {
    let prefix = prefix as usize;
    if prefix == 0 {
        return Ok(Bytes::copy_from_slice(suffix));
    }
    if prefix > prev.len() {
        return Err(TimberError::corrupt(format!(
            "key prefix {} longer than previous key {}",
            prefix,
            prev.len()
        )));
    }
    let mut full = Vec::with_capacity(prefix + suffix.len());
    full.extend_from_slice(&prev[..prefix]);
    full.extend_from_slice(suffix);
    Ok(Bytes::from(full))
}

/// Shared prefix length of two keys, capped at what a one-byte prefix
/// count can carry.
pub fn common_prefix(a: &[u8], b: &[u8]) -> u8 {
    let max = a.len().min(b.len()).min(u8::MAX as usize);
    let mut n = 0;
    while n < max && a[n] == b[n] {
        n += 1;
    }
    n as u8
}

/// The shortest key sorting strictly after `last_left` and
/// less-or-equal to `first_right`: suffix truncation for promoted
/// internal keys.
pub fn suffix_truncate(last_left: &[u8], first_right: &[u8]) -> Bytes {
    let mut n = 0;
    let max = last_left.len().min(first_right.len());
    while n < max && last_left[n] == first_right[n] {
        n += 1;
    }
    // first_right[..n+1] differs from last_left within bounds, or
    // first_right is an extension of last_left and cannot shrink
    if n < first_right.len() {
        Bytes::copy_from_slice(&first_right[..n + 1])
    } else {
        Bytes::copy_from_slice(first_right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_value_round_trip() {
        let mut writer = RecWriter::new();
        pack_key(&mut writer, 0, b"alpha");
        pack_value(&mut writer, b"1", 1);
        pack_key(&mut writer, 3, b"ine");
        pack_value(&mut writer, &vec![9u8; 100], 1);
        pack_del(&mut writer, 4);

        let buf = writer.into_bytes();
        let mut reader = RecReader::new(&buf);

        assert_eq!(unpack(&mut reader).unwrap(), Cell::Key {
            prefix: 0,
            suffix: Bytes::from_static(b"alpha")
        });
        assert_eq!(unpack(&mut reader).unwrap(), Cell::Value {
            data: Bytes::from_static(b"1"),
            rle: 1
        });
        assert_eq!(unpack(&mut reader).unwrap(), Cell::Key {
            prefix: 3,
            suffix: Bytes::from_static(b"ine")
        });
        match unpack(&mut reader).unwrap() {
            Cell::Value { data, rle: 1 } => assert_eq!(data.len(), 100),
            other => panic!("unexpected cell {:?}", other),
        }
        assert_eq!(unpack(&mut reader).unwrap(), Cell::Del { rle: 4 });
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_addr_round_trip() {
        let cookie = Cookie {
            off: 8192,
            size: 4096,
            checksum: 77,
        };
        let mut writer = RecWriter::new();
        pack_addr(&mut writer, &cookie, true, 42);

        let buf = writer.into_bytes();
        let cell = unpack(&mut RecReader::new(&buf)).unwrap();
        assert_eq!(cell, Cell::Addr {
            cookie,
            is_internal: true,
            recno_or_entries: 42
        });
    }

    #[test]
    fn test_prefix_resolution() {
        let prev = b"keystone";
        let full = resolve_key(prev, 3, b"note").unwrap();
        assert_eq!(&full[..], b"keynote");
        assert!(resolve_key(b"k", 3, b"x").is_err());
    }

    #[test]
    fn test_common_prefix() {
        assert_eq!(common_prefix(b"keynote", b"keystone"), 3);
        assert_eq!(common_prefix(b"", b"abc"), 0);
        assert_eq!(common_prefix(b"same", b"same"), 4);
    }

    #[test]
    fn test_suffix_truncate() {
        let promoted = suffix_truncate(b"apple", b"banana");
        assert_eq!(&promoted[..], b"b");
        assert!(&promoted[..] > &b"apple"[..]);
        assert!(&promoted[..] <= &b"banana"[..]);

        let promoted = suffix_truncate(b"app", b"apple");
        assert_eq!(&promoted[..], b"appl");

        // identical-prefix extension cannot shrink
        let promoted = suffix_truncate(b"apple", b"apples");
        assert_eq!(&promoted[..], b"apples");
    }
}
