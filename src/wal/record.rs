use bytes::Bytes;

use crate::{
    error::{TimberError, TimberResult},
    io::{Decodeable, Encodeable, RecReader, RecWriter},
};

/// Log record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RecType {
    /// A transaction's operations.
    Commit = 1,
    /// Checkpoint boundary; payload is the prepare LSN.
    Checkpoint = 2,
    /// A file was created or synced; payload is `(file_id, uri)`.
    FileSync = 3,
    /// Free-form diagnostic message.
    Message = 4,
}

impl RecType {
    pub fn from_u16(v: u16) -> TimberResult<Self> {
        match v {
            1 => Ok(RecType::Commit),
            2 => Ok(RecType::Checkpoint),
            3 => Ok(RecType::FileSync),
            4 => Ok(RecType::Message),
            other => Err(TimberError::corrupt(format!(
                "bad log record type {}",
                other
            ))),
        }
    }
}

/// One logged operation inside a commit record.
#[derive(Debug, Clone, PartialEq)]
pub enum LogOp {
    ColPut {
        file_id: u32,
        recno: u64,
        value: Bytes,
    },
    ColRemove {
        file_id: u32,
        recno: u64,
    },
    ColTruncate {
        file_id: u32,
        start: u64,
        stop: u64,
    },
    RowPut {
        file_id: u32,
        key: Bytes,
        value: Bytes,
    },
    RowRemove {
        file_id: u32,
        key: Bytes,
    },
    RowTruncate {
        file_id: u32,
        start: Bytes,
        stop: Bytes,
    },
}

const OP_COL_PUT: u8 = 1;
const OP_COL_REMOVE: u8 = 2;
const OP_COL_TRUNCATE: u8 = 3;
const OP_ROW_PUT: u8 = 4;
const OP_ROW_REMOVE: u8 = 5;
const OP_ROW_TRUNCATE: u8 = 6;

impl LogOp {
    pub fn file_id(&self) -> u32 {
        match self {
            LogOp::ColPut { file_id, .. }
            | LogOp::ColRemove { file_id, .. }
            | LogOp::ColTruncate { file_id, .. }
            | LogOp::RowPut { file_id, .. }
            | LogOp::RowRemove { file_id, .. }
            | LogOp::RowTruncate { file_id, .. } => *file_id,
        }
    }
}

impl Encodeable for LogOp {
    fn encode(&self, writer: &mut RecWriter) {
        match self {
            LogOp::ColPut {
                file_id,
                recno,
                value,
            } => {
                writer.put_u8(OP_COL_PUT);
                writer.put_uvarint(*file_id as u64);
                writer.put_uvarint(*recno);
                writer.put_lenbytes(value);
            }
            LogOp::ColRemove { file_id, recno } => {
                writer.put_u8(OP_COL_REMOVE);
                writer.put_uvarint(*file_id as u64);
                writer.put_uvarint(*recno);
            }
            LogOp::ColTruncate {
                file_id,
                start,
                stop,
            } => {
                writer.put_u8(OP_COL_TRUNCATE);
                writer.put_uvarint(*file_id as u64);
                writer.put_uvarint(*start);
                writer.put_uvarint(*stop);
            }
            LogOp::RowPut {
                file_id,
                key,
                value,
            } => {
                writer.put_u8(OP_ROW_PUT);
                writer.put_uvarint(*file_id as u64);
                writer.put_lenbytes(key);
                writer.put_lenbytes(value);
            }
            LogOp::RowRemove { file_id, key } => {
                writer.put_u8(OP_ROW_REMOVE);
                writer.put_uvarint(*file_id as u64);
                writer.put_lenbytes(key);
            }
            LogOp::RowTruncate {
                file_id,
                start,
                stop,
            } => {
                writer.put_u8(OP_ROW_TRUNCATE);
                writer.put_uvarint(*file_id as u64);
                writer.put_lenbytes(start);
                writer.put_lenbytes(stop);
            }
        }
    }
}

impl Decodeable for LogOp {
    fn decode(reader: &mut RecReader<'_>) -> TimberResult<Self> {
        let kind = reader.get_u8()?;
        let file_id = reader.get_uvarint()? as u32;
        match kind {
            OP_COL_PUT => Ok(LogOp::ColPut {
                file_id,
                recno: reader.get_uvarint()?,
                value: reader.get_lenbytes()?,
            }),
            OP_COL_REMOVE => Ok(LogOp::ColRemove {
                file_id,
                recno: reader.get_uvarint()?,
            }),
            OP_COL_TRUNCATE => Ok(LogOp::ColTruncate {
                file_id,
                start: reader.get_uvarint()?,
                stop: reader.get_uvarint()?,
            }),
            OP_ROW_PUT => Ok(LogOp::RowPut {
                file_id,
                key: reader.get_lenbytes()?,
                value: reader.get_lenbytes()?,
            }),
            OP_ROW_REMOVE => Ok(LogOp::RowRemove {
                file_id,
                key: reader.get_lenbytes()?,
            }),
            OP_ROW_TRUNCATE => Ok(LogOp::RowTruncate {
                file_id,
                start: reader.get_lenbytes()?,
                stop: reader.get_lenbytes()?,
            }),
            other => Err(TimberError::corrupt(format!("bad log op kind {}", other))),
        }
    }
}

/// The decoded body of a log record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    Commit { txn_id: u64, ops: Vec<LogOp> },
    Checkpoint { prepare: crate::wal::Lsn },
    FileSync { file_id: u32, uri: String },
    Message { text: String },
}

impl RecordBody {
    pub fn rectype(&self) -> RecType {
        match self {
            RecordBody::Commit { .. } => RecType::Commit,
            RecordBody::Checkpoint { .. } => RecType::Checkpoint,
            RecordBody::FileSync { .. } => RecType::FileSync,
            RecordBody::Message { .. } => RecType::Message,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut writer = RecWriter::new();
        match self {
            RecordBody::Commit { txn_id, ops } => {
                writer.put_uvarint(*txn_id);
                writer.put_uvarint(ops.len() as u64);
                for op in ops {
                    writer.write(op);
                }
            }
            RecordBody::Checkpoint { prepare } => {
                writer.put_uvarint(prepare.file as u64);
                writer.put_uvarint(prepare.offset);
            }
            RecordBody::FileSync { file_id, uri } => {
                writer.put_uvarint(*file_id as u64);
                writer.put_lenbytes(uri.as_bytes());
            }
            RecordBody::Message { text } => {
                writer.put_lenbytes(text.as_bytes());
            }
        }
        writer.into_bytes()
    }

    pub fn decode_payload(rectype: RecType, payload: &[u8]) -> TimberResult<Self> {
        let mut reader = RecReader::new(payload);
        match rectype {
            RecType::Commit => {
                let txn_id = reader.get_uvarint()?;
                let count = reader.get_uvarint()?;
                let mut ops = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    ops.push(LogOp::decode(&mut reader)?);
                }
                Ok(RecordBody::Commit { txn_id, ops })
            }
            RecType::Checkpoint => Ok(RecordBody::Checkpoint {
                prepare: crate::wal::Lsn {
                    file: reader.get_uvarint()? as u32,
                    offset: reader.get_uvarint()?,
                },
            }),
            RecType::FileSync => {
                let file_id = reader.get_uvarint()? as u32;
                let uri = String::from_utf8(reader.get_lenbytes()?.to_vec())
                    .map_err(|_| TimberError::corrupt("file-sync uri is not utf-8"))?;
                Ok(RecordBody::FileSync { file_id, uri })
            }
            RecType::Message => {
                let text = String::from_utf8(reader.get_lenbytes()?.to_vec())
                    .map_err(|_| TimberError::corrupt("log message is not utf-8"))?;
                Ok(RecordBody::Message { text })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_record_round_trip() {
        let body = RecordBody::Commit {
            txn_id: 42,
            ops: vec![
                LogOp::RowPut {
                    file_id: 3,
                    key: Bytes::from_static(b"a"),
                    value: Bytes::from_static(b"1"),
                },
                LogOp::RowRemove {
                    file_id: 3,
                    key: Bytes::from_static(b"b"),
                },
                LogOp::ColPut {
                    file_id: 4,
                    recno: 9,
                    value: Bytes::from_static(b"x"),
                },
                LogOp::RowTruncate {
                    file_id: 3,
                    start: Bytes::from_static(b"c"),
                    stop: Bytes::from_static(b"d"),
                },
            ],
        };

        let payload = body.encode_payload();
        let back = RecordBody::decode_payload(RecType::Commit, &payload).unwrap();
        assert_eq!(body, back);
    }

    #[test]
    fn test_checkpoint_record_round_trip() {
        let body = RecordBody::Checkpoint {
            prepare: crate::wal::Lsn {
                file: 7,
                offset: 1280,
            },
        };
        let payload = body.encode_payload();
        let back = RecordBody::decode_payload(RecType::Checkpoint, &payload).unwrap();
        assert_eq!(body, back);
    }
}
