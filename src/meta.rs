//! The metadata table: a btree keyed by object URI whose values are
//! configuration strings. The metadata's own checkpoint bootstraps
//! from the `timber.base` file, written atomically by rename.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use log::debug;

use crate::{
    block::BlockCheckpoint,
    btree::{BTree, Cursor},
    config::Config,
    error::{TimberError, TimberResult, TimberVoid},
    io::sync_dir,
    session::SessionInner,
    wal::Lsn,
};

pub const METADATA_URI: &str = "metadata:";
pub const METADATA_FILE: &str = "timber.meta";
pub const METADATA_FILE_ID: u32 = 0;
pub const BASE_FILE: &str = "timber.base";

/// The metadata key holding the database-wide checkpoint LSN.
pub const CKPT_KEY: &str = "system:checkpoint";

/// Read an object's config string.
pub fn meta_get(
    session: &Arc<SessionInner>,
    meta: &Arc<BTree>,
    uri: &str,
) -> TimberResult<Config> {
    let mut cursor = Cursor::new(Arc::clone(session), Arc::clone(meta));
    let raw = cursor.search(uri.as_bytes())?;
    let text = String::from_utf8(raw.to_vec())
        .map_err(|_| TimberError::corrupt("metadata value is not utf-8"))?;
    Config::parse(&text)
}

pub fn meta_put(
    session: &Arc<SessionInner>,
    meta: &Arc<BTree>,
    uri: &str,
    value: &Config,
) -> TimberVoid {
    let mut cursor = Cursor::new(Arc::clone(session), Arc::clone(meta));
    let text = value.to_config_string();
    debug!("metadata put {} = {}", uri, text);
    cursor.put(uri.as_bytes(), text.as_bytes(), true)
}

pub fn meta_remove(
    session: &Arc<SessionInner>,
    meta: &Arc<BTree>,
    uri: &str,
) -> TimberVoid {
    let mut cursor = Cursor::new(Arc::clone(session), Arc::clone(meta));
    cursor.remove(uri.as_bytes())
}

/// All `(uri, config)` pairs, in key order.
pub fn meta_list(
    session: &Arc<SessionInner>,
    meta: &Arc<BTree>,
) -> TimberResult<Vec<(String, Config)>> {
    let mut cursor = Cursor::new(Arc::clone(session), Arc::clone(meta));
    let mut out = Vec::new();
    while let Some((key, value)) = cursor.next()? {
        let uri = String::from_utf8(key.row().to_vec())
            .map_err(|_| TimberError::corrupt("metadata key is not utf-8"))?;
        let text = String::from_utf8(value.to_vec())
            .map_err(|_| TimberError::corrupt("metadata value is not utf-8"))?;
        out.push((uri, Config::parse(&text)?));
    }
    Ok(out)
}

/// Update one file's checkpoint information in place.
pub fn meta_set_checkpoint(
    session: &Arc<SessionInner>,
    meta: &Arc<BTree>,
    uri: &str,
    ckpt: &BlockCheckpoint,
    ckpt_lsn: Lsn,
) -> TimberVoid {
    let mut config = meta_get(session, meta, uri)?;
    config.set("checkpoint", ckpt.to_hex());
    config.set(
        "checkpoint_lsn",
        format!("{},{}", ckpt_lsn.file, ckpt_lsn.offset),
    );
    meta_put(session, meta, uri, &config)
}

/// The bootstrap record: where the metadata table's own checkpoint
/// lives, plus the database checkpoint LSN.
#[derive(Debug, Clone, Default)]
pub struct BaseRecord {
    pub meta_ckpt: Option<BlockCheckpoint>,
    pub ckpt_lsn: Lsn,
}

pub fn base_path(home: &Path) -> PathBuf {
    home.join(BASE_FILE)
}

pub fn read_base(home: &Path) -> TimberResult<Option<BaseRecord>> {
    let path = base_path(home);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    let config = Config::parse(text.trim())?;
    let meta_ckpt = match config.get_str("checkpoint") {
        Some(hex) => Some(BlockCheckpoint::from_hex(hex)?),
        None => None,
    };
    let ckpt_lsn = config
        .get_pair("checkpoint_lsn")
        .map(|(f, o)| Lsn::new(f as u32, o))
        .unwrap_or_else(Lsn::zero);
    Ok(Some(BaseRecord {
        meta_ckpt,
        ckpt_lsn,
    }))
}

/// Publish a new base record: write-aside then rename, so a crash
/// leaves either the old record or the new one, never a torn file.
pub fn write_base(home: &Path, record: &BaseRecord) -> TimberVoid {
    let mut config = Config::new();
    if let Some(ckpt) = &record.meta_ckpt {
        config.set("checkpoint", ckpt.to_hex());
    }
    config.set(
        "checkpoint_lsn",
        format!("{},{}", record.ckpt_lsn.file, record.ckpt_lsn.offset),
    );

    let tmp = home.join(format!("{}.set", BASE_FILE));
    std::fs::write(&tmp, config.to_config_string())?;
    let file = std::fs::File::open(&tmp)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, base_path(home))?;
    sync_dir(home)?;
    Ok(())
}

/// The per-file metadata entry written at create time.
pub fn file_meta(
    file_id: u32,
    key_format: &str,
    value_format: &str,
    app_config: &Config,
) -> Config {
    let mut config = app_config.clone();
    config.set("id", file_id);
    config.set("key_format", key_format);
    config.set("value_format", value_format);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::io::Cookie;
    use tempfile::tempdir;

    #[test]
    fn test_base_round_trip() {
        let dir = tempdir().unwrap();
        assert!(read_base(dir.path()).unwrap().is_none());

        let record = BaseRecord {
            meta_ckpt: Some(BlockCheckpoint {
                root: Some(Cookie {
                    off: 4096,
                    size: 512,
                    checksum: 9,
                }),
                alloc: None,
                avail: None,
                discard: None,
                file_size: 8192,
            }),
            ckpt_lsn: Lsn::new(3, 1280),
        };
        write_base(dir.path(), &record).unwrap();

        let back = read_base(dir.path()).unwrap().unwrap();
        assert_eq!(back.ckpt_lsn, Lsn::new(3, 1280));
        let ckpt = back.meta_ckpt.unwrap();
        assert_eq!(ckpt.root.unwrap().off, 4096);
        assert_eq!(ckpt.file_size, 8192);
    }
}
