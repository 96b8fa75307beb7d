use std::collections::HashMap;

use crate::error::{TimberError, TimberResult};

/// Parsed configuration string.
///
/// The grammar is comma-separated `key[=value]` items. Values are bare
/// words, quoted strings, or parenthesized nested lists; nested lists
/// are flattened into dotted keys, so `checkpoint=(wait=60)` is read
/// back as `checkpoint.wait`. A bare key is the boolean `true`. Sizes
/// accept `K`/`M`/`G`/`T` suffixes.
#[derive(Debug, Clone, Default)]
pub struct Config {
    map: HashMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn parse(source: &str) -> TimberResult<Self> {
        let mut config = Self::new();
        config.merge_str("", source)?;
        Ok(config)
    }

    /// Parse `source`, layering it over the existing entries. Later
    /// settings win, which gives "defaults then user config" layering.
    pub fn merge(&mut self, source: &str) -> TimberResult<()> {
        self.merge_str("", source)
    }

    fn merge_str(&mut self, prefix: &str, source: &str) -> TimberResult<()> {
        for item in split_top_level(source)? {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = match find_eq(item) {
                Some(pos) => (item[..pos].trim(), item[pos + 1..].trim()),
                None => (item, "true"),
            };
            if key.is_empty() {
                return Err(TimberError::Config(format!("empty key in {:?}", item)));
            }
            let full_key = if prefix.is_empty() {
                key.to_string()
            } else {
                format!("{}.{}", prefix, key)
            };
            if value.starts_with('(') && value.ends_with(')') {
                let inner = &value[1..value.len() - 1];
                if inner.contains('=') {
                    self.merge_str(&full_key, inner)?;
                } else {
                    // value list, e.g. checkpoint_lsn=(1,128)
                    self.map.insert(full_key, inner.to_string());
                }
            } else {
                let value = value.trim_matches('"');
                self.map.insert(full_key, value.to_string());
            }
        }
        Ok(())
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn has(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get_str(key).unwrap_or(default).to_string()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_str(key) {
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(_) | None => default,
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.get_str(key) {
            Some(v) => parse_size(v).unwrap_or(default),
            None => default,
        }
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get_u64(key, default as u64) as usize
    }

    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get_u64(key, default as u64) as u32
    }

    /// A `(a,b)` pair value, as used by `checkpoint_lsn=(file,offset)`.
    pub fn get_pair(&self, key: &str) -> Option<(u64, u64)> {
        let raw = self.get_str(key)?;
        let mut it = raw.splitn(2, ',');
        let a = it.next()?.trim().parse().ok()?;
        let b = it.next()?.trim().parse().ok()?;
        Some((a, b))
    }

    /// Render back to a config string with deterministic key order.
    pub fn to_config_string(&self) -> String {
        let mut keys: Vec<&String> = self.map.keys().collect();
        keys.sort();
        keys.iter()
            .map(|k| {
                let v = &self.map[*k];
                if v.contains(',') {
                    format!("{}=({})", k, v)
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Split a config body on top-level commas, respecting parentheses and
/// double quotes.
fn split_top_level(source: &str) -> TimberResult<Vec<&str>> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut start = 0usize;
    for (i, c) in source.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| TimberError::Config(format!("unbalanced ')' in {:?}", source)))?
            }
            ',' if depth == 0 && !in_quote => {
                items.push(&source[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 || in_quote {
        return Err(TimberError::Config(format!(
            "unbalanced parentheses or quotes in {:?}",
            source
        )));
    }
    items.push(&source[start..]);
    Ok(items)
}

/// Position of the key/value '=' (the first one outside quotes).
fn find_eq(item: &str) -> Option<usize> {
    let mut in_quote = false;
    for (i, c) in item.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            '=' if !in_quote => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (digits, mult) = match value.chars().last().unwrap() {
        'k' | 'K' => (&value[..value.len() - 1], 1u64 << 10),
        'm' | 'M' => (&value[..value.len() - 1], 1u64 << 20),
        'g' | 'G' => (&value[..value.len() - 1], 1u64 << 30),
        't' | 'T' => (&value[..value.len() - 1], 1u64 << 40),
        _ => (value, 1),
    };
    digits.trim().parse::<u64>().ok().map(|v| v * mult)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_items() {
        let c = Config::parse("cache_size=32M,isolation=snapshot,prefix_compression").unwrap();
        assert_eq!(c.get_u64("cache_size", 0), 32 << 20);
        assert_eq!(c.get_str("isolation"), Some("snapshot"));
        assert!(c.get_bool("prefix_compression", false));
        assert!(!c.get_bool("no_such_key", false));
    }

    #[test]
    fn test_nested_flattening() {
        let c = Config::parse("log=(enabled=true,file_max=1M,path=wal),checkpoint=(wait=60)")
            .unwrap();
        assert!(c.get_bool("log.enabled", false));
        assert_eq!(c.get_u64("log.file_max", 0), 1 << 20);
        assert_eq!(c.get_str("log.path"), Some("wal"));
        assert_eq!(c.get_u64("checkpoint.wait", 0), 60);
    }

    #[test]
    fn test_pair_value() {
        let c = Config::parse("checkpoint_lsn=(3,12800)").unwrap();
        assert_eq!(c.get_pair("checkpoint_lsn"), Some((3, 12800)));
    }

    #[test]
    fn test_layering() {
        let mut c = Config::parse("leaf_page_max=32K,split_pct=75").unwrap();
        c.merge("leaf_page_max=4K").unwrap();
        assert_eq!(c.get_u64("leaf_page_max", 0), 4 << 10);
        assert_eq!(c.get_u64("split_pct", 0), 75);
    }

    #[test]
    fn test_unbalanced_is_error() {
        assert!(Config::parse("log=(enabled=true").is_err());
    }

    #[test]
    fn test_round_trip_config_string() {
        let c = Config::parse("id=7,key_format=u,checkpoint_lsn=(1,128)").unwrap();
        let rendered = c.to_config_string();
        let back = Config::parse(&rendered).unwrap();
        assert_eq!(back.get_u64("id", 0), 7);
        assert_eq!(back.get_pair("checkpoint_lsn"), Some((1, 128)));
    }
}
