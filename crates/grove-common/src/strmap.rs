//! Insertion-ordered string map.
//!
//! `StrMap` is the launcher's universal container: spawn parameters, host
//! lists, PMI key/value databases, and every message on a tree channel
//! are all `StrMap`s. Entries keep their insertion order, which is also
//! the order they appear in on the wire, so a map printed on one node
//! reads the same on every node that receives it.
//!
//! Storage is a vector of `(key, value)` pairs with an `FxHashMap` index
//! for O(1) lookup. Overwriting a key keeps its original position.
//!
//! ## Pack format
//!
//! `pack` lays entries out as alternating NUL-terminated key and value
//! strings, terminated by an empty key string (a lone NUL). The 8-byte
//! length framing around the packed body is the wire codec's job, not
//! the map's.

use rustc_hash::FxHashMap;
use std::fmt;

use crate::error::{Result, SpawnError};

/// Insertion-ordered mapping from string key to string value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StrMap {
    entries: Vec<(String, String)>,
    index: FxHashMap<String, usize>,
}

impl StrMap {
    /// Create an empty map.
    pub fn new() -> Self {
        StrMap::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or overwrite a key. An overwritten key keeps its original
    /// insertion position. Keys must be non-empty; the empty key is the
    /// pack-format terminator.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        assert!(!key.is_empty(), "StrMap keys must be non-empty");
        let value = value.into();
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.index.get(key).map(|&i| self.entries[i].1.as_str())
    }

    /// Look up a key that the protocol requires to be present.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| SpawnError::protocol(format!("missing required key `{key}`")))
    }

    /// Look up a key and parse it as an integer.
    pub fn require_int<T>(&self, key: &str) -> Result<T>
    where
        T: std::str::FromStr,
    {
        let raw = self.require(key)?;
        raw.parse::<T>()
            .map_err(|_| SpawnError::protocol(format!("key `{key}` has non-numeric value `{raw}`")))
    }

    /// Merge another map into this one. Later keys overwrite earlier
    /// values; new keys append in the other map's order.
    pub fn merge(&mut self, other: &StrMap) {
        for (k, v) in other.iter() {
            self.set(k, v);
        }
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialize to the packed wire body.
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.packed_size());
        for (k, v) in &self.entries {
            buf.extend_from_slice(k.as_bytes());
            buf.push(0);
            buf.extend_from_slice(v.as_bytes());
            buf.push(0);
        }
        buf.push(0); // empty key terminates
        buf
    }

    /// Byte length `pack` will produce.
    pub fn packed_size(&self) -> usize {
        let body: usize = self
            .entries
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2)
            .sum();
        body + 1
    }

    /// Decode a packed wire body produced by `pack`.
    pub fn unpack(buf: &[u8]) -> Result<StrMap> {
        let mut map = StrMap::new();
        let mut pos = 0;
        loop {
            let key = read_cstr(buf, &mut pos)?;
            if key.is_empty() {
                break;
            }
            let value = read_cstr(buf, &mut pos)?;
            map.set(key, value);
        }
        Ok(map)
    }
}

/// Read one NUL-terminated UTF-8 string starting at `*pos`, advancing
/// `*pos` past the terminator.
fn read_cstr(buf: &[u8], pos: &mut usize) -> Result<String> {
    let rest = &buf[*pos..];
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| SpawnError::protocol("packed map truncated before NUL"))?;
    let s = std::str::from_utf8(&rest[..nul])
        .map_err(|_| SpawnError::protocol("packed map contains invalid UTF-8"))?;
    *pos += nul + 1;
    Ok(s.to_string())
}

impl fmt::Display for StrMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in self.iter() {
            writeln!(f, "  {k}={v}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_overwrite() {
        let mut m = StrMap::new();
        m.set("EXE", "/bin/hostname");
        m.set("PPN", "1");
        m.set("EXE", "/bin/true");
        assert_eq!(m.get("EXE"), Some("/bin/true"));
        assert_eq!(m.get("PPN"), Some("1"));
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn insertion_order_survives_overwrite() {
        let mut m = StrMap::new();
        m.set("a", "1");
        m.set("b", "2");
        m.set("a", "3");
        let keys: Vec<&str> = m.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn merge_overwrites_and_appends() {
        let mut m = StrMap::new();
        m.set("x", "1");
        m.set("y", "2");
        let mut other = StrMap::new();
        other.set("y", "20");
        other.set("z", "30");
        m.merge(&other);
        let entries: Vec<(&str, &str)> = m.iter().collect();
        assert_eq!(entries, vec![("x", "1"), ("y", "20"), ("z", "30")]);
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let mut m = StrMap::new();
        m.set("N", "4");
        m.set("DEG", "2");
        m.set("0", "node0");
        m.set("empty", "");
        let buf = m.pack();
        assert_eq!(buf.len(), m.packed_size());
        let decoded = StrMap::unpack(&buf).unwrap();
        assert_eq!(decoded, m);
        let keys: Vec<&str> = decoded.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["N", "DEG", "0", "empty"]);
    }

    #[test]
    fn empty_map_packs_to_single_nul() {
        let m = StrMap::new();
        assert_eq!(m.pack(), vec![0]);
        let decoded = StrMap::unpack(&[0]).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn unpack_rejects_truncation() {
        let mut m = StrMap::new();
        m.set("key", "value");
        let buf = m.pack();
        let err = StrMap::unpack(&buf[..buf.len() - 2]).unwrap_err();
        assert_eq!(err.kind(), "ProtocolError");
    }

    #[test]
    fn require_int_parses_and_rejects() {
        let mut m = StrMap::new();
        m.set("N", "128");
        m.set("DEG", "two");
        assert_eq!(m.require_int::<usize>("N").unwrap(), 128);
        assert!(m.require_int::<usize>("DEG").is_err());
        assert!(m.require_int::<usize>("MISSING").is_err());
    }

    #[test]
    fn display_prints_one_entry_per_line() {
        let mut m = StrMap::new();
        m.set("SH", "ssh");
        m.set("LOCAL", "direct");
        assert_eq!(m.to_string(), "  SH=ssh\n  LOCAL=direct\n");
    }
}
