//! Versioned keys.
//!
//! Every user key stored by the engine carries an 8-byte big-endian suffix
//! holding `u64::MAX - version`. Raw byte order therefore places newer
//! versions of the same user key first, but comparing two different user
//! keys still needs [`compare_keys`] because one may be a prefix of the other.

use std::cmp::Ordering;

/// Width of the version suffix.
pub const TS_SIZE: usize = 8;

/// Appends the inverted version suffix to `key`.
pub fn key_with_ts(key: &[u8], ts: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + TS_SIZE);
    out.extend_from_slice(key);
    out.extend_from_slice(&(u64::MAX - ts).to_be_bytes());
    out
}

/// Extracts the version from a versioned key. Keys too short to carry a
/// suffix have version 0.
pub fn parse_ts(key: &[u8]) -> u64 {
    if key.len() < TS_SIZE {
        return 0;
    }
    let mut buf = [0u8; TS_SIZE];
    buf.copy_from_slice(&key[key.len() - TS_SIZE..]);
    u64::MAX - u64::from_be_bytes(buf)
}

/// Strips the version suffix.
pub fn parse_key(key: &[u8]) -> &[u8] {
    &key[..key.len().saturating_sub(TS_SIZE)]
}

/// True when both versioned keys carry the same user key.
pub fn same_key(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && parse_key(a) == parse_key(b)
}

/// Orders versioned keys by user key ascending, then version descending.
pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
    parse_key(a)
        .cmp(parse_key(b))
        .then_with(|| a[a.len().saturating_sub(TS_SIZE)..].cmp(&b[b.len().saturating_sub(TS_SIZE)..]))
}

/// Owned versioned key whose `Ord` follows [`compare_keys`]; used as the
/// skiplist key of memtables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyTs(Vec<u8>);

impl KeyTs {
    pub fn new(key: Vec<u8>) -> Self {
        Self(key)
    }

    pub fn with_ts(user_key: &[u8], ts: u64) -> Self {
        Self(key_with_ts(user_key, ts))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn user_key(&self) -> &[u8] {
        parse_key(&self.0)
    }

    pub fn version(&self) -> u64 {
        parse_ts(&self.0)
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl Ord for KeyTs {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&self.0, &other.0)
    }
}

impl PartialOrd for KeyTs {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_roundtrip() {
        let k = key_with_ts(b"apple", 42);
        assert_eq!(k.len(), 5 + TS_SIZE);
        assert_eq!(parse_ts(&k), 42);
        assert_eq!(parse_key(&k), b"apple");
    }

    #[test]
    fn test_newer_versions_sort_first() {
        let old = key_with_ts(b"k", 1);
        let new = key_with_ts(b"k", 9);
        assert_eq!(compare_keys(&new, &old), Ordering::Less);
        assert!(new < old, "raw byte order must agree for equal user keys");
    }

    #[test]
    fn test_prefix_user_keys_compare_by_user_key() {
        // Raw bytes would put "ab" before "a" here since the suffix of "a"
        // starts with 0xff.
        let a = key_with_ts(b"a", 5);
        let ab = key_with_ts(b"ab", 5);
        assert_eq!(compare_keys(&a, &ab), Ordering::Less);
        assert!(KeyTs::new(a) < KeyTs::new(ab));
    }

    #[test]
    fn test_same_key() {
        assert!(same_key(&key_with_ts(b"x", 1), &key_with_ts(b"x", 100)));
        assert!(!same_key(&key_with_ts(b"x", 1), &key_with_ts(b"y", 1)));
    }

    #[test]
    fn test_short_keys_do_not_panic() {
        assert_eq!(parse_ts(b"abc"), 0);
        assert_eq!(parse_key(b"abc"), b"");
    }
}
