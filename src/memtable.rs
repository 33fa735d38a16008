//! Memtable backed by a concurrent skip list and its own WAL.
//!
//! Writes go to the WAL first and then to the skip list. Keys are versioned
//! keys, so every version of a user key is a separate skip-list entry and
//! the newest version sorts first.
//!
//! # Lifecycle
//!
//! 1. **Active**: the single memtable accepting writes.
//! 2. **Immutable**: full, queued for flush in FIFO order.
//! 3. **Flushed**: turned into an L0 table; the WAL is deleted once the
//!    memtable is dropped.

use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::config::Options;
use crate::error::Result;
use crate::iterator::KvIterator;
use crate::key::{same_key, KeyTs};
use crate::logfile::LogFile;
use crate::value::{Entry, ValueStruct, BIT_FIN_TXN, BIT_TXN};

/// Per-entry bookkeeping charged against the memtable size.
pub(crate) const ENTRY_OVERHEAD: u64 = 64;

pub const MEMTABLE_EXT: &str = "mem";

pub fn mem_path(dir: &Path, fid: u32) -> PathBuf {
    dir.join(format!("{:05}.{}", fid, MEMTABLE_EXT))
}

pub fn parse_mem_fid(name: &str) -> Option<u32> {
    name.strip_suffix(".mem")?.parse().ok()
}

/// In-memory sorted table of versioned keys.
#[derive(Debug)]
pub struct MemTable {
    skl: SkipMap<KeyTs, ValueStruct>,
    wal: LogFile,
    size: AtomicU64,
    max_version: AtomicU64,
    memtable_size: u64,
}

impl MemTable {
    /// Creates an empty memtable with a fresh WAL.
    pub fn create(opts: &Options, fid: u32) -> Result<Self> {
        let wal = LogFile::create(mem_path(&opts.dir, fid), fid, opts.encryption_key.as_ref())?;
        Ok(Self::with_wal(wal, opts.memtable_size))
    }

    /// Opens the WAL of an earlier run and replays its committed entries.
    /// Anything past the last committed offset is truncated.
    pub fn open(opts: &Options, fid: u32) -> Result<Self> {
        let wal = LogFile::open(mem_path(&opts.dir, fid), fid, opts.encryption_key.as_ref())?;
        let mt = Self::with_wal(wal, opts.memtable_size);

        let size_before = mt.wal.size();
        let valid_end = mt.wal.iterate(0, |entry, _| {
            mt.insert(&entry);
            Ok(())
        })?;
        if valid_end < size_before {
            tracing::warn!(
                fid,
                valid_end,
                size = size_before,
                "Truncating WAL past last committed entry"
            );
        }
        mt.wal.truncate(valid_end)?;

        tracing::debug!(
            fid,
            entries = mt.skl.len(),
            max_version = mt.max_version(),
            "Replayed WAL"
        );
        Ok(mt)
    }

    fn with_wal(wal: LogFile, memtable_size: u64) -> Self {
        Self {
            skl: SkipMap::new(),
            wal,
            size: AtomicU64::new(0),
            max_version: AtomicU64::new(0),
            memtable_size,
        }
    }

    /// Appends `entry` to the WAL and inserts it. `entry.key` must already
    /// carry its version. Txn-end markers only reach the WAL.
    pub fn put(&self, entry: &Entry) -> Result<()> {
        self.wal.append_entry(entry)?;
        self.insert(entry);
        Ok(())
    }

    fn insert(&self, entry: &Entry) {
        if entry.meta & BIT_FIN_TXN != 0 {
            return;
        }
        let key = KeyTs::new(entry.key.clone());
        let version = key.version();
        let vs = ValueStruct {
            meta: entry.meta & !(BIT_TXN | BIT_FIN_TXN),
            user_meta: entry.user_meta,
            expires_at: entry.expires_at,
            value: entry.value.clone(),
            version,
        };
        let charged = (entry.key.len() + vs.encoded_size()) as u64 + ENTRY_OVERHEAD;
        self.skl.insert(key, vs);
        self.size.fetch_add(charged, Ordering::AcqRel);
        self.max_version.fetch_max(version, Ordering::AcqRel);
    }

    /// Newest version of the user key in `key` at or below its version.
    pub fn get(&self, key: &[u8]) -> Option<ValueStruct> {
        let target = KeyTs::new(key.to_vec());
        let entry = self.skl.lower_bound(Bound::Included(&target))?;
        if !same_key(entry.key().as_bytes(), key) {
            return None;
        }
        let mut vs = entry.value().clone();
        vs.version = entry.key().version();
        Some(vs)
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.memtable_size || u64::from(self.wal.size()) >= self.memtable_size
    }

    pub fn is_empty(&self) -> bool {
        self.skl.is_empty()
    }

    /// Bytes charged by inserted entries.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.skl.len()
    }

    pub fn max_version(&self) -> u64 {
        self.max_version.load(Ordering::Acquire)
    }

    pub fn fid(&self) -> u32 {
        self.wal.fid()
    }

    pub fn wal_size(&self) -> u32 {
        self.wal.size()
    }

    pub fn sync_wal(&self) -> Result<()> {
        self.wal.sync()
    }

    /// Removes the WAL once the last handle to this memtable goes away.
    pub fn delete_wal(&self) {
        self.wal.mark_for_deletion();
    }

    pub fn iter(self: &Arc<Self>, reversed: bool) -> MemTableIterator {
        MemTableIterator {
            mt: Arc::clone(self),
            reversed,
            current: None,
        }
    }
}

/// Cursor over a memtable. Each step re-seeks the skip list from the last
/// key, so concurrent inserts never invalidate it.
pub struct MemTableIterator {
    mt: Arc<MemTable>,
    reversed: bool,
    current: Option<(KeyTs, ValueStruct)>,
}

impl MemTableIterator {
    fn set(&mut self, entry: Option<crossbeam_skiplist::map::Entry<'_, KeyTs, ValueStruct>>) {
        self.current = entry.map(|e| {
            let mut vs = e.value().clone();
            vs.version = e.key().version();
            (e.key().clone(), vs)
        });
    }
}

impl KvIterator for MemTableIterator {
    fn rewind(&mut self) {
        let mt = Arc::clone(&self.mt);
        let entry = if self.reversed {
            mt.skl.back()
        } else {
            mt.skl.front()
        };
        self.set(entry);
    }

    fn seek(&mut self, key: &[u8]) {
        let mt = Arc::clone(&self.mt);
        let target = KeyTs::new(key.to_vec());
        let entry = if self.reversed {
            mt.skl.upper_bound(Bound::Included(&target))
        } else {
            mt.skl.lower_bound(Bound::Included(&target))
        };
        self.set(entry);
    }

    fn next(&mut self) {
        let Some((cur, _)) = self.current.take() else {
            return;
        };
        let mt = Arc::clone(&self.mt);
        let entry = if self.reversed {
            mt.skl.upper_bound(Bound::Excluded(&cur))
        } else {
            mt.skl.lower_bound(Bound::Excluded(&cur))
        };
        self.set(entry);
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[], |(k, _)| k.as_bytes())
    }

    fn value(&self) -> ValueStruct {
        self.current
            .as_ref()
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{key_with_ts, parse_key, parse_ts};
    use crate::value::{BIT_DELETE, TXN_KEY};
    use byteorder::{BigEndian, ByteOrder};
    use tempfile::TempDir;

    fn test_options(dir: &TempDir) -> Options {
        Options::new(dir.path()).memtable_size(1 << 20)
    }

    fn versioned(key: &str, ts: u64, value: &str) -> Entry {
        Entry::new(key_with_ts(key.as_bytes(), ts), value.as_bytes().to_vec())
    }

    fn marker(ts: u64) -> Entry {
        let mut v = [0u8; 8];
        BigEndian::write_u64(&mut v, ts);
        Entry {
            key: key_with_ts(TXN_KEY, ts),
            value: v.to_vec(),
            meta: BIT_FIN_TXN,
            ..Default::default()
        }
    }

    #[test]
    fn test_put_and_get_versions() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mt = MemTable::create(&test_options(&dir), 1).unwrap();

        mt.put(&versioned("k", 3, "v3")).unwrap();
        mt.put(&versioned("k", 7, "v7")).unwrap();
        mt.put(&versioned("other", 5, "o")).unwrap();

        assert_eq!(mt.get(&key_with_ts(b"k", 10)).unwrap().value, b"v7");
        let v = mt.get(&key_with_ts(b"k", 6)).unwrap();
        assert_eq!(v.value, b"v3");
        assert_eq!(v.version, 3);
        assert!(mt.get(&key_with_ts(b"k", 2)).is_none());
        assert!(mt.get(&key_with_ts(b"missing", 10)).is_none());
        assert_eq!(mt.max_version(), 7);
    }

    #[test]
    fn test_txn_marker_not_inserted() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mt = MemTable::create(&test_options(&dir), 1).unwrap();
        let mut e = versioned("a", 4, "x");
        e.meta |= BIT_TXN;
        mt.put(&e).unwrap();
        mt.put(&marker(4)).unwrap();
        assert_eq!(mt.len(), 1);
        assert_eq!(mt.get(&key_with_ts(b"a", 4)).unwrap().meta & BIT_TXN, 0);
    }

    #[test]
    fn test_replay_keeps_committed_prefix() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let opts = test_options(&dir);
        {
            let mt = MemTable::create(&opts, 2).unwrap();
            for (k, ts) in [("a", 1), ("b", 1)] {
                let mut e = versioned(k, ts, "committed");
                e.meta |= BIT_TXN;
                mt.put(&e).unwrap();
            }
            mt.put(&marker(1)).unwrap();
            mt.put(&versioned("plain", 2, "p")).unwrap();
            // A group that never got its marker.
            let mut e = versioned("c", 3, "lost");
            e.meta |= BIT_TXN;
            mt.put(&e).unwrap();
            mt.sync_wal().unwrap();
        }

        let mt = MemTable::open(&opts, 2).unwrap();
        assert_eq!(mt.len(), 3);
        assert!(mt.get(&key_with_ts(b"a", 9)).is_some());
        assert!(mt.get(&key_with_ts(b"plain", 9)).is_some());
        assert!(mt.get(&key_with_ts(b"c", 9)).is_none());
        assert_eq!(mt.max_version(), 2);

        let end = mt.wal_size();
        drop(mt);
        let len = std::fs::metadata(mem_path(dir.path(), 2)).unwrap().len();
        assert_eq!(len, u64::from(end), "uncommitted tail is truncated");
    }

    #[test]
    fn test_is_full_by_size() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let opts = Options::new(dir.path()).memtable_size(4096);
        let mt = MemTable::create(&opts, 3).unwrap();
        let mut ts = 1;
        while !mt.is_full() {
            mt.put(&versioned("key", ts, "0123456789abcdef")).unwrap();
            ts += 1;
        }
        assert!(mt.size() >= 4096 || mt.wal_size() >= 4096);
    }

    #[test]
    fn test_iterator_both_directions() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mt = Arc::new(MemTable::create(&test_options(&dir), 4).unwrap());
        mt.put(&versioned("a", 1, "a1")).unwrap();
        mt.put(&versioned("b", 2, "b2")).unwrap();
        mt.put(&versioned("b", 5, "b5")).unwrap();
        mt.put(&Entry {
            meta: BIT_DELETE,
            ..versioned("c", 3, "")
        })
        .unwrap();

        let mut it = mt.iter(false);
        it.rewind();
        let mut seen = Vec::new();
        while it.valid() {
            seen.push((parse_key(it.key()).to_vec(), parse_ts(it.key())));
            it.next();
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 1),
                (b"b".to_vec(), 5),
                (b"b".to_vec(), 2),
                (b"c".to_vec(), 3)
            ]
        );

        let mut it = mt.iter(true);
        it.rewind();
        assert_eq!(parse_key(it.key()), b"c");
        assert!(it.value().is_deleted_or_expired());
        it.seek(&key_with_ts(b"b", 0));
        assert_eq!(parse_ts(it.key()), 2);
        it.next();
        assert_eq!(parse_ts(it.key()), 5);
    }

    #[test]
    fn test_delete_wal_after_drop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mt = MemTable::create(&test_options(&dir), 5).unwrap();
        let path = mem_path(dir.path(), 5);
        assert!(path.exists());
        mt.delete_wal();
        drop(mt);
        assert!(!path.exists());
    }
}
