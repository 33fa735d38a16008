//! Snapshot iterator over user keys.

use std::sync::Arc;

use crate::db::DbInner;
use crate::error::Result;
use crate::key::{key_with_ts, parse_key, parse_ts};
use crate::value::{ValueStruct, BIT_DELETE, INTERNAL_KEY_PREFIX};
use crate::vlog::ReadGuard;

use super::{KvIterator, MergeIterator};

/// A key and its resolved value as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    key: Vec<u8>,
    value: Vec<u8>,
    version: u64,
    expires_at: u64,
    user_meta: u8,
    meta: u8,
}

impl Item {
    pub(crate) fn new(key: Vec<u8>, vs: &ValueStruct, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            version: vs.version,
            expires_at: vs.expires_at,
            user_meta: vs.user_meta,
            meta: vs.meta,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Value bytes. Empty for tombstones.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn user_meta(&self) -> u8 {
        self.user_meta
    }

    pub fn is_deleted(&self) -> bool {
        self.meta & BIT_DELETE != 0
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at != 0 && self.expires_at <= crate::value::now_secs()
    }

    pub fn is_deleted_or_expired(&self) -> bool {
        self.is_deleted() || self.is_expired()
    }
}

#[derive(Debug, Clone, Default)]
pub struct IteratorOptions {
    /// Walk keys in descending order.
    pub reverse: bool,
    /// Surface every version, tombstones and expired ones included.
    pub all_versions: bool,
    /// Only keys starting with this prefix.
    pub prefix: Vec<u8>,
    /// Only versions above this ts. 0 means no lower bound.
    pub since_ts: u64,
}

impl IteratorOptions {
    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn all_versions(mut self, all: bool) -> Self {
        self.all_versions = all;
        self
    }

    pub fn prefix(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn since_ts(mut self, ts: u64) -> Self {
        self.since_ts = ts;
        self
    }
}

/// Iterator over the database as of one read timestamp.
///
/// Value log files stay readable while it is alive. The cursor starts
/// unpositioned; call [`rewind`](Self::rewind) or [`seek`](Self::seek) first.
pub struct DbIterator {
    db: Arc<DbInner>,
    iter: MergeIterator,
    opts: IteratorOptions,
    read_ts: u64,
    /// Whether `read_ts` is registered with the oracle and must be released.
    owns_read: bool,
    item: Option<Item>,
    _guard: ReadGuard,
}

impl DbIterator {
    pub(crate) fn new(db: Arc<DbInner>, opts: IteratorOptions, read_ts: u64, owns_read: bool) -> Self {
        let (guard, sources) = db.iter_sources(opts.reverse);
        Self {
            iter: MergeIterator::new(sources, opts.reverse),
            db,
            opts,
            read_ts,
            owns_read,
            item: None,
            _guard: guard,
        }
    }

    pub fn read_ts(&self) -> u64 {
        self.read_ts
    }

    /// Positions at the first key, or the last one when reversed, within
    /// the prefix.
    pub fn rewind(&mut self) -> Result<()> {
        if self.opts.prefix.is_empty() {
            self.iter.rewind();
        } else if !self.opts.reverse {
            self.iter.seek(&key_with_ts(&self.opts.prefix, u64::MAX));
        } else {
            match prefix_successor(&self.opts.prefix) {
                Some(upper) => self.iter.seek(&key_with_ts(&upper, u64::MAX)),
                None => self.iter.rewind(),
            }
        }
        self.advance()
    }

    /// Positions at the first key `>= key`, or the last key `<= key` when
    /// reversed.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        if self.opts.reverse {
            self.iter.seek(&key_with_ts(key, 0));
        } else {
            self.iter.seek(&key_with_ts(key, u64::MAX));
        }
        self.advance()
    }

    pub fn next(&mut self) -> Result<()> {
        self.advance()
    }

    pub fn valid(&self) -> bool {
        self.item.is_some()
    }

    pub fn valid_for_prefix(&self, prefix: &[u8]) -> bool {
        self.item.as_ref().is_some_and(|i| i.key.starts_with(prefix))
    }

    pub fn item(&self) -> Option<&Item> {
        self.item.as_ref()
    }

    fn visible(&self, version: u64) -> bool {
        version <= self.read_ts && (self.opts.since_ts == 0 || version > self.opts.since_ts)
    }

    /// Whether scanning should stop at `user_key` because the prefix range
    /// has been left behind. Keys past it in scan order are skipped instead.
    fn past_prefix(&self, user_key: &[u8]) -> Option<bool> {
        let prefix = &self.opts.prefix;
        if prefix.is_empty() || user_key.starts_with(prefix) {
            return None;
        }
        let ahead = if self.opts.reverse {
            user_key < prefix.as_slice()
        } else {
            user_key > prefix.as_slice()
        };
        Some(ahead)
    }

    fn advance(&mut self) -> Result<()> {
        self.item = None;
        while self.iter.valid() {
            let user_key = parse_key(self.iter.key()).to_vec();
            if user_key.starts_with(INTERNAL_KEY_PREFIX) {
                self.skip_key(&user_key);
                continue;
            }
            match self.past_prefix(&user_key) {
                Some(true) => break,
                Some(false) => {
                    self.skip_key(&user_key);
                    continue;
                }
                None => {}
            }

            if self.opts.all_versions {
                let version = parse_ts(self.iter.key());
                let vs = self.iter.value();
                self.iter.next();
                if self.visible(version) {
                    self.item = Some(self.resolve(user_key, &vs)?);
                    return Ok(());
                }
                continue;
            }

            // Forward scans meet the newest version first, reverse scans last.
            let mut chosen: Option<ValueStruct> = None;
            while self.iter.valid() && parse_key(self.iter.key()) == user_key.as_slice() {
                let version = parse_ts(self.iter.key());
                if self.visible(version) && (self.opts.reverse || chosen.is_none()) {
                    chosen = Some(self.iter.value());
                }
                self.iter.next();
            }
            if let Some(vs) = chosen {
                if !vs.is_deleted_or_expired() {
                    self.item = Some(self.resolve(user_key, &vs)?);
                    return Ok(());
                }
            }
        }
        self.iter.check()
    }

    fn skip_key(&mut self, user_key: &[u8]) {
        while self.iter.valid() && parse_key(self.iter.key()) == user_key {
            self.iter.next();
        }
    }

    fn resolve(&self, key: Vec<u8>, vs: &ValueStruct) -> Result<Item> {
        let value = if vs.is_deleted_or_expired() {
            Vec::new()
        } else {
            self.db.resolve_value(vs)?
        };
        Ok(Item::new(key, vs, value))
    }
}

impl Drop for DbIterator {
    fn drop(&mut self) {
        if self.owns_read {
            self.db.oracle.done_read(self.read_ts);
        }
    }
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}
