//! Internal cursors over versioned keys.
//!
//! Every source the engine reads from (memtables, tables, whole levels)
//! exposes the same seekable cursor so that reads, snapshot scans and
//! compaction can stack them under one [`MergeIterator`].
//!
//! Forward cursors walk keys in [`compare_keys`] order, which is user key
//! ascending then version descending. Reversed cursors walk the exact
//! opposite order.

pub mod db;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::error::Result;
use crate::key::compare_keys;
use crate::table::{Table, TableIterator};
use crate::value::ValueStruct;

pub use db::{DbIterator, IteratorOptions, Item};

pub trait KvIterator: Send {
    /// Position at the first entry (last entry when reversed).
    fn rewind(&mut self);

    /// Position at the first entry `>= key`, or the last entry `<= key`
    /// when reversed.
    fn seek(&mut self, key: &[u8]);

    fn next(&mut self);

    fn valid(&self) -> bool;

    /// Current versioned key. Only meaningful while `valid()`.
    fn key(&self) -> &[u8];

    /// Current value, with `version` taken from the key.
    fn value(&self) -> ValueStruct;

    /// Reports a read failure that made the cursor stop early.
    fn check(&self) -> Result<()> {
        Ok(())
    }
}

struct HeapEntry {
    key: Vec<u8>,
    source: usize,
    reversed: bool,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap pops the greatest entry: the smallest key going forward,
    // the largest going backward, and on equal keys the lowest source.
    fn cmp(&self, other: &Self) -> Ordering {
        let by_key = if self.reversed {
            compare_keys(&self.key, &other.key)
        } else {
            compare_keys(&other.key, &self.key)
        };
        by_key.then_with(|| other.source.cmp(&self.source))
    }
}

/// N-way merge. Sources are ordered newest first; when two sources hold the
/// same versioned key only the newest source's entry is surfaced.
pub struct MergeIterator {
    iters: Vec<Box<dyn KvIterator>>,
    heap: BinaryHeap<HeapEntry>,
    reversed: bool,
}

impl MergeIterator {
    pub fn new(iters: Vec<Box<dyn KvIterator>>, reversed: bool) -> Self {
        Self {
            iters,
            heap: BinaryHeap::new(),
            reversed,
        }
    }

    fn push(&mut self, source: usize) {
        if self.iters[source].valid() {
            self.heap.push(HeapEntry {
                key: self.iters[source].key().to_vec(),
                source,
                reversed: self.reversed,
            });
        }
    }

    fn rebuild(&mut self) {
        self.heap.clear();
        for i in 0..self.iters.len() {
            self.push(i);
        }
    }

    fn top(&self) -> Option<&HeapEntry> {
        self.heap.peek()
    }
}

impl KvIterator for MergeIterator {
    fn rewind(&mut self) {
        for it in self.iters.iter_mut() {
            it.rewind();
        }
        self.rebuild();
    }

    fn seek(&mut self, key: &[u8]) {
        for it in self.iters.iter_mut() {
            it.seek(key);
        }
        self.rebuild();
    }

    fn next(&mut self) {
        let Some(top) = self.heap.pop() else {
            return;
        };
        self.iters[top.source].next();
        self.push(top.source);

        // Drop older copies of the same versioned key.
        while let Some(dup) = self.heap.peek() {
            if dup.key != top.key {
                break;
            }
            let source = dup.source;
            self.heap.pop();
            self.iters[source].next();
            self.push(source);
        }
    }

    fn valid(&self) -> bool {
        !self.heap.is_empty()
    }

    fn key(&self) -> &[u8] {
        match self.top() {
            Some(top) => self.iters[top.source].key(),
            None => &[],
        }
    }

    fn value(&self) -> ValueStruct {
        match self.top() {
            Some(top) => self.iters[top.source].value(),
            None => ValueStruct::default(),
        }
    }

    fn check(&self) -> Result<()> {
        for it in &self.iters {
            it.check()?;
        }
        Ok(())
    }
}

/// Walks the sorted, non-overlapping tables of one level as a single run.
pub struct ConcatIterator {
    tables: Vec<Arc<Table>>,
    idx: Option<usize>,
    cur: Option<TableIterator>,
    reversed: bool,
}

impl ConcatIterator {
    pub fn new(tables: Vec<Arc<Table>>, reversed: bool) -> Self {
        Self {
            tables,
            idx: None,
            cur: None,
            reversed,
        }
    }

    fn set_idx(&mut self, idx: Option<usize>) {
        if idx == self.idx && self.cur.is_some() {
            return;
        }
        self.idx = idx;
        self.cur = idx.map(|i| self.tables[i].iter(self.reversed));
    }

    /// Moves to neighbouring tables until the cursor is valid or runs out.
    fn settle(&mut self) {
        loop {
            let Some(i) = self.idx else {
                return;
            };
            match &self.cur {
                None => return,
                Some(cur) if cur.valid() || cur.check().is_err() => return,
                Some(_) => {}
            }
            let next = if self.reversed {
                i.checked_sub(1)
            } else if i + 1 < self.tables.len() {
                Some(i + 1)
            } else {
                None
            };
            match next {
                Some(n) => {
                    self.set_idx(Some(n));
                    if let Some(cur) = self.cur.as_mut() {
                        cur.rewind();
                    }
                }
                None => {
                    self.cur = None;
                    self.idx = None;
                    return;
                }
            }
        }
    }
}

impl KvIterator for ConcatIterator {
    fn rewind(&mut self) {
        if self.tables.is_empty() {
            self.set_idx(None);
            return;
        }
        let idx = if self.reversed { self.tables.len() - 1 } else { 0 };
        self.set_idx(Some(idx));
        if let Some(cur) = self.cur.as_mut() {
            cur.rewind();
        }
        self.settle();
    }

    fn seek(&mut self, key: &[u8]) {
        let idx = if self.reversed {
            let n = self
                .tables
                .partition_point(|t| compare_keys(t.smallest(), key) != Ordering::Greater);
            n.checked_sub(1)
        } else {
            let n = self
                .tables
                .partition_point(|t| compare_keys(t.biggest(), key) == Ordering::Less);
            (n < self.tables.len()).then_some(n)
        };
        self.set_idx(idx);
        if let Some(cur) = self.cur.as_mut() {
            cur.seek(key);
        }
        self.settle();
    }

    fn next(&mut self) {
        if let Some(cur) = self.cur.as_mut() {
            cur.next();
        }
        self.settle();
    }

    fn valid(&self) -> bool {
        self.cur.as_ref().is_some_and(|c| c.valid())
    }

    fn key(&self) -> &[u8] {
        self.cur.as_ref().map_or(&[], |c| c.key())
    }

    fn value(&self) -> ValueStruct {
        self.cur.as_ref().map(|c| c.value()).unwrap_or_default()
    }

    fn check(&self) -> Result<()> {
        match &self.cur {
            Some(c) => c.check(),
            None => Ok(()),
        }
    }
}

/// In-memory cursor used by unit tests across the crate.
#[cfg(test)]
pub(crate) struct VecIterator {
    entries: Vec<(Vec<u8>, ValueStruct)>,
    pos: Option<usize>,
    reversed: bool,
}

#[cfg(test)]
impl VecIterator {
    pub(crate) fn new(mut entries: Vec<(Vec<u8>, ValueStruct)>, reversed: bool) -> Self {
        entries.sort_by(|a, b| compare_keys(&a.0, &b.0));
        Self {
            entries,
            pos: None,
            reversed,
        }
    }
}

#[cfg(test)]
impl KvIterator for VecIterator {
    fn rewind(&mut self) {
        self.pos = if self.entries.is_empty() {
            None
        } else if self.reversed {
            Some(self.entries.len() - 1)
        } else {
            Some(0)
        };
    }

    fn seek(&mut self, key: &[u8]) {
        if self.reversed {
            let n = self
                .entries
                .partition_point(|(k, _)| compare_keys(k, key) != Ordering::Greater);
            self.pos = n.checked_sub(1);
        } else {
            let n = self
                .entries
                .partition_point(|(k, _)| compare_keys(k, key) == Ordering::Less);
            self.pos = (n < self.entries.len()).then_some(n);
        }
    }

    fn next(&mut self) {
        self.pos = match self.pos {
            Some(p) if self.reversed => p.checked_sub(1),
            Some(p) if p + 1 < self.entries.len() => Some(p + 1),
            _ => None,
        };
    }

    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn key(&self) -> &[u8] {
        self.pos.map_or(&[], |p| &self.entries[p].0)
    }

    fn value(&self) -> ValueStruct {
        self.pos.map(|p| self.entries[p].1.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{key_with_ts, parse_key, parse_ts};

    fn vs(v: &str) -> ValueStruct {
        ValueStruct {
            value: v.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    fn source(items: &[(&str, u64, &str)], reversed: bool) -> Box<dyn KvIterator> {
        Box::new(VecIterator::new(
            items
                .iter()
                .map(|(k, ts, v)| (key_with_ts(k.as_bytes(), *ts), vs(v)))
                .collect(),
            reversed,
        ))
    }

    fn drain(it: &mut dyn KvIterator) -> Vec<(String, u64, String)> {
        let mut out = Vec::new();
        while it.valid() {
            out.push((
                String::from_utf8(parse_key(it.key()).to_vec()).unwrap(),
                parse_ts(it.key()),
                String::from_utf8(it.value().value).unwrap(),
            ));
            it.next();
        }
        out
    }

    #[test]
    fn test_merge_orders_keys_and_versions() {
        let newer = source(&[("a", 5, "a5"), ("c", 3, "c3")], false);
        let older = source(&[("a", 2, "a2"), ("b", 1, "b1")], false);
        let mut it = MergeIterator::new(vec![newer, older], false);
        it.rewind();
        let got = drain(&mut it);
        assert_eq!(
            got,
            vec![
                ("a".into(), 5, "a5".into()),
                ("a".into(), 2, "a2".into()),
                ("b".into(), 1, "b1".into()),
                ("c".into(), 3, "c3".into()),
            ]
        );
    }

    #[test]
    fn test_merge_prefers_newest_source_on_duplicates() {
        let newer = source(&[("k", 7, "new")], false);
        let older = source(&[("k", 7, "old"), ("z", 1, "z")], false);
        let mut it = MergeIterator::new(vec![newer, older], false);
        it.rewind();
        let got = drain(&mut it);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].2, "new");
        assert_eq!(got[1].0, "z");
    }

    #[test]
    fn test_merge_reverse_and_seek() {
        let a = source(&[("a", 1, "a"), ("c", 1, "c")], true);
        let b = source(&[("b", 1, "b"), ("d", 1, "d")], true);
        let mut it = MergeIterator::new(vec![a, b], true);
        it.rewind();
        let keys: Vec<String> = drain(&mut it).into_iter().map(|e| e.0).collect();
        assert_eq!(keys, vec!["d", "c", "b", "a"]);

        it.seek(&key_with_ts(b"c", 0));
        assert!(it.valid());
        assert_eq!(parse_key(it.key()), b"c");
    }

    #[test]
    fn test_merge_forward_seek_lands_on_newest_visible() {
        let a = source(&[("k", 9, "v9"), ("k", 4, "v4"), ("m", 2, "m")], false);
        let mut it = MergeIterator::new(vec![a], false);
        it.seek(&key_with_ts(b"k", 5));
        assert_eq!(parse_ts(it.key()), 4);
    }
}
