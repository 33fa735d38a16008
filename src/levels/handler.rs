use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::iterator::{ConcatIterator, KvIterator};
use crate::key::compare_keys;
use crate::table::Table;
use crate::value::ValueStruct;

use super::status::KeyRange;

#[derive(Default)]
struct LevelTables {
    tables: Vec<Arc<Table>>,
    total_size: u64,
    stale_size: u64,
}

impl LevelTables {
    fn recompute(&mut self, level: usize) {
        if level == 0 {
            self.tables.sort_by_key(|t| t.id());
        } else {
            self.tables
                .sort_by(|a, b| compare_keys(a.smallest(), b.smallest()));
        }
        self.total_size = self.tables.iter().map(|t| t.size()).sum();
        self.stale_size = self.tables.iter().map(|t| t.stale_data_size()).sum();
    }
}

/// Tables of one level. L0 is kept in flush order (oldest first) and its
/// tables may overlap; deeper levels are sorted by smallest key and never
/// overlap.
pub struct LevelHandler {
    level: usize,
    inner: RwLock<LevelTables>,
}

impl LevelHandler {
    pub fn new(level: usize) -> Self {
        Self {
            level,
            inner: RwLock::new(LevelTables::default()),
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn init_tables(&self, tables: Vec<Arc<Table>>) {
        let mut inner = self.inner.write();
        inner.tables = tables;
        inner.recompute(self.level);
    }

    pub fn add_table(&self, table: Arc<Table>) {
        let mut inner = self.inner.write();
        inner.tables.push(table);
        inner.recompute(self.level);
    }

    /// Swaps `to_del` for `to_add` in one step.
    pub fn replace_tables(&self, to_del: &[Arc<Table>], to_add: &[Arc<Table>]) {
        let mut inner = self.inner.write();
        inner
            .tables
            .retain(|t| !to_del.iter().any(|d| d.id() == t.id()));
        inner.tables.extend(to_add.iter().cloned());
        inner.recompute(self.level);
    }

    pub fn delete_tables(&self, to_del: &[Arc<Table>]) {
        self.replace_tables(to_del, &[]);
    }

    /// Snapshot of the level's tables.
    pub fn tables(&self) -> Vec<Arc<Table>> {
        self.inner.read().tables.clone()
    }

    pub fn num_tables(&self) -> usize {
        self.inner.read().tables.len()
    }

    pub fn total_size(&self) -> u64 {
        self.inner.read().total_size
    }

    pub fn stale_size(&self) -> u64 {
        self.inner.read().stale_size
    }

    /// Newest version of the key's user key at or below its version.
    pub fn get(&self, key: &[u8]) -> Result<Option<ValueStruct>> {
        let tables = self.inner.read().tables.clone();
        if self.level == 0 {
            let mut best: Option<ValueStruct> = None;
            for t in tables.iter().rev() {
                if let Some(vs) = t.get(key)? {
                    if best.as_ref().map_or(true, |b| vs.version > b.version) {
                        best = Some(vs);
                    }
                }
            }
            return Ok(best);
        }

        let idx = tables.partition_point(|t| compare_keys(t.biggest(), key) == Ordering::Less);
        match tables.get(idx) {
            Some(t) => t.get(key),
            None => Ok(None),
        }
    }

    /// Read cursors for this level: one per table on L0, newest first, and
    /// a single concatenating cursor elsewhere.
    pub fn iterators(&self, reversed: bool) -> Vec<Box<dyn KvIterator>> {
        let tables = self.tables();
        if tables.is_empty() {
            return Vec::new();
        }
        if self.level == 0 {
            return tables
                .iter()
                .rev()
                .map(|t| Box::new(t.iter(reversed)) as Box<dyn KvIterator>)
                .collect();
        }
        vec![Box::new(ConcatIterator::new(tables, reversed))]
    }
}

/// Half-open index range of the key-sorted `tables` that intersect `kr`.
pub fn overlapping_tables(tables: &[Arc<Table>], kr: &KeyRange) -> (usize, usize) {
    if kr.left.is_empty() || kr.right.is_empty() {
        return (0, 0);
    }
    let left = tables.partition_point(|t| compare_keys(&kr.left, t.biggest()) == Ordering::Greater);
    let right = tables.partition_point(|t| compare_keys(&kr.right, t.smallest()) != Ordering::Less);
    (left, right.max(left))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::key_with_ts;
    use crate::table::tests::build_table;
    use tempfile::TempDir;

    #[test]
    fn test_l0_get_picks_newest_version() -> Result<()> {
        let dir = TempDir::new()?;
        let h = LevelHandler::new(0);
        h.add_table(build_table(dir.path(), 1, &[("a", 1, "old"), ("b", 1, "b")]));
        h.add_table(build_table(dir.path(), 2, &[("a", 3, "new")]));

        let vs = h.get(&key_with_ts(b"a", 10))?.unwrap();
        assert_eq!((vs.version, vs.value.as_slice()), (3, b"new".as_slice()));
        let vs = h.get(&key_with_ts(b"a", 2))?.unwrap();
        assert_eq!(vs.value, b"old");
        assert!(h.get(&key_with_ts(b"c", 10))?.is_none());
        Ok(())
    }

    #[test]
    fn test_sorted_level_get_and_overlap() -> Result<()> {
        let dir = TempDir::new()?;
        let h = LevelHandler::new(1);
        h.init_tables(vec![
            build_table(dir.path(), 2, &[("m", 1, "m"), ("p", 1, "p")]),
            build_table(dir.path(), 1, &[("a", 1, "a"), ("c", 1, "c")]),
        ]);
        let tables = h.tables();
        assert_eq!(tables[0].id(), 1);

        assert_eq!(h.get(&key_with_ts(b"p", 5))?.unwrap().value, b"p");
        assert!(h.get(&key_with_ts(b"z", 5))?.is_none());

        let kr = |l: &str, r: &str| KeyRange {
            left: key_with_ts(l.as_bytes(), u64::MAX),
            right: key_with_ts(r.as_bytes(), 0),
            inf: false,
        };
        assert_eq!(overlapping_tables(&tables, &kr("b", "n")), (0, 2));
        assert_eq!(overlapping_tables(&tables, &kr("d", "e")), (1, 1));
        assert_eq!(overlapping_tables(&tables, &kr("n", "z")), (1, 2));
        assert_eq!(overlapping_tables(&tables, &KeyRange::default()), (0, 0));
        Ok(())
    }

    #[test]
    fn test_replace_tables_updates_sizes() -> Result<()> {
        let dir = TempDir::new()?;
        let h = LevelHandler::new(1);
        let a = build_table(dir.path(), 1, &[("a", 1, "a")]);
        let b = build_table(dir.path(), 2, &[("b", 1, "b")]);
        h.init_tables(vec![a.clone()]);
        let before = h.total_size();
        h.replace_tables(&[a], &[b.clone()]);
        assert_eq!(h.num_tables(), 1);
        assert_eq!(h.tables()[0].id(), 2);
        assert_eq!(h.total_size(), b.size());
        assert!(before > 0);
        Ok(())
    }
}
