//! The leveled LSM tree below the memtables.
//!
//! L0 receives flushed memtables and may hold overlapping tables. Every
//! deeper level holds non-overlapping tables sorted by key. Compaction
//! moves data downwards and is driven by per-level size targets that grow
//! by a constant multiplier from the base level down.

pub mod compact;
pub mod handler;
pub mod status;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::config::Options;
use crate::error::Result;
use crate::iterator::KvIterator;
use crate::key::parse_ts;
use crate::manifest::{revert_to_manifest, ManifestChange, ManifestFile};
use crate::table::{table_path, Table};
use crate::value::ValueStruct;
use crate::vlog::ValueLog;
use crate::Error;

pub use compact::{CompactionPriority, Targets};
use handler::LevelHandler;
use status::CompactStatus;

/// Summary of one level, as reported by [`LevelsController::level_info`].
#[derive(Debug, Clone)]
pub struct LevelInfo {
    pub level: usize,
    pub num_tables: usize,
    pub size: u64,
    pub stale_size: u64,
    pub target_size: u64,
    pub target_file_size: u64,
    pub is_base_level: bool,
    pub score: f64,
    pub adjusted: f64,
}

/// Summary of one table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub id: u64,
    pub level: usize,
    pub left: Vec<u8>,
    pub right: Vec<u8>,
    pub key_count: u64,
    pub on_disk_size: u64,
    pub stale_data_size: u64,
    pub max_version: u64,
}

pub struct LevelsController {
    dir: PathBuf,
    opts: Options,
    levels: Vec<LevelHandler>,
    cstatus: RwLock<CompactStatus>,
    manifest: ManifestFile,
    next_file_id: AtomicU64,
    vlog: Arc<ValueLog>,
    max_level_gate: compact::StaleGate,
}

impl LevelsController {
    /// Replays the manifest, drops table files it does not know about and
    /// opens the rest.
    pub fn open(opts: &Options, vlog: Arc<ValueLog>) -> Result<Self> {
        let dir = opts.dir.clone();
        let (manifest_file, manifest) = ManifestFile::open_or_create(&dir)?;
        revert_to_manifest(&dir, &manifest)?;

        let mut per_level: Vec<Vec<Arc<Table>>> = vec![Vec::new(); opts.max_levels];
        let mut max_id = 0u64;
        for (id, tm) in &manifest.tables {
            if tm.level >= opts.max_levels {
                return Err(Error::ManifestCorrupt(format!(
                    "table {} is on level {} but only {} levels are configured",
                    id, tm.level, opts.max_levels
                )));
            }
            let table = Table::open(table_path(&dir, *id), *id)?;
            per_level[tm.level].push(Arc::new(table));
            max_id = max_id.max(*id);
        }

        let levels: Vec<LevelHandler> = (0..opts.max_levels).map(LevelHandler::new).collect();
        for (handler, tables) in levels.iter().zip(per_level) {
            handler.init_tables(tables);
        }

        tracing::info!(
            tables = manifest.tables.len(),
            next_file_id = max_id + 1,
            "Opened levels"
        );
        Ok(Self {
            dir,
            cstatus: RwLock::new(CompactStatus::new(opts.max_levels)),
            opts: opts.clone(),
            levels,
            manifest: manifest_file,
            next_file_id: AtomicU64::new(max_id + 1),
            vlog,
            max_level_gate: compact::StaleGate::default(),
        })
    }

    pub fn reserve_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn num_l0_tables(&self) -> usize {
        self.levels[0].num_tables()
    }

    /// Registers a flushed table on L0. The manifest records it first; the
    /// table only becomes visible once L0 is below the stall threshold.
    pub async fn add_l0_table(&self, table: Arc<Table>) -> Result<()> {
        self.manifest.add_changes(vec![ManifestChange::create(
            table.id(),
            0,
            0,
            table.compression(),
        )])?;

        let stall = self.opts.num_level_zero_tables_stall;
        let mut stalled_since: Option<Instant> = None;
        while self.opts.num_compactors > 0 && self.levels[0].num_tables() >= stall {
            if stalled_since.is_none() {
                tracing::warn!(l0_tables = self.levels[0].num_tables(), stall, "L0 is full, stalling flush");
                stalled_since = Some(Instant::now());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if let Some(since) = stalled_since {
            tracing::info!(stalled_ms = since.elapsed().as_millis() as u64, "L0 stall cleared");
        }

        tracing::debug!(table_id = table.id(), size = table.size(), "Added table to L0");
        self.levels[0].add_table(table);
        Ok(())
    }

    /// Newest value for `key`'s user key at or below its version, searching
    /// from L0 downwards.
    pub fn get(&self, key: &[u8]) -> Result<Option<ValueStruct>> {
        let version = parse_ts(key);
        let mut best: Option<ValueStruct> = None;
        for h in &self.levels {
            if let Some(vs) = h.get(key)? {
                if vs.version == version {
                    return Ok(Some(vs));
                }
                if best.as_ref().map_or(true, |b| vs.version > b.version) {
                    best = Some(vs);
                }
            }
        }
        Ok(best)
    }

    /// Read cursors over every level, newest data first.
    pub fn append_iterators(&self, iters: &mut Vec<Box<dyn KvIterator>>, reversed: bool) {
        for h in &self.levels {
            iters.extend(h.iterators(reversed));
        }
    }

    pub fn max_version(&self) -> u64 {
        self.levels
            .iter()
            .flat_map(|h| h.tables())
            .map(|t| t.max_version())
            .max()
            .unwrap_or(0)
    }

    /// On-disk bytes of all tables.
    pub fn size(&self) -> u64 {
        self.levels.iter().map(|h| h.total_size()).sum()
    }

    pub fn level_info(&self) -> Vec<LevelInfo> {
        let targets = self.level_targets();
        let prios = self.level_scores(&targets);
        self.levels
            .iter()
            .enumerate()
            .map(|(i, h)| LevelInfo {
                level: i,
                num_tables: h.num_tables(),
                size: h.total_size(),
                stale_size: h.stale_size(),
                target_size: targets.target_sz[i],
                target_file_size: targets.file_sz[i],
                is_base_level: targets.base_level == i,
                score: prios[i].score,
                adjusted: prios[i].adjusted,
            })
            .collect()
    }

    pub fn table_info(&self) -> Vec<TableInfo> {
        let mut out = Vec::new();
        for (level, h) in self.levels.iter().enumerate() {
            for t in h.tables() {
                out.push(TableInfo {
                    id: t.id(),
                    level,
                    left: t.smallest().to_vec(),
                    right: t.biggest().to_vec(),
                    key_count: t.key_count(),
                    on_disk_size: t.size(),
                    stale_data_size: t.stale_data_size(),
                    max_version: t.max_version(),
                });
            }
        }
        out.sort_by(|a, b| a.level.cmp(&b.level).then(a.id.cmp(&b.id)));
        out
    }

    /// Reads and checks every block of every table.
    pub fn verify_checksum(&self) -> Result<()> {
        for h in &self.levels {
            for t in h.tables() {
                t.verify_checksum()?;
            }
        }
        Ok(())
    }

    /// Bytes the value log should consider reclaimable, per file.
    pub(crate) fn record_discards(&self, stats: &HashMap<u32, u64>) -> Result<()> {
        if stats.is_empty() {
            return Ok(());
        }
        self.vlog.update_discard_stats(stats)
    }

    /// Removes every table from every level and returns how many there
    /// were. Files leave the disk once no reader holds them.
    pub fn drop_tree(&self) -> Result<usize> {
        let all: Vec<Arc<Table>> = self.levels.iter().flat_map(|h| h.tables()).collect();
        if all.is_empty() {
            return Ok(0);
        }
        self.manifest
            .add_changes(all.iter().map(|t| ManifestChange::delete(t.id())).collect())?;
        for h in &self.levels {
            h.delete_tables(&h.tables());
        }
        for t in &all {
            t.mark_for_deletion();
        }
        tracing::info!(tables = all.len(), "Dropped every table");
        Ok(all.len())
    }

    pub fn close(&self) -> Result<()> {
        self.manifest.close()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::key::key_with_ts;
    use crate::table::{TableBuilder, TableOptions};
    use tempfile::TempDir;

    pub(crate) fn test_options(dir: &TempDir) -> Options {
        Options::new(dir.path())
            .memtable_size(1 << 16)
            .base_table_size(1 << 12)
            .base_level_size(1 << 14)
            .num_level_zero_tables(2)
            .num_level_zero_tables_stall(100)
            .max_levels(4)
            .num_compactors(0)
    }

    /// Writes a table straight onto `level`, going through the manifest.
    pub(crate) fn add_table(
        lc: &LevelsController,
        level: usize,
        items: &[(&str, u64, ValueStruct)],
    ) -> Arc<Table> {
        let mut entries: Vec<(Vec<u8>, &ValueStruct)> = items
            .iter()
            .map(|(k, ts, vs)| (key_with_ts(k.as_bytes(), *ts), vs))
            .collect();
        entries.sort_by(|a, b| crate::key::compare_keys(&a.0, &b.0));
        let mut builder = TableBuilder::new(TableOptions::from_options(&lc.opts, 1 << 20));
        for (k, vs) in &entries {
            builder.add(k, vs, 0);
        }
        let id = lc.reserve_file_id();
        let table = Arc::new(Table::create(table_path(&lc.dir, id), id, builder).unwrap());
        lc.manifest
            .add_changes(vec![ManifestChange::create(id, level, 0, table.compression())])
            .unwrap();
        lc.levels[level].add_table(table.clone());
        table
    }

    pub(crate) fn val(v: &str) -> ValueStruct {
        ValueStruct {
            value: v.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    pub(crate) fn open(opts: &Options) -> LevelsController {
        let vlog = Arc::new(ValueLog::open(opts).unwrap());
        LevelsController::open(opts, vlog).unwrap()
    }

    #[test]
    fn test_reopen_restores_levels() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = test_options(&dir);
        {
            let lc = open(&opts);
            add_table(&lc, 0, &[("a", 1, val("a1"))]);
            add_table(&lc, 2, &[("b", 1, val("b1")), ("c", 1, val("c1"))]);
            lc.close()?;
        }
        std::fs::write(table_path(dir.path(), 99), b"orphan")?;

        let lc = open(&opts);
        assert_eq!(lc.num_l0_tables(), 1);
        assert_eq!(lc.levels[2].num_tables(), 1);
        assert!(!table_path(dir.path(), 99).exists(), "orphan table removed");
        assert_eq!(lc.reserve_file_id(), 3);
        assert_eq!(lc.get(&key_with_ts(b"c", 5))?.unwrap().value, b"c1");
        assert_eq!(lc.max_version(), 1);
        Ok(())
    }

    #[test]
    fn test_get_prefers_upper_levels() -> Result<()> {
        let dir = TempDir::new()?;
        let lc = open(&test_options(&dir));
        add_table(&lc, 3, &[("k", 1, val("deep"))]);
        add_table(&lc, 1, &[("k", 4, val("mid"))]);
        add_table(&lc, 0, &[("k", 7, val("top"))]);

        assert_eq!(lc.get(&key_with_ts(b"k", 10))?.unwrap().value, b"top");
        assert_eq!(lc.get(&key_with_ts(b"k", 6))?.unwrap().value, b"mid");
        assert_eq!(lc.get(&key_with_ts(b"k", 4))?.unwrap().value, b"mid");
        assert_eq!(lc.get(&key_with_ts(b"k", 3))?.unwrap().value, b"deep");
        assert!(lc.get(&key_with_ts(b"k", 0))?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_add_l0_table_is_durable() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = test_options(&dir);
        {
            let lc = open(&opts);
            let t = crate::table::tests::build_table(dir.path(), lc.reserve_file_id(), &[("x", 2, "x")]);
            lc.add_l0_table(t).await?;
            assert_eq!(lc.num_l0_tables(), 1);
        }
        let lc = open(&opts);
        assert_eq!(lc.num_l0_tables(), 1);
        assert_eq!(lc.table_info()[0].max_version, 2);
        Ok(())
    }
}
