//! Picking and running compactions.
//!
//! A compaction takes a set of `top` tables from one level and the `bot`
//! tables they overlap on the next level, merges them, drops versions no
//! reader can see any more and writes the survivors as new tables on the
//! next level. Work is split into key ranges that are built in parallel.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use itertools::Itertools;

use crate::error::Result;
use crate::iterator::{ConcatIterator, KvIterator, MergeIterator};
use crate::key::{compare_keys, key_with_ts, parse_key, parse_ts, same_key};
use crate::manifest::{sync_dir, ManifestChange};
use crate::table::{table_path, Table, TableBuilder, TableOptions};
use crate::value::{now_secs, ValueStruct, BIT_DISCARD_EARLIER_VERSIONS, BIT_MERGE_ENTRY};
use crate::Error;

use super::handler::overlapping_tables;
use super::status::{Claim, KeyRange};
use super::LevelsController;

/// L0 tables younger than this are left alone by L0 to L0 compaction.
const L0_TO_L0_MIN_AGE_SECS: u64 = 10;
/// L0 to L0 compaction needs at least this many small tables.
const L0_TO_L0_MIN_TABLES: usize = 4;
/// Compactor id logged for prefix drops.
const DROP_PREFIX_COMPACTOR: usize = 174;
/// Last-level tables must be this old before they are rewritten.
const MAX_LEVEL_MIN_AGE_SECS: u64 = 60 * 60;
/// Last-level tables need this much stale data to be worth rewriting.
const MAX_LEVEL_MIN_STALE_BYTES: u64 = 10 << 20;

/// When a last-level table has collected enough stale data to rewrite.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StaleGate {
    pub(crate) min_age_secs: u64,
    pub(crate) min_stale_bytes: u64,
}

impl Default for StaleGate {
    fn default() -> Self {
        Self {
            min_age_secs: MAX_LEVEL_MIN_AGE_SECS,
            min_stale_bytes: MAX_LEVEL_MIN_STALE_BYTES,
        }
    }
}

/// Size targets per level, recomputed from the current tree.
#[derive(Debug, Clone, Default)]
pub struct Targets {
    pub base_level: usize,
    pub target_sz: Vec<u64>,
    pub file_sz: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct CompactionPriority {
    pub level: usize,
    pub score: f64,
    pub adjusted: f64,
    pub targets: Targets,
}

#[derive(Debug, Clone)]
struct CompactDef {
    compactor_id: usize,
    targets: Targets,
    adjusted: f64,
    this_level: usize,
    next_level: usize,
    top: Vec<Arc<Table>>,
    bot: Vec<Arc<Table>>,
    this_range: KeyRange,
    next_range: KeyRange,
    splits: Vec<KeyRange>,
    this_size: u64,
    /// User-key prefixes whose entries are dropped instead of rewritten.
    drop_prefixes: Vec<Vec<u8>>,
}

impl CompactDef {
    fn claim(&self) -> Claim {
        Claim {
            this_level: self.this_level,
            next_level: self.next_level,
            this_range: self.this_range.clone(),
            next_range: self.next_range.clone(),
            this_size: self.this_size,
            table_ids: self.top.iter().chain(&self.bot).map(|t| t.id()).collect(),
        }
    }

    fn all_tables(&self) -> Vec<Arc<Table>> {
        self.top.iter().chain(&self.bot).cloned().collect()
    }
}

/// Per-key state carried across the tables one split produces.
#[derive(Default)]
struct KeyState {
    discard_ts: u64,
    keep_versions: usize,
    has_overlap: bool,
    last_key: Vec<u8>,
    skip_key: Vec<u8>,
    num_versions: usize,
    first_key_has_discard_set: bool,
    drop_prefixes: Vec<Vec<u8>>,
    discards: HashMap<u32, u64>,
}

enum Visit {
    /// Current table is done; the entry is left for the next one.
    Cut,
    Skip,
    Keep { stale: bool },
}

impl KeyState {
    fn count_discard(&mut self, vs: &ValueStruct) {
        if let Ok(Some(vp)) = vs.pointer() {
            *self.discards.entry(vp.fid).or_default() += u64::from(vp.len);
        }
    }

    fn visit(
        &mut self,
        key: &[u8],
        vs: &ValueStruct,
        kr: &KeyRange,
        builder: &TableBuilder,
    ) -> Visit {
        if has_any_prefix(parse_key(key), &self.drop_prefixes) {
            self.count_discard(vs);
            return Visit::Skip;
        }
        if !self.skip_key.is_empty() {
            if same_key(key, &self.skip_key) {
                self.count_discard(vs);
                return Visit::Skip;
            }
            self.skip_key.clear();
        }

        if !same_key(key, &self.last_key) {
            self.first_key_has_discard_set = false;
            if !kr.right.is_empty() && compare_keys(key, &kr.right) != Ordering::Less {
                return Visit::Cut;
            }
            if builder.reached_capacity() {
                return Visit::Cut;
            }
            self.last_key = key.to_vec();
            self.num_versions = 0;
            self.first_key_has_discard_set = vs.meta & BIT_DISCARD_EARLIER_VERSIONS != 0;
        }

        let expired = vs.is_deleted_or_expired();
        if parse_ts(key) <= self.discard_ts && vs.meta & BIT_MERGE_ENTRY == 0 {
            self.num_versions += 1;
            let last_valid = vs.meta & BIT_DISCARD_EARLIER_VERSIONS != 0
                || self.num_versions == self.keep_versions;
            if expired || last_valid {
                // Everything older than this version is dropped.
                self.skip_key = key.to_vec();
                if expired && !self.has_overlap {
                    self.count_discard(vs);
                    return Visit::Skip;
                }
            }
        }

        Visit::Keep {
            stale: self.first_key_has_discard_set || expired,
        }
    }
}

fn has_any_prefix(user_key: &[u8], prefixes: &[Vec<u8>]) -> bool {
    prefixes.iter().any(|p| user_key.starts_with(p))
}

/// Whether `t`'s key range can hold a user key starting with one of
/// `prefixes`.
fn may_hold_prefix(t: &Table, prefixes: &[Vec<u8>]) -> bool {
    let smallest = parse_key(t.smallest());
    let biggest = parse_key(t.biggest());
    prefixes
        .iter()
        .any(|p| smallest.starts_with(p) || (smallest <= p.as_slice() && p.as_slice() <= biggest))
}

impl LevelsController {
    pub fn level_targets(&self) -> Targets {
        let n = self.levels.len();
        let opts = &self.opts;
        let mut t = Targets {
            base_level: 0,
            target_sz: vec![0; n],
            file_sz: vec![0; n],
        };

        let mut db_size = self.levels[n - 1].total_size();
        for i in (1..n).rev() {
            let target = db_size.max(opts.base_level_size);
            t.target_sz[i] = target;
            if t.base_level == 0 && target <= opts.base_level_size {
                t.base_level = i;
            }
            db_size /= opts.level_size_multiplier.max(1);
        }
        t.base_level = t.base_level.max(1).min(n - 1);

        let mut table_sz = opts.base_table_size;
        for i in 0..n {
            t.file_sz[i] = if i == 0 {
                opts.memtable_size
            } else if i <= t.base_level {
                table_sz
            } else {
                table_sz *= opts.table_size_multiplier.max(1);
                table_sz
            };
        }

        // Skip down past empty levels so L0 lands as deep as possible.
        for i in t.base_level + 1..n.saturating_sub(1) {
            if self.levels[i].total_size() > 0 {
                break;
            }
            t.base_level = i;
        }
        let b = t.base_level;
        if b + 1 < n
            && self.levels[b].total_size() == 0
            && self.levels[b + 1].total_size() < t.target_sz[b + 1]
        {
            t.base_level += 1;
        }
        t
    }

    /// Raw and adjusted score of every level. A level's adjusted score is
    /// divided by that of the next non-empty level, so a level is not
    /// pushed down into one that is itself over target.
    pub(crate) fn level_scores(&self, targets: &Targets) -> Vec<CompactionPriority> {
        let n = self.levels.len();
        let cstatus = self.cstatus.read();
        let mut prios: Vec<CompactionPriority> = (0..n)
            .map(|i| {
                let score = if i == 0 {
                    self.levels[0].num_tables() as f64 / self.opts.num_level_zero_tables.max(1) as f64
                } else {
                    let size = self.levels[i].total_size().saturating_sub(cstatus.del_size(i));
                    size as f64 / targets.target_sz[i].max(1) as f64
                };
                CompactionPriority {
                    level: i,
                    score,
                    adjusted: score,
                    targets: targets.clone(),
                }
            })
            .collect();
        drop(cstatus);

        let mut prev = 0;
        for level in targets.base_level..n {
            if prios[prev].adjusted >= 1.0 {
                const MIN_SCORE: f64 = 0.01;
                let divisor = if prios[level].score >= MIN_SCORE {
                    prios[level].adjusted
                } else {
                    MIN_SCORE
                };
                prios[prev].adjusted /= divisor.max(MIN_SCORE);
            }
            prev = level;
        }
        prios
    }

    /// Levels that need compaction, most urgent first. The last level is
    /// never picked by score.
    pub fn pick_compact_levels(&self) -> Vec<CompactionPriority> {
        let targets = self.level_targets();
        let mut prios = self.level_scores(&targets);
        prios.pop();
        prios
            .into_iter()
            .filter(|p| p.score >= 1.0)
            .sorted_by(|a, b| b.adjusted.total_cmp(&a.adjusted))
            .collect()
    }

    /// One compactor tick. Compactor 0 always looks at L0 first. Returns
    /// whether a compaction ran; when none did, the last failure is returned
    /// instead so the caller can track repeated failures.
    pub fn run_compactor_pass(&self, compactor_id: usize, discard_ts: u64) -> Result<bool> {
        let mut prios = self.pick_compact_levels();
        if compactor_id == 0 {
            if let Some(pos) = prios.iter().position(|p| p.level == 0) {
                let l0 = prios.remove(pos);
                prios.insert(0, l0);
            }
        }
        let mut failure = None;
        for p in prios {
            if !(compactor_id == 0 && p.level == 0) && p.adjusted < 1.0 {
                break;
            }
            let level = p.level;
            match self.do_compact(compactor_id, p, discard_ts) {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(compactor = compactor_id, level, error = %e, "Compaction attempt failed");
                    failure = Some(e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }

    /// Runs a compaction from `p.level`. Returns `Ok(false)` when no tables
    /// could be claimed.
    pub fn do_compact(&self, compactor_id: usize, p: CompactionPriority, discard_ts: u64) -> Result<bool> {
        self.compact_level(compactor_id, p, discard_ts, Vec::new())
    }

    fn compact_level(
        &self,
        compactor_id: usize,
        p: CompactionPriority,
        discard_ts: u64,
        drop_prefixes: Vec<Vec<u8>>,
    ) -> Result<bool> {
        let n = self.levels.len();
        let level = p.level;
        if level >= n {
            return Err(Error::InvalidRequest(format!("no level {}", level)));
        }
        let targets = if p.targets.base_level == 0 {
            self.level_targets()
        } else {
            p.targets
        };
        let next_level = if level == 0 {
            targets.base_level
        } else if level == n - 1 {
            level
        } else {
            level + 1
        };

        let mut cd = CompactDef {
            compactor_id,
            targets,
            adjusted: p.adjusted,
            this_level: level,
            next_level,
            top: Vec::new(),
            bot: Vec::new(),
            this_range: KeyRange::default(),
            next_range: KeyRange::default(),
            splits: Vec::new(),
            this_size: 0,
            drop_prefixes,
        };

        let filled = if level == 0 {
            self.fill_tables_l0(&mut cd)
        } else if level == n - 1 {
            self.fill_max_level_tables(&mut cd, discard_ts)
        } else {
            self.fill_tables(&mut cd)
        };
        if !filled {
            return Ok(false);
        }

        let claim = cd.claim();
        let result = self.run_compact_def(&mut cd, discard_ts);
        self.cstatus.write().delete(&claim);
        result?;
        Ok(true)
    }

    fn fill_tables_l0(&self, cd: &mut CompactDef) -> bool {
        self.fill_tables_l0_to_lbase(cd) || self.fill_tables_l0_to_l0(cd)
    }

    fn fill_tables_l0_to_lbase(&self, cd: &mut CompactDef) -> bool {
        if cd.next_level == 0 {
            return false;
        }
        if cd.adjusted > 0.0 && cd.adjusted < 1.0 {
            return false;
        }
        let mut cstatus = self.cstatus.write();
        let tables = self.levels[0].tables();
        if tables.is_empty() {
            return false;
        }

        // The oldest tables whose ranges chain together.
        let mut top = Vec::new();
        let mut kr = KeyRange::default();
        for t in tables {
            let dkr = KeyRange::from_tables(std::slice::from_ref(&t));
            if !kr.overlaps_with(&dkr) {
                break;
            }
            kr.extend(&dkr);
            top.push(t);
        }
        cd.this_range = KeyRange::from_tables(&top);
        cd.this_size = top.iter().map(|t| t.size()).sum();
        cd.top = top;

        let bot_all = self.levels[cd.next_level].tables();
        let (left, right) = overlapping_tables(&bot_all, &cd.this_range);
        cd.bot = bot_all[left..right].to_vec();
        cd.next_range = if cd.bot.is_empty() {
            cd.this_range.clone()
        } else {
            KeyRange::from_tables(&cd.bot)
        };
        cstatus.compare_and_add(&cd.claim())
    }

    /// Merges small, settled L0 tables into one when L0 cannot be pushed
    /// down. Only compactor 0 does this.
    fn fill_tables_l0_to_l0(&self, cd: &mut CompactDef) -> bool {
        if cd.compactor_id != 0 {
            return false;
        }
        cd.next_level = 0;
        cd.bot.clear();
        cd.next_range = KeyRange::default();

        let mut cstatus = self.cstatus.write();
        let now = now_secs();
        let max_size = 2 * cd.targets.file_sz[0];
        let top: Vec<Arc<Table>> = self.levels[0]
            .tables()
            .into_iter()
            .filter(|t| {
                t.size() < max_size
                    && now.saturating_sub(t.created_at()) >= L0_TO_L0_MIN_AGE_SECS
                    && !cstatus.is_compacting(t.id())
            })
            .collect();
        if top.len() < L0_TO_L0_MIN_TABLES {
            return false;
        }
        cd.this_range = KeyRange::infinite();
        cd.this_size = top.iter().map(|t| t.size()).sum();
        cd.top = top;
        cstatus.add(&cd.claim());

        // One output table, whatever its size.
        cd.targets.file_sz[0] = u64::from(u32::MAX);
        true
    }

    fn fill_tables(&self, cd: &mut CompactDef) -> bool {
        let mut cstatus = self.cstatus.write();
        let mut tables = self.levels[cd.this_level].tables();
        if tables.is_empty() {
            return false;
        }
        // Oldest data first.
        tables.sort_by_key(|t| t.max_version());

        let bot_all = self.levels[cd.next_level].tables();
        for t in tables {
            cd.this_size = t.size();
            cd.this_range = KeyRange::from_tables(std::slice::from_ref(&t));
            if cstatus.overlaps_with(cd.this_level, &cd.this_range) {
                continue;
            }
            cd.top = vec![t];

            let (left, right) = overlapping_tables(&bot_all, &cd.this_range);
            cd.bot = bot_all[left..right].to_vec();
            if cd.bot.is_empty() {
                cd.next_range = cd.this_range.clone();
            } else {
                cd.next_range = KeyRange::from_tables(&cd.bot);
                if cstatus.overlaps_with(cd.next_level, &cd.next_range) {
                    continue;
                }
            }
            if cstatus.compare_and_add(&cd.claim()) {
                return true;
            }
        }
        false
    }

    /// Rewrites last-level tables that carry a lot of stale data, together
    /// with their right-hand neighbours up to one table's worth.
    fn fill_max_level_tables(&self, cd: &mut CompactDef, discard_ts: u64) -> bool {
        let mut cstatus = self.cstatus.write();
        let tables = self.levels[cd.this_level].tables();
        let by_stale: Vec<Arc<Table>> = tables
            .iter()
            .cloned()
            .sorted_by(|a, b| b.stale_data_size().cmp(&a.stale_data_size()))
            .collect();
        match by_stale.first() {
            Some(t) if t.stale_data_size() > 0 => {}
            _ => return false,
        }

        let now = now_secs();
        let gate = self.max_level_gate;
        cd.bot.clear();
        for t in by_stale {
            if t.max_version() > discard_ts {
                continue;
            }
            if now.saturating_sub(t.created_at()) < gate.min_age_secs {
                continue;
            }
            if t.stale_data_size() < gate.min_stale_bytes {
                continue;
            }
            cd.this_size = t.size();
            cd.this_range = KeyRange::from_tables(std::slice::from_ref(&t));
            cd.next_range = cd.this_range.clone();
            if cstatus.overlaps_with(cd.this_level, &cd.this_range) {
                continue;
            }
            cd.top = vec![t.clone()];

            let need = cd.targets.file_sz[cd.this_level];
            if t.size() >= need {
                break;
            }
            let start = tables.partition_point(|x| compare_keys(x.smallest(), t.smallest()) == Ordering::Less) + 1;
            let mut total = t.size();
            for neighbour in tables.iter().skip(start) {
                total += neighbour.size();
                if total >= need {
                    break;
                }
                cd.bot.push(neighbour.clone());
                cd.next_range
                    .extend(&KeyRange::from_tables(std::slice::from_ref(neighbour)));
            }
            if cstatus.compare_and_add(&cd.claim()) {
                return true;
            }
            cd.bot.clear();
            cd.next_range = KeyRange::default();
        }
        if cd.top.is_empty() {
            return false;
        }
        cstatus.compare_and_add(&cd.claim())
    }

    /// Split `bot` into ranges of a few tables each so they can be built
    /// concurrently.
    fn add_splits(cd: &mut CompactDef) {
        cd.splits.clear();
        let width = cd.bot.len().div_ceil(5).max(3);
        let mut skr = cd.this_range.clone();
        skr.extend(&cd.next_range);

        let last = cd.bot.len().saturating_sub(1);
        for (i, t) in cd.bot.iter().enumerate() {
            if i == last {
                skr.right = Vec::new();
                cd.splits.push(skr);
                return;
            }
            if i % width == width - 1 {
                skr.right = key_with_ts(parse_key(t.biggest()), 0);
                cd.splits.push(skr.clone());
                skr.left = skr.right.clone();
            }
        }
    }

    /// Whether any level from `from_level` down overlaps `tables`.
    fn check_overlap(&self, tables: &[Arc<Table>], from_level: usize) -> bool {
        let kr = KeyRange::from_tables(tables);
        self.levels.iter().skip(from_level).any(|h| {
            let (left, right) = overlapping_tables(&h.tables(), &kr);
            right > left
        })
    }

    fn compaction_iterator(&self, cd: &CompactDef) -> MergeIterator {
        let mut iters: Vec<Box<dyn KvIterator>> = Vec::new();
        if cd.this_level == 0 {
            for t in cd.top.iter().rev() {
                iters.push(Box::new(t.iter(false)));
            }
        } else if let Some(t) = cd.top.first() {
            iters.push(Box::new(t.iter(false)));
        }
        iters.push(Box::new(ConcatIterator::new(cd.bot.clone(), false)));
        MergeIterator::new(iters, false)
    }

    /// Builds the tables for one split.
    fn subcompact(
        &self,
        cd: &CompactDef,
        kr: &KeyRange,
        discard_ts: u64,
        has_overlap: bool,
    ) -> Result<(Vec<Arc<Table>>, HashMap<u32, u64>)> {
        let mut it = self.compaction_iterator(cd);
        let table_opts = TableOptions::from_options(&self.opts, cd.targets.file_sz[cd.next_level]);
        let mut state = KeyState {
            discard_ts,
            keep_versions: self.opts.num_versions_to_keep,
            has_overlap,
            drop_prefixes: cd.drop_prefixes.clone(),
            ..Default::default()
        };
        let mut out = Vec::new();

        if kr.left.is_empty() {
            it.rewind();
        } else {
            it.seek(&kr.left);
        }

        let built: Result<()> = (|| {
            while it.valid() {
                if !kr.right.is_empty() && compare_keys(it.key(), &kr.right) != Ordering::Less {
                    break;
                }
                let mut builder = TableBuilder::new(table_opts);
                while it.valid() {
                    let vs = it.value();
                    match state.visit(it.key(), &vs, kr, &builder) {
                        Visit::Cut => break,
                        Visit::Skip => {}
                        Visit::Keep { stale } => {
                            let vlog_len = vs.pointer()?.map_or(0, |vp| vp.len);
                            if stale {
                                builder.add_stale_key(it.key(), &vs, vlog_len);
                            } else {
                                builder.add(it.key(), &vs, vlog_len);
                            }
                        }
                    }
                    it.next();
                }
                it.check()?;
                if builder.is_empty() {
                    continue;
                }
                let id = self.reserve_file_id();
                let table = Table::create(table_path(&self.dir, id), id, builder)?;
                out.push(Arc::new(table));
            }
            it.check()
        })();

        if let Err(e) = built {
            for t in &out {
                t.mark_for_deletion();
            }
            return Err(e);
        }
        Ok((out, state.discards))
    }

    fn run_compact_def(&self, cd: &mut CompactDef, discard_ts: u64) -> Result<()> {
        let start = Instant::now();
        let this = cd.this_level;
        let next = cd.next_level;

        // Nothing below to merge with: the table changes level as is.
        if this != 0 && this != next && cd.bot.is_empty() {
            let mut changes = Vec::new();
            for t in &cd.top {
                changes.push(ManifestChange::delete(t.id()));
                changes.push(ManifestChange::create(t.id(), next, 0, t.compression()));
            }
            self.manifest.add_changes(changes)?;
            self.levels[next].replace_tables(&[], &cd.top);
            self.levels[this].delete_tables(&cd.top);
            tracing::info!(
                compactor = cd.compactor_id,
                from = this,
                to = next,
                tables = ?cd.top.iter().map(|t| t.id()).collect::<Vec<_>>(),
                "Moved tables down"
            );
            return Ok(());
        }

        if this != next {
            Self::add_splits(cd);
        }
        if cd.splits.is_empty() {
            cd.splits.push(KeyRange::default());
        }

        let has_overlap = self.check_overlap(&cd.all_tables(), next + 1);
        let cd_ref = &*cd;
        let results: Vec<Result<(Vec<Arc<Table>>, HashMap<u32, u64>)>> = std::thread::scope(|s| {
            let handles: Vec<_> = cd_ref
                .splits
                .iter()
                .map(|kr| s.spawn(move || self.subcompact(cd_ref, kr, discard_ts, has_overlap)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(Error::InvalidState("subcompaction panicked".into())))
                })
                .collect()
        });

        let mut new_tables = Vec::new();
        let mut discards: HashMap<u32, u64> = HashMap::new();
        let mut first_err = None;
        for r in results {
            match r {
                Ok((tables, stats)) => {
                    new_tables.extend(tables);
                    for (fid, bytes) in stats {
                        *discards.entry(fid).or_default() += bytes;
                    }
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            for t in &new_tables {
                t.mark_for_deletion();
            }
            return Err(e);
        }
        if let Err(e) = sync_dir(&self.dir) {
            for t in &new_tables {
                t.mark_for_deletion();
            }
            return Err(e);
        }
        new_tables.sort_by(|a, b| compare_keys(a.biggest(), b.biggest()));

        let mut changes: Vec<ManifestChange> = new_tables
            .iter()
            .map(|t| ManifestChange::create(t.id(), next, 0, t.compression()))
            .collect();
        changes.extend(cd.all_tables().iter().map(|t| ManifestChange::delete(t.id())));
        if let Err(e) = self.manifest.add_changes(changes) {
            for t in &new_tables {
                t.mark_for_deletion();
            }
            return Err(e);
        }

        self.levels[next].replace_tables(&cd.bot, &new_tables);
        self.levels[this].delete_tables(&cd.top);
        for t in cd.all_tables() {
            t.mark_for_deletion();
        }
        self.record_discards(&discards)?;

        tracing::info!(
            compactor = cd.compactor_id,
            from = this,
            to = next,
            top = cd.top.len(),
            bot = cd.bot.len(),
            created = new_tables.len(),
            splits = cd.splits.len(),
            discard_ts,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Compaction finished"
        );
        Ok(())
    }

    /// Compacts until at most one level holds data, using `workers`
    /// threads per step.
    pub fn flatten(&self, workers: usize, discard_ts: u64) -> Result<()> {
        let workers = workers.max(1);
        loop {
            let non_empty: Vec<usize> = self
                .levels
                .iter()
                .enumerate()
                .filter(|(_, h)| h.num_tables() > 0)
                .map(|(i, _)| i)
                .collect();

            let p = if non_empty.len() <= 1 {
                match self.pick_compact_levels().into_iter().next() {
                    Some(p) if p.score > 1.0 => p,
                    _ => {
                        tracing::info!(levels = ?non_empty, "Flatten finished");
                        return Ok(());
                    }
                }
            } else {
                CompactionPriority {
                    level: non_empty[0],
                    score: 1.71,
                    adjusted: 0.0,
                    targets: Targets::default(),
                }
            };

            tracing::info!(level = p.level, workers, "Flattening level");
            let compacted: Result<usize> = std::thread::scope(|s| {
                let handles: Vec<_> = (0..workers)
                    .map(|w| {
                        let p = p.clone();
                        s.spawn(move || -> Result<usize> {
                            let mut n = 0;
                            while self.do_compact(175 + w, p.clone(), discard_ts)? {
                                n += 1;
                            }
                            Ok(n)
                        })
                    })
                    .collect();
                let mut total = 0;
                for h in handles {
                    total += h
                        .join()
                        .unwrap_or_else(|_| Err(Error::InvalidState("flatten worker panicked".into())))?;
                }
                Ok(total)
            });
            if compacted? == 0 {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    /// One L0 compaction, used while closing.
    pub fn compact_l0(&self, discard_ts: u64) -> Result<bool> {
        if self.levels[0].num_tables() == 0 {
            return Ok(false);
        }
        let p = CompactionPriority {
            level: 0,
            score: 1.73,
            adjusted: 0.0,
            targets: self.level_targets(),
        };
        self.do_compact(173, p, discard_ts)
    }

    /// Rewrites every table that may hold a key under one of `prefixes`,
    /// leaving those keys out. Levels go bottom up so an older version is
    /// never uncovered by dropping a newer one first. Compactors must be
    /// stopped and memtables flushed.
    pub fn drop_prefixes(&self, prefixes: &[Vec<u8>], discard_ts: u64) -> Result<()> {
        let n = self.levels.len();
        for level in (1..n).rev() {
            // Runs of adjacent tables, so each rewrite replaces a contiguous
            // stretch of the level.
            let mut groups: Vec<Vec<Arc<Table>>> = Vec::new();
            let mut run: Vec<Arc<Table>> = Vec::new();
            for t in self.levels[level].tables() {
                if may_hold_prefix(&t, prefixes) {
                    run.push(t);
                } else if !run.is_empty() {
                    groups.push(std::mem::take(&mut run));
                }
            }
            if !run.is_empty() {
                groups.push(run);
            }
            if groups.is_empty() {
                continue;
            }
            tracing::info!(level, groups = groups.len(), "Dropping prefixes");

            for bot in groups {
                let range = KeyRange::from_tables(&bot);
                let mut cd = CompactDef {
                    compactor_id: DROP_PREFIX_COMPACTOR,
                    targets: self.level_targets(),
                    adjusted: 0.0,
                    this_level: level,
                    next_level: level,
                    top: Vec::new(),
                    this_size: bot.iter().map(|t| t.size()).sum(),
                    bot,
                    this_range: range.clone(),
                    next_range: range,
                    splits: Vec::new(),
                    drop_prefixes: prefixes.to_vec(),
                };
                let claim = cd.claim();
                if !self.cstatus.write().compare_and_add(&claim) {
                    return Err(Error::InvalidState(format!(
                        "level {} is being compacted while dropping prefixes",
                        level
                    )));
                }
                let result = self.run_compact_def(&mut cd, discard_ts);
                self.cstatus.write().delete(&claim);
                result?;
            }
        }

        while self.levels[0].num_tables() > 0 {
            let p = CompactionPriority {
                level: 0,
                score: 1.74,
                adjusted: 0.0,
                targets: self.level_targets(),
            };
            if !self.compact_level(DROP_PREFIX_COMPACTOR, p, discard_ts, prefixes.to_vec())? {
                break;
            }
        }
        Ok(())
    }
}
