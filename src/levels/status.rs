//! Bookkeeping of running compactions: busy key ranges per level, bytes
//! about to be deleted, and the tables involved.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use crate::key::{compare_keys, key_with_ts, parse_key};
use crate::table::Table;

/// Range of versioned keys, inclusive on both ends. An empty range has no
/// bounds; `inf` covers the whole key space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    pub left: Vec<u8>,
    pub right: Vec<u8>,
    pub inf: bool,
}

impl KeyRange {
    pub fn infinite() -> Self {
        Self {
            inf: true,
            ..Default::default()
        }
    }

    /// Covers every version of every user key in `tables`.
    pub fn from_tables(tables: &[Arc<Table>]) -> Self {
        let mut smallest: Option<&[u8]> = None;
        let mut biggest: Option<&[u8]> = None;
        for t in tables {
            if smallest.map_or(true, |s| compare_keys(t.smallest(), s) == Ordering::Less) {
                smallest = Some(t.smallest());
            }
            if biggest.map_or(true, |b| compare_keys(t.biggest(), b) == Ordering::Greater) {
                biggest = Some(t.biggest());
            }
        }
        match (smallest, biggest) {
            (Some(s), Some(b)) => Self {
                left: key_with_ts(parse_key(s), u64::MAX),
                right: key_with_ts(parse_key(b), 0),
                inf: false,
            },
            _ => Self::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty() && self.right.is_empty() && !self.inf
    }

    pub fn extend(&mut self, other: &KeyRange) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other.clone();
            return;
        }
        if self.left.is_empty() || compare_keys(&other.left, &self.left) == Ordering::Less {
            self.left = other.left.clone();
        }
        if self.right.is_empty() || compare_keys(&other.right, &self.right) == Ordering::Greater {
            self.right = other.right.clone();
        }
        self.inf |= other.inf;
    }

    pub fn overlaps_with(&self, other: &KeyRange) -> bool {
        if self.is_empty() {
            return true;
        }
        if other.is_empty() {
            return false;
        }
        if self.inf || other.inf {
            return true;
        }
        !(compare_keys(&self.left, &other.right) == Ordering::Greater
            || compare_keys(&self.right, &other.left) == Ordering::Less)
    }
}

#[derive(Debug, Default)]
struct LevelCompactStatus {
    ranges: Vec<KeyRange>,
    del_size: u64,
}

impl LevelCompactStatus {
    fn overlaps_with(&self, kr: &KeyRange) -> bool {
        self.ranges.iter().any(|r| r.overlaps_with(kr))
    }

    fn remove(&mut self, kr: &KeyRange) -> bool {
        match self.ranges.iter().position(|r| r == kr) {
            Some(i) => {
                self.ranges.remove(i);
                true
            }
            None => false,
        }
    }
}

/// What a single compaction claims.
#[derive(Debug, Clone)]
pub struct Claim {
    pub this_level: usize,
    pub next_level: usize,
    pub this_range: KeyRange,
    pub next_range: KeyRange,
    pub this_size: u64,
    pub table_ids: Vec<u64>,
}

#[derive(Debug)]
pub struct CompactStatus {
    levels: Vec<LevelCompactStatus>,
    tables: HashSet<u64>,
}

impl CompactStatus {
    pub fn new(max_levels: usize) -> Self {
        Self {
            levels: (0..max_levels).map(|_| LevelCompactStatus::default()).collect(),
            tables: HashSet::new(),
        }
    }

    pub fn overlaps_with(&self, level: usize, kr: &KeyRange) -> bool {
        self.levels[level].overlaps_with(kr)
    }

    pub fn del_size(&self, level: usize) -> u64 {
        self.levels[level].del_size
    }

    pub fn is_compacting(&self, table_id: u64) -> bool {
        self.tables.contains(&table_id)
    }

    /// Registers `claim` unless one of its ranges is already busy.
    pub fn compare_and_add(&mut self, claim: &Claim) -> bool {
        if self.levels[claim.this_level].overlaps_with(&claim.this_range)
            || self.levels[claim.next_level].overlaps_with(&claim.next_range)
        {
            return false;
        }
        self.add(claim);
        true
    }

    /// Registers `claim` without checking for overlap.
    pub fn add(&mut self, claim: &Claim) {
        self.levels[claim.this_level]
            .ranges
            .push(claim.this_range.clone());
        if claim.next_level != claim.this_level {
            self.levels[claim.next_level]
                .ranges
                .push(claim.next_range.clone());
        }
        self.levels[claim.this_level].del_size += claim.this_size;
        self.tables.extend(claim.table_ids.iter().copied());
    }

    pub fn delete(&mut self, claim: &Claim) {
        let this = &mut self.levels[claim.this_level];
        this.del_size = this.del_size.saturating_sub(claim.this_size);
        let found_this = this.remove(&claim.this_range);
        let found_next = if claim.next_level != claim.this_level {
            self.levels[claim.next_level].remove(&claim.next_range)
        } else {
            true
        };
        if !found_this || !found_next {
            tracing::warn!(
                this_level = claim.this_level,
                next_level = claim.next_level,
                "Compaction ranges missing from status"
            );
        }
        for id in &claim.table_ids {
            self.tables.remove(id);
        }
    }
}
