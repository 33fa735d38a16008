//! Value log garbage collection.
//!
//! A run picks the file with the most discarded bytes, keeps the entries
//! the LSM still points at, writes them again through the write path with
//! their original versions, then retires the file.

use crate::error::Result;
use crate::key::parse_ts;
use crate::value::{Entry, ValuePointer, ValueStruct, BIT_FIN_TXN, BIT_TXN, BIT_VALUE_POINTER};

use super::ValueLog;

/// Outcome of one GC run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcStatus {
    /// The file was rewritten and retired.
    Reclaimed { fid: u32, moved: usize },
    /// No file has enough garbage.
    NoRewrite,
    /// Another run is in progress or the engine is closing.
    Rejected,
}

/// What GC needs from the engine.
#[async_trait::async_trait]
pub trait GcHost: Send + Sync {
    /// Newest LSM value for the user key of `key` at or below its version.
    fn lookup(&self, key: &[u8]) -> Result<Option<ValueStruct>>;

    /// Writes `entries`, keeping their versions, and returns once durable.
    async fn rewrite(&self, entries: Vec<Entry>) -> Result<()>;

    /// Largest batch the write path accepts, as (entries, bytes).
    fn batch_limits(&self) -> (usize, usize);
}

impl ValueLog {
    /// The file GC should rewrite next: not the head, with the largest
    /// discard count whose share of the file is at least `ratio`.
    pub(crate) fn pick_gc_file(&self, ratio: f64) -> Option<u32> {
        let head = self.head_fid();
        let mut best: Option<(u32, u64)> = None;
        for (fid, discard) in self.discard_stats() {
            if fid >= head || discard == 0 {
                continue;
            }
            let Some(lf) = self.file(fid) else { continue };
            let size = u64::from(lf.size()).max(1);
            if (discard as f64 / size as f64) < ratio {
                continue;
            }
            if best.map_or(true, |(_, d)| discard > d) {
                best = Some((fid, discard));
            }
        }
        best.map(|(fid, _)| fid)
    }

    /// Runs one GC pass against `host`.
    pub async fn run_gc(&self, host: &dyn GcHost, ratio: f64) -> Result<GcStatus> {
        let Some(fid) = self.pick_gc_file(ratio) else {
            return Ok(GcStatus::NoRewrite);
        };
        let Some(lf) = self.file(fid) else {
            return Ok(GcStatus::NoRewrite);
        };
        tracing::info!(fid, size = lf.size(), ratio, "Starting value log GC");

        let mut live: Vec<ValuePointer> = Vec::new();
        let mut total = 0usize;
        lf.iterate(0, |e, vp| {
            total += 1;
            if is_live(host, &e, &vp)? {
                live.push(vp);
            }
            Ok(())
        })?;

        let (max_count, max_size) = host.batch_limits();
        let mut batch = Vec::new();
        let mut batch_size = 0usize;
        for vp in &live {
            let e = lf.read_entry(vp)?;
            let size = e.key.len() + e.value.len();
            if !batch.is_empty() && (batch.len() + 1 >= max_count || batch_size + size >= max_size) {
                host.rewrite(std::mem::take(&mut batch)).await?;
                batch_size = 0;
            }
            batch_size += size;
            batch.push(Entry {
                meta: e.meta & !(BIT_VALUE_POINTER | BIT_TXN | BIT_FIN_TXN),
                ..e
            });
        }
        if !batch.is_empty() {
            host.rewrite(batch).await?;
        }

        self.retire(fid)?;
        tracing::info!(fid, moved = live.len(), discarded = total - live.len(), "Finished value log GC");
        Ok(GcStatus::Reclaimed {
            fid,
            moved: live.len(),
        })
    }
}

/// An entry survives when the LSM's value for its exact version still points
/// at this record and is neither deleted nor expired.
fn is_live(host: &dyn GcHost, e: &Entry, vp: &ValuePointer) -> Result<bool> {
    let Some(vs) = host.lookup(&e.key)? else {
        return Ok(false);
    };
    if vs.version != parse_ts(&e.key) || vs.is_deleted_or_expired() {
        return Ok(false);
    }
    match vs.pointer()? {
        Some(p) => Ok(p.fid == vp.fid && p.offset == vp.offset),
        None => Ok(false),
    }
}
