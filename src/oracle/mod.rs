//! Timestamp oracle: hands out read and commit timestamps and detects
//! write conflicts between overlapping transactions.

pub mod watermark;

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::error::Result;
use crate::Error;

use watermark::WaterMark;

struct CommittedTxn {
    ts: u64,
    conflict_keys: HashSet<u64>,
}

struct OracleState {
    next_txn_ts: u64,
    /// Txns that may still conflict with an active reader.
    committed: Vec<CommittedTxn>,
}

pub struct Oracle {
    detect_conflicts: bool,
    state: Mutex<OracleState>,
    /// Held from commit ts assignment until the request is queued, so the
    /// write queue sees commits in ts order.
    pub(crate) write_ch_lock: tokio::sync::Mutex<()>,
    read_mark: WaterMark,
    txn_mark: WaterMark,
}

impl Oracle {
    /// Starts after `max_version`, the highest version found on disk.
    pub fn new(max_version: u64, detect_conflicts: bool) -> Self {
        Self {
            detect_conflicts,
            state: Mutex::new(OracleState {
                next_txn_ts: max_version + 1,
                committed: Vec::new(),
            }),
            write_ch_lock: tokio::sync::Mutex::new(()),
            read_mark: WaterMark::new("read", max_version),
            txn_mark: WaterMark::new("txn", max_version),
        }
    }

    /// Snapshot timestamp for a new txn: everything committed so far is
    /// visible. The reader stays registered until [`done_read`](Self::done_read).
    pub fn read_ts(&self) -> u64 {
        let _s = self.state.lock();
        let ts = self.txn_mark.done_until();
        self.read_mark.begin(ts);
        ts
    }

    pub fn done_read(&self, read_ts: u64) {
        self.read_mark.done(read_ts);
    }

    /// Assigns the commit ts of a txn that read at `read_ts`, after checking
    /// its reads against txns that committed since. Finishes the txn's read.
    pub fn new_commit_ts(
        &self,
        read_ts: u64,
        reads: &[u64],
        conflict_keys: &HashSet<u64>,
    ) -> Result<u64> {
        let mut s = self.state.lock();
        if self.detect_conflicts && Self::has_conflict(&s, read_ts, reads) {
            tracing::debug!(read_ts, "Txn conflict");
            return Err(Error::Conflict);
        }

        let ts = Self::assign(&mut s, &self.txn_mark);
        self.read_mark.done(read_ts);
        if self.detect_conflicts {
            let line = self.read_mark.done_until();
            s.committed.retain(|t| t.ts > line);
            s.committed.push(CommittedTxn {
                ts,
                conflict_keys: conflict_keys.clone(),
            });
        }
        Ok(ts)
    }

    /// Commit ts for a write batch, which has no reads to validate.
    pub fn new_batch_ts(&self) -> u64 {
        let mut s = self.state.lock();
        Self::assign(&mut s, &self.txn_mark)
    }

    fn assign(s: &mut OracleState, txn_mark: &WaterMark) -> u64 {
        let ts = s.next_txn_ts;
        s.next_txn_ts += 1;
        txn_mark.begin(ts);
        ts
    }

    fn has_conflict(s: &OracleState, read_ts: u64, reads: &[u64]) -> bool {
        if reads.is_empty() {
            return false;
        }
        s.committed
            .iter()
            .filter(|t| t.ts > read_ts)
            .any(|t| reads.iter().any(|r| t.conflict_keys.contains(r)))
    }

    /// Marks `commit_ts` finished, whether its write succeeded or not.
    pub fn done_commit(&self, commit_ts: u64) {
        self.txn_mark.done(commit_ts);
    }

    /// Versions at or below this are invisible to every current and future
    /// reader except as the newest version of their key.
    pub fn discard_at_or_below(&self) -> u64 {
        let done = self.txn_mark.done_until();
        match self.read_mark.min_pending() {
            Some(oldest) => oldest.saturating_sub(1).min(done),
            None => done,
        }
    }

    /// Highest commit ts handed out so far.
    pub fn max_assigned(&self) -> u64 {
        self.state.lock().next_txn_ts - 1
    }

    pub(crate) fn committed_len(&self) -> usize {
        self.state.lock().committed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(k: &[u64]) -> HashSet<u64> {
        k.iter().copied().collect()
    }

    #[test]
    fn test_timestamps_increase() -> Result<()> {
        let o = Oracle::new(10, true);
        let r = o.read_ts();
        assert_eq!(r, 10);
        let a = o.new_commit_ts(r, &[], &keys(&[1]))?;
        let b = o.new_batch_ts();
        assert_eq!((a, b), (11, 12));
        assert_eq!(o.max_assigned(), 12);
        Ok(())
    }

    #[test]
    fn test_read_ts_waits_for_commit_done() -> Result<()> {
        let o = Oracle::new(0, true);
        let r = o.read_ts();
        let ts = o.new_commit_ts(r, &[], &keys(&[1]))?;
        assert_eq!(o.read_ts(), 0, "not visible until done");
        o.done_commit(ts);
        assert_eq!(o.read_ts(), ts);
        Ok(())
    }

    #[test]
    fn test_conflict_on_overwritten_read() -> Result<()> {
        let o = Oracle::new(0, true);
        let ra = o.read_ts();
        let rb = o.read_ts();

        let ta = o.new_commit_ts(ra, &[7], &keys(&[7]))?;
        o.done_commit(ta);
        assert!(matches!(o.new_commit_ts(rb, &[7], &keys(&[8])), Err(Error::Conflict)));
        o.done_read(rb);

        let rc = o.read_ts();
        assert!(o.new_commit_ts(rc, &[7], &keys(&[7])).is_ok());
        Ok(())
    }

    #[test]
    fn test_no_conflict_detection() -> Result<()> {
        let o = Oracle::new(0, false);
        let ra = o.read_ts();
        let rb = o.read_ts();
        let ta = o.new_commit_ts(ra, &[7], &keys(&[7]))?;
        o.done_commit(ta);
        assert!(o.new_commit_ts(rb, &[7], &keys(&[7])).is_ok());
        assert_eq!(o.committed_len(), 0);
        Ok(())
    }

    #[test]
    fn test_committed_txns_are_pruned() -> Result<()> {
        let o = Oracle::new(0, true);
        for i in 0..10 {
            let r = o.read_ts();
            let ts = o.new_commit_ts(r, &[i], &keys(&[i]))?;
            o.done_commit(ts);
        }
        assert!(o.committed_len() <= 1);
        Ok(())
    }

    #[test]
    fn test_discard_line_follows_oldest_reader() -> Result<()> {
        let o = Oracle::new(0, true);
        let commit = || {
            let r = o.read_ts();
            let ts = o.new_commit_ts(r, &[], &keys(&[1])).unwrap();
            o.done_commit(ts);
        };
        commit();
        commit();
        assert_eq!(o.discard_at_or_below(), 2);

        let reader = o.read_ts();
        assert_eq!(reader, 2);
        let r = o.read_ts();
        let ts = o.new_commit_ts(r, &[], &keys(&[1]))?;
        o.done_commit(ts);
        assert_eq!(o.discard_at_or_below(), 1);
        o.done_read(reader);
        assert_eq!(o.discard_at_or_below(), 3);
        Ok(())
    }
}
