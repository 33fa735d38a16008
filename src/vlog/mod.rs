//! Value log: large values live here and the LSM stores pointers to them.
//!
//! Files are named `NNNNNN.vlog`; the one with the highest fid is the write
//! head. Only the write coordinator appends, so appends never race. Reads
//! clone the file handle under a read lock and may run concurrently with
//! appends, rotation and garbage collection.

pub mod discard;
pub mod gc;
pub mod threshold;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::Options;
use crate::db::write::Request;
use crate::error::Result;
use crate::logfile::LogFile;
use crate::value::{Entry, ValuePointer, BIT_FIN_TXN, BIT_TXN};
use crate::Error;

use discard::DiscardStats;
pub use gc::{GcHost, GcStatus};
use threshold::ValueThreshold;

pub const VLOG_EXT: &str = "vlog";

pub fn vlog_path(dir: &Path, fid: u32) -> PathBuf {
    dir.join(format!("{:06}.{}", fid, VLOG_EXT))
}

pub fn parse_vlog_fid(name: &str) -> Option<u32> {
    name.strip_suffix(".vlog")?.parse().ok()
}

/// Readers that may still hold pointers into retired files, and the files
/// waiting for them to finish.
#[derive(Default)]
struct Retired {
    active_readers: usize,
    pending: Vec<u32>,
}

pub struct ValueLog {
    dir: PathBuf,
    opts: Options,
    files: RwLock<BTreeMap<u32, Arc<LogFile>>>,
    max_fid: AtomicU32,
    retired: Mutex<Retired>,
    discard: DiscardStats,
    pub(crate) threshold: ValueThreshold,
}

impl ValueLog {
    /// Opens every value log file in the directory. The head is replayed and
    /// truncated after its last intact entry; a fresh directory gets fid 1.
    pub fn open(opts: &Options) -> Result<Self> {
        let dir = opts.dir.clone();
        let mut fids = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(fid) = entry.file_name().to_str().and_then(parse_vlog_fid) {
                fids.push(fid);
            }
        }
        fids.sort_unstable();

        let key = opts.encryption_key.as_ref();
        let mut files = BTreeMap::new();
        for fid in &fids {
            let lf = LogFile::open(vlog_path(&dir, *fid), *fid, key)?;
            files.insert(*fid, Arc::new(lf));
        }

        let max_fid = match fids.last() {
            Some(&fid) => {
                let head = &files[&fid];
                let mut count = 0u32;
                let end = head.iterate(0, |_, _| {
                    count += 1;
                    Ok(())
                })?;
                if end < head.size() {
                    tracing::warn!(fid, valid_end = end, size = head.size(), "Truncating value log head");
                }
                head.truncate(end)?;
                head.set_entry_count(count);
                fid
            }
            None => {
                let lf = LogFile::create(vlog_path(&dir, 1), 1, key)?;
                files.insert(1, Arc::new(lf));
                1
            }
        };

        tracing::info!(files = files.len(), head = max_fid, "Opened value log");
        Ok(Self {
            discard: DiscardStats::open(&dir)?,
            threshold: ValueThreshold::new(opts),
            dir,
            opts: opts.clone(),
            files: RwLock::new(files),
            max_fid: AtomicU32::new(max_fid),
            retired: Mutex::new(Retired::default()),
        })
    }

    pub fn head_fid(&self) -> u32 {
        self.max_fid.load(Ordering::Acquire)
    }

    fn head(&self) -> Result<Arc<LogFile>> {
        let fid = self.head_fid();
        self.files
            .read()
            .get(&fid)
            .cloned()
            .ok_or_else(|| Error::InvalidState(format!("value log head {} is missing", fid)))
    }

    fn file(&self, fid: u32) -> Option<Arc<LogFile>> {
        self.files.read().get(&fid).cloned()
    }

    /// Whether `entry` stays inline in the LSM. Txn markers always do.
    pub(crate) fn skip_vlog(&self, entry: &Entry) -> bool {
        entry.is_txn_marker() || entry.skip_vlog(self.threshold.get())
    }

    /// Appends the large values of every request to the head and fills in
    /// each request's pointers. Rotates the head once it grows past the
    /// configured size or entry count.
    pub(crate) fn write(&self, reqs: &mut [Request]) -> Result<()> {
        let mut sizes = Vec::new();
        let mut buf = Vec::new();

        for req in reqs.iter_mut() {
            let head = self.head()?;
            let base = head.size();
            buf.clear();
            req.ptrs.clear();
            let mut count = 0u32;

            for e in &req.entries {
                sizes.push(e.value.len());
                if self.skip_vlog(e) {
                    req.ptrs.push(None);
                    continue;
                }
                let stored = Entry {
                    meta: e.meta & !(BIT_TXN | BIT_FIN_TXN),
                    ..e.clone()
                };
                let offset = base + buf.len() as u32;
                let len = head.encode_entry(&mut buf, &stored, offset);
                req.ptrs.push(Some(ValuePointer {
                    fid: head.fid(),
                    len: len as u32,
                    offset,
                }));
                count += 1;
            }

            if count > 0 {
                head.append(&buf, count)?;
            }
            if u64::from(head.size()) > self.opts.value_log_file_size
                || head.entry_count() > self.opts.value_log_max_entries
            {
                self.rotate(&head)?;
            }
        }

        if self.opts.sync_writes {
            self.head()?.sync()?;
        }
        self.threshold.sample(sizes);
        Ok(())
    }

    fn rotate(&self, head: &LogFile) -> Result<()> {
        head.sync()?;
        let fid = head.fid() + 1;
        let lf = LogFile::create(
            vlog_path(&self.dir, fid),
            fid,
            self.opts.encryption_key.as_ref(),
        )?;
        self.files.write().insert(fid, Arc::new(lf));
        self.max_fid.store(fid, Ordering::Release);
        tracing::debug!(fid, "Rotated value log");
        Ok(())
    }

    /// Reads the value `vp` points at.
    pub fn read(&self, vp: &ValuePointer) -> Result<Vec<u8>> {
        let lf = self.file(vp.fid).ok_or_else(|| {
            Error::InvalidPointer(format!("value log file {} does not exist", vp.fid))
        })?;
        Ok(lf.read_entry(vp)?.value)
    }

    /// Registers a reader that may dereference pointers until the guard drops.
    pub fn begin_read(self: &Arc<Self>) -> ReadGuard {
        self.retired.lock().active_readers += 1;
        ReadGuard {
            vlog: Arc::clone(self),
        }
    }

    fn end_read(&self) {
        let pending = {
            let mut retired = self.retired.lock();
            retired.active_readers -= 1;
            if retired.active_readers > 0 {
                return;
            }
            std::mem::take(&mut retired.pending)
        };
        for fid in pending {
            self.delete_file(fid);
        }
    }

    /// Takes `fid` out of service once no reader can still be using it.
    pub(crate) fn retire(&self, fid: u32) -> Result<()> {
        self.discard.update(fid, -1)?;
        {
            let mut retired = self.retired.lock();
            if retired.active_readers > 0 {
                tracing::debug!(fid, readers = retired.active_readers, "Deferring value log deletion");
                retired.pending.push(fid);
                return Ok(());
            }
        }
        self.delete_file(fid);
        Ok(())
    }

    fn delete_file(&self, fid: u32) {
        if let Some(lf) = self.files.write().remove(&fid) {
            lf.mark_for_deletion();
            tracing::info!(fid, "Deleted value log file");
        }
    }

    /// Starts a fresh head and retires every older file. Returns how many
    /// files were retired.
    pub(crate) fn drop_all(&self) -> Result<usize> {
        let head = self.head()?;
        if !head.is_empty() {
            self.rotate(&head)?;
        }
        let head = self.head_fid();
        let old: Vec<u32> = self.fids().into_iter().filter(|fid| *fid < head).collect();
        for fid in &old {
            self.retire(*fid)?;
        }
        Ok(old.len())
    }

    /// Adds compaction's discarded bytes per file.
    pub(crate) fn update_discard_stats(&self, stats: &HashMap<u32, u64>) -> Result<()> {
        for (fid, bytes) in stats {
            if *bytes > 0 && self.file(*fid).is_some() {
                self.discard.update(*fid, *bytes as i64)?;
            }
        }
        Ok(())
    }

    pub fn discard_stats(&self) -> Vec<(u32, u64)> {
        self.discard.all()
    }

    /// Fids of every live file, ascending.
    pub fn fids(&self) -> Vec<u32> {
        self.files.read().keys().copied().collect()
    }

    /// Total bytes across value log files.
    pub fn size(&self) -> u64 {
        self.files.read().values().map(|f| u64::from(f.size())).sum()
    }

    pub fn sync(&self) -> Result<()> {
        self.head()?.sync()
    }

    /// Syncs the head and the discard stats. Files still waiting on readers
    /// are marked so they leave the disk with their last handle.
    pub fn close(&self) -> Result<()> {
        self.sync()?;
        self.discard.sync()?;
        let pending = std::mem::take(&mut self.retired.lock().pending);
        for fid in pending {
            if let Some(lf) = self.file(fid) {
                lf.mark_for_deletion();
                tracing::debug!(fid, "Value log file deleted once its readers finish");
            }
        }
        tracing::debug!(head = self.head_fid(), "Closed value log");
        Ok(())
    }
}

/// Holds back deletion of retired value log files while alive.
pub struct ReadGuard {
    vlog: Arc<ValueLog>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.vlog.end_read();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::key::key_with_ts;
    use crate::value::BIT_VALUE_POINTER;
    use tempfile::TempDir;

    pub(crate) fn test_options(dir: &TempDir) -> Options {
        Options::new(dir.path())
            .value_threshold(32)
            .value_log_file_size(1 << 20)
    }

    fn req(entries: Vec<Entry>) -> Request {
        Request::new(entries)
    }

    fn big(key: &str, ts: u64, fill: u8) -> Entry {
        Entry::new(key_with_ts(key.as_bytes(), ts), vec![fill; 100])
    }

    #[test]
    fn test_write_splits_inline_and_pointers() -> Result<()> {
        let dir = TempDir::new()?;
        let vlog = ValueLog::open(&test_options(&dir))?;
        let mut reqs = vec![req(vec![
            Entry::new(key_with_ts(b"small", 1), b"tiny".to_vec()),
            big("large", 1, 7),
        ])];
        vlog.write(&mut reqs)?;

        assert_eq!(reqs[0].ptrs[0], None);
        let vp = reqs[0].ptrs[1].expect("large value goes to the log");
        assert_eq!(vp.fid, 1);
        assert_eq!(vlog.read(&vp)?, vec![7; 100]);
        Ok(())
    }

    #[test]
    fn test_txn_bits_are_stripped() -> Result<()> {
        let dir = TempDir::new()?;
        let vlog = ValueLog::open(&test_options(&dir))?;
        let mut e = big("k", 3, 1);
        e.meta = BIT_TXN;
        let mut reqs = vec![req(vec![e])];
        vlog.write(&mut reqs)?;
        let vp = reqs[0].ptrs[0].unwrap();

        let lf = vlog.file(1).unwrap();
        let stored = lf.read_entry(&vp)?;
        assert_eq!(stored.meta & (BIT_TXN | BIT_FIN_TXN), 0);
        assert_eq!(stored.meta & BIT_VALUE_POINTER, 0);
        Ok(())
    }

    #[test]
    fn test_rotation_by_entry_count() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = test_options(&dir).value_log_max_entries(3);
        let vlog = ValueLog::open(&opts)?;
        let mut ptrs = Vec::new();
        for i in 0..10u64 {
            let mut reqs = vec![req(vec![big("k", i + 1, i as u8)])];
            vlog.write(&mut reqs)?;
            ptrs.push(reqs[0].ptrs[0].unwrap());
        }
        assert!(vlog.fids().len() >= 3);
        for (i, vp) in ptrs.iter().enumerate() {
            assert_eq!(vlog.read(vp)?, vec![i as u8; 100]);
        }
        Ok(())
    }

    #[test]
    fn test_reopen_truncates_torn_head() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = test_options(&dir);
        let vp = {
            let vlog = ValueLog::open(&opts)?;
            let mut reqs = vec![req(vec![big("a", 1, 1), big("b", 1, 2)])];
            vlog.write(&mut reqs)?;
            vlog.close()?;
            reqs[0].ptrs[1].unwrap()
        };
        let path = vlog_path(dir.path(), 1);
        let len = std::fs::metadata(&path)?.len();
        let f = std::fs::OpenOptions::new().write(true).open(&path)?;
        f.set_len(len - 5)?;
        drop(f);

        let vlog = ValueLog::open(&opts)?;
        assert_eq!(u64::from(vlog.head()?.size()), u64::from(vp.offset));
        assert!(vlog.read(&vp).is_err());
        Ok(())
    }

    #[test]
    fn test_retire_waits_for_readers() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = test_options(&dir).value_log_max_entries(1);
        let vlog = Arc::new(ValueLog::open(&opts)?);
        let mut reqs = vec![req(vec![big("a", 1, 1)])];
        vlog.write(&mut reqs)?;
        let vp = reqs[0].ptrs[0].unwrap();
        let mut reqs = vec![req(vec![big("b", 1, 2)])];
        vlog.write(&mut reqs)?;
        assert!(vlog.head_fid() > vp.fid);

        let guard = vlog.begin_read();
        vlog.retire(vp.fid)?;
        assert_eq!(vlog.read(&vp)?, vec![1; 100], "still readable while a reader is active");
        drop(guard);
        assert!(vlog.read(&vp).is_err());
        assert!(!vlog_path(dir.path(), vp.fid).exists());
        Ok(())
    }

    #[test]
    fn test_drop_all_leaves_an_empty_head() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = test_options(&dir).value_log_max_entries(1);
        let vlog = ValueLog::open(&opts)?;
        for i in 0..3u64 {
            let mut reqs = vec![req(vec![big("k", i + 1, 1), big("j", i + 1, 2)])];
            vlog.write(&mut reqs)?;
        }
        assert_eq!(vlog.fids(), vec![1, 2, 3, 4]);

        // An empty head is kept as it is.
        assert_eq!(vlog.drop_all()?, 3);
        assert_eq!(vlog.fids(), vec![4]);
        for fid in 1..=3 {
            assert!(!vlog_path(dir.path(), fid).exists());
        }

        let mut reqs = vec![req(vec![big("k", 9, 1)])];
        vlog.write(&mut reqs)?;
        assert_eq!(vlog.drop_all()?, 1, "a head with data rotates out too");
        assert_eq!(vlog.fids(), vec![5]);
        assert!(vlog.head()?.is_empty());
        assert!(vlog.read(&reqs[0].ptrs[0].unwrap()).is_err());
        Ok(())
    }

    #[test]
    fn test_reopen_keeps_counting_head_entries() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = test_options(&dir).value_log_max_entries(3);
        {
            let vlog = ValueLog::open(&opts)?;
            let mut reqs = vec![req(vec![big("a", 1, 1), big("b", 1, 2)])];
            vlog.write(&mut reqs)?;
            vlog.close()?;
        }
        let vlog = ValueLog::open(&opts)?;
        assert_eq!(vlog.head()?.entry_count(), 2);
        let mut reqs = vec![req(vec![big("c", 2, 3), big("d", 2, 4)])];
        vlog.write(&mut reqs)?;
        assert_eq!(vlog.fids(), vec![1, 2], "four entries in the head trip rotation");
        Ok(())
    }

    #[test]
    fn test_close_releases_files_awaiting_readers() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = test_options(&dir).value_log_max_entries(1);
        let vlog = Arc::new(ValueLog::open(&opts)?);
        let mut reqs = vec![req(vec![big("a", 1, 1), big("b", 1, 2)])];
        vlog.write(&mut reqs)?;
        let vp = reqs[0].ptrs[0].unwrap();
        assert!(vlog.head_fid() > vp.fid);

        let guard = vlog.begin_read();
        vlog.retire(vp.fid)?;
        vlog.close()?;
        drop(vlog);
        assert!(vlog_path(dir.path(), vp.fid).exists());
        drop(guard);
        assert!(!vlog_path(dir.path(), vp.fid).exists());
        Ok(())
    }
}
