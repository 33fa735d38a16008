//! The engine handle.
//!
//! [`Db`] owns the background tasks; everything they share lives in
//! [`DbInner`] behind an `Arc`. Writes funnel through one writer task, full
//! memtables go to one flush task, and a pool of compactors keeps the
//! levels in shape.

pub(crate) mod flush;
pub(crate) mod tasks;
pub(crate) mod write;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};

use crate::batch::WriteBatch;
use crate::config::Options;
use crate::error::Result;
use crate::flock::DirLock;
use crate::iterator::{DbIterator, IteratorOptions, Item, KvIterator};
use crate::key::{key_with_ts, parse_ts};
use crate::levels::{LevelInfo, LevelsController, TableInfo};
use crate::memtable::{parse_mem_fid, MemTable};
use crate::oracle::Oracle;
use crate::scheduler::Scheduler;
use crate::sequence::Sequence;
use crate::txn::{commit_entries, Limits, Txn};
use crate::value::{Entry, ValueStruct, INTERNAL_KEY_PREFIX};
use crate::vlog::{GcHost, GcStatus, ReadGuard, ValueLog};
use crate::Error;

use tasks::CompactionTask;
use write::{Request, KV_WRITE_CH_CAPACITY};

pub(crate) struct MemTables {
    pub(crate) active: Arc<MemTable>,
    /// Oldest first.
    pub(crate) immutable: VecDeque<Arc<MemTable>>,
}

/// State shared by the handle, txns, iterators and background tasks.
pub(crate) struct DbInner {
    pub(crate) opts: Options,
    pub(crate) memtables: RwLock<MemTables>,
    next_mem_fid: AtomicU32,
    pub(crate) vlog: Arc<ValueLog>,
    pub(crate) levels: Arc<LevelsController>,
    pub(crate) oracle: Arc<Oracle>,
    write_tx: mpsc::Sender<Request>,
    flush_tx: mpsc::Sender<Arc<MemTable>>,
    block_writes: AtomicBool,
    /// Set while `drop_all` or `drop_prefix` runs.
    dropping: AtomicBool,
    /// Fires each time a flushed memtable leaves the immutable queue.
    flushed: Notify,
    /// One GC or drop at a time; closing takes the permit for good.
    gc_permit: Semaphore,
    /// Released by `close`, or with the last reference when the handle was
    /// dropped open, so no second open races the tasks still running.
    dir_lock: Mutex<Option<DirLock>>,
}

impl DbInner {
    /// Newest value of the user key in `key` at or below its version,
    /// searching memtables newest first and then the levels.
    pub(crate) fn get_value(&self, key: &[u8]) -> Result<Option<ValueStruct>> {
        let (active, immutable) = {
            let mts = self.memtables.read();
            (Arc::clone(&mts.active), mts.immutable.clone())
        };
        let version = parse_ts(key);
        let mut best: Option<ValueStruct> = None;
        for mt in std::iter::once(&active).chain(immutable.iter().rev()) {
            if let Some(vs) = mt.get(key) {
                if vs.version == version {
                    return Ok(Some(vs));
                }
                if best.as_ref().map_or(true, |b| vs.version > b.version) {
                    best = Some(vs);
                }
            }
        }
        if let Some(vs) = self.levels.get(key)? {
            if best.as_ref().map_or(true, |b| vs.version > b.version) {
                best = Some(vs);
            }
        }
        Ok(best)
    }

    /// Live value of `key` as of `read_ts`.
    pub(crate) fn get_item(&self, key: &[u8], read_ts: u64) -> Result<Option<Item>> {
        let _guard = self.vlog.begin_read();
        let Some(vs) = self.get_value(&key_with_ts(key, read_ts))? else {
            return Ok(None);
        };
        if vs.is_deleted_or_expired() {
            return Ok(None);
        }
        let value = self.resolve_value(&vs)?;
        Ok(Some(Item::new(key.to_vec(), &vs, value)))
    }

    /// The value bytes of `vs`, read from the value log when it points there.
    pub(crate) fn resolve_value(&self, vs: &ValueStruct) -> Result<Vec<u8>> {
        match vs.pointer()? {
            Some(vp) => self.vlog.read(&vp),
            None => Ok(vs.value.clone()),
        }
    }

    /// Read cursors over every memtable and level, newest first. The guard
    /// is taken before the snapshot so no pointer in it outlives its file.
    pub(crate) fn iter_sources(&self, reversed: bool) -> (ReadGuard, Vec<Box<dyn KvIterator>>) {
        let guard = self.vlog.begin_read();
        let mut iters: Vec<Box<dyn KvIterator>> = Vec::new();
        {
            let mts = self.memtables.read();
            iters.push(Box::new(mts.active.iter(reversed)));
            for mt in mts.immutable.iter().rev() {
                iters.push(Box::new(mt.iter(reversed)));
            }
        }
        self.levels.append_iterators(&mut iters, reversed);
        (guard, iters)
    }

    /// Queues `entries` for the writer. The receiver yields the outcome.
    pub(crate) async fn queue_write(&self, entries: Vec<Entry>) -> Result<oneshot::Receiver<Result<()>>> {
        if self.block_writes.load(Ordering::Acquire) {
            return Err(Error::DbClosed);
        }
        if self.dropping.load(Ordering::Acquire) {
            return Err(Error::BlockedWrites);
        }
        let (req, done) = Request::with_done(entries);
        self.write_tx.send(req).await.map_err(|_| Error::DbClosed)?;
        Ok(done)
    }

    /// Queues the active memtable for flush when it holds anything, then
    /// waits until every immutable memtable has reached L0.
    pub(crate) async fn flush_memtables(&self) -> Result<()> {
        let full = {
            let mut mts = self.memtables.write();
            if mts.active.is_empty() {
                None
            } else {
                let fid = self.next_mem_fid.fetch_add(1, Ordering::SeqCst);
                let fresh = Arc::new(MemTable::create(&self.opts, fid)?);
                let full = std::mem::replace(&mut mts.active, fresh);
                mts.immutable.push_back(Arc::clone(&full));
                Some(full)
            }
        };
        if let Some(mt) = full {
            tracing::debug!(fid = mt.fid(), size = mt.size(), "Flushing active memtable");
            self.flush_tx.send(mt).await.map_err(|_| Error::DbClosed)?;
        }
        loop {
            let flushed = self.flushed.notified();
            if self.memtables.read().immutable.is_empty() {
                return Ok(());
            }
            flushed.await;
        }
    }

    fn limits(&self) -> Limits {
        Limits::new(&self.opts, self.vlog.threshold.get())
    }

    /// Commits a batch at a fresh ts. Batches read nothing, so they never
    /// conflict.
    async fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let (commit_ts, done) = {
            let _order = self.oracle.write_ch_lock.lock().await;
            if self.block_writes.load(Ordering::Acquire) {
                return Err(Error::DbClosed);
            }
            let commit_ts = self.oracle.new_batch_ts();
            match self.queue_write(commit_entries(batch.into_entries(), commit_ts)).await {
                Ok(done) => (commit_ts, done),
                Err(e) => {
                    self.oracle.done_commit(commit_ts);
                    return Err(e);
                }
            }
        };
        let result = done.await.unwrap_or(Err(Error::DbClosed));
        self.oracle.done_commit(commit_ts);
        result
    }
}

#[async_trait::async_trait]
impl GcHost for DbInner {
    fn lookup(&self, key: &[u8]) -> Result<Option<ValueStruct>> {
        self.get_value(key)
    }

    async fn rewrite(&self, entries: Vec<Entry>) -> Result<()> {
        let done = self.queue_write(entries).await?;
        done.await.unwrap_or(Err(Error::DbClosed))
    }

    fn batch_limits(&self) -> (usize, usize) {
        (
            self.opts.max_batch_count() as usize,
            self.opts.max_batch_size() as usize,
        )
    }
}

/// An open database.
///
/// Call [`close`](Self::close) before dropping it; a handle dropped while
/// open only signals its background tasks to stop.
pub struct Db {
    inner: Arc<DbInner>,
    closed: AtomicBool,
    writer: Scheduler,
    flusher: Scheduler,
    compactors: Scheduler,
    sampler: Scheduler,
}

impl Db {
    /// Opens or creates the database in `opts.dir`.
    ///
    /// WALs left by an earlier run are replayed into memtables that are
    /// queued for flush straight away.
    pub async fn open(opts: Options) -> Result<Self> {
        opts.validate()?;
        std::fs::create_dir_all(&opts.dir)?;
        let dir_lock = DirLock::acquire(&opts.dir)?;

        let vlog = Arc::new(ValueLog::open(&opts)?);
        let levels = Arc::new(LevelsController::open(&opts, Arc::clone(&vlog))?);

        let mut mem_fids = Vec::new();
        for entry in std::fs::read_dir(&opts.dir)? {
            let entry = entry?;
            if let Some(fid) = entry.file_name().to_str().and_then(parse_mem_fid) {
                mem_fids.push(fid);
            }
        }
        mem_fids.sort_unstable();

        let mut max_version = levels.max_version();
        let mut recovered = VecDeque::new();
        for fid in &mem_fids {
            let mt = MemTable::open(&opts, *fid)?;
            if mt.is_empty() {
                mt.delete_wal();
                continue;
            }
            max_version = max_version.max(mt.max_version());
            recovered.push_back(Arc::new(mt));
        }
        let next_fid = mem_fids.last().map_or(1, |fid| fid + 1);
        let active = Arc::new(MemTable::create(&opts, next_fid)?);

        let (write_tx, write_rx) = mpsc::channel(KV_WRITE_CH_CAPACITY);
        let (flush_tx, flush_rx) = mpsc::channel(opts.num_memtables);
        let oracle = Arc::new(Oracle::new(max_version, opts.detect_conflicts));

        let inner = Arc::new(DbInner {
            memtables: RwLock::new(MemTables {
                active,
                immutable: recovered.clone(),
            }),
            next_mem_fid: AtomicU32::new(next_fid + 1),
            vlog,
            levels,
            oracle,
            write_tx,
            flush_tx,
            block_writes: AtomicBool::new(false),
            dropping: AtomicBool::new(false),
            flushed: Notify::new(),
            gc_permit: Semaphore::new(1),
            dir_lock: Mutex::new(Some(dir_lock)),
            opts,
        });

        let db = Self {
            inner: Arc::clone(&inner),
            closed: AtomicBool::new(false),
            writer: Scheduler::new(),
            flusher: Scheduler::new(),
            compactors: Scheduler::new(),
            sampler: Scheduler::new(),
        };

        let flush_db = Arc::clone(&inner);
        db.flusher
            .spawn("flush", move |ctx| flush::run_flusher(flush_db, flush_rx, ctx));
        let write_db = Arc::clone(&inner);
        db.writer
            .spawn("writer", move |ctx| write::run_writer(write_db, write_rx, ctx));
        if inner.vlog.threshold.is_dynamic() {
            let vlog = Arc::clone(&inner.vlog);
            db.sampler
                .spawn("value-sampler", move |ctx| async move { vlog.threshold.run(ctx).await });
        }
        db.start_compactors();

        let replayed = recovered.len();
        for mt in recovered {
            inner.flush_tx.send(mt).await.map_err(|_| Error::DbClosed)?;
        }

        tracing::info!(
            dir = %inner.opts.dir.display(),
            max_version,
            replayed_memtables = replayed,
            compactors = inner.opts.num_compactors,
            "Opened database"
        );
        Ok(db)
    }

    fn start_compactors(&self) {
        for id in 0..self.inner.opts.num_compactors {
            self.compactors
                .register(Arc::new(CompactionTask::new(id, Arc::clone(&self.inner))));
        }
    }

    pub fn options(&self) -> &Options {
        &self.inner.opts
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::DbClosed);
        }
        Ok(())
    }

    /// Latest committed value of `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Item>> {
        self.check_open()?;
        let mut txn = self.new_transaction(false);
        txn.get(key)
    }

    /// A txn reading at the current snapshot. Writes need `update`.
    pub fn new_transaction(&self, update: bool) -> Txn {
        Txn::new(Arc::clone(&self.inner), update)
    }

    pub fn new_write_batch(&self) -> WriteBatch {
        WriteBatch::new(self.inner.limits())
    }

    /// Applies `batch` atomically and returns once it is in the memtable.
    pub async fn write(&self, batch: WriteBatch) -> Result<()> {
        self.check_open()?;
        self.inner.write_batch(batch).await
    }

    /// Applies `batch` in the background and hands the outcome to `callback`.
    pub fn write_with_callback<F>(&self, batch: WriteBatch, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if let Err(e) = self.check_open() {
            callback(Err(e));
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            callback(inner.write_batch(batch).await);
        });
    }

    /// Iterator over a snapshot taken now.
    pub fn new_iterator(&self, opts: IteratorOptions) -> DbIterator {
        let read_ts = self.inner.oracle.read_ts();
        DbIterator::new(Arc::clone(&self.inner), opts, read_ts, true)
    }

    /// A sequence stored under `key`, leasing `bandwidth` numbers at a time.
    pub async fn sequence(&self, key: impl Into<Vec<u8>>, bandwidth: u64) -> Result<Sequence> {
        self.check_open()?;
        Sequence::new(Arc::clone(&self.inner), key.into(), bandwidth).await
    }

    /// Rewrites one value log file whose discardable share is at least
    /// `discard_ratio`.
    pub async fn run_gc(&self, discard_ratio: f64) -> Result<GcStatus> {
        if !(discard_ratio > 0.0 && discard_ratio < 1.0) {
            return Err(Error::InvalidRequest(format!(
                "discard ratio must lie in (0, 1), got {}",
                discard_ratio
            )));
        }
        if self.is_closed() {
            return Ok(GcStatus::Rejected);
        }
        let Ok(_permit) = self.inner.gc_permit.try_acquire() else {
            return Ok(GcStatus::Rejected);
        };
        self.inner.vlog.run_gc(self.inner.as_ref(), discard_ratio).await
    }

    /// Syncs the active WAL and the value log head.
    pub fn sync(&self) -> Result<()> {
        let active = Arc::clone(&self.inner.memtables.read().active);
        active.sync_wal()?;
        self.inner.vlog.sync()
    }

    /// On-disk bytes as `(lsm, value log)`.
    pub fn size(&self) -> (u64, u64) {
        (self.inner.levels.size(), self.inner.vlog.size())
    }

    pub fn levels(&self) -> Vec<LevelInfo> {
        self.inner.levels.level_info()
    }

    pub fn tables(&self) -> Vec<TableInfo> {
        self.inner.levels.table_info()
    }

    pub fn verify_checksum(&self) -> Result<()> {
        self.inner.levels.verify_checksum()
    }

    /// Highest commit ts handed out so far.
    pub fn max_version(&self) -> u64 {
        self.inner.oracle.max_assigned()
    }

    /// Compacts until all tables sit on one level.
    pub async fn flatten(&self, workers: usize) -> Result<()> {
        self.check_open()?;
        let levels = Arc::clone(&self.inner.levels);
        let discard_ts = self.inner.oracle.discard_at_or_below();
        tokio::task::spawn_blocking(move || levels.flatten(workers, discard_ts))
            .await
            .map_err(|e| Error::InvalidState(format!("flatten task failed: {}", e)))?
    }

    /// Deletes every key: all memtables, tables and value log files. Writes
    /// issued meanwhile fail with [`Error::BlockedWrites`]; open iterators
    /// keep the files they read until they are dropped.
    pub async fn drop_all(&self) -> Result<()> {
        self.check_open()?;
        let Ok(_permit) = self.inner.gc_permit.acquire().await else {
            return Err(Error::DbClosed);
        };
        tracing::info!(dir = %self.inner.opts.dir.display(), "Dropping all data");
        let _paused = self.pause_for_drop().await?;

        let levels = Arc::clone(&self.inner.levels);
        let tables = tokio::task::spawn_blocking(move || levels.drop_tree())
            .await
            .map_err(|e| Error::InvalidState(format!("drop task failed: {}", e)))??;
        let vlog_files = self.inner.vlog.drop_all()?;
        tracing::info!(tables, vlog_files, "Dropped all data");
        Ok(())
    }

    /// Deletes every key starting with one of `prefixes`. Memtables are
    /// flushed first, then every table that may hold such a key is
    /// rewritten without it.
    pub async fn drop_prefix(&self, prefixes: &[&[u8]]) -> Result<()> {
        self.check_open()?;
        for p in prefixes {
            if p.is_empty() || INTERNAL_KEY_PREFIX.starts_with(p) || p.starts_with(INTERNAL_KEY_PREFIX) {
                return Err(Error::InvalidRequest(format!(
                    "cannot drop prefix {:?}",
                    String::from_utf8_lossy(p)
                )));
            }
        }
        if prefixes.is_empty() {
            return Ok(());
        }
        let Ok(_permit) = self.inner.gc_permit.acquire().await else {
            return Err(Error::DbClosed);
        };
        let _paused = self.pause_for_drop().await?;

        // Only prefixes that still have live keys are worth a rewrite.
        let mut present = Vec::new();
        for p in prefixes {
            let mut it = self.new_iterator(IteratorOptions::default().prefix(p.to_vec()));
            it.rewind()?;
            if it.valid_for_prefix(p) {
                present.push(p.to_vec());
            }
        }
        if present.is_empty() {
            tracing::info!("No keys under the prefixes to drop");
            return Ok(());
        }
        tracing::info!(prefixes = present.len(), "Dropping prefixes");

        let levels = Arc::clone(&self.inner.levels);
        let discard_ts = self.inner.oracle.discard_at_or_below();
        tokio::task::spawn_blocking(move || levels.drop_prefixes(&present, discard_ts))
            .await
            .map_err(|e| Error::InvalidState(format!("drop task failed: {}", e)))??;
        tracing::info!("Dropped prefixes");
        Ok(())
    }

    /// Blocks new writes, lets queued ones land, flushes every memtable to
    /// L0 and stops the compactors. All of it is undone when the returned
    /// guard drops.
    async fn pause_for_drop(&self) -> Result<DropPause<'_>> {
        {
            // Commits already holding the ordering lock finish queueing first.
            let _order = self.inner.oracle.write_ch_lock.lock().await;
            self.inner.dropping.store(true, Ordering::Release);
        }
        let mut pause = DropPause {
            db: self,
            compactors_stopped: false,
        };

        let (barrier, done) = Request::with_done(Vec::new());
        self.inner
            .write_tx
            .send(barrier)
            .await
            .map_err(|_| Error::DbClosed)?;
        done.await.unwrap_or(Err(Error::DbClosed))?;

        self.inner.flush_memtables().await?;
        self.compactors.shutdown().await?;
        pause.compactors_stopped = true;
        Ok(pause)
    }

    /// Stops every background task, flushes the active memtable and
    /// releases the directory. Later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let inner = &self.inner;
        tracing::info!(dir = %inner.opts.dir.display(), "Closing database");
        inner.block_writes.store(true, Ordering::Release);

        // Waits for a running GC or drop; no new one gets the permit after this.
        if let Ok(permit) = inner.gc_permit.acquire().await {
            permit.forget();
        }
        inner.gc_permit.close();

        // Commits already holding the ordering lock finish queueing first.
        drop(inner.oracle.write_ch_lock.lock().await);
        self.writer.shutdown().await?;

        let active = {
            let mut mts = inner.memtables.write();
            if mts.active.is_empty() {
                None
            } else {
                let active = Arc::clone(&mts.active);
                mts.immutable.push_back(Arc::clone(&active));
                Some(active)
            }
        };
        if let Some(mt) = active {
            tracing::debug!(fid = mt.fid(), size = mt.size(), "Flushing active memtable");
            inner.flush_tx.send(mt).await.map_err(|_| Error::DbClosed)?;
        }
        self.flusher.shutdown().await?;
        self.compactors.shutdown().await?;
        self.sampler.shutdown().await?;

        if inner.opts.compact_l0_on_close {
            let levels = Arc::clone(&inner.levels);
            let discard_ts = inner.oracle.discard_at_or_below();
            match tokio::task::spawn_blocking(move || levels.compact_l0(discard_ts)).await {
                Ok(Ok(ran)) => tracing::debug!(ran, "Compacted L0 on close"),
                Ok(Err(e)) => tracing::warn!(error = %e, "L0 compaction on close failed"),
                Err(e) => tracing::warn!(error = %e, "L0 compaction on close panicked"),
            }
        }

        inner.vlog.close()?;
        inner.levels.close()?;
        inner.dir_lock.lock().take();
        tracing::info!(dir = %inner.opts.dir.display(), "Closed database");
        Ok(())
    }
}

/// Undoes [`Db::pause_for_drop`].
struct DropPause<'a> {
    db: &'a Db,
    compactors_stopped: bool,
}

impl Drop for DropPause<'_> {
    fn drop(&mut self) {
        if self.compactors_stopped {
            self.db.start_compactors();
        }
        self.db.inner.dropping.store(false, Ordering::Release);
        tracing::info!("Resuming writes");
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.is_closed() {
            tracing::warn!(dir = %self.inner.opts.dir.display(), "Database dropped without close");
            self.inner.block_writes.store(true, Ordering::Release);
            self.writer.signal_shutdown();
            self.flusher.signal_shutdown();
            self.compactors.signal_shutdown();
            self.sampler.signal_shutdown();
        }
    }
}
