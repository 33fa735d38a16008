//! Flush worker: turns immutable memtables into L0 tables, oldest first.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::Options;
use crate::error::Result;
use crate::iterator::KvIterator;
use crate::memtable::MemTable;
use crate::scheduler::Context;
use crate::table::{table_path, Table, TableBuilder, TableOptions};
use crate::Error;

use super::DbInner;

const FLUSH_BACKOFF_MIN: Duration = Duration::from_millis(100);
const FLUSH_BACKOFF_MAX: Duration = Duration::from_secs(10);
/// Failed attempts logged as warnings before switching to errors.
const FLUSH_WARN_ATTEMPTS: u32 = 3;

pub(crate) async fn run_flusher(
    db: Arc<DbInner>,
    mut rx: mpsc::Receiver<Arc<MemTable>>,
    mut ctx: Context,
) -> Result<()> {
    loop {
        tokio::select! {
            mt = rx.recv() => match mt {
                Some(mt) => db.flush_with_retry(mt).await,
                None => break,
            },
            _ = ctx.shutdown.recv() => break,
        }
    }

    rx.close();
    while let Some(mt) = rx.recv().await {
        db.flush_with_retry(mt).await;
    }
    tracing::debug!(task = ctx.task_name, "Flusher stopped");
    Ok(())
}

impl DbInner {
    /// Flushes `mt` until it succeeds, then drops it from the immutable
    /// queue and lets its WAL go.
    async fn flush_with_retry(&self, mt: Arc<MemTable>) {
        let mut backoff = FLUSH_BACKOFF_MIN;
        let mut attempt = 0u32;
        while let Err(e) = self.flush_memtable(&mt).await {
            attempt += 1;
            if attempt <= FLUSH_WARN_ATTEMPTS {
                tracing::warn!(fid = mt.fid(), attempt, error = %e, "Memtable flush failed, retrying");
            } else {
                tracing::error!(fid = mt.fid(), attempt, error = %e, "Memtable flush failed, retrying");
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(FLUSH_BACKOFF_MAX);
        }

        {
            let mut mts = self.memtables.write();
            if mts.immutable.front().is_some_and(|front| Arc::ptr_eq(front, &mt)) {
                mts.immutable.pop_front();
            } else {
                tracing::error!(fid = mt.fid(), "Flushed memtable is not the oldest immutable one");
            }
        }
        self.flushed.notify_waiters();
        mt.delete_wal();
    }

    async fn flush_memtable(&self, mt: &Arc<MemTable>) -> Result<()> {
        if mt.is_empty() {
            tracing::debug!(fid = mt.fid(), "Skipping empty memtable");
            return Ok(());
        }
        let id = self.levels.reserve_file_id();
        let opts = self.opts.clone();
        let source = Arc::clone(mt);
        let table = tokio::task::spawn_blocking(move || build_l0_table(&opts, &source, id))
            .await
            .map_err(|e| Error::InvalidState(format!("flush task failed: {}", e)))??;

        let size = table.size();
        self.levels.add_l0_table(Arc::new(table)).await?;
        tracing::info!(
            table_id = id,
            fid = mt.fid(),
            entries = mt.len(),
            size,
            "Flushed memtable"
        );
        Ok(())
    }
}

/// Writes every version in `mt` into a new table file.
pub(crate) fn build_l0_table(opts: &Options, mt: &Arc<MemTable>, id: u64) -> Result<Table> {
    let mut builder = TableBuilder::new(TableOptions::from_options(opts, opts.memtable_size));
    let mut it = mt.iter(false);
    it.rewind();
    while it.valid() {
        let vs = it.value();
        let vlog_len = vs.pointer()?.map_or(0, |vp| vp.len);
        builder.add(it.key(), &vs, vlog_len);
        it.next();
    }
    Table::create(table_path(&opts.dir, id), id, builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::key_with_ts;
    use crate::levels::tests::test_options;
    use crate::value::Entry;
    use tempfile::TempDir;

    #[test]
    fn test_build_l0_table_keeps_every_version() -> Result<()> {
        let dir = TempDir::new()?;
        let opts = test_options(&dir);
        let mt = Arc::new(MemTable::create(&opts, 1)?);
        mt.put(&Entry::new(key_with_ts(b"a", 2), b"a2".to_vec()))?;
        mt.put(&Entry::new(key_with_ts(b"a", 1), b"a1".to_vec()))?;
        mt.put(&Entry::delete(key_with_ts(b"b", 3)))?;

        let table = Arc::new(build_l0_table(&opts, &mt, 7)?);
        assert_eq!(table.key_count(), 3);
        assert_eq!(table.max_version(), 3);
        assert_eq!(table.get(&key_with_ts(b"a", 1))?.unwrap().value, b"a1");
        assert_eq!(table.get(&key_with_ts(b"a", 5))?.unwrap().value, b"a2");
        assert!(table.get(&key_with_ts(b"b", 3))?.unwrap().is_deleted_or_expired());
        Ok(())
    }
}
