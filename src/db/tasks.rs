use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context};
use crate::Error;

use super::DbInner;

const COMPACTION_INTERVAL: Duration = Duration::from_millis(50);
const MAX_START_JITTER_MS: u64 = 1000;
/// Consecutive failed passes logged as warnings before they become errors.
const COMPACTION_WARN_FAILURES: u32 = 3;

/// One compaction worker. Each tick runs at most one compaction on a
/// blocking thread. Holding the engine keeps the directory locked until
/// the worker is gone.
pub(crate) struct CompactionTask {
    id: usize,
    db: Arc<DbInner>,
    start_delay: Duration,
    failures: AtomicU32,
}

impl CompactionTask {
    pub(crate) fn new(id: usize, db: Arc<DbInner>) -> Self {
        // Spread the workers out so they don't all pick the same level.
        let start_delay = Duration::from_millis(rand::thread_rng().gen_range(0..MAX_START_JITTER_MS));
        Self {
            id,
            db,
            start_delay,
            failures: AtomicU32::new(0),
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        COMPACTION_INTERVAL
    }

    fn initial_delay(&self) -> Duration {
        self.start_delay
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        let levels = Arc::clone(&self.db.levels);
        let id = self.id;
        let discard_ts = self.db.oracle.discard_at_or_below();
        let outcome = tokio::task::spawn_blocking(move || levels.run_compactor_pass(id, discard_ts))
            .await
            .map_err(|e| Error::InvalidState(format!("compaction task failed: {}", e)))?;
        match outcome {
            Ok(ran) => {
                self.failures.store(0, Ordering::Release);
                if ran {
                    tracing::trace!(compactor = id, run_id = ctx.run_id, discard_ts, "Compaction pass done");
                }
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures <= COMPACTION_WARN_FAILURES {
                    tracing::warn!(compactor = id, failures, error = %e, "Compaction failed, retrying");
                } else {
                    tracing::error!(compactor = id, failures, error = %e, "Compaction keeps failing");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::db::Db;
    use crate::levels::tests::{add_table, val};
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    fn ctx(rx: &broadcast::Receiver<()>, run_id: u64) -> Context {
        Context {
            task_name: "compaction",
            run_id,
            shutdown: rx.resubscribe(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failures_accumulate_until_a_pass_succeeds() -> Result<()> {
        let tmp = TempDir::new()?;
        let dir = tmp.path().join("db");
        let opts = Options::new(&dir)
            .memtable_size(1 << 16)
            .base_table_size(1 << 12)
            .base_level_size(1 << 14)
            .num_level_zero_tables(2)
            .max_levels(4)
            .num_compactors(0);
        let db = Db::open(opts).await?;
        let task = CompactionTask::new(0, Arc::clone(&db.inner));
        for ts in 1..=3u64 {
            add_table(&db.inner.levels, 0, &[("a", ts, val("a")), ("z", ts, val("z"))]);
        }

        // Output tables cannot be created while the directory is gone.
        std::fs::remove_dir_all(&dir)?;
        let (_tx, rx) = broadcast::channel(1);
        for run_id in 1..=COMPACTION_WARN_FAILURES as u64 + 2 {
            task.execute(ctx(&rx, run_id)).await?;
        }
        assert_eq!(task.failures.load(Ordering::Acquire), COMPACTION_WARN_FAILURES + 2);
        assert_eq!(db.inner.levels.num_l0_tables(), 3);

        std::fs::create_dir_all(&dir)?;
        task.execute(ctx(&rx, 10)).await?;
        assert_eq!(task.failures.load(Ordering::Acquire), 0);
        assert_eq!(db.inner.levels.num_l0_tables(), 0);
        db.close().await?;
        Ok(())
    }
}
