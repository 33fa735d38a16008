use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Handed to every run of a background task.
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Work run on a fixed tick until its scheduler shuts down.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// One tick. Errors are logged and the next tick still runs.
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// A group of background tasks sharing one shutdown signal.
///
/// The engine keeps one scheduler per task kind so that each kind can be
/// stopped and drained in order.
pub struct Scheduler {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Starts `task` on its own timer loop.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.tasks.lock().push(handle);
        self
    }

    /// Spawn a long-running task. It receives a [`Context`] and is expected
    /// to return once the shutdown signal fires.
    pub fn spawn<F, Fut>(&self, name: &'static str, f: F)
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let ctx = Context {
            task_name: name,
            run_id: 0,
            shutdown: self.shutdown_tx.subscribe(),
        };
        let fut = f(ctx);
        let handle = tokio::spawn(async move {
            if let Err(e) = fut.await {
                tracing::error!(task = name, error = %e, "Task failed");
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(task.initial_delay()) => {}
                _ = shutdown_rx.recv() => return,
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "Task execution failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::debug!(task = task.name(), "Task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Fires the shutdown signal without waiting for the tasks.
    pub fn signal_shutdown(&self) {
        self.shutdown_tx.send(()).ok();
    }

    /// Signal every task in the group and wait for all of them.
    pub async fn shutdown(&self) -> Result<()> {
        self.signal_shutdown();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.await
                .map_err(|e| crate::Error::InvalidState(format!("Task join error: {}", e)))?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Ticker {
        delay: Duration,
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for Ticker {
        fn name(&self) -> &'static str {
            "ticker"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        fn initial_delay(&self) -> Duration {
            self.delay
        }

        async fn execute(&self, ctx: Context) -> Result<()> {
            assert!(ctx.run_id > 0);
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ticker(delay: Duration) -> (Arc<Ticker>, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let task = Arc::new(Ticker {
            delay,
            ticks: Arc::clone(&ticks),
        });
        (task, ticks)
    }

    #[tokio::test]
    async fn test_ticks_until_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let (task, ticks) = ticker(Duration::ZERO);
        scheduler.register(task);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(ticks.load(Ordering::SeqCst) > 1);

        scheduler.shutdown().await?;
        let after = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(after, ticks.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_during_initial_delay() -> Result<()> {
        let scheduler = Scheduler::new();
        let (task, ticks) = ticker(Duration::from_secs(60));
        scheduler.register(task);

        let start = std::time::Instant::now();
        scheduler.shutdown().await?;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_spawned_task_drains_on_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<u32>(16);
        let sum = Arc::new(AtomicUsize::new(0));

        let total = sum.clone();
        scheduler.spawn("drainer", move |mut ctx| async move {
            loop {
                tokio::select! {
                    Some(v) = rx.recv() => { total.fetch_add(v as usize, Ordering::SeqCst); }
                    _ = ctx.shutdown.recv() => break,
                }
            }
            while let Ok(v) = rx.try_recv() {
                total.fetch_add(v as usize, Ordering::SeqCst);
            }
            Ok(())
        });

        for v in 1..=10 {
            tx.send(v).await.unwrap();
        }
        scheduler.shutdown().await?;
        assert_eq!(sum.load(Ordering::SeqCst), 55);
        Ok(())
    }
}
