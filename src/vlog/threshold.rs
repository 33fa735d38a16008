//! Value threshold that follows the observed value-size distribution.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::Options;
use crate::scheduler::Context;

const SAMPLE_CHANNEL_CAPACITY: usize = 1000;

/// Bucketed histogram with four linear steps per power of two.
#[derive(Debug)]
struct Histogram {
    bounds: Vec<usize>,
    counts: Vec<u64>,
    total: u64,
}

impl Histogram {
    fn new(min: usize, max: usize) -> Self {
        let mut bounds = Vec::new();
        let mut base = min.max(32).next_power_of_two() / 2;
        while base < max {
            for step in 0..4 {
                let b = base + step * base / 4;
                if b >= min && b <= max {
                    bounds.push(b);
                }
            }
            base *= 2;
        }
        bounds.push(max);
        bounds.dedup();
        let counts = vec![0; bounds.len()];
        Self {
            bounds,
            counts,
            total: 0,
        }
    }

    fn record(&mut self, size: usize) {
        let idx = self
            .bounds
            .partition_point(|b| *b < size)
            .min(self.bounds.len() - 1);
        self.counts[idx] += 1;
        self.total += 1;
    }

    /// Smallest bucket bound at or above the `p` quantile.
    fn percentile(&self, p: f64) -> usize {
        let target = (self.total as f64 * p).ceil() as u64;
        let mut seen = 0;
        for (i, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= target.max(1) {
                return self.bounds[i];
            }
        }
        self.bounds[self.bounds.len() - 1]
    }
}

/// Current inline/value-log cutoff. Writers read it lock-free; the sampler
/// task moves it when a percentile is configured.
pub struct ValueThreshold {
    current: AtomicUsize,
    percentile: f64,
    min: usize,
    max: usize,
    sender: Option<mpsc::Sender<Vec<usize>>>,
    receiver: Mutex<Option<mpsc::Receiver<Vec<usize>>>>,
}

impl ValueThreshold {
    pub fn new(opts: &Options) -> Self {
        let dynamic = opts.value_threshold_percentile > 0.0;
        let (sender, receiver) = if dynamic {
            let (tx, rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        Self {
            current: AtomicUsize::new(opts.value_threshold),
            percentile: opts.value_threshold_percentile,
            min: opts.min_value_threshold,
            max: opts.max_value_threshold,
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    pub fn get(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn is_dynamic(&self) -> bool {
        self.sender.is_some()
    }

    /// Hands a batch of value sizes to the sampler without blocking. A full
    /// channel drops the batch.
    pub fn sample(&self, sizes: Vec<usize>) {
        if let Some(tx) = &self.sender {
            if !sizes.is_empty() && tx.try_send(sizes).is_err() {
                tracing::trace!("Value size sampler is behind, dropping batch");
            }
        }
    }

    /// Sampler loop. Recomputes the threshold after every received batch
    /// until shutdown.
    pub async fn run(&self, mut ctx: Context) -> crate::Result<()> {
        let rx = self.receiver.lock().take();
        let Some(mut rx) = rx else {
            return Ok(());
        };
        let mut histogram = Histogram::new(self.min, self.max);
        loop {
            tokio::select! {
                batch = rx.recv() => {
                    let Some(batch) = batch else { break };
                    self.apply(&mut histogram, &batch);
                }
                _ = ctx.shutdown.recv() => break,
            }
        }
        tracing::debug!(threshold = self.get(), "Value size sampler stopped");
        Ok(())
    }

    fn apply(&self, histogram: &mut Histogram, batch: &[usize]) {
        for size in batch {
            histogram.record(*size);
        }
        let next = histogram.percentile(self.percentile).clamp(self.min, self.max);
        let prev = self.current.swap(next, Ordering::AcqRel);
        if prev != next {
            tracing::debug!(prev, next, "Value threshold moved");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dynamic(dir: &TempDir, pct: f64) -> ValueThreshold {
        let opts = Options::new(dir.path()).dynamic_value_threshold(1 << 10, 1 << 16, pct);
        ValueThreshold::new(&opts)
    }

    #[test]
    fn test_static_threshold() {
        let dir = TempDir::new().unwrap();
        let t = ValueThreshold::new(&Options::new(dir.path()).value_threshold(100));
        assert!(!t.is_dynamic());
        t.sample(vec![1 << 20; 10]);
        assert_eq!(t.get(), 100);
    }

    #[test]
    fn test_percentile_is_clamped() {
        let dir = TempDir::new().unwrap();
        let t = dynamic(&dir, 0.99);
        let mut h = Histogram::new(t.min, t.max);

        t.apply(&mut h, &[10; 100]);
        assert_eq!(t.get(), 1 << 10, "tiny values clamp to the minimum");

        t.apply(&mut h, &[1 << 24; 10_000]);
        assert_eq!(t.get(), 1 << 16, "huge values clamp to the maximum");
    }

    #[test]
    fn test_bursty_distribution_converges() {
        let dir = TempDir::new().unwrap();
        let t = dynamic(&dir, 0.9);
        let mut h = Histogram::new(t.min, t.max);

        // Mostly 2KB values with a burst of 40KB ones.
        for _ in 0..50 {
            t.apply(&mut h, &[2000; 100]);
        }
        let settled = t.get();
        assert!((2000..=2560).contains(&settled), "settled at {}", settled);

        t.apply(&mut h, &[40_000; 100]);
        assert_eq!(t.get(), settled, "a short burst stays above the 90th percentile");

        for _ in 0..100 {
            t.apply(&mut h, &[40_000; 100]);
        }
        let moved = t.get();
        assert!((40_000..=49_152).contains(&moved), "moved to {}", moved);
    }

    #[tokio::test]
    async fn test_sampler_task_updates_threshold() -> crate::Result<()> {
        let dir = TempDir::new()?;
        let t = std::sync::Arc::new(dynamic(&dir, 0.5));
        let scheduler = crate::scheduler::Scheduler::new();
        let sampler = t.clone();
        scheduler.spawn("value-threshold", move |ctx| async move { sampler.run(ctx).await });

        t.sample(vec![5000; 64]);
        for _ in 0..100 {
            if t.get() != 1 << 10 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(t.get() >= 5000);
        scheduler.shutdown().await
    }
}
