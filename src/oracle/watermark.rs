use std::collections::BTreeMap;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct MarkState {
    done_until: u64,
    last_index: u64,
    /// Outstanding begin count per index.
    pending: BTreeMap<u64, i64>,
}

/// Tracks a stream of indices that begin and finish out of order, and the
/// highest index below which everything has finished.
#[derive(Debug)]
pub struct WaterMark {
    name: &'static str,
    state: Mutex<MarkState>,
}

impl WaterMark {
    pub fn new(name: &'static str, done_until: u64) -> Self {
        Self {
            name,
            state: Mutex::new(MarkState {
                done_until,
                last_index: done_until,
                pending: BTreeMap::new(),
            }),
        }
    }

    pub fn begin(&self, index: u64) {
        let mut s = self.state.lock();
        s.last_index = s.last_index.max(index);
        *s.pending.entry(index).or_default() += 1;
    }

    pub fn done(&self, index: u64) {
        let mut s = self.state.lock();
        match s.pending.get_mut(&index) {
            Some(count) => *count -= 1,
            None => {
                tracing::warn!(mark = self.name, index, "Finished an index that never began");
                return;
            }
        }

        let mut advanced = false;
        while let Some((&idx, &count)) = s.pending.first_key_value() {
            if count > 0 {
                break;
            }
            s.pending.remove(&idx);
            s.done_until = s.done_until.max(idx);
            advanced = true;
        }
        if advanced {
            tracing::trace!(mark = self.name, done_until = s.done_until, "Watermark advanced");
        }
    }

    /// Every index at or below this has finished.
    pub fn done_until(&self) -> u64 {
        self.state.lock().done_until
    }

    pub fn last_index(&self) -> u64 {
        self.state.lock().last_index
    }

    /// Smallest index still in flight.
    pub fn min_pending(&self) -> Option<u64> {
        self.state
            .lock()
            .pending
            .iter()
            .find(|(_, count)| **count > 0)
            .map(|(idx, _)| *idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_done() {
        let wm = WaterMark::new("test", 0);
        wm.begin(1);
        wm.begin(2);
        wm.begin(3);
        wm.done(2);
        assert_eq!(wm.done_until(), 0);
        wm.done(1);
        assert_eq!(wm.done_until(), 2);
        assert_eq!(wm.min_pending(), Some(3));
        wm.done(3);
        assert_eq!(wm.done_until(), 3);
        assert_eq!(wm.min_pending(), None);
        assert_eq!(wm.last_index(), 3);
    }

    #[test]
    fn test_repeated_index() {
        let wm = WaterMark::new("test", 5);
        wm.begin(5);
        wm.begin(5);
        wm.done(5);
        assert_eq!(wm.min_pending(), Some(5));
        wm.done(5);
        assert_eq!(wm.min_pending(), None);
        assert_eq!(wm.done_until(), 5);
    }

    #[test]
    fn test_unknown_done_is_ignored() {
        let wm = WaterMark::new("test", 1);
        wm.done(7);
        assert_eq!(wm.done_until(), 1);
    }
}
