//! Per value-log-file discard counters, persisted in `DISCARD`.
//!
//! The file is a sorted array of 16-byte slots `[fid u64][discard u64]`,
//! both big-endian. A zero fid after the first slot marks the end of the
//! used region. The file doubles when it runs out of slots.

use std::fs::{File, OpenOptions};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;

use crate::error::Result;

pub const DISCARD_FILENAME: &str = "DISCARD";

const SLOT_SIZE: usize = 16;
const INITIAL_SLOTS: usize = 1024;

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        written += file.seek_write(&buf[written..], offset + written as u64)?;
    }
    Ok(())
}

struct Inner {
    file: File,
    slots: Vec<(u64, u64)>,
    capacity: usize,
}

impl Inner {
    fn write_from(&self, idx: usize) -> Result<()> {
        let mut buf = vec![0u8; (self.slots.len() - idx + 1) * SLOT_SIZE];
        for (i, (fid, discard)) in self.slots[idx..].iter().enumerate() {
            BigEndian::write_u64(&mut buf[i * SLOT_SIZE..], *fid);
            BigEndian::write_u64(&mut buf[i * SLOT_SIZE + 8..], *discard);
        }
        // The trailing zero slot terminates the used region.
        if self.slots.len() >= self.capacity {
            buf.truncate(buf.len() - SLOT_SIZE);
        }
        write_all_at(&self.file, &buf, (idx * SLOT_SIZE) as u64)?;
        Ok(())
    }

    fn grow(&mut self) -> Result<()> {
        self.capacity *= 2;
        self.file.set_len((self.capacity * SLOT_SIZE) as u64)?;
        Ok(())
    }
}

pub struct DiscardStats {
    inner: Mutex<Inner>,
}

impl DiscardStats {
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(DISCARD_FILENAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let data = std::fs::read(&path)?;
        let mut capacity = data.len() / SLOT_SIZE;
        if capacity < INITIAL_SLOTS {
            capacity = INITIAL_SLOTS;
            file.set_len((capacity * SLOT_SIZE) as u64)?;
        }

        let mut slots = Vec::new();
        for (i, chunk) in data.chunks_exact(SLOT_SIZE).enumerate() {
            let fid = BigEndian::read_u64(&chunk[0..8]);
            if fid == 0 && i > 0 {
                break;
            }
            let discard = BigEndian::read_u64(&chunk[8..16]);
            if fid == 0 && discard == 0 {
                break;
            }
            slots.push((fid, discard));
        }
        slots.sort_unstable_by_key(|s| s.0);
        tracing::debug!(files = slots.len(), "Loaded discard stats");

        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                slots,
                capacity,
            }),
        })
    }

    /// Adds `delta` to the counter of `fid`; a negative delta resets it and
    /// zero only reads it. Returns the resulting count.
    pub fn update(&self, fid: u32, delta: i64) -> Result<u64> {
        let fid = u64::from(fid);
        let mut inner = self.inner.lock();
        match inner.slots.binary_search_by_key(&fid, |s| s.0) {
            Ok(idx) => {
                let current = inner.slots[idx].1;
                let next = match delta {
                    0 => return Ok(current),
                    d if d < 0 => 0,
                    d => current + d as u64,
                };
                inner.slots[idx].1 = next;
                inner.write_from(idx)?;
                Ok(next)
            }
            Err(idx) => {
                if delta <= 0 {
                    return Ok(0);
                }
                if inner.slots.len() + 1 >= inner.capacity {
                    inner.grow()?;
                }
                inner.slots.insert(idx, (fid, delta as u64));
                inner.write_from(idx)?;
                Ok(delta as u64)
            }
        }
    }

    /// Counters keyed by fid.
    pub fn all(&self) -> Vec<(u32, u64)> {
        self.inner
            .lock()
            .slots
            .iter()
            .map(|(fid, d)| (*fid as u32, *d))
            .collect()
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_update_and_reload() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let stats = DiscardStats::open(dir.path())?;
            assert_eq!(stats.update(7, 100)?, 100);
            assert_eq!(stats.update(3, 10)?, 10);
            assert_eq!(stats.update(7, 50)?, 150);
            assert_eq!(stats.update(7, 0)?, 150);
            assert_eq!(stats.update(9, 0)?, 0);
            stats.sync()?;
        }
        let stats = DiscardStats::open(dir.path())?;
        assert_eq!(stats.all(), vec![(3, 10), (7, 150)]);

        stats.update(3, -1)?;
        assert_eq!(stats.update(3, 0)?, 0);
        Ok(())
    }

    #[test]
    fn test_grows_by_doubling() -> Result<()> {
        let dir = TempDir::new()?;
        let stats = DiscardStats::open(dir.path())?;
        for fid in 1..=(INITIAL_SLOTS as u32 + 10) {
            stats.update(fid, 1)?;
        }
        let len = std::fs::metadata(dir.path().join(DISCARD_FILENAME))?.len();
        assert_eq!(len, (INITIAL_SLOTS * 2 * SLOT_SIZE) as u64);
        drop(stats);

        let stats = DiscardStats::open(dir.path())?;
        assert_eq!(stats.all().len(), INITIAL_SLOTS + 10);
        Ok(())
    }
}
