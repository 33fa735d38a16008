use crate::error::Result;
use crate::txn::{user_entry, Limits};
use crate::value::Entry;

/// Blind writes applied atomically by [`Db::write`](crate::Db::write).
///
/// Unlike a [`Txn`](crate::Txn) a batch reads nothing, so it never
/// conflicts. Entries are checked against the same limits as txn writes
/// when they are added.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    limits: Limits,
    entries: Vec<Entry>,
    count: u64,
    size: u64,
}

impl WriteBatch {
    pub(crate) fn new(limits: Limits) -> Self {
        Self {
            limits,
            entries: Vec::new(),
            count: 0,
            size: 0,
        }
    }

    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        self.set_entry(Entry::new(key, value))
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> Result<()> {
        self.set_entry(Entry::delete(key))
    }

    pub fn set_entry(&mut self, e: Entry) -> Result<()> {
        self.limits.check_entry(&e)?;
        let (count, size) = self.limits.charge(&e, self.count, self.size)?;
        self.count = count;
        self.size = size;
        self.entries.push(user_entry(e));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> Vec<Entry> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::Error;

    fn batch() -> WriteBatch {
        let opts = Options::new("unused").memtable_size(1 << 16);
        WriteBatch::new(Limits::new(&opts, 1024))
    }

    #[test]
    fn test_batch_collects_entries() -> Result<()> {
        let mut wb = batch();
        assert!(wb.is_empty());
        wb.set(b"a".to_vec(), b"1".to_vec())?;
        wb.delete(b"b".to_vec())?;
        assert_eq!(wb.len(), 2);
        let entries = wb.into_entries();
        assert!(!entries[0].is_txn_marker());
        assert_eq!(entries[1].meta, crate::value::BIT_DELETE);
        Ok(())
    }

    #[test]
    fn test_batch_rejects_oversized() {
        let mut wb = batch();
        assert!(matches!(wb.set(Vec::new(), b"v".to_vec()), Err(Error::EmptyKey)));
        let mut result = Ok(());
        for i in 0..10_000u32 {
            result = wb.set(i.to_be_bytes().to_vec(), vec![7u8; 64]);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(Error::TxnTooBig)));
        assert!(!wb.is_empty());
    }
}
