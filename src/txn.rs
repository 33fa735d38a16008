//! Optimistic transactions.
//!
//! A txn reads at a fixed snapshot and buffers its writes. At commit the
//! oracle checks that nothing it read was overwritten by a txn that
//! committed in the meantime, assigns the commit ts and the writes are
//! queued as one atomic group closed by a txn-end marker.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_64;

use crate::config::Options;
use crate::db::DbInner;
use crate::error::Result;
use crate::iterator::Item;
use crate::key::key_with_ts;
use crate::value::{
    is_deleted_or_expired, Entry, ValueStruct, BIT_DELETE, BIT_DISCARD_EARLIER_VERSIONS,
    BIT_FIN_TXN, BIT_TXN, INTERNAL_KEY_PREFIX, TXN_KEY,
};
use crate::Error;

/// Per-request bookkeeping charged on top of each entry's size.
const ENTRY_BATCH_OVERHEAD: u64 = 10;

/// Size limits every buffered write is checked against.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    max_key_size: usize,
    max_value_size: u64,
    max_batch_count: u64,
    max_batch_size: u64,
    value_threshold: usize,
}

impl Limits {
    pub(crate) fn new(opts: &Options, value_threshold: usize) -> Self {
        Self {
            max_key_size: opts.max_key_size,
            max_value_size: opts.value_log_file_size,
            max_batch_count: opts.max_batch_count(),
            max_batch_size: opts.max_batch_size(),
            value_threshold,
        }
    }

    /// Rejects entries no request could carry.
    pub(crate) fn check_entry(&self, e: &Entry) -> Result<()> {
        if e.key.is_empty() {
            return Err(Error::EmptyKey);
        }
        if e.key.starts_with(INTERNAL_KEY_PREFIX) {
            return Err(Error::InvalidRequest(format!(
                "key {:?} uses the reserved prefix",
                String::from_utf8_lossy(&e.key)
            )));
        }
        if e.key.len() > self.max_key_size {
            return Err(Error::KeyTooLarge {
                size: e.key.len(),
                limit: self.max_key_size,
            });
        }
        if e.value.len() as u64 > self.max_value_size {
            return Err(Error::ValueTooLarge {
                size: e.value.len(),
                limit: self.max_value_size as usize,
            });
        }
        Ok(())
    }

    /// Adds `e` to a running `(count, size)` tally, failing once the total
    /// no longer fits one write request.
    pub(crate) fn charge(&self, e: &Entry, count: u64, size: u64) -> Result<(u64, u64)> {
        let count = count + 1;
        let size = size + e.estimate_size(self.value_threshold) as u64 + ENTRY_BATCH_OVERHEAD;
        if count >= self.max_batch_count || size >= self.max_batch_size {
            return Err(Error::TxnTooBig);
        }
        Ok((count, size))
    }
}

/// Clears the bits only the engine may set.
pub(crate) fn user_entry(mut e: Entry) -> Entry {
    e.meta &= BIT_DELETE | BIT_DISCARD_EARLIER_VERSIONS;
    e.version = 0;
    e
}

/// Stamps user entries with `commit_ts` and closes the group with a
/// txn-end marker.
pub(crate) fn commit_entries(entries: impl IntoIterator<Item = Entry>, commit_ts: u64) -> Vec<Entry> {
    let mut out: Vec<Entry> = entries
        .into_iter()
        .map(|mut e| {
            e.key = key_with_ts(&e.key, commit_ts);
            e.version = commit_ts;
            e.meta |= BIT_TXN;
            e
        })
        .collect();
    out.push(Entry {
        key: key_with_ts(TXN_KEY, commit_ts),
        value: commit_ts.to_be_bytes().to_vec(),
        version: commit_ts,
        meta: BIT_FIN_TXN,
        ..Default::default()
    });
    out
}

fn fingerprint(key: &[u8]) -> u64 {
    xxh3_64(key)
}

/// A transaction. Read-only unless created with `update`.
///
/// Dropping a txn without committing discards it.
pub struct Txn {
    db: Arc<DbInner>,
    read_ts: u64,
    update: bool,
    limits: Limits,
    pending: BTreeMap<Vec<u8>, Entry>,
    reads: Vec<u64>,
    conflict_keys: HashSet<u64>,
    size: u64,
    count: u64,
    discarded: bool,
    read_done: bool,
}

impl Txn {
    pub(crate) fn new(db: Arc<DbInner>, update: bool) -> Self {
        let read_ts = db.oracle.read_ts();
        let limits = Limits::new(&db.opts, db.vlog.threshold.get());
        Self {
            db,
            read_ts,
            update,
            limits,
            pending: BTreeMap::new(),
            reads: Vec::new(),
            conflict_keys: HashSet::new(),
            size: 0,
            count: 0,
            discarded: false,
            read_done: false,
        }
    }

    pub fn read_ts(&self) -> u64 {
        self.read_ts
    }

    /// Value of `key` as of the snapshot, with this txn's own writes on top.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Item>> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        if self.discarded {
            return Err(Error::DiscardedTxn);
        }
        if self.update {
            if let Some(e) = self.pending.get(key) {
                if is_deleted_or_expired(e.meta, e.expires_at) {
                    return Ok(None);
                }
                let vs = ValueStruct {
                    meta: e.meta,
                    user_meta: e.user_meta,
                    expires_at: e.expires_at,
                    value: Vec::new(),
                    version: self.read_ts,
                };
                return Ok(Some(Item::new(key.to_vec(), &vs, e.value.clone())));
            }
            self.reads.push(fingerprint(key));
        }
        self.db.get_item(key, self.read_ts)
    }

    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        self.set_entry(Entry::new(key, value))
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> Result<()> {
        self.set_entry(Entry::delete(key))
    }

    /// Buffers `e`. A later write to the same key replaces it.
    pub fn set_entry(&mut self, e: Entry) -> Result<()> {
        if !self.update {
            return Err(Error::ReadOnlyTxn);
        }
        if self.discarded {
            return Err(Error::DiscardedTxn);
        }
        self.limits.check_entry(&e)?;
        let (count, size) = self.limits.charge(&e, self.count, self.size)?;
        self.count = count;
        self.size = size;

        let e = user_entry(e);
        self.conflict_keys.insert(fingerprint(&e.key));
        self.pending.insert(e.key.clone(), e);
        Ok(())
    }

    /// Writes the buffered entries atomically. Fails with `Conflict` when a
    /// key this txn read was committed by another txn after the snapshot.
    /// The txn is finished either way.
    pub async fn commit(&mut self) -> Result<()> {
        if self.discarded {
            return Err(Error::DiscardedTxn);
        }
        if self.pending.is_empty() {
            self.discard();
            return Ok(());
        }

        let db = Arc::clone(&self.db);
        let (commit_ts, done) = {
            let _order = db.oracle.write_ch_lock.lock().await;
            let commit_ts = match db.oracle.new_commit_ts(self.read_ts, &self.reads, &self.conflict_keys) {
                Ok(ts) => ts,
                Err(e) => {
                    self.discard();
                    return Err(e);
                }
            };
            self.read_done = true;
            self.discarded = true;

            let entries = commit_entries(std::mem::take(&mut self.pending).into_values(), commit_ts);
            match db.queue_write(entries).await {
                Ok(done) => (commit_ts, done),
                Err(e) => {
                    db.oracle.done_commit(commit_ts);
                    return Err(e);
                }
            }
        };

        let result = done.await.unwrap_or(Err(Error::DbClosed));
        db.oracle.done_commit(commit_ts);
        if result.is_ok() {
            tracing::trace!(commit_ts, read_ts = self.read_ts, entries = self.count, "Committed txn");
        }
        result
    }

    /// Drops the buffered writes and releases the snapshot. Idempotent.
    pub fn discard(&mut self) {
        self.discarded = true;
        if !self.read_done {
            self.read_done = true;
            self.db.oracle.done_read(self.read_ts);
        }
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        self.discard();
    }
}
