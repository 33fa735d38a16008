//! Write coordinator.
//!
//! A single task owns the write side of the value log and the memtables.
//! Requests queue on a bounded channel; the task drains whatever is waiting
//! and applies it as one group, so the value log head and the WAL only ever
//! see one appender.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::memtable::MemTable;
use crate::scheduler::Context;
use crate::value::{Entry, ValuePointer, BIT_VALUE_POINTER};
use crate::Error;

use super::DbInner;

pub(crate) const KV_WRITE_CH_CAPACITY: usize = 1000;

const NO_ROOM_RETRY: Duration = Duration::from_millis(10);

/// A group of entries written together. Keys are already versioned.
pub(crate) struct Request {
    pub(crate) entries: Vec<Entry>,
    /// Filled by the value log: where each entry's value went, if it left
    /// the LSM.
    pub(crate) ptrs: Vec<Option<ValuePointer>>,
    done: Option<oneshot::Sender<Result<()>>>,
}

impl Request {
    pub(crate) fn new(entries: Vec<Entry>) -> Self {
        Self {
            entries,
            ptrs: Vec::new(),
            done: None,
        }
    }

    /// A request plus the receiver its outcome is delivered on.
    pub(crate) fn with_done(entries: Vec<Entry>) -> (Self, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let mut req = Self::new(entries);
        req.done = Some(tx);
        (req, rx)
    }

    fn resolve(&mut self, result: Result<()>) {
        if let Some(tx) = self.done.take() {
            // The submitter may have stopped waiting.
            let _ = tx.send(result);
        }
    }
}

/// Body of the writer task. Returns once shutdown fires and every request
/// already queued has been written.
pub(crate) async fn run_writer(
    db: Arc<DbInner>,
    mut rx: mpsc::Receiver<Request>,
    mut ctx: Context,
) -> Result<()> {
    let max_group = 3 * KV_WRITE_CH_CAPACITY;
    let mut group = Vec::new();
    loop {
        tokio::select! {
            req = rx.recv() => match req {
                Some(req) => group.push(req),
                None => break,
            },
            _ = ctx.shutdown.recv() => break,
        }
        while group.len() < max_group {
            match rx.try_recv() {
                Ok(req) => group.push(req),
                Err(_) => break,
            }
        }
        db.write_requests(std::mem::take(&mut group)).await;
    }

    rx.close();
    let mut drained = 0usize;
    while let Some(req) = rx.recv().await {
        group.push(req);
        drained += 1;
        if group.len() >= max_group {
            db.write_requests(std::mem::take(&mut group)).await;
        }
    }
    db.write_requests(group).await;
    tracing::debug!(task = ctx.task_name, drained, "Writer stopped");
    Ok(())
}

impl DbInner {
    /// Writes one group: values to the value log first, then each request
    /// into the memtable. Every request is resolved exactly once.
    pub(crate) async fn write_requests(&self, mut reqs: Vec<Request>) {
        if reqs.is_empty() {
            return;
        }
        let count: usize = reqs.iter().map(|r| r.entries.len()).sum();
        tracing::trace!(requests = reqs.len(), entries = count, "Writing group");

        if let Err(e) = self.vlog.write(&mut reqs) {
            tracing::error!(error = %e, requests = reqs.len(), "Value log write failed");
            for req in &mut reqs {
                req.resolve(Err(e.duplicate()));
            }
            return;
        }

        for mut req in reqs {
            let result = self.write_to_lsm(&req).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, entries = req.entries.len(), "Memtable write failed");
            }
            req.resolve(result);
        }
    }

    async fn write_to_lsm(&self, req: &Request) -> Result<()> {
        if req.ptrs.len() != req.entries.len() {
            return Err(Error::InvalidRequest(format!(
                "{} entries but {} value pointers",
                req.entries.len(),
                req.ptrs.len()
            )));
        }
        let mt = self.ensure_room().await?;
        for (e, ptr) in req.entries.iter().zip(&req.ptrs) {
            match ptr {
                Some(vp) => mt.put(&Entry {
                    key: e.key.clone(),
                    value: vp.encode().to_vec(),
                    expires_at: e.expires_at,
                    version: e.version,
                    user_meta: e.user_meta,
                    meta: e.meta | BIT_VALUE_POINTER,
                })?,
                None => mt.put(e)?,
            }
        }
        if self.opts.sync_writes {
            mt.sync_wal()?;
        }
        Ok(())
    }

    /// Waits until the active memtable has room, polling while the flush
    /// queue is full.
    async fn ensure_room(&self) -> Result<Arc<MemTable>> {
        let mut waiting = false;
        loop {
            match self.ensure_room_for_write() {
                Err(Error::NoRoom) => {
                    if !waiting {
                        tracing::debug!("Flush queue full, waiting for room");
                        waiting = true;
                    }
                    tokio::time::sleep(NO_ROOM_RETRY).await;
                }
                other => return other,
            }
        }
    }

    /// Returns the memtable the next request goes to. A full active
    /// memtable is queued for flush and replaced; `NoRoom` when the flush
    /// queue cannot take it yet.
    pub(crate) fn ensure_room_for_write(&self) -> Result<Arc<MemTable>> {
        let mut mts = self.memtables.write();
        if !mts.active.is_full() {
            return Ok(Arc::clone(&mts.active));
        }

        let permit = match self.flush_tx.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => return Err(Error::NoRoom),
            Err(TrySendError::Closed(())) => return Err(Error::DbClosed),
        };

        let fid = self.next_mem_fid.fetch_add(1, Ordering::SeqCst);
        let fresh = Arc::new(MemTable::create(&self.opts, fid)?);
        let full = std::mem::replace(&mut mts.active, Arc::clone(&fresh));
        mts.immutable.push_back(Arc::clone(&full));
        tracing::debug!(
            fid = full.fid(),
            size = full.size(),
            immutable = mts.immutable.len(),
            next_fid = fid,
            "Memtable full, queued for flush"
        );
        permit.send(full);
        Ok(fresh)
    }
}
