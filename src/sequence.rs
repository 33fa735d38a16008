use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use tokio::sync::Mutex;

use crate::db::DbInner;
use crate::error::Result;
use crate::txn::Txn;
use crate::Error;

struct Lease {
    next: u64,
    leased: u64,
}

/// Monotonic integers backed by a key. Ranges of `bandwidth` numbers are
/// leased through txns, so a crash wastes at most one range.
pub struct Sequence {
    db: Arc<DbInner>,
    key: Vec<u8>,
    bandwidth: u64,
    lease: Mutex<Lease>,
}

impl Sequence {
    pub(crate) async fn new(db: Arc<DbInner>, key: Vec<u8>, bandwidth: u64) -> Result<Self> {
        if bandwidth == 0 {
            return Err(Error::InvalidRequest("sequence bandwidth must be positive".into()));
        }
        let seq = Self {
            db,
            key,
            bandwidth,
            lease: Mutex::new(Lease { next: 0, leased: 0 }),
        };
        {
            let mut lease = seq.lease.lock().await;
            seq.renew(&mut lease).await?;
        }
        Ok(seq)
    }

    /// Next number, leasing a new range when the current one runs out.
    pub async fn next(&self) -> Result<u64> {
        let mut lease = self.lease.lock().await;
        if lease.next >= lease.leased {
            self.renew(&mut lease).await?;
        }
        let n = lease.next;
        lease.next += 1;
        Ok(n)
    }

    /// Hands the unused part of the lease back, so the next lease starts
    /// right after the last number returned.
    pub async fn release(&self) -> Result<()> {
        let mut lease = self.lease.lock().await;
        let mut txn = Txn::new(Arc::clone(&self.db), true);
        txn.set(self.key.clone(), lease.next.to_be_bytes().to_vec())?;
        txn.commit().await?;
        lease.leased = lease.next;
        Ok(())
    }

    async fn renew(&self, lease: &mut Lease) -> Result<()> {
        let mut txn = Txn::new(Arc::clone(&self.db), true);
        let start = match txn.get(&self.key)? {
            Some(item) if item.value().len() == 8 => BigEndian::read_u64(item.value()),
            Some(item) => {
                return Err(Error::Decode(
                    "sequence lease",
                    format!("expected 8 bytes, got {}", item.value().len()),
                ))
            }
            None => 0,
        };
        let leased = start + self.bandwidth;
        txn.set(self.key.clone(), leased.to_be_bytes().to_vec())?;
        txn.commit().await?;
        tracing::debug!(key = ?String::from_utf8_lossy(&self.key), start, leased, "Leased sequence range");
        lease.next = start;
        lease.leased = leased;
        Ok(())
    }
}
