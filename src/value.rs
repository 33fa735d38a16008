//! Value structs, entries and value pointers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};

use crate::encoding::{put_uvarint, read_uvarint, uvarint_len};
use crate::error::Result;
use crate::Error;

/// The entry is a tombstone.
pub const BIT_DELETE: u8 = 1 << 0;
/// The stored value is an encoded [`ValuePointer`] into the value log.
pub const BIT_VALUE_POINTER: u8 = 1 << 1;
/// Older versions of the key may be dropped once below the discard line.
pub const BIT_DISCARD_EARLIER_VERSIONS: u8 = 1 << 2;
/// Merge operand; never counted against the version budget.
pub const BIT_MERGE_ENTRY: u8 = 1 << 3;
/// Part of an atomic group that ends with a `BIT_FIN_TXN` marker.
pub const BIT_TXN: u8 = 1 << 6;
/// Closes an atomic group.
pub const BIT_FIN_TXN: u8 = 1 << 7;

/// Key written as the txn-end marker of an atomic group.
pub const TXN_KEY: &[u8] = b"!ember!txn";

/// Keys under this prefix belong to the engine and are hidden from readers.
pub const INTERNAL_KEY_PREFIX: &[u8] = b"!ember!";

pub const VALUE_POINTER_SIZE: usize = 12;

/// Location of a value stored in the value log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ValuePointer {
    pub fid: u32,
    pub len: u32,
    pub offset: u32,
}

impl ValuePointer {
    /// Layout: `fid | len | offset`, each a big-endian u32.
    pub fn encode(&self) -> [u8; VALUE_POINTER_SIZE] {
        let mut buf = [0u8; VALUE_POINTER_SIZE];
        BigEndian::write_u32(&mut buf[0..4], self.fid);
        BigEndian::write_u32(&mut buf[4..8], self.len);
        BigEndian::write_u32(&mut buf[8..12], self.offset);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != VALUE_POINTER_SIZE {
            return Err(Error::InvalidPointer(format!(
                "expected {} bytes, got {}",
                VALUE_POINTER_SIZE,
                buf.len()
            )));
        }
        Ok(Self {
            fid: BigEndian::read_u32(&buf[0..4]),
            len: BigEndian::read_u32(&buf[4..8]),
            offset: BigEndian::read_u32(&buf[8..12]),
        })
    }

    pub fn is_zero(&self) -> bool {
        self.fid == 0 && self.len == 0 && self.offset == 0
    }
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// True for tombstones and for entries whose expiry has passed.
pub fn is_deleted_or_expired(meta: u8, expires_at: u64) -> bool {
    if meta & BIT_DELETE != 0 {
        return true;
    }
    expires_at != 0 && expires_at <= now_secs()
}

/// The value half of an LSM record, as stored in memtables and tables.
///
/// `version` is not part of the encoding; it comes from the key suffix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueStruct {
    pub meta: u8,
    pub user_meta: u8,
    pub expires_at: u64,
    pub value: Vec<u8>,
    pub version: u64,
}

impl ValueStruct {
    pub fn encoded_size(&self) -> usize {
        2 + uvarint_len(self.expires_at) + self.value.len()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.meta);
        buf.push(self.user_meta);
        put_uvarint(buf, self.expires_at);
        buf.extend_from_slice(&self.value);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 3 {
            return Err(Error::Decode("value struct", format!("{} bytes", buf.len())));
        }
        let (expires_at, n) = read_uvarint(&buf[2..])?;
        Ok(Self {
            meta: buf[0],
            user_meta: buf[1],
            expires_at,
            value: buf[2 + n..].to_vec(),
            version: 0,
        })
    }

    pub fn is_deleted_or_expired(&self) -> bool {
        is_deleted_or_expired(self.meta, self.expires_at)
    }

    pub fn has_pointer(&self) -> bool {
        self.meta & BIT_VALUE_POINTER != 0
    }

    /// Decodes the value pointer this struct carries, if any.
    pub fn pointer(&self) -> Result<Option<ValuePointer>> {
        if !self.has_pointer() {
            return Ok(None);
        }
        ValuePointer::decode(&self.value).map(Some)
    }
}

/// A single mutation as handed to the engine.
///
/// Before commit `key` is the user key; the write path replaces it with the
/// versioned key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub expires_at: u64,
    pub version: u64,
    pub user_meta: u8,
    pub meta: u8,
}

impl Entry {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// A tombstone for `key`.
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            meta: BIT_DELETE,
            ..Default::default()
        }
    }

    /// Attach an application-defined byte.
    pub fn with_meta(mut self, user_meta: u8) -> Self {
        self.user_meta = user_meta;
        self
    }

    /// Expire the entry `ttl` from now.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = now_secs() + ttl.as_secs();
        self
    }

    /// Absolute expiry in seconds since the epoch.
    pub fn with_expires_at(mut self, expires_at: u64) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Allow compaction to drop every older version of this key.
    pub fn with_discard(mut self) -> Self {
        self.meta |= BIT_DISCARD_EARLIER_VERSIONS;
        self
    }

    /// Whether the value stays next to the key instead of going to the value log.
    pub(crate) fn skip_vlog(&self, threshold: usize) -> bool {
        self.value.len() < threshold
    }

    /// Approximate bytes this entry takes up in a memtable.
    pub(crate) fn estimate_size(&self, threshold: usize) -> usize {
        if self.skip_vlog(threshold) {
            self.key.len() + self.value.len() + 2
        } else {
            self.key.len() + VALUE_POINTER_SIZE + 2
        }
    }

    pub(crate) fn is_txn_marker(&self) -> bool {
        self.meta & BIT_FIN_TXN != 0
    }
}
