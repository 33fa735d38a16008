//! Immutable sorted tables.
//!
//! # File Format
//!
//! ```text
//! +-----------+-----------+-----+-------------+--------------+--------------+
//! | block 0   | block 1   | ... | index       | bloom filter | footer (40B) |
//! +-----------+-----------+-----+-------------+--------------+--------------+
//! ```
//!
//! Each block is a prefix-compressed run of `(versioned key, value struct)`
//! pairs, optionally LZ4 compressed, followed by a CRC32 of the stored bytes.
//! The index is a bincode-encoded [`TableIndex`] carrying block handles and
//! table-wide metadata. The footer locates the index and the bloom filter
//! and carries their checksums.

pub mod block;
pub mod bloom;

use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::config::Compression;
use crate::encoding::bincode;
use crate::error::Result;
use crate::iterator::KvIterator;
use crate::key::{compare_keys, parse_key, parse_ts, same_key};
use crate::logfile::CRC32;
use crate::value::{now_secs, ValueStruct};
use crate::Error;

use block::Block;
use bloom::Bloom;

const FOOTER_SIZE: usize = 40;
const TABLE_MAGIC: u64 = 0x454d_4252_5353_5401; // "EMBRSST\x01"
const CRC_SIZE: usize = 4;

pub const TABLE_EXT: &str = "sst";

pub fn table_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:06}.{}", id, TABLE_EXT))
}

/// Parses the id out of a `NNNNNN.sst` file name.
pub fn parse_table_id(name: &str) -> Option<u64> {
    name.strip_suffix(".sst")?.parse().ok()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockHandle {
    first_key: Vec<u8>,
    offset: u64,
    len: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableIndex {
    blocks: Vec<BlockHandle>,
    smallest: Vec<u8>,
    biggest: Vec<u8>,
    max_version: u64,
    stale_data_size: u64,
    key_count: u64,
    uncompressed_size: u64,
    compression: u8,
    created_at: u64,
}

/// Builder knobs, derived from the engine options per output level.
#[derive(Debug, Clone, Copy)]
pub struct TableOptions {
    pub block_size: usize,
    pub bloom_false_positive: f64,
    pub compression: Compression,
    /// Size at which compaction cuts a new table.
    pub table_size: u64,
}

impl TableOptions {
    pub fn from_options(opts: &crate::config::Options, table_size: u64) -> Self {
        Self {
            block_size: opts.block_size,
            bloom_false_positive: opts.bloom_false_positive,
            compression: opts.compression,
            table_size,
        }
    }
}

/// Accumulates sorted entries into a table image.
pub struct TableBuilder {
    opts: TableOptions,
    buf: Vec<u8>,
    block: block::Builder,
    block_first_key: Vec<u8>,
    blocks: Vec<BlockHandle>,
    key_hashes: Vec<u128>,
    last_user_key: Vec<u8>,
    smallest: Vec<u8>,
    biggest: Vec<u8>,
    max_version: u64,
    stale_data_size: u64,
    key_count: u64,
    uncompressed_size: u64,
    /// Bytes of values living in the value log, counted towards capacity.
    on_disk_value_size: u64,
}

impl TableBuilder {
    pub fn new(opts: TableOptions) -> Self {
        Self {
            opts,
            buf: Vec::new(),
            block: block::Builder::new(),
            block_first_key: Vec::new(),
            blocks: Vec::new(),
            key_hashes: Vec::new(),
            last_user_key: Vec::new(),
            smallest: Vec::new(),
            biggest: Vec::new(),
            max_version: 0,
            stale_data_size: 0,
            key_count: 0,
            uncompressed_size: 0,
            on_disk_value_size: 0,
        }
    }

    /// Adds the next entry. Keys must arrive in ascending `compare_keys`
    /// order. `vlog_len` is the size of the value-log record the entry
    /// points at, or 0.
    pub fn add(&mut self, key: &[u8], vs: &ValueStruct, vlog_len: u32) {
        self.add_internal(key, vs, vlog_len, false);
    }

    /// Like [`add`](Self::add) for an entry that is kept only as a tombstone
    /// or stale version; its size counts as reclaimable.
    pub fn add_stale_key(&mut self, key: &[u8], vs: &ValueStruct, vlog_len: u32) {
        self.add_internal(key, vs, vlog_len, true);
    }

    fn add_internal(&mut self, key: &[u8], vs: &ValueStruct, vlog_len: u32, stale: bool) {
        let value = vs.encode();
        if stale {
            self.stale_data_size += (key.len() + value.len() + 4) as u64 + u64::from(vlog_len);
        }

        if self.block.len() >= self.opts.block_size {
            self.finish_block();
        }
        if self.block.is_empty() {
            self.block_first_key = key.to_vec();
        }
        self.block.add_entry(key, &value);

        let user_key = parse_key(key);
        if self.key_count == 0 || user_key != self.last_user_key.as_slice() {
            self.key_hashes.push(bloom::hash(user_key));
            self.last_user_key = user_key.to_vec();
        }
        if self.key_count == 0 {
            self.smallest = key.to_vec();
        }
        self.biggest = key.to_vec();
        self.max_version = self.max_version.max(parse_ts(key));
        self.key_count += 1;
        self.uncompressed_size += (key.len() + value.len()) as u64;
        self.on_disk_value_size += u64::from(vlog_len);
    }

    fn finish_block(&mut self) {
        if self.block.is_empty() {
            return;
        }
        let raw = std::mem::replace(&mut self.block, block::Builder::new()).finish();
        let mut stored = match self.opts.compression {
            Compression::None => raw,
            Compression::Lz4 => lz4_flex::compress_prepend_size(&raw),
        };
        let crc = CRC32.checksum(&stored);
        let mut word = [0u8; CRC_SIZE];
        BigEndian::write_u32(&mut word, crc);
        stored.extend_from_slice(&word);

        self.blocks.push(BlockHandle {
            first_key: std::mem::take(&mut self.block_first_key),
            offset: self.buf.len() as u64,
            len: stored.len() as u32,
        });
        self.buf.extend_from_slice(&stored);
    }

    pub fn is_empty(&self) -> bool {
        self.key_count == 0
    }

    pub fn key_count(&self) -> u64 {
        self.key_count
    }

    /// Rough final size, used to cut tables during compaction.
    pub fn estimated_size(&self) -> u64 {
        self.buf.len() as u64
            + self.block.len() as u64
            + self.blocks.len() as u64 * 32
            + self.key_hashes.len() as u64 * 2
            + self.on_disk_value_size
    }

    pub fn reached_capacity(&self) -> bool {
        self.estimated_size() >= self.opts.table_size
    }

    /// Serializes the table image.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.finish_block();

        let index = TableIndex {
            blocks: self.blocks,
            smallest: self.smallest,
            biggest: self.biggest,
            max_version: self.max_version,
            stale_data_size: self.stale_data_size,
            key_count: self.key_count,
            uncompressed_size: self.uncompressed_size,
            compression: self.opts.compression.to_u8(),
            created_at: now_secs(),
        };
        let index_bytes = bincode::serialize(&index)?;
        let bloom_bytes = Bloom::from_hashes(&self.key_hashes, self.opts.bloom_false_positive).encode();

        let mut buf = self.buf;
        let index_offset = buf.len() as u64;
        buf.extend_from_slice(&index_bytes);
        let bloom_offset = buf.len() as u64;
        buf.extend_from_slice(&bloom_bytes);

        let mut footer = [0u8; FOOTER_SIZE];
        BigEndian::write_u64(&mut footer[0..8], index_offset);
        BigEndian::write_u32(&mut footer[8..12], index_bytes.len() as u32);
        BigEndian::write_u32(&mut footer[12..16], CRC32.checksum(&index_bytes));
        BigEndian::write_u64(&mut footer[16..24], bloom_offset);
        BigEndian::write_u32(&mut footer[24..28], bloom_bytes.len() as u32);
        BigEndian::write_u32(&mut footer[28..32], CRC32.checksum(&bloom_bytes));
        BigEndian::write_u64(&mut footer[32..40], TABLE_MAGIC);
        buf.extend_from_slice(&footer);
        Ok(buf)
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut read = 0;
    while read < buf.len() {
        let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        read += n;
    }
    Ok(())
}

/// An open table. Shared through `Arc`; once marked for deletion the file is
/// removed when the last handle goes away.
pub struct Table {
    id: u64,
    path: PathBuf,
    file: File,
    index: TableIndex,
    bloom: Bloom,
    size: u64,
    compression: Compression,
    delete_on_drop: AtomicBool,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("keys", &self.index.key_count)
            .field("max_version", &self.index.max_version)
            .finish()
    }
}

impl Table {
    /// Writes `builder` to `path` and opens the result.
    pub fn create(path: impl AsRef<Path>, id: u64, builder: TableBuilder) -> Result<Self> {
        let path = path.as_ref();
        let data = builder.finish()?;
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        Self::open(path, id)
    }

    pub fn open(path: impl AsRef<Path>, id: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        if size < FOOTER_SIZE as u64 {
            return Err(Error::Decode("table footer", format!("{:?} is {} bytes", path, size)));
        }

        let mut footer = [0u8; FOOTER_SIZE];
        read_exact_at(&file, &mut footer, size - FOOTER_SIZE as u64)?;
        if BigEndian::read_u64(&footer[32..40]) != TABLE_MAGIC {
            return Err(Error::BadMagic("table"));
        }
        let index_offset = BigEndian::read_u64(&footer[0..8]);
        let index_len = BigEndian::read_u32(&footer[8..12]) as usize;
        let index_crc = BigEndian::read_u32(&footer[12..16]);
        let bloom_offset = BigEndian::read_u64(&footer[16..24]);
        let bloom_len = BigEndian::read_u32(&footer[24..28]) as usize;
        let bloom_crc = BigEndian::read_u32(&footer[28..32]);
        if bloom_offset + bloom_len as u64 + FOOTER_SIZE as u64 != size
            || index_offset + index_len as u64 != bloom_offset
        {
            return Err(Error::Decode("table footer", format!("bad offsets in {:?}", path)));
        }

        let mut index_bytes = vec![0u8; index_len];
        read_exact_at(&file, &mut index_bytes, index_offset)?;
        if CRC32.checksum(&index_bytes) != index_crc {
            return Err(Error::ChecksumMismatch("table index"));
        }
        let index: TableIndex = bincode::deserialize(&index_bytes)?;

        let mut bloom_bytes = vec![0u8; bloom_len];
        read_exact_at(&file, &mut bloom_bytes, bloom_offset)?;
        if CRC32.checksum(&bloom_bytes) != bloom_crc {
            return Err(Error::ChecksumMismatch("table bloom filter"));
        }
        let bloom = Bloom::decode(&bloom_bytes)?;
        let compression = Compression::from_u8(index.compression)?;

        Ok(Self {
            id,
            path,
            file,
            index,
            bloom,
            size,
            compression,
            delete_on_drop: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn smallest(&self) -> &[u8] {
        &self.index.smallest
    }

    pub fn biggest(&self) -> &[u8] {
        &self.index.biggest
    }

    pub fn max_version(&self) -> u64 {
        self.index.max_version
    }

    pub fn stale_data_size(&self) -> u64 {
        self.index.stale_data_size
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn key_count(&self) -> u64 {
        self.index.key_count
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.index.uncompressed_size
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Seconds since the epoch at which the table was built.
    pub fn created_at(&self) -> u64 {
        self.index.created_at
    }

    pub fn block_count(&self) -> usize {
        self.index.blocks.len()
    }

    /// Bloom filter check on a user key.
    pub fn does_not_have(&self, user_key: &[u8]) -> bool {
        !self.bloom.may_contain(user_key)
    }

    /// True when the user-key range of this table intersects `[smallest, biggest]`.
    pub fn overlaps_user_range(&self, smallest: &[u8], biggest: &[u8]) -> bool {
        parse_key(self.smallest()) <= parse_key(biggest) && parse_key(self.biggest()) >= parse_key(smallest)
    }

    fn block(&self, idx: usize) -> Result<Block> {
        let handle = self
            .index
            .blocks
            .get(idx)
            .ok_or_else(|| Error::InvalidState(format!("table {} has no block {}", self.id, idx)))?;
        let mut stored = vec![0u8; handle.len as usize];
        read_exact_at(&self.file, &mut stored, handle.offset)?;
        if stored.len() < CRC_SIZE {
            return Err(Error::Decode("table block", "shorter than checksum".into()));
        }
        let body_len = stored.len() - CRC_SIZE;
        if CRC32.checksum(&stored[..body_len]) != BigEndian::read_u32(&stored[body_len..]) {
            return Err(Error::ChecksumMismatch("table block"));
        }
        stored.truncate(body_len);
        match self.compression {
            Compression::None => Block::decode(&stored),
            Compression::Lz4 => {
                let raw = lz4_flex::decompress_size_prepended(&stored)
                    .map_err(|e| Error::Decode("table block", e.to_string()))?;
                Block::decode(&raw)
            }
        }
    }

    /// Reads every block and verifies its checksum.
    pub fn verify_checksum(&self) -> Result<()> {
        for i in 0..self.index.blocks.len() {
            self.block(i)?;
        }
        Ok(())
    }

    pub fn iter(self: &Arc<Self>, reversed: bool) -> TableIterator {
        TableIterator {
            table: Arc::clone(self),
            reversed,
            block: None,
            block_idx: 0,
            entry_idx: 0,
            err: None,
        }
    }

    /// Newest version of `key`'s user key at or below `key`'s version.
    pub fn get(self: &Arc<Self>, key: &[u8]) -> Result<Option<ValueStruct>> {
        if self.does_not_have(parse_key(key)) {
            return Ok(None);
        }
        let mut it = self.iter(false);
        it.seek(key);
        it.check()?;
        if it.valid() && same_key(it.key(), key) {
            return Ok(Some(it.value()));
        }
        Ok(None)
    }

    pub fn mark_for_deletion(&self) {
        self.delete_on_drop.store(true, AtomicOrdering::Release);
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.delete_on_drop.load(AtomicOrdering::Acquire) {
            match std::fs::remove_file(&self.path) {
                Ok(()) => tracing::debug!(table_id = self.id, "Removed table file"),
                Err(e) => {
                    tracing::warn!(table_id = self.id, error = %e, "Failed to remove table file")
                }
            }
        }
    }
}

/// Cursor over one table, loading a block at a time.
pub struct TableIterator {
    table: Arc<Table>,
    reversed: bool,
    block: Option<Block>,
    block_idx: usize,
    entry_idx: usize,
    err: Option<String>,
}

impl TableIterator {
    fn load(&mut self, idx: usize) -> bool {
        match self.table.block(idx) {
            Ok(b) if !b.is_empty() => {
                self.block = Some(b);
                self.block_idx = idx;
                true
            }
            Ok(_) => {
                self.block = None;
                false
            }
            Err(e) => {
                tracing::error!(table_id = self.table.id, block = idx, error = %e, "Failed to read table block");
                self.err = Some(e.to_string());
                self.block = None;
                false
            }
        }
    }

    fn block_len(&self) -> usize {
        self.block.as_ref().map_or(0, |b| b.len())
    }

    /// Index of the last block whose first key is `<= key`.
    fn block_for(&self, key: &[u8]) -> Option<usize> {
        let n = self
            .table
            .index
            .blocks
            .partition_point(|b| compare_keys(&b.first_key, key) != Ordering::Greater);
        n.checked_sub(1)
    }
}

impl KvIterator for TableIterator {
    fn rewind(&mut self) {
        self.err = None;
        let n = self.table.block_count();
        if n == 0 {
            self.block = None;
            return;
        }
        if self.reversed {
            if self.load(n - 1) {
                self.entry_idx = self.block_len() - 1;
            }
        } else if self.load(0) {
            self.entry_idx = 0;
        }
    }

    fn seek(&mut self, key: &[u8]) {
        self.err = None;
        let n = self.table.block_count();
        if n == 0 {
            self.block = None;
            return;
        }
        if self.reversed {
            let Some(idx) = self.block_for(key) else {
                self.block = None;
                return;
            };
            if !self.load(idx) {
                return;
            }
            let pos = self.block.as_ref().map_or(0, |b| {
                b.entries
                    .partition_point(|(k, _)| compare_keys(k, key) != Ordering::Greater)
            });
            match pos.checked_sub(1) {
                Some(p) => self.entry_idx = p,
                None => self.block = None,
            }
        } else {
            let idx = self.block_for(key).unwrap_or(0);
            if !self.load(idx) {
                return;
            }
            let pos = self.block.as_ref().map_or(0, |b| {
                b.entries
                    .partition_point(|(k, _)| compare_keys(k, key) == Ordering::Less)
            });
            if pos < self.block_len() {
                self.entry_idx = pos;
            } else if idx + 1 < n {
                if self.load(idx + 1) {
                    self.entry_idx = 0;
                }
            } else {
                self.block = None;
            }
        }
    }

    fn next(&mut self) {
        if self.block.is_none() {
            return;
        }
        if self.reversed {
            if self.entry_idx > 0 {
                self.entry_idx -= 1;
            } else if self.block_idx > 0 {
                if self.load(self.block_idx - 1) {
                    self.entry_idx = self.block_len() - 1;
                }
            } else {
                self.block = None;
            }
        } else {
            self.entry_idx += 1;
            if self.entry_idx >= self.block_len() {
                if self.block_idx + 1 < self.table.block_count() {
                    if self.load(self.block_idx + 1) {
                        self.entry_idx = 0;
                    }
                } else {
                    self.block = None;
                }
            }
        }
    }

    fn valid(&self) -> bool {
        self.err.is_none() && self.block.is_some()
    }

    fn key(&self) -> &[u8] {
        match &self.block {
            Some(b) => &b.entries[self.entry_idx].0,
            None => &[],
        }
    }

    fn value(&self) -> ValueStruct {
        let Some(b) = &self.block else {
            return ValueStruct::default();
        };
        let (key, raw) = &b.entries[self.entry_idx];
        match ValueStruct::decode(raw) {
            Ok(mut vs) => {
                vs.version = parse_ts(key);
                vs
            }
            Err(e) => {
                tracing::error!(table_id = self.table.id, error = %e, "Corrupt value in table");
                ValueStruct::default()
            }
        }
    }

    fn check(&self) -> Result<()> {
        match &self.err {
            Some(msg) => Err(Error::InvalidState(format!(
                "table {} read failed: {}",
                self.table.id, msg
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::key::key_with_ts;
    use crate::value::BIT_DELETE;
    use tempfile::TempDir;

    pub(crate) fn test_table_options() -> TableOptions {
        TableOptions {
            block_size: 256,
            bloom_false_positive: 0.01,
            compression: Compression::None,
            table_size: 1 << 20,
        }
    }

    /// Builds a table from `(user_key, version, value)` triples in any order.
    pub(crate) fn build_table(dir: &Path, id: u64, items: &[(&str, u64, &str)]) -> Arc<Table> {
        let mut entries: Vec<(Vec<u8>, ValueStruct)> = items
            .iter()
            .map(|(k, ts, v)| {
                (
                    key_with_ts(k.as_bytes(), *ts),
                    ValueStruct {
                        value: v.as_bytes().to_vec(),
                        ..Default::default()
                    },
                )
            })
            .collect();
        entries.sort_by(|a, b| compare_keys(&a.0, &b.0));
        let mut builder = TableBuilder::new(test_table_options());
        for (k, vs) in &entries {
            builder.add(k, vs, 0);
        }
        Arc::new(Table::create(table_path(dir, id), id, builder).unwrap())
    }

    fn many(n: usize) -> Vec<(String, u64, String)> {
        (0..n)
            .map(|i| (format!("key{:05}", i), (i % 3 + 1) as u64, format!("value-{}", i)))
            .collect()
    }

    fn as_refs(v: &[(String, u64, String)]) -> Vec<(&str, u64, &str)> {
        v.iter().map(|(k, ts, val)| (k.as_str(), *ts, val.as_str())).collect()
    }

    #[test]
    fn test_build_and_iterate_forward_and_reverse() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let items = many(500);
        let table = build_table(dir.path(), 1, &as_refs(&items));
        assert!(table.block_count() > 1, "small blocks should split the table");
        assert_eq!(table.key_count(), 500);
        assert_eq!(parse_key(table.smallest()), b"key00000");
        assert_eq!(parse_key(table.biggest()), b"key00499");
        assert_eq!(table.max_version(), 3);

        let mut it = table.iter(false);
        it.rewind();
        let mut n = 0;
        while it.valid() {
            n += 1;
            it.next();
        }
        assert_eq!(n, 500);

        let mut it = table.iter(true);
        it.rewind();
        assert_eq!(parse_key(it.key()), b"key00499");
        let mut n = 0;
        let mut prev: Option<Vec<u8>> = None;
        while it.valid() {
            if let Some(p) = &prev {
                assert_eq!(compare_keys(it.key(), p), Ordering::Less);
            }
            prev = Some(it.key().to_vec());
            n += 1;
            it.next();
        }
        assert_eq!(n, 500);
        it.check().unwrap();
    }

    #[test]
    fn test_seek_and_get_versions() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let table = build_table(
            dir.path(),
            2,
            &[("a", 1, "a1"), ("b", 2, "b2"), ("b", 7, "b7"), ("c", 4, "c4")],
        );

        let got = table.get(&key_with_ts(b"b", 10)).unwrap().unwrap();
        assert_eq!(got.value, b"b7");
        assert_eq!(got.version, 7);

        let got = table.get(&key_with_ts(b"b", 5)).unwrap().unwrap();
        assert_eq!(got.version, 2);

        assert!(table.get(&key_with_ts(b"b", 1)).unwrap().is_none());
        assert!(table.get(&key_with_ts(b"zz", 9)).unwrap().is_none());

        let mut it = table.iter(true);
        it.seek(&key_with_ts(b"b", 0));
        assert_eq!(parse_key(it.key()), b"b");
        assert_eq!(parse_ts(it.key()), 2);
    }

    #[test]
    fn test_lz4_tables() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut opts = test_table_options();
        opts.compression = Compression::Lz4;
        let mut builder = TableBuilder::new(opts);
        for i in 0..200u32 {
            let vs = ValueStruct {
                value: vec![b'x'; 64],
                ..Default::default()
            };
            builder.add(&key_with_ts(format!("k{:04}", i).as_bytes(), 1), &vs, 0);
        }
        let table = Arc::new(Table::create(table_path(dir.path(), 3), 3, builder).unwrap());
        assert_eq!(table.compression(), Compression::Lz4);
        table.verify_checksum().unwrap();
        let got = table.get(&key_with_ts(b"k0123", 1)).unwrap().unwrap();
        assert_eq!(got.value, vec![b'x'; 64]);
    }

    #[test]
    fn test_stale_size_and_tombstones() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut builder = TableBuilder::new(test_table_options());
        let tomb = ValueStruct {
            meta: BIT_DELETE,
            ..Default::default()
        };
        builder.add_stale_key(&key_with_ts(b"dead", 3), &tomb, 100);
        builder.add(&key_with_ts(b"live", 3), &ValueStruct::default(), 0);
        let table = Table::create(table_path(dir.path(), 4), 4, builder).unwrap();
        assert!(table.stale_data_size() >= 100);
    }

    #[test]
    fn test_corrupt_block_detected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let table = build_table(dir.path(), 5, &as_refs(&many(50)));
        let path = table.path().to_path_buf();
        drop(table);

        let mut data = std::fs::read(&path).unwrap();
        data[10] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        let table = Arc::new(Table::open(&path, 5).unwrap());
        assert!(matches!(
            table.verify_checksum(),
            Err(Error::ChecksumMismatch(_))
        ));
        let mut it = table.iter(false);
        it.rewind();
        assert!(!it.valid());
        assert!(it.check().is_err());
    }

    #[test]
    fn test_marked_table_removed_on_last_drop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let table = build_table(dir.path(), 6, &[("a", 1, "x")]);
        let path = table.path().to_path_buf();
        let reader = Arc::clone(&table);
        table.mark_for_deletion();
        drop(table);
        assert!(path.exists(), "a reader still holds the table");
        drop(reader);
        assert!(!path.exists());
    }

    #[test]
    fn test_table_names() {
        assert_eq!(parse_table_id("000042.sst"), Some(42));
        assert_eq!(parse_table_id("MANIFEST"), None);
        assert_eq!(
            table_path(Path::new("/db"), 7),
            PathBuf::from("/db/000007.sst")
        );
    }
}
