//! Append-only entry files.
//!
//! Memtable write-ahead logs and value log files share one on-disk format so
//! that the same replay code recovers both.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (32 bytes)|
//! +------------------+
//! | Entry 1          |
//! +------------------+
//! | Entry 2          |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! ## Entry Format
//!
//! ```text
//! +------+---------+----------+----------+-----------+-----+-------+--------+
//! | meta |user_meta| key_len  | val_len  | expires_at| key | value | crc32  |
//! +------+---------+----------+----------+-----------+-----+-------+--------+
//! |  1   |    1    |  varint  |  varint  |  varint   | var |  var  | 4 (BE) |
//! +------+---------+----------+----------+-----------+-----+-------+--------+
//! ```
//!
//! The CRC covers everything before it as stored on disk. In encrypted files
//! the key and value bytes are XOR-ed with a keystream seeded by the data
//! key, the file's base IV and the entry offset.
//!
//! Entries carrying `BIT_TXN` form an atomic group closed by a `BIT_FIN_TXN`
//! marker with the same version. Replay only hands out complete groups and
//! reports the end of the last complete one so callers can truncate a torn
//! tail.

pub mod header;

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};

use crate::config::EncryptionKey;
use crate::crypto::{self, IV_SIZE};
use crate::encoding::{put_uvarint, read_uvarint, MAX_VARINT_LEN};
use crate::error::Result;
use crate::key::parse_ts;
use crate::value::{Entry, ValuePointer, BIT_FIN_TXN, BIT_TXN};
use crate::Error;

use header::{Header, HEADER_SIZE};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const CRC_SIZE: usize = 4;

/// meta, user_meta and three varints.
pub const MAX_ENTRY_HEADER_SIZE: usize = 2 + 3 * MAX_VARINT_LEN;

/// Lengths beyond these can only come from a torn or garbage tail.
const MAX_REPLAY_KEY_LEN: u64 = 1 << 20;
const MAX_REPLAY_VALUE_LEN: u64 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryHeader {
    meta: u8,
    user_meta: u8,
    key_len: u32,
    value_len: u32,
    expires_at: u64,
}

impl EntryHeader {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.meta);
        buf.push(self.user_meta);
        put_uvarint(buf, u64::from(self.key_len));
        put_uvarint(buf, u64::from(self.value_len));
        put_uvarint(buf, self.expires_at);
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 5 {
            return Err(Error::Decode("entry header", format!("{} bytes", buf.len())));
        }
        let mut pos = 2;
        let (key_len, n) = read_uvarint(&buf[pos..])?;
        pos += n;
        let (value_len, n) = read_uvarint(&buf[pos..])?;
        pos += n;
        let (expires_at, n) = read_uvarint(&buf[pos..])?;
        pos += n;
        Ok((
            Self {
                meta: buf[0],
                user_meta: buf[1],
                key_len: key_len as u32,
                value_len: value_len as u32,
                expires_at,
            },
            pos,
        ))
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        let n = file.seek_write(&buf[written..], offset + written as u64)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short write"));
        }
        written += n;
    }
    Ok(())
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut read = 0;
    while read < buf.len() {
        let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
        }
        read += n;
    }
    Ok(())
}

/// Reads exactly `buf.len()` bytes; `false` means the stream ended first.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    match r.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// A WAL or value log file.
///
/// Appends come from a single writer at a time; reads are positional and
/// may run concurrently with appends.
pub struct LogFile {
    fid: u32,
    path: PathBuf,
    file: File,
    header: Header,
    data_key: Option<Vec<u8>>,
    write_at: AtomicU32,
    entries: AtomicU32,
    delete_on_drop: AtomicBool,
}

impl std::fmt::Debug for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile")
            .field("fid", &self.fid)
            .field("path", &self.path)
            .field("size", &self.size())
            .finish()
    }
}

impl LogFile {
    /// Creates a new, empty log file. Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, fid: u32, key: Option<&EncryptionKey>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let header = match key {
            Some(k) => Header::new(k.id, crypto::random_iv()),
            None => Header::new(0, [0u8; IV_SIZE]),
        };
        write_all_at(&file, &header.encode(), 0)?;
        file.sync_data()?;

        Ok(Self {
            fid,
            path,
            file,
            header,
            data_key: key.map(|k| k.key.clone()),
            write_at: AtomicU32::new(HEADER_SIZE as u32),
            entries: AtomicU32::new(0),
            delete_on_drop: AtomicBool::new(false),
        })
    }

    /// Opens an existing log file. The write offset is placed at the end of
    /// the file; callers replaying it should [`truncate`](Self::truncate) to
    /// the offset returned by [`iterate`](Self::iterate).
    pub fn open(path: impl AsRef<Path>, fid: u32, key: Option<&EncryptionKey>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();

        if len < HEADER_SIZE as u64 {
            // Crashed between create and the header write.
            let header = match key {
                Some(k) => Header::new(k.id, crypto::random_iv()),
                None => Header::new(0, [0u8; IV_SIZE]),
            };
            file.set_len(0)?;
            write_all_at(&file, &header.encode(), 0)?;
            file.sync_data()?;
            return Ok(Self {
                fid,
                path,
                file,
                header,
                data_key: key.map(|k| k.key.clone()),
                write_at: AtomicU32::new(HEADER_SIZE as u32),
                entries: AtomicU32::new(0),
                delete_on_drop: AtomicBool::new(false),
            });
        }
        if len > u64::from(u32::MAX) {
            return Err(Error::InvalidState(format!(
                "log file {:?} is larger than 4GB",
                path
            )));
        }

        let mut buf = [0u8; HEADER_SIZE];
        read_exact_at(&file, &mut buf, 0)?;
        let header = Header::decode(&buf)?;

        let data_key = match (header.is_encrypted(), key) {
            (false, _) => None,
            (true, Some(k)) if k.id == header.key_id => Some(k.key.clone()),
            (true, _) => {
                return Err(Error::InvalidOptions(format!(
                    "log file {:?} is encrypted with key {} which was not supplied",
                    path, header.key_id
                )))
            }
        };

        Ok(Self {
            fid,
            path,
            file,
            header,
            data_key,
            write_at: AtomicU32::new(len as u32),
            entries: AtomicU32::new(0),
            delete_on_drop: AtomicBool::new(false),
        })
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far, header included.
    pub fn size(&self) -> u32 {
        self.write_at.load(Ordering::Acquire)
    }

    /// Entries in the file: those appended through this handle plus any
    /// restored with [`set_entry_count`](Self::set_entry_count).
    pub fn entry_count(&self) -> u32 {
        self.entries.load(Ordering::Acquire)
    }

    pub fn set_entry_count(&self, count: u32) {
        self.entries.store(count, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.size() as usize <= HEADER_SIZE
    }

    /// Encodes `e` into `buf` as it would be stored at `offset`, returning
    /// the encoded length.
    pub fn encode_entry(&self, buf: &mut Vec<u8>, e: &Entry, offset: u32) -> usize {
        let start = buf.len();
        EntryHeader {
            meta: e.meta,
            user_meta: e.user_meta,
            key_len: e.key.len() as u32,
            value_len: e.value.len() as u32,
            expires_at: e.expires_at,
        }
        .encode(buf);

        let kv_start = buf.len();
        buf.extend_from_slice(&e.key);
        buf.extend_from_slice(&e.value);
        if let Some(key) = &self.data_key {
            crypto::xor_keystream(key, &self.header.base_iv, offset, &mut buf[kv_start..]);
        }

        let crc = CRC32.checksum(&buf[start..]);
        let mut crc_buf = [0u8; CRC_SIZE];
        BigEndian::write_u32(&mut crc_buf, crc);
        buf.extend_from_slice(&crc_buf);
        buf.len() - start
    }

    /// Appends pre-encoded bytes holding `count` entries and returns the
    /// offset they were written at.
    pub fn append(&self, buf: &[u8], count: u32) -> Result<u32> {
        let offset = self.write_at.load(Ordering::Acquire);
        let end = u64::from(offset) + buf.len() as u64;
        if end > u64::from(u32::MAX) {
            return Err(Error::InvalidRequest(format!(
                "log file {} cannot grow past 4GB",
                self.fid
            )));
        }
        write_all_at(&self.file, buf, u64::from(offset))?;
        self.write_at.store(end as u32, Ordering::Release);
        self.entries.fetch_add(count, Ordering::AcqRel);
        Ok(offset)
    }

    /// Encodes and appends one entry.
    pub fn append_entry(&self, e: &Entry) -> Result<ValuePointer> {
        let offset = self.size();
        let mut buf = Vec::with_capacity(MAX_ENTRY_HEADER_SIZE + e.key.len() + e.value.len() + CRC_SIZE);
        let len = self.encode_entry(&mut buf, e, offset);
        self.append(&buf, 1)?;
        Ok(ValuePointer {
            fid: self.fid,
            len: len as u32,
            offset,
        })
    }

    /// Reads and verifies the entry `vp` points at.
    pub fn read_entry(&self, vp: &ValuePointer) -> Result<Entry> {
        let end = u64::from(vp.offset) + u64::from(vp.len);
        if (vp.offset as usize) < HEADER_SIZE
            || end > u64::from(self.size())
            || (vp.len as usize) < CRC_SIZE + 5
        {
            return Err(Error::InvalidPointer(format!(
                "{:?} outside written region of file {} ({} bytes)",
                vp,
                self.fid,
                self.size()
            )));
        }
        let mut buf = vec![0u8; vp.len as usize];
        read_exact_at(&self.file, &mut buf, u64::from(vp.offset))?;
        self.decode_record(buf, vp.offset)
    }

    fn decode_record(&self, mut buf: Vec<u8>, offset: u32) -> Result<Entry> {
        let body_len = buf.len() - CRC_SIZE;
        let stored = BigEndian::read_u32(&buf[body_len..]);
        if CRC32.checksum(&buf[..body_len]) != stored {
            return Err(Error::ChecksumMismatch("log entry"));
        }
        let (h, header_len) = EntryHeader::decode(&buf[..body_len])?;
        let kv_len = h.key_len as usize + h.value_len as usize;
        if header_len + kv_len != body_len {
            return Err(Error::Decode(
                "log entry",
                format!("lengths {} + {} do not match record", h.key_len, h.value_len),
            ));
        }
        let kv = &mut buf[header_len..body_len];
        if let Some(key) = &self.data_key {
            crypto::xor_keystream(key, &self.header.base_iv, offset, kv);
        }
        let key = kv[..h.key_len as usize].to_vec();
        let value = kv[h.key_len as usize..].to_vec();
        Ok(Entry {
            version: parse_ts(&key),
            key,
            value,
            expires_at: h.expires_at,
            user_meta: h.user_meta,
            meta: h.meta,
        })
    }

    /// Replays entries from `offset`, handing complete ones to `f`.
    ///
    /// Returns the offset just past the last entry that was handed out, or
    /// the start offset if none were. Anything after it is a torn write or an
    /// unfinished atomic group.
    pub fn iterate<F>(&self, offset: u32, mut f: F) -> Result<u32>
    where
        F: FnMut(Entry, ValuePointer) -> Result<()>,
    {
        let offset = offset.max(HEADER_SIZE as u32);
        let end = self.size();
        if offset >= end {
            return Ok(offset);
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(u64::from(offset)))?;
        let mut reader = RecordReader {
            inner: BufReader::new(file.take(u64::from(end - offset))),
            log: self,
            offset,
        };

        let mut valid_end = offset;
        let mut last_commit = 0u64;
        let mut pending: Vec<(Entry, ValuePointer)> = Vec::new();

        while let Some((entry, vp)) = reader.next()? {
            let next_offset = vp.offset + vp.len;
            if entry.meta & BIT_TXN != 0 {
                let ts = parse_ts(&entry.key);
                if last_commit == 0 {
                    last_commit = ts;
                }
                if last_commit != ts {
                    break;
                }
                pending.push((entry, vp));
            } else if entry.meta & BIT_FIN_TXN != 0 {
                let ts = if entry.value.len() == 8 {
                    BigEndian::read_u64(&entry.value)
                } else {
                    0
                };
                if last_commit != ts {
                    break;
                }
                last_commit = 0;
                valid_end = next_offset;
                for (e, p) in pending.drain(..) {
                    f(e, p)?;
                }
            } else {
                if last_commit != 0 {
                    // A plain entry inside an open group.
                    break;
                }
                valid_end = next_offset;
                f(entry, vp)?;
            }
        }

        if valid_end < end {
            tracing::debug!(
                fid = self.fid,
                valid_end,
                size = end,
                dropped = pending.len(),
                "Log replay stopped before end of file"
            );
        }
        Ok(valid_end)
    }

    /// Cuts the file at `end`.
    pub fn truncate(&self, end: u32) -> Result<()> {
        let end = end.max(HEADER_SIZE as u32);
        self.file.set_len(u64::from(end))?;
        self.write_at.store(end, Ordering::Release);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Remove the file from disk once the last handle is dropped.
    pub fn mark_for_deletion(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = ?self.path, error = %e, "Failed to remove log file");
            }
        }
    }
}

/// Sequential decoder used by replay. Any torn or corrupt record ends the
/// stream instead of failing it.
struct RecordReader<'a, R: Read> {
    inner: R,
    log: &'a LogFile,
    offset: u32,
}

impl<R: Read> RecordReader<'_, R> {
    fn read_varint(&mut self, hbuf: &mut Vec<u8>) -> Result<Option<u64>> {
        let start = hbuf.len();
        loop {
            let mut b = [0u8; 1];
            if !read_full(&mut self.inner, &mut b)? {
                return Ok(None);
            }
            hbuf.push(b[0]);
            if b[0] < 0x80 {
                return Ok(read_uvarint(&hbuf[start..]).ok().map(|(v, _)| v));
            }
            if hbuf.len() - start >= MAX_VARINT_LEN {
                return Ok(None);
            }
        }
    }

    fn next(&mut self) -> Result<Option<(Entry, ValuePointer)>> {
        let mut record = Vec::with_capacity(MAX_ENTRY_HEADER_SIZE);
        let mut two = [0u8; 2];
        if !read_full(&mut self.inner, &mut two)? {
            return Ok(None);
        }
        record.extend_from_slice(&two);

        let Some(key_len) = self.read_varint(&mut record)? else {
            return Ok(None);
        };
        let Some(value_len) = self.read_varint(&mut record)? else {
            return Ok(None);
        };
        if self.read_varint(&mut record)?.is_none() {
            return Ok(None);
        }
        if key_len == 0 || key_len > MAX_REPLAY_KEY_LEN || value_len > MAX_REPLAY_VALUE_LEN {
            return Ok(None);
        }

        let rest = (key_len + value_len) as usize + CRC_SIZE;
        let header_len = record.len();
        record.resize(header_len + rest, 0);
        if !read_full(&mut self.inner, &mut record[header_len..])? {
            return Ok(None);
        }

        let len = record.len() as u32;
        let offset = self.offset;
        let entry = match self.log.decode_record(record, offset) {
            Ok(e) => e,
            Err(Error::ChecksumMismatch(_)) | Err(Error::Decode(..)) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.offset += len;
        Ok(Some((
            entry,
            ValuePointer {
                fid: self.log.fid,
                len,
                offset,
            },
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::key_with_ts;
    use crate::value::{BIT_DELETE, TXN_KEY};
    use tempfile::TempDir;

    fn txn_entries(ts: u64, n: usize) -> Vec<Entry> {
        let mut out: Vec<Entry> = (0..n)
            .map(|i| {
                let mut e = Entry::new(key_with_ts(format!("k{}", i).as_bytes(), ts), vec![i as u8; 10]);
                e.meta |= BIT_TXN;
                e
            })
            .collect();
        let mut fin = Entry::new(key_with_ts(TXN_KEY, ts), ts.to_be_bytes().to_vec());
        fin.meta = BIT_FIN_TXN;
        out.push(fin);
        out
    }

    fn collect(lf: &LogFile) -> (Vec<Entry>, u32) {
        let mut seen = Vec::new();
        let end = lf
            .iterate(0, |e, _| {
                seen.push(e);
                Ok(())
            })
            .unwrap();
        (seen, end)
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lf = LogFile::create(dir.path().join("000001.vlog"), 1, None).unwrap();

        let e = Entry::new(key_with_ts(b"hello", 3), b"world".to_vec()).with_meta(5);
        let vp = lf.append_entry(&e).unwrap();
        assert_eq!(vp.offset as usize, HEADER_SIZE);
        assert_eq!(lf.size(), vp.offset + vp.len);

        let back = lf.read_entry(&vp).unwrap();
        assert_eq!(back.key, e.key);
        assert_eq!(back.value, b"world");
        assert_eq!(back.user_meta, 5);
        assert_eq!(back.version, 3);
    }

    #[test]
    fn test_pointer_out_of_range() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lf = LogFile::create(dir.path().join("000001.vlog"), 1, None).unwrap();
        let vp = lf.append_entry(&Entry::new(key_with_ts(b"a", 1), b"b".to_vec())).unwrap();
        let bad = ValuePointer {
            offset: vp.offset + 1,
            ..vp
        };
        assert!(matches!(lf.read_entry(&bad), Err(Error::InvalidPointer(_))));
    }

    #[test]
    fn test_corruption_detected_on_read() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("000001.vlog");
        let lf = LogFile::create(&path, 1, None).unwrap();
        let vp = lf.append_entry(&Entry::new(key_with_ts(b"a", 1), vec![1u8; 64])).unwrap();

        write_all_at(&lf.file, &[0xAA], u64::from(vp.offset + vp.len - 10)).unwrap();
        assert!(matches!(
            lf.read_entry(&vp),
            Err(Error::ChecksumMismatch(_))
        ));
    }

    #[test]
    fn test_replay_only_complete_groups() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("00001.mem");
        let lf = LogFile::create(&path, 1, None).unwrap();

        for e in txn_entries(10, 3) {
            lf.append_entry(&e).unwrap();
        }
        let committed_end = lf.size();

        // Second group is missing its end marker.
        let mut second = txn_entries(11, 2);
        second.pop();
        for e in &second {
            lf.append_entry(e).unwrap();
        }

        let (seen, end) = collect(&lf);
        assert_eq!(seen.len(), 3, "markers are not handed out");
        assert!(seen.iter().all(|e| e.version == 10));
        assert_eq!(end, committed_end);
    }

    #[test]
    fn test_replay_stops_at_torn_tail() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("00001.mem");
        let lf = LogFile::create(&path, 1, None).unwrap();
        lf.append_entry(&Entry::new(key_with_ts(b"a", 1), b"x".to_vec())).unwrap();
        let good_end = lf.size();
        let vp = lf.append_entry(&Entry::new(key_with_ts(b"b", 2), vec![7u8; 100])).unwrap();
        drop(lf);

        // Chop the second record in half.
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(u64::from(vp.offset + vp.len / 2)).unwrap();
        drop(f);

        let lf = LogFile::open(&path, 1, None).unwrap();
        let (seen, end) = collect(&lf);
        assert_eq!(seen.len(), 1);
        assert_eq!(end, good_end);

        lf.truncate(end).unwrap();
        assert_eq!(lf.size(), good_end);
        let vp = lf.append_entry(&Entry::new(key_with_ts(b"c", 3), b"z".to_vec())).unwrap();
        assert_eq!(vp.offset, good_end);
    }

    #[test]
    fn test_plain_entries_replay_individually() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lf = LogFile::create(dir.path().join("00002.mem"), 2, None).unwrap();
        let mut del = Entry::new(key_with_ts(b"gone", 4), Vec::new());
        del.meta = BIT_DELETE;
        lf.append_entry(&Entry::new(key_with_ts(b"x", 4), b"1".to_vec())).unwrap();
        lf.append_entry(&del).unwrap();

        let (seen, end) = collect(&lf);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].meta, BIT_DELETE);
        assert_eq!(end, lf.size());
    }

    #[test]
    fn test_encrypted_roundtrip_and_key_check() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("000003.vlog");
        let key = EncryptionKey {
            id: 4,
            key: b"0123456789abcdef".to_vec(),
        };
        let lf = LogFile::create(&path, 3, Some(&key)).unwrap();
        let vp = lf
            .append_entry(&Entry::new(key_with_ts(b"secret", 1), b"plaintext".to_vec()))
            .unwrap();
        drop(lf);

        let raw = std::fs::read(&path).unwrap();
        assert!(!raw.windows(9).any(|w| w == b"plaintext"));

        let lf = LogFile::open(&path, 3, Some(&key)).unwrap();
        assert_eq!(lf.read_entry(&vp).unwrap().value, b"plaintext");
        drop(lf);

        assert!(matches!(
            LogFile::open(&path, 3, None),
            Err(Error::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_delete_on_drop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("000009.vlog");
        let lf = LogFile::create(&path, 9, None).unwrap();
        lf.mark_for_deletion();
        assert!(path.exists());
        drop(lf);
        assert!(!path.exists());
    }
}
