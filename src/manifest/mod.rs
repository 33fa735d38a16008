//! Manifest log tracking which tables exist and at which level.
//!
//! # File Format
//!
//! ```text
//! +------------------------------------------+
//! | magic "Embr" | external u16 | internal u16 |
//! +------------------------------------------+
//! | len:u32 | crc32c:u32 | bincode change set |
//! +------------------------------------------+
//! | ...                                      |
//! +------------------------------------------+
//! ```
//!
//! Every record is one [`ManifestChangeSet`] and applies atomically. Replay
//! stops at a torn tail and truncates it; a complete record with a bad
//! checksum is corruption.
//!
//! Once deletions dominate the log it is rewritten from the current state
//! into `MANIFEST-REWRITE` and renamed over `MANIFEST`.

pub mod change;

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use crate::config::Compression;
use crate::error::Result;
use crate::logfile::CRC32;
use crate::table::{parse_table_id, table_path};
use crate::Error;

pub use change::{ManifestChange, ManifestChangeSet};

pub const MANIFEST_FILENAME: &str = "MANIFEST";
const MANIFEST_REWRITE_FILENAME: &str = "MANIFEST-REWRITE";

const MAGIC: &[u8; 4] = b"Embr";
const EXTERNAL_VERSION: u16 = 1;
const INTERNAL_VERSION: u16 = 1;
const HEADER_SIZE: usize = 8;

const DELETIONS_REWRITE_THRESHOLD: u64 = 10_000;
const DELETIONS_RATIO: u64 = 10;

/// Where a live table sits and how it was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableManifest {
    pub level: usize,
    pub key_id: u64,
    pub compression: Compression,
}

/// In-memory image of the manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub tables: HashMap<u64, TableManifest>,
    pub creations: u64,
    pub deletions: u64,
}

impl Manifest {
    /// Table ids per level, up to `max_levels`.
    pub fn levels(&self, max_levels: usize) -> Vec<Vec<u64>> {
        let mut levels = vec![Vec::new(); max_levels];
        for (id, tm) in &self.tables {
            if let Some(level) = levels.get_mut(tm.level) {
                level.push(*id);
            }
        }
        for level in levels.iter_mut() {
            level.sort_unstable();
        }
        levels
    }

    /// Applies `set` in order. Creating an existing table or deleting an
    /// unknown one means the log is inconsistent.
    pub fn apply(&mut self, set: &ManifestChangeSet) -> Result<()> {
        for change in &set.changes {
            match *change {
                ManifestChange::Create {
                    id,
                    level,
                    key_id,
                    compression,
                } => {
                    if self.tables.contains_key(&id) {
                        return Err(Error::ManifestCorrupt(format!(
                            "table {} created twice",
                            id
                        )));
                    }
                    self.tables.insert(
                        id,
                        TableManifest {
                            level: level as usize,
                            key_id,
                            compression: Compression::from_u8(compression)?,
                        },
                    );
                    self.creations += 1;
                }
                ManifestChange::Delete { id } => {
                    if self.tables.remove(&id).is_none() {
                        return Err(Error::ManifestCorrupt(format!(
                            "deleting unknown table {}",
                            id
                        )));
                    }
                    self.deletions += 1;
                }
            }
        }
        Ok(())
    }

    /// Change set that recreates the current state from scratch.
    fn as_changes(&self) -> ManifestChangeSet {
        let mut ids: Vec<_> = self.tables.keys().copied().collect();
        ids.sort_unstable();
        ManifestChangeSet::new(
            ids.into_iter()
                .map(|id| {
                    let tm = self.tables[&id];
                    ManifestChange::create(id, tm.level, tm.key_id, tm.compression)
                })
                .collect(),
        )
    }

    fn needs_rewrite(&self, threshold: u64) -> bool {
        self.deletions > threshold
            && self.deletions > DELETIONS_RATIO * self.creations.saturating_sub(self.deletions)
    }
}

struct Inner {
    file: File,
    manifest: Manifest,
}

/// The open manifest file. Appends are serialized and synced before they
/// return.
pub struct ManifestFile {
    dir: PathBuf,
    inner: Mutex<Inner>,
    rewrite_threshold: u64,
}

impl ManifestFile {
    /// Opens `dir/MANIFEST`, creating it when absent, and replays it.
    pub fn open_or_create(dir: impl AsRef<Path>) -> Result<(Self, Manifest)> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(MANIFEST_FILENAME);

        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let (file, manifest) = Self::rewrite(&dir, &Manifest::default())?;
                tracing::info!(path = ?path, "Created new manifest");
                return Ok((
                    Self {
                        dir,
                        inner: Mutex::new(Inner {
                            file,
                            manifest: manifest.clone(),
                        }),
                        rewrite_threshold: DELETIONS_REWRITE_THRESHOLD,
                    },
                    manifest,
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let (manifest, valid_end) = replay(&file)?;
        let len = file.metadata()?.len();
        if valid_end < len {
            tracing::warn!(
                valid_end,
                size = len,
                "Truncating torn manifest tail"
            );
            file.set_len(valid_end)?;
        }
        let mut file = file;
        file.seek(SeekFrom::Start(valid_end))?;

        tracing::info!(
            tables = manifest.tables.len(),
            creations = manifest.creations,
            deletions = manifest.deletions,
            "Replayed manifest"
        );
        Ok((
            Self {
                dir,
                inner: Mutex::new(Inner {
                    file,
                    manifest: manifest.clone(),
                }),
                rewrite_threshold: DELETIONS_REWRITE_THRESHOLD,
            },
            manifest,
        ))
    }

    /// Writes `manifest` as a fresh file and swaps it in. Returns the new
    /// file positioned for appends, plus the state it holds with counters
    /// reset to the live table count.
    fn rewrite(dir: &Path, manifest: &Manifest) -> Result<(File, Manifest)> {
        let rewrite_path = dir.join(MANIFEST_REWRITE_FILENAME);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&rewrite_path)?;

        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(MAGIC);
        buf.write_u16::<BigEndian>(EXTERNAL_VERSION)?;
        buf.write_u16::<BigEndian>(INTERNAL_VERSION)?;
        let set = manifest.as_changes();
        if !set.changes.is_empty() {
            encode_record(&mut buf, &set)?;
        }
        file.write_all(&buf)?;
        file.sync_all()?;
        drop(file);

        let path = dir.join(MANIFEST_FILENAME);
        std::fs::rename(&rewrite_path, &path)?;
        sync_dir(dir)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        file.seek(SeekFrom::End(0))?;

        let fresh = Manifest {
            tables: manifest.tables.clone(),
            creations: manifest.tables.len() as u64,
            deletions: 0,
        };
        Ok((file, fresh))
    }

    /// Appends `changes` as one record and syncs it. The in-memory state is
    /// only updated once the record is durable.
    pub fn add_changes(&self, changes: Vec<ManifestChange>) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let set = ManifestChangeSet::new(changes);
        let mut inner = self.inner.lock();

        let mut next = inner.manifest.clone();
        next.apply(&set)?;

        if next.needs_rewrite(self.rewrite_threshold) {
            let (file, fresh) = Self::rewrite(&self.dir, &next)?;
            tracing::info!(
                tables = fresh.tables.len(),
                deletions = next.deletions,
                "Rewrote manifest"
            );
            inner.file = file;
            inner.manifest = fresh;
            return Ok(());
        }

        let mut buf = Vec::new();
        encode_record(&mut buf, &set)?;
        inner.file.write_all(&buf)?;
        inner.file.sync_data()?;
        inner.manifest = next;
        Ok(())
    }

    /// Snapshot of the current state.
    pub fn manifest(&self) -> Manifest {
        self.inner.lock().manifest.clone()
    }

    pub fn close(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        Ok(())
    }
}

fn encode_record(buf: &mut Vec<u8>, set: &ManifestChangeSet) -> Result<()> {
    let body = set.encode()?;
    buf.write_u32::<BigEndian>(body.len() as u32)?;
    buf.write_u32::<BigEndian>(CRC32.checksum(&body))?;
    buf.extend_from_slice(&body);
    Ok(())
}

/// Reads exactly `buf.len()` bytes; `false` means the file ended first.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    match r.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Replays every complete record and returns the state plus the offset
/// just past the last complete record.
fn replay(file: &File) -> Result<(Manifest, u64)> {
    let mut reader = BufReader::new(file.try_clone()?);
    reader.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; HEADER_SIZE];
    if !read_full(&mut reader, &mut header)? {
        return Err(Error::ManifestCorrupt("manifest header is truncated".into()));
    }
    if &header[0..4] != MAGIC {
        return Err(Error::BadMagic("manifest"));
    }
    let mut cursor = &header[4..];
    let external = cursor.read_u16::<BigEndian>()?;
    let internal = cursor.read_u16::<BigEndian>()?;
    if external != EXTERNAL_VERSION {
        return Err(Error::UnsupportedVersion("manifest", u32::from(external)));
    }
    if internal != INTERNAL_VERSION {
        return Err(Error::UnsupportedVersion(
            "manifest internal",
            u32::from(internal),
        ));
    }

    let file_len = file.metadata()?.len();
    let mut manifest = Manifest::default();
    let mut offset = HEADER_SIZE as u64;
    loop {
        let mut head = [0u8; 8];
        if !read_full(&mut reader, &mut head)? {
            break;
        }
        let mut cursor = &head[..];
        let len = cursor.read_u32::<BigEndian>()? as usize;
        let crc = cursor.read_u32::<BigEndian>()?;

        // A length running past the end can only be a torn tail.
        if len as u64 > file_len.saturating_sub(offset + 8) {
            tracing::warn!(offset, len, file_len, "Manifest record overruns the file");
            break;
        }
        let mut body = vec![0u8; len];
        if !read_full(&mut reader, &mut body)? {
            break;
        }
        if CRC32.checksum(&body) != crc {
            return Err(Error::ManifestCorrupt(format!(
                "checksum mismatch in record at offset {}",
                offset
            )));
        }
        let set = ManifestChangeSet::decode(&body)
            .map_err(|e| Error::ManifestCorrupt(format!("record at offset {}: {}", offset, e)))?;
        manifest.apply(&set)?;
        offset += 8 + len as u64;
    }
    Ok((manifest, offset))
}

#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Reconciles the directory with the manifest: every table the manifest
/// names must exist, and any other table file is removed.
pub fn revert_to_manifest(dir: &Path, manifest: &Manifest) -> Result<()> {
    let mut on_disk = HashSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse_table_id) {
            on_disk.insert(id);
        }
    }

    for id in manifest.tables.keys() {
        if !on_disk.contains(id) {
            return Err(Error::ManifestMissingTable(*id));
        }
    }

    for id in on_disk {
        if !manifest.tables.contains_key(&id) {
            tracing::info!(table_id = id, "Removing table not referenced by manifest");
            std::fs::remove_file(table_path(dir, id))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create(id: u64, level: usize) -> ManifestChange {
        ManifestChange::create(id, level, 0, Compression::None)
    }

    #[test]
    fn test_create_replay() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let (mf, manifest) = ManifestFile::open_or_create(dir.path())?;
            assert!(manifest.tables.is_empty());
            mf.add_changes(vec![create(1, 0), create(2, 0)])?;
            mf.add_changes(vec![create(3, 1), ManifestChange::delete(1), ManifestChange::delete(2)])?;
            mf.close()?;
        }

        let (_mf, manifest) = ManifestFile::open_or_create(dir.path())?;
        assert_eq!(manifest.tables.len(), 1);
        assert_eq!(manifest.tables[&3].level, 1);
        assert_eq!(manifest.creations, 3);
        assert_eq!(manifest.deletions, 2);
        assert_eq!(manifest.levels(3), vec![vec![], vec![3], vec![]]);
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_truncated() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let (mf, _) = ManifestFile::open_or_create(dir.path())?;
            mf.add_changes(vec![create(1, 0)])?;
            mf.add_changes(vec![create(2, 0)])?;
        }
        let path = dir.path().join(MANIFEST_FILENAME);
        let full = std::fs::metadata(&path)?.len();
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(full - 3)?;
        drop(file);

        let (mf, manifest) = ManifestFile::open_or_create(dir.path())?;
        assert_eq!(manifest.tables.len(), 1);
        assert!(manifest.tables.contains_key(&1));
        assert!(std::fs::metadata(&path)?.len() < full - 3);

        // Appends after the truncation replay cleanly.
        mf.add_changes(vec![create(5, 0)])?;
        drop(mf);
        let (_mf, manifest) = ManifestFile::open_or_create(dir.path())?;
        assert_eq!(manifest.tables.len(), 2);
        Ok(())
    }

    #[test]
    fn test_garbage_record_length_is_a_torn_tail() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let (mf, _) = ManifestFile::open_or_create(dir.path())?;
            mf.add_changes(vec![create(1, 0)])?;
        }
        let path = dir.path().join(MANIFEST_FILENAME);
        let full = std::fs::metadata(&path)?.len();
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[0xff, 0xff, 0xff, 0xf0, 0, 0, 0, 0, 1, 2, 3])?;
        drop(file);

        let (_mf, manifest) = ManifestFile::open_or_create(dir.path())?;
        assert_eq!(manifest.tables.len(), 1);
        assert_eq!(std::fs::metadata(&path)?.len(), full);
        Ok(())
    }

    #[test]
    fn test_checksum_mismatch_is_fatal() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let (mf, _) = ManifestFile::open_or_create(dir.path())?;
            mf.add_changes(vec![create(1, 0)])?;
        }
        let path = dir.path().join(MANIFEST_FILENAME);
        let mut data = std::fs::read(&path)?;
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&path, &data)?;

        let err = ManifestFile::open_or_create(dir.path()).err().unwrap();
        assert!(matches!(err, Error::ManifestCorrupt(_)));
        Ok(())
    }

    #[test]
    fn test_bad_magic_and_version() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(MANIFEST_FILENAME);
        std::fs::write(&path, b"Nope\x00\x01\x00\x01")?;
        assert!(matches!(
            ManifestFile::open_or_create(dir.path()).err().unwrap(),
            Error::BadMagic(_)
        ));

        std::fs::write(&path, b"Embr\x00\x02\x00\x01")?;
        assert!(matches!(
            ManifestFile::open_or_create(dir.path()).err().unwrap(),
            Error::UnsupportedVersion(_, 2)
        ));
        Ok(())
    }

    #[test]
    fn test_inconsistent_changes_rejected() -> Result<()> {
        let dir = TempDir::new()?;
        let (mf, _) = ManifestFile::open_or_create(dir.path())?;
        mf.add_changes(vec![create(1, 0)])?;
        assert!(mf.add_changes(vec![create(1, 2)]).is_err());
        assert!(mf.add_changes(vec![ManifestChange::delete(9)]).is_err());
        // A rejected change set leaves the state untouched.
        assert_eq!(mf.manifest().tables.len(), 1);
        Ok(())
    }

    #[test]
    fn test_rewrite_after_many_deletions() -> Result<()> {
        let dir = TempDir::new()?;
        let (mut mf, _) = ManifestFile::open_or_create(dir.path())?;
        mf.rewrite_threshold = 100;
        mf.add_changes(vec![create(0, 1)])?;
        for id in 1..=101 {
            mf.add_changes(vec![create(id, 0), ManifestChange::delete(id)])?;
        }
        let state = mf.manifest();
        assert_eq!(state.tables.len(), 1);
        assert_eq!(state.deletions, 0);
        drop(mf);

        let size = std::fs::metadata(dir.path().join(MANIFEST_FILENAME))?.len();
        assert!(size < 1024, "rewritten manifest holds only live tables");
        let (_mf, manifest) = ManifestFile::open_or_create(dir.path())?;
        assert_eq!(manifest.tables.len(), 1);
        assert_eq!(manifest.tables[&0].level, 1);
        Ok(())
    }

    #[test]
    fn test_revert_to_manifest() -> Result<()> {
        let dir = TempDir::new()?;
        std::fs::write(table_path(dir.path(), 1), b"live")?;
        std::fs::write(table_path(dir.path(), 2), b"orphan")?;

        let mut manifest = Manifest::default();
        manifest.apply(&ManifestChangeSet::new(vec![create(1, 0)]))?;
        revert_to_manifest(dir.path(), &manifest)?;
        assert!(table_path(dir.path(), 1).exists());
        assert!(!table_path(dir.path(), 2).exists());

        manifest.apply(&ManifestChangeSet::new(vec![create(7, 0)]))?;
        assert!(matches!(
            revert_to_manifest(dir.path(), &manifest),
            Err(Error::ManifestMissingTable(7))
        ));
        Ok(())
    }
}
