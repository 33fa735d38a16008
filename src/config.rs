use std::path::PathBuf;

use crate::error::Result;
use crate::Error;

/// Block compression applied by the table builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Lz4,
}

impl Compression {
    pub fn to_u8(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Lz4 => 1,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            other => Err(Error::Decode("compression", format!("unknown codec {}", other))),
        }
    }
}

/// Data key used to encrypt log files. Supplying and rotating keys is the
/// caller's business; the engine only records `id` in file headers.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    pub id: u64,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey").field("id", &self.id).finish()
    }
}

/// Largest inline value threshold accepted by [`Options::validate`].
pub const MAX_VALUE_THRESHOLD: usize = 1 << 20;

/// Configuration for the engine
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding every file of the database
    pub dir: PathBuf,

    /// Memtable size limit, applied to both skiplist bytes and WAL offset (default: 64MB)
    pub memtable_size: u64,

    /// Total memtables, active plus immutable, before writes stall (default: 5)
    pub num_memtables: usize,

    /// Target table size at and above the base level (default: 2MB)
    pub base_table_size: u64,

    /// Size floor that defines the base level (default: 10MB)
    pub base_level_size: u64,

    /// Ratio between the targets of adjacent levels (default: 10)
    pub level_size_multiplier: u64,

    /// Table size growth per level below the base level (default: 2)
    pub table_size_multiplier: u64,

    /// Number of levels (default: 7)
    pub max_levels: usize,

    /// L0 table count that makes L0 eligible for compaction (default: 5)
    pub num_level_zero_tables: usize,

    /// L0 table count at which flushes stall (default: 15)
    pub num_level_zero_tables_stall: usize,

    /// Background compactors; 0 disables compaction (default: 4)
    pub num_compactors: usize,

    /// Versions kept below the discard line (default: 1)
    pub num_versions_to_keep: usize,

    /// Values at least this long go to the value log (default: 1KB)
    pub value_threshold: usize,

    /// Lower clamp of the dynamic threshold (default: 1KB)
    pub min_value_threshold: usize,

    /// Upper clamp of the dynamic threshold (default: 1MB)
    pub max_value_threshold: usize,

    /// Percentile of observed value sizes used as threshold; 0 keeps it static (default: 0.0)
    pub value_threshold_percentile: f64,

    /// Value log rotation size (default: 1GB - 1)
    pub value_log_file_size: u64,

    /// Value log rotation entry count (default: 1,000,000)
    pub value_log_max_entries: u32,

    /// Table block size (default: 4KB)
    pub block_size: usize,

    /// Bloom filter false positive rate (default: 0.01)
    pub bloom_false_positive: f64,

    /// Block compression (default: none)
    pub compression: Compression,

    /// Optional data key for log file encryption (default: none)
    pub encryption_key: Option<EncryptionKey>,

    /// fsync WAL and value log after every write group (default: false)
    pub sync_writes: bool,

    /// Reject commits whose reads were overwritten (default: true)
    pub detect_conflicts: bool,

    /// Force one L0 compaction while closing (default: false)
    pub compact_l0_on_close: bool,

    /// Longest accepted key (default: 65000 bytes)
    pub max_key_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            memtable_size: 64 << 20,
            num_memtables: 5,
            base_table_size: 2 << 20,
            base_level_size: 10 << 20,
            level_size_multiplier: 10,
            table_size_multiplier: 2,
            max_levels: 7,
            num_level_zero_tables: 5,
            num_level_zero_tables_stall: 15,
            num_compactors: 4,
            num_versions_to_keep: 1,
            value_threshold: 1 << 10,
            min_value_threshold: 1 << 10,
            max_value_threshold: MAX_VALUE_THRESHOLD,
            value_threshold_percentile: 0.0,
            value_log_file_size: (1 << 30) - 1,
            value_log_max_entries: 1_000_000,
            block_size: 4 * 1024,
            bloom_false_positive: 0.01,
            compression: Compression::None,
            encryption_key: None,
            sync_writes: false,
            detect_conflicts: true,
            compact_l0_on_close: false,
            max_key_size: 65_000,
        }
    }
}

impl Options {
    /// Create options rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn memtable_size(mut self, size: u64) -> Self {
        self.memtable_size = size;
        self
    }

    pub fn num_memtables(mut self, n: usize) -> Self {
        self.num_memtables = n;
        self
    }

    pub fn base_table_size(mut self, size: u64) -> Self {
        self.base_table_size = size;
        self
    }

    pub fn base_level_size(mut self, size: u64) -> Self {
        self.base_level_size = size;
        self
    }

    pub fn level_size_multiplier(mut self, m: u64) -> Self {
        self.level_size_multiplier = m;
        self
    }

    pub fn table_size_multiplier(mut self, m: u64) -> Self {
        self.table_size_multiplier = m;
        self
    }

    pub fn max_levels(mut self, n: usize) -> Self {
        self.max_levels = n;
        self
    }

    pub fn num_level_zero_tables(mut self, n: usize) -> Self {
        self.num_level_zero_tables = n;
        self
    }

    pub fn num_level_zero_tables_stall(mut self, n: usize) -> Self {
        self.num_level_zero_tables_stall = n;
        self
    }

    pub fn num_compactors(mut self, n: usize) -> Self {
        self.num_compactors = n;
        self
    }

    pub fn num_versions_to_keep(mut self, n: usize) -> Self {
        self.num_versions_to_keep = n;
        self
    }

    pub fn value_threshold(mut self, size: usize) -> Self {
        self.value_threshold = size;
        self
    }

    /// Enable the dynamic threshold between `min` and `max` at `percentile`
    pub fn dynamic_value_threshold(mut self, min: usize, max: usize, percentile: f64) -> Self {
        self.min_value_threshold = min;
        self.max_value_threshold = max;
        self.value_threshold_percentile = percentile;
        self
    }

    pub fn value_log_file_size(mut self, size: u64) -> Self {
        self.value_log_file_size = size;
        self
    }

    pub fn value_log_max_entries(mut self, n: u32) -> Self {
        self.value_log_max_entries = n;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn bloom_false_positive(mut self, fp: f64) -> Self {
        self.bloom_false_positive = fp;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    pub fn detect_conflicts(mut self, enabled: bool) -> Self {
        self.detect_conflicts = enabled;
        self
    }

    pub fn compact_l0_on_close(mut self, enabled: bool) -> Self {
        self.compact_l0_on_close = enabled;
        self
    }

    pub fn max_key_size(mut self, size: usize) -> Self {
        self.max_key_size = size;
        self
    }

    /// Largest batch, in entries, that fits a single write request.
    pub fn max_batch_count(&self) -> u64 {
        self.max_batch_size() / crate::memtable::ENTRY_OVERHEAD
    }

    /// Largest batch, in bytes, that fits a single write request.
    pub fn max_batch_size(&self) -> u64 {
        (15 * self.memtable_size) / 100
    }

    /// Checks invariants between fields.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidOptions(msg));
        if self.num_compactors == 1 {
            return invalid("num_compactors must be 0 or at least 2".into());
        }
        if self.max_levels < 2 {
            return invalid(format!("max_levels must be at least 2, got {}", self.max_levels));
        }
        if self.num_level_zero_tables_stall <= self.num_level_zero_tables {
            return invalid(format!(
                "num_level_zero_tables_stall ({}) must exceed num_level_zero_tables ({})",
                self.num_level_zero_tables_stall, self.num_level_zero_tables
            ));
        }
        if self.num_memtables < 1 {
            return invalid("num_memtables must be at least 1".into());
        }
        if self.num_versions_to_keep < 1 {
            return invalid("num_versions_to_keep must be at least 1".into());
        }
        if self.value_threshold > MAX_VALUE_THRESHOLD {
            return invalid(format!(
                "value_threshold {} exceeds {}",
                self.value_threshold, MAX_VALUE_THRESHOLD
            ));
        }
        if self.value_threshold_percentile < 0.0 || self.value_threshold_percentile > 1.0 {
            return invalid("value_threshold_percentile must lie in [0, 1]".into());
        }
        if self.min_value_threshold > self.max_value_threshold {
            return invalid("min_value_threshold exceeds max_value_threshold".into());
        }
        if self.value_log_file_size < 1 << 20 || self.value_log_file_size >= 2 << 30 {
            return invalid(format!(
                "value_log_file_size {} must lie in [1MB, 2GB)",
                self.value_log_file_size
            ));
        }
        if self.level_size_multiplier < 2 {
            return invalid("level_size_multiplier must be at least 2".into());
        }
        if self.bloom_false_positive <= 0.0 || self.bloom_false_positive >= 1.0 {
            return invalid("bloom_false_positive must lie in (0, 1)".into());
        }
        if self.block_size == 0 {
            return invalid("block_size must be positive".into());
        }
        if let Some(k) = &self.encryption_key {
            if k.key.is_empty() {
                return invalid("encryption key must not be empty".into());
            }
        }
        // A value larger than a memtable would never fit.
        if self.value_threshold as u64 > self.memtable_size {
            return invalid("value_threshold exceeds memtable_size".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let opts = Options::default();
        assert_eq!(opts.dir, PathBuf::from("./emberdb"));
        assert_eq!(opts.memtable_size, 64 << 20);
        assert_eq!(opts.num_versions_to_keep, 1);
        assert!(opts.detect_conflicts);
        opts.validate().unwrap();
    }

    #[test]
    fn test_config_builder() {
        let opts = Options::new("/tmp/ember")
            .memtable_size(1 << 20)
            .num_compactors(2)
            .value_threshold(64)
            .compression(Compression::Lz4)
            .detect_conflicts(false);

        assert_eq!(opts.dir, PathBuf::from("/tmp/ember"));
        assert_eq!(opts.memtable_size, 1 << 20);
        assert_eq!(opts.num_compactors, 2);
        assert_eq!(opts.value_threshold, 64);
        assert_eq!(opts.compression, Compression::Lz4);
        assert!(!opts.detect_conflicts);
        opts.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_single_compactor() {
        let err = Options::default().num_compactors(1).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[test]
    fn test_validate_rejects_stall_below_trigger() {
        let opts = Options::default()
            .num_level_zero_tables(5)
            .num_level_zero_tables_stall(5);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_batch_limits_scale_with_memtable() {
        let small = Options::default().memtable_size(1 << 20);
        let big = Options::default().memtable_size(64 << 20);
        assert!(small.max_batch_size() < big.max_batch_size());
        assert!(small.max_batch_count() > 0);
    }

    #[test]
    fn test_compression_codes() {
        assert_eq!(Compression::from_u8(Compression::Lz4.to_u8()).unwrap(), Compression::Lz4);
        assert!(Compression::from_u8(9).is_err());
    }
}
