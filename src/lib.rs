//! Embeddable MVCC key-value engine.
//!
//! Writes land in a WAL-backed memtable, large values are kept apart in a
//! value log, and flushed tables are merged down a leveled LSM tree by
//! background compactors. Readers and transactions see consistent
//! snapshots; optimistic transactions detect write conflicts at commit.

pub mod batch;
pub mod config;
pub mod crypto;
mod db;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod iterator;
pub mod key;
pub mod levels;
pub mod logfile;
pub mod manifest;
pub mod memtable;
pub mod oracle;
pub mod scheduler;
pub mod sequence;
pub mod table;
pub mod txn;
pub mod value;
pub mod vlog;

pub use batch::WriteBatch;
pub use config::{Compression, EncryptionKey, Options};
pub use db::Db;
pub use error::{Error, Result};
pub use iterator::{DbIterator, Item, IteratorOptions};
pub use levels::{LevelInfo, TableInfo};
pub use sequence::Sequence;
pub use txn::Txn;
pub use value::Entry;
pub use vlog::GcStatus;
