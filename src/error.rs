use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Failed to decode {0}: {1}")]
    Decode(&'static str, String),

    #[error("Failed to encode {0}: {1}")]
    Encode(&'static str, String),

    #[error("Checksum mismatch in {0}")]
    ChecksumMismatch(&'static str),

    #[error("Bad magic number in {0}")]
    BadMagic(&'static str),

    #[error("Unsupported {0} version: {1}")]
    UnsupportedVersion(&'static str, u32),

    #[error("Manifest corrupt: {0}")]
    ManifestCorrupt(String),

    #[error("Manifest references table {0} which does not exist on disk")]
    ManifestMissingTable(u64),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Lock error: {0}")]
    LockError(io::Error),

    #[error("Key cannot be empty")]
    EmptyKey,

    #[error("Key with size {size} exceeded {limit} limit")]
    KeyTooLarge { size: usize, limit: usize },

    #[error("Value with size {size} exceeded {limit} limit")]
    ValueTooLarge { size: usize, limit: usize },

    #[error("Txn is too big to fit into one request")]
    TxnTooBig,

    #[error("Transaction conflict. Please retry")]
    Conflict,

    #[error("This transaction has been discarded. Create a new one")]
    DiscardedTxn,

    #[error("No sets or deletes are allowed in a read-only transaction")]
    ReadOnlyTxn,

    #[error("Database is closed")]
    DbClosed,

    #[error("Writes are blocked while data is being dropped")]
    BlockedWrites,

    #[error("No room for write")]
    NoRoom,

    #[error("Invalid value pointer: {0}")]
    InvalidPointer(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Errors that abort startup instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ManifestCorrupt(_)
                | Error::ManifestMissingTable(_)
                | Error::BadMagic(_)
                | Error::UnsupportedVersion(..)
                | Error::ChecksumMismatch(_)
        )
    }
}

impl Error {
    /// A copy of this error, for fanning one failure out to every request
    /// of a write group.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::IoError(e) => Error::IoError(io::Error::new(e.kind(), e.to_string())),
            Error::DbClosed => Error::DbClosed,
            Error::BlockedWrites => Error::BlockedWrites,
            Error::NoRoom => Error::NoRoom,
            Error::Conflict => Error::Conflict,
            Error::TxnTooBig => Error::TxnTooBig,
            other => Error::InvalidState(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::IoError(_)));
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::ManifestMissingTable(7).is_fatal());
        assert!(Error::ChecksumMismatch("table").is_fatal());
        assert!(!Error::Conflict.is_fatal());
        assert!(!Error::NoRoom.is_fatal());
    }

    #[test]
    fn test_duplicate_keeps_io_kind() {
        let err: Error = io::Error::new(io::ErrorKind::PermissionDenied, "disk").into();
        match err.duplicate() {
            Error::IoError(e) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(Error::DbClosed.duplicate(), Error::DbClosed));
    }
}
