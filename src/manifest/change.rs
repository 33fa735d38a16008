use serde::{Deserialize, Serialize};

use crate::config::Compression;
use crate::encoding::bincode;
use crate::error::Result;

/// A single structural change to the set of live tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestChange {
    Create {
        id: u64,
        level: u32,
        key_id: u64,
        compression: u8,
    },
    Delete {
        id: u64,
    },
}

impl ManifestChange {
    pub fn create(id: u64, level: usize, key_id: u64, compression: Compression) -> Self {
        ManifestChange::Create {
            id,
            level: level as u32,
            key_id,
            compression: compression.to_u8(),
        }
    }

    pub fn delete(id: u64) -> Self {
        ManifestChange::Delete { id }
    }

    pub fn table_id(&self) -> u64 {
        match self {
            ManifestChange::Create { id, .. } | ManifestChange::Delete { id } => *id,
        }
    }
}

/// Changes applied atomically: one manifest record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestChangeSet {
    pub changes: Vec<ManifestChange>,
}

impl ManifestChangeSet {
    pub fn new(changes: Vec<ManifestChange>) -> Self {
        Self { changes }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        bincode::deserialize(buf)
    }
}
