use crate::error::Result;
use crate::Error;
use serde::{Deserialize, Serialize};

/// Encodes `value` for manifest change sets and table indexes.
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Encode("bincode value", e.to_string()))
}

pub fn deserialize<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Decode("bincode value", e.to_string()))
}
