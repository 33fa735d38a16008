use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;
use crate::Error;

/// Entries between two full (unshared) keys.
const RESTART_INTERVAL: usize = 16;

/// Builds one prefix-compressed block.
///
/// ```text
/// entry   := shared:u16 | unshared:u16 | value_len:u32 | key[shared..] | value
/// block   := entry* | restart_offset:u32* | restart_count:u32
/// ```
pub struct Builder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl Builder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, key: &[u8], value: &[u8]) {
        let shared_prefix_len = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_key, key)
        };
        let unshared_key_len = key.len() - shared_prefix_len;

        let mut head = [0u8; 8];
        BigEndian::write_u16(&mut head[0..2], shared_prefix_len as u16);
        BigEndian::write_u16(&mut head[2..4], unshared_key_len as u16);
        BigEndian::write_u32(&mut head[4..8], value.len() as u32);
        self.buffer.extend_from_slice(&head);
        self.buffer.extend_from_slice(&key[shared_prefix_len..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        let mut word = [0u8; 4];
        for pos in &self.restart_positions {
            BigEndian::write_u32(&mut word, *pos);
            self.buffer.extend_from_slice(&word);
        }
        BigEndian::write_u32(&mut word, self.restart_positions.len() as u32);
        self.buffer.extend_from_slice(&word);
        self.buffer
    }

    /// Encoded size if the block were finished now.
    pub fn len(&self) -> usize {
        self.buffer.len() + 4 * (self.restart_positions.len() + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter()
        .zip(b.iter())
        .take_while(|&(a, b)| a == b)
        .count()
        .min(u16::MAX as usize)
}

/// A decoded block: full keys and raw values in stored order.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Block {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let corrupt = |msg: &str| Error::Decode("table block", msg.to_string());

        if data.len() < 4 {
            return Err(corrupt("data too short"));
        }
        let num_restarts_offset = data.len() - 4;
        let num_restarts = BigEndian::read_u32(&data[num_restarts_offset..]) as usize;
        let restart_array_size = num_restarts * 4;
        if num_restarts_offset < restart_array_size {
            return Err(corrupt("data too short for restart positions"));
        }
        let end = num_restarts_offset - restart_array_size;

        let mut entries = Vec::new();
        let mut last_key: Vec<u8> = Vec::new();
        let mut pos = 0;
        while pos < end {
            if pos + 8 > end {
                return Err(corrupt("truncated entry header"));
            }
            let shared = BigEndian::read_u16(&data[pos..pos + 2]) as usize;
            let unshared = BigEndian::read_u16(&data[pos + 2..pos + 4]) as usize;
            let value_len = BigEndian::read_u32(&data[pos + 4..pos + 8]) as usize;
            pos += 8;
            if shared > last_key.len() || pos + unshared + value_len > end {
                return Err(corrupt("entry out of bounds"));
            }
            let mut key = Vec::with_capacity(shared + unshared);
            key.extend_from_slice(&last_key[..shared]);
            key.extend_from_slice(&data[pos..pos + unshared]);
            pos += unshared;
            let value = data[pos..pos + value_len].to_vec();
            pos += value_len;

            last_key.clone_from(&key);
            entries.push((key, value));
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
