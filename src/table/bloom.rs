//! Bloom filter over user keys, stored at the tail of every table.
//!
//! Probes use double hashing over the two halves of a 128-bit xxh3 hash:
//! `h_i = h1 + i * h2 (mod m)`.

use byteorder::{BigEndian, ByteOrder};
use xxhash_rust::xxh3::xxh3_128;

use crate::error::Result;
use crate::Error;

pub fn hash(key: &[u8]) -> u128 {
    xxh3_128(key)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bloom {
    bits: Vec<u64>,
    num_hashes: u32,
    num_bits: u32,
}

impl Bloom {
    /// Builds a filter sized for `hashes.len()` keys at the given rate.
    pub fn from_hashes(hashes: &[u128], false_positive_rate: f64) -> Self {
        let bits_per_key = -1.44 * false_positive_rate.log2();
        let num_bits = ((hashes.len().max(1) as f64) * bits_per_key).ceil() as u32;
        let num_bits = num_bits.max(64);
        let num_hashes = ((bits_per_key * std::f64::consts::LN_2).ceil() as u32).clamp(1, 30);

        let mut bloom = Self {
            bits: vec![0u64; (num_bits as usize).div_ceil(64)],
            num_hashes,
            num_bits,
        };
        for &h in hashes {
            let (h1, h2) = split(h);
            for i in 0..bloom.num_hashes {
                let pos = bloom.position(h1, h2, i);
                bloom.bits[(pos / 64) as usize] |= 1 << (pos % 64);
            }
        }
        bloom
    }

    /// `false` means the key is definitely absent.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.may_contain_hash(hash(key))
    }

    pub fn may_contain_hash(&self, h: u128) -> bool {
        let (h1, h2) = split(h);
        (0..self.num_hashes).all(|i| {
            let pos = self.position(h1, h2, i);
            (self.bits[(pos / 64) as usize] >> (pos % 64)) & 1 == 1
        })
    }

    fn position(&self, h1: u64, h2: u64, i: u32) -> u32 {
        (h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % u64::from(self.num_bits)) as u32
    }

    /// `[num_hashes u32][num_bits u32][words u64...]`, big-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 8 + self.bits.len() * 8];
        BigEndian::write_u32(&mut buf[0..4], self.num_hashes);
        BigEndian::write_u32(&mut buf[4..8], self.num_bits);
        for (i, word) in self.bits.iter().enumerate() {
            BigEndian::write_u64(&mut buf[8 + i * 8..16 + i * 8], *word);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::Decode("bloom filter", format!("{} bytes", buf.len())));
        }
        let num_hashes = BigEndian::read_u32(&buf[0..4]);
        let num_bits = BigEndian::read_u32(&buf[4..8]);
        let words = (num_bits as usize).div_ceil(64);
        if num_bits == 0 || buf.len() != 8 + words * 8 {
            return Err(Error::Decode(
                "bloom filter",
                format!("{} bits in {} bytes", num_bits, buf.len()),
            ));
        }
        let bits = buf[8..].chunks_exact(8).map(BigEndian::read_u64).collect();
        Ok(Self {
            bits,
            num_hashes,
            num_bits,
        })
    }
}

fn split(h: u128) -> (u64, u64) {
    (h as u64, (h >> 64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let keys: Vec<Vec<u8>> = (0..1000).map(|i| format!("key{:05}", i).into_bytes()).collect();
        let hashes: Vec<u128> = keys.iter().map(|k| hash(k)).collect();
        let bloom = Bloom::from_hashes(&hashes, 0.01);
        assert!(keys.iter().all(|k| bloom.may_contain(k)));
    }

    #[test]
    fn test_false_positive_rate_is_reasonable() {
        let hashes: Vec<u128> = (0..1000).map(|i| hash(format!("in{}", i).as_bytes())).collect();
        let bloom = Bloom::from_hashes(&hashes, 0.01);
        let hits = (0..10_000)
            .filter(|i| bloom.may_contain(format!("out{}", i).as_bytes()))
            .count();
        assert!(hits < 500, "false positives: {}", hits);
    }

    #[test]
    fn test_encode_decode() {
        let hashes: Vec<u128> = (0..10).map(|i| hash(&[i as u8])).collect();
        let bloom = Bloom::from_hashes(&hashes, 0.05);
        let decoded = Bloom::decode(&bloom.encode()).unwrap();
        assert_eq!(bloom, decoded);
        assert!(Bloom::decode(&[0u8; 3]).is_err());
    }
}
