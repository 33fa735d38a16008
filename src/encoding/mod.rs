//! Small binary helpers shared by the on-disk formats.

pub mod bincode;

use crate::error::Result;
use crate::Error;

/// Longest encoding of a u64 as an unsigned varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Appends `v` as a little-endian base-128 varint.
pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Number of bytes `put_uvarint` would emit for `v`.
pub fn uvarint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

/// Decodes a varint from the front of `buf`, returning the value and the
/// number of bytes consumed.
pub fn read_uvarint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut x: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            break;
        }
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                break;
            }
            return Ok((x | (u64::from(b) << shift), i + 1));
        }
        x |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    Err(Error::Decode("varint", format!("truncated or overlong in {} bytes", buf.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for v in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, v);
            assert_eq!(buf.len(), uvarint_len(v), "length for {}", v);
            let (decoded, n) = read_uvarint(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(n, buf.len());
        }
    }

    #[test]
    fn test_varint_truncated() {
        assert!(read_uvarint(&[0x80, 0x80]).is_err());
        assert!(read_uvarint(&[]).is_err());
    }

    #[test]
    fn test_varint_reads_prefix_only() {
        let (v, n) = read_uvarint(&[0x05, 0xff, 0xff]).unwrap();
        assert_eq!((v, n), (5, 1));
    }
}
