use byteorder::{BigEndian, ByteOrder};

use crate::crypto::IV_SIZE;
use crate::error::Result;
use crate::Error;

pub const HEADER_SIZE: usize = 32;

const MAGIC: &[u8; 8] = b"EMBRLOG1";
const VERSION: u32 = 1;

/// Fixed header at the start of every WAL and value log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 8],
    pub version: u32,
    /// Id of the data key encrypting this file, 0 for plain files.
    pub key_id: u64,
    pub base_iv: [u8; IV_SIZE],
}

impl Header {
    pub fn new(key_id: u64, base_iv: [u8; IV_SIZE]) -> Self {
        Header {
            magic: *MAGIC,
            version: VERSION,
            key_id,
            base_iv,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::BadMagic("log file"));
        }
        if self.version != VERSION {
            return Err(Error::UnsupportedVersion("log file", self.version));
        }
        Ok(())
    }

    pub fn is_encrypted(&self) -> bool {
        self.key_id != 0
    }
}

impl TryFrom<&[u8]> for Header {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Decode(
                "log file header",
                format!("{} bytes", bytes.len()),
            ));
        }
        let mut buf = [0u8; HEADER_SIZE];
        buf.copy_from_slice(&bytes[..HEADER_SIZE]);
        Header::decode(&buf)
    }
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        BigEndian::write_u32(&mut buf[8..12], self.version);
        BigEndian::write_u64(&mut buf[12..20], self.key_id);
        buf[20..32].copy_from_slice(&self.base_iv);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);
        let mut base_iv = [0u8; IV_SIZE];
        base_iv.copy_from_slice(&buf[20..32]);

        let header = Self {
            magic,
            version: BigEndian::read_u32(&buf[8..12]),
            key_id: BigEndian::read_u64(&buf[12..20]),
            base_iv,
        };
        header.validate()?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encoding_decoding() {
        let header = Header::new(9, [3u8; IV_SIZE]);
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);

        let decoded = Header::decode(&encoded).expect("Failed to decode Header");
        assert_eq!(header, decoded);
        assert!(decoded.is_encrypted());
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut encoded = Header::new(0, [0u8; IV_SIZE]).encode();
        encoded[0] = b'X';
        assert!(matches!(Header::decode(&encoded), Err(Error::BadMagic(_))));
    }

    #[test]
    fn test_header_rejects_unknown_version() {
        let mut encoded = Header::new(0, [0u8; IV_SIZE]).encode();
        BigEndian::write_u32(&mut encoded[8..12], 7);
        assert!(matches!(
            Header::decode(&encoded),
            Err(Error::UnsupportedVersion(_, 7))
        ));
    }

    #[test]
    fn test_header_too_short() {
        assert!(Header::try_from(&[0u8; 10][..]).is_err());
    }
}
