//! Checksum algorithms and per-sector sums
//!
//! BTRFS checksums every sector of data and every tree node. CRC32c is the
//! common case; SHA-256 filesystems are also handled natively. XXHash64 and
//! Blake2b are recognized but not computed.

use super::{Result, RescueError};
use sha2::{Digest, Sha256};

/// Largest checksum size of any supported algorithm, in bytes
pub const MAX_CSUM_SIZE: usize = 32;

/// Checksum algorithms defined by the on-disk format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    /// CRC32c (Castagnoli)
    Crc32c,
    /// XXHash64 (not yet implemented)
    XxHash64,
    /// SHA256
    Sha256,
    /// Blake2b (not yet implemented)
    Blake2b,
}

impl ChecksumKind {
    /// Returns the checksum kind for a superblock `csum_type` value
    #[inline]
    pub fn from_type(csum_type: u16) -> Result<Self> {
        match csum_type {
            0 => Ok(Self::Crc32c),
            1 => Ok(Self::XxHash64),
            2 => Ok(Self::Sha256),
            3 => Ok(Self::Blake2b),
            _ => Err(RescueError::UnsupportedFeature(format!(
                "Unknown checksum type: {}",
                csum_type
            ))),
        }
    }

    /// Returns the size of one checksum in bytes
    #[inline]
    pub const fn size(&self) -> usize {
        match self {
            Self::Crc32c => 4,
            Self::XxHash64 => 8,
            Self::Sha256 => 32,
            Self::Blake2b => 32,
        }
    }

    /// Checksums one block of data
    ///
    /// This is the scanner's hot path: it runs once per device sector.
    #[inline]
    pub fn sum(&self, data: &[u8]) -> Result<ShortSum> {
        match self {
            Self::Crc32c => Ok(ShortSum::from_bytes(&crc32c::crc32c(data).to_le_bytes())),
            Self::Sha256 => {
                let digest = Sha256::digest(data);
                Ok(ShortSum::from_bytes(&digest))
            }
            Self::XxHash64 | Self::Blake2b => Err(RescueError::UnsupportedFeature(format!(
                "Checksum algorithm not implemented: {:?}",
                self
            ))),
        }
    }
}

/// One fixed-width checksum
///
/// The width depends on the filesystem's algorithm, so the value is stored
/// inline in a max-width buffer. Bytes past `len` are always zero, which
/// keeps the derived `Eq`/`Hash` honest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortSum {
    len: u8,
    buf: [u8; MAX_CSUM_SIZE],
}

impl ShortSum {
    /// Wraps checksum bytes; at most [`MAX_CSUM_SIZE`] of them
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= MAX_CSUM_SIZE, "checksum too wide");
        let mut buf = [0u8; MAX_CSUM_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self {
            len: bytes.len() as u8,
            buf,
        }
    }

    /// The checksum bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    /// Width of this checksum in bytes
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the checksum is zero-width
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Display for ShortSum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.as_bytes()))
    }
}

impl std::fmt::Debug for ShortSum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShortSum({})", self)
    }
}

/// Computes a CRC32c checksum
#[inline]
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Verifies the embedded checksum of a tree node
///
/// Node checksums cover everything after the checksum field (offset 0x20).
pub fn verify_node_checksum(kind: ChecksumKind, data: &[u8]) -> Result<()> {
    if data.len() < 0x20 + kind.size() {
        return Err(RescueError::Corrupt(
            "Node too small for checksum".to_string(),
        ));
    }

    let expected = ShortSum::from_bytes(&data[..kind.size()]);
    let actual = kind.sum(&data[0x20..])?;

    if expected != actual {
        return Err(RescueError::ChecksumMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_size() {
        assert_eq!(ChecksumKind::Crc32c.size(), 4);
        assert_eq!(ChecksumKind::XxHash64.size(), 8);
        assert_eq!(ChecksumKind::Sha256.size(), 32);
        assert_eq!(ChecksumKind::Blake2b.size(), 32);
    }

    #[test]
    fn test_checksum_from_type() {
        assert_eq!(ChecksumKind::from_type(0).unwrap(), ChecksumKind::Crc32c);
        assert_eq!(ChecksumKind::from_type(1).unwrap(), ChecksumKind::XxHash64);
        assert_eq!(ChecksumKind::from_type(2).unwrap(), ChecksumKind::Sha256);
        assert_eq!(ChecksumKind::from_type(3).unwrap(), ChecksumKind::Blake2b);
        assert!(ChecksumKind::from_type(4).is_err());
        assert!(ChecksumKind::from_type(255).is_err());
    }

    #[test]
    fn test_crc32c_sum_matches_crate() {
        let data = b"hello";
        let sum = ChecksumKind::Crc32c.sum(data).unwrap();
        assert_eq!(sum.as_bytes(), crc32c::crc32c(data).to_le_bytes());
        assert_eq!(sum.len(), 4);
    }

    #[test]
    fn test_sha256_sum_width() {
        let sum = ChecksumKind::Sha256.sum(b"data").unwrap();
        assert_eq!(sum.len(), 32);
    }

    #[test]
    fn test_unimplemented_algorithms() {
        assert!(ChecksumKind::XxHash64.sum(b"x").is_err());
        assert!(ChecksumKind::Blake2b.sum(b"x").is_err());
    }

    #[test]
    fn test_short_sum_eq_ignores_width_padding() {
        let a = ShortSum::from_bytes(&[1, 2, 3, 4]);
        let b = ShortSum::from_bytes(&[1, 2, 3, 4]);
        let c = ShortSum::from_bytes(&[1, 2, 3, 4, 0]);
        assert_eq!(a, b);
        // Same bytes but different declared width are different sums.
        assert_ne!(a, c);
    }

    #[test]
    fn test_short_sum_display() {
        let sum = ShortSum::from_bytes(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(format!("{}", sum), "deadbeef");
        assert_eq!(format!("{:?}", sum), "ShortSum(deadbeef)");
    }

    #[test]
    fn test_verify_node_checksum_valid() {
        let mut data = vec![0u8; 4096];
        data[0x20..0x2c].copy_from_slice(b"test data!!!");
        let sum = crc32c::crc32c(&data[0x20..]);
        data[0..4].copy_from_slice(&sum.to_le_bytes());
        assert!(verify_node_checksum(ChecksumKind::Crc32c, &data).is_ok());
    }

    #[test]
    fn test_verify_node_checksum_invalid() {
        let mut data = vec![0u8; 4096];
        data[0x20..0x2c].copy_from_slice(b"test data!!!");
        data[0..4].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        assert!(verify_node_checksum(ChecksumKind::Crc32c, &data).is_err());
    }

    #[test]
    fn test_verify_node_checksum_too_small() {
        let data = vec![0u8; 0x10];
        assert!(verify_node_checksum(ChecksumKind::Crc32c, &data).is_err());
    }
}
