//! Frame checksums
//!
//! Every algorithm produces a 32-bit value stored big-endian on the wire.
//! A single changed byte is always detected; `Additive` and `Xor` can miss
//! some multi-byte corruptions (two errors that cancel out).

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

/// Checksum applied to each frame section
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// IEEE CRC-32
    #[default]
    Crc32,
    /// Wrapping 32-bit sum of all bytes
    Additive,
    /// XOR of all bytes
    Xor,
}

impl ChecksumAlgorithm {
    /// Compute the checksum of `data`
    pub fn compute(&self, data: &[u8]) -> u32 {
        match self {
            ChecksumAlgorithm::Crc32 => {
                let mut hasher = Hasher::new();
                hasher.update(data);
                hasher.finalize()
            }
            ChecksumAlgorithm::Additive => data
                .iter()
                .fold(0u32, |acc, &b| acc.wrapping_add(b as u32)),
            ChecksumAlgorithm::Xor => data.iter().fold(0u8, |acc, &b| acc ^ b) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_value() {
        // Standard check value for "123456789"
        assert_eq!(ChecksumAlgorithm::Crc32.compute(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_additive_and_xor() {
        assert_eq!(ChecksumAlgorithm::Additive.compute(&[0xFF, 0xFF, 0x02]), 0x200);
        assert_eq!(ChecksumAlgorithm::Xor.compute(&[0x0F, 0xF0, 0x01]), 0xFE);
        assert_eq!(ChecksumAlgorithm::Xor.compute(&[]), 0);
    }

    #[test]
    fn test_single_byte_change_detected() {
        let data: Vec<u8> = (0..64).collect();
        for algorithm in [
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::Additive,
            ChecksumAlgorithm::Xor,
        ] {
            let original = algorithm.compute(&data);
            for i in 0..data.len() {
                let mut corrupted = data.clone();
                corrupted[i] ^= 0x5A;
                assert_ne!(algorithm.compute(&corrupted), original, "{:?} @ {}", algorithm, i);
            }
        }
    }
}
