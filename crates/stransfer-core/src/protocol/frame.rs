//! Frame encoding/decoding
//!
//! Frame format (all integers big-endian):
//! - 2 bytes: Magic marker (`0xA5 0x5A`)
//! - 4 bytes: Body length (every byte after this field)
//! - 16 bytes: Global record
//! - 4 bytes: Checksum of the global record
//! - 4 bytes: Package length
//! - N bytes: Package
//! - 4 bytes: Checksum of package length + package

use byteorder::{BigEndian, ByteOrder};

use super::{ChecksumAlgorithm, FrameError, FrameSection, DEFAULT_MAX_FRAME_SIZE};
use crate::record::{GlobalRecord, PackageRecord};

/// Frame start marker
pub const MAGIC: [u8; 2] = [0xA5, 0x5A];

/// Magic + body length
pub const HEADER_LEN: usize = 6;

/// Smallest legal body: global record, its checksum, package length, package checksum
pub const MIN_BODY_LEN: usize = GlobalRecord::SIZE + 4 + 4 + 4;

/// Encoded size of a frame with an empty package
pub const FRAME_OVERHEAD: usize = HEADER_LEN + MIN_BODY_LEN;

const GLOBAL_START: usize = HEADER_LEN;
const GLOBAL_END: usize = GLOBAL_START + GlobalRecord::SIZE;
const PACKAGE_LEN_START: usize = GLOBAL_END + 4;
const PACKAGE_START: usize = PACKAGE_LEN_START + 4;

/// Encoder/decoder for transfer frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    checksum: ChecksumAlgorithm,
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(ChecksumAlgorithm::default(), DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Create a codec; `max_frame_size` bounds the body length
    pub fn new(checksum: ChecksumAlgorithm, max_frame_size: usize) -> Self {
        Self {
            checksum,
            max_frame_size,
        }
    }

    /// Checksum algorithm in use
    pub fn checksum(&self) -> ChecksumAlgorithm {
        self.checksum
    }

    /// Largest accepted body length
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encoded size of a frame carrying `package_len` bytes
    pub fn encoded_size(package_len: usize) -> usize {
        FRAME_OVERHEAD + package_len
    }

    /// Encode a global record and its package into one frame
    pub fn encode(
        &self,
        global: &GlobalRecord,
        package: &PackageRecord,
    ) -> Result<Vec<u8>, FrameError> {
        if global.package_size as usize != package.len() {
            return Err(FrameError::MalformedLength(format!(
                "global record declares {} package bytes, package has {}",
                global.package_size,
                package.len()
            )));
        }

        let body_len = MIN_BODY_LEN + package.len();
        if body_len > self.max_frame_size {
            return Err(FrameError::MalformedLength(format!(
                "frame body of {} bytes exceeds maximum {}",
                body_len, self.max_frame_size
            )));
        }

        let mut bytes = Vec::with_capacity(HEADER_LEN + body_len);
        bytes.extend_from_slice(&MAGIC);
        push_u32(&mut bytes, body_len as u32);

        let global_bytes = global.to_bytes();
        bytes.extend_from_slice(&global_bytes);
        push_u32(&mut bytes, self.checksum.compute(&global_bytes));

        // Package checksum covers its length prefix too
        let package_section_start = bytes.len();
        push_u32(&mut bytes, package.len() as u32);
        bytes.extend_from_slice(package.as_bytes());
        let package_checksum = self.checksum.compute(&bytes[package_section_start..]);
        push_u32(&mut bytes, package_checksum);

        Ok(bytes)
    }

    /// Decode one frame from the start of `data`
    pub fn decode(&self, data: &[u8]) -> Result<(GlobalRecord, PackageRecord), FrameError> {
        self.decode_with_len(data)
            .map(|(global, package, _)| (global, package))
    }

    /// Decode one frame and report how many bytes it occupied
    pub fn decode_with_len(
        &self,
        data: &[u8],
    ) -> Result<(GlobalRecord, PackageRecord, usize), FrameError> {
        let total = self.frame_len(data)?;

        let global_bytes = &data[GLOBAL_START..GLOBAL_END];
        let received = BigEndian::read_u32(&data[GLOBAL_END..PACKAGE_LEN_START]);
        let expected = self.checksum.compute(global_bytes);
        if received != expected {
            return Err(FrameError::ChecksumMismatch {
                section: FrameSection::Global,
                expected,
                actual: received,
            });
        }
        let global = GlobalRecord::from_bytes(global_bytes)?;

        let received = BigEndian::read_u32(&data[total - 4..total]);
        let expected = self.checksum.compute(&data[PACKAGE_LEN_START..total - 4]);
        if received != expected {
            return Err(FrameError::ChecksumMismatch {
                section: FrameSection::Package,
                expected,
                actual: received,
            });
        }

        let package_len = BigEndian::read_u32(&data[PACKAGE_LEN_START..PACKAGE_START]) as usize;
        let available = total - 4 - PACKAGE_START;
        if package_len != available {
            return Err(FrameError::MalformedLength(format!(
                "package length {} does not fit frame body ({} bytes available)",
                package_len, available
            )));
        }
        if package_len != global.package_size as usize {
            return Err(FrameError::MalformedLength(format!(
                "global record declares {} package bytes, frame carries {}",
                global.package_size, package_len
            )));
        }

        let package = PackageRecord::new(data[PACKAGE_START..PACKAGE_START + package_len].to_vec());
        Ok((global, package, total))
    }

    /// Validate the header and return the full frame length
    ///
    /// Fails with `Truncated` until `data` holds the whole frame.
    pub fn frame_len(&self, data: &[u8]) -> Result<usize, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                needed: HEADER_LEN,
                available: data.len(),
            });
        }

        if data[0..2] != MAGIC {
            return Err(FrameError::BadMagic(BigEndian::read_u16(&data[0..2])));
        }

        let body_len = BigEndian::read_u32(&data[2..HEADER_LEN]) as usize;
        if body_len < MIN_BODY_LEN || body_len > self.max_frame_size {
            return Err(FrameError::MalformedLength(format!(
                "declared body length {} outside {}..={}",
                body_len, MIN_BODY_LEN, self.max_frame_size
            )));
        }

        let total = HEADER_LEN + body_len;
        if data.len() < total {
            return Err(FrameError::Truncated {
                needed: total,
                available: data.len(),
            });
        }

        Ok(total)
    }
}

fn push_u32(bytes: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    bytes.extend_from_slice(&buf);
}
