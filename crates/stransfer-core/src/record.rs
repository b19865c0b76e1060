//! Transfer records
//!
//! A transfer moves one [`GlobalRecord`] (a fixed 16-byte description of the
//! transaction) together with one [`PackageRecord`] (the application bytes).
//!
//! Global record layout (big-endian):
//! - 1 byte: kind
//! - 1 byte: channel
//! - 2 bytes: device id
//! - 4 bytes: session id
//! - 4 bytes: sequence
//! - 4 bytes: package size

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::protocol::FrameError;

/// What a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    /// Application data (global record + package)
    Data,
    /// Request for the remote to send a data frame
    ReadRequest,
    /// Positive acknowledgement of a data frame
    Ack,
    /// Negative acknowledgement, the sender should retransmit
    Nack,
}

impl RecordKind {
    /// Wire code of this kind
    pub fn code(&self) -> u8 {
        match self {
            RecordKind::Data => 0x01,
            RecordKind::ReadRequest => 0x02,
            RecordKind::Ack => 0x03,
            RecordKind::Nack => 0x04,
        }
    }

    /// Parse a wire code
    pub fn from_code(code: u8) -> Result<Self, FrameError> {
        match code {
            0x01 => Ok(RecordKind::Data),
            0x02 => Ok(RecordKind::ReadRequest),
            0x03 => Ok(RecordKind::Ack),
            0x04 => Ok(RecordKind::Nack),
            other => Err(FrameError::InvalidField {
                field: "kind",
                value: other as u32,
            }),
        }
    }
}

/// Fixed-size record exchanged once per transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalRecord {
    /// Frame kind
    pub kind: RecordKind,
    /// Channel identifier
    pub channel: u8,
    /// Device identifier
    pub device_id: u16,
    /// Session counter
    pub session_id: u32,
    /// Sequence counter
    pub sequence: u32,
    /// Byte length of the paired package
    pub package_size: u32,
}

impl GlobalRecord {
    /// Encoded size in bytes
    pub const SIZE: usize = 16;

    /// Describe a data package
    pub fn for_package(
        device_id: u16,
        channel: u8,
        session_id: u32,
        sequence: u32,
        package: &PackageRecord,
    ) -> Self {
        Self {
            kind: RecordKind::Data,
            channel,
            device_id,
            session_id,
            sequence,
            package_size: package.len() as u32,
        }
    }

    /// Build a read request (carries no package)
    pub fn read_request(device_id: u16, channel: u8, session_id: u32, sequence: u32) -> Self {
        Self {
            kind: RecordKind::ReadRequest,
            channel,
            device_id,
            session_id,
            sequence,
            package_size: 0,
        }
    }

    /// Acknowledgement answering this record
    pub fn ack_for(&self) -> Self {
        self.reply(RecordKind::Ack)
    }

    /// Negative acknowledgement answering this record
    pub fn nack_for(&self) -> Self {
        self.reply(RecordKind::Nack)
    }

    fn reply(&self, kind: RecordKind) -> Self {
        Self {
            kind,
            package_size: 0,
            ..*self
        }
    }

    /// True if `other` names the same transaction (ignoring kind and size)
    pub fn same_transaction(&self, other: &GlobalRecord) -> bool {
        self.channel == other.channel
            && self.device_id == other.device_id
            && self.session_id == other.session_id
            && self.sequence == other.sequence
    }

    /// Encode to the fixed wire layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.kind.code();
        bytes[1] = self.channel;
        BigEndian::write_u16(&mut bytes[2..4], self.device_id);
        BigEndian::write_u32(&mut bytes[4..8], self.session_id);
        BigEndian::write_u32(&mut bytes[8..12], self.sequence);
        BigEndian::write_u32(&mut bytes[12..16], self.package_size);
        bytes
    }

    /// Decode and validate a record; never fills in defaults
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < Self::SIZE {
            return Err(FrameError::Truncated {
                needed: Self::SIZE,
                available: bytes.len(),
            });
        }

        Ok(Self {
            kind: RecordKind::from_code(bytes[0])?,
            channel: bytes[1],
            device_id: BigEndian::read_u16(&bytes[2..4]),
            session_id: BigEndian::read_u32(&bytes[4..8]),
            sequence: BigEndian::read_u32(&bytes[8..12]),
            package_size: BigEndian::read_u32(&bytes[12..16]),
        })
    }
}

/// Variable-length application payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord(Vec<u8>);

impl PackageRecord {
    /// Wrap raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Empty package (used by control frames)
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there is no payload
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Take the payload bytes
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for PackageRecord {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for PackageRecord {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for PackageRecord {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
