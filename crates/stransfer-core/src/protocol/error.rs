//! Protocol errors

use std::fmt;

use thiserror::Error;

use crate::record::RecordKind;

/// Checksummed section of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSection {
    /// The fixed-size global record
    Global,
    /// The variable-length package
    Package,
}

impl fmt::Display for FrameSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameSection::Global => f.write_str("global record"),
            FrameSection::Package => f.write_str("package"),
        }
    }
}

/// Errors raised while decoding (or validating for encode) a frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("{section} checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        section: FrameSection,
        expected: u32,
        actual: u32,
    },

    #[error("Malformed length: {0}")]
    MalformedLength(String),

    #[error("Bad frame magic: {0:#06x}")]
    BadMagic(u16),

    #[error("Invalid field '{field}': {value:#x}")]
    InvalidField { field: &'static str, value: u32 },
}

/// Errors from the underlying byte channel
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open '{port}': {reason}")]
    OpenFailed { port: String, reason: String },

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a single send/receive attempt failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    #[error("timeout waiting for response after {waited_ms} ms")]
    Timeout { waited_ms: u64 },

    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),

    #[error("remote rejected the frame (nack)")]
    Rejected,

    #[error("reply belongs to another transaction (sequence {sequence})")]
    StaleReply { sequence: u32 },

    #[error("unexpected {got:?} frame while waiting for {expected:?}")]
    Unexpected {
        expected: RecordKind,
        got: RecordKind,
    },
}

/// Errors surfaced by a read or write call
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Session not initialized: call init() first")]
    NotInitialized,

    #[error("Invalid record: {0}")]
    InvalidRecord(FrameError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Retry budget exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: AttemptFailure },
}

/// Outcome of a transfer call
pub type TransferResult<T> = Result<T, TransferError>;

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
