//! Transfer Protocol
//!
//! Implements the framed, checksummed request/response protocol that runs
//! over a serial link (or any byte stream that behaves like one).
//!
//! Every frame carries a fixed-size global record and a variable-length
//! package, each guarded by its own checksum.

pub mod assembler;
pub mod checksum;
mod error;
pub mod frame;
pub mod loopback;
pub mod serial;
mod session;
pub mod stream;
pub mod transport;

pub use assembler::FrameAssembler;
pub use checksum::ChecksumAlgorithm;
pub use error::{
    AttemptFailure, ConfigError, FrameError, FrameSection, TransferError, TransferResult,
    TransportError,
};
pub use frame::FrameCodec;
pub use loopback::{LoopbackConnector, LoopbackHandle};
pub use serial::SerialConnector;
pub use session::{ReadMode, SessionConfig, SessionState, SessionStats, TransferSession};
pub use stream::TcpConnector;
pub use transport::{CloseHandle, Connector, Transport};

/// Default baud rate for serial links
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Default response window per attempt, in seconds
pub const DEFAULT_TIMEOUT_SECS: f64 = 3.0;

/// Default transport read timeout, in seconds
pub const DEFAULT_READ_TIMEOUT_SECS: f64 = 0.02;

/// Default number of send/receive attempts per call
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Maximum frame body size (everything after the length field)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 65536;
