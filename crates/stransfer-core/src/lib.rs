//! # stransfer Core Library
//!
//! Framed, checksummed, retrying point-to-point transfers over unreliable
//! byte links.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Fixed-schema global records paired with variable-length packages
//! - A frame codec with per-section checksums
//! - A transfer session with bounded retries and acknowledgements
//! - Serial, TCP and in-memory loopback transports
//!
//! ## Example
//!
//! ```rust,ignore
//! use stransfer_core::protocol::{SerialConnector, SessionConfig, TransferSession};
//!
//! let config = SessionConfig::new(3.0, true)?;
//! let mut session = TransferSession::new(SerialConnector, config)?;
//! session.init("/dev/ttyUSB0", 38400, 0.02)?;
//!
//! let (global, package) = session.read()?;
//! println!("global: {:?}, package: {} bytes", global, package.len());
//!
//! session.write(&global, &package)?;
//! ```

pub mod protocol;
pub mod record;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        ChecksumAlgorithm, CloseHandle, Connector, FrameCodec, FrameError, LoopbackConnector,
        LoopbackHandle, ReadMode, SerialConnector, SessionConfig, SessionState, TcpConnector,
        TransferError, TransferResult, TransferSession, Transport, TransportError,
    };
    pub use crate::record::{GlobalRecord, PackageRecord, RecordKind};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
