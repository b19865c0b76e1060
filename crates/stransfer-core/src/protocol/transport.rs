//! Byte channel abstraction
//!
//! The session never touches a device directly. It asks a [`Connector`] to
//! open a [`Transport`] and then only reads and writes bytes, so serial
//! ports, TCP sockets and in-memory loopbacks are interchangeable.
//!
//! A blocked read is cancelled from another thread through a
//! [`CloseHandle`] taken from the transport beforehand.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::TransportError;

/// An open byte channel
pub trait Transport: Send {
    /// Read up to `max_bytes`.
    ///
    /// Blocks for at most the timeout given at open time. An empty vector
    /// means the timeout elapsed with no data.
    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError>;

    /// Write all of `bytes`, returning the number written
    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Release the channel; further reads and writes fail
    fn close(&mut self);

    /// True until `close` is called or the channel is lost
    fn is_open(&self) -> bool;

    /// Handle that closes this transport from another thread
    ///
    /// After it fires, reads and writes fail with [`TransportError::Closed`]
    /// no later than one read timeout.
    fn close_handle(&self) -> Result<CloseHandle, TransportError>;
}

/// Closes a transport from outside the thread using it
#[derive(Clone)]
pub struct CloseHandle {
    close: Arc<dyn Fn() + Send + Sync>,
}

impl CloseHandle {
    /// Wrap the action that shuts the transport down
    pub fn new<F>(close: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            close: Arc::new(close),
        }
    }

    /// Close the transport; calling it again is harmless
    pub fn close(&self) {
        (self.close)()
    }
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHandle").finish_non_exhaustive()
    }
}

/// Factory for transports
pub trait Connector {
    /// Open `port` at `baud_rate` with the given read timeout
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

impl<C: Connector + ?Sized> Connector for Box<C> {
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError> {
        (**self).open(port, baud_rate, timeout)
    }
}

/// Map a blocking read result onto the transport contract
///
/// `TimedOut`/`WouldBlock` become an empty read; anything else is an error.
pub(crate) fn read_chunk<R: std::io::Read + ?Sized>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Vec<u8>, TransportError> {
    let mut buffer = vec![0u8; max_bytes];
    match reader.read(&mut buffer) {
        Ok(0) => Err(TransportError::Closed),
        Ok(n) => {
            buffer.truncate(n);
            Ok(buffer)
        }
        Err(ref e)
            if e.kind() == std::io::ErrorKind::TimedOut
                || e.kind() == std::io::ErrorKind::WouldBlock =>
        {
            Ok(Vec::new())
        }
        Err(e) => Err(TransportError::Read(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    struct TimingOut;

    impl io::Read for TimingOut {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
        }
    }

    #[test]
    fn test_close_handle_runs_action_from_clones() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = CloseHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let clone = handle.clone();
        std::thread::spawn(move || clone.close()).join().unwrap();
        handle.close();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_read_chunk_timeout_is_empty() {
        let chunk = read_chunk(&mut TimingOut, 16).unwrap();
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_read_chunk_truncates() {
        let mut data: &[u8] = &[1, 2, 3];
        assert_eq!(read_chunk(&mut data, 16).unwrap(), vec![1, 2, 3]);
        assert!(matches!(read_chunk(&mut data, 16), Err(TransportError::Closed)));
    }
}
