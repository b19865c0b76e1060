//! TCP stand-in transport
//!
//! Lets the protocol run against serial-over-IP bridges and simulators.
//! The port identifier is a `host:port` address; the baud rate is ignored.

use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::transport::read_chunk;
use super::{CloseHandle, Connector, Transport, TransportError};

/// Opens TCP connections
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn open(
        &self,
        port: &str,
        _baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let open_err = |reason: String| TransportError::OpenFailed {
            port: port.to_string(),
            reason,
        };

        let addr = port
            .to_socket_addrs()
            .map_err(|e| open_err(e.to_string()))?
            .next()
            .ok_or_else(|| open_err("address resolved to nothing".to_string()))?;

        let stream = TcpStream::connect_timeout(&addr, timeout.max(Duration::from_millis(100)))
            .map_err(|e| open_err(e.to_string()))?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| open_err(e.to_string()))?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(|e| open_err(e.to_string()))?;
        stream.set_nodelay(true).map_err(|e| open_err(e.to_string()))?;

        debug!("tcp: connected to {}", addr);
        Ok(Box::new(TcpTransport::new(stream)))
    }
}

/// TCP stream wrapper implementing [`Transport`]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    cancelled: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Wrap an already-configured stream
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn live_stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        if self.cancelled.load(Ordering::SeqCst) {
            self.stream = None;
        }
        self.stream.as_mut().ok_or(TransportError::Closed)
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        let stream = self.live_stream()?;
        let mut result = read_chunk(stream, max_bytes);
        if self.cancelled.load(Ordering::SeqCst) {
            // Shut down from another thread mid-read
            result = Err(TransportError::Closed);
        }
        if matches!(result, Err(TransportError::Closed)) {
            // Peer hung up
            self.stream = None;
        }
        result
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        let stream = self.live_stream()?;
        stream
            .write_all(bytes)
            .map_err(|e| TransportError::Write(e.to_string()))?;
        stream
            .flush()
            .map_err(|e| TransportError::Write(e.to_string()))?;
        Ok(bytes.len())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some() && !self.cancelled.load(Ordering::SeqCst)
    }

    fn close_handle(&self) -> Result<CloseHandle, TransportError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or(TransportError::Closed)?
            .try_clone()?;
        let cancelled = self.cancelled.clone();
        Ok(CloseHandle::new(move || {
            cancelled.store(true, Ordering::SeqCst);
            // Wakes a blocked read with end-of-stream
            let _ = stream.shutdown(Shutdown::Both);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn test_tcp_transport_exchanges_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).unwrap();
            socket.write_all(&buf).unwrap();
        });

        let mut transport = TcpConnector
            .open(&addr, 0, Duration::from_millis(500))
            .unwrap();
        assert_eq!(transport.write(b"ping").unwrap(), 4);

        let mut received = Vec::new();
        while received.len() < 4 {
            received.extend(transport.read(16).unwrap());
        }
        assert_eq!(received, b"ping");

        server.join().unwrap();
        transport.close();
        assert!(!transport.is_open());
        assert!(matches!(transport.read(1), Err(TransportError::Closed)));
    }

    #[test]
    fn test_close_handle_unblocks_tcp_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            // Hold the connection open, silent, until the client goes away
            while matches!(socket.read(&mut buf), Ok(n) if n > 0) {}
        });

        let mut transport = TcpConnector
            .open(&addr, 0, Duration::from_secs(5))
            .unwrap();
        let handle = transport.close_handle().unwrap();
        let closer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.close();
        });

        let start = std::time::Instant::now();
        assert!(matches!(transport.read(16), Err(TransportError::Closed)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!transport.is_open());
        assert!(matches!(transport.write(b"late"), Err(TransportError::Closed)));

        closer.join().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_tcp_open_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpConnector.open(&addr, 0, Duration::from_millis(200));
        assert!(matches!(result, Err(TransportError::OpenFailed { .. })));
    }
}
