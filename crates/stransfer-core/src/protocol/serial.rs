//! Serial port handling
//!
//! Provides the serial-port transport used on real links.

use serialport::SerialPort;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::transport::read_chunk;
use super::{CloseHandle, Connector, Transport, TransportError};

/// Opens serial ports through the `serialport` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let mut handle = open_port(port, baud_rate, timeout)?;
        configure_port(handle.as_mut())?;
        clear_buffers(handle.as_mut())?;
        debug!("serial: opened {} at {} baud", port, baud_rate);
        Ok(Box::new(SerialTransport {
            name: port.to_string(),
            port: Some(handle),
            cancelled: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// An open serial port
///
/// A serial read cannot be interrupted, so cancellation is a flag checked
/// around every read; it takes effect within one read timeout.
pub struct SerialTransport {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    cancelled: Arc<AtomicBool>,
}

impl SerialTransport {
    fn check_cancelled(&mut self) -> Result<(), TransportError> {
        if self.cancelled.load(Ordering::SeqCst) {
            self.close();
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        self.check_cancelled()?;
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        let chunk = match read_chunk(port, max_bytes) {
            Err(TransportError::Closed) => Vec::new(),
            other => other?,
        };
        self.check_cancelled()?;
        Ok(chunk)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        self.check_cancelled()?;
        let port = self.port.as_mut().ok_or(TransportError::Closed)?;
        port.write_all(bytes)
            .map_err(|e| TransportError::Write(e.to_string()))?;
        port.flush()
            .map_err(|e| TransportError::Write(e.to_string()))?;
        Ok(bytes.len())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("serial: closed {}", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some() && !self.cancelled.load(Ordering::SeqCst)
    }

    fn close_handle(&self) -> Result<CloseHandle, TransportError> {
        let cancelled = self.cancelled.clone();
        Ok(CloseHandle::new(move || cancelled.store(true, Ordering::SeqCst)))
    }
}

/// Open a serial port with the given read timeout
pub fn open_port(
    name: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn SerialPort>, TransportError> {
    serialport::new(name, baud_rate)
        .timeout(timeout)
        .open()
        .map_err(|e| TransportError::OpenFailed {
            port: name.to_string(),
            reason: e.to_string(),
        })
}

/// Configure a serial port for 8N1 without flow control
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), TransportError> {
    let label = port_label(&*port);
    let serial_err = |e: serialport::Error| TransportError::OpenFailed {
        port: label.clone(),
        reason: e.to_string(),
    };

    port.set_data_bits(serialport::DataBits::Eight)
        .map_err(serial_err)?;
    port.set_parity(serialport::Parity::None)
        .map_err(serial_err)?;
    port.set_stop_bits(serialport::StopBits::One)
        .map_err(serial_err)?;
    port.set_flow_control(serialport::FlowControl::None)
        .map_err(serial_err)?;

    // Keep DTR asserted so boards that reset on DTR toggle stay up
    if let Err(e) = port.write_data_terminal_ready(true) {
        warn!("serial: failed to set DTR high: {} (continuing)", e);
    }
    if let Err(e) = port.write_request_to_send(true) {
        warn!("serial: failed to set RTS high: {} (continuing)", e);
    }

    Ok(())
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), TransportError> {
    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| TransportError::Read(e.to_string()))
}

fn port_label(port: &dyn SerialPort) -> String {
    port.name().unwrap_or_else(|| "<unnamed>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_port_fails() {
        let result = SerialConnector.open(
            "/dev/stransfer-does-not-exist",
            38400,
            Duration::from_millis(20),
        );
        match result {
            Err(TransportError::OpenFailed { port, .. }) => {
                assert_eq!(port, "/dev/stransfer-does-not-exist")
            }
            Err(other) => panic!("Expected OpenFailed, got {:?}", other),
            Ok(_) => panic!("Opening a missing device should fail"),
        }
    }
}
