//! In-memory loopback transport
//!
//! Stands in for a remote device in tests, demos and dry runs. A
//! [`LoopbackHandle`] is shared between the test and the transport, so the
//! test can pre-load inbound bytes, script replies and inspect what the
//! session wrote, including from another thread.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

use super::{CloseHandle, Connector, Transport, TransportError};

#[derive(Debug, Default)]
struct LoopbackState {
    /// Bytes waiting to be read by the session
    inbound: VecDeque<u8>,
    /// Replies released into `inbound`, one per write
    replies: VecDeque<Vec<u8>>,
    /// Every write, in order
    written: Vec<Vec<u8>>,
    /// Largest chunk handed out per read (0 = unlimited)
    chunk_size: usize,
    echo: bool,
    fail_writes: bool,
    closed: bool,
    opens: usize,
}

/// Shared control handle for one loopback channel
#[derive(Debug, Clone, Default)]
pub struct LoopbackHandle {
    inner: Arc<(Mutex<LoopbackState>, Condvar)>,
}

impl LoopbackHandle {
    /// Create an empty, open channel
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        self.inner.1.notify_all();
    }

    /// Make bytes available to the next reads
    pub fn preload(&self, bytes: &[u8]) {
        self.state().inbound.extend(bytes.iter().copied());
        self.notify();
    }

    /// Queue bytes delivered after the next unanswered write
    ///
    /// An empty reply models a remote that stays silent for that write.
    pub fn queue_reply(&self, bytes: Vec<u8>) {
        self.state().replies.push_back(bytes);
    }

    /// Echo every write back to the reader
    pub fn set_echo(&self, echo: bool) {
        self.state().echo = echo;
    }

    /// Make every write fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// Split reads into chunks of at most `size` bytes
    pub fn set_chunk_size(&self, size: usize) {
        self.state().chunk_size = size;
    }

    /// All writes seen so far
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    /// Number of writes seen so far
    pub fn write_count(&self) -> usize {
        self.state().written.len()
    }

    /// Bytes not yet read
    pub fn pending_inbound(&self) -> usize {
        self.state().inbound.len()
    }

    /// How many times the channel was opened
    pub fn open_count(&self) -> usize {
        self.state().opens
    }

    /// Close the channel, waking any blocked read
    pub fn close(&self) {
        self.state().closed = true;
        self.notify();
    }

    /// True after `close` until the channel is opened again
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

/// Opens named loopback channels
#[derive(Debug, Clone, Default)]
pub struct LoopbackConnector {
    channels: HashMap<String, LoopbackHandle>,
}

impl LoopbackConnector {
    /// Create a connector with no channels
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel under `name` (builder style)
    pub fn with_channel(mut self, name: &str, handle: LoopbackHandle) -> Self {
        self.add_channel(name, handle);
        self
    }

    /// Register a channel under `name`
    pub fn add_channel(&mut self, name: &str, handle: LoopbackHandle) {
        self.channels.insert(name.to_string(), handle);
    }
}

impl Connector for LoopbackConnector {
    fn open(
        &self,
        port: &str,
        _baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let handle = self
            .channels
            .get(port)
            .cloned()
            .ok_or_else(|| TransportError::OpenFailed {
                port: port.to_string(),
                reason: "no loopback channel with that name".to_string(),
            })?;

        {
            let mut state = handle.state();
            state.closed = false;
            state.opens += 1;
        }

        Ok(Box::new(LoopbackTransport {
            handle,
            timeout,
            open: true,
        }))
    }
}

/// Transport side of a loopback channel
#[derive(Debug)]
pub struct LoopbackTransport {
    handle: LoopbackHandle,
    timeout: Duration,
    open: bool,
}

impl Transport for LoopbackTransport {
    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }

        let (lock, condvar) = &*self.handle.inner;
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let (mut state, _) = condvar
            .wait_timeout_while(guard, self.timeout, |s| s.inbound.is_empty() && !s.closed)
            .unwrap_or_else(|e| e.into_inner());

        if state.closed {
            return Err(TransportError::Closed);
        }

        let mut limit = max_bytes.min(state.inbound.len());
        if state.chunk_size > 0 {
            limit = limit.min(state.chunk_size);
        }
        let chunk: Vec<u8> = state.inbound.drain(..limit).collect();
        trace!("loopback: read {} bytes", chunk.len());
        Ok(chunk)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }

        {
            let mut state = self.handle.state();
            if state.closed {
                return Err(TransportError::Closed);
            }
            if state.fail_writes {
                return Err(TransportError::Write("loopback write failure".to_string()));
            }

            state.written.push(bytes.to_vec());
            if state.echo {
                state.inbound.extend(bytes.iter().copied());
            }
            if let Some(reply) = state.replies.pop_front() {
                state.inbound.extend(reply);
            }
        }
        self.handle.notify();
        Ok(bytes.len())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open && !self.handle.is_closed()
    }

    fn close_handle(&self) -> Result<CloseHandle, TransportError> {
        let handle = self.handle.clone();
        Ok(CloseHandle::new(move || handle.close()))
    }
}
