//! Transfer session
//!
//! Turns an unreliable byte transport into a request/response protocol with
//! a bounded retry budget.
//!
//! Per call the session moves through
//! `Sending -> AwaitingResponse -> Validating` and either finishes or goes to
//! `Retrying` and back to `Sending`. Once the budget is spent the call fails
//! with [`TransferError::RetryExhausted`] and the session returns to `Idle`,
//! ready for the next call.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::trace;

use super::{
    AttemptFailure, ChecksumAlgorithm, CloseHandle, ConfigError, Connector, FrameAssembler, FrameCodec,
    FrameError, SerialConnector, TransferError, TransferResult, Transport, TransportError,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_FRAME_SIZE, DEFAULT_TIMEOUT_SECS,
};
use crate::protocol::frame::MIN_BODY_LEN;
use crate::record::{GlobalRecord, PackageRecord, RecordKind};

/// Bytes requested from the transport per read
const READ_CHUNK: usize = 512;

/// Report at info/warn level when verbose, debug otherwise
macro_rules! diag {
    ($session:expr, $level:ident, $($arg:tt)+) => {
        if $session.config.verbose {
            tracing::$level!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}

/// How `read` obtains a data frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    /// Send a read request each attempt, then wait for the data frame
    #[default]
    Request,
    /// Wait for the remote to push a data frame unsolicited
    Listen,
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Response window per attempt, in seconds
    pub timeout_secs: f64,
    /// Report frames, retries and failures at info/warn level
    pub verbose: bool,
    /// Send/receive attempts per call
    pub max_attempts: u32,
    /// Request or listen for data on `read`
    pub read_mode: ReadMode,
    /// Writes wait for an ack; reads send one
    pub require_ack: bool,
    /// Device identifier used in read requests
    pub device_id: u16,
    /// Channel identifier used in read requests
    pub channel: u8,
    /// Session identifier used in read requests
    pub session_id: u32,
    /// Checksum algorithm for both frame sections
    pub checksum: ChecksumAlgorithm,
    /// Largest accepted frame body
    pub max_frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            verbose: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            read_mode: ReadMode::Request,
            require_ack: true,
            device_id: 0,
            channel: 0,
            session_id: 0,
            checksum: ChecksumAlgorithm::Crc32,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl SessionConfig {
    /// Create a validated configuration with defaults for everything else
    pub fn new(timeout_secs: f64, verbose: bool) -> Result<Self, ConfigError> {
        let config = Self {
            timeout_secs,
            verbose,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeout()?;
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_frame_size < MIN_BODY_LEN {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size must be at least {} bytes",
                MIN_BODY_LEN
            )));
        }
        Ok(())
    }

    /// Response window per attempt
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        if !self.timeout_secs.is_finite() || self.timeout_secs <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "timeout must be a positive number of seconds, got {}",
                self.timeout_secs
            )));
        }
        Duration::try_from_secs_f64(self.timeout_secs).map_err(|_| {
            ConfigError::Invalid(format!("timeout {} is out of range", self.timeout_secs))
        })
    }

    /// Codec matching this configuration
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.checksum, self.max_frame_size)
    }

    /// Load and validate a JSON configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: SessionConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No transport open
    Closed,
    /// Transport open, no call in progress
    Idle,
    /// Writing a frame
    Sending,
    /// Waiting for the remote's frame
    AwaitingResponse,
    /// Checking a received frame
    Validating,
    /// Previous attempt failed, about to send again
    Retrying,
}

/// Cumulative traffic counters since the last `init`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Bytes written
    pub tx_bytes: u64,
    /// Bytes read
    pub rx_bytes: u64,
    /// Frames written
    pub tx_frames: u64,
    /// Valid frames read
    pub rx_frames: u64,
    /// Attempts beyond the first
    pub retries: u64,
    /// Calls that ended in an error
    pub failures: u64,
}

/// Failure of one attempt: either retryable or fatal to the call
#[derive(Debug)]
enum AttemptError {
    Failed(AttemptFailure),
    Fatal(TransportError),
}

impl From<AttemptFailure> for AttemptError {
    fn from(failure: AttemptFailure) -> Self {
        AttemptError::Failed(failure)
    }
}

impl From<FrameError> for AttemptError {
    fn from(err: FrameError) -> Self {
        AttemptError::Failed(AttemptFailure::Frame(err))
    }
}

impl From<TransportError> for AttemptError {
    fn from(err: TransportError) -> Self {
        AttemptError::Fatal(err)
    }
}

/// Request/response transfer session over one transport
pub struct TransferSession<C: Connector = SerialConnector> {
    connector: C,
    config: SessionConfig,
    codec: FrameCodec,
    /// Response window per attempt
    window: Duration,
    transport: Option<Box<dyn Transport>>,
    port_name: Option<String>,
    state: SessionState,
    /// Attempts used by the most recent call
    attempts: u32,
    stats: SessionStats,
}

impl<C: Connector> TransferSession<C> {
    /// Create a session (no transport open yet)
    ///
    /// Fails if `config` does not pass [`SessionConfig::validate`].
    pub fn new(connector: C, config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let window = config.timeout()?;
        let codec = config.codec();
        Ok(Self {
            connector,
            config,
            codec,
            window,
            transport: None,
            port_name: None,
            state: SessionState::Closed,
            attempts: 0,
            stats: SessionStats::default(),
        })
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Traffic counters since the last `init`
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Attempts used by the most recent `read` or `write`
    pub fn last_attempts(&self) -> u32 {
        self.attempts
    }

    /// Port the session was opened on
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    /// True if a transport is open
    pub fn is_open(&self) -> bool {
        self.transport.as_ref().map(|t| t.is_open()).unwrap_or(false)
    }

    /// Handle that cancels a blocked `read` or `write` from another thread
    ///
    /// Take it after `init`; once fired the call in progress fails with
    /// [`TransportError::Closed`] and the session closes.
    pub fn close_handle(&self) -> TransferResult<CloseHandle> {
        let transport = self
            .transport
            .as_ref()
            .ok_or(TransferError::NotInitialized)?;
        Ok(transport.close_handle()?)
    }

    /// Open the transport, closing any previous one first
    ///
    /// `timeout_secs` is the transport read timeout, the polling
    /// granularity inside each attempt's response window.
    pub fn init(&mut self, port: &str, baud_rate: u32, timeout_secs: f64) -> TransferResult<()> {
        self.close();

        let read_timeout = Duration::try_from_secs_f64(timeout_secs)
            .ok()
            .filter(|t| !t.is_zero())
            .ok_or_else(|| TransportError::OpenFailed {
                port: port.to_string(),
                reason: format!("invalid read timeout {}", timeout_secs),
            })?;

        let transport = self
            .connector
            .open(port, baud_rate, read_timeout)
            .inspect_err(|e| diag!(self, warn, "init: {}", e))?;

        diag!(
            self,
            info,
            "init: opened {} at {} baud (read timeout {}ms)",
            port,
            baud_rate,
            read_timeout.as_millis()
        );

        self.transport = Some(transport);
        self.port_name = Some(port.to_string());
        self.stats = SessionStats::default();
        self.attempts = 0;
        self.state = SessionState::Idle;
        Ok(())
    }

    /// Close the transport
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            diag!(
                self,
                info,
                "close: released {}",
                self.port_name.as_deref().unwrap_or("<unknown>")
            );
        }
        self.port_name = None;
        self.state = SessionState::Closed;
    }

    /// Receive one global record and package
    pub fn read(&mut self) -> TransferResult<(GlobalRecord, PackageRecord)> {
        self.with_retries("read", |session, attempt, assembler| {
            if session.config.read_mode == ReadMode::Request {
                let request = GlobalRecord::read_request(
                    session.config.device_id,
                    session.config.channel,
                    session.config.session_id,
                    attempt,
                );
                session.send_control(&request)?;
            }

            match session.await_reply(assembler, RecordKind::ReadRequest) {
                Ok((global, package)) if global.kind == RecordKind::Data => {
                    if session.config.require_ack {
                        session.send_control(&global.ack_for())?;
                    }
                    Ok((global, package))
                }
                Ok((global, _)) => Err(AttemptFailure::Unexpected {
                    expected: RecordKind::Data,
                    got: global.kind,
                }
                .into()),
                Err(AttemptError::Failed(AttemptFailure::Frame(err)))
                    if session.config.read_mode == ReadMode::Listen
                        && session.config.require_ack =>
                {
                    // Ask the sender to retransmit
                    let nack = GlobalRecord::read_request(
                        session.config.device_id,
                        session.config.channel,
                        session.config.session_id,
                        attempt,
                    )
                    .nack_for();
                    session.send_control(&nack)?;
                    Err(AttemptFailure::Frame(err).into())
                }
                Err(err) => Err(err),
            }
        })
    }

    /// Send one global record and package
    pub fn write(&mut self, global: &GlobalRecord, package: &PackageRecord) -> TransferResult<()> {
        if self.transport.is_none() {
            return Err(TransferError::NotInitialized);
        }
        let encoded = self
            .codec
            .encode(global, package)
            .map_err(TransferError::InvalidRecord)?;

        self.with_retries("write", |session, _attempt, assembler| {
            session.send_bytes(&encoded, global)?;
            if !session.config.require_ack {
                return Ok(());
            }

            let (reply, _) = session.await_reply(assembler, RecordKind::Data)?;
            match reply.kind {
                RecordKind::Ack if reply.same_transaction(global) => Ok(()),
                RecordKind::Ack => Err(AttemptFailure::StaleReply {
                    sequence: reply.sequence,
                }
                .into()),
                RecordKind::Nack => Err(AttemptFailure::Rejected.into()),
                other => Err(AttemptFailure::Unexpected {
                    expected: RecordKind::Ack,
                    got: other,
                }
                .into()),
            }
        })
    }

    /// Run `attempt` until it succeeds, fails fatally or the budget is spent
    fn with_retries<T, F>(&mut self, operation: &'static str, mut attempt: F) -> TransferResult<T>
    where
        F: FnMut(&mut Self, u32, &mut FrameAssembler) -> Result<T, AttemptError>,
    {
        if self.transport.is_none() {
            return Err(TransferError::NotInitialized);
        }

        let max_attempts = self.config.max_attempts;
        let mut assembler = FrameAssembler::new(self.codec);
        let mut last_failure = None;
        self.attempts = 0;

        for n in 1..=max_attempts {
            self.attempts = n;
            if let Some(failure) = &last_failure {
                self.state = SessionState::Retrying;
                self.stats.retries += 1;
                diag!(
                    self,
                    warn,
                    "{}: retry {}/{} after {}",
                    operation,
                    n,
                    max_attempts,
                    failure
                );
            }

            match attempt(self, n, &mut assembler) {
                Ok(value) => {
                    self.state = SessionState::Idle;
                    diag!(self, info, "{}: done after {} attempt(s)", operation, n);
                    return Ok(value);
                }
                Err(AttemptError::Failed(failure)) => {
                    diag!(self, warn, "{}: attempt {} failed: {}", operation, n, failure);
                    last_failure = Some(failure);
                }
                Err(AttemptError::Fatal(err)) => {
                    self.stats.failures += 1;
                    diag!(self, warn, "{}: transport failure: {}", operation, err);
                    if matches!(err, TransportError::Closed) {
                        self.close();
                    } else {
                        self.state = SessionState::Idle;
                    }
                    return Err(err.into());
                }
            }
        }

        self.state = SessionState::Idle;
        self.stats.failures += 1;
        let last = last_failure.unwrap_or(AttemptFailure::Timeout { waited_ms: 0 });
        diag!(
            self,
            warn,
            "{}: retry budget exhausted after {} attempts: {}",
            operation,
            max_attempts,
            last
        );
        Err(TransferError::RetryExhausted {
            attempts: max_attempts,
            last,
        })
    }

    fn transport_mut(&mut self) -> Result<&mut Box<dyn Transport>, TransportError> {
        self.transport.as_mut().ok_or(TransportError::Closed)
    }

    /// Encode and send a frame with an empty package
    fn send_control(&mut self, global: &GlobalRecord) -> Result<(), AttemptError> {
        let bytes = self.codec.encode(global, &PackageRecord::empty())?;
        self.send_bytes(&bytes, global)
    }

    fn send_bytes(&mut self, bytes: &[u8], global: &GlobalRecord) -> Result<(), AttemptError> {
        self.state = SessionState::Sending;
        let written = self.transport_mut()?.write(bytes)?;
        self.stats.tx_bytes = self.stats.tx_bytes.saturating_add(written as u64);
        self.stats.tx_frames = self.stats.tx_frames.saturating_add(1);
        diag!(
            self,
            info,
            "-> {:?} frame seq={} ({} bytes)",
            global.kind,
            global.sequence,
            written
        );
        Ok(())
    }

    /// Wait one response window for a frame, skipping frames of kind `ignore`
    fn await_reply(
        &mut self,
        assembler: &mut FrameAssembler,
        ignore: RecordKind,
    ) -> Result<(GlobalRecord, PackageRecord), AttemptError> {
        self.state = SessionState::AwaitingResponse;
        let window = self.window;
        let started = Instant::now();

        loop {
            while let Some(result) = assembler.next_frame() {
                self.state = SessionState::Validating;
                let (global, package) = result?;
                self.stats.rx_frames = self.stats.rx_frames.saturating_add(1);
                if global.kind == ignore {
                    trace!("skipping {:?} frame seq={}", global.kind, global.sequence);
                    self.state = SessionState::AwaitingResponse;
                    continue;
                }
                diag!(
                    self,
                    info,
                    "<- {:?} frame seq={} package={} bytes",
                    global.kind,
                    global.sequence,
                    package.len()
                );
                return Ok((global, package));
            }

            if started.elapsed() >= window {
                let failure = match assembler.pending_error() {
                    Some(err) => {
                        assembler.skip_stalled();
                        AttemptFailure::Frame(err)
                    }
                    None => AttemptFailure::Timeout {
                        waited_ms: window.as_millis() as u64,
                    },
                };
                return Err(failure.into());
            }

            let chunk = self.transport_mut()?.read(READ_CHUNK)?;
            if !chunk.is_empty() {
                trace!("read {} bytes: {:02x?}", chunk.len(), chunk);
                self.stats.rx_bytes = self.stats.rx_bytes.saturating_add(chunk.len() as u64);
                assembler.push(&chunk);
            }
        }
    }
}

impl<C: Connector> Drop for TransferSession<C> {
    fn drop(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LoopbackConnector;

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.read_mode, ReadMode::Request);
        assert!(config.require_ack);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_config_rejects_bad_values() {
        assert!(SessionConfig::new(0.0, false).is_err());
        assert!(SessionConfig::new(-1.0, false).is_err());
        assert!(SessionConfig::new(f64::NAN, false).is_err());

        let config = SessionConfig {
            max_attempts: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = SessionConfig {
            max_frame_size: 8,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_conversion() {
        let config = SessionConfig::new(0.25, true).unwrap();
        assert_eq!(config.timeout().unwrap(), Duration::from_millis(250));
        assert!(config.verbose);
    }

    #[test]
    fn test_calls_before_init_fail() {
        let mut session =
            TransferSession::new(LoopbackConnector::new(), SessionConfig::default()).unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.read(), Err(TransferError::NotInitialized)));

        let package = PackageRecord::new(vec![1, 2, 3]);
        let global = GlobalRecord::for_package(1, 0, 0, 1, &package);
        assert!(matches!(
            session.write(&global, &package),
            Err(TransferError::NotInitialized)
        ));
        assert_eq!(session.last_attempts(), 0);
    }

    #[test]
    fn test_init_unknown_port_fails() {
        let mut session =
            TransferSession::new(LoopbackConnector::new(), SessionConfig::default()).unwrap();
        let err = session.init("LOOP0", 38400, 0.02).unwrap_err();
        assert!(matches!(
            err,
            TransferError::Transport(TransportError::OpenFailed { .. })
        ));
        assert!(!session.is_open());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = SessionConfig {
            timeout_secs: -1.0,
            ..SessionConfig::default()
        };
        assert!(matches!(
            TransferSession::new(LoopbackConnector::new(), config),
            Err(ConfigError::Invalid(_))
        ));

        let config = SessionConfig {
            max_attempts: 0,
            ..SessionConfig::default()
        };
        assert!(TransferSession::new(LoopbackConnector::new(), config).is_err());

        let config = SessionConfig {
            timeout_secs: 1e30,
            ..SessionConfig::default()
        };
        assert!(matches!(config.timeout(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_close_handle_requires_init() {
        let session =
            TransferSession::new(LoopbackConnector::new(), SessionConfig::default()).unwrap();
        assert!(matches!(
            session.close_handle(),
            Err(TransferError::NotInitialized)
        ));
    }

    #[test]
    fn test_codec_follows_config() {
        let config = SessionConfig {
            checksum: ChecksumAlgorithm::Xor,
            max_frame_size: 1024,
            ..SessionConfig::default()
        };
        let codec = config.codec();
        assert_eq!(codec.checksum(), ChecksumAlgorithm::Xor);
        assert_eq!(codec.max_frame_size(), 1024);
    }

    #[test]
    fn test_init_rejects_zero_read_timeout() {
        let mut session =
            TransferSession::new(LoopbackConnector::new(), SessionConfig::default()).unwrap();
        assert!(session.init("LOOP0", 38400, 0.0).is_err());
        assert!(session.init("LOOP0", 38400, f64::INFINITY).is_err());
    }
}
