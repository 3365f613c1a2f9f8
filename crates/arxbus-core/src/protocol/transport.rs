//! Bus transport
//!
//! Owns the link and runs the per-bus state machine:
//!
//! ```text
//! Idle → Sending → AwaitingResponse → Idle | Failed
//!              ↘ BroadcastQuiet → Idle
//! ```
//!
//! The whole send/await cycle runs under one mutex guard, so at most one
//! command is ever outstanding and a response can always be attributed to the
//! command sent right before it.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::link::{BusLink, SerialLink};
use super::serial::{clear_buffers, configure_port, open_port};
use super::{
    ConfigError, FrameError, ResponseFrame, TransportError, BROADCAST_QUIET_MS, DEFAULT_BAUD_RATE,
    DEFAULT_LONG_TIMEOUT_MS, DEFAULT_TIMEOUT_MS, MAX_FRAME_LEN, TERMINATOR,
};

/// Byte written to rouse sleeping boards; never the start of a frame
pub const WAKE_FILLER: u8 = 0x00;

const BROADCAST_BYTE: u8 = 0x80;

/// Bus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Default response deadline in milliseconds
    pub response_timeout_ms: u64,
    /// Deadline for long-running commands in milliseconds
    pub long_timeout_ms: u64,
    /// Base deadline for reading 1-wire temperatures in milliseconds
    pub onewire_base_timeout_ms: u64,
    /// Additional 1-wire temperature deadline per device in milliseconds
    pub onewire_per_device_ms: u64,
    /// Quiet period after a broadcast in milliseconds
    pub broadcast_quiet_ms: u64,
    /// Idle time after which boards may be asleep; `None` disables wake-up
    pub wake_idle_threshold_ms: Option<u64>,
    /// Delay between the wake-up byte and the real frame in milliseconds
    pub wake_settle_ms: u64,
    /// Receive polling interval in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            response_timeout_ms: DEFAULT_TIMEOUT_MS,
            long_timeout_ms: DEFAULT_LONG_TIMEOUT_MS,
            onewire_base_timeout_ms: 200,
            onewire_per_device_ms: 60,
            broadcast_quiet_ms: BROADCAST_QUIET_MS,
            wake_idle_threshold_ms: Some(5000),
            wake_settle_ms: 10,
            poll_interval_ms: 2,
        }
    }
}

impl BusConfig {
    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Default response deadline
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Deadline for long-running commands
    pub fn long_timeout(&self) -> Duration {
        Duration::from_millis(self.long_timeout_ms)
    }

    /// Deadline for reading `sensor_count` 1-wire temperatures
    pub fn onewire_timeout(&self, sensor_count: u8) -> Duration {
        Duration::from_millis(
            self.onewire_base_timeout_ms + self.onewire_per_device_ms * sensor_count as u64,
        )
    }

    /// Quiet period after a broadcast
    pub fn broadcast_quiet(&self) -> Duration {
        Duration::from_millis(self.broadcast_quiet_ms)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusState {
    /// No transaction in flight
    Idle,
    /// Writing a frame
    Sending,
    /// Waiting for a response
    AwaitingResponse,
    /// Waiting out the quiet period after a broadcast
    BroadcastQuiet,
    /// The link reported an I/O error; cleared on the next transaction
    Failed,
}

impl BusState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => BusState::Sending,
            2 => BusState::AwaitingResponse,
            3 => BusState::BroadcastQuiet,
            4 => BusState::Failed,
            _ => BusState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            BusState::Idle => 0,
            BusState::Sending => 1,
            BusState::AwaitingResponse => 2,
            BusState::BroadcastQuiet => 3,
            BusState::Failed => 4,
        }
    }
}

/// Outcome of a successful transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    /// A complete response frame
    Response(ResponseFrame),
    /// Sent to one board; no response is expected
    Sent,
    /// Sent to every board; nobody answers
    Broadcast,
}

/// Cumulative traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusCounters {
    /// Frames written, wake bytes excluded
    pub frames_sent: u64,
    /// Bytes written, wake bytes included
    pub bytes_sent: u64,
    /// Complete response frames read
    pub frames_received: u64,
    /// Bytes read, partial responses included
    pub bytes_received: u64,
    /// Transactions that ended in `NoResponse`
    pub timeouts: u64,
    /// Wake bytes written
    pub wakeups: u64,
}

struct BusInner {
    link: Box<dyn BusLink>,
    last_activity: Option<Instant>,
    counters: BusCounters,
}

/// Exclusive owner of the bus link
///
/// Share it between dispatchers and sessions with an `Arc`; every
/// transaction locks the whole bus for its full duration.
pub struct BusTransport {
    inner: Mutex<BusInner>,
    config: BusConfig,
    state: AtomicU8,
    epoch: Instant,
    /// Milliseconds since `epoch` until which the bus must stay quiet (0 = none)
    quiet_until_ms: AtomicU64,
}

impl BusTransport {
    /// Create a transport over an already-open link
    pub fn new(link: Box<dyn BusLink>, config: BusConfig) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                link,
                last_activity: None,
                counters: BusCounters::default(),
            }),
            config,
            state: AtomicU8::new(BusState::Idle.as_u8()),
            epoch: Instant::now(),
            quiet_until_ms: AtomicU64::new(0),
        }
    }

    /// Open and configure the serial port named in the configuration
    pub fn open(config: BusConfig) -> Result<Self, TransportError> {
        let mut port = open_port(&config.port_name, Some(config.baud_rate))?;
        configure_port(port.as_mut())?;
        clear_buffers(port.as_mut())?;
        Ok(Self::new(Box::new(SerialLink::new(port)), config))
    }

    /// Configuration the transport was built with
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Current state (does not block on an in-flight transaction)
    pub fn state(&self) -> BusState {
        let state = BusState::from_u8(self.state.load(Ordering::Acquire));
        if state == BusState::BroadcastQuiet && self.quiet_remaining().is_none() {
            return BusState::Idle;
        }
        state
    }

    /// Traffic counters (waits for any in-flight transaction)
    pub fn counters(&self) -> Result<BusCounters, TransportError> {
        let inner = self.inner.lock().map_err(|_| TransportError::Poisoned)?;
        Ok(inner.counters)
    }

    fn set_state(&self, state: BusState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn quiet_remaining(&self) -> Option<Duration> {
        let until = self.quiet_until_ms.load(Ordering::Acquire);
        if until == 0 {
            return None;
        }
        let now = self.epoch.elapsed().as_millis() as u64;
        (until > now).then(|| Duration::from_millis(until - now))
    }

    /// Send one encoded frame and, if `deadline` is given, wait for its
    /// response
    ///
    /// Frames addressed to the broadcast address never wait; the bus is held
    /// quiet for the configured period before the next transaction starts.
    /// `NoResponse` means nothing arrived before the deadline; the transport
    /// is idle again and ready for the next command.
    pub fn transact(
        &self,
        frame: &[u8],
        deadline: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Exchange, TransportError> {
        let mut guard = self.inner.lock().map_err(|_| TransportError::Poisoned)?;
        let inner = &mut *guard;

        if cancel.is_some_and(|token| token.is_cancelled()) {
            return Err(TransportError::Cancelled);
        }

        if let Some(remaining) = self.quiet_remaining() {
            trace!("waiting {}ms for broadcast quiet period", remaining.as_millis());
            self.set_state(BusState::BroadcastQuiet);
            let waited = self.wait(remaining, cancel);
            self.set_state(BusState::Idle);
            waited?;
        }
        self.quiet_until_ms.store(0, Ordering::Release);

        let result = self.run(inner, frame, deadline, cancel);
        match &result {
            Ok(Exchange::Broadcast) => {
                let until = self.epoch.elapsed() + self.config.broadcast_quiet();
                self.quiet_until_ms
                    .store((until.as_millis() as u64).max(1), Ordering::Release);
                self.set_state(BusState::BroadcastQuiet);
            }
            Ok(_) => self.set_state(BusState::Idle),
            Err(TransportError::Link(e)) => {
                warn!("bus link failed: {}", e);
                self.set_state(BusState::Failed);
            }
            Err(err) => {
                // Never let a partial frame leak into the next transaction
                if let Err(e) = inner.link.clear_input_buffer() {
                    warn!("failed to discard input after {}: {}", err, e);
                    self.set_state(BusState::Failed);
                } else {
                    self.set_state(BusState::Idle);
                }
            }
        }
        result
    }

    fn run(
        &self,
        inner: &mut BusInner,
        frame: &[u8],
        deadline: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Exchange, TransportError> {
        if self.state() == BusState::Failed {
            debug!("recovering link after failure");
            inner.link.clear_output_buffer()?;
        }
        inner.link.clear_input_buffer()?;

        self.wake_if_idle(inner, cancel)?;

        self.set_state(BusState::Sending);
        trace!("tx {:02x?}", frame);
        inner.link.write_all(frame)?;
        inner.link.flush()?;
        inner.last_activity = Some(Instant::now());
        inner.counters.frames_sent += 1;
        inner.counters.bytes_sent += frame.len() as u64;

        if frame.first() == Some(&BROADCAST_BYTE) {
            debug!("broadcast sent, not awaiting a response");
            return Ok(Exchange::Broadcast);
        }
        let Some(deadline) = deadline else {
            return Ok(Exchange::Sent);
        };

        self.set_state(BusState::AwaitingResponse);
        let response = self.read_response(inner, deadline, cancel);
        inner.last_activity = Some(Instant::now());
        match response {
            Ok(frame) => {
                inner.counters.frames_received += 1;
                Ok(Exchange::Response(frame))
            }
            Err(TransportError::NoResponse { deadline }) => {
                inner.counters.timeouts += 1;
                debug!("no response within {}ms", deadline.as_millis());
                Err(TransportError::NoResponse { deadline })
            }
            Err(e) => Err(e),
        }
    }

    /// Write the filler byte if the bus has been idle long enough for the
    /// boards to fall asleep
    fn wake_if_idle(
        &self,
        inner: &mut BusInner,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), TransportError> {
        let Some(threshold_ms) = self.config.wake_idle_threshold_ms else {
            return Ok(());
        };
        let idle = inner
            .last_activity
            .map_or(true, |t| t.elapsed() > Duration::from_millis(threshold_ms));
        if !idle {
            return Ok(());
        }

        debug!("bus idle, sending wake-up byte");
        self.set_state(BusState::Sending);
        inner.link.write_all(&[WAKE_FILLER])?;
        inner.link.flush()?;
        inner.counters.wakeups += 1;
        inner.counters.bytes_sent += 1;
        self.wait(Duration::from_millis(self.config.wake_settle_ms), cancel)
    }

    /// Poll the link until a terminator arrives or the deadline passes
    fn read_response(
        &self,
        inner: &mut BusInner,
        deadline: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<ResponseFrame, TransportError> {
        let poll_interval = self.config.poll_interval();
        let start = Instant::now();
        let mut response: Vec<u8> = Vec::with_capacity(MAX_FRAME_LEN);
        let mut buffer = [0u8; 128];

        loop {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                debug!("cancelled with {} bytes buffered", response.len());
                return Err(TransportError::Cancelled);
            }

            let available = inner.link.bytes_to_read()?;
            if available > 0 {
                let to_read = std::cmp::min(available as usize, buffer.len());
                match inner.link.read(&mut buffer[..to_read]) {
                    Ok(0) => std::thread::sleep(poll_interval),
                    Ok(n) => {
                        response.extend_from_slice(&buffer[..n]);
                        inner.counters.bytes_received += n as u64;
                        if let Some(end) = response.iter().position(|&b| b == TERMINATOR) {
                            trace!(
                                "rx {:02x?} after {}ms",
                                &response[..=end],
                                start.elapsed().as_millis()
                            );
                            // Anything after the terminator is discarded
                            // before the next send.
                            return ResponseFrame::from_bytes(&response[..=end])
                                .map_err(TransportError::Malformed);
                        }
                        if response.len() >= MAX_FRAME_LEN {
                            return Err(TransportError::Malformed(FrameError::Malformed(
                                format!("no terminator within {} bytes", response.len()),
                            )));
                        }
                    }
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::TimedOut
                            || e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(TransportError::Link(e)),
                }
                continue;
            }

            let elapsed = start.elapsed();
            if elapsed >= deadline {
                if response.is_empty() {
                    return Err(TransportError::NoResponse { deadline });
                }
                return Err(TransportError::Malformed(FrameError::Malformed(format!(
                    "incomplete frame ({} bytes) at deadline",
                    response.len()
                ))));
            }
            std::thread::sleep(std::cmp::min(poll_interval, deadline - elapsed));
        }
    }

    /// Sleep for `duration`, waking early only to honour cancellation
    fn wait(
        &self,
        duration: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), TransportError> {
        let Some(token) = cancel else {
            std::thread::sleep(duration);
            return Ok(());
        };
        let end = Instant::now() + duration;
        let slice = self.config.poll_interval();
        loop {
            if token.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let now = Instant::now();
            if now >= end {
                return Ok(());
            }
            std::thread::sleep(std::cmp::min(slice, end - now));
        }
    }
}
