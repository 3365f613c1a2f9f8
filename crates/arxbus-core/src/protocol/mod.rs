//! ARX Bus Protocol
//!
//! Implements the ASCII command/response protocol spoken by ARX boards on a
//! shared half-duplex RS-485 bus.
//!
//! There are no transaction IDs: a response belongs to whichever command was
//! sent immediately before it. Everything here is built around keeping exactly
//! one command in flight on the bus.

pub mod async_dispatch;
pub mod commands;
pub mod dispatch;
mod error;
pub mod frame;
pub mod link;
pub mod serial;
pub mod transport;

pub use async_dispatch::AsyncDispatcher;
pub use commands::{ArgSchema, Command, MemorySlot, Opcode, PayloadSchema, TimeoutClass};
pub use dispatch::{BoardInfo, Dispatcher, Reply};
pub use error::{ConfigError, DispatchError, FailureReason, FrameError, TransportError};
pub use frame::{encode_command, ArgBuilder, BoardAddress, CommandFrame, NakCode, ResponseFrame};
pub use link::{BusLink, SerialLink, TcpLink};
pub use serial::{clear_buffers, configure_port, list_ports, open_port, PortInfo};
pub use transport::{BusConfig, BusCounters, BusState, BusTransport, Exchange};

/// Default baud rate of ARX boards
pub const DEFAULT_BAUD_RATE: u32 = 19200;

/// Default response deadline in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Deadline for long-running commands (1-wire search) in milliseconds
pub const DEFAULT_LONG_TIMEOUT_MS: u64 = 1000;

/// Quiet period after a broadcast before the next send, in milliseconds
pub const BROADCAST_QUIET_MS: u64 = 100;

/// Maximum frame size, terminator included
pub const MAX_FRAME_LEN: usize = 80;

/// Maximum argument length of a command frame
pub const MAX_ARGS_LEN: usize = MAX_FRAME_LEN - 6;

/// Maximum payload length of an ACK frame
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - 2;

/// Frame terminator (carriage return)
pub const TERMINATOR: u8 = 0x0D;

/// Leading byte of a success response
pub const ACK: u8 = 0x06;

/// Leading byte of a failure response
pub const NAK: u8 = 0x15;

/// Number of signal channels on one board
pub const CHANNEL_COUNT: usize = 16;
