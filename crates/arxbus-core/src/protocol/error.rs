//! Protocol errors
//!
//! Errors are layered the same way the bus is: the frame codec, the transport,
//! and the dispatcher each have their own enum, and each upper layer wraps the
//! one below it.

use std::time::Duration;

use thiserror::Error;

use super::commands::Opcode;
use super::frame::BoardAddress;

/// Errors produced while encoding or decoding frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Address byte outside 0x80–0xFE
    #[error("Invalid board address: {0:#04x}")]
    InvalidAddress(u8),

    /// Board number outside 1–126
    #[error("Invalid board number: {0} (boards are numbered 1-126)")]
    InvalidBoardNumber(u8),

    /// Encoded frame would exceed the frame limit
    #[error("Argument too long: frame would be {frame_len} bytes (max {max})")]
    ArgumentTooLong {
        /// Length the frame would have had
        frame_len: usize,
        /// Frame limit
        max: usize,
    },

    /// Terminator, high-bit or control byte in the arguments
    #[error("Invalid character {byte:#04x} at argument position {position}")]
    InvalidCharacter {
        /// Offset into the argument string
        position: usize,
        /// The offending byte
        byte: u8,
    },

    /// Bytes that do not form a valid frame
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Errors produced by the bus transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// Nothing arrived before the deadline. Not a bus fault.
    #[error("No response within {}ms", .deadline.as_millis())]
    NoResponse {
        /// The deadline that expired
        deadline: Duration,
    },

    /// Partial, oversize or undecodable response
    #[error("Garbled response: {0}")]
    Malformed(FrameError),

    /// The caller's cancellation token fired
    #[error("Transaction cancelled")]
    Cancelled,

    /// A transaction panicked while holding the bus
    #[error("Bus lock poisoned by a panicked transaction")]
    Poisoned,

    /// The serial or TCP link failed
    #[error("Link I/O error: {0}")]
    Link(#[from] std::io::Error),
}

/// Opcode-specific reason carried by a `Failed` negative acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Argument rejected by the board
    InvalidArgument,
    /// Channel number above 15
    ChannelOutOfRange,
    /// I2C bus timeout between the processor and the channel hardware
    DeviceBusError,
    /// I2C device failed to acknowledge
    DeviceNoAck,
    /// Memory slot out of range
    InvalidSlot,
    /// Nothing saved in the memory slot
    NoDataStored,
    /// Non-volatile memory write failed
    WriteFailed,
    /// 1-wire bus error during search
    SensorBusError,
    /// Malformed 1-wire sensor index
    InvalidIndex,
    /// 1-wire sensor index beyond the devices found
    IndexOutOfRange,
    /// No 1-wire devices found by the last search
    NoSensorsAvailable,
    /// At least one 1-wire device did not answer
    PartialReadFailure,
    /// Requested bus address is not usable
    InvalidAddress,
    /// Argument contains a non-hex character
    NonHexArgument,
    /// Board could not switch baud rate
    BaudChangeFailed,
    /// ADC channel not present on the processor
    InvalidAdcChannel,
    /// A reason digit this opcode does not define
    Unspecified(char),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FailureReason::InvalidArgument => "invalid argument",
            FailureReason::ChannelOutOfRange => "channel number out of range",
            FailureReason::DeviceBusError => "I2C bus timeout",
            FailureReason::DeviceNoAck => "I2C device failed to acknowledge",
            FailureReason::InvalidSlot => "memory slot out of range",
            FailureReason::NoDataStored => "no data stored in memory slot",
            FailureReason::WriteFailed => "memory write failed",
            FailureReason::SensorBusError => "error communicating on 1-wire bus",
            FailureReason::InvalidIndex => "invalid sensor index",
            FailureReason::IndexOutOfRange => "sensor index out of range",
            FailureReason::NoSensorsAvailable => "no sensors available",
            FailureReason::PartialReadFailure => "unable to read all sensors",
            FailureReason::InvalidAddress => "invalid address",
            FailureReason::NonHexArgument => "argument contains a non-hex character",
            FailureReason::BaudChangeFailed => "baud rate change failed",
            FailureReason::InvalidAdcChannel => "invalid ADC channel",
            FailureReason::Unspecified(c) => return write!(f, "unspecified failure '{}'", c),
        };
        f.write_str(text)
    }
}

/// Errors surfaced by the command dispatcher and everything built on it
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Rejected locally, the bus was not touched
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The command could not be framed
    #[error("Encoding error: {0}")]
    Encoding(FrameError),

    /// Bad address, board absent, or board failed; the protocol cannot tell which
    #[error("Device {address} unreachable")]
    DeviceUnreachable {
        /// Address the command was sent to
        address: BoardAddress,
    },

    /// The response frame itself was garbled
    #[error("Malformed response: {0}")]
    MalformedResponse(FrameError),

    /// NAK '1'
    #[error("Board did not recognize the command")]
    UnknownCommand,

    /// NAK '2'
    #[error("Board reported the command as too long")]
    CommandTooLong,

    /// NAK '3' with the opcode's reason
    #[error("{opcode} failed: {reason}")]
    CommandFailed {
        /// Command that failed
        opcode: Opcode,
        /// Decoded reason digit
        reason: FailureReason,
    },

    /// A well-formed ACK whose payload does not fit the opcode
    #[error("Malformed {opcode} payload: {detail}")]
    MalformedPayload {
        /// Command that was answered
        opcode: Opcode,
        /// What did not fit
        detail: String,
    },

    /// The caller's cancellation token fired
    #[error("Transaction cancelled")]
    Cancelled,

    /// Link failure or poisoned bus lock
    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl DispatchError {
    /// The board's failure reason, if this is a `CommandFailed`
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            DispatchError::CommandFailed { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Whether the error was raised before anything went on the wire
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            DispatchError::InvalidArgument(_) | DispatchError::Encoding(_)
        )
    }
}

/// Errors loading a bus configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The JSON did not match [`BusConfig`](super::BusConfig)
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
