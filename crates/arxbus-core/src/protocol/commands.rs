//! Protocol commands
//!
//! The opcode registry: every command the ARX firmware understands, with the
//! shape of its arguments, the shape of its ACK payload, how long to wait for
//! it, and what each `Failed` reason digit means for it.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::frame::{ArgBuilder, BoardAddress};
use super::{DispatchError, FailureReason, CHANNEL_COUNT, MAX_ARGS_LEN};

/// Opcodes understood by ARX boards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    /// Board serial number, firmware version, input coupling, sensor count ('ARXN')
    BoardInfo,
    /// Echo the argument back ('ECHO')
    Echo,
    /// Reset the processor; never answered ('RSET')
    Reset,
    /// The last command the board received ('LAST')
    LastCommand,
    /// Board clock in seconds ('GTIM')
    GetTime,
    /// Set the board clock ('STIM')
    SetTime,
    /// Change bus address and baud rate ('COMM')
    SetComm,
    /// Processor ADC reading ('ANLG')
    Analog,
    /// Processor temperature, 0.1 °C units ('TEMP')
    ChipTemp,
    /// Set one channel's configuration ('SETC')
    SetChannel,
    /// Get one channel's configuration ('GETC')
    GetChannel,
    /// Set every channel to the same configuration ('SETA')
    SetAll,
    /// Set every channel individually ('SETS')
    SetEach,
    /// Get every channel's configuration ('GETA')
    GetAll,
    /// Load the configuration stored in a memory slot ('LOAD')
    Load,
    /// Save the current configuration to a memory slot ('SAVE')
    Save,
    /// RF power detector reading for one channel ('POWC')
    ChannelPower,
    /// RF power detector readings for all channels ('POWA')
    AllPower,
    /// Input current reading for one channel ('CURC')
    ChannelCurrent,
    /// Input current readings for all channels ('CURA')
    AllCurrent,
    /// Board supply current ('CURB')
    BoardCurrent,
    /// Search the 1-wire bus ('OWSE')
    OneWireSearch,
    /// Device count from the last search ('OWDC')
    OneWireCount,
    /// Serial number of one 1-wire device ('OWSN')
    OneWireSerial,
    /// Temperatures of all 1-wire devices ('OWTE')
    OneWireTemps,
}

/// How long the dispatcher waits for an opcode's response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// The bus default response deadline
    Normal,
    /// The configured long deadline
    Long,
    /// A base deadline plus an allowance per 1-wire device
    PerDevice,
    /// No response is ever sent
    NoResponse,
}

/// Shape of the argument string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSchema {
    /// No arguments at all
    None,
    /// Only hex digits, with one of the listed total lengths
    Hex(&'static [usize]),
    /// Exactly this many decimal digits
    Digits(usize),
    /// Printable text up to this length
    Text(usize),
}

impl ArgSchema {
    /// Check a serialized argument string against this schema
    pub fn validate(&self, args: &str) -> Result<(), String> {
        match self {
            ArgSchema::None if args.is_empty() => Ok(()),
            ArgSchema::None => Err(format!("takes no arguments, got {:?}", args)),
            ArgSchema::Hex(lengths) => {
                if !lengths.contains(&args.len()) {
                    return Err(format!(
                        "expected {:?} hex digits, got {}",
                        lengths,
                        args.len()
                    ));
                }
                if !args.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(format!("non-hex character in {:?}", args));
                }
                Ok(())
            }
            ArgSchema::Digits(n) => {
                if args.len() != *n || !args.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(format!("expected {} decimal digit(s), got {:?}", n, args));
                }
                Ok(())
            }
            ArgSchema::Text(max) => {
                if args.len() > *max {
                    return Err(format!("text is {} characters (max {})", args.len(), max));
                }
                if !args.bytes().all(|b| (0x20..=0x7E).contains(&b)) {
                    return Err("text must be printable ASCII".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Shape of the ACK payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSchema {
    /// The command is never answered
    NoResponse,
    /// ACK with nothing after it
    Empty,
    /// Exactly this many hex digits
    Hex(usize),
    /// A fixed number of fixed-width hex fields
    HexRepeat {
        /// Digits per field
        width: usize,
        /// Number of fields
        count: usize,
    },
    /// Any number (including zero) of fixed-width hex fields
    HexEach {
        /// Digits per field
        width: usize,
    },
    /// Opaque text
    Text,
}

impl Opcode {
    /// Every opcode in the registry
    pub const ALL: [Opcode; 25] = [
        Opcode::BoardInfo,
        Opcode::Echo,
        Opcode::Reset,
        Opcode::LastCommand,
        Opcode::GetTime,
        Opcode::SetTime,
        Opcode::SetComm,
        Opcode::Analog,
        Opcode::ChipTemp,
        Opcode::SetChannel,
        Opcode::GetChannel,
        Opcode::SetAll,
        Opcode::SetEach,
        Opcode::GetAll,
        Opcode::Load,
        Opcode::Save,
        Opcode::ChannelPower,
        Opcode::AllPower,
        Opcode::ChannelCurrent,
        Opcode::AllCurrent,
        Opcode::BoardCurrent,
        Opcode::OneWireSearch,
        Opcode::OneWireCount,
        Opcode::OneWireSerial,
        Opcode::OneWireTemps,
    ];

    /// The 4-character code sent on the wire
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::BoardInfo => "ARXN",
            Opcode::Echo => "ECHO",
            Opcode::Reset => "RSET",
            Opcode::LastCommand => "LAST",
            Opcode::GetTime => "GTIM",
            Opcode::SetTime => "STIM",
            Opcode::SetComm => "COMM",
            Opcode::Analog => "ANLG",
            Opcode::ChipTemp => "TEMP",
            Opcode::SetChannel => "SETC",
            Opcode::GetChannel => "GETC",
            Opcode::SetAll => "SETA",
            Opcode::SetEach => "SETS",
            Opcode::GetAll => "GETA",
            Opcode::Load => "LOAD",
            Opcode::Save => "SAVE",
            Opcode::ChannelPower => "POWC",
            Opcode::AllPower => "POWA",
            Opcode::ChannelCurrent => "CURC",
            Opcode::AllCurrent => "CURA",
            Opcode::BoardCurrent => "CURB",
            Opcode::OneWireSearch => "OWSE",
            Opcode::OneWireCount => "OWDC",
            Opcode::OneWireSerial => "OWSN",
            Opcode::OneWireTemps => "OWTE",
        }
    }

    /// Look up an opcode by its wire code (case-insensitive)
    pub fn from_mnemonic(code: &[u8]) -> Option<Opcode> {
        if code.len() != 4 {
            return None;
        }
        Opcode::ALL
            .into_iter()
            .find(|op| op.mnemonic().as_bytes().eq_ignore_ascii_case(code))
    }

    /// Check if this command expects a response
    pub fn expects_response(&self) -> bool {
        !matches!(self, Opcode::Reset)
    }

    /// Pure queries: the only effect is the data in the reply, so a
    /// broadcast copy of one can never do anything
    pub fn is_query(&self) -> bool {
        !matches!(
            self.payload_schema(),
            PayloadSchema::NoResponse | PayloadSchema::Empty
        ) && *self != Opcode::OneWireSearch
    }

    /// Deadline class used to pick the response timeout
    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            Opcode::Reset => TimeoutClass::NoResponse,
            Opcode::OneWireSearch => TimeoutClass::Long,
            Opcode::OneWireTemps => TimeoutClass::PerDevice,
            _ => TimeoutClass::Normal,
        }
    }

    /// Shape of the argument string
    pub fn arg_schema(&self) -> ArgSchema {
        match self {
            Opcode::Echo => ArgSchema::Text(MAX_ARGS_LEN),
            Opcode::SetTime => ArgSchema::Hex(&[8]),
            Opcode::SetComm => ArgSchema::Hex(&[2, 6]),
            Opcode::Analog => ArgSchema::Hex(&[2]),
            Opcode::SetChannel => ArgSchema::Hex(&[5]),
            Opcode::GetChannel
            | Opcode::ChannelPower
            | Opcode::ChannelCurrent
            | Opcode::OneWireSerial => ArgSchema::Hex(&[1]),
            Opcode::SetAll => ArgSchema::Hex(&[4]),
            Opcode::SetEach => ArgSchema::Hex(&[4 * CHANNEL_COUNT]),
            Opcode::Load | Opcode::Save => ArgSchema::Digits(1),
            _ => ArgSchema::None,
        }
    }

    /// Shape of the ACK payload
    pub fn payload_schema(&self) -> PayloadSchema {
        match self {
            Opcode::Reset => PayloadSchema::NoResponse,
            Opcode::BoardInfo => PayloadSchema::Hex(14),
            Opcode::Echo | Opcode::LastCommand => PayloadSchema::Text,
            Opcode::GetTime => PayloadSchema::Hex(8),
            Opcode::Analog
            | Opcode::ChipTemp
            | Opcode::GetChannel
            | Opcode::ChannelPower
            | Opcode::ChannelCurrent
            | Opcode::BoardCurrent => PayloadSchema::Hex(4),
            Opcode::GetAll | Opcode::AllPower | Opcode::AllCurrent => PayloadSchema::HexRepeat {
                width: 4,
                count: CHANNEL_COUNT,
            },
            Opcode::OneWireSearch | Opcode::OneWireCount => PayloadSchema::Hex(2),
            Opcode::OneWireSerial => PayloadSchema::Hex(16),
            Opcode::OneWireTemps => PayloadSchema::HexEach { width: 4 },
            Opcode::SetTime
            | Opcode::SetComm
            | Opcode::SetChannel
            | Opcode::SetAll
            | Opcode::SetEach
            | Opcode::Load
            | Opcode::Save => PayloadSchema::Empty,
        }
    }

    /// Meaning of a `Failed` reason digit for this opcode
    pub fn failure_reason(&self, reason: char) -> FailureReason {
        use FailureReason::*;

        let mapped = match (self, reason) {
            (Opcode::SetChannel | Opcode::GetChannel, '1') => Some(InvalidArgument),
            (Opcode::SetChannel | Opcode::GetChannel, '2') => Some(ChannelOutOfRange),
            (Opcode::SetAll | Opcode::SetEach, '1') => Some(InvalidArgument),
            (
                Opcode::SetChannel
                | Opcode::GetChannel
                | Opcode::SetAll
                | Opcode::SetEach
                | Opcode::GetAll
                | Opcode::Load,
                '3',
            ) => Some(DeviceBusError),
            (
                Opcode::SetChannel
                | Opcode::GetChannel
                | Opcode::SetAll
                | Opcode::SetEach
                | Opcode::GetAll
                | Opcode::Load,
                '4',
            ) => Some(DeviceNoAck),
            (Opcode::Load | Opcode::Save, '1') => Some(InvalidSlot),
            (Opcode::Load, '2') => Some(NoDataStored),
            (Opcode::Save, '2') => Some(WriteFailed),
            (Opcode::OneWireSearch, '1') => Some(SensorBusError),
            (Opcode::OneWireSerial, '1') => Some(InvalidIndex),
            (Opcode::OneWireSerial, '2') => Some(IndexOutOfRange),
            (Opcode::OneWireTemps, '1') => Some(NoSensorsAvailable),
            (Opcode::OneWireTemps, '2') => Some(PartialReadFailure),
            (Opcode::SetComm, '1') => Some(InvalidAddress),
            (Opcode::SetComm, '2') => Some(NonHexArgument),
            (Opcode::SetComm, '3') => Some(BaudChangeFailed),
            (Opcode::Analog, '1') => Some(InvalidAdcChannel),
            (Opcode::ChannelPower | Opcode::ChannelCurrent, '1') => Some(InvalidArgument),
            (Opcode::ChannelPower | Opcode::ChannelCurrent, '2') => Some(ChannelOutOfRange),
            (Opcode::SetTime, '1') => Some(InvalidArgument),
            _ => None,
        };
        mapped.unwrap_or(Unspecified(reason))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// One of the three non-volatile configuration slots
///
/// Slot 0 is loaded automatically on power-up and reset, so saving to it
/// changes what the board comes up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemorySlot(u8);

impl MemorySlot {
    /// Number of slots on a board
    pub const COUNT: u8 = 3;
    /// The slot loaded at power-up
    pub const BOOT: MemorySlot = MemorySlot(0);

    /// Slot by index; anything above 2 is `InvalidArgument`
    pub fn new(index: u8) -> Result<Self, DispatchError> {
        if index < Self::COUNT {
            Ok(Self(index))
        } else {
            Err(DispatchError::InvalidArgument(format!(
                "memory slot {} out of range 0..{}",
                index,
                Self::COUNT
            )))
        }
    }

    /// Slot index as sent on the wire
    pub fn index(self) -> u8 {
        self.0
    }

    /// True for the slot loaded at power-up
    pub fn is_boot_default(self) -> bool {
        self == Self::BOOT
    }
}

/// A command with typed arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read serial number, firmware version, coupling map and 1-wire count
    BoardInfo,
    /// Ask the board to return the text
    Echo(String),
    /// Restart the board; never answered
    Reset,
    /// The command the board received before this one
    LastCommand,
    /// Read the board clock in seconds
    GetTime,
    /// Set the board clock in seconds
    SetTime(u32),
    /// Move the board to a new address and optionally a new baud rate
    /// (16 × `baud_factor` Hz). Future traffic must use the new settings.
    SetComm {
        /// Address the board answers on afterwards
        new_address: BoardAddress,
        /// New baud factor, or keep the current rate
        baud_factor: Option<u16>,
    },
    /// Read a processor ADC channel
    Analog(u8),
    /// Read the processor temperature
    ChipTemp,
    /// Write one channel configuration word
    SetChannel {
        /// Channel 0–15
        channel: u8,
        /// Configuration word
        word: u16,
    },
    /// Read one channel configuration word
    GetChannel(u8),
    /// Write the same word to every channel
    SetAll(u16),
    /// Write one word per channel
    SetEach([u16; CHANNEL_COUNT]),
    /// Read every channel word
    GetAll,
    /// Restore the channels from a memory slot
    Load(MemorySlot),
    /// Store the channels in a memory slot
    Save(MemorySlot),
    /// RF power detector counts for one channel
    ChannelPower(u8),
    /// RF power detector counts for every channel
    AllPower,
    /// Input current counts for one channel
    ChannelCurrent(u8),
    /// Input current counts for every channel
    AllCurrent,
    /// Board supply current counts
    BoardCurrent,
    /// Enumerate the 1-wire bus
    OneWireSearch,
    /// Device count from the last search
    OneWireCount,
    /// Serial number of the device at an index
    OneWireSerial(u8),
    /// Temperatures of every device found by the last search
    OneWireTemps {
        /// Devices expected; sizes the deadline and must match the reply
        sensor_count: u8,
    },
}

impl Command {
    /// Registry entry for this command
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::BoardInfo => Opcode::BoardInfo,
            Command::Echo(_) => Opcode::Echo,
            Command::Reset => Opcode::Reset,
            Command::LastCommand => Opcode::LastCommand,
            Command::GetTime => Opcode::GetTime,
            Command::SetTime(_) => Opcode::SetTime,
            Command::SetComm { .. } => Opcode::SetComm,
            Command::Analog(_) => Opcode::Analog,
            Command::ChipTemp => Opcode::ChipTemp,
            Command::SetChannel { .. } => Opcode::SetChannel,
            Command::GetChannel(_) => Opcode::GetChannel,
            Command::SetAll(_) => Opcode::SetAll,
            Command::SetEach(_) => Opcode::SetEach,
            Command::GetAll => Opcode::GetAll,
            Command::Load(_) => Opcode::Load,
            Command::Save(_) => Opcode::Save,
            Command::ChannelPower(_) => Opcode::ChannelPower,
            Command::AllPower => Opcode::AllPower,
            Command::ChannelCurrent(_) => Opcode::ChannelCurrent,
            Command::AllCurrent => Opcode::AllCurrent,
            Command::BoardCurrent => Opcode::BoardCurrent,
            Command::OneWireSearch => Opcode::OneWireSearch,
            Command::OneWireCount => Opcode::OneWireCount,
            Command::OneWireSerial(_) => Opcode::OneWireSerial,
            Command::OneWireTemps { .. } => Opcode::OneWireTemps,
        }
    }

    /// Range checks that the types alone cannot express
    pub fn validate(&self) -> Result<(), DispatchError> {
        let invalid = |msg: String| Err(DispatchError::InvalidArgument(msg));
        match self {
            Command::SetChannel { channel, .. }
            | Command::GetChannel(channel)
            | Command::ChannelPower(channel)
            | Command::ChannelCurrent(channel)
                if *channel as usize >= CHANNEL_COUNT =>
            {
                invalid(format!("channel {} out of range 0..{}", channel, CHANNEL_COUNT))
            }
            Command::OneWireSerial(index) if *index as usize >= 16 => {
                invalid(format!("1-wire index {} out of range 0..16", index))
            }
            Command::OneWireTemps { sensor_count } if *sensor_count > 16 => {
                invalid(format!("1-wire sensor count {} exceeds 16", sensor_count))
            }
            Command::SetComm { new_address, .. } if new_address.is_broadcast() => {
                invalid("cannot move a board to the broadcast address".to_string())
            }
            Command::SetComm {
                baud_factor: Some(0),
                ..
            } => invalid("baud factor must be non-zero".to_string()),
            _ => Ok(()),
        }
    }

    /// Serialize the arguments
    pub fn args(&self) -> String {
        let b = ArgBuilder::new();
        match self {
            Command::Echo(text) => b.text(text),
            Command::SetTime(seconds) => b.hex(*seconds as u64, 8),
            Command::SetComm {
                new_address,
                baud_factor,
            } => {
                let b = b.hex(new_address.board_number() as u64, 2);
                match baud_factor {
                    Some(factor) => b.word(*factor),
                    None => b,
                }
            }
            Command::Analog(adc) => b.hex(*adc as u64, 2),
            Command::SetChannel { channel, word } => b.hex(*channel as u64, 1).word(*word),
            Command::GetChannel(channel)
            | Command::ChannelPower(channel)
            | Command::ChannelCurrent(channel)
            | Command::OneWireSerial(channel) => b.hex(*channel as u64, 1),
            Command::SetAll(word) => b.word(*word),
            Command::SetEach(words) => words.iter().fold(b, |b, w| b.word(*w)),
            Command::Load(slot) | Command::Save(slot) => b.digit(slot.index()),
            _ => b,
        }
        .build()
    }
}
