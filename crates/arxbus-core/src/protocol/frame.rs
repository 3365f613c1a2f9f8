//! Frame encoding/decoding
//!
//! Command frame (host → board):
//! - 1 byte: board address (0x80–0xFE, the only byte with the high bit set)
//! - 4 bytes: opcode
//! - 0–74 bytes: printable ASCII arguments
//! - 1 byte: terminator (0x0D)
//!
//! Response frame (board → host):
//! - ACK (0x06) + payload (≤ 78 bytes) + terminator
//! - NAK (0x15) + generic error digit + reason digit + terminator
//!
//! The codec never interprets ACK payloads; that happens in the dispatcher.

use std::fmt;

use super::commands::Opcode;
use super::{FrameError, ACK, MAX_FRAME_LEN, NAK, TERMINATOR};

/// Address of a board on the bus
///
/// Valid addresses are 0x80–0xFE. 0x80 is the broadcast address, matched by
/// every board and answered by none. 0x81–0xFE are boards 1–126. 0xFF is
/// reserved and can never be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoardAddress(u8);

impl BoardAddress {
    /// The broadcast address
    pub const BROADCAST: BoardAddress = BoardAddress(0x80);
    /// Lowest address of an individually addressable board
    pub const FIRST_BOARD: u8 = 0x81;
    /// Highest address of an individually addressable board
    pub const LAST_BOARD: u8 = 0xFE;

    /// Validate a raw address byte
    pub fn new(raw: u8) -> Result<Self, FrameError> {
        if (0x80..=0xFE).contains(&raw) {
            Ok(Self(raw))
        } else {
            Err(FrameError::InvalidAddress(raw))
        }
    }

    /// Address of board number 1–126 (address byte = 0x80 + number)
    pub fn from_board_number(number: u8) -> Result<Self, FrameError> {
        if (1..=126).contains(&number) {
            Ok(Self(0x80 + number))
        } else {
            Err(FrameError::InvalidBoardNumber(number))
        }
    }

    /// The address byte as sent on the wire
    pub fn raw(self) -> u8 {
        self.0
    }

    /// Board number (1–126), or 0 for the broadcast address
    pub fn board_number(self) -> u8 {
        self.0 - 0x80
    }

    /// True for 0x80, the address every board listens on
    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    /// Every individually addressable board, in ascending order
    pub fn all_boards() -> impl Iterator<Item = BoardAddress> {
        (Self::FIRST_BOARD..=Self::LAST_BOARD).map(BoardAddress)
    }
}

impl fmt::Display for BoardAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "broadcast(0x80)")
        } else {
            write!(f, "{:#04x}", self.0)
        }
    }
}

impl TryFrom<u8> for BoardAddress {
    type Error = FrameError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

/// A command addressed to one board (or to all of them)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Destination board or broadcast
    pub address: BoardAddress,
    /// Command mnemonic
    pub opcode: Opcode,
    /// Argument string, without the terminator
    pub args: String,
}

impl CommandFrame {
    /// Frame with the given argument string
    pub fn new(address: BoardAddress, opcode: Opcode, args: impl Into<String>) -> Self {
        Self {
            address,
            opcode,
            args: args.into(),
        }
    }

    /// Encode the frame to wire bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let frame_len = self.encoded_size();
        if frame_len > MAX_FRAME_LEN {
            return Err(FrameError::ArgumentTooLong {
                frame_len,
                max: MAX_FRAME_LEN,
            });
        }
        check_args(self.args.as_bytes())?;

        let mut bytes = Vec::with_capacity(frame_len);
        bytes.push(self.address.raw());
        bytes.extend_from_slice(self.opcode.mnemonic().as_bytes());
        bytes.extend_from_slice(self.args.as_bytes());
        bytes.push(TERMINATOR);
        Ok(bytes)
    }

    /// Decode a command frame (what a board sees on the bus)
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() > MAX_FRAME_LEN {
            return Err(FrameError::Malformed(format!(
                "frame is {} bytes (max {})",
                data.len(),
                MAX_FRAME_LEN
            )));
        }
        let body = strip_terminator(data)?;
        if body.len() < 5 {
            return Err(FrameError::Malformed("command frame too short".to_string()));
        }

        let address = BoardAddress::new(body[0])?;
        let opcode = Opcode::from_mnemonic(&body[1..5]).ok_or_else(|| {
            FrameError::Malformed(format!(
                "unknown opcode {:?}",
                String::from_utf8_lossy(&body[1..5])
            ))
        })?;
        let args = &body[5..];
        check_args(args)?;

        Ok(Self {
            address,
            opcode,
            args: String::from_utf8_lossy(args).into_owned(),
        })
    }

    /// Total encoded size, terminator included
    pub fn encoded_size(&self) -> usize {
        1 + 4 + self.args.len() + 1
    }
}

/// Encode a command from a raw address byte
///
/// Fails with `InvalidAddress` for anything outside 0x80–0xFE.
pub fn encode_command(address: u8, opcode: Opcode, args: &str) -> Result<Vec<u8>, FrameError> {
    CommandFrame::new(BoardAddress::new(address)?, opcode, args).to_bytes()
}

/// Generic error class of a negative acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakCode {
    /// '1': command not recognized
    Unrecognized,
    /// '2': command too long
    TooLong,
    /// '3': command failed, see the reason digit
    Failed,
}

impl NakCode {
    /// ASCII digit sent on the wire
    pub fn digit(self) -> u8 {
        match self {
            NakCode::Unrecognized => b'1',
            NakCode::TooLong => b'2',
            NakCode::Failed => b'3',
        }
    }

    /// Parse the generic NAK digit
    pub fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            b'1' => Some(NakCode::Unrecognized),
            b'2' => Some(NakCode::TooLong),
            b'3' => Some(NakCode::Failed),
            _ => None,
        }
    }
}

/// Reason digit sent when the generic code carries no reason
pub const NO_REASON: char = '0';

/// A decoded response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFrame {
    /// Success, with the opcode's payload
    Ack {
        /// Everything between the ACK byte and the terminator
        payload: String,
    },
    /// Failure
    Nak {
        /// Generic failure digit
        code: NakCode,
        /// Opcode-specific reason, `'0'` when none
        reason: char,
    },
}

impl ResponseFrame {
    /// An ACK carrying `payload`
    pub fn ack(payload: impl Into<String>) -> Self {
        ResponseFrame::Ack {
            payload: payload.into(),
        }
    }

    /// A `Failed` NAK with the given reason digit (1–9)
    pub fn failed(reason: u8) -> Self {
        ResponseFrame::Nak {
            code: NakCode::Failed,
            reason: char::from(b'0' + reason.min(9)),
        }
    }

    /// A NAK with no reason digit
    pub fn nak(code: NakCode) -> Self {
        ResponseFrame::Nak {
            code,
            reason: NO_REASON,
        }
    }

    /// Decode one complete response frame, terminator included
    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() > MAX_FRAME_LEN {
            return Err(FrameError::Malformed(format!(
                "frame is {} bytes (max {})",
                data.len(),
                MAX_FRAME_LEN
            )));
        }
        let body = strip_terminator(data)?;
        let (&lead, rest) = body
            .split_first()
            .ok_or_else(|| FrameError::Malformed("empty frame".to_string()))?;

        match lead {
            ACK => {
                if let Some(pos) = rest.iter().position(|b| b & 0x80 != 0) {
                    return Err(FrameError::Malformed(format!(
                        "payload byte {:#04x} at {} has the high bit set",
                        rest[pos], pos
                    )));
                }
                Ok(ResponseFrame::Ack {
                    payload: String::from_utf8_lossy(rest).into_owned(),
                })
            }
            NAK => {
                let [generic, reason] = rest else {
                    return Err(FrameError::Malformed(format!(
                        "NAK carries {} characters, expected 2",
                        rest.len()
                    )));
                };
                let code = NakCode::from_digit(*generic).ok_or_else(|| {
                    FrameError::Malformed(format!("unknown NAK code {:#04x}", generic))
                })?;
                let valid_reason = match code {
                    NakCode::Failed => reason.is_ascii_digit(),
                    _ => *reason == NO_REASON as u8,
                };
                if !valid_reason {
                    return Err(FrameError::Malformed(format!(
                        "unparsable NAK reason {:#04x}",
                        reason
                    )));
                }
                Ok(ResponseFrame::Nak {
                    code,
                    reason: char::from(*reason),
                })
            }
            other => Err(FrameError::Malformed(format!(
                "unexpected leading byte {:#04x}",
                other
            ))),
        }
    }

    /// Encode the response to wire bytes (used by simulated boards)
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ResponseFrame::Ack { payload } => {
                let mut bytes = Vec::with_capacity(payload.len() + 2);
                bytes.push(ACK);
                bytes.extend_from_slice(payload.as_bytes());
                bytes.push(TERMINATOR);
                bytes
            }
            ResponseFrame::Nak { code, reason } => {
                vec![NAK, code.digit(), *reason as u8, TERMINATOR]
            }
        }
    }
}

fn strip_terminator(data: &[u8]) -> Result<&[u8], FrameError> {
    match data.split_last() {
        Some((&TERMINATOR, body)) if !body.contains(&TERMINATOR) => Ok(body),
        Some((&TERMINATOR, _)) => Err(FrameError::Malformed(
            "terminator inside frame".to_string(),
        )),
        _ => Err(FrameError::Malformed("missing terminator".to_string())),
    }
}

fn check_args(args: &[u8]) -> Result<(), FrameError> {
    match args.iter().position(|b| !(0x20..=0x7E).contains(b)) {
        Some(position) => Err(FrameError::InvalidCharacter {
            position,
            byte: args[position],
        }),
        None => Ok(()),
    }
}

/// Builder for command argument strings
///
/// Numeric fields are uppercase hex, most significant digit first, fixed width.
#[derive(Debug, Default)]
pub struct ArgBuilder {
    args: String,
}

impl ArgBuilder {
    /// Empty argument string
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fixed-width hex field (value is truncated to `width` digits)
    pub fn hex(mut self, value: u64, width: usize) -> Self {
        let mask = if width >= 16 {
            u64::MAX
        } else {
            (1u64 << (4 * width)) - 1
        };
        self.args
            .push_str(&format!("{:0width$X}", value & mask, width = width));
        self
    }

    /// Add a 16-bit word as 4 hex digits
    pub fn word(self, value: u16) -> Self {
        self.hex(value as u64, 4)
    }

    /// Add a single decimal digit
    pub fn digit(mut self, value: u8) -> Self {
        self.args.push(char::from(b'0' + value % 10));
        self
    }

    /// Add free text verbatim
    pub fn text(mut self, text: &str) -> Self {
        self.args.push_str(text);
        self
    }

    /// The finished argument string
    pub fn build(self) -> String {
        self.args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MAX_ARGS_LEN;

    #[test]
    fn test_command_roundtrip() {
        let addr = BoardAddress::new(0x9F).unwrap();
        let original = CommandFrame::new(addr, Opcode::SetChannel, "3FF33");
        let encoded = original.to_bytes().expect("Should encode");
        assert_eq!(encoded, b"\x9FSETC3FF33\r".to_vec());

        let decoded = CommandFrame::from_bytes(&encoded).expect("Should decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_max_length_frame() {
        let addr = BoardAddress::new(0x81).unwrap();
        let args = "A".repeat(MAX_ARGS_LEN);
        let frame = CommandFrame::new(addr, Opcode::Echo, args);
        assert_eq!(frame.to_bytes().unwrap().len(), MAX_FRAME_LEN);

        let frame = CommandFrame::new(addr, Opcode::Echo, "A".repeat(MAX_ARGS_LEN + 1));
        assert_eq!(
            frame.to_bytes(),
            Err(FrameError::ArgumentTooLong {
                frame_len: 81,
                max: 80
            })
        );
    }

    #[test]
    fn test_invalid_characters() {
        let addr = BoardAddress::new(0x81).unwrap();
        let frame = CommandFrame::new(addr, Opcode::Echo, "AB\rC");
        assert_eq!(
            frame.to_bytes(),
            Err(FrameError::InvalidCharacter {
                position: 2,
                byte: 0x0D
            })
        );

        let frame = CommandFrame::new(addr, Opcode::Echo, "é");
        assert!(matches!(
            frame.to_bytes(),
            Err(FrameError::InvalidCharacter { position: 0, .. })
        ));
    }

    #[test]
    fn test_address_range() {
        for raw in 0u8..0x80 {
            assert_eq!(BoardAddress::new(raw), Err(FrameError::InvalidAddress(raw)));
        }
        assert_eq!(BoardAddress::new(0xFF), Err(FrameError::InvalidAddress(0xFF)));
        assert!(BoardAddress::new(0x80).unwrap().is_broadcast());
        assert_eq!(BoardAddress::from_board_number(31).unwrap().raw(), 0x9F);
        assert_eq!(
            BoardAddress::from_board_number(0),
            Err(FrameError::InvalidBoardNumber(0))
        );
        assert_eq!(
            BoardAddress::from_board_number(127),
            Err(FrameError::InvalidBoardNumber(127))
        );
        assert_eq!(BoardAddress::all_boards().count(), 126);
    }

    #[test]
    fn test_decode_ack() {
        let frame = ResponseFrame::from_bytes(b"\x06ABCD\r").unwrap();
        assert_eq!(frame, ResponseFrame::ack("ABCD"));

        let empty = ResponseFrame::from_bytes(b"\x06\r").unwrap();
        assert_eq!(empty, ResponseFrame::ack(""));
    }

    #[test]
    fn test_decode_nak() {
        let frame = ResponseFrame::from_bytes(b"\x1532\r").unwrap();
        assert_eq!(
            frame,
            ResponseFrame::Nak {
                code: NakCode::Failed,
                reason: '2'
            }
        );

        let frame = ResponseFrame::from_bytes(b"\x1510\r").unwrap();
        assert_eq!(frame, ResponseFrame::nak(NakCode::Unrecognized));

        // reason must be '0' unless the generic code is '3'
        assert!(ResponseFrame::from_bytes(b"\x1524\r").is_err());
        assert!(ResponseFrame::from_bytes(b"\x153X\r").is_err());
        assert!(ResponseFrame::from_bytes(b"\x1540\r").is_err());
        assert!(ResponseFrame::from_bytes(b"\x153\r").is_err());
    }

    #[test]
    fn test_decode_malformed() {
        assert!(ResponseFrame::from_bytes(b"\x06ABCD").is_err());
        assert!(ResponseFrame::from_bytes(b"XABCD\r").is_err());
        assert!(ResponseFrame::from_bytes(b"\r").is_err());
        assert!(ResponseFrame::from_bytes(b"").is_err());

        let mut long = vec![ACK];
        long.extend(std::iter::repeat(b'A').take(79));
        long.push(TERMINATOR);
        assert_eq!(long.len(), 81);
        assert!(ResponseFrame::from_bytes(&long).is_err());
    }

    #[test]
    fn test_response_encoding() {
        assert_eq!(ResponseFrame::ack("12").to_bytes(), b"\x0612\r".to_vec());
        assert_eq!(ResponseFrame::failed(2).to_bytes(), b"\x1532\r".to_vec());
        assert_eq!(
            ResponseFrame::nak(NakCode::TooLong).to_bytes(),
            b"\x1520\r".to_vec()
        );
    }

    #[test]
    fn test_arg_builder() {
        let args = ArgBuilder::new().hex(3, 1).word(0xFF33).build();
        assert_eq!(args, "3FF33");

        let args = ArgBuilder::new().hex(0x1FF, 2).digit(2).text("x").build();
        assert_eq!(args, "FF2x");
    }
}
