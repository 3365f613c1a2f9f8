//! Command dispatch
//!
//! Turns a typed [`Command`] into one bus transaction and the board's answer
//! into a typed [`Reply`]. Nothing is retried: every local, transport and
//! board error is surfaced to the caller.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::commands::{Command, Opcode, PayloadSchema, TimeoutClass};
use super::frame::{BoardAddress, CommandFrame, NakCode, ResponseFrame};
use super::transport::{BusTransport, Exchange};
use super::{DispatchError, TransportError, CHANNEL_COUNT};
use crate::scaling::InputCoupling;

/// Fixed identity block reported by `ARXN`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardInfo {
    /// Board serial number
    pub serial_number: u16,
    /// Firmware version
    pub firmware_version: u16,
    /// Raw coupling map; bit N set means channel N is fiber coupled
    pub coupling_map: u16,
    /// 1-wire devices found at the last search
    pub onewire_count: u8,
}

impl BoardInfo {
    /// Input coupling per channel
    pub fn coupling(&self) -> [InputCoupling; CHANNEL_COUNT] {
        InputCoupling::from_map(self.coupling_map)
    }

    fn parse(payload: &str) -> Result<Self, String> {
        Ok(Self {
            serial_number: hex_field(&payload[0..4])? as u16,
            firmware_version: hex_field(&payload[4..8])? as u16,
            coupling_map: hex_field(&payload[8..12])? as u16,
            onewire_count: hex_field(&payload[12..14])? as u8,
        })
    }
}

/// Typed result of a dispatched command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Sent, not confirmed (reset or broadcast)
    Sent,
    /// Acknowledged with no payload
    Done,
    /// Echoed text or the last command
    Text(String),
    /// One 16-bit field
    Value(u16),
    /// Sixteen per-channel fields, or one field per 1-wire sensor
    Values(Vec<u16>),
    /// 1-wire device count
    Count(u8),
    /// 1-wire device serial number
    Serial(u64),
    /// Board clock
    Seconds(u32),
    /// Parsed `ARXN` block
    BoardInfo(BoardInfo),
}

/// Dispatches commands over a shared transport
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<BusTransport>,
}

impl Dispatcher {
    /// Dispatcher sending through `transport`
    pub fn new(transport: Arc<BusTransport>) -> Self {
        Self { transport }
    }

    /// The shared transport
    pub fn transport(&self) -> &Arc<BusTransport> {
        &self.transport
    }

    /// Send a command and interpret the board's response
    ///
    /// `Reset` and anything addressed to the broadcast address return
    /// [`Reply::Sent`]: there is no way to tell whether any board acted on it.
    pub fn dispatch(&self, address: BoardAddress, command: &Command) -> Result<Reply, DispatchError> {
        self.execute(address, command, None)
    }

    /// Like [`dispatch`](Self::dispatch), abandoning the wait when `cancel` fires
    pub fn dispatch_with_cancel(
        &self,
        address: BoardAddress,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<Reply, DispatchError> {
        self.execute(address, command, Some(cancel))
    }

    fn execute(
        &self,
        address: BoardAddress,
        command: &Command,
        cancel: Option<&CancellationToken>,
    ) -> Result<Reply, DispatchError> {
        let opcode = command.opcode();
        command.validate()?;
        if address.is_broadcast() && opcode.is_query() {
            return Err(DispatchError::InvalidArgument(format!(
                "{} is a query and cannot be broadcast",
                opcode
            )));
        }
        let args = command.args();
        opcode
            .arg_schema()
            .validate(&args)
            .map_err(|e| DispatchError::InvalidArgument(format!("{}: {}", opcode, e)))?;

        let frame = CommandFrame::new(address, opcode, args)
            .to_bytes()
            .map_err(DispatchError::Encoding)?;

        let sensor_count = match command {
            Command::OneWireTemps { sensor_count } => *sensor_count,
            _ => 0,
        };
        let deadline = self.deadline(opcode.timeout_class(), sensor_count);

        debug!("{} -> {}", opcode, address);
        let exchange = self.submit(address, &frame, deadline, cancel)?;
        match exchange {
            Exchange::Sent | Exchange::Broadcast => Ok(Reply::Sent),
            Exchange::Response(response) => {
                let payload = check_response(opcode, response)?;
                parse_payload(opcode, &payload)
                    .and_then(|reply| check_sensor_count(command, reply))
                    .map_err(|detail| DispatchError::MalformedPayload { opcode, detail })
            }
        }
    }

    /// Send a registered opcode with an arbitrary argument string
    ///
    /// The argument schema is not checked, only the frame limits. Returns the
    /// raw ACK payload, or `None` when no response is expected.
    pub fn dispatch_raw(
        &self,
        address: BoardAddress,
        opcode: Opcode,
        args: &str,
    ) -> Result<Option<String>, DispatchError> {
        let frame = CommandFrame::new(address, opcode, args)
            .to_bytes()
            .map_err(DispatchError::Encoding)?;
        let deadline = self.deadline(opcode.timeout_class(), CHANNEL_COUNT as u8);

        match self.submit(address, &frame, deadline, None)? {
            Exchange::Sent | Exchange::Broadcast => Ok(None),
            Exchange::Response(response) => check_response(opcode, response).map(Some),
        }
    }

    fn deadline(&self, class: TimeoutClass, sensor_count: u8) -> Option<Duration> {
        let config = self.transport.config();
        match class {
            TimeoutClass::Normal => Some(config.response_timeout()),
            TimeoutClass::Long => Some(config.long_timeout()),
            TimeoutClass::PerDevice => Some(config.onewire_timeout(sensor_count)),
            TimeoutClass::NoResponse => None,
        }
    }

    fn submit(
        &self,
        address: BoardAddress,
        frame: &[u8],
        deadline: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Exchange, DispatchError> {
        self.transport
            .transact(frame, deadline, cancel)
            .map_err(|e| match e {
                TransportError::NoResponse { .. } => DispatchError::DeviceUnreachable { address },
                TransportError::Malformed(err) => DispatchError::MalformedResponse(err),
                TransportError::Cancelled => DispatchError::Cancelled,
                other => DispatchError::Transport(other),
            })
    }
}

/// Map a NAK to its error, or hand back the ACK payload
fn check_response(opcode: Opcode, response: ResponseFrame) -> Result<String, DispatchError> {
    match response {
        ResponseFrame::Ack { payload } => {
            trace!("{} ack {:?}", opcode, payload);
            Ok(payload)
        }
        ResponseFrame::Nak { code, reason } => {
            debug!("{} nak {:?} reason '{}'", opcode, code, reason);
            Err(match code {
                NakCode::Unrecognized => DispatchError::UnknownCommand,
                NakCode::TooLong => DispatchError::CommandTooLong,
                NakCode::Failed => DispatchError::CommandFailed {
                    opcode,
                    reason: opcode.failure_reason(reason),
                },
            })
        }
    }
}

fn parse_payload(opcode: Opcode, payload: &str) -> Result<Reply, String> {
    match opcode.payload_schema() {
        PayloadSchema::NoResponse => Ok(Reply::Sent),
        PayloadSchema::Empty if payload.is_empty() => Ok(Reply::Done),
        PayloadSchema::Empty => Err(format!("unexpected payload {:?}", payload)),
        PayloadSchema::Text => Ok(Reply::Text(payload.to_string())),
        PayloadSchema::Hex(width) => {
            if payload.len() != width {
                return Err(format!(
                    "expected {} hex digits, got {:?}",
                    width, payload
                ));
            }
            if opcode == Opcode::BoardInfo {
                return BoardInfo::parse(payload).map(Reply::BoardInfo);
            }
            let value = hex_field(payload)?;
            Ok(match width {
                2 => Reply::Count(value as u8),
                4 => Reply::Value(value as u16),
                8 => Reply::Seconds(value as u32),
                _ => Reply::Serial(value),
            })
        }
        PayloadSchema::HexRepeat { width, count } => {
            let values = hex_fields(payload, width)?;
            if values.len() != count {
                return Err(format!("expected {} fields, got {}", count, values.len()));
            }
            Ok(Reply::Values(values))
        }
        PayloadSchema::HexEach { width } => hex_fields(payload, width).map(Reply::Values),
    }
}

/// `OWTE` answers with one field per device; the count must match the request
fn check_sensor_count(command: &Command, reply: Reply) -> Result<Reply, String> {
    match (command, &reply) {
        (Command::OneWireTemps { sensor_count }, Reply::Values(values))
            if values.len() != *sensor_count as usize =>
        {
            Err(format!(
                "expected {} temperatures, got {}",
                sensor_count,
                values.len()
            ))
        }
        _ => Ok(reply),
    }
}

fn hex_field(field: &str) -> Result<u64, String> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!("non-hex field {:?}", field));
    }
    u64::from_str_radix(field, 16).map_err(|e| format!("bad hex field {:?}: {}", field, e))
}

fn hex_fields(payload: &str, width: usize) -> Result<Vec<u16>, String> {
    if payload.len() % width != 0 {
        return Err(format!(
            "length {} is not a multiple of {}",
            payload.len(),
            width
        ));
    }
    // The payload is ASCII (the codec rejects high-bit bytes), so byte
    // offsets are character offsets.
    (0..payload.len())
        .step_by(width)
        .map(|i| hex_field(&payload[i..i + width]).map(|v| v as u16))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_board_info() {
        let reply = parse_payload(Opcode::BoardInfo, "00420103800103").unwrap();
        assert_eq!(
            reply,
            Reply::BoardInfo(BoardInfo {
                serial_number: 0x0042,
                firmware_version: 0x0103,
                coupling_map: 0x8001,
                onewire_count: 3,
            })
        );
        assert!(parse_payload(Opcode::BoardInfo, "0042010380010").is_err());
    }

    #[test]
    fn test_parse_scalar_payloads() {
        assert_eq!(parse_payload(Opcode::GetChannel, "FF33"), Ok(Reply::Value(0xFF33)));
        assert_eq!(parse_payload(Opcode::OneWireCount, "03"), Ok(Reply::Count(3)));
        assert_eq!(
            parse_payload(Opcode::GetTime, "0000012C"),
            Ok(Reply::Seconds(300))
        );
        assert_eq!(
            parse_payload(Opcode::OneWireSerial, "28FF4A1C00000067"),
            Ok(Reply::Serial(0x28FF_4A1C_0000_0067))
        );
        assert!(parse_payload(Opcode::GetChannel, "FF3").is_err());
        assert!(parse_payload(Opcode::GetChannel, "FFZ3").is_err());
        assert!(parse_payload(Opcode::GetChannel, "+FFF").is_err());
    }

    #[test]
    fn test_parse_bulk_payloads() {
        let payload = "0001".repeat(16);
        assert_eq!(
            parse_payload(Opcode::GetAll, &payload),
            Ok(Reply::Values(vec![1; 16]))
        );
        assert!(parse_payload(Opcode::GetAll, &"0001".repeat(15)).is_err());

        assert_eq!(
            parse_payload(Opcode::OneWireTemps, ""),
            Ok(Reply::Values(vec![]))
        );
        assert_eq!(
            parse_payload(Opcode::OneWireTemps, "0190F100"),
            Ok(Reply::Values(vec![0x0190, 0xF100]))
        );
        assert!(parse_payload(Opcode::OneWireTemps, "019").is_err());
    }

    #[test]
    fn test_parse_empty_and_text() {
        assert_eq!(parse_payload(Opcode::SetChannel, ""), Ok(Reply::Done));
        assert!(parse_payload(Opcode::SetChannel, "00").is_err());
        assert_eq!(
            parse_payload(Opcode::Echo, "hi there"),
            Ok(Reply::Text("hi there".to_string()))
        );
    }

    #[test]
    fn test_nak_mapping() {
        let err = check_response(Opcode::GetChannel, ResponseFrame::failed(2)).unwrap_err();
        assert_eq!(
            err.failure_reason(),
            Some(crate::protocol::FailureReason::ChannelOutOfRange)
        );
        assert!(matches!(
            check_response(Opcode::Echo, ResponseFrame::nak(NakCode::Unrecognized)),
            Err(DispatchError::UnknownCommand)
        ));
        assert!(matches!(
            check_response(Opcode::Echo, ResponseFrame::nak(NakCode::TooLong)),
            Err(DispatchError::CommandTooLong)
        ));
    }
}
