//! Simulated bus - ARX boards for testing without hardware
//!
//! [`SimulatedBus`] is a [`BusLink`] with a set of simulated boards behind it.
//! Bytes the host writes are framed at the terminator, handed to the addressed
//! board, and the board's response is queued for the host to read. Analog
//! readings wander by a few counts like a real ADC.
//!
//! Faults can be injected per board: a silent board, a garbled reply, a
//! delayed reply, unreadable channels and forced negative acknowledgments.
//! The handle is cheap to clone, so a test keeps one copy for fault injection
//! while the transport owns the other.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::protocol::{
    ArgBuilder, BusLink, NakCode, Opcode, ResponseFrame, CHANNEL_COUNT, MAX_FRAME_LEN,
    TERMINATOR,
};

const BROADCAST: u8 = 0x80;

/// A simulated 1-wire sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimSensor {
    /// 64-bit ROM code
    pub serial_number: u64,
    /// Raw 16-bit temperature field as the board reports it
    pub raw_temperature: u16,
    /// Fails to answer during a temperature read
    pub faulty: bool,
}

impl SimSensor {
    /// Healthy sensor
    pub fn new(serial_number: u64, raw_temperature: u16) -> Self {
        Self {
            serial_number,
            raw_temperature,
            faulty: false,
        }
    }
}

/// State of one simulated board
#[derive(Debug, Clone)]
pub struct SimBoard {
    /// Reported by `ARXN`
    pub serial_number: u16,
    /// Reported by `ARXN`
    pub firmware_version: u16,
    /// Fiber channels, bit N for channel N
    pub coupling_map: u16,
    /// Channel configuration words
    pub channels: [u16; CHANNEL_COUNT],
    /// Saved configurations, `None` when empty
    pub slots: [Option<[u16; CHANNEL_COUNT]>; 3],
    /// Sensors on the 1-wire bus
    pub sensors: Vec<SimSensor>,
    /// Sensors found by the last search
    pub sensors_found: u8,
    /// Stub clock: whatever was last set
    pub clock: u32,
    /// Raw processor temperature, 0.1 °C per count
    pub chip_temp: u16,
    /// RF power counts per channel, before jitter
    pub power_counts: [u16; CHANNEL_COUNT],
    /// Input current counts per channel, before jitter
    pub current_counts: [u16; CHANNEL_COUNT],
    /// Supply current counts, before jitter
    pub board_current_counts: u16,
    /// Reading of every processor ADC channel
    pub adc_counts: u16,
    /// Text of the previous command received
    pub last_command: String,
    /// Channels whose hardware does not answer
    pub unreadable: BTreeSet<u8>,
    /// Times the board has been reset
    pub resets: u32,
}

impl SimBoard {
    /// Board with default channels and no sensors
    pub fn new(serial_number: u16) -> Self {
        Self {
            serial_number,
            firmware_version: 0x0103,
            coupling_map: 0,
            channels: [0x7FFA; CHANNEL_COUNT],
            slots: [None; 3],
            sensors: Vec::new(),
            sensors_found: 0,
            clock: 0,
            chip_temp: 0x00FA,
            power_counts: [0x0200; CHANNEL_COUNT],
            current_counts: [0x0100; CHANNEL_COUNT],
            board_current_counts: 0x0040,
            adc_counts: 0x0800,
            last_command: String::new(),
            unreadable: BTreeSet::new(),
            resets: 0,
        }
    }

    /// Attach 1-wire sensors
    pub fn with_sensors(mut self, sensors: Vec<SimSensor>) -> Self {
        self.sensors = sensors;
        self
    }

    /// Set the coupling map
    pub fn with_coupling(mut self, map: u16) -> Self {
        self.coupling_map = map;
        self
    }

    /// Execute one command; `None` means the board stays silent
    fn execute(&mut self, opcode: Opcode, args: &str, rng: &mut StdRng) -> Option<ResponseFrame> {
        let previous = std::mem::replace(&mut self.last_command, format!("{}{}", opcode, args));
        let fail = |reason: u8| Some(ResponseFrame::failed(reason));

        if opcode.arg_schema().validate(args).is_err() && opcode != Opcode::SetComm {
            return match opcode {
                Opcode::Echo => Some(ResponseFrame::nak(NakCode::TooLong)),
                _ => fail(1),
            };
        }

        match opcode {
            Opcode::BoardInfo => Some(ResponseFrame::ack(
                ArgBuilder::new()
                    .word(self.serial_number)
                    .word(self.firmware_version)
                    .word(self.coupling_map)
                    .hex(self.sensors_found as u64, 2)
                    .build(),
            )),
            Opcode::Echo => Some(ResponseFrame::ack(args)),
            Opcode::Reset => {
                self.resets += 1;
                if let Some(boot) = self.slots[0] {
                    self.channels = boot;
                }
                None
            }
            Opcode::LastCommand => Some(ResponseFrame::ack(previous)),
            Opcode::GetTime => hex_ack(self.clock as u64, 8),
            Opcode::SetTime => {
                self.clock = u32::from_str_radix(args, 16).ok()?;
                Some(ResponseFrame::ack(""))
            }
            // Handled by the bus, which owns the address map
            Opcode::SetComm => Some(ResponseFrame::ack("")),
            Opcode::Analog => {
                let adc = u8::from_str_radix(args, 16).ok()?;
                if adc > 0x0F {
                    return fail(1);
                }
                Some(ResponseFrame::ack(jittered(self.adc_counts, rng)))
            }
            Opcode::ChipTemp => hex_ack(self.chip_temp as u64, 4),
            Opcode::SetChannel | Opcode::GetChannel => {
                let chan = u8::from_str_radix(&args[..1], 16).ok()?;
                if self.unreadable.contains(&chan) {
                    return fail(3);
                }
                if opcode == Opcode::SetChannel {
                    self.channels[chan as usize] = u16::from_str_radix(&args[1..], 16).ok()?;
                    Some(ResponseFrame::ack(""))
                } else {
                    hex_ack(self.channels[chan as usize] as u64, 4)
                }
            }
            Opcode::SetAll => {
                let word = u16::from_str_radix(args, 16).ok()?;
                self.channels = [word; CHANNEL_COUNT];
                Some(ResponseFrame::ack(""))
            }
            Opcode::SetEach => {
                for (chan, word) in self.channels.iter_mut().enumerate() {
                    *word = u16::from_str_radix(&args[chan * 4..chan * 4 + 4], 16).ok()?;
                }
                Some(ResponseFrame::ack(""))
            }
            Opcode::GetAll => {
                let payload = (0..CHANNEL_COUNT as u8).fold(ArgBuilder::new(), |b, chan| {
                    if self.unreadable.contains(&chan) {
                        b.word(0xFFFF)
                    } else {
                        b.word(self.channels[chan as usize])
                    }
                });
                Some(ResponseFrame::ack(payload.build()))
            }
            Opcode::Load => {
                let slot = args.parse::<usize>().ok()?;
                match self.slots.get(slot) {
                    None => fail(1),
                    Some(None) => fail(2),
                    Some(Some(stored)) => {
                        self.channels = *stored;
                        Some(ResponseFrame::ack(""))
                    }
                }
            }
            Opcode::Save => {
                let slot = args.parse::<usize>().ok()?;
                match self.slots.get_mut(slot) {
                    None => fail(1),
                    Some(stored) => {
                        *stored = Some(self.channels);
                        Some(ResponseFrame::ack(""))
                    }
                }
            }
            Opcode::ChannelPower | Opcode::ChannelCurrent => {
                let chan = u8::from_str_radix(args, 16).ok()? as usize;
                let counts = if opcode == Opcode::ChannelPower {
                    self.power_counts[chan]
                } else {
                    self.current_counts[chan]
                };
                Some(ResponseFrame::ack(jittered(counts, rng)))
            }
            Opcode::AllPower | Opcode::AllCurrent => {
                let counts = if opcode == Opcode::AllPower {
                    self.power_counts
                } else {
                    self.current_counts
                };
                let payload = counts.iter().fold(ArgBuilder::new(), |b, c| {
                    b.text(&jittered(*c, rng))
                });
                Some(ResponseFrame::ack(payload.build()))
            }
            Opcode::BoardCurrent => {
                Some(ResponseFrame::ack(jittered(self.board_current_counts, rng)))
            }
            Opcode::OneWireSearch => {
                self.sensors_found = self.sensors.len().min(16) as u8;
                hex_ack(self.sensors_found as u64, 2)
            }
            Opcode::OneWireCount => hex_ack(self.sensors_found as u64, 2),
            Opcode::OneWireSerial => {
                let index = u8::from_str_radix(args, 16).ok()?;
                let sensor = self
                    .sensors
                    .get(index as usize)
                    .filter(|_| index < self.sensors_found);
                let Some(sensor) = sensor else {
                    return fail(2);
                };
                let serial = sensor.serial_number;
                hex_ack(serial, 16)
            }
            Opcode::OneWireTemps => {
                let count = (self.sensors_found as usize).min(self.sensors.len());
                let found = &self.sensors[..count];
                if found.is_empty() {
                    return fail(1);
                }
                if found.iter().any(|s| s.faulty) {
                    return fail(2);
                }
                let payload = found
                    .iter()
                    .fold(ArgBuilder::new(), |b, s| b.word(s.raw_temperature));
                Some(ResponseFrame::ack(payload.build()))
            }
        }
    }
}

fn hex_ack(value: u64, width: usize) -> Option<ResponseFrame> {
    Some(ResponseFrame::ack(ArgBuilder::new().hex(value, width).build()))
}

fn jittered(counts: u16, rng: &mut StdRng) -> String {
    let value = (counts as i32 + rng.gen_range(-2..=2)).clamp(0, 0x0FFF);
    ArgBuilder::new().word(value as u16).build()
}

/// Per-board fault injection
#[derive(Debug, Clone, Default)]
struct Faults {
    silent: bool,
    garble_next: bool,
    delay: Option<Duration>,
    forced: HashMap<Opcode, ResponseFrame>,
}

struct SimState {
    boards: BTreeMap<u8, SimBoard>,
    faults: HashMap<u8, Faults>,
    /// Bytes written by the host, not yet terminated
    incoming: Vec<u8>,
    /// Bytes ready for the host to read
    outgoing: VecDeque<u8>,
    /// A response that becomes readable at the given instant
    delayed: Option<(Instant, Vec<u8>)>,
    /// Every complete frame seen on the bus, with its arrival time
    history: Vec<(Instant, Vec<u8>)>,
    rng: StdRng,
}

impl SimState {
    fn release_delayed(&mut self) {
        if let Some((ready_at, _)) = &self.delayed {
            if Instant::now() >= *ready_at {
                if let Some((_, bytes)) = self.delayed.take() {
                    self.outgoing.extend(bytes);
                }
            }
        }
    }

    fn handle_frame(&mut self, raw: Vec<u8>) {
        // Boards ignore anything before an address byte (wake-up filler)
        let start = raw.iter().position(|b| b & 0x80 != 0);
        let Some(start) = start else {
            return;
        };
        let frame = raw[start..].to_vec();
        self.history.push((Instant::now(), frame.clone()));
        trace!("sim rx {:02x?}", frame);

        let address = frame[0];
        let body = &frame[1..frame.len() - 1];

        if address == BROADCAST {
            let addresses: Vec<u8> = self.boards.keys().copied().collect();
            for addr in addresses {
                let _ = self.respond(addr, body);
            }
            return;
        }
        if let Some(response) = self.respond(address, body) {
            self.queue(address, response);
        }
    }

    fn respond(&mut self, address: u8, body: &[u8]) -> Option<Vec<u8>> {
        let faults = self.faults.get(&address).cloned().unwrap_or_default();
        if faults.silent {
            return None;
        }
        let board = self.boards.get_mut(&address)?;

        if body.len() + 2 > MAX_FRAME_LEN {
            return Some(ResponseFrame::nak(NakCode::TooLong).to_bytes());
        }
        let Some(opcode) = body.get(..4).and_then(Opcode::from_mnemonic) else {
            return Some(ResponseFrame::nak(NakCode::Unrecognized).to_bytes());
        };
        let args = String::from_utf8_lossy(&body[4..]).into_owned();

        if let Some(forced) = faults.forced.get(&opcode) {
            board.last_command = format!("{}{}", opcode, args);
            return Some(forced.to_bytes());
        }

        let response = board.execute(opcode, &args, &mut self.rng)?;

        if opcode == Opcode::SetComm && response == ResponseFrame::ack("") {
            if !args.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Some(ResponseFrame::failed(2).to_bytes());
            }
            let target = args
                .get(..2)
                .and_then(|a| u8::from_str_radix(a, 16).ok())
                .filter(|n| (1..=126).contains(n));
            match target {
                Some(number) => {
                    let moved = self.boards.remove(&address)?;
                    self.boards.insert(0x80 + number, moved);
                    if let Some(f) = self.faults.remove(&address) {
                        self.faults.insert(0x80 + number, f);
                    }
                }
                None => return Some(ResponseFrame::failed(1).to_bytes()),
            }
        }
        Some(response.to_bytes())
    }

    fn queue(&mut self, address: u8, mut bytes: Vec<u8>) {
        let faults = self.faults.entry(address).or_default();
        if faults.garble_next {
            faults.garble_next = false;
            // Lose the terminator and corrupt the lead byte
            bytes.pop();
            if let Some(first) = bytes.first_mut() {
                *first = b'?';
            }
        }
        match faults.delay {
            Some(delay) => self.delayed = Some((Instant::now() + delay, bytes)),
            None => self.outgoing.extend(bytes),
        }
    }
}

/// A bus of simulated ARX boards
#[derive(Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBus {
    /// Empty bus with an entropy-seeded generator
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic readings for reproducible tests
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                boards: BTreeMap::new(),
                faults: HashMap::new(),
                incoming: Vec::new(),
                outgoing: VecDeque::new(),
                delayed: None,
                history: Vec::new(),
                rng,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not hide the bus from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a board at a raw address (0x81–0xFE)
    pub fn add_board(&self, address: u8, board: SimBoard) {
        self.lock().boards.insert(address, board);
    }

    /// Detach a board, returning its final state
    pub fn remove_board(&self, address: u8) -> Option<SimBoard> {
        self.lock().boards.remove(&address)
    }

    /// Snapshot of a board's state
    pub fn board(&self, address: u8) -> Option<SimBoard> {
        self.lock().boards.get(&address).cloned()
    }

    /// Mutate a board in place
    pub fn with_board<R>(&self, address: u8, f: impl FnOnce(&mut SimBoard) -> R) -> Option<R> {
        self.lock().boards.get_mut(&address).map(f)
    }

    /// Addresses of the attached boards
    pub fn addresses(&self) -> Vec<u8> {
        self.lock().boards.keys().copied().collect()
    }

    /// The board hears commands but never answers
    pub fn set_silent(&self, address: u8, silent: bool) {
        self.lock().faults.entry(address).or_default().silent = silent;
    }

    /// Corrupt the board's next response
    pub fn garble_next(&self, address: u8) {
        self.lock().faults.entry(address).or_default().garble_next = true;
    }

    /// Hold every response from the board back for `delay`
    pub fn set_reply_delay(&self, address: u8, delay: Option<Duration>) {
        self.lock().faults.entry(address).or_default().delay = delay;
    }

    /// Make a channel's hardware unreachable
    pub fn set_unreadable(&self, address: u8, channel: u8, unreadable: bool) {
        if let Some(board) = self.lock().boards.get_mut(&address) {
            if unreadable {
                board.unreadable.insert(channel);
            } else {
                board.unreadable.remove(&channel);
            }
        }
    }

    /// Answer every `opcode` sent to the board with `response`
    pub fn force_response(&self, address: u8, opcode: Opcode, response: Option<ResponseFrame>) {
        let mut state = self.lock();
        let forced = &mut state.faults.entry(address).or_default().forced;
        match response {
            Some(r) => forced.insert(opcode, r),
            None => forced.remove(&opcode),
        };
    }

    /// Every frame the boards have seen, oldest first
    pub fn history(&self) -> Vec<(Instant, Vec<u8>)> {
        self.lock().history.clone()
    }

    /// Forget the recorded frames
    pub fn clear_history(&self) {
        self.lock().history.clear();
    }
}

impl Read for SimulatedBus {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        state.release_delayed();
        let n = buf.len().min(state.outgoing.len());
        for (slot, byte) in buf.iter_mut().zip(state.outgoing.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedBus {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        for &byte in buf {
            state.incoming.push(byte);
            if byte == TERMINATOR {
                let frame = std::mem::take(&mut state.incoming);
                state.handle_frame(frame);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BusLink for SimulatedBus {
    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        // Only what has reached the wire can be flushed; a reply still in
        // flight arrives later.
        let mut state = self.lock();
        state.release_delayed();
        state.outgoing.clear();
        Ok(())
    }

    fn clear_output_buffer(&mut self) -> io::Result<()> {
        self.lock().incoming.clear();
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        let mut state = self.lock();
        state.release_delayed();
        Ok(state.outgoing.len() as u32)
    }
}
