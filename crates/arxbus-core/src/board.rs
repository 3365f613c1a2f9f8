//! Board session
//!
//! A [`BoardSession`] binds one board address to the convenience operations
//! a control program actually wants: typed channel configuration, scaled
//! monitor readings, memory slots and the 1-wire sensors.
//!
//! The session keeps a cache of what it last *read* from the board. Writes
//! never populate it: anything that could change the board invalidates the
//! affected entries, and any communication failure invalidates everything.

use tracing::debug;

use crate::channel::{ChannelConfig, ChannelReadout};
use crate::onewire::{decode_temperature, OneWireSensor};
use crate::protocol::{
    BoardAddress, BoardInfo, Command, DispatchError, Dispatcher, MemorySlot, Opcode, Reply,
    CHANNEL_COUNT,
};
use crate::scaling::{
    adc_volts, board_current_ma, chip_temp_celsius, CurrentCalibration, InputCoupling,
    PowerCalibration,
};

/// Last values read from the board
#[derive(Debug, Clone, Default)]
pub struct SessionCache {
    /// Identity block from `ARXN`
    pub info: Option<BoardInfo>,
    /// Channel configurations, `None` where unknown
    pub channels: [Option<ChannelConfig>; CHANNEL_COUNT],
    /// 1-wire device count from the last search
    pub onewire_count: Option<u8>,
}

impl SessionCache {
    fn clear_channels(&mut self) {
        self.channels = [None; CHANNEL_COUNT];
    }
}

/// Convenience operations on one board
pub struct BoardSession {
    dispatcher: Dispatcher,
    address: BoardAddress,
    cache: SessionCache,
}

impl BoardSession {
    /// Session for the board at `address`, with an empty cache
    pub fn new(dispatcher: Dispatcher, address: BoardAddress) -> Self {
        Self {
            dispatcher,
            address,
            cache: SessionCache::default(),
        }
    }

    /// Address the session talks to
    pub fn address(&self) -> BoardAddress {
        self.address
    }

    /// Dispatcher the session sends through
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Values read so far
    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    /// Forget everything read so far
    pub fn invalidate(&mut self) {
        debug!("{}: cache invalidated", self.address);
        self.cache = SessionCache::default();
    }

    fn run(&mut self, command: Command) -> Result<Reply, DispatchError> {
        let result = self.dispatcher.dispatch(self.address, &command);
        if let Err(err) = &result {
            let lost_contact = matches!(
                err,
                DispatchError::DeviceUnreachable { .. }
                    | DispatchError::MalformedResponse(_)
                    | DispatchError::MalformedPayload { .. }
                    | DispatchError::Cancelled
                    | DispatchError::Transport(_)
            );
            if lost_contact {
                debug!("{}: {} failed: {}", self.address, command.opcode(), err);
                self.invalidate();
            }
        }
        result
    }

    // ---- identity and housekeeping ----

    /// Read the identity block
    pub fn board_info(&mut self) -> Result<BoardInfo, DispatchError> {
        match self.run(Command::BoardInfo)? {
            Reply::BoardInfo(info) => {
                self.cache.onewire_count = Some(info.onewire_count);
                self.cache.info = Some(info.clone());
                Ok(info)
            }
            other => Err(unexpected(Opcode::BoardInfo, other)),
        }
    }

    /// Board serial number (cached)
    pub fn serial_number(&mut self) -> Result<u16, DispatchError> {
        Ok(self.board_info()?.serial_number)
    }

    /// Firmware version (cached)
    pub fn firmware_version(&mut self) -> Result<u16, DispatchError> {
        Ok(self.board_info()?.firmware_version)
    }

    /// Input coupling per channel, read from the board unless cached
    pub fn coupling(&mut self) -> Result<[InputCoupling; CHANNEL_COUNT], DispatchError> {
        match &self.cache.info {
            Some(info) => Ok(info.coupling()),
            None => Ok(self.board_info()?.coupling()),
        }
    }

    /// Round-trip `text` through the board
    pub fn echo(&mut self, text: &str) -> Result<String, DispatchError> {
        text_reply(Opcode::Echo, self.run(Command::Echo(text.to_string()))?)
    }

    /// The command the board received before this one
    ///
    /// This is the only way to confirm that an unanswered command (reset or
    /// broadcast) arrived.
    pub fn last_command(&mut self) -> Result<String, DispatchError> {
        text_reply(Opcode::LastCommand, self.run(Command::LastCommand)?)
    }

    /// Reset the processor
    ///
    /// The board does not answer; success only means the frame was sent. The
    /// board reloads memory slot 0, so the whole cache is dropped.
    pub fn reset(&mut self) -> Result<(), DispatchError> {
        let result = self.run(Command::Reset).map(|_| ());
        self.invalidate();
        result
    }

    /// Board clock in seconds
    pub fn time(&mut self) -> Result<u32, DispatchError> {
        match self.run(Command::GetTime)? {
            Reply::Seconds(seconds) => Ok(seconds),
            other => Err(unexpected(Opcode::GetTime, other)),
        }
    }

    /// Set the board clock
    pub fn set_time(&mut self, seconds: u32) -> Result<(), DispatchError> {
        done(Opcode::SetTime, self.run(Command::SetTime(seconds))?)
    }

    /// Move the board to a new address and optionally a new baud rate
    ///
    /// On success the session follows the board to its new address. A baud
    /// change takes effect on the board immediately; the caller must reopen
    /// the transport at the new rate before the next command.
    pub fn set_comm(
        &mut self,
        new_address: BoardAddress,
        baud_factor: Option<u16>,
    ) -> Result<(), DispatchError> {
        let reply = self.run(Command::SetComm {
            new_address,
            baud_factor,
        })?;
        done(Opcode::SetComm, reply)?;
        self.address = new_address;
        self.invalidate();
        Ok(())
    }

    /// Raw processor ADC reading
    pub fn analog(&mut self, adc_channel: u8) -> Result<u16, DispatchError> {
        value(Opcode::Analog, self.run(Command::Analog(adc_channel))?)
    }

    /// ADC reading scaled by `mv_per_count`
    pub fn analog_volts(&mut self, adc_channel: u8, mv_per_count: f64) -> Result<f64, DispatchError> {
        Ok(adc_volts(self.analog(adc_channel)?, mv_per_count))
    }

    /// Processor temperature in °C
    pub fn chip_temperature(&mut self) -> Result<f64, DispatchError> {
        let raw = value(Opcode::ChipTemp, self.run(Command::ChipTemp)?)?;
        Ok(chip_temp_celsius(raw))
    }

    // ---- channel configuration ----

    /// Read one channel's configuration
    pub fn channel(&mut self, channel: u8) -> Result<ChannelConfig, DispatchError> {
        let word = value(Opcode::GetChannel, self.run(Command::GetChannel(channel))?)?;
        let config = ChannelConfig::from_word(word);
        self.cache.channels[channel as usize] = Some(config);
        Ok(config)
    }

    /// Write one channel's configuration
    pub fn set_channel(&mut self, channel: u8, config: &ChannelConfig) -> Result<(), DispatchError> {
        let result = self.run(Command::SetChannel {
            channel,
            word: config.to_word(),
        });
        if let Some(cached) = self.cache.channels.get_mut(channel as usize) {
            *cached = None;
        }
        done(Opcode::SetChannel, result?)
    }

    /// Read a channel, apply `f`, and write the result back
    pub fn modify_channel(
        &mut self,
        channel: u8,
        f: impl FnOnce(&mut ChannelConfig),
    ) -> Result<ChannelConfig, DispatchError> {
        let mut config = self.channel(channel)?;
        f(&mut config);
        self.set_channel(channel, &config)?;
        Ok(config)
    }

    /// Re-read a channel and compare it with what was written
    pub fn verify_channel(
        &mut self,
        channel: u8,
        expected: &ChannelConfig,
    ) -> Result<bool, DispatchError> {
        Ok(self.channel(channel)? == *expected)
    }

    /// Read every channel in one command
    ///
    /// A channel the board could not read comes back as
    /// [`ChannelReadout::Ambiguous`] and is not cached.
    pub fn all_channels(&mut self) -> Result<[ChannelReadout; CHANNEL_COUNT], DispatchError> {
        let words = channel_values(Opcode::GetAll, self.run(Command::GetAll)?)?;
        let readouts = words.map(ChannelReadout::from_word);
        for (cached, readout) in self.cache.channels.iter_mut().zip(readouts.iter()) {
            *cached = match readout {
                ChannelReadout::Config(config) => Some(*config),
                ChannelReadout::Ambiguous(_) => None,
            };
        }
        Ok(readouts)
    }

    /// Give every channel the same configuration
    pub fn set_all_channels(&mut self, config: &ChannelConfig) -> Result<(), DispatchError> {
        let result = self.run(Command::SetAll(config.to_word()));
        self.cache.clear_channels();
        done(Opcode::SetAll, result?)
    }

    /// Configure every channel individually, in channel order
    pub fn set_each_channel(
        &mut self,
        configs: &[ChannelConfig; CHANNEL_COUNT],
    ) -> Result<(), DispatchError> {
        let result = self.run(Command::SetEach(configs.map(|c| c.to_word())));
        self.cache.clear_channels();
        done(Opcode::SetEach, result?)
    }

    // ---- memory slots ----

    /// Load the configuration stored in `slot`
    pub fn load(&mut self, slot: MemorySlot) -> Result<(), DispatchError> {
        let result = self.run(Command::Load(slot));
        self.cache.clear_channels();
        done(Opcode::Load, result?)
    }

    /// Save the current configuration to `slot`
    ///
    /// Saving to slot 0 changes what the board comes up with after power-up
    /// or reset.
    pub fn save(&mut self, slot: MemorySlot) -> Result<(), DispatchError> {
        done(Opcode::Save, self.run(Command::Save(slot))?)
    }

    // ---- monitors ----

    /// Raw RF power counts for one channel
    pub fn channel_power_counts(&mut self, channel: u8) -> Result<u16, DispatchError> {
        value(Opcode::ChannelPower, self.run(Command::ChannelPower(channel))?)
    }

    /// Raw RF power counts for every channel
    pub fn all_power_counts(&mut self) -> Result<[u16; CHANNEL_COUNT], DispatchError> {
        channel_values(Opcode::AllPower, self.run(Command::AllPower)?)
    }

    /// RF power of one channel in watts
    pub fn channel_power(
        &mut self,
        channel: u8,
        calibration: &PowerCalibration,
    ) -> Result<f64, DispatchError> {
        Ok(calibration.watts(self.channel_power_counts(channel)?))
    }

    /// RF power of every channel in watts
    pub fn all_power(
        &mut self,
        calibration: &PowerCalibration,
    ) -> Result<[f64; CHANNEL_COUNT], DispatchError> {
        Ok(self.all_power_counts()?.map(|c| calibration.watts(c)))
    }

    /// Raw input current counts for one channel
    pub fn channel_current_counts(&mut self, channel: u8) -> Result<u16, DispatchError> {
        value(Opcode::ChannelCurrent, self.run(Command::ChannelCurrent(channel))?)
    }

    /// Raw input current counts for every channel
    pub fn all_current_counts(&mut self) -> Result<[u16; CHANNEL_COUNT], DispatchError> {
        channel_values(Opcode::AllCurrent, self.run(Command::AllCurrent)?)
    }

    /// Input current of one channel in amps, scaled for its coupling
    pub fn channel_current(
        &mut self,
        channel: u8,
        calibration: &CurrentCalibration,
    ) -> Result<f64, DispatchError> {
        let counts = self.channel_current_counts(channel)?;
        let coupling = self.coupling()?[channel as usize];
        Ok(calibration.amps(counts, coupling))
    }

    /// Input current of every channel in amps, per the board's coupling
    pub fn all_current(
        &mut self,
        calibration: &CurrentCalibration,
    ) -> Result<[f64; CHANNEL_COUNT], DispatchError> {
        let counts = self.all_current_counts()?;
        let coupling = self.coupling()?;
        Ok(std::array::from_fn(|chan| {
            calibration.amps(counts[chan], coupling[chan])
        }))
    }

    /// Board supply current in milliamps
    pub fn board_current(&mut self) -> Result<f64, DispatchError> {
        let counts = value(Opcode::BoardCurrent, self.run(Command::BoardCurrent)?)?;
        Ok(board_current_ma(counts))
    }

    // ---- 1-wire ----

    /// Search the 1-wire bus; returns the number of devices found
    pub fn onewire_search(&mut self) -> Result<u8, DispatchError> {
        self.cache.onewire_count = None;
        let count = count(Opcode::OneWireSearch, self.run(Command::OneWireSearch)?)?;
        self.cache.onewire_count = Some(count);
        Ok(count)
    }

    /// Device count from the last search
    pub fn onewire_count(&mut self) -> Result<u8, DispatchError> {
        let count = count(Opcode::OneWireCount, self.run(Command::OneWireCount)?)?;
        self.cache.onewire_count = Some(count);
        Ok(count)
    }

    /// Serial number of the device at `index`
    pub fn onewire_serial(&mut self, index: u8) -> Result<u64, DispatchError> {
        match self.run(Command::OneWireSerial(index))? {
            Reply::Serial(serial) => Ok(serial),
            other => Err(unexpected(Opcode::OneWireSerial, other)),
        }
    }

    /// Temperatures of every device found by the last search, in °C
    pub fn onewire_temperatures(&mut self) -> Result<Vec<f64>, DispatchError> {
        let sensor_count = match self.cache.onewire_count {
            Some(count) => count,
            None => self.onewire_count()?,
        };
        match self.run(Command::OneWireTemps { sensor_count })? {
            Reply::Values(raw) => Ok(raw.into_iter().map(decode_temperature).collect()),
            other => Err(unexpected(Opcode::OneWireTemps, other)),
        }
    }

    /// Serial number and temperature of every device found by the last search
    pub fn onewire_sensors(&mut self) -> Result<Vec<OneWireSensor>, DispatchError> {
        let count = self.onewire_count()?;
        let temperatures = self.onewire_temperatures()?;
        if temperatures.len() != count as usize {
            return Err(DispatchError::MalformedPayload {
                opcode: Opcode::OneWireTemps,
                detail: format!(
                    "{} temperatures for {} devices",
                    temperatures.len(),
                    count
                ),
            });
        }
        temperatures
            .into_iter()
            .enumerate()
            .map(|(index, temperature)| {
                let index = index as u8;
                Ok(OneWireSensor {
                    index,
                    serial_number: self.onewire_serial(index)?,
                    temperature,
                })
            })
            .collect()
    }
}

fn unexpected(opcode: Opcode, reply: Reply) -> DispatchError {
    DispatchError::MalformedPayload {
        opcode,
        detail: format!("unexpected reply {:?}", reply),
    }
}

fn done(opcode: Opcode, reply: Reply) -> Result<(), DispatchError> {
    match reply {
        Reply::Done | Reply::Sent => Ok(()),
        other => Err(unexpected(opcode, other)),
    }
}

fn value(opcode: Opcode, reply: Reply) -> Result<u16, DispatchError> {
    match reply {
        Reply::Value(v) => Ok(v),
        other => Err(unexpected(opcode, other)),
    }
}

fn count(opcode: Opcode, reply: Reply) -> Result<u8, DispatchError> {
    match reply {
        Reply::Count(n) => Ok(n),
        other => Err(unexpected(opcode, other)),
    }
}

fn text_reply(opcode: Opcode, reply: Reply) -> Result<String, DispatchError> {
    match reply {
        Reply::Text(text) => Ok(text),
        other => Err(unexpected(opcode, other)),
    }
}

fn channel_values(opcode: Opcode, reply: Reply) -> Result<[u16; CHANNEL_COUNT], DispatchError> {
    match reply {
        Reply::Values(values) => <[u16; CHANNEL_COUNT]>::try_from(values)
            .map_err(|v| unexpected(opcode, Reply::Values(v))),
        other => Err(unexpected(opcode, other)),
    }
}
