//! 1-wire temperature sensors
//!
//! Up to 16 sensors hang off each board's 1-wire bus. A search (`OWSE`)
//! enumerates them; afterwards each has an index, a 64-bit serial number and
//! a temperature reading.

use serde::Serialize;

/// Largest number of 1-wire devices a board tracks
pub const MAX_SENSORS: u8 = 16;

/// Resolution of a sensor reading in °C
pub const DEGREES_PER_COUNT: f64 = 1.0 / 16.0;

/// Decode one raw 16-bit temperature field
///
/// The 12 significant bits sit in the top of the word as a two's complement
/// value in 1/16 °C; the low 4 bits carry no temperature and are dropped.
pub fn decode_temperature(raw: u16) -> f64 {
    ((raw as i16) >> 4) as f64 * DEGREES_PER_COUNT
}

/// One enumerated sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OneWireSensor {
    /// Position in the search order
    pub index: u8,
    /// 64-bit ROM code
    pub serial_number: u64,
    /// Degrees Celsius
    pub temperature: f64,
}
