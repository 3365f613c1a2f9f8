//! Scaling Functions
//!
//! Converts raw ADC counts reported by a board into physical units:
//! - RF power detector counts → volts → watts
//! - Channel input current counts → amps (coax or fiber scale)
//! - Board supply current counts → milliamps
//! - Processor temperature → °C
//! - Processor ADC counts → volts
//!
//! Calibration constants are caller-supplied; the `Default` impls carry the
//! reference values for the production board.

use serde::{Deserialize, Serialize};

use crate::protocol::CHANNEL_COUNT;

/// How an antenna is connected to a channel input
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputCoupling {
    /// Coax feed; the current monitor measures front-end supply current
    #[default]
    Coax,
    /// Fiber feed; the current monitor measures photodiode current
    Fiber,
}

impl InputCoupling {
    /// Decode the `ARXN` coupling map: bit N set means channel N is fiber
    pub fn from_map(map: u16) -> [InputCoupling; CHANNEL_COUNT] {
        std::array::from_fn(|chan| {
            if map & (1 << chan) != 0 {
                InputCoupling::Fiber
            } else {
                InputCoupling::Coax
            }
        })
    }

    /// Encode per-channel couplings as a coupling map
    pub fn to_map(couplings: &[InputCoupling; CHANNEL_COUNT]) -> u16 {
        couplings
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == InputCoupling::Fiber)
            .fold(0u16, |map, (chan, _)| map | (1 << chan))
    }
}

/// RF power detector calibration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerCalibration {
    /// ADC volts per count
    pub volts_per_count: f64,
    /// Detector voltage gain
    pub detector_gain: f64,
    /// Load impedance
    pub load_ohms: f64,
}

impl Default for PowerCalibration {
    fn default() -> Self {
        Self {
            volts_per_count: 0.004,
            detector_gain: 2.296,
            load_ohms: 50.0,
        }
    }
}

impl PowerCalibration {
    /// Detector output in volts
    pub fn volts(&self, counts: u16) -> f64 {
        counts as f64 * self.volts_per_count / self.detector_gain
    }

    /// RF power in watts
    pub fn watts(&self, counts: u16) -> f64 {
        let v = self.volts(counts);
        v * v / self.load_ohms
    }
}

/// Channel current monitor calibration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentCalibration {
    /// ADC millivolts per count
    pub mv_per_count: f64,
    /// Coax input milliamps per monitor volt
    pub coax_ma_per_volt: f64,
    /// Fiber input milliamps per monitor volt
    pub fiber_ma_per_volt: f64,
}

impl Default for CurrentCalibration {
    fn default() -> Self {
        Self {
            mv_per_count: 4.0,
            coax_ma_per_volt: 100.0,
            fiber_ma_per_volt: 1.0,
        }
    }
}

impl CurrentCalibration {
    /// Monitor output in volts
    pub fn volts(&self, counts: u16) -> f64 {
        counts as f64 * self.mv_per_count / 1000.0
    }

    /// Input current in amps
    pub fn amps(&self, counts: u16, coupling: InputCoupling) -> f64 {
        let ma_per_volt = match coupling {
            InputCoupling::Coax => self.coax_ma_per_volt,
            InputCoupling::Fiber => self.fiber_ma_per_volt,
        };
        self.volts(counts) * ma_per_volt / 1000.0
    }
}

/// Board supply current per ADC count: (2.0 A/V) × (4 mV/count)
pub const BOARD_MA_PER_COUNT: f64 = 8.0;

/// Board supply current in milliamps
pub fn board_current_ma(counts: u16) -> f64 {
    counts as f64 * BOARD_MA_PER_COUNT
}

/// Processor temperature: signed, 0.1 °C per count
pub fn chip_temp_celsius(raw: u16) -> f64 {
    raw as i16 as f64 * 0.1
}

/// Processor ADC reading in volts
pub fn adc_volts(counts: u16, mv_per_count: f64) -> f64 {
    counts as f64 * mv_per_count / 1000.0
}
