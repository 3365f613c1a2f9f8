//! Channel configuration word
//!
//! Every signal channel is configured by one 16-bit word:
//!
//! | Bits  | Field                                           |
//! |-------|-------------------------------------------------|
//! | 0     | low-pass filter wide                            |
//! | 1     | signal enable, compared against bit 0           |
//! | 2     | high-pass filter wide                           |
//! | 3–8   | first attenuator, inverted (0x3F = 0 dB)        |
//! | 9–14  | second attenuator, inverted                     |
//! | 15    | DC power to the input                           |
//!
//! The signal path is on when bits 0 and 1 are equal.

use serde::{Deserialize, Serialize};

use crate::protocol::DispatchError;

const LOWPASS_BIT: u16 = 1 << 0;
const SIGNAL_BIT: u16 = 1 << 1;
const HIGHPASS_BIT: u16 = 1 << 2;
const ATTEN1_SHIFT: u16 = 3;
const ATTEN2_SHIFT: u16 = 9;
const ATTEN_MASK: u16 = 0x3F;
const DC_POWER_BIT: u16 = 1 << 15;

/// Word a board reports for a channel it could not read in `GETA`
pub const UNREADABLE_WORD: u16 = 0xFFFF;

/// Attenuator setting in 0.5 dB steps (0–63, i.e. 0–31.5 dB)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Attenuation(u8);

impl Attenuation {
    /// Largest attenuator setting
    pub const MAX_STEPS: u8 = 63;
    /// Attenuation per step
    pub const STEP_DB: f64 = 0.5;

    /// Attenuation of `steps` half-dB steps
    pub fn new(steps: u8) -> Result<Self, DispatchError> {
        if steps <= Self::MAX_STEPS {
            Ok(Self(steps))
        } else {
            Err(DispatchError::InvalidArgument(format!(
                "attenuation {} out of range 0..={}",
                steps,
                Self::MAX_STEPS
            )))
        }
    }

    /// Nearest step to `db`; fails outside 0–31.5 dB
    pub fn from_db(db: f64) -> Result<Self, DispatchError> {
        let steps = (db / Self::STEP_DB).round();
        if !(0.0..=Self::MAX_STEPS as f64).contains(&steps) {
            return Err(DispatchError::InvalidArgument(format!(
                "attenuation {} dB out of range 0..={} dB",
                db,
                Self::MAX_STEPS as f64 * Self::STEP_DB
            )));
        }
        Ok(Self(steps as u8))
    }

    /// Number of half-dB steps
    pub fn steps(self) -> u8 {
        self.0
    }

    /// Attenuation in dB
    pub fn db(self) -> f64 {
        self.0 as f64 * Self::STEP_DB
    }

    fn from_field(word: u16, shift: u16) -> Self {
        Self((((word >> shift) & ATTEN_MASK) ^ ATTEN_MASK) as u8)
    }

    fn to_field(self, shift: u16) -> u16 {
        ((self.0 as u16 ^ ATTEN_MASK) & ATTEN_MASK) << shift
    }
}

impl TryFrom<u8> for Attenuation {
    type Error = DispatchError;

    fn try_from(steps: u8) -> Result<Self, Self::Error> {
        Self::new(steps)
    }
}

impl From<Attenuation> for u8 {
    fn from(atten: Attenuation) -> u8 {
        atten.0
    }
}

/// Decoded channel configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Wide lowpass filter selected
    pub lowpass_wide: bool,
    /// Signal path switched on
    pub signal_enabled: bool,
    /// Wide highpass filter selected
    pub highpass_wide: bool,
    /// First attenuator
    pub atten1: Attenuation,
    /// Second attenuator
    pub atten2: Attenuation,
    /// DC power supplied to the input
    pub dc_power_on: bool,
}

impl ChannelConfig {
    /// Decode a configuration word
    pub fn from_word(word: u16) -> Self {
        let b0 = word & LOWPASS_BIT != 0;
        let b1 = word & SIGNAL_BIT != 0;
        Self {
            lowpass_wide: b0,
            signal_enabled: b0 == b1,
            highpass_wide: word & HIGHPASS_BIT != 0,
            atten1: Attenuation::from_field(word, ATTEN1_SHIFT),
            atten2: Attenuation::from_field(word, ATTEN2_SHIFT),
            dc_power_on: word & DC_POWER_BIT != 0,
        }
    }

    /// Encode as a configuration word
    pub fn to_word(&self) -> u16 {
        let mut word = 0u16;
        if self.lowpass_wide {
            word |= LOWPASS_BIT;
        }
        if self.lowpass_wide ^ !self.signal_enabled {
            word |= SIGNAL_BIT;
        }
        if self.highpass_wide {
            word |= HIGHPASS_BIT;
        }
        word |= self.atten1.to_field(ATTEN1_SHIFT);
        word |= self.atten2.to_field(ATTEN2_SHIFT);
        if self.dc_power_on {
            word |= DC_POWER_BIT;
        }
        word
    }

    /// Total attenuation of both stages
    pub fn total_attenuation_db(&self) -> f64 {
        self.atten1.db() + self.atten2.db()
    }
}

impl From<u16> for ChannelConfig {
    fn from(word: u16) -> Self {
        Self::from_word(word)
    }
}

impl From<ChannelConfig> for u16 {
    fn from(config: ChannelConfig) -> u16 {
        config.to_word()
    }
}

/// One channel from a bulk read
///
/// A board reports 0xFFFF for a channel it failed to read, but 0xFFFF is also
/// a legal configuration, so such a word is kept and flagged instead of
/// being trusted or discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelReadout {
    /// A word that decodes unambiguously
    Config(ChannelConfig),
    /// The word was 0xFFFF: either that configuration or a read failure
    Ambiguous(ChannelConfig),
}

impl ChannelReadout {
    /// Classify a word from a bulk read
    pub fn from_word(word: u16) -> Self {
        let config = ChannelConfig::from_word(word);
        if word == UNREADABLE_WORD {
            ChannelReadout::Ambiguous(config)
        } else {
            ChannelReadout::Config(config)
        }
    }

    /// The decoded configuration, ambiguous or not
    pub fn config(&self) -> ChannelConfig {
        match self {
            ChannelReadout::Config(config) | ChannelReadout::Ambiguous(config) => *config,
        }
    }

    /// True for a 0xFFFF word
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ChannelReadout::Ambiguous(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_roundtrip_exhaustive() {
        for word in 0..=u16::MAX {
            assert_eq!(ChannelConfig::from_word(word).to_word(), word, "{:#06x}", word);
        }
    }

    #[test]
    fn test_known_word() {
        let config = ChannelConfig {
            lowpass_wide: true,
            signal_enabled: true,
            highpass_wide: false,
            atten1: Attenuation::new(25).unwrap(),
            atten2: Attenuation::new(0).unwrap(),
            dc_power_on: true,
        };
        assert_eq!(config.to_word(), 0xFF33);
        assert_eq!(ChannelConfig::from_word(0xFF33), config);
    }

    #[test]
    fn test_signal_enable_bits() {
        // b0 == b1 means enabled
        assert!(ChannelConfig::from_word(0b00).signal_enabled);
        assert!(ChannelConfig::from_word(0b11).signal_enabled);
        assert!(!ChannelConfig::from_word(0b01).signal_enabled);
        assert!(!ChannelConfig::from_word(0b10).signal_enabled);

        let off = ChannelConfig {
            signal_enabled: false,
            ..ChannelConfig::default()
        };
        assert_eq!(off.to_word() & 0b11, 0b10);
    }

    #[test]
    fn test_default_is_zero_attenuation() {
        // signal off, everything else cleared
        let word = ChannelConfig::default().to_word();
        assert_eq!(word, 0x7FFA);
        assert_eq!(ChannelConfig::from_word(0).atten1.steps(), 63);
    }

    #[test]
    fn test_attenuation() {
        assert!(Attenuation::new(64).is_err());
        assert_eq!(Attenuation::from_db(12.5).unwrap().steps(), 25);
        assert_eq!(Attenuation::from_db(31.5).unwrap().steps(), 63);
        assert!(Attenuation::from_db(32.0).is_err());
        assert!(Attenuation::from_db(-1.0).is_err());
        assert_eq!(Attenuation::new(7).unwrap().db(), 3.5);
    }

    #[test]
    fn test_readout() {
        assert!(ChannelReadout::from_word(0xFFFF).is_ambiguous());
        assert!(!ChannelReadout::from_word(0xFF33).is_ambiguous());
        assert_eq!(
            ChannelReadout::from_word(0xFFFF).config(),
            ChannelConfig::from_word(0xFFFF)
        );
    }

    #[test]
    fn test_serde() {
        let json = r#"{"lowpass_wide":true,"signal_enabled":true,"highpass_wide":false,"atten1":25,"atten2":0,"dc_power_on":true}"#;
        let config: ChannelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.to_word(), 0xFF33);

        let bad = json.replace("25", "64");
        assert!(serde_json::from_str::<ChannelConfig>(&bad).is_err());
    }
}
