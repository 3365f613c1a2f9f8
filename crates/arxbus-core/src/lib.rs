//! # ArxBus Core Library
//!
//! Host-side driver for ARX analog receiver boards on a shared RS-485 bus.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Frame encoding and decoding for the ARX command/response protocol
//! - A bus transport that keeps exactly one command in flight
//! - Typed command dispatch with per-opcode error reasons
//! - The channel configuration word codec
//! - Board sessions with cached reads, memory slots and 1-wire sensors
//! - Scaling of monitor readings to physical units
//! - A simulated bus for testing without hardware
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use arxbus_core::prelude::*;
//!
//! let config = BusConfig::load("arx-bus.json")?;
//! let transport = Arc::new(BusTransport::open(config)?);
//! let mut board = BoardSession::new(Dispatcher::new(transport), BoardAddress::new(0x9F)?);
//!
//! let atten = Attenuation::from_db(12.5)?;
//! board.modify_channel(3, |c| c.atten1 = atten)?;
//! for (chan, readout) in board.all_channels()?.iter().enumerate() {
//!     println!("{}: {:?}", chan, readout);
//! }
//! ```

pub mod board;
pub mod channel;
pub mod onewire;
pub mod protocol;
pub mod scaling;
pub mod sim;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::board::BoardSession;
    pub use crate::channel::{Attenuation, ChannelConfig, ChannelReadout};
    pub use crate::onewire::OneWireSensor;
    pub use crate::protocol::{
        AsyncDispatcher, BoardAddress, BoardInfo, BusConfig, BusTransport, Command,
        DispatchError, Dispatcher, FailureReason, MemorySlot, Opcode, Reply,
    };
    pub use crate::scaling::{CurrentCalibration, InputCoupling, PowerCalibration};
    pub use crate::sim::{SimBoard, SimSensor, SimulatedBus};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
