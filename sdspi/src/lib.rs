//! SD card driver speaking the SD Physical Layer protocol in SPI mode.
//!
//! The driver is generic over a [`SpiBus`] (four-wire serial bus plus a
//! card-detect line) and a [`TimeSource`] (monotonic millisecond counter),
//! so the same engine runs against real hardware or a host-side card model.

#![no_std]

extern crate log;

pub mod bus;
pub mod cmd;
pub mod config;
pub mod crc;
mod csd;
mod error;
mod sdcard;

pub use bus::{SpiBus, TimeSource};
pub use config::SECTOR_SIZE;
pub use csd::{Cid, Csd};
pub use error::SdError;
pub use sdcard::{CardKind, SdCard};
