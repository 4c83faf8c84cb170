//! Disk surface for a FAT filesystem over the SD/SPI driver.
//!
//! [`SdDisk`] is the five-operation block-device interface a FAT library
//! drives; [`MountMonitor`] watches the card slot and keeps the volume
//! mounted exactly while a card is inserted.

#![no_std]

extern crate alloc;
extern crate log;

mod block_dev;
mod mount;

pub use block_dev::{DiskError, DiskStatus, Ioctl, SdDisk};
pub use mount::{MountMonitor, Volume};
