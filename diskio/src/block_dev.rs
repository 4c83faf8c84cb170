//! The block-device surface consumed by the FAT layer.

use alloc::sync::Arc;

use bitflags::bitflags;
use log::warn;
use sdspi::{SdCard, SdError, SpiBus, TimeSource, SECTOR_SIZE};
use spin::Mutex;

bitflags! {
    /// Drive status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiskStatus: u8 {
        /// The drive has not been initialized
        const NO_INIT = 0x01;
        /// No medium in the slot
        const NO_DISK = 0x02;
    }
}

/// Coarse result codes for the FAT layer. The rich driver error stays
/// available through [`SdDisk::last_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// The drive is not initialized
    NotInitialized,
    /// No card in the slot
    NoDisk,
    /// Invalid drive number or buffer shape
    Param,
    /// The transfer failed
    Io,
}

/// Control operations a FAT implementation issues besides reads and writes.
pub enum Ioctl<'a> {
    /// Flush pending writes. Writes here complete synchronously, so this
    /// always succeeds immediately.
    Sync,
    /// Report the sector size in bytes
    SectorSize(&'a mut u16),
    /// Report the erase-block size in sectors
    BlockSize(&'a mut u32),
    /// Report the medium capacity in sectors
    SectorCount(&'a mut u32),
}

/// Adapter exposing one SD card as drive 0.
///
/// The driver sits behind a mutex shared with the mount monitor; every
/// operation locks it, runs to completion, and unlocks, which is the whole
/// concurrency story on a single-core cooperative system.
pub struct SdDisk<B, T> {
    card: Arc<Mutex<SdCard<B, T>>>,
}

impl<B, T> Clone for SdDisk<B, T> {
    fn clone(&self) -> Self {
        Self {
            card: Arc::clone(&self.card),
        }
    }
}

impl<B: SpiBus, T: TimeSource> SdDisk<B, T> {
    /// Wrap a shared driver handle.
    pub fn new(card: Arc<Mutex<SdCard<B, T>>>) -> Self {
        Self { card }
    }

    /// Bring up drive `drive`. Only drive 0 exists.
    pub fn initialize(&self, drive: u8) -> Result<(), DiskError> {
        check_drive(drive)?;
        let mut card = self.card.lock();
        card.init().map_err(|err| {
            warn!("disk: init failed: {err}");
            match err {
                SdError::NoCard => DiskError::NoDisk,
                _ => DiskError::NotInitialized,
            }
        })
    }

    /// Current status of drive `drive`.
    pub fn status(&self, drive: u8) -> DiskStatus {
        if drive != 0 {
            return DiskStatus::NO_INIT | DiskStatus::NO_DISK;
        }
        let card = self.card.lock();
        if !card.card_present() {
            DiskStatus::NO_INIT | DiskStatus::NO_DISK
        } else if card.is_ready() {
            DiskStatus::empty()
        } else {
            DiskStatus::NO_INIT
        }
    }

    /// Read `count` sectors starting at `sector` into `buf`.
    pub fn read(
        &self,
        drive: u8,
        buf: &mut [u8],
        sector: u32,
        count: usize,
    ) -> Result<(), DiskError> {
        check_drive(drive)?;
        check_buffer(buf.len(), count)?;
        let mut card = self.card.lock();
        if !card.is_ready() {
            return Err(DiskError::NotInitialized);
        }
        card.read_blocks(sector, buf).map_err(fold)
    }

    /// Write `count` sectors starting at `sector` from `buf`.
    pub fn write(&self, drive: u8, buf: &[u8], sector: u32, count: usize) -> Result<(), DiskError> {
        check_drive(drive)?;
        check_buffer(buf.len(), count)?;
        let mut card = self.card.lock();
        if !card.is_ready() {
            return Err(DiskError::NotInitialized);
        }
        card.write_blocks(sector, buf).map_err(fold)
    }

    /// Answer a control request for drive `drive`.
    pub fn ioctl(&self, drive: u8, op: Ioctl<'_>) -> Result<(), DiskError> {
        check_drive(drive)?;
        let card = self.card.lock();
        if !card.is_ready() {
            return Err(DiskError::NotInitialized);
        }
        match op {
            Ioctl::Sync => Ok(()),
            Ioctl::SectorSize(out) => {
                *out = SECTOR_SIZE as u16;
                Ok(())
            }
            Ioctl::BlockSize(out) => {
                *out = 1;
                Ok(())
            }
            Ioctl::SectorCount(out) => {
                *out = card.sector_count().map_err(fold)?;
                Ok(())
            }
        }
    }

    /// Drop the driver's card identity after a removal.
    pub fn release(&self) {
        self.card.lock().release();
    }

    /// The most recent driver-level error, for diagnostics.
    pub fn last_error(&self) -> Option<SdError> {
        self.card.lock().last_error()
    }
}

fn check_drive(drive: u8) -> Result<(), DiskError> {
    if drive == 0 {
        Ok(())
    } else {
        Err(DiskError::Param)
    }
}

fn check_buffer(len: usize, count: usize) -> Result<(), DiskError> {
    if count >= 1 && len == count * SECTOR_SIZE {
        Ok(())
    } else {
        Err(DiskError::Param)
    }
}

fn fold(err: SdError) -> DiskError {
    match err {
        SdError::NoCard => DiskError::NoDisk,
        _ => DiskError::Io,
    }
}
