//! Hot-plug lifecycle: mount on insertion, unmount on removal.

use log::{info, warn};
use sdspi::{SpiBus, TimeSource};

use crate::block_dev::{DiskError, DiskStatus, SdDisk};

/// The filesystem seam. A FAT implementation attaches to drive 0 here;
/// its `mount` is expected to bring the disk up through
/// [`SdDisk::initialize`] as part of reading the volume.
pub trait Volume {
    /// Attach the filesystem to the medium.
    fn mount(&mut self) -> Result<(), DiskError>;

    /// Detach the filesystem. Infallible: there is nothing useful to do
    /// about a failure once the medium is gone.
    fn unmount(&mut self);
}

/// Keeps the volume mounted exactly while a card sits in the slot.
///
/// Driven from a periodic timer tick and from [`MountMonitor::ready`];
/// both run the same reconciliation, so the flag is correct whichever
/// fires first after an insertion or removal.
pub struct MountMonitor<B, T, V> {
    disk: SdDisk<B, T>,
    volume: V,
    mounted: bool,
}

impl<B: SpiBus, T: TimeSource, V: Volume> MountMonitor<B, T, V> {
    /// Watch `disk`, attaching `volume` whenever a card appears.
    pub fn new(disk: SdDisk<B, T>, volume: V) -> Self {
        Self {
            disk,
            volume,
            mounted: false,
        }
    }

    /// Reconcile the mounted state with the card-detect line.
    pub fn tick(&mut self) {
        let present = !self.disk.status(0).contains(DiskStatus::NO_DISK);
        if present && !self.mounted {
            match self.volume.mount() {
                Ok(()) => {
                    self.mounted = true;
                    info!("mount: volume mounted");
                }
                Err(err) => warn!("mount: mount failed: {err:?}"),
            }
        } else if !present && self.mounted {
            self.volume.unmount();
            self.disk.release();
            self.mounted = false;
            info!("mount: card removed, volume unmounted");
        }
    }

    /// The single predicate callers consult before issuing I/O.
    pub fn ready(&mut self) -> bool {
        self.tick();
        self.mounted
    }

    /// Current flag without reconciling.
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Access to the attached volume.
    pub fn volume(&self) -> &V {
        &self.volume
    }
}
