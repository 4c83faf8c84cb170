#![deny(clippy::all)]
#![deny(clippy::pedantic)]

use std::sync::{Arc, Mutex};

use clap::Parser;
use diskio::{Ioctl, SdDisk};
use sdspi::SdCard;

use sim_card::{SimBus, SimCard, SimClock, SimModel};

mod sim_card;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Simulate a legacy byte-addressed card instead of an SDHC one
    #[arg(short, long)]
    legacy: bool,

    /// Card capacity in sectors (multiple of 1024)
    #[arg(short = 'c', long, default_value_t = 65536)]
    sectors: u32,

    /// Sectors covered by the soak pass
    #[arg(short = 'n', long, default_value_t = 256)]
    soak: u32,
}

fn main() {
    let cli = Cli::parse();
    let model = if cli.legacy {
        SimModel::Sdsc1
    } else {
        SimModel::Sdhc
    };

    println!("Bringing up a simulated {model:?} card of {} sectors...", cli.sectors);
    let card = Arc::new(Mutex::new(SimCard::new(model, cli.sectors)));
    let engine = Arc::new(spin::Mutex::new(SdCard::new(
        SimBus::new(Arc::clone(&card)),
        SimClock::default(),
    )));
    let disk = SdDisk::new(engine);
    disk.initialize(0).expect("card failed to initialize");

    let mut reported = 0u32;
    disk.ioctl(0, Ioctl::SectorCount(&mut reported))
        .expect("capacity query failed");
    println!("Card reports {reported} sectors");

    println!("Soaking {} sectors...", cli.soak);
    let soak = cli.soak.min(cli.sectors);
    let mut written = vec![0u8; soak as usize * 512];
    for byte in &mut written {
        *byte = rand::random();
    }
    for (index, chunk) in written.chunks(8 * 512).enumerate() {
        let sector = index as u32 * 8;
        disk.write(0, chunk, sector, chunk.len() / 512)
            .expect("soak write failed");
    }
    let mut read = vec![0u8; written.len()];
    for (index, chunk) in read.chunks_mut(16 * 512).enumerate() {
        let sector = index as u32 * 16;
        disk.read(0, chunk, sector, chunk.len() / 512)
            .expect("soak read failed");
    }
    assert_eq!(written, read, "soak data mismatch");
    println!("Soak passed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskio::{DiskError, DiskStatus, MountMonitor, Volume};
    use sdspi::config::{FAST_BAUD, INIT_BAUD, READ_RETRIES};
    use sdspi::{CardKind, SdError};

    const SDHC_SECTORS: u32 = 65536;

    fn rig(model: SimModel, sectors: u32) -> (Arc<Mutex<SimCard>>, SdCard<SimBus, SimClock>) {
        let card = Arc::new(Mutex::new(SimCard::new(model, sectors)));
        let engine = SdCard::new(SimBus::new(Arc::clone(&card)), SimClock::default());
        (card, engine)
    }

    fn disk_rig(
        model: SimModel,
        sectors: u32,
    ) -> (Arc<Mutex<SimCard>>, SdDisk<SimBus, SimClock>) {
        let (card, engine) = rig(model, sectors);
        let disk = SdDisk::new(Arc::new(spin::Mutex::new(engine)));
        (card, disk)
    }

    fn pattern(seed: usize, len: usize) -> Vec<u8> {
        (0..len).map(|i| ((seed + i) % 256) as u8).collect()
    }

    #[test]
    fn init_without_card_reports_no_card() {
        let (card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        card.lock().unwrap().set_present(false);
        assert_eq!(engine.init(), Err(SdError::NoCard));
        assert_eq!(engine.last_error(), Some(SdError::NoCard));
        assert!(!engine.is_ready());
    }

    #[test]
    fn sdhc_init_identifies_card() {
        let (card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        card.lock().unwrap().ignore_next_resets(1);
        engine.init().unwrap();

        assert!(engine.is_ready());
        assert!(engine.is_sdhc());
        assert_eq!(engine.kind(), Some(CardKind::SdhcXc));
        assert_eq!(engine.sector_count(), Ok(SDHC_SECTORS));
        let cid = engine.cid().unwrap();
        assert_eq!(&cid.product_name(), b"SIMSD");
        assert_eq!(cid.serial(), 0x0000_BEEF);

        let card = card.lock().unwrap();
        let journal = card.journal();
        // the first reset went unanswered, so at least one retry happened
        assert!(journal.count_cmd(0) >= 2);
        assert_eq!(journal.last_arg(8), Some(0x0000_01AA));
        assert_eq!(journal.last_arg(41), Some(1 << 30));
        assert_eq!(journal.last_arg(16), Some(512));
        assert_eq!(journal.count_cmd(58), 2);
        assert_eq!(journal.bauds.first(), Some(&INIT_BAUD));
        assert_eq!(journal.bauds.last(), Some(&FAST_BAUD));
        assert!(card.is_selected());
    }

    #[test]
    fn legacy_card_init() {
        let (_card, mut engine) = rig(SimModel::Sdsc1, 1_984_000);
        engine.init().unwrap();
        assert_eq!(engine.kind(), Some(CardKind::SdscV1));
        assert!(!engine.is_sdhc());
        assert_eq!(engine.sector_count(), Ok(1_984_000));
    }

    #[test]
    fn sdsc_v2_card_stays_byte_addressed() {
        let (card, mut engine) = rig(SimModel::Sdsc2, 8192);
        engine.init().unwrap();
        assert_eq!(engine.kind(), Some(CardKind::SdscV2));

        let data = pattern(3, 512);
        engine.write_blocks(10, &data).unwrap();
        let journal_arg = card.lock().unwrap().journal().last_arg(24);
        assert_eq!(journal_arg, Some(10 * 512));
    }

    #[test]
    fn sdhc_uses_sector_addressing() {
        let (card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        engine.init().unwrap();
        let data = pattern(5, 512);
        engine.write_blocks(10, &data).unwrap();
        assert_eq!(card.lock().unwrap().journal().last_arg(24), Some(10));
    }

    #[test]
    fn single_sector_round_trip() {
        let (card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        engine.init().unwrap();

        let written = pattern(0, 512);
        engine.write_blocks(100, &written).unwrap();
        let mut read = vec![0u8; 512];
        engine.read_blocks(100, &mut read).unwrap();
        assert_eq!(written, read);
        assert_eq!(card.lock().unwrap().block(100).unwrap()[..], written[..]);
    }

    #[test]
    fn adjacent_writes_preserve_layout() {
        let (_card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        engine.init().unwrap();

        let first = pattern(11, 2 * 512);
        let second = pattern(77, 512);
        engine.write_blocks(50, &first).unwrap();
        engine.write_blocks(52, &second).unwrap();

        let mut read = vec![0u8; 3 * 512];
        engine.read_blocks(50, &mut read).unwrap();
        assert_eq!(read[..2 * 512], first[..]);
        assert_eq!(read[2 * 512..], second[..]);
    }

    #[test]
    fn multi_block_round_trip_counts_tokens() {
        let (card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        engine.init().unwrap();
        card.lock().unwrap().clear_journal();

        let written = pattern(0, 65 * 512);
        engine.write_blocks(1000, &written).unwrap();
        let mut read = vec![0u8; written.len()];
        engine.read_blocks(1000, &mut read).unwrap();
        assert_eq!(written, read);

        let card = card.lock().unwrap();
        let journal = card.journal();
        assert_eq!(journal.count_cmd(25), 1);
        assert_eq!(journal.count_token(0xFC), 65);
        assert_eq!(journal.count_token(0xFD), 1);
        assert_eq!(journal.count_cmd(18), 1);
        assert_eq!(journal.count_cmd(12), 1);
        assert_eq!(journal.count_cmd(24), 0);
        assert_eq!(journal.count_cmd(17), 0);
    }

    #[test]
    fn sector_counts_pick_transfer_paths() {
        let (card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        engine.init().unwrap();
        card.lock().unwrap().clear_journal();

        let one = pattern(1, 512);
        engine.write_blocks(0, &one).unwrap();
        let mut buf = vec![0u8; 512];
        engine.read_blocks(0, &mut buf).unwrap();
        {
            let card = card.lock().unwrap();
            assert_eq!(card.journal().count_cmd(24), 1);
            assert_eq!(card.journal().count_cmd(17), 1);
            assert_eq!(card.journal().count_cmd(25), 0);
            assert_eq!(card.journal().count_cmd(18), 0);
        }

        card.lock().unwrap().clear_journal();
        let two = pattern(2, 2 * 512);
        engine.write_blocks(4, &two).unwrap();
        let mut buf = vec![0u8; 2 * 512];
        engine.read_blocks(4, &mut buf).unwrap();
        let card = card.lock().unwrap();
        assert_eq!(card.journal().count_cmd(25), 1);
        assert_eq!(card.journal().count_cmd(18), 1);
        assert_eq!(card.journal().count_cmd(24), 0);
        assert_eq!(card.journal().count_cmd(17), 0);
    }

    #[test]
    fn stress_128_sectors() {
        let (_card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        engine.init().unwrap();

        let mut written = vec![0u8; 128 * 512];
        for byte in &mut written {
            *byte = rand::random();
        }
        engine.write_blocks(0, &written).unwrap();
        let mut read = vec![0u8; written.len()];
        engine.read_blocks(0, &mut read).unwrap();
        assert_eq!(written, read);
    }

    #[test]
    fn crc_error_retries_then_succeeds() {
        let (card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        engine.init().unwrap();
        let written = pattern(9, 512);
        engine.write_blocks(7, &written).unwrap();
        card.lock().unwrap().clear_journal();

        card.lock().unwrap().corrupt_next_reads(1);
        let mut read = vec![0u8; 512];
        engine.read_blocks(7, &mut read).unwrap();
        assert_eq!(written, read);
        assert_eq!(card.lock().unwrap().journal().count_cmd(17), 2);
    }

    #[test]
    fn crc_error_exhausts_retries() {
        let (card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        engine.init().unwrap();
        card.lock().unwrap().clear_journal();

        card.lock().unwrap().corrupt_next_reads(READ_RETRIES as u32);
        let mut read = vec![0u8; 512];
        assert_eq!(engine.read_blocks(7, &mut read), Err(SdError::CrcData));
        assert_eq!(engine.last_error(), Some(SdError::CrcData));
        assert_eq!(
            card.lock().unwrap().journal().count_cmd(17),
            READ_RETRIES
        );
    }

    #[test]
    fn boundary_sectors() {
        let (card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        engine.init().unwrap();

        let last = pattern(42, 512);
        card.lock()
            .unwrap()
            .load_block(SDHC_SECTORS - 1, last.clone().try_into().unwrap());

        let mut buf = vec![0u8; 512];
        engine.read_blocks(0, &mut buf).unwrap();
        engine.read_blocks(SDHC_SECTORS - 1, &mut buf).unwrap();
        assert_eq!(buf, last);

        card.lock().unwrap().clear_journal();
        assert_eq!(
            engine.read_blocks(SDHC_SECTORS, &mut buf),
            Err(SdError::OutOfRange)
        );
        // no retry for a hard error
        assert_eq!(card.lock().unwrap().journal().count_cmd(17), 1);

        let data = pattern(4, 512);
        assert_eq!(
            engine.write_blocks(SDHC_SECTORS, &data),
            Err(SdError::OutOfRange)
        );
    }

    #[test]
    fn read_error_tokens_map_to_causes() {
        let (card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        engine.init().unwrap();
        let mut buf = vec![0u8; 512];

        card.lock().unwrap().fail_next_read_with(0x04);
        assert_eq!(engine.read_blocks(3, &mut buf), Err(SdError::Eccfail));
        card.lock().unwrap().fail_next_read_with(0x02);
        assert_eq!(
            engine.read_blocks(3, &mut buf),
            Err(SdError::CardController)
        );
        card.lock().unwrap().fail_next_read_with(0x01);
        assert_eq!(engine.read_blocks(3, &mut buf), Err(SdError::General));
    }

    #[test]
    fn aborted_multi_read_sends_one_stop() {
        let (card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        engine.init().unwrap();
        card.lock().unwrap().clear_journal();

        let mut buf = vec![0u8; 4 * 512];
        assert_eq!(
            engine.read_blocks(SDHC_SECTORS - 2, &mut buf),
            Err(SdError::OutOfRange)
        );
        let card = card.lock().unwrap();
        assert_eq!(card.journal().count_cmd(18), 1);
        assert_eq!(card.journal().count_cmd(12), 1);
    }

    #[test]
    fn write_reject_aborts_with_one_stop_token() {
        let (card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        engine.init().unwrap();
        card.lock().unwrap().clear_journal();

        card.lock().unwrap().reject_writes_with(0x0D);
        let data = pattern(8, 4 * 512);
        assert_eq!(
            engine.write_blocks(20, &data),
            Err(SdError::WriteReject)
        );
        assert_eq!(engine.last_error(), Some(SdError::WriteReject));
        let card = card.lock().unwrap();
        assert_eq!(card.journal().count_token(0xFC), 1);
        assert_eq!(card.journal().count_token(0xFD), 1);
    }

    #[test]
    fn single_write_reject_surfaces() {
        let (card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        engine.init().unwrap();

        card.lock().unwrap().reject_writes_with(0x0B);
        let data = pattern(6, 512);
        assert_eq!(engine.write_blocks(2, &data), Err(SdError::CrcData));
    }

    #[test]
    fn unplug_mid_write_times_out() {
        let (card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        engine.init().unwrap();

        card.lock().unwrap().die_after_accepted_writes(3);
        let data = pattern(1, 10 * 512);
        assert_eq!(engine.write_blocks(0, &data), Err(SdError::Timeout));
        assert!(!engine.card_present());
    }

    #[test]
    fn init_reruns_safely() {
        let (_card, mut engine) = rig(SimModel::Sdhc, SDHC_SECTORS);
        engine.init().unwrap();
        let first = engine.sector_count().unwrap();
        engine.init().unwrap();
        assert_eq!(engine.sector_count(), Ok(first));
        assert!(engine.is_ready());
    }

    #[test]
    fn disk_drive_validation() {
        let (_card, disk) = disk_rig(SimModel::Sdhc, SDHC_SECTORS);
        assert_eq!(disk.initialize(1), Err(DiskError::Param));
        assert_eq!(
            disk.status(1),
            DiskStatus::NO_INIT | DiskStatus::NO_DISK
        );
        let mut buf = vec![0u8; 512];
        assert_eq!(disk.read(1, &mut buf, 0, 1), Err(DiskError::Param));
    }

    #[test]
    fn disk_lifecycle_and_ioctl() {
        let (_card, disk) = disk_rig(SimModel::Sdhc, SDHC_SECTORS);
        assert_eq!(disk.status(0), DiskStatus::NO_INIT);

        disk.initialize(0).unwrap();
        assert_eq!(disk.status(0), DiskStatus::empty());

        let mut sector_size = 0u16;
        disk.ioctl(0, Ioctl::SectorSize(&mut sector_size)).unwrap();
        assert_eq!(sector_size, 512);

        let mut block_size = 0u32;
        disk.ioctl(0, Ioctl::BlockSize(&mut block_size)).unwrap();
        assert_eq!(block_size, 1);

        let mut sectors = 0u32;
        disk.ioctl(0, Ioctl::SectorCount(&mut sectors)).unwrap();
        assert_eq!(sectors, SDHC_SECTORS);

        disk.ioctl(0, Ioctl::Sync).unwrap();
    }

    #[test]
    fn disk_requires_init_before_io() {
        let (_card, disk) = disk_rig(SimModel::Sdhc, SDHC_SECTORS);
        let mut buf = vec![0u8; 512];
        assert_eq!(disk.read(0, &mut buf, 0, 1), Err(DiskError::NotInitialized));
        assert_eq!(disk.write(0, &buf, 0, 1), Err(DiskError::NotInitialized));
    }

    #[test]
    fn disk_validates_buffer_shape() {
        let (_card, disk) = disk_rig(SimModel::Sdhc, SDHC_SECTORS);
        disk.initialize(0).unwrap();
        let mut buf = vec![0u8; 512];
        assert_eq!(disk.read(0, &mut buf, 0, 0), Err(DiskError::Param));
        assert_eq!(disk.read(0, &mut buf, 0, 2), Err(DiskError::Param));
    }

    #[test]
    fn disk_folds_driver_errors() {
        let (_card, disk) = disk_rig(SimModel::Sdhc, SDHC_SECTORS);
        disk.initialize(0).unwrap();
        let mut buf = vec![0u8; 512];
        assert_eq!(disk.read(0, &mut buf, SDHC_SECTORS, 1), Err(DiskError::Io));
        assert_eq!(disk.last_error(), Some(SdError::OutOfRange));
    }

    #[test]
    fn disk_reports_missing_card() {
        let (card, disk) = disk_rig(SimModel::Sdhc, SDHC_SECTORS);
        card.lock().unwrap().set_present(false);
        assert_eq!(
            disk.status(0),
            DiskStatus::NO_INIT | DiskStatus::NO_DISK
        );
        assert_eq!(disk.initialize(0), Err(DiskError::NoDisk));
    }

    struct FakeVolume {
        disk: SdDisk<SimBus, SimClock>,
        mounts: usize,
        unmounts: usize,
    }

    impl Volume for FakeVolume {
        fn mount(&mut self) -> Result<(), DiskError> {
            self.disk.initialize(0)?;
            self.mounts += 1;
            Ok(())
        }

        fn unmount(&mut self) {
            self.unmounts += 1;
        }
    }

    fn monitor_rig(
        model: SimModel,
        sectors: u32,
    ) -> (
        Arc<Mutex<SimCard>>,
        SdDisk<SimBus, SimClock>,
        MountMonitor<SimBus, SimClock, FakeVolume>,
    ) {
        let (card, disk) = disk_rig(model, sectors);
        let volume = FakeVolume {
            disk: disk.clone(),
            mounts: 0,
            unmounts: 0,
        };
        let monitor = MountMonitor::new(disk.clone(), volume);
        (card, disk, monitor)
    }

    #[test]
    fn mounts_on_insert_unmounts_on_remove() {
        let (card, disk, mut monitor) = monitor_rig(SimModel::Sdhc, SDHC_SECTORS);
        card.lock().unwrap().set_present(false);
        assert!(!monitor.ready());
        assert_eq!(monitor.volume().mounts, 0);

        card.lock().unwrap().set_present(true);
        assert!(monitor.ready());
        assert_eq!(monitor.volume().mounts, 1);

        // steady state does not remount
        monitor.tick();
        assert!(monitor.ready());
        assert_eq!(monitor.volume().mounts, 1);

        card.lock().unwrap().set_present(false);
        assert!(!monitor.ready());
        assert_eq!(monitor.volume().unmounts, 1);
        assert_eq!(
            disk.status(0),
            DiskStatus::NO_INIT | DiskStatus::NO_DISK
        );

        // a re-inserted card comes back as a fresh mount
        card.lock().unwrap().set_present(true);
        assert!(monitor.ready());
        assert_eq!(monitor.volume().mounts, 2);
    }

    #[test]
    fn failed_mount_stays_unmounted() {
        let (card, _disk, mut monitor) = monitor_rig(SimModel::Sdhc, SDHC_SECTORS);
        card.lock().unwrap().ignore_next_resets(1000);
        assert!(!monitor.ready());
        assert_eq!(monitor.volume().mounts, 0);

        card.lock().unwrap().ignore_next_resets(0);
        assert!(monitor.ready());
        assert_eq!(monitor.volume().mounts, 1);
    }

    #[test]
    fn unplug_mid_write_unmounts() {
        let (card, disk, mut monitor) = monitor_rig(SimModel::Sdhc, SDHC_SECTORS);
        assert!(monitor.ready());

        card.lock().unwrap().die_after_accepted_writes(3);
        let data = pattern(2, 10 * 512);
        assert_eq!(disk.write(0, &data, 0, 10), Err(DiskError::Io));
        assert_eq!(disk.last_error(), Some(SdError::Timeout));
        assert_eq!(
            disk.status(0),
            DiskStatus::NO_INIT | DiskStatus::NO_DISK
        );

        assert!(!monitor.ready());
        assert_eq!(monitor.volume().unmounts, 1);
        // the monitor released the driver, which parked chip select
        assert!(!card.lock().unwrap().is_selected());
    }
}
