//! The SD protocol engine: initialization, block transfers, recovery.

use log::{debug, trace, warn};

use crate::bus::{SpiBus, TimeSource};
use crate::cmd::{
    is_error_token, Cmd, R1, DATA_RES_ACCEPTED, DATA_RES_CRC_ERROR, DATA_RES_MASK,
    TOKEN_START_BLOCK, TOKEN_START_MULTI_WRITE, TOKEN_STOP_TRAN,
};
use crate::config::{
    FAST_BAUD, INIT_BAUD, NCR_MAX_FILLERS, POWER_ON_DELAY_US, POWER_UP_POLL_US,
    POWER_UP_TIMEOUT_MS, PRIME_BYTES, READ_RETRIES, READ_TIMEOUT_MS, RESET_RETRIES,
    RESET_RETRY_DELAY_US, SECTOR_SIZE, WRITE_TIMEOUT_MS,
};
use crate::csd::{Cid, Csd};
use crate::error::SdError;

/// Card generation, fixed at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    /// Standard-capacity card, protocol version 1 (byte addressed)
    SdscV1,
    /// Standard-capacity card, protocol version 2 (byte addressed)
    SdscV2,
    /// High- or extended-capacity card (block addressed)
    SdhcXc,
}

impl CardKind {
    /// Block-addressed cards take sector indices directly; byte-addressed
    /// cards take byte offsets.
    pub fn is_block_addressed(self) -> bool {
        matches!(self, CardKind::SdhcXc)
    }
}

/// Identity captured during initialization, discarded on release.
struct CardState {
    kind: CardKind,
    cid: Cid,
    sectors: u32,
}

/// Driver for one SD card slot.
///
/// All waits busy-poll the [`TimeSource`] against a deadline; operations
/// run to completion before returning, so a single cooperative owner can
/// share the driver between a filesystem and a periodic detect poll.
pub struct SdCard<B, T> {
    bus: B,
    clock: T,
    card: Option<CardState>,
    last_error: Option<SdError>,
}

impl<B: SpiBus, T: TimeSource> SdCard<B, T> {
    /// Wrap a bus and a clock. The card is not touched until `init`.
    pub fn new(bus: B, clock: T) -> Self {
        Self {
            bus,
            clock,
            card: None,
            last_error: None,
        }
    }

    /// Sample the card-detect switch.
    pub fn card_present(&self) -> bool {
        self.bus.card_present()
    }

    /// Whether `init` has completed for the card currently in the slot.
    pub fn is_ready(&self) -> bool {
        self.card.is_some()
    }

    /// Whether the initialized card is high/extended capacity.
    pub fn is_sdhc(&self) -> bool {
        matches!(
            self.card.as_ref().map(|card| card.kind),
            Some(CardKind::SdhcXc)
        )
    }

    /// Card generation, if initialized.
    pub fn kind(&self) -> Option<CardKind> {
        self.card.as_ref().map(|card| card.kind)
    }

    /// Card identification register, if initialized.
    pub fn cid(&self) -> Option<Cid> {
        self.card.as_ref().map(|card| card.cid)
    }

    /// Capacity in 512-byte sectors, fixed for the life of the mount.
    pub fn sector_count(&self) -> Result<u32, SdError> {
        self.card
            .as_ref()
            .map(|card| card.sectors)
            .ok_or(SdError::NoCard)
    }

    /// The most recent failure, kept for shell diagnostics after the
    /// result has been folded into a coarser code upstream.
    pub fn last_error(&self) -> Option<SdError> {
        self.last_error
    }

    /// Drop the card identity and deselect the bus. Called on removal so a
    /// re-inserted card starts from a clean slate.
    pub fn release(&mut self) {
        if self.card.take().is_some() {
            debug!("sd: card released");
        }
        self.bus.cs_deassert();
    }

    /// Run the full initialization sequence.
    ///
    /// Safe to call again on an already-initialized card: the sequence
    /// restarts from the reset state.
    pub fn init(&mut self) -> Result<(), SdError> {
        let result = self.init_inner();
        self.note(result)
    }

    /// Read `buf.len() / 512` sectors starting at logical `sector`.
    pub fn read_blocks(&mut self, sector: u32, buf: &mut [u8]) -> Result<(), SdError> {
        assert!(!buf.is_empty() && buf.len() % SECTOR_SIZE == 0);
        let result = self.read_blocks_inner(sector, buf);
        self.note(result)
    }

    /// Write `buf.len() / 512` sectors starting at logical `sector`.
    pub fn write_blocks(&mut self, sector: u32, buf: &[u8]) -> Result<(), SdError> {
        assert!(!buf.is_empty() && buf.len() % SECTOR_SIZE == 0);
        let result = self.write_blocks_inner(sector, buf);
        self.note(result)
    }

    fn note(&mut self, result: Result<(), SdError>) -> Result<(), SdError> {
        if let Err(err) = result {
            self.last_error = Some(err);
        }
        result
    }

    fn init_inner(&mut self) -> Result<(), SdError> {
        if !self.bus.card_present() {
            return Err(SdError::NoCard);
        }
        self.card = None;
        self.bus.cs_deassert();
        self.bus.set_baud(INIT_BAUD);
        self.clock.delay_us(POWER_ON_DELAY_US);
        // >= 74 clocks with chip select high let the card sync to the bus
        for _ in 0..PRIME_BYTES {
            self.bus.send(0xFF);
        }
        self.bus.cs_assert();
        match self.init_sequence() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.bus.cs_deassert();
                Err(err)
            }
        }
    }

    fn init_sequence(&mut self) -> Result<(), SdError> {
        self.reset_to_idle()?;
        let v2 = self.probe_version()?;
        #[cfg(feature = "crc")]
        self.enable_crc_checks();
        self.check_voltage_window()?;
        self.power_up(v2)?;
        let block_addressed = self.read_capacity_class()?;
        let kind = match (v2, block_addressed) {
            (true, true) => CardKind::SdhcXc,
            (true, false) => CardKind::SdscV2,
            (false, _) => CardKind::SdscV1,
        };
        // high-capacity cards ignore SET_BLOCKLEN; issuing it anyway keeps
        // the path uniform across generations
        let r1 = match self.command(Cmd::CMD16, SECTOR_SIZE as u32) {
            Ok(r1) => r1,
            Err(err) => {
                self.end_cmd();
                return Err(err);
            }
        };
        self.end_cmd();
        if let Some(err) = SdError::from_r1(r1) {
            return Err(err);
        }
        self.bus.set_baud(FAST_BAUD);
        let csd = Csd::new(self.read_register(Cmd::CMD9)?);
        let cid = Cid::new(self.read_register(Cmd::CMD10)?);
        let sectors = csd.sector_count();
        debug!(
            "sd: {:?} card ready, {} sectors ({} MiB)",
            kind,
            sectors,
            sectors / 2048
        );
        self.card = Some(CardState { kind, cid, sectors });
        Ok(())
    }

    /// CMD0 until the card answers idle, with backoff. A card mid-way
    /// through an interrupted transfer can need several attempts.
    fn reset_to_idle(&mut self) -> Result<(), SdError> {
        let mut result = Err(SdError::Timeout);
        for attempt in 0..RESET_RETRIES {
            match self.command(Cmd::CMD0, 0) {
                Ok(r1) => {
                    self.end_cmd();
                    if r1 == R1::IN_IDLE_STATE {
                        if attempt > 0 {
                            debug!("sd: reset took {} attempts", attempt + 1);
                        }
                        return Ok(());
                    }
                    result = Err(SdError::CmdError);
                }
                Err(err) => {
                    self.end_cmd();
                    result = Err(err);
                }
            }
            self.clock.delay_us(RESET_RETRY_DELAY_US);
        }
        if !self.bus.card_present() {
            return Err(SdError::NoCard);
        }
        result
    }

    /// SEND_IF_COND distinguishes v2 cards from legacy ones: v1 cards
    /// reject the command as illegal.
    fn probe_version(&mut self) -> Result<bool, SdError> {
        let r1 = self.command(Cmd::CMD8, 0x0000_01AA)?;
        if r1 == R1::IN_IDLE_STATE {
            let mut tail = [0u8; 4];
            self.bus.receive_into(&mut tail);
            self.end_cmd();
            if tail[2] & 0x0F != 0x01 || tail[3] != 0xAA {
                warn!("sd: interface condition mismatch {tail:02x?}");
                return Err(SdError::CmdError);
            }
            debug!("sd: v2 card");
            Ok(true)
        } else {
            self.end_cmd();
            debug!("sd: v1 card");
            Ok(false)
        }
    }

    /// CRC_ON_OFF(1). Not every card accepts it; the engine still checks
    /// received CRCs either way, so failure is tolerated.
    #[cfg(feature = "crc")]
    fn enable_crc_checks(&mut self) {
        match self.command(Cmd::CMD59, 1) {
            Ok(r1) => {
                self.end_cmd();
                if SdError::from_r1(r1).is_some() {
                    warn!("sd: card kept CRC checking off");
                }
            }
            Err(err) => warn!("sd: CRC_ON_OFF failed: {err}"),
        }
    }

    fn read_ocr(&mut self) -> Result<(R1, [u8; 4]), SdError> {
        let r1 = match self.command(Cmd::CMD58, 0) {
            Ok(r1) => r1,
            Err(err) => {
                self.end_cmd();
                return Err(err);
            }
        };
        let mut ocr = [0u8; 4];
        self.bus.receive_into(&mut ocr);
        self.end_cmd();
        Ok((r1, ocr))
    }

    fn check_voltage_window(&mut self) -> Result<(), SdError> {
        let (r1, ocr) = self.read_ocr()?;
        if SdError::from_r1(r1).is_some() {
            return Err(SdError::CmdError);
        }
        // OCR bits 20/21: the 3.2-3.4 V window this hardware supplies
        if ocr[1] & 0x30 != 0x30 {
            warn!("sd: card voltage window unsupported, ocr {ocr:02x?}");
            return Err(SdError::CmdError);
        }
        Ok(())
    }

    /// ACMD41 until the idle bit clears. HCS is advertised to v2 cards
    /// so high-capacity ones identify themselves in the OCR.
    fn power_up(&mut self, v2: bool) -> Result<(), SdError> {
        let arg = if v2 { 1 << 30 } else { 0 };
        let deadline = self.clock.ticks_ms() + POWER_UP_TIMEOUT_MS;
        loop {
            let r1 = self.app_command(Cmd::ACMD41, arg)?;
            self.end_cmd();
            if r1.is_empty() {
                return Ok(());
            }
            if self.clock.ticks_ms() > deadline {
                return Err(SdError::Timeout);
            }
            self.clock.delay_us(POWER_UP_POLL_US);
        }
    }

    /// Second OCR read, once powered up: the CCS bit is only valid now.
    fn read_capacity_class(&mut self) -> Result<bool, SdError> {
        let (r1, ocr) = self.read_ocr()?;
        if let Some(err) = SdError::from_r1(r1) {
            return Err(err);
        }
        Ok(ocr[0] & 0x40 != 0)
    }

    fn read_blocks_inner(&mut self, sector: u32, buf: &mut [u8]) -> Result<(), SdError> {
        if !self.bus.card_present() {
            return Err(SdError::NoCard);
        }
        let addr = self.block_addr(sector)?;
        if buf.len() == SECTOR_SIZE {
            self.read_single_retrying(addr, buf)
        } else {
            self.read_multi(addr, buf)
        }
    }

    fn write_blocks_inner(&mut self, sector: u32, buf: &[u8]) -> Result<(), SdError> {
        if !self.bus.card_present() {
            return Err(SdError::NoCard);
        }
        let addr = self.block_addr(sector)?;
        if buf.len() == SECTOR_SIZE {
            self.write_single(addr, buf)
        } else {
            self.write_multi(addr, buf)
        }
    }

    /// Translate a logical sector index into the card's address space.
    fn block_addr(&self, sector: u32) -> Result<u32, SdError> {
        let state = self.card.as_ref().ok_or(SdError::NoCard)?;
        if state.kind.is_block_addressed() {
            Ok(sector)
        } else {
            sector
                .checked_mul(SECTOR_SIZE as u32)
                .ok_or(SdError::OutOfRange)
        }
    }

    fn read_single_retrying(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), SdError> {
        let mut attempt = 1;
        loop {
            match self.read_single(addr, buf) {
                Err(err) if err.is_transient() && attempt < READ_RETRIES => {
                    warn!("sd: read attempt {attempt} failed ({err}), retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn read_single(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), SdError> {
        self.command_ready(Cmd::CMD17, addr)?;
        let result = self.receive_block(buf);
        self.end_cmd();
        result
    }

    fn read_multi(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), SdError> {
        self.command_ready(Cmd::CMD18, addr)?;
        let mut result = Ok(());
        for chunk in buf.chunks_mut(SECTOR_SIZE) {
            if let Err(err) = self.receive_block(chunk) {
                result = Err(err);
                break;
            }
        }
        // the card leaves multi-read mode only on STOP_TRANSMISSION, so
        // the stop goes out even when the loop failed; a loop error is
        // never masked by a successful stop
        let stop = self.stop_transmission();
        result.and(stop)
    }

    fn write_single(&mut self, addr: u32, buf: &[u8]) -> Result<(), SdError> {
        self.command_ready(Cmd::CMD24, addr)?;
        self.bus.send(0xFF);
        let result = self
            .send_block(TOKEN_START_BLOCK, buf)
            .and_then(|()| self.wait_not_busy(WRITE_TIMEOUT_MS));
        self.end_cmd();
        result
    }

    fn write_multi(&mut self, addr: u32, buf: &[u8]) -> Result<(), SdError> {
        self.pre_erase((buf.len() / SECTOR_SIZE) as u32);
        self.command_ready(Cmd::CMD25, addr)?;
        let mut result = Ok(());
        for chunk in buf.chunks(SECTOR_SIZE) {
            self.bus.send(0xFF);
            result = self
                .send_block(TOKEN_START_MULTI_WRITE, chunk)
                .and_then(|()| self.wait_not_busy(WRITE_TIMEOUT_MS));
            if result.is_err() {
                break;
            }
        }
        // the stop token goes out on every exit path so the card returns
        // to the transfer-idle state
        self.bus.send(TOKEN_STOP_TRAN);
        self.bus.send(0xFF);
        let drained = self.wait_not_busy(WRITE_TIMEOUT_MS);
        self.end_cmd();
        result.and(drained)
    }

    /// SET_WR_BLK_ERASE_COUNT before a multi-block write. Purely a hint;
    /// cards that reject it still take the write.
    fn pre_erase(&mut self, count: u32) {
        match self.app_command(Cmd::ACMD23, count) {
            Ok(r1) => {
                self.end_cmd();
                if SdError::from_r1(r1).is_some() {
                    warn!("sd: pre-erase hint rejected");
                }
            }
            Err(err) => warn!("sd: pre-erase hint failed: {err}"),
        }
    }

    /// Frame and send one command packet, then poll for its R1.
    fn command(&mut self, cmd: Cmd, arg: u32) -> Result<R1, SdError> {
        let mut packet = [0u8; 6];
        packet[0] = 0x40 | cmd.index();
        packet[1..5].copy_from_slice(&arg.to_be_bytes());
        packet[5] = Self::command_crc(&packet[..5], cmd);
        self.bus.send_all(&packet);
        if cmd == Cmd::CMD12 {
            // stuff byte: the card outputs garbage right after the stop
            self.bus.receive();
        }
        for _ in 0..NCR_MAX_FILLERS {
            let byte = self.bus.receive();
            if byte & 0x80 == 0 {
                trace!("sd: {cmd:?} arg {arg:#010x} -> {byte:#04x}");
                return Ok(R1::from_bits_truncate(byte));
            }
        }
        trace!("sd: {cmd:?} arg {arg:#010x} -> no response");
        Err(SdError::Timeout)
    }

    /// `command`, requiring a clean R1; clocks the inter-command filler
    /// on failure so the bus is left in a defined state.
    fn command_ready(&mut self, cmd: Cmd, arg: u32) -> Result<(), SdError> {
        let r1 = match self.command(cmd, arg) {
            Ok(r1) => r1,
            Err(err) => {
                self.end_cmd();
                return Err(err);
            }
        };
        if let Some(err) = SdError::from_r1(r1) {
            self.end_cmd();
            return Err(err);
        }
        Ok(())
    }

    /// CMD55 prefix, then the application command.
    fn app_command(&mut self, cmd: Cmd, arg: u32) -> Result<R1, SdError> {
        let r1 = self.command(Cmd::CMD55, 0)?;
        self.end_cmd();
        if let Some(err) = SdError::from_r1(r1) {
            return Err(err);
        }
        self.command(cmd, arg)
    }

    #[cfg(feature = "crc")]
    fn command_crc(body: &[u8], _cmd: Cmd) -> u8 {
        (crate::crc::crc7(body) << 1) | 0x01
    }

    #[cfg(not(feature = "crc"))]
    fn command_crc(_body: &[u8], cmd: Cmd) -> u8 {
        // the card validates these two even in no-CRC mode
        match cmd {
            Cmd::CMD0 => 0x95,
            Cmd::CMD8 => 0x87,
            _ => 0xFF,
        }
    }

    /// One filler byte satisfies the inter-command gap. Chip select stays
    /// asserted: dropping it mid-sequence ends a multi-block transfer
    /// early on some cards.
    fn end_cmd(&mut self) {
        self.bus.receive();
    }

    fn stop_transmission(&mut self) -> Result<(), SdError> {
        let r1 = match self.command(Cmd::CMD12, 0) {
            Ok(r1) => r1,
            Err(err) => {
                self.end_cmd();
                return Err(err);
            }
        };
        self.end_cmd();
        if let Some(err) = SdError::from_r1(r1) {
            return Err(err);
        }
        self.wait_not_busy(WRITE_TIMEOUT_MS)
    }

    /// Wait for a start token, mapping error tokens to their causes.
    fn wait_start_token(&mut self) -> Result<(), SdError> {
        let deadline = self.clock.ticks_ms() + READ_TIMEOUT_MS;
        loop {
            let byte = self.bus.receive();
            if byte == TOKEN_START_BLOCK {
                return Ok(());
            }
            if byte == 0xFF {
                if self.clock.ticks_ms() > deadline {
                    return Err(SdError::Timeout);
                }
                continue;
            }
            if is_error_token(byte) {
                return Err(SdError::from_read_token(byte));
            }
            return Err(SdError::DataToken);
        }
    }

    /// Token, payload, CRC trailer of one incoming block.
    fn receive_block(&mut self, buf: &mut [u8]) -> Result<(), SdError> {
        self.wait_start_token()?;
        self.bus.receive_into(buf);
        self.receive_and_check_crc(buf)
    }

    /// Token, payload, CRC trailer of one outgoing block, classified by
    /// the card's data-response byte.
    fn send_block(&mut self, token: u8, data: &[u8]) -> Result<(), SdError> {
        self.bus.send(token);
        self.bus.send_all(data);
        self.send_crc(data);
        match self.bus.receive() & DATA_RES_MASK {
            DATA_RES_ACCEPTED => Ok(()),
            DATA_RES_CRC_ERROR => Err(SdError::CrcData),
            _ => Err(SdError::WriteReject),
        }
    }

    /// Registers arrive framed like a data block: token, payload, CRC.
    fn read_register(&mut self, cmd: Cmd) -> Result<[u8; 16], SdError> {
        self.command_ready(cmd, 0)?;
        let mut raw = [0u8; 16];
        let result = self.receive_block(&mut raw);
        self.end_cmd();
        result.map(|()| raw)
    }

    #[cfg(feature = "crc")]
    fn receive_and_check_crc(&mut self, data: &[u8]) -> Result<(), SdError> {
        let hi = self.bus.receive();
        let lo = self.bus.receive();
        if u16::from_be_bytes([hi, lo]) != crate::crc::crc16(data) {
            return Err(SdError::CrcData);
        }
        Ok(())
    }

    #[cfg(not(feature = "crc"))]
    fn receive_and_check_crc(&mut self, _data: &[u8]) -> Result<(), SdError> {
        self.bus.receive();
        self.bus.receive();
        Ok(())
    }

    #[cfg(feature = "crc")]
    fn send_crc(&mut self, data: &[u8]) {
        self.bus.send_all(&crate::crc::crc16(data).to_be_bytes());
    }

    #[cfg(not(feature = "crc"))]
    fn send_crc(&mut self, _data: &[u8]) {
        self.bus.send_all(&[0xFF, 0xFF]);
    }

    /// Poll the data line until the card stops holding it low.
    fn wait_not_busy(&mut self, budget_ms: u64) -> Result<(), SdError> {
        let deadline = self.clock.ticks_ms() + budget_ms;
        loop {
            if self.bus.receive() == 0xFF {
                return Ok(());
            }
            if self.clock.ticks_ms() > deadline {
                return Err(SdError::Timeout);
            }
        }
    }
}
