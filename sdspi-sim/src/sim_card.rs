//! A byte-accurate software model of an SPI-attached SD card.
//!
//! The model consumes the exact byte stream a host clocks out (command
//! packets, data tokens, filler) and produces the byte stream a real card
//! answers with: NCR delay, R1/R3/R7 responses, data tokens with CRC
//! trailers, data-response codes and busy windows. Fault hooks corrupt
//! reads, reject writes, swallow resets or yank the card mid-transfer, and
//! a journal records every command and write token for assertions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sdspi::cmd::{
    DATA_RES_ACCEPTED, DATA_RES_CRC_ERROR, DATA_RES_WRITE_ERROR, TOKEN_START_BLOCK,
    TOKEN_START_MULTI_WRITE, TOKEN_STOP_TRAN,
};
use sdspi::crc::{crc16, crc7};
use sdspi::{SpiBus, TimeSource, SECTOR_SIZE};

/// Filler bytes before a queued R1 response (the card's NCR delay).
const NCR_DELAY: usize = 1;
/// Filler bytes before a data start token.
const TOKEN_DELAY: usize = 2;
/// Busy bytes the card holds the line low after accepting a write.
const BUSY_BYTES: u32 = 4;
/// ACMD41 polls answered "still idle" before the card reports powered up.
const POWER_UP_POLLS: u32 = 3;

/// Which card generation the model plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimModel {
    /// Legacy v1 standard-capacity card: rejects SEND_IF_COND, byte addressed
    Sdsc1,
    /// v2 standard-capacity card: answers SEND_IF_COND, CCS clear, byte addressed
    #[cfg_attr(not(test), allow(dead_code))]
    Sdsc2,
    /// High-capacity card: CCS set, block addressed
    Sdhc,
}

/// Everything the host ever put on the wire, for counting assertions.
#[derive(Debug, Default)]
pub struct Journal {
    /// Command index and argument of every packet received
    pub commands: Vec<(u8, u32)>,
    /// Every write-path token received (start-multi, start-single, stop-tran)
    pub write_tokens: Vec<u8>,
    /// Every baud rate the host configured
    pub bauds: Vec<u32>,
}

impl Journal {
    /// How many times command `index` was issued.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn count_cmd(&self, index: u8) -> usize {
        self.commands.iter().filter(|(i, _)| *i == index).count()
    }

    /// The argument of the most recent issue of command `index`.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn last_arg(&self, index: u8) -> Option<u32> {
        self.commands
            .iter()
            .rev()
            .find(|(i, _)| *i == index)
            .map(|(_, arg)| *arg)
    }

    /// How many write-path tokens of value `token` were received.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn count_token(&self, token: u8) -> usize {
        self.write_tokens.iter().filter(|t| **t == token).count()
    }
}

enum Phase {
    Idle,
    Cmd { buf: [u8; 6], got: usize },
    ReadStream { next: u32 },
    WriteAwaitToken { sector: u32, multi: bool },
    WriteData { sector: u32, multi: bool, buf: Vec<u8> },
}

/// The card model. Wrap it in `Arc<Mutex<..>>` and hand [`SimBus`] handles
/// to the driver under test.
pub struct SimCard {
    model: SimModel,
    sectors: u32,
    csd: [u8; 16],
    cid: [u8; 16],
    blocks: HashMap<u32, [u8; SECTOR_SIZE]>,

    present: bool,
    selected: bool,
    ready: bool,
    crc_on: bool,
    acmd: bool,
    power_up_polls_left: u32,
    line_stuck_low: bool,

    phase: Phase,
    tx_queue: Vec<u8>,
    tx_pos: usize,
    busy_left: u32,

    ignore_resets: u32,
    corrupt_reads: u32,
    read_error_token: Option<u8>,
    write_response: Option<u8>,
    die_after_writes: Option<u32>,

    journal: Journal,
}

impl SimCard {
    /// A fresh, inserted, unpowered card of the given geometry. Capacity
    /// for the byte-addressed models must be a multiple of 512 sectors so
    /// it is representable in their CSD.
    pub fn new(model: SimModel, sectors: u32) -> Self {
        let csd = match model {
            SimModel::Sdhc => build_csd_v2(sectors),
            SimModel::Sdsc1 | SimModel::Sdsc2 => build_csd_v1(sectors),
        };
        Self {
            model,
            sectors,
            csd,
            cid: build_cid(),
            blocks: HashMap::new(),
            present: true,
            selected: false,
            ready: false,
            crc_on: false,
            acmd: false,
            power_up_polls_left: POWER_UP_POLLS,
            line_stuck_low: false,
            phase: Phase::Idle,
            tx_queue: Vec::new(),
            tx_pos: 0,
            busy_left: 0,
            ignore_resets: 0,
            corrupt_reads: 0,
            read_error_token: None,
            write_response: None,
            die_after_writes: None,
            journal: Journal::default(),
        }
    }

    /// Insert or remove the card at the slot level. Inserting models a
    /// fresh, unpowered card.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn set_present(&mut self, present: bool) {
        self.present = present;
        self.line_stuck_low = false;
        if present {
            self.reset_card_state();
        }
    }

    /// Whether chip select is currently driven low by the host.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn is_selected(&self) -> bool {
        self.selected
    }

    /// Everything recorded so far.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Forget the recorded traffic.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn clear_journal(&mut self) {
        self.journal = Journal::default();
    }

    /// Direct access to a stored sector, bypassing the bus.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn block(&self, sector: u32) -> Option<&[u8; SECTOR_SIZE]> {
        self.blocks.get(&sector)
    }

    /// Preload a sector, bypassing the bus.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn load_block(&mut self, sector: u32, data: [u8; SECTOR_SIZE]) {
        self.blocks.insert(sector, data);
    }

    /// Swallow the next `n` reset commands without any response.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn ignore_next_resets(&mut self, n: u32) {
        self.ignore_resets = n;
    }

    /// Flip one bit in each of the next `n` data blocks read, leaving the
    /// transmitted CRC computed over the original data.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn corrupt_next_reads(&mut self, n: u32) {
        self.corrupt_reads = n;
    }

    /// Answer the next read data phase with the given error token.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn fail_next_read_with(&mut self, token: u8) {
        self.read_error_token = Some(token);
    }

    /// Force every data-response to the given code until cleared.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn reject_writes_with(&mut self, code: u8) {
        self.write_response = Some(code);
    }

    /// Yank the card after it has accepted `n` more written blocks; the
    /// data line stays low afterwards, as seen on hosts whose transfer
    /// died mid-programming.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn die_after_accepted_writes(&mut self, n: u32) {
        self.die_after_writes = Some(n);
    }

    fn reset_card_state(&mut self) {
        self.ready = false;
        self.crc_on = false;
        self.acmd = false;
        self.power_up_polls_left = POWER_UP_POLLS;
        self.phase = Phase::Idle;
        self.tx_queue.clear();
        self.tx_pos = 0;
        self.busy_left = 0;
    }

    fn r1(&self) -> u8 {
        u8::from(!self.ready)
    }

    fn queue(&mut self, byte: u8) {
        self.tx_queue.push(byte);
    }

    fn queue_r1(&mut self, r1: u8) {
        for _ in 0..NCR_DELAY {
            self.queue(0xFF);
        }
        self.queue(r1);
    }

    fn pop_queued(&mut self) -> Option<u8> {
        if self.tx_pos < self.tx_queue.len() {
            let byte = self.tx_queue[self.tx_pos];
            self.tx_pos += 1;
            Some(byte)
        } else {
            if !self.tx_queue.is_empty() {
                self.tx_queue.clear();
                self.tx_pos = 0;
            }
            None
        }
    }

    fn clear_queued(&mut self) {
        self.tx_queue.clear();
        self.tx_pos = 0;
    }

    /// Clock one byte in each direction.
    pub fn exchange(&mut self, tx: u8) -> u8 {
        if !self.present {
            // a response already on its way out still drains; after that
            // the line floats high for an empty slot and sticks low for a
            // card yanked mid-programming
            if let Some(byte) = self.pop_queued() {
                return byte;
            }
            return if self.line_stuck_low { 0x00 } else { 0xFF };
        }
        if !self.selected {
            return 0xFF;
        }

        // a command packet in flight swallows everything
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Cmd { mut buf, got } => {
                buf[got] = tx;
                if got + 1 == buf.len() {
                    self.process_command(buf);
                } else {
                    self.phase = Phase::Cmd { buf, got: got + 1 };
                }
                return 0xFF;
            }
            other => self.phase = other,
        }

        // a new packet can start at idle or interrupt a read stream
        if tx & 0xC0 == 0x40 && matches!(self.phase, Phase::Idle | Phase::ReadStream { .. }) {
            self.phase = Phase::Cmd {
                buf: [tx, 0, 0, 0, 0, 0],
                got: 1,
            };
            return 0xFF;
        }

        if let Some(byte) = self.pop_queued() {
            return byte;
        }
        if self.busy_left > 0 {
            self.busy_left -= 1;
            return 0x00;
        }

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle | Phase::Cmd { .. } => 0xFF,
            Phase::ReadStream { next } => {
                // the block is materialized lazily, when the host clocks
                // for it; an overrun or injected fault ends the stream
                self.phase = Phase::ReadStream { next: next + 1 };
                self.queue_read_block(next);
                self.pop_queued().unwrap_or(0xFF)
            }
            Phase::WriteAwaitToken { sector, multi } => {
                match tx {
                    0xFF => {
                        self.phase = Phase::WriteAwaitToken { sector, multi };
                    }
                    TOKEN_STOP_TRAN if multi => {
                        self.journal.write_tokens.push(tx);
                        self.busy_left = BUSY_BYTES;
                    }
                    token
                        if token
                            == if multi {
                                TOKEN_START_MULTI_WRITE
                            } else {
                                TOKEN_START_BLOCK
                            } =>
                    {
                        self.journal.write_tokens.push(token);
                        self.phase = Phase::WriteData {
                            sector,
                            multi,
                            buf: Vec::with_capacity(SECTOR_SIZE + 2),
                        };
                    }
                    _ => {}
                }
                0xFF
            }
            Phase::WriteData {
                sector,
                multi,
                mut buf,
            } => {
                buf.push(tx);
                if buf.len() == SECTOR_SIZE + 2 {
                    self.finish_write_block(sector, multi, &buf);
                } else {
                    self.phase = Phase::WriteData { sector, multi, buf };
                }
                0xFF
            }
        }
    }

    fn process_command(&mut self, packet: [u8; 6]) {
        let index = packet[0] & 0x3F;
        let arg = u32::from_be_bytes([packet[1], packet[2], packet[3], packet[4]]);
        self.journal.commands.push((index, arg));

        let was_acmd = self.acmd;
        self.acmd = index == 55;

        // CMD0 and CMD8 carry a checked CRC even in no-CRC mode
        if self.crc_on || index == 0 || index == 8 {
            let expected = (crc7(&packet[..5]) << 1) | 0x01;
            if packet[5] != expected {
                self.queue_r1(self.r1() | 0x08);
                return;
            }
        }

        match index {
            0 => {
                if self.ignore_resets > 0 {
                    self.ignore_resets -= 1;
                    return;
                }
                self.reset_card_state();
                self.queue_r1(0x01);
            }
            8 => match self.model {
                SimModel::Sdsc1 => self.queue_r1(0x05),
                SimModel::Sdsc2 | SimModel::Sdhc => {
                    self.queue_r1(0x01);
                    // voltage accepted, check pattern echoed
                    self.queue(0x00);
                    self.queue(0x00);
                    self.queue(0x01);
                    self.queue(arg as u8);
                }
            },
            59 => {
                self.crc_on = arg & 1 == 1;
                self.queue_r1(self.r1());
            }
            58 => {
                let mut top = 0x00;
                if self.ready {
                    top |= 0x80;
                    if self.model == SimModel::Sdhc {
                        top |= 0x40;
                    }
                }
                self.queue_r1(self.r1());
                self.queue(top);
                self.queue(0xFF);
                self.queue(0x80);
                self.queue(0x00);
            }
            55 => self.queue_r1(self.r1()),
            41 if was_acmd => {
                if self.power_up_polls_left > 0 {
                    self.power_up_polls_left -= 1;
                    self.queue_r1(0x01);
                } else {
                    self.ready = true;
                    self.queue_r1(0x00);
                }
            }
            23 if was_acmd => self.queue_r1(self.r1()),
            16 => {
                if arg == SECTOR_SIZE as u32 {
                    self.queue_r1(self.r1());
                } else {
                    self.queue_r1(self.r1() | 0x40);
                }
            }
            9 => {
                let register = self.csd;
                self.queue_r1(self.r1());
                self.queue_register(&register);
            }
            10 => {
                let register = self.cid;
                self.queue_r1(self.r1());
                self.queue_register(&register);
            }
            17 => match self.decode_address(arg) {
                Ok(sector) => {
                    self.queue_r1(self.r1());
                    self.queue_read_block(sector);
                }
                Err(bits) => self.queue_r1(self.r1() | bits),
            },
            18 => match self.decode_address(arg) {
                Ok(sector) => {
                    self.queue_r1(self.r1());
                    self.phase = Phase::ReadStream { next: sector };
                }
                Err(bits) => self.queue_r1(self.r1() | bits),
            },
            24 | 25 => match self.decode_address(arg) {
                Ok(sector) => {
                    self.queue_r1(self.r1());
                    self.phase = Phase::WriteAwaitToken {
                        sector,
                        multi: index == 25,
                    };
                }
                Err(bits) => self.queue_r1(self.r1() | bits),
            },
            12 => {
                self.clear_queued();
                self.phase = Phase::Idle;
                // the byte right after the packet is garbage on real cards
                self.queue(0xFF);
                self.queue_r1(self.r1());
                self.busy_left = BUSY_BYTES;
            }
            _ => self.queue_r1(self.r1() | 0x04),
        }
    }

    /// Starting addresses arrive as byte offsets on standard-capacity
    /// cards and as sector indices on high-capacity ones. An address the
    /// card cannot interpret earns R1 error bits.
    fn decode_address(&self, arg: u32) -> Result<u32, u8> {
        let sector = match self.model {
            SimModel::Sdhc => arg,
            SimModel::Sdsc1 | SimModel::Sdsc2 => {
                if arg % SECTOR_SIZE as u32 != 0 {
                    return Err(0x20);
                }
                arg / SECTOR_SIZE as u32
            }
        };
        if sector >= self.sectors {
            return Err(0x40);
        }
        Ok(sector)
    }

    fn queue_register(&mut self, register: &[u8; 16]) {
        for _ in 0..TOKEN_DELAY {
            self.queue(0xFF);
        }
        self.queue(TOKEN_START_BLOCK);
        for &byte in register {
            self.queue(byte);
        }
        let crc = crc16(register);
        self.queue((crc >> 8) as u8);
        self.queue(crc as u8);
    }

    fn queue_read_block(&mut self, sector: u32) {
        for _ in 0..TOKEN_DELAY {
            self.queue(0xFF);
        }
        if let Some(token) = self.read_error_token.take() {
            self.queue(token);
            self.phase = Phase::Idle;
            return;
        }
        if sector >= self.sectors {
            self.queue(0x08);
            self.phase = Phase::Idle;
            return;
        }
        let mut data = self.blocks.get(&sector).copied().unwrap_or([0; SECTOR_SIZE]);
        let crc = crc16(&data);
        if self.corrupt_reads > 0 {
            self.corrupt_reads -= 1;
            data[7] ^= 0x40;
        }
        self.queue(TOKEN_START_BLOCK);
        for &byte in data.iter() {
            self.queue(byte);
        }
        self.queue((crc >> 8) as u8);
        self.queue(crc as u8);
    }

    fn finish_write_block(&mut self, sector: u32, multi: bool, buf: &[u8]) {
        let (data, trailer) = buf.split_at(SECTOR_SIZE);
        let crc_ok = !self.crc_on
            || u16::from_be_bytes([trailer[0], trailer[1]]) == crc16(data);
        let response = if let Some(code) = self.write_response {
            code
        } else if sector >= self.sectors {
            DATA_RES_WRITE_ERROR
        } else if !crc_ok {
            DATA_RES_CRC_ERROR
        } else {
            let mut block = [0u8; SECTOR_SIZE];
            block.copy_from_slice(data);
            self.blocks.insert(sector, block);
            DATA_RES_ACCEPTED
        };
        self.queue(response);
        // only an accepted block is programmed, so only it holds the line
        self.busy_left = if response == DATA_RES_ACCEPTED {
            BUSY_BYTES
        } else {
            0
        };
        self.phase = if multi {
            Phase::WriteAwaitToken {
                sector: sector + 1,
                multi: true,
            }
        } else {
            Phase::Idle
        };
        if response == DATA_RES_ACCEPTED {
            if let Some(left) = self.die_after_writes.as_mut() {
                *left -= 1;
                if *left == 0 {
                    self.die_after_writes = None;
                    self.present = false;
                    self.line_stuck_low = true;
                }
            }
        }
    }
}

/// Bus handle the driver owns; every line operation forwards to the shared
/// card model.
pub struct SimBus {
    card: Arc<Mutex<SimCard>>,
}

impl SimBus {
    /// Attach a bus to a card model.
    pub fn new(card: Arc<Mutex<SimCard>>) -> Self {
        Self { card }
    }
}

impl SpiBus for SimBus {
    fn exchange(&mut self, tx: u8) -> u8 {
        self.card.lock().unwrap().exchange(tx)
    }

    fn set_baud(&mut self, baud: u32) {
        self.card.lock().unwrap().journal.bauds.push(baud);
    }

    fn cs_assert(&mut self) {
        self.card.lock().unwrap().selected = true;
    }

    fn cs_deassert(&mut self) {
        self.card.lock().unwrap().selected = false;
    }

    fn card_present(&self) -> bool {
        self.card.lock().unwrap().present
    }
}

/// Deterministic simulated clock: every query nudges time forward, every
/// delay jumps it, so deadline loops always terminate.
#[derive(Clone, Default)]
pub struct SimClock {
    micros: Arc<AtomicU64>,
}

impl TimeSource for SimClock {
    fn ticks_ms(&self) -> u64 {
        self.micros.fetch_add(10, Ordering::Relaxed) / 1000
    }

    fn delay_us(&self, us: u64) {
        self.micros.fetch_add(us, Ordering::Relaxed);
    }
}

fn build_csd_v2(sectors: u32) -> [u8; 16] {
    assert!(sectors % 1024 == 0 && sectors > 0);
    let c_size = sectors / 1024 - 1;
    let mut csd = [
        0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00, 0x00, 0x00, 0x7F, 0x80, 0x0A, 0x40, 0x00,
        0x00,
    ];
    csd[7] = (c_size >> 16) as u8 & 0x3F;
    csd[8] = (c_size >> 8) as u8;
    csd[9] = c_size as u8;
    csd[15] = (crc7(&csd[..15]) << 1) | 0x01;
    csd
}

fn build_csd_v1(sectors: u32) -> [u8; 16] {
    // fixed C_SIZE_MULT = 7 and READ_BL_LEN = 9, so one C_SIZE step is
    // 512 sectors
    assert!(sectors % 512 == 0 && sectors <= 4096 * 512);
    let c_size = sectors / 512 - 1;
    let mut csd = [
        0x00, 0x26, 0x00, 0x32, 0x5F, 0x59, 0x80, 0x00, 0x2D, 0xD8, 0x4F, 0xFF, 0xD2, 0x40, 0x40,
        0x00,
    ];
    csd[6] |= (c_size >> 10) as u8 & 0x03;
    csd[7] = (c_size >> 2) as u8;
    csd[8] |= ((c_size & 0x03) << 6) as u8;
    csd[9] |= (7 >> 1) & 0x03;
    csd[10] |= (7 & 0x01) << 7;
    csd[15] = (crc7(&csd[..15]) << 1) | 0x01;
    csd
}

fn build_cid() -> [u8; 16] {
    let mut cid = [
        0x03, 0x53, 0x44, b'S', b'I', b'M', b'S', b'D', 0x10, 0x00, 0x00, 0xBE, 0xEF, 0x01, 0x86,
        0x00,
    ];
    cid[15] = (crc7(&cid[..15]) << 1) | 0x01;
    cid
}
