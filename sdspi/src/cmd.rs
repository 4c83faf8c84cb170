//! Wire-level constants: command indices, tokens, response flags.

use bitflags::bitflags;

/// SD commands used by the driver
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Cmd {
    /// GO_IDLE_STATE: software reset into SPI mode
    CMD0 = 0,
    /// SEND_IF_COND: voltage check, distinguishes v2 cards (SDC V2)
    CMD8 = 8,
    /// SEND_CSD: read the CSD register
    CMD9 = 9,
    /// SEND_CID: read the CID register
    CMD10 = 10,
    /// STOP_TRANSMISSION: end a multiple-block read
    CMD12 = 12,
    /// SET_BLOCKLEN: set the R/W block size
    CMD16 = 16,
    /// READ_SINGLE_BLOCK
    CMD17 = 17,
    /// READ_MULTIPLE_BLOCK
    CMD18 = 18,
    /// SET_WR_BLK_ERASE_COUNT: pre-erase hint before a multi-block write (SDC)
    ACMD23 = 23,
    /// WRITE_BLOCK
    CMD24 = 24,
    /// WRITE_MULTIPLE_BLOCK
    CMD25 = 25,
    /// SD_SEND_OP_COND: initiate the initialization process (SDC)
    ACMD41 = 41,
    /// APP_CMD: leading command for ACMDs
    CMD55 = 55,
    /// READ_OCR
    CMD58 = 58,
    /// CRC_ON_OFF
    CMD59 = 59,
}

impl Cmd {
    /// The 6-bit command index transmitted on the wire.
    pub fn index(self) -> u8 {
        self as u8
    }
}

bitflags! {
    /// The R1 response byte. A byte with the top bit clear is a valid
    /// response; anything other than `IN_IDLE_STATE` set means trouble.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct R1: u8 {
        /// Card is running the initialization process
        const IN_IDLE_STATE = 0x01;
        /// An erase sequence was cleared before executing
        const ERASE_RESET = 0x02;
        /// Command not legal for the card state
        const ILLEGAL_COMMAND = 0x04;
        /// Command packet failed its CRC check
        const COM_CRC_ERROR = 0x08;
        /// Error in the sequence of erase commands
        const ERASE_SEQUENCE_ERROR = 0x10;
        /// Misaligned address for the block length
        const ADDRESS_ERROR = 0x20;
        /// Command argument outside the accepted range
        const PARAMETER_ERROR = 0x40;
    }
}

impl R1 {
    /// Every bit that signals an error (all but the idle bit).
    pub const ERROR_BITS: R1 = R1::from_bits_truncate(0x7E);
}

// Data tokens framing 512-byte blocks on the bus. At idle only 0xFF is on
// the line, so each block is announced by a token below 0xFF.

/// Start token for single-block transfers, each block of a multi-block
/// read, and register reads
pub const TOKEN_START_BLOCK: u8 = 0xFE;
/// Start token for each block of a multi-block write
pub const TOKEN_START_MULTI_WRITE: u8 = 0xFC;
/// Terminator of a multi-block write
pub const TOKEN_STOP_TRAN: u8 = 0xFD;

/// A byte with the top nibble zero and a nonzero low nibble is a read
/// error token.
pub fn is_error_token(byte: u8) -> bool {
    byte & 0xF0 == 0 && byte & 0x0F != 0
}

/// Error token bit: general or unknown error
pub const ERR_TOKEN_ERROR: u8 = 0x01;
/// Error token bit: internal card-controller error
pub const ERR_TOKEN_CC_ERROR: u8 = 0x02;
/// Error token bit: ECC failed on the stored data
pub const ERR_TOKEN_ECC_FAILED: u8 = 0x04;
/// Error token bit: address out of range
pub const ERR_TOKEN_OUT_OF_RANGE: u8 = 0x08;

/// Mask isolating the status bits of a data-response token
pub const DATA_RES_MASK: u8 = 0x1F;
/// Data-response status: block accepted
pub const DATA_RES_ACCEPTED: u8 = 0x05;
/// Data-response status: block rejected, CRC mismatch
pub const DATA_RES_CRC_ERROR: u8 = 0x0B;
/// Data-response status: block rejected, write error
pub const DATA_RES_WRITE_ERROR: u8 = 0x0D;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn r1_error_bits_exclude_idle() {
        assert!(!R1::ERROR_BITS.contains(R1::IN_IDLE_STATE));
        assert!(R1::ERROR_BITS.contains(R1::PARAMETER_ERROR));
        assert!(R1::ERROR_BITS.contains(R1::COM_CRC_ERROR));
    }

    #[test]
    fn error_token_range() {
        assert!(is_error_token(0x08));
        assert!(is_error_token(0x01));
        assert!(!is_error_token(0x00));
        assert!(!is_error_token(TOKEN_START_BLOCK));
        assert!(!is_error_token(0xFF));
    }
}
