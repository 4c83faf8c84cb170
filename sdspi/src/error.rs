//! The closed set of errors a card operation can produce.

use core::fmt;

use crate::cmd::{ERR_TOKEN_CC_ERROR, ERR_TOKEN_ECC_FAILED, ERR_TOKEN_OUT_OF_RANGE, R1};

/// Everything that can go wrong talking to the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    /// Card-detect line deasserted at the start of an operation
    NoCard,
    /// A wait deadline expired
    Timeout,
    /// R1 reported error bits
    CmdError,
    /// R1 reported a command CRC mismatch
    CrcCmd,
    /// CRC-16 mismatch on a received data block, or the card rejected a
    /// written block over its CRC
    CrcData,
    /// Address or parameter outside the card's range
    OutOfRange,
    /// Internal card-controller error during a read
    CardController,
    /// The card's ECC could not correct the stored data
    Eccfail,
    /// Unspecified read error
    General,
    /// The card rejected a written block for a non-CRC reason
    WriteReject,
    /// A byte that was neither a start token nor an error token arrived
    /// where a start token was required
    DataToken,
}

impl SdError {
    /// Map R1 error bits to an error, if any are set.
    pub fn from_r1(r1: R1) -> Option<SdError> {
        if !r1.intersects(R1::ERROR_BITS) {
            None
        } else if r1.contains(R1::COM_CRC_ERROR) {
            Some(SdError::CrcCmd)
        } else if r1.intersects(R1::PARAMETER_ERROR | R1::ADDRESS_ERROR) {
            Some(SdError::OutOfRange)
        } else {
            Some(SdError::CmdError)
        }
    }

    /// Map a read error token to its specific error.
    pub fn from_read_token(token: u8) -> SdError {
        if token & ERR_TOKEN_OUT_OF_RANGE != 0 {
            SdError::OutOfRange
        } else if token & ERR_TOKEN_ECC_FAILED != 0 {
            SdError::Eccfail
        } else if token & ERR_TOKEN_CC_ERROR != 0 {
            SdError::CardController
        } else {
            SdError::General
        }
    }

    /// Whether a single-block read may be retried after this error.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            SdError::CrcData | SdError::DataToken | SdError::Timeout
        )
    }
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SdError::NoCard => "no card in slot",
            SdError::Timeout => "timed out",
            SdError::CmdError => "command rejected",
            SdError::CrcCmd => "command crc rejected",
            SdError::CrcData => "data crc mismatch",
            SdError::OutOfRange => "address out of range",
            SdError::CardController => "card controller error",
            SdError::Eccfail => "card ecc failed",
            SdError::General => "card read error",
            SdError::WriteReject => "write rejected",
            SdError::DataToken => "unexpected data token",
        };
        write!(f, "{text}")
    }
}
