//! Protocol constants: units, rates, retry bounds, wait budgets.

/// All card I/O happens in units of 512-byte sectors
pub const SECTOR_SIZE: usize = 512;

/// Bus rate used until the card leaves the idle state (must stay under 400 kHz)
pub const INIT_BAUD: u32 = 400_000;
/// Operational bus rate once initialization completes
pub const FAST_BAUD: u32 = 25_000_000;

/// Power-on settling delay before the first clock burst; cards want at
/// least 1 ms, 10 ms leaves margin
pub const POWER_ON_DELAY_US: u64 = 10_000;
/// Filler bytes clocked with chip select high to synchronize the card (>= 74 clocks)
pub const PRIME_BYTES: usize = 10;

/// A command response must arrive within this many filler bytes
pub const NCR_MAX_FILLERS: usize = 8;

/// Attempts to get the card into the idle state with CMD0
pub const RESET_RETRIES: usize = 10;
/// Backoff between CMD0 attempts
pub const RESET_RETRY_DELAY_US: u64 = 10_000;

/// Budget for the ACMD41 power-up loop
pub const POWER_UP_TIMEOUT_MS: u64 = 1_000;
/// Poll interval inside the power-up loop
pub const POWER_UP_POLL_US: u64 = 1_000;

/// Deadline for a start token to appear after a read command
pub const READ_TIMEOUT_MS: u64 = 100;
/// Deadline for the card to finish programming after a write
pub const WRITE_TIMEOUT_MS: u64 = 500;

/// Transient single-block read failures are retried this many times
pub const READ_RETRIES: usize = 3;
