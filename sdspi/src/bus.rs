//! Hardware seam: the serial bus and the monotonic clock.

/// Full-duplex serial bus with a chip-select output and a card-detect input.
///
/// An implementation owns the four bus lines and nothing else: it clocks
/// bytes, drives chip select, and samples the detect switch. All protocol
/// knowledge lives above this trait.
pub trait SpiBus {
    /// Clock one byte out while capturing the byte clocked in.
    fn exchange(&mut self, tx: u8) -> u8;

    /// Change the bus clock rate.
    fn set_baud(&mut self, baud: u32);

    /// Drive chip select low (card selected).
    fn cs_assert(&mut self);

    /// Drive chip select high (card deselected).
    fn cs_deassert(&mut self);

    /// Whether a card sits in the slot. Implementations translate the
    /// active-low detect line into a plain boolean.
    fn card_present(&self) -> bool;

    /// Send one byte, discarding the byte clocked in.
    fn send(&mut self, byte: u8) {
        self.exchange(byte);
    }

    /// Clock in one byte by sending the 0xFF filler.
    fn receive(&mut self) -> u8 {
        self.exchange(0xFF)
    }

    /// Send a buffer, discarding everything clocked in.
    fn send_all(&mut self, data: &[u8]) {
        for &byte in data {
            self.exchange(byte);
        }
    }

    /// Fill a buffer from the bus by clocking filler bytes.
    fn receive_into(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            *byte = self.exchange(0xFF);
        }
    }
}

/// Monotonic time for deadline waits and settling delays.
///
/// Every wait loop in the driver polls [`TimeSource::ticks_ms`] against a
/// deadline; there is no suspension, only busy-polling, so a stuck card
/// surfaces as a timeout rather than a hang.
pub trait TimeSource {
    /// Milliseconds since some fixed origin. Must never go backwards.
    fn ticks_ms(&self) -> u64;

    /// Busy-wait for at least `us` microseconds.
    fn delay_us(&self, us: u64);
}
