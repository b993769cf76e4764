//! Board support interfaces
//!
//! The driver never touches hardware directly. The board provides a
//! [`HifBus`] for frame exchange with the chip and, for reading downloaded
//! files while the chip is halted, an [`SpiFlash`].

use core::cell::Cell;

use critical_section::Mutex;
use embassy_time::Duration;

/// The host interface bus to the chip
pub trait HifBus {
    /// The error type of the underlying bus
    type BusError;

    /// Read the chip's host interface info word
    ///
    /// The low 16 bits describe the firmware's interface version, see
    /// [`compat`](crate::compat).
    async fn hif_info(&mut self) -> Result<u32, Self::BusError>;

    /// Wake the chip so it can exchange frames
    ///
    /// The driver retries a failed wake a few times before giving up,
    /// see [`WincCfg`](crate::WincCfg).
    async fn wake(&mut self) -> Result<(), Self::BusError>;

    /// Let the chip go back to sleep
    async fn sleep(&mut self) -> Result<(), Self::BusError>;

    /// Wait for `duration`
    async fn delay(&mut self, duration: Duration);

    /// Write one frame, given as a list of parts sent back to back
    ///
    /// The future must not return until the whole frame has been handed
    /// to the chip.
    async fn write_frame(&mut self, parts: &[&[u8]]) -> Result<(), Self::BusError>;

    /// Read one pending frame into `buf`, returning its length
    async fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize, Self::BusError>;

    /// True while the chip has frames waiting to be read
    fn interrupt_pending(&mut self) -> bool;

    /// Acknowledge the interrupt after a frame has been read
    fn interrupt_serviced(&mut self);
}

/// Direct read access to the chip's SPI flash
///
/// Only valid while the chip is halted.
pub trait SpiFlash {
    /// The error type of the underlying flash access
    type FlashError;

    /// Read `buf.len()` bytes starting at `addr`
    async fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::FlashError>;
}

/// An interrupt flag shared between an ISR and [`HifBus::interrupt_pending`]
///
/// ```rust
/// use winc_hif::IrqLatch;
///
/// static WINC_IRQ: IrqLatch = IrqLatch::new();
///
/// // in the edge interrupt handler
/// WINC_IRQ.signal();
/// ```
pub struct IrqLatch {
    pending: Mutex<Cell<bool>>,
}

impl IrqLatch {
    /// Create a cleared latch
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(Cell::new(false)),
        }
    }

    /// Mark the interrupt as pending
    pub fn signal(&self) {
        critical_section::with(|cs| self.pending.borrow(cs).set(true));
    }

    /// True if the interrupt has fired since the last [`IrqLatch::clear`]
    pub fn is_pending(&self) -> bool {
        critical_section::with(|cs| self.pending.borrow(cs).get())
    }

    /// Clear the latch
    pub fn clear(&self) {
        critical_section::with(|cs| self.pending.borrow(cs).set(false));
    }
}

impl Default for IrqLatch {
    fn default() -> Self {
        Self::new()
    }
}
