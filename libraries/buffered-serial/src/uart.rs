//! Contract with the hardware layer that actually moves bytes on the wire.

use core::sync::atomic::{AtomicU8, Ordering};

/// Known UART instances. Interrupt callbacks identify the peripheral that
/// fired by one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PortId {
    Usart1,
    Usart2,
    Usart3,
    Uart4,
    Uart5,
    Usart6,
}

/// Why the hardware refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HwError {
    Busy,
    Fault,
}

/// Landing spot for the byte of an armed one-byte receive.
///
/// The hardware stores into it before raising receive-complete, the channel
/// loads from it inside the handler.
pub struct RxSlot(AtomicU8);

impl RxSlot {
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub fn store(&self, byte: u8) {
        self.0.store(byte, Ordering::Release);
    }

    pub fn load(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for RxSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// One-byte interrupt driven UART.
///
/// Requests return immediately, completion is reported later through the
/// receive-complete / transmit-complete interrupt of [`Uart::port`].
pub trait Uart {
    fn port(&self) -> PortId;

    /// Start receiving one byte into `slot`.
    fn arm_receive(&self, slot: &'static RxSlot) -> Result<(), HwError>;

    /// Start sending one byte.
    fn transmit(&self, byte: u8) -> Result<(), HwError>;

    /// Transmit path idle.
    fn is_tx_ready(&self) -> bool;

    /// Clear a stuck lock and cancel the pending receive.
    fn unlock_and_abort_receive(&self);
}
