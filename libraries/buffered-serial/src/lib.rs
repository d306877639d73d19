#![cfg_attr(not(test), no_std)]

// must go first, the other modules use its macros
mod fmt;

pub mod channel;
pub mod registry;
pub mod ring_buffer;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod uart;

pub use channel::{Rearm, SerialChannel, UartIrq, DEFAULT_CAPACITY};
pub use registry::{Registry, MAX_PORTS};
pub use ring_buffer::RingBuffer;
pub use uart::{HwError, PortId, RxSlot, Uart};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    BufferFull,
    RegistryFull,
    Hardware(HwError),
}

impl From<HwError> for Error {
    fn from(e: HwError) -> Self {
        Error::Hardware(e)
    }
}
