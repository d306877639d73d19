//! Host-side stand-in for a one-byte interrupt UART.
//!
//! Nothing happens on its own: the test or demo moves bytes with
//! [`SimUart::deliver`] / [`SimUart::finish_transmit`] and then raises the
//! matching completion through the channel or the registry, the way a real
//! interrupt would.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use ringbuf::Rb;

use crate::uart::{HwError, PortId, RxSlot, Uart};

/// Bytes kept on the simulated wire before the oldest are overwritten.
pub const LINE_LEN: usize = 512;

pub type Line = heapless::Vec<u8, LINE_LEN>;

struct SimState {
    armed: Option<&'static RxSlot>,
    in_flight: Option<u8>,
    line: ringbuf::StaticRb<u8, LINE_LEN>,
    tx_busy: bool,
    reject_arms: u8,
    arm_requests: u32,
    transmit_requests: u32,
    recoveries: u32,
}

pub struct SimUart {
    port: PortId,
    state: Mutex<CriticalSectionRawMutex, RefCell<SimState>>,
}

impl SimUart {
    pub fn new(port: PortId) -> Self {
        Self {
            port,
            state: Mutex::new(RefCell::new(SimState {
                armed: None,
                in_flight: None,
                line: ringbuf::StaticRb::default(),
                tx_busy: false,
                reject_arms: 0,
                arm_requests: 0,
                transmit_requests: 0,
                recoveries: 0,
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut()))
    }

    /// A byte arrives on RX. Lands in the armed slot and disarms, or is lost
    /// when nothing is armed. The caller raises receive-complete on success.
    pub fn deliver(&self, byte: u8) -> bool {
        self.with(|s| match s.armed.take() {
            Some(slot) => {
                slot.store(byte);
                true
            }
            None => false,
        })
    }

    pub fn is_armed(&self) -> bool {
        self.with(|s| s.armed.is_some())
    }

    /// The byte in flight leaves the wire. The caller raises transmit-complete
    /// when this returns `Some`.
    pub fn finish_transmit(&self) -> Option<u8> {
        self.with(|s| {
            let byte = s.in_flight.take()?;
            s.line.push_overwrite(byte);
            Some(byte)
        })
    }

    /// Everything sent since the last call, oldest first.
    pub fn take_line(&self) -> Line {
        self.with(|s| {
            let mut out = Line::new();
            while let Some(b) = s.line.pop() {
                // same capacity as the wire, cannot overflow
                let _ = out.push(b);
            }
            out
        })
    }

    /// Report the transmitter busy regardless of what is in flight.
    pub fn set_tx_busy(&self, busy: bool) {
        self.with(|s| s.tx_busy = busy);
    }

    /// Refuse the next `n` receive requests with [`HwError::Busy`].
    pub fn reject_next_arms(&self, n: u8) {
        self.with(|s| s.reject_arms = n);
    }

    pub fn arm_requests(&self) -> u32 {
        self.with(|s| s.arm_requests)
    }

    pub fn transmit_requests(&self) -> u32 {
        self.with(|s| s.transmit_requests)
    }

    pub fn recoveries(&self) -> u32 {
        self.with(|s| s.recoveries)
    }
}

impl Uart for SimUart {
    fn port(&self) -> PortId {
        self.port
    }

    fn arm_receive(&self, slot: &'static RxSlot) -> Result<(), HwError> {
        self.with(|s| {
            s.arm_requests += 1;
            if s.reject_arms > 0 {
                s.reject_arms -= 1;
                return Err(HwError::Busy);
            }
            if s.armed.is_some() {
                return Err(HwError::Busy);
            }
            s.armed = Some(slot);
            Ok(())
        })
    }

    fn transmit(&self, byte: u8) -> Result<(), HwError> {
        self.with(|s| {
            if s.tx_busy || s.in_flight.is_some() {
                return Err(HwError::Busy);
            }
            s.transmit_requests += 1;
            s.in_flight = Some(byte);
            Ok(())
        })
    }

    fn is_tx_ready(&self) -> bool {
        self.with(|s| !s.tx_busy && s.in_flight.is_none())
    }

    fn unlock_and_abort_receive(&self) {
        self.with(|s| {
            s.armed = None;
            s.recoveries += 1;
        })
    }
}
