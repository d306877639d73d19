//! Buffered serial channel on top of a one-byte interrupt UART.
//!
//! Application code calls [`SerialChannel::read`] / [`SerialChannel::write`],
//! the interrupt glue calls [`SerialChannel::on_receive_complete`] /
//! [`SerialChannel::on_transmit_complete`].
//!
//! Index ownership:
//! - RX `head`: receive interrupt. RX `tail`: program.
//! - TX `head`: program. TX `tail`: whoever starts the next transmit, which is
//!   the program only while the hardware reports the transmitter idle and the
//!   transmit interrupt otherwise.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embedded_hal_02::serial;

use crate::ring_buffer::RingBuffer;
use crate::uart::{HwError, PortId, RxSlot, Uart};
use crate::Error;

pub const DEFAULT_CAPACITY: usize = 256;

/// Result of re-arming the receiver after a completed byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Rearm {
    /// First request accepted.
    Armed,
    /// First request rejected, accepted after unlock + abort.
    Recovered,
    /// Both requests rejected. Reception stays down until `begin()`.
    Stalled,
}

/// `N` is the slot count of each direction, `N - 1` bytes usable.
pub struct SerialChannel<U, const N: usize = DEFAULT_CAPACITY> {
    uart: U,
    rx: RingBuffer<N>,
    tx: RingBuffer<N>,
    rx_slot: RxSlot,
    rx_overruns: AtomicU32,
    rx_stalled: AtomicBool,
}

impl<U, const N: usize> SerialChannel<U, N> {
    pub const fn new(uart: U) -> Self {
        Self {
            uart,
            rx: RingBuffer::new(),
            tx: RingBuffer::new(),
            rx_slot: RxSlot::new(),
            rx_overruns: AtomicU32::new(0),
            rx_stalled: AtomicBool::new(false),
        }
    }

    pub fn uart(&self) -> &U {
        &self.uart
    }

    pub fn read(&self) -> Option<u8> {
        self.rx.pop()
    }

    /// Read into `bytes` until it is full or nothing is left. Returns the count.
    pub fn read_slice(&self, bytes: &mut [u8]) -> usize {
        let mut n = 0;
        for b in bytes.iter_mut() {
            match self.rx.pop() {
                Some(v) => *b = v,
                None => break,
            }
            n += 1;
        }
        n
    }

    pub fn available(&self) -> bool {
        !self.rx.is_empty()
    }

    pub fn readable_count(&self) -> usize {
        self.rx.len()
    }

    /// Bytes queued but not yet handed to the hardware.
    pub fn tx_pending(&self) -> usize {
        self.tx.len()
    }

    pub fn flush_rx(&self) {
        self.rx.reset();
    }

    /// Drops queued bytes. A byte already handed to the hardware still goes out.
    pub fn flush_tx(&self) {
        self.tx.reset();
    }

    /// Bytes lost because RX was full when they arrived.
    pub fn rx_overruns(&self) -> u32 {
        self.rx_overruns.load(Ordering::Acquire)
    }

    pub fn is_rx_stalled(&self) -> bool {
        self.rx_stalled.load(Ordering::Acquire)
    }
}

impl<U: Uart, const N: usize> SerialChannel<U, N> {
    pub fn port(&self) -> PortId {
        self.uart.port()
    }

    /// Arm the first receive. Must not be called while a receive is armed.
    pub fn begin(&'static self) -> Result<(), HwError> {
        self.uart.arm_receive(&self.rx_slot)?;
        self.rx_stalled.store(false, Ordering::Release);
        debug!("{:?}: rx armed", self.port());
        Ok(())
    }

    /// Queue one byte, starting the transmitter if the hardware is idle.
    pub fn write(&self, byte: u8) -> Result<(), Error> {
        if !self.tx.push(byte) {
            // a queue left behind by an earlier busy or rejected transmit has
            // no completion coming, restart it from here
            if self.uart.is_tx_ready() {
                self.start_transmit();
            }
            return Err(Error::BufferFull);
        }
        // hardware-reported state decides, it can be busy with a byte this
        // channel never submitted
        if self.uart.is_tx_ready() {
            self.start_transmit();
        }
        Ok(())
    }

    /// Queue bytes up to the first one that does not fit. A short count means
    /// the rest has to be retried later.
    pub fn write_slice(&self, bytes: &[u8]) -> usize {
        bytes.iter().take_while(|&&b| self.write(b).is_ok()).count()
    }

    /// Receive-complete interrupt entry point.
    ///
    /// Stores the received byte (dropped and counted when RX is full) and arms
    /// the next receive.
    pub fn on_receive_complete(&'static self) -> Rearm {
        let byte = self.rx_slot.load();
        if !self.rx.push(byte) {
            // only this handler writes the counter
            let n = self.rx_overruns.load(Ordering::Relaxed).wrapping_add(1);
            self.rx_overruns.store(n, Ordering::Release);
            warn!("{:?}: rx overrun, {} bytes dropped", self.port(), n);
        }
        self.rearm_receive()
    }

    /// Transmit-complete interrupt entry point. Sends the next queued byte, or
    /// leaves the transmitter idle for the next `write`.
    pub fn on_transmit_complete(&self) {
        self.start_transmit();
    }

    fn rearm_receive(&'static self) -> Rearm {
        let Err(e) = self.uart.arm_receive(&self.rx_slot) else {
            return Rearm::Armed;
        };
        warn!("{:?}: rx re-arm rejected ({:?}), aborting and retrying", self.port(), e);
        self.uart.unlock_and_abort_receive();
        match self.uart.arm_receive(&self.rx_slot) {
            Ok(()) => Rearm::Recovered,
            Err(e) => {
                self.rx_stalled.store(true, Ordering::Release);
                error!("{:?}: rx re-arm retry failed ({:?}), reception stalled", self.port(), e);
                Rearm::Stalled
            }
        }
    }

    fn start_transmit(&self) {
        let Some(byte) = self.tx.pop() else {
            return;
        };
        trace!("{:?}: tx {}", self.port(), byte);
        if let Err(e) = self.uart.transmit(byte) {
            warn!("{:?}: transmit rejected ({:?}), byte dropped", self.port(), e);
        }
    }
}

/// Interrupt side of a channel, independent of its buffer size and UART type.
pub trait UartIrq: Sync {
    fn port(&self) -> PortId;
    fn on_receive_complete(&'static self) -> Rearm;
    fn on_transmit_complete(&self);
}

impl<U: Uart + Sync, const N: usize> UartIrq for SerialChannel<U, N> {
    fn port(&self) -> PortId {
        SerialChannel::port(self)
    }

    fn on_receive_complete(&'static self) -> Rearm {
        SerialChannel::on_receive_complete(self)
    }

    fn on_transmit_complete(&self) {
        SerialChannel::on_transmit_complete(self)
    }
}

impl<U: Uart, const N: usize> serial::Read<u8> for &SerialChannel<U, N> {
    type Error = Error;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        SerialChannel::read(*self).ok_or(nb::Error::WouldBlock)
    }
}

impl<U: Uart, const N: usize> serial::Write<u8> for &SerialChannel<U, N> {
    type Error = Error;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        SerialChannel::write(*self, word).map_err(|_| nb::Error::WouldBlock)
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        if self.tx.is_empty() && self.uart.is_tx_ready() {
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }
}

impl<U: Uart, const N: usize> core::fmt::Write for &SerialChannel<U, N> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        if self.write_slice(s.as_bytes()) == s.len() {
            Ok(())
        } else {
            Err(core::fmt::Error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimUart;

    fn leak<T>(v: T) -> &'static T {
        Box::leak(Box::new(v))
    }

    fn channel<const N: usize>(port: PortId) -> &'static SerialChannel<SimUart, N> {
        leak(SerialChannel::new(SimUart::new(port)))
    }

    /// Let the simulated wire finish every byte, feeding completions back.
    fn drain_tx<const N: usize>(ch: &'static SerialChannel<SimUart, N>) {
        while ch.uart().finish_transmit().is_some() {
            ch.on_transmit_complete();
        }
    }

    fn receive<const N: usize>(ch: &'static SerialChannel<SimUart, N>, byte: u8) -> Rearm {
        assert!(ch.uart().deliver(byte), "receiver not armed");
        ch.on_receive_complete()
    }

    #[test]
    fn begin_arms_exactly_once() {
        let ch = channel::<16>(PortId::Usart2);
        assert!(!ch.uart().is_armed());
        ch.begin().unwrap();
        assert!(ch.uart().is_armed());
        assert_eq!(ch.uart().arm_requests(), 1);
        assert!(!ch.available());
    }

    #[test]
    fn rejected_begin_propagates_as_hardware_error() {
        fn start(ch: &'static SerialChannel<SimUart, 8>) -> Result<(), Error> {
            ch.begin()?;
            Ok(())
        }

        let ch = channel::<8>(PortId::Usart3);
        ch.uart().reject_next_arms(1);
        assert_eq!(start(ch), Err(Error::Hardware(HwError::Busy)));
        assert!(!ch.uart().is_armed());
        assert_eq!(start(ch), Ok(()));
        assert!(ch.uart().is_armed());
    }

    #[test]
    fn received_bytes_are_read_in_order() {
        let ch = channel::<16>(PortId::Usart1);
        ch.begin().unwrap();
        for b in b"hello" {
            assert_eq!(receive(ch, *b), Rearm::Armed);
        }
        assert!(ch.available());
        assert_eq!(ch.readable_count(), 5);

        let mut buf = [0u8; 8];
        assert_eq!(ch.read_slice(&mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(ch.read(), None);
        assert!(ch.uart().is_armed());
    }

    #[test]
    fn flush_rx_leaves_nothing_available() {
        let ch = channel::<8>(PortId::Usart1);
        ch.begin().unwrap();
        ch.flush_rx();
        assert!(!ch.available());

        for b in 0..5 {
            receive(ch, b);
        }
        assert_eq!(ch.read(), Some(0));
        ch.flush_rx();
        assert!(!ch.available());
        assert_eq!(ch.readable_count(), 0);
        ch.flush_rx();
        assert!(!ch.available());
    }

    #[test]
    fn write_transmits_in_order_one_request_per_byte() {
        let ch = channel::<32>(PortId::Usart3);
        let msg = b"round trip";
        assert_eq!(ch.write_slice(msg), msg.len());
        // first byte went straight to the idle hardware
        assert_eq!(ch.uart().transmit_requests(), 1);
        assert_eq!(ch.tx_pending(), msg.len() - 1);

        drain_tx(ch);
        assert_eq!(ch.uart().take_line().as_slice(), msg);
        assert_eq!(ch.uart().transmit_requests(), msg.len() as u32);
        assert_eq!(ch.tx_pending(), 0);
        assert!(ch.uart().is_tx_ready());
    }

    #[test]
    fn full_tx_buffer_rejects_until_one_byte_is_sent() {
        let ch = channel::<4>(PortId::Usart1);
        // occupies the transmitter, buffer stays empty
        ch.write(0xAA).unwrap();
        assert_eq!(ch.tx_pending(), 0);

        for b in 1..=3 {
            ch.write(b).unwrap();
        }
        assert_eq!(ch.write(4), Err(Error::BufferFull));
        assert_eq!(ch.tx_pending(), 3);

        assert_eq!(ch.uart().finish_transmit(), Some(0xAA));
        ch.on_transmit_complete();
        ch.write(4).unwrap();
        assert_eq!(ch.write(5), Err(Error::BufferFull));

        drain_tx(ch);
        assert_eq!(ch.uart().take_line().as_slice(), &[0xAA, 1, 2, 3, 4]);
    }

    #[test]
    fn short_write_reports_backpressure() {
        let ch = channel::<4>(PortId::Usart1);
        ch.uart().set_tx_busy(true);
        assert_eq!(ch.write_slice(b"abcdef"), 3);
        assert_eq!(ch.tx_pending(), 3);
    }

    #[test]
    fn hardware_busy_keeps_byte_queued() {
        let ch = channel::<8>(PortId::Usart1);
        // transmitter busy with something the channel never submitted
        ch.uart().set_tx_busy(true);
        ch.write(1).unwrap();
        assert_eq!(ch.uart().transmit_requests(), 0);
        assert_eq!(ch.tx_pending(), 1);

        // hardware going idle on its own does not start anything
        ch.uart().set_tx_busy(false);
        assert_eq!(ch.uart().transmit_requests(), 0);

        // the next write sees the idle hardware and sends the oldest byte
        ch.write(2).unwrap();
        assert_eq!(ch.uart().transmit_requests(), 1);
        drain_tx(ch);
        assert_eq!(ch.uart().take_line().as_slice(), &[1, 2]);
    }

    #[test]
    fn full_queue_restarts_once_hardware_goes_idle() {
        let ch = channel::<4>(PortId::Usart1);
        ch.uart().set_tx_busy(true);
        assert_eq!(ch.write_slice(b"abc"), 3);
        ch.uart().set_tx_busy(false);

        // rejected, but the idle transmitter picks up the oldest byte
        assert_eq!(ch.write(b'z'), Err(Error::BufferFull));
        assert_eq!(ch.uart().transmit_requests(), 1);
        assert_eq!(ch.tx_pending(), 2);

        ch.write(b'z').unwrap();
        assert_eq!(serial::Write::flush(&mut &*ch), Err(nb::Error::WouldBlock));
        drain_tx(ch);
        assert_eq!(ch.uart().take_line().as_slice(), b"abcz");
        assert_eq!(serial::Write::flush(&mut &*ch), Ok(()));
    }

    #[test]
    fn transmit_complete_on_empty_buffer_goes_idle() {
        let ch = channel::<8>(PortId::Usart1);
        ch.write(9).unwrap();
        assert_eq!(ch.uart().finish_transmit(), Some(9));
        ch.on_transmit_complete();
        assert!(ch.uart().is_tx_ready());
        assert_eq!(ch.uart().transmit_requests(), 1);

        // spurious completion does nothing
        ch.on_transmit_complete();
        assert_eq!(ch.uart().transmit_requests(), 1);
    }

    #[test]
    fn flush_tx_drops_queued_but_not_in_flight() {
        let ch = channel::<8>(PortId::Usart1);
        ch.write_slice(b"xyz");
        ch.flush_tx();
        assert_eq!(ch.tx_pending(), 0);
        drain_tx(ch);
        assert_eq!(ch.uart().take_line().as_slice(), b"x");
    }

    #[test]
    fn overrun_caps_occupancy_and_is_counted() {
        let ch = channel::<8>(PortId::Usart6);
        ch.begin().unwrap();
        for i in 0..10_000u32 {
            assert_eq!(receive(ch, i as u8), Rearm::Armed);
            assert!(ch.readable_count() <= 7);
        }
        assert_eq!(ch.readable_count(), 7);
        assert_eq!(ch.rx_overruns(), 10_000 - 7);
        for expected in 0..7u8 {
            assert_eq!(ch.read(), Some(expected));
        }
        assert!(!ch.available());

        // indices still coherent after the flood
        receive(ch, 0x42);
        assert_eq!(ch.readable_count(), 1);
        assert_eq!(ch.read(), Some(0x42));
    }

    #[test]
    fn rejected_rearm_recovers_with_unlock_and_retry() {
        let ch = channel::<8>(PortId::Usart2);
        ch.begin().unwrap();
        ch.uart().reject_next_arms(1);
        assert_eq!(receive(ch, 7), Rearm::Recovered);
        assert_eq!(ch.uart().recoveries(), 1);
        assert!(ch.uart().is_armed());
        assert!(!ch.is_rx_stalled());
        assert_eq!(ch.read(), Some(7));

        assert_eq!(receive(ch, 8), Rearm::Armed);
        assert_eq!(ch.read(), Some(8));
    }

    #[test]
    fn second_rejection_stalls_until_begin() {
        let ch = channel::<8>(PortId::Usart2);
        ch.begin().unwrap();
        ch.uart().reject_next_arms(2);
        assert_eq!(receive(ch, 1), Rearm::Stalled);
        assert!(ch.is_rx_stalled());
        assert!(!ch.uart().is_armed());
        // the byte that completed is still kept
        assert_eq!(ch.read(), Some(1));
        assert!(!ch.uart().deliver(2));

        ch.begin().unwrap();
        assert!(!ch.is_rx_stalled());
        assert_eq!(receive(ch, 3), Rearm::Armed);
        assert_eq!(ch.read(), Some(3));
    }

    #[test]
    fn embedded_hal_traits() {
        let ch = channel::<4>(PortId::Uart4);
        ch.begin().unwrap();
        let mut port = ch;

        assert_eq!(serial::Read::read(&mut port), Err(nb::Error::WouldBlock));
        receive(ch, b'k');
        assert_eq!(serial::Read::read(&mut port), Ok(b'k'));

        ch.uart().set_tx_busy(true);
        for b in b"abc" {
            serial::Write::write(&mut port, *b).unwrap();
        }
        assert_eq!(serial::Write::write(&mut port, b'd'), Err(nb::Error::WouldBlock));
        assert_eq!(serial::Write::flush(&mut port), Err(nb::Error::WouldBlock));

        ch.uart().set_tx_busy(false);
        ch.on_transmit_complete();
        drain_tx(ch);
        assert_eq!(serial::Write::flush(&mut port), Ok(()));
        assert_eq!(ch.uart().take_line().as_slice(), b"abc");
    }

    #[test]
    fn formatted_writes_queue_text() {
        use core::fmt::Write as _;

        let ch = channel::<32>(PortId::Uart5);
        let mut port = ch;
        write!(port, "t={}", 42).unwrap();
        drain_tx(ch);
        assert_eq!(ch.uart().take_line().as_slice(), b"t=42");

        ch.uart().set_tx_busy(true);
        assert!(write!(port, "{}", "this does not fit into the buffer").is_err());
    }
}
