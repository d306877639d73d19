//! Maps a UART instance to the channel that owns it, so interrupt callbacks
//! that only know which peripheral fired can reach the right buffers.
//!
//! The table is filled while interrupts are not yet enabled and only read
//! afterwards. Whoever sets up the interrupts owns it and hands a reference
//! to the dispatch glue, e.g. behind a critical section mutex:
//!
//! ```ignore
//! static REGISTRY: Mutex<CriticalSectionRawMutex, RefCell<Registry>> =
//!     Mutex::new(RefCell::new(Registry::new()));
//!
//! fn usart2_rx_complete() {
//!     REGISTRY.lock(|r| r.borrow().receive_complete(PortId::Usart2));
//! }
//! ```

use heapless::Vec;

use crate::channel::UartIrq;
use crate::uart::PortId;
use crate::Error;

/// One entry per supported UART instance.
pub const MAX_PORTS: usize = 6;

#[derive(Clone, Copy)]
struct Entry {
    port: PortId,
    channel: &'static dyn UartIrq,
}

pub struct Registry<const MAX: usize = MAX_PORTS> {
    entries: Vec<Entry, MAX>,
}

impl<const MAX: usize> Registry<MAX> {
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Register `channel` under its own port. An existing entry for the same
    /// port is replaced (last registration wins).
    pub fn register(&mut self, channel: &'static dyn UartIrq) -> Result<(), Error> {
        let port = channel.port();
        if let Some(e) = self.entries.iter_mut().find(|e| e.port == port) {
            warn!("registry: {:?} registered twice, replacing", port);
            e.channel = channel;
            return Ok(());
        }
        self.entries
            .push(Entry { port, channel })
            .map_err(|_| Error::RegistryFull)?;
        debug!("registry: {:?} registered", port);
        Ok(())
    }

    /// Returns whether `port` had an entry.
    pub fn unregister(&mut self, port: PortId) -> bool {
        match self.entries.iter().position(|e| e.port == port) {
            Some(n) => {
                self.entries.swap_remove(n);
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, port: PortId) -> Option<&'static dyn UartIrq> {
        self.entries
            .iter()
            .find(|e| e.port == port)
            .map(|e| e.channel)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Receive-complete for `port`. Ignored when nothing is registered.
    pub fn receive_complete(&self, port: PortId) {
        match self.lookup(port) {
            Some(ch) => {
                ch.on_receive_complete();
            }
            None => trace!("registry: rx complete for unregistered {:?}", port),
        }
    }

    /// Transmit-complete for `port`. Ignored when nothing is registered.
    pub fn transmit_complete(&self, port: PortId) {
        match self.lookup(port) {
            Some(ch) => ch.on_transmit_complete(),
            None => trace!("registry: tx complete for unregistered {:?}", port),
        }
    }
}

impl<const MAX: usize> Default for Registry<MAX> {
    fn default() -> Self {
        Self::new()
    }
}
