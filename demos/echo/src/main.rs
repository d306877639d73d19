//! Echo over two simulated UARTs.
//!
//! USART2 is the console: every received byte is echoed back. Each completed
//! line is also reported on USART3. The host side of both wires is driven
//! from `main`, and the completion "interrupts" go through the registry just
//! like the vector glue on a real board.

use core::cell::RefCell;
use core::fmt::Write as _;

use buffered_serial::sim::SimUart;
use buffered_serial::{Error, PortId, Registry, SerialChannel, Uart};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_hal_02::serial;
use static_cell::StaticCell;

type Console = SerialChannel<SimUart>;
type Report = SerialChannel<SimUart, 64>;

static REGISTRY: Mutex<CriticalSectionRawMutex, RefCell<Registry>> =
    Mutex::new(RefCell::new(Registry::new()));
static CONSOLE: StaticCell<Console> = StaticCell::new();
static REPORT: StaticCell<Report> = StaticCell::new();

fn uart_rx_irq(port: PortId) {
    REGISTRY.lock(|r| r.borrow().receive_complete(port));
}

fn uart_tx_irq(port: PortId) {
    REGISTRY.lock(|r| r.borrow().transmit_complete(port));
}

struct EchoTask {
    console: &'static Console,
    report: &'static Report,
    line: String,
    lines: u32,
}

impl EchoTask {
    fn run(&mut self) {
        let mut rx = self.console;
        loop {
            let byte = match serial::Read::read(&mut rx) {
                Ok(b) => b,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => {
                    log::error!("console read err {:?}", e);
                    break;
                }
            };
            if let Err(e) = self.console.write(byte) {
                log::warn!("echo dropped {:#04x}: {:?}", byte, e);
            }
            match byte {
                b'\n' => self.finish_line(),
                b'\r' => (),
                b => self.line.push(b as char),
            }
        }
    }

    fn finish_line(&mut self) {
        self.lines += 1;
        let mut report = self.report;
        if writeln!(report, "#{} {}", self.lines, self.line).is_err() {
            log::warn!("report backlog, line {} truncated", self.lines);
        }
        log::debug!("line {}: {:?}", self.lines, self.line);
        self.line.clear();
    }
}

/// Host puts one byte on the RX wire.
fn host_send(uart: &SimUart, byte: u8) {
    if uart.deliver(byte) {
        uart_rx_irq(uart.port());
    } else {
        log::warn!("{:?}: receiver not armed, {:#04x} lost", uart.port(), byte);
    }
}

/// Let the TX wire run until the channel has nothing more to send.
fn drain_wire<const N: usize>(ch: &SerialChannel<SimUart, N>) {
    while ch.uart().finish_transmit().is_some() {
        uart_tx_irq(ch.port());
    }
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();

    let console: &'static Console = CONSOLE.init(SerialChannel::new(SimUart::new(PortId::Usart2)));
    let report: &'static Report = REPORT.init(SerialChannel::new(SimUart::new(PortId::Usart3)));

    REGISTRY.lock(|r| {
        let mut r = r.borrow_mut();
        r.register(console)?;
        r.register(report)
    })?;

    console.begin()?;
    report.begin()?;

    let mut task = EchoTask {
        console,
        report,
        line: String::new(),
        lines: 0,
    };

    let input = b"hello vortex\r\nbuffered serial\r\nbye\r\n";
    for chunk in input.chunks(7) {
        for b in chunk {
            host_send(console.uart(), *b);
        }
        task.run();
        drain_wire(console);
        drain_wire(report);
    }

    let echoed = console.uart().take_line();
    let reported = report.uart().take_line();
    log::info!("USART2 wire: {:?}", String::from_utf8_lossy(&echoed));
    log::info!("USART3 wire: {:?}", String::from_utf8_lossy(&reported));
    log::info!(
        "rx overruns: console {}, report {}",
        console.rx_overruns(),
        report.rx_overruns()
    );

    let mut tx = console;
    match serial::Write::flush(&mut tx) {
        Ok(()) => log::info!("console drained"),
        Err(_) => log::warn!("console still has {} bytes queued", console.tx_pending()),
    }
    Ok(())
}
