//! An in-process serial bus, for tests and demos.
//!
//! Every byte written by an attached [`SimPort`] is delivered to every attached port,
//! the writer included, just like on a real half-duplex line. Everything runs on one
//! thread, ports share the bus through an `Rc`.

use core::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::{BusPort, Clock, Millis};

type Taps = Rc<RefCell<Vec<rtrb::Producer<u8>>>>;

/// The shared line. Attach endpoints with [`connect`](Self::connect).
#[derive(Debug, Clone)]
pub struct SimBus {
    taps: Taps,
    rx_capacity: usize,
}

impl SimBus {
    /// `rx_capacity` is the number of unread bytes each port can hold before it starts
    /// losing them.
    pub fn new(rx_capacity: usize) -> Self {
        Self {
            taps: Rc::default(),
            rx_capacity,
        }
    }

    /// Attaches a new endpoint to the bus.
    pub fn connect(&self) -> SimPort {
        let (tx, rx) = rtrb::RingBuffer::new(self.rx_capacity);
        self.taps.borrow_mut().push(tx);

        SimPort {
            taps: Rc::clone(&self.taps),
            rx,
            transmitting: false,
        }
    }

    /// Puts `bytes` on the line as if some unseen device had sent them.
    pub fn inject(&self, bytes: &[u8]) {
        broadcast(&self.taps, bytes);
    }

    /// Number of currently attached endpoints.
    pub fn endpoints(&self) -> usize {
        let mut taps = self.taps.borrow_mut();
        taps.retain(|tx| !tx.is_abandoned());
        taps.len()
    }
}

fn broadcast(taps: &Taps, bytes: &[u8]) {
    let mut taps = taps.borrow_mut();
    taps.retain(|tx| !tx.is_abandoned());

    for tx in taps.iter_mut() {
        for &b in bytes {
            if tx.push(b).is_err() {
                log::warn!("simulated port overflowed, dropping byte {b:#04x}");
            }
        }
    }
}

/// One transceiver on a [`SimBus`].
///
/// Bytes written while the direction is not set to transmit never reach the line.
#[derive(Debug)]
pub struct SimPort {
    taps: Taps,
    rx: rtrb::Consumer<u8>,
    transmitting: bool,
}

impl SimPort {
    /// Number of bytes waiting to be read.
    #[inline]
    pub fn pending(&self) -> usize {
        self.rx.slots()
    }

    /// Drops everything waiting to be read.
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        while self.rx.pop().is_ok() {
            n += 1;
        }
        n
    }
}

impl BusPort for SimPort {
    fn begin(&mut self) {
        self.transmitting = false;
    }

    #[inline]
    fn is_data_available(&self) -> bool {
        !self.rx.is_empty()
    }

    #[inline]
    fn read_byte(&mut self) -> Option<u8> {
        self.rx.pop().ok()
    }

    fn write_byte(&mut self, byte: u8) {
        if self.transmitting {
            broadcast(&self.taps, &[byte]);
        } else {
            log::trace!("byte {byte:#04x} written while not transmitting");
        }
    }

    #[inline]
    fn set_direction(&mut self, transmit: bool) {
        self.transmitting = transmit;
    }
}

/// A manually driven clock. Clones share the same time.
///
/// An optional tick is added after every read, so code busy-waiting on the clock
/// always sees time move forward.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now: Rc<Cell<Millis>>,
    tick: Millis,
}

impl SimClock {
    pub fn new(start: Millis) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
            tick: 0,
        }
    }

    /// A clock that advances by `tick` milliseconds every time it is read.
    pub fn with_tick(start: Millis, tick: Millis) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
            tick,
        }
    }

    #[inline]
    pub fn advance(&self, ms: Millis) {
        self.now.set(self.now.get().wrapping_add(ms));
    }

    #[inline]
    pub fn set(&self, now: Millis) {
        self.now.set(now);
    }

    #[inline]
    pub fn get(&self) -> Millis {
        self.now.get()
    }
}

impl Clock for SimClock {
    #[inline]
    fn millis(&self) -> Millis {
        let now = self.now.get();
        self.now.set(now.wrapping_add(self.tick));
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_port_hears_every_byte() {
        let bus = SimBus::new(16);
        let mut a = bus.connect();
        let mut b = bus.connect();

        a.set_direction(true);
        a.write_byte(0x42);
        a.set_direction(false);

        assert_eq!(a.read_byte(), Some(0x42));
        assert_eq!(b.read_byte(), Some(0x42));
        assert!(!a.is_data_available());
        assert!(!b.is_data_available());
    }

    #[test]
    fn silent_when_not_transmitting() {
        let bus = SimBus::new(16);
        let mut a = bus.connect();
        let b = bus.connect();

        a.write_byte(0x42);
        assert_eq!(a.pending(), 0);
        assert_eq!(b.pending(), 0);
    }

    #[test]
    fn dropped_ports_are_detached() {
        let bus = SimBus::new(4);
        let a = bus.connect();
        let mut b = bus.connect();
        assert_eq!(bus.endpoints(), 2);

        drop(a);
        bus.inject(&[1, 2]);
        assert_eq!(bus.endpoints(), 1);
        assert_eq!(b.drain(), 2);
    }

    #[test]
    fn ticking_clock_moves_on_every_read() {
        let c = SimClock::with_tick(10, 3);
        let shared = c.clone();

        assert_eq!(c.millis(), 10);
        assert_eq!(c.millis(), 13);
        shared.advance(100);
        assert_eq!(c.get(), 116);
    }
}
