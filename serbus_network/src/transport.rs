//! Half-duplex bus driver.
//!
//! The [`Transport`] owns the outbound queue and the inbound capture buffer. It never
//! sleeps: [`step`](Transport::step) sends at most one frame and tells the caller when
//! it wants to run again.
//!
//! Collisions are detected by reading back every byte we write. Anything other than
//! our own byte, in time, means someone else was talking. The frame then stays queued
//! and is retried after a random backoff.

use core::mem;

use arrayvec::ArrayVec;
use serbus_utils::{
    BusPort, Clock, EnqueueError, Entropy, FrameQueue, Millis,
    timing::{remaining, time_passed},
};

use crate::config::TransportConfig;

/// When the scheduler should call [`Transport::step`] again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reschedule {
    /// Nothing to send. Run again whenever convenient.
    Idle,
    /// Run again after this many milliseconds.
    After(Millis),
}

/// Why a transmission was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Collision {
    #[error("bus busy before sending")]
    BusBusy,
    #[error("no echo for byte {index}")]
    NoEcho { index: usize },
    #[error("byte {index} echoed as {got:#04x} instead of {sent:#04x}")]
    Mismatch { index: usize, sent: u8, got: u8 },
    #[error("unexpected bytes on the bus after our frame")]
    Trailing,
}

/// Writes `frame`, checking every byte's echo.
///
/// The direction pin is released whatever happens.
fn write_checked<P: BusPort, C: Clock>(
    port: &mut P,
    clock: &C,
    echo_wait: Millis,
    frame: &[u8],
) -> Result<(), Collision> {
    if port.is_data_available() {
        return Err(Collision::BusBusy);
    }

    port.set_direction(true);
    let res = write_echoed(port, clock, echo_wait, frame);
    port.set_direction(false);

    res
}

fn write_echoed<P: BusPort, C: Clock>(
    port: &mut P,
    clock: &C,
    echo_wait: Millis,
    frame: &[u8],
) -> Result<(), Collision> {
    for (index, &sent) in frame.iter().enumerate() {
        port.write_byte(sent);

        let start = clock.millis();
        let got = loop {
            if let Some(b) = port.read_byte() {
                break b;
            }

            if time_passed(start, clock.millis(), echo_wait) {
                return Err(Collision::NoEcho { index });
            }
        };

        if got != sent {
            return Err(Collision::Mismatch { index, sent, got });
        }
    }

    if port.is_data_available() {
        return Err(Collision::Trailing);
    }

    Ok(())
}

/// A bus driver holding up to `QUEUE` outbound frames of up to `FRAME` bytes.
#[derive(Debug)]
pub struct Transport<P, C, R, const FRAME: usize, const QUEUE: usize> {
    port: P,
    clock: C,
    rng: R,
    config: TransportConfig,
    queue: FrameQueue<FRAME, QUEUE>,
    /// End of our last transmission attempt.
    last_action: Option<Millis>,
    rx: ArrayVec<u8, FRAME>,
    rx_dropped: usize,
    /// Time of the last inbound byte, while a frame is being captured.
    rx_last: Option<Millis>,
}

impl<P: BusPort, C: Clock, R: Entropy, const FRAME: usize, const QUEUE: usize>
    Transport<P, C, R, FRAME, QUEUE>
{
    pub fn new(port: P, clock: C, rng: R, config: TransportConfig) -> Self {
        Self {
            port,
            clock,
            rng,
            config,
            queue: FrameQueue::new(),
            last_action: None,
            rx: ArrayVec::new(),
            rx_dropped: 0,
            rx_last: None,
        }
    }

    /// Initializes the port and releases the bus.
    pub fn begin(&mut self) {
        self.port.begin();
        self.port.set_direction(false);
    }

    #[inline(always)]
    pub fn now(&self) -> Millis {
        self.clock.millis()
    }

    #[inline(always)]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    #[inline(always)]
    pub fn port(&self) -> &P {
        &self.port
    }

    #[inline(always)]
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    #[inline(always)]
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Number of frames waiting to be sent.
    #[inline(always)]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// The next frame to be sent.
    #[inline(always)]
    pub fn peek_queued(&self) -> Option<&[u8]> {
        self.queue.front()
    }

    /// `true` if a frame can be queued and nobody seems to be talking.
    #[inline]
    pub fn can_send(&self) -> bool {
        !self.queue.is_full() && !self.port.is_data_available()
    }

    /// Queues a finished frame for sending.
    pub fn enqueue(&mut self, frame: &[u8]) -> Result<(), EnqueueError> {
        self.queue.push(frame).inspect_err(|e| {
            log::warn!("dropping outbound frame: {e}");
        })
    }

    /// Tries to send the oldest queued frame.
    pub fn step(&mut self) -> Reschedule {
        let Some(frame) = self.queue.front() else {
            return Reschedule::Idle;
        };

        let spacing = self.config.spacing_ms;

        if let Some(last) = self.last_action {
            let left = remaining(last, self.clock.millis(), spacing);
            if left > 0 {
                return Reschedule::After(left);
            }
        }

        // someone else's frame is still coming in
        if self.rx_last.is_some() {
            return Reschedule::After(self.config.rx_gap_ms);
        }

        let res = write_checked(&mut self.port, &self.clock, self.config.echo_wait_ms, frame);
        self.last_action = Some(self.clock.millis());

        match res {
            Ok(()) => {
                log::trace!("sent {frame:02x?}");
                self.queue.pop_front();
                Reschedule::After(spacing)
            }
            Err(e) => {
                let penalty = self.rng.below(self.config.max_penalty_ms);
                log::debug!("collision ({e}), retrying in {} ms", spacing + penalty);
                Reschedule::After(spacing.saturating_add(penalty))
            }
        }
    }

    /// Collects inbound bytes, and returns a frame once the bus went quiet.
    ///
    /// Bytes that don't fit in the capture buffer are dropped, the resulting frame will
    /// then fail validation.
    pub fn poll_inbound(&mut self) -> Option<ArrayVec<u8, FRAME>> {
        let mut received = false;

        while let Some(b) = self.port.read_byte() {
            received = true;
            if self.rx.try_push(b).is_err() {
                self.rx_dropped += 1;
            }
        }

        let now = self.clock.millis();

        if received {
            self.rx_last = Some(now);
            return None;
        }

        let last = self.rx_last?;

        if !time_passed(last, now, self.config.rx_gap_ms) {
            return None;
        }

        self.rx_last = None;

        if self.rx_dropped > 0 {
            log::warn!(
                "inbound frame overflowed the {FRAME} byte buffer, {} bytes dropped",
                self.rx_dropped,
            );
            self.rx_dropped = 0;
        }

        let frame = mem::take(&mut self.rx);
        log::trace!("received {:02x?}", frame.as_slice());
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};
    use serbus_utils::sim::{SimBus, SimClock};
    use std::collections::VecDeque;

    /// A port whose echo can be tampered with.
    #[derive(Debug, Default)]
    struct TestPort {
        rx: VecDeque<u8>,
        written: Vec<u8>,
        /// XORed into the echo of the byte with that index.
        corrupt: Option<(usize, u8)>,
        mute: bool,
        transmitting: bool,
    }

    impl BusPort for TestPort {
        fn begin(&mut self) {}

        fn is_data_available(&self) -> bool {
            !self.rx.is_empty()
        }

        fn read_byte(&mut self) -> Option<u8> {
            self.rx.pop_front()
        }

        fn write_byte(&mut self, byte: u8) {
            assert!(self.transmitting);
            let index = self.written.len();
            self.written.push(byte);

            if self.mute {
                return;
            }

            let echo = match self.corrupt {
                Some((i, mask)) if i == index => byte ^ mask,
                _ => byte,
            };
            self.rx.push_back(echo);
        }

        fn set_direction(&mut self, transmit: bool) {
            self.transmitting = transmit;
        }
    }

    type TestTransport = Transport<TestPort, SimClock, StdRng, 16, 2>;

    fn transport(port: TestPort, clock: &SimClock) -> TestTransport {
        Transport::new(
            port,
            clock.clone(),
            StdRng::seed_from_u64(1),
            TransportConfig::default(),
        )
    }

    #[test]
    fn idle_with_nothing_to_send() {
        let clock = SimClock::new(0);
        let mut t = transport(TestPort::default(), &clock);
        assert_eq!(t.step(), Reschedule::Idle);
    }

    #[test]
    fn clean_send_dequeues_and_waits_for_spacing() {
        let clock = SimClock::new(1000);
        let mut t = transport(TestPort::default(), &clock);

        t.enqueue(b"abc").unwrap();
        t.enqueue(b"de").unwrap();

        assert_eq!(t.step(), Reschedule::After(200));
        assert_eq!(t.queued(), 1);
        assert_eq!(t.port().written, b"abc");
        assert!(!t.port().transmitting);

        // too early for the next frame
        clock.advance(150);
        assert_eq!(t.step(), Reschedule::After(50));
        assert_eq!(t.queued(), 1);

        clock.advance(50);
        assert_eq!(t.step(), Reschedule::After(200));
        assert_eq!(t.queued(), 0);
        assert_eq!(t.port().written, b"abcde");
    }

    #[test]
    fn mismatched_echo_keeps_the_frame_and_backs_off() {
        let clock = SimClock::new(0);
        let port = TestPort {
            corrupt: Some((1, 0x10)),
            ..Default::default()
        };
        let mut t = transport(port, &clock);
        t.enqueue(b"xyz").unwrap();

        let Reschedule::After(delay) = t.step() else {
            panic!("expected a backoff");
        };

        let spacing = t.config().spacing_ms;
        assert!((spacing..spacing + t.config().max_penalty_ms).contains(&delay));
        assert_eq!(t.queued(), 1);
        assert_eq!(t.peek_queued(), Some(&b"xyz"[..]));
        // the send stopped at the bad echo
        assert_eq!(t.port().written, b"xy");
        assert!(!t.port().transmitting);
    }

    #[test]
    fn missing_echo_is_a_collision() {
        // every clock read moves time on, the echo wait must run out
        let clock = SimClock::with_tick(0, 1);
        let port = TestPort {
            mute: true,
            ..Default::default()
        };
        let mut t = transport(port, &clock);
        t.enqueue(b"xyz").unwrap();

        assert!(matches!(t.step(), Reschedule::After(d) if d >= 200));
        assert_eq!(t.queued(), 1);
        assert_eq!(t.port().written, b"x");
    }

    #[test]
    fn busy_bus_is_a_collision() {
        let clock = SimClock::new(0);
        let mut t = transport(TestPort::default(), &clock);
        t.port_mut().rx.push_back(0x55);
        t.enqueue(b"xyz").unwrap();

        assert!(!t.can_send());
        assert!(matches!(t.step(), Reschedule::After(_)));
        assert!(t.port().written.is_empty());
        assert_eq!(t.queued(), 1);
    }

    #[test]
    fn no_sending_while_a_frame_comes_in() {
        let bus = SimBus::new(64);
        let clock = SimClock::new(0);
        let mut t: Transport<_, _, _, 16, 2> = Transport::new(
            bus.connect(),
            clock.clone(),
            StdRng::seed_from_u64(1),
            TransportConfig::default(),
        );
        t.begin();
        t.enqueue(b"mine").unwrap();

        bus.inject(b"theirs");
        assert!(t.poll_inbound().is_none());
        assert_eq!(t.step(), Reschedule::After(10));
        assert_eq!(t.queued(), 1);

        clock.advance(10);
        assert_eq!(t.poll_inbound().unwrap().as_slice(), b"theirs");
        assert_eq!(t.step(), Reschedule::After(200));
        assert_eq!(t.queued(), 0);
    }

    #[test]
    fn queue_overflow_is_reported() {
        let clock = SimClock::new(0);
        let mut t = transport(TestPort::default(), &clock);

        t.enqueue(b"1").unwrap();
        t.enqueue(b"2").unwrap();
        assert_eq!(t.enqueue(b"3"), Err(EnqueueError::Full));
        assert!(matches!(
            t.enqueue(&[0; 17]),
            Err(EnqueueError::TooLarge { .. })
        ));
        assert_eq!(t.queued(), 2);
    }

    #[test]
    fn inbound_frame_ends_with_silence() {
        let bus = SimBus::new(64);
        let clock = SimClock::new(0);
        let mut t: Transport<_, _, _, 16, 2> = Transport::new(
            bus.connect(),
            clock.clone(),
            StdRng::seed_from_u64(1),
            TransportConfig::default(),
        );

        bus.inject(b"hello");
        assert!(t.poll_inbound().is_none());

        clock.advance(5);
        bus.inject(b" bus");
        assert!(t.poll_inbound().is_none());

        clock.advance(9);
        assert!(t.poll_inbound().is_none());

        clock.advance(1);
        let frame = t.poll_inbound().unwrap();
        assert_eq!(frame.as_slice(), b"hello bus");

        // the capture restarts from scratch
        clock.advance(100);
        assert!(t.poll_inbound().is_none());
    }

    #[test]
    fn oversized_inbound_frame_is_truncated() {
        let bus = SimBus::new(64);
        let clock = SimClock::new(0);
        let mut t: Transport<_, _, _, 4, 2> = Transport::new(
            bus.connect(),
            clock.clone(),
            StdRng::seed_from_u64(1),
            TransportConfig::default(),
        );

        bus.inject(b"0123456789");
        assert!(t.poll_inbound().is_none());
        clock.advance(10);
        assert_eq!(t.poll_inbound().unwrap().as_slice(), b"0123");
    }

    #[test]
    fn sim_bus_peers_hear_our_frames() {
        let bus = SimBus::new(64);
        let clock = SimClock::new(0);
        let rng = || StdRng::seed_from_u64(1);

        let mut a: Transport<_, _, _, 16, 2> =
            Transport::new(bus.connect(), clock.clone(), rng(), TransportConfig::default());
        let mut b: Transport<_, _, _, 16, 2> =
            Transport::new(bus.connect(), clock.clone(), rng(), TransportConfig::default());

        a.begin();
        b.begin();

        a.enqueue(b"ping").unwrap();
        assert_eq!(a.step(), Reschedule::After(200));
        assert_eq!(a.queued(), 0);

        // our own echoes were consumed while sending
        assert!(a.poll_inbound().is_none());

        assert!(b.poll_inbound().is_none());
        clock.advance(10);
        assert_eq!(b.poll_inbound().unwrap().as_slice(), b"ping");
    }
}
