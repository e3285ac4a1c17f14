#![allow(dead_code)]

use rand::{SeedableRng, rngs::StdRng};
use serbus_network::{
    config::TransportConfig,
    node::{DeviceInfo, FrameHandler},
    transport::{Reschedule, Transport},
};
use serbus_proto::{FrameBuilder, FrameReader, Value, names::*};
use serbus_utils::sim::{SimBus, SimClock, SimPort};

pub const FRAME: usize = 60;
pub const QUEUE: usize = 5;

pub type SimTransport = Transport<SimPort, SimClock, StdRng, FRAME, QUEUE>;

pub fn transport(bus: &SimBus, clock: &SimClock, seed: u64) -> SimTransport {
    let mut t = Transport::new(
        bus.connect(),
        clock.clone(),
        StdRng::seed_from_u64(seed),
        TransportConfig::default(),
    );
    t.begin();
    t
}

/// Sends everything `t` has queued, moving the clock along.
pub fn flush(t: &mut SimTransport, clock: &SimClock) {
    while t.queued() > 0 {
        if let Reschedule::After(ms) = t.step() {
            clock.advance(ms);
        }
    }
}

/// The next complete frame `t` hears.
pub fn hear(t: &mut SimTransport, clock: &SimClock) -> Option<Vec<u8>> {
    if let Some(frame) = t.poll_inbound() {
        return Some(frame.to_vec());
    }
    clock.advance(TransportConfig::default().rx_gap_ms);
    t.poll_inbound().map(|f| f.to_vec())
}

pub fn param_u16(frame: &FrameReader<'_>, name: u8) -> Option<u16> {
    frame.get(name).and_then(|p| p.as_u16())
}

pub fn param_u32(frame: &FrameReader<'_>, name: u8) -> Option<u32> {
    frame.get(name).and_then(|p| p.as_u32())
}

/// Application frame asking a [`Thermometer`] for its reading.
pub const SUBJECT_SENSOR: u8 = b'x';
pub const COMMAND_READ: u8 = b'e';
pub const READING: u8 = b't';

/// A node application answering polls and reading requests.
#[derive(Debug, Default)]
pub struct Thermometer {
    pub polls: usize,
    pub reads: usize,
    /// Stay silent on polls.
    pub mute: bool,
}

impl FrameHandler for Thermometer {
    fn on_frame<'a>(
        &mut self,
        frame: &FrameReader<'_>,
        mut reply: FrameBuilder<'a>,
    ) -> Option<FrameBuilder<'a>> {
        if frame.is_subject_and_command(SUBJECT_NETWORK, COMMAND_POLL) {
            self.polls += 1;
            return (!self.mute).then_some(reply);
        }

        if frame.is_subject_and_command(SUBJECT_SENSOR, COMMAND_READ) {
            self.reads += 1;
            reply.add(READING, Value::I16(215)).ok()?;
            return Some(reply);
        }

        None
    }

    fn device_info(&self) -> DeviceInfo<'_> {
        DeviceInfo {
            name: "thermo",
            version: "2.1",
        }
    }
}
