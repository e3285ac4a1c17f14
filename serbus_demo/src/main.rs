//! A coordinator and a few temperature sensors sharing a simulated bus.
//!
//! Time is simulated too, so ten minutes of bus traffic run in a blink. Use
//! `RUST_LOG=debug` to follow the join handshakes and polls.

use rand::{Rng, SeedableRng, rngs::StdRng};
use serbus_network::{
    config::{CoordinatorConfig, NodeConfig, TransportConfig},
    coordinator::{Coordinator, CoordinatorHandler, Peer},
    node::{DeviceInfo, FrameHandler, Node},
    persist::MemoryRegistrationStore,
    proto::{Address, FrameBuilder, FrameReader, Value, names::*},
    transport::{Reschedule, Transport},
    utils::{
        Millis,
        sim::{SimBus, SimClock, SimPort},
        timing::Timer,
    },
};

const FRAME: usize = 60;
const QUEUE: usize = 5;

const SENSORS: u64 = 3;
const RUN_FOR_MS: Millis = 10 * 60 * 1000;
const READ_PERIOD_MS: Millis = 45_000;

const SUBJECT_SENSOR: u8 = b'x';
const COMMAND_READ: u8 = b'e';
/// Temperature, in tenths of a degree.
const READING: u8 = b't';

type SimTransport = Transport<SimPort, SimClock, StdRng, FRAME, QUEUE>;

struct Sensor {
    name: String,
    tenths: i16,
    rng: StdRng,
}

impl FrameHandler for Sensor {
    fn on_frame<'a>(
        &mut self,
        frame: &FrameReader<'_>,
        mut reply: FrameBuilder<'a>,
    ) -> Option<FrameBuilder<'a>> {
        if frame.is_subject_and_command(SUBJECT_NETWORK, COMMAND_POLL) {
            return Some(reply);
        }

        if !frame.is_subject_and_command(SUBJECT_SENSOR, COMMAND_READ) {
            log::debug!("{}: unknown request", self.name);
            return None;
        }

        self.tenths = self.tenths.saturating_add(self.rng.gen_range(-5..=5));

        if let Err(e) = reply.add(READING, Value::I16(self.tenths)) {
            log::warn!("{}: {e}", self.name);
            return None;
        }

        Some(reply)
    }

    fn device_info(&self) -> DeviceInfo<'_> {
        DeviceInfo {
            name: &self.name,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Logs what happens on the network.
struct Monitor {
    readings: usize,
}

impl CoordinatorHandler for Monitor {
    fn on_frame(&mut self, frame: &FrameReader<'_>) {
        log::info!("unsolicited frame from {:?}", frame.sender());
    }

    fn on_reply(&mut self, reply: &FrameReader<'_>) {
        let (Some(from), Some(t)) = (
            reply.sender(),
            reply.get(READING).and_then(|p| p.as_i16()),
        ) else {
            return;
        };

        self.readings += 1;
        log::info!("{from} reads {}.{} C", t / 10, (t % 10).abs());
    }

    fn on_no_reply(&mut self, target: Address) {
        log::warn!("{target} did not answer");
    }

    fn on_peer_joined(&mut self, peer: &Peer) {
        log::info!("{} joined as {}", peer.name, peer.address);
    }

    fn on_peer_polled(&mut self, peer: &Peer, _reply: &FrameReader<'_>) {
        log::debug!("{} is alive", peer.name);
    }

    fn on_peer_lost(&mut self, peer: &Peer) {
        log::warn!("lost {} at {}", peer.name, peer.address);
    }
}

/// Runs something again once the delay it asked for ran out.
struct Task {
    timer: Timer,
    delay: Millis,
}

impl Task {
    const fn new() -> Self {
        Self {
            timer: Timer::new(0),
            delay: 0,
        }
    }

    fn poll(&mut self, now: Millis, run: impl FnOnce() -> Millis) {
        if self.timer.has_elapsed(now, self.delay) {
            self.delay = run();
            self.timer.reset(now);
        }
    }
}

fn line_delay(r: Reschedule) -> Millis {
    match r {
        Reschedule::Idle => 1,
        Reschedule::After(ms) => ms,
    }
}

struct Station {
    node: Node<MemoryRegistrationStore, Sensor, StdRng, FRAME>,
    port: SimTransport,
    session: Task,
    line: Task,
}

fn transport(bus: &SimBus, clock: &SimClock, seed: u64) -> SimTransport {
    let mut t = Transport::new(
        bus.connect(),
        clock.clone(),
        StdRng::seed_from_u64(seed),
        TransportConfig::default(),
    );
    t.begin();
    t
}

fn main() {
    env_logger::init();

    let bus = SimBus::new(1024);
    let clock = SimClock::new(0);

    let mut master = transport(&bus, &clock, 0);
    let mut coordinator: Coordinator<_, _, FRAME> = Coordinator::new(
        CoordinatorConfig::default(),
        Monitor { readings: 0 },
        StdRng::seed_from_u64(1),
    );
    let (mut session, mut line, mut reads) = (Task::new(), Task::new(), Task::new());

    let mut stations: Vec<Station> = (0..SENSORS)
        .map(|i| Station {
            node: Node::new(
                NodeConfig::default(),
                MemoryRegistrationStore::default(),
                Sensor {
                    name: format!("sensor-{i}"),
                    tenths: 200,
                    rng: StdRng::seed_from_u64(100 + i),
                },
                StdRng::seed_from_u64(200 + i),
            ),
            port: transport(&bus, &clock, 300 + i),
            session: Task::new(),
            line: Task::new(),
        })
        .collect();

    for now in 0..RUN_FOR_MS {
        clock.set(now);

        session.poll(now, || coordinator.step(&mut master));
        for s in &mut stations {
            s.session.poll(now, || s.node.step(&mut s.port));
        }

        reads.poll(now, || {
            let targets: Vec<Address> = coordinator
                .peers()
                .filter(|p| p.active)
                .map(|p| p.address)
                .collect();

            for target in targets {
                let res = coordinator.request(&mut master, target, SUBJECT_SENSOR, COMMAND_READ, |_| {
                    Ok(())
                });

                if let Err(e) = res {
                    log::warn!("no reading request for {target}: {e}");
                }
            }

            READ_PERIOD_MS
        });

        line.poll(now, || line_delay(master.step()));
        for s in &mut stations {
            s.line.poll(now, || line_delay(s.port.step()));
        }
    }

    println!(
        "{} readings in {} s",
        coordinator.handler().readings,
        RUN_FOR_MS / 1000
    );

    for peer in coordinator.peers() {
        println!(
            "{} {} {} polled every {} s, {}",
            peer.address,
            peer.name,
            peer.version,
            peer.poll_interval_secs,
            if peer.active { "active" } else { "lost" },
        );
    }
}
