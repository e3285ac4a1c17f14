//! Node side of the network: joining, staying joined, and answering frames.
//!
//! A [`Node`] owns its registration and a single outbound frame buffer. It is driven
//! by calling [`Node::step`] periodically, every call handling at most one inbound
//! frame, with the [`Transport`] the node talks through.

mod state;

pub use state::NodeState;

use serbus_proto::{
    Address, CapacityError, FrameBuilder, FrameReader, RegistrationInfo, Value, names::*,
};
use serbus_utils::{BusPort, Clock, Entropy, Millis};

use crate::{config::NodeConfig, persist::RegistrationStore, transport::Transport};

/// What a node tells the coordinator about itself when joining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo<'a> {
    pub name: &'a str,
    pub version: &'a str,
}

/// The application sitting on top of a [`Node`].
pub trait FrameHandler {
    /// Called for every application frame addressed to us, and for every poll while
    /// joined.
    ///
    /// `reply` is already addressed to the sender of `frame`, carries the same subject
    /// and command (`'n'`/`'p'` for polls) and echoes the request's reply reference.
    /// Return it, with any parameters added, to have it sent. Return `None` to stay
    /// silent.
    fn on_frame<'a>(
        &mut self,
        frame: &FrameReader<'_>,
        reply: FrameBuilder<'a>,
    ) -> Option<FrameBuilder<'a>>;

    fn device_info(&self) -> DeviceInfo<'_>;
}

/// Starts a reply to `request`, addressed to its sender.
///
/// A reply reference (`r`) in the request is echoed back as `R`.
pub fn prepare_reply<'b>(
    out: &'b mut [u8],
    me: Address,
    request: &FrameReader<'_>,
    subject: u8,
    command: u8,
) -> Result<FrameBuilder<'b>, CapacityError> {
    let target = request.sender().unwrap_or(Address::MASTER);
    let mut reply = FrameBuilder::new(out, me, target, subject, command)?;

    if let Some(r) = request.get(REPLY_REF).and_then(|p| p.as_u16()) {
        reply.add(REPLY_ECHO, Value::U16(r))?;
    }

    Ok(reply)
}

/// A random address nodes are allowed to use.
fn random_node_address(rng: &mut impl Entropy) -> Address {
    // [2, 0xFFFE]
    Address(2 + rng.below(0xFFFD) as u16)
}

/// A bus node, with frames of up to `FRAME` bytes.
#[derive(Debug)]
pub struct Node<S, H, R, const FRAME: usize> {
    config: NodeConfig,
    store: S,
    handler: H,
    rng: R,
    info: RegistrationInfo,
    state: NodeState,
    out: [u8; FRAME],
}

impl<S: RegistrationStore, H: FrameHandler, R: Entropy, const FRAME: usize>
    Node<S, H, R, FRAME>
{
    /// Loads the registration from `store`, generating a fresh identity if there is none.
    pub fn new(config: NodeConfig, mut store: S, handler: H, rng: R) -> Self {
        let info = store.load();

        let mut node = Self {
            config,
            store,
            handler,
            rng,
            info,
            state: NodeState::Idle,
            out: [0; FRAME],
        };

        if node.info.is_unset() {
            node.regenerate();
            log::info!("no stored registration, picked address {}", node.info.address);
        }

        node
    }

    #[inline(always)]
    pub const fn state(&self) -> NodeState {
        self.state
    }

    #[inline(always)]
    pub const fn is_joined(&self) -> bool {
        self.state.is_joined()
    }

    #[inline(always)]
    pub const fn registration(&self) -> &RegistrationInfo {
        &self.info
    }

    #[inline(always)]
    pub const fn address(&self) -> Address {
        self.info.address
    }

    #[inline(always)]
    pub const fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[inline(always)]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    #[inline(always)]
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    #[inline(always)]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Picks a new address and registration id, dropping any join in progress.
    fn regenerate(&mut self) {
        self.info.address = random_node_address(&mut self.rng);
        self.info.registration_id = self.rng.next_u32();
    }

    /// Runs one scheduler tick. Returns the delay before the next one.
    pub fn step<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
    ) -> Millis {
        let now = transport.now();

        if self.state.poll_lost(now, self.config.drop_after_ms()) {
            log::info!(
                "no poll for {} ms, leaving the network",
                self.config.drop_after_ms()
            );
            self.state = NodeState::Idle;
        }

        if self.state.window_elapsed(now) {
            self.send_join_request(transport);
        }

        if let Some(bytes) = transport.poll_inbound() {
            match FrameReader::new(&bytes, FRAME) {
                Some(frame) => self.on_frame(&frame, now, transport),
                None => log::debug!("dropping {} byte fragment", bytes.len()),
            }
        }

        self.config.step_period_ms
    }

    fn send_join_request<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
    ) {
        let id = self.info.registration_id;

        let request = FrameBuilder::new(
            &mut self.out,
            self.info.address,
            Address::MASTER,
            SUBJECT_NETWORK,
            COMMAND_JOIN,
        )
        .and_then(|mut b| {
            b.add(REGISTRATION_ID, Value::U32(id))?;
            Ok(b)
        });

        match request {
            Ok(mut b) => {
                // a full queue keeps us in the window, we retry on the next tick
                if transport.enqueue(b.finish()).is_ok() {
                    log::debug!("join request sent from {}", self.info.address);
                    self.state = NodeState::PendingReply;
                }
            }
            Err(e) => log::warn!("can't build join request: {e}"),
        }
    }

    fn on_frame<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        frame: &FrameReader<'_>,
        now: Millis,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
    ) {
        if !frame.is_valid() {
            log::debug!("dropping invalid frame");
            return;
        }

        if !frame.is_for_me(self.info.address) {
            return;
        }

        if !frame.is_subject(SUBJECT_NETWORK) {
            self.on_app_frame(frame, transport);
        } else if frame.is_command(COMMAND_JOIN) {
            self.on_join_offer(frame, now);
        } else if frame.is_command(COMMAND_JOIN_REPLY) {
            self.on_join_reply(frame, now, transport);
        } else if frame.is_command(COMMAND_POLL) {
            self.on_poll(frame, now, transport);
        } else {
            log::debug!("ignoring unknown network command");
        }
    }

    fn on_join_offer(&mut self, frame: &FrameReader<'_>, now: Millis) {
        if self.state.is_joined() {
            return;
        }

        if let Some(network_id) = frame.get(NETWORK_OR_INTERVAL).and_then(|p| p.as_u32()) {
            if network_id != self.info.network_id {
                self.info.network_id = network_id;
                self.regenerate();
                log::info!(
                    "new network {network_id}, picked address {}",
                    self.info.address
                );
            }
        }

        let window = frame.get(WINDOW).and_then(|p| p.as_u16()).unwrap_or(0);
        let delay = self.rng.below(u32::from(window));

        log::debug!("join offer received, answering in {delay} ms");
        self.state = NodeState::AwaitingWindow { since: now, delay };
    }

    fn on_join_reply<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        frame: &FrameReader<'_>,
        now: Millis,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
    ) {
        let id = frame.get(REGISTRATION_ID).and_then(|p| p.as_u32());

        if id != Some(self.info.registration_id) {
            log::debug!("join reply for another registration");
            return;
        }

        let decision = frame.get(DECISION_OR_NAME).and_then(|p| p.as_char());

        if self.state.is_joined() {
            // our acknowledgement got lost, the coordinator is still waiting for it
            if decision == Some(DECISION_ACCEPT) {
                log::debug!("repeated accept, acknowledging again");
                self.send_join_ack(frame, transport);
            }
            return;
        }

        if decision != Some(DECISION_ACCEPT) {
            self.regenerate();
            self.state = NodeState::Idle;
            log::info!("join declined, will retry as {}", self.info.address);
            return;
        }

        self.state = NodeState::Joined { last_poll: now };
        log::info!("joined network {} as {}", self.info.network_id, self.info.address);

        if let Err(e) = self.store.save(&self.info) {
            log::warn!("could not save registration: {e}");
        }

        self.send_join_ack(frame, transport);
    }

    fn send_join_ack<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        accept: &FrameReader<'_>,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
    ) {
        let DeviceInfo { name, version } = self.handler.device_info();
        let interval = self.config.poll_interval_secs;

        let ack = prepare_reply(
            &mut self.out,
            self.info.address,
            accept,
            SUBJECT_NETWORK,
            COMMAND_JOIN_REPLY,
        )
        .and_then(|mut b| {
            b.add_str(DECISION_OR_NAME, name)?;
            b.add_str(VERSION, version)?;
            b.add(NETWORK_OR_INTERVAL, Value::U16(interval))?;
            Ok(b)
        });

        match ack {
            Ok(mut b) => {
                let _ = transport.enqueue(b.finish());
            }
            Err(e) => log::warn!("can't build join acknowledgement: {e}"),
        }
    }

    fn on_poll<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        frame: &FrameReader<'_>,
        now: Millis,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
    ) {
        let NodeState::Joined { last_poll } = &mut self.state else {
            log::debug!("poll received while not joined");
            return;
        };
        *last_poll = now;

        let reply = match prepare_reply(
            &mut self.out,
            self.info.address,
            frame,
            SUBJECT_NETWORK,
            COMMAND_POLL,
        ) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("can't build poll reply: {e}");
                return;
            }
        };

        if let Some(mut reply) = self.handler.on_frame(frame, reply) {
            let interval = Value::U16(self.config.poll_interval_secs);
            if let Err(e) = reply.add(NETWORK_OR_INTERVAL, interval) {
                log::warn!("poll reply sent without interval: {e}");
            }
            let _ = transport.enqueue(reply.finish());
        }
    }

    fn on_app_frame<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        frame: &FrameReader<'_>,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
    ) {
        let subject = frame.subject().and_then(|p| p.as_char()).unwrap_or(0);
        let command = frame.command().and_then(|p| p.as_char()).unwrap_or(0);

        let reply = match prepare_reply(&mut self.out, self.info.address, frame, subject, command)
        {
            Ok(r) => r,
            Err(e) => {
                log::warn!("can't build reply: {e}");
                return;
            }
        };

        if let Some(mut reply) = self.handler.on_frame(frame, reply) {
            let _ = transport.enqueue(reply.finish());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Zeroes;

    impl Entropy for Zeroes {
        fn next_u32(&mut self) -> u32 {
            0
        }
    }

    struct Ones;

    impl Entropy for Ones {
        fn next_u32(&mut self) -> u32 {
            u32::MAX
        }
    }

    #[test]
    fn random_addresses_avoid_reserved_ones() {
        assert_eq!(random_node_address(&mut Zeroes), Address(2));
        assert_eq!(random_node_address(&mut Ones), Address(0xFFFE));
    }

    #[test]
    fn reply_goes_back_to_the_sender_with_the_reference() {
        let mut buf = [0; 60];
        let mut req = FrameBuilder::new(&mut buf, Address::MASTER, Address(0x4242), b'x', b'y')
            .unwrap();
        req.add(REPLY_REF, Value::U16(0x0BAD)).unwrap();
        let req = req.finish().to_vec();
        let req = FrameReader::new(&req, 60).unwrap();

        let mut out = [0; 60];
        let mut reply = prepare_reply(&mut out, Address(0x4242), &req, b'x', b'Y').unwrap();
        let reply = FrameReader::new(reply.finish(), 60).unwrap();

        assert!(reply.is_valid());
        assert_eq!(reply.target(), Some(Address::MASTER));
        assert_eq!(reply.sender(), Some(Address(0x4242)));
        assert!(reply.is_subject_and_command(b'x', b'Y'));
        assert_eq!(reply.get(REPLY_ECHO).and_then(|p| p.as_u16()), Some(0x0BAD));
        assert!(reply.get(REPLY_REF).is_none());
    }
}
