//! The master side of the network.
//!
//! The [`Coordinator`] periodically broadcasts join offers, decides on join requests,
//! then keeps polling the nodes that joined, tracking which ones are still around.
//!
//! Requests that expect an answer carry a random reply reference (`r`), echoed back
//! as `R`. Unanswered requests are sent again a few times before being given up on.
//!
//! Time is kept as a 64-bit extension of the transport's wrapping clock, so that
//! poll deadlines can be ordered in a priority queue.

use core::cmp::Reverse;

use arrayvec::ArrayVec;
use rustc_hash::{FxBuildHasher, FxHashMap};
use serbus_proto::{Address, CapacityError, FrameBuilder, FrameReader, Value, names::*};
use serbus_utils::{BusPort, Clock, Entropy, Millis, timing::EpochClock};

use crate::{SendError, config::CoordinatorConfig, transport::Transport};

/// Hash map keyed by node address.
type PeerMap<V> = FxHashMap<Address, V>;

/// Priority queue keyed by node address.
type PeerPQ<V> = priority_queue::PriorityQueue<Address, V, FxBuildHasher>;

#[inline(always)]
fn secs(s: u16) -> u64 {
    u64::from(s) * 1000
}

/// A node that joined the network at some point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub address: Address,
    pub registration_id: u32,
    pub name: String,
    pub version: String,
    /// Poll interval agreed on, in seconds.
    pub poll_interval_secs: u16,
    /// Cleared when the peer has been silent for too long.
    pub active: bool,
    /// Extended timestamp of the last frame we got from the peer.
    pub last_seen: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    JoinAck { registration_id: u32 },
    PollReply,
    Reply,
}

/// A sent request, waiting for its reply.
#[derive(Debug, Clone)]
struct Pending<const FRAME: usize> {
    target: Address,
    awaiting: Awaiting,
    sent_at: u64,
    retries: u8,
    frame: ArrayVec<u8, FRAME>,
}

/// The application sitting on top of a [`Coordinator`].
///
/// Only [`on_frame`](Self::on_frame) is mandatory.
pub trait CoordinatorHandler {
    /// Any frame for us that is not part of the network management.
    fn on_frame(&mut self, frame: &FrameReader<'_>);

    /// Answer to a frame sent with [`Coordinator::request`].
    fn on_reply(&mut self, _reply: &FrameReader<'_>) {}

    /// A request sent to `target` was never answered.
    fn on_no_reply(&mut self, _target: Address) {}

    fn on_peer_joined(&mut self, _peer: &Peer) {}

    fn on_peer_polled(&mut self, _peer: &Peer, _reply: &FrameReader<'_>) {}

    fn on_peer_lost(&mut self, _peer: &Peer) {}
}

/// The bus master, with frames of up to `FRAME` bytes.
pub struct Coordinator<H, R, const FRAME: usize> {
    config: CoordinatorConfig,
    handler: H,
    rng: R,
    clock: EpochClock,
    peers: PeerMap<Peer>,
    /// Next poll of every active peer.
    ///
    /// We use [`Reverse`] here so that the _earliest_ deadline has the _highest_
    /// priority.
    poll_deadlines: PeerPQ<Reverse<u64>>,
    /// Requests waiting for a reply, by reply reference.
    pending: FxHashMap<u16, Pending<FRAME>>,
    /// `None` until the first offer went out.
    next_offer: Option<u64>,
    out: [u8; FRAME],
}

impl<H: CoordinatorHandler, R: Entropy, const FRAME: usize> Coordinator<H, R, FRAME> {
    pub fn new(config: CoordinatorConfig, handler: H, rng: R) -> Self {
        Self {
            config,
            handler,
            rng,
            clock: EpochClock::new(),
            peers: PeerMap::with_hasher(FxBuildHasher),
            poll_deadlines: PeerPQ::with_hasher(FxBuildHasher),
            pending: FxHashMap::with_hasher(FxBuildHasher),
            next_offer: None,
            out: [0; FRAME],
        }
    }

    #[inline(always)]
    pub const fn config(&self) -> &CoordinatorConfig {
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

    #[inline]
    pub fn peer(&self, address: Address) -> Option<&Peer> {
        self.peers.get(&address)
    }

    /// Every peer that ever joined, active or not.
    #[inline]
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Number of requests still waiting for a reply.
    #[inline(always)]
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Sends a frame, expecting no answer.
    pub fn send<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
        target: Address,
        subject: u8,
        command: u8,
        fill: impl FnOnce(&mut FrameBuilder<'_>) -> Result<(), CapacityError>,
    ) -> Result<(), SendError> {
        let now = self.clock.extend(transport.now());
        self.dispatch(transport, now, target, (subject, command), None, fill)
            .map(|_| ())
    }

    /// Sends a frame expecting an answer, reported to
    /// [`CoordinatorHandler::on_reply`].
    ///
    /// Returns the reply reference added to the frame.
    pub fn request<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
        target: Address,
        subject: u8,
        command: u8,
        fill: impl FnOnce(&mut FrameBuilder<'_>) -> Result<(), CapacityError>,
    ) -> Result<u16, SendError> {
        let now = self.clock.extend(transport.now());
        let r = self.dispatch(
            transport,
            now,
            target,
            (subject, command),
            Some(Awaiting::Reply),
            fill,
        )?;

        // `dispatch` always hands out a reference when asked to wait for a reply
        Ok(r.unwrap_or_default())
    }

    /// Runs one scheduler tick. Returns the delay before the next one.
    pub fn step<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
    ) -> Millis {
        let now = self.clock.extend(transport.now());

        if self.next_offer.is_none_or(|t| now >= t) {
            self.offer_join(transport, now);
            self.next_offer = Some(now + u64::from(self.config.join_offer_period_ms));
        }

        if let Some(bytes) = transport.poll_inbound() {
            match FrameReader::new(&bytes, FRAME) {
                Some(frame) => self.on_frame(&frame, now, transport),
                None => log::debug!("dropping {} byte fragment", bytes.len()),
            }
        }

        self.expire_requests(transport, now);
        self.expire_peers(now);
        self.poll_peers(transport, now);

        self.config.step_period_ms
    }

    fn new_reply_ref(&mut self) -> u16 {
        loop {
            let r = self.rng.next_u32() as u16;
            if !self.pending.contains_key(&r) {
                return r;
            }
        }
    }

    /// Builds a frame in our buffer and queues it, remembering it if it needs a reply.
    fn dispatch<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
        now: u64,
        target: Address,
        (subject, command): (u8, u8),
        awaiting: Option<Awaiting>,
        fill: impl FnOnce(&mut FrameBuilder<'_>) -> Result<(), CapacityError>,
    ) -> Result<Option<u16>, SendError> {
        let reply_ref = awaiting.is_some().then(|| self.new_reply_ref());

        let mut b = FrameBuilder::new(&mut self.out, Address::MASTER, target, subject, command)?;
        fill(&mut b)?;

        if let Some(r) = reply_ref {
            b.add(REPLY_REF, Value::U16(r))?;
        }

        let frame = b.finish();
        transport.enqueue(frame)?;

        if let (Some(r), Some(awaiting)) = (reply_ref, awaiting) {
            let mut copy = ArrayVec::new();
            // our buffer is exactly one entry long
            let _ = copy.try_extend_from_slice(frame);

            self.pending.insert(
                r,
                Pending {
                    target,
                    awaiting,
                    sent_at: now,
                    retries: 0,
                    frame: copy,
                },
            );
        }

        Ok(reply_ref)
    }

    fn offer_join<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
        now: u64,
    ) {
        let network_id = self.config.network_id;
        let window = self.config.join_window_ms;

        let res = self.dispatch(
            transport,
            now,
            Address::BROADCAST,
            (SUBJECT_NETWORK, COMMAND_JOIN),
            None,
            |b| {
                b.add(NETWORK_OR_INTERVAL, Value::U32(network_id))?;
                b.add(WINDOW, Value::U16(window))
            },
        );

        match res {
            Ok(_) => log::debug!("join offer sent for network {network_id}"),
            Err(e) => log::warn!("join offer not sent: {e}"),
        }
    }

    fn on_frame<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        frame: &FrameReader<'_>,
        now: u64,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
    ) {
        if !frame.is_valid() {
            log::debug!("dropping invalid frame");
            return;
        }

        if !frame.is_for_me(Address::MASTER) {
            return;
        }

        let Some(sender) = frame.sender() else {
            return;
        };

        if let Some(peer) = self.peers.get_mut(&sender) {
            if !peer.active {
                log::warn!("frame from inactive peer {sender}");
            }
            peer.last_seen = now;
        }

        if let Some(r) = frame.get(REPLY_ECHO).and_then(|p| p.as_u16()) {
            self.on_reply(r, sender, frame, now);
        } else if frame.is_subject_and_command(SUBJECT_NETWORK, COMMAND_JOIN) {
            self.on_join_request(sender, frame, now, transport);
        } else {
            self.handler.on_frame(frame);
        }
    }

    fn on_join_request<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        sender: Address,
        frame: &FrameReader<'_>,
        now: u64,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
    ) {
        let id = frame
            .get(REGISTRATION_ID)
            .and_then(|p| p.as_u32())
            .unwrap_or(0);

        // an accept still waiting for its ack holds the address too
        let claimed = self.pending.values().any(|p| {
            p.target == sender
                && matches!(p.awaiting, Awaiting::JoinAck { registration_id } if registration_id != id)
        });

        let accept = !claimed
            && self
                .peers
                .get(&sender)
                .is_none_or(|p| p.registration_id == id);

        let (decision, awaiting) = if accept {
            log::debug!("accepting {sender} ({id:#010x})");
            (
                DECISION_ACCEPT,
                Some(Awaiting::JoinAck {
                    registration_id: id,
                }),
            )
        } else {
            log::info!("declining {sender} ({id:#010x}), address taken");
            (DECISION_DECLINE, None)
        };

        let res = self.dispatch(
            transport,
            now,
            sender,
            (SUBJECT_NETWORK, COMMAND_JOIN_REPLY),
            awaiting,
            |b| {
                b.add(DECISION_OR_NAME, Value::Char(decision))?;
                b.add(REGISTRATION_ID, Value::U32(id))
            },
        );

        if let Err(e) = res {
            log::warn!("join reply to {sender} not sent: {e}");
        }
    }

    fn on_reply(&mut self, r: u16, sender: Address, frame: &FrameReader<'_>, now: u64) {
        let Some(pending) = self.pending.get(&r) else {
            log::warn!("reply from {sender} with unknown reference {r}");
            return;
        };

        if pending.target != sender {
            log::warn!("reply {r} from {sender}, expected from {}", pending.target);
            return;
        }

        let awaiting = pending.awaiting;
        self.pending.remove(&r);

        let interval = frame
            .get(NETWORK_OR_INTERVAL)
            .and_then(|p| p.as_u16())
            .unwrap_or(self.config.poll_min_secs);
        let interval = self.config.clamp_poll_interval(interval);

        match awaiting {
            Awaiting::JoinAck { registration_id } => {
                let text = |name| {
                    frame
                        .get(name)
                        .and_then(|p| p.as_str())
                        .unwrap_or_default()
                        .to_owned()
                };

                let peer = Peer {
                    address: sender,
                    registration_id,
                    name: text(DECISION_OR_NAME),
                    version: text(VERSION),
                    poll_interval_secs: interval,
                    active: true,
                    last_seen: now,
                };

                log::info!(
                    "{sender} joined: {} {}, polled every {interval} s",
                    peer.name,
                    peer.version
                );

                self.poll_deadlines
                    .push(sender, Reverse(now + secs(interval)));
                self.handler.on_peer_joined(&peer);
                self.peers.insert(sender, peer);
            }
            Awaiting::PollReply => {
                let Some(peer) = self.peers.get_mut(&sender) else {
                    return;
                };

                peer.poll_interval_secs = interval;

                if peer.active {
                    self.poll_deadlines
                        .push(sender, Reverse(now + secs(interval)));
                }

                self.handler.on_peer_polled(peer, frame);
            }
            Awaiting::Reply => self.handler.on_reply(frame),
        }
    }

    /// Sends unanswered requests again, or gives up on them.
    fn expire_requests<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
        now: u64,
    ) {
        let timeout = u64::from(self.config.reply_timeout_ms);
        let max_retries = self.config.reply_retries;
        let handler = &mut self.handler;

        self.pending.retain(|r, p| {
            if now.saturating_sub(p.sent_at) < timeout {
                return true;
            }

            if p.retries < max_retries {
                p.retries += 1;
                p.sent_at = now;
                log::debug!("no reply {r} from {}, attempt {}", p.target, p.retries + 1);
                // a full queue just makes this attempt time out again
                let _ = transport.enqueue(&p.frame);
                true
            } else {
                log::debug!("giving up on reply {r} from {}", p.target);
                handler.on_no_reply(p.target);
                false
            }
        });
    }

    /// Deactivates peers that have been silent for too long.
    fn expire_peers(&mut self, now: u64) {
        let timeout = self.config.peer_timeout_ms();

        for peer in self.peers.values_mut() {
            if peer.active && now.saturating_sub(peer.last_seen) >= timeout {
                peer.active = false;
                self.poll_deadlines.remove(&peer.address);
                log::info!("{} lost", peer.address);
                self.handler.on_peer_lost(peer);
            }
        }
    }

    fn poll_peers<P: BusPort, C: Clock, T: Entropy, const QUEUE: usize>(
        &mut self,
        transport: &mut Transport<P, C, T, FRAME, QUEUE>,
        now: u64,
    ) {
        let mut due = Vec::new();

        while let Some((addr, _)) = self
            .poll_deadlines
            .pop_if(|_, Reverse(deadline)| *deadline <= now)
        {
            due.push(addr);
        }

        for addr in due {
            if !self.peers.get(&addr).is_some_and(|p| p.active) {
                continue;
            }

            // moved again once the peer answers
            self.poll_deadlines
                .push(addr, Reverse(now + secs(self.config.poll_retry_secs)));

            let res = self.dispatch(
                transport,
                now,
                addr,
                (SUBJECT_NETWORK, COMMAND_POLL),
                Some(Awaiting::PollReply),
                |_| Ok(()),
            );

            if let Err(e) = res {
                log::warn!("poll to {addr} not sent: {e}");
            }
        }
    }
}
