use serbus_utils::{Millis, timing::time_passed};

/// Where a node stands in the join handshake.
///
/// ```text
/// Idle --offer--> AwaitingWindow --delay--> PendingReply --accept--> Joined
///   ^                                            |                     |
///   +------------------decline-------------------+------silence--------+
/// ```
///
/// A join offer restarts the handshake from any state but `Joined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    /// Waiting for a join offer.
    #[default]
    Idle,
    /// Got an offer, waiting for our random slot before answering it.
    AwaitingWindow { since: Millis, delay: Millis },
    /// Join request queued, waiting for the coordinator's decision.
    PendingReply,
    /// Part of the network. `last_poll` is when we last heard a poll.
    Joined { last_poll: Millis },
}

impl NodeState {
    #[inline(always)]
    pub const fn is_joined(&self) -> bool {
        matches!(self, Self::Joined { .. })
    }

    /// `true` once the join window delay ran out.
    #[inline]
    pub(super) fn window_elapsed(&self, now: Millis) -> bool {
        match *self {
            Self::AwaitingWindow { since, delay } => time_passed(since, now, delay),
            _ => false,
        }
    }

    /// `true` once a joined node went `drop_after` milliseconds without a poll.
    #[inline]
    pub(super) fn poll_lost(&self, now: Millis, drop_after: Millis) -> bool {
        match *self {
            Self::Joined { last_poll } => time_passed(last_poll, now, drop_after),
            _ => false,
        }
    }
}
