//! Tunables for the transport, the node and the coordinator.
//!
//! Every struct deserializes with missing fields filled in from its `Default`, so a
//! config file only has to mention what it changes.

use serde::{Deserialize, Serialize};
use serbus_utils::Millis;

/// Bus timings, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Minimum quiet time between two frames we send.
    pub spacing_ms: Millis,
    /// Upper bound (exclusive) of the random delay added after a collision.
    pub max_penalty_ms: Millis,
    /// How long to wait for each byte's echo before calling it a collision.
    pub echo_wait_ms: Millis,
    /// Silence that ends an inbound frame.
    pub rx_gap_ms: Millis,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            spacing_ms: 200,
            max_penalty_ms: 400,
            echo_wait_ms: 5,
            rx_gap_ms: 10,
        }
    }
}

/// Node side session settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Poll interval we ask the coordinator for, in seconds.
    pub poll_interval_secs: u16,
    /// We consider ourselves dropped after this many poll intervals without a poll.
    pub drop_multiplier: u32,
    /// How often the scheduler should run [`Node::step`](crate::node::Node::step).
    pub step_period_ms: Millis,
}

impl NodeConfig {
    /// Silence after which a joined node goes back to waiting for a join offer.
    #[inline]
    pub fn drop_after_ms(&self) -> Millis {
        u32::from(self.poll_interval_secs)
            .saturating_mul(1000)
            .saturating_mul(self.drop_multiplier)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            drop_multiplier: 2,
            step_period_ms: 10,
        }
    }
}

/// Coordinator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Announced in every join offer. Nodes that last joined another network pick a
    /// fresh identity.
    pub network_id: u32,
    /// Nodes answer a join offer after a random delay below this, in milliseconds.
    pub join_window_ms: u16,
    pub join_offer_period_ms: Millis,
    /// How long to wait for an answer to a request carrying a reply reference.
    pub reply_timeout_ms: Millis,
    /// Unanswered requests are sent again this many times before being abandoned.
    pub reply_retries: u8,
    /// Bounds applied to the poll interval a node asks for.
    pub poll_min_secs: u16,
    pub poll_max_secs: u16,
    /// Next poll attempt after an unanswered poll.
    pub poll_retry_secs: u16,
    pub step_period_ms: Millis,
}

impl CoordinatorConfig {
    #[inline]
    pub fn clamp_poll_interval(&self, secs: u16) -> u16 {
        secs.clamp(self.poll_min_secs, self.poll_max_secs.max(self.poll_min_secs))
    }

    /// Silence after which a peer is considered gone.
    #[inline]
    pub fn peer_timeout_ms(&self) -> u64 {
        2 * 1000 * u64::from(self.poll_max_secs)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            network_id: 1,
            join_window_ms: 30,
            join_offer_period_ms: 120_000,
            reply_timeout_ms: 1000,
            reply_retries: 3,
            poll_min_secs: 30,
            poll_max_secs: 300,
            poll_retry_secs: 30,
            step_period_ms: 10,
        }
    }
}
