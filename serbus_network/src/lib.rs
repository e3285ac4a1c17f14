//! Networking on a shared half-duplex serial bus.
//!
//! - [`transport`] puts frames on the bus, detecting collisions, and captures
//!   inbound frames.
//! - [`node`] implements a bus node: it joins the network by negotiating an address
//!   with the coordinator, then answers polls and application frames.
//! - [`coordinator`] implements the bus master, which admits nodes and keeps track of
//!   them.
//!
//! Nothing here blocks or sleeps. Every `step` function does a bounded amount of
//! work and returns how long the caller should wait before calling it again.

pub mod config;
#[cfg(feature = "coordinator")]
pub mod coordinator;
pub mod node;
pub mod persist;
pub mod transport;

pub use serbus_proto as proto;
pub use serbus_utils as utils;

use serbus_proto::CapacityError;
use serbus_utils::EnqueueError;

/// Why a frame could not be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}
