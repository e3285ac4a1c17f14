#![no_std]
//! A compact, self-describing binary framing protocol for nodes sharing a serial bus.
//!
//! ## Frames
//!
//! Every message on the bus is a **frame**:
//!
//! ```text
//! +--------+-----+--------+-----+--------+-------+------------+-----+
//! | len:2  | tl  | target | sl  | source | count | parameters | sum |
//! +--------+-----+--------+-----+--------+-------+------------+-----+
//! ```
//!
//! - `len` is the big-endian total length, counting every byte of the frame,
//!   itself and the trailing checksum included.
//! - `tl`/`sl` are address lengths, always 2 for now.
//! - `count` is the number of parameters that follow.
//! - `sum` is the sum of every preceding byte, modulo 256.
//!
//! ## Parameters
//!
//! A parameter is a `(name, type, value)` triple. The type tag fully determines how
//! many bytes the value occupies, which lets readers skip over parameters they are not
//! interested in. See [`param`] for the type table.
//!
//! Parameters of type `t`/`T` carry a nested **struct**: a length-prefixed parameter
//! list without addresses or checksum, see [`builder::StructBuilder`] and
//! [`reader::StructReader`].
//!
//! ## Buffers
//!
//! Nothing in this crate allocates. Builders write into caller-owned buffers and
//! refuse (and roll back) any write that would not fit. Readers are views over
//! caller-owned bytes, and every access is bounds checked.

pub mod builder;
pub mod param;
pub mod reader;

pub use builder::{FrameBuilder, StructBuilder};
pub use param::{Param, ParamType, Value};
pub use reader::{FrameReader, LengthKind, StructReader, checksum};

use serde::{Deserialize, Serialize};

/// A 2-byte bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub u16);

impl Address {
    /// Frames sent here are accepted by every node.
    pub const BROADCAST: Self = Self(0x0000);
    /// The coordinator of the bus.
    pub const MASTER: Self = Self(0x0001);
    /// Marks a node that never picked an address.
    pub const UNSET: Self = Self(0xFFFF);

    /// Length of an address on the wire.
    pub const LEN: u8 = 2;

    #[inline(always)]
    pub const fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    #[inline(always)]
    pub const fn from_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }

    #[inline(always)]
    pub const fn is_broadcast(self) -> bool {
        self.0 == Self::BROADCAST.0
    }

    /// Returns `true` if a node is allowed to pick this address for itself.
    #[inline(always)]
    pub const fn is_node(self) -> bool {
        !matches!(self.0, 0x0000 | 0x0001 | 0xFFFF)
    }
}

impl core::fmt::Display for Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let [hi, lo] = self.to_bytes();
        write!(f, "{hi:02x}:{lo:02x}")
    }
}

/// A node's persistent identity on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationInfo {
    /// Our own address, [`Address::UNSET`] until one has been generated.
    pub address: Address,
    /// Random id telling concurrent join attempts on the same address apart.
    pub registration_id: u32,
    /// The network we last joined.
    pub network_id: u32,
}

impl RegistrationInfo {
    /// A record that was never initialized.
    pub const UNSET: Self = Self {
        address: Address::UNSET,
        registration_id: 0,
        network_id: 0,
    };

    #[inline(always)]
    pub const fn is_unset(&self) -> bool {
        self.address.0 == Address::UNSET.0
    }
}

impl Default for RegistrationInfo {
    fn default() -> Self {
        Self::UNSET
    }
}

/// Returned when a write would not fit in the remaining buffer space.
///
/// The builder that reported it is left exactly as it was before the failing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("not enough buffer space: {needed} more bytes needed, {available} available")]
pub struct CapacityError {
    pub needed: usize,
    pub available: usize,
}

/// Well-known parameter names and values used by the network layer.
pub mod names {
    /// Subject of a frame.
    pub const SUBJECT: u8 = b's';
    /// Command of a frame.
    pub const COMMAND: u8 = b'c';

    /// Subject of every network-management frame.
    pub const SUBJECT_NETWORK: u8 = b'n';

    /// Join offer (from the master) or join request (from a node).
    pub const COMMAND_JOIN: u8 = b'j';
    /// Join decision (from the master) or join acknowledgement (from a node).
    pub const COMMAND_JOIN_REPLY: u8 = b'J';
    /// Liveness poll.
    pub const COMMAND_POLL: u8 = b'p';

    /// Network id in a join offer, poll interval in an acknowledgement or poll reply.
    pub const NETWORK_OR_INTERVAL: u8 = b'n';
    /// Random join window, in milliseconds.
    pub const WINDOW: u8 = b'w';
    /// Registration id.
    pub const REGISTRATION_ID: u8 = b'i';
    /// Join decision, or device name in an acknowledgement.
    pub const DECISION_OR_NAME: u8 = b'd';
    /// Device version.
    pub const VERSION: u8 = b'v';
    /// Reply reference in a request.
    pub const REPLY_REF: u8 = b'r';
    /// Reply reference echoed back in a reply.
    pub const REPLY_ECHO: u8 = b'R';

    /// Join accepted.
    pub const DECISION_ACCEPT: u8 = b'a';
    /// Join declined, the address is taken.
    pub const DECISION_DECLINE: u8 = b'd';
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_addresses_are_not_node_addresses() {
        assert!(!Address::BROADCAST.is_node());
        assert!(!Address::MASTER.is_node());
        assert!(!Address::UNSET.is_node());
        assert!(Address(0x1234).is_node());
    }

    #[test]
    fn address_bytes_are_big_endian() {
        assert_eq!(Address(0x0102).to_bytes(), [0x01, 0x02]);
        assert_eq!(Address::from_bytes([0xAB, 0xCD]), Address(0xABCD));
    }

    #[test]
    fn default_registration_is_unset() {
        assert!(RegistrationInfo::default().is_unset());
    }
}
