#![cfg_attr(not(feature = "std"), no_std)]
//! Small building blocks shared by the bus transport, the node and the coordinator.
//!
//! Everything here is driven by explicit timestamps and explicit hardware handles,
//! so it can run on a microcontroller as well as inside a test.

pub mod queue;
#[cfg(feature = "std")]
pub mod sim;
pub mod timing;

pub use queue::{EnqueueError, FrameQueue};
pub use timing::{Clock, Millis};

/// The hardware seam of a half-duplex serial bus.
///
/// Writing a byte puts it on the shared line, where every transceiver, including our
/// own, reads it back. That echo is what collision detection relies on.
pub trait BusPort {
    /// Prepares the port for use. Called once, before anything else.
    fn begin(&mut self);

    /// `true` if at least one byte can be read without waiting.
    fn is_data_available(&self) -> bool;

    /// Reads a pending byte, if any.
    fn read_byte(&mut self) -> Option<u8>;

    fn write_byte(&mut self, byte: u8);

    /// Drives the transceiver's direction pin. `true` means we are transmitting.
    fn set_direction(&mut self, transmit: bool);
}

/// A source of random numbers.
pub trait Entropy {
    fn next_u32(&mut self) -> u32;

    /// A number in `[0, bound)`, or `0` if `bound` is `0`.
    fn below(&mut self, bound: u32) -> u32 {
        // multiply-shift maps the full 32-bit range onto [0, bound)
        ((u64::from(self.next_u32()) * u64::from(bound)) >> 32) as u32
    }
}

#[cfg(feature = "rand")]
impl<R: rand::RngCore + ?Sized> Entropy for R {
    #[inline(always)]
    fn next_u32(&mut self) -> u32 {
        rand::RngCore::next_u32(self)
    }

    #[inline]
    fn below(&mut self, bound: u32) -> u32 {
        if bound == 0 {
            0
        } else {
            rand::Rng::gen_range(self, 0..bound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_stays_in_range() {
        use rand::SeedableRng;

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for bound in [1, 2, 50, 400, u32::MAX] {
            for _ in 0..100 {
                assert!(Entropy::below(&mut rng, bound) < bound);
            }
        }
        assert_eq!(Entropy::below(&mut rng, 0), 0);
    }
}
