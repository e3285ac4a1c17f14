//! Wrapping millisecond timestamps.
//!
//! Clocks on small targets are 32-bit millisecond counters that wrap after about 49
//! days. Comparing two timestamps directly breaks at the wrap, so every comparison
//! here is done on the wrapped difference instead.

/// A wrapping millisecond timestamp.
pub type Millis = u32;

/// A monotonic, wrapping millisecond clock.
pub trait Clock {
    fn millis(&self) -> Millis;
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline(always)]
    fn millis(&self) -> Millis {
        (**self).millis()
    }
}

/// Milliseconds between `start` and `now`, correct across one wrap.
#[inline(always)]
pub const fn elapsed(start: Millis, now: Millis) -> Millis {
    now.wrapping_sub(start)
}

/// `true` once at least `diff` milliseconds went by since `start`.
#[inline(always)]
pub const fn time_passed(start: Millis, now: Millis, diff: Millis) -> bool {
    elapsed(start, now) >= diff
}

/// Milliseconds left until `diff` milliseconds went by since `start`.
#[inline(always)]
pub const fn remaining(start: Millis, now: Millis, diff: Millis) -> Millis {
    diff.saturating_sub(elapsed(start, now))
}

/// Tracks the time since some event, usually the last message from a peer.
///
/// ```
/// # use serbus_utils::timing::Timer;
/// let mut timer = Timer::new(u32::MAX - 5);
///
/// assert!(!timer.has_elapsed(4, 20));
/// assert!(timer.has_elapsed(14, 20));
///
/// // we heard from the peer again
/// timer.reset(14);
/// assert_eq!(timer.elapsed(20), 6);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer(Millis);

impl Timer {
    #[inline(always)]
    pub const fn new(now: Millis) -> Self {
        Self(now)
    }

    #[inline(always)]
    pub const fn reset(&mut self, now: Millis) {
        self.0 = now;
    }

    #[inline(always)]
    pub const fn started_at(&self) -> Millis {
        self.0
    }

    #[inline(always)]
    pub const fn elapsed(&self, now: Millis) -> Millis {
        elapsed(self.0, now)
    }

    #[inline(always)]
    pub const fn has_elapsed(&self, now: Millis, diff: Millis) -> bool {
        time_passed(self.0, now, diff)
    }
}

/// Extends a wrapping 32-bit clock into a 64-bit one that never wraps.
///
/// Must be fed at least once per wrap period (about 49 days) to notice every wrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochClock {
    last: Millis,
    epoch: u32,
}

impl EpochClock {
    #[inline(always)]
    pub const fn new() -> Self {
        Self { last: 0, epoch: 0 }
    }

    /// Converts `now` to an extended timestamp, counting a wrap if `now` went backwards.
    #[inline]
    pub fn extend(&mut self, now: Millis) -> u64 {
        if now < self.last {
            self.epoch = self.epoch.wrapping_add(1);
        }
        self.last = now;

        (u64::from(self.epoch) << 32) | u64::from(now)
    }
}

/// Wall-clock milliseconds since the clock was created.
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy)]
pub struct SystemClock(std::time::Instant);

#[cfg(feature = "std")]
impl Default for SystemClock {
    fn default() -> Self {
        Self(std::time::Instant::now())
    }
}

#[cfg(feature = "std")]
impl SystemClock {
    #[inline(always)]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(feature = "std")]
impl Clock for SystemClock {
    #[inline]
    fn millis(&self) -> Millis {
        // truncation is the wrap
        self.0.elapsed().as_millis() as Millis
    }
}
