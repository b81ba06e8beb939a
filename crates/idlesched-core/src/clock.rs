//! Monotonic time source for the scheduler.
//!
//! The scheduler never reads wall-clock time itself. Hosts inject a
//! [`Clock`]: [`WallClock`] for real threads, [`ManualClock`] for
//! deterministic tests where time only moves when told to.

use std::fmt;
use std::ops::{Add, AddAssign};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// A monotonic timestamp measured from the clock's origin, in nanoseconds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Ticks(u64);

impl Ticks {
    /// The clock origin.
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Whole milliseconds since the origin.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Time elapsed from `earlier` to `self`, clamped to zero when the clock
    /// went backwards.
    #[must_use]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Adds a duration, saturating at the maximum representable tick.
    #[must_use]
    pub fn saturating_add(self, delta: Duration) -> Self {
        let nanos = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(nanos))
    }
}

impl Add<Duration> for Ticks {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        self.saturating_add(rhs)
    }
}

impl AddAssign<Duration> for Ticks {
    fn add_assign(&mut self, rhs: Duration) {
        *self = self.saturating_add(rhs);
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let micros = self.0 / 1_000;
        write!(f, "{}.{:03}ms", micros / 1_000, micros % 1_000)
    }
}

/// Source of monotonic time.
pub trait Clock {
    /// Returns the current time.
    fn now(&self) -> Ticks;
}

/// Real monotonic time, measured from when the clock was created.
///
/// Copies share the same origin, so a copy handed to another thread reads
/// comparable timestamps.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    epoch: Instant,
}

impl WallClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    fn now(&self) -> Ticks {
        let nanos = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        Ticks::from_nanos(nanos)
    }
}

/// Simulated time that only advances when told to.
///
/// Clones share the same underlying time, so a test can hand one clone to
/// the scheduler and keep another to observe or move time.
///
/// ```
/// use idlesched_core::clock::{Clock, ManualClock, Ticks};
/// use std::time::Duration;
///
/// let clock = ManualClock::starting_at(Ticks::from_millis(5));
/// clock.advance(Duration::from_millis(300));
/// assert_eq!(clock.now(), Ticks::from_millis(305));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock at the origin.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn starting_at(time: Ticks) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(time.as_nanos())),
        }
    }

    /// Moves time forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let target = self.now().saturating_add(delta);
        self.now.store(target.as_nanos(), Ordering::Release);
    }

    /// Moves time forward to `time`. A target in the past is a no-op.
    pub fn advance_to(&self, time: Ticks) {
        self.now.fetch_max(time.as_nanos(), Ordering::AcqRel);
    }

    /// Sets the current time unconditionally, including backwards.
    pub fn set(&self, time: Ticks) {
        self.now.store(time.as_nanos(), Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Ticks {
        Ticks::from_nanos(self.now.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_millis_roundtrip() {
        assert_eq!(Ticks::from_millis(355).as_millis(), 355);
        assert_eq!(Ticks::from_millis(1).as_nanos(), 1_000_000);
    }

    #[test]
    fn duration_since_clamps_regressions() {
        let early = Ticks::from_millis(10);
        let late = Ticks::from_millis(25);
        assert_eq!(late.saturating_duration_since(early), Duration::from_millis(15));
        assert_eq!(early.saturating_duration_since(late), Duration::ZERO);
    }

    #[test]
    fn add_saturates() {
        let near_max = Ticks::from_nanos(u64::MAX - 1);
        assert_eq!(near_max + Duration::from_secs(1), Ticks::from_nanos(u64::MAX));
    }

    #[test]
    fn display_uses_milliseconds() {
        assert_eq!(Ticks::from_millis(305).to_string(), "305.000ms");
        assert_eq!(Ticks::from_nanos(1_500_000).to_string(), "1.500ms");
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::starting_at(Ticks::from_millis(5));
        let other = clock.clone();
        clock.advance(Duration::from_millis(50));
        assert_eq!(other.now(), Ticks::from_millis(55));
    }

    #[test]
    fn advance_to_never_moves_backwards() {
        let clock = ManualClock::starting_at(Ticks::from_millis(100));
        clock.advance_to(Ticks::from_millis(40));
        assert_eq!(clock.now(), Ticks::from_millis(100));
        clock.advance_to(Ticks::from_millis(140));
        assert_eq!(clock.now(), Ticks::from_millis(140));
    }

    #[test]
    fn set_can_rewind() {
        let clock = ManualClock::starting_at(Ticks::from_millis(100));
        clock.set(Ticks::from_millis(10));
        assert_eq!(clock.now(), Ticks::from_millis(10));
    }

    #[test]
    fn wall_clock_is_monotonic() {
        let clock = WallClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
