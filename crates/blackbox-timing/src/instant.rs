use std::ops::{Add, Sub};

use crate::{Duration, clock::global_clock};

/// Monotonic point in time, stored as the global clock's raw counter.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq)]
#[repr(C)]
pub struct Instant(pub u64);

impl Instant {
    pub const MAX: Self = Self(u64::MAX);
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn now() -> Self {
        Instant(global_clock().raw())
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        Instant::now() - *self
    }

    #[inline]
    pub fn saturating_sub(&self, other: Instant) -> Duration {
        Duration(global_clock().delta_as_nanos(other.0.min(self.0), self.0))
    }
}

impl Eq for Instant {}

impl PartialOrd for Instant {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Instant {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Sub for Instant {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Instant) -> Duration {
        self.saturating_sub(rhs)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    /// Converts `rhs` back into raw counter units via the global clock's
    /// scaling, so `Instant::now() + d <= Instant::now()` holds until `d`
    /// wall-clock time has passed.
    fn add(self, rhs: Duration) -> Self::Output {
        let raw_per_million = global_clock().delta_as_nanos(0, 1_000_000).max(1);
        Instant(self.0 + rhs.0 * 1_000_000 / raw_per_million)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_moves_forward() {
        let a = Instant::now();
        let b = Instant::now();
        assert!(b >= a);
        assert!(a.elapsed() >= Duration::ZERO);
    }

    #[test]
    fn deadline_in_future() {
        let deadline = Instant::now() + Duration::from_secs(10);
        assert!(Instant::now() < deadline);
    }
}
