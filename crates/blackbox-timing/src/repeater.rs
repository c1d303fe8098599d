use crate::{Duration, Instant};

/// Tracks a recurring interval: send flushes every 500ms, file flushes every
/// 100ms, discovery response pacing every 50ms.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Repeater {
    interval: Duration,
    last_acted: Instant,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: Instant::ZERO }
    }

    /// Returns true and rearms if the interval has elapsed since the last
    /// firing.
    #[inline]
    pub fn fired(&mut self) -> bool {
        if self.last_acted.elapsed() >= self.interval {
            self.last_acted = Instant::now();
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[inline]
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn reset(&mut self) {
        self.last_acted = Instant::now();
    }

    pub fn force_fire(&mut self) {
        self.last_acted = Instant::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_immediately_then_waits() {
        let mut r = Repeater::every(Duration::from_secs(60));
        assert!(r.fired());
        assert!(!r.fired());
        r.force_fire();
        assert!(r.fired());
    }

    #[test]
    fn zero_interval_always_fires() {
        let mut r = Repeater::every(Duration::ZERO);
        assert!(r.fired());
        assert!(r.fired());
    }
}
