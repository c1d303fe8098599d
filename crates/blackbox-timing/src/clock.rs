use once_cell::sync::Lazy;

pub type Clock = quanta::Clock;

static GLOBAL_CLOCK: Lazy<Clock> = Lazy::new(Clock::new);

/// Process-wide monotonic clock. First use pays quanta's calibration cost,
/// so embedders that care should touch it before their hot path starts.
#[inline]
pub fn global_clock() -> &'static Clock {
    &GLOBAL_CLOCK
}
