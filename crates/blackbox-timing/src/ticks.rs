use chrono::Utc;

use crate::clock::global_clock;

/// Raw counter value stamped into every packet header. Consumers convert to
/// wall time with the `millis_per_tick` published in AppInfo.
#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(C)]
pub struct Ticks(pub u64);

impl Ticks {
    #[inline]
    pub fn now() -> Self {
        Ticks(global_clock().raw())
    }
}

impl From<Ticks> for u64 {
    #[inline]
    fn from(value: Ticks) -> Self {
        value.0
    }
}

impl From<u64> for Ticks {
    #[inline]
    fn from(value: u64) -> Self {
        Ticks(value)
    }
}

/// Milliseconds represented by one raw tick on this machine.
pub fn millis_per_tick() -> f64 {
    let nanos_per_million_ticks = global_clock().delta_as_nanos(0, 1_000_000);
    nanos_per_million_ticks as f64 / 1_000_000.0 / 1_000_000.0
}

/// Microseconds since the unix epoch, for the AppInfo handshake.
pub fn micros_from_epoch() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_monotonic() {
        let a = Ticks::now();
        let b = Ticks::now();
        assert!(b >= a);
    }

    #[test]
    fn millis_per_tick_is_sane() {
        let mpt = millis_per_tick();
        assert!(mpt > 0.0);
        assert!(mpt < 1.0, "one tick should be well under a millisecond");
    }

    #[test]
    fn epoch_micros_is_recent() {
        // 2020-01-01 in microseconds
        assert!(micros_from_epoch() > 1_577_836_800_000_000);
    }
}
