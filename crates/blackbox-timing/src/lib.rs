mod clock;
mod duration;
mod instant;
mod repeater;
mod ticks;

pub use clock::global_clock;
pub use duration::Duration;
pub use instant::Instant;
pub use repeater::Repeater;
pub use ticks::{Ticks, micros_from_epoch, millis_per_tick};
