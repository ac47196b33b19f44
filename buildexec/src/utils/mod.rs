//! Small shared helpers: the injectable clock and duration parsing.

mod clock;
pub mod duration;

pub use clock::{Clock, FakeClock, SystemClock};
pub use duration::parse_duration;
