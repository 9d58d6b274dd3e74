//! Timing Wheel (C5): scheduling, firing, and ISO-8601 timer-expression parsing.

pub mod duration;
pub mod wheel;

pub use duration::{parse_cycle, parse_date, parse_duration};
pub use wheel::{MessageSweeper, TimerSink, TimingWheel};
