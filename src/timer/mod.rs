//! Deferred activation of scheduled references.

mod error;
mod manual;
mod thread;
mod timer;

pub use error::TimerError;
pub use manual::ManualTimer;
pub use thread::{ThreadTimer, TimerStats};
pub use timer::{Timer, TimerCallback, TimerId};
