use std::fmt;
use std::time::SystemTime;

use super::TimerError;

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to one armed callback, unique per timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn new(id: u64) -> Self {
        TimerId(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// One-shot timers keyed on wall-clock time.
///
/// A timer may be shared by several owners. Owners cancel what they armed
/// with [`cancel`](Timer::cancel); [`cancel_all`](Timer::cancel_all) is for
/// whoever owns the timer itself.
pub trait Timer: Send + Sync {
    /// The timer's notion of the current time.
    fn now(&self) -> SystemTime;

    /// Run `callback` once `when` has passed. A time in the past fires as
    /// soon as possible.
    fn arm_once(&self, when: SystemTime, callback: TimerCallback) -> Result<TimerId, TimerError>;

    /// Drop one armed callback. Cancelling a callback that already fired is
    /// a no-op.
    fn cancel(&self, id: TimerId);

    /// Drop every armed callback that has not fired yet.
    fn cancel_all(&self);
}
