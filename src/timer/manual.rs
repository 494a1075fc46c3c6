use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use super::{Timer, TimerCallback, TimerError, TimerId};

struct Pending {
    when: SystemTime,
    seq: u64,
    callback: TimerCallback,
}

struct Clock {
    now: SystemTime,
    seq: u64,
    pending: Vec<Pending>,
}

/// A timer driven by hand, for deterministic scheduling tests.
///
/// Nothing fires until [`advance`](Self::advance) moves the virtual clock
/// past a deadline. Due callbacks then run on the caller's thread, earliest
/// deadline first and in arming order for equal deadlines.
pub struct ManualTimer {
    clock: Mutex<Clock>,
}

impl Default for ManualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualTimer {
    /// A timer whose clock starts at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(SystemTime::now())
    }

    pub fn starting_at(now: SystemTime) -> Self {
        ManualTimer {
            clock: Mutex::new(Clock {
                now,
                seq: 0,
                pending: Vec::new(),
            }),
        }
    }

    /// Number of armed callbacks that have not fired.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Move the clock forward by `by`, firing every callback that comes due.
    /// Returns how many fired.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.lock().now + by;
        let mut fired = 0;

        // One at a time so a callback may arm further timers.
        loop {
            let next = {
                let mut clock = self.lock();
                let due = clock
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.when <= target)
                    .min_by_key(|(_, p)| (p.when, p.seq))
                    .map(|(index, _)| index);
                match due {
                    Some(index) => {
                        let pending = clock.pending.remove(index);
                        clock.now = clock.now.max(pending.when);
                        Some(pending.callback)
                    }
                    None => {
                        clock.now = target;
                        None
                    }
                }
            };

            match next {
                Some(callback) => {
                    callback();
                    fired += 1;
                }
                None => return fired,
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Clock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Timer for ManualTimer {
    fn now(&self) -> SystemTime {
        self.lock().now
    }

    fn arm_once(&self, when: SystemTime, callback: TimerCallback) -> Result<TimerId, TimerError> {
        let mut clock = self.lock();
        clock.seq += 1;
        let seq = clock.seq;
        clock.pending.push(Pending {
            when,
            seq,
            callback,
        });
        Ok(TimerId::new(seq))
    }

    fn cancel(&self, id: TimerId) {
        self.lock().pending.retain(|p| p.seq != id.get());
    }

    fn cancel_all(&self) {
        self.lock().pending.clear();
    }
}
