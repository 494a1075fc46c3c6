use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use super::{Timer, TimerCallback, TimerError, TimerId};

static NEXT_TIMER: AtomicUsize = AtomicUsize::new(1);

/// Statistics from a timer thread.
#[derive(Debug, Default, Clone)]
pub struct TimerStats {
    pub fired: usize,
    pub discarded: usize,
}

enum Command {
    Arm {
        id: TimerId,
        deadline: Instant,
        generation: u64,
        callback: TimerCallback,
    },
    Cancel(TimerId),
    Stop,
}

struct Entry {
    deadline: Instant,
    seq: u64,
    generation: u64,
    callback: TimerCallback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// A timer backed by one named background thread.
///
/// Deadlines are converted to monotonic `Instant`s when armed. Callbacks
/// run on the timer thread, one at a time, earliest deadline first.
///
/// ## Example
///
/// ```
/// use delivery_core::{ThreadTimer, Timer};
/// use std::sync::mpsc;
/// use std::time::{Duration, SystemTime};
///
/// let timer = ThreadTimer::new().unwrap();
/// let (tx, rx) = mpsc::channel();
/// timer
///     .arm_once(
///         SystemTime::now() + Duration::from_millis(10),
///         Box::new(move || tx.send("fired").unwrap()),
///     )
///     .unwrap();
///
/// assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "fired");
/// let stats = timer.stop();
/// assert_eq!(stats.fired, 1);
/// ```
pub struct ThreadTimer {
    commands: Mutex<Sender<Command>>,
    generation: Arc<AtomicU64>,
    next_id: AtomicU64,
    handle: Option<JoinHandle<TimerStats>>,
    name: String,
}

impl ThreadTimer {
    pub fn new() -> Result<Self, TimerError> {
        Self::with_name_prefix("delivery-timer")
    }

    /// Spawn a timer whose thread is named `<prefix>-<n>`.
    pub fn with_name_prefix(prefix: &str) -> Result<Self, TimerError> {
        let name = format!("{}-{}", prefix, NEXT_TIMER.fetch_add(1, Ordering::Relaxed));
        let (commands, inbox) = channel();
        let generation = Arc::new(AtomicU64::new(0));

        let current = Arc::clone(&generation);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(inbox, current))
            .map_err(|e| TimerError::Spawn(e.to_string()))?;

        Ok(ThreadTimer {
            commands: Mutex::new(commands),
            generation,
            next_id: AtomicU64::new(1),
            handle: Some(handle),
            name,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the thread and wait for it. Callbacks not yet due are dropped.
    pub fn stop(mut self) -> TimerStats {
        self.send(Command::Stop).ok();
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap_or_default()
        } else {
            TimerStats::default()
        }
    }

    fn send(&self, command: Command) -> Result<(), TimerError> {
        let commands = self.commands.lock().map_err(|_| TimerError::Shutdown)?;
        commands.send(command).map_err(|_| TimerError::Shutdown)
    }
}

impl Timer for ThreadTimer {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn arm_once(&self, when: SystemTime, callback: TimerCallback) -> Result<TimerId, TimerError> {
        let id = TimerId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let delay = when
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        self.send(Command::Arm {
            id,
            deadline: Instant::now() + delay,
            generation: self.generation.load(Ordering::SeqCst),
            callback,
        })?;
        Ok(id)
    }

    fn cancel(&self, id: TimerId) {
        // A stopped timer has nothing left to cancel.
        self.send(Command::Cancel(id)).ok();
    }

    fn cancel_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.send(Command::Stop).ok();
        // Don't join on drop, a callback may be the one dropping us
    }
}

fn run(inbox: Receiver<Command>, generation: Arc<AtomicU64>) -> TimerStats {
    let mut stats = TimerStats::default();
    let mut armed: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();
    let mut seen = generation.load(Ordering::SeqCst);

    loop {
        let current = generation.load(Ordering::SeqCst);
        if current != seen {
            let before = armed.len();
            armed.retain(|Reverse(entry)| entry.generation == current);
            stats.discarded += before - armed.len();
            seen = current;
        }

        let now = Instant::now();
        while armed.peek().is_some_and(|Reverse(entry)| entry.deadline <= now) {
            let Some(Reverse(entry)) = armed.pop() else {
                break;
            };
            if entry.generation == generation.load(Ordering::SeqCst) {
                (entry.callback)();
                stats.fired += 1;
            } else {
                stats.discarded += 1;
            }
        }

        let command = match armed.peek() {
            Some(Reverse(next)) => {
                inbox.recv_timeout(next.deadline.saturating_duration_since(Instant::now()))
            }
            None => inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match command {
            Ok(Command::Arm {
                id,
                deadline,
                generation: armed_at,
                callback,
            }) => {
                if armed_at == generation.load(Ordering::SeqCst) {
                    armed.push(Reverse(Entry {
                        deadline,
                        seq: id.get(),
                        generation: armed_at,
                        callback,
                    }));
                } else {
                    stats.discarded += 1;
                }
            }
            Ok(Command::Cancel(id)) => {
                let before = armed.len();
                armed.retain(|Reverse(entry)| entry.seq != id.get());
                stats.discarded += before - armed.len();
            }
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    stats.discarded += armed.len();
    stats
}
