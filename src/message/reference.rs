use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::Message;

/// Identity of a single [`MessageReference`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReferenceId(u64);

impl ReferenceId {
    pub fn new(id: u64) -> Self {
        ReferenceId(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref-{}", self.0)
    }
}

// Sentinel for "no scheduled delivery time".
const UNSCHEDULED: u64 = 0;

/// A per-queue handle to a shared [`Message`] body.
///
/// Cloning the handle does not copy the reference: clones observe the same
/// delivery count, redelivered flag and scheduled time. Equality is identity
/// of the reference, never equality of the payload.
#[derive(Clone)]
pub struct MessageReference {
    inner: Arc<ReferenceInner>,
}

struct ReferenceInner {
    id: ReferenceId,
    message: Arc<Message>,
    delivery_count: AtomicU32,
    redelivered: AtomicBool,
    // Nanoseconds since the unix epoch, UNSCHEDULED when absent.
    scheduled_delivery: AtomicU64,
}

impl MessageReference {
    /// Wrap a stored message body. Stores call this; the scheduled delivery
    /// time starts out as the one carried by the message header.
    pub fn new(id: ReferenceId, message: Arc<Message>) -> Self {
        let scheduled = encode_time(message.scheduled_delivery);
        MessageReference {
            inner: Arc::new(ReferenceInner {
                id,
                message,
                delivery_count: AtomicU32::new(0),
                redelivered: AtomicBool::new(false),
                scheduled_delivery: AtomicU64::new(scheduled),
            }),
        }
    }

    pub fn id(&self) -> ReferenceId {
        self.inner.id
    }

    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    /// Shared handle to the message body.
    pub fn message_arc(&self) -> Arc<Message> {
        Arc::clone(&self.inner.message)
    }

    pub fn message_id(&self) -> &str {
        &self.inner.message.id
    }

    pub fn is_reliable(&self) -> bool {
        self.inner.message.reliable
    }

    pub fn delivery_count(&self) -> u32 {
        self.inner.delivery_count.load(Ordering::SeqCst)
    }

    /// Record one more handoff to a receiver. Returns the new count.
    pub fn increment_delivery_count(&self) -> u32 {
        self.inner
            .delivery_count
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1)
    }

    pub fn is_redelivered(&self) -> bool {
        self.inner.redelivered.load(Ordering::SeqCst)
    }

    /// Flag the reference as redelivered. Returns `true` if the flag was not
    /// already set.
    pub fn mark_redelivered(&self) -> bool {
        !self.inner.redelivered.swap(true, Ordering::SeqCst)
    }

    pub fn scheduled_delivery(&self) -> Option<SystemTime> {
        decode_time(self.inner.scheduled_delivery.load(Ordering::SeqCst))
    }

    /// Must be set before the reference is enqueued; changing it afterwards
    /// does not re-arm an already armed activation.
    pub fn set_scheduled_delivery(&self, at: Option<SystemTime>) {
        self.inner
            .scheduled_delivery
            .store(encode_time(at), Ordering::SeqCst);
    }

    /// Whether the reference may be dispatched at `now`.
    pub fn is_due(&self, now: SystemTime) -> bool {
        match self.scheduled_delivery() {
            Some(at) => at <= now,
            None => true,
        }
    }
}

impl PartialEq for MessageReference {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MessageReference {}

impl fmt::Debug for MessageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReference")
            .field("id", &self.inner.id)
            .field("message", &self.inner.message.id)
            .field("reliable", &self.inner.message.reliable)
            .field("delivery_count", &self.delivery_count())
            .field("redelivered", &self.is_redelivered())
            .field("scheduled_delivery", &self.scheduled_delivery())
            .finish()
    }
}

impl fmt::Display for MessageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.inner.id, self.inner.message.id)
    }
}

fn encode_time(at: Option<SystemTime>) -> u64 {
    at.and_then(|at| at.duration_since(UNIX_EPOCH).ok())
        .map(|since| u64::try_from(since.as_nanos()).unwrap_or(u64::MAX))
        .filter(|nanos| *nanos != UNSCHEDULED)
        .unwrap_or(UNSCHEDULED)
}

fn decode_time(nanos: u64) -> Option<SystemTime> {
    if nanos == UNSCHEDULED {
        None
    } else {
        UNIX_EPOCH.checked_add(Duration::from_nanos(nanos))
    }
}
