use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Something that happened to a message inside a channel or queue.
///
/// `channel` holds the channel id or the queue name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// Receivers accepted the message synchronously.
    Delivered {
        channel: String,
        message: String,
        receivers: usize,
    },
    /// No receiver accepted; the message is pending.
    Stored { channel: String, message: String },
    /// The message was staged in a transaction.
    Staged {
        channel: String,
        message: String,
        tx: u64,
    },
    /// Responsibility for accepted deliveries went back to the sender.
    Returned {
        channel: String,
        message: String,
        deliveries: usize,
        reason: String,
    },
    /// The message was refused outright.
    Rejected {
        channel: String,
        message: String,
        reason: String,
    },
    Acknowledged {
        channel: String,
        message: String,
        delivery: u64,
        tx: Option<u64>,
    },
    Cancelled {
        channel: String,
        message: String,
        delivery: u64,
    },
    Redelivered {
        channel: String,
        message: String,
        accepted: bool,
    },
    Swept {
        channel: String,
        examined: usize,
        delivered: usize,
        stored: usize,
        /// Skipped because their scheduled time has not come.
        #[serde(default)]
        scheduled: usize,
        aborted: bool,
    },
    /// Held back until `at`.
    Scheduled {
        channel: String,
        message: String,
        at: SystemTime,
    },
    /// A scheduled message came due and moved to the head of the queue.
    Activated { channel: String, message: String },
    Failure {
        channel: String,
        operation: String,
        error: String,
    },
    Closed { channel: String },
}

impl DeliveryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DeliveryEvent::Delivered { .. } => "delivery.delivered",
            DeliveryEvent::Stored { .. } => "delivery.stored",
            DeliveryEvent::Staged { .. } => "delivery.staged",
            DeliveryEvent::Returned { .. } => "delivery.returned",
            DeliveryEvent::Rejected { .. } => "delivery.rejected",
            DeliveryEvent::Acknowledged { .. } => "delivery.acknowledged",
            DeliveryEvent::Cancelled { .. } => "delivery.cancelled",
            DeliveryEvent::Redelivered { .. } => "delivery.redelivered",
            DeliveryEvent::Swept { .. } => "delivery.swept",
            DeliveryEvent::Scheduled { .. } => "delivery.scheduled",
            DeliveryEvent::Activated { .. } => "delivery.activated",
            DeliveryEvent::Failure { .. } => "delivery.failure",
            DeliveryEvent::Closed { .. } => "delivery.closed",
        }
    }

    pub fn channel(&self) -> &str {
        match self {
            DeliveryEvent::Delivered { channel, .. }
            | DeliveryEvent::Stored { channel, .. }
            | DeliveryEvent::Staged { channel, .. }
            | DeliveryEvent::Returned { channel, .. }
            | DeliveryEvent::Rejected { channel, .. }
            | DeliveryEvent::Acknowledged { channel, .. }
            | DeliveryEvent::Cancelled { channel, .. }
            | DeliveryEvent::Redelivered { channel, .. }
            | DeliveryEvent::Swept { channel, .. }
            | DeliveryEvent::Scheduled { channel, .. }
            | DeliveryEvent::Activated { channel, .. }
            | DeliveryEvent::Failure { channel, .. }
            | DeliveryEvent::Closed { channel } => channel,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
