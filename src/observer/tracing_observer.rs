use tracing::{debug, error, trace, warn};

use super::{DeliveryEvent, Observer};

/// Forwards events to `tracing`.
///
/// Message lifecycle events are `trace`, sweeps and activations `debug`,
/// refusals and hand-backs `warn`, failures `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn record(&self, event: &DeliveryEvent) {
        let name = event.name();
        match event {
            DeliveryEvent::Delivered {
                channel,
                message,
                receivers,
            } => trace!(channel = %channel, message = %message, receivers, "{name}"),
            DeliveryEvent::Stored { channel, message } => {
                trace!(channel = %channel, message = %message, "{name}")
            }
            DeliveryEvent::Staged {
                channel,
                message,
                tx,
            } => trace!(channel = %channel, message = %message, tx, "{name}"),
            DeliveryEvent::Acknowledged {
                channel,
                message,
                delivery,
                tx,
            } => trace!(channel = %channel, message = %message, delivery, tx = ?tx, "{name}"),
            DeliveryEvent::Cancelled {
                channel,
                message,
                delivery,
            } => trace!(channel = %channel, message = %message, delivery, "{name}"),
            DeliveryEvent::Scheduled {
                channel,
                message,
                at,
            } => trace!(channel = %channel, message = %message, at = ?at, "{name}"),
            DeliveryEvent::Redelivered {
                channel,
                message,
                accepted,
            } => debug!(channel = %channel, message = %message, accepted, "{name}"),
            DeliveryEvent::Swept {
                channel,
                examined,
                delivered,
                stored,
                scheduled,
                aborted,
            } => debug!(
                channel = %channel,
                examined,
                delivered,
                stored,
                scheduled,
                aborted,
                "{name}"
            ),
            DeliveryEvent::Activated { channel, message } => {
                debug!(channel = %channel, message = %message, "{name}")
            }
            DeliveryEvent::Closed { channel } => debug!(channel = %channel, "{name}"),
            DeliveryEvent::Returned {
                channel,
                message,
                deliveries,
                reason,
            } => warn!(
                channel = %channel,
                message = %message,
                deliveries,
                reason = %reason,
                "{name}"
            ),
            DeliveryEvent::Rejected {
                channel,
                message,
                reason,
            } => warn!(channel = %channel, message = %message, reason = %reason, "{name}"),
            DeliveryEvent::Failure {
                channel,
                operation,
                error,
            } => error!(channel = %channel, operation = %operation, error = %error, "{name}"),
        }
    }
}
