//! Injected observability sinks for channels and queues.

#[cfg(feature = "emitter")]
mod emitter;
mod event;
mod log;
mod tracing_observer;

#[cfg(feature = "emitter")]
pub use emitter::EmitterObserver;
pub use event::DeliveryEvent;
pub use log::LogObserver;
pub use tracing_observer::TracingObserver;

/// Receives every [`DeliveryEvent`] a channel or queue reports.
///
/// Called on the thread that performed the operation, sometimes with the
/// queue's lock held; implementations must not call back into the
/// component that reported the event.
pub trait Observer: Send + Sync {
    fn record(&self, event: &DeliveryEvent);
}
