//! Ordering buffer with deferred activation of scheduled references.

mod error;
mod queue;

pub use error::QueueError;
pub use queue::Queue;
