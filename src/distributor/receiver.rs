use crate::delivery::{Delivery, ObserverId};
use crate::message::MessageReference;
use crate::transaction::Transaction;

/// Outcome of offering a reference to a receiver.
#[derive(Debug)]
pub enum Reply {
    /// The receiver took the reference. A delivery that is already done was
    /// consumed synchronously and needs no further bookkeeping.
    Accepted(Delivery),
    /// Not interested in this reference; the next receiver may be asked.
    Declined,
    /// Cannot take anything right now.
    Busy,
}

impl Reply {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Reply::Accepted(_))
    }
}

/// A consumer of message references.
///
/// `observer` names the channel or queue the delivery must be acknowledged
/// against. Implementations must not call back into that channel or queue
/// from `handle`.
pub trait Receiver: Send + Sync {
    fn handle(
        &self,
        observer: &ObserverId,
        reference: &MessageReference,
        tx: Option<&Transaction>,
    ) -> Reply;
}
