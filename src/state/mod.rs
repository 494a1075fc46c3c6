//! Bookkeeping of pending references and in-flight deliveries.
//!
//! [`DeliveryState`] is the single point of truth for whether a delivery is
//! still active. It comes in two variants chosen once, when a channel is
//! built: [`NonRecoverableState`] lives in memory only, [`RecoverableState`]
//! mirrors reliable references to a journal.

mod error;
mod inner;
mod ledger;
mod non_recoverable;
mod recoverable;
mod staging;

use std::slice;
use std::sync::Arc;

pub use error::StateError;
pub use non_recoverable::NonRecoverableState;
pub use recoverable::RecoverableState;

use crate::delivery::Delivery;
use crate::message::{Message, MessageReference};
use crate::transaction::Transaction;
use inner::StateInner;

/// Predicate over message bodies used by `browse` and `undelivered`.
pub trait Filter {
    fn accept(&self, message: &Message) -> bool;
}

impl<F> Filter for F
where
    F: Fn(&Message) -> bool,
{
    fn accept(&self, message: &Message) -> bool {
        self(message)
    }
}

/// The delivery state a channel works against.
///
/// Clones share the same bookkeeping.
#[derive(Clone)]
pub enum DeliveryState {
    NonRecoverable(NonRecoverableState),
    Recoverable(RecoverableState),
}

impl From<NonRecoverableState> for DeliveryState {
    fn from(state: NonRecoverableState) -> Self {
        DeliveryState::NonRecoverable(state)
    }
}

impl From<RecoverableState> for DeliveryState {
    fn from(state: RecoverableState) -> Self {
        DeliveryState::Recoverable(state)
    }
}

impl DeliveryState {
    fn inner(&self) -> &Arc<StateInner> {
        match self {
            DeliveryState::NonRecoverable(state) => &state.inner,
            DeliveryState::Recoverable(state) => &state.inner,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, DeliveryState::Recoverable(_))
    }

    pub fn accepts_reliable(&self) -> bool {
        self.inner().accepts_reliable()
    }

    /// Record `reference` as pending. With a transaction the add is staged
    /// and becomes visible on commit.
    pub fn add_reference(
        &self,
        reference: &MessageReference,
        tx: Option<&Transaction>,
    ) -> Result<(), StateError> {
        self.inner().add_reference(reference, tx)
    }

    /// Record a delivery a receiver accepted synchronously.
    pub fn add_delivery(&self, delivery: &Delivery) -> Result<(), StateError> {
        self.add_deliveries(slice::from_ref(delivery))
    }

    /// Record all deliveries of one fan-out at once: either every one of them
    /// is recorded or, on error, none is.
    pub fn add_deliveries(&self, deliveries: &[Delivery]) -> Result<(), StateError> {
        self.inner().add_deliveries(deliveries)
    }

    /// Remove an active delivery. `Ok(false)` if it is not active (already
    /// acknowledged, cancelled, or being removed by someone else).
    pub fn remove_delivery(
        &self,
        delivery: &Delivery,
        tx: Option<&Transaction>,
    ) -> Result<bool, StateError> {
        self.inner().remove_delivery(delivery, tx)
    }

    /// Remove an undelivered reference.
    pub fn remove_reference(
        &self,
        reference: &MessageReference,
        tx: Option<&Transaction>,
    ) -> Result<bool, StateError> {
        self.inner().remove_reference(reference, tx)
    }

    pub fn cancel(&self, delivery: &Delivery) -> Result<bool, StateError> {
        self.inner().cancel(delivery)
    }

    pub fn detach(&self, delivery: &Delivery) -> Result<bool, StateError> {
        self.inner().detach(delivery)
    }

    pub fn requeue_front(&self, reference: &MessageReference) -> Result<(), StateError> {
        self.inner().requeue_front(reference)
    }

    /// Move an undelivered reference to the head of delivery order.
    /// `Ok(false)` if it is not undelivered (delivered, removed, or still
    /// staged in a transaction).
    pub fn move_to_front(&self, reference: &MessageReference) -> Result<bool, StateError> {
        self.inner().move_to_front(reference)
    }

    /// Reserve an undelivered reference for one redelivery attempt. Returns
    /// `false` if it is gone or already reserved.
    pub fn start_sweep(&self, reference: &MessageReference) -> Result<bool, StateError> {
        self.inner().start_sweep(reference)
    }

    pub fn end_sweep(&self, reference: &MessageReference) -> Result<(), StateError> {
        self.inner().end_sweep(reference)
    }

    /// Snapshot of every pending reference: those held by deliveries first,
    /// then undelivered ones in delivery order.
    pub fn browse(&self, filter: Option<&dyn Filter>) -> Result<Vec<MessageReference>, StateError> {
        self.inner().browse(filter)
    }

    pub fn undelivered(
        &self,
        filter: Option<&dyn Filter>,
    ) -> Result<Vec<MessageReference>, StateError> {
        self.inner().undelivered(filter)
    }

    pub fn delivering_count(&self) -> Result<usize, StateError> {
        self.inner().delivering_count()
    }

    pub fn undelivered_count(&self) -> Result<usize, StateError> {
        self.inner().undelivered_count()
    }

    pub fn clear(&self) -> Result<(), StateError> {
        self.inner().clear()
    }

    #[cfg(test)]
    pub(crate) fn poison_ledger(&self) {
        self.inner().poison_ledger();
    }
}
