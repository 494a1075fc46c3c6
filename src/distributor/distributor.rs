use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use super::{DistributorError, Receiver, Reply};
use crate::delivery::{Delivery, ObserverId};
use crate::message::MessageReference;
use crate::transaction::Transaction;

/// How many receivers get a reference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionPolicy {
    /// Queue semantics: the first receiver (in registration order) that
    /// accepts wins. A busy receiver stops the search.
    #[default]
    PointToPoint,
    /// Topic semantics: every receiver is offered the reference, in
    /// registration order, and every acceptance is a delivery.
    FanOut,
}

/// The set of registered receivers plus the policy that selects among them.
///
/// Membership is by identity of the `Arc`. Offering always works on a
/// snapshot of the set, so receivers added or removed while a reference is
/// being offered only affect later offers.
pub struct Distributor {
    policy: DistributionPolicy,
    receivers: RwLock<Vec<Arc<dyn Receiver>>>,
}

impl Default for Distributor {
    fn default() -> Self {
        Self::new(DistributionPolicy::default())
    }
}

impl Distributor {
    pub fn new(policy: DistributionPolicy) -> Self {
        Distributor {
            policy,
            receivers: RwLock::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> DistributionPolicy {
        self.policy
    }

    /// Register a receiver. Returns `false` if it was already registered.
    pub fn add(&self, receiver: Arc<dyn Receiver>) -> Result<bool, DistributorError> {
        let mut receivers = self.write("add")?;
        if receivers.iter().any(|r| same_receiver(r, &receiver)) {
            return Ok(false);
        }
        receivers.push(receiver);
        Ok(true)
    }

    pub fn remove(&self, receiver: &Arc<dyn Receiver>) -> Result<bool, DistributorError> {
        let mut receivers = self.write("remove")?;
        let before = receivers.len();
        receivers.retain(|r| !same_receiver(r, receiver));
        Ok(receivers.len() != before)
    }

    pub fn contains(&self, receiver: &Arc<dyn Receiver>) -> Result<bool, DistributorError> {
        Ok(self
            .read("contains")?
            .iter()
            .any(|r| same_receiver(r, receiver)))
    }

    pub fn clear(&self) -> Result<(), DistributorError> {
        self.write("clear")?.clear();
        Ok(())
    }

    pub fn len(&self) -> Result<usize, DistributorError> {
        Ok(self.read("len")?.len())
    }

    pub fn is_empty(&self) -> Result<bool, DistributorError> {
        Ok(self.len()? == 0)
    }

    /// Registered receivers in registration order.
    pub fn receivers(&self) -> Result<Vec<Arc<dyn Receiver>>, DistributorError> {
        Ok(self.read("receivers")?.clone())
    }

    fn read(
        &self,
        operation: &'static str,
    ) -> Result<RwLockReadGuard<'_, Vec<Arc<dyn Receiver>>>, DistributorError> {
        self.receivers
            .read()
            .map_err(|_| DistributorError::LockPoisoned(operation))
    }

    fn write(
        &self,
        operation: &'static str,
    ) -> Result<RwLockWriteGuard<'_, Vec<Arc<dyn Receiver>>>, DistributorError> {
        self.receivers
            .write()
            .map_err(|_| DistributorError::LockPoisoned(operation))
    }

    /// Offer `reference` to the receivers selected by the policy and return
    /// the deliveries they produced. Empty means nobody took it.
    pub fn handle(
        &self,
        observer: &ObserverId,
        reference: &MessageReference,
        tx: Option<&Transaction>,
    ) -> Result<Vec<Delivery>, DistributorError> {
        let mut deliveries = Vec::new();

        for receiver in self.receivers()? {
            match receiver.handle(observer, reference, tx) {
                Reply::Accepted(delivery) => {
                    reference.increment_delivery_count();
                    deliveries.push(delivery);
                    if self.policy == DistributionPolicy::PointToPoint {
                        break;
                    }
                }
                Reply::Declined => {}
                Reply::Busy => {
                    if self.policy == DistributionPolicy::PointToPoint {
                        break;
                    }
                }
            }
        }

        Ok(deliveries)
    }
}

fn same_receiver(a: &Arc<dyn Receiver>, b: &Arc<dyn Receiver>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
