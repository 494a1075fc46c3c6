use std::collections::{HashMap, HashSet, VecDeque};

use crate::delivery::{Delivery, DeliveryId};
use crate::journal::RecordId;
use crate::message::{MessageReference, ReferenceId};

/// In-memory bookkeeping of one delivery state.
///
/// A reference is either undelivered or held by one or more active
/// deliveries, never both. Claims mark entries whose removal is in progress
/// (journal I/O or an uncommitted transaction); claimed entries stay visible
/// but cannot be removed, cancelled or swept a second time.
#[derive(Default)]
pub(crate) struct Ledger {
    undelivered: VecDeque<MessageReference>,
    deliveries: Vec<Delivery>,
    claimed: HashSet<DeliveryId>,
    claimed_refs: HashSet<ReferenceId>,
    sweeping: HashSet<ReferenceId>,
    journaled: HashMap<ReferenceId, RecordId>,
}

impl Ledger {
    pub fn push_back(&mut self, reference: MessageReference) {
        if !self.is_undelivered(reference.id()) {
            self.undelivered.push_back(reference);
        }
    }

    pub fn push_front(&mut self, reference: MessageReference) {
        self.take_undelivered(reference.id());
        self.undelivered.push_front(reference);
    }

    pub fn take_undelivered(&mut self, id: ReferenceId) -> Option<MessageReference> {
        let position = self.undelivered.iter().position(|r| r.id() == id)?;
        self.undelivered.remove(position)
    }

    pub fn is_undelivered(&self, id: ReferenceId) -> bool {
        self.undelivered.iter().any(|r| r.id() == id)
    }

    pub fn insert_delivery(&mut self, delivery: Delivery) {
        self.take_undelivered(delivery.reference().id());
        self.sweeping.remove(&delivery.reference().id());
        if !self.deliveries.contains(&delivery) {
            self.deliveries.push(delivery);
        }
    }

    pub fn is_active(&self, delivery: &Delivery) -> bool {
        self.deliveries.contains(delivery) && !self.claimed.contains(&delivery.id())
    }

    pub fn take_delivery(&mut self, id: DeliveryId) -> Option<Delivery> {
        let position = self.deliveries.iter().position(|d| d.id() == id)?;
        self.claimed.remove(&id);
        Some(self.deliveries.remove(position))
    }

    /// Whether the reference is still referred to by any delivery.
    pub fn is_delivered(&self, id: ReferenceId) -> bool {
        self.deliveries.iter().any(|d| d.reference().id() == id)
    }

    /// Active deliveries of `id` other than `except` that no removal has
    /// claimed.
    pub fn has_other_active(&self, id: ReferenceId, except: DeliveryId) -> bool {
        self.deliveries.iter().any(|d| {
            d.reference().id() == id && d.id() != except && !self.claimed.contains(&d.id())
        })
    }

    pub fn is_pending(&self, id: ReferenceId) -> bool {
        self.is_undelivered(id) || self.is_delivered(id)
    }

    pub fn claim(&mut self, id: DeliveryId) {
        self.claimed.insert(id);
    }

    pub fn release(&mut self, id: DeliveryId) {
        self.claimed.remove(&id);
    }

    pub fn claim_ref(&mut self, id: ReferenceId) -> bool {
        self.claimed_refs.insert(id)
    }

    pub fn release_ref(&mut self, id: ReferenceId) {
        self.claimed_refs.remove(&id);
    }

    pub fn is_claimed_ref(&self, id: ReferenceId) -> bool {
        self.claimed_refs.contains(&id) || self.sweeping.contains(&id)
    }

    pub fn start_sweep(&mut self, id: ReferenceId) -> bool {
        if !self.is_undelivered(id) || self.is_claimed_ref(id) {
            return false;
        }
        self.sweeping.insert(id)
    }

    pub fn end_sweep(&mut self, id: ReferenceId) {
        self.sweeping.remove(&id);
    }

    pub fn record_of(&self, id: ReferenceId) -> Option<RecordId> {
        self.journaled.get(&id).copied()
    }

    pub fn set_record(&mut self, id: ReferenceId, record: RecordId) {
        self.journaled.insert(id, record);
    }

    pub fn forget_record(&mut self, id: ReferenceId) -> Option<RecordId> {
        self.journaled.remove(&id)
    }

    pub fn undelivered(&self) -> impl Iterator<Item = &MessageReference> {
        self.undelivered.iter()
    }

    /// References held by deliveries, each once, in delivery order.
    pub fn delivered(&self) -> Vec<&MessageReference> {
        let mut seen = HashSet::new();
        self.deliveries
            .iter()
            .map(Delivery::reference)
            .filter(|r| seen.insert(r.id()))
            .collect()
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.len()
    }

    pub fn undelivered_count(&self) -> usize {
        self.undelivered.len()
    }

    pub fn clear(&mut self) {
        *self = Ledger::default();
    }
}
