use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::ledger::Ledger;
use super::staging::{StagedOp, TxStaging};
use super::{Filter, StateError};
use crate::delivery::Delivery;
use crate::journal::{Journal, JournalError, RecordId};
use crate::message::MessageReference;
use crate::transaction::{Transaction, TxId};

/// Shared body of both delivery state variants.
///
/// The ledger lock is held only for in-memory changes. Journal calls happen
/// outside it, before the change they mirror becomes visible; entries whose
/// journal removal is in flight are claimed so nobody else can resolve them
/// meanwhile.
pub(crate) struct StateInner {
    ledger: Mutex<Ledger>,
    journal: Option<Arc<dyn Journal>>,
    accept_reliable: bool,
    staging: Mutex<HashMap<TxId, Arc<TxStaging>>>,
    next_record: AtomicU64,
    closed: AtomicBool,
}

impl StateInner {
    pub fn new(journal: Option<Arc<dyn Journal>>, accept_reliable: bool) -> Self {
        StateInner {
            ledger: Mutex::new(Ledger::default()),
            journal,
            accept_reliable,
            staging: Mutex::new(HashMap::new()),
            next_record: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_ledger(journal: Arc<dyn Journal>, ledger: Ledger, next_record: u64) -> Self {
        StateInner {
            ledger: Mutex::new(ledger),
            next_record: AtomicU64::new(next_record),
            ..Self::new(Some(journal), true)
        }
    }

    pub fn accepts_reliable(&self) -> bool {
        self.accept_reliable
    }

    pub fn journal(&self) -> Option<&Arc<dyn Journal>> {
        self.journal.as_ref()
    }

    pub fn add_reference(
        self: &Arc<Self>,
        reference: &MessageReference,
        tx: Option<&Transaction>,
    ) -> Result<(), StateError> {
        self.check_reliable(reference)?;

        match tx {
            Some(tx) => {
                let staging = self.staging_for(tx)?;
                let record = self.journal_add(reference, Some(tx.id()))?;
                if record.is_some() {
                    staging.mark_journaled();
                }
                staging.push(StagedOp::AddReference {
                    reference: reference.clone(),
                    record,
                })
            }
            None => {
                let record = self.journal_add(reference, None)?;
                let mut ledger = self.ledger("add reference")?;
                if let Some(record) = record {
                    ledger.set_record(reference.id(), record);
                }
                if !ledger.is_delivered(reference.id()) {
                    ledger.push_back(reference.clone());
                }
                Ok(())
            }
        }
    }

    /// Record deliveries receivers accepted outside any transaction.
    ///
    /// Deliveries that are already done were consumed (or acknowledged) before
    /// they could be recorded and are skipped. A reference left with no
    /// delivery at all is forgotten, journal record included.
    pub fn add_deliveries(&self, deliveries: &[Delivery]) -> Result<(), StateError> {
        let mut references: Vec<MessageReference> = Vec::new();
        for delivery in deliveries {
            if !references.contains(delivery.reference()) {
                references.push(delivery.reference().clone());
            }
        }
        for reference in &references {
            self.check_reliable(reference)?;
        }

        let mut appended = Vec::new();
        for reference in &references {
            match self.journal_add(reference, None) {
                Ok(Some(record)) => appended.push((reference.id(), record)),
                Ok(None) => {}
                Err(err) => {
                    self.journal_remove_quietly(appended.into_iter().map(|(_, r)| r));
                    return Err(err);
                }
            }
        }

        let forgotten = {
            let mut ledger = self.ledger("add deliveries")?;
            for (id, record) in &appended {
                ledger.set_record(*id, *record);
            }
            for reference in &references {
                ledger.take_undelivered(reference.id());
            }
            for delivery in deliveries.iter().filter(|d| !d.is_done()) {
                ledger.insert_delivery(delivery.clone());
            }

            let mut forgotten = Vec::new();
            for reference in &references {
                ledger.end_sweep(reference.id());
                if !ledger.is_pending(reference.id()) && !ledger.is_claimed_ref(reference.id()) {
                    forgotten.extend(ledger.forget_record(reference.id()));
                }
            }
            forgotten
        };

        self.journal_remove_quietly(forgotten);
        Ok(())
    }

    pub fn remove_delivery(
        self: &Arc<Self>,
        delivery: &Delivery,
        tx: Option<&Transaction>,
    ) -> Result<bool, StateError> {
        let staging = tx.map(|tx| self.staging_for(tx)).transpose()?;
        let id = delivery.reference().id();

        let record = {
            let mut ledger = self.ledger("remove delivery")?;
            if !ledger.is_active(delivery) {
                return Ok(false);
            }
            ledger.claim(delivery.id());
            let last = !ledger.has_other_active(id, delivery.id()) && !ledger.is_undelivered(id);
            let record = ledger.record_of(id);
            if record.is_some() && last && ledger.claim_ref(id) {
                record
            } else {
                None
            }
        };

        if let Err(err) = self.journal_remove(record, tx.map(Transaction::id)) {
            let mut ledger = self.ledger("remove delivery")?;
            ledger.release(delivery.id());
            if record.is_some() {
                ledger.release_ref(id);
            }
            return Err(err);
        }

        match staging {
            Some(staging) => {
                if record.is_some() {
                    staging.mark_journaled();
                }
                staging.push(StagedOp::RemoveDelivery {
                    delivery: delivery.clone(),
                    record,
                })?;
            }
            None => {
                let mut ledger = self.ledger("remove delivery")?;
                ledger.take_delivery(delivery.id());
                if record.is_some() {
                    ledger.forget_record(id);
                    ledger.release_ref(id);
                }
            }
        }
        Ok(true)
    }

    pub fn remove_reference(
        self: &Arc<Self>,
        reference: &MessageReference,
        tx: Option<&Transaction>,
    ) -> Result<bool, StateError> {
        let staging = tx.map(|tx| self.staging_for(tx)).transpose()?;
        let id = reference.id();

        let record = {
            let mut ledger = self.ledger("remove reference")?;
            if !ledger.is_undelivered(id) || ledger.is_claimed_ref(id) {
                return Ok(false);
            }
            ledger.claim_ref(id);
            ledger.record_of(id)
        };

        if let Err(err) = self.journal_remove(record, tx.map(Transaction::id)) {
            self.ledger("remove reference")?.release_ref(id);
            return Err(err);
        }

        match staging {
            Some(staging) => {
                if record.is_some() {
                    staging.mark_journaled();
                }
                staging.push(StagedOp::RemoveReference {
                    reference: reference.clone(),
                    record,
                })?;
            }
            None => {
                let mut ledger = self.ledger("remove reference")?;
                ledger.take_undelivered(id);
                ledger.forget_record(id);
                ledger.release_ref(id);
            }
        }
        Ok(true)
    }

    /// Return an active delivery's reference to the head of the undelivered
    /// references, flagged redelivered.
    pub fn cancel(&self, delivery: &Delivery) -> Result<bool, StateError> {
        let mut ledger = self.ledger("cancel")?;
        if !ledger.is_active(delivery) {
            return Ok(false);
        }
        ledger.take_delivery(delivery.id());
        let reference = delivery.reference();
        reference.mark_redelivered();
        if !ledger.is_delivered(reference.id()) {
            ledger.push_front(reference.clone());
        }
        Ok(true)
    }

    /// Drop an active delivery without requeueing its reference. The
    /// reference keeps its journal record.
    pub fn detach(&self, delivery: &Delivery) -> Result<bool, StateError> {
        let mut ledger = self.ledger("detach")?;
        if !ledger.is_active(delivery) {
            return Ok(false);
        }
        ledger.take_delivery(delivery.id());
        Ok(true)
    }

    pub fn requeue_front(&self, reference: &MessageReference) -> Result<(), StateError> {
        let mut ledger = self.ledger("requeue")?;
        if !ledger.is_delivered(reference.id()) {
            ledger.push_front(reference.clone());
        }
        Ok(())
    }

    pub fn move_to_front(&self, reference: &MessageReference) -> Result<bool, StateError> {
        let mut ledger = self.ledger("move to front")?;
        match ledger.take_undelivered(reference.id()) {
            Some(held) => {
                ledger.push_front(held);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn start_sweep(&self, reference: &MessageReference) -> Result<bool, StateError> {
        Ok(self.ledger("start sweep")?.start_sweep(reference.id()))
    }

    pub fn end_sweep(&self, reference: &MessageReference) -> Result<(), StateError> {
        self.ledger("end sweep")?.end_sweep(reference.id());
        Ok(())
    }

    pub fn browse(&self, filter: Option<&dyn Filter>) -> Result<Vec<MessageReference>, StateError> {
        let ledger = self.ledger("browse")?;
        Ok(ledger
            .delivered()
            .into_iter()
            .chain(ledger.undelivered())
            .filter(|r| filter.map_or(true, |f| f.accept(r.message())))
            .cloned()
            .collect())
    }

    pub fn undelivered(
        &self,
        filter: Option<&dyn Filter>,
    ) -> Result<Vec<MessageReference>, StateError> {
        let ledger = self.ledger("undelivered")?;
        Ok(ledger
            .undelivered()
            .filter(|r| filter.map_or(true, |f| f.accept(r.message())))
            .cloned()
            .collect())
    }

    pub fn delivering_count(&self) -> Result<usize, StateError> {
        Ok(self.ledger("delivering count")?.delivery_count())
    }

    pub fn undelivered_count(&self) -> Result<usize, StateError> {
        Ok(self.ledger("undelivered count")?.undelivered_count())
    }

    /// Forget everything held in memory. Journal records stay where they are,
    /// and transactions still open against this state no longer change it.
    pub fn clear(&self) -> Result<(), StateError> {
        self.closed.store(true, Ordering::SeqCst);
        self.ledger("clear")?.clear();
        self.staging
            .lock()
            .map_err(|_| StateError::LockPoisoned("clear"))?
            .clear();
        Ok(())
    }

    pub(super) fn apply_committed(&self, tx: TxId, ops: Vec<StagedOp>) {
        self.forget_staging(tx);
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Ok(mut ledger) = self.ledger("commit") else {
            tracing::error!(%tx, "delivery state lock poisoned while applying commit");
            return;
        };

        for op in ops {
            match op {
                StagedOp::AddReference { reference, record } => {
                    if let Some(record) = record {
                        ledger.set_record(reference.id(), record);
                    }
                    if !ledger.is_delivered(reference.id()) {
                        ledger.push_back(reference);
                    }
                }
                StagedOp::RemoveDelivery { delivery, record } => {
                    ledger.take_delivery(delivery.id());
                    delivery.mark_done();
                    if record.is_some() {
                        ledger.forget_record(delivery.reference().id());
                        ledger.release_ref(delivery.reference().id());
                    }
                }
                StagedOp::RemoveReference { reference, record } => {
                    ledger.take_undelivered(reference.id());
                    if record.is_some() {
                        ledger.forget_record(reference.id());
                    }
                    ledger.release_ref(reference.id());
                }
            }
        }
    }

    pub(super) fn apply_rolled_back(&self, tx: TxId, ops: Vec<StagedOp>, journaled: bool) {
        self.forget_staging(tx);

        if let Ok(mut ledger) = self.ledger("rollback") {
            for op in ops {
                match op {
                    StagedOp::AddReference { .. } => {}
                    StagedOp::RemoveDelivery { delivery, record } => {
                        ledger.release(delivery.id());
                        if record.is_some() {
                            ledger.release_ref(delivery.reference().id());
                        }
                    }
                    StagedOp::RemoveReference { reference, .. } => {
                        ledger.release_ref(reference.id());
                    }
                }
            }
        }

        if let (true, Some(journal)) = (journaled, &self.journal) {
            if let Err(err) = journal.rollback(tx) {
                tracing::warn!(%tx, error = %err, "journal rollback failed");
            }
        }
    }

    pub(super) fn commit_journal(&self, tx: TxId) -> Result<(), JournalError> {
        match &self.journal {
            Some(journal) => journal.commit(tx),
            None => Ok(()),
        }
    }

    fn staging_for(self: &Arc<Self>, tx: &Transaction) -> Result<Arc<TxStaging>, StateError> {
        let mut staging = self
            .staging
            .lock()
            .map_err(|_| StateError::LockPoisoned("stage"))?;
        if let Some(existing) = staging.get(&tx.id()) {
            return Ok(Arc::clone(existing));
        }
        let created = Arc::new(TxStaging::new(Arc::downgrade(self)));
        tx.add_operation(created.clone())?;
        staging.insert(tx.id(), Arc::clone(&created));
        Ok(created)
    }

    fn forget_staging(&self, tx: TxId) {
        if let Ok(mut staging) = self.staging.lock() {
            staging.remove(&tx);
        }
    }

    fn check_reliable(&self, reference: &MessageReference) -> Result<(), StateError> {
        if reference.is_reliable() && !self.accept_reliable {
            return Err(StateError::ReliableNotAccepted);
        }
        Ok(())
    }

    /// Append an add record for a reliable reference that has none yet.
    fn journal_add(
        &self,
        reference: &MessageReference,
        tx: Option<TxId>,
    ) -> Result<Option<RecordId>, StateError> {
        let Some(journal) = self.journal.as_ref().filter(|_| reference.is_reliable()) else {
            return Ok(None);
        };
        if self.ledger("journal add")?.record_of(reference.id()).is_some() {
            return Ok(None);
        }

        let record = RecordId::new(self.next_record.fetch_add(1, Ordering::SeqCst));
        let payload = bitcode::serialize(reference.message()).map_err(JournalError::from)?;
        journal.append_add(record, true, &payload, tx)?;
        Ok(Some(record))
    }

    fn journal_remove(&self, record: Option<RecordId>, tx: Option<TxId>) -> Result<(), StateError> {
        match (record, &self.journal) {
            (Some(record), Some(journal)) => Ok(journal.append_remove(record, tx)?),
            _ => Ok(()),
        }
    }

    fn journal_remove_quietly(&self, records: impl IntoIterator<Item = RecordId>) {
        let Some(journal) = &self.journal else {
            return;
        };
        for record in records {
            if let Err(err) = journal.append_remove(record, None) {
                tracing::warn!(%record, error = %err, "journal remove failed, record will be replayed");
            }
        }
    }

    /// Leave the ledger lock poisoned, as a panic inside it would.
    #[cfg(test)]
    pub fn poison_ledger(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        std::thread::spawn(move || {
            let _ledger = inner.ledger.lock();
            panic!("ledger update panicked");
        })
        .join()
        .ok();
    }

    fn ledger(&self, operation: &'static str) -> Result<MutexGuard<'_, Ledger>, StateError> {
        self.ledger
            .lock()
            .map_err(|_| StateError::LockPoisoned(operation))
    }
}
