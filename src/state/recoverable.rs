use std::collections::HashMap;
use std::sync::Arc;

use super::inner::StateInner;
use super::ledger::Ledger;
use super::StateError;
use crate::journal::{Journal, JournalEntry, JournalError, RecordId};
use crate::message::{Message, MessageStore};
use crate::transaction::TxId;

/// Delivery state mirrored to a [`Journal`].
///
/// Reliable references are always accepted. Every add and final removal of
/// a reliable reference is appended to the journal before it becomes
/// visible, tagged with the transaction when there is one. Moving a
/// reference between undelivered and delivered is not journaled: after a
/// restart every pending reference is undelivered again.
#[derive(Clone)]
pub struct RecoverableState {
    pub(super) inner: Arc<StateInner>,
}

impl RecoverableState {
    pub fn new(journal: Arc<dyn Journal>) -> Self {
        RecoverableState {
            inner: Arc::new(StateInner::new(Some(journal), true)),
        }
    }

    /// Rebuild the pending references recorded in `journal`.
    ///
    /// Records outside any transaction apply in order; transactional records
    /// apply at their commit marker. Transactions that were never committed
    /// or rolled back are rolled back in the journal now. References are
    /// recreated through `store` in the order their add records were written.
    pub fn recover(journal: Arc<dyn Journal>, store: &dyn MessageStore) -> Result<Self, StateError> {
        let mut replay = Replay::default();
        for entry in journal.replay()? {
            replay.entry(entry);
        }

        let mut dangling: Vec<TxId> = replay.open.keys().copied().collect();
        dangling.sort();
        for tx in &dangling {
            journal.rollback(*tx)?;
        }

        let mut ledger = Ledger::default();
        let mut restored = 0usize;
        for (record, payload) in replay.live.into_iter().flatten() {
            let message: Message = bitcode::deserialize(&payload).map_err(JournalError::from)?;
            let reference = store.reference(message)?;
            ledger.set_record(reference.id(), record);
            ledger.push_back(reference);
            restored += 1;
        }

        tracing::debug!(restored, dangling = dangling.len(), "journal replayed");

        Ok(RecoverableState {
            inner: Arc::new(StateInner::from_ledger(
                journal,
                ledger,
                replay.last_record.saturating_add(1),
            )),
        })
    }

    pub fn journal(&self) -> Option<&Arc<dyn Journal>> {
        self.inner.journal()
    }
}

#[derive(Default)]
struct Replay {
    live: Vec<Option<(RecordId, Vec<u8>)>>,
    index: HashMap<RecordId, usize>,
    open: HashMap<TxId, Vec<JournalEntry>>,
    last_record: u64,
}

impl Replay {
    fn entry(&mut self, entry: JournalEntry) {
        // Ids of adds that never apply are still taken.
        if let JournalEntry::Add { id, .. } = &entry {
            self.last_record = self.last_record.max(id.get());
        }
        match entry {
            JournalEntry::Commit { tx } => {
                for staged in self.open.remove(&tx).unwrap_or_default() {
                    self.apply(staged);
                }
            }
            JournalEntry::Rollback { tx } => {
                self.open.remove(&tx);
            }
            entry => match entry.tx() {
                Some(tx) => self.open.entry(tx).or_default().push(entry),
                None => self.apply(entry),
            },
        }
    }

    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Add { id, payload, .. } => {
                self.index.insert(id, self.live.len());
                self.live.push(Some((id, payload)));
            }
            JournalEntry::Remove { id, .. } => {
                if let Some(slot) = self.index.remove(&id) {
                    self.live[slot] = None;
                }
            }
            JournalEntry::Commit { .. } | JournalEntry::Rollback { .. } => {}
        }
    }
}
