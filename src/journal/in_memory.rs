use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Journal, JournalEntry, JournalError, RecordId};
use crate::transaction::TxId;

/// In-memory journal for tests and single-process use.
///
/// Clones share the same record log, so handing a clone to a freshly
/// recovered state models reopening the same journal after a restart.
/// Records are kept as bitcode bytes, the way a file-backed journal would
/// keep them.
///
/// ## Example
///
/// ```
/// use delivery_core::{InMemoryJournal, Journal, RecordId};
///
/// let journal = InMemoryJournal::new();
/// journal.append_add(RecordId::new(1), true, b"body", None).unwrap();
/// journal.append_remove(RecordId::new(1), None).unwrap();
///
/// assert_eq!(journal.record_count().unwrap(), 2);
/// assert_eq!(journal.live_record_count().unwrap(), 0);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryJournal {
    inner: Arc<Mutex<JournalInner>>,
}

#[derive(Default)]
struct JournalInner {
    records: Vec<Vec<u8>>,
    live: HashSet<RecordId>,
    open: HashMap<TxId, Vec<Staged>>,
    fail_next: usize,
    failing: bool,
}

enum Staged {
    Add(RecordId),
    Remove(RecordId),
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with `Unavailable`.
    pub fn fail_next(&self, count: usize) -> Result<(), JournalError> {
        self.lock("fail next")?.fail_next = count;
        Ok(())
    }

    /// Make every operation fail until switched off again.
    pub fn set_failing(&self, failing: bool) -> Result<(), JournalError> {
        self.lock("set failing")?.failing = failing;
        Ok(())
    }

    /// Number of records appended, commit and rollback markers included.
    pub fn record_count(&self) -> Result<usize, JournalError> {
        Ok(self.lock("record count")?.records.len())
    }

    /// Number of add records that are committed and not removed.
    pub fn live_record_count(&self) -> Result<usize, JournalError> {
        Ok(self.lock("live record count")?.live.len())
    }

    /// Number of transactions with records but no commit or rollback yet.
    pub fn transaction_count(&self) -> Result<usize, JournalError> {
        Ok(self.lock("transaction count")?.open.len())
    }

    /// One JSON document per record, in append order.
    pub fn debug(&self) -> Result<String, JournalError> {
        let lines = self
            .replay()?
            .iter()
            .map(|entry| {
                serde_json::to_string(entry).map_err(|e| JournalError::Codec(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lines.join("\n"))
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, JournalInner>, JournalError> {
        self.inner
            .lock()
            .map_err(|_| JournalError::LockPoisoned(operation))
    }

    fn writable(&self, operation: &'static str) -> Result<MutexGuard<'_, JournalInner>, JournalError> {
        let mut inner = self.lock(operation)?;
        if inner.failing {
            return Err(JournalError::Unavailable(format!("{operation} refused")));
        }
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(JournalError::Unavailable(format!("{operation} refused")));
        }
        Ok(inner)
    }
}

impl JournalInner {
    fn push(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
        self.records.push(bitcode::serialize(entry)?);
        Ok(())
    }

    fn stage(&mut self, tx: Option<TxId>, staged: Staged) {
        match tx {
            Some(tx) => self.open.entry(tx).or_default().push(staged),
            None => self.apply(staged),
        }
    }

    fn apply(&mut self, staged: Staged) {
        match staged {
            Staged::Add(id) => {
                self.live.insert(id);
            }
            Staged::Remove(id) => {
                self.live.remove(&id);
            }
        }
    }
}

impl Journal for InMemoryJournal {
    fn append_add(
        &self,
        id: RecordId,
        reliable: bool,
        payload: &[u8],
        tx: Option<TxId>,
    ) -> Result<(), JournalError> {
        let mut inner = self.writable("append add")?;
        inner.push(&JournalEntry::Add {
            id,
            reliable,
            payload: payload.to_vec(),
            tx,
        })?;
        inner.stage(tx, Staged::Add(id));
        Ok(())
    }

    fn append_remove(&self, id: RecordId, tx: Option<TxId>) -> Result<(), JournalError> {
        let mut inner = self.writable("append remove")?;
        inner.push(&JournalEntry::Remove { id, tx })?;
        inner.stage(tx, Staged::Remove(id));
        Ok(())
    }

    fn commit(&self, tx: TxId) -> Result<(), JournalError> {
        let mut inner = self.writable("commit")?;
        if !inner.open.contains_key(&tx) {
            return Err(JournalError::UnknownTransaction(tx));
        }
        inner.push(&JournalEntry::Commit { tx })?;
        for staged in inner.open.remove(&tx).unwrap_or_default() {
            inner.apply(staged);
        }
        Ok(())
    }

    fn rollback(&self, tx: TxId) -> Result<(), JournalError> {
        let mut inner = self.writable("rollback")?;
        if !inner.open.contains_key(&tx) {
            return Err(JournalError::UnknownTransaction(tx));
        }
        inner.push(&JournalEntry::Rollback { tx })?;
        inner.open.remove(&tx);
        Ok(())
    }

    fn replay(&self) -> Result<Vec<JournalEntry>, JournalError> {
        let inner = self.lock("replay")?;
        inner
            .records
            .iter()
            .map(|bytes| bitcode::deserialize(bytes).map_err(JournalError::from))
            .collect()
    }
}
