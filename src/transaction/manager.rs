use std::sync::atomic::{AtomicU64, Ordering};

use super::{Transaction, TxId};

/// Hands out transactions with ids unique to this manager.
#[derive(Debug)]
pub struct TransactionManager {
    next_id: AtomicU64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        TransactionManager {
            next_id: AtomicU64::new(1),
        }
    }

    /// Continue numbering after `last`, e.g. the highest id found in a
    /// replayed journal.
    pub fn resume_after(last: TxId) -> Self {
        TransactionManager {
            next_id: AtomicU64::new(last.get().saturating_add(1)),
        }
    }

    pub fn begin(&self) -> Transaction {
        Transaction::new(TxId::new(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }
}
