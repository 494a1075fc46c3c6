use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};

use super::inner::StateInner;
use super::StateError;
use crate::delivery::Delivery;
use crate::journal::RecordId;
use crate::message::MessageReference;
use crate::transaction::{Transaction, TransactionError, TxOperation};

pub(crate) enum StagedOp {
    AddReference {
        reference: MessageReference,
        record: Option<RecordId>,
    },
    RemoveDelivery {
        delivery: Delivery,
        record: Option<RecordId>,
    },
    RemoveReference {
        reference: MessageReference,
        record: Option<RecordId>,
    },
}

/// Everything one transaction staged against one delivery state.
///
/// Registered with the transaction the first time the state sees it. The
/// journal commit happens in `before_commit`, so a journal failure still
/// rolls back every participant.
pub(crate) struct TxStaging {
    state: Weak<StateInner>,
    ops: Mutex<Vec<StagedOp>>,
    journaled: AtomicBool,
}

impl TxStaging {
    pub fn new(state: Weak<StateInner>) -> Self {
        TxStaging {
            state,
            ops: Mutex::new(Vec::new()),
            journaled: AtomicBool::new(false),
        }
    }

    pub fn push(&self, op: StagedOp) -> Result<(), StateError> {
        self.ops
            .lock()
            .map_err(|_| StateError::LockPoisoned("stage"))?
            .push(op);
        Ok(())
    }

    pub fn mark_journaled(&self) {
        self.journaled.store(true, Ordering::SeqCst);
    }

    fn take_ops(&self) -> Vec<StagedOp> {
        match self.ops.lock() {
            Ok(mut ops) => std::mem::take(&mut *ops),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl TxOperation for TxStaging {
    fn before_commit(&self, tx: &Transaction) -> Result<(), TransactionError> {
        if !self.journaled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(state) = self.state.upgrade() else {
            return Ok(());
        };
        state
            .commit_journal(tx.id())
            .map_err(|err| TransactionError::CommitFailed {
                tx: tx.id(),
                reason: err.to_string(),
            })
    }

    fn after_commit(&self, tx: &Transaction) {
        if let Some(state) = self.state.upgrade() {
            state.apply_committed(tx.id(), self.take_ops());
        }
    }

    fn after_rollback(&self, tx: &Transaction) {
        if let Some(state) = self.state.upgrade() {
            state.apply_rolled_back(
                tx.id(),
                self.take_ops(),
                self.journaled.load(Ordering::SeqCst),
            );
        }
    }
}
