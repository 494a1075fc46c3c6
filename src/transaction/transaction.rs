use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::TransactionError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(u64);

impl TxId {
    pub fn new(id: u64) -> Self {
        TxId(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Active,
    Committing,
    Committed,
    RolledBack,
}

/// A participant in a transaction.
///
/// `before_commit` runs for every participant before any `after_commit`; if
/// one of them fails, every participant gets `after_rollback` instead.
pub trait TxOperation: Send + Sync {
    fn before_commit(&self, _tx: &Transaction) -> Result<(), TransactionError> {
        Ok(())
    }

    fn after_commit(&self, tx: &Transaction);

    fn after_rollback(&self, tx: &Transaction);
}

type Callback = Box<dyn FnOnce() + Send>;

struct TxInner {
    status: TxStatus,
    operations: Vec<Arc<dyn TxOperation>>,
    on_commit: Vec<Callback>,
    on_rollback: Vec<Callback>,
}

/// Ordered collection of pending operations plus commit/rollback callbacks.
///
/// The handle is owned by the producer or consumer session; clones refer to
/// the same transaction. Participants and callbacks always run outside the
/// transaction's own lock, so they may inspect the transaction freely.
#[derive(Clone)]
pub struct Transaction {
    id: TxId,
    inner: Arc<Mutex<TxInner>>,
}

impl Transaction {
    pub(crate) fn new(id: TxId) -> Self {
        Transaction {
            id,
            inner: Arc::new(Mutex::new(TxInner {
                status: TxStatus::Active,
                operations: Vec::new(),
                on_commit: Vec::new(),
                on_rollback: Vec::new(),
            })),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn status(&self) -> Result<TxStatus, TransactionError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| TransactionError::LockPoisoned("status"))?;
        Ok(inner.status)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status(), Ok(TxStatus::Active))
    }

    pub fn add_operation(&self, operation: Arc<dyn TxOperation>) -> Result<(), TransactionError> {
        let mut inner = self.active("add operation")?;
        inner.operations.push(operation);
        Ok(())
    }

    /// Run `callback` once the transaction has committed.
    pub fn after_commit<F>(&self, callback: F) -> Result<(), TransactionError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.active("register commit callback")?;
        inner.on_commit.push(Box::new(callback));
        Ok(())
    }

    /// Run `callback` once the transaction has rolled back.
    pub fn after_rollback<F>(&self, callback: F) -> Result<(), TransactionError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.active("register rollback callback")?;
        inner.on_rollback.push(Box::new(callback));
        Ok(())
    }

    pub fn commit(&self) -> Result<(), TransactionError> {
        let operations = {
            let mut inner = self.active("commit")?;
            inner.status = TxStatus::Committing;
            inner.operations.clone()
        };

        for operation in &operations {
            if let Err(err) = operation.before_commit(self) {
                let reason = match err {
                    TransactionError::CommitFailed { reason, .. } => reason,
                    other => other.to_string(),
                };
                self.finish_rollback(&operations)?;
                return Err(TransactionError::CommitFailed {
                    tx: self.id,
                    reason,
                });
            }
        }

        let callbacks = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| TransactionError::LockPoisoned("commit"))?;
            inner.status = TxStatus::Committed;
            inner.operations.clear();
            inner.on_rollback.clear();
            std::mem::take(&mut inner.on_commit)
        };

        for operation in &operations {
            operation.after_commit(self);
        }
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    pub fn rollback(&self) -> Result<(), TransactionError> {
        let operations = {
            let mut inner = self.active("rollback")?;
            inner.status = TxStatus::Committing;
            inner.operations.clone()
        };
        self.finish_rollback(&operations)
    }

    fn finish_rollback(&self, operations: &[Arc<dyn TxOperation>]) -> Result<(), TransactionError> {
        let callbacks = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| TransactionError::LockPoisoned("rollback"))?;
            inner.status = TxStatus::RolledBack;
            inner.operations.clear();
            inner.on_commit.clear();
            std::mem::take(&mut inner.on_rollback)
        };

        for operation in operations {
            operation.after_rollback(self);
        }
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    fn active(
        &self,
        operation: &'static str,
    ) -> Result<std::sync::MutexGuard<'_, TxInner>, TransactionError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| TransactionError::LockPoisoned(operation))?;
        if inner.status != TxStatus::Active {
            return Err(TransactionError::NotActive {
                tx: self.id,
                status: inner.status,
            });
        }
        Ok(inner)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("status", &self.status().ok())
            .finish()
    }
}
