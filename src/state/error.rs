use crate::journal::JournalError;
use crate::message::StoreError;
use crate::transaction::TransactionError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// A reliable reference was offered to a state that refuses them.
    #[error("delivery state does not accept reliable messages")]
    ReliableNotAccepted,
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("delivery state lock poisoned during {0}")]
    LockPoisoned(&'static str),
}
