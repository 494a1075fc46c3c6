use super::{TxId, TxStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    /// The transaction already committed, rolled back or is committing.
    #[error("transaction {tx} is not active ({status:?})")]
    NotActive { tx: TxId, status: TxStatus },
    /// A participant refused to commit; every participant was rolled back.
    #[error("transaction {tx} failed to commit: {reason}")]
    CommitFailed { tx: TxId, reason: String },
    #[error("transaction lock poisoned during {0}")]
    LockPoisoned(&'static str),
}
