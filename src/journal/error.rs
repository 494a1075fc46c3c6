use crate::transaction::TxId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JournalError {
    /// The journal could not make the operation durable.
    #[error("journal unavailable: {0}")]
    Unavailable(String),
    #[error("journal codec error: {0}")]
    Codec(String),
    /// Commit or rollback of a transaction the journal has no open records for.
    #[error("unknown journal transaction {0}")]
    UnknownTransaction(TxId),
    #[error("journal lock poisoned during {0}")]
    LockPoisoned(&'static str),
}

impl From<bitcode::Error> for JournalError {
    fn from(err: bitcode::Error) -> Self {
        JournalError::Codec(err.to_string())
    }
}
