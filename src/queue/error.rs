use crate::distributor::DistributorError;
use crate::error::ConfigError;
use crate::timer::TimerError;
use crate::transaction::TransactionError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue {0} is closed")]
    Closed(String),
    #[error("queue lock poisoned during {0}")]
    LockPoisoned(&'static str),
    #[error(transparent)]
    Distributor(#[from] DistributorError),
    #[error(transparent)]
    Timer(#[from] TimerError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
