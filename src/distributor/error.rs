#[derive(Debug, thiserror::Error)]
pub enum DistributorError {
    #[error("receiver list lock poisoned during {0}")]
    LockPoisoned(&'static str),
}
