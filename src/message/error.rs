/// Errors returned by a [`MessageStore`](super::MessageStore).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The payload cannot be turned into a reference.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// The store holds as many live message bodies as it is allowed to.
    #[error("message store exhausted (capacity {capacity})")]
    Exhausted { capacity: usize },
    #[error("message store lock poisoned during {0}")]
    LockPoisoned(&'static str),
}
