#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    /// The timer no longer accepts work.
    #[error("timer is shut down")]
    Shutdown,
    #[error("failed to spawn timer thread: {0}")]
    Spawn(String),
}
