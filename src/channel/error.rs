use crate::distributor::DistributorError;
use crate::error::ConfigError;
use crate::message::StoreError;
use crate::state::StateError;
use crate::timer::TimerError;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {0} is closed")]
    Closed(String),
    /// The message store could not turn the payload into a reference.
    #[error("message rejected: {0}")]
    Rejected(#[from] StoreError),
    #[error("channel {0} does not accept reliable messages")]
    ReliableNotAccepted(String),
    #[error(transparent)]
    State(StateError),
    #[error(transparent)]
    Distributor(#[from] DistributorError),
    /// A scheduled message could not be armed.
    #[error(transparent)]
    Timer(#[from] TimerError),
    #[error("channel lock poisoned during {0}")]
    LockPoisoned(&'static str),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<StateError> for ChannelError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Store(err) => ChannelError::Rejected(err),
            other => ChannelError::State(other),
        }
    }
}
