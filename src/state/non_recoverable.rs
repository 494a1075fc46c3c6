use std::sync::Arc;

use super::inner::StateInner;

/// Delivery state kept in memory only.
///
/// Reliable references are refused unless the state was built with
/// [`accepting_reliable`](Self::accepting_reliable); even then nothing
/// survives a restart.
#[derive(Clone)]
pub struct NonRecoverableState {
    pub(super) inner: Arc<StateInner>,
}

impl Default for NonRecoverableState {
    fn default() -> Self {
        Self::new()
    }
}

impl NonRecoverableState {
    pub fn new() -> Self {
        Self::with_reliable(false)
    }

    pub fn accepting_reliable() -> Self {
        Self::with_reliable(true)
    }

    pub fn with_reliable(accept_reliable: bool) -> Self {
        NonRecoverableState {
            inner: Arc::new(StateInner::new(None, accept_reliable)),
        }
    }
}
