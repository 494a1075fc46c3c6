use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use super::{Message, MessageReference, ReferenceId, StoreError};

/// Converts raw messages into per-queue references.
///
/// A failure is reported to the caller and never retried by the store.
pub trait MessageStore: Send + Sync {
    fn reference(&self, message: Message) -> Result<MessageReference, StoreError>;
}

/// Something a channel can be asked to handle: either a raw message that
/// still needs a reference, or a reference that already exists.
#[derive(Clone, Debug)]
pub enum Routable {
    Message(Message),
    Reference(MessageReference),
}

impl Routable {
    pub fn is_reference(&self) -> bool {
        matches!(self, Routable::Reference(_))
    }

    pub fn is_reliable(&self) -> bool {
        match self {
            Routable::Message(message) => message.reliable,
            Routable::Reference(reference) => reference.is_reliable(),
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            Routable::Message(message) => &message.id,
            Routable::Reference(reference) => reference.message_id(),
        }
    }
}

impl From<Message> for Routable {
    fn from(message: Message) -> Self {
        Routable::Message(message)
    }
}

impl From<MessageReference> for Routable {
    fn from(reference: MessageReference) -> Self {
        Routable::Reference(reference)
    }
}

/// In-memory message store.
///
/// Features:
/// - Thread-safe (share it behind an `Arc`)
/// - References to the same message id share one body while any of them is alive
/// - Optional capacity on the number of live bodies
///
/// ## Example
///
/// ```
/// use delivery_core::{InMemoryMessageStore, Message, MessageStore};
///
/// let store = InMemoryMessageStore::new();
/// let a = store.reference(Message::with_string_payload("msg-1", "{}")).unwrap();
/// let b = store.reference(Message::with_string_payload("msg-1", "{}")).unwrap();
///
/// assert_ne!(a, b);
/// assert!(std::sync::Arc::ptr_eq(&a.message_arc(), &b.message_arc()));
/// ```
pub struct InMemoryMessageStore {
    bodies: RwLock<HashMap<String, Weak<Message>>>,
    next_reference: AtomicU64,
    capacity: Option<usize>,
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        InMemoryMessageStore {
            bodies: RwLock::new(HashMap::new()),
            next_reference: AtomicU64::new(1),
            capacity: None,
        }
    }

    /// Bound the number of live message bodies.
    pub fn with_capacity(capacity: usize) -> Self {
        InMemoryMessageStore {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Number of bodies that still have at least one live reference.
    pub fn live_count(&self) -> Result<usize, StoreError> {
        let bodies = self
            .bodies
            .read()
            .map_err(|_| StoreError::LockPoisoned("live count"))?;
        Ok(bodies.values().filter(|body| body.strong_count() > 0).count())
    }

    pub fn contains(&self, message_id: &str) -> Result<bool, StoreError> {
        let bodies = self
            .bodies
            .read()
            .map_err(|_| StoreError::LockPoisoned("contains"))?;
        Ok(bodies
            .get(message_id)
            .map(|body| body.strong_count() > 0)
            .unwrap_or(false))
    }

    fn next_id(&self) -> ReferenceId {
        ReferenceId::new(self.next_reference.fetch_add(1, Ordering::SeqCst))
    }
}

impl MessageStore for InMemoryMessageStore {
    fn reference(&self, message: Message) -> Result<MessageReference, StoreError> {
        if message.id.is_empty() {
            return Err(StoreError::Malformed("message id is empty".into()));
        }

        let mut bodies = self
            .bodies
            .write()
            .map_err(|_| StoreError::LockPoisoned("reference"))?;

        if let Some(body) = bodies.get(&message.id).and_then(Weak::upgrade) {
            return Ok(MessageReference::new(self.next_id(), body));
        }

        if let Some(capacity) = self.capacity {
            bodies.retain(|_, body| body.strong_count() > 0);
            if bodies.len() >= capacity {
                return Err(StoreError::Exhausted { capacity });
            }
        }

        let body = Arc::new(message);
        bodies.insert(body.id.clone(), Arc::downgrade(&body));
        Ok(MessageReference::new(self.next_id(), body))
    }
}
