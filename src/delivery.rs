//! In-flight handoffs of a message reference to a receiver.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::message::MessageReference;

/// Name of the party that observes the outcome of a delivery: the channel or
/// queue that handed the reference out, or the producer that sent it.
///
/// Deliveries hold this id rather than a handle, the observer's lifetime is
/// owned elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObserverId(String);

impl ObserverId {
    pub fn new(id: impl Into<String>) -> Self {
        ObserverId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObserverId {
    fn from(id: &str) -> Self {
        ObserverId::new(id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryId(u64);

impl DeliveryId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delivery-{}", self.0)
    }
}

static NEXT_DELIVERY: AtomicU64 = AtomicU64::new(1);

/// One handoff of a reference to one receiver.
///
/// Two deliveries of the same message to two receivers are distinct: equality
/// and hashing use the delivery id only. Clones share the completion flag.
#[derive(Clone)]
pub struct Delivery {
    inner: Arc<DeliveryInner>,
}

struct DeliveryInner {
    id: DeliveryId,
    reference: MessageReference,
    observer: Option<ObserverId>,
    done: AtomicBool,
}

impl Delivery {
    /// A delivery the receiver will acknowledge or cancel later.
    pub fn new(reference: MessageReference, observer: Option<ObserverId>) -> Self {
        Self::with_done(reference, observer, false)
    }

    /// A delivery the receiver completed while handling it.
    pub fn completed(reference: MessageReference, observer: Option<ObserverId>) -> Self {
        Self::with_done(reference, observer, true)
    }

    fn with_done(reference: MessageReference, observer: Option<ObserverId>, done: bool) -> Self {
        Delivery {
            inner: Arc::new(DeliveryInner {
                id: DeliveryId(NEXT_DELIVERY.fetch_add(1, Ordering::Relaxed)),
                reference,
                observer,
                done: AtomicBool::new(done),
            }),
        }
    }

    pub fn id(&self) -> DeliveryId {
        self.inner.id
    }

    pub fn reference(&self) -> &MessageReference {
        &self.inner.reference
    }

    pub fn observer(&self) -> Option<&ObserverId> {
        self.inner.observer.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }

    /// Returns `true` if this call completed the delivery.
    pub fn mark_done(&self) -> bool {
        !self.inner.done.swap(true, Ordering::SeqCst)
    }
}

impl PartialEq for Delivery {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Delivery {}

impl Hash for Delivery {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.inner.id)
            .field("reference", &self.inner.reference)
            .field("observer", &self.inner.observer)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Several deliveries of one fan-out, acknowledged or cancelled as a unit from
/// the sender's point of view.
///
/// A channel returns one of these when it could not take responsibility for
/// the deliveries its receivers accepted.
#[derive(Clone, Debug)]
pub struct CompositeDelivery {
    observer: Option<ObserverId>,
    deliveries: Vec<Delivery>,
}

impl CompositeDelivery {
    pub fn new(observer: Option<ObserverId>, deliveries: Vec<Delivery>) -> Self {
        CompositeDelivery {
            observer,
            deliveries,
        }
    }

    pub fn observer(&self) -> Option<&ObserverId> {
        self.observer.as_ref()
    }

    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    /// Done once every underlying delivery is done.
    pub fn is_done(&self) -> bool {
        self.deliveries.iter().all(Delivery::is_done)
    }

    pub fn mark_done(&self) {
        for delivery in &self.deliveries {
            delivery.mark_done();
        }
    }

    /// Distinct references carried by the underlying deliveries.
    pub fn references(&self) -> Vec<MessageReference> {
        let mut references: Vec<MessageReference> = Vec::with_capacity(self.deliveries.len());
        for delivery in &self.deliveries {
            if !references.contains(delivery.reference()) {
                references.push(delivery.reference().clone());
            }
        }
        references
    }
}
