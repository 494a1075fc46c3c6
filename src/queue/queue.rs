use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use super::QueueError;
use crate::config::QueueConfig;
use crate::delivery::{Delivery, DeliveryId, ObserverId};
use crate::distributor::{Distributor, Receiver};
use crate::message::{MessageReference, ReferenceId};
use crate::observer::{DeliveryEvent, Observer, TracingObserver};
use crate::state::Filter;
use crate::timer::{ThreadTimer, Timer, TimerId};
use crate::transaction::{Transaction, TxOperation};

// A held-back reference and the timer arming that will activate it.
struct Scheduled {
    reference: MessageReference,
    timer: Option<TimerId>,
}

#[derive(Default)]
struct QueueInner {
    buffer: VecDeque<MessageReference>,
    scheduled: HashMap<ReferenceId, Scheduled>,
    in_flight: Vec<Delivery>,
    // In-flight deliveries whose acknowledgment waits for a commit.
    acking: HashSet<DeliveryId>,
}

impl QueueInner {
    fn holds(&self, id: ReferenceId) -> bool {
        self.scheduled.contains_key(&id)
            || self.buffer.iter().any(|r| r.id() == id)
            || self.in_flight.iter().any(|d| d.reference().id() == id)
    }

    fn is_active(&self, delivery: &Delivery) -> bool {
        self.in_flight.contains(delivery) && !self.acking.contains(&delivery.id())
    }

    fn take(&mut self, delivery: &Delivery) -> Option<Delivery> {
        let position = self.in_flight.iter().position(|d| d == delivery)?;
        self.acking.remove(&delivery.id());
        Some(self.in_flight.remove(position))
    }
}

struct QueueShared {
    name: ObserverId,
    inner: Mutex<QueueInner>,
    distributor: Distributor,
    timer: Arc<dyn Timer>,
    observer: Arc<dyn Observer>,
    closed: AtomicBool,
}

/// A queue of references in delivery order.
///
/// Every reference is in exactly one of three places: the ordering buffer,
/// the scheduled set (its delivery time is still in the future) or in
/// flight with a consumer. A scheduled reference moves to the *head* of the
/// buffer when its timer fires, so references scheduled for t1 < t2 < t3
/// end up ordered t3, t2, t1 ahead of everything else.
///
/// Every change to the buffer is followed by a dispatch walk from the head,
/// which stops at the first reference no consumer takes. Consumers are
/// called with the queue's lock held and must not call back into the queue
/// from [`Receiver::handle`].
///
/// ## Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use delivery_core::{
///     ManualTimer, Message, MessageReference, Queue, QueueConfig, ReferenceId, Timer,
///     TracingObserver,
/// };
///
/// let timer = Arc::new(ManualTimer::new());
/// let queue = Queue::new(QueueConfig::new("jobs"), timer.clone(), Arc::new(TracingObserver)).unwrap();
///
/// let later = Message::with_string_payload("later", "{}")
///     .with_scheduled_delivery(timer.now() + Duration::from_secs(5));
/// queue.add_tail(MessageReference::new(ReferenceId::new(1), Arc::new(later))).unwrap();
/// assert_eq!(queue.scheduled_count().unwrap(), 1);
///
/// timer.advance(Duration::from_secs(5));
/// assert_eq!(queue.message_count().unwrap(), 1);
/// ```
#[derive(Clone)]
pub struct Queue {
    shared: Arc<QueueShared>,
}

impl Queue {
    pub fn new(
        config: QueueConfig,
        timer: Arc<dyn Timer>,
        observer: Arc<dyn Observer>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        Ok(Queue {
            shared: Arc::new(QueueShared {
                name: ObserverId::new(config.name),
                inner: Mutex::new(QueueInner::default()),
                distributor: Distributor::new(config.policy),
                timer,
                observer,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// A queue with its own timer thread, reporting to `tracing`.
    pub fn with_thread_timer(config: QueueConfig) -> Result<Self, QueueError> {
        let timer = ThreadTimer::with_name_prefix(&config.timer_thread)?;
        Self::new(config, Arc::new(timer), Arc::new(TracingObserver))
    }

    pub fn name(&self) -> &ObserverId {
        &self.shared.name
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn add_consumer(&self, consumer: Arc<dyn Receiver>) -> Result<bool, QueueError> {
        self.ensure_open()?;
        let added = self.shared.distributor.add(consumer)?;
        if added {
            self.deliver_now()?;
        }
        Ok(added)
    }

    pub fn remove_consumer(&self, consumer: &Arc<dyn Receiver>) -> Result<bool, QueueError> {
        Ok(self.shared.distributor.remove(consumer)?)
    }

    pub fn consumer_count(&self) -> Result<usize, QueueError> {
        Ok(self.shared.distributor.len()?)
    }

    /// Enqueue at the tail, or hold the reference back if it is scheduled
    /// for later. A reference the queue already holds is ignored.
    pub fn add_tail(&self, reference: MessageReference) -> Result<(), QueueError> {
        self.enqueue(reference, false)
    }

    /// Enqueue at the head, or hold the reference back if it is scheduled
    /// for later. A reference the queue already holds is ignored.
    pub fn add_head(&self, reference: MessageReference) -> Result<(), QueueError> {
        self.enqueue(reference, true)
    }

    fn enqueue(&self, reference: MessageReference, head: bool) -> Result<(), QueueError> {
        self.ensure_open()?;

        if let Some(at) = reference
            .scheduled_delivery()
            .filter(|_| !reference.is_due(self.shared.timer.now()))
        {
            return self.schedule(reference, at);
        }

        let mut inner = self.lock("enqueue")?;
        if inner.holds(reference.id()) {
            return Ok(());
        }
        self.insert(&mut inner, reference, head)
    }

    fn schedule(
        &self,
        reference: MessageReference,
        at: std::time::SystemTime,
    ) -> Result<(), QueueError> {
        let id = reference.id();
        let message = reference.message_id().to_string();
        {
            let mut inner = self.lock("schedule")?;
            if inner.holds(id) {
                return Ok(());
            }
            inner.scheduled.insert(
                id,
                Scheduled {
                    reference,
                    timer: None,
                },
            );
        }

        let queue = Arc::downgrade(&self.shared);
        let armed = self
            .shared
            .timer
            .arm_once(at, Box::new(move || activate(&queue, id)));
        match armed {
            Ok(timer) => {
                // The callback may already have run and claimed the entry.
                if let Some(entry) = self.lock("schedule")?.scheduled.get_mut(&id) {
                    entry.timer = Some(timer);
                }
            }
            Err(err) => {
                self.lock("schedule")?.scheduled.remove(&id);
                return Err(err.into());
            }
        }

        self.record(DeliveryEvent::Scheduled {
            channel: self.shared.name.to_string(),
            message,
            at,
        });
        Ok(())
    }

    // The one path by which references enter the buffer.
    fn insert(
        &self,
        inner: &mut QueueInner,
        reference: MessageReference,
        head: bool,
    ) -> Result<(), QueueError> {
        if head {
            inner.buffer.push_front(reference);
        } else {
            inner.buffer.push_back(reference);
        }
        self.dispatch(inner)?;
        Ok(())
    }

    fn dispatch(&self, inner: &mut QueueInner) -> Result<usize, QueueError> {
        let mut delivered = 0;
        while let Some(reference) = inner.buffer.front().cloned() {
            let deliveries = self
                .shared
                .distributor
                .handle(&self.shared.name, &reference, None)?;
            if deliveries.is_empty() {
                break;
            }

            inner.buffer.pop_front();
            let receivers = deliveries.len();
            inner
                .in_flight
                .extend(deliveries.into_iter().filter(|d| !d.is_done()));
            delivered += 1;

            self.record(DeliveryEvent::Delivered {
                channel: self.shared.name.to_string(),
                message: reference.message_id().to_string(),
                receivers,
            });
        }
        Ok(delivered)
    }

    /// Offer buffered references to the consumers, head first. Returns how
    /// many references were handed out.
    pub fn deliver_now(&self) -> Result<usize, QueueError> {
        self.ensure_open()?;
        let mut inner = self.lock("deliver")?;
        self.dispatch(&mut inner)
    }

    /// Resolve an in-flight delivery. With a transaction the removal happens
    /// on commit. `Ok(false)` if the delivery is not in flight.
    pub fn acknowledge(
        &self,
        delivery: &Delivery,
        tx: Option<&Transaction>,
    ) -> Result<bool, QueueError> {
        self.ensure_open()?;

        let Some(tx) = tx else {
            let mut inner = self.lock("acknowledge")?;
            if !inner.is_active(delivery) {
                return Ok(false);
            }
            inner.take(delivery);
            drop(inner);
            delivery.mark_done();
            self.record_ack(delivery, None);
            return Ok(true);
        };

        {
            let mut inner = self.lock("acknowledge")?;
            if !inner.is_active(delivery) {
                return Ok(false);
            }
            inner.acking.insert(delivery.id());
        }

        let staged = Arc::new(StagedAck {
            queue: Arc::downgrade(&self.shared),
            delivery: delivery.clone(),
        });
        if let Err(err) = tx.add_operation(staged) {
            self.lock("acknowledge")?.acking.remove(&delivery.id());
            return Err(err.into());
        }
        self.record_ack(delivery, Some(tx));
        Ok(true)
    }

    /// Put an in-flight delivery's reference back at the head, flagged
    /// redelivered, and dispatch again.
    pub fn cancel(&self, delivery: &Delivery) -> Result<bool, QueueError> {
        self.ensure_open()?;
        let mut inner = self.lock("cancel")?;
        if !inner.is_active(delivery) {
            return Ok(false);
        }
        inner.take(delivery);
        let reference = delivery.reference().clone();
        reference.mark_redelivered();

        self.record(DeliveryEvent::Cancelled {
            channel: self.shared.name.to_string(),
            message: reference.message_id().to_string(),
            delivery: delivery.id().get(),
        });
        if !inner.holds(reference.id()) {
            self.insert(&mut inner, reference, true)?;
        }
        Ok(true)
    }

    /// Buffered references in delivery order. Scheduled and in-flight
    /// references are not included.
    pub fn browse(&self, filter: Option<&dyn Filter>) -> Result<Vec<MessageReference>, QueueError> {
        let inner = self.lock("browse")?;
        Ok(inner
            .buffer
            .iter()
            .filter(|r| filter.map_or(true, |f| f.accept(r.message())))
            .cloned()
            .collect())
    }

    pub fn scheduled_count(&self) -> Result<usize, QueueError> {
        Ok(self.lock("scheduled count")?.scheduled.len())
    }

    pub fn delivering_count(&self) -> Result<usize, QueueError> {
        Ok(self.lock("delivering count")?.in_flight.len())
    }

    pub fn message_count(&self) -> Result<usize, QueueError> {
        Ok(self.lock("message count")?.buffer.len())
    }

    /// Cancel the timers this queue armed and drop everything it holds.
    /// The timer itself may be shared and keeps serving other owners.
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<(), QueueError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.distributor.clear()?;
        let held = std::mem::take(&mut *self.lock("close")?);
        for timer in held.scheduled.into_values().filter_map(|entry| entry.timer) {
            self.shared.timer.cancel(timer);
        }
        self.record(DeliveryEvent::Closed {
            channel: self.shared.name.to_string(),
        });
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed(self.shared.name.to_string()));
        }
        Ok(())
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, QueueInner>, QueueError> {
        self.shared
            .inner
            .lock()
            .map_err(|_| QueueError::LockPoisoned(operation))
    }

    fn record(&self, event: DeliveryEvent) {
        self.shared.observer.record(&event);
    }

    fn record_ack(&self, delivery: &Delivery, tx: Option<&Transaction>) {
        self.record(DeliveryEvent::Acknowledged {
            channel: self.shared.name.to_string(),
            message: delivery.reference().message_id().to_string(),
            delivery: delivery.id().get(),
            tx: tx.map(|tx| tx.id().get()),
        });
    }
}

/// Timer callback: move a scheduled reference to the head of the buffer.
fn activate(queue: &Weak<QueueShared>, id: ReferenceId) {
    let Some(shared) = queue.upgrade() else {
        return;
    };
    let queue = Queue { shared };
    if queue.is_closed() {
        return;
    }
    let Ok(mut inner) = queue.lock("activate") else {
        return;
    };
    let Some(Scheduled { reference, .. }) = inner.scheduled.remove(&id) else {
        return;
    };

    queue.record(DeliveryEvent::Activated {
        channel: queue.shared.name.to_string(),
        message: reference.message_id().to_string(),
    });
    if let Err(err) = queue.insert(&mut inner, reference, true) {
        queue.record(DeliveryEvent::Failure {
            channel: queue.shared.name.to_string(),
            operation: "activate".to_string(),
            error: err.to_string(),
        });
    }
}

struct StagedAck {
    queue: Weak<QueueShared>,
    delivery: Delivery,
}

impl TxOperation for StagedAck {
    fn after_commit(&self, _tx: &Transaction) {
        if let Some(shared) = self.queue.upgrade() {
            if let Ok(mut inner) = shared.inner.lock() {
                inner.take(&self.delivery);
            }
        }
        self.delivery.mark_done();
    }

    fn after_rollback(&self, _tx: &Transaction) {
        if let Some(shared) = self.queue.upgrade() {
            if let Ok(mut inner) = shared.inner.lock() {
                inner.acking.remove(&self.delivery.id());
            }
        }
    }
}
