use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::SystemTime;

use super::ChannelError;
use crate::config::ChannelConfig;
use crate::delivery::{CompositeDelivery, Delivery, ObserverId};
use crate::distributor::{Distributor, Receiver, Reply};
use crate::journal::Journal;
use crate::message::{Message, MessageReference, MessageStore, ReferenceId, Routable};
use crate::observer::{DeliveryEvent, Observer, TracingObserver};
use crate::state::{DeliveryState, Filter, NonRecoverableState, RecoverableState};
use crate::timer::{ThreadTimer, Timer, TimerId};
use crate::transaction::{Transaction, TxId};

/// Outcome of [`Channel::handle`].
#[derive(Debug)]
pub enum Handled {
    /// This many receivers accepted the message synchronously.
    Delivered(usize),
    /// No receiver accepted; the channel keeps the message pending.
    Stored,
    /// The message is due later. The channel keeps it pending and offers it
    /// when its timer fires.
    Scheduled,
    /// Staged in the transaction; pending once it commits.
    Staged,
    /// Receivers accepted the message but the channel could not record their
    /// deliveries. The sender is responsible for the message again.
    Returned(CompositeDelivery),
}

impl Handled {
    /// Whether the channel took responsibility for the message.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Handled::Returned(_))
    }
}

/// Outcome of [`Channel::redeliver`].
#[derive(Debug)]
pub enum Redelivery {
    /// The old delivery was no longer active. Nothing changed.
    NotActive,
    /// The receiver took the reference and its delivery is recorded.
    Delivered,
    /// The receiver did not take the reference; it is pending again at the
    /// head of delivery order.
    Requeued,
    /// The receiver took the reference but the channel could not record the
    /// delivery. The caller is responsible for the message again.
    Returned(CompositeDelivery),
}

/// Counters from one [`Channel::deliver`] sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepResult {
    pub examined: usize,
    pub delivered: usize,
    pub stored: usize,
    /// Held back because their scheduled time has not come.
    pub scheduled: usize,
    /// The sweep stopped early because the delivery state failed.
    pub aborted: bool,
}

enum Offered {
    Delivered,
    Stored,
    Skipped,
}

struct ChannelInner {
    id: ObserverId,
    store: Arc<dyn MessageStore>,
    distributor: Distributor,
    state: DeliveryState,
    timer: Arc<dyn Timer>,
    observer: Arc<dyn Observer>,
    closed: AtomicBool,
    // Pending references waiting for their timer, with the arming once known.
    scheduled: Mutex<HashMap<ReferenceId, Option<TimerId>>>,
    // Transactions that already have a post-commit sweep registered.
    sweeps: Mutex<HashSet<TxId>>,
}

/// Orchestrates delivery of messages to receivers on top of a
/// [`DeliveryState`].
///
/// A channel is open until [`close`](Channel::close); afterwards every
/// operation but `close` fails with [`ChannelError::Closed`]. Clones share
/// the same channel, and every operation may be called from any thread.
///
/// Messages whose scheduled delivery time lies in the future are kept
/// pending but not offered to receivers until the channel's [`Timer`]
/// fires. A fired message moves to the head of delivery order and is
/// offered right away.
///
/// ## Example
///
/// ```
/// use std::sync::Arc;
/// use delivery_core::{Channel, ChannelConfig, Handled, InMemoryMessageStore, Message};
///
/// let channel = Channel::non_recoverable(
///     ChannelConfig::new("orders"),
///     Arc::new(InMemoryMessageStore::new()),
/// )
/// .unwrap();
///
/// let handled = channel
///     .handle(None, Message::with_string_payload("msg-1", "{}"), None)
///     .unwrap();
/// assert!(matches!(handled, Handled::Stored));
/// assert_eq!(channel.browse(None).unwrap().len(), 1);
/// ```
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Build a channel over `state`. Pending references `state` already
    /// holds that are not yet due are armed on `timer`.
    pub fn new(
        config: ChannelConfig,
        store: Arc<dyn MessageStore>,
        state: DeliveryState,
        timer: Arc<dyn Timer>,
        observer: Arc<dyn Observer>,
    ) -> Result<Self, ChannelError> {
        config.validate()?;
        let channel = Channel {
            inner: Arc::new(ChannelInner {
                id: ObserverId::new(config.id),
                store,
                distributor: Distributor::new(config.policy),
                state,
                timer,
                observer,
                closed: AtomicBool::new(false),
                scheduled: Mutex::new(HashMap::new()),
                sweeps: Mutex::new(HashSet::new()),
            }),
        };

        for reference in channel.inner.state.undelivered(None)? {
            if let Some(at) = channel.not_due(&reference) {
                channel.scheduled("schedule")?.insert(reference.id(), None);
                let timer = channel.arm(&reference, at)?;
                channel.remember_timer(reference.id(), timer)?;
                channel.record_scheduled(&reference, at);
            }
        }
        Ok(channel)
    }

    /// An in-memory channel with its own timer thread, reporting to
    /// `tracing`.
    pub fn non_recoverable(
        config: ChannelConfig,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self, ChannelError> {
        let state = NonRecoverableState::with_reliable(config.accept_reliable);
        let timer = thread_timer(&config)?;
        Self::new(config, store, state.into(), timer, Arc::new(TracingObserver))
    }

    /// A channel whose reliable messages are mirrored to `journal`.
    pub fn recoverable(
        config: ChannelConfig,
        store: Arc<dyn MessageStore>,
        journal: Arc<dyn Journal>,
    ) -> Result<Self, ChannelError> {
        let state = RecoverableState::new(journal);
        let timer = thread_timer(&config)?;
        Self::new(config, store, state.into(), timer, Arc::new(TracingObserver))
    }

    /// A recoverable channel rebuilt from what `journal` recorded.
    /// Recovered messages that are not yet due are scheduled again.
    pub fn recover(
        config: ChannelConfig,
        store: Arc<dyn MessageStore>,
        journal: Arc<dyn Journal>,
    ) -> Result<Self, ChannelError> {
        let state = RecoverableState::recover(journal, store.as_ref())?;
        let timer = thread_timer(&config)?;
        Self::new(config, store, state.into(), timer, Arc::new(TracingObserver))
    }

    pub fn id(&self) -> &ObserverId {
        &self.inner.id
    }

    pub fn is_recoverable(&self) -> bool {
        self.inner.state.is_recoverable()
    }

    pub fn accepts_reliable(&self) -> bool {
        self.inner.state.accepts_reliable()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> &DeliveryState {
        &self.inner.state
    }

    /// Register a receiver. A newly registered receiver triggers a
    /// [`deliver`](Self::deliver) sweep so pending messages reach it.
    pub fn add_receiver(&self, receiver: Arc<dyn Receiver>) -> Result<bool, ChannelError> {
        self.ensure_open()?;
        let added = self.inner.distributor.add(receiver)?;
        if added {
            self.deliver()?;
        }
        Ok(added)
    }

    pub fn remove_receiver(&self, receiver: &Arc<dyn Receiver>) -> Result<bool, ChannelError> {
        Ok(self.inner.distributor.remove(receiver)?)
    }

    pub fn contains_receiver(&self, receiver: &Arc<dyn Receiver>) -> Result<bool, ChannelError> {
        Ok(self.inner.distributor.contains(receiver)?)
    }

    pub fn receiver_count(&self) -> Result<usize, ChannelError> {
        Ok(self.inner.distributor.len()?)
    }

    /// Number of pending messages waiting for their scheduled time.
    pub fn scheduled_count(&self) -> Result<usize, ChannelError> {
        Ok(self.scheduled("scheduled count")?.len())
    }

    /// Take responsibility for a message.
    ///
    /// With a transaction the message is staged and the call returns
    /// immediately; the message is offered to receivers once the transaction
    /// commits. Without one it is offered to the receivers right away, unless
    /// it is scheduled for later.
    pub fn handle(
        &self,
        sender: Option<&ObserverId>,
        routable: impl Into<Routable>,
        tx: Option<&Transaction>,
    ) -> Result<Handled, ChannelError> {
        self.ensure_open()?;
        let routable = routable.into();

        if routable.is_reliable() && !self.accepts_reliable() {
            self.record(DeliveryEvent::Rejected {
                channel: self.name(),
                message: routable.message_id().to_string(),
                reason: "reliable message on a channel that refuses them".into(),
            });
            return Err(ChannelError::ReliableNotAccepted(self.name()));
        }

        let reference = match routable {
            Routable::Reference(reference) => reference,
            Routable::Message(message) => {
                let message_id = message.id.clone();
                self.inner.store.reference(message).map_err(|err| {
                    self.record(DeliveryEvent::Rejected {
                        channel: self.name(),
                        message: message_id,
                        reason: err.to_string(),
                    });
                    ChannelError::Rejected(err)
                })?
            }
        };

        match tx {
            Some(tx) => {
                match self.not_due(&reference) {
                    Some(at) => self.hold_back(&reference, at, Some(tx))?,
                    None => self
                        .inner
                        .state
                        .add_reference(&reference, Some(tx))
                        .map_err(|err| self.failure("handle", err.into()))?,
                }
                self.sweep_after_commit(tx)?;
                self.record(DeliveryEvent::Staged {
                    channel: self.name(),
                    message: reference.message_id().to_string(),
                    tx: tx.id().get(),
                });
                Ok(Handled::Staged)
            }
            None => match self.not_due(&reference) {
                Some(at) => {
                    self.hold_back(&reference, at, None)?;
                    Ok(Handled::Scheduled)
                }
                None => self.handle_now(sender, &reference),
            },
        }
    }

    fn handle_now(
        &self,
        sender: Option<&ObserverId>,
        reference: &MessageReference,
    ) -> Result<Handled, ChannelError> {
        let deliveries = self
            .inner
            .distributor
            .handle(&self.inner.id, reference, None)
            .map_err(|err| self.failure("handle", err.into()))?;

        if deliveries.is_empty() {
            self.inner
                .state
                .add_reference(reference, None)
                .map_err(|err| self.failure("store", err.into()))?;
            self.record(DeliveryEvent::Stored {
                channel: self.name(),
                message: reference.message_id().to_string(),
            });
            return Ok(Handled::Stored);
        }

        match self.inner.state.add_deliveries(&deliveries) {
            Ok(()) => {
                self.record(DeliveryEvent::Delivered {
                    channel: self.name(),
                    message: reference.message_id().to_string(),
                    receivers: deliveries.len(),
                });
                Ok(Handled::Delivered(deliveries.len()))
            }
            Err(err) => {
                self.record(DeliveryEvent::Returned {
                    channel: self.name(),
                    message: reference.message_id().to_string(),
                    deliveries: deliveries.len(),
                    reason: err.to_string(),
                });
                Ok(Handled::Returned(CompositeDelivery::new(
                    sender.cloned(),
                    deliveries,
                )))
            }
        }
    }

    /// Keep `reference` pending but out of reach of sweeps until `at`.
    ///
    /// The hold is in place before the reference becomes visible, so no
    /// sweep can see it unheld.
    fn hold_back(
        &self,
        reference: &MessageReference,
        at: SystemTime,
        tx: Option<&Transaction>,
    ) -> Result<(), ChannelError> {
        let id = reference.id();
        self.scheduled("schedule")?.insert(id, None);

        let timer = match self.arm(reference, at) {
            Ok(timer) => timer,
            Err(err) => {
                self.scheduled("schedule")?.remove(&id);
                return Err(self.failure("schedule", err));
            }
        };
        if let Err(err) = self.inner.state.add_reference(reference, tx) {
            self.inner.timer.cancel(timer);
            self.scheduled("schedule")?.remove(&id);
            return Err(self.failure("schedule", err.into()));
        }
        self.record_scheduled(reference, at);

        if !self.remember_timer(id, timer)? && tx.is_none() {
            // Fired before the reference was recorded, so nobody offered it.
            self.offer(reference)?;
        }
        Ok(())
    }

    fn arm(&self, reference: &MessageReference, at: SystemTime) -> Result<TimerId, ChannelError> {
        let channel = Arc::downgrade(&self.inner);
        let target = reference.clone();
        Ok(self
            .inner
            .timer
            .arm_once(at, Box::new(move || activate(&channel, &target)))?)
    }

    // False if the hold was already released.
    fn remember_timer(&self, id: ReferenceId, timer: TimerId) -> Result<bool, ChannelError> {
        match self.scheduled("schedule")?.get_mut(&id) {
            Some(slot) => {
                *slot = Some(timer);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn activate(&self, reference: &MessageReference) -> Result<(), ChannelError> {
        self.scheduled("activate")?.remove(&reference.id());
        if !self.inner.state.move_to_front(reference)? {
            return Ok(());
        }
        self.record(DeliveryEvent::Activated {
            channel: self.name(),
            message: reference.message_id().to_string(),
        });
        self.offer(reference)?;
        Ok(())
    }

    /// Resolve a delivery as consumed.
    ///
    /// Without a transaction the removal is best effort: a failure is
    /// reported to the observer and `Ok(false)` is returned, since the caller
    /// already treats the message as consumed. With a transaction the removal
    /// is staged and failures are returned. `Ok(false)` also means the
    /// delivery was not active.
    pub fn acknowledge(
        &self,
        delivery: &Delivery,
        tx: Option<&Transaction>,
    ) -> Result<bool, ChannelError> {
        self.ensure_open()?;

        let found = match tx {
            None => {
                delivery.mark_done();
                match self.inner.state.remove_delivery(delivery, None) {
                    Ok(found) => found,
                    Err(err) => {
                        self.failure("acknowledge", err.into());
                        false
                    }
                }
            }
            Some(tx) => self
                .inner
                .state
                .remove_delivery(delivery, Some(tx))
                .map_err(|err| self.failure("acknowledge", err.into()))?,
        };

        if found {
            self.record(DeliveryEvent::Acknowledged {
                channel: self.name(),
                message: delivery.reference().message_id().to_string(),
                delivery: delivery.id().get(),
                tx: tx.map(|tx| tx.id().get()),
            });
        }
        Ok(found)
    }

    /// Give a delivery back: its reference becomes pending again at the head
    /// of delivery order, flagged redelivered. `Ok(false)` if the delivery
    /// was not active.
    pub fn cancel(&self, delivery: &Delivery) -> Result<bool, ChannelError> {
        self.ensure_open()?;
        let found = self
            .inner
            .state
            .cancel(delivery)
            .map_err(|err| self.failure("cancel", err.into()))?;
        if found {
            self.record(DeliveryEvent::Cancelled {
                channel: self.name(),
                message: delivery.reference().message_id().to_string(),
                delivery: delivery.id().get(),
            });
        }
        Ok(found)
    }

    /// Move an active delivery to `receiver`.
    ///
    /// The old delivery is detached under the delivery state's lock, so an
    /// acknowledgment racing with the redelivery either resolves the old
    /// delivery first (and this returns [`Redelivery::NotActive`]) or finds
    /// it gone. An acknowledgment of the new delivery arriving before it is
    /// recorded is caught by its completion flag. If the receiver does not
    /// take the reference it goes back to the head of delivery order. If it
    /// takes it but the delivery cannot be recorded, the new delivery is
    /// handed back instead of requeueing a reference the receiver holds.
    pub fn redeliver(
        &self,
        old: &Delivery,
        receiver: &dyn Receiver,
    ) -> Result<Redelivery, ChannelError> {
        self.ensure_open()?;
        let state = &self.inner.state;

        if !state
            .detach(old)
            .map_err(|err| self.failure("redeliver", err.into()))?
        {
            return Ok(Redelivery::NotActive);
        }

        let reference = old.reference();
        reference.mark_redelivered();

        let outcome = match receiver.handle(&self.inner.id, reference, None) {
            Reply::Accepted(delivery) => {
                reference.increment_delivery_count();
                match state.add_delivery(&delivery) {
                    Ok(()) => Redelivery::Delivered,
                    Err(err) => {
                        self.record(DeliveryEvent::Returned {
                            channel: self.name(),
                            message: reference.message_id().to_string(),
                            deliveries: 1,
                            reason: err.to_string(),
                        });
                        return Ok(Redelivery::Returned(CompositeDelivery::new(
                            old.observer().cloned(),
                            vec![delivery],
                        )));
                    }
                }
            }
            Reply::Declined | Reply::Busy => {
                state
                    .requeue_front(reference)
                    .map_err(|err| self.failure("redeliver", err.into()))?;
                Redelivery::Requeued
            }
        };

        self.record(DeliveryEvent::Redelivered {
            channel: self.name(),
            message: reference.message_id().to_string(),
            accepted: matches!(outcome, Redelivery::Delivered),
        });
        Ok(outcome)
    }

    /// Offer every undelivered reference to the receivers again, in the
    /// order the delivery state reports them. References waiting for their
    /// scheduled time are skipped.
    ///
    /// A delivery state failure aborts the rest of the sweep; it is reported
    /// in the result, not retried.
    pub fn deliver(&self) -> Result<SweepResult, ChannelError> {
        self.ensure_open()?;
        let mut result = SweepResult::default();

        for reference in self.inner.state.undelivered(None)? {
            result.examined += 1;

            let offered = self.is_held(&reference).and_then(|held| {
                if held {
                    Ok(None)
                } else {
                    self.offer(&reference).map(Some)
                }
            });
            match offered {
                Ok(None) => result.scheduled += 1,
                Ok(Some(Offered::Delivered)) => result.delivered += 1,
                Ok(Some(Offered::Stored)) => result.stored += 1,
                Ok(Some(Offered::Skipped)) => {}
                Err(err) => {
                    self.failure("deliver", err);
                    result.aborted = true;
                    break;
                }
            }
        }

        self.record(DeliveryEvent::Swept {
            channel: self.name(),
            examined: result.examined,
            delivered: result.delivered,
            stored: result.stored,
            scheduled: result.scheduled,
            aborted: result.aborted,
        });
        Ok(result)
    }

    fn offer(&self, reference: &MessageReference) -> Result<Offered, ChannelError> {
        let state = &self.inner.state;
        if !state.start_sweep(reference)? {
            return Ok(Offered::Skipped);
        }

        let deliveries = match self.inner.distributor.handle(&self.inner.id, reference, None) {
            Ok(deliveries) => deliveries,
            Err(err) => {
                state.end_sweep(reference)?;
                return Err(err.into());
            }
        };
        if deliveries.is_empty() {
            state.end_sweep(reference)?;
            return Ok(Offered::Stored);
        }

        if let Err(err) = state.add_deliveries(&deliveries) {
            state.end_sweep(reference)?;
            return Err(err.into());
        }
        self.record(DeliveryEvent::Delivered {
            channel: self.name(),
            message: reference.message_id().to_string(),
            receivers: deliveries.len(),
        });
        Ok(Offered::Delivered)
    }

    /// Bodies of every pending message, delivered ones first. Messages
    /// waiting for their scheduled time are included.
    pub fn browse(&self, filter: Option<&dyn Filter>) -> Result<Vec<Arc<Message>>, ChannelError> {
        self.ensure_open()?;
        Ok(self
            .inner
            .state
            .browse(filter)?
            .iter()
            .map(MessageReference::message_arc)
            .collect())
    }

    /// Close the channel, dropping its receivers and in-memory state and
    /// cancelling the timers it armed. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), ChannelError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.distributor.clear()?;
        let held = std::mem::take(&mut *self.scheduled("close")?);
        for timer in held.into_values().flatten() {
            self.inner.timer.cancel(timer);
        }
        self.inner.state.clear()?;
        self.inner
            .sweeps
            .lock()
            .map_err(|_| ChannelError::LockPoisoned("close"))?
            .clear();
        self.record(DeliveryEvent::Closed {
            channel: self.name(),
        });
        Ok(())
    }

    fn sweep_after_commit(&self, tx: &Transaction) -> Result<(), ChannelError> {
        let id = tx.id();
        {
            let mut sweeps = self
                .inner
                .sweeps
                .lock()
                .map_err(|_| ChannelError::LockPoisoned("register sweep"))?;
            if !sweeps.insert(id) {
                return Ok(());
            }
        }

        let on_commit = Arc::downgrade(&self.inner);
        let on_rollback = Arc::downgrade(&self.inner);
        let registered = tx
            .after_commit(move || {
                if let Some(inner) = on_commit.upgrade() {
                    let channel = Channel { inner };
                    channel.forget_sweep(id);
                    if !channel.is_closed() {
                        // Failures were already reported to the observer.
                        channel.deliver().ok();
                    }
                }
            })
            .and_then(|()| {
                tx.after_rollback(move || {
                    if let Some(inner) = on_rollback.upgrade() {
                        Channel { inner }.forget_sweep(id);
                    }
                })
            });

        if let Err(err) = registered {
            self.forget_sweep(id);
            return Err(ChannelError::State(err.into()));
        }
        Ok(())
    }

    fn forget_sweep(&self, id: TxId) {
        if let Ok(mut sweeps) = self.inner.sweeps.lock() {
            sweeps.remove(&id);
        }
    }

    // The scheduled time of a reference that is not due yet.
    fn not_due(&self, reference: &MessageReference) -> Option<SystemTime> {
        reference
            .scheduled_delivery()
            .filter(|_| !reference.is_due(self.inner.timer.now()))
    }

    fn is_held(&self, reference: &MessageReference) -> Result<bool, ChannelError> {
        Ok(self.scheduled("sweep")?.contains_key(&reference.id()))
    }

    fn scheduled(
        &self,
        operation: &'static str,
    ) -> Result<MutexGuard<'_, HashMap<ReferenceId, Option<TimerId>>>, ChannelError> {
        self.inner
            .scheduled
            .lock()
            .map_err(|_| ChannelError::LockPoisoned(operation))
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed(self.name()));
        }
        Ok(())
    }

    fn name(&self) -> String {
        self.inner.id.to_string()
    }

    fn record(&self, event: DeliveryEvent) {
        self.inner.observer.record(&event);
    }

    fn record_scheduled(&self, reference: &MessageReference, at: SystemTime) {
        self.record(DeliveryEvent::Scheduled {
            channel: self.name(),
            message: reference.message_id().to_string(),
            at,
        });
    }

    fn failure(&self, operation: &str, err: ChannelError) -> ChannelError {
        self.record(DeliveryEvent::Failure {
            channel: self.name(),
            operation: operation.to_string(),
            error: err.to_string(),
        });
        err
    }
}

fn thread_timer(config: &ChannelConfig) -> Result<Arc<dyn Timer>, ChannelError> {
    config.validate()?;
    Ok(Arc::new(ThreadTimer::with_name_prefix(&config.timer_thread)?))
}

/// Timer callback: move a scheduled reference to the head of delivery
/// order and offer it.
fn activate(channel: &Weak<ChannelInner>, reference: &MessageReference) {
    let Some(inner) = channel.upgrade() else {
        return;
    };
    let channel = Channel { inner };
    if channel.is_closed() {
        return;
    }
    if let Err(err) = channel.activate(reference) {
        channel.failure("activate", err);
    }
}
