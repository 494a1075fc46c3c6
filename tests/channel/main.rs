//! Channel integration tests.
//!
//! Covers the handle / acknowledge / cancel / redeliver / deliver protocol
//! against both delivery state variants.

#[path = "../support/mod.rs"]
mod support;

use std::sync::{Arc, Mutex};
use std::thread;

use delivery_core::{
    Channel, ChannelConfig, ChannelError, DistributionPolicy, Filter, Handled, InMemoryJournal,
    JournalError, LogObserver, ManualTimer, Message, NonRecoverableState, ObserverId,
    RecoverableState, Redelivery, Routable, StateError,
};

use support::{as_receiver, init_tracing, message, reliable, store, RecordingReceiver};

fn plain_channel() -> Channel {
    init_tracing();
    Channel::non_recoverable(ChannelConfig::new("orders"), store()).unwrap()
}

fn journaled_channel(journal: &InMemoryJournal) -> Channel {
    init_tracing();
    Channel::recoverable(
        ChannelConfig::new("payments"),
        store(),
        Arc::new(journal.clone()),
    )
    .unwrap()
}

fn browse_ids(channel: &Channel) -> Vec<String> {
    channel
        .browse(None)
        .unwrap()
        .iter()
        .map(|m| m.id.clone())
        .collect()
}

// =============================================================================
// Ordering and acknowledgment
// =============================================================================

#[test]
fn pending_messages_reach_a_late_receiver_in_enqueue_order() {
    let channel = plain_channel();
    let ids: Vec<String> = (0..10).map(|i| format!("msg-{i}")).collect();
    for id in &ids {
        let handled = channel.handle(None, message(id), None).unwrap();
        assert!(matches!(handled, Handled::Stored));
    }

    let receiver = RecordingReceiver::accepting();
    assert!(channel.add_receiver(as_receiver(&receiver)).unwrap());
    assert!(!channel.add_receiver(as_receiver(&receiver)).unwrap());

    assert_eq!(receiver.message_ids(), ids);
    assert_eq!(channel.state().delivering_count().unwrap(), 10);
}

#[test]
fn acknowledging_twice_reports_found_then_not_found() {
    let channel = plain_channel();
    let receiver = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&receiver)).unwrap();

    let handled = channel.handle(None, message("msg-1"), None).unwrap();
    assert!(matches!(handled, Handled::Delivered(1)));

    let delivery = receiver.last();
    assert!(channel.acknowledge(&delivery, None).unwrap());
    assert!(!channel.acknowledge(&delivery, None).unwrap());
    assert!(browse_ids(&channel).is_empty());
}

#[test]
fn concurrent_acknowledgments_resolve_each_delivery_once() {
    let channel = plain_channel();
    let receiver = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&receiver)).unwrap();
    for i in 0..50 {
        channel.handle(None, message(&format!("msg-{i}")), None).unwrap();
    }
    let deliveries = receiver.deliveries();

    let found: usize = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let channel = channel.clone();
                let deliveries = deliveries.clone();
                scope.spawn(move || {
                    deliveries
                        .iter()
                        .filter(|d| channel.acknowledge(d, None).unwrap())
                        .count()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(found, 50);
    assert_eq!(channel.state().delivering_count().unwrap(), 0);
}

#[test]
fn completed_deliveries_leave_nothing_pending() {
    let journal = InMemoryJournal::new();
    let channel = journaled_channel(&journal);
    let receiver = RecordingReceiver::completing();
    channel.add_receiver(as_receiver(&receiver)).unwrap();

    let handled = channel.handle(None, reliable("msg-1"), None).unwrap();
    assert!(matches!(handled, Handled::Delivered(1)));
    assert!(browse_ids(&channel).is_empty());
    assert_eq!(journal.live_record_count().unwrap(), 0);
}

// =============================================================================
// Reliability and durability failures
// =============================================================================

#[test]
fn reliable_message_is_refused_by_a_plain_channel() {
    init_tracing();
    let log = Arc::new(Mutex::new(Vec::new()));
    let channel = Channel::new(
        ChannelConfig::new("orders"),
        store(),
        NonRecoverableState::new().into(),
        Arc::new(ManualTimer::new()),
        Arc::new(LogObserver::with_buffer(log.clone())),
    )
    .unwrap();
    let receiver = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&receiver)).unwrap();

    let result = channel.handle(None, reliable("msg-1"), None);

    assert!(matches!(result, Err(ChannelError::ReliableNotAccepted(_))));
    assert!(receiver.deliveries().is_empty());
    assert!(browse_ids(&channel).is_empty());
    assert!(log
        .lock()
        .unwrap()
        .iter()
        .any(|line| line.contains("delivery.rejected")));
}

#[test]
fn plain_channel_can_be_told_to_take_reliable_messages() {
    let channel = Channel::non_recoverable(
        ChannelConfig::new("orders").with_accept_reliable(true),
        store(),
    )
    .unwrap();

    assert!(channel.accepts_reliable());
    assert!(!channel.is_recoverable());
    assert!(channel.handle(None, reliable("msg-1"), None).is_ok());
}

#[test]
fn journal_failure_hands_responsibility_back_to_the_sender() {
    let journal = InMemoryJournal::new();
    let channel = journaled_channel(&journal);
    let receiver = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&receiver)).unwrap();
    let producer = ObserverId::new("producer-1");

    journal.fail_next(1).unwrap();
    let handled = channel
        .handle(Some(&producer), reliable("msg-1"), None)
        .unwrap();

    assert!(!handled.is_accepted());
    let composite = match handled {
        Handled::Returned(composite) => composite,
        other => panic!("expected the delivery to be handed back, got {other:?}"),
    };
    assert_eq!(composite.observer(), Some(&producer));
    assert_eq!(composite.len(), 1);
    assert!(browse_ids(&channel).is_empty());
    assert_eq!(journal.live_record_count().unwrap(), 0);

    let handled = channel.handle(Some(&producer), reliable("msg-2"), None).unwrap();
    assert!(matches!(handled, Handled::Delivered(1)));
    assert_eq!(journal.live_record_count().unwrap(), 1);
}

#[test]
fn journal_failure_while_storing_is_an_error() {
    let journal = InMemoryJournal::new();
    let channel = journaled_channel(&journal);

    journal.set_failing(true).unwrap();
    let result = channel.handle(None, reliable("msg-1"), None);
    journal.set_failing(false).unwrap();

    assert!(matches!(
        result,
        Err(ChannelError::State(StateError::Journal(JournalError::Unavailable(_))))
    ));
    assert!(browse_ids(&channel).is_empty());
}

#[test]
fn failed_acknowledgment_is_swallowed_and_retried_later() {
    let journal = InMemoryJournal::new();
    let channel = journaled_channel(&journal);
    let receiver = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&receiver)).unwrap();
    channel.handle(None, reliable("msg-1"), None).unwrap();
    let delivery = receiver.last();

    journal.fail_next(1).unwrap();
    assert!(!channel.acknowledge(&delivery, None).unwrap());
    assert_eq!(browse_ids(&channel), vec!["msg-1"]);

    assert!(channel.acknowledge(&delivery, None).unwrap());
    assert_eq!(journal.live_record_count().unwrap(), 0);
}

// =============================================================================
// Cancel and redeliver
// =============================================================================

#[test]
fn cancel_then_rehandle_leaves_one_pending_entry_flagged_redelivered() {
    let channel = plain_channel();
    let receiver = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&receiver)).unwrap();
    channel.handle(None, message("msg-1"), None).unwrap();
    assert!(channel.remove_receiver(&as_receiver(&receiver)).unwrap());

    let delivery = receiver.last();
    assert!(channel.cancel(&delivery).unwrap());
    assert!(!channel.cancel(&delivery).unwrap());

    let handled = channel
        .handle(None, Routable::Reference(delivery.reference().clone()), None)
        .unwrap();
    assert!(matches!(handled, Handled::Stored));

    let pending = channel.state().browse(None).unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].is_redelivered());
    assert!(!channel.acknowledge(&delivery, None).unwrap());
}

#[test]
fn cancelled_reference_goes_back_to_the_head() {
    let channel = plain_channel();
    let receiver = RecordingReceiver::accepting();
    receiver.set_capacity(Some(1));
    channel.add_receiver(as_receiver(&receiver)).unwrap();
    channel.handle(None, message("first"), None).unwrap();
    channel.handle(None, message("second"), None).unwrap();

    channel.cancel(&receiver.last()).unwrap();

    let undelivered: Vec<String> = channel
        .state()
        .undelivered(None)
        .unwrap()
        .iter()
        .map(|r| r.message_id().to_string())
        .collect();
    assert_eq!(undelivered, vec!["first", "second"]);
}

#[test]
fn redeliver_moves_the_delivery_to_another_receiver() {
    let channel = plain_channel();
    let first = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&first)).unwrap();
    channel.handle(None, message("msg-1"), None).unwrap();
    let old = first.last();

    let second = RecordingReceiver::accepting();
    assert!(matches!(
        channel.redeliver(&old, second.as_ref()).unwrap(),
        Redelivery::Delivered
    ));

    let new = second.last();
    assert!(new.reference().is_redelivered());
    assert_eq!(new.reference().delivery_count(), 2);
    assert!(!channel.acknowledge(&old, None).unwrap());
    assert!(channel.acknowledge(&new, None).unwrap());
    assert!(browse_ids(&channel).is_empty());
}

#[test]
fn redeliver_after_acknowledge_is_refused() {
    let channel = plain_channel();
    let receiver = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&receiver)).unwrap();
    channel.handle(None, message("msg-1"), None).unwrap();
    let delivery = receiver.last();

    channel.acknowledge(&delivery, None).unwrap();
    let other = RecordingReceiver::accepting();
    assert!(matches!(
        channel.redeliver(&delivery, other.as_ref()).unwrap(),
        Redelivery::NotActive
    ));
    assert!(other.deliveries().is_empty());
}

#[test]
fn redelivery_declined_by_the_receiver_requeues_at_head() {
    let channel = plain_channel();
    let receiver = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&receiver)).unwrap();
    channel.handle(None, message("a"), None).unwrap();
    assert!(channel.remove_receiver(&as_receiver(&receiver)).unwrap());
    channel.handle(None, message("b"), None).unwrap();

    let declining = RecordingReceiver::declining();
    assert!(matches!(
        channel.redeliver(&receiver.last(), declining.as_ref()).unwrap(),
        Redelivery::Requeued
    ));

    let undelivered: Vec<String> = channel
        .state()
        .undelivered(None)
        .unwrap()
        .iter()
        .map(|r| r.message_id().to_string())
        .collect();
    assert_eq!(undelivered, vec!["a", "b"]);
}

#[test]
fn redelivery_completed_synchronously_forgets_the_journal_record() {
    let journal = InMemoryJournal::new();
    let channel = journaled_channel(&journal);
    let receiver = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&receiver)).unwrap();
    channel.handle(None, reliable("msg-1"), None).unwrap();
    assert_eq!(journal.live_record_count().unwrap(), 1);

    let completing = RecordingReceiver::completing();
    assert!(matches!(
        channel.redeliver(&receiver.last(), completing.as_ref()).unwrap(),
        Redelivery::Delivered
    ));

    assert!(browse_ids(&channel).is_empty());
    assert_eq!(journal.live_record_count().unwrap(), 0);
}

// =============================================================================
// Sweeps, policies and lifecycle
// =============================================================================

#[test]
fn deliver_reports_what_the_sweep_did() {
    let channel = plain_channel();
    for id in ["a", "b", "c"] {
        channel.handle(None, message(id), None).unwrap();
    }
    let declining = RecordingReceiver::declining();
    channel.add_receiver(as_receiver(&declining)).unwrap();

    let result = channel.deliver().unwrap();
    assert_eq!(result.examined, 3);
    assert_eq!(result.stored, 3);
    assert_eq!(result.delivered, 0);
    assert!(!result.aborted);

    let accepting = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&accepting)).unwrap();
    assert_eq!(accepting.message_ids(), vec!["a", "b", "c"]);
    assert_eq!(channel.receiver_count().unwrap(), 2);
}

#[test]
fn point_to_point_picks_one_receiver_and_fan_out_picks_all() {
    let p2p = plain_channel();
    let fan_out = Channel::non_recoverable(
        ChannelConfig::new("audit").with_policy(DistributionPolicy::FanOut),
        store(),
    )
    .unwrap();

    let receivers: Vec<_> = (0..3).map(|_| RecordingReceiver::accepting()).collect();
    for receiver in &receivers {
        p2p.add_receiver(as_receiver(receiver)).unwrap();
        fan_out.add_receiver(as_receiver(receiver)).unwrap();
    }

    assert!(matches!(
        p2p.handle(None, message("queued"), None).unwrap(),
        Handled::Delivered(1)
    ));
    assert!(matches!(
        fan_out.handle(None, message("broadcast"), None).unwrap(),
        Handled::Delivered(3)
    ));

    assert_eq!(receivers[0].message_ids(), vec!["queued", "broadcast"]);
    assert_eq!(receivers[1].message_ids(), vec!["broadcast"]);

    // One pending entry per reference, however many receivers hold it.
    assert_eq!(browse_ids(&fan_out), vec!["broadcast"]);
    for receiver in &receivers[..2] {
        assert!(fan_out.acknowledge(&receiver.last(), None).unwrap());
    }
    assert_eq!(browse_ids(&fan_out), vec!["broadcast"]);
    assert!(fan_out.acknowledge(&receivers[2].last(), None).unwrap());
    assert!(browse_ids(&fan_out).is_empty());
}

#[test]
fn busy_receiver_stops_point_to_point_selection() {
    let channel = plain_channel();
    let busy = RecordingReceiver::accepting();
    busy.set_capacity(Some(0));
    let idle = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&busy)).unwrap();
    channel.add_receiver(as_receiver(&idle)).unwrap();

    let handled = channel.handle(None, message("msg-1"), None).unwrap();
    assert!(matches!(handled, Handled::Stored));
    assert!(idle.deliveries().is_empty());
}

#[test]
fn browse_applies_a_message_filter() {
    let channel = plain_channel();
    channel
        .handle(None, message("keep").with_header("kind", "order"), None)
        .unwrap();
    channel.handle(None, message("skip"), None).unwrap();

    let orders = |m: &Message| m.header("kind") == Some("order");
    let found = channel.browse(Some(&orders as &dyn Filter)).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "keep");
}

#[test]
fn closing_releases_everything_and_is_idempotent() {
    let channel = plain_channel();
    let receiver = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&receiver)).unwrap();
    channel.handle(None, message("msg-1"), None).unwrap();

    channel.close().unwrap();
    channel.close().unwrap();

    assert!(channel.is_closed());
    assert_eq!(channel.receiver_count().unwrap(), 0);
    assert!(matches!(
        channel.acknowledge(&receiver.last(), None),
        Err(ChannelError::Closed(_))
    ));
    assert!(matches!(
        channel.cancel(&receiver.last()),
        Err(ChannelError::Closed(_))
    ));
}

#[test]
fn recoverable_state_always_takes_reliable_messages() {
    let journal = InMemoryJournal::new();
    let channel = Channel::new(
        ChannelConfig::new("payments"),
        store(),
        RecoverableState::new(Arc::new(journal.clone())).into(),
        Arc::new(ManualTimer::new()),
        Arc::new(LogObserver::with_buffer(Arc::default())),
    )
    .unwrap();

    assert!(channel.is_recoverable());
    assert!(channel.accepts_reliable());
    channel.handle(None, reliable("msg-1"), None).unwrap();
    channel.handle(None, message("msg-2"), None).unwrap();

    // Only the reliable message is journaled.
    assert_eq!(journal.live_record_count().unwrap(), 1);
    assert_eq!(browse_ids(&channel), vec!["msg-1", "msg-2"]);
}

#[cfg(feature = "emitter")]
#[test]
fn emitter_observer_publishes_acknowledgments() {
    use delivery_core::{EmitterObserver, EventEmitter};
    use std::sync::mpsc;
    use std::time::Duration;

    let mut emitter = EventEmitter::new();
    let (tx, rx) = mpsc::channel::<String>();
    emitter.on("delivery.acknowledged", move |payload: String| {
        tx.send(payload).unwrap();
    });

    let channel = Channel::new(
        ChannelConfig::new("orders"),
        store(),
        NonRecoverableState::new().into(),
        Arc::new(ManualTimer::new()),
        Arc::new(EmitterObserver::new(emitter)),
    )
    .unwrap();
    let receiver = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&receiver)).unwrap();
    channel.handle(None, message("msg-1"), None).unwrap();
    channel.acknowledge(&receiver.last(), None).unwrap();

    let payload = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(payload.contains("msg-1"));
}
