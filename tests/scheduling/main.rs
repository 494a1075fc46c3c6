//! Scheduled delivery through queues and channels, on the manual and
//! thread timers.

#[path = "../support/mod.rs"]
mod support;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use delivery_core::{
    Channel, ChannelConfig, Handled, InMemoryJournal, ManualTimer, NonRecoverableState, Queue,
    QueueConfig, QueueError, ThreadTimer, Timer, TracingObserver, TransactionManager,
};

use support::{
    as_receiver, ids, init_tracing, message, reliable, store, RecordingReceiver, References,
};

// Slack allowed between a due time and the delivery it triggers.
const EPSILON: Duration = Duration::from_millis(250);

fn manual_queue() -> (Queue, Arc<ManualTimer>) {
    init_tracing();
    let timer = Arc::new(ManualTimer::new());
    let queue = Queue::new(
        QueueConfig::new("jobs"),
        timer.clone(),
        Arc::new(TracingObserver),
    )
    .unwrap();
    (queue, timer)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn fired_references_jump_ahead_latest_first() {
    let (queue, timer) = manual_queue();
    let refs = References::new();
    let now = timer.now();
    let secs = |s| now + Duration::from_secs(s);

    queue.add_tail(refs.at("A", secs(7))).unwrap();
    queue.add_tail(refs.plain("B")).unwrap();
    queue.add_tail(refs.plain("C")).unwrap();
    queue.add_tail(refs.plain("D")).unwrap();
    queue.add_tail(refs.at("E", secs(5))).unwrap();
    queue.add_tail(refs.at("F", secs(4))).unwrap();
    queue.add_tail(refs.at("G", secs(3))).unwrap();
    queue.add_tail(refs.at("H", secs(6))).unwrap();

    assert_eq!(ids(&queue.browse(None).unwrap()), vec!["B", "C", "D"]);
    assert_eq!(queue.scheduled_count().unwrap(), 5);

    assert_eq!(timer.advance(Duration::from_secs(10)), 5);
    let expected = vec!["A", "H", "E", "F", "G", "B", "C", "D"];
    assert_eq!(ids(&queue.browse(None).unwrap()), expected);

    let consumer = RecordingReceiver::accepting();
    queue.add_consumer(as_receiver(&consumer)).unwrap();
    assert_eq!(consumer.message_ids(), expected);
    assert_eq!(queue.message_count().unwrap(), 0);
    assert_eq!(queue.delivering_count().unwrap(), 8);
}

#[test]
fn plain_references_keep_enqueue_order() {
    let (queue, _timer) = manual_queue();
    let refs = References::new();
    let consumer = RecordingReceiver::accepting();
    queue.add_consumer(as_receiver(&consumer)).unwrap();

    let expected: Vec<String> = (0..20).map(|i| format!("msg-{i}")).collect();
    for id in &expected {
        queue.add_tail(refs.plain(id)).unwrap();
    }
    assert_eq!(consumer.message_ids(), expected);
}

#[test]
fn add_head_jumps_the_buffer() {
    let (queue, _timer) = manual_queue();
    let refs = References::new();
    queue.add_tail(refs.plain("second")).unwrap();
    queue.add_head(refs.plain("first")).unwrap();

    assert_eq!(ids(&queue.browse(None).unwrap()), vec!["first", "second"]);
}

#[test]
fn due_reference_goes_straight_to_an_attached_consumer() {
    let (queue, timer) = manual_queue();
    let refs = References::new();
    let consumer = RecordingReceiver::accepting();
    queue.add_consumer(as_receiver(&consumer)).unwrap();

    queue
        .add_tail(refs.at("later", timer.now() + Duration::from_secs(5)))
        .unwrap();
    assert!(consumer.deliveries().is_empty());

    timer.advance(Duration::from_secs(4));
    assert!(consumer.deliveries().is_empty());
    timer.advance(Duration::from_secs(1));
    assert_eq!(consumer.message_ids(), vec!["later"]);
}

#[test]
fn busy_consumer_stops_dispatch_until_asked_again() {
    let (queue, _timer) = manual_queue();
    let refs = References::new();
    let consumer = RecordingReceiver::accepting();
    consumer.set_capacity(Some(2));
    queue.add_consumer(as_receiver(&consumer)).unwrap();

    for id in ["a", "b", "c", "d"] {
        queue.add_tail(refs.plain(id)).unwrap();
    }
    assert_eq!(consumer.message_ids(), vec!["a", "b"]);
    assert_eq!(queue.message_count().unwrap(), 2);

    consumer.set_capacity(None);
    assert_eq!(queue.deliver_now().unwrap(), 2);
    assert_eq!(consumer.message_ids(), vec!["a", "b", "c", "d"]);
}

#[test]
fn cancelled_delivery_is_redelivered_first() {
    let (queue, _timer) = manual_queue();
    let refs = References::new();
    let consumer = RecordingReceiver::accepting();
    consumer.set_capacity(Some(1));
    queue.add_consumer(as_receiver(&consumer)).unwrap();
    queue.add_tail(refs.plain("a")).unwrap();
    queue.add_tail(refs.plain("b")).unwrap();

    let first = consumer.deliveries()[0].clone();
    consumer.set_capacity(None);
    assert!(queue.cancel(&first).unwrap());
    assert!(!queue.cancel(&first).unwrap());

    assert_eq!(consumer.message_ids(), vec!["a", "a", "b"]);
    assert!(consumer.deliveries()[1].reference().is_redelivered());
}

#[test]
fn transactional_acknowledgment_resolves_on_commit() {
    let (queue, _timer) = manual_queue();
    let refs = References::new();
    let consumer = RecordingReceiver::accepting();
    queue.add_consumer(as_receiver(&consumer)).unwrap();
    queue.add_tail(refs.plain("a")).unwrap();
    let delivery = consumer.deliveries()[0].clone();

    let tx = TransactionManager::new().begin();
    assert!(queue.acknowledge(&delivery, Some(&tx)).unwrap());
    assert!(!queue.acknowledge(&delivery, None).unwrap());
    assert_eq!(queue.delivering_count().unwrap(), 1);

    tx.commit().unwrap();
    assert_eq!(queue.delivering_count().unwrap(), 0);
    assert!(delivery.is_done());
}

#[test]
fn thread_timer_holds_back_until_the_due_time() {
    init_tracing();
    let queue = Queue::with_thread_timer(
        QueueConfig::new("jobs").with_timer_thread("scheduling-test"),
    )
    .unwrap();
    let refs = References::new();
    let (notify, delivered) = mpsc::channel();
    queue
        .add_consumer(as_receiver(&RecordingReceiver::notifying(notify)))
        .unwrap();

    let due = SystemTime::now() + Duration::from_millis(200);
    queue.add_tail(refs.at("later", due)).unwrap();
    assert!(delivered.try_recv().is_err());

    let (id, arrived) = delivered.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(id, "later");
    assert!(arrived >= due, "delivered {:?} early", due.duration_since(arrived));
    assert!(arrived < due + EPSILON, "delivered {:?} late", arrived.duration_since(due));
    queue.close().unwrap();
}

#[test]
fn thread_timer_fires_in_deadline_order() {
    init_tracing();
    let queue = Queue::with_thread_timer(QueueConfig::new("jobs")).unwrap();
    let refs = References::new();
    let base = SystemTime::now();
    let millis = |ms| base + Duration::from_millis(ms);

    queue.add_tail(refs.at("A", millis(350))).unwrap();
    queue.add_tail(refs.plain("B")).unwrap();
    queue.add_tail(refs.plain("C")).unwrap();
    queue.add_tail(refs.plain("D")).unwrap();
    queue.add_tail(refs.at("E", millis(250))).unwrap();
    queue.add_tail(refs.at("F", millis(200))).unwrap();
    queue.add_tail(refs.at("G", millis(150))).unwrap();
    queue.add_tail(refs.at("H", millis(300))).unwrap();

    assert!(wait_until(|| queue.scheduled_count().unwrap() == 0));

    let consumer = RecordingReceiver::accepting();
    queue.add_consumer(as_receiver(&consumer)).unwrap();
    assert_eq!(
        consumer.message_ids(),
        vec!["A", "H", "E", "F", "G", "B", "C", "D"]
    );
    queue.close().unwrap();
}

#[test]
fn closing_cancels_outstanding_timers() {
    init_tracing();
    let timer = Arc::new(ThreadTimer::with_name_prefix("close-test").unwrap());
    let queue = Queue::new(
        QueueConfig::new("jobs"),
        timer.clone(),
        Arc::new(TracingObserver),
    )
    .unwrap();
    let refs = References::new();
    let consumer = RecordingReceiver::accepting();
    queue.add_consumer(as_receiver(&consumer)).unwrap();

    queue
        .add_tail(refs.at("later", SystemTime::now() + Duration::from_millis(100)))
        .unwrap();
    queue.close().unwrap();
    queue.close().unwrap();
    thread::sleep(Duration::from_millis(300));

    assert!(consumer.deliveries().is_empty());
    assert!(matches!(
        queue.add_tail(refs.plain("after")),
        Err(QueueError::Closed(_))
    ));

    drop(queue);
    let Ok(timer) = Arc::try_unwrap(timer) else {
        panic!("timer still shared");
    };
    let stats = timer.stop();
    assert_eq!(stats.fired, 0);
    assert_eq!(stats.discarded, 1);
}

// Channels

fn manual_channel(timer: &Arc<ManualTimer>) -> Channel {
    init_tracing();
    Channel::new(
        ChannelConfig::new("orders"),
        store(),
        NonRecoverableState::new().into(),
        timer.clone(),
        Arc::new(TracingObserver),
    )
    .unwrap()
}

#[test]
fn channel_holds_a_scheduled_message_until_it_is_due() {
    let timer = Arc::new(ManualTimer::new());
    let channel = manual_channel(&timer);
    let receiver = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&receiver)).unwrap();

    let in_an_hour = timer.now() + Duration::from_secs(3600);
    let handled = channel
        .handle(None, message("later").with_scheduled_delivery(in_an_hour), None)
        .unwrap();
    assert!(matches!(handled, Handled::Scheduled));
    channel.handle(None, message("now"), None).unwrap();
    assert_eq!(receiver.message_ids(), vec!["now"]);

    timer.advance(Duration::from_secs(1800));
    assert_eq!(channel.deliver().unwrap().scheduled, 1);
    assert_eq!(receiver.message_ids(), vec!["now"]);

    timer.advance(Duration::from_secs(1800));
    assert_eq!(receiver.message_ids(), vec!["now", "later"]);
}

#[test]
fn channel_reinserts_fired_messages_latest_first() {
    let timer = Arc::new(ManualTimer::new());
    let channel = manual_channel(&timer);
    let now = timer.now();
    let secs = |s| now + Duration::from_secs(s);

    for (id, at) in [
        ("A", Some(secs(7))),
        ("B", None),
        ("C", None),
        ("D", None),
        ("E", Some(secs(5))),
        ("F", Some(secs(4))),
        ("G", Some(secs(3))),
        ("H", Some(secs(6))),
    ] {
        let body = match at {
            Some(at) => message(id).with_scheduled_delivery(at),
            None => message(id),
        };
        channel.handle(None, body, None).unwrap();
    }
    assert_eq!(channel.scheduled_count().unwrap(), 5);
    assert_eq!(timer.advance(Duration::from_secs(10)), 5);

    let receiver = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&receiver)).unwrap();
    assert_eq!(
        receiver.message_ids(),
        vec!["A", "H", "E", "F", "G", "B", "C", "D"]
    );
}

#[test]
fn channel_holds_committed_scheduled_messages_too() {
    let timer = Arc::new(ManualTimer::new());
    let channel = manual_channel(&timer);
    let receiver = RecordingReceiver::accepting();
    channel.add_receiver(as_receiver(&receiver)).unwrap();

    let tx = TransactionManager::new().begin();
    let due = timer.now() + Duration::from_secs(5);
    channel
        .handle(None, message("later").with_scheduled_delivery(due), Some(&tx))
        .unwrap();
    tx.commit().unwrap();
    assert!(receiver.deliveries().is_empty());

    timer.advance(Duration::from_secs(5));
    assert_eq!(receiver.message_ids(), vec!["later"]);
}

#[test]
fn channel_thread_timer_delivers_within_the_due_window() {
    init_tracing();
    let channel = Channel::non_recoverable(
        ChannelConfig::new("orders").with_timer_thread("channel-scheduling-test"),
        store(),
    )
    .unwrap();
    let (notify, delivered) = mpsc::channel();
    channel
        .add_receiver(as_receiver(&RecordingReceiver::notifying(notify)))
        .unwrap();

    let due = SystemTime::now() + Duration::from_millis(200);
    channel
        .handle(None, message("later").with_scheduled_delivery(due), None)
        .unwrap();
    assert!(delivered.try_recv().is_err());

    let (id, arrived) = delivered.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(id, "later");
    assert!(arrived >= due, "delivered {:?} early", due.duration_since(arrived));
    assert!(arrived < due + EPSILON, "delivered {:?} late", arrived.duration_since(due));
    channel.close().unwrap();
}

#[test]
fn recovered_scheduled_messages_are_armed_again() {
    init_tracing();
    let journal = InMemoryJournal::new();
    let due = SystemTime::now() + Duration::from_secs(3600);
    {
        let channel = Channel::recoverable(
            ChannelConfig::new("payments"),
            store(),
            Arc::new(journal.clone()),
        )
        .unwrap();
        channel
            .handle(None, reliable("later").with_scheduled_delivery(due), None)
            .unwrap();
    }

    let recovered = Channel::recover(
        ChannelConfig::new("payments"),
        store(),
        Arc::new(journal),
    )
    .unwrap();
    assert_eq!(recovered.scheduled_count().unwrap(), 1);

    let receiver = RecordingReceiver::accepting();
    recovered.add_receiver(as_receiver(&receiver)).unwrap();
    assert!(receiver.deliveries().is_empty());
    assert_eq!(recovered.browse(None).unwrap().len(), 1);
    recovered.close().unwrap();
}
