use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::bridge::BridgeSubscription;
use crate::model::Message;
use crate::utils::WaitGroup;

/// Callback invoked for every message delivered to a subscriber. The channel
/// delivers indiscriminately; direction and destination filtering belong to
/// the handler wrapper sitting on top.
pub type MessageHandlerFn = Arc<dyn Fn(&Message) + Send + Sync>;

/// A subscriber as the channel sees it: a queue into a dedicated delivery
/// worker, plus run-once bookkeeping.
struct Subscriber {
    id: Uuid,
    tx: Sender<Message>,
    run_once: bool,
    consumed: Arc<AtomicBool>,
}

/// A broker subscription recorded on a galactic channel, keyed by the
/// (connection, destination) pair.
#[derive(Clone)]
pub struct GalacticRecord {
    pub connection_id: Uuid,
    pub destination: String,
    pub subscription: Arc<BridgeSubscription>,
}

/// Named fan-out conduit.
///
/// Every subscriber gets its own delivery worker: messages for one
/// subscriber arrive strictly in `send` order, while subscribers run in
/// parallel with each other, so a slow callback never throttles the rest.
/// The channel tracks in-flight deliveries for quiescence waits and carries
/// the galactic bookkeeping the manager drives.
pub struct Channel {
    name: String,
    subscribers: RwLock<Vec<Subscriber>>,
    wait: WaitGroup,
    galactic: AtomicBool,
    destinations: Mutex<Vec<String>>,
    broker_subs: Mutex<Vec<GalacticRecord>>,
    mapped_tx: Sender<bool>,
    mapped_rx: Receiver<bool>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        // Single-slot, lossy: only the latest mapped/unmapped flip matters.
        let (mapped_tx, mapped_rx) = bounded(1);
        Arc::new(Self {
            name: name.into(),
            subscribers: RwLock::new(Vec::new()),
            wait: WaitGroup::new(),
            galactic: AtomicBool::new(false),
            destinations: Mutex::new(Vec::new()),
            broker_subs: Mutex::new(Vec::new()),
            mapped_tx,
            mapped_rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a callback. Returns the subscriber id for `unsubscribe`.
    pub fn subscribe(&self, callback: MessageHandlerFn, run_once: bool) -> Uuid {
        let id = Uuid::new_v4();
        let (tx, rx) = unbounded::<Message>();
        let consumed = Arc::new(AtomicBool::new(false));

        let worker_consumed = consumed.clone();
        let wait = self.wait.clone();
        let channel_name = self.name.clone();
        let _ = thread::Builder::new()
            .name(format!("bus-sub-{}", id.simple()))
            .spawn(move || {
                delivery_loop(rx, callback, run_once, worker_consumed, wait, channel_name)
            });

        self.subscribers.write().push(Subscriber {
            id,
            tx,
            run_once,
            consumed,
        });
        id
    }

    /// Remove a subscriber. Returns false when the id is unknown. Messages
    /// already queued to its worker still deliver.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Fan a message out to every current subscriber. Never blocks the
    /// producer and never fails; with no subscribers it is a no-op.
    pub fn send(&self, message: Message) {
        let mut saw_consumed = false;
        {
            let subs = self.subscribers.read();
            for sub in subs.iter() {
                if sub.run_once && sub.consumed.load(Ordering::Acquire) {
                    saw_consumed = true;
                    continue;
                }
                self.wait.add(1);
                if sub.tx.send(message.clone()).is_err() {
                    // Worker already gone; nothing will signal this slot.
                    self.wait.done();
                }
            }
        }
        if saw_consumed {
            self.prune_consumed();
        }
    }

    fn prune_consumed(&self) {
        self.subscribers
            .write()
            .retain(|s| !(s.run_once && s.consumed.load(Ordering::Acquire)));
    }

    /// Block until every message accepted so far has been dispatched to all
    /// of its subscribers.
    pub fn wait_for_quiescence(&self) {
        self.wait.wait();
    }

    // ---- galactic bookkeeping ----

    pub fn is_galactic(&self) -> bool {
        self.galactic.load(Ordering::Acquire)
    }

    /// Flag the channel galactic and record the mapped broker destination.
    pub fn set_galactic(&self, destination: &str) {
        self.galactic.store(true, Ordering::Release);
        let mut dests = self.destinations.lock();
        if !dests.iter().any(|d| d == destination) {
            dests.push(destination.to_string());
        }
    }

    /// Flag the channel local again and clear the mapped destinations.
    pub fn set_local(&self) {
        self.galactic.store(false, Ordering::Release);
        self.destinations.lock().clear();
    }

    pub fn mapped_destinations(&self) -> Vec<String> {
        self.destinations.lock().clone()
    }

    /// Record a broker subscription. At most one record per
    /// (connection, destination) pair; a duplicate is rejected.
    pub fn add_broker_subscription(
        &self,
        connection_id: Uuid,
        subscription: Arc<BridgeSubscription>,
    ) -> bool {
        let mut subs = self.broker_subs.lock();
        let destination = subscription.destination().to_string();
        if subs
            .iter()
            .any(|r| r.connection_id == connection_id && r.destination == destination)
        {
            return false;
        }
        subs.push(GalacticRecord {
            connection_id,
            destination,
            subscription,
        });
        true
    }

    /// Drop the record for a broker subscription id. Returns the removed
    /// record, if any.
    pub fn remove_broker_subscription(&self, subscription_id: Uuid) -> Option<GalacticRecord> {
        let mut subs = self.broker_subs.lock();
        let idx = subs
            .iter()
            .position(|r| r.subscription.id() == subscription_id)?;
        Some(subs.remove(idx))
    }

    pub fn is_broker_subscribed_to(&self, connection_id: Uuid, destination: &str) -> bool {
        self.broker_subs
            .lock()
            .iter()
            .any(|r| r.connection_id == connection_id && r.destination == destination)
    }

    pub fn broker_subscriptions(&self) -> Vec<GalacticRecord> {
        self.broker_subs.lock().clone()
    }

    /// Push a mapped (true) / unmapped (false) notification into the
    /// single-slot watcher channel. Dropped when no-one is listening.
    pub fn notify_mapped(&self, mapped: bool) {
        let _ = self.mapped_tx.try_send(mapped);
    }

    /// Watcher side of the mapped/unmapped notification slot.
    pub fn mapped_notifications(&self) -> Receiver<bool> {
        self.mapped_rx.clone()
    }
}

/// Per-subscriber worker: drains the queue in order, invokes the callback,
/// and signals the quiescence counter once per dequeued message. A callback
/// panic is logged and contained so other subscribers are unaffected.
fn delivery_loop(
    rx: Receiver<Message>,
    callback: MessageHandlerFn,
    run_once: bool,
    consumed: Arc<AtomicBool>,
    wait: WaitGroup,
    channel_name: String,
) {
    for message in rx.iter() {
        if run_once && consumed.swap(true, Ordering::AcqRel) {
            wait.done();
            continue;
        }
        let result = catch_unwind(AssertUnwindSafe(|| callback(&message)));
        if result.is_err() {
            tracing::warn!(channel = %channel_name, "subscriber callback panicked; isolating");
        }
        wait.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageConfig, payload};
    use std::sync::atomic::AtomicUsize;

    fn response(channel: &str, n: usize) -> Message {
        Message::response(MessageConfig::new(channel, payload(n), None))
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> MessageHandlerFn {
        Arc::new(move |_msg| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn every_subscriber_sees_every_message() {
        let channel = Channel::new("fan-out");
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        channel.subscribe(counting_handler(a.clone()), false);
        channel.subscribe(counting_handler(b.clone()), false);

        for n in 0..25 {
            channel.send(response("fan-out", n));
        }
        channel.wait_for_quiescence();

        assert_eq!(a.load(Ordering::SeqCst), 25);
        assert_eq!(b.load(Ordering::SeqCst), 25);
    }

    #[test]
    fn per_subscriber_delivery_is_in_send_order() {
        let channel = Channel::new("ordered");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.subscribe(
            Arc::new(move |msg: &Message| {
                sink.lock().push(*msg.payload_as::<usize>().unwrap());
            }),
            false,
        );

        for n in 0..100 {
            channel.send(response("ordered", n));
        }
        channel.wait_for_quiescence();

        let seen = seen.lock();
        assert_eq!(seen.len(), 100);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn run_once_subscriber_fires_at_most_once_and_is_pruned() {
        let channel = Channel::new("once");
        let count = Arc::new(AtomicUsize::new(0));
        channel.subscribe(counting_handler(count.clone()), true);

        for n in 0..10 {
            channel.send(response("once", n));
        }
        channel.wait_for_quiescence();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // The consumed subscriber is swept on a later send.
        channel.send(response("once", 99));
        channel.wait_for_quiescence();
        assert_eq!(channel.subscriber_count(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_future_deliveries() {
        let channel = Channel::new("leave");
        let count = Arc::new(AtomicUsize::new(0));
        let id = channel.subscribe(counting_handler(count.clone()), false);

        channel.send(response("leave", 1));
        channel.wait_for_quiescence();
        assert!(channel.unsubscribe(id));
        assert!(!channel.unsubscribe(id));

        channel.send(response("leave", 2));
        channel.wait_for_quiescence();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_starve_others() {
        let channel = Channel::new("isolated");
        channel.subscribe(
            Arc::new(|_msg: &Message| {
                panic!("subscriber exploded");
            }),
            false,
        );
        let survivor = Arc::new(AtomicUsize::new(0));
        channel.subscribe(counting_handler(survivor.clone()), false);

        for n in 0..5 {
            channel.send(response("isolated", n));
        }
        channel.wait_for_quiescence();
        assert_eq!(survivor.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn send_with_no_subscribers_is_a_noop() {
        let channel = Channel::new("empty");
        channel.send(response("empty", 0));
        channel.wait_for_quiescence();
    }

    #[test]
    fn galactic_flag_and_destinations() {
        let channel = Channel::new("galactic");
        assert!(!channel.is_galactic());
        channel.set_galactic("/topic/foo");
        channel.set_galactic("/topic/foo");
        channel.set_galactic("/topic/bar");
        assert!(channel.is_galactic());
        assert_eq!(channel.mapped_destinations(), vec!["/topic/foo", "/topic/bar"]);
        channel.set_local();
        assert!(!channel.is_galactic());
        assert!(channel.mapped_destinations().is_empty());
    }

    #[test]
    fn broker_subscription_records_dedup_by_connection_and_destination() {
        let channel = Channel::new("records");
        let conn = Uuid::new_v4();
        let sub = BridgeSubscription::detached("/topic/foo");
        assert!(channel.add_broker_subscription(conn, sub.clone()));
        assert!(!channel.add_broker_subscription(conn, sub.clone()));
        assert!(channel.is_broker_subscribed_to(conn, "/topic/foo"));
        assert!(!channel.is_broker_subscribed_to(Uuid::new_v4(), "/topic/foo"));

        let removed = channel.remove_broker_subscription(sub.id()).unwrap();
        assert_eq!(removed.destination, "/topic/foo");
        assert!(!channel.is_broker_subscribed_to(conn, "/topic/foo"));
        assert!(channel.remove_broker_subscription(sub.id()).is_none());
    }

    #[test]
    fn mapped_slot_is_lossy_and_single_capacity() {
        let channel = Channel::new("mapped");
        channel.notify_mapped(true);
        channel.notify_mapped(false); // dropped, slot full
        let rx = channel.mapped_notifications();
        assert_eq!(rx.try_recv(), Ok(true));
        assert!(rx.try_recv().is_err());
    }
}
