use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use ahash::AHashMap;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::bridge::BridgeConnection;
use crate::channel::{Channel, MessageHandlerFn};
use crate::error::BusError;
use crate::model::{Message, MessageConfig};
use crate::monitor::{MonitorEvent, MonitorEventKind, MonitorPayload, MonitorStream};

/// Registry of channels plus the local⇄galactic state machine.
///
/// All channel lifetime goes through the manager; channels themselves never
/// self-destruct. The manager is also the single consumer of the monitor
/// stream: galactic/local transitions emitted by `mark_channel_as_*` are
/// acted on by the background monitor loop, which drives broker
/// subscriptions and the inbound injection threads.
pub struct ChannelManager {
    channels: Mutex<AHashMap<String, Arc<Channel>>>,
    monitor: Arc<MonitorStream>,
    stop: Arc<AtomicBool>,
    listener: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ChannelManager {
    pub fn new(monitor: Arc<MonitorStream>) -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(AHashMap::new()),
            monitor,
            stop: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(None),
        })
    }

    pub fn monitor(&self) -> &Arc<MonitorStream> {
        &self.monitor
    }

    /// Create a channel, or hand back the existing one under that name.
    pub fn create_channel(&self, name: &str) -> Arc<Channel> {
        let mut channels = self.channels.lock();
        if let Some(existing) = channels.get(name) {
            return existing.clone();
        }
        let channel = Channel::new(name);
        channels.insert(name.to_string(), channel.clone());
        drop(channels);

        self.monitor
            .send_event(MonitorEventKind::ChannelCreated, name);
        channel
    }

    /// Drop a channel from the registry. Outstanding handlers keep their
    /// Arc and simply stop receiving new traffic routed by name.
    pub fn destroy_channel(&self, name: &str) {
        if self.channels.lock().remove(name).is_some() {
            self.monitor
                .send_event(MonitorEventKind::ChannelDestroyed, name);
        }
    }

    pub fn check_channel_exists(&self, name: &str) -> bool {
        self.channels.lock().contains_key(name)
    }

    pub fn get_channel(&self, name: &str) -> Result<Arc<Channel>, BusError> {
        self.channels
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::UnknownChannel(name.to_string()))
    }

    pub fn get_all_channels(&self) -> Vec<Arc<Channel>> {
        self.channels.lock().values().cloned().collect()
    }

    /// Attach a raw callback to a channel. The bus's handler wrappers build
    /// on this; it is also the hook external collaborators use.
    pub fn subscribe_channel_handler(
        &self,
        name: &str,
        callback: MessageHandlerFn,
        run_once: bool,
    ) -> Result<Uuid, BusError> {
        let channel = self.get_channel(name)?;
        let id = channel.subscribe(callback, run_once);
        self.monitor
            .send_event(MonitorEventKind::SubscriberJoined, name);
        Ok(id)
    }

    pub fn unsubscribe_channel_handler(&self, name: &str, id: Uuid) -> Result<(), BusError> {
        let channel = self.get_channel(name)?;
        if !channel.unsubscribe(id) {
            return Err(BusError::SubscriberNotFound {
                channel: name.to_string(),
                id,
            });
        }
        self.monitor
            .send_event(MonitorEventKind::SubscriberLeft, name);
        Ok(())
    }

    /// Block until every message accepted by the channel has been fully
    /// dispatched.
    pub fn wait_for_channel(&self, name: &str) -> Result<(), BusError> {
        self.get_channel(name)?.wait_for_quiescence();
        Ok(())
    }

    /// Map a channel onto a broker destination. The monitor loop picks the
    /// event up and performs the actual SUBSCRIBE, so the broker side
    /// settles asynchronously (watch `Channel::mapped_notifications`).
    pub fn mark_channel_as_galactic(
        &self,
        name: &str,
        destination: &str,
        connection: Arc<dyn BridgeConnection>,
    ) -> Result<(), BusError> {
        let channel = self.get_channel(name)?;
        channel.set_galactic(destination);
        self.monitor.send_event_data(
            MonitorEventKind::ChannelIsGalactic,
            name,
            MonitorPayload::GalacticMapping {
                connection,
                destination: destination.to_string(),
            },
        );
        Ok(())
    }

    /// Unmap a channel from every broker destination it is subscribed to.
    /// The monitor loop performs the UNSUBSCRIBEs.
    pub fn mark_channel_as_local(&self, name: &str) -> Result<(), BusError> {
        let channel = self.get_channel(name)?;
        channel.set_local();
        self.monitor
            .send_event(MonitorEventKind::ChannelIsLocal, name);
        Ok(())
    }

    /// Start the background monitor loop. Idempotent.
    pub fn listen_to_monitor(self: &Arc<Self>) {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return;
        }
        self.stop.store(false, Ordering::Release);
        let weak = Arc::downgrade(self);
        let stream = self.monitor.stream();
        let stop = self.stop.clone();
        let handle = thread::Builder::new()
            .name("bus-monitor".to_string())
            .spawn(move || monitor_loop(weak, stream, stop))
            .expect("spawn monitor loop");
        *listener = Some(handle);
    }

    /// Stop the monitor loop. Galactic/local events emitted afterwards sit
    /// in the stream unprocessed.
    pub fn stop_listening(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.listener.lock().take() {
            let _ = handle.join();
        }
    }

    fn handle_galactic_event(self: &Arc<Self>, event: &MonitorEvent) {
        let Ok(channel) = self.get_channel(&event.channel) else {
            return;
        };
        let Some(MonitorPayload::GalacticMapping {
            connection,
            destination,
        }) = &event.data
        else {
            tracing::warn!(channel = %event.channel, "galactic event without mapping payload");
            return;
        };

        // Already subscribed on this (connection, destination): nothing to
        // do, and in particular no second injector.
        if channel.is_broker_subscribed_to(connection.id(), destination) {
            return;
        }

        match connection.subscribe(destination) {
            Ok(subscription) => {
                channel.add_broker_subscription(connection.id(), subscription.clone());
                self.monitor.send_event_data(
                    MonitorEventKind::BrokerSubscribed,
                    channel.name(),
                    MonitorPayload::Destination(destination.clone()),
                );
                channel.notify_mapped(true);
                spawn_injector(channel.clone(), subscription);
            }
            Err(err) => {
                tracing::warn!(
                    channel = %event.channel,
                    %destination,
                    %err,
                    "broker subscribe failed"
                );
            }
        }
    }

    fn handle_local_event(self: &Arc<Self>, event: &MonitorEvent) {
        let Ok(channel) = self.get_channel(&event.channel) else {
            return;
        };
        for record in channel.broker_subscriptions() {
            if let Err(err) = record.subscription.unsubscribe() {
                tracing::warn!(
                    channel = %event.channel,
                    destination = %record.destination,
                    %err,
                    "broker unsubscribe failed"
                );
                continue;
            }
            channel.remove_broker_subscription(record.subscription.id());
            self.monitor.send_event_data(
                MonitorEventKind::BrokerUnsubscribed,
                channel.name(),
                MonitorPayload::Destination(record.destination.clone()),
            );
            channel.notify_mapped(false);
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// The manager's monitor consumer. Holds only a weak manager reference so
/// an abandoned bus (and its channels) can actually drop; the short recv
/// timeout is what lets it notice the stop flag.
fn monitor_loop(manager: Weak<ChannelManager>, stream: Receiver<MonitorEvent>, stop: Arc<AtomicBool>) {
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let event = match stream.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match event.kind {
            MonitorEventKind::ChannelIsGalactic => manager.handle_galactic_event(&event),
            MonitorEventKind::ChannelIsLocal => manager.handle_local_event(&event),
            _ => {}
        }
    }
}

/// Forward broker-inbound frames onto the local channel as Response
/// messages. Ends when the subscription's stream closes (unsubscribe or
/// connection loss).
fn spawn_injector(channel: Arc<Channel>, subscription: Arc<crate::bridge::BridgeSubscription>) {
    let inbound = subscription.messages().clone();
    let _ = thread::Builder::new()
        .name(format!("bus-inject-{}", subscription.id().simple()))
        .spawn(move || {
            for frame in inbound.iter() {
                let message = Message::response(MessageConfig {
                    channel: channel.name().to_string(),
                    destination: None,
                    payload: frame.payload.clone(),
                    error: None,
                });
                channel.send(message);
            }
            tracing::debug!(channel = %channel.name(), "galactic injector finished");
        });
}
