use std::fmt;
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender, bounded};

use crate::bridge::BridgeConnection;
use crate::model::Message;

/// Capacity of the monitor stream. Deliberately small: the monitor is a
/// lossy best-effort feed, not a durable event log. Producers never block on
/// it and drop silently when it is full.
const MONITOR_CAPACITY: usize = 5;

/// Internal bus events, with stable numeric codes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum MonitorEventKind {
    ChannelCreated = 0,
    ChannelDestroyed = 1,
    SubscriberJoined = 2,
    SubscriberLeft = 3,
    ChannelMessage = 4,
    ChannelError = 5,
    ChannelIsGalactic = 6,
    ChannelIsLocal = 7,
    BrokerConnectedWs = 8,
    BrokerConnectedTcp = 9,
    BrokerDisconnectedWs = 10,
    BrokerDisconnectedTcp = 11,
    BrokerSubscribed = 12,
    BrokerUnsubscribed = 13,
}

impl MonitorEventKind {
    /// Stable wire code of this event kind.
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// Data riding along with a monitor event.
pub enum MonitorPayload {
    /// A bus message (reserved event kinds, broker notifications).
    Message(Message),
    /// The channel→broker mapping a galactic transition carries.
    GalacticMapping {
        connection: Arc<dyn BridgeConnection>,
        destination: String,
    },
    /// A broker destination string (unsubscribe notifications).
    Destination(String),
}

impl fmt::Debug for MonitorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(msg) => f.debug_tuple("Message").field(msg).finish(),
            Self::GalacticMapping { destination, .. } => f
                .debug_struct("GalacticMapping")
                .field("destination", destination)
                .finish(),
            Self::Destination(dest) => f.debug_tuple("Destination").field(dest).finish(),
        }
    }
}

/// One event on the monitor stream.
#[derive(Debug)]
pub struct MonitorEvent {
    pub kind: MonitorEventKind,
    pub channel: String,
    pub data: Option<MonitorPayload>,
}

impl MonitorEvent {
    pub fn new(kind: MonitorEventKind, channel: impl Into<String>) -> Self {
        Self {
            kind,
            channel: channel.into(),
            data: None,
        }
    }

    pub fn with_data(
        kind: MonitorEventKind,
        channel: impl Into<String>,
        data: MonitorPayload,
    ) -> Self {
        Self {
            kind,
            channel: channel.into(),
            data: Some(data),
        }
    }
}

/// Process-internal event backbone wiring the channel manager to bridging
/// actions. Multi-producer, single consumer (the manager's listen loop).
pub struct MonitorStream {
    tx: Sender<MonitorEvent>,
    rx: Receiver<MonitorEvent>,
}

impl MonitorStream {
    pub fn new() -> Self {
        let (tx, rx) = bounded(MONITOR_CAPACITY);
        Self { tx, rx }
    }

    /// Emit an event without data. Non-blocking; dropped when no-one is
    /// draining the stream fast enough.
    pub fn send_event(&self, kind: MonitorEventKind, channel: &str) {
        let _ = self.tx.try_send(MonitorEvent::new(kind, channel));
    }

    /// Emit an event with a data payload. Same drop semantics.
    pub fn send_event_data(&self, kind: MonitorEventKind, channel: &str, data: MonitorPayload) {
        let _ = self.tx.try_send(MonitorEvent::with_data(kind, channel, data));
    }

    /// The consumer side of the stream. There should be exactly one
    /// long-lived consumer: the channel manager's monitor loop.
    pub fn stream(&self) -> Receiver<MonitorEvent> {
        self.rx.clone()
    }
}

impl Default for MonitorStream {
    fn default() -> Self {
        Self::new()
    }
}
