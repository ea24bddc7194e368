use std::any::Any;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Opaque dynamic payload carried by a [`Message`].
///
/// The bus never inspects payload shape; filtering is purely on direction
/// and destination id. Consumers downcast at the edge with
/// [`Message::payload_as`].
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Travel direction of a message on a channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Direction {
    /// Outbound: a request for someone on the channel to act on.
    Request,
    /// Inbound: a response to a previous request, or broker-injected traffic.
    Response,
    /// A failure value travelling in place of a payload.
    Error,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => write!(f, "request"),
            Direction::Response => write!(f, "response"),
            Direction::Error => write!(f, "error"),
        }
    }
}

/// Ingredients for building a [`Message`]. Mirrors what every producer knows:
/// where it goes, what it carries, who it is for.
#[derive(Clone, Default)]
pub struct MessageConfig {
    pub channel: String,
    pub destination: Option<Uuid>,
    pub payload: Option<Payload>,
    pub error: Option<Arc<anyhow::Error>>,
}

impl MessageConfig {
    pub fn new(channel: impl Into<String>, payload: Payload, destination: Option<Uuid>) -> Self {
        Self {
            channel: channel.into(),
            destination,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn for_error(
        channel: impl Into<String>,
        error: anyhow::Error,
        destination: Option<Uuid>,
    ) -> Self {
        Self {
            channel: channel.into(),
            destination,
            payload: None,
            error: Some(Arc::new(error)),
        }
    }
}

/// Immutable value travelling on a channel. Cheap to clone; the payload and
/// error slots are Arc-backed so fan-out to N subscribers never copies the
/// body.
///
/// Exactly one of `payload` / `error` is populated: `error` iff
/// `direction == Direction::Error`. Constructors enforce this.
#[derive(Clone)]
pub struct Message {
    pub id: Uuid,
    pub channel: String,
    pub destination_id: Option<Uuid>,
    pub direction: Direction,
    pub payload: Option<Payload>,
    pub error: Option<Arc<anyhow::Error>>,
}

impl Message {
    /// Build a Request-direction message from config.
    pub fn request(config: MessageConfig) -> Self {
        Self::with_direction(Direction::Request, config)
    }

    /// Build a Response-direction message from config.
    pub fn response(config: MessageConfig) -> Self {
        Self::with_direction(Direction::Response, config)
    }

    /// Build an Error-direction message. The payload slot is cleared; the
    /// error slot carries the failure value.
    pub fn error(config: MessageConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: config.channel,
            destination_id: config.destination,
            direction: Direction::Error,
            payload: None,
            error: config.error,
        }
    }

    fn with_direction(direction: Direction, config: MessageConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: config.channel,
            destination_id: config.destination,
            direction,
            payload: config.payload,
            error: None,
        }
    }

    /// Downcast the payload to a concrete type. `None` when the payload is
    /// absent or of a different type.
    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref().and_then(|p| p.downcast_ref::<T>())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("destination_id", &self.destination_id)
            .field("direction", &self.direction)
            .field("has_payload", &self.payload.is_some())
            .field("error", &self.error)
            .finish()
    }
}

/// Wrap a value as a message payload.
pub fn payload<T: Any + Send + Sync>(value: T) -> Payload {
    Arc::new(value)
}
