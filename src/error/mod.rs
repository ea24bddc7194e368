use std::{error::Error, fmt};

use uuid::Uuid;

/// Errors surfaced by bus-facing operations (channel lookup, handler
/// lifecycle, request firing).
#[derive(Debug)]
pub enum BusError {
    /// Operation referenced a channel name that is not registered.
    UnknownChannel(String),
    /// A `*_for_destination` operation was invoked without a destination id.
    NilDestination,
    /// `fire()` was called on a handler that has no prepared request.
    NothingToFire,
    /// Unsubscribe with an id the channel does not know.
    SubscriberNotFound { channel: String, id: Uuid },
    /// The handler was closed and its channel handle revoked.
    HandlerClosed,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownChannel(name) => write!(f, "channel does not exist: {name}"),
            Self::NilDestination => write!(f, "destination cannot be nil"),
            Self::NothingToFire => write!(f, "nothing to fire, request is empty"),
            Self::SubscriberNotFound { channel, id } => {
                write!(f, "no handler in channel '{channel}' for id [{id}]")
            }
            Self::HandlerClosed => write!(f, "handler is closed"),
        }
    }
}

impl Error for BusError {}

/// Errors surfaced by the broker bridge (connector, connection,
/// subscription operations).
#[derive(Debug)]
pub enum BridgeError {
    /// Connector config is missing a required field; carries the field name.
    ConfigInvalid(&'static str),
    /// Operation attempted before connect or after the connection died.
    NotConnected,
    /// Dial or STOMP handshake failure.
    Connect(anyhow::Error),
    /// SUBSCRIBE rejection or transport failure during subscribe.
    Subscribe(anyhow::Error),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigInvalid(field) => write!(f, "config invalid, config missing {field}"),
            Self::NotConnected => write!(f, "no connection to broker"),
            Self::Connect(err) => write!(f, "broker connect failed: {err}"),
            Self::Subscribe(err) => write!(f, "broker subscribe failed: {err}"),
        }
    }
}

impl Error for BridgeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Connect(err) | Self::Subscribe(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
