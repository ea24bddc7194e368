use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::channel::Receiver;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::model::Message;

/// The connection-side half a subscription talks to when it unsubscribes.
pub(crate) trait SubscriptionBackend: Send + Sync {
    fn unsubscribe(&self, subscription: &BridgeSubscription) -> Result<(), BridgeError>;
}

/// A live subscription to one broker destination.
///
/// Inbound MESSAGE frames arrive on `messages()`, broker ERROR frames on
/// `errors()`. Both streams disconnect when the subscription is dropped by
/// `unsubscribe` or when the connection dies.
pub struct BridgeSubscription {
    id: Uuid,
    destination: String,
    messages: Receiver<Message>,
    errors: Receiver<Message>,
    active: AtomicBool,
    backend: Option<Weak<dyn SubscriptionBackend>>,
}

impl BridgeSubscription {
    pub(crate) fn new(
        id: Uuid,
        destination: impl Into<String>,
        messages: Receiver<Message>,
        errors: Receiver<Message>,
        backend: Weak<dyn SubscriptionBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            destination: destination.into(),
            messages,
            errors,
            active: AtomicBool::new(true),
            backend: Some(backend),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Frames from the broker, synthesised as Response-direction messages.
    pub fn messages(&self) -> &Receiver<Message> {
        &self.messages
    }

    /// Broker ERROR frames routed to this subscription.
    pub fn errors(&self) -> &Receiver<Message> {
        &self.errors
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Send UNSUBSCRIBE for this destination and retire the subscription.
    /// Idempotent: only the first call reaches the wire.
    pub fn unsubscribe(&self) -> Result<(), BridgeError> {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(backend) = self.backend.as_ref().and_then(Weak::upgrade) {
                return backend.unsubscribe(self);
            }
        }
        Ok(())
    }

    /// Mark the subscription dead without touching the wire (connection
    /// loss path).
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Bookkeeping-only subscription with no live connection behind it.
    #[cfg(test)]
    pub(crate) fn detached(destination: &str) -> Arc<Self> {
        let (_mtx, messages) = crossbeam::channel::unbounded();
        let (_etx, errors) = crossbeam::channel::unbounded();
        Arc::new(Self {
            id: Uuid::new_v4(),
            destination: destination.to_string(),
            messages,
            errors,
            active: AtomicBool::new(true),
            backend: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingBackend {
        unsubscribed: Mutex<Vec<String>>,
    }

    impl SubscriptionBackend for RecordingBackend {
        fn unsubscribe(&self, subscription: &BridgeSubscription) -> Result<(), BridgeError> {
            self.unsubscribed
                .lock()
                .push(subscription.destination().to_string());
            Ok(())
        }
    }

    #[test]
    fn unsubscribe_reaches_the_backend_once() {
        let backend = Arc::new(RecordingBackend {
            unsubscribed: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn SubscriptionBackend> =
            Arc::downgrade(&(backend.clone() as Arc<dyn SubscriptionBackend>));

        let (_mtx, messages) = crossbeam::channel::unbounded();
        let (_etx, errors) = crossbeam::channel::unbounded();
        let sub = BridgeSubscription::new(Uuid::new_v4(), "/topic/test", messages, errors, weak);

        assert!(sub.is_active());
        sub.unsubscribe().unwrap();
        sub.unsubscribe().unwrap();
        assert!(!sub.is_active());
        assert_eq!(backend.unsubscribed.lock().as_slice(), ["/topic/test"]);
    }

    #[test]
    fn unsubscribe_after_connection_drop_is_ok() {
        let backend = Arc::new(RecordingBackend {
            unsubscribed: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn SubscriptionBackend> =
            Arc::downgrade(&(backend.clone() as Arc<dyn SubscriptionBackend>));
        drop(backend);

        let (_mtx, messages) = crossbeam::channel::unbounded();
        let (_etx, errors) = crossbeam::channel::unbounded();
        let sub = BridgeSubscription::new(Uuid::new_v4(), "/topic/test", messages, errors, weak);
        assert!(sub.unsubscribe().is_ok());
    }
}
