use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::bus::manager::ChannelManager;
use crate::channel::{Channel, MessageHandlerFn};
use crate::error::BusError;
use crate::model::{Direction, Message};

/// Success callback: receives matching messages.
pub type SuccessFn = dyn Fn(&Message) + Send + Sync;
/// Error callback: receives the failure value of Error-direction messages.
pub type ErrorFn = dyn Fn(&anyhow::Error) + Send + Sync;

/// The subscription handle every `listen_*` / `request_*` bus call returns.
///
/// The wrapper is the delivery gate: the channel fans out indiscriminately,
/// and the wrapper filters by direction and destination, partitions
/// firehose traffic, and enforces run-once semantics. `request_*` handlers
/// additionally carry a prepared request message that `fire()` sends.
///
/// The channel is held behind a revocable slot that `close()` empties, so
/// wrapper and channel never keep each other alive.
pub struct MessageHandler {
    core: Arc<HandlerCore>,
}

pub(crate) struct HandlerCore {
    id: Uuid,
    destination: Option<Uuid>,
    direction: Direction,
    ignore_destination: bool,
    firehose: bool,
    run_once: bool,
    has_run: AtomicBool,
    run_count: AtomicU64,
    manager: Arc<ChannelManager>,
    channel: Mutex<Option<Arc<Channel>>>,
    subscription: Mutex<Option<Uuid>>,
    request: Mutex<Option<Message>>,
}

impl MessageHandler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        manager: Arc<ChannelManager>,
        channel: Arc<Channel>,
        direction: Direction,
        ignore_destination: bool,
        firehose: bool,
        run_once: bool,
        destination: Option<Uuid>,
        request: Option<Message>,
    ) -> Self {
        Self {
            core: Arc::new(HandlerCore {
                id: Uuid::new_v4(),
                destination,
                direction,
                ignore_destination,
                firehose,
                run_once,
                has_run: AtomicBool::new(false),
                run_count: AtomicU64::new(0),
                manager,
                channel: Mutex::new(Some(channel)),
                subscription: Mutex::new(None),
                request: Mutex::new(request),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    /// The destination this handler targets (or was assigned at creation).
    pub fn destination_id(&self) -> Option<Uuid> {
        self.core.destination
    }

    /// How many times a callback has fired.
    pub fn run_count(&self) -> u64 {
        self.core.run_count.load(Ordering::Acquire)
    }

    /// Register the success and error callbacks and start receiving.
    pub fn handle(
        &self,
        on_success: impl Fn(&Message) + Send + Sync + 'static,
        on_error: impl Fn(&anyhow::Error) + Send + Sync + 'static,
    ) -> Result<(), BusError> {
        let channel = self
            .core
            .channel
            .lock()
            .clone()
            .ok_or(BusError::HandlerClosed)?;

        let core = self.core.clone();
        let on_success: Arc<SuccessFn> = Arc::new(on_success);
        let on_error: Arc<ErrorFn> = Arc::new(on_error);
        let dispatcher: MessageHandlerFn = Arc::new(move |message: &Message| {
            core.dispatch(message, &on_success, &on_error);
        });

        // The channel subscription is always streaming: run-once lives in
        // the wrapper's `has_run` gate, which only trips on traffic that
        // passes the direction/destination filter. A channel-level one-shot
        // would be consumed by the first message fanned out, filtered or
        // not.
        let subscription =
            self.core
                .manager
                .subscribe_channel_handler(channel.name(), dispatcher, false)?;
        *self.core.subscription.lock() = Some(subscription);
        Ok(())
    }

    /// Send the prepared request message and wait for the channel to finish
    /// dispatching, so a synchronous responder has answered by the time
    /// this returns.
    pub fn fire(&self) -> Result<(), BusError> {
        let request = self
            .core
            .request
            .lock()
            .clone()
            .ok_or(BusError::NothingToFire)?;
        let channel = self
            .core
            .channel
            .lock()
            .clone()
            .ok_or(BusError::HandlerClosed)?;
        channel.send(request);
        channel.wait_for_quiescence();
        Ok(())
    }

    /// Unsubscribe from the channel and revoke the channel handle.
    /// In-flight deliveries may still land.
    pub fn close(&self) {
        let channel = self.core.channel.lock().take();
        let subscription = self.core.subscription.lock().take();
        if let (Some(channel), Some(subscription)) = (channel, subscription) {
            let _ = self
                .core
                .manager
                .unsubscribe_channel_handler(channel.name(), subscription);
        }
    }
}

impl HandlerCore {
    /// The delivery gate. See the module docs for the routing rules; the
    /// run-once check is a single atomic swap so concurrent bursts cannot
    /// double-fire.
    fn dispatch(&self, message: &Message, on_success: &Arc<SuccessFn>, on_error: &Arc<ErrorFn>) {
        if self.firehose {
            if message.direction == Direction::Error {
                self.invoke_error(message, on_error);
            } else {
                self.invoke_success(message, on_success);
            }
            return;
        }

        if message.direction == self.direction {
            if self.ignore_destination {
                self.invoke_success(message, on_success);
            } else if message.destination_id.is_some()
                && message.destination_id == self.destination
            {
                self.invoke_success(message, on_success);
            }
        }
        if message.direction == Direction::Error {
            self.invoke_error(message, on_error);
        }
    }

    fn invoke_success(&self, message: &Message, on_success: &Arc<SuccessFn>) {
        if self.run_once {
            if !self.has_run.swap(true, Ordering::AcqRel) {
                self.run_count.fetch_add(1, Ordering::AcqRel);
                on_success(message);
            }
        } else {
            self.has_run.store(true, Ordering::Release);
            self.run_count.fetch_add(1, Ordering::AcqRel);
            on_success(message);
        }
    }

    fn invoke_error(&self, message: &Message, on_error: &Arc<ErrorFn>) {
        let Some(error) = message.error.as_ref() else {
            return;
        };
        if self.run_once {
            if !self.has_run.swap(true, Ordering::AcqRel) {
                self.run_count.fetch_add(1, Ordering::AcqRel);
                on_error(error);
            }
        } else {
            self.has_run.store(true, Ordering::Release);
            self.run_count.fetch_add(1, Ordering::AcqRel);
            on_error(error);
        }
    }
}
