pub use handler::*;
pub use manager::*;

mod handler;
mod manager;

use std::any::Any;
use std::sync::{Arc, OnceLock};

use uuid::Uuid;

use crate::bridge::BrokerConnector;
use crate::channel::Channel;
use crate::error::BusError;
use crate::model::{Direction, Message, MessageConfig, payload};
use crate::monitor::MonitorStream;

static SHARED: OnceLock<Arc<Bus>> = OnceLock::new();

/// The event bus façade: message sending, the listen/request surface, and
/// access to the channel manager and broker connector.
///
/// `Bus::shared()` is the process singleton most applications want;
/// `Bus::new()` builds an independent instance so tests stay hermetic.
pub struct Bus {
    id: Uuid,
    manager: Arc<ChannelManager>,
    monitor: Arc<MonitorStream>,
    connector: OnceLock<BrokerConnector>,
}

impl Bus {
    /// The process-wide bus, initialised on first access.
    pub fn shared() -> Arc<Bus> {
        SHARED.get_or_init(Bus::new).clone()
    }

    /// A fresh, fully independent bus instance.
    pub fn new() -> Arc<Bus> {
        let monitor = Arc::new(MonitorStream::new());
        let manager = ChannelManager::new(monitor.clone());
        manager.listen_to_monitor();
        let bus = Arc::new(Self {
            id: Uuid::new_v4(),
            manager,
            monitor,
            connector: OnceLock::new(),
        });
        tracing::info!(id = %bus.id, "event bus online");
        bus
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel_manager(&self) -> &Arc<ChannelManager> {
        &self.manager
    }

    pub fn monitor(&self) -> &Arc<MonitorStream> {
        &self.monitor
    }

    /// The broker connector for galactic mappings, created on first use and
    /// wired into this bus's monitor stream.
    pub fn broker_connector(&self) -> &BrokerConnector {
        self.connector
            .get_or_init(|| BrokerConnector::with_monitor(self.monitor.clone()))
    }

    // ---- message producing ----

    /// Send a Request-direction message on a channel.
    pub fn send_request_message(
        &self,
        channel: &str,
        body: impl Any + Send + Sync,
        destination: Option<Uuid>,
    ) -> Result<(), BusError> {
        let target = self.manager.get_channel(channel)?;
        target.send(Message::request(MessageConfig::new(
            channel,
            payload(body),
            destination,
        )));
        Ok(())
    }

    /// Send a Response-direction message on a channel.
    pub fn send_response_message(
        &self,
        channel: &str,
        body: impl Any + Send + Sync,
        destination: Option<Uuid>,
    ) -> Result<(), BusError> {
        let target = self.manager.get_channel(channel)?;
        target.send(Message::response(MessageConfig::new(
            channel,
            payload(body),
            destination,
        )));
        Ok(())
    }

    /// Send an Error-direction message carrying a failure value.
    pub fn send_error_message(
        &self,
        channel: &str,
        error: anyhow::Error,
        destination: Option<Uuid>,
    ) -> Result<(), BusError> {
        let target = self.manager.get_channel(channel)?;
        target.send(Message::error(MessageConfig::for_error(
            channel,
            error,
            destination,
        )));
        Ok(())
    }

    // ---- streaming listeners ----

    /// Listen to the stream of Response messages on a channel, any
    /// destination.
    pub fn listen_stream(&self, channel: &str) -> Result<MessageHandler, BusError> {
        let target = self.manager.get_channel(channel)?;
        Ok(self.wrap(target, Direction::Response, true, false, false, None, None))
    }

    /// Listen to Response messages targeted at a specific destination.
    pub fn listen_stream_for_destination(
        &self,
        channel: &str,
        destination: Option<Uuid>,
    ) -> Result<MessageHandler, BusError> {
        let target = self.manager.get_channel(channel)?;
        let destination = destination.ok_or(BusError::NilDestination)?;
        Ok(self.wrap(
            target,
            Direction::Response,
            false,
            false,
            false,
            Some(destination),
            None,
        ))
    }

    /// Listen to the stream of Request messages on a channel, any
    /// destination.
    pub fn listen_request_stream(&self, channel: &str) -> Result<MessageHandler, BusError> {
        let target = self.manager.get_channel(channel)?;
        Ok(self.wrap(target, Direction::Request, true, false, false, None, None))
    }

    /// Listen to Request messages targeted at a specific destination.
    pub fn listen_request_stream_for_destination(
        &self,
        channel: &str,
        destination: Option<Uuid>,
    ) -> Result<MessageHandler, BusError> {
        let target = self.manager.get_channel(channel)?;
        let destination = destination.ok_or(BusError::NilDestination)?;
        Ok(self.wrap(
            target,
            Direction::Request,
            false,
            false,
            false,
            Some(destination),
            None,
        ))
    }

    /// Everything on the channel, regardless of direction or destination:
    /// Error messages go to the error callback, the rest to success.
    pub fn listen_firehose(&self, channel: &str) -> Result<MessageHandler, BusError> {
        let target = self.manager.get_channel(channel)?;
        Ok(self.wrap(target, Direction::Request, true, true, false, None, None))
    }

    // ---- single-shot listeners ----

    /// Listen for a single Response message, then go quiet.
    pub fn listen_once(&self, channel: &str) -> Result<MessageHandler, BusError> {
        let target = self.manager.get_channel(channel)?;
        let destination = Uuid::new_v4();
        Ok(self.wrap(
            target,
            Direction::Response,
            true,
            false,
            true,
            Some(destination),
            None,
        ))
    }

    /// Listen for a single Response message for a specific destination.
    pub fn listen_once_for_destination(
        &self,
        channel: &str,
        destination: Option<Uuid>,
    ) -> Result<MessageHandler, BusError> {
        let target = self.manager.get_channel(channel)?;
        let destination = destination.ok_or(BusError::NilDestination)?;
        Ok(self.wrap(
            target,
            Direction::Response,
            false,
            false,
            true,
            Some(destination),
            None,
        ))
    }

    /// Listen for a single Request message, then go quiet.
    pub fn listen_request_once(&self, channel: &str) -> Result<MessageHandler, BusError> {
        let target = self.manager.get_channel(channel)?;
        let destination = Uuid::new_v4();
        Ok(self.wrap(
            target,
            Direction::Request,
            true,
            false,
            true,
            Some(destination),
            None,
        ))
    }

    /// Listen for a single Request message for a specific destination.
    pub fn listen_request_once_for_destination(
        &self,
        channel: &str,
        destination: Option<Uuid>,
    ) -> Result<MessageHandler, BusError> {
        let target = self.manager.get_channel(channel)?;
        let destination = destination.ok_or(BusError::NilDestination)?;
        Ok(self.wrap(
            target,
            Direction::Request,
            false,
            false,
            true,
            Some(destination),
            None,
        ))
    }

    // ---- request/response in one call ----

    /// Prepare a request and a single-shot response handler; the request is
    /// sent when the returned handler's `fire()` is called.
    pub fn request_once(
        &self,
        channel: &str,
        body: impl Any + Send + Sync,
    ) -> Result<MessageHandler, BusError> {
        self.build_request(channel, body, None, true)
    }

    /// `request_once` targeted at a specific destination.
    pub fn request_once_for_destination(
        &self,
        channel: &str,
        body: impl Any + Send + Sync,
        destination: Option<Uuid>,
    ) -> Result<MessageHandler, BusError> {
        let destination = destination.ok_or(BusError::NilDestination)?;
        self.build_request(channel, body, Some(destination), true)
    }

    /// Prepare a request and a streaming response handler: every response
    /// after `fire()` is delivered.
    pub fn request_stream(
        &self,
        channel: &str,
        body: impl Any + Send + Sync,
    ) -> Result<MessageHandler, BusError> {
        self.build_request(channel, body, None, false)
    }

    /// `request_stream` targeted at a specific destination.
    pub fn request_stream_for_destination(
        &self,
        channel: &str,
        body: impl Any + Send + Sync,
        destination: Option<Uuid>,
    ) -> Result<MessageHandler, BusError> {
        let destination = destination.ok_or(BusError::NilDestination)?;
        self.build_request(channel, body, Some(destination), false)
    }

    fn build_request(
        &self,
        channel: &str,
        body: impl Any + Send + Sync,
        destination: Option<Uuid>,
        run_once: bool,
    ) -> Result<MessageHandler, BusError> {
        let target = self.manager.get_channel(channel)?;
        // Without an explicit destination the handler gets a generated id
        // and accepts any response; with one, it filters strictly.
        let (ignore_destination, destination) = match destination {
            Some(destination) => (false, destination),
            None => (true, Uuid::new_v4()),
        };
        let request = Message::request(MessageConfig::new(
            channel,
            payload(body),
            Some(destination),
        ));
        Ok(self.wrap(
            target,
            Direction::Response,
            ignore_destination,
            false,
            run_once,
            Some(destination),
            Some(request),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn wrap(
        &self,
        channel: Arc<Channel>,
        direction: Direction,
        ignore_destination: bool,
        firehose: bool,
        run_once: bool,
        destination: Option<Uuid>,
        request: Option<Message>,
    ) -> MessageHandler {
        MessageHandler::new(
            self.manager.clone(),
            channel,
            direction,
            ignore_destination,
            firehose,
            run_once,
            destination,
            request,
        )
    }
}
