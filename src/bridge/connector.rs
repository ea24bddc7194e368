use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use ahash::AHashMap;
use anyhow::anyhow;
use bytes::Bytes;
use crossbeam::channel::{Sender, unbounded};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::bridge::config::BrokerConnectorConfig;
use crate::bridge::subscription::{BridgeSubscription, SubscriptionBackend};
use crate::bridge::transport::{TransportReader, TransportWriter, dial_tcp, dial_ws};
use crate::error::BridgeError;
use crate::model::{Message, MessageConfig, payload};
use crate::monitor::{MonitorEventKind, MonitorStream};
use crate::stomp::{Command, Frame, headers};

/// One logical connection to a STOMP broker, as the channel manager and
/// galactic machinery see it. `StompConnection` is the wire implementation;
/// tests substitute mocks at this seam.
pub trait BridgeConnection: Send + Sync {
    fn id(&self) -> Uuid;
    fn is_connected(&self) -> bool;
    /// Subscribe to a broker destination. Subscribing an already-subscribed
    /// destination returns the existing subscription.
    fn subscribe(&self, destination: &str) -> Result<Arc<BridgeSubscription>, BridgeError>;
    /// Publish raw bytes to a destination (STOMP SEND).
    fn send_message(&self, destination: &str, body: Bytes) -> Result<(), BridgeError>;
    /// Send DISCONNECT and tear the connection down. All subscription
    /// streams observe end-of-stream.
    fn disconnect(&self) -> Result<(), BridgeError>;
}

/// Factory for broker connections. Carries an optional monitor handle so
/// connect/disconnect show up on the bus monitor stream.
pub struct BrokerConnector {
    monitor: Option<Arc<MonitorStream>>,
}

impl BrokerConnector {
    pub fn new() -> Self {
        Self { monitor: None }
    }

    pub fn with_monitor(monitor: Arc<MonitorStream>) -> Self {
        Self {
            monitor: Some(monitor),
        }
    }

    /// Validate the config, dial the broker (TCP or WebSocket), run the
    /// CONNECT/CONNECTED handshake, and start the reader and heartbeat
    /// loops.
    pub fn connect(
        &self,
        config: &BrokerConnectorConfig,
    ) -> Result<Arc<StompConnection>, BridgeError> {
        config.validate()?;

        let (mut reader, writer) = if config.use_ws {
            dial_ws(&config.ws_url()).map_err(BridgeError::Connect)?
        } else {
            dial_tcp(&config.server_addr).map_err(BridgeError::Connect)?
        };

        let offer = config.heartbeat_ms;
        let mut connect_frame = Frame::with_headers(
            Command::Connect,
            &[
                (headers::ACCEPT_VERSION, "1.2"),
                (headers::HOST, config.host()),
                (headers::LOGIN, &config.username),
                (headers::PASSCODE, &config.password),
            ],
        );
        connect_frame.set_header(headers::HEART_BEAT, format!("{offer},{offer}"));
        writer
            .write_frame(&connect_frame)
            .map_err(BridgeError::Connect)?;

        let connected = loop {
            match reader.read_frame().map_err(BridgeError::Connect)? {
                Some(frame) if frame.command == Command::Connected => break frame,
                Some(frame) if frame.command == Command::Error => {
                    let reason = frame
                        .header(headers::MESSAGE)
                        .map(str::to_string)
                        .unwrap_or_else(|| String::from_utf8_lossy(&frame.body).into_owned());
                    return Err(BridgeError::Connect(anyhow!(
                        "broker rejected CONNECT: {reason}"
                    )));
                }
                Some(frame) => {
                    return Err(BridgeError::Connect(anyhow!(
                        "unexpected {} during handshake",
                        frame.command
                    )));
                }
                None => {
                    return Err(BridgeError::Connect(anyhow!(
                        "connection closed during handshake"
                    )));
                }
            }
        };

        let heartbeat_interval = negotiate_heartbeat(offer, connected.header(headers::HEART_BEAT));

        let core = Arc::new(ConnectionCore {
            id: Uuid::new_v4(),
            use_ws: config.use_ws,
            server_addr: config.server_addr.clone(),
            connected: AtomicBool::new(true),
            writer,
            tables: Mutex::new(SubTables::default()),
            monitor: self.monitor.clone(),
        });

        let reader_core = core.clone();
        let _ = thread::Builder::new()
            .name(format!("bus-broker-read-{}", core.id.simple()))
            .spawn(move || reader_loop(reader, reader_core));

        if heartbeat_interval > Duration::ZERO {
            let beat_core = core.clone();
            let _ = thread::Builder::new()
                .name(format!("bus-broker-beat-{}", core.id.simple()))
                .spawn(move || heartbeat_loop(beat_core, heartbeat_interval));
        }

        if let Some(monitor) = &self.monitor {
            let kind = if config.use_ws {
                MonitorEventKind::BrokerConnectedWs
            } else {
                MonitorEventKind::BrokerConnectedTcp
            };
            monitor.send_event(kind, &config.server_addr);
        }

        tracing::info!(
            addr = %config.server_addr,
            ws = config.use_ws,
            heartbeat_ms = heartbeat_interval.as_millis() as u64,
            "connected to broker"
        );
        Ok(Arc::new(StompConnection { core }))
    }
}

impl Default for BrokerConnector {
    fn default() -> Self {
        Self::new()
    }
}

/// The wire-backed [`BridgeConnection`].
pub struct StompConnection {
    core: Arc<ConnectionCore>,
}

struct ConnectionCore {
    id: Uuid,
    use_ws: bool,
    server_addr: String,
    connected: AtomicBool,
    writer: TransportWriter,
    tables: Mutex<SubTables>,
    monitor: Option<Arc<MonitorStream>>,
}

#[derive(Default)]
struct SubTables {
    by_destination: AHashMap<String, Arc<BridgeSubscription>>,
    feeds: AHashMap<Uuid, SubscriptionFeed>,
}

struct SubscriptionFeed {
    destination: String,
    messages: Sender<Message>,
    errors: Sender<Message>,
}

impl BridgeConnection for StompConnection {
    fn id(&self) -> Uuid {
        self.core.id
    }

    fn is_connected(&self) -> bool {
        self.core.connected.load(Ordering::Acquire)
    }

    fn subscribe(&self, destination: &str) -> Result<Arc<BridgeSubscription>, BridgeError> {
        let core = &self.core;
        if !core.connected.load(Ordering::Acquire) {
            return Err(BridgeError::NotConnected);
        }

        let mut tables = core.tables.lock();
        if let Some(existing) = tables.by_destination.get(destination) {
            return Ok(existing.clone());
        }

        let id = Uuid::new_v4();
        let (message_tx, message_rx) = unbounded();
        let (error_tx, error_rx) = unbounded();
        let backend: Weak<dyn SubscriptionBackend> =
            Arc::downgrade(&(core.clone() as Arc<dyn SubscriptionBackend>));
        let subscription =
            BridgeSubscription::new(id, destination, message_rx, error_rx, backend);

        // Register the routing entries before SUBSCRIBE hits the wire, so a
        // broker answering immediately cannot race the reader thread.
        tables
            .by_destination
            .insert(destination.to_string(), subscription.clone());
        tables.feeds.insert(
            id,
            SubscriptionFeed {
                destination: destination.to_string(),
                messages: message_tx,
                errors: error_tx,
            },
        );

        let frame = Frame::with_headers(
            Command::Subscribe,
            &[
                (headers::ID, &id.to_string()),
                (headers::DESTINATION, destination),
                (headers::ACK, "auto"),
            ],
        );
        if let Err(err) = core.writer.write_frame(&frame) {
            tables.by_destination.remove(destination);
            tables.feeds.remove(&id);
            return Err(BridgeError::Subscribe(err));
        }
        tracing::debug!(%destination, subscription = %id, "subscribed to broker destination");
        Ok(subscription)
    }

    fn send_message(&self, destination: &str, body: Bytes) -> Result<(), BridgeError> {
        let core = &self.core;
        if !core.connected.load(Ordering::Acquire) {
            return Err(BridgeError::NotConnected);
        }
        let mut frame = Frame::new(Command::Send);
        frame
            .set_header(headers::DESTINATION, destination)
            .set_body(body);
        if let Err(err) = core.writer.write_frame(&frame) {
            tracing::warn!(%destination, %err, "send failed, closing broker connection");
            core.teardown();
            return Err(BridgeError::NotConnected);
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BridgeError> {
        let core = &self.core;
        if !core.connected.load(Ordering::Acquire) {
            return Err(BridgeError::NotConnected);
        }
        let _ = core.writer.write_frame(&Frame::new(Command::Disconnect));
        core.teardown();
        Ok(())
    }
}

impl ConnectionCore {
    /// Close the transport, retire every subscription (their streams
    /// disconnect), and mark the connection unusable. Idempotent.
    fn teardown(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut tables = self.tables.lock();
        for subscription in tables.by_destination.values() {
            subscription.deactivate();
        }
        tables.by_destination.clear();
        tables.feeds.clear();
        drop(tables);

        self.writer.shutdown();
        if let Some(monitor) = &self.monitor {
            let kind = if self.use_ws {
                MonitorEventKind::BrokerDisconnectedWs
            } else {
                MonitorEventKind::BrokerDisconnectedTcp
            };
            monitor.send_event(kind, &self.server_addr);
        }
        tracing::info!(addr = %self.server_addr, "broker connection closed");
    }
}

impl SubscriptionBackend for ConnectionCore {
    /// Remove the subscription from the routing tables and send
    /// UNSUBSCRIBE. Records are always removed so a mark-local after
    /// connection loss still converges; a failed wire write is only logged.
    fn unsubscribe(&self, subscription: &BridgeSubscription) -> Result<(), BridgeError> {
        {
            let mut tables = self.tables.lock();
            tables.by_destination.remove(subscription.destination());
            tables.feeds.remove(&subscription.id());
        }
        if self.connected.load(Ordering::Acquire) {
            let frame = Frame::with_headers(
                Command::Unsubscribe,
                &[
                    (headers::ID, &subscription.id().to_string()),
                    (headers::DESTINATION, subscription.destination()),
                    (headers::ACK, "auto"),
                ],
            );
            if let Err(err) = self.writer.write_frame(&frame) {
                tracing::warn!(
                    destination = subscription.destination(),
                    %err,
                    "UNSUBSCRIBE write failed"
                );
            }
        }
        Ok(())
    }
}

/// Per-connection reader: demultiplexes inbound frames onto subscription
/// streams by the `subscription` header (falling back to destination for
/// brokers that omit it). Ends on connection loss or teardown.
fn reader_loop(mut reader: TransportReader, core: Arc<ConnectionCore>) {
    loop {
        match reader.read_frame() {
            Ok(Some(frame)) => core.route_frame(frame),
            Ok(None) => {
                tracing::debug!(addr = %core.server_addr, "broker closed the connection");
                core.teardown();
                break;
            }
            Err(err) => {
                if core.connected.load(Ordering::Acquire) {
                    tracing::warn!(addr = %core.server_addr, %err, "broker read failed");
                }
                core.teardown();
                break;
            }
        }
    }
}

impl ConnectionCore {
    fn route_frame(&self, frame: Frame) {
        match frame.command {
            Command::Message => {
                let destination = frame.header(headers::DESTINATION).unwrap_or_default();
                let tables = self.tables.lock();
                let Some(feed) = lookup_feed(&tables, &frame, destination) else {
                    tracing::debug!(%destination, "MESSAGE frame for unknown subscription, dropping");
                    return;
                };
                let message = Message::response(MessageConfig::new(
                    feed.destination.clone(),
                    payload(frame.body.clone()),
                    None,
                ));
                let _ = feed.messages.send(message);
            }
            Command::Error => {
                let reason = frame
                    .header(headers::MESSAGE)
                    .map(str::to_string)
                    .unwrap_or_else(|| String::from_utf8_lossy(&frame.body).into_owned());
                let destination = frame.header(headers::DESTINATION).unwrap_or_default();
                let tables = self.tables.lock();
                if let Some(feed) = lookup_feed(&tables, &frame, destination) {
                    let message = Message::error(MessageConfig::for_error(
                        feed.destination.clone(),
                        anyhow!(reason),
                        None,
                    ));
                    let _ = feed.errors.send(message);
                } else {
                    // One bad frame never tears the connection down.
                    tracing::warn!(addr = %self.server_addr, %reason, "broker ERROR frame");
                }
            }
            Command::Receipt | Command::Connected => {}
            other => {
                tracing::debug!(command = %other, "ignoring unexpected broker frame");
            }
        }
    }
}

fn lookup_feed<'t>(
    tables: &'t SubTables,
    frame: &Frame,
    destination: &str,
) -> Option<&'t SubscriptionFeed> {
    if let Some(id) = frame
        .header(headers::SUBSCRIPTION)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        && let Some(feed) = tables.feeds.get(&id)
    {
        return Some(feed);
    }
    tables
        .feeds
        .values()
        .find(|feed| feed.destination == destination)
}

fn heartbeat_loop(core: Arc<ConnectionCore>, interval: Duration) {
    loop {
        thread::sleep(interval);
        if !core.connected.load(Ordering::Acquire) {
            break;
        }
        if let Err(err) = core.writer.write_heartbeat() {
            tracing::warn!(addr = %core.server_addr, %err, "heartbeat write failed");
            core.teardown();
            break;
        }
    }
}

/// STOMP heart-beat negotiation: we send at `max(our offer, what the server
/// wants to receive)`; either side offering 0 disables the direction.
fn negotiate_heartbeat(offer_ms: u64, server: Option<&str>) -> Duration {
    let Some(server) = server else {
        return Duration::ZERO;
    };
    let mut parts = server.splitn(2, ',');
    let _server_sends: u64 = parts.next().and_then(|p| p.trim().parse().ok()).unwrap_or(0);
    let server_wants: u64 = parts.next().and_then(|p| p.trim().parse().ok()).unwrap_or(0);
    if offer_ms == 0 || server_wants == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(offer_ms.max(server_wants))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stomp::FrameReader;
    use std::io::BufReader;
    use std::net::TcpListener;

    /// Commands a mini-broker has seen, for assertions.
    type SeenFrames = Arc<Mutex<Vec<Frame>>>;

    /// Single-connection loopback STOMP broker over raw TCP: answers
    /// CONNECT with CONNECTED and SUBSCRIBE with one MESSAGE, and records
    /// everything else.
    fn spawn_tcp_broker() -> (String, SeenFrames) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let seen: SeenFrames = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut write_half = stream.try_clone().unwrap();
            let mut reader = FrameReader::new(BufReader::new(stream));
            while let Ok(Some(frame)) = reader.read_frame() {
                record.lock().push(frame.clone());
                match frame.command {
                    Command::Connect => {
                        let mut reply = Frame::new(Command::Connected);
                        reply.set_header(headers::VERSION, "1.2");
                        crate::stomp::write_frame(&mut write_half, &reply).unwrap();
                    }
                    Command::Subscribe => {
                        let mut reply = Frame::new(Command::Message);
                        reply
                            .set_header(
                                headers::DESTINATION,
                                frame.header(headers::DESTINATION).unwrap(),
                            )
                            .set_header(headers::SUBSCRIPTION, frame.header(headers::ID).unwrap())
                            .set_body(Bytes::from_static(b"happy baby melody!"));
                        crate::stomp::write_frame(&mut write_half, &reply).unwrap();
                    }
                    Command::Disconnect => break,
                    _ => {}
                }
            }
        });
        (addr, seen)
    }

    /// Same mini-broker speaking one-frame-per-binary-message WebSocket.
    fn spawn_ws_broker() -> (String, SeenFrames) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let seen: SeenFrames = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut socket = tungstenite::accept(stream).unwrap();
            loop {
                let message = match socket.read() {
                    Ok(m) => m,
                    Err(_) => break,
                };
                let bytes = match message {
                    tungstenite::Message::Binary(b) => b,
                    tungstenite::Message::Text(t) => t.into_bytes(),
                    tungstenite::Message::Close(_) => break,
                    _ => continue,
                };
                let Ok(frame) = crate::stomp::parse_frame(&bytes) else {
                    continue;
                };
                record.lock().push(frame.clone());
                let reply = match frame.command {
                    Command::Connect => {
                        let mut reply = Frame::new(Command::Connected);
                        reply.set_header(headers::VERSION, "1.2");
                        Some(reply)
                    }
                    Command::Subscribe => {
                        let mut reply = Frame::new(Command::Message);
                        reply
                            .set_header(
                                headers::DESTINATION,
                                frame.header(headers::DESTINATION).unwrap(),
                            )
                            .set_header(headers::SUBSCRIPTION, frame.header(headers::ID).unwrap())
                            .set_body(Bytes::from_static(b"happy baby melody!"));
                        Some(reply)
                    }
                    Command::Disconnect => break,
                    _ => None,
                };
                if let Some(reply) = reply {
                    let payload = reply.to_bytes().to_vec();
                    if socket
                        .send(tungstenite::Message::Binary(payload))
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });
        (addr, seen)
    }

    fn logging_init(level: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
        let config = crate::utils::LoggerConfig {
            level: level.to_string(),
            ..Default::default()
        };
        config.init().unwrap()
    }

    fn tcp_config(addr: &str) -> BrokerConnectorConfig {
        BrokerConnectorConfig::new("guest", "guest", addr)
    }

    fn ws_config(addr: &str) -> BrokerConnectorConfig {
        BrokerConnectorConfig::new("guest", "guest", addr).websocket("/")
    }

    #[test]
    fn connect_and_disconnect_over_tcp() {
        let _logger = logging_init("debug");
        let (addr, seen) = spawn_tcp_broker();
        let connector = BrokerConnector::new();
        let connection = connector.connect(&tcp_config(&addr)).unwrap();
        assert!(connection.is_connected());

        connection.disconnect().unwrap();
        assert!(!connection.is_connected());
        assert!(matches!(
            connection.disconnect(),
            Err(BridgeError::NotConnected)
        ));

        // CONNECT made it to the broker.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(seen.lock()[0].command, Command::Connect);
    }

    #[test]
    fn connect_fails_against_nothing() {
        let connector = BrokerConnector::new();
        let err = connector
            .connect(&tcp_config("127.0.0.1:1"))
            .err()
            .expect("dial must fail");
        assert!(matches!(err, BridgeError::Connect(_)));
    }

    #[test]
    fn subscribe_receives_broker_messages_over_tcp() {
        let (addr, _seen) = spawn_tcp_broker();
        let connection = BrokerConnector::new().connect(&tcp_config(&addr)).unwrap();

        let sub = connection.subscribe("/topic/test").unwrap();
        let msg = sub
            .messages()
            .recv_timeout(Duration::from_secs(2))
            .expect("broker message");
        assert_eq!(
            msg.payload_as::<Bytes>().map(|b| &b[..]),
            Some(&b"happy baby melody!"[..])
        );

        // Re-subscribe is idempotent and returns the same subscription id.
        let again = connection.subscribe("/topic/test").unwrap();
        assert_eq!(sub.id(), again.id());

        connection.disconnect().unwrap();
    }

    #[test]
    fn subscribe_receives_broker_messages_over_websocket() {
        let (addr, seen) = spawn_ws_broker();
        let connection = BrokerConnector::new().connect(&ws_config(&addr)).unwrap();

        let sub = connection.subscribe("/topic/test").unwrap();
        let msg = sub
            .messages()
            .recv_timeout(Duration::from_secs(2))
            .expect("broker message");
        assert_eq!(
            msg.payload_as::<Bytes>().map(|b| &b[..]),
            Some(&b"happy baby melody!"[..])
        );

        connection
            .send_message("/queue/out", Bytes::from_static(b"outbound"))
            .unwrap();
        connection.disconnect().unwrap();

        thread::sleep(Duration::from_millis(100));
        let seen = seen.lock();
        assert!(seen.iter().any(|f| f.command == Command::Send
            && f.header(headers::DESTINATION) == Some("/queue/out")));
    }

    #[test]
    fn unsubscribe_sends_frame_and_closes_stream() {
        let (addr, seen) = spawn_tcp_broker();
        let connection = BrokerConnector::new().connect(&tcp_config(&addr)).unwrap();
        let sub = connection.subscribe("/topic/test").unwrap();
        let _ = sub.messages().recv_timeout(Duration::from_secs(2)).unwrap();

        sub.unsubscribe().unwrap();
        assert!(!sub.is_active());

        // Stream is disconnected once the feed sender is dropped.
        assert!(
            sub.messages()
                .recv_timeout(Duration::from_millis(200))
                .is_err()
        );

        thread::sleep(Duration::from_millis(100));
        assert!(
            seen.lock()
                .iter()
                .any(|f| f.command == Command::Unsubscribe
                    && f.header(headers::DESTINATION) == Some("/topic/test"))
        );
        connection.disconnect().unwrap();
    }

    #[test]
    fn operations_after_disconnect_fail_not_connected() {
        let (addr, _seen) = spawn_tcp_broker();
        let connection = BrokerConnector::new().connect(&tcp_config(&addr)).unwrap();
        connection.disconnect().unwrap();

        assert!(matches!(
            connection.subscribe("/topic/test"),
            Err(BridgeError::NotConnected)
        ));
        assert!(matches!(
            connection.send_message("/topic/test", Bytes::new()),
            Err(BridgeError::NotConnected)
        ));
    }

    #[test]
    fn broker_going_away_closes_subscription_streams() {
        let (addr, _seen) = spawn_tcp_broker();
        let connection = BrokerConnector::new().connect(&tcp_config(&addr)).unwrap();
        let sub = connection.subscribe("/topic/test").unwrap();
        let _ = sub.messages().recv_timeout(Duration::from_secs(2)).unwrap();

        // DISCONNECT makes the mini-broker drop the socket; the reader then
        // tears everything down.
        let _ = connection.disconnect();
        assert!(
            sub.messages()
                .recv_timeout(Duration::from_millis(500))
                .is_err()
        );
        assert!(!connection.is_connected());
    }

    #[test]
    fn heartbeat_negotiation() {
        assert_eq!(negotiate_heartbeat(0, Some("1000,1000")), Duration::ZERO);
        assert_eq!(negotiate_heartbeat(5000, None), Duration::ZERO);
        assert_eq!(negotiate_heartbeat(5000, Some("0,0")), Duration::ZERO);
        assert_eq!(
            negotiate_heartbeat(5000, Some("1000,2000")),
            Duration::from_millis(5000)
        );
        assert_eq!(
            negotiate_heartbeat(1000, Some("1000,2000")),
            Duration::from_millis(2000)
        );
    }
}
